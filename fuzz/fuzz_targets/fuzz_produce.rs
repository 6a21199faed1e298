#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use portal_execution::{BlockProcessor, BlockProducer, ExecutionContext, VerifierRegistry};
use portal_genesis::{create_genesis_state, GenesisConfig};
use portal_types::action::{
    ActionRequest, CustodianDepositAction, CustodianWithdrawAction, ExchangeRatesAction, PoolRedeemAction,
    PortalAction, PortingRequestAction, RedeemMatchingAction, RedeemRequestAction,
};
use std::collections::BTreeMap;

#[derive(Arbitrary, Debug)]
enum FuzzAction {
    Deposit { who: u8, amount: u64 },
    Withdraw { who: u8, amount: u64 },
    Porting { id: u8, amount: u64, fee: u64 },
    Redeem { id: u8, amount: u64, fee: u64 },
    Matching { id: u8, who: u8, amount: Option<u64> },
    Rates { btc: u64 },
    PoolRedeem { amount: u64 },
}

const TOKENS: [&str; 2] = ["BTC", "BNB"];

fn request(action: &FuzzAction) -> ActionRequest {
    match action {
        FuzzAction::Deposit { who, amount } => ActionRequest::CustodianDeposit(CustodianDepositAction {
            custodian: format!("cust-{}", who % 4),
            collateral: "native".to_string(),
            amount: *amount,
            remote_addresses: TOKENS
                .iter()
                .map(|t| (t.to_string(), format!("{}-cust-{}", t, who % 4)))
                .collect(),
            proof: None,
        }),
        FuzzAction::Withdraw { who, amount } => ActionRequest::CustodianWithdraw(CustodianWithdrawAction {
            custodian: format!("cust-{}", who % 4),
            collateral: "native".to_string(),
            amount: *amount,
        }),
        FuzzAction::Porting { id, amount, fee } => ActionRequest::PortingRequest(PortingRequestAction {
            porting_id: format!("port-{id}"),
            token_id: TOKENS[*id as usize % 2].to_string(),
            porter: "porter".to_string(),
            amount: *amount,
            porting_fee: *fee,
        }),
        FuzzAction::Redeem { id, amount, fee } => ActionRequest::RedeemRequest(RedeemRequestAction {
            redeem_id: format!("redeem-{id}"),
            token_id: TOKENS[*id as usize % 2].to_string(),
            redeemer: "redeemer".to_string(),
            redeemer_remote_address: "remote-redeemer".to_string(),
            amount: *amount,
            redeem_fee: *fee,
        }),
        FuzzAction::Matching { id, who, amount } => ActionRequest::RedeemMatching(RedeemMatchingAction {
            redeem_id: format!("redeem-{id}"),
            custodian: format!("cust-{}", who % 4),
            amount: *amount,
        }),
        FuzzAction::Rates { btc } => ActionRequest::ExchangeRates(ExchangeRatesAction {
            feeder: "feeder-1".to_string(),
            rates: BTreeMap::from([("BTC".to_string(), *btc)]),
        }),
        FuzzAction::PoolRedeem { amount } => ActionRequest::PoolRedeem(PoolRedeemAction {
            redeemer: "redeemer".to_string(),
            token_id: "BTC".to_string(),
            amount: *amount,
        }),
    }
}

fuzz_target!(|blocks: Vec<Vec<FuzzAction>>| {
    let mut config = GenesisConfig::default();
    config.params.feeders = vec!["feeder-1".to_string()];
    let Ok(mut state) = create_genesis_state(&config) else {
        return;
    };
    let verifiers = VerifierRegistry::with_receipts();

    let mut seq = 0u64;
    for (i, block) in blocks.iter().take(32).enumerate() {
        let height = i as u64 + 1;
        let actions: Vec<PortalAction> = block
            .iter()
            .map(|a| {
                seq += 1;
                PortalAction {
                    tx_req_id: format!("tx-{seq}"),
                    shard_id: (seq % 4) as u8,
                    shard_height: height,
                    request: request(a),
                }
            })
            .collect();

        let ctx = ExecutionContext::new(&config.params, height, height * 40);
        let Ok(output) = BlockProducer::new(&verifiers).produce(&state, &ctx, &actions, None) else {
            return;
        };
        // Whatever the producer emits must replay on the same parent.
        BlockProcessor::process(&mut state, &ctx, &output.instructions).expect("produced block must replay");
        assert!(state.unconserved_custodians().is_empty());
    }
});
