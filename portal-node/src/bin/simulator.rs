use anyhow::{bail, Result};
use portal_consensus::{build_block_from_parent, verify_block};
use portal_execution::{ExecutionContext, ExpectedTransfer, TransferReceipt, VerifierRegistry};
use portal_genesis::{create_genesis_state, GenesisConfig};
use portal_types::action::{
    ActionRequest, CustodianDepositAction, ExchangeRatesAction, PortalAction, PortingProofAction,
    PortingRequestAction, RedeemProofAction, RedeemRequestAction,
};
use portal_types::params::{ExternalChain, PortalParams};
use portal_types::state::PortalState;
use std::collections::BTreeMap;
use std::time::Instant;

const NATIVE_UNIT: u64 = 1_000_000_000;
const FEEDER: &str = "feeder-1";

/// Drives a producer and an independent replica block by block.
struct Simulation {
    params: PortalParams,
    verifiers: VerifierRegistry,
    producer_state: PortalState,
    replica_state: PortalState,
    height: u64,
    prev_hash: [u8; 32],
    next_tx: u64,
    instructions: usize,
    failures: usize,
}

impl Simulation {
    fn new(genesis: &GenesisConfig) -> Result<Self> {
        let state = create_genesis_state(genesis)?;
        Ok(Self {
            params: genesis.params.clone(),
            verifiers: VerifierRegistry::with_receipts(),
            producer_state: state.clone(),
            replica_state: state,
            height: 0,
            prev_hash: [0u8; 32],
            next_tx: 0,
            instructions: 0,
            failures: 0,
        })
    }

    fn block(&mut self, requests: Vec<ActionRequest>) -> Result<()> {
        self.height += 1;
        let actions: Vec<PortalAction> = requests
            .into_iter()
            .map(|request| {
                self.next_tx += 1;
                PortalAction {
                    tx_req_id: format!("tx-{}", self.next_tx),
                    shard_id: (self.next_tx % 8) as u8,
                    shard_height: self.height,
                    request,
                }
            })
            .collect();

        let ctx = ExecutionContext::new(&self.params, self.height, 1_678_886_400 + self.height * 40);
        let built = build_block_from_parent(
            &self.producer_state,
            &ctx,
            &self.verifiers,
            &actions,
            self.prev_hash,
            None,
        )?;
        let replayed = verify_block(&self.replica_state, &self.params, &built.block)?;

        self.producer_state.apply_diff(built.diff);
        self.replica_state.apply_diff(replayed);
        if self.producer_state.root_hash() != self.replica_state.root_hash() {
            bail!("Replica diverged at height {}", self.height);
        }
        let broken = self.producer_state.unconserved_custodians();
        if !broken.is_empty() {
            bail!("Collateral not conserved at height {}: {:?}", self.height, broken);
        }

        self.prev_hash = built.block.hash();
        self.instructions += built.block.instructions.len();
        self.failures += built.failures.len();
        Ok(())
    }

    fn idle(&mut self, blocks: u64) -> Result<()> {
        for _ in 0..blocks {
            self.block(Vec::new())?;
        }
        Ok(())
    }
}

fn receipt(chain: ExternalChain, tx_id: String, transfers: Vec<ExpectedTransfer>) -> Result<Vec<u8>> {
    Ok(TransferReceipt {
        chain,
        tx_id,
        transfers,
    }
    .encode()?)
}

fn main() -> Result<()> {
    println!("--- Portal Bridge Simulator ---");

    let mut genesis = GenesisConfig::default();
    genesis.params.feeders = vec![FEEDER.to_string()];
    genesis.params.timeout_custodian_return_pub_token = 60;
    let mut sim = Simulation::new(&genesis)?;
    let start_time = Instant::now();

    let num_custodians = 20u64;
    let num_portings = 50u64;
    let porting_amount = 100_000_000; // 0.1 BTC
    let fee = NATIVE_UNIT;

    // 1. Custodians register collateral.
    sim.block(
        (0..num_custodians)
            .map(|i| {
                ActionRequest::CustodianDeposit(CustodianDepositAction {
                    custodian: format!("cust-{i:02}"),
                    collateral: "native".to_string(),
                    amount: (10_000 + i * 2_000) * NATIVE_UNIT,
                    remote_addresses: BTreeMap::from([("BTC".to_string(), format!("btc-cust-{i:02}"))]),
                    proof: None,
                })
            })
            .collect(),
    )?;

    // 2. Users open portings and prove their payments.
    sim.block(
        (0..num_portings)
            .map(|i| {
                ActionRequest::PortingRequest(PortingRequestAction {
                    porting_id: format!("port-{i:03}"),
                    token_id: "BTC".to_string(),
                    porter: format!("user-{}", i % 10),
                    amount: porting_amount,
                    porting_fee: fee,
                })
            })
            .collect(),
    )?;
    let proofs = sim
        .producer_state
        .waiting_portings
        .values()
        .map(|p| -> Result<ActionRequest> {
            let transfers = p
                .custodians
                .iter()
                .map(|d| ExpectedTransfer {
                    receiver: d.remote_address.clone(),
                    amount: d.amount,
                })
                .collect();
            Ok(ActionRequest::PortingProof(PortingProofAction {
                porting_id: p.porting_id.clone(),
                token_id: p.token_id.clone(),
                porter: p.porter.clone(),
                amount: p.amount,
                proof: receipt(ExternalChain::Btc, format!("btc-{}", p.porting_id), transfers)?,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    sim.block(proofs)?;
    let minted: u64 = sim
        .producer_state
        .custodians
        .values()
        .map(|c| c.holding("BTC"))
        .sum();
    println!("Minted {} BTC base units across {} custodians", minted, num_custodians);

    // 3. Redeems nobody picks up get matched after the waiting timeout.
    sim.block(
        (0..20u64)
            .map(|i| {
                ActionRequest::RedeemRequest(RedeemRequestAction {
                    redeem_id: format!("redeem-{i:03}"),
                    token_id: "BTC".to_string(),
                    redeemer: format!("user-{}", i % 10),
                    redeemer_remote_address: format!("btc-user-{}", i % 10),
                    amount: porting_amount / 2,
                    redeem_fee: fee,
                })
            })
            .collect(),
    )?;
    sim.idle(sim.params.timeout_waiting_redeem_request)?;
    println!(
        "Forced matching: {} waiting, {} matched",
        sim.producer_state.waiting_redeems.len(),
        sim.producer_state.matched_redeems.len()
    );

    // 4. Custodians pay out half the redeems; the rest run away.
    let payouts = sim
        .producer_state
        .matched_redeems
        .values()
        .step_by(2)
        .flat_map(|r| {
            r.custodians.iter().map(|m| -> Result<ActionRequest> {
                Ok(ActionRequest::RedeemProof(RedeemProofAction {
                    redeem_id: r.redeem_id.clone(),
                    token_id: r.token_id.clone(),
                    custodian: m.custodian.clone(),
                    proof: receipt(
                        ExternalChain::Btc,
                        format!("btc-{}-{}", r.redeem_id, m.custodian),
                        vec![ExpectedTransfer {
                            receiver: r.redeemer_remote_address.clone(),
                            amount: m.amount,
                        }],
                    )?,
                }))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    sim.block(payouts)?;
    sim.idle(sim.params.timeout_custodian_return_pub_token)?;

    // 5. BTC rallies 80% and under-collateralised custodians are liquidated.
    sim.block(vec![ActionRequest::ExchangeRates(ExchangeRatesAction {
        feeder: FEEDER.to_string(),
        rates: BTreeMap::from([("BTC".to_string(), 36_000_000_000)]),
    })])?;
    sim.idle(2)?;

    let elapsed = start_time.elapsed();
    println!("--- Simulation Complete ---");
    println!(
        "Built and replayed {} blocks ({} instructions) in {:.2?}",
        sim.height, sim.instructions, elapsed
    );
    println!(
        "Throughput: {:.2} blocks/s",
        sim.height as f64 / elapsed.as_secs_f64()
    );
    println!("Dropped actions: {}", sim.failures);
    for (token, pool) in &sim.producer_state.liquidation_pool {
        println!(
            "Liquidation pool {}: {} public tokens against {:?}",
            token, pool.public_token_amount, pool.collaterals
        );
    }
    println!("Final state root: {}", hex::encode(sim.producer_state.root_hash()));
    Ok(())
}
