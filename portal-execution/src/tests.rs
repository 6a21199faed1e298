use super::*;
use portal_types::action::*;
use portal_types::custodian::{CollateralBalance, CustodianRecord};
use portal_types::error::PortalError;
use portal_types::instruction::*;
use portal_types::params::ExternalChain;
use portal_types::request::MatchingRedeemCustodian;
use portal_types::state::{FinalExchangeRates, PortalState, RequestKind};
use proptest::prelude::*;
use std::collections::BTreeMap;

const FEEDER: &str = "feeder-1";
const BTC_UNIT: u64 = 1_000_000_000;

struct Harness {
    state: PortalState,
    params: PortalParams,
    verifiers: VerifierRegistry,
    height: u64,
    seq: u64,
}

impl Harness {
    fn new() -> Self {
        let mut params = PortalParams::default();
        params.feeders = vec![FEEDER.to_string()];
        let mut rates = FinalExchangeRates::default();
        for (asset, price) in [
            ("BTC", 20_000_000),
            ("BNB", 300_000),
            ("native", 1_000_000),
            ("ETH", 2_000_000_000),
            ("USDT", 1_000_000),
        ] {
            rates.rates.insert(asset.to_string(), price);
        }
        let state = PortalState {
            final_exchange_rates: Some(rates),
            ..Default::default()
        };
        Self {
            state,
            params,
            verifiers: VerifierRegistry::with_receipts(),
            height: 0,
            seq: 0,
        }
    }

    fn action(&mut self, shard_id: u8, request: ActionRequest) -> PortalAction {
        self.seq += 1;
        PortalAction {
            tx_req_id: format!("tx-{}", self.seq),
            shard_id,
            shard_height: self.height,
            request,
        }
    }

    fn produce(&mut self, requests: Vec<ActionRequest>, epoch: Option<&EpochReward>) -> (Vec<PortalAction>, BlockOutput) {
        self.height += 1;
        let actions: Vec<PortalAction> = requests.into_iter().map(|r| self.action(0, r)).collect();
        let ctx = ExecutionContext::new(&self.params, self.height, self.height * 40);
        let out = BlockProducer::new(&self.verifiers)
            .produce(&self.state, &ctx, &actions, epoch)
            .unwrap();
        (actions, out)
    }

    fn block_with(&mut self, requests: Vec<ActionRequest>, epoch: Option<&EpochReward>) -> Vec<Instruction> {
        let (_, out) = self.produce(requests, epoch);
        assert!(out.failures.is_empty(), "unexpected failures: {:?}", out.failures);
        let ctx = ExecutionContext::new(&self.params, self.height, self.height * 40);
        BlockProcessor::process(&mut self.state, &ctx, &out.instructions).unwrap();
        assert!(self.state.unconserved_custodians().is_empty());
        out.instructions
    }

    fn block(&mut self, requests: Vec<ActionRequest>) -> Vec<Instruction> {
        self.block_with(requests, None)
    }

    /// Next block will be at `height`.
    fn jump_to(&mut self, height: u64) {
        self.height = height - 1;
    }

    fn custodian(&self, address: &str) -> &CustodianRecord {
        &self.state.custodians[address]
    }
}

fn deposit(custodian: &str, collateral: &str, amount: u64, addresses: &[(&str, &str)]) -> ActionRequest {
    ActionRequest::CustodianDeposit(CustodianDepositAction {
        custodian: custodian.to_string(),
        collateral: collateral.to_string(),
        amount,
        remote_addresses: addresses
            .iter()
            .map(|(t, a)| (t.to_string(), a.to_string()))
            .collect(),
        proof: None,
    })
}

fn porting(id: &str, amount: u64, fee: u64) -> ActionRequest {
    ActionRequest::PortingRequest(PortingRequestAction {
        porting_id: id.to_string(),
        token_id: "BTC".to_string(),
        porter: "user-1".to_string(),
        amount,
        porting_fee: fee,
    })
}

fn receipt(chain: ExternalChain, tx_id: &str, transfers: &[(&str, u64)]) -> Vec<u8> {
    TransferReceipt {
        chain,
        tx_id: tx_id.to_string(),
        transfers: transfers
            .iter()
            .map(|(r, a)| ExpectedTransfer {
                receiver: r.to_string(),
                amount: *a,
            })
            .collect(),
    }
    .encode()
    .unwrap()
}

fn porting_proof(id: &str, amount: u64, proof: Vec<u8>) -> ActionRequest {
    ActionRequest::PortingProof(PortingProofAction {
        porting_id: id.to_string(),
        token_id: "BTC".to_string(),
        porter: "user-1".to_string(),
        amount,
        proof,
    })
}

fn redeem(id: &str, amount: u64) -> ActionRequest {
    ActionRequest::RedeemRequest(RedeemRequestAction {
        redeem_id: id.to_string(),
        token_id: "BTC".to_string(),
        redeemer: "user-1".to_string(),
        redeemer_remote_address: "btc-user-1".to_string(),
        amount,
        redeem_fee: 10_000_000,
    })
}

fn matching(id: &str, custodian: &str) -> ActionRequest {
    ActionRequest::RedeemMatching(RedeemMatchingAction {
        redeem_id: id.to_string(),
        custodian: custodian.to_string(),
        amount: None,
    })
}

fn reason_of(inst: &Instruction) -> Option<PortalError> {
    let json = serde_json::to_value(&inst.body).unwrap();
    let content = json.as_object().unwrap().values().next().unwrap().clone();
    content
        .get("reason")
        .cloned()
        .and_then(|r| serde_json::from_value(r).ok())
}

fn of_kind(insts: &[Instruction], kind: InstructionKind) -> Vec<&Instruction> {
    insts.iter().filter(|i| i.kind() == kind).collect()
}

/// cust-1 with 100 native units backing 1 BTC of minted public tokens.
fn ported_custodian(h: &mut Harness) {
    h.block(vec![deposit("cust-1", "native", 100_000_000_000, &[("BTC", "btc-cust-1")])]);
    h.block(vec![porting("port-1", BTC_UNIT, 2_000_000)]);
    let proof = receipt(ExternalChain::Btc, "btctx-1", &[("btc-cust-1", BTC_UNIT)]);
    let insts = h.block(vec![porting_proof("port-1", BTC_UNIT, proof)]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);
    assert_eq!(h.custodian("cust-1").holding("BTC"), BTC_UNIT);
}

// ── Ledger ────────────────────────────────────────────────────

#[test]
fn second_deposit_keeps_remote_addresses() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 5000, &[("BNB", "bnb-1"), ("BTC", "btc-1")])]);
    let c = h.custodian("cust-1");
    assert_eq!(c.balance("native"), CollateralBalance { total: 5000, free: 5000 });

    h.block(vec![deposit("cust-1", "native", 2000, &[("BNB", "bnb-2"), ("BTC", "btc-2")])]);
    let c = h.custodian("cust-1");
    assert_eq!(c.balance("native"), CollateralBalance { total: 7000, free: 7000 });
    assert_eq!(c.remote_addresses["BNB"], "bnb-1");
    assert_eq!(c.remote_addresses["BTC"], "btc-1");
}

#[test]
fn withdraw_beyond_free_is_rejected() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 5000, &[("BTC", "btc-1")])]);
    let insts = h.block(vec![ActionRequest::CustodianWithdraw(CustodianWithdrawAction {
        custodian: "cust-1".into(),
        collateral: "native".into(),
        amount: 6000,
    })]);
    assert!(matches!(
        reason_of(&insts[0]),
        Some(PortalError::InsufficientFreeCollateral { free: 5000, .. })
    ));
    assert_eq!(h.custodian("cust-1").free("native"), 5000);
    let tx = match &insts[0].body {
        PortalInstruction::CustodianWithdraw(c) => c.tx_req_id.clone(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(
        h.state.status(RequestKind::Withdraw, &tx).unwrap().status,
        InstructionStatus::Rejected
    );
}

#[test]
fn token_collateral_needs_vault_proof() {
    let mut h = Harness::new();
    let insts = h.block(vec![deposit("cust-1", "ETH", 5, &[("BTC", "btc-1")])]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::InvalidProof { .. })));
    assert!(!h.state.custodians.contains_key("cust-1"));

    let vault = h.params.collateral_vault_address.clone();
    let mut with_proof = deposit("cust-1", "ETH", 5, &[("BTC", "btc-1")]);
    if let ActionRequest::CustodianDeposit(a) = &mut with_proof {
        a.proof = Some(receipt(ExternalChain::Eth, "0xdeposit", &[(&vault, 5)]));
    }
    let insts = h.block(vec![with_proof.clone()]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);
    assert_eq!(h.custodian("cust-1").balance("ETH").total, 5);

    let insts = h.block(vec![with_proof]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::DuplicateProof { .. })));
}

// ── Porting ───────────────────────────────────────────────────

#[test]
fn porting_locks_two_hundred_percent() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 100_000_000_000, &[("BTC", "btc-cust-1")])]);
    let insts = h.block(vec![porting("port-1", BTC_UNIT, 2_000_000)]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);

    let waiting = &h.state.waiting_portings["port-1"];
    assert_eq!(waiting.custodians.len(), 1);
    assert_eq!(waiting.custodians[0].locked_collaterals["native"], 40_000_000_000);
    assert_eq!(waiting.matched_amount(), BTC_UNIT);
    let c = h.custodian("cust-1");
    assert_eq!(c.locked("BTC", "native"), 40_000_000_000);
    assert_eq!(c.free("native"), 60_000_000_000);
}

#[test]
fn porting_prefers_smaller_custodians() {
    let mut h = Harness::new();
    h.block(vec![
        deposit("cust-big", "native", 100_000_000_000, &[("BTC", "btc-big")]),
        deposit("cust-small", "native", 20_000_000_000, &[("BTC", "btc-small")]),
    ]);
    h.block(vec![porting("port-1", BTC_UNIT, 2_000_000)]);
    let waiting = &h.state.waiting_portings["port-1"];
    assert_eq!(waiting.custodians[0].custodian, "cust-small");
    assert_eq!(waiting.custodians[0].amount, BTC_UNIT / 2);
    assert_eq!(waiting.custodians[1].custodian, "cust-big");
    assert_eq!(waiting.matched_amount(), BTC_UNIT);
    assert_eq!(h.custodian("cust-small").free("native"), 0);
}

#[test]
fn porting_rejections_carry_details() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 10_000_000_000, &[("BTC", "btc-cust-1")])]);
    let insts = h.block(vec![
        porting("port-low-fee", BTC_UNIT / 10, 1),
        porting("port-too-big", BTC_UNIT, 2_000_000),
    ]);
    assert!(matches!(
        reason_of(&insts[0]),
        Some(PortalError::FeeTooLow { expected: 200_000, got: 1, .. })
    ));
    assert!(matches!(
        reason_of(&insts[1]),
        Some(PortalError::InsufficientCollateral { requested, available, .. })
            if requested == BTC_UNIT && available == BTC_UNIT / 4
    ));
    assert!(h.state.waiting_portings.is_empty());

    let insts = h.block(vec![porting("port-low-fee", BTC_UNIT / 10, 200_000)]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::DuplicateId { .. })));
}

#[test]
fn expired_porting_releases_collateral() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 100_000_000_000, &[("BTC", "btc-cust-1")])]);
    h.block(vec![porting("port-1", BTC_UNIT, 2_000_000)]);
    let created = h.state.waiting_portings["port-1"].beacon_height;

    h.jump_to(created + h.params.timeout_waiting_porting_request);
    let insts = h.block(vec![]);
    assert_eq!(of_kind(&insts, InstructionKind::ExpiredWaitingPorting).len(), 1);
    assert!(h.state.waiting_portings.is_empty());
    assert_eq!(h.custodian("cust-1").free("native"), 100_000_000_000);
    assert_eq!(
        h.state.status(RequestKind::Porting, "port-1").unwrap().status,
        InstructionStatus::Expired
    );
}

#[test]
fn topped_up_porting_unlocks_everything_on_expiry() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 100_000_000_000, &[("BTC", "btc-cust-1")])]);
    h.block(vec![porting("port-1", BTC_UNIT, 2_000_000)]);
    let insts = h.block(vec![ActionRequest::PortingTopup(PortingTopupAction {
        porting_id: "port-1".into(),
        custodian: "cust-1".into(),
        collateral: "native".into(),
        amount: 5_000_000_000,
    })]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);
    assert_eq!(
        h.state.waiting_portings["port-1"].custodians[0].locked_collaterals["native"],
        45_000_000_000
    );
    assert_eq!(h.custodian("cust-1").locked("BTC", "native"), 45_000_000_000);

    let created = h.state.waiting_portings["port-1"].beacon_height;
    h.jump_to(created + h.params.timeout_waiting_porting_request);
    h.block(vec![]);
    let c = h.custodian("cust-1");
    assert_eq!(c.free("native"), 100_000_000_000);
    assert!(c.locked_collaterals.is_empty());
}

#[test]
fn replayed_porting_proof_is_duplicate() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    let proof = receipt(ExternalChain::Btc, "btctx-1", &[("btc-cust-1", BTC_UNIT)]);
    let insts = h.block(vec![porting_proof("port-1", BTC_UNIT, proof)]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::DuplicateProof { .. })));
    assert_eq!(h.custodian("cust-1").holding("BTC"), BTC_UNIT);
}

#[test]
fn reencoded_receipt_cannot_mint_twice() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 100_000_000_000, &[("BTC", "btc-cust-1")])]);
    h.block(vec![porting("port-1", BTC_UNIT, 2_000_000), porting("port-2", BTC_UNIT, 2_000_000)]);
    let proof = receipt(ExternalChain::Btc, "btctx-1", &[("btc-cust-1", BTC_UNIT)]);
    let mut padded = proof.clone();
    padded.push(b' ');

    let insts = h.block(vec![porting_proof("port-1", BTC_UNIT, proof)]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);
    let insts = h.block(vec![porting_proof("port-2", BTC_UNIT, padded)]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::DuplicateProof { .. })));
    assert_eq!(h.custodian("cust-1").holding("BTC"), BTC_UNIT);
    assert!(h.state.waiting_portings.contains_key("port-2"));

    // Same transaction, different spelling of its id.
    let renamed = receipt(ExternalChain::Btc, " BTCTX-1 ", &[("btc-cust-1", BTC_UNIT)]);
    let insts = h.block(vec![porting_proof("port-2", BTC_UNIT, renamed)]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::DuplicateProof { .. })));
    assert_eq!(h.custodian("cust-1").holding("BTC"), BTC_UNIT);
}

#[test]
fn underpaying_proof_is_rejected() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 100_000_000_000, &[("BTC", "btc-cust-1")])]);
    h.block(vec![porting("port-1", BTC_UNIT, 2_000_000)]);
    let proof = receipt(ExternalChain::Btc, "btctx-1", &[("btc-cust-1", BTC_UNIT - 1)]);
    let insts = h.block(vec![porting_proof("port-1", BTC_UNIT, proof)]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::InvalidProof { .. })));
    assert!(h.state.waiting_portings.contains_key("port-1"));
}

// ── Redeem ────────────────────────────────────────────────────

#[test]
fn redeem_round_trip_unlocks_collateral() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    h.block(vec![redeem("red-1", BTC_UNIT)]);
    h.block(vec![matching("red-1", "cust-1")]);
    assert!(h.state.matched_redeems.contains_key("red-1"));
    assert_eq!(h.custodian("cust-1").holding("BTC"), 0);

    let proof = receipt(ExternalChain::Btc, "btctx-2", &[("btc-user-1", BTC_UNIT)]);
    let insts = h.block(vec![ActionRequest::RedeemProof(RedeemProofAction {
        redeem_id: "red-1".into(),
        token_id: "BTC".into(),
        custodian: "cust-1".into(),
        proof,
    })]);
    match &insts[0].body {
        PortalInstruction::RedeemProof(c) => assert_eq!(c.unlocked["native"], 40_000_000_000),
        other => panic!("unexpected {other:?}"),
    }
    let c = h.custodian("cust-1");
    assert_eq!(c.free("native"), 100_000_000_000);
    assert!(c.locked_collaterals.is_empty());
    assert!(h.state.matched_redeems.is_empty());
    assert_eq!(
        h.state.status(RequestKind::Redeem, "red-1").unwrap().status,
        InstructionStatus::Success
    );
}

fn redeem_proof(id: &str, custodian: &str, proof: Vec<u8>) -> ActionRequest {
    ActionRequest::RedeemProof(RedeemProofAction {
        redeem_id: id.into(),
        token_id: "BTC".into(),
        custodian: custodian.into(),
        proof,
    })
}

#[test]
fn one_payout_settles_one_redeem() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    h.block(vec![redeem("red-1", BTC_UNIT / 2), redeem("red-2", BTC_UNIT / 2)]);
    h.block(vec![matching("red-1", "cust-1"), matching("red-2", "cust-1")]);
    let payout = receipt(ExternalChain::Btc, "btctx-2", &[("btc-user-1", BTC_UNIT / 2)]);

    let insts = h.block(vec![redeem_proof("red-1", "cust-1", payout.clone())]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);
    let locked = h.custodian("cust-1").locked("BTC", "native");

    let insts = h.block(vec![
        redeem_proof("red-2", "cust-1", payout.clone()),
        redeem_proof("red-1", "cust-1", payout),
    ]);
    for inst in &insts {
        assert!(matches!(reason_of(inst), Some(PortalError::DuplicateProof { .. })));
    }
    assert!(h.state.matched_redeems.contains_key("red-2"));
    assert_eq!(h.custodian("cust-1").locked("BTC", "native"), locked);
}

#[test]
fn redeem_fee_below_minimum_is_rejected() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    // One basis point of 20 native units.
    let insts = h.block(vec![ActionRequest::RedeemRequest(RedeemRequestAction {
        redeem_id: "red-1".into(),
        token_id: "BTC".into(),
        redeemer: "user-1".into(),
        redeemer_remote_address: "btc-user-1".into(),
        amount: BTC_UNIT,
        redeem_fee: 1_999_999,
    })]);
    assert_eq!(
        reason_of(&insts[0]),
        Some(PortalError::FeeTooLow {
            id: "red-1".into(),
            expected: 2_000_000,
            got: 1_999_999
        })
    );
    assert!(h.state.waiting_redeems.is_empty());
    assert_eq!(h.custodian("cust-1").holding("BTC"), BTC_UNIT);
}

#[test]
fn redeem_beyond_holdings_is_rejected() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    let insts = h.block(vec![redeem("red-1", BTC_UNIT + 1)]);
    assert!(matches!(
        reason_of(&insts[0]),
        Some(PortalError::InsufficientPublicTokens { available, .. }) if available == BTC_UNIT
    ));
}

#[test]
fn matched_holdings_cannot_be_promised_twice() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    h.block(vec![redeem("red-1", BTC_UNIT / 2), redeem("red-2", BTC_UNIT / 2)]);
    h.block(vec![
        matching("red-1", "cust-1"),
        matching("red-2", "cust-1"),
        matching("red-1", "cust-1"),
    ]);
    assert_eq!(h.state.matched_redeems.len(), 2);
    assert_eq!(h.custodian("cust-1").holding("BTC"), 0);

    let insts = h.block(vec![redeem("red-3", 1)]);
    assert!(matches!(
        reason_of(&insts[0]),
        Some(PortalError::InsufficientPublicTokens { available: 0, .. })
    ));
    let insts = h.block(vec![matching("red-3", "cust-1")]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::RequestNotFound { .. })));
}

fn holding_custodian(address: &str, native: u64, locked: u64, holding: u64) -> CustodianRecord {
    let mut c = CustodianRecord::new(address);
    c.collaterals.insert(
        "native".into(),
        CollateralBalance {
            total: native,
            free: native - locked,
        },
    );
    c.locked_collaterals
        .entry("BTC".into())
        .or_default()
        .insert("native".into(), locked);
    c.holding_public_tokens.insert("BTC".into(), holding);
    c.remote_addresses.insert("BTC".into(), format!("btc-{address}"));
    c
}

#[test]
fn timed_out_redeem_picks_smallest_holdings_first() {
    let mut h = Harness::new();
    for (address, holding) in [("cust-a", 300_000_000u64), ("cust-b", BTC_UNIT), ("cust-c", 500_000_000)] {
        let locked = holding * 40;
        h.state
            .custodians
            .insert(address.into(), holding_custodian(address, locked * 2, locked, holding));
    }
    h.block(vec![redeem("red-1", 1_200_000_000)]);
    let created = h.state.waiting_redeems["red-1"].beacon_height;

    h.jump_to(created + h.params.timeout_waiting_redeem_request);
    let insts = h.block(vec![]);
    let picked = match &of_kind(&insts, InstructionKind::PickMoreCustodians)[0].body {
        PortalInstruction::PickMoreCustodians(c) => c.custodians.clone(),
        other => panic!("unexpected {other:?}"),
    };
    let order: Vec<(&str, u64)> = picked.iter().map(|m| (m.custodian.as_str(), m.amount)).collect();
    assert_eq!(order, vec![("cust-a", 300_000_000), ("cust-c", 500_000_000), ("cust-b", 400_000_000)]);
    let req = &h.state.matched_redeems["red-1"];
    assert_eq!(req.matched_amount(), req.amount);
}

#[test]
fn uncoverable_timed_out_redeem_is_refunded() {
    let mut h = Harness::new();
    for address in ["cust-a", "cust-b"] {
        h.state
            .custodians
            .insert(address.into(), holding_custodian(address, 80_000_000_000, 40_000_000_000, BTC_UNIT));
    }
    h.block(vec![redeem("red-1", 2 * BTC_UNIT), redeem("red-2", BTC_UNIT)]);
    // cust-a covers half of red-1, cust-b's holding goes to red-2.
    h.block(vec![matching("red-1", "cust-a"), matching("red-2", "cust-b")]);
    assert_eq!(h.state.waiting_redeems["red-1"].matched_amount(), BTC_UNIT);
    assert_eq!(h.custodian("cust-a").holding("BTC"), 0);

    let created = h.state.waiting_redeems["red-1"].beacon_height;
    h.jump_to(created + h.params.timeout_waiting_redeem_request);
    let insts = h.block(vec![]);
    let refunds = of_kind(&insts, InstructionKind::PickMoreCustodians);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].status, InstructionStatus::Refunded);
    match &refunds[0].body {
        PortalInstruction::PickMoreCustodians(c) => {
            let released: Vec<(&str, u64)> = c.custodians.iter().map(|m| (m.custodian.as_str(), m.amount)).collect();
            assert_eq!(released, vec![("cust-a", BTC_UNIT)]);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(h.state.waiting_redeems.is_empty());
    assert_eq!(h.custodian("cust-a").holding("BTC"), BTC_UNIT);
    assert_eq!(h.custodian("cust-b").holding("BTC"), 0);
    assert!(h.state.matched_redeems.contains_key("red-2"));
    assert_eq!(
        h.state.status(RequestKind::Redeem, "red-1").unwrap().status,
        InstructionStatus::Refunded
    );

    // Nothing left to retry.
    let insts = h.block(vec![]);
    assert!(of_kind(&insts, InstructionKind::PickMoreCustodians).is_empty());
}

#[test]
fn refund_must_name_the_matched_custodians() {
    let mut h = Harness::new();
    h.state
        .custodians
        .insert("cust-a".into(), holding_custodian("cust-a", 80_000_000_000, 40_000_000_000, BTC_UNIT));
    h.block(vec![redeem("red-1", BTC_UNIT), redeem("red-2", BTC_UNIT)]);
    h.block(vec![matching("red-1", "cust-a")]);
    let before = h.state.clone();
    let forged = Instruction::new(
        None,
        InstructionStatus::Refunded,
        PortalInstruction::PickMoreCustodians(PickMoreCustodiansContent {
            redeem_id: "red-2".into(),
            token_id: "BTC".into(),
            custodians: vec![MatchingRedeemCustodian {
                custodian: "cust-a".into(),
                remote_address: "btc-cust-a".into(),
                amount: BTC_UNIT,
            }],
        }),
    );
    let ctx = ExecutionContext::new(&h.params, h.height + 1, (h.height + 1) * 40);
    let err = BlockProcessor::process(&mut h.state, &ctx, &[forged]).unwrap_err();
    assert!(matches!(err, PortalError::Inconsistent(_)));
    assert_eq!(h.state, before);
}

// ── Liquidation ───────────────────────────────────────────────

#[test]
fn run_away_custodian_pays_penalty_into_pool() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    h.block(vec![redeem("red-1", BTC_UNIT)]);
    h.block(vec![matching("red-1", "cust-1")]);
    let created = h.state.matched_redeems["red-1"].beacon_height;
    let before = h.custodian("cust-1").clone();

    h.jump_to(created + h.params.timeout_custodian_return_pub_token);
    let insts = h.block(vec![]);
    let content = match &of_kind(&insts, InstructionKind::LiquidateRunAway)[0].body {
        PortalInstruction::LiquidateRunAway(c) => c.clone(),
        other => panic!("unexpected {other:?}"),
    };
    // 120% of 1 BTC at 20,000,000 is 24 native units.
    let penalty = content.liquidated["native"];
    assert_eq!(penalty, 24_000_000_000);
    assert_eq!(content.remain_unlocked["native"], 16_000_000_000);

    let after = h.custodian("cust-1");
    assert_eq!(after.locked("BTC", "native"), 0);
    assert_eq!(after.holding("BTC"), 0);
    assert_eq!(after.balance("native").total, before.balance("native").total - penalty);
    assert_eq!(after.free("native"), before.free("native") + 16_000_000_000);

    let pool = &h.state.liquidation_pool["BTC"];
    assert_eq!(pool.collaterals["native"], penalty);
    assert_eq!(pool.public_token_amount, BTC_UNIT);
    assert!(h.state.matched_redeems.is_empty());
    assert_eq!(
        h.state.status(RequestKind::Redeem, "red-1").unwrap().status,
        InstructionStatus::Liquidated
    );

    // Half the pool's tokens buy half its collateral.
    let insts = h.block(vec![ActionRequest::PoolRedeem(PoolRedeemAction {
        redeemer: "user-2".into(),
        token_id: "BTC".into(),
        amount: BTC_UNIT / 2,
    })]);
    match &insts[0].body {
        PortalInstruction::PoolRedeem(c) => assert_eq!(c.payout["native"], penalty / 2),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.state.liquidation_pool["BTC"].public_token_amount, BTC_UNIT / 2);
}

#[test]
fn pool_redeem_rejections() {
    let mut h = Harness::new();
    let insts = h.block(vec![ActionRequest::PoolRedeem(PoolRedeemAction {
        redeemer: "user-2".into(),
        token_id: "BTC".into(),
        amount: 1,
    })]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::LiquidationPoolEmpty { .. })));
}

fn submit_price(asset: &str, price: u64) -> ActionRequest {
    ActionRequest::ExchangeRates(ExchangeRatesAction {
        feeder: FEEDER.to_string(),
        rates: BTreeMap::from([(asset.to_string(), price)]),
    })
}

#[test]
fn rate_collapse_restores_ratio_to_tp130() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    // 40 native units against 1 BTC at 36 gives a 111% ratio.
    h.block(vec![submit_price("BTC", 36_000_000)]);
    assert_eq!(h.state.final_exchange_rates.as_ref().unwrap().price("BTC"), Some(36_000_000));

    let insts = h.block(vec![]);
    let content = match &of_kind(&insts, InstructionKind::LiquidateByRates)[0].body {
        PortalInstruction::LiquidateByRates(c) => c.clone(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(content.ratio_before, 111);

    let c = h.custodian("cust-1");
    let locked_value = c.locked("BTC", "native") as u128 * 1_000_000;
    let holding_value = c.holding("BTC") as u128 * 36_000_000;
    let ratio_bp = locked_value * 10_000 / holding_value;
    assert!(ratio_bp >= 13_000, "ratio {ratio_bp}");
    assert!(ratio_bp < 13_100, "ratio {ratio_bp}");

    let pool = &h.state.liquidation_pool["BTC"];
    assert_eq!(pool.public_token_amount, content.liquidated_public_tokens);
    assert_eq!(pool.collaterals["native"], content.liquidated["native"]);

    // Healthy now: nothing more happens.
    let insts = h.block(vec![]);
    assert!(of_kind(&insts, InstructionKind::LiquidateByRates).is_empty());
}

#[test]
fn custodian_topup_heads_off_rate_liquidation() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    // 50 native units against 1 BTC at 36 is 138%.
    let insts = h.block(vec![
        ActionRequest::CustodianTopup(CustodianTopupAction {
            custodian: "cust-1".into(),
            token_id: "BTC".into(),
            collateral: "native".into(),
            amount: 10_000_000_000,
        }),
        submit_price("BTC", 36_000_000),
    ]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);

    let insts = h.block(vec![]);
    assert!(of_kind(&insts, InstructionKind::LiquidateByRates).is_empty());
    let c = h.custodian("cust-1");
    assert_eq!(c.locked("BTC", "native"), 50_000_000_000);
    assert_eq!(c.holding("BTC"), BTC_UNIT);
    assert!(!h.state.liquidation_pool.contains_key("BTC"));
}

#[test]
fn deep_collapse_liquidates_everything() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    // 40 / 40 = 100%, under the 105% transfer rate.
    h.block(vec![submit_price("BTC", 40_000_000)]);
    h.block(vec![]);
    let c = h.custodian("cust-1");
    assert_eq!(c.holding("BTC"), 0);
    assert_eq!(c.locked("BTC", "native"), 0);
    assert_eq!(h.state.liquidation_pool["BTC"].collaterals["native"], 40_000_000_000);
}

#[test]
fn feeder_prices_settle_on_median() {
    let mut h = Harness::new();
    h.params.feeders = vec!["f-1".into(), "f-2".into(), "f-3".into()];
    let submit = |feeder: &str, price: u64| {
        ActionRequest::ExchangeRates(ExchangeRatesAction {
            feeder: feeder.to_string(),
            rates: BTreeMap::from([("BNB".to_string(), price)]),
        })
    };
    let insts = h.block(vec![
        submit("f-1", 310_000),
        submit("f-2", 290_000),
        submit("f-3", 1),
        submit("mallory", 5),
    ]);
    assert!(matches!(reason_of(&insts[3]), Some(PortalError::UnauthorizedFeeder { .. })));
    let rates = h.state.final_exchange_rates.as_ref().unwrap();
    assert_eq!(rates.price("BNB"), Some(290_000));
    assert_eq!(rates.price("BTC"), Some(20_000_000));
    assert!(h.state.pending_exchange_rates.is_empty());
}

// ── Rewards ───────────────────────────────────────────────────

#[test]
fn epoch_reward_split_by_locked_share() {
    let mut h = Harness::new();
    let shares = [("cust-a", 3u64), ("cust-b", 5), ("cust-c", 11)];
    for (address, locked) in shares {
        h.state.custodians.insert(address.into(), CustodianRecord::new(address));
        h.state
            .locked_collateral_for_rewards
            .per_custodian
            .insert(address.into(), locked);
        h.state.locked_collateral_for_rewards.total += locked;
    }
    let total: u64 = shares.iter().map(|(_, l)| l).sum();
    let reward = EpochReward {
        total: BTreeMap::from([("native".to_string(), 1_000_003)]),
        performance: BTreeMap::new(),
    };

    h.jump_to(h.params.epoch_length);
    h.block_with(vec![], Some(&reward));

    let mut paid = 0;
    for (address, locked) in shares {
        let got = h.custodian(address).reward_amount["native"];
        assert_eq!(got, 1_000_003 * locked / total);
        paid += got;
    }
    assert!(paid <= 1_000_003);
    assert_eq!(h.state.locked_collateral_for_rewards.total, 0);

    let withdraw = ActionRequest::WithdrawReward(WithdrawRewardAction {
        custodian: "cust-a".into(),
        asset: "native".into(),
    });
    let insts = h.block(vec![withdraw.clone()]);
    assert_eq!(insts[0].status, InstructionStatus::Accepted);
    assert!(h.custodian("cust-a").reward_amount.is_empty());
    let insts = h.block(vec![withdraw]);
    assert!(matches!(reason_of(&insts[0]), Some(PortalError::NoReward { .. })));
}

#[test]
fn porting_fee_goes_to_custodians() {
    let mut h = Harness::new();
    h.block(vec![
        deposit("cust-big", "native", 100_000_000_000, &[("BTC", "btc-big")]),
        deposit("cust-small", "native", 20_000_000_000, &[("BTC", "btc-small")]),
    ]);
    let insts = h.block(vec![porting("port-1", BTC_UNIT, 3_000_001)]);
    assert_eq!(of_kind(&insts, InstructionKind::CustodianReward).len(), 1);
    assert_eq!(h.custodian("cust-small").reward_amount["native"], 1_500_000);
    assert_eq!(h.custodian("cust-big").reward_amount["native"], 1_500_001);
}

#[test]
fn locked_value_accumulates_each_block() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    let before = h.state.locked_collateral_for_rewards.per_custodian["cust-1"];
    h.block(vec![]);
    // 40 native units at $1.
    assert_eq!(
        h.state.locked_collateral_for_rewards.per_custodian["cust-1"],
        before + 40_000_000
    );
}

// ── Determinism & replay ──────────────────────────────────────

#[test]
fn replay_is_deterministic_across_wire() {
    let mut h = Harness::new();
    ported_custodian(&mut h);
    let requests = vec![
        redeem("red-1", BTC_UNIT / 4),
        deposit("cust-2", "native", 50_000_000_000, &[("BTC", "btc-2")]),
        porting("port-2", BTC_UNIT / 2, 2_000_000),
        submit_price("BTC", 21_000_000),
        deposit("cust-3", "native", 1, &[("BTC", "btc-3")]),
    ];
    let (_, out) = h.produce(requests, None);
    let ctx = ExecutionContext::new(&h.params, h.height, h.height * 40);

    let mut direct = h.state.clone();
    BlockProcessor::process(&mut direct, &ctx, &out.instructions).unwrap();

    let wire: Vec<Vec<String>> = out
        .instructions
        .iter()
        .map(|i| i.to_wire().unwrap().to_vec())
        .collect();
    let mut replayed = h.state.clone();
    BlockProcessor::process_wire(&mut replayed, &ctx, &wire).unwrap();

    assert_eq!(direct.root_hash(), replayed.root_hash());
    assert_eq!(direct, replayed);
    // Deposits sort ahead of portings regardless of arrival.
    assert_eq!(out.instructions[0].kind(), InstructionKind::CustodianDeposit);
}

#[test]
fn inconsistent_instruction_aborts_block() {
    let mut h = Harness::new();
    h.block(vec![deposit("cust-1", "native", 5000, &[("BTC", "btc-1")])]);
    let forged = Instruction::new(
        Some(0),
        InstructionStatus::Accepted,
        PortalInstruction::CustodianWithdraw(WithdrawContent {
            custodian: "cust-1".into(),
            collateral: "native".into(),
            amount: 9000,
            tx_req_id: "tx-forged".into(),
            reason: None,
        }),
    );
    let before = h.state.clone();
    let ctx = ExecutionContext::new(&h.params, h.height + 1, 0);
    let err = BlockProcessor::process(&mut h.state, &ctx, &[forged]).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(h.state, before);
}

#[test]
fn status_and_reason_must_agree() {
    let h = Harness::new();
    let inst = Instruction::new(
        Some(0),
        InstructionStatus::Rejected,
        PortalInstruction::CustodianWithdraw(WithdrawContent {
            custodian: "cust-1".into(),
            collateral: "native".into(),
            amount: 1,
            tx_req_id: "tx-1".into(),
            reason: None,
        }),
    );
    let ctx = ExecutionContext::new(&h.params, 1, 0);
    let mut state = h.state.clone();
    assert!(matches!(
        BlockProcessor::process(&mut state, &ctx, &[inst]),
        Err(PortalError::Inconsistent(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn matching_conserves_collateral(
        deposits in prop::collection::vec(1_000_000_000u64..60_000_000_000, 1..4),
        portings in prop::collection::vec(1_000_000u64..1_500_000_000, 1..5),
        withdraw in 0u64..70_000_000_000,
    ) {
        let mut h = Harness::new();
        let requests = deposits
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                let address = format!("btc-{i}");
                deposit(&format!("cust-{i}"), "native", *amount, &[("BTC", address.as_str())])
            })
            .collect();
        h.block(requests);
        let requests = portings
            .iter()
            .enumerate()
            .map(|(i, amount)| porting(&format!("port-{i}"), *amount, 1_000_000_000))
            .collect();
        h.block(requests);
        h.block(vec![ActionRequest::CustodianWithdraw(CustodianWithdrawAction {
            custodian: "cust-0".into(),
            collateral: "native".into(),
            amount: withdraw,
        })]);

        prop_assert!(h.state.unconserved_custodians().is_empty());
        for p in h.state.waiting_portings.values() {
            prop_assert_eq!(p.matched_amount(), p.amount);
        }
        for (address, c) in &h.state.custodians {
            let promised: u64 = h
                .state
                .waiting_portings
                .values()
                .map(|p| p.locked_by(address, "native"))
                .sum();
            prop_assert_eq!(promised, c.locked("BTC", "native"));
        }
    }
}
