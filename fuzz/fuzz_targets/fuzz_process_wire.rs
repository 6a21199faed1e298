#![no_main]

use arbitrary::Arbitrary;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use libfuzzer_sys::fuzz_target;

use portal_execution::{BlockProcessor, ExecutionContext};
use portal_genesis::{create_genesis_state, GenesisConfig};
use portal_types::custodian::CustodianRecord;

#[derive(Arbitrary, Debug)]
struct WireInput {
    height: u16,
    instructions: Vec<(u16, i8, u8, Vec<u8>)>,
}

fuzz_target!(|data: WireInput| {
    let config = GenesisConfig::default();
    let Ok(mut state) = create_genesis_state(&config) else {
        return;
    };

    // One funded custodian so accepted instructions have something to move.
    let mut custodian = CustodianRecord::new("cust-1");
    let balance = custodian.collaterals.entry("native".to_string()).or_default();
    balance.total = 1_000_000_000_000;
    balance.free = 1_000_000_000_000;
    state.custodians.insert("cust-1".to_string(), custodian);

    let status = ["accepted", "rejected", "success", "expired", "liquidated", "refunded"];
    let wire: Vec<Vec<String>> = data
        .instructions
        .iter()
        .map(|(tag, shard, s, body)| {
            vec![
                tag.to_string(),
                shard.to_string(),
                status[*s as usize % status.len()].to_string(),
                STANDARD.encode(body),
            ]
        })
        .collect();

    let before = state.clone();
    let height = u64::from(data.height) + 1;
    let ctx = ExecutionContext::new(&config.params, height, height * 40);
    if BlockProcessor::process_wire(&mut state, &ctx, &wire).is_err() {
        // A refused block must not leak partial writes.
        assert_eq!(state, before);
    }
});
