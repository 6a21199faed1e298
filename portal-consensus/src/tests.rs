use super::*;
use portal_genesis::{create_genesis_state, GenesisConfig};
use portal_storage::{snapshot_diff, MemoryStore};
use portal_types::action::{ActionRequest, CustodianDepositAction};

struct Node {
    service: ConsensusService,
    state: Arc<RwLock<PortalState>>,
    store: Arc<MemoryStore>,
}

fn node() -> Node {
    let genesis = GenesisConfig::default();
    let state = create_genesis_state(&genesis).unwrap();
    let store = Arc::new(MemoryStore::new());
    store.commit_diff(0, &snapshot_diff(&state)).unwrap();

    let shared = Arc::new(RwLock::new(state));
    let (_, action_rx) = mpsc::channel(16);
    let (_, block_rx) = mpsc::channel(16);
    let mut service = ConsensusService::new(
        shared.clone(),
        store.clone(),
        Arc::new(genesis.params),
        Arc::new(VerifierRegistry::with_receipts()),
        action_rx,
        block_rx,
        ServiceConfig::default(),
    );
    service.recover_tip().unwrap();
    Node {
        service,
        state: shared,
        store,
    }
}

fn deposit(tx: &str, custodian: &str, amount: u64) -> PortalAction {
    PortalAction {
        tx_req_id: tx.to_string(),
        shard_id: 1,
        shard_height: 7,
        request: ActionRequest::CustodianDeposit(CustodianDepositAction {
            custodian: custodian.to_string(),
            collateral: "native".to_string(),
            amount,
            remote_addresses: BTreeMap::from([("BTC".to_string(), format!("btc-{custodian}"))]),
            proof: None,
        }),
    }
}

#[tokio::test]
async fn proposed_block_is_committed_and_persisted() {
    let mut a = node();
    a.service.pending.push(deposit("tx-1", "cust-1", 5_000));
    let block = a.service.propose().await.unwrap();

    assert_eq!(block.header.height, 1);
    assert_eq!(a.service.tip().height, 1);
    let state = a.state.read().await.clone();
    assert_eq!(state.custodians["cust-1"].free("native"), 5_000);
    assert_eq!(block.header.state_root, state.root_hash());
    assert_eq!(a.store.load_state(1).unwrap(), state);
    assert_eq!(a.store.load_block_by_height(1).unwrap(), Some(block));
}

#[tokio::test]
async fn peer_replays_to_the_same_root() {
    let mut a = node();
    let mut b = node();
    a.service.pending.push(deposit("tx-1", "cust-1", 5_000));
    a.service.pending.push(deposit("tx-2", "cust-2", 9_000));
    let first = a.service.propose().await.unwrap();
    let second = a.service.propose().await.unwrap();

    b.service.import_block(&first).await.unwrap();
    b.service.import_block(&second).await.unwrap();
    assert_eq!(b.service.tip(), a.service.tip());
    assert_eq!(*b.state.read().await, *a.state.read().await);

    assert!(b.service.import_block(&second).await.is_err());
}

#[tokio::test]
async fn tampered_block_is_refused() {
    let mut a = node();
    let mut b = node();
    a.service.pending.push(deposit("tx-1", "cust-1", 5_000));
    let mut block = a.service.propose().await.unwrap();
    block.header.state_root = [7u8; 32];

    let before = b.state.read().await.clone();
    let err = b.service.import_block(&block).await.unwrap_err();
    assert!(err.to_string().contains("state_root"));
    assert_eq!(*b.state.read().await, before);
    assert_eq!(b.service.tip().height, 0);
}

#[tokio::test]
async fn revert_restores_earlier_state() {
    let mut a = node();
    let genesis = a.state.read().await.clone();
    a.service.pending.push(deposit("tx-1", "cust-1", 5_000));
    a.service.propose().await.unwrap();

    a.service.revert_to(0).await.unwrap();
    assert_eq!(a.service.tip(), ChainTip::default());
    assert_eq!(*a.state.read().await, genesis);
    assert!(a.store.load_block_by_height(1).unwrap().is_none());
}
