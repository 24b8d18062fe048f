// tests/ledger_store.rs
use sidechain_node::error::{StoreError, ValidationError};
use sidechain_node::ledger::{
    import_block, AssetSource, Block, ImportOutcome, LedgerStore, Transaction, Validator,
};
use sidechain_node::storage::try_open_db;
use std::sync::{Arc, Barrier};

const GENESIS: [u8; 32] = [0x6e; 32];
const ASSET: [u8; 32] = [0xa1; 32];
const ALICE: [u8; 32] = [0x01; 32];
const BOB: [u8; 32] = [0x02; 32];
const CAROL: [u8; 32] = [0x03; 32];

fn transfer(counter: u16, from: [u8; 32], to: [u8; 32]) -> Transaction {
    Transaction {
        counter,
        asset: ASSET,
        from,
        to,
        signature: [0; 64],
    }
}

fn open(dir: &std::path::Path) -> LedgerStore {
    let store = LedgerStore::open(try_open_db(dir).unwrap(), GENESIS).unwrap();
    store.issue_asset(ASSET, ALICE).unwrap();
    store
}

#[test]
fn test_concurrent_commits_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(dir.path()));
    let validator = Validator::default();
    let genesis = store.tip();

    let to_bob = Block::new([0x11; 32], genesis.hash, vec![transfer(0, ALICE, BOB)]);
    let to_carol = Block::new([0x12; 32], genesis.hash, vec![transfer(0, ALICE, CAROL)]);
    let deltas = [
        validator
            .validate(&to_bob, genesis.height, &genesis.hash, store.as_ref())
            .unwrap(),
        validator
            .validate(&to_carol, genesis.height, &genesis.hash, store.as_ref())
            .unwrap(),
    ];

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [to_bob.clone(), to_carol.clone()]
        .into_iter()
        .zip(deltas)
        .map(|(block, delta)| {
            let store = store.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                store.commit_block(&block, &delta)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(StoreError::StaleTip { .. }))));

    let tip = store.tip();
    assert_eq!(tip.height, 1);
    let owner = store.get_asset(&ASSET).unwrap().unwrap().owner;
    if tip.hash == to_bob.hash() {
        assert_eq!(owner, BOB);
    } else {
        assert_eq!(tip.hash, to_carol.hash());
        assert_eq!(owner, CAROL);
    }
}

#[test]
fn test_rejected_block_leaves_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let validator = Validator::default();
    let genesis = store.tip();

    // second transfer reuses the counter the first one consumed
    let block = Block::new(
        [0x11; 32],
        genesis.hash,
        vec![transfer(0, ALICE, BOB), transfer(0, BOB, CAROL)],
    );
    match import_block(&store, &validator, &block).unwrap() {
        ImportOutcome::Rejected(ValidationError::CounterMismatch { expected, got, .. }) => {
            assert_eq!((expected, got), (1, 0));
        }
        other => panic!("expected counter mismatch, got {:?}", other),
    }
    assert_eq!(store.tip(), genesis);
    let record = store.get_asset(&ASSET).unwrap().unwrap();
    assert_eq!((record.owner, record.counter), (ALICE, 0));
    assert!(store.get_block(1).unwrap().is_none());
}

#[test]
fn test_chain_of_imports_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let validator = Validator::default();
    let tip_hash = {
        let store = open(dir.path());
        let mut prev = store.tip().hash;
        let hops = [(ALICE, BOB), (BOB, CAROL), (CAROL, ALICE)];
        for (i, (from, to)) in hops.iter().enumerate() {
            let block = Block::new([i as u8; 32], prev, vec![transfer(i as u16, *from, *to)]);
            match import_block(&store, &validator, &block).unwrap() {
                ImportOutcome::Accepted(tip) => {
                    assert_eq!(tip.height, i as u64 + 1);
                    prev = tip.hash;
                }
                ImportOutcome::Rejected(e) => panic!("block {} rejected: {}", i + 1, e),
            }
        }
        prev
    };

    let store = LedgerStore::open(try_open_db(dir.path()).unwrap(), GENESIS).unwrap();
    let tip = store.tip();
    assert_eq!(tip.height, 3);
    assert_eq!(tip.hash, tip_hash);
    assert_eq!(tip.anchor_ref, [2; 32]);
    let record = store.get_asset(&ASSET).unwrap().unwrap();
    assert_eq!((record.owner, record.counter), (ALICE, 3));
    let stored = store.get_block_by_hash(&tip_hash).unwrap().unwrap();
    assert_eq!(stored.height, 3);
}
