//! Restart behavior with the file-backed checkpoint store.

mod common;

use common::*;
use listener::{
    Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, ScannerError, TickOutcome,
};
use tempfile::TempDir;

#[tokio::test]
async fn restart_scans_exactly_from_checkpoint_to_ceiling() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    {
        let mut store = FileCheckpointStore::open(&path).unwrap();
        store.save(Checkpoint::new(1000)).unwrap();
    }

    let chain = MockChain::new(1300);
    chain.add_log(transfer_log(1000, 0, 5, 137));
    chain.add_log(transfer_log(1001, 0, 5, 137));
    chain.add_log(transfer_log(1290, 0, 5, 137));
    chain.add_log(transfer_log(1291, 0, 5, 137));
    let relay = MockRelay::new();
    let store = FileCheckpointStore::open(&path).unwrap();
    let mut scanner = scanner(test_config(), &chain, &relay, Box::new(store));

    let outcome = scanner.tick().await.unwrap();
    assert!(matches!(
        outcome,
        TickOutcome::Advanced {
            from: 1001,
            to: 1290,
            ..
        }
    ));

    let ranges = chain.requested();
    assert_eq!(ranges.first().map(|r| r.0), Some(1001));
    assert_eq!(ranges.last().map(|r| r.1), Some(1290));
    for pair in ranges.windows(2) {
        assert_eq!(pair[1].0, pair[0].1 + 1, "gap or overlap in {:?}", ranges);
    }
    assert_eq!(
        relay.effective_positions(),
        vec![(1001, 0), (1290, 0)]
    );
    drop(scanner);

    let reopened = FileCheckpointStore::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap(), Some(Checkpoint::new(1290)));
}

#[tokio::test]
async fn interrupted_chunk_is_redelivered_with_same_tokens_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    {
        let mut store = FileCheckpointStore::open(&path).unwrap();
        store.save(Checkpoint::new(100)).unwrap();
    }
    let chain = MockChain::new(160);
    for block in [110, 120, 130] {
        chain.add_log(transfer_log(block, 0, 5, 137));
    }
    let relay = MockRelay::new();

    let mut first = scanner(
        test_config(),
        &chain,
        &relay,
        Box::new(FileCheckpointStore::open(&path).unwrap()),
    );
    relay.shutdown_after(1, first.shutdown_handle());
    assert_eq!(
        first.tick().await.unwrap(),
        TickOutcome::Interrupted {
            checkpoint: Some(100)
        }
    );
    drop(first);

    let mut second = scanner(
        test_config(),
        &chain,
        &relay,
        Box::new(FileCheckpointStore::open(&path).unwrap()),
    );
    second.tick().await.unwrap();

    assert_eq!(relay.attempts_for(&token(110, 0)), 2);
    assert_eq!(
        relay.effective_tokens(),
        vec![token(110, 0), token(120, 0), token(130, 0)]
    );
    drop(second);
    let reopened = FileCheckpointStore::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap(), Some(Checkpoint::new(150)));
}

#[tokio::test]
async fn padded_log_ranges_never_relay_checkpointed_blocks() {
    let chain = MockChain::new(250);
    chain.set_overlap(5);
    chain.add_log(transfer_log(98, 0, 5, 137));
    chain.add_log(transfer_log(100, 1, 5, 137));
    chain.add_log(transfer_log(101, 0, 5, 137));
    let relay = MockRelay::new();
    let store = MemoryStore::at(100);
    let mut scanner = scanner(test_config(), &chain, &relay, Box::new(store.clone()));

    let outcome = scanner.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Advanced { from: 101, delivered: 1, .. }));
    assert!(relay.attempts_for(&token(98, 0)) == 0 && relay.attempts_for(&token(100, 1)) == 0);
    assert_eq!(relay.effective_tokens(), vec![token(101, 0)]);
    assert_eq!(store.current(), Some(240));
}

#[tokio::test]
async fn corrupt_checkpoint_is_fatal_at_init() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(&path, "not a block number").unwrap();

    let chain = MockChain::new(500);
    let relay = MockRelay::new();
    let mut scanner = scanner(
        test_config(),
        &chain,
        &relay,
        Box::new(FileCheckpointStore::open(&path).unwrap()),
    );

    let err = scanner.tick().await.unwrap_err();
    assert!(matches!(
        err,
        ScannerError::Checkpoint(CheckpointError::Corrupt { .. })
    ));
    assert!(!err.is_transient());
    assert_eq!(err.exit_code(), 1);
    assert!(chain.requested().is_empty());
    // The file is left for the operator, not reseeded.
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "not a block number");
}

#[tokio::test]
async fn second_listener_on_same_checkpoint_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    let _owner = FileCheckpointStore::open(&path).unwrap();

    let err = ScannerError::from(FileCheckpointStore::open(&path).unwrap_err());
    assert!(matches!(err, ScannerError::Checkpoint(CheckpointError::Locked(_))));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn legacy_decimal_checkpoint_is_honored() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("last_processed_block.dat");
    std::fs::write(&path, "700\n").unwrap();

    let chain = MockChain::new(760);
    let relay = MockRelay::new();
    let mut scanner = scanner(
        test_config(),
        &chain,
        &relay,
        Box::new(FileCheckpointStore::open(&path).unwrap()),
    );
    scanner.tick().await.unwrap();
    assert_eq!(chain.requested(), vec![(701, 750)]);
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        r#"{"last_confirmed_block":750}"#
    );
}
