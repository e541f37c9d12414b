//! Peer synchronization tests on a loopback network.

use crate::wait_until;
use grove_primitives::{Block, TxHash};
use grove_transaction_pool::{
    test_utils::{join_group, random_nonce, TestNet, TestNode},
    PoolConfig, PoolError, TransactionOrigin,
};

const WINDOW: u64 = 10;

fn config() -> PoolConfig {
    PoolConfig { chain_id: 7, group_id: 3, block_limit: WINDOW, ..Default::default() }
}

#[tokio::test]
async fn verify_block_recovers_missing_txs_from_peer() {
    let net = TestNet::new();
    let a = TestNode::new(&net, config());
    let b = TestNode::new(&net, config());
    a.pool.init().await.unwrap();
    b.pool.init().await.unwrap();
    join_group(&[&a, &b]);

    let mut hashes = Vec::new();
    for _ in 0..10 {
        let tx = a.valid_transaction();
        hashes.push(a.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap());
    }
    assert_eq!(a.pool.len(), 10);
    assert_eq!(b.pool.len(), 0);

    // node B receives a proposal referencing A's transactions
    let proposal = Block::new_proposal(a.ledger.block_number_sync() + 1, hashes.clone());
    b.pool.verify_block(a.node_id, proposal.encoded()).await.unwrap();

    assert_eq!(b.pool.len(), 10);
    for hash in &hashes {
        assert!(b.pool.contains(hash));
    }
    // recovered proposal transactions enter the pool sealed
    assert_eq!(b.pool.pending_size(), 0);
}

#[tokio::test]
async fn verify_block_without_transactions_succeeds() {
    let net = TestNet::new();
    let a = TestNode::new(&net, config());
    let b = TestNode::new(&net, config());
    a.pool.init().await.unwrap();
    b.pool.init().await.unwrap();
    join_group(&[&a, &b]);

    let proposal = Block::new_proposal(a.ledger.block_number_sync() + 1, Vec::new());
    b.pool.verify_block(a.node_id, proposal.encoded()).await.unwrap();
}

#[tokio::test]
async fn verify_block_hits_resident_transactions() {
    let net = TestNet::new();
    let node = TestNode::new(&net, config());
    node.pool.init().await.unwrap();
    join_group(&[&node]);

    let mut hashes = Vec::new();
    for _ in 0..5 {
        let tx = node.valid_transaction();
        hashes.push(node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap());
    }
    let proposal = Block::new_proposal(node.ledger.block_number_sync() + 1, hashes);
    node.pool.verify_block(node.node_id, proposal.encoded()).await.unwrap();
}

#[tokio::test]
async fn verify_block_combines_peer_and_ledger_recovery() {
    let net = TestNet::new();
    let a = TestNode::new(&net, config());
    let b = TestNode::new(&net, config());
    a.pool.init().await.unwrap();
    b.pool.init().await.unwrap();
    join_group(&[&a, &b]);

    let mut hashes = Vec::new();
    for _ in 0..5 {
        let tx = a.valid_transaction();
        hashes.push(a.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap());
    }
    // the rest of the proposal is only available from B's own ledger
    for _ in 0..5 {
        let tx = b.transaction_with(random_nonce(), b.ledger.block_number_sync() + 5);
        b.ledger.add_transaction(tx.clone());
        hashes.push(tx.hash());
    }

    // the peer can only answer half the request; its partial response is
    // imported and the remainder comes from the ledger fallback
    let proposal = Block::new_proposal(a.ledger.block_number_sync() + 1, hashes.clone());
    b.pool.verify_block(a.node_id, proposal.encoded()).await.unwrap();
    assert_eq!(b.pool.len(), 10);
    for hash in &hashes {
        assert!(b.pool.contains(hash));
    }
}

#[tokio::test]
async fn verify_block_reports_unresolvable_transactions() {
    let net = TestNet::new();
    let a = TestNode::new(&net, config());
    let b = TestNode::new(&net, config());
    a.pool.init().await.unwrap();
    b.pool.init().await.unwrap();
    join_group(&[&a, &b]);

    let missing: Vec<TxHash> = (1..=3u8).map(TxHash::repeat_byte).collect();
    let proposal = Block::new_proposal(a.ledger.block_number_sync() + 1, missing);
    let err = b.pool.verify_block(a.node_id, proposal.encoded()).await.unwrap_err();
    assert!(matches!(err, PoolError::TransactionsMissing(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_transactions_propagate_to_peers() {
    let net = TestNet::new();
    let a = TestNode::new(&net, config());
    let b = TestNode::new(&net, config());
    a.pool.init().await.unwrap();
    b.pool.init().await.unwrap();
    join_group(&[&a, &b]);
    a.pool.start();
    b.pool.start();

    let tx = a.valid_transaction();
    let hash = a.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap();

    // A announces the hash, B requests the transaction and imports it
    wait_until(|| b.pool.contains(&hash)).await;
    assert_eq!(b.pool.pending_size(), 1);
    // the announcer is recorded, suppressing an echo back to A
    assert!(b.pool.get(&hash).unwrap().is_known_by(&a.node_id));

    a.pool.stop();
    b.pool.stop();
}

#[tokio::test]
async fn fill_block_falls_back_to_the_ledger() {
    let net = TestNet::new();
    let node = TestNode::new(&net, config());
    node.pool.init().await.unwrap();
    join_group(&[&node]);

    // committed in the past, not resident in the pool
    let tx = node.transaction_with(random_nonce(), node.ledger.block_number_sync() + 5);
    node.ledger.add_transaction(tx.clone());

    let filled = node.pool.fill_block(&[tx.hash()]).await.unwrap();
    assert_eq!(filled.len(), 1);
    assert_eq!(filled[0].hash(), tx.hash());
    // recovered through the proposal import path, hence resident and sealed
    assert!(node.pool.contains(&tx.hash()));
    assert_eq!(node.pool.pending_size(), 0);
}

#[tokio::test]
async fn fill_block_reports_unknown_transactions() {
    let net = TestNet::new();
    let node = TestNode::new(&net, config());
    node.pool.init().await.unwrap();
    join_group(&[&node]);

    let err = node.pool.fill_block(&[TxHash::repeat_byte(0x77)]).await.unwrap_err();
    assert!(matches!(err, PoolError::TransactionsMissing(_)));
}
