//! Admission, sealing and commit lifecycle tests against a single node.

use crate::wait_until;
use grove_primitives::{BlockHash, Bytes};
use grove_transaction_pool::{
    test_utils::{join_group, random_nonce, TestNet, TestNode},
    PoolConfig, PoolError, TransactionOrigin, TxSubmitResult,
};
use std::{collections::HashSet, sync::Arc};

const WINDOW: u64 = 10;

fn config() -> PoolConfig {
    PoolConfig { chain_id: 7, group_id: 3, block_limit: WINDOW, ..Default::default() }
}

/// A single initialized node that is a consensus member of its group.
async fn lone_member_node() -> (Arc<TestNet>, TestNode) {
    let net = TestNet::new();
    let node = TestNode::new(&net, config());
    node.pool.init().await.unwrap();
    join_group(&[&node]);
    (net, node)
}

#[tokio::test]
async fn out_of_group_submission_is_rejected() {
    let net = TestNet::new();
    let node = TestNode::new(&net, config());
    node.pool.init().await.unwrap();
    // the ledger carries no consensus or observer members
    let tx = node.valid_transaction();
    let outcome = node.pool.submit(TransactionOrigin::Local, tx.encoded()).await;
    assert_eq!(outcome, Err(PoolError::RequestNotBelongToTheGroup));
    assert_eq!(node.pool.len(), 0);
}

#[tokio::test]
async fn valid_transaction_is_admitted_and_persisted() {
    let (_net, node) = lone_member_node().await;
    let tx = node.valid_transaction();
    let hash = node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap();
    assert_eq!(hash, tx.hash());
    assert_eq!(node.pool.len(), 1);
    assert_eq!(node.pool.pending_size(), 1);
    // pre-commit persistence and the sealer notification are asynchronous
    wait_until(|| node.ledger.contains_stored(&hash)).await;
    wait_until(|| node.sealer.unsealed_size() == 1).await;
}

#[tokio::test]
async fn admission_rejections() {
    let (_net, node) = lone_member_node().await;
    let latest = node.ledger.block_number_sync();

    // block limit one past the window edge
    let tx = node.transaction_with(random_nonce(), latest + WINDOW + 1);
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, tx.encoded()).await,
        Err(PoolError::BlockLimitCheckFail)
    );
    assert_eq!(node.pool.len(), 0);

    // stale block limit
    let tx = node.transaction_with(random_nonce(), latest);
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, tx.encoded()).await,
        Err(PoolError::BlockLimitCheckFail)
    );

    // exactly the window edge is accepted
    let tx = node.transaction_with(random_nonce(), latest + WINDOW);
    assert!(node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.is_ok());

    // nonce of a block committed within the window
    let nonce = node.ledger.nonces_of(latest - WINDOW + 1)[0];
    let tx = node.transaction_with(nonce, latest + WINDOW - 4);
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, tx.encoded()).await,
        Err(PoolError::NonceCheckFail)
    );

    // duplicate hash
    let tx = node.valid_transaction();
    let hash = node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap();
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, tx.encoded()).await,
        Err(PoolError::AlreadyInTxPool(hash))
    );

    // undecodable payload
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, Bytes::from_static(b"junk")).await,
        Err(PoolError::Malform)
    );

    assert_eq!(node.pool.len(), 2);
}

#[tokio::test]
async fn pool_capacity_is_enforced() {
    let net = TestNet::new();
    let mut cfg = config();
    cfg.pool_limit = 2;
    let node = TestNode::new(&net, cfg);
    node.pool.init().await.unwrap();
    join_group(&[&node]);
    let latest = node.ledger.block_number_sync();

    let mut admitted = Vec::new();
    for _ in 0..2 {
        let tx = node.valid_transaction();
        admitted.push(node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap());
    }
    let tx = node.valid_transaction();
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, tx.encoded()).await,
        Err(PoolError::TxPoolIsFull)
    );

    // a removal frees a slot again
    node.pool
        .notify_block_result(latest + 1, vec![TxSubmitResult::committed(admitted[0])])
        .await
        .unwrap();
    assert_eq!(node.pool.len(), 1);
    let tx = node.transaction_with(random_nonce(), latest + 1 + WINDOW - 4);
    assert!(node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.is_ok());
}

#[tokio::test]
async fn seal_mark_and_commit_lifecycle() {
    let (_net, node) = lone_member_node().await;
    let latest = node.ledger.block_number_sync();

    for _ in 0..20 {
        let tx = node.valid_transaction();
        node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap();
    }
    assert_eq!(node.pool.len(), 20);

    let first = node.pool.seal_transactions(10, None).await.unwrap();
    assert_eq!(first.txs.len(), 10);
    assert_eq!(node.pool.pending_size(), 10);
    wait_until(|| node.sealer.unsealed_size() == 10).await;

    // the second sealing round returns the remaining transactions only
    let rest = node.pool.seal_transactions(100_000, None).await.unwrap();
    assert_eq!(rest.txs.len(), 10);
    let first_set: HashSet<_> = first.txs.iter().copied().collect();
    assert!(rest.txs.iter().all(|hash| !first_set.contains(hash)));
    assert_eq!(node.pool.pending_size(), 0);

    // releasing the first batch makes it sealable again
    node.pool
        .mark_transactions(&first.txs, false, 0, BlockHash::ZERO)
        .await
        .unwrap();
    assert_eq!(node.pool.pending_size(), 10);
    wait_until(|| node.sealer.unsealed_size() == 10).await;

    // committing the first batch removes it and advances the nonce window
    let results = first.txs.iter().map(|hash| TxSubmitResult::committed(*hash)).collect();
    node.pool.notify_block_result(latest + WINDOW, results).await.unwrap();
    assert_eq!(node.pool.len(), 10);

    // every remaining block limit now lies behind the chain; selection
    // tombstones them and the asynchronous removal drains the pool
    let sealed = node.pool.seal_transactions(100_000, None).await.unwrap();
    assert!(sealed.is_empty());
    wait_until(|| node.pool.len() == 0).await;
    wait_until(|| node.sealer.unsealed_size() == 0).await;
}

#[tokio::test]
async fn sealing_respects_avoid_set() {
    let (_net, node) = lone_member_node().await;
    let mut hashes = Vec::new();
    for _ in 0..3 {
        let tx = node.valid_transaction();
        hashes.push(node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap());
    }
    let mut avoid = HashSet::new();
    avoid.insert(hashes[1]);
    let sealed = node.pool.seal_transactions(100_000, Some(avoid)).await.unwrap();
    assert_eq!(sealed.txs, vec![hashes[0], hashes[2]]);
}

#[tokio::test]
async fn committed_nonce_rejects_resubmission() {
    let (_net, node) = lone_member_node().await;
    let latest = node.ledger.block_number_sync();
    let tx = node.valid_transaction();
    let hash = node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap();

    node.pool
        .notify_block_result(latest + 1, vec![TxSubmitResult::committed(hash)])
        .await
        .unwrap();
    assert_eq!(node.pool.len(), 0);

    // same nonce, different payload: still a replay within the window
    let replay = node.transaction_with(tx.nonce(), latest + WINDOW);
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, replay.encoded()).await,
        Err(PoolError::NonceCheckFail)
    );
}

#[tokio::test]
async fn commit_receipt_is_delivered_once() {
    let (_net, node) = lone_member_node().await;
    let latest = node.ledger.block_number_sync();
    let tx = node.valid_transaction();
    let (hash, receipt) = node.pool.submit_and_watch(tx.encoded()).await.unwrap();

    node.pool
        .notify_block_result(latest + 1, vec![TxSubmitResult::committed(hash)])
        .await
        .unwrap();
    let result = receipt.await.unwrap();
    assert!(result.is_committed());
    assert_eq!(result.hash, hash);
    assert_eq!(result.block_number, Some(latest + 1));
    assert_eq!(result.nonce, Some(tx.nonce()));
}

#[tokio::test]
async fn expired_transactions_report_block_limit_failure() {
    let (_net, node) = lone_member_node().await;
    let latest = node.ledger.block_number_sync();
    let tx = node.transaction_with(random_nonce(), latest + 2);
    let (_hash, receipt) = node.pool.submit_and_watch(tx.encoded()).await.unwrap();

    // two empty blocks commit; the entry's block limit is now stale
    node.pool.notify_block_result(latest + 2, Vec::new()).await.unwrap();
    let sealed = node.pool.seal_transactions(10, None).await.unwrap();
    assert!(sealed.is_empty());

    let result = receipt.await.unwrap();
    assert_eq!(result.error, Some(PoolError::BlockLimitCheckFail));
    wait_until(|| node.pool.len() == 0).await;
}

#[tokio::test]
async fn fill_block_returns_present_txs_in_request_order() {
    let (_net, node) = lone_member_node().await;
    let mut hashes = Vec::new();
    for _ in 0..3 {
        let tx = node.valid_transaction();
        hashes.push(node.pool.submit(TransactionOrigin::Local, tx.encoded()).await.unwrap());
    }
    let request = vec![hashes[2], hashes[0], hashes[1]];
    let filled = node.pool.fill_block(&request).await.unwrap();
    let filled_hashes: Vec<_> = filled.iter().map(|tx| tx.hash()).collect();
    assert_eq!(filled_hashes, request);
}

#[tokio::test]
async fn stopped_pool_rejects_work() {
    let (_net, node) = lone_member_node().await;
    node.pool.stop();
    let tx = node.valid_transaction();
    assert_eq!(
        node.pool.submit(TransactionOrigin::Local, tx.encoded()).await,
        Err(PoolError::ShuttingDown)
    );
    assert_eq!(
        node.pool.seal_transactions(1, None).await,
        Err(PoolError::ShuttingDown)
    );
}
