//! Deployment orchestrator behaviour against an in-process chain.

mod common;

use std::{sync::Arc, time::Duration};

use slipway_deploy::{
    DeployError, DeploymentKey, DeploymentStatus, FailureKind, SlipwayError, cancel,
    config::GasReporterSettings, exit_code, gas::GasReport, rpc::RpcError,
};

use common::{DEPLOYER, GAS_USED, MockChain, TestContext, token, transport_error};

#[tokio::test]
async fn test_deploy_confirms_and_records_address() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    let ctx = test.sepolia();
    let artifact = token();

    let record = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &artifact)
        .await
        .expect("deployment");

    assert_eq!(record.status, DeploymentStatus::Confirmed);
    assert_eq!(record.deployer, DEPLOYER);
    assert_eq!(record.nonce, 0);
    assert_eq!(record.address, Some(DEPLOYER.create(0)));
    assert!(record.confirmations >= ctx.confirmations());
    assert!(record.block_number.is_some());
    assert_eq!(chain.broadcasts(), 1);

    let key = DeploymentKey::new("sepolia", "Token", artifact.bytecode_hash);
    let stored = test.store.get(&key).unwrap().expect("stored record");
    assert_eq!(stored.deployment, record);
}

#[tokio::test]
async fn test_redeploy_returns_existing_record_without_broadcast() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    let first = test.deployed(&chain, &token()).await;

    let ctx = test.sepolia();
    let second = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .expect("redeployment");

    assert_eq!(second, first);
    assert_eq!(chain.broadcasts(), 1);
    assert_eq!(chain.send_attempts(), 1);
}

#[tokio::test]
async fn test_concurrent_deploys_of_one_key_broadcast_once() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    let ctx = test.sepolia();
    let credential = test.credential(&ctx);
    let orchestrator = test.orchestrator(&chain);
    let artifact = token();

    let (a, b) = tokio::join!(
        orchestrator.deploy(&ctx, &credential, &artifact),
        orchestrator.deploy(&ctx, &credential, &artifact),
    );

    assert_eq!(a.unwrap().address, b.unwrap().address);
    assert_eq!(chain.broadcasts(), 1);
}

#[tokio::test]
async fn test_cancelled_confirmation_leaves_pending_record_that_resumes() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.pause_mining();
    let ctx = test.sepolia();
    let credential = test.credential(&ctx);
    let artifact = token();

    let (handle, cancellation) = cancel::channel();
    let orchestrator = test.orchestrator(&chain).with_cancellation(cancellation);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();
    });

    let err = orchestrator
        .deploy(&ctx, &credential, &artifact)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, DeployError::Cancelled { .. }));
    assert_eq!(err.exit_code(), exit_code::CANCELLED);

    let key = DeploymentKey::new("sepolia", "Token", artifact.bytecode_hash);
    let pending = test.store.get(&key).unwrap().expect("pending record");
    assert_eq!(pending.deployment.status, DeploymentStatus::Pending);

    // A later run picks the transaction up instead of sending a new one.
    chain.resume_mining();
    let resumed = test
        .orchestrator(&chain)
        .deploy(&ctx, &credential, &artifact)
        .await
        .expect("resumed deployment");

    assert_eq!(resumed.status, DeploymentStatus::Confirmed);
    assert_eq!(resumed.tx_hash, pending.deployment.tx_hash);
    assert_eq!(chain.broadcasts(), 1);
    assert_eq!(chain.send_attempts(), 1);
}

#[tokio::test]
async fn test_cancelled_before_broadcast_records_nothing() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    let ctx = test.sepolia();
    let artifact = token();

    let (handle, cancellation) = cancel::channel();
    handle.cancel();

    let err = test
        .orchestrator(&chain)
        .with_cancellation(cancellation)
        .deploy(&ctx, &test.credential(&ctx), &artifact)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Cancelled { .. }));
    assert_eq!(chain.send_attempts(), 0);
    assert!(test.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_revert_is_recorded_as_failed() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.revert_all();
    let ctx = test.sepolia();

    let record = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .expect("record");

    assert_eq!(record.status, DeploymentStatus::Failed);
    let cause = record.cause.expect("failure cause");
    assert_eq!(cause.kind, FailureKind::Reverted);
    assert_eq!(cause.kind.exit_code(), exit_code::ON_CHAIN_FAILURE);
}

#[tokio::test]
async fn test_failed_deployment_is_retried_with_a_new_transaction() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.revert_all();
    let ctx = test.sepolia();
    let credential = test.credential(&ctx);

    let failed = test
        .orchestrator(&chain)
        .deploy(&ctx, &credential, &token())
        .await
        .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);

    let healthy = MockChain::sepolia();
    let retried = test
        .orchestrator(&healthy)
        .deploy(&ctx, &credential, &token())
        .await
        .unwrap();

    assert_eq!(retried.status, DeploymentStatus::Confirmed);
    assert!(retried.cause.is_none());
    assert!(retried.revision > failed.revision);
}

#[tokio::test]
async fn test_confirmation_timeout_is_recorded_as_failed() {
    let mut test = TestContext::new("slipway-deploy");
    test.config.deploy.confirmation_timeout_ms = 40;
    let chain = MockChain::sepolia();
    chain.pause_mining();
    let ctx = test.sepolia();

    let record = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .expect("record");

    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(
        record.cause.map(|c| c.kind),
        Some(FailureKind::ConfirmationTimeout)
    );
}

#[tokio::test]
async fn test_receipt_poll_errors_exhaust_into_failed_record() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.fail_receipts((0..3).map(|_| transport_error("eth_getTransactionReceipt")));
    let ctx = test.sepolia();

    let record = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .expect("record");

    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(
        record.cause.map(|c| c.kind),
        Some(FailureKind::RetriesExhausted)
    );
}

#[tokio::test]
async fn test_failed_polling_resumes_the_mined_transaction() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.fail_receipts((0..3).map(|_| transport_error("eth_getTransactionReceipt")));
    let ctx = test.sepolia();
    let credential = test.credential(&ctx);
    let orchestrator = test.orchestrator(&chain);

    let failed = orchestrator.deploy(&ctx, &credential, &token()).await.unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);

    // The transaction was mined while the receipts could not be read.
    let record = orchestrator.deploy(&ctx, &credential, &token()).await.unwrap();

    assert_eq!(record.status, DeploymentStatus::Confirmed);
    assert_eq!(record.tx_hash, failed.tx_hash);
    assert_eq!(record.address, Some(DEPLOYER.create(0)));
    assert!(record.cause.is_none());
    assert_eq!(chain.broadcasts(), 1);
}

#[tokio::test]
async fn test_timed_out_transaction_is_replaced_on_its_own_nonce() {
    let mut test = TestContext::new("slipway-deploy");
    test.config.deploy.confirmation_timeout_ms = 40;
    let chain = MockChain::sepolia();
    chain.pause_mining();
    let ctx = test.sepolia();
    let credential = test.credential(&ctx);
    let orchestrator = test.orchestrator(&chain);

    let first = orchestrator.deploy(&ctx, &credential, &token()).await.unwrap();
    assert_eq!(
        first.cause.as_ref().map(|c| c.kind),
        Some(FailureKind::ConfirmationTimeout)
    );

    let second = orchestrator.deploy(&ctx, &credential, &token()).await.unwrap();
    assert_eq!(second.status, DeploymentStatus::Failed);
    assert_eq!(second.nonce, first.nonce);
    assert_eq!(second.tx_hash, first.tx_hash);
    assert_eq!(chain.broadcasts(), 1);

    chain.resume_mining();
    let confirmed = orchestrator.deploy(&ctx, &credential, &token()).await.unwrap();

    assert_eq!(confirmed.status, DeploymentStatus::Confirmed);
    assert_eq!(confirmed.address, Some(DEPLOYER.create(0)));
    assert_eq!(chain.broadcasts(), 1);
}

#[tokio::test]
async fn test_transient_broadcast_errors_are_retried() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.fail_sends([
        transport_error("eth_sendRawTransaction"),
        RpcError::Node {
            method: "eth_sendRawTransaction".to_string(),
            code: -32005,
            message: "limit exceeded".to_string(),
        },
    ]);
    let ctx = test.sepolia();

    let record = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .expect("deployment");

    assert_eq!(record.status, DeploymentStatus::Confirmed);
    assert_eq!(chain.send_attempts(), 3);
    assert_eq!(chain.broadcasts(), 1);
}

#[tokio::test]
async fn test_exhausted_broadcast_retries_persist_nothing() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.fail_sends((0..4).map(|_| transport_error("eth_sendRawTransaction")));
    let ctx = test.sepolia();

    let err = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(err.exit_code(), exit_code::TRANSIENT_EXHAUSTED);
    assert_eq!(chain.send_attempts(), 4);
    assert!(test.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_nonce_conflict_refetches_once() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.fail_sends([RpcError::NonceConflict("nonce too low".to_string())]);
    let ctx = test.sepolia();

    let record = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .expect("deployment");

    assert_eq!(record.status, DeploymentStatus::Confirmed);
    assert_eq!(chain.send_attempts(), 2);
}

#[tokio::test]
async fn test_repeated_nonce_conflict_aborts() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.fail_sends([
        RpcError::NonceConflict("nonce too low".to_string()),
        RpcError::NonceConflict("nonce too low".to_string()),
    ]);
    let ctx = test.sepolia();

    let err = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::NonceConflict { .. }));
    assert_eq!(chain.send_attempts(), 2);
    assert!(test.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_insufficient_funds_persists_nothing() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    chain.fail_sends([RpcError::InsufficientFunds(
        "insufficient funds for gas * price + value".to_string(),
    )]);
    let ctx = test.sepolia();

    let err = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .unwrap_err();

    match &err {
        DeployError::InsufficientFunds { address, .. } => assert_eq!(*address, DEPLOYER),
        other => panic!("unexpected error: {other}"),
    }
    // Not transient: a single attempt.
    assert_eq!(chain.send_attempts(), 1);
    assert!(test.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_chain_id_mismatch_is_a_configuration_error() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::new(1);
    let ctx = test.sepolia();

    let err = test
        .orchestrator(&chain)
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .unwrap_err();

    assert_eq!(SlipwayError::from(err).exit_code(), exit_code::CONFIGURATION);
    assert_eq!(chain.send_attempts(), 0);
    assert!(test.store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_confirmed_receipts_reach_the_gas_report() {
    let test = TestContext::new("slipway-deploy");
    let chain = MockChain::sepolia();
    let ctx = test.sepolia();
    let report = Arc::new(GasReport::new(GasReporterSettings::default()));

    test.orchestrator(&chain)
        .with_observer(report.clone())
        .deploy(&ctx, &test.credential(&ctx), &token())
        .await
        .expect("deployment");

    let usages = report.usages();
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].contract, "Token");
    assert_eq!(usages[0].gas_used, GAS_USED);
    assert!(report.render().contains("Token"));
}
