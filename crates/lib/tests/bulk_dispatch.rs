//! End-to-end bulk dispatch against in-process transport, pairing and credit collaborators.

mod common;

use common::{dispatch_config, recipients, texts, FakeTransport, Harness, TENANT};
use herald::channels::TransportError;
use herald::dispatch::{
    CreditGate, DispatchError, DispatchRequest, FailureReason, ItemOutcome, ItemStatus, JobState, LogQuery,
    SkipReason,
};
use herald::message::MessageSpec;
use herald::recipients::InvalidRecipientPolicy;
use herald::session::SessionError;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn request(recipients: Vec<String>, messages: Vec<MessageSpec>) -> DispatchRequest {
    DispatchRequest {
        recipients,
        messages,
        ..DispatchRequest::default()
    }
}

#[tokio::test]
async fn credits_for_four_of_six_items() {
    let h = Harness::new(FakeTransport::default(), 4, dispatch_config());
    h.connect().await;
    let messages = vec![
        MessageSpec::text("text1"),
        MessageSpec::image("https://cdn.example/image1.png", ""),
    ];
    let submission = h
        .dispatcher
        .submit(TENANT, request(recipients(3), messages))
        .await
        .unwrap();
    assert_eq!(submission.job.progress().total, 6);

    let summary = submission.job.wait().await;
    assert_eq!(summary.success_count, 4);
    assert_eq!(summary.fail_count, 2);
    assert_eq!(summary.skipped_count, 0);
    assert_eq!(submission.job.progress().dispatched, 6);
    assert!(submission.job.progress().is_complete());
    assert_eq!(submission.job.state(), JobState::Completed);
    for result in summary.results.iter().filter(|r| r.outcome.status() == ItemStatus::Failed) {
        assert!(matches!(
            result.outcome,
            ItemOutcome::Failed {
                reason: FailureReason::InsufficientCredits,
                attempts: 0,
                ..
            }
        ));
    }
    // refused credits never reach the transport
    assert_eq!(h.transport.call_count(), 4);
    assert_eq!(h.ledger.balance(TENANT).await, 0);
}

#[tokio::test]
async fn no_credits_means_no_transport_calls() {
    let h = Harness::new(FakeTransport::default(), 0, dispatch_config());
    h.connect().await;
    let job = h
        .dispatcher
        .submit(TENANT, request(recipients(4), texts(2)))
        .await
        .unwrap()
        .job;
    let summary = job.wait().await;
    assert_eq!(summary.fail_count, 8);
    assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_recipient_receives_messages_in_order() {
    let h = Harness::new(
        FakeTransport::with_delay(Duration::from_millis(2)),
        1_000,
        dispatch_config(),
    );
    h.connect().await;
    let mut req = request(recipients(6), texts(4));
    req.concurrency = Some(5);
    let summary = h.dispatcher.submit(TENANT, req).await.unwrap().job.wait().await;
    assert_eq!(summary.success_count, 24);
    assert!(
        !h.transport.overlapped.load(Ordering::SeqCst),
        "two sends to one recipient were in flight at once"
    );
    for r in recipients(6) {
        assert_eq!(h.transport.texts_for(&r), vec!["m0", "m1", "m2", "m3"]);
    }
}

#[tokio::test]
async fn disconnect_mid_job_skips_the_rest() {
    let h = Harness::new(
        FakeTransport::with_delay(Duration::from_millis(30)),
        1_000,
        dispatch_config(),
    );
    h.connect().await;
    let mut req = request(recipients(4), texts(2));
    req.concurrency = Some(2);
    let job = h.dispatcher.submit(TENANT, req).await.unwrap().job;

    let mut progress = job.subscribe_progress();
    progress.wait_for(|p| p.dispatched >= 1).await.unwrap();
    h.sessions.disconnect(TENANT).await;

    let summary = job.wait().await;
    assert!(summary.session_lost);
    assert!(!summary.cancelled);
    assert!(summary.skipped_count >= 1);
    assert_eq!(
        summary.success_count + summary.fail_count + summary.skipped_count,
        summary.total
    );
    assert_eq!(job.progress().dispatched, 8);
    assert!(h.transport.call_count() < 8);
    assert!(summary
        .results
        .iter()
        .filter(|r| r.outcome.status() == ItemStatus::Skipped)
        .all(|r| r.outcome
            == ItemOutcome::Skipped {
                reason: SkipReason::SessionNotConnected
            }));
}

#[tokio::test]
async fn cancel_lets_in_flight_sends_finish() {
    let h = Harness::new(
        FakeTransport::with_delay(Duration::from_millis(30)),
        1_000,
        dispatch_config(),
    );
    h.connect().await;
    let mut req = request(recipients(5), texts(1));
    req.concurrency = Some(1);
    let job = h.dispatcher.submit(TENANT, req).await.unwrap().job;

    let mut progress = job.subscribe_progress();
    progress.wait_for(|p| p.dispatched >= 1).await.unwrap();
    assert!(job.cancel());
    assert!(!job.cancel());

    let summary = job.wait().await;
    assert!(summary.cancelled);
    assert_eq!(job.state(), JobState::Completed);
    assert!(summary.success_count >= 1);
    assert!(summary.skipped_count >= 1);
    assert_eq!(
        summary.success_count + summary.skipped_count,
        summary.total
    );
    // every started send completed
    assert_eq!(h.transport.call_count(), summary.success_count);
}

#[tokio::test]
async fn transient_errors_are_retried_and_rejections_are_not() {
    let h = Harness::new(FakeTransport::default(), 1_000, dispatch_config());
    h.connect().await;
    let r = recipients(3);
    let transient = || Err(TransportError::Transient("503".to_string()));
    h.transport.script(&r[0], vec![transient(), transient()]);
    h.transport.script(&r[1], vec![transient(); 10]);
    h.transport
        .script(&r[2], vec![Err(TransportError::Rejected("bad media".to_string()))]);

    let summary = h
        .dispatcher
        .submit(TENANT, request(r.clone(), texts(1)))
        .await
        .unwrap()
        .job
        .wait()
        .await;
    let outcome = |i: usize| &summary.results[i].outcome;
    assert!(matches!(outcome(0), ItemOutcome::Sent { attempts: 3, .. }));
    assert!(matches!(
        outcome(1),
        ItemOutcome::Failed {
            reason: FailureReason::TransportError,
            attempts: 4,
            ..
        }
    ));
    assert!(matches!(
        outcome(2),
        ItemOutcome::Failed {
            reason: FailureReason::Rejected,
            attempts: 1,
            ..
        }
    ));
    // retries never consume extra credits
    assert_eq!(h.ledger.balance(TENANT).await, 997);
}

#[tokio::test]
async fn slow_sends_time_out_per_attempt() {
    let mut config = dispatch_config();
    config.send_timeout_ms = 10;
    config.retry.max_retries = 1;
    let h = Harness::new(
        FakeTransport::with_delay(Duration::from_millis(200)),
        10,
        config,
    );
    h.connect().await;
    let summary = h
        .dispatcher
        .submit(TENANT, request(recipients(1), texts(1)))
        .await
        .unwrap()
        .job
        .wait()
        .await;
    assert!(matches!(
        summary.results[0].outcome,
        ItemOutcome::Failed {
            reason: FailureReason::TransportError,
            attempts: 2,
            ..
        }
    ));
}

#[tokio::test]
async fn submit_rejects_bad_requests_before_any_work() {
    let h = Harness::new(FakeTransport::default(), 10, dispatch_config());

    let err = h
        .dispatcher
        .submit(TENANT, request(recipients(1), texts(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Session(SessionError::NotConnected { .. })
    ));

    h.connect().await;
    let err = h
        .dispatcher
        .submit(TENANT, request(vec!["nope".to_string()], texts(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::EmptyPlan(_)));

    let mut strict = request(vec!["+15550000001".to_string(), "nope".to_string()], texts(1));
    strict.invalid_recipients = InvalidRecipientPolicy::Abort;
    let err = h.dispatcher.submit(TENANT, strict).await.unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRecipient(_)));

    let err = h
        .dispatcher
        .submit(TENANT, request(recipients(1), vec![MessageSpec::text(" ")]))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidMessage(_)));

    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.ledger.balance(TENANT).await, 10);
    assert!(h.ledger.try_consume(TENANT, 10).await);
}

#[tokio::test]
async fn lenient_submission_reports_dropped_recipients_and_logs_outcomes() {
    let h = Harness::new(FakeTransport::default(), 1, dispatch_config());
    h.connect().await;
    let raw = vec![
        "+1 555 000 0001".to_string(),
        "15550000001".to_string(),
        "call me".to_string(),
        "+15550000002".to_string(),
    ];
    let submission = h.dispatcher.submit(TENANT, request(raw, texts(1))).await.unwrap();
    assert_eq!(submission.rejected.len(), 1);
    assert_eq!(submission.rejected[0].identifier, "call me");
    assert_eq!(submission.duplicates, 1);
    let job_id = submission.job.id().clone();
    submission.job.wait().await;

    let page = h.log.query(&LogQuery {
        tenant_id: Some(TENANT.to_string()),
        ..LogQuery::default()
    });
    assert_eq!(page.total, 2);
    let failed = h.log.query(&LogQuery {
        status: Some(ItemStatus::Failed),
        ..LogQuery::default()
    });
    assert_eq!(failed.total, 1);
    assert_eq!(failed.entries[0].reason.as_deref(), Some("insufficientCredits"));

    let jobs = h.dispatcher.jobs();
    let summary = jobs.take_summary(&job_id).await.unwrap();
    assert_eq!(summary.total, 2);
    assert!(jobs.get(&job_id).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_send_fails_the_item_and_the_job_completes() {
    let r = recipients(2);
    let transport = FakeTransport {
        delay: Duration::from_millis(5),
        panic_for: Some(r[0].clone()),
        ..FakeTransport::default()
    };
    let h = Harness::new(transport, 100, dispatch_config());
    h.connect().await;
    let mut req = request(r.clone(), texts(2));
    req.concurrency = Some(2);
    let job = h.dispatcher.submit(TENANT, req).await.unwrap().job;

    let summary = tokio::time::timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("job did not complete after a panicking send");
    assert_eq!(summary.total, 4);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.fail_count, 2);
    assert_eq!(job.progress().dispatched, 4);
    for result in summary.results.iter().filter(|res| res.recipient.as_str() == r[0]) {
        assert!(matches!(
            result.outcome,
            ItemOutcome::Failed {
                reason: FailureReason::TransportError,
                ..
            }
        ));
    }
    assert_eq!(h.transport.texts_for(&r[1]), vec!["m0", "m1"]);
}
