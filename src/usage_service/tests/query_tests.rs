use super::*;
use crate::usage_service::fake::{FakeConnector, FakeScript};
use crate::usage_service::types::UsageRow;
use std::collections::{HashMap, VecDeque};

fn fast_policy(max_polls: Option<u32>) -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(1),
        max_polls,
    }
}

fn smithlab_rows() -> serde_json::Value {
    serde_json::json!([{
        "username": "jdoe",
        "groupname": "smithlab",
        "size_sum": 500000000,
        "size_sum_hum": "500MB"
    }])
}

fn connector(statuses: &[bool]) -> FakeConnector {
    let mut results = HashMap::new();
    results.insert("type=f groupname=smithlab".to_string(), smithlab_rows());
    FakeConnector::new(FakeScript {
        results,
        statuses: statuses.iter().copied().collect::<VecDeque<_>>(),
        ..FakeScript::default()
    })
}

fn request() -> QueryRequest {
    QueryRequest::group_usage("smithlab", "tier1", "labs")
}

#[test]
fn test_result_only_after_done() {
    let connector = connector(&[false, false, true]);
    let mut service = connector.service("holysfdb01");
    service.authenticate().unwrap();

    let mut query = AsyncQuery::new(&service, request());
    let job_id = query.submit().unwrap();
    assert_eq!(
        query.state(),
        &QueryState::Submitted {
            job_id: job_id.clone()
        }
    );

    let outcome = query
        .await_completion(&fast_policy(None), &CancelToken::new())
        .unwrap();
    assert_eq!(connector.log.lock().unwrap().status_polls, 3);
    assert_eq!(query.state(), &QueryState::Done { job_id });

    let QueryOutcome::Rows(rows) = outcome else {
        panic!("expected rows, got {:?}", outcome);
    };
    assert_eq!(
        rows,
        vec![UsageRow {
            username: "jdoe".to_string(),
            groupname: "smithlab".to_string(),
            size_sum: 500_000_000,
            size_sum_hum: "500MB".to_string(),
            extra: serde_json::Map::new(),
        }]
    );
}

#[test]
fn test_poll_limit_fails_without_result() {
    let connector = connector(&[false; 10]);
    let mut service = connector.service("holysfdb01");
    service.authenticate().unwrap();

    let mut query = AsyncQuery::new(&service, request());
    query.submit().unwrap();
    let result = query.await_completion(&fast_policy(Some(4)), &CancelToken::new());

    assert!(matches!(result, Err(SyncError::PollLimit { polls: 4, .. })));
    assert_eq!(connector.log.lock().unwrap().status_polls, 4);
    assert!(matches!(query.state(), QueryState::Failed { .. }));
    assert!(matches!(
        query.fetch_result(),
        Err(SyncError::Protocol(_))
    ));
}

#[test]
fn test_cancel_before_poll() {
    let connector = connector(&[]);
    let mut service = connector.service("holysfdb01");
    service.authenticate().unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut query = AsyncQuery::new(&service, request());
    query.submit().unwrap();

    assert!(matches!(
        query.await_completion(&fast_policy(None), &cancel),
        Err(SyncError::Cancelled)
    ));
    assert_eq!(connector.log.lock().unwrap().status_polls, 0);
}

#[test]
fn test_cancel_interrupts_wait() {
    let cancel = CancelToken::new();
    let other = cancel.clone();
    let handle = std::thread::spawn(move || other.wait(Duration::from_secs(30)));

    std::thread::sleep(Duration::from_millis(20));
    cancel.cancel();
    assert!(matches!(handle.join().unwrap(), Err(SyncError::Cancelled)));
    assert!(cancel.is_cancelled());
}

#[test]
fn test_wait_elapses_without_cancel() {
    let cancel = CancelToken::new();
    assert!(cancel.wait(Duration::from_millis(5)).is_ok());
    assert!(!cancel.is_cancelled());
}

#[test]
fn test_rejected_submission_marks_failed() {
    let connector = FakeConnector::new(FakeScript {
        rejected: vec!["type=f groupname=smithlab".to_string()],
        ..FakeScript::default()
    });
    let mut service = connector.service("holysfdb01");
    service.authenticate().unwrap();

    let mut query = AsyncQuery::new(&service, request());
    assert!(matches!(
        query.submit(),
        Err(SyncError::Submission { .. })
    ));
    assert!(matches!(query.state(), QueryState::Failed { .. }));
}

#[test]
fn test_await_before_submit_is_protocol_error() {
    let connector = connector(&[]);
    let service = connector.service("holysfdb01");
    let mut query = AsyncQuery::new(&service, request());
    assert!(matches!(
        query.await_completion(&fast_policy(None), &CancelToken::new()),
        Err(SyncError::Protocol(_))
    ));
    assert!(matches!(query.submit(), Err(SyncError::Auth { .. })));
}

#[test]
fn test_double_submit_is_protocol_error() {
    let connector = connector(&[]);
    let mut service = connector.service("holysfdb01");
    service.authenticate().unwrap();
    let mut query = AsyncQuery::new(&service, request());
    query.submit().unwrap();
    assert!(matches!(query.submit(), Err(SyncError::Protocol(_))));
}

#[test]
fn test_run_query_empty_result() {
    let connector = FakeConnector::new(FakeScript::default());
    let mut service = connector.service("holysfdb01");
    service.authenticate().unwrap();
    let outcome = run_query(
        &service,
        QueryRequest::group_usage("joneslab", "tier1", "labs"),
        &fast_policy(Some(3)),
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(outcome, QueryOutcome::Empty);
}

#[test]
fn test_expired_token_mid_poll_is_auth_error() {
    let connector = connector(&[false, false, false]);
    connector.script.lock().unwrap().token_lifetime = Some(2);
    let mut service = connector.service("holysfdb01");
    service.authenticate().unwrap();

    let result = run_query(
        &service,
        request(),
        &fast_policy(None),
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(SyncError::Auth { .. })));
}
