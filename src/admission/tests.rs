use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};

struct Fixed {
    result: AdmissionResult,
    calls: AtomicUsize,
}

impl Fixed {
    fn new(result: AdmissionResult) -> Arc<Self> {
        Arc::new(Self {
            result,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Protect for Fixed {
    async fn protect(&self, _request: &AdmissionRequest) -> AdmissionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

fn upgrade_request() -> AdmissionRequest {
    AdmissionRequest::new("198.51.100.7:51000".parse().unwrap(), "/ws")
}

#[tokio::test]
async fn test_allow_all() {
    let gate = AdmissionGate::allow_all();
    assert!(!gate.rechecks_after_handshake());
    assert_eq!(gate.evaluate(&upgrade_request()).await, Ok(()));
}

#[tokio::test]
async fn test_rejections_map_to_status_and_close_code() {
    let cases = [
        (
            Ok(Decision::Deny(DenyReason::RateLimited)),
            Rejection::RateLimited,
            429,
            1013,
        ),
        (
            Ok(Decision::Deny(DenyReason::Other("bot"))),
            Rejection::Denied,
            401,
            1008,
        ),
        (
            Err(AdmissionError::Unavailable("timeout".into())),
            Rejection::Unavailable,
            500,
            1011,
        ),
    ];

    for (result, expected, status, code) in cases {
        let gate = AdmissionGate::new(Fixed::new(result), true);
        let rejection = gate.evaluate(&upgrade_request()).await.unwrap_err();
        assert_eq!(rejection, expected);
        assert_eq!(rejection.status().as_u16(), status);
        assert_eq!(rejection.close_reason().code(), code);
    }
}

#[tokio::test]
async fn test_established_stage_skipped_without_recheck() {
    let engine = Fixed::new(Ok(Decision::Deny(DenyReason::RateLimited)));
    let gate = AdmissionGate::new(engine.clone(), false);
    assert!(!gate.rechecks_after_handshake());
    let established = upgrade_request().at_stage(Stage::Established);

    assert_eq!(gate.evaluate(&established).await, Ok(()));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);

    assert!(gate.evaluate(&upgrade_request()).await.is_err());
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_established_stage_rechecked() {
    let engine = Fixed::new(Ok(Decision::Deny(DenyReason::Other("shield"))));
    let gate = AdmissionGate::new(engine.clone(), true);
    assert!(gate.rechecks_after_handshake());
    let established = upgrade_request().at_stage(Stage::Established);

    assert_eq!(gate.evaluate(&established).await, Err(Rejection::Denied));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_request_builder() {
    let req = upgrade_request().with_user_agent("Mozilla/5.0");
    assert_eq!(req.stage, Stage::Upgrade);
    assert_eq!(req.user_agent.as_deref(), Some("Mozilla/5.0"));

    let established = req.at_stage(Stage::Established);
    assert_eq!(established.stage, Stage::Established);
    assert_eq!(established.peer, req.peer);
    assert_eq!(established.user_agent, req.user_agent);
}
