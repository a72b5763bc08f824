//! Reconnect controller policy: URL ordering, backoff, limits and the
//! transaction-rollback condition.

use std::sync::{
    Arc,
    Mutex,
    atomic::{AtomicU32, Ordering},
};

use amqwire::{
    ReconnectError,
    error::TransactionError,
    reconnect::{
        BrokerLink,
        ConnectionOptions,
        ConnectionSettings,
        Connector,
        OptionValue,
        ReconnectController,
        ResumeError,
    },
    session::SessionName,
};
use async_trait::async_trait;

mod common;
use common::TestResult;

/// A scripted connector: fails `failures` times, then succeeds.
struct MockConnector {
    attempts: Arc<Mutex<Vec<String>>>,
    failures: AtomicU32,
    known_hosts: Vec<String>,
    limit_exceeded_resumes: AtomicU32,
}

impl MockConnector {
    fn new(failures: u32) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(Vec::new())),
            failures: AtomicU32::new(failures),
            known_hosts: Vec::new(),
            limit_exceeded_resumes: AtomicU32::new(0),
        }
    }

    fn with_known_hosts(mut self, hosts: &[&str]) -> Self {
        self.known_hosts = hosts.iter().map(|h| (*h).to_owned()).collect();
        self
    }

    fn with_limit_exceeded_resumes(self, count: u32) -> Self {
        self.limit_exceeded_resumes.store(count, Ordering::SeqCst);
        self
    }

    fn attempts(&self) -> Vec<String> { self.attempts.lock().expect("lock").clone() }
}

struct MockLink {
    known_hosts: Vec<String>,
    reject_resume: bool,
}

#[async_trait]
impl BrokerLink for MockLink {
    fn known_hosts(&self) -> Vec<String> { self.known_hosts.clone() }

    async fn resume_session(&mut self, _name: &SessionName) -> Result<(), ResumeError> {
        if self.reject_resume {
            Err(ResumeError::ResourceLimitExceeded("sessions exhausted".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connector for &MockConnector {
    async fn connect(
        &self,
        url: &str,
        _settings: &ConnectionSettings,
    ) -> std::io::Result<Box<dyn BrokerLink>> {
        self.attempts.lock().expect("lock").push(url.to_owned());
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        }
        let reject_resume = self
            .limit_exceeded_resumes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(MockLink {
            known_hosts: self.known_hosts.clone(),
            reject_resume,
        }))
    }
}

fn reconnecting_options() -> ConnectionOptions {
    let mut options = ConnectionOptions::default();
    options.reconnect = true;
    options.min_interval = std::time::Duration::from_secs(1);
    options.max_interval = std::time::Duration::from_secs(8);
    options
}

/// URLs are attempted in insertion order and advertised known-hosts merge
/// without duplicates.
#[tokio::test(start_paused = true)]
async fn known_hosts_merge_into_the_url_set() -> TestResult {
    let connector = MockConnector::new(0).with_known_hosts(&["backup:5672", "primary:5672"]);
    let mut controller =
        ReconnectController::new("primary:5672", reconnecting_options(), &connector);
    controller.open().await?;

    assert_eq!(
        controller.urls(),
        ["primary:5672".to_owned(), "backup:5672".to_owned()]
    );
    assert!(controller.is_open());
    Ok(())
}

/// Failed passes double the sleep interval up to the maximum.
#[tokio::test(start_paused = true)]
async fn backoff_doubles_between_passes() -> TestResult {
    let connector = MockConnector::new(3);
    let started = tokio::time::Instant::now();
    let mut controller =
        ReconnectController::new("flaky:5672", reconnecting_options(), &connector);
    controller.open().await?;

    // Three failed passes sleep 1s + 2s + 4s before the fourth succeeds.
    assert_eq!(started.elapsed(), std::time::Duration::from_secs(7));
    assert_eq!(connector.attempts().len(), 4);
    Ok(())
}

/// The attempt limit aborts the cycle with `LimitExceeded`.
#[tokio::test(start_paused = true)]
async fn reconnect_limit_is_honoured() {
    let connector = MockConnector::new(u32::MAX);
    let mut options = reconnecting_options();
    options.limit = Some(2);
    let mut controller = ReconnectController::new("down:5672", options, &connector);

    let err = controller.open().await.unwrap_err();
    assert!(matches!(err, ReconnectError::LimitExceeded { limit: 2 }));
}

/// The wall-clock timeout aborts the cycle with `TimedOut`.
#[tokio::test(start_paused = true)]
async fn reconnect_timeout_is_honoured() {
    let connector = MockConnector::new(u32::MAX);
    let mut options = reconnecting_options();
    options.timeout = Some(std::time::Duration::from_secs(5));
    let mut controller = ReconnectController::new("down:5672", options, &connector);

    let err = controller.open().await.unwrap_err();
    assert!(matches!(err, ReconnectError::TimedOut));
}

/// With reconnect disabled the first failure is final.
#[tokio::test(start_paused = true)]
async fn reconnect_disabled_fails_fast() {
    let connector = MockConnector::new(u32::MAX);
    let mut controller =
        ReconnectController::new("down:5672", ConnectionOptions::default(), &connector);
    let err = controller.open().await.unwrap_err();
    assert!(matches!(err, ReconnectError::Disabled));
    assert_eq!(connector.attempts().len(), 1);
}

/// A capacity-rejected resume restarts the whole cycle when
/// `x-reconnect-on-limit-exceeded` is enabled, and surfaces the error when
/// it is not.
#[tokio::test(start_paused = true)]
async fn limit_exceeded_resume_follows_the_option() -> TestResult {
    let connector = MockConnector::new(0).with_limit_exceeded_resumes(1);
    let mut controller =
        ReconnectController::new("busy:5672", reconnecting_options(), &connector);
    controller.add_session("s", false);
    controller.open().await?;
    // First connection was dropped by the rejected resume; the retry
    // connected again and resumed cleanly.
    assert_eq!(connector.attempts().len(), 2);

    let strict = MockConnector::new(0).with_limit_exceeded_resumes(1);
    let mut options = reconnecting_options();
    options.reconnect_on_limit_exceeded = false;
    let mut controller = ReconnectController::new("busy:5672", options, &strict);
    controller.add_session("s", false);
    let err = controller.open().await.unwrap_err();
    assert!(matches!(err, ReconnectError::CapacityExceeded(_)));
    Ok(())
}

/// The first commit after a failover reports the rollback; a commit on the
/// clean session then succeeds.
#[tokio::test(start_paused = true)]
async fn transactional_commit_rolls_back_once_after_failover() -> TestResult {
    let connector = MockConnector::new(0);
    let mut controller =
        ReconnectController::new("broker:5672", reconnecting_options(), &connector);
    controller.add_session("tx", true);
    controller.open().await?;

    let name = SessionName::from("tx");
    controller
        .session_mut(&name)
        .expect("session registered")
        .stage_work();

    // The broker dies and the controller reconnects.
    controller.on_transport_failure();
    controller.open().await?;

    let session = controller.session_mut(&name).expect("session registered");
    assert_eq!(session.commit(), Err(TransactionError::RolledBack));

    // Re-staged work on the clean session commits.
    session.stage_work();
    assert_eq!(session.commit(), Ok(()));
    Ok(())
}

/// Unknown options fail open before any connection is attempted.
#[test]
fn invalid_option_fails_open() {
    let mut options = ConnectionOptions::default();
    let err = options.set("x-frob", &OptionValue::Bool(true)).unwrap_err();
    assert!(matches!(err, amqwire::ConfigError::InvalidOption(name) if name == "x-frob"));
}
