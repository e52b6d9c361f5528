use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest_proxy_rotator::{
    AcquireRequest, ErrorCode, ExecutorOptions, ManualClock, PoolConfig, Protocol, ProxyEntry,
    ProxyPool, ResilientExecutor, Route, StickyKey, Transport,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum MockError {
    Code(ErrorCode),
    Pool(String),
    Unsendable,
}

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockError::Code(code) => write!(f, "transport error {:?}", code),
            MockError::Pool(msg) => write!(f, "pool error: {}", msg),
            MockError::Unsendable => f.write_str("request cannot be replayed"),
        }
    }
}

impl From<reqwest_proxy_rotator::Error> for MockError {
    fn from(err: reqwest_proxy_rotator::Error) -> Self {
        MockError::Pool(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct MockResponse {
    status: u16,
    via: Option<String>,
}

enum Step {
    Status(u16),
    Fail(ErrorCode),
    Hang,
}

/// Plays back scripted steps; answers 200 once the script runs out.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    /// Proxy id per call, `None` for direct calls.
    calls: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Request = String;
    type Response = MockResponse;
    type Error = MockError;

    fn check_request(&self, request: &String) -> Result<(), MockError> {
        if request.starts_with("stream:") {
            return Err(MockError::Unsendable);
        }
        Ok(())
    }

    async fn send(&self, _request: &String, route: Route<'_>) -> Result<MockResponse, MockError> {
        let via = match route {
            Route::Direct => None,
            Route::Proxied(proxy) => Some(proxy.id.clone()),
        };
        self.calls.lock().push(via.clone());
        let step = self.script.lock().pop_front();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match step {
            None => Ok(MockResponse { status: 200, via }),
            Some(Step::Status(status)) => Ok(MockResponse { status, via }),
            Some(Step::Fail(code)) => Err(MockError::Code(code)),
            Some(Step::Hang) => futures::future::pending().await,
        }
    }

    fn response_status(&self, response: &MockResponse) -> u16 {
        response.status
    }

    fn error_status(&self, _error: &MockError) -> Option<u16> {
        None
    }

    fn error_code(&self, error: &MockError) -> Option<ErrorCode> {
        match error {
            MockError::Code(code) => Some(*code),
            MockError::Pool(_) | MockError::Unsendable => None,
        }
    }
}

fn entries(n: usize) -> Vec<ProxyEntry> {
    (0..n)
        .map(|i| ProxyEntry::new(format!("192.0.2.{}", i + 1)).http_port(3128))
        .collect()
}

fn pool(n: usize) -> Arc<ProxyPool> {
    let clock = Arc::new(ManualClock::default());
    Arc::new(ProxyPool::with_clock(entries(n), PoolConfig::default(), clock).unwrap())
}

fn executor(
    pool: &Arc<ProxyPool>,
    steps: Vec<Step>,
    options: ExecutorOptions<String>,
) -> ResilientExecutor<ScriptedTransport> {
    ResilientExecutor::new(Arc::clone(pool), ScriptedTransport::new(steps), options)
}

fn totals(pool: &ProxyPool) -> (u64, u32, usize) {
    pool.snapshot().iter().fold((0, 0, 0), |(ok, failed, in_flight), r| {
        (ok + r.success_count, failed + r.fail_streak, in_flight + r.in_flight)
    })
}

#[tokio::test]
async fn two_server_errors_then_success() {
    let pool = pool(3);
    let exec = executor(&pool, vec![Step::Status(503), Step::Status(503), Step::Status(200)], ExecutorOptions::default());

    let response = exec.execute(&"/products".to_string()).await.unwrap();

    assert_eq!(response.status, 200);
    let calls = exec.transport().calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(Option::is_some));
    // each retry lands on a fresh proxy
    assert_ne!(calls[0], calls[1]);
    assert_ne!(calls[1], calls[2]);
    assert_eq!(totals(&pool), (1, 2, 0));
}

#[tokio::test]
async fn exhausted_retries_fall_back_to_direct() {
    let pool = pool(3);
    let steps = vec![Step::Status(503), Step::Fail(ErrorCode::Timeout), Step::Status(429), Step::Status(200)];
    let exec = executor(&pool, steps, ExecutorOptions::default());

    let response = exec.execute(&"/x".to_string()).await.unwrap();

    assert_eq!(response, MockResponse { status: 200, via: None });
    let calls = exec.transport().calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[..3].iter().all(Option::is_some));
    assert_eq!(calls[3], None);
    // the direct attempt is not recorded against the pool
    assert_eq!(totals(&pool), (0, 3, 0));
}

#[tokio::test]
async fn direct_fallback_is_terminal() {
    let pool = pool(2);
    let exec = executor(&pool, vec![Step::Status(404), Step::Status(500)], ExecutorOptions::default());

    let response = exec.execute(&"/missing".to_string()).await.unwrap();

    // 404 is not retryable, the direct 500 is returned as-is
    assert_eq!(response, MockResponse { status: 500, via: None });
    assert_eq!(exec.transport().calls().len(), 2);
}

#[tokio::test]
async fn direct_fallback_error_surfaces_unchanged() {
    let pool = pool(2);
    let steps = vec![Step::Fail(ErrorCode::Connect), Step::Fail(ErrorCode::ConnectionReset)];
    let exec = executor(&pool, steps, ExecutorOptions::default());

    let err = exec.execute(&"/".to_string()).await.unwrap_err();

    assert_eq!(err, MockError::Code(ErrorCode::ConnectionReset));
    assert_eq!(exec.transport().calls().len(), 2);
}

#[tokio::test]
async fn without_fallback_last_failure_is_returned() {
    let pool = pool(3);
    let options = ExecutorOptions { fallback_to_direct: false, ..ExecutorOptions::default() };
    let steps = vec![Step::Fail(ErrorCode::Timeout), Step::Fail(ErrorCode::Timeout), Step::Fail(ErrorCode::DnsRetry)];
    let exec = executor(&pool, steps, options);

    let err = exec.execute(&"/".to_string()).await.unwrap_err();

    assert_eq!(err, MockError::Code(ErrorCode::DnsRetry));
    assert!(exec.transport().calls().iter().all(Option::is_some));
    assert_eq!(totals(&pool), (0, 3, 0));
}

#[tokio::test]
async fn auth_rejection_is_not_retried_through_proxies() {
    let pool = pool(2);
    let options = ExecutorOptions { fallback_to_direct: false, ..ExecutorOptions::default() };
    let exec = executor(&pool, vec![Step::Status(407)], options);

    let response = exec.execute(&"/".to_string()).await.unwrap();

    assert_eq!(response.status, 407);
    assert_eq!(exec.transport().calls().len(), 1);
    assert_eq!(pool.stats().dead, 1);
}

#[tokio::test]
async fn zero_retries_goes_straight_to_fallback() {
    let pool = pool(2);
    let options = ExecutorOptions { max_retries: 0, ..ExecutorOptions::default() };
    let exec = executor(&pool, vec![Step::Status(503)], options);

    let response = exec.execute(&"/".to_string()).await.unwrap();

    assert_eq!(response, MockResponse { status: 200, via: None });
    assert_eq!(exec.transport().calls().len(), 2);
}

#[tokio::test]
async fn forced_direct_skips_the_pool() {
    let pool = pool(1);
    let exec = executor(&pool, vec![Step::Fail(ErrorCode::Timeout)], ExecutorOptions::default());

    let err = exec.execute_direct(&"/".to_string()).await.unwrap_err();

    assert_eq!(err, MockError::Code(ErrorCode::Timeout));
    assert_eq!(exec.transport().calls(), vec![None]);
    assert_eq!(totals(&pool), (0, 0, 0));
    assert_eq!(pool.snapshot()[0].last_used_at, std::time::SystemTime::UNIX_EPOCH);
}

#[tokio::test]
async fn missing_port_is_a_configuration_error() {
    let pool = pool(2);
    let options = ExecutorOptions { protocol: Protocol::Socks5, ..ExecutorOptions::default() };
    let exec = executor(&pool, Vec::new(), options);

    let err = exec.execute(&"/".to_string()).await.unwrap_err();

    assert!(matches!(err, MockError::Pool(ref msg) if msg.contains("socks5")));
    assert!(exec.transport().calls().is_empty());
    assert_eq!(pool.stats().in_flight, 0);
}

#[tokio::test]
async fn sticky_requests_stay_on_one_proxy() {
    let pool = pool(3);
    let options = ExecutorOptions {
        sticky_key: Some(StickyKey::derived(|path: &String| path.split('/').nth(1).map(str::to_string))),
        max_in_flight_per_proxy: 1,
        ..ExecutorOptions::default()
    };
    let exec = executor(&pool, Vec::new(), options);

    let first = exec.execute(&"/cart/1".to_string()).await.unwrap();
    let other = exec.execute(&"/wishlist".to_string()).await.unwrap();
    let second = exec.execute(&"/cart/2".to_string()).await.unwrap();

    assert_eq!(first.via, second.via);
    assert_ne!(first.via, other.via);
    assert_eq!(pool.sticky_binding("cart"), first.via);
}

#[tokio::test]
async fn cancelled_call_releases_its_proxy() {
    let pool = pool(1);
    let exec = executor(&pool, vec![Step::Hang], ExecutorOptions::default());

    let result = tokio::time::timeout(Duration::from_millis(20), exec.execute(&"/".to_string())).await;

    assert!(result.is_err());
    let record = &pool.snapshot()[0];
    assert_eq!(record.in_flight, 0);
    assert_eq!(record.fail_streak, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_keep_in_flight_exact() {
    let pool = Arc::new(
        ProxyPool::with_config(
            entries(5),
            PoolConfig { max_requests_per_second: Some(1000.0), ..PoolConfig::default() },
        )
        .unwrap(),
    );
    let transport = ScriptedTransport {
        delay: Some(Duration::from_millis(5)),
        ..ScriptedTransport::default()
    };
    let options = ExecutorOptions { max_in_flight_per_proxy: 2, ..ExecutorOptions::default() };
    let exec = Arc::new(ResilientExecutor::new(Arc::clone(&pool), transport, options));

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { exec.execute(&format!("/item/{}", i)).await })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap().status, 200);
    }

    assert_eq!(totals(&pool), (50, 0, 0));
    assert!(pool.snapshot().iter().all(|r| r.success_count > 0));
}

#[test]
fn acquire_never_blocks_when_everything_is_saturated() {
    let pool = pool(2);
    let request = AcquireRequest::default();
    let ids: Vec<String> = (0..5).map(|_| pool.acquire(&request).unwrap().id).collect();

    assert_eq!(pool.stats().in_flight, 5);
    assert_ne!(ids[0], ids[1]);
}

#[tokio::test]
async fn unreplayable_request_never_touches_the_pool() {
    let pool = pool(1);
    let options = ExecutorOptions { fallback_to_direct: false, ..ExecutorOptions::default() };
    let exec = executor(&pool, Vec::new(), options);

    for _ in 0..6 {
        let err = exec.execute(&"stream:/upload".to_string()).await.unwrap_err();
        assert_eq!(err, MockError::Unsendable);
    }

    assert!(exec.transport().calls().is_empty());
    let record = &pool.snapshot()[0];
    assert_eq!((record.in_flight, record.fail_streak), (0, 0));
    assert_eq!(pool.stats().available, 1);
}
