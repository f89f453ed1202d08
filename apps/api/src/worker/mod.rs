//! Execution boundary: recommendation runs happen inside a supervised tokio
//! task that is health-checked, restarted once after a crash, and failed hard
//! after that.

pub mod protocol;

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::AppError;
use crate::llm_client::LlmError;
use crate::ranking::engine::{
    EngineError, ProgressObserver, RecommendationEngine, RecommendationRequest,
    RecommendationResult, Stage,
};
use protocol::{WorkerRequest, WorkerResponse};

/// Work the execution unit runs for a `recommend` request.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(
        &self,
        id: Uuid,
        request: RecommendationRequest,
        cancel: CancellationToken,
    ) -> Result<RecommendationResult, EngineError>;
}

struct LogProgress(Uuid);

impl ProgressObserver for LogProgress {
    fn on_progress(&self, stage: Stage, fraction: f32) {
        debug!(request_id = %self.0, ?stage, fraction, "recommendation progress");
    }
}

#[async_trait]
impl Executor for RecommendationEngine {
    async fn execute(
        &self,
        id: Uuid,
        request: RecommendationRequest,
        cancel: CancellationToken,
    ) -> Result<RecommendationResult, EngineError> {
        let progress = LogProgress(id);
        let observer: &dyn ProgressObserver = &progress;
        self.recommend(&request, &cancel, Some(observer)).await
    }
}

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("{0}")]
    Invalid(String),

    #[error("A recommendation is already running; try again when it finishes")]
    Busy,

    #[error("{0}")]
    Unavailable(String),

    #[error("The recommendation worker crashed while handling the request; try again")]
    Crashed,

    #[error("The recommendation did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{message}")]
    Failed { code: String, message: String },
}

impl From<BoundaryError> for AppError {
    fn from(e: BoundaryError) -> Self {
        match e {
            BoundaryError::Invalid(msg) => AppError::Validation(msg),
            BoundaryError::Busy => AppError::Busy(e.to_string()),
            BoundaryError::Unavailable(msg) => AppError::Unavailable(msg),
            BoundaryError::Crashed => AppError::Unavailable(e.to_string()),
            BoundaryError::Timeout(_) => AppError::Timeout(e.to_string()),
            BoundaryError::Failed { code, message } => match code.as_str() {
                "VALIDATION_ERROR" => AppError::Validation(message),
                "CANCELLED" => AppError::Cancelled,
                "LLM_ERROR" => AppError::Upstream(message),
                _ => AppError::Internal(anyhow::anyhow!("{code}: {message}")),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundaryConfig {
    /// Requests allowed in the unit at once; extra submissions get `Busy`.
    pub max_outstanding: usize,
    pub call_timeout: Duration,
    pub mailbox_capacity: usize,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub health_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 1,
            call_timeout: Duration::from_secs(120),
            mailbox_capacity: 8,
            max_restarts: 1,
            restart_backoff: Duration::from_millis(500),
            health_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

impl BoundaryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.worker_timeout_secs),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryState {
    Ready,
    Restarting,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundaryStatus {
    pub state: BoundaryState,
    pub restarts: u32,
    pub outstanding: usize,
    pub last_error: Option<String>,
}

struct Envelope {
    request: WorkerRequest,
    cancel: CancellationToken,
    reply: oneshot::Sender<WorkerResponse>,
    // released when the unit is done with the request, or drops it
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    state: BoundaryState,
    mailbox: Option<mpsc::Sender<Envelope>>,
    /// Restarts since the last successful recommendation.
    restarts_since_success: u32,
    restarts: u32,
    last_error: Option<String>,
    /// When the unit picked up the recommendation it is still running.
    busy_since: Option<Instant>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ExecutionBoundary {
    shared: Arc<Mutex<Shared>>,
    permits: Arc<Semaphore>,
    config: BoundaryConfig,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionBoundary {
    /// Spawns the execution unit and its supervisor. Must be called inside a runtime.
    pub fn start(executor: Arc<dyn Executor>, config: BoundaryConfig) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            state: BoundaryState::Ready,
            mailbox: None,
            restarts_since_success: 0,
            restarts: 0,
            last_error: None,
            busy_since: None,
        }));
        let (mailbox, unit) = spawn_unit(
            Arc::clone(&executor),
            Arc::clone(&shared),
            config.mailbox_capacity,
        );
        lock(&shared).mailbox = Some(mailbox);
        let permits = Arc::new(Semaphore::new(config.max_outstanding.max(1)));
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            executor,
            shared: Arc::clone(&shared),
            permits: Arc::clone(&permits),
            config,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(supervisor.run(unit));
        info!(
            "Execution boundary started (timeout {:?}, max outstanding {})",
            config.call_timeout, config.max_outstanding
        );

        Self {
            shared,
            permits,
            config,
            shutdown,
            supervisor: Mutex::new(Some(handle)),
        }
    }

    pub async fn recommend(
        &self,
        payload: RecommendationRequest,
    ) -> Result<RecommendationResult, BoundaryError> {
        let request = WorkerRequest::recommend(payload);
        match dispatch(&self.shared, &self.permits, request, self.config.call_timeout).await? {
            WorkerResponse::Result { data, .. } => {
                lock(&self.shared).restarts_since_success = 0;
                Ok(*data)
            }
            WorkerResponse::Error { error, .. } => Err(BoundaryError::Failed {
                code: error.code,
                message: error.message,
            }),
            WorkerResponse::Pong { .. } => Err(unexpected_reply()),
        }
    }

    /// Round trip through the unit; returns the observed latency.
    pub async fn ping(&self) -> Result<Duration, BoundaryError> {
        let started = Instant::now();
        match dispatch(
            &self.shared,
            &self.permits,
            WorkerRequest::ping(),
            self.config.ping_timeout,
        )
        .await?
        {
            WorkerResponse::Pong { .. } => Ok(started.elapsed()),
            _ => Err(unexpected_reply()),
        }
    }

    pub fn status(&self) -> BoundaryStatus {
        let shared = lock(&self.shared);
        BoundaryStatus {
            state: shared.state,
            restarts: shared.restarts,
            outstanding: self
                .config
                .max_outstanding
                .max(1)
                .saturating_sub(self.permits.available_permits()),
            last_error: shared.last_error.clone(),
        }
    }

    /// Stops the supervisor and aborts the unit. Pending callers are rejected.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Execution boundary supervisor ended abnormally: {e}");
            }
        }
        let mut shared = lock(&self.shared);
        shared.mailbox = None;
        if shared.state != BoundaryState::Failed {
            shared.state = BoundaryState::Stopped;
        }
    }
}

fn unexpected_reply() -> BoundaryError {
    BoundaryError::Failed {
        code: "INTERNAL_ERROR".to_string(),
        message: "Unexpected reply from the execution unit".to_string(),
    }
}

/// Sends one request to the unit and waits for its reply.
async fn dispatch(
    shared: &Mutex<Shared>,
    permits: &Arc<Semaphore>,
    request: WorkerRequest,
    limit: Duration,
) -> Result<WorkerResponse, BoundaryError> {
    request
        .validate()
        .map_err(|e| BoundaryError::Invalid(e.to_string()))?;

    let mailbox = {
        let guard = lock(shared);
        match (guard.state, guard.mailbox.as_ref()) {
            (BoundaryState::Ready, Some(mailbox)) => mailbox.clone(),
            (BoundaryState::Failed, _) => {
                return Err(BoundaryError::Unavailable(format!(
                    "The recommendation worker has failed and will not restart ({})",
                    guard.last_error.as_deref().unwrap_or("unknown error")
                )))
            }
            (BoundaryState::Stopped, _) => {
                return Err(BoundaryError::Unavailable(
                    "The recommendation worker is shut down".to_string(),
                ))
            }
            _ => {
                return Err(BoundaryError::Unavailable(
                    "The recommendation worker is restarting; try again shortly".to_string(),
                ))
            }
        }
    };

    let permit = Arc::clone(permits)
        .try_acquire_owned()
        .map_err(|_| BoundaryError::Busy)?;

    let id = request.id();
    let cancel = CancellationToken::new();
    let (reply, response) = oneshot::channel();
    let envelope = Envelope {
        request,
        cancel: cancel.clone(),
        reply,
        _permit: permit,
    };
    mailbox.try_send(envelope).map_err(|e| match e {
        TrySendError::Full(_) => BoundaryError::Busy,
        TrySendError::Closed(_) => BoundaryError::Crashed,
    })?;

    match tokio::time::timeout(limit, response).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => {
            warn!(%id, "Execution unit dropped the request");
            Err(BoundaryError::Crashed)
        }
        Err(_) => {
            cancel.cancel();
            warn!(%id, "Request timed out after {limit:?}; cancelled");
            Err(BoundaryError::Timeout(limit))
        }
    }
}

fn spawn_unit(
    executor: Arc<dyn Executor>,
    shared: Arc<Mutex<Shared>>,
    capacity: usize,
) -> (mpsc::Sender<Envelope>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, tokio::spawn(run_unit(executor, shared, rx)))
}

/// The execution unit. A panic here drops the mailbox and every reply
/// channel in it, which rejects all pending callers at once.
async fn run_unit(
    executor: Arc<dyn Executor>,
    shared: Arc<Mutex<Shared>>,
    mut mailbox: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = mailbox.recv().await {
        let started = Instant::now();
        let response = match envelope.request {
            WorkerRequest::Ping { id } => WorkerResponse::pong(id, elapsed_ms(started)),
            WorkerRequest::Recommend { id, payload } => {
                if envelope.cancel.is_cancelled() {
                    let e = EngineError::Cancelled;
                    WorkerResponse::error(id, e.code(), e.to_string(), elapsed_ms(started))
                } else {
                    lock(&shared).busy_since = Some(started);
                    let outcome = executor.execute(id, payload, envelope.cancel.clone()).await;
                    lock(&shared).busy_since = None;
                    match outcome {
                        Ok(result) => WorkerResponse::result(id, result, elapsed_ms(started)),
                        Err(e) => {
                            warn!(request_id = %id, "Recommendation failed: {e}");
                            WorkerResponse::error(id, e.code(), client_message(&e), elapsed_ms(started))
                        }
                    }
                }
            }
        };

        let id = response.id();
        if envelope.reply.send(response).is_err() {
            debug!(%id, "Caller went away before the reply");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Message safe to show a client; provider details stay in the logs.
fn client_message(e: &EngineError) -> String {
    let (llm, action) = match e {
        EngineError::Analysis(llm) => (llm, "analyze the job description"),
        EngineError::Scoring(llm) => (llm, "score your bullets"),
        EngineError::Store(_) => return "A storage error occurred".to_string(),
        other => return other.to_string(),
    };
    match llm {
        LlmError::MissingCredential | LlmError::InvalidCredential { .. } => {
            "The AI provider credential is missing or invalid".to_string()
        }
        LlmError::RateLimited { .. } => {
            "The AI provider is rate limiting requests; try again shortly".to_string()
        }
        _ => format!("Could not {action}; try again shortly"),
    }
}

fn restart_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

fn describe_exit(joined: Result<(), JoinError>) -> String {
    match joined {
        Ok(()) => "execution unit exited".to_string(),
        Err(e) if e.is_panic() => {
            format!("execution unit panicked: {}", panic_message(e.into_panic()))
        }
        Err(_) => "execution unit was aborted".to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

enum Event {
    Shutdown,
    Exited(Result<(), JoinError>),
    HealthCheck,
}

struct Supervisor {
    executor: Arc<dyn Executor>,
    shared: Arc<Mutex<Shared>>,
    permits: Arc<Semaphore>,
    config: BoundaryConfig,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(self, mut unit: JoinHandle<()>) {
        let mut health = tokio::time::interval_at(
            Instant::now() + self.config.health_interval,
            self.config.health_interval,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => Event::Shutdown,
                joined = &mut unit => Event::Exited(joined),
                _ = health.tick() => Event::HealthCheck,
            };

            match event {
                Event::Shutdown => {
                    unit.abort();
                    info!("Execution boundary stopped");
                    return;
                }
                Event::HealthCheck => self.health_check(&unit).await,
                Event::Exited(joined) => {
                    let reason = describe_exit(joined);
                    error!("Execution unit terminated: {reason}");
                    match self.restart(reason).await {
                        Some(next) => unit = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Pings the unit when it is idle. A missed ping, or a recommendation still
    /// running well past its call timeout, aborts the unit, which the next loop
    /// iteration handles as a crash.
    async fn health_check(&self, unit: &JoinHandle<()>) {
        let started = Instant::now();
        match dispatch(
            &self.shared,
            &self.permits,
            WorkerRequest::ping(),
            self.config.ping_timeout,
        )
        .await
        {
            Ok(_) => debug!(elapsed_ms = elapsed_ms(started), "Execution unit health ping ok"),
            Err(BoundaryError::Busy) => {
                let busy_for = lock(&self.shared).busy_since.map(|since| since.elapsed());
                if let Some(busy_for) = busy_for.filter(|d| *d >= self.wedged_after()) {
                    warn!("Execution unit busy for {busy_for:?} and ignoring cancellation, aborting it");
                    unit.abort();
                }
            }
            Err(BoundaryError::Unavailable(_)) => {}
            Err(e) => {
                warn!("Execution unit missed health ping, aborting it: {e}");
                unit.abort();
            }
        }
    }

    /// A cancelled call that has not returned by now is treated as wedged.
    fn wedged_after(&self) -> Duration {
        self.config.call_timeout + self.config.ping_timeout
    }

    async fn restart(&self, reason: String) -> Option<JoinHandle<()>> {
        let attempt = {
            let mut shared = lock(&self.shared);
            shared.mailbox = None;
            shared.busy_since = None;
            shared.last_error = Some(reason);
            if shared.restarts_since_success >= self.config.max_restarts {
                shared.state = BoundaryState::Failed;
                None
            } else {
                shared.restarts_since_success += 1;
                shared.restarts += 1;
                shared.state = BoundaryState::Restarting;
                Some(shared.restarts_since_success)
            }
        };
        let Some(attempt) = attempt else {
            error!("Execution unit restart budget exhausted; rejecting all work");
            return None;
        };

        let delay = restart_delay(self.config.restart_backoff, attempt);
        warn!(attempt, "Restarting execution unit in {delay:?}");
        tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let (mailbox, unit) = spawn_unit(
            Arc::clone(&self.executor),
            Arc::clone(&self.shared),
            self.config.mailbox_capacity,
        );
        let mut shared = lock(&self.shared);
        shared.mailbox = Some(mailbox);
        shared.state = BoundaryState::Ready;
        info!(attempt, "Execution unit restarted");
        Some(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedExecutor {
        calls: AtomicUsize,
        panic_on: Vec<usize>,
        delay: Duration,
        ignore_cancel: bool,
        saw_cancel: AtomicBool,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                panic_on: Vec::new(),
                delay: Duration::ZERO,
                ignore_cancel: false,
                saw_cancel: AtomicBool::new(false),
            }
        }

        fn ignoring_cancel(mut self) -> Self {
            self.ignore_cancel = true;
            self
        }

        fn panicking_on(mut self, calls: &[usize]) -> Self {
            self.panic_on = calls.to_vec();
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            _id: Uuid,
            request: RecommendationRequest,
            cancel: CancellationToken,
        ) -> Result<RecommendationResult, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on.contains(&call) {
                panic!("scripted crash on call {call}");
            }
            if self.ignore_cancel {
                tokio::time::sleep(self.delay).await;
            } else if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.saw_cancel.store(true, Ordering::SeqCst);
                        return Err(EngineError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            if request.job_title == "empty" {
                return Err(EngineError::EmptyLibrary("Your library has no roles yet."));
            }
            Ok(RecommendationResult {
                elapsed_ms: call as u64,
                ..RecommendationResult::default()
            })
        }
    }

    fn request(title: &str) -> RecommendationRequest {
        RecommendationRequest {
            job_title: title.into(),
            job_description: "Rust and Kafka".into(),
        }
    }

    fn config() -> BoundaryConfig {
        BoundaryConfig {
            call_timeout: Duration::from_secs(1),
            ..BoundaryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_submission_is_rejected_while_busy() {
        let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(500)));
        let boundary = Arc::new(ExecutionBoundary::start(executor.clone(), config()));

        let first = {
            let boundary = Arc::clone(&boundary);
            tokio::spawn(async move { boundary.recommend(request("first")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(boundary.status().outstanding, 1);

        let err = boundary.recommend(request("second")).await.unwrap_err();
        assert!(matches!(err, BoundaryError::Busy));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(executor.calls(), 1);
        assert_eq!(boundary.status().outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_rejects_immediately_then_restarts_once() {
        let executor = Arc::new(ScriptedExecutor::new().panicking_on(&[0]));
        let boundary = ExecutionBoundary::start(executor.clone(), config());

        let started = Instant::now();
        let err = boundary.recommend(request("a")).await.unwrap_err();
        assert!(matches!(err, BoundaryError::Crashed));
        assert!(started.elapsed() < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = boundary.status();
        assert_eq!(status.state, BoundaryState::Ready);
        assert_eq!(status.restarts, 1);
        assert!(status.last_error.unwrap().contains("scripted crash"));

        assert!(boundary.recommend(request("b")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_crash_fails_the_boundary() {
        let executor = Arc::new(ScriptedExecutor::new().panicking_on(&[0, 1]));
        let boundary = ExecutionBoundary::start(executor.clone(), config());

        assert!(matches!(
            boundary.recommend(request("a")).await,
            Err(BoundaryError::Crashed)
        ));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            boundary.recommend(request("b")).await,
            Err(BoundaryError::Crashed)
        ));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(boundary.status().state, BoundaryState::Failed);
        let err = boundary.recommend(request("c")).await.unwrap_err();
        assert!(matches!(err, BoundaryError::Unavailable(_)));
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_budget_resets_after_success() {
        let executor = Arc::new(ScriptedExecutor::new().panicking_on(&[0, 2]));
        let boundary = ExecutionBoundary::start(executor.clone(), config());

        assert!(boundary.recommend(request("a")).await.is_err());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(boundary.recommend(request("b")).await.is_ok());

        assert!(boundary.recommend(request("c")).await.is_err());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(boundary.status().state, BoundaryState::Ready);
        assert_eq!(boundary.status().restarts, 2);
        assert!(boundary.recommend(request("d")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_the_run() {
        let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_secs(10)));
        let boundary = ExecutionBoundary::start(executor.clone(), config());

        let err = boundary.recommend(request("slow")).await.unwrap_err();
        assert!(matches!(err, BoundaryError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(executor.saw_cancel.load(Ordering::SeqCst));
        assert_eq!(boundary.status().outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_errors_cross_the_boundary() {
        let executor = Arc::new(ScriptedExecutor::new());
        let boundary = ExecutionBoundary::start(executor, config());

        let err = boundary.recommend(request("empty")).await.unwrap_err();
        match &err {
            BoundaryError::Failed { code, message } => {
                assert_eq!(code, "VALIDATION_ERROR");
                assert!(message.contains("no roles"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_never_reaches_the_unit() {
        let executor = Arc::new(ScriptedExecutor::new());
        let boundary = ExecutionBoundary::start(executor.clone(), config());

        let err = boundary
            .recommend(RecommendationRequest {
                job_title: "Engineer".into(),
                job_description: "   ".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BoundaryError::Invalid(_)));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_and_idle_health_checks() {
        let executor = Arc::new(ScriptedExecutor::new());
        let boundary = ExecutionBoundary::start(executor, config());

        assert!(boundary.ping().await.is_ok());
        tokio::time::sleep(Duration::from_secs(95)).await;

        let status = boundary.status();
        assert_eq!(status.state, BoundaryState::Ready);
        assert_eq!(status.restarts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wedged_unit_is_aborted_and_restarted() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .with_delay(Duration::from_secs(3600))
                .ignoring_cancel(),
        );
        let boundary = ExecutionBoundary::start(executor.clone(), config());

        let err = boundary.recommend(request("stuck")).await.unwrap_err();
        assert!(matches!(err, BoundaryError::Timeout(_)));
        assert_eq!(boundary.status().outstanding, 1);

        // first health tick lands at 30s, well past timeout + ping timeout
        tokio::time::sleep(Duration::from_secs(31)).await;

        let status = boundary.status();
        assert_eq!(status.state, BoundaryState::Ready);
        assert_eq!(status.restarts, 1);
        assert_eq!(status.outstanding, 0);
        assert!(status.last_error.unwrap().contains("aborted"));
        assert!(!executor.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_work() {
        let executor = Arc::new(ScriptedExecutor::new());
        let boundary = ExecutionBoundary::start(executor, config());

        boundary.shutdown().await;
        assert_eq!(boundary.status().state, BoundaryState::Stopped);
        assert!(matches!(
            boundary.recommend(request("late")).await,
            Err(BoundaryError::Unavailable(_))
        ));
    }

    #[test]
    fn test_restart_delay_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(restart_delay(base, 1), Duration::from_millis(500));
        assert_eq!(restart_delay(base, 2), Duration::from_secs(1));
        assert_eq!(restart_delay(base, 3), Duration::from_secs(2));
    }
}
