//! Granville - a local inference daemon
//!
//! Callers submit generation tasks over a Unix socket. Each task is acknowledged
//! straight away, optionally ranked and redacted by a model, queued by urgency and
//! generated on the first idle model instance; the result is pushed to a callback
//! socket named in the request.
//!
//! The pieces, in the order a task meets them: [`listener`], [`ranker`],
//! [`scheduler`], [`pool`] and [`dispatcher`]. [`Server`] wires them together.

use bon::Builder;
use dashmap::DashSet;
use futures_util::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub mod dispatcher;
pub mod driver;
pub mod errors;
pub mod listener;
pub mod pool;
pub mod protocol;
pub mod ranker;
pub mod scheduler;
pub mod task;

use dispatcher::{CallbackClient, Delivery, DispatchStats, Dispatcher, RetryPolicy};
use errors::{AdmissionError, DaemonError};
use pool::{ModelPool, PoolStats};
use scheduler::{Scheduler, SchedulerStats};
use task::{CallbackAddr, Task, TaskResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/granville.sock";

/// Runtime settings for a serving daemon.
#[derive(Debug, Clone, Builder)]
pub struct ServeConfig {
    #[builder(into, default = PathBuf::from(DEFAULT_SOCKET_PATH))]
    pub socket_path: PathBuf,
    /// Maximum number of admitted, undispatched tasks. Unbounded when `None`.
    pub queue_capacity: Option<usize>,
    #[builder(default = Duration::from_secs(5))]
    pub callback_timeout: Duration,
    #[builder(default = 2)]
    pub callback_retries: u32,
    #[builder(default = Duration::from_millis(100))]
    pub callback_backoff: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub read_timeout: Duration,
    #[builder(default = protocol::DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.callback_retries,
            backoff: self.callback_backoff,
        }
    }

    /// Longest a single result can spend in delivery, across all attempts.
    pub fn delivery_budget(&self) -> Duration {
        let attempts = self.callback_retries.saturating_add(1);
        let backoff_steps = attempts.saturating_mul(attempts - 1) / 2;
        self.callback_timeout
            .saturating_mul(attempts)
            .saturating_add(self.callback_backoff.saturating_mul(backoff_steps))
    }
}

/// Everything the daemon's tasks share. Built once at startup and passed around
/// behind an `Arc`.
#[derive(Debug)]
pub struct AppState {
    pub config: ServeConfig,
    pub pool: Arc<ModelPool>,
    pub scheduler: Scheduler,
    pub dispatcher: Dispatcher,
    live: DashSet<Uuid>,
}

impl AppState {
    /// Create a new AppState delivering results over sockets.
    /// Must be called inside a tokio runtime.
    pub fn new(config: ServeConfig, pool: Arc<ModelPool>) -> Self {
        let dispatcher = Dispatcher::new(config.callback_timeout, config.retry_policy());
        Self::with_dispatcher(config, pool, dispatcher)
    }

    /// Create a new AppState with a custom callback client (useful for testing)
    pub fn with_client(
        config: ServeConfig,
        pool: Arc<ModelPool>,
        client: Arc<dyn CallbackClient>,
    ) -> Self {
        let dispatcher = Dispatcher::with_client(client, config.retry_policy());
        Self::with_dispatcher(config, pool, dispatcher)
    }

    fn with_dispatcher(config: ServeConfig, pool: Arc<ModelPool>, dispatcher: Dispatcher) -> Self {
        Self {
            scheduler: Scheduler::new(config.queue_capacity),
            config,
            pool,
            dispatcher,
            live: DashSet::new(),
        }
    }

    /// Whether a task with this id has been accepted and has no result yet.
    pub fn is_live(&self, id: &Uuid) -> bool {
        self.live.contains(id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Returns `false` if the id is already live.
    pub(crate) fn register(&self, id: Uuid) -> bool {
        self.live.insert(id)
    }

    pub(crate) fn unregister(&self, id: &Uuid) {
        self.live.remove(id);
    }

    /// Retire a task: its id becomes reusable and its result goes to the dispatcher.
    pub fn complete(&self, callback: CallbackAddr, result: TaskResult) {
        self.unregister(&result.id);
        self.dispatcher.submit(Delivery { callback, result });
    }

    /// Answer a task that will not be generated because the daemon is stopping, then
    /// give back its queue slot. `model_id` is 0 when no instance touched the task.
    pub fn fail_on_shutdown(&self, task: Task, model_id: u32) {
        debug!(task_id = %task.id, "Failing task on shutdown");
        let result = TaskResult::failure(&task, model_id, AdmissionError::ShuttingDown);
        self.complete(task.callback, result);
        self.scheduler.abandon();
    }
}

/// A running daemon: the admission listener and the dispatch loop.
#[derive(Debug)]
pub struct Server {
    state: Arc<AppState>,
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the admission socket and start serving.
    #[instrument(skip_all, fields(socket = %state.config.socket_path.display()))]
    pub async fn start(state: Arc<AppState>) -> Result<Self, DaemonError> {
        let socket_path = state.config.socket_path.clone();
        let listener = listener::bind(&socket_path)?;
        let (shutdown, rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(listener::run(
                listener,
                socket_path.clone(),
                Arc::clone(&state),
                rx.clone(),
            )),
            tokio::spawn(scheduler::run_dispatch_loop(Arc::clone(&state), rx)),
        ];

        info!(
            instances = state.pool.len(),
            queue_capacity = ?state.config.queue_capacity,
            "Granville listening on {}",
            socket_path.display()
        );
        Ok(Self {
            state,
            socket_path,
            shutdown,
            tasks,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.state.pool.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.state.scheduler.stats()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.state.dispatcher.stats()
    }

    /// Stop accepting tasks, let running generations finish, unload every model and
    /// give outstanding callbacks a bounded time to go out.
    ///
    /// Tasks still queued, and rankings still waiting for an instance, are answered
    /// with a "daemon is shutting down" failure. Rankings already running finish
    /// first and are answered the same way.
    #[instrument(skip_all)]
    pub async fn shutdown(self) {
        info!("Shutting down");
        let _ = self.shutdown.send(true);
        for joined in join_all(self.tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "Server task failed");
            }
        }

        let stranded = self.state.scheduler.close();
        if !stranded.is_empty() {
            warn!(stranded = stranded.len(), "Failing queued tasks");
        }
        for task in stranded {
            self.state.fail_on_shutdown(task, 0);
        }
        self.state.scheduler.settled().await;

        self.state.pool.shutdown().await;
        if !self
            .state
            .dispatcher
            .flush(self.state.config.delivery_budget())
            .await
        {
            warn!(
                pending = self.state.dispatcher.stats().pending,
                "Shut down with undelivered results"
            );
        }
        info!("Shutdown complete");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;
    use test_utils::MockCallbackClient;

    #[test]
    fn test_default_config() {
        let config = ServeConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/granville.sock"));
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.callback_retries, 2);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_delivery_budget_covers_every_attempt() {
        let config = ServeConfig::builder()
            .callback_timeout(Duration::from_millis(50))
            .callback_retries(2)
            .callback_backoff(Duration::from_millis(10))
            .build();
        // three timeouts plus 10ms and 20ms of backoff
        assert_eq!(config.delivery_budget(), Duration::from_millis(180));
    }

    #[test]
    fn test_delivery_budget_saturates() {
        let config = ServeConfig::builder().callback_retries(u32::MAX).build();
        assert!(config.delivery_budget() > Duration::from_secs(u64::from(u32::MAX)));
    }

    #[tokio::test]
    async fn test_complete_frees_id_and_delivers() {
        let client = MockCallbackClient::new();
        let state = test_utils::test_state(None);
        let state = AppState::with_client(
            state.config.clone(),
            Arc::clone(&state.pool),
            Arc::new(client.clone()),
        );

        let mut task = Task::builder()
            .id(Uuid::new_v4())
            .text("hi")
            .callback("/tmp/cb.sock".parse().unwrap())
            .build();
        task.resolve_priority(Priority::Low);
        assert!(state.register(task.id));
        assert!(!state.register(task.id));

        state.complete(
            task.callback.clone(),
            TaskResult::success(&task, 1, "{}".to_string()),
        );
        assert!(!state.is_live(&task.id));
        assert!(state.dispatcher.flush(Duration::from_secs(1)).await);

        let sent = client.get_deliveries();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.id, task.id.to_string());
        assert_eq!(sent[0].1.priority, "LOW");
    }
}
