//! Callback delivery
//!
//! Results are handed over through an unbounded channel, so producers (generation
//! tasks, the ranker) never block on a slow or absent caller. Each result gets its own
//! delivery task with a fresh connection, a per-attempt timeout and a bounded number
//! of retries. Delivery is best-effort: a result that cannot be delivered is logged
//! and dropped.
use crate::errors::DeliveryError;
use crate::protocol::{self, ResultMessage};
use crate::task::{CallbackAddr, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

/// Transport used to push an encoded result to a callback destination.
#[async_trait]
pub trait CallbackClient: std::fmt::Debug + Send + Sync {
    async fn deliver(&self, addr: &CallbackAddr, payload: &[u8]) -> Result<(), DeliveryError>;
}

/// Connects to the destination socket, writes the payload and closes.
#[derive(Debug, Clone)]
pub struct SocketClient {
    timeout: Duration,
}

impl SocketClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CallbackClient for SocketClient {
    async fn deliver(&self, addr: &CallbackAddr, payload: &[u8]) -> Result<(), DeliveryError> {
        let attempt = async {
            match addr {
                CallbackAddr::Unix(path) => {
                    let stream = UnixStream::connect(path)
                        .await
                        .map_err(|source| DeliveryError::Connect {
                            addr: addr.to_string(),
                            source,
                        })?;
                    send(stream, addr, payload).await
                }
                CallbackAddr::Tcp(host) => {
                    let stream = TcpStream::connect(host.as_str()).await.map_err(|source| {
                        DeliveryError::Connect {
                            addr: addr.to_string(),
                            source,
                        }
                    })?;
                    send(stream, addr, payload).await
                }
            }
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| DeliveryError::Timeout {
                addr: addr.to_string(),
                timeout: self.timeout,
            })?
    }
}

async fn send<S>(mut stream: S, addr: &CallbackAddr, payload: &[u8]) -> Result<(), DeliveryError>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(payload).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    write.await.map_err(|source| DeliveryError::Write {
        addr: addr.to_string(),
        source,
    })
}

/// A result paired with where it has to go.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub callback: CallbackAddr,
    pub result: TaskResult,
}

/// Retry behaviour for a single delivery.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first one fails.
    pub retries: u32,
    /// Base delay; attempt `n` waits `backoff * n` before retrying.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

/// Snapshot of delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub pending: usize,
    pub delivered: u64,
    pub failed: u64,
}

/// Handle for submitting results. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Dispatcher delivering over Unix and TCP sockets. Must be called inside a
    /// tokio runtime.
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Self {
        Self::with_client(Arc::new(SocketClient::new(timeout)), policy)
    }

    /// Dispatcher with a custom transport (useful for testing).
    pub fn with_client(client: Arc<dyn CallbackClient>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(run(rx, client, policy, Arc::clone(&counters)));
        Self { tx, counters }
    }

    /// Queue a result for delivery. Never blocks; returns `false` only if the
    /// delivery loop has stopped.
    pub fn submit(&self, delivery: Delivery) -> bool {
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        match self.tx.send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::SendError(delivery)) => {
                warn!(task_id = %delivery.result.id, "Delivery loop stopped, dropping result");
                PendingGuard(self.counters.as_ref()).failed();
                false
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            pending: self.counters.pending.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Wait until every submitted result has been delivered or given up on.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let idle = self.counters.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.counters.pending.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Settles one pending delivery exactly once.
struct PendingGuard<'a>(&'a Counters);

impl PendingGuard<'_> {
    fn delivered(self) {
        self.0.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn failed(self) {
        self.0.failed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    client: Arc<dyn CallbackClient>,
    policy: RetryPolicy,
    counters: Arc<Counters>,
) {
    while let Some(delivery) = rx.recv().await {
        let client = Arc::clone(&client);
        let counters = Arc::clone(&counters);
        tokio::spawn(async move {
            deliver(client.as_ref(), policy, &counters, delivery).await;
        });
    }
    info!("Delivery loop stopped");
}

async fn deliver(
    client: &dyn CallbackClient,
    policy: RetryPolicy,
    counters: &Counters,
    delivery: Delivery,
) {
    let guard = PendingGuard(counters);
    let id = delivery.result.id;

    let payload = match protocol::encode(&ResultMessage::from(&delivery.result)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(task_id = %id, error = %DeliveryError::from(e), "Dropping result");
            guard.failed();
            return;
        }
    };

    let mut last_error = None;
    for attempt in 0..=policy.retries {
        if attempt > 0 {
            tokio::time::sleep(policy.backoff.saturating_mul(attempt)).await;
        }
        match client.deliver(&delivery.callback, &payload).await {
            Ok(()) => {
                debug!(task_id = %id, callback = %delivery.callback, attempt, "Delivered result");
                guard.delivered();
                return;
            }
            Err(e) => {
                debug!(task_id = %id, attempt, error = %e, "Delivery attempt failed");
                last_error = Some(e);
            }
        }
    }

    warn!(
        task_id = %id,
        callback = %delivery.callback,
        attempts = policy.retries.saturating_add(1),
        error = %last_error.map(|e| e.to_string()).unwrap_or_default(),
        "Giving up on result delivery"
    );
    guard.failed();
}
