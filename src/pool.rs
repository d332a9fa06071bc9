//! Pool of loaded model instances
//!
//! Every instance runs its handle on a dedicated OS thread, so a slow generation on
//! one model never holds up another. Claiming an instance is a compare-and-set on its
//! `busy` flag, scanned in ascending id order: the lowest idle id always wins and no
//! two callers can ever claim the same instance. Claims are handed out as [`Lease`]s
//! that release the instance when dropped.

use crate::driver::{Driver, ModelHandle, Ranking};
use crate::errors::{DaemonError, DriverError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::sync::futures::Notified;
use tracing::{debug, error, info, warn};

/// What an instance is being claimed for.
///
/// Ranking is short and decides queue order, so pending ranking claims are served
/// before any new generation claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Rank,
    Generate,
}

enum Job {
    Generate {
        text: String,
        max_tokens: Option<u32>,
        reply: oneshot::Sender<Result<String, DriverError>>,
    },
    Rank {
        text: String,
        reply: oneshot::Sender<Result<Ranking, DriverError>>,
    },
    Shutdown,
}

/// A single loaded model and the channel to its worker thread.
#[derive(Debug)]
pub struct ModelInstance {
    id: u32,
    driver: String,
    model_path: PathBuf,
    busy: AtomicBool,
    jobs: mpsc::UnboundedSender<Job>,
}

impl ModelInstance {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn submit(&self, job: Job) -> Result<(), DriverError> {
        self.jobs.send(job).map_err(|_| DriverError::WorkerGone(self.id))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Generate { .. } => f.write_str("Generate"),
            Job::Rank { .. } => f.write_str("Rank"),
            Job::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub instances: usize,
    pub busy: usize,
    pub acquisitions: u64,
    pub releases: u64,
}

/// Owns every loaded model instance.
#[derive(Debug)]
pub struct ModelPool {
    instances: Vec<ModelInstance>,
    available: Notify,
    rank_waiters: AtomicUsize,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ModelPool {
    /// Load one instance per path with `driver`.
    ///
    /// Paths that fail to load are logged and skipped; the pool only fails when
    /// nothing loads at all. Loading blocks, so call this off the async runtime.
    pub fn load(driver: &dyn Driver, paths: &[PathBuf]) -> Result<Self, DaemonError> {
        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            match driver.load(path) {
                Ok(handle) => {
                    info!(driver = driver.name(), path = %path.display(), "Loaded model");
                    handles.push((path.clone(), handle));
                }
                Err(e) => warn!(driver = driver.name(), error = %e, "Skipping model"),
            }
        }
        Self::from_handles(driver.name(), handles)
    }

    /// Build a pool from already loaded handles, numbering instances from 1.
    pub fn from_handles(
        driver: &str,
        handles: Vec<(PathBuf, Box<dyn ModelHandle>)>,
    ) -> Result<Self, DaemonError> {
        if handles.is_empty() {
            return Err(DaemonError::NoModelsLoaded);
        }

        let mut instances = Vec::with_capacity(handles.len());
        let mut workers = Vec::with_capacity(handles.len());
        for (id, (model_path, handle)) in (1u32..).zip(handles) {
            let (jobs, rx) = mpsc::unbounded_channel();
            let worker = std::thread::Builder::new()
                .name(format!("model-{id}"))
                .spawn(move || run_worker(id, handle, rx))
                .map_err(|source| DaemonError::Worker { id, source })?;

            instances.push(ModelInstance {
                id,
                driver: driver.to_string(),
                model_path,
                busy: AtomicBool::new(false),
                jobs,
            });
            workers.push(worker);
        }

        info!(instances = instances.len(), driver, "Model pool ready");
        Ok(Self {
            instances,
            available: Notify::new(),
            rank_waiters: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            workers: Mutex::new(workers),
        })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[ModelInstance] {
        &self.instances
    }

    pub fn instance(&self, instance_id: u32) -> Option<&ModelInstance> {
        let index = usize::try_from(instance_id).ok()?.checked_sub(1)?;
        self.instances.get(index)
    }

    pub fn idle_count(&self) -> usize {
        self.instances.iter().filter(|i| !i.is_busy()).count()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            instances: self.instances.len(),
            busy: self.instances.len() - self.idle_count(),
            acquisitions: self.acquisitions.load(Ordering::SeqCst),
            releases: self.releases.load(Ordering::SeqCst),
        }
    }

    /// Number of ranking claims currently waiting for an instance.
    pub fn rank_waiters(&self) -> usize {
        self.rank_waiters.load(Ordering::SeqCst)
    }

    /// Claim the lowest-numbered idle instance, if any.
    pub fn acquire_idle(self: &Arc<Self>) -> Option<Lease> {
        let index = self.instances.iter().position(|instance| {
            instance
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })?;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        debug!(model_id = self.instances[index].id, "Acquired model instance");
        Some(Lease {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Like [`acquire_idle`](Self::acquire_idle), but generation claims back off
    /// while any ranking claim is waiting.
    pub fn try_acquire(self: &Arc<Self>, purpose: Purpose) -> Option<Lease> {
        if purpose == Purpose::Generate && self.rank_waiters() > 0 {
            return None;
        }
        self.acquire_idle()
    }

    /// Wait until an instance can be claimed for `purpose`.
    pub async fn acquire(self: &Arc<Self>, purpose: Purpose) -> Lease {
        let _waiting = (purpose == Purpose::Rank).then(|| RankWaiter::register(self));
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(purpose) {
                return lease;
            }
            notified.await;
        }
    }

    /// Mark an instance idle and wake everything waiting for capacity.
    ///
    /// Returns `false` if the instance was already idle or does not exist.
    pub fn release(&self, instance_id: u32) -> bool {
        let Some(instance) = self.instance(instance_id) else {
            return false;
        };
        if !instance.busy.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        debug!(model_id = instance_id, "Released model instance");
        self.available.notify_waiters();
        true
    }

    /// A future that resolves the next time capacity may have become available.
    /// Call `enable` on it before checking state to avoid missing a wake-up.
    pub fn capacity_changed(&self) -> Notified<'_> {
        self.available.notified()
    }

    /// Stop every worker after it finishes the jobs already sent to it, unload the
    /// handles and join the threads.
    pub async fn shutdown(&self) {
        for instance in &self.instances {
            let _ = instance.submit(Job::Shutdown);
        }

        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if workers.is_empty() {
            return;
        }

        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    error!("Model worker panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            error!(error = %e, "Failed to join model workers");
        }
        info!("Model pool shut down");
    }
}

impl Drop for ModelPool {
    fn drop(&mut self) {
        for instance in &self.instances {
            let _ = instance.submit(Job::Shutdown);
        }
    }
}

/// Counts a pending ranking claim for as long as it is alive.
struct RankWaiter<'a> {
    pool: &'a ModelPool,
}

impl<'a> RankWaiter<'a> {
    fn register(pool: &'a ModelPool) -> Self {
        pool.rank_waiters.fetch_add(1, Ordering::SeqCst);
        Self { pool }
    }
}

impl Drop for RankWaiter<'_> {
    fn drop(&mut self) {
        if self.pool.rank_waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            // generation claims were held back; let them look again
            self.pool.available.notify_waiters();
        }
    }
}

/// Exclusive use of one instance. Dropping the lease releases it exactly once.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<ModelPool>,
    index: usize,
}

impl Lease {
    pub fn instance(&self) -> &ModelInstance {
        &self.pool.instances[self.index]
    }

    pub fn instance_id(&self) -> u32 {
        self.instance().id
    }

    /// Run a generation on this instance's worker thread.
    pub async fn generate(
        &self,
        text: String,
        max_tokens: Option<u32>,
    ) -> Result<String, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.instance().submit(Job::Generate {
            text,
            max_tokens,
            reply,
        })?;
        rx.await
            .map_err(|_| DriverError::WorkerGone(self.instance_id()))?
    }

    /// Run a ranking pass on this instance's worker thread.
    pub async fn rank_and_redact(&self, text: String) -> Result<Ranking, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.instance().submit(Job::Rank { text, reply })?;
        rx.await
            .map_err(|_| DriverError::WorkerGone(self.instance_id()))?
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let id = self.instance_id();
        self.pool.release(id);
    }
}

fn run_worker(id: u32, mut handle: Box<dyn ModelHandle>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    debug!(model_id = id, "Model worker started");
    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Generate {
                text,
                max_tokens,
                reply,
            } => {
                let _ = reply.send(handle.generate(&text, max_tokens));
            }
            Job::Rank { text, reply } => {
                let _ = reply.send(handle.rank_and_redact(&text));
            }
            Job::Shutdown => break,
        }
    }
    handle.unload();
    debug!(model_id = id, "Model worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::time::Duration;

    /// Reports which thread ran it, so tests can check where work happens.
    struct ThreadEcho {
        unloaded: Arc<AtomicBool>,
    }

    impl ModelHandle for ThreadEcho {
        fn generate(&mut self, text: &str, _max_tokens: Option<u32>) -> Result<String, DriverError> {
            let thread = std::thread::current();
            Ok(format!("{}:{}", thread.name().unwrap_or("?"), text))
        }

        fn rank_and_redact(&mut self, text: &str) -> Result<Ranking, DriverError> {
            Ok(Ranking {
                priority: crate::task::Priority::High,
                redacted: text.to_uppercase(),
            })
        }

        fn unload(&mut self) {
            self.unloaded.store(true, Ordering::SeqCst);
        }
    }

    fn pool_of(n: usize) -> (Arc<ModelPool>, Vec<Arc<AtomicBool>>) {
        let flags: Vec<_> = (0..n).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let handles = flags
            .iter()
            .enumerate()
            .map(|(i, flag)| {
                (
                    PathBuf::from(format!("model-{i}.gguf")),
                    Box::new(ThreadEcho {
                        unloaded: Arc::clone(flag),
                    }) as Box<dyn ModelHandle>,
                )
            })
            .collect();
        let pool = ModelPool::from_handles("test", handles).unwrap();
        (Arc::new(pool), flags)
    }

    #[test]
    fn test_empty_pool_is_fatal() {
        let err = ModelPool::from_handles("test", Vec::new()).unwrap_err();
        assert!(matches!(err, DaemonError::NoModelsLoaded));
    }

    #[test]
    fn test_load_skips_failed_paths() {
        let err = ModelPool::load(
            &crate::driver::RulesDriver,
            &[PathBuf::from("/nonexistent/a.gguf")],
        )
        .unwrap_err();
        assert!(matches!(err, DaemonError::NoModelsLoaded));

        let file = tempfile::NamedTempFile::new().unwrap();
        let pool = ModelPool::load(
            &crate::driver::RulesDriver,
            &[
                PathBuf::from("/nonexistent/a.gguf"),
                file.path().to_path_buf(),
            ],
        )
        .unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.instances()[0].id(), 1);
        assert_eq!(pool.instances()[0].model_path(), file.path());
        assert_eq!(pool.instances()[0].driver(), "rules");
    }

    #[test]
    fn test_acquire_prefers_lowest_idle_id() {
        let (pool, _) = pool_of(3);

        let first = pool.acquire_idle().unwrap();
        let second = pool.acquire_idle().unwrap();
        assert_eq!(first.instance_id(), 1);
        assert_eq!(second.instance_id(), 2);

        drop(first);
        let again = pool.acquire_idle().unwrap();
        assert_eq!(again.instance_id(), 1);

        let third = pool.acquire_idle().unwrap();
        assert_eq!(third.instance_id(), 3);
        assert!(pool.acquire_idle().is_none());
    }

    #[test]
    fn test_concurrent_acquire_never_shares_an_instance() {
        let (pool, _) = pool_of(4);
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let claimed = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                let claimed = Arc::clone(&claimed);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        if let Some(lease) = pool.acquire_idle() {
                            let id = lease.instance_id();
                            assert!(
                                claimed.lock().unwrap().insert(id),
                                "instance {id} handed out twice"
                            );
                            std::thread::yield_now();
                            assert!(claimed.lock().unwrap().remove(&id));
                            drop(lease);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("acquiring thread panicked");
        }

        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.acquisitions, stats.releases);
        assert!(stats.acquisitions > 0);
    }

    #[test]
    fn test_release_happens_exactly_once() {
        let (pool, _) = pool_of(1);
        let lease = pool.acquire_idle().unwrap();
        assert!(pool.instance(1).unwrap().is_busy());

        drop(lease);
        assert!(!pool.instance(1).unwrap().is_busy());
        assert!(!pool.release(1), "second release must be a no-op");
        assert!(!pool.release(99));

        let stats = pool.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.releases, 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let (pool, _) = pool_of(1);
        let held = pool.acquire_idle().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Purpose::Generate).await.instance_id() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_pending_rank_blocks_generation_claims() {
        let (pool, _) = pool_of(1);
        let held = pool.acquire_idle().unwrap();

        let ranker = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.acquire(Purpose::Rank).await;
                lease.instance_id()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.rank_waiters(), 1);

        drop(held);
        assert!(pool.try_acquire(Purpose::Generate).is_none());

        assert_eq!(ranker.await.unwrap(), 1);
        assert_eq!(pool.rank_waiters(), 0);
        assert!(pool.try_acquire(Purpose::Generate).is_some());
    }

    #[tokio::test]
    async fn test_work_runs_on_the_instance_thread() {
        let (pool, _) = pool_of(2);
        let first = pool.acquire_idle().unwrap();
        let second = pool.acquire_idle().unwrap();

        let (a, b) = tokio::join!(
            first.generate("a".to_string(), None),
            second.generate("b".to_string(), None)
        );
        assert_eq!(a.unwrap(), "model-1:a");
        assert_eq!(b.unwrap(), "model-2:b");

        let ranking = first.rank_and_redact("quiet".to_string()).await.unwrap();
        assert_eq!(ranking.redacted, "QUIET");
    }

    #[tokio::test]
    async fn test_shutdown_unloads_every_handle() {
        let (pool, flags) = pool_of(2);
        pool.shutdown().await;
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));

        let lease = pool.acquire_idle().unwrap();
        let err = lease.generate("late".to_string(), None).await.unwrap_err();
        assert_eq!(err, DriverError::WorkerGone(1));
    }
}
