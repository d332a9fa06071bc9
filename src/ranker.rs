//! Priority resolution before a task enters the queue.
//!
//! Tasks that carry a priority keep it. Tasks that asked for ranking borrow an
//! instance from the pool, have their text classified and redacted, and then queue
//! with the driver-assigned tier. Everything else is NORMAL.

use crate::AppState;
use crate::driver::Ranking;
use crate::errors::DriverError;
use crate::pool::{Lease, ModelPool, Purpose};
use crate::task::{Priority, Task, TaskResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// A ranking pass that did not complete. The task must not be generated, since its
/// text could still contain PII.
#[derive(Debug)]
pub struct RankingFailed {
    pub task: Task,
    pub model_id: u32,
    pub error: DriverError,
}

impl RankingFailed {
    pub fn into_result(self) -> TaskResult {
        TaskResult::failure(&self.task, self.model_id, self.error)
    }
}

/// Resolve the priority of `task`, running the driver's ranking if requested.
pub async fn rank(pool: &Arc<ModelPool>, task: Task) -> Result<Task, RankingFailed> {
    if !task.needs_ranking() {
        return Ok(with_default_priority(task));
    }
    let lease = pool.acquire(Purpose::Rank).await;
    rank_on(&lease, task).await
}

fn with_default_priority(mut task: Task) -> Task {
    task.resolve_priority(Priority::Normal);
    task
}

async fn rank_on(lease: &Lease, mut task: Task) -> Result<Task, RankingFailed> {
    let model_id = lease.instance_id();
    match lease.rank_and_redact(task.text.clone()).await {
        Ok(Ranking { priority, redacted }) => {
            task.text = redacted;
            let priority = task.resolve_priority(priority);
            debug!(task_id = %task.id, model_id, %priority, "Ranked task");
            Ok(task)
        }
        Err(error) => {
            task.resolve_priority(Priority::Normal);
            Err(RankingFailed {
                task,
                model_id,
                error,
            })
        }
    }
}

/// Route an admitted task towards the queue.
///
/// Tasks that need ranking are handed to a background task so the caller (the
/// listener) never waits on pool capacity. Rankings still waiting for an instance
/// when the scheduler closes are given up, and every task that cannot be queued
/// gets a failure result.
pub fn hand_off(state: &Arc<AppState>, task: Task) {
    if !task.needs_ranking() {
        if let Err(task) = state.scheduler.enqueue(with_default_priority(task)) {
            state.fail_on_shutdown(task, 0);
        }
        return;
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let lease = tokio::select! {
            lease = state.pool.acquire(Purpose::Rank) => lease,
            _ = state.scheduler.closed() => {
                state.fail_on_shutdown(with_default_priority(task), 0);
                return;
            }
        };
        let model_id = lease.instance_id();
        match rank_on(&lease, task).await {
            Ok(task) => {
                // queued before the instance frees up, so a dispatch triggered by the
                // release already sees this task
                let refused = state.scheduler.enqueue(task).err();
                drop(lease);
                if let Some(task) = refused {
                    state.fail_on_shutdown(task, model_id);
                }
            }
            Err(failed) => {
                drop(lease);
                warn!(
                    task_id = %failed.task.id,
                    model_id = failed.model_id,
                    error = %failed.error,
                    "Ranking failed, task will not be generated"
                );
                let callback = failed.task.callback.clone();
                state.complete(callback, failed.into_result());
                state.scheduler.abandon();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ModelHandle;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct FixedRanker {
        outcome: Result<Ranking, DriverError>,
    }

    impl ModelHandle for FixedRanker {
        fn generate(&mut self, _text: &str, _max_tokens: Option<u32>) -> Result<String, DriverError> {
            Ok("{}".to_string())
        }

        fn rank_and_redact(&mut self, _text: &str) -> Result<Ranking, DriverError> {
            self.outcome.clone()
        }
    }

    fn pool(outcome: Result<Ranking, DriverError>) -> Arc<ModelPool> {
        let handle: Box<dyn ModelHandle> = Box::new(FixedRanker { outcome });
        Arc::new(ModelPool::from_handles("test", vec![(PathBuf::from("m"), handle)]).unwrap())
    }

    fn task(ranked: bool, priority: Option<Priority>) -> Task {
        Task::builder()
            .id(Uuid::new_v4())
            .text("Email jane@example.com, the site is down")
            .callback("/tmp/cb.sock".parse().unwrap())
            .ranked(ranked)
            .maybe_priority(priority)
            .build()
    }

    fn critical() -> Result<Ranking, DriverError> {
        Ok(Ranking {
            priority: Priority::Critical,
            redacted: "Email [EMAIL], the site is down".to_string(),
        })
    }

    #[tokio::test]
    async fn test_explicit_priority_is_kept_and_text_untouched() {
        let pool = pool(critical());
        let ranked = rank(&pool, task(true, Some(Priority::Low))).await.unwrap();
        assert_eq!(ranked.priority(), Some(Priority::Low));
        assert!(ranked.text.contains("jane@example.com"));
        assert_eq!(pool.stats().acquisitions, 0);
    }

    #[tokio::test]
    async fn test_unranked_defaults_to_normal() {
        let pool = pool(critical());
        let ranked = rank(&pool, task(false, None)).await.unwrap();
        assert_eq!(ranked.priority(), Some(Priority::Normal));
        assert_eq!(pool.stats().acquisitions, 0);
    }

    #[tokio::test]
    async fn test_ranking_replaces_text_and_releases_instance() {
        let pool = pool(critical());
        let ranked = rank(&pool, task(true, None)).await.unwrap();
        assert_eq!(ranked.priority(), Some(Priority::Critical));
        assert_eq!(ranked.text, "Email [EMAIL], the site is down");

        let stats = pool.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.busy, 0);
    }

    #[tokio::test]
    async fn test_ranking_failure_is_reported_as_normal_failure() {
        let pool = pool(Err(DriverError::Rank("model crashed".to_string())));
        let failed = rank(&pool, task(true, None)).await.unwrap_err();
        assert_eq!(failed.model_id, 1);
        assert_eq!(pool.stats().busy, 0);

        let result = failed.into_result();
        assert_eq!(result.priority, Priority::Normal);
        assert_eq!(result.error.as_deref(), Some("ranking failed: model crashed"));
        assert!(result.tool_input_json.is_empty());
    }
}
