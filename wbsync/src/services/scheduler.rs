//! Bounded concurrent fetch scheduler
//!
//! Every task runs on its own tokio task (the multi-threaded runtime gives
//! real parallelism); a semaphore caps how many are talking to the API at
//! once. A failing or panicking task only marks its own report as failed.

use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::models::FetchTask;
use crate::services::fetch_client::{FetchClient, FetchError};

/// Outcome of one fetch task
#[derive(Debug)]
pub struct TaskReport {
    pub task: FetchTask,
    pub result: Result<Vec<Value>, FetchError>,
    pub elapsed: Duration,
}

/// Runs fetch tasks with at most `concurrency_limit` in flight
pub struct Scheduler {
    client: Arc<FetchClient>,
    concurrency_limit: usize,
}

impl Scheduler {
    pub fn new(client: Arc<FetchClient>, concurrency_limit: usize) -> Self {
        Self {
            client,
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    /// Spawn every task; reports are read back in completion order
    pub fn spawn(&self, tasks: Vec<FetchTask>, cancel: CancellationToken) -> SchedulerRun {
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut join_set = JoinSet::new();

        tracing::info!(
            tasks = tasks.len(),
            concurrency_limit = self.concurrency_limit,
            "Scheduling fetch tasks"
        );

        for task in tasks {
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let started = Instant::now();
                let result = isolate_panics(&task, run_task(&client, &semaphore, &cancel, &task)).await;

                TaskReport {
                    task,
                    result,
                    elapsed: started.elapsed(),
                }
            });
        }

        SchedulerRun { join_set }
    }

    /// Run all tasks to completion and reduce reports by indicator
    ///
    /// An indicator is `Err` if any of its tasks failed (first error wins);
    /// otherwise it carries the records of all its tasks.
    pub async fn run(
        &self,
        tasks: Vec<FetchTask>,
        cancel: CancellationToken,
    ) -> HashMap<String, Result<Vec<Value>, FetchError>> {
        let mut results: HashMap<String, Result<Vec<Value>, FetchError>> = HashMap::new();
        let mut run = self.spawn(tasks, cancel);

        while let Some(report) = run.next_report().await {
            let entry = results
                .entry(report.task.indicator_code.clone())
                .or_insert_with(|| Ok(Vec::new()));

            match (entry, report.result) {
                (Ok(records), Ok(batch)) => records.extend(batch),
                (entry @ Ok(_), Err(err)) => *entry = Err(err),
                (Err(_), _) => {}
            }
        }

        results
    }
}

/// Turn a panic inside `fetch` into a failed report for its task
async fn isolate_panics<F>(task: &FetchTask, fetch: F) -> Result<Vec<Value>, FetchError>
where
    F: Future<Output = Result<Vec<Value>, FetchError>>,
{
    AssertUnwindSafe(fetch).catch_unwind().await.unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(task = %task, panic = %message, "Fetch task panicked");
        Err(FetchError::TaskPanicked(message))
    })
}

/// Wait for a permit, then fetch, abandoning either step on cancellation
async fn run_task(
    client: &FetchClient,
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
    task: &FetchTask,
) -> Result<Vec<Value>, FetchError> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        permit = Arc::clone(semaphore).acquire_owned() => {
            permit.map_err(|_| FetchError::Cancelled)?
        }
    };

    tracing::debug!(task = %task, "Fetch task started");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        result = client.fetch(&task.indicator_code, &task.countries, task.start_year, task.end_year) => result,
    }
}

/// Handle to a running batch of fetch tasks
pub struct SchedulerRun {
    join_set: JoinSet<TaskReport>,
}

impl SchedulerRun {
    /// Next finished task, or `None` once all have reported
    pub async fn next_report(&mut self) -> Option<TaskReport> {
        loop {
            match self.join_set.join_next().await? {
                Ok(report) => {
                    match &report.result {
                        Ok(records) => tracing::debug!(
                            task = %report.task,
                            records = records.len(),
                            elapsed_ms = report.elapsed.as_millis() as u64,
                            "Fetch task completed"
                        ),
                        Err(err) => tracing::warn!(
                            task = %report.task,
                            error = %err,
                            "Fetch task failed"
                        ),
                    }
                    return Some(report);
                }
                Err(join_err) => {
                    // Only reachable if the runtime aborted the task
                    tracing::error!(error = %join_err, "Fetch task aborted");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CountryCode;

    fn task() -> FetchTask {
        FetchTask {
            indicator_code: "X".to_string(),
            countries: vec![CountryCode::Code("USA".to_string())],
            start_year: 2020,
            end_year: 2020,
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_task_failure() {
        let result = isolate_panics(&task(), async {
            panic!("decoder exploded");
        })
        .await;

        match result {
            Err(FetchError::TaskPanicked(message)) => assert!(message.contains("decoder exploded")),
            other => panic!("expected TaskPanicked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_normal_result_passes_through() {
        let result = isolate_panics(&task(), async { Ok(vec![Value::Null]) }).await;
        assert_eq!(result.unwrap().len(), 1);
    }
}
