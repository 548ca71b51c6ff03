//! Worker pool: consumes submissions from the Redis task queue, runs the
//! judging pipeline against the sandbox, and publishes progress and final
//! results on the result queue.
//!
//! Each worker owns its sandbox client and one persistent default checker,
//! so no cross-worker synchronization is needed beyond the queue itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checker::{Checker, DefaultChecker, TestlibChecker};
use crate::config::{self, Config};
use crate::judger::{Judger, ProblemType, Submission, SubmissionResult};
use crate::sandbox::SandboxClient;

/// Fixed-size pool of judge workers.
pub struct Scheduler {
    redis_url: String,
    sandbox_endpoint: String,
    init_concurrent: usize,
    is_running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        debug!(
            "Scheduler initialized with redis_url={}, sandbox_endpoint={}, init_concurrent={}",
            config.redis_url, config.sandbox_endpoint, config.init_concurrent
        );
        Self {
            redis_url: config.redis_url.clone(),
            sandbox_endpoint: config.sandbox_endpoint.clone(),
            init_concurrent: config.init_concurrent,
            is_running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Open the shared Redis client and spawn the workers.
    pub fn start(&mut self) -> Result<()> {
        debug!("Scheduler starting...");
        let redis_client =
            redis::Client::open(self.redis_url.as_str()).context("Failed to create Redis client")?;

        self.is_running.store(true, Ordering::SeqCst);
        self.workers = (0..self.init_concurrent)
            .map(|idx| {
                let redis_client = redis_client.clone();
                let endpoint = self.sandbox_endpoint.clone();
                let is_running = Arc::clone(&self.is_running);
                tokio::spawn(worker(idx, redis_client, endpoint, is_running))
            })
            .collect();
        info!("Scheduler started with {} worker(s)", self.init_concurrent);
        Ok(())
    }

    /// Wait for every worker to finish.
    pub async fn wait(&mut self) {
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
    }

    /// Request a graceful stop and join the workers. The submission
    /// currently in flight on each worker runs to completion; the blocking
    /// pop times out within five seconds.
    pub async fn stop(&mut self) {
        debug!("Scheduler stopping...");
        self.is_running.store(false, Ordering::SeqCst);
        self.wait().await;
        info!("Scheduler stopped");
    }
}

async fn worker(
    idx: usize,
    redis_client: redis::Client,
    sandbox_endpoint: String,
    is_running: Arc<AtomicBool>,
) {
    debug!("Worker {} started", idx);

    let sandbox = SandboxClient::new(&sandbox_endpoint);
    let mut default_checker = DefaultChecker::new();
    let mut conn = match connect_with_retry(&redis_client, &is_running).await {
        Some(conn) => conn,
        None => return,
    };

    while is_running.load(Ordering::SeqCst) {
        let submission = match pop_submission(&mut conn).await {
            Ok(Some(submission)) => submission,
            Ok(None) => continue,
            Err(e) => {
                warn!("Worker {}: Redis pop failed: {}. Reconnecting...", idx, e);
                match connect_with_retry(&redis_client, &is_running).await {
                    Some(new_conn) => conn = new_conn,
                    None => break,
                }
                continue;
            }
        };

        let sid = submission.sid;
        debug!("Worker {} processing submission {}", idx, sid);
        if let Err(e) = push_result(&mut conn, &SubmissionResult::running(sid)).await {
            error!(
                "Worker {}: failed to publish progress for submission {}: {}",
                idx, sid, e
            );
        }

        let result = judge_submission(&sandbox, &mut default_checker, submission).await;
        info!(
            "Worker {} finished submission {} with result {}",
            idx, sid, result.judge
        );
        if let Err(e) = push_result(&mut conn, &result).await {
            error!(
                "Worker {}: failed to publish result for submission {}: {}",
                idx, sid, e
            );
        }
    }

    default_checker.close(&sandbox).await;
    sandbox.close().await;
    debug!("Worker {} stopped", idx);
}

/// Run one submission through the pipeline with the checker its problem
/// type calls for. Traditional submissions reuse the worker's persistent
/// default checker; the others get a testlib checker compiled from the
/// submission's addition code, closed when the submission is done.
async fn judge_submission(
    sandbox: &SandboxClient,
    default_checker: &mut DefaultChecker,
    submission: Submission,
) -> SubmissionResult {
    match submission.problem_type {
        ProblemType::Traditional => {
            Judger::new(sandbox, submission, default_checker)
                .get_result()
                .await
        }
        _ => {
            let mut checker = TestlibChecker::new(submission.addition_code.clone());
            let result = Judger::new(sandbox, submission, &mut checker)
                .get_result()
                .await;
            checker.close(sandbox).await;
            result
        }
    }
}

/// Block on the task queue; `None` on timeout or an unparseable payload.
async fn pop_submission(
    conn: &mut MultiplexedConnection,
) -> redis::RedisResult<Option<Submission>> {
    let popped: Option<(String, String)> = conn
        .blpop(config::TASK_QUEUE, config::BLPOP_TIMEOUT_SECS)
        .await?;
    let Some((_, payload)) = popped else {
        return Ok(None);
    };
    debug!("Popped submission payload ({} bytes)", payload.len());
    match serde_json::from_str::<Submission>(&payload) {
        Ok(submission) => Ok(Some(submission)),
        Err(e) => {
            warn!("Failed to parse submission payload: {}. Data: {}", e, payload);
            Ok(None)
        }
    }
}

async fn push_result(conn: &mut MultiplexedConnection, result: &SubmissionResult) -> Result<()> {
    let payload = serde_json::to_string(result)?;
    debug!("Pushing result for submission {}", result.sid);
    conn.rpush::<_, _, ()>(config::RESULT_QUEUE, payload)
        .await
        .context("Failed to push result")?;
    Ok(())
}

/// Get a Redis connection, retrying until connected or the pool stops.
async fn connect_with_retry(
    client: &redis::Client,
    is_running: &AtomicBool,
) -> Option<MultiplexedConnection> {
    while is_running.load(Ordering::SeqCst) {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Some(conn),
            Err(e) => {
                warn!("Failed to connect to Redis: {}. Retrying in 3 seconds...", e);
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
    None
}
