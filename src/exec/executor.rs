use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SqlFlowError};
use crate::exec::watermark::WatermarkValue;
use crate::exec::{export, modes, source, StepContext};
use crate::plan::{ExecutionPlan, ExecutionStep, StepType};
use crate::state::{RunStatus, TaskCommit, TaskState, TaskStatusRecord, WatermarkUpdate};

/// Tuning knobs for one run.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum concurrently running tasks. Defaults to the core count.
    pub max_parallelism: usize,
    /// Attempt budget per task per session (1 = no retries).
    pub max_attempts: u32,
    /// Wall-clock limit per attempt; the engine future is dropped on expiry.
    pub task_timeout: Option<Duration>,
    /// Cancel in-flight tasks on the first failure instead of draining.
    pub fail_fast: bool,
    /// Base delay for exponential retry backoff.
    pub backoff_base: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_attempts: 1,
            task_timeout: None,
            fail_fast: false,
            backoff_base: Duration::from_millis(200),
        }
    }
}

/// Terminal report for one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Aggregate report for one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub tasks: Vec<TaskOutcome>,
    /// Tasks never dispatched because an ancestor failed.
    pub skipped: Vec<String>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Message from a finished worker back to the scheduler loop.
struct TaskDone {
    task_id: String,
    state: TaskState,
    attempts: u32,
    error: Option<String>,
    watermark: Option<WatermarkUpdate>,
}

#[derive(Debug, Clone)]
struct Slot {
    state: TaskState,
    attempts: u32,
    error: Option<String>,
}

/// Whether a stored failure (formatted `CODE: message`) may be retried on
/// resume. Deterministic failures stay failed.
fn stored_error_is_transient(error: Option<&str>) -> bool {
    match error {
        Some(msg) => !matches!(
            msg.split(':').next().unwrap_or(""),
            "VALIDATION" | "SCHEMA" | "PLANNING" | "SYNTAX"
        ),
        None => true,
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let shift = (attempt.saturating_sub(1)).min(10);
    let exp = base.saturating_mul(1u32 << shift);
    let jitter_cap = (base.as_millis() as u64 / 2).max(1);
    let jitter = rand::rng().random_range(0..jitter_cap);
    exp + Duration::from_millis(jitter)
}

/// Drive a plan to completion.
///
/// The scheduler loop is single-threaded: workers report through a channel
/// and every successor update from one completion is applied before the next
/// dispatch pass, so dependents observe a producer's terminal state
/// atomically. Dispatch picks eligible tasks FIFO in plan order; concurrency
/// is bounded by a semaphore. On the first failure no new tasks dispatch
/// (running ones drain unless `fail_fast` cancels them).
///
/// `initial` carries persisted task statuses on resume: `SUCCESS` is sticky,
/// transient failures re-enter the queue with their attempt count, and
/// deterministic failures stay failed.
pub async fn execute_plan(
    ctx: Arc<StepContext>,
    plan: &ExecutionPlan,
    run_id: &str,
    initial: HashMap<String, TaskStatusRecord>,
    options: &ExecutorOptions,
) -> Result<RunSummary> {
    let known: std::collections::HashSet<&str> =
        plan.steps.iter().map(|s| s.id.as_str()).collect();
    let mut slots: HashMap<String, Slot> = plan
        .steps
        .iter()
        .map(|step| {
            let slot = match initial.get(&step.id) {
                Some(status) if status.state == TaskState::Success => Slot {
                    state: TaskState::Success,
                    attempts: status.attempt,
                    error: None,
                },
                Some(status)
                    if status.state == TaskState::Failed
                        && !stored_error_is_transient(status.error.as_deref()) =>
                {
                    Slot {
                        state: TaskState::Failed,
                        attempts: status.attempt,
                        error: status.error.clone(),
                    }
                }
                Some(status) => Slot {
                    // FAILED (transient), interrupted RUNNING, ELIGIBLE,
                    // PENDING: re-evaluate from current dependency state.
                    state: TaskState::Pending,
                    attempts: status.attempt,
                    error: status.error.clone(),
                },
                None => Slot {
                    state: TaskState::Pending,
                    attempts: 0,
                    error: None,
                },
            };
            (step.id.clone(), slot)
        })
        .collect();

    let semaphore = Arc::new(Semaphore::new(options.max_parallelism.max(1)));
    let (tx, mut rx) = mpsc::channel::<TaskDone>(plan.steps.len().max(1));
    let cancel = CancellationToken::new();
    let mut in_flight = 0usize;
    let mut stop_dispatch = slots.values().any(|s| s.state == TaskState::Failed);

    loop {
        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            handle_done(&mut slots, done, &mut stop_dispatch, options.fail_fast, &cancel);
        }

        if !stop_dispatch {
            for step in &plan.steps {
                let state = slots[&step.id].state;
                if state != TaskState::Pending && state != TaskState::Eligible {
                    continue;
                }
                let deps_ok = step
                    .depends_on
                    .iter()
                    .filter(|d| known.contains(d.as_str()))
                    .all(|d| slots[d].state == TaskState::Success);
                if !deps_ok {
                    continue;
                }
                slots.get_mut(&step.id).expect("slot exists").state = TaskState::Eligible;

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let slot = slots.get_mut(&step.id).expect("slot exists");
                slot.state = TaskState::Running;
                in_flight += 1;

                let worker_ctx = Arc::clone(&ctx);
                let worker_step = step.clone();
                let worker_tx = tx.clone();
                let worker_cancel = cancel.clone();
                let worker_opts = options.clone();
                let worker_run = run_id.to_string();
                let base_attempt = slot.attempts;
                tokio::spawn(async move {
                    let done = run_task(
                        worker_ctx,
                        worker_step,
                        worker_run,
                        base_attempt,
                        worker_opts,
                        worker_cancel,
                    )
                    .await;
                    drop(permit);
                    let _ = worker_tx.send(done).await;
                });
            }
        }

        let dispatchable = !stop_dispatch
            && plan.steps.iter().any(|step| {
                let state = slots[&step.id].state;
                (state == TaskState::Pending || state == TaskState::Eligible)
                    && step
                        .depends_on
                        .iter()
                        .filter(|d| known.contains(d.as_str()))
                        .all(|d| slots[d].state == TaskState::Success)
            });

        if in_flight == 0 && !dispatchable {
            break;
        }
        if in_flight > 0 {
            match rx.recv().await {
                Some(done) => {
                    in_flight -= 1;
                    handle_done(&mut slots, done, &mut stop_dispatch, options.fail_fast, &cancel);
                }
                None => break,
            }
        }
    }

    let mut tasks = Vec::with_capacity(plan.steps.len());
    let mut skipped = Vec::new();
    let mut any_failed = false;
    for step in &plan.steps {
        let slot = &slots[&step.id];
        match slot.state {
            TaskState::Success => {}
            TaskState::Failed => any_failed = true,
            _ => skipped.push(step.id.clone()),
        }
        tasks.push(TaskOutcome {
            task_id: step.id.clone(),
            state: slot.state,
            attempts: slot.attempts,
            error: slot.error.clone(),
        });
    }
    let status = if any_failed || !skipped.is_empty() {
        RunStatus::Failed
    } else {
        RunStatus::Success
    };

    info!(
        run_id,
        pipeline = %plan.pipeline,
        %status,
        total = plan.steps.len(),
        skipped = skipped.len(),
        "run finished"
    );

    Ok(RunSummary {
        run_id: run_id.to_string(),
        pipeline: plan.pipeline.clone(),
        status,
        tasks,
        skipped,
    })
}

fn handle_done(
    slots: &mut HashMap<String, Slot>,
    done: TaskDone,
    stop_dispatch: &mut bool,
    fail_fast: bool,
    cancel: &CancellationToken,
) {
    if let Some(slot) = slots.get_mut(&done.task_id) {
        slot.state = done.state;
        slot.attempts = done.attempts;
        slot.error = done.error.clone();
    }
    if done.state == TaskState::Failed {
        warn!(task = %done.task_id, error = ?done.error, "task failed");
        *stop_dispatch = true;
        if fail_fast {
            cancel.cancel();
        }
    } else {
        debug!(task = %done.task_id, watermark = done.watermark.is_some(), "task finished");
    }
}

/// Run one task to a terminal state, with the per-task retry loop.
async fn run_task(
    ctx: Arc<StepContext>,
    step: ExecutionStep,
    run_id: String,
    base_attempt: u32,
    options: ExecutorOptions,
    cancel: CancellationToken,
) -> TaskDone {
    let mut session_attempt = 0u32;
    loop {
        session_attempt += 1;
        let attempt = base_attempt + session_attempt;
        let started_at = Utc::now();

        if let Err(err) = ctx
            .state
            .set_task_state(
                &run_id,
                &TaskStatusRecord {
                    task_id: step.id.clone(),
                    state: TaskState::Running,
                    attempt,
                    error: None,
                    started_at: Some(started_at),
                    ended_at: None,
                },
            )
            .await
        {
            return failed_done(&step.id, attempt, SqlFlowError::State(err.to_string()));
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SqlFlowError::Cancelled("run cancelled".into())),
            res = run_attempt(&ctx, &step, options.task_timeout) => res,
        };

        match result {
            Ok(watermark) => {
                let commit = TaskCommit {
                    status: TaskStatusRecord {
                        task_id: step.id.clone(),
                        state: TaskState::Success,
                        attempt,
                        error: None,
                        started_at: Some(started_at),
                        ended_at: Some(Utc::now()),
                    },
                    watermark: watermark.clone(),
                };
                if let Err(err) = ctx.state.commit_task(&run_id, &commit).await {
                    return failed_done(&step.id, attempt, SqlFlowError::State(err.to_string()));
                }
                // Refresh the read cache only after the durable commit.
                if let Some(wm) = &watermark {
                    if let Ok(value) = WatermarkValue::from_json(&wm.value) {
                        ctx.watermarks.put(&wm.pipeline, &wm.table, &wm.column, value);
                    }
                }
                return TaskDone {
                    task_id: step.id.clone(),
                    state: TaskState::Success,
                    attempts: attempt,
                    error: None,
                    watermark,
                };
            }
            Err(err) => {
                let retryable =
                    err.is_transient() && !cancel.is_cancelled() && session_attempt < options.max_attempts;
                if retryable {
                    let delay = backoff_delay(options.backoff_base, session_attempt);
                    warn!(
                        task = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                let message = format!("{}: {}", err.code(), err);
                let commit = TaskCommit {
                    status: TaskStatusRecord {
                        task_id: step.id.clone(),
                        state: TaskState::Failed,
                        attempt,
                        error: Some(message.clone()),
                        started_at: Some(started_at),
                        ended_at: Some(Utc::now()),
                    },
                    watermark: None,
                };
                if let Err(state_err) = ctx.state.commit_task(&run_id, &commit).await {
                    warn!(task = %step.id, error = %state_err, "failed to persist task failure");
                }
                return TaskDone {
                    task_id: step.id.clone(),
                    state: TaskState::Failed,
                    attempts: attempt,
                    error: Some(message),
                    watermark: None,
                };
            }
        }
    }
}

fn failed_done(task_id: &str, attempts: u32, err: SqlFlowError) -> TaskDone {
    TaskDone {
        task_id: task_id.to_string(),
        state: TaskState::Failed,
        attempts,
        error: Some(format!("{}: {}", err.code(), err)),
        watermark: None,
    }
}

/// One attempt: dispatch by step type under the optional timeout. Timeout
/// expiry drops the engine future, which aborts the in-flight query.
async fn run_attempt(
    ctx: &StepContext,
    step: &ExecutionStep,
    timeout: Option<Duration>,
) -> Result<Option<WatermarkUpdate>> {
    let work = dispatch_step(ctx, step);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| SqlFlowError::Cancelled(format!("task timed out after {limit:?}")))?,
        None => work.await,
    }
}

async fn dispatch_step(
    ctx: &StepContext,
    step: &ExecutionStep,
) -> Result<Option<WatermarkUpdate>> {
    match step.step_type {
        StepType::Source => source::run_source(ctx, step).await,
        StepType::Load => {
            modes::run_load(ctx, step).await?;
            Ok(None)
        }
        StepType::Transform => modes::run_transform(ctx, step).await,
        StepType::Export => {
            export::run_export(ctx, step).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        let base = Duration::from_millis(100);
        let first = backoff_delay(base, 1);
        let third = backoff_delay(base, 3);
        assert!(first >= base);
        assert!(first < base * 2);
        assert!(third >= base * 4);
        assert!(third < base * 5);
    }

    #[test]
    fn stored_error_transience() {
        assert!(stored_error_is_transient(Some("EXECUTION: boom")));
        assert!(stored_error_is_transient(Some("STATE: gone")));
        assert!(!stored_error_is_transient(Some("VALIDATION: bad ident")));
        assert!(!stored_error_is_transient(Some("SCHEMA: key not unique")));
        assert!(stored_error_is_transient(None));
    }
}
