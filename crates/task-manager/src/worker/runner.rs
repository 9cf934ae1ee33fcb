//! Running a claimed task and writing its outcome back

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::definition::{ExhaustedPolicy, RunContext, RunResult, TaskDefinition, TaskRunFailure, TaskRunner};
use crate::events::{emit, EventSender, RunEventOutcome, TaskLifecycleEvent};
use crate::persistence::{TaskStore, UpdateOptions};
use crate::task::{TaskInstance, TaskStatus};
use crate::telemetry::set_parent_from_traceparent;

/// Race a runner against its timeout
///
/// The runner is spawned so that a timeout does not depend on its
/// cooperation. On timeout the cancellation token fires and the runner is
/// left detached; whatever it returns afterwards is dropped.
pub async fn run_with_timeout(
    runner: Arc<dyn TaskRunner>,
    ctx: RunContext,
    timeout: Duration,
) -> Result<RunResult, TaskRunFailure> {
    let cancellation = ctx.cancellation.clone();
    let mut handle = tokio::spawn(async move { runner.run(ctx).await }.in_current_span());

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()),
            Err(join_err) => Err(TaskRunFailure::RunnerThrown {
                message: if join_err.is_panic() {
                    "runner panicked".to_string()
                } else {
                    "runner was aborted".to_string()
                },
                retryable: true,
            }),
        },
        _ = tokio::time::sleep(timeout) => {
            cancellation.cancel();
            Err(TaskRunFailure::RunnerTimeout { timeout })
        }
    }
}

/// What to do with the document after a run
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionAction {
    Remove,
    Update(TaskInstance),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPlan {
    pub action: CompletionAction,
    pub outcome: RunEventOutcome,
}

/// Decide the next state of a claimed task from the run outcome
///
/// - success, one-off: remove
/// - success, recurring: idle at `max(now, run_at + interval)`, attempts reset
/// - retryable failure with attempts left: idle at `now + backoff`
/// - otherwise: the definition's exhaustion policy
pub fn plan_completion(
    task: &TaskInstance,
    outcome: &Result<RunResult, TaskRunFailure>,
    definition: &TaskDefinition,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> CompletionPlan {
    let mut next = task.clone();
    next.release();

    match outcome {
        Ok(result) => {
            if let Some(state) = &result.state {
                next.state = state.clone();
            }
            if result.schedule.is_some() {
                next.schedule = result.schedule;
            }

            let run_at = match (result.run_at, next.schedule) {
                (Some(run_at), _) => Some(run_at.max(now)),
                (None, Some(schedule)) => Some((task.run_at + schedule.interval.as_chrono()).max(now)),
                (None, None) => None,
            };

            let action = match run_at {
                Some(run_at) => {
                    next.run_at = run_at;
                    next.attempts = 0;
                    CompletionAction::Update(next)
                }
                None => CompletionAction::Remove,
            };
            CompletionPlan {
                action,
                outcome: RunEventOutcome::Succeeded,
            }
        }
        Err(failure) => {
            let exhausted = !failure.is_retryable() || task.attempts >= max_attempts;
            let event = |retry_at: Option<DateTime<Utc>>| match (failure, retry_at) {
                (TaskRunFailure::RunnerTimeout { timeout }, _) => {
                    RunEventOutcome::TimedOut { timeout: *timeout }
                }
                (TaskRunFailure::RunnerThrown { message, .. }, Some(retry_at)) => {
                    RunEventOutcome::Retrying {
                        error: message.clone(),
                        retry_at,
                    }
                }
                (TaskRunFailure::RunnerThrown { message, .. }, None) => {
                    RunEventOutcome::Exhausted {
                        error: message.clone(),
                    }
                }
            };

            if exhausted {
                let action = match definition.on_exhausted {
                    ExhaustedPolicy::Remove => CompletionAction::Remove,
                    ExhaustedPolicy::MarkFailed => {
                        next.status = TaskStatus::Failed;
                        CompletionAction::Update(next)
                    }
                };
                return CompletionPlan {
                    action,
                    outcome: event(None),
                };
            }

            let delay = definition.retry_policy.delay_for_attempt(task.attempts);
            let retry_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
            next.run_at = retry_at;
            CompletionPlan {
                action: CompletionAction::Update(next),
                outcome: event(Some(retry_at)),
            }
        }
    }
}

/// Runs claimed tasks and writes their outcome back
#[derive(Clone)]
pub struct ClaimedTaskRunner {
    store: Arc<TaskStore>,
    events: EventSender,
}

impl ClaimedTaskRunner {
    pub fn new(store: Arc<TaskStore>, events: EventSender) -> Self {
        Self { store, events }
    }

    /// Execute one claimed task to completion, including write-back
    pub async fn run(
        &self,
        task: TaskInstance,
        definition: Arc<TaskDefinition>,
        cancellation: CancellationToken,
    ) {
        let span = info_span!(
            "task_run",
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
        );
        set_parent_from_traceparent(&span, task.traceparent.as_deref());
        self.run_inner(task, definition, cancellation)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        task: TaskInstance,
        definition: Arc<TaskDefinition>,
        cancellation: CancellationToken,
    ) {
        emit(
            &self.events,
            TaskLifecycleEvent::TaskRunStarted {
                task_id: task.id.clone(),
                task_type: task.task_type.clone(),
                ephemeral: false,
            },
        );

        let ctx = RunContext {
            task_id: Some(task.id.clone()),
            task_type: task.task_type.clone(),
            params: task.params.clone(),
            state: task.state.clone(),
            attempts: task.attempts,
            schedule: task.schedule,
            cancellation,
        };

        let started = Instant::now();
        let outcome = run_with_timeout(Arc::clone(&definition.runner), ctx, definition.timeout).await;
        let duration = started.elapsed();

        if let Err(failure) = &outcome {
            warn!(error = %failure, "task run failed");
        } else {
            debug!(duration_ms = duration.as_millis() as u64, "task run succeeded");
        }

        let max_attempts = self.store.definitions().max_attempts(&definition);
        let plan = plan_completion(&task, &outcome, &definition, max_attempts, Utc::now());
        self.write_back(&task, plan.action).await;

        emit(
            &self.events,
            TaskLifecycleEvent::TaskRunCompleted {
                task_id: task.id.clone(),
                task_type: task.task_type.clone(),
                outcome: plan.outcome,
                duration,
                ephemeral: false,
            },
        );
    }

    async fn write_back(&self, claimed: &TaskInstance, action: CompletionAction) {
        match action {
            CompletionAction::Update(next) => {
                match self.store.update(next, UpdateOptions::unvalidated()).await {
                    Ok(_) => {}
                    Err(err) if err.is_version_conflict() || err.is_not_found() => {
                        // Reclaimed or removed while we ran; the other writer wins
                        warn!(error = %err, "discarding task result, document changed during the run");
                    }
                    Err(err) => warn!(error = %err, "failed to write task result"),
                }
            }
            CompletionAction::Remove => {
                match self.store.remove_unchanged(&claimed.id, claimed.version).await {
                    Ok(()) => info!("one-off task completed and removed"),
                    Err(err) if err.is_version_conflict() => {
                        warn!(error = %err, "not removing task, document changed during the run");
                    }
                    Err(err) if err.is_not_found() => {}
                    Err(err) => warn!(error = %err, "failed to remove completed task"),
                }
            }
        }
    }
}
