//! Run controller
//!
//! The controller drives a [`Run`] through its lifecycle:
//!
//! ```text
//! SUBMITTED ─poll─> RUNNING ─┬─> COMPLETED   all pods succeeded
//!                            ├─> FAILED      a pod failed (forced teardown)
//!                            ├─> TIMEOUT     time limit exceeded (forced teardown)
//!                            └─> CANCELLED   cancel + grace period (forced teardown)
//! ```
//!
//! Terminal states are absorbing. A failure is stored on the run when it is
//! detected and re-raised by every later poll, `is_finished` and `wait`.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kuberun_common::Document;

use crate::config::ControllerConfig;
use crate::error::{RunError, RunFailure};
use crate::orchestrator::Orchestrator;
use crate::run::{PodSnapshot, Run, RunSpec, RunState};
use crate::submitter;
use crate::teardown::{teardown, TeardownMode};

/// Submits runs and supervises them until they end
pub struct RunController {
    orchestrator: Arc<dyn Orchestrator>,
    config: ControllerConfig,
}

impl RunController {
    /// Create a controller with default settings
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self::with_config(orchestrator, ControllerConfig::default())
    }

    /// Create a controller with explicit settings
    pub fn with_config(orchestrator: Arc<dyn Orchestrator>, config: ControllerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Controller settings
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Tag, persist and create a workload, then start collecting its logs
    pub async fn submit(&self, descriptor: &Document, spec: RunSpec) -> Result<Run, RunError> {
        submitter::submit(self.orchestrator.clone(), &self.config, descriptor, spec).await
    }

    /// Advance the run by one observation.
    ///
    /// Pod listing errors are absorbed; the next poll simply tries again.
    pub async fn poll(&self, run: &mut Run) -> Result<(), RunError> {
        run.raise_pending()?;
        if run.state.is_terminal() {
            return Ok(());
        }

        if let Some(cancel_time) = run.cancel_time {
            let grace = self.config.cancel_grace_period();
            let remaining = grace.saturating_sub(cancel_time.elapsed());
            if !remaining.is_zero() {
                debug!(
                    run = %run.id,
                    remaining_ms = remaining.as_millis() as u64,
                    "waiting out cancel grace period"
                );
                tokio::time::sleep(remaining).await;
            }
            run.transition(RunState::Cancelled);
            info!(run = %run.id, name = %run.name, "run cancelled");
            return teardown(self.orchestrator.as_ref(), run, TeardownMode::ForceDump).await;
        }

        run.transition(RunState::Running);

        match self.orchestrator.list_pods(&run.selector()).await {
            Ok(pods) => {
                let snapshot = PodSnapshot::new(pods);
                if snapshot.has_failure() {
                    let failed = snapshot.failed_pods();
                    error!(run = %run.id, name = %run.name, failed = ?failed, "run failed");
                    let failure = RunFailure::Workload {
                        run: run.id.to_string(),
                        failed,
                        output: run.output.clone(),
                    };
                    run.fail(RunState::Failed, failure);
                    return teardown(self.orchestrator.as_ref(), run, TeardownMode::ForceDump)
                        .await;
                }

                if snapshot.is_complete(run.replica_count) {
                    run.transition(RunState::Completed);
                    info!(
                        run = %run.id,
                        name = %run.name,
                        elapsed_ms = run.submit_time.elapsed().as_millis() as u64,
                        "run completed"
                    );
                    return Ok(());
                }
            }
            Err(e) => {
                debug!(run = %run.id, error = %e, "pod listing failed, will retry");
            }
        }

        if let Some(limit) = run.time_limit {
            let elapsed = run.submit_time.elapsed();
            if elapsed > limit {
                warn!(
                    run = %run.id,
                    name = %run.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "run timed out"
                );
                let failure = RunFailure::Timeout {
                    run: run.id.to_string(),
                    elapsed,
                    limit,
                };
                run.fail(RunState::Timeout, failure);
                return teardown(self.orchestrator.as_ref(), run, TeardownMode::ForceDump).await;
            }
        }

        Ok(())
    }

    /// Whether the run has ended, without advancing it.
    ///
    /// A stored failure is raised instead of answering.
    pub async fn is_finished(&self, run: &Run) -> Result<bool, RunError> {
        run.raise_pending()?;
        if run.state.is_terminal() {
            return Ok(true);
        }

        match self.orchestrator.list_pods(&run.selector()).await {
            Ok(pods) => Ok(PodSnapshot::new(pods).is_complete(run.replica_count)),
            Err(e) => {
                debug!(run = %run.id, error = %e, "pod listing failed");
                Ok(false)
            }
        }
    }

    /// Request cancellation. Takes effect on the next poll, once the grace
    /// period since this call has elapsed.
    pub fn cancel(&self, run: &mut Run) {
        if run.state.is_terminal() {
            debug!(run = %run.id, state = %run.state, "cancel ignored for finished run");
            return;
        }
        if run.cancel_time.is_none() {
            info!(run = %run.id, name = %run.name, "cancellation requested");
            run.cancel_time = Some(Instant::now());
        }
    }

    /// Poll until the run ends, tear it down, and raise its failure if any
    pub async fn wait(&self, run: &mut Run) -> Result<RunState, RunError> {
        self.wait_interruptible(run, &CancellationToken::new()).await
    }

    /// Like [`wait`](Self::wait), but cancelling `interrupt` cancels the run.
    ///
    /// The token is checked between polls, so an interrupted run still goes
    /// through its grace period and a complete teardown before this returns.
    pub async fn wait_interruptible(
        &self,
        run: &mut Run,
        interrupt: &CancellationToken,
    ) -> Result<RunState, RunError> {
        while !run.state.is_terminal() {
            if interrupt.is_cancelled() {
                self.cancel(run);
            }
            self.poll(run).await?;
            if run.state.is_terminal() {
                break;
            }
            tokio::select! {
                _ = interrupt.cancelled(), if run.cancel_time.is_none() => {}
                _ = tokio::time::sleep(self.config.wait_poll_interval()) => {}
            }
        }

        self.teardown(run).await?;
        run.raise_pending()?;
        Ok(run.state)
    }

    /// Tear the run down now. Completed runs keep their collector's output;
    /// anything else has its pod logs dumped first.
    pub async fn teardown(&self, run: &mut Run) -> Result<(), RunError> {
        let mode = if run.state == RunState::Completed {
            TeardownMode::Join
        } else {
            TeardownMode::ForceDump
        };
        teardown(self.orchestrator.as_ref(), run, mode).await
    }
}
