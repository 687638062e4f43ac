//! Workload lifecycle controller for kuberun
//!
//! Submits a descriptor to Kubernetes under a unique run id, collects its pod
//! logs in the background, supervises it until it completes, fails, times out
//! or is cancelled, and deletes everything it created.
//!
//! ```ignore
//! let orchestrator = Arc::new(KubeOrchestrator::connect(None, None, None).await?);
//! let controller = RunController::new(orchestrator);
//! let mut run = controller.submit(&Document::read(path)?, RunSpec::new(workdir, "run.out")).await?;
//! controller.wait(&mut run).await?;
//! ```

#![deny(missing_docs)]

pub mod collector;
pub mod config;
pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod quota;
pub mod run;
pub mod submitter;
pub mod tagger;
pub mod teardown;

#[cfg(test)]
mod testing;

pub use config::ControllerConfig;
pub use controller::RunController;
pub use error::{RunError, RunFailure};
pub use orchestrator::{KubeOrchestrator, Orchestrator};
pub use run::{Run, RunId, RunSpec, RunState, WorkloadKind};
