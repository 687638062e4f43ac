//! Run teardown
//!
//! Teardown stops (or waits for) the log collector, then deletes every object
//! the run created. It completes at most once per run.
//!
//! Teardown is cancel safe. A collector whose join is interrupted stays on the
//! run, and the run is only marked torn down once every delete was attempted,
//! so a later call picks up where the dropped one stopped. Deletes are
//! idempotent (a 404 is success).

use tracing::{debug, info, warn};

use crate::collector::{dump_pod_logs, CollectorOutcome};
use crate::error::RunError;
use crate::orchestrator::{DeleteTarget, Orchestrator};
use crate::run::{Run, TypeRef, WorkloadKind};

/// How pod logs are settled before deletion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownMode {
    /// The run completed: let the collector finish writing
    Join,
    /// The run was stopped early: abandon the collector and dump what exists
    ForceDump,
}

/// Objects to delete for a run, in deletion order
pub fn delete_targets(run: &Run) -> Vec<DeleteTarget> {
    let pods_by_label = DeleteTarget::Labelled {
        type_ref: TypeRef::pod(),
        selector: run.selector(),
    };

    match &run.kind {
        WorkloadKind::Pod => vec![DeleteTarget::Named {
            type_ref: TypeRef::pod(),
            name: run.name.clone(),
        }],
        WorkloadKind::Job => vec![
            DeleteTarget::Labelled {
                type_ref: TypeRef::job(),
                selector: run.selector(),
            },
            pods_by_label,
        ],
        WorkloadKind::Generic(type_ref) => vec![
            DeleteTarget::Named {
                type_ref: type_ref.clone(),
                name: run.name.clone(),
            },
            pods_by_label,
        ],
    }
}

/// Settle logs and delete the run's objects. A no-op once a call completed.
///
/// Every target is attempted; the first deletion error is returned.
pub async fn teardown(
    orchestrator: &dyn Orchestrator,
    run: &mut Run,
    mode: TeardownMode,
) -> Result<(), RunError> {
    if run.torn_down {
        debug!(run = %run.id, "already torn down");
        return Ok(());
    }

    if !run.logs_settled {
        settle_logs(orchestrator, run, mode).await;
        run.logs_settled = true;
    }

    let mut first_error = None;
    for target in delete_targets(run) {
        if let Err(e) = orchestrator.delete(&target).await {
            warn!(run = %run.id, object = %target, error = %e, "failed to delete");
            first_error.get_or_insert(e);
        }
    }
    run.torn_down = true;

    info!(run = %run.id, name = %run.name, state = %run.state, "run torn down");
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn settle_logs(orchestrator: &dyn Orchestrator, run: &mut Run, mode: TeardownMode) {
    let written = match (mode, run.collector.as_mut()) {
        (TeardownMode::Join, Some(collector)) => collector.join().await,
        (TeardownMode::ForceDump, Some(collector)) => collector.abandon().await,
        (_, None) => Ok(CollectorOutcome::Abandoned),
    };
    run.collector = None;

    let needs_dump = match written {
        Ok(CollectorOutcome::Written(_)) => false,
        Ok(CollectorOutcome::Abandoned) => mode == TeardownMode::ForceDump,
        Err(e) => {
            warn!(run = %run.id, error = %e, "log collector failed");
            mode == TeardownMode::ForceDump
        }
    };

    if needs_dump {
        if let Err(e) = dump_pod_logs(orchestrator, &run.selector(), &run.output).await {
            warn!(run = %run.id, error = %e, "failed to dump pod logs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::PodPhase;
    use crate::testing::{labelled_pod, test_run, FakeOrchestrator};

    #[test]
    fn pod_runs_delete_the_named_pod() {
        let run = test_run(WorkloadKind::Pod);
        assert_eq!(
            delete_targets(&run),
            vec![DeleteTarget::Named {
                type_ref: TypeRef::pod(),
                name: "kr-demo-abc123".to_string(),
            }]
        );
    }

    #[test]
    fn job_runs_delete_jobs_then_pods_by_label() {
        let run = test_run(WorkloadKind::Job);
        assert_eq!(
            delete_targets(&run),
            vec![
                DeleteTarget::Labelled {
                    type_ref: TypeRef::job(),
                    selector: "run=abc123".to_string(),
                },
                DeleteTarget::Labelled {
                    type_ref: TypeRef::pod(),
                    selector: "run=abc123".to_string(),
                },
            ]
        );
    }

    #[test]
    fn generic_runs_delete_the_root_then_pods() {
        let mpi = TypeRef::new("kubeflow.org/v2beta1", "MPIJob");
        let run = test_run(WorkloadKind::Generic(mpi.clone()));
        let targets = delete_targets(&run);
        assert_eq!(
            targets[0],
            DeleteTarget::Named {
                type_ref: mpi,
                name: "kr-demo-abc123".to_string(),
            }
        );
        assert!(matches!(
            &targets[1],
            DeleteTarget::Labelled { type_ref, .. } if *type_ref == TypeRef::pod()
        ));
    }

    #[tokio::test]
    async fn teardown_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOrchestrator::new();
        let mut run = test_run(WorkloadKind::Job);
        run.output = dir.path().join("run.out");

        teardown(&*fake, &mut run, TeardownMode::ForceDump)
            .await
            .unwrap();
        teardown(&*fake, &mut run, TeardownMode::ForceDump)
            .await
            .unwrap();

        assert!(run.is_torn_down());
        assert_eq!(fake.deletes().len(), 2);
    }

    #[tokio::test]
    async fn forced_teardown_dumps_pod_logs() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOrchestrator::new();
        fake.create(&labelled_pod("abc123")).await.unwrap();
        fake.set_pods(&[("p1", PodPhase::Running)]);
        fake.set_log("p1", "partial output\n");
        let mut run = test_run(WorkloadKind::Pod);
        run.output = dir.path().join("run.out");

        teardown(&*fake, &mut run, TeardownMode::ForceDump)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&run.output).unwrap();
        assert_eq!(written, "==> pod/p1 <==\npartial output\n");
    }
}
