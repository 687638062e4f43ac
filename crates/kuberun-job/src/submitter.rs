//! Workload submission
//!
//! Submission tags the descriptor, prepares the run's output file, persists
//! the exact descriptor that was sent, and creates it on the cluster. Quota
//! rejections that could still fit are retried on a fixed interval until the
//! namespace has room; every other rejection is returned immediately.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use kuberun_common::retry::{retry_if, RetryConfig};
use kuberun_common::{Document, DocumentFormat, Error};

use crate::collector::{CollectorParams, LogCollector};
use crate::config::ControllerConfig;
use crate::error::RunError;
use crate::orchestrator::{Orchestrator, Rejection};
use crate::run::{Run, RunId, RunSpec, RunState, WorkloadKind};
use crate::tagger::{tag_descriptor, RunTag};

/// Submit `descriptor` under a freshly generated run id
pub async fn submit(
    orchestrator: Arc<dyn Orchestrator>,
    config: &ControllerConfig,
    descriptor: &Document,
    spec: RunSpec,
) -> Result<Run, RunError> {
    submit_with_id(orchestrator, config, descriptor, spec, RunId::generate()).await
}

/// Submit `descriptor` under a caller-chosen run id
pub async fn submit_with_id(
    orchestrator: Arc<dyn Orchestrator>,
    config: &ControllerConfig,
    descriptor: &Document,
    spec: RunSpec,
    id: RunId,
) -> Result<Run, RunError> {
    let tag = RunTag::new(id.clone(), &config.run_prefix);
    let mut tagged = tag_descriptor(&descriptor.value, &tag)?;
    let (kind, replica_count) = WorkloadKind::detect(&tagged)?;

    let namespace = orchestrator.namespace();
    if let Some(metadata) = tagged.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
    }
    let name = tagged
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let output = spec.output_path();
    let descriptor_copy = descriptor_copy_path(&output, descriptor.format);
    prepare_output(&spec, &output).await?;
    Document::write(&descriptor_copy, &tagged, descriptor.format)?;
    debug!(run = %id, copy = %descriptor_copy.display(), "descriptor persisted");

    let retry = RetryConfig::fixed(config.quota_retry_interval());
    let created = retry_if(
        &retry,
        "create_workload",
        || orchestrator.create(&tagged),
        Rejection::is_transient,
    )
    .await;

    match created {
        Ok(()) => {}
        Err(Rejection::Quota(quota)) => {
            return Err(RunError::configuration(format!(
                "{} can never be admitted: {}",
                name, quota
            )))
        }
        Err(Rejection::Other(message)) => return Err(RunError::rejected(&name, message)),
    }

    let collector = LogCollector::spawn(
        orchestrator.clone(),
        CollectorParams {
            selector: id.selector(),
            replica_count,
            output: output.clone(),
            interval: config.collector_poll_interval(),
        },
    );

    info!(
        run = %id,
        name = %name,
        namespace = %namespace,
        kind = %kind,
        replicas = replica_count,
        "workload submitted"
    );

    Ok(Run {
        id,
        name,
        namespace,
        context: orchestrator.context(),
        kind,
        replica_count,
        state: RunState::Submitted,
        submit_time: Instant::now(),
        cancel_time: None,
        time_limit: spec.time_limit,
        pending_error: None,
        output,
        descriptor_copy,
        collector: Some(collector),
        logs_settled: false,
        torn_down: false,
    })
}

/// Where the submitted descriptor is persisted: next to the output file,
/// with the descriptor's own extension.
pub fn descriptor_copy_path(output: &Path, format: DocumentFormat) -> PathBuf {
    let copy = output.with_extension(format.extension());
    if copy != output {
        return copy;
    }
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{}.submitted.{}", file_name, format.extension()))
}

/// Truncate the output file and write the preamble
async fn prepare_output(spec: &RunSpec, output: &Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(&spec.workdir)
        .await
        .map_err(|e| Error::io(&spec.workdir, e))?;

    let preamble: String = spec.preamble.iter().map(|l| format!("{}\n", l)).collect();
    tokio::fs::write(output, preamble)
        .await
        .map_err(|e| Error::io(output, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::orchestrator::MockOrchestrator;
    use crate::quota::QuotaExceeded;
    use crate::testing::FakeOrchestrator;

    fn pod() -> Document {
        Document::parse(
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: hello\n\
             spec:\n  containers:\n    - name: main\n      image: busybox\n",
        )
        .unwrap()
    }

    fn gpu_quota(requested: f64, limited: f64) -> Rejection {
        Rejection::Quota(QuotaExceeded {
            quota: "gpu-quota".to_string(),
            resource: "requests.nvidia.com/gpu".to_string(),
            requested,
            used: 4.0,
            limited,
        })
    }

    fn mock_cluster() -> MockOrchestrator {
        let mut mock = MockOrchestrator::new();
        mock.expect_namespace().return_const("team-a".to_string());
        mock.expect_context().return_const(None::<String>);
        mock.expect_list_pods().returning(|_| Ok(vec![]));
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn satisfiable_quota_rejection_is_retried_every_interval() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let mut mock = mock_cluster();
        mock.expect_create().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(gpu_quota(2.0, 5.0))
            } else {
                Ok(())
            }
        });

        let start = Instant::now();
        let run = submit(
            Arc::new(mock),
            &ControllerConfig::default(),
            &pod(),
            RunSpec::new(dir.path(), "run.out"),
        )
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert_eq!(run.state(), RunState::Submitted);
        assert_eq!(run.namespace(), "team-a");
    }

    #[tokio::test]
    async fn unsatisfiable_quota_fails_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockOrchestrator::new();
        mock.expect_namespace().return_const("team-a".to_string());
        mock.expect_create()
            .times(1)
            .returning(|_| Err(gpu_quota(10.0, 5.0)));

        let err = submit(
            Arc::new(mock),
            &ControllerConfig::default(),
            &pod(),
            RunSpec::new(dir.path(), "run.out"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::Configuration { .. }));
        assert!(err.to_string().contains("requests.nvidia.com/gpu"));
    }

    #[tokio::test]
    async fn other_rejections_are_returned() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockOrchestrator::new();
        mock.expect_namespace().return_const("team-a".to_string());
        mock.expect_create()
            .times(1)
            .returning(|_| Err(Rejection::Other("admission webhook denied".to_string())));

        let err = submit(
            Arc::new(mock),
            &ControllerConfig::default(),
            &pod(),
            RunSpec::new(dir.path(), "run.out"),
        )
        .await
        .unwrap_err();

        match err {
            RunError::Rejected { name, message } => {
                assert!(name.starts_with("kr-hello-"));
                assert_eq!(message, "admission webhook denied");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn output_is_truncated_and_descriptor_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("run.out");
        std::fs::write(&output, "stale output from a previous attempt\n").unwrap();

        let fake = FakeOrchestrator::new();
        let spec = RunSpec::new(dir.path(), "run.out").with_preamble_line("# test: hello");
        let run = submit_with_id(
            fake.clone(),
            &ControllerConfig::default(),
            &pod(),
            spec,
            RunId::new("abc123").unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "# test: hello\n");
        assert_eq!(run.descriptor_copy(), dir.path().join("run.yaml"));

        let persisted = Document::read(run.descriptor_copy()).unwrap();
        assert_eq!(persisted.format, DocumentFormat::Yaml);
        assert_eq!(persisted.value["metadata"]["name"], "kr-hello-abc123");
        assert_eq!(persisted.value["metadata"]["namespace"], "default");

        let created = fake.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0], persisted.value);
    }

    #[tokio::test]
    async fn malformed_descriptor_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeOrchestrator::new();
        let doc = Document::parse("apiVersion: v1\nkind: Pod\nmetadata:\n  labels: {}\n").unwrap();

        let err = submit(
            fake.clone(),
            &ControllerConfig::default(),
            &doc,
            RunSpec::new(dir.path(), "run.out"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RunError::Configuration { .. }));
        assert!(fake.created().is_empty());
    }

    #[test]
    fn descriptor_copy_never_overwrites_output() {
        assert_eq!(
            descriptor_copy_path(Path::new("/w/run.out"), DocumentFormat::Json),
            PathBuf::from("/w/run.json")
        );
        assert_eq!(
            descriptor_copy_path(Path::new("/w/run.yaml"), DocumentFormat::Yaml),
            PathBuf::from("/w/run.yaml.submitted.yaml")
        );
    }
}
