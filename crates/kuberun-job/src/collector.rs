//! Background pod log collection
//!
//! A [`LogCollector`] is started right after a successful submission. It lists
//! the run's pods on a fixed interval, remembers every pod it has seen, and
//! once as many pods are terminal as the run expects it appends each pod's log
//! to the run's output file under a `==> pod/<name> <==` header.
//!
//! Cancelling the collector before it starts writing drops everything; once
//! writing has started it runs to completion so the output file never holds a
//! partial dump. Dropping the handle aborts the task, so a collector never
//! outlives its run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kuberun_common::Error;

use crate::orchestrator::Orchestrator;

/// What a collector did before it stopped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectorOutcome {
    /// Logs of these pods were appended, in this order
    Written(Vec<String>),
    /// Stopped before writing anything
    Abandoned,
}

/// Settings of one collector task
#[derive(Clone, Debug)]
pub struct CollectorParams {
    /// Label selector of the run's pods
    pub selector: String,
    /// Number of terminal pods to wait for
    pub replica_count: u32,
    /// Output file the logs are appended to
    pub output: PathBuf,
    /// Sleep between pod listings
    pub interval: Duration,
}

/// Handle to a running collector task
#[derive(Debug)]
pub struct LogCollector {
    token: CancellationToken,
    handle: Option<JoinHandle<Result<CollectorOutcome, Error>>>,
}

impl LogCollector {
    /// Start collecting in the background
    pub fn spawn(orchestrator: Arc<dyn Orchestrator>, params: CollectorParams) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(collect(orchestrator, params, token.clone()));
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Whether the task has stopped
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the collector to finish on its own.
    ///
    /// Cancel safe: if the returned future is dropped the task keeps running
    /// and can be joined again.
    pub async fn join(&mut self) -> Result<CollectorOutcome, Error> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::internal_with_context(
                "log_collector",
                "collector was already joined",
            ));
        };
        let result = handle.await;
        self.handle = None;
        result.map_err(|e| Error::internal_with_context("log_collector", e.to_string()))?
    }

    /// Signal the collector to stop, then wait for it.
    ///
    /// Returns `Written` if it had already started writing when signalled.
    pub async fn abandon(&mut self) -> Result<CollectorOutcome, Error> {
        self.token.cancel();
        self.join().await
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            self.token.cancel();
            handle.abort();
        }
    }
}

async fn collect(
    orchestrator: Arc<dyn Orchestrator>,
    params: CollectorParams,
    token: CancellationToken,
) -> Result<CollectorOutcome, Error> {
    let mut seen: Vec<String> = Vec::new();
    let mut terminal: HashSet<String> = HashSet::new();

    loop {
        if token.is_cancelled() {
            debug!(selector = %params.selector, "log collector abandoned");
            return Ok(CollectorOutcome::Abandoned);
        }

        match orchestrator.list_pods(&params.selector).await {
            Ok(pods) => {
                for pod in pods {
                    if !seen.contains(&pod.name) {
                        seen.push(pod.name.clone());
                    }
                    if pod.phase.is_terminal() {
                        terminal.insert(pod.name);
                    }
                }
            }
            Err(e) => {
                debug!(selector = %params.selector, error = %e, "pod listing failed, will retry");
            }
        }

        if terminal.len() >= params.replica_count as usize {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => {
                debug!(selector = %params.selector, "log collector abandoned");
                return Ok(CollectorOutcome::Abandoned);
            }
            _ = tokio::time::sleep(params.interval) => {}
        }
    }

    append_pod_logs(orchestrator.as_ref(), &seen, &params.output).await?;
    info!(
        selector = %params.selector,
        pods = seen.len(),
        output = %params.output.display(),
        "collected pod logs"
    );
    Ok(CollectorOutcome::Written(seen))
}

/// Append the logs of `pods` to `output`, one header per pod.
///
/// A pod whose log can't be fetched gets a placeholder line instead of
/// failing the whole dump.
pub async fn append_pod_logs(
    orchestrator: &dyn Orchestrator,
    pods: &[String],
    output: &Path,
) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .await
        .map_err(|e| Error::io(output, e))?;

    for pod in pods {
        let logs = match orchestrator.pod_logs(pod).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(pod = %pod, error = %e, "failed to fetch pod logs");
                format!("<failed to fetch logs: {}>\n", e)
            }
        };

        let mut chunk = format!("==> pod/{} <==\n", pod);
        chunk.push_str(&logs);
        if !logs.is_empty() && !logs.ends_with('\n') {
            chunk.push('\n');
        }
        file.write_all(chunk.as_bytes())
            .await
            .map_err(|e| Error::io(output, e))?;
    }

    file.flush().await.map_err(|e| Error::io(output, e))
}

/// Dump the logs of every pod currently matching `selector`.
///
/// Used when a run is torn down before its collector could finish. Listing
/// failures are logged and leave the output untouched.
pub async fn dump_pod_logs(
    orchestrator: &dyn Orchestrator,
    selector: &str,
    output: &Path,
) -> Result<(), Error> {
    let pods = match orchestrator.list_pods(selector).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(selector = %selector, error = %e, "cannot list pods for log dump");
            return Ok(());
        }
    };

    let mut names: Vec<String> = Vec::new();
    for pod in pods {
        if !names.contains(&pod.name) {
            names.push(pod.name);
        }
    }
    append_pod_logs(orchestrator, &names, output).await
}
