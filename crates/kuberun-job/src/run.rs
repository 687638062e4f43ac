//! Run data model
//!
//! A [`Run`] is one submitted workload tracked end-to-end. It is created by the
//! submitter, mutated only by the [`RunController`](crate::controller::RunController)
//! through `&mut Run`, and reaches exactly one terminal [`RunState`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::Instant;

use kuberun_common::kube_utils::label_selector;
use kuberun_common::TRACE_LABEL_KEY;

use crate::collector::LogCollector;
use crate::error::{RunError, RunFailure};

/// Length of generated run identifiers
pub const RUN_ID_LEN: usize = 10;

const RUN_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque identifier shared by every object of one submission.
///
/// Lowercase alphanumeric so it is valid both inside object names and as a
/// label value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..RUN_ID_LEN)
            .map(|_| RUN_ID_ALPHABET[rng.gen_range(0..RUN_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Use a caller-provided identifier (must be a valid label value)
    pub fn new(id: impl Into<String>) -> Result<Self, RunError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 63
            && id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if !valid {
            return Err(RunError::configuration(format!(
                "run identifier '{}' must be 1-63 lowercase alphanumeric characters",
                id
            )));
        }
        Ok(Self(id))
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Label selector matching every object of this run
    pub fn selector(&self) -> String {
        label_selector(TRACE_LABEL_KEY, &self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Created on the orchestrator, not yet polled
    Submitted,
    /// Being polled
    Running,
    /// All expected pods succeeded
    Completed,
    /// At least one pod failed
    Failed,
    /// The time limit was exceeded
    Timeout,
    /// Cancellation was requested and honored
    Cancelled,
}

impl RunState {
    /// Terminal states are absorbing: no transition leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// =============================================================================
// Workload kinds
// =============================================================================

/// apiVersion + kind of an orchestrator object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeRef {
    /// Full API version (e.g., "batch/v1", "v1")
    pub api_version: String,
    /// Resource kind (e.g., "Job")
    pub kind: String,
}

impl TypeRef {
    /// Create a type reference
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// core/v1 Pod
    pub fn pod() -> Self {
        Self::new("v1", "Pod")
    }

    /// batch/v1 Job
    pub fn job() -> Self {
        Self::new("batch/v1", "Job")
    }

    /// Read the type of a descriptor
    pub fn of(descriptor: &Value) -> Option<Self> {
        let api_version = descriptor.get("apiVersion")?.as_str()?;
        let kind = descriptor.get("kind")?.as_str()?;
        Some(Self::new(api_version, kind))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// How a run is monitored and torn down
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// A bare pod, monitored and deleted by name
    Pod,
    /// A batch Job whose completions are the expected replica count
    Job,
    /// Any other resource, applied as-is and monitored through its pods
    Generic(TypeRef),
}

impl WorkloadKind {
    /// Determine the kind and expected replica count of a descriptor
    pub fn detect(descriptor: &Value) -> Result<(Self, u32), RunError> {
        let type_ref = TypeRef::of(descriptor).ok_or_else(|| {
            RunError::configuration("descriptor must declare both apiVersion and kind")
        })?;

        if type_ref == TypeRef::pod() {
            return Ok((Self::Pod, 1));
        }

        if type_ref == TypeRef::job() {
            let completions = match descriptor.pointer("/spec/completions") {
                None | Some(Value::Null) => 1,
                Some(v) => v.as_u64().filter(|c| *c >= 1).ok_or_else(|| {
                    RunError::configuration(format!(
                        "spec.completions must be a positive integer, got {}",
                        v
                    ))
                })?,
            };
            let completions = u32::try_from(completions).map_err(|_| {
                RunError::configuration(format!("spec.completions {} is too large", completions))
            })?;
            return Ok((Self::Job, completions));
        }

        Ok((Self::Generic(type_ref), 1))
    }

    /// Type of the submitted root object
    pub fn type_ref(&self) -> TypeRef {
        match self {
            Self::Pod => TypeRef::pod(),
            Self::Job => TypeRef::job(),
            Self::Generic(type_ref) => type_ref.clone(),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod => write!(f, "pod"),
            Self::Job => write!(f, "job"),
            Self::Generic(type_ref) => write!(f, "generic ({})", type_ref),
        }
    }
}

// =============================================================================
// Pods
// =============================================================================

/// Pod phase as seen by the controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted but not all containers started
    Pending,
    /// At least one container running
    Running,
    /// All containers exited successfully
    Succeeded,
    /// At least one container exited with failure
    Failed,
    /// A container keeps crashing; terminal but not successful
    CrashLoopBackOff,
    /// The pod is being deleted
    Terminating,
    /// Anything else the orchestrator reports
    Unknown(String),
}

impl PodPhase {
    /// Terminal phases count towards the expected replica count
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::CrashLoopBackOff)
    }

    /// Terminal phases that fail the run
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Failed | Self::CrashLoopBackOff)
    }
}

impl From<&str> for PodPhase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "CrashLoopBackOff" => Self::CrashLoopBackOff,
            "Terminating" => Self::Terminating,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::CrashLoopBackOff => write!(f, "CrashLoopBackOff"),
            Self::Terminating => write!(f, "Terminating"),
            Self::Unknown(phase) => write!(f, "{}", phase),
        }
    }
}

/// Read-only snapshot of one pod, valid for a single poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodView {
    /// Pod name
    pub name: String,
    /// Phase at the time of the query
    pub phase: PodPhase,
}

impl PodView {
    /// Create a pod view
    pub fn new(name: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            name: name.into(),
            phase,
        }
    }
}

/// The pods of one run as observed by a single list call
#[derive(Clone, Debug, Default)]
pub struct PodSnapshot {
    pods: Vec<PodView>,
}

impl PodSnapshot {
    /// Wrap a pod listing
    pub fn new(pods: Vec<PodView>) -> Self {
        Self { pods }
    }

    /// Number of distinct pods in a terminal phase
    pub fn terminal_count(&self) -> usize {
        self.pods
            .iter()
            .filter(|p| p.phase.is_terminal())
            .map(|p| p.name.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Names of pods in an unsuccessful terminal phase
    pub fn failed_pods(&self) -> Vec<String> {
        self.pods
            .iter()
            .filter(|p| p.phase.is_unsuccessful())
            .map(|p| p.name.clone())
            .collect()
    }

    /// True when every discovered pod succeeded (and at least one exists)
    pub fn all_succeeded(&self) -> bool {
        !self.pods.is_empty() && self.pods.iter().all(|p| p.phase == PodPhase::Succeeded)
    }

    /// A hard failure: some pod failed while not all of them succeeded
    pub fn has_failure(&self) -> bool {
        !self.all_succeeded() && self.pods.iter().any(|p| p.phase.is_unsuccessful())
    }

    /// Complete when at least `replicas` pods are terminal and none of them
    /// failed. A Job may leave more pods behind than it has completions.
    pub fn is_complete(&self, replicas: u32) -> bool {
        self.terminal_count() >= replicas as usize && !self.has_failure()
    }
}

// =============================================================================
// Run
// =============================================================================

/// Per-run settings supplied by the owning framework
#[derive(Clone, Debug)]
pub struct RunSpec {
    /// Directory holding the run's output file and descriptor copy
    pub workdir: PathBuf,
    /// Output file name, relative to `workdir`
    pub stdout: String,
    /// Optional wall-clock limit measured from submission
    pub time_limit: Option<Duration>,
    /// Lines written to the output file before any pod output
    pub preamble: Vec<String>,
}

impl RunSpec {
    /// Settings with no time limit and no preamble
    pub fn new(workdir: impl Into<PathBuf>, stdout: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            stdout: stdout.into(),
            time_limit: None,
            preamble: Vec::new(),
        }
    }

    /// Set the time limit
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Add a preamble line
    pub fn with_preamble_line(mut self, line: impl Into<String>) -> Self {
        self.preamble.push(line.into());
        self
    }

    /// Full path of the output file
    pub fn output_path(&self) -> PathBuf {
        self.workdir.join(&self.stdout)
    }
}

/// One submitted workload tracked end-to-end
#[derive(Debug)]
pub struct Run {
    pub(crate) id: RunId,
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) context: Option<String>,
    pub(crate) kind: WorkloadKind,
    pub(crate) replica_count: u32,
    pub(crate) state: RunState,
    pub(crate) submit_time: Instant,
    pub(crate) cancel_time: Option<Instant>,
    pub(crate) time_limit: Option<Duration>,
    pub(crate) pending_error: Option<RunFailure>,
    pub(crate) output: PathBuf,
    pub(crate) descriptor_copy: PathBuf,
    pub(crate) collector: Option<LogCollector>,
    pub(crate) logs_settled: bool,
    pub(crate) torn_down: bool,
}

impl Run {
    /// Run identifier
    pub fn id(&self) -> &RunId {
        &self.id
    }

    /// Name of the submitted root object
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Target kubeconfig context, if one was selected
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Workload kind
    pub fn kind(&self) -> &WorkloadKind {
        &self.kind
    }

    /// Number of terminal pods required for completion
    pub fn replica_count(&self) -> u32 {
        self.replica_count
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.state
    }

    /// When the run was submitted
    pub fn submit_time(&self) -> Instant {
        self.submit_time
    }

    /// When cancellation was requested
    pub fn cancel_time(&self) -> Option<Instant> {
        self.cancel_time
    }

    /// Configured time limit
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    /// The stored failure, if any
    pub fn pending_error(&self) -> Option<&RunFailure> {
        self.pending_error.as_ref()
    }

    /// Path of the output file
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Path of the persisted descriptor copy
    pub fn descriptor_copy(&self) -> &Path {
        &self.descriptor_copy
    }

    /// Whether teardown has finished
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Label selector matching every object of this run
    pub fn selector(&self) -> String {
        self.id.selector()
    }

    /// Re-raise the stored failure
    pub fn raise_pending(&self) -> Result<(), RunError> {
        match &self.pending_error {
            Some(failure) => Err(RunError::Failed(failure.clone())),
            None => Ok(()),
        }
    }

    /// Move to a new state. Terminal states are absorbing.
    pub(crate) fn transition(&mut self, next: RunState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = next;
    }

    /// Enter a failing terminal state and store its error (only the first is kept)
    pub(crate) fn fail(&mut self, next: RunState, failure: RunFailure) {
        if self.state.is_terminal() {
            return;
        }
        self.state = next;
        if self.pending_error.is_none() {
            self.pending_error = Some(failure);
        }
    }
}
