//! Command line interface

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kuberun_common::Document;
use kuberun_job::tagger::{tag_descriptor, RunTag};
use kuberun_job::{
    ControllerConfig, KubeOrchestrator, RunController, RunId, RunSpec, RunState, WorkloadKind,
};

/// kuberun - run a workload on Kubernetes and wait for it to finish
#[derive(Parser, Debug)]
#[command(name = "kuberun", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a descriptor, stream its lifecycle to the log, and tear it down
    ///
    /// Ctrl-C cancels the run: after a short grace period its pod logs are
    /// dumped and every object it created is deleted.
    Run(RunArgs),

    /// Print the tagged descriptor without submitting it
    Tag(TagArgs),
}

/// Arguments of `kuberun run`
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workload descriptor (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,

    /// Target namespace (defaults to the context's namespace, then "default")
    #[arg(short = 'n', long)]
    pub namespace: Option<String>,

    /// Kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Path to kubeconfig (falls back to $KUBERUN_KUBECONFIG, then kube defaults)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Controller settings file (YAML or JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Fail the run if it takes longer than this many seconds
    #[arg(long)]
    pub time_limit_secs: Option<u64>,

    /// Directory for the output file and the submitted descriptor copy
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Output file name, relative to the workdir
    #[arg(short = 'o', long, default_value = "kuberun.out")]
    pub output: String,

    /// Line written to the output file before any pod output (repeatable)
    #[arg(long = "preamble")]
    pub preamble: Vec<String>,
}

/// Arguments of `kuberun tag`
#[derive(Args, Debug)]
pub struct TagArgs {
    /// Workload descriptor (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,

    /// Run identifier to apply (generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Prefix of the derived root name
    #[arg(long, default_value = kuberun_job::config::DEFAULT_RUN_PREFIX)]
    pub prefix: String,
}

impl Commands {
    /// Execute the subcommand
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Commands::Run(args) => {
                let state = run(args).await?;
                info!(state = %state, "run finished");
                if state == RunState::Cancelled {
                    anyhow::bail!("run cancelled");
                }
                Ok(())
            }
            Commands::Tag(args) => {
                print!("{}", tag(&args)?);
                Ok(())
            }
        }
    }
}

/// Submit a descriptor and wait for its run to end
pub async fn run(args: RunArgs) -> anyhow::Result<RunState> {
    let config = match &args.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    let descriptor = Document::read(&args.file)
        .with_context(|| format!("failed to load descriptor {}", args.file.display()))?;

    let orchestrator = KubeOrchestrator::connect(
        args.kubeconfig.as_deref(),
        args.namespace.as_deref(),
        args.context.as_deref(),
    )
    .await?;
    let controller = RunController::with_config(Arc::new(orchestrator), config);

    let mut spec = RunSpec::new(&args.workdir, &args.output);
    spec.time_limit = args.time_limit_secs.map(Duration::from_secs);
    spec.preamble = args.preamble;

    let mut run = controller.submit(&descriptor, spec).await?;
    info!(
        run = %run.id(),
        name = %run.name(),
        namespace = %run.namespace(),
        output = %run.output().display(),
        "waiting for run"
    );

    let interrupt = CancellationToken::new();
    let signal = tokio::spawn(cancel_on_ctrl_c(interrupt.clone(), run.id().clone()));
    let result = controller.wait_interruptible(&mut run, &interrupt).await;
    signal.abort();

    Ok(result?)
}

/// Cancel `interrupt` on the first Ctrl-C. The run is still torn down
/// before `kuberun run` exits.
async fn cancel_on_ctrl_c(interrupt: CancellationToken, run: RunId) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!(run = %run, "interrupted, cancelling run");
        interrupt.cancel();
    }
}

/// Tag a descriptor and render it in its original format
pub fn tag(args: &TagArgs) -> anyhow::Result<String> {
    let descriptor = Document::read(&args.file)
        .with_context(|| format!("failed to load descriptor {}", args.file.display()))?;
    let id = match &args.id {
        Some(id) => RunId::new(id.as_str())?,
        None => RunId::generate(),
    };

    let tagged = tag_descriptor(&descriptor.value, &RunTag::new(id.clone(), &args.prefix))?;
    let (kind, replicas) = WorkloadKind::detect(&tagged)?;
    info!(run = %id, kind = %kind, replicas, "descriptor tagged");

    Ok(Document::render(&tagged, descriptor.format)?)
}
