//! kuberun - run a workload on Kubernetes and wait for it to finish

use clap::Parser;

use kuberun::cli::Cli;
use kuberun::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    cli.command.execute().await
}
