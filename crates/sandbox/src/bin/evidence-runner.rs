use clap::Parser;
use evidence_sandbox::runner::{self, RunnerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runner::init_tracing();
    let args = RunnerArgs::parse();
    // Returning ends the process even if an isolate thread is still spinning
    // towards its loop limit.
    runner::run(args).await
}
