//! nixpkgs-review - build the packages a nixpkgs change rebuilds.
//!
//! Main entry point for the CLI binary.

use clap::Parser;
use mimalloc::MiMalloc;
use nixpkgs_review::{execute, Cli, ProcessRunner};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    // Logs go to stderr; stdout is reserved for reports and comments.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(async {
        // One cancellation token covers every child the review spawns;
        // a single SIGINT interrupts them all.
        let cancel = CancellationToken::new();
        let runner = ProcessRunner::new(cancel.clone());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, winding down");
                cancel.cancel();
            }
        });

        match execute(cli, runner).await {
            Ok(code) => code,
            Err(e) => {
                let code = e.exit_code();
                // One line, full cause chain.
                eprintln!("error: {:#}", eyre::Report::new(e));
                code
            }
        }
    });
    std::process::exit(code);
}
