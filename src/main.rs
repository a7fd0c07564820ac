//! Vibeflow CLI entry point.
//!
//! Exit codes: 0 success, 2 usage error (clap), 3 configuration error,
//! 4 runtime failure.

use clap::Parser;

use vibeflow::cli::{commands, Cli, Commands};
use vibeflow::domain::errors::OrchestratorError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start { workers, no_stdio } => {
            commands::handle_start(cli.config.as_deref(), workers, !no_stdio).await
        }
        Commands::Stop => commands::handle_stop(cli.json),
        Commands::Status { plan } => {
            commands::handle_status(cli.config.as_deref(), plan, cli.json).await
        }
        Commands::Subscribe { job_id, endpoint } => {
            commands::handle_subscribe(cli.config.as_deref(), job_id, endpoint, cli.json).await
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(if is_config_error(&err) { 3 } else { 4 });
    }
}

fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<OrchestratorError>()
            .is_some_and(|e| e.kind() == "config")
            || cause.downcast_ref::<figment::Error>().is_some()
    })
}
