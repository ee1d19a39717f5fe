use anyhow::Result;
use clap::Parser;
use meetbot::{
    app,
    cli::{handle_sessions_command, handle_trigger_command, Cli, CliCommand},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Some(CliCommand::Version) => {
            println!("meetbot {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(CliCommand::Trigger(args)) => {
            handle_trigger_command(args).await?;
            return Ok(());
        }
        Some(CliCommand::Sessions(args)) => {
            handle_sessions_command(args)?;
            return Ok(());
        }
        None => {}
    }

    app::run_service().await
}
