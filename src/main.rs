use anyhow::Result;
use clap::Parser;
use release_screens::{
    install_signal_handlers, run_worker, setup_logging, CancellationScope, Cli, CliRunner,
    Commands, Config,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Worker processes speak the line protocol on stdio and nothing else.
    if matches!(args.command, Commands::OptimizeWorker) {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        run_worker(stdin.lock(), stdout.lock())?;
        return Ok(());
    }

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting release-screens v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(&args).await?;

    // Setup graceful shutdown
    let scope = CancellationScope::new(config.kill_grace_period);
    let signal_handler = install_signal_handlers(scope.clone())?;

    let cli_runner = CliRunner::new(config, &args, scope.clone());
    cli_runner.config.validate()?;
    let result = cli_runner.run(args.command).await;

    // Let a signal-triggered cleanup finish before exiting.
    if let Some(report) = signal_handler.shutdown().await {
        info!(
            "Shut down after signal ({} processes terminated, {} killed)",
            report.terminated, report.killed
        );
    }

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config> {
    let config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };

    info!("Configuration loaded successfully");
    info!("Screenshots per release: {}", config.screenshot_count);
    info!(
        "Image hosts: {}",
        if config.hosts.is_empty() {
            "none".to_string()
        } else {
            config.host_names().join(", ")
        }
    );

    Ok(config)
}
