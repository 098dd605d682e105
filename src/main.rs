use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use scripter_dispatcher::bus::RedisBus;
use scripter_dispatcher::config::DispatcherConfig;
use scripter_dispatcher::dispatch::DispatcherHost;
use scripter_dispatcher::runner::ProcessLauncher;
use scripter_dispatcher::status::serve_status;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatcherConfig::from_env().context("invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("Scripter dispatcher v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Bus: {}", config.redis_url);
    eprintln!("   Runners: {} x {}", config.runner_count, config.runner_command);
    eprintln!(
        "   Deadline: {}ms (guard {}ms)",
        config.execution_timeout.as_millis(),
        config.timeout_guard.as_millis()
    );

    let bus = Arc::new(
        RedisBus::connect(&config.redis_url)
            .await
            .with_context(|| format!("failed to connect to {}", config.redis_url))?,
    );
    let launcher = Arc::new(ProcessLauncher::new(
        config.runner_command.clone(),
        config.redis_url.clone(),
    ));

    let host = DispatcherHost::from_config(&config, bus, launcher);
    tracing::info!(host = %host.host_id(), "Dispatcher host created");

    if let Some(port) = config.status_port {
        let stats = host.stats();
        eprintln!("   Status: http://0.0.0.0:{}/status", port);
        tokio::spawn(async move {
            if let Err(e) = serve_status(port, stats).await {
                tracing::error!(port, error = %e, "Status server stopped");
            }
        });
    }

    host.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    Ok(())
}

/// Console logging, plus a daily-rolled file when `SCRIPTER_LOG_DIR` is set.
fn init_tracing(config: &DispatcherConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_log_filter()));
    let console = fmt::layer().with_target(false);

    match std::env::var("SCRIPTER_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "scripter-dispatcher.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
