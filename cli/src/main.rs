use std::sync::Arc;

use clap::Parser;
use harvest_cli::app;
use harvest_cli::commands::cli;
use harvest_core::api::{load_default, load_from_path, AppContext, CliError, LoggingConfig};
use harvest_plugins::services::PluginServicesFactory;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[tokio::main]
async fn main() {
    let exit = match real_main().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            exit_code_for_error(&e)
        }
    };

    std::process::exit(exit);
}

async fn real_main() -> Result<i32, CliError> {
    let args = cli::Args::parse();
    let mut cfg = match &args.config {
        Some(path) => load_from_path(path),
        None => load_default(),
    }
    .map_err(|e| CliError::Config(e.to_string()))?;
    if let Some(level) = &args.log_level {
        cfg.logging.level = level.clone();
    }
    init_tracing(&cfg.logging).map_err(CliError::Command)?;

    let ctx = AppContext::new(cfg, Some(Arc::new(PluginServicesFactory)))?;
    app::run_app(args.command, &ctx).await
}

fn exit_code_for_error(e: &CliError) -> i32 {
    // 0: success
    // 11: config error (including an invalid graph)
    // 20: runtime / IO error
    // 30: scheduler suspended after repeated cycle failures
    // 50: internal/uncategorized
    match e {
        CliError::Config(_) => 11,
        CliError::Executor(_) => 11,
        CliError::Io(_) => 20,
        CliError::Command(_) => 20,
        CliError::Suspended(_) => 30,
        CliError::Anyhow(_) => 50,
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), String> {
    if !logging.enabled {
        return Ok(());
    }

    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(logging.level.clone()).map_err(|e| e.to_string())?,
    };

    let mut maybe_writer = None;

    if logging.file {
        let dir = match logging
            .directory
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(d) => std::path::PathBuf::from(d),
            None => std::env::temp_dir().join("harvest"),
        };

        std::fs::create_dir_all(&dir).map_err(|e| format!("create log dir failed: {e}"))?;
        let file_name = format!("harvest.{}.log", std::process::id());
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        maybe_writer = Some(non_blocking);
    }

    if !logging.console && maybe_writer.is_none() {
        return Err("logging disabled for both console and file".to_string());
    }

    let console_layer = logging.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
    });

    let file_layer = maybe_writer.map(|w| {
        tracing_subscriber::fmt::layer()
            .with_writer(w)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::api::ExecutorError;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code_for_error(&CliError::Config("x".into())), 11);
        assert_eq!(
            exit_code_for_error(&CliError::Executor(ExecutorError::EmptyGraph)),
            11
        );
        assert_eq!(exit_code_for_error(&CliError::Suspended("x".into())), 30);
        assert_eq!(
            exit_code_for_error(&CliError::Anyhow(anyhow::anyhow!("x"))),
            50
        );
    }

    #[test]
    fn file_only_logging_without_file_is_rejected() {
        let logging = LoggingConfig {
            console: false,
            file: false,
            ..LoggingConfig::default()
        };
        assert!(init_tracing(&logging).is_err());
    }
}
