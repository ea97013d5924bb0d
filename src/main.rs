use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dvs::cli::{Cli, Commands};
use dvs::core::image::host_arch;
use dvs::core::snapshot::Mode;
use dvs::core::{DockerEngine, SnapshotError, SnapshotOptions, SnapshotReport, Snapshotter};
use dvs::utils::{format_bytes, format_duration, AppConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_exit_status(&e));
        }
    };

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), error_message(&e));
            ExitCode::FAILURE
        }
    }
}

/// Help and version go to stdout and are not failures; usage errors exit 1
fn parse_exit_status(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        1
    } else {
        0
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dvs={}", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load()?;

    let mut image = config.image_options();
    if cli.offline {
        image.allow_pull = false;
    }

    let options = SnapshotOptions {
        image,
        timeout: cli.timeout.or(config.wait_timeout()?),
    };

    let arch = host_arch()?;
    let engine = DockerEngine::connect()
        .map_err(|e| SnapshotError::EngineUnreachable(e.to_string()))
        .context("Unable to create Docker client")?;
    let snapshotter = Snapshotter::new(&engine, options, arch);

    match cli.command {
        Commands::Create {
            source_volume,
            destination_file,
        } => {
            let spinner = spinner(format!("Creating snapshot of volume: {}", source_volume));
            let operation = snapshotter.create_snapshot(&source_volume, &destination_file);
            let report = until_interrupted(operation, &spinner).await?;
            print_report(&report, &destination_file);
        }
        Commands::Restore {
            snapshot_file,
            destination_volume,
        } => {
            let spinner = spinner(format!("Restoring snapshot from: {}", snapshot_file.display()));
            let operation = snapshotter.restore_snapshot(&snapshot_file, &destination_volume);
            let report = until_interrupted(operation, &spinner).await?;
            print_report(&report, &snapshot_file);
        }
    }

    Ok(())
}

/// Await the operation, giving up on Ctrl-C. The helper container, if any,
/// keeps running and is removed by the engine once it exits.
async fn until_interrupted<F>(operation: F, spinner: &ProgressBar) -> Result<SnapshotReport>
where
    F: std::future::Future<Output = Result<SnapshotReport, SnapshotError>>,
{
    let result = tokio::select! {
        result = operation => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            Err(anyhow::anyhow!("Interrupted; any running helper container is removed by Docker when it exits"))
        }
    };

    spinner.finish_and_clear();
    result
}

fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} ({elapsed})") {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

fn print_report(report: &SnapshotReport, requested: &Path) {
    let elapsed = format_duration(report.elapsed.as_secs());

    match report.mode {
        Mode::Create => {
            // Only meaningful when the daemon shares this filesystem
            let size = std::fs::metadata(&report.archive)
                .map(|m| format!(", {}", format_bytes(m.len())))
                .unwrap_or_default();

            println!(
                "{} Snapshot created at {} ({}{}, {})",
                "✓".green(),
                requested.display(),
                report.format,
                size,
                elapsed
            );
        }
        Mode::Restore => {
            println!(
                "{} Snapshot restored to volume: {} ({})",
                "✓".green(),
                report.volume,
                elapsed
            );
        }
    }
}

fn error_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<SnapshotError>() {
        Some(SnapshotError::VolumeInUse { volume, containers }) => {
            let mut message = format!(
                "Volume '{}' is in use by the following container(s). Please stop them and try again.\n",
                volume
            );
            for container in containers {
                message.push_str(&format!("\n{}", container));
            }
            message
        }
        _ => format!("{:#}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvs::core::error::BlockingContainer;

    #[test]
    fn test_usage_errors_exit_one() {
        let err = Cli::try_parse_from(["dvs", "create", "vol1"]).unwrap_err();
        assert_eq!(parse_exit_status(&err), 1);

        let err = Cli::try_parse_from(["dvs", "snapshot", "vol1", "a.tar"]).unwrap_err();
        assert_eq!(parse_exit_status(&err), 1);
    }

    #[test]
    fn test_help_and_version_exit_zero() {
        let err = Cli::try_parse_from(["dvs", "--help"]).unwrap_err();
        assert_eq!(parse_exit_status(&err), 0);

        let err = Cli::try_parse_from(["dvs", "--version"]).unwrap_err();
        assert_eq!(parse_exit_status(&err), 0);
    }

    #[test]
    fn test_volume_in_use_lists_each_container() {
        let err = anyhow::Error::from(SnapshotError::VolumeInUse {
            volume: "vol1".to_string(),
            containers: vec![
                BlockingContainer {
                    name: "app1".to_string(),
                    short_id: "0123456789ab".to_string(),
                },
                BlockingContainer {
                    name: "app2".to_string(),
                    short_id: "fedcba987654".to_string(),
                },
            ],
        });

        assert_eq!(
            error_message(&err),
            "Volume 'vol1' is in use by the following container(s). Please stop them and try again.\n\n\
             app1 (0123456789ab)\n\
             app2 (fedcba987654)"
        );
    }

    #[test]
    fn test_other_errors_keep_context_chain() {
        let err = anyhow::Error::from(SnapshotError::EngineUnreachable("connection refused".to_string()))
            .context("Unable to create Docker client");

        let message = error_message(&err);
        assert!(message.starts_with("Unable to create Docker client: Unable to reach the Docker daemon"));
        assert!(message.ends_with("Ensure that the Docker daemon is up and running."));
    }
}
