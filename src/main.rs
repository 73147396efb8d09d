use std::{path::PathBuf, process::ExitCode};

use ::tracing::{error, info, warn};
use anyhow::{Context, Result};
use blob_store::lint::{scoped_backend, LintAction, Linter};
use clap::{Parser, Subcommand};
use stowage::{
    analyzer::{AnalyzerInput, AnalyzerKind, AnalyzerRegistry},
    config::StowageConfig,
};

mod tracing;
use crate::tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check configured storages against the storage contract
    Lint {
        /// Only lint this storage
        #[arg(long)]
        storage: Option<String>,

        /// What to do on a violation; defaults to the configured action
        #[arg(long)]
        action: Option<LintAction>,
    },

    /// Print the metadata extracted from a local file as JSON
    Analyze {
        path: PathBuf,

        /// Analyzer to use instead of the configured one
        #[arg(long)]
        analyzer: Option<AnalyzerKind>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match StowageConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error loading config: {:?}", err);
                return ExitCode::FAILURE;
            }
        },
        None => StowageConfig::default(),
    };

    if let Err(err) = setup_tracing(&config) {
        eprintln!("error setting up tracing: {:?}", err);
    }

    let result = match cli.command {
        Command::Lint { storage, action } => lint(&config, storage, action).await,
        Command::Analyze { path, analyzer } => analyze(&config, path, analyzer).await,
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{:?}", err);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every linted storage conforms. Each run gets a fresh
/// scope inside the configured storage, so existing objects are left alone.
async fn lint(config: &StowageConfig, storage: Option<String>, action: Option<LintAction>) -> Result<bool> {
    let action = action.unwrap_or(config.lint.action);
    let keys = match storage {
        Some(key) => vec![key],
        None => config.storages.keys().cloned().collect(),
    };

    let mut conformant = true;
    for key in keys {
        let storage_config = config
            .storages
            .get(&key)
            .with_context(|| format!("storage {} is not configured", key))?;
        let backend = scoped_backend(storage_config)?;
        match Linter::new(backend.as_ref(), action, None).run().await {
            Ok(report) if report.is_conformant() => {
                info!(
                    storage = %key,
                    backend = %report.backend,
                    passed = report.passed,
                    skipped = ?report.skipped,
                    "storage conforms"
                );
            }
            Ok(report) => {
                conformant = false;
                for violation in &report.violations {
                    warn!(storage = %key, "{}", violation);
                }
            }
            Err(violation) => {
                conformant = false;
                error!(storage = %key, "{}", violation);
            }
        }
    }
    Ok(conformant)
}

async fn analyze(config: &StowageConfig, path: PathBuf, analyzer: Option<AnalyzerKind>) -> Result<bool> {
    let registry = AnalyzerRegistry::with_kind(analyzer.unwrap_or(config.analyzer));
    let mut file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let filename = path.file_name().map(|name| name.to_string_lossy().to_string());

    let mut input = AnalyzerInput::new(&mut file).with_filename(filename.as_deref());
    let metadata = registry.extract_metadata(&mut input).await?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(true)
}
