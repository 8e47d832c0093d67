//! CLI binary for running and checking Volley toss files.

mod toss_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, Registry};

use volley_engine::settings::ENV_REGISTRY_URL;
use volley_engine::{
    builtin_registry, EngineSettings, FileSnapshotStore, HttpRegistry, InMemoryRegistry,
    InteractionRegistry, LogLevelControl, ReqwestTransport, TossSpec, Tosser,
};
use volley_types::{Verdict, VolleyError};

use crate::toss_file::TossFile;

#[derive(Parser)]
#[command(name = "volley", version, about = "HTTP contract-testing toss runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run toss files concurrently and print a verdict for each
    Run {
        /// Toss files (JSON)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Base URL of a remote interaction registry (default: in-memory)
        #[arg(long)]
        registry: Option<String>,

        /// Directory holding JSON snapshots
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Overwrite stored snapshots with the actual responses
        #[arg(long)]
        update_snapshots: bool,

        /// Timeout for requests that do not set their own
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Run files one after another, in the order given
        #[arg(long)]
        sequential: bool,
    },

    /// Parse toss files without sending anything
    Check {
        /// Toss files (JSON)
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Log level control backed by a reloadable filter
// ---------------------------------------------------------------------------

/// Overrides swap in a single-level filter; `reset` rebuilds the startup
/// filter from its directives, per-target ones included.
struct ReloadableLevel {
    handle: reload::Handle<EnvFilter, Registry>,
    baseline: String,
}

impl ReloadableLevel {
    fn reload(&self, filter: EnvFilter) {
        if let Err(e) = self.handle.reload(filter) {
            tracing::warn!(error = %e, "Failed to change log level");
        }
    }
}

impl LogLevelControl for ReloadableLevel {
    fn apply(&self, level: LevelFilter) {
        self.reload(EnvFilter::default().add_directive(level.into()));
    }

    fn reset(&self) {
        self.reload(EnvFilter::new(&self.baseline));
    }
}

/// Directives of the startup filter: `RUST_LOG` when it parses, else the
/// verbosity default.
fn baseline_directives(verbose: bool) -> String {
    std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|raw| EnvFilter::try_new(raw).is_ok())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let baseline = baseline_directives(cli.verbose);
    let (filter, handle) = reload::Layer::new(EnvFilter::new(&baseline));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let levels = Arc::new(ReloadableLevel { handle, baseline });

    match cli.command {
        Commands::Run {
            files,
            registry,
            snapshot_dir,
            update_snapshots,
            timeout_ms,
            sequential,
        } => {
            let mut settings = EngineSettings::from_env()?;
            if registry.is_some() {
                settings.registry_url = registry;
            }
            if let Some(dir) = snapshot_dir {
                settings.snapshot_dir = dir;
            }
            if update_snapshots {
                settings.update_snapshots = true;
            }
            if let Some(ms) = timeout_ms {
                settings.request_timeout_ms = ms;
            }
            let all_passed = cmd_run(&files, settings, levels, sequential).await?;
            if !all_passed {
                std::process::exit(1);
            }
        }
        Commands::Check { files } => {
            cmd_check(&files)?;
        }
    }

    Ok(())
}

fn label_for(path: &Path, file: &TossFile) -> String {
    file.name
        .clone()
        .unwrap_or_else(|| path.display().to_string())
}

/// Interactions have nowhere to go without a registry the service under test
/// also talks to.
fn require_registry(specs: &[(String, TossSpec)], settings: &EngineSettings) -> volley_types::Result<()> {
    if settings.registry_url.is_some() {
        return Ok(());
    }
    match specs.iter().find(|(_, spec)| !spec.interactions.is_empty()) {
        Some((label, _)) => Err(VolleyError::Config(format!(
            "toss '{label}' declares interactions but no interaction registry is configured \
             (--registry or {ENV_REGISTRY_URL})"
        ))),
        None => Ok(()),
    }
}

async fn cmd_run(
    files: &[PathBuf],
    settings: EngineSettings,
    levels: Arc<ReloadableLevel>,
    sequential: bool,
) -> anyhow::Result<bool> {
    let mut specs = Vec::with_capacity(files.len());
    for path in files {
        let file = TossFile::load(path)?;
        let label = label_for(path, &file);
        specs.push((label, file.into_spec()?));
    }
    require_registry(&specs, &settings)?;

    let registry: Arc<dyn InteractionRegistry> = match &settings.registry_url {
        Some(url) => Arc::new(HttpRegistry::new(url.clone())),
        None => Arc::new(InMemoryRegistry::new()),
    };
    let transport = Arc::new(ReqwestTransport::new(Duration::from_millis(
        settings.request_timeout_ms,
    )));
    let tosser = Tosser::new(transport, registry)
        .with_handlers(builtin_registry())
        .with_snapshot_store(Arc::new(FileSnapshotStore::new(&settings.snapshot_dir)))
        .with_settings(settings)
        .with_log_control(levels);

    let tosser = &tosser;
    let results = if sequential {
        let mut results = Vec::with_capacity(specs.len());
        for (label, spec) in specs {
            let result = tosser.execute(spec).await;
            results.push((label, result));
        }
        results
    } else {
        join_all(
            specs
                .into_iter()
                .map(|(label, spec)| async move { (label, tosser.execute(spec).await) }),
        )
        .await
    };

    let mut passed = 0;
    let mut failed = 0;
    for (label, result) in results {
        match result {
            Ok(output) => {
                passed += 1;
                println!(
                    "[{}] {} ({}ms)",
                    Verdict::Passed,
                    label,
                    output.report.duration_ms
                );
            }
            Err(e) => {
                failed += 1;
                println!("[{}] {}: {}", e.verdict(), label, e);
            }
        }
    }
    println!("\n{passed} passed, {failed} not passed");
    Ok(failed == 0)
}

fn cmd_check(files: &[PathBuf]) -> anyhow::Result<()> {
    let mut has_error = false;
    for path in files {
        match TossFile::load(path).and_then(|file| {
            let label = label_for(path, &file);
            file.into_spec().map(|spec| (label, spec))
        }) {
            Ok((label, spec)) => println!(
                "[OK] {}: {} {} ({} interactions)",
                label,
                spec.request.method,
                spec.request.url,
                spec.interactions.len()
            ),
            Err(e) => {
                has_error = true;
                println!("[ERROR] {}: {:#}", path.display(), e);
            }
        }
    }
    if has_error {
        std::process::exit(1);
    }
    Ok(())
}
