//! zrebase command-line tool.
//!
//! Reconciles a replicated tree of ZFS boot-environment datasets with the
//! lineage of its source: every destination branch that the source shows as
//! a clone is moved aside and re-received as a clone of the shared ancestor.
//! Runs are dry by default; `--execute` applies the changes.

mod render;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use zrebase_core::backend::StorageBackend;
use zrebase_core::config::AppConfig;
use zrebase_core::controller::{Reconciler, RunMode};
use zrebase_core::report::RunReport;
use zrebase_core::zfs::ZfsBackend;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// zrebase command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "zrebase",
    version,
    about = "Reconcile a replicated boot-environment tree with its source lineage"
)]
struct Cli {
    /// Path to an optional TOML configuration file.
    #[arg(short, long, global = true, env = "ZREBASE_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG still takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile the destination root with the source root.
    Run(RunArgs),

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./zrebase.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Apply the changes. Without it the run only logs what it would do.
    #[arg(long, env = "ZREBASE_EXECUTE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    execute: bool,

    /// Classify branches only; never plans or runs a rebase step.
    #[arg(long, env = "ZREBASE_AUDIT", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    audit: bool,

    /// Source root, e.g. `rpool/zones/z1/ROOT`.
    #[arg(long, env = "ZREBASE_SOURCE_ROOT")]
    source_root: Option<String>,

    /// Destination root. Derived from `--dest-pool` when unset.
    #[arg(long, env = "ZREBASE_DEST_ROOT")]
    dest_root: Option<String>,

    /// Pool holding the replica; the destination root becomes
    /// `<dest-pool>/<source-root>`.
    #[arg(long, env = "ZREBASE_DEST_POOL")]
    dest_pool: Option<String>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        if self.audit {
            RunMode::Audit
        } else if self.execute {
            RunMode::Live
        } else {
            RunMode::DryRun
        }
    }

    /// Flags win over the file and the environment.
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(source) = &self.source_root {
            config.roots.source = Some(source.clone());
        }
        if let Some(dest) = &self.dest_root {
            config.roots.dest = Some(dest.clone());
        }
        if let Some(pool) = &self.dest_pool {
            config.roots.dest_pool = Some(pool.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The configured level is only known once the file is read; a broken
    // file is reported after logging is up.
    let loaded = load_config(cli.config.as_deref());
    let level = match (&loaded, cli.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(config), false) => config.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli, loaded).await {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, loaded: Result<AppConfig>) -> Result<u8> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output).map(|()| 0),
        Commands::Validate => cmd_validate(cli.config.as_deref(), loaded).map(|()| 0),
        Commands::Run(args) => {
            let mut config = loaded?;
            args.apply_to(&mut config);
            cmd_run(&config, &args).await
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Defaults, then the file (if any), then `ZREBASE_*` overrides.
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => {
            AppConfig::load_from_file(path).context("failed to load configuration file")?
        }
        None => AppConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Map a run's final status onto a process exit code.
fn exit_status(report: &RunReport) -> u8 {
    match report.final_status() {
        0 => 0,
        code => u8::try_from(code.clamp(1, 255)).unwrap_or(1),
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, args: &RunArgs) -> Result<u8> {
    let mode = args.mode();
    let zfs = ZfsBackend::new(&config.transfer);

    let report = reconcile(&zfs, config, mode).await?;

    if args.json {
        render::print_json(&report)?;
    } else {
        render::print_report(&report);
    }
    Ok(exit_status(&report))
}

async fn reconcile(
    backend: &dyn StorageBackend,
    config: &AppConfig,
    mode: RunMode,
) -> Result<RunReport> {
    let reconciler =
        Reconciler::from_config(backend, config).context("invalid configuration")?;
    reconciler
        .run(mode)
        .await
        .context("inventory failed, nothing was changed")
}

const DEFAULT_CONFIG: &str = r#"# zrebase configuration
# Every value below is the default unless marked as an example.

[roots]
# Source lineage root (authoritative). Example value.
source = "rpool/ROOT"
# Destination root. When unset it is derived as <dest_pool>/<source>.
# dest = "backup/rpool/ROOT"
# Pool holding the replica. Example value.
dest_pool = "backup"
# Structural container that is never treated as a branch.
container_name = "ROOT"

[rebase]
backup_suffix = ".bak"
# Property cleared before the rename and re-inherited on the backup.
# Set to "" to disable.
isolation_property = "zoned"
bootstrap_prefix = "zrebase"

[transfer]
zfs_bin = "zfs"
send_flags = ["-R"]
receive_flags = ["-u", "-e"]
# Set to [] to pipe send straight into receive.
buffer_command = ["mbuffer", "-q", "-m", "128M"]

[logging]
level = "info"
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!();
    println!("Next steps:");
    println!("  1. Set roots.source and roots.dest_pool (or roots.dest)");
    println!(
        "  2. Validate with: zrebase validate --config {}",
        output.display()
    );
    println!(
        "  3. Preview with:  zrebase run --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(path: Option<&Path>, loaded: Result<AppConfig>) -> Result<()> {
    match path {
        Some(path) => println!("Validating configuration: {}", path.display()),
        None => println!("Validating defaults and environment (no --config given)"),
    }
    println!();

    let config = loaded.context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));
    println!("  {}", style::success("Environment overrides applied"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All required fields are valid"));
    if config.transfer.buffer_command.is_empty() {
        println!(
            "  {}",
            style::warn("No buffer stage; send is piped straight into receive")
        );
    }

    let dest = config
        .derive_dest_root()
        .context("failed to derive destination root")?;
    println!();
    println!("{}", style::header("Configuration summary:"));
    println!("  Source root   : {}", config.roots.source.as_deref().unwrap_or("-"));
    println!("  Dest root     : {}", dest);
    println!("  Container     : {}", config.roots.container_name);
    println!("  Backup suffix : {}", config.rebase.backup_suffix);
    println!(
        "  Isolation prop: {}",
        config.rebase.isolation_property().unwrap_or("disabled")
    );
    println!("  zfs binary    : {}", config.transfer.zfs_bin);
    println!(
        "  Buffer        : {}",
        if config.transfer.buffer_command.is_empty() {
            "none".to_string()
        } else {
            config.transfer.buffer_command.join(" ")
        }
    );
    println!("  Log level     : {}", config.logging.level);
    println!();
    println!("{}", style::dim("Configuration is valid."));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_config_parses_and_validates() {
        let config: AppConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.derive_dest_root().unwrap().as_str(),
            "backup/rpool/ROOT"
        );
    }

    #[test]
    fn test_run_mode_selection() {
        let cli = Cli::parse_from(["zrebase", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode(), RunMode::DryRun);

        let cli = Cli::parse_from(["zrebase", "run", "--execute", "--audit"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.mode(), RunMode::Audit);
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "zrebase",
            "run",
            "--source-root",
            "tank/zones/z1/ROOT",
            "--dest-pool",
            "replica",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut config = AppConfig::default();
        args.apply_to(&mut config);
        assert_eq!(
            config.derive_dest_root().unwrap().as_str(),
            "replica/tank/zones/z1/ROOT"
        );
    }
}
