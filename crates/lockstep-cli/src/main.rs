mod output;
mod setup;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lockstep_config::{AppConfig, ConfigLoader, LoggingConfig};
use lockstep_db::{Migrator, RunReport};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Pause between lock attempts while `migrate --wait` is in effect.
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Exit status when another instance holds the migration lock.
const EXIT_LOCKED: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "lockstep",
    version,
    about = "Apply schema migrations exactly once across a service fleet"
)]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ./lockstep.yml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "LOCKSTEP_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// Directory holding the migration scripts
    #[arg(long, env = "LOCKSTEP_MIGRATIONS_DIR", global = true)]
    dir: Option<PathBuf>,

    /// Name recorded as the lock holder
    #[arg(long, env = "LOCKSTEP_IDENTITY", global = true)]
    identity: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log filter, e.g. `debug` or `lockstep_db=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply all pending migrations
    Migrate {
        /// Keep retrying for up to this many seconds while another instance holds the lock
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,

        /// Run scripts outside a transaction (for scripts with their own BEGIN/COMMIT)
        #[arg(long)]
        no_transaction: bool,
    },
    /// Show the lock holder, applied and pending migrations
    Status,
    /// Release the migration lock
    Unlock {
        /// Clear the lock whoever holds it
        #[arg(long)]
        force: bool,
    },
    /// Create the lock and ledger tables
    Init {
        /// Also write the effective configuration to ./lockstep.yml
        #[arg(long)]
        write_config: bool,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging, cli.log_level.as_deref());

    match execute(&cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let contention = e
                .downcast_ref::<lockstep_common::Error>()
                .is_some_and(|e| e.is_lock_contention());
            if contention {
                ExitCode::from(EXIT_LOCKED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Config file (explicit or discovered) with command-line overrides on top.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load(path)?,
        None => ConfigLoader::discover()?,
    };

    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    if let Some(dir) = &cli.dir {
        config.migrations.dir = dir.clone();
    }
    if let Some(identity) = &cli.identity {
        config.identity = Some(identity.clone());
    }
    if let Command::Migrate {
        no_transaction: true,
        ..
    } = cli.command
    {
        config.migrations.transactional = false;
    }
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn execute(cli: &Cli, config: AppConfig) -> Result<()> {
    let migrator = Migrator::from_config(&config).with_context(|| {
        format!("failed to open database {}", config.database.path.display())
    })?;

    match &cli.command {
        Command::Migrate { wait, .. } => {
            let deadline = wait.map(|secs| Instant::now() + Duration::from_secs(secs));
            let report = migrate(&migrator, deadline)?;
            output::print_report(&report, cli.json)
        }
        Command::Status => {
            let status = migrator.status().context("failed to read migration status")?;
            output::print_status(&status, cli.json)
        }
        Command::Unlock { force } => {
            if *force {
                let previous = migrator.force_unlock().context("failed to clear lock")?;
                output::print_unlock(previous.as_ref(), cli.json)
            } else {
                if config.identity.is_none() {
                    bail!("unlock needs --identity naming the holder, or --force");
                }
                migrator.release().context("failed to release lock")?;
                info!("lock released by {}", migrator.identity());
                Ok(())
            }
        }
        Command::Init { write_config } => {
            migrator.bootstrap().context("failed to create migration tables")?;
            println!("migration tables ready in {}", config.database.path.display());
            if *write_config {
                setup::write_config(&config, Path::new(setup::CONFIG_FILE))?;
            }
            Ok(())
        }
    }
}

/// Run once, or keep retrying on lock contention until `deadline`.
fn migrate(migrator: &Migrator, deadline: Option<Instant>) -> Result<RunReport> {
    loop {
        match migrator.run() {
            Err(e) if e.is_lock_contention() && deadline.is_some_and(|d| Instant::now() < d) => {
                info!("{e}; retrying in {}s", RETRY_INTERVAL.as_secs());
                std::thread::sleep(RETRY_INTERVAL);
            }
            result => return result.context("migration run failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lockstep.yml");
        std::fs::write(
            &config_path,
            "database:\n  path: from-file.db\nmigrations:\n  dir: from-file\nidentity: file-id\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "lockstep",
            "--config",
            config_path.to_str().unwrap(),
            "--database",
            "flag.db",
            "--identity",
            "flag-id",
            "migrate",
            "--no-transaction",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();

        assert_eq!(config.database.path, Path::new("flag.db"));
        assert_eq!(config.migrations.dir, Path::new("from-file"));
        assert_eq!(config.identity.as_deref(), Some("flag-id"));
        assert!(!config.migrations.transactional);
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["lockstep", "migrate", "--wait", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Migrate {
                wait: Some(30),
                no_transaction: false
            }
        ));

        let cli = Cli::try_parse_from(["lockstep", "unlock", "--force", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Unlock { force: true }));
        assert!(cli.json);

        assert!(Cli::try_parse_from(["lockstep"]).is_err());
    }

    fn cli_for(dir: &Path, args: &[&str]) -> Cli {
        let db = dir.join("app.db");
        let migrations = dir.join("migrations");
        let mut argv = vec![
            "lockstep".to_string(),
            "--config".to_string(),
            dir.join("empty.yml").display().to_string(),
            "--database".to_string(),
            db.display().to_string(),
            "--dir".to_string(),
            migrations.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn migrate_then_unlock_round() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.yml"), "").unwrap();
        std::fs::create_dir(dir.path().join("migrations")).unwrap();
        std::fs::write(
            dir.path().join("migrations/0001_a.up.sql"),
            "CREATE TABLE a (id INTEGER);",
        )
        .unwrap();

        let cli = cli_for(dir.path(), &["--identity", "svc-A", "migrate"]);
        execute(&cli, load_config(&cli).unwrap()).unwrap();

        let cli = cli_for(dir.path(), &["status", "--json"]);
        execute(&cli, load_config(&cli).unwrap()).unwrap();

        // plain unlock without an identity is refused
        let cli = cli_for(dir.path(), &["unlock"]);
        let err = execute(&cli, load_config(&cli).unwrap()).unwrap_err();
        assert!(err.to_string().contains("--identity"));

        let cli = cli_for(dir.path(), &["unlock", "--force"]);
        execute(&cli, load_config(&cli).unwrap()).unwrap();
    }

    #[test]
    fn contention_error_is_detectable_through_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.yml"), "").unwrap();
        std::fs::create_dir(dir.path().join("migrations")).unwrap();

        let cli = cli_for(dir.path(), &["--identity", "svc-B", "migrate"]);
        let config = load_config(&cli).unwrap();

        let holder = Migrator::from_config(&AppConfig {
            identity: Some("svc-A".into()),
            ..config.clone()
        })
        .unwrap();
        let _guard = holder.acquire().unwrap();

        let err = migrate(&Migrator::from_config(&config).unwrap(), None).unwrap_err();
        assert!(
            err.downcast_ref::<lockstep_common::Error>()
                .is_some_and(|e| e.is_lock_contention())
        );
    }
}
