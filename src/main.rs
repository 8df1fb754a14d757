use std::str::FromStr;
use std::thread;

use chrono::Utc;
use cron::Schedule;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use packrat::config::Action;
use packrat::{BackupManager, Config, Error};

fn main() {
    dotenv::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(err) = run(config) {
        error!("{err}");
        std::process::exit(1);
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_file {
        Some(path) => {
            let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("ERROR: cannot open log file {}: {err}", path.display());
                    std::process::exit(1);
                }
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn run(config: Config) -> packrat::Result<()> {
    info!("Run packrat for '{}'", config.name);

    match config.action {
        Some(Action::Restore) => {
            let mut manager = BackupManager::new(config)?;
            if !manager.restore_backup(None, false)? {
                return Err(Error::Restore("restore failed".to_string()));
            }
            Ok(())
        }
        _ => match config.cron.clone() {
            Some(expression) => run_scheduled(config, &expression),
            None => {
                let mut manager = BackupManager::new(config)?;
                run_backup_cycle(&mut manager)
            }
        },
    }
}

/// One create -> prune -> optional rename pass.
fn run_backup_cycle(manager: &mut BackupManager) -> packrat::Result<()> {
    manager.create_backup()?;
    manager.prune_backups()?;
    if manager.config().rename_files {
        manager.rename_backups()?;
    }
    Ok(())
}

/// Keep running backup cycles on the configured cron schedule.
fn run_scheduled(config: Config, expression: &str) -> packrat::Result<()> {
    let schedule = Schedule::from_str(expression)
        .map_err(|e| Error::Config(format!("invalid cron expression '{expression}': {e}")))?;
    let mut manager = BackupManager::new(config)?;

    loop {
        let Some(next_time) = schedule.upcoming(Utc).next() else {
            info!("Cron schedule has no upcoming runs, exiting");
            return Ok(());
        };
        info!("Next backup will be performed at: {next_time}");

        if let Ok(wait) = (next_time - Utc::now()).to_std() {
            thread::sleep(wait);
        }

        if let Err(err) = run_backup_cycle(&mut manager) {
            error!("Backup cycle failed: {err}");
        }
    }
}
