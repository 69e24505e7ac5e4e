use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use quota_sync::engine::BonusLedger;
use quota_sync::error::Error;
use quota_sync::persistence::PersistenceConfig;
use quota_sync::types::UserId;

/// Bonus ledger administration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the bonus ledger
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add to a user's bonus (default 1)
    Add {
        user: UserId,
        #[arg(allow_negative_numbers = true)]
        amount: Option<i64>,
    },
    /// Replace a user's bonus (0 clears it)
    Set {
        user: UserId,
        #[arg(allow_negative_numbers = true)]
        amount: i64,
    },
    /// Show a user's bonus
    Check { user: UserId },
    /// List every non-zero bonus
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    debug!("quota-sync v{}", env!("CARGO_PKG_VERSION"));

    let ledger = BonusLedger::open(&PersistenceConfig::new(&cli.data_dir))?;

    match cli.command {
        Command::Add { user, amount } => {
            let amount = amount.unwrap_or(1);
            if amount <= 0 {
                return Err(Error::Validation(format!(
                    "amount must be positive (got {})",
                    amount
                ))
                .into());
            }
            let bonus = ledger.add(user, amount as u64)?;
            println!("{} now has {} bonus", user, bonus);
        }
        Command::Set { user, amount } => {
            let bonus = ledger.set(user, amount)?;
            println!("{} bonus set to {}", user, bonus);
        }
        Command::Check { user } => {
            println!("{} has {} bonus", user, ledger.get(user));
        }
        Command::List => {
            let mut entries: Vec<(UserId, u64)> = ledger.list_all().into_iter().collect();
            if entries.is_empty() {
                println!("No bonuses recorded");
            }
            entries.sort_unstable();
            for (user, bonus) in entries {
                println!("{}: {}", user, bonus);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ledger_flags() {
        let cli = Cli::try_parse_from([
            "quota-sync",
            "--data-dir",
            "/tmp/bonus",
            "--log-level",
            "debug",
            "set",
            "6f1c1a3e-2a9b-4d55-9f5e-2b8c3b1f0a77",
            "-2",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, PathBuf::from("/tmp/bonus"));
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Command::Set { amount: -2, .. }));
    }

    #[test]
    fn test_rejects_engine_only_flags() {
        for flag in [
            "--reconcile-delay-ms",
            "--join-delay-ms",
            "--max-write-attempts",
            "--write-retry-delay-ms",
            "--channel-size",
            "--shutdown-grace-ms",
            "--quota-prefix",
        ] {
            let parsed = Cli::try_parse_from(["quota-sync", flag, "1", "list"]);
            assert!(parsed.is_err(), "{} should be rejected", flag);
        }
    }
}
