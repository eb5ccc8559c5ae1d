//! Golden-event replay CLI
//!
//! # Usage
//! ```bash
//! replay --store-url redis://localhost:6379 \
//!   [--fixture-dir contracts/golden_events/v1] \
//!   [--fail-on-invalid] [--include-invalid] [--dry-run]
//! ```
//!
//! Exit codes: 0 success, 2 any mismatched expected/validation outcome,
//! 3 store unreachable.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use event_bus::{RedisLog, SchemaRegistry, StreamLog, EXIT_STORE_UNREACHABLE};
use golden_replay::{run_replay, ReplayError, ReplayMode};
use tracing_subscriber::EnvFilter;

const EXIT_MISMATCH: u8 = 2;

struct Args {
    store_url: Option<String>,
    fixture_dir: PathBuf,
    mode: ReplayMode,
    dry_run: bool,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let argv: Vec<String> = env::args().collect();

        let mut store_url = None;
        let mut fixture_dir = PathBuf::from("contracts/golden_events/v1");
        let mut mode: ReplayMode = env::var("REPLAY_MODE")
            .ok()
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or_default();
        let mut dry_run = false;

        let mut i = 1;
        while i < argv.len() {
            match argv[i].as_str() {
                "--store-url" => {
                    store_url = Some(
                        argv.get(i + 1)
                            .ok_or("--store-url requires a value")?
                            .clone(),
                    );
                    i += 2;
                }
                "--fixture-dir" => {
                    fixture_dir = PathBuf::from(
                        argv.get(i + 1)
                            .ok_or("--fixture-dir requires a value")?,
                    );
                    i += 2;
                }
                "--fail-on-invalid" => {
                    mode = ReplayMode::FailOnInvalid;
                    i += 1;
                }
                "--include-invalid" => {
                    mode = ReplayMode::IncludeInvalid;
                    i += 1;
                }
                "--dry-run" => {
                    dry_run = true;
                    i += 1;
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        if store_url.is_none() && !dry_run {
            return Err("--store-url is required unless --dry-run is set".to_string());
        }

        Ok(Args {
            store_url,
            fixture_dir,
            mode,
            dry_run,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(error) => {
            eprintln!("{error}");
            eprintln!(
                "usage: replay --store-url <url> [--fixture-dir <path>] \
                 [--fail-on-invalid] [--include-invalid] [--dry-run]"
            );
            return ExitCode::from(EXIT_MISMATCH);
        }
    };

    let log: Option<Arc<dyn StreamLog>> = if args.dry_run {
        None
    } else {
        // store_url presence was checked at parse time.
        let url = args.store_url.as_deref().unwrap_or_default();
        match RedisLog::connect(url).await {
            Ok(log) => Some(Arc::new(log)),
            Err(error) => {
                eprintln!("store unreachable: {error}");
                return ExitCode::from(EXIT_STORE_UNREACHABLE as u8);
            }
        }
    };

    let registry = SchemaRegistry::with_core_streams();
    match run_replay(&args.fixture_dir, args.mode, &registry, log).await {
        Ok(summary) => {
            println!(
                "total={} valid={} invalid={} published={} skipped={} failed={}",
                summary.total,
                summary.valid,
                summary.invalid,
                summary.published,
                summary.skipped,
                summary.failed
            );
            if summary.failed > 0 {
                ExitCode::from(EXIT_MISMATCH)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(error @ ReplayError::StoreUnavailable(_)) => {
            eprintln!("{error}");
            ExitCode::from(EXIT_STORE_UNREACHABLE as u8)
        }
        Err(error) => {
            eprintln!("{error}");
            ExitCode::from(EXIT_MISMATCH)
        }
    }
}
