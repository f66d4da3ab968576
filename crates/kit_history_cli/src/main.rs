//! CLI smoke entry point.
//!
//! # Responsibility
//! - Run the kit fixture end to end against the configured store.
//! - Print the resulting kits with their history as JSON.
//!
//! Storage and logging come from `KIT_HISTORY_DB_PATH`,
//! `KIT_HISTORY_LOG_LEVEL` and `KIT_HISTORY_LOG_DIR`.

use kit_history_core::{init_logging_from_config, KitService, KitStatus, StoreConfig};
use log::error;
use std::process::ExitCode;

const FIXTURE_CODE: &str = "SK_CODE";
const FIXTURE_BARCODE: &str = "SK_BARCODE";

fn main() -> ExitCode {
    let config = StoreConfig::from_env();
    if let Err(err) = init_logging_from_config(&config) {
        eprintln!("logging disabled: {err}");
    }

    match run(&config) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("event=cli_run module=cli status=error error={err}");
            eprintln!("kit_history_cli failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &StoreConfig) -> Result<String, Box<dyn std::error::Error>> {
    let mut service = KitService::new(config.open_session()?);

    service.reset()?;
    let kit = service.register_kit(FIXTURE_CODE, FIXTURE_BARCODE)?;
    service.record_status(kit.id(), KitStatus::Active)?;

    let kits = service.list_with_history()?;
    let snapshots: Vec<_> = kits.iter().map(|kit| kit.snapshot()).collect();
    Ok(serde_json::to_string_pretty(&serde_json::json!({
        "version": kit_history_core::core_version(),
        "kits": snapshots,
    }))?)
}
