use std::process;

use cosmian_card_signer_cli::{
    config::ClapConfig, error::CliResult, exit_code, initialize_telemetry, run,
};

fn main() {
    let result = main_();
    if let Err(err) = &result {
        eprintln!("ERROR: {err}");
    }
    let code = exit_code(&result);
    if code != 0 {
        process::exit(code);
    }
}

fn main_() -> CliResult<bool> {
    let config = ClapConfig::load_from_file()?;
    initialize_telemetry(&config)?;
    let (report, _artifacts) = run(config)?;
    Ok(report.outcome.is_valid())
}
