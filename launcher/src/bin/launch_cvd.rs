//! `launch_cvd`: bring up one Cuttlefish instance.

use clap::Parser;
use clap::error::ErrorKind;
use cvd_launcher::{LaunchArgs, LaunchFailure, LaunchOutcome};

fn main() {
    cvd_launcher::util::init_logging();

    let args = match LaunchArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let failure = LaunchFailure::ArgumentParsing(e.to_string());
            let _ = e.print();
            std::process::exit(failure.exit_code());
        }
    };

    let code = match cvd_launcher::run(&args) {
        Ok(LaunchOutcome::BootCompleted) => {
            tracing::info!("Virtual device booted successfully");
            0
        }
        Ok(LaunchOutcome::Stopped) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
