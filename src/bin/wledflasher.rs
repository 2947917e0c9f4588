use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{error::ErrorKind, Parser};
use crossterm::style::Stylize;
use log::{debug, warn, LevelFilter};
use wledflasher::{
    cli::{self, config::Config, format_error, Cli},
    logging::initialize_logger,
};

fn main() -> ExitCode {
    initialize_logger(LevelFilter::Info);

    // Usage errors exit with 1, like every other failure.
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    debug!("{:#?}", args);

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!("Failed to install the Ctrl-C handler: {}", e);
    }

    let result = Config::load().and_then(|config| cli::run(args, config, cancel));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format_error(&e);
            debug!("{:?}", miette::Report::new(e));
            eprintln!("{}", message.red());
            ExitCode::FAILURE
        }
    }
}
