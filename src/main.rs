//! freqlog - word and chord frequency logger for chorded keyboards

mod cli;

use clap::error::ErrorKind;
use clap::Parser;
use cli::{Cli, Status};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(Status::InvalidArgument.code());
        }
    };

    // RUST_LOG takes precedence over --log-level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.as_str()))
        .format_timestamp_millis()
        .init();

    let status = match cli::run(cli) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            cli::status_of(&e)
        }
    };
    ExitCode::from(status.code())
}
