mod actions;
mod cli;
mod logging;
mod prompt;

use std::process::ExitCode;

use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    logging::init(cli.verbose, cli.log_file.as_deref());

    match actions::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("esxup: {error:#}");
            ExitCode::FAILURE
        }
    }
}
