use std::io;
use std::process::ExitCode;

use clap::Parser;
use qb_cli::Args;
use qb_core::{with_session, Credentials, UreqTransport};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter())))
        .init();

    let options = match args.client_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let credentials = Credentials::new(&args.username, &args.password);
    let app_name = args.application_name();
    let scenario = args.scenario();
    let transport = UreqTransport::new(options.timeout());
    tracing::info!(host = %options.base_url(), app = %app_name, "starting");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let outcome = with_session(transport, &credentials, Some(&app_name), options, |session| {
        scenario.run(session, &mut out)
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
