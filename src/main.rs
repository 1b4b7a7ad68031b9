#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use backtrace::Backtrace;
use clap::{value_parser, Arg, ArgAction, Command};

use std::path::PathBuf;
use std::sync::Arc;

mod checks;
mod common;
mod config;
mod sink;

use config::Config;
use sink::JsonSink;

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    // parse command line options
    let matches = Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "Runs HPC node checks (Prometheus scrapes, NVIDIA GPUs, Slurm) once \
            and writes the resulting measurements to stdout as JSON lines.",
        )
        .arg(
            Arg::new("CONFIG")
                .help("Checks configuration file")
                .value_parser(value_parser!(PathBuf))
                .action(ArgAction::Set)
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("CHECK")
                .help("Only run the named check (may be repeated)")
                .long("check")
                .short('c')
                .action(ArgAction::Append),
        )
        .get_matches();

    // load config from file
    let config = {
        let file = matches
            .get_one::<PathBuf>("CONFIG")
            .expect("CONFIG is required");
        match Config::load(file) {
            Ok(c) => c,
            Err(error) => {
                eprintln!("error loading config file: {}\n{error}", file.display());
                std::process::exit(1);
            }
        }
    };

    let selected: Vec<String> = matches
        .get_many::<String>("CHECK")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    // configure logging, routing `log` records from dependencies as well
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(config.log().level())
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to initialize logging: {e}");
    }
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("failed to initialize log bridge: {e}");
    }

    debug!("selected checks: {selected:?}");

    // initialize async runtime
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to launch async runtime");

    let mut sink = JsonSink::new(std::io::stdout());

    let ran = rt.block_on(checks::run(Arc::new(config), &selected, &mut sink));

    info!("ran {ran} checks");
}
