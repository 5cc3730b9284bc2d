use std::path::{Path, PathBuf};
use clap::Parser;
use tracing::info;

use crate::console::Console;
use crate::core::config::Config;
use crate::core::system::{RunMode, System, SYS_NAME, SYS_VERSION};
use crate::log::Logger;

mod console;
mod core;
mod log;

#[derive(Parser, Debug)]
#[command(version, about = "Simulated decimal-word computer")]
struct Args {
    /// Program file to execute; the operator console starts when omitted
    program: Option<String>,
    /// Step the program under the interactive debugger
    #[arg(long)]
    debug: bool,
    /// Configuration file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Initial log filter, overriding the configuration
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let logger = Logger::new(&level, Path::new(&config.log_file));

    info!("Welcome to {} v{}", SYS_NAME, SYS_VERSION);

    let mut system = System::new(&config);
    system.attach_logger(logger);

    match args.program {
        Some(program) => {
            let mode = if args.debug { RunMode::Debug } else { RunMode::Normal };
            if let Err(e) = system.run_program(&program, mode) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
            system.shutdown();
        }
        None => Console::new(system).run(),
    }
}
