// Helio - main.rs
// Operator entry point: load configuration, install logging, run one command

use std::process::exit;

use clap::Parser;
use helio_forecast::cli::{dispatch, Cli};
use helio_forecast::config_loader::load_config;
use helio_forecast::log_sink::{init_tracing, parse_level};

const BANNER: &str = r#"
 _          _ _
| |__   ___| (_) ___
| '_ \ / _ \ | |/ _ \
| | | |  __/ | | (_) |
|_| |_|\___|_|_|\___/
Helio forecast engine
"#;

fn main() {
    let cli = Cli::parse();
    eprintln!("{BANNER}");

    let config = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            exit(1);
        }
    };

    match parse_level(&config.logging.level) {
        Ok(level) => init_tracing(level),
        Err(e) => {
            eprintln!("Invalid logging level: {e}");
            exit(1);
        }
    }

    if let Err(e) = dispatch(cli, config) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}
