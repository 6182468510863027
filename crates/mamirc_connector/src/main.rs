mod config;
mod conn;
mod ctl;
mod journal;
mod linebuf;
mod state;
mod stream;
mod throttle;

use std::process::exit;

#[macro_use]
extern crate log;

fn main() {
    let config_path = mamirc_common::cli::parse_config_path(
        "mamirc-connector",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_DESCRIPTION"),
    );

    env_logger::init();

    let config = match config::parse_config(&config_path) {
        Err(err) => {
            println!("Can't parse config file:");
            println!("{}", err);
            exit(1);
        }
        Ok(config) => config,
    };

    let config_errors = config.validate();
    if !config_errors.is_empty() {
        println!(
            "Config file error{}:",
            if config_errors.len() > 1 { "s" } else { "" }
        );
        for error in config_errors {
            println!("- {}", error);
        }
        exit(1);
    }

    let journal = match journal::Journal::open(&config.journal_file) {
        Ok(journal) => journal,
        Err(err) => {
            eprintln!("Can't open journal {:?}: {}", config.journal_file, err);
            exit(2);
        }
    };

    // Everything runs on one thread: connection readers and writers, the journal, the control
    // port. Blocking work (DNS) goes through spawn_blocking.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let state = state::Connector::new(journal);
        if let Err(err) =
            ctl::listen_task(state, config.control_port, config.control_password).await
        {
            error!("Control port failed: {}", err);
            exit(2);
        }
    });
}
