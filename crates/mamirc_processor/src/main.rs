mod config;
mod core;
mod ctl;
mod http;
mod profiles;
mod reconnect;
mod session;
mod updates;
mod windows;

use crate::core::{Core, CoreMsg, Shared};

use std::process::exit;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

#[macro_use]
extern crate log;

const NAMES_REFRESH_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

fn main() {
    let config_path = mamirc_common::cli::parse_config_path(
        "mamirc-processor",
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

    let profiles = match profiles::load(&config.profiles_file) {
        Ok(profiles) => profiles,
        Err(err) => {
            println!("Can't parse profiles file:");
            println!("{}", err);
            exit(1);
        }
    };
    let profile_errors = profiles.validate();
    if !profile_errors.is_empty() {
        println!("Profiles file errors:");
        for error in profile_errors {
            println!("- {}", error);
        }
        exit(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(run(config, profiles));
}

async fn run(config: config::Config, profiles: profiles::ProfilesFile) {
    // Command lines to the connector
    let (snd_ctl, rcv_ctl) = mpsc::channel::<Vec<u8>>(1000);
    // Timer callbacks back into the core
    let (snd_msg, mut rcv_msg) = mpsc::unbounded_channel::<CoreMsg>();

    let core = Core::new(
        profiles,
        config.profiles_file.clone(),
        snd_ctl,
        snd_msg,
    );
    let rcv_updates = core.updates.subscribe();
    let shared = Shared {
        core: Arc::new(Mutex::new(core)),
        rcv_updates,
    };

    // Timer callbacks (reconnect attempts)
    let shared_timers = shared.clone();
    tokio::spawn(async move {
        while let Some(msg) = rcv_msg.recv().await {
            shared_timers.core.lock().unwrap().handle_msg(msg);
        }
    });

    // Daily NAMES refresh over all joined channels
    let shared_names = shared.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(NAMES_REFRESH_PERIOD).await;
            shared_names.core.lock().unwrap().refresh_names();
        }
    });

    // Web API
    let http_state = Arc::new(http::HttpState {
        shared: shared.clone(),
        web_password: config.web_password.clone(),
    });
    let http_port = config.http_port;
    tokio::spawn(async move {
        if let Err(err) = http::serve(http_state, http_port).await {
            error!("HTTP server failed: {}", err);
            exit(2);
        }
    });

    // Attach to the connector and pump events. The processor's life is tied to this attachment:
    // when the connector goes away, we exit and let the supervisor restart us.
    if let Err(err) = ctl::run(
        shared,
        config.connector_port,
        config.control_password.clone(),
        rcv_ctl,
    )
    .await
    {
        error!("Control connection failed: {}", err);
        exit(2);
    }
}
