//! Sitedeploy - Entry Point
//!
//! Runs the deployment front door and/or the worker loops, depending on
//! settings.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use sitedeploy::app::options::AppOptions;
use sitedeploy::app::run::run;
use sitedeploy::app::settings::Settings;
use sitedeploy::logs::{init_logging, LogOptions};
use sitedeploy::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return;
    }

    // Settings file, then environment
    let settings_path = cli_args.get("settings").map(PathBuf::from);
    let settings = match Settings::load(settings_path.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to load settings: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(&settings);
    info!(
        version = %version.version,
        git_hash = %version.git_hash,
        "Running sitedeploy with options: {:?}",
        options
    );
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Deployment service failed: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
