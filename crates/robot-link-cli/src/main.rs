//! # robot-link-cli
//!
//! Command-line control client for robots behind a robot-link relay server.
//! Lists online robots, watches a session's channels and liveness, drives
//! with WASD, sends free-text commands and runs capture-and-classify.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

mod app;
mod commands;
mod tui;

use robot_link::LinkConfig;

/// Control client for robots behind a robot-link relay server.
#[derive(Parser)]
#[command(name = "robot-link", version, about)]
struct Cli {
    /// Path to robot-link.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay server URL override
    #[arg(long)]
    server: Option<String>,

    /// Inference endpoint override
    #[arg(long)]
    inference_url: Option<String>,

    /// Enable verbose logging (set RUST_LOG for fine-grained control)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List robots currently online
    Robots,

    /// Register this client with the relay server
    Register {
        /// Client id (defaults to the configured one)
        #[arg(long)]
        client_id: Option<String>,
    },

    /// Connect and print session events
    Watch {
        /// Device id (defaults to the configured one)
        device: Option<String>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Hold-to-drive with W/A/S/D; space stops, q quits
    Drive {
        device: Option<String>,

        /// Speed sent with each drive command
        #[arg(long)]
        speed: Option<f64>,
    },

    /// Send a free-text command
    Send {
        /// Command text
        text: String,

        #[arg(long)]
        device: Option<String>,
    },

    /// Capture the current video frame and classify it
    Capture {
        device: Option<String>,

        /// Seconds to wait for the first frame
        #[arg(long, default_value_t = 15)]
        wait: u64,

        /// Print the prediction as JSON
        #[arg(long)]
        json: bool,

        /// Also write the uploaded JPEG to this path
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,
    },

    /// Classify a local image file with the inference endpoint
    Classify {
        image: PathBuf,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("robot_link=debug,robot_link_cli=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "robot_link=warn".into()),
            )
            .init();
    }

    let mut config = match LinkConfig::discover(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => match &cli.server {
            Some(server) => LinkConfig::new(server.clone()),
            None => {
                eprintln!("{} {}", "Configuration error:".red(), e);
                eprintln!(
                    "  Set {} or pass {}, or create a robot-link.toml file.",
                    "ROBOT_LINK_SERVER_URL".cyan(),
                    "--server".cyan()
                );
                std::process::exit(2);
            }
        },
    };
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(url) = cli.inference_url {
        config.inference.url = Some(url);
    }

    let result = match cli.command {
        Command::Robots => commands::cmd_robots(&config).await,
        Command::Register { client_id } => {
            commands::cmd_register(&config, client_id.as_deref()).await
        }
        Command::Watch { device, seconds } => {
            commands::cmd_watch(config, device.as_deref(), seconds).await
        }
        Command::Drive { device, speed } => {
            commands::cmd_drive(config, device.as_deref(), speed).await
        }
        Command::Send { text, device } => {
            commands::cmd_send(config, device.as_deref(), &text).await
        }
        Command::Capture {
            device,
            wait,
            json,
            save,
        } => commands::cmd_capture(config, device.as_deref(), wait, json, save.as_deref()).await,
        Command::Classify { image, json } => commands::cmd_classify(&config, &image, json).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red(), e);
        std::process::exit(1);
    }
}
