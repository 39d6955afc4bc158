//! Framelink CLI: server, producer, and inference worker

// Use jemalloc for better memory management (optional feature)
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use framelink::config::Config;
use framelink::producer::{self, ProduceOptions};
use framelink::session::Session;
use framelink::{inference, web};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "framelink")]
#[command(about = "Low-latency video ingest and fan-out relay")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve,

    /// Stream synthetic frames at a relay server
    Produce {
        /// Server host for both control plane and ingest
        #[arg(long, default_value = "127.0.0.1")]
        dest: String,

        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,

        /// Stream raw BGR frames from a dump file instead of the pattern
        #[arg(long)]
        source_file: Option<String>,

        /// Skip the /reset_stream announcement
        #[arg(long)]
        no_announce: bool,
    },

    /// Inference worker process (spawned by the server)
    InferWorker {
        /// Input ring segment name
        #[arg(long)]
        input: String,

        /// Output ring segment name
        #[arg(long)]
        output: String,
    },
}

fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        info!(config_path = %path, "loading configuration");
        Ok(Config::load(path)?)
    } else {
        info!(config_path = %path, "no config file, using defaults");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Command::Serve => serve(load_config(&cli.config)?).await,
        Command::Produce {
            dest,
            frames,
            source_file,
            no_announce,
        } => {
            let options = ProduceOptions {
                dest_host: dest,
                frames,
                source_file,
                announce: !no_announce,
            };
            producer::run(load_config(&cli.config)?, options).await
        }
        Command::InferWorker { input, output } => {
            inference::run_worker(&input, &output)?;
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let http_addr = format!("{}:{}", config.server.bind_ip, config.server.http_port);
    let session = Session::new(config)?;

    info!(variant = %session.variant(), "relay starting");
    session.start().await?;

    let web_session = std::sync::Arc::clone(&session);
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::run_server(web_session, http_addr).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    let mut fatal = session.fatal_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = fatal.wait_for(|fatal| *fatal) => {
            error!("session-fatal condition, shutting down; restart required");
        }
    }

    session.shutdown().await;
    web_task.abort();
    info!("relay stopped");
    Ok(())
}
