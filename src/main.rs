mod cli;
mod client;
mod config;
mod error;
mod protocol;
mod screen;
mod server;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use config::{Config, ServerConfig, ViewerConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::GenConfig = cli.command {
        println!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    let loaded = Config::load(&cli.config);
    let mut config = loaded.as_ref().ok().cloned().unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if let Err(e) = loaded {
        warn!("{e}; using defaults");
    }

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        ctrl_c.cancel();
    });

    match cli.command {
        Commands::Serve(args) => {
            args.apply(&mut config.server);
            serve(config.server, shutdown).await?;
        }
        Commands::View(args) => {
            args.apply(&mut config.viewer);
            view(config.viewer, shutdown).await?;
        }
        Commands::GenConfig => {}
    }

    Ok(())
}

async fn serve(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let capture = screen::capture::ScreenCapture::start(config.encode_settings())
        .context("Failed to start capture thread")?;
    let server = server::StreamServer::bind(&config, capture, server::control::LogCommands).await?;

    println!("🖥️  srvnc server v{}", env!("CARGO_PKG_VERSION"));
    println!("📡 Control: ws://{}", server.control_addr()?);
    println!("🎞️  Frames:  udp://{} at {} fps", server.data_addr()?, config.fps);
    println!();

    server.run(shutdown).await
}

async fn view(config: ViewerConfig, shutdown: CancellationToken) -> Result<()> {
    let viewer = client::Viewer::bind(&config).await?;
    println!("🔌 Connecting to {}", config.control_url());
    println!("📥 Receiving frames on udp://{}", viewer.data_addr()?);
    if config.stdin_commands {
        println!("⌨️  Type a command and press Enter to send it");
    }

    let commands = if config.stdin_commands {
        client::input::spawn_stdin_commands()
    } else {
        // Sender dropped at once: view-only session.
        mpsc::channel::<String>(1).1
    };
    let presenter = screen::viewer::SnapshotPresenter::new(config.snapshot.clone());

    let stats = viewer.run(commands, presenter, shutdown).await?;
    println!(
        "✅ Session ended: {} datagrams, {} frames shown, {} dropped",
        stats.datagrams, stats.frames, stats.dropped
    );
    Ok(())
}
