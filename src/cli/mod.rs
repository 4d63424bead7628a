use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ServerConfig, ViewerConfig};

#[derive(Parser)]
#[command(name = "srvnc")]
#[command(about = "🖥️  Low-latency screen streaming over a WebSocket control plane and UDP frames", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML); missing file means defaults
    #[arg(short, long, global = true, default_value = "srvnc.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture this machine's screen and stream it to the registered viewer
    Serve(ServeArgs),

    /// Connect to a server, receive its screen and send commands from stdin
    View(ViewArgs),

    /// Print the default configuration and exit
    GenConfig,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// WebSocket control listen address
    #[arg(long)]
    pub control: Option<String>,

    /// UDP address frames are sent from
    #[arg(long)]
    pub data: Option<String>,

    /// Target frames per second
    #[arg(long)]
    pub fps: Option<u32>,

    /// Display to capture (0 = primary)
    #[arg(short, long)]
    pub monitor: Option<usize>,

    /// JPEG quality (1-100)
    #[arg(short, long)]
    pub quality: Option<u8>,

    /// Keep streaming to a viewer after its control connection closes
    #[arg(long)]
    pub keep_on_disconnect: bool,
}

#[derive(Args, Debug, Default)]
pub struct ViewArgs {
    /// Server host
    #[arg(short, long)]
    pub server: Option<String>,

    /// Server control port
    #[arg(short = 'p', long)]
    pub control_port: Option<u16>,

    /// Local UDP address to receive frames on
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Keep the latest frame in this JPEG file
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Do not read commands from stdin
    #[arg(long)]
    pub no_input: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl ServeArgs {
    /// Command-line flags win over the config file.
    pub fn apply(self, config: &mut ServerConfig) {
        if let Some(control) = self.control {
            config.control_addr = control;
        }
        if let Some(data) = self.data {
            config.data_addr = data;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(monitor) = self.monitor {
            config.monitor = monitor;
        }
        if let Some(quality) = self.quality {
            config.jpeg_quality = quality;
        }
        if self.keep_on_disconnect {
            config.clear_on_disconnect = false;
        }
    }
}

impl ViewArgs {
    pub fn apply(self, config: &mut ViewerConfig) {
        if let Some(server) = self.server {
            config.server_host = server;
        }
        if let Some(port) = self.control_port {
            config.control_port = port;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if self.snapshot.is_some() {
            config.snapshot = self.snapshot;
        }
        if self.no_input {
            config.stdin_commands = false;
        }
    }
}
