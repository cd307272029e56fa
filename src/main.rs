use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use loconet_gateway::{
    GatewayBuilder, GatewayConfig, GatewayError, Interface, LocoBufferUsb, LoopbackInterface,
};

#[derive(Parser, Debug)]
#[command(
    name = "loconet-gateway",
    about = "Share a LocoNet bus with TCP clients",
    version
)]
struct Cli {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Serial device of the LocoBuffer-USB
    #[arg(long, conflicts_with = "loopback")]
    device: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Use an in-memory bus that echoes every packet
    #[arg(long)]
    loopback: bool,

    #[arg(long)]
    echo_timeout_ms: Option<u64>,

    #[arg(long)]
    max_connections: Option<usize>,

    /// Used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<GatewayConfig, GatewayError> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_file(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(device) = self.device {
            config.device = Some(device);
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(ms) = self.echo_timeout_ms {
            config.echo_timeout_ms = ms;
        }
        if let Some(limit) = self.max_connections {
            config.max_connections = limit;
        }

        match (&config.device, self.loopback) {
            (Some(_), true) => Err(GatewayError::Config(
                "--loopback cannot be combined with a serial device".into(),
            )),
            (None, false) => Err(GatewayError::Config(
                "no interface given; pass --device or --loopback".into(),
            )),
            _ => Ok(config),
        }
    }
}

fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = cli.into_config()?;
    config.validate()?;

    let interface: Arc<dyn Interface> = match &config.device {
        Some(device) => Arc::new(LocoBufferUsb::open(device, config.baud_rate)?),
        None => {
            tracing::info!("Using loopback bus");
            Arc::new(LoopbackInterface::new())
        }
    };

    let gateway = GatewayBuilder::from_config(config).start(interface).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    gateway.shutdown().await;
    Ok(())
}
