use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use connect_config::{ConfigRecord, ConfigStore, DEFAULT_PORT};
use connect_relay::RelayConfig;

#[derive(Debug, Parser)]
#[command(about = "Desktop relay for files and notifications pushed from the phone")]
struct Opts {
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay (default)
    Serve(ServeArgs),
    /// Record the address the phone should dial and optionally stage a
    /// copy for pushing to the device
    Pair {
        /// Address of this machine as seen from the phone; detected if omitted
        #[arg(long)]
        ip: Option<IpAddr>,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Also write the record here
        #[arg(long)]
        export: Option<PathBuf>,
        /// Override the desktop config location
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the stored pairing record
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct ServeArgs {
    /// host:port to listen on (overrides CONNECT_RELAY_LISTEN)
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Directory for received files (overrides CONNECT_RELAY_DOWNLOAD_DIR)
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Don't echo notifications back to the client that sent them
    #[arg(long)]
    no_echo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();
    match opts.cmd.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(args).await,
        Command::Pair {
            ip,
            port,
            export,
            config,
        } => pair(ip, port, export, config),
        Command::ShowConfig { config } => {
            let store = open_store(config)?;
            match store.load()? {
                Some(record) => println!("{} ({})", record.ws_url(), store.path().display()),
                None => println!("no pairing record at {}", store.path().display()),
            }
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = RelayConfig::from_env()?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(dir) = args.download_dir {
        config.download_dir = dir;
    }
    if args.no_echo {
        config.echo_to_sender = false;
    }

    connect_relay::serve(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("shutting down");
    })
    .await
}

fn pair(
    ip: Option<IpAddr>,
    port: u16,
    export: Option<PathBuf>,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let ip = match ip {
        Some(ip) => ip,
        None => local_ip().context("could not detect a LAN address; pass --ip")?,
    };
    let record = ConfigRecord::new(ip.to_string(), port);

    let store = open_store(config)?;
    store.save(&record)?;
    println!("paired: phone will dial {}", record.ws_url());

    if let Some(dest) = export {
        store.export_to(&dest)?;
        println!(
            "exported to {} (push to <app files>/{})",
            dest.display(),
            connect_config::DEVICE_CONFIG_RELATIVE_PATH
        );
    }
    Ok(())
}

fn open_store(path: Option<PathBuf>) -> anyhow::Result<ConfigStore> {
    match path {
        Some(p) => Ok(ConfigStore::open(p)),
        None => ConfigStore::desktop_default(),
    }
}

/// The address of the interface that routes to the outside world.
/// Connecting a UDP socket sends no packets.
fn local_ip() -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    let ip = socket.local_addr()?.ip();
    anyhow::ensure!(!ip.is_unspecified(), "no routable interface");
    Ok(ip)
}
