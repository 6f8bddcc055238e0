use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use connect_client::{
    ClientEvent, ClientOptions, NotificationPolicy, ReconnectPolicy, RelayClient,
};
use connect_config::{ConfigRecord, ConfigStore};
use connect_proto::{NotificationPayload, WireFormat};

#[derive(Debug, Parser)]
#[command(about = "Push files and notifications to a connect relay")]
struct Opts {
    /// Relay host; defaults to the stored pairing record
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Pairing record to read host/port from
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tag every envelope with an explicit `kind`
    #[arg(long)]
    tagged: bool,

    /// Retry the initial connection with exponential backoff
    #[arg(long)]
    retry: bool,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload one or more files
    File { paths: Vec<PathBuf> },
    /// Forward a notification, stamped with the local time
    Notify {
        #[arg(long)]
        package: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        text: String,
    },
    /// Print notifications broadcast by the relay until the connection drops
    Listen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let target = resolve_target(&opts)?;
    let mut client = RelayClient::new(ClientOptions {
        wire_format: if opts.tagged {
            WireFormat::Tagged
        } else {
            WireFormat::Legacy
        },
        notifications: NotificationPolicy::enabled(),
        reconnect: opts.retry.then(|| ReconnectPolicy {
            max_attempts: Some(5),
            ..ReconnectPolicy::default()
        }),
    });

    client
        .connect_with_retry(&target.ip, target.port)
        .await
        .with_context(|| format!("connecting to {}", target.ws_url()))?;
    eprintln!("connected to {}", target.ws_url());

    let timeout = Duration::from_secs(opts.timeout_secs);
    match opts.cmd {
        Command::File { paths } => {
            if paths.is_empty() {
                bail!("no files given");
            }
            for path in paths {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
                    .to_string();
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;

                client.send_file(&filename, &bytes)?;
                eprintln!("uploading {} ({} bytes)", filename, bytes.len());
                await_status(&mut client, timeout).await?;
            }
        }
        Command::Notify {
            package,
            title,
            text,
        } => {
            let payload = NotificationPayload::now(package, title, text);
            if !client.send_notification(&payload) {
                bail!("notification was not sent");
            }
            await_status(&mut client, timeout).await?;
        }
        Command::Listen => loop {
            match client.next_event().await {
                Some(ClientEvent::Notification(n)) => {
                    println!("[{}] {}: {} - {}", n.timestamp(), n.package(), n.title(), n.text())
                }
                Some(ClientEvent::Status(s)) => eprintln!("status: {:?} {}", s.status, s.message),
                Some(ClientEvent::Opened) => {}
                Some(ClientEvent::Closed) | None => {
                    eprintln!("disconnected");
                    break;
                }
                Some(ClientEvent::Errored(e)) => bail!("connection error: {e}"),
            }
        },
    }

    client.disconnect().await;
    Ok(())
}

fn resolve_target(opts: &Opts) -> anyhow::Result<ConfigRecord> {
    let stored = match (&opts.host, opts.port) {
        (Some(_), Some(_)) => None,
        _ => {
            let store = match &opts.config {
                Some(p) => ConfigStore::open(p),
                None => ConfigStore::desktop_default()?,
            };
            store.load()?
        }
    };

    let host = opts
        .host
        .clone()
        .or_else(|| stored.as_ref().map(|r| r.ip.clone()))
        .context("no --host given and no pairing record found")?;
    let port = opts
        .port
        .or_else(|| stored.as_ref().map(|r| r.port))
        .unwrap_or(connect_config::DEFAULT_PORT);
    Ok(ConfigRecord::new(host, port))
}

/// Waits for the relay's status reply, skipping broadcasts.
async fn await_status(client: &mut RelayClient, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, client.next_event())
            .await
            .map_err(|_| anyhow!("timed out waiting for relay status"))?;
        match event {
            Some(ClientEvent::Status(s)) if s.is_success() => {
                eprintln!("{}", s.message);
                return Ok(());
            }
            Some(ClientEvent::Status(s)) => bail!("relay error: {}", s.message),
            Some(ClientEvent::Closed) | None => bail!("connection closed before a reply arrived"),
            Some(ClientEvent::Errored(e)) => bail!("connection error: {e}"),
            Some(ClientEvent::Opened) | Some(ClientEvent::Notification(_)) => {}
        }
    }
}
