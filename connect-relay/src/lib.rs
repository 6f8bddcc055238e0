//! Connect Relay Server Library
//!
//! The desktop end of the phone relay: a plaintext WebSocket endpoint that
//! stores uploaded files and fans forwarded notifications out to every
//! connected client. Used by the `connect-relay` binary and by the
//! integration tests.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{future, FutureExt};
use warp::hyper::server::accept::{self, Accept};
use warp::hyper::server::conn::{AddrIncoming, AddrStream};
use warp::hyper::service::make_service_fn;
use warp::Filter;

pub mod activity;
pub mod config;
pub mod connection;
pub mod registry;
pub mod storage;

pub use activity::{Activity, ActivityIo};
pub use config::RelayConfig;
pub use connection::{client_connection, handle_message, FILE_RECEIVED, NOTIFICATION_RECEIVED};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use storage::{sanitize_filename, DownloadDir, FileWriteError};

/// Per-server state shared by all connection tasks.
pub struct State {
    pub registry: ConnectionRegistry,
    pub downloads: DownloadDir,
    pub echo_to_sender: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_message_size: usize,
}

impl State {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            downloads: DownloadDir::new(config.download_dir.clone()),
            echo_to_sender: config.echo_to_sender,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            max_message_size: config.max_message_size,
        }
    }
}

/// What the WebSocket handler needs to know about its TCP connection.
#[derive(Clone)]
struct Conn {
    peer: SocketAddr,
    activity: Activity,
    state: Arc<State>,
}

/// Routes for one accepted TCP connection: WebSocket upgrade on `/` (what
/// the Android app dials) and `/ws`, plus a banner and `/healthz`.
pub fn routes(
    state: Arc<State>,
    peer: SocketAddr,
    activity: Activity,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let conn = Conn {
        peer,
        activity,
        state,
    };
    let with_conn = warp::any().map(move || conn.clone());

    let ws_root = warp::path::end()
        .and(warp::ws())
        .and(with_conn.clone())
        .map(upgrade);

    let ws_path = warp::path!("ws")
        .and(warp::ws())
        .and(with_conn)
        .map(upgrade);

    let hello = warp::path::end().map(|| "Connect relay is active");
    let healthz = warp::path!("healthz").map(|| "ok");

    ws_root
        .or(ws_path)
        .or(hello)
        .or(healthz)
        .with(warp::log("connect_relay"))
}

fn upgrade(ws: warp::ws::Ws, conn: Conn) -> impl warp::Reply {
    let limit = conn.state.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| client_connection(socket, conn.peer, conn.activity, conn.state))
}

/// Binds the listener and returns the bound address together with the
/// server future. The server stops accepting once `shutdown` resolves.
pub fn bind(
    config: RelayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<(SocketAddr, impl Future<Output = ()> + Send + 'static)> {
    let state = Arc::new(State::new(&config));

    let mut incoming =
        AddrIncoming::bind(&config.listen).with_context(|| format!("binding {}", config.listen))?;
    incoming.set_nodelay(true);
    let addr = incoming.local_addr();
    let incoming = accept::poll_fn(move |cx| {
        Pin::new(&mut incoming)
            .poll_accept(cx)
            .map(|conn| conn.map(|res| res.map(ActivityIo::new)))
    });

    // Each connection gets its own filter so the socket's read activity
    // reaches the WebSocket handler.
    let make_svc = make_service_fn(move |conn: &ActivityIo<AddrStream>| {
        let svc = warp::service(routes(state.clone(), conn.remote_addr(), conn.activity()));
        future::ok::<_, Infallible>(svc)
    });

    let server = warp::hyper::Server::builder(incoming)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .map(|result| {
            if let Err(e) = result {
                log::error!("relay server error: {}", e);
            }
        });

    log::info!(
        "connect-relay listening on ws://{} (downloads -> {})",
        addr,
        config.download_dir.display()
    );
    Ok((addr, server))
}

pub async fn serve(
    config: RelayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let (_addr, server) = bind(config, shutdown)?;
    server.await;
    log::info!("connect-relay stopped");
    Ok(())
}
