use connect_proto::{Envelope, FileUpload, NotificationPayload, ServerMessage, StatusResponse, WireFormat};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::error::ClientError;
use crate::policy::{NotificationPolicy, ReconnectPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    /// `Closed` and `Errored` end a connection instance for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// What a connection reports back to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Opened,
    Status(StatusResponse),
    Notification(NotificationPayload),
    /// Sent at most once, as the last event of a connection.
    Closed,
    /// Sent at most once, as the last event of a connection.
    Errored(String),
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub wire_format: WireFormat,
    pub notifications: NotificationPolicy,
    pub reconnect: Option<ReconnectPolicy>,
}

/// One WebSocket connection attempt to `ws://host:port`.
///
/// Created in `Connecting`; frames queued before the handshake completes
/// are flushed in order once it is `Open`.
pub struct Connection {
    url: Url,
    state_rx: watch::Receiver<ConnectionState>,
    out_tx: Option<mpsc::UnboundedSender<Message>>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    driver: JoinHandle<()>,
}

impl Connection {
    pub fn open(host: &str, port: u16) -> Result<Self, ClientError> {
        let url = Url::parse(&format!("ws://{host}:{port}"))
            .map_err(|e| ClientError::InvalidAddress(format!("{host}:{port}: {e}")))?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        info!("connecting to relay {}", url);
        let driver = tokio::spawn(drive(url.clone(), state_tx, out_rx, event_tx));

        Ok(Self {
            url,
            state_rx,
            out_tx: Some(out_tx),
            events,
            driver,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Resolves once the handshake has finished one way or the other.
    pub async fn wait_open(&self) -> Result<(), ClientError> {
        let mut rx = self.state_rx.clone();
        let state = match rx.wait_for(|s| *s != ConnectionState::Connecting).await {
            Ok(s) => *s,
            Err(_) => ConnectionState::Closed,
        };
        match state {
            ConnectionState::Open => Ok(()),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Sends immediately when open; while connecting, holds the frame
    /// until the handshake completes.
    pub fn queue_envelope(&self, envelope: &Envelope, format: WireFormat) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => self.push(envelope, format),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Fails with [`ClientError::NotConnected`] unless the socket is open.
    pub fn send_envelope(&self, envelope: &Envelope, format: WireFormat) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        self.push(envelope, format)
    }

    fn push(&self, envelope: &Envelope, format: WireFormat) -> Result<(), ClientError> {
        let tx = self.out_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(envelope.to_json(format)))
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Sends a close frame and waits for the connection to wind down.
    /// Simply dropping a `Connection` closes it too, without waiting.
    pub async fn close(mut self) {
        self.out_tx.take();
        if let Err(e) = (&mut self.driver).await {
            debug!("connection driver ended abnormally: {}", e);
        }
    }
}

async fn drive(
    url: Url,
    state_tx: watch::Sender<ConnectionState>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _resp)) => ws,
        Err(e) => {
            warn!("could not connect to {}: {}", url, e);
            state_tx.send_replace(ConnectionState::Errored);
            let _ = events.send(ClientEvent::Errored(e.to_string()));
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    state_tx.send_replace(ConnectionState::Open);
    let _ = events.send(ClientEvent::Opened);
    info!("connected to relay {}", url);

    let last = loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(msg) => {
                    if let Err(e) = ws_tx.send(msg).await {
                        break ClientEvent::Errored(e.to_string());
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break ClientEvent::Closed;
                }
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_inbound(&text) {
                        let _ = events.send(event);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break ClientEvent::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => break ClientEvent::Errored(e.to_string()),
            },
        }
    };

    match &last {
        ClientEvent::Errored(e) => {
            warn!("relay connection {} failed: {}", url, e);
            state_tx.send_replace(ConnectionState::Errored);
        }
        _ => {
            info!("relay connection {} closed", url);
            state_tx.send_replace(ConnectionState::Closed);
        }
    }
    let _ = events.send(last);
}

/// Only the passive receive path goes through here, so junk is logged
/// and otherwise ignored.
fn parse_inbound(text: &str) -> Option<ClientEvent> {
    match ServerMessage::parse(text) {
        Ok(ServerMessage::Status(status)) => Some(ClientEvent::Status(status)),
        Ok(ServerMessage::Notification(broadcast)) => Some(ClientEvent::Notification(broadcast.data)),
        Err(e) => {
            debug!("ignoring unparseable relay message: {}", e);
            None
        }
    }
}

/// Owns the current connection. Every [`RelayClient::connect`] replaces it
/// with a fresh instance.
pub struct RelayClient {
    options: ClientOptions,
    current: Option<Connection>,
}

impl RelayClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            current: None,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn set_notification_policy(&mut self, policy: NotificationPolicy) {
        self.options.notifications = policy;
    }

    pub fn state(&self) -> ConnectionState {
        self.current
            .as_ref()
            .map_or(ConnectionState::Disconnected, Connection::state)
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.current.as_ref()
    }

    /// Drops any previous connection and starts a new one.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<&Connection, ClientError> {
        self.current = None;
        let conn: &Connection = self.current.insert(Connection::open(host, port)?);
        Ok(conn)
    }

    /// Connects and waits for the handshake, retrying with backoff when a
    /// [`ReconnectPolicy`] is configured.
    pub async fn connect_with_retry(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        let policy = self.options.reconnect.clone();
        let mut attempt = 0u32;
        loop {
            self.connect(host, port)?.wait_open().await.ok();
            if self.state() == ConnectionState::Open {
                return Ok(());
            }

            let Some(policy) = policy.as_ref() else {
                return Err(ClientError::NotConnected);
            };
            if !policy.allows(attempt + 1) {
                return Err(ClientError::Transport(format!(
                    "gave up on {host}:{port} after {} attempt(s)",
                    attempt + 1
                )));
            }
            let delay = policy.delay(attempt);
            warn!("relay {}:{} unreachable; retrying in {:?}", host, port, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Sends now, or holds the upload until the pending connection opens.
    pub fn queue_file(&self, filename: &str, bytes: &[u8]) -> Result<(), ClientError> {
        let conn = self.current.as_ref().ok_or(ClientError::NotConnected)?;
        conn.queue_envelope(
            &Envelope::FileUpload(FileUpload::from_bytes(filename, bytes)),
            self.options.wire_format,
        )
    }

    pub fn send_file(&self, filename: &str, bytes: &[u8]) -> Result<(), ClientError> {
        let conn = self.current.as_ref().ok_or(ClientError::NotConnected)?;
        conn.send_envelope(
            &Envelope::FileUpload(FileUpload::from_bytes(filename, bytes)),
            self.options.wire_format,
        )
    }

    /// Forwards a notification if sharing is enabled and the socket is
    /// open. Otherwise does nothing; returns whether it was sent.
    pub fn send_notification(&self, payload: &NotificationPayload) -> bool {
        if !self.options.notifications.enabled {
            return false;
        }
        let Some(conn) = self.current.as_ref() else {
            return false;
        };
        match conn.send_envelope(&Envelope::Notification(payload.clone()), self.options.wire_format) {
            Ok(()) => {
                debug!("forwarded notification from {}", payload.package());
                true
            }
            Err(_) => false,
        }
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        match self.current.as_mut() {
            Some(conn) => conn.next_event().await,
            None => None,
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(conn) = self.current.take() {
            conn.close().await;
        }
    }
}
