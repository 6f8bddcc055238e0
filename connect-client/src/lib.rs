//! Phone-side relay client: one outbound WebSocket to the desktop relay,
//! used to push files and forward notifications.

mod client;
mod error;
mod policy;

pub use client::{ClientEvent, ClientOptions, Connection, ConnectionState, RelayClient};
pub use error::ClientError;
pub use policy::{NotificationPolicy, ReconnectPolicy};
