//! Wire types for the phone <-> desktop relay.
//!
//! Every message is a single UTF-8 JSON text frame. The phone sends
//! [`Envelope`]s (file uploads and forwarded notifications); the desktop
//! answers with [`StatusResponse`]s and fans notifications out as
//! [`NotificationBroadcast`]s.

pub mod envelope;
pub mod response;

pub use envelope::{
    decode, encode_file_upload, encode_notification, DecodeError, Envelope, FileUpload,
    NotificationPayload, WireFormat, TIMESTAMP_FORMAT,
};
pub use response::{MessageType, NotificationBroadcast, ServerMessage, Status, StatusResponse};
