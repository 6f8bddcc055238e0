use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Layout of [`NotificationPayload::timestamp`], in the sender's local time.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Standard alphabet; always pads on encode, accepts either form on decode.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("envelope is not a json object")]
    NotAnObject,
    #[error("missing or non-string field `{0}`")]
    MissingField(&'static str),
    #[error("unknown envelope kind {0}")]
    UnknownKind(String),
    #[error("invalid base64 in `{field}`: {reason}")]
    InvalidBase64 { field: &'static str, reason: String },
    #[error("notification data is not utf-8")]
    InvalidUtf8,
    #[error("invalid notification data: {0}")]
    InvalidNotification(String),
}

/// Selects how envelopes are rendered on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// What the Android app speaks: file uploads carry no discriminator.
    #[default]
    Legacy,
    /// Adds an explicit `kind` to every envelope.
    Tagged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    pub filename: String,
    /// Base64 of the file content.
    pub filedata: String,
}

impl FileUpload {
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            filename: filename.into(),
            filedata: B64.encode(bytes),
        }
    }

    /// Decodes `filedata`. Validation is deferred to here so that a bad
    /// payload is reported against the upload rather than the frame.
    pub fn bytes(&self) -> Result<Vec<u8>, DecodeError> {
        decode_b64("filedata", &self.filedata)
    }
}

/// The object carried inside a notification envelope.
///
/// Kept exactly as the sender wrote it: keys the app adds beyond the usual
/// four, and keys it leaves out, reach every broadcast recipient unchanged.
/// The accessors read the well-known keys and yield `""` when one is
/// missing or not a string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationPayload {
    fields: Map<String, Value>,
}

impl NotificationPayload {
    pub fn new(
        package: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        let mut fields = Map::new();
        fields.insert("package".into(), Value::String(package.into()));
        fields.insert("title".into(), Value::String(title.into()));
        fields.insert("text".into(), Value::String(text.into()));
        fields.insert("timestamp".into(), Value::String(timestamp.into()));
        Self { fields }
    }

    /// Stamps the notification with the current local time.
    pub fn now(package: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        Self::new(package, title, text, timestamp)
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn package(&self) -> &str {
        self.str_field("package")
    }

    pub fn title(&self) -> &str {
        self.str_field("title")
    }

    pub fn text(&self) -> &str {
        self.str_field("text")
    }

    pub fn timestamp(&self) -> &str {
        self.str_field("timestamp")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Adds or replaces a key, e.g. an app-specific extra.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(key.into(), value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn str_field(&self, key: &str) -> &str {
        self.fields.get(key).and_then(Value::as_str).unwrap_or("")
    }

    fn to_base64(&self) -> String {
        B64.encode(Value::Object(self.fields.clone()).to_string().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    FileUpload(FileUpload),
    Notification(NotificationPayload),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::FileUpload(_) => KIND_FILE_UPLOAD,
            Envelope::Notification(_) => KIND_NOTIFICATION,
        }
    }

    pub fn to_json(&self, format: WireFormat) -> String {
        let mut obj = Map::new();
        if format == WireFormat::Tagged {
            obj.insert("kind".into(), Value::from(self.kind()));
        }
        match self {
            Envelope::FileUpload(upload) => {
                obj.insert("filename".into(), Value::from(upload.filename.as_str()));
                obj.insert("filedata".into(), Value::from(upload.filedata.as_str()));
            }
            Envelope::Notification(payload) => {
                obj.insert("type".into(), Value::from(KIND_NOTIFICATION));
                obj.insert("data".into(), Value::from(payload.to_base64()));
            }
        }
        Value::Object(obj).to_string()
    }
}

const KIND_FILE_UPLOAD: &str = "fileUpload";
const KIND_NOTIFICATION: &str = "notification";

pub fn encode_file_upload(filename: &str, bytes: &[u8]) -> String {
    Envelope::FileUpload(FileUpload::from_bytes(filename, bytes)).to_json(WireFormat::Legacy)
}

pub fn encode_notification(package: &str, title: &str, text: &str, timestamp: &str) -> String {
    Envelope::Notification(NotificationPayload::new(package, title, text, timestamp))
        .to_json(WireFormat::Legacy)
}

/// Parses one inbound frame.
///
/// An explicit `kind` wins. Without it, `type == "notification"` selects a
/// notification and anything else is read as a file upload.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let is_notification = match obj.get("kind") {
        None | Some(Value::Null) => {
            obj.get("type").and_then(Value::as_str) == Some(KIND_NOTIFICATION)
        }
        Some(Value::String(kind)) if kind == KIND_NOTIFICATION => true,
        Some(Value::String(kind)) if kind == KIND_FILE_UPLOAD => false,
        Some(other) => return Err(DecodeError::UnknownKind(other.to_string())),
    };

    if is_notification {
        let data = string_field(obj, "data")?;
        let bytes = decode_b64("data", data)?;
        let text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        let inner: Value = serde_json::from_str(&text)
            .map_err(|e| DecodeError::InvalidNotification(e.to_string()))?;
        match inner {
            Value::Object(fields) => Ok(Envelope::Notification(
                NotificationPayload::from_fields(fields),
            )),
            _ => Err(DecodeError::InvalidNotification("expected a json object".into())),
        }
    } else {
        Ok(Envelope::FileUpload(FileUpload {
            filename: string_field(obj, "filename")?.to_string(),
            filedata: string_field(obj, "filedata")?.to_string(),
        }))
    }
}

fn string_field<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, DecodeError> {
    obj.get(name)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField(name))
}

fn decode_b64(field: &'static str, data: &str) -> Result<Vec<u8>, DecodeError> {
    B64.decode(data.as_bytes())
        .map_err(|e| DecodeError::InvalidBase64 {
            field,
            reason: e.to_string(),
        })
}
