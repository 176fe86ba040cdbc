use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control::ControlCatalog;
use crate::envelope::EnvelopeError;

/// Metadata sent ahead of a binary payload so the receiver can preallocate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnnouncement {
    #[serde(rename = "type")]
    pub mime: String,
    pub size: u64,
    pub name: String,
}

/// Text control frames the client sends on the reliable channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelControl {
    #[serde(rename = "sendfile")]
    SendFile { file: FileAnnouncement },
}

impl ChannelControl {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Text frames the device sends on the reliable channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    Notify(String),
    Catalog(ControlCatalog),
}

impl ChannelNotice {
    /// A single frame may carry both a notice and a catalog; frames with
    /// neither yield an empty list.
    pub fn parse(text: &str) -> Result<Vec<ChannelNotice>, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let mut notices = Vec::new();
        if let Some(message) = object.get("notify").and_then(Value::as_str) {
            notices.push(ChannelNotice::Notify(message.to_owned()));
        }
        if let Some(raw) = object.get("ctrls") {
            let catalog = serde_json::from_value::<ControlCatalog>(raw.clone())
                .map_err(EnvelopeError::Catalog)?;
            notices.push(ChannelNotice::Catalog(catalog));
        }
        Ok(notices)
    }
}
