//! Wire frames exchanged with the relay.
//!
//! ## Summary
//! - Client→relay frames ([`OutboundFrame`]) carry both ciphertext variants:
//!   one for the recipient and one for the sender's own history.
//! - Relay→client frames ([`DeliveredFrame`]) and history entries
//!   ([`HistoryRecord`]) carry a [`ProjectedPayload`], the ciphertext/key pair
//!   decryptable by exactly one party. Sender-only fields cannot be expressed
//!   in these types.
//! - Field names are the camelCase names the browser client speaks
//!   (`textForSender`, `encryptedAESKey`, …).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of message the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
}

/// Client→relay payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundPayload {
    Text {
        text: String,
        #[serde(rename = "textForSender")]
        text_for_sender: String,
    },
    Image {
        #[serde(rename = "encryptedImage")]
        encrypted_image: String,
        #[serde(rename = "encryptedAESKey")]
        encrypted_aes_key: String,
        #[serde(rename = "senderEncryptedAESKey")]
        sender_encrypted_aes_key: String,
        #[serde(rename = "imageMetadata")]
        image_metadata: ImageMetadata,
    },
}

impl OutboundPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            OutboundPayload::Text { .. } => MessageType::Text,
            OutboundPayload::Image { .. } => MessageType::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub to: String,
    /// Client-proposed message id, echoed back through history so the sender
    /// can replace its optimistic copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub payload: OutboundPayload,
}

/// The half of a message one participant can decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProjectedPayload {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "encryptedImage")]
        encrypted_image: String,
        #[serde(rename = "encryptedAESKey")]
        encrypted_aes_key: String,
        #[serde(rename = "imageMetadata")]
        image_metadata: ImageMetadata,
    },
}

impl ProjectedPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            ProjectedPayload::Text { .. } => MessageType::Text,
            ProjectedPayload::Image { .. } => MessageType::Image,
        }
    }
}

impl OutboundPayload {
    /// The recipient-facing half, as forwarded live.
    pub fn for_recipient(&self) -> ProjectedPayload {
        match self {
            OutboundPayload::Text { text, .. } => ProjectedPayload::Text { text: text.clone() },
            OutboundPayload::Image {
                encrypted_image,
                encrypted_aes_key,
                image_metadata,
                ..
            } => ProjectedPayload::Image {
                encrypted_image: encrypted_image.clone(),
                encrypted_aes_key: encrypted_aes_key.clone(),
                image_metadata: image_metadata.clone(),
            },
        }
    }
}

/// Relay→client live frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredFrame {
    pub id: String,
    pub from: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(flatten)]
    pub payload: ProjectedPayload,
}

/// One role-projected element of a conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub read: bool,
    /// Milliseconds since the UNIX epoch.
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(flatten)]
    pub payload: ProjectedPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is missing `{0}`")]
    MissingField(&'static str),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("incomplete {kind} frame: {detail}")]
    Incomplete { kind: &'static str, detail: String },
}

/// Parse and validate one client→relay frame.
///
/// `to` and `type` must both be present strings; the type-specific fields must
/// all be present. Anything else is rejected and the caller drops the frame.
pub fn parse_outbound(text: &str) -> Result<OutboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;

    let to = value
        .get("to")
        .and_then(Value::as_str)
        .filter(|to| !to.is_empty())
        .ok_or(FrameError::MissingField("to"))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingField("type"))?;
    let message_type =
        MessageType::parse(kind).ok_or_else(|| FrameError::UnknownType(kind.to_string()))?;

    let frame: OutboundFrame =
        serde_json::from_value(value.clone()).map_err(|e| FrameError::Incomplete {
            kind: message_type.as_str(),
            detail: e.to_string(),
        })?;
    debug_assert_eq!(frame.to, to);

    let empty_field = match &frame.payload {
        OutboundPayload::Text {
            text,
            text_for_sender,
        } => [("text", text), ("textForSender", text_for_sender)]
            .into_iter()
            .find(|(_, v)| v.is_empty()),
        OutboundPayload::Image {
            encrypted_image,
            encrypted_aes_key,
            sender_encrypted_aes_key,
            ..
        } => [
            ("encryptedImage", encrypted_image),
            ("encryptedAESKey", encrypted_aes_key),
            ("senderEncryptedAESKey", sender_encrypted_aes_key),
        ]
        .into_iter()
        .find(|(_, v)| v.is_empty()),
    };
    if let Some((field, _)) = empty_field {
        return Err(FrameError::Incomplete {
            kind: message_type.as_str(),
            detail: format!("`{field}` is empty"),
        });
    }

    Ok(frame)
}
