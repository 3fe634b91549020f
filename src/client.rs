//! Edge messaging client.
//!
//! [`ChatClient`] is the transport-free half of a chat endpoint. It builds the
//! dual-ciphertext frames, keeps the local conversation view, and tracks the
//! connection lifecycle. The live socket lives in [`crate::session`], HTTP
//! lookups in [`crate::relay_transport`].
//!
//! Decryption is exposed as free functions ([`decrypt_delivered`],
//! [`decrypt_history`]) so callers can run them on blocking threads. They never
//! fail: an undecryptable message becomes a placeholder entry and everything
//! else carries on.

use std::collections::HashMap;

use uuid::Uuid;

use crate::crypto::{
    decrypt_binary, decrypt_text, encrypt_binary, encrypt_text, generate_session_key, unwrap_key,
    wrap_key, CryptoError, KeyMaterial, PublicKey,
};
use crate::logging::{msg_id, peer_id};
use crate::protocol::{
    DeliveredFrame, HistoryRecord, ImageMetadata, OutboundFrame, OutboundPayload, ProjectedPayload,
};
use crate::storage::now_millis;

pub const TEXT_PLACEHOLDER: &str = "[Encrypted message - cannot decrypt]";
pub const IMAGE_PLACEHOLDER: &str = "[Failed to decrypt image]";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("no key material loaded")]
    NoKeyMaterial,
    #[error("not connected to the relay")]
    NotConnected,
    #[error("nothing to send")]
    Empty,
    #[error("cannot apply {event:?} while {from:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Key material was loaded or replaced.
    KeysAvailable,
    /// The relay accepted the handshake.
    Opened,
    /// The connection ended after being open, or was torn down locally.
    Closed,
    /// The handshake or transport failed.
    Failed,
}

impl ConnectionState {
    pub fn apply(self, event: ConnectionEvent) -> Result<Self, ClientError> {
        use ConnectionEvent::*;
        use ConnectionState::*;
        match (self, event) {
            (Disconnected, KeysAvailable) => Ok(Connecting),
            (Connecting, Opened) => Ok(Connected),
            (Connecting, Failed | Closed) => Ok(Disconnected),
            (Connected, Closed | Failed) => Ok(Disconnected),
            (from, event) => Err(ClientError::InvalidTransition { from, event }),
        }
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewContent {
    Text(String),
    Image {
        data: Vec<u8>,
        metadata: ImageMetadata,
    },
    /// Decryption failed; carries the placeholder to display.
    Unreadable(&'static str),
}

impl ViewContent {
    pub fn display_text(&self) -> String {
        match self {
            ViewContent::Text(text) => text.clone(),
            ViewContent::Image { metadata, .. } => format!(
                "[image {} ({}, {} bytes)]",
                metadata.filename, metadata.mimetype, metadata.size
            ),
            ViewContent::Unreadable(placeholder) => placeholder.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub created_at: u64,
    pub content: ViewContent,
    /// Optimistic local echo not yet confirmed by a stored record.
    pub pending: bool,
}

impl ViewEntry {
    /// The other participant, from `self_id`'s point of view.
    pub fn peer_of(&self, self_id: &str) -> &str {
        if self.sender == self_id {
            &self.receiver
        } else {
            &self.sender
        }
    }
}

fn decrypt_projected(keys: &KeyMaterial, payload: &ProjectedPayload, id: &str) -> ViewContent {
    match payload {
        ProjectedPayload::Text { text } => match decrypt_text(text, keys) {
            Ok(plaintext) => ViewContent::Text(plaintext),
            Err(e) => {
                tracing::warn!("client: cannot decrypt text {}: {e}", msg_id(id));
                ViewContent::Unreadable(TEXT_PLACEHOLDER)
            }
        },
        ProjectedPayload::Image {
            encrypted_image,
            encrypted_aes_key,
            image_metadata,
        } => {
            let opened = unwrap_key(encrypted_aes_key, keys)
                .and_then(|key| decrypt_binary(encrypted_image, &key));
            match opened {
                Ok(data) => ViewContent::Image {
                    data,
                    metadata: image_metadata.clone(),
                },
                Err(e) => {
                    tracing::warn!("client: cannot decrypt image {}: {e}", msg_id(id));
                    ViewContent::Unreadable(IMAGE_PLACEHOLDER)
                }
            }
        }
    }
}

/// Decrypt a live frame addressed to `self_id`.
pub fn decrypt_delivered(keys: &KeyMaterial, frame: &DeliveredFrame, self_id: &str) -> ViewEntry {
    ViewEntry {
        id: frame.id.clone(),
        sender: frame.from.clone(),
        receiver: self_id.to_string(),
        created_at: frame.created_at,
        content: decrypt_projected(keys, &frame.payload, &frame.id),
        pending: false,
    }
}

/// Decrypt one history record. The relay has already projected it for the
/// caller, so the same key opens it whether `self_id` sent or received it.
pub fn decrypt_history(keys: &KeyMaterial, record: &HistoryRecord, self_id: &str) -> ViewEntry {
    if record.sender != self_id && record.receiver != self_id {
        tracing::warn!(
            "client: history record {} does not involve {}",
            msg_id(&record.id),
            peer_id(self_id)
        );
        return ViewEntry {
            id: record.id.clone(),
            sender: record.sender.clone(),
            receiver: record.receiver.clone(),
            created_at: record.created_at,
            content: ViewContent::Unreadable(match record.payload {
                ProjectedPayload::Text { .. } => TEXT_PLACEHOLDER,
                ProjectedPayload::Image { .. } => IMAGE_PLACEHOLDER,
            }),
            pending: false,
        };
    }
    ViewEntry {
        id: record.id.clone(),
        sender: record.sender.clone(),
        receiver: record.receiver.clone(),
        created_at: record.created_at,
        content: decrypt_projected(keys, &record.payload, &record.id),
        pending: false,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ChatClient {
    user_id: String,
    keys: Option<KeyMaterial>,
    state: ConnectionState,
    conversations: HashMap<String, Vec<ViewEntry>>,
}

impl ChatClient {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            keys: None,
            state: ConnectionState::Disconnected,
            conversations: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn key_material(&self) -> Option<&KeyMaterial> {
        self.keys.as_ref()
    }

    /// Install (or replace) key material. Always leads to a fresh connection
    /// attempt: an existing session is dropped first.
    pub fn set_key_material(&mut self, keys: KeyMaterial) -> ConnectionState {
        self.keys = Some(keys);
        if self.state != ConnectionState::Disconnected {
            tracing::info!("client: key material changed, dropping current connection");
            self.state = ConnectionState::Disconnected;
        }
        self.state = ConnectionState::Connecting;
        self.state
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, ClientError> {
        if event == ConnectionEvent::KeysAvailable && self.keys.is_none() {
            return Err(ClientError::NoKeyMaterial);
        }
        self.state = self.state.apply(event)?;
        Ok(self.state)
    }

    fn ready_keys(&self) -> Result<&KeyMaterial, ClientError> {
        let keys = self.keys.as_ref().ok_or(ClientError::NoKeyMaterial)?;
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        Ok(keys)
    }

    /// Encrypt `plaintext` for `peer` and for ourselves, and echo it into the
    /// local view. Nothing is echoed if either encryption fails.
    pub fn send_text(
        &mut self,
        peer: &str,
        plaintext: &str,
        recipient: &PublicKey,
    ) -> Result<OutboundFrame, ClientError> {
        if plaintext.trim().is_empty() {
            return Err(ClientError::Empty);
        }
        let keys = self.ready_keys()?;
        let text = encrypt_text(plaintext, recipient)?;
        let text_for_sender = encrypt_text(plaintext, keys.public_key())?;

        let frame = OutboundFrame {
            to: peer.to_string(),
            id: Some(Uuid::new_v4().to_string()),
            payload: OutboundPayload::Text {
                text,
                text_for_sender,
            },
        };
        self.echo(&frame, ViewContent::Text(plaintext.to_string()));
        Ok(frame)
    }

    /// Seal `data` once under a fresh session key and wrap that key for both
    /// participants. The local view shows the original bytes.
    pub fn send_image(
        &mut self,
        peer: &str,
        data: &[u8],
        metadata: ImageMetadata,
        recipient: &PublicKey,
    ) -> Result<OutboundFrame, ClientError> {
        let keys = self.ready_keys()?;
        let session_key = generate_session_key();
        let encrypted_image = encrypt_binary(data, &session_key)?;
        let encrypted_aes_key = wrap_key(&session_key, recipient)?;
        let sender_encrypted_aes_key = wrap_key(&session_key, keys.public_key())?;

        let frame = OutboundFrame {
            to: peer.to_string(),
            id: Some(Uuid::new_v4().to_string()),
            payload: OutboundPayload::Image {
                encrypted_image,
                encrypted_aes_key,
                sender_encrypted_aes_key,
                image_metadata: metadata.clone(),
            },
        };
        self.echo(
            &frame,
            ViewContent::Image {
                data: data.to_vec(),
                metadata,
            },
        );
        Ok(frame)
    }

    fn echo(&mut self, frame: &OutboundFrame, content: ViewContent) {
        let entry = ViewEntry {
            id: frame.id.clone().unwrap_or_default(),
            sender: self.user_id.clone(),
            receiver: frame.to.clone(),
            created_at: now_millis(),
            content,
            pending: true,
        };
        self.upsert(entry);
    }

    /// Add a decrypted entry to its conversation.
    pub fn on_incoming(&mut self, entry: ViewEntry) {
        self.upsert(entry);
    }

    /// Decrypt and merge a fetched history for `peer`. Returns how many
    /// records could not be decrypted.
    pub fn load_history(
        &mut self,
        peer: &str,
        records: &[HistoryRecord],
    ) -> Result<usize, ClientError> {
        let keys = self.keys.as_ref().ok_or(ClientError::NoKeyMaterial)?;
        let entries: Vec<ViewEntry> = records
            .iter()
            .map(|record| decrypt_history(keys, record, &self.user_id))
            .collect();
        Ok(self.merge_history(peer, entries))
    }

    /// Merge history entries already decrypted elsewhere, typically on a
    /// blocking thread. Entries outside the conversation with `peer` are
    /// ignored. Returns how many entries are unreadable.
    pub fn merge_history(&mut self, peer: &str, entries: Vec<ViewEntry>) -> usize {
        let mut unreadable = 0;
        for entry in entries {
            if entry.peer_of(&self.user_id) != peer {
                continue;
            }
            if matches!(entry.content, ViewContent::Unreadable(_)) {
                unreadable += 1;
            }
            self.upsert(entry);
        }
        unreadable
    }

    /// Insert `entry`, or confirm the pending echo with the same id.
    ///
    /// An id only ever names one message: an entry whose participants differ
    /// from the existing one is dropped, and confirmed content is never
    /// rewritten. A confirmed record that failed to decrypt keeps the readable
    /// optimistic content.
    fn upsert(&mut self, entry: ViewEntry) {
        let peer = entry.peer_of(&self.user_id).to_string();
        let conversation = self.conversations.entry(peer).or_default();
        match conversation.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing)
                if existing.sender != entry.sender || existing.receiver != entry.receiver =>
            {
                tracing::warn!(
                    msg = %msg_id(&entry.id),
                    from = %peer_id(&entry.sender),
                    "client: ignoring entry that reuses another message's id"
                );
                return;
            }
            Some(existing) => {
                if existing.pending {
                    let readable_echo = matches!(entry.content, ViewContent::Unreadable(_))
                        && !matches!(existing.content, ViewContent::Unreadable(_));
                    if !readable_echo {
                        existing.content = entry.content;
                    }
                    existing.created_at = entry.created_at;
                    existing.pending = entry.pending;
                }
            }
            None => conversation.push(entry),
        }
        conversation.sort_by_key(|e| e.created_at);
    }

    /// The conversation with `peer`, oldest first.
    pub fn conversation(&self, peer: &str) -> Vec<&ViewEntry> {
        self.conversations
            .get(peer)
            .map(|entries| entries.iter().collect())
            .unwrap_or_default()
    }
}
