//! SQLite storage for the relay.
//!
//! Holds three things: registered users and their public keys (plus the
//! escrowed private key when custody is escrowed), the friendship graph the
//! connection gate consults, and every message in both of its ciphertext
//! variants. History reads project each row for the caller so a participant
//! only ever sees the half encrypted for them.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::crypto::StoredKeypair;
use crate::protocol::{HistoryRecord, ImageMetadata, MessageType, OutboundPayload, ProjectedPayload};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Duplicate(String),
    #[error("incomplete message: {0}")]
    Incomplete(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, detail)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                StorageError::Duplicate(detail.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => StorageError::Sqlite(e),
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A registered identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    /// SPKI DER, base64.
    pub public_key: String,
    /// PKCS#8 DER, base64. Only present under escrowed custody.
    pub private_key: Option<String>,
    pub created_at: u64,
}

/// A message as handed to [`Storage::append`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    /// When `None` the store stamps the message itself.
    pub created_at: Option<u64>,
    pub payload: OutboundPayload,
}

/// A stored message with both ciphertext variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub seq: i64,
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: u64,
    pub read: bool,
    pub payload: OutboundPayload,
}

impl MessageRecord {
    /// The view of this message for `viewer`: the sender sees the sender
    /// ciphertext and wrapped key, the receiver sees the receiver's. Anyone
    /// else gets nothing.
    pub fn project_for(&self, viewer: &str) -> Option<HistoryRecord> {
        let as_sender = viewer == self.sender_id;
        if !as_sender && viewer != self.receiver_id {
            return None;
        }

        let payload = match &self.payload {
            OutboundPayload::Text {
                text,
                text_for_sender,
            } => ProjectedPayload::Text {
                text: if as_sender {
                    text_for_sender.clone()
                } else {
                    text.clone()
                },
            },
            OutboundPayload::Image {
                encrypted_image,
                encrypted_aes_key,
                sender_encrypted_aes_key,
                image_metadata,
            } => ProjectedPayload::Image {
                encrypted_image: encrypted_image.clone(),
                encrypted_aes_key: if as_sender {
                    sender_encrypted_aes_key.clone()
                } else {
                    encrypted_aes_key.clone()
                },
                image_metadata: image_metadata.clone(),
            },
        };

        Some(HistoryRecord {
            id: self.id.clone(),
            sender: self.sender_id.clone(),
            receiver: self.receiver_id.clone(),
            read: self.read,
            created_at: self.created_at,
            payload,
        })
    }
}

fn check_complete(message: &NewMessage) -> Result<(), StorageError> {
    let mut missing = Vec::new();
    for (name, value) in [
        ("id", &message.id),
        ("sender", &message.sender_id),
        ("receiver", &message.receiver_id),
    ] {
        if value.is_empty() {
            missing.push(name);
        }
    }
    match &message.payload {
        OutboundPayload::Text {
            text,
            text_for_sender,
        } => {
            if text.is_empty() {
                missing.push("text");
            }
            if text_for_sender.is_empty() {
                missing.push("textForSender");
            }
        }
        OutboundPayload::Image {
            encrypted_image,
            encrypted_aes_key,
            sender_encrypted_aes_key,
            ..
        } => {
            if encrypted_image.is_empty() {
                missing.push("encryptedImage");
            }
            if encrypted_aes_key.is_empty() {
                missing.push("encryptedAESKey");
            }
            if sender_encrypted_aes_key.is_empty() {
                missing.push("senderEncryptedAESKey");
            }
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StorageError::Incomplete(format!(
            "{} message missing {}",
            message.payload.message_type().as_str(),
            missing.join(", ")
        )))
    }
}

const MESSAGE_COLUMNS: &str = "seq, id, sender_id, receiver_id, kind, cipher_for_receiver,
     cipher_for_sender, image_blob, wrapped_key_for_receiver, wrapped_key_for_sender,
     image_filename, image_mimetype, image_size, is_read, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<(MessageRecord, Option<String>)> {
    let kind: String = row.get(4)?;
    let payload = match MessageType::parse(&kind) {
        Some(MessageType::Text) => OutboundPayload::Text {
            text: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            text_for_sender: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        },
        Some(MessageType::Image) => OutboundPayload::Image {
            encrypted_image: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            encrypted_aes_key: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            sender_encrypted_aes_key: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            image_metadata: ImageMetadata {
                filename: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                mimetype: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
                size: row.get::<_, Option<i64>>(12)?.unwrap_or_default() as u64,
            },
        },
        None => {
            // Unknown kinds come back as an empty record plus the raw kind.
            let record = MessageRecord {
                seq: row.get(0)?,
                id: row.get(1)?,
                sender_id: row.get(2)?,
                receiver_id: row.get(3)?,
                created_at: row.get::<_, i64>(14)? as u64,
                read: row.get::<_, i32>(13)? != 0,
                payload: OutboundPayload::Text {
                    text: String::new(),
                    text_for_sender: String::new(),
                },
            };
            return Ok((record, Some(kind)));
        }
    };

    Ok((
        MessageRecord {
            seq: row.get(0)?,
            id: row.get(1)?,
            sender_id: row.get(2)?,
            receiver_id: row.get(3)?,
            created_at: row.get::<_, i64>(14)? as u64,
            read: row.get::<_, i32>(13)? != 0,
            payload,
        },
        None,
    ))
}

fn friendship_key<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub struct Storage {
    conn: Connection,
}

/// The relay's handle on the store; `rusqlite::Connection` is not `Sync`.
pub type SharedStorage = Arc<tokio::sync::Mutex<Storage>>;

impl Storage {
    pub fn into_shared(self) -> SharedStorage {
        Arc::new(tokio::sync::Mutex::new(self))
    }
}

impl Storage {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                public_key  TEXT NOT NULL,
                private_key TEXT,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS friendships (
                user_a     TEXT NOT NULL,
                user_b     TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_a, user_b),
                CHECK (user_a < user_b)
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq                      INTEGER PRIMARY KEY AUTOINCREMENT,
                id                       TEXT NOT NULL UNIQUE,
                sender_id                TEXT NOT NULL,
                receiver_id              TEXT NOT NULL,
                kind                     TEXT NOT NULL,
                cipher_for_receiver      TEXT,
                cipher_for_sender        TEXT,
                image_blob               TEXT,
                wrapped_key_for_receiver TEXT,
                wrapped_key_for_sender   TEXT,
                image_filename           TEXT,
                image_mimetype           TEXT,
                image_size               INTEGER,
                is_read                  INTEGER NOT NULL DEFAULT 0,
                created_at               INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages (sender_id, receiver_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON messages (receiver_id, is_read);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub fn insert_user(&self, row: &UserRow) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO users (id, name, public_key, private_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id,
                    row.name,
                    row.public_key,
                    row.private_key,
                    row.created_at as i64,
                ],
            )
            .map_err(|e| match StorageError::from(e) {
                StorageError::Duplicate(_) => StorageError::Duplicate(format!("user {}", row.id)),
                other => other,
            })?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, public_key, private_key, created_at FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        public_key: row.get(2)?,
                        private_key: row.get(3)?,
                        created_at: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Base64 SPKI public key of `id`.
    pub fn public_key(&self, id: &str) -> Result<String, StorageError> {
        self.conn
            .query_row(
                "SELECT public_key FROM users WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("user {id}")))
    }

    /// The escrowed key pair of `id`, or `None` if only the public half is held.
    pub fn escrowed_keys(&self, id: &str) -> Result<Option<StoredKeypair>, StorageError> {
        let user = self
            .get_user(id)?
            .ok_or_else(|| StorageError::NotFound(format!("user {id}")))?;
        Ok(user.private_key.map(|private_key| StoredKeypair {
            public_key: user.public_key,
            private_key,
        }))
    }

    // -----------------------------------------------------------------------
    // Friendships
    // -----------------------------------------------------------------------

    /// Record a mutual friendship. Returns `false` if it already existed.
    pub fn add_friendship(&self, a: &str, b: &str) -> Result<bool, StorageError> {
        if a == b {
            return Err(StorageError::Incomplete(
                "a friendship needs two distinct users".to_string(),
            ));
        }
        for id in [a, b] {
            if self.get_user(id)?.is_none() {
                return Err(StorageError::NotFound(format!("user {id}")));
            }
        }
        let (user_a, user_b) = friendship_key(a, b);
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO friendships (user_a, user_b, created_at) VALUES (?1, ?2, ?3)",
            params![user_a, user_b, now_millis() as i64],
        )?;
        Ok(inserted > 0)
    }

    pub fn are_friends(&self, a: &str, b: &str) -> Result<bool, StorageError> {
        let (user_a, user_b) = friendship_key(a, b);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM friendships WHERE user_a = ?1 AND user_b = ?2",
            params![user_a, user_b],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_friends(&self, id: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT CASE WHEN user_a = ?1 THEN user_b ELSE user_a END AS friend
             FROM friendships
             WHERE user_a = ?1 OR user_b = ?1
             ORDER BY friend",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Latest creation time on record, or 0 for an empty store.
    pub fn latest_created_at(&self) -> Result<u64, StorageError> {
        let latest: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(created_at), 0) FROM messages",
            [],
            |row| row.get(0),
        )?;
        Ok(latest as u64)
    }

    /// Persist a message with both ciphertext variants.
    ///
    /// Creation times never go backwards: the stored value is the larger of
    /// the requested (or current) time and the latest already on record.
    pub fn append(&self, message: &NewMessage) -> Result<MessageRecord, StorageError> {
        check_complete(message)?;

        let latest = self.latest_created_at()?;
        let created_at = message.created_at.unwrap_or_else(now_millis).max(latest);

        let kind = message.payload.message_type().as_str();
        let result = match &message.payload {
            OutboundPayload::Text {
                text,
                text_for_sender,
            } => self.conn.execute(
                "INSERT INTO messages
                 (id, sender_id, receiver_id, kind, cipher_for_receiver, cipher_for_sender,
                  is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    message.id,
                    message.sender_id,
                    message.receiver_id,
                    kind,
                    text,
                    text_for_sender,
                    created_at as i64,
                ],
            ),
            OutboundPayload::Image {
                encrypted_image,
                encrypted_aes_key,
                sender_encrypted_aes_key,
                image_metadata,
            } => self.conn.execute(
                "INSERT INTO messages
                 (id, sender_id, receiver_id, kind, image_blob, wrapped_key_for_receiver,
                  wrapped_key_for_sender, image_filename, image_mimetype, image_size,
                  is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
                params![
                    message.id,
                    message.sender_id,
                    message.receiver_id,
                    kind,
                    encrypted_image,
                    encrypted_aes_key,
                    sender_encrypted_aes_key,
                    image_metadata.filename,
                    image_metadata.mimetype,
                    image_metadata.size as i64,
                    created_at as i64,
                ],
            ),
        };
        result.map_err(|e| match StorageError::from(e) {
            StorageError::Duplicate(_) => StorageError::Duplicate(format!("message {}", message.id)),
            other => other,
        })?;

        Ok(MessageRecord {
            seq: self.conn.last_insert_rowid(),
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            created_at,
            read: false,
            payload: message.payload.clone(),
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StorageError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], message_from_row)
            .optional()?;
        match row {
            Some((_, Some(kind))) => Err(StorageError::Corrupt(format!(
                "message {id} has unknown kind `{kind}`"
            ))),
            Some((record, None)) => Ok(Some(record)),
            None => Ok(None),
        }
    }

    /// Every message between `self_id` and `peer_id` in either direction,
    /// oldest first, projected for `self_id`.
    pub fn list_conversation(
        &self,
        self_id: &str,
        peer_id: &str,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, seq ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![self_id, peer_id], message_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            let (record, unknown_kind) = row?;
            if let Some(kind) = unknown_kind {
                tracing::warn!(
                    "storage: skipping message {} with unknown kind `{kind}`",
                    crate::logging::msg_id(&record.id)
                );
                continue;
            }
            if let Some(projected) = record.project_for(self_id) {
                result.push(projected);
            }
        }
        Ok(result)
    }

    /// Mark everything `peer_id` sent to `self_id` as read.
    pub fn mark_read(&self, peer_id: &str, self_id: &str) -> Result<usize, StorageError> {
        let affected = self.conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
            params![peer_id, self_id],
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, private_key: Option<&str>) -> UserRow {
        UserRow {
            id: id.to_string(),
            name: format!("{id} name"),
            public_key: format!("{id}-pub"),
            private_key: private_key.map(str::to_string),
            created_at: 1,
        }
    }

    fn text(id: &str, from: &str, to: &str, created_at: Option<u64>) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            created_at,
            payload: OutboundPayload::Text {
                text: format!("{id}-for-{to}"),
                text_for_sender: format!("{id}-for-{from}"),
            },
        }
    }

    fn image(id: &str, from: &str, to: &str) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            created_at: None,
            payload: OutboundPayload::Image {
                encrypted_image: "blob".to_string(),
                encrypted_aes_key: format!("key-for-{to}"),
                sender_encrypted_aes_key: format!("key-for-{from}"),
                image_metadata: ImageMetadata {
                    filename: "cat.png".to_string(),
                    mimetype: "image/png".to_string(),
                    size: 2_000_000,
                },
            },
        }
    }

    #[test]
    fn test_user_crud() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.get_user("alice").unwrap().is_none());

        storage.insert_user(&user("alice", Some("alice-priv"))).unwrap();
        let row = storage.get_user("alice").unwrap().unwrap();
        assert_eq!(row.public_key, "alice-pub");
        assert_eq!(storage.public_key("alice").unwrap(), "alice-pub");

        assert!(matches!(
            storage.insert_user(&user("alice", None)),
            Err(StorageError::Duplicate(_))
        ));
        assert!(matches!(
            storage.public_key("nobody"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_escrowed_keys_depend_on_custody() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_user(&user("alice", Some("alice-priv"))).unwrap();
        storage.insert_user(&user("bob", None)).unwrap();

        let keys = storage.escrowed_keys("alice").unwrap().unwrap();
        assert_eq!(keys.private_key, "alice-priv");
        assert!(storage.escrowed_keys("bob").unwrap().is_none());
        assert!(storage.escrowed_keys("carol").is_err());
    }

    #[test]
    fn test_friendships_are_symmetric() {
        let storage = Storage::open_in_memory().unwrap();
        for id in ["alice", "bob", "carol"] {
            storage.insert_user(&user(id, None)).unwrap();
        }
        assert!(storage.add_friendship("bob", "alice").unwrap());
        assert!(!storage.add_friendship("alice", "bob").unwrap());

        assert!(storage.are_friends("alice", "bob").unwrap());
        assert!(storage.are_friends("bob", "alice").unwrap());
        assert!(!storage.are_friends("alice", "carol").unwrap());

        storage.add_friendship("carol", "alice").unwrap();
        assert_eq!(storage.list_friends("alice").unwrap(), vec!["bob", "carol"]);
        assert_eq!(storage.list_friends("bob").unwrap(), vec!["alice"]);

        assert!(storage.add_friendship("alice", "alice").is_err());
        assert!(matches!(
            storage.add_friendship("alice", "zed"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_append_rejects_incomplete_and_duplicate() {
        let storage = Storage::open_in_memory().unwrap();

        let mut missing = text("m1", "alice", "bob", None);
        missing.payload = OutboundPayload::Text {
            text: "x".to_string(),
            text_for_sender: String::new(),
        };
        match storage.append(&missing) {
            Err(StorageError::Incomplete(detail)) => assert!(detail.contains("textForSender")),
            other => panic!("expected incomplete, got {other:?}"),
        }

        storage.append(&text("m1", "alice", "bob", None)).unwrap();
        assert!(matches!(
            storage.append(&text("m1", "alice", "bob", None)),
            Err(StorageError::Duplicate(_))
        ));
    }

    #[test]
    fn test_created_at_never_goes_backwards() {
        let storage = Storage::open_in_memory().unwrap();
        let first = storage
            .append(&text("m1", "alice", "bob", Some(5_000)))
            .unwrap();
        let second = storage
            .append(&text("m2", "bob", "alice", Some(4_000)))
            .unwrap();
        assert_eq!(first.created_at, 5_000);
        assert_eq!(second.created_at, 5_000);
        assert!(second.seq > first.seq);
        assert_eq!(storage.latest_created_at().unwrap(), 5_000);
    }

    #[test]
    fn test_conversation_projection_by_role() {
        let storage = Storage::open_in_memory().unwrap();
        storage.append(&text("m1", "alice", "bob", Some(10))).unwrap();
        storage.append(&image("m2", "bob", "alice")).unwrap();
        storage.append(&text("m3", "alice", "carol", None)).unwrap();

        let alice_view = storage.list_conversation("alice", "bob").unwrap();
        assert_eq!(alice_view.len(), 2);
        assert_eq!(alice_view[0].id, "m1");
        assert_eq!(
            alice_view[0].payload,
            ProjectedPayload::Text {
                text: "m1-for-alice".to_string()
            }
        );
        match &alice_view[1].payload {
            ProjectedPayload::Image {
                encrypted_aes_key,
                image_metadata,
                ..
            } => {
                assert_eq!(encrypted_aes_key, "key-for-alice");
                assert_eq!(image_metadata.size, 2_000_000);
            }
            other => panic!("expected image, got {other:?}"),
        }

        let bob_view = storage.list_conversation("bob", "alice").unwrap();
        assert_eq!(
            bob_view[0].payload,
            ProjectedPayload::Text {
                text: "m1-for-bob".to_string()
            }
        );
        match &bob_view[1].payload {
            ProjectedPayload::Image {
                encrypted_aes_key, ..
            } => assert_eq!(encrypted_aes_key, "key-for-bob"),
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn test_outsider_projection_is_empty() {
        let storage = Storage::open_in_memory().unwrap();
        let record = storage.append(&text("m1", "alice", "bob", None)).unwrap();
        assert!(record.project_for("carol").is_none());
        assert!(record.project_for("bob").is_some());
        assert_eq!(storage.get_message("m1").unwrap().unwrap(), record);
    }

    fn unread_count(storage: &Storage, self_id: &str) -> i64 {
        storage
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                params![self_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_mark_read_only_touches_inbound() {
        let storage = Storage::open_in_memory().unwrap();
        storage.append(&text("m1", "alice", "bob", None)).unwrap();
        storage.append(&text("m2", "alice", "bob", None)).unwrap();
        storage.append(&text("m3", "bob", "alice", None)).unwrap();
        assert_eq!(unread_count(&storage, "bob"), 2);

        assert_eq!(storage.mark_read("alice", "bob").unwrap(), 2);
        assert_eq!(storage.mark_read("alice", "bob").unwrap(), 0);
        assert_eq!(unread_count(&storage, "bob"), 0);
        assert_eq!(unread_count(&storage, "alice"), 1);

        let view = storage.list_conversation("bob", "alice").unwrap();
        assert!(view.iter().filter(|r| r.sender == "alice").all(|r| r.read));
        assert!(!view.iter().find(|r| r.id == "m3").unwrap().read);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = std::env::temp_dir().join(format!(
            "tandem-storage-test-{}-{}",
            std::process::id(),
            now_millis()
        ));
        let path = dir.join("tandem.db");
        {
            let storage = Storage::open(&path).unwrap();
            storage.insert_user(&user("alice", None)).unwrap();
            storage.append(&text("m1", "alice", "bob", None)).unwrap();
        }
        let storage = Storage::open(&path).unwrap();
        assert!(storage.get_user("alice").unwrap().is_some());
        assert_eq!(storage.list_conversation("bob", "alice").unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
