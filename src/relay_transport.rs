//! Blocking HTTP lookups against the relay.
//!
//! Every call carries the caller's handshake token as a bearer credential.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::crypto::{CryptoError, PublicKey, StoredKeypair};
use crate::protocol::HistoryRecord;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("relay rejected the token")]
    Unauthorized,
    #[error("relay answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("relay unreachable: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyResponse {
    public_key: String,
}

/// `relay_url` with `segments` appended to its path, each percent-encoded.
pub fn endpoint(relay_url: &str, segments: &[&str]) -> Result<Url, TransportError> {
    let invalid =
        |detail: String| TransportError::Transport(format!("relay url {relay_url}: {detail}"));
    let mut url = Url::parse(relay_url).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("cannot carry a path".into()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn get_json<T: DeserializeOwned>(
    relay_url: &str,
    segments: &[&str],
    token: &str,
    what: &str,
) -> Result<T, TransportError> {
    let url = endpoint(relay_url, segments)?;
    let response = ureq::get(url.as_str())
        .set("Authorization", &format!("Bearer {token}"))
        .call()
        .map_err(|e| match e {
            ureq::Error::Status(404, _) => TransportError::NotFound(what.to_string()),
            ureq::Error::Status(401, _) => TransportError::Unauthorized,
            ureq::Error::Status(status, response) => TransportError::Status {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(t) => TransportError::Transport(t.to_string()),
        })?;
    response
        .into_json()
        .map_err(|e| TransportError::Decode(format!("{what}: {e}")))
}

/// Public key of `user_id`, parsed and ready for encryption.
pub fn fetch_public_key(
    relay_url: &str,
    token: &str,
    user_id: &str,
) -> Result<PublicKey, TransportError> {
    let response: PublicKeyResponse = get_json(
        relay_url,
        &["users", user_id, "public-key"],
        token,
        &format!("user {user_id}"),
    )?;
    Ok(PublicKey::from_base64(&response.public_key)?)
}

/// Conversation with `peer_id`, projected for the token's identity. Fetching
/// marks the peer's messages to us as read.
pub fn fetch_history(
    relay_url: &str,
    token: &str,
    peer_id: &str,
) -> Result<Vec<HistoryRecord>, TransportError> {
    get_json(
        relay_url,
        &["messages", peer_id],
        token,
        &format!("conversation with {peer_id}"),
    )
}

/// The caller's escrowed key pair, when the relay holds one.
pub fn fetch_escrowed_keys(relay_url: &str, token: &str) -> Result<StoredKeypair, TransportError> {
    get_json(relay_url, &["users", "me", "keys"], token, "escrowed key pair")
}

pub fn fetch_friends(relay_url: &str, token: &str) -> Result<Vec<String>, TransportError> {
    get_json(relay_url, &["friends"], token, "friend list")
}
