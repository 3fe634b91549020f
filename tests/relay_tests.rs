use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tandem::auth::TokenAuthority;
use tandem::client::{decrypt_history, ChatClient, ConnectionEvent, ViewContent};
use tandem::config::{ws_url_for, GateMode, KeyCustody, RelayConfig};
use tandem::crypto::{decrypt_text, generate_keypair, KeyMaterial, StoredKeypair};
use tandem::protocol::{HistoryRecord, ImageMetadata, OutboundPayload};
use tandem::relay::{app, RelayState};
use tandem::relay_transport::{
    fetch_escrowed_keys, fetch_friends, fetch_history, fetch_public_key, TransportError,
};
use tandem::session::{LiveSession, SessionError, SessionEvent};
use tandem::storage::{now_millis, SharedStorage, Storage, UserRow};

const SECRET: &str = "relay-test-secret";
const WAIT: Duration = Duration::from_secs(10);

struct Relay {
    base_url: String,
    state: RelayState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Relay {
    fn ws_url(&self) -> String {
        ws_url_for(&self.base_url)
    }

    fn storage(&self) -> &SharedStorage {
        self.state.storage()
    }

    fn token(&self, user_id: &str) -> String {
        TokenAuthority::new(SECRET)
            .unwrap()
            .issue(user_id, Some(Duration::from_secs(600)))
            .unwrap()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_relay(config: RelayConfig) -> Relay {
    tandem::logging::init_for_tests();
    let storage = Storage::open_in_memory().expect("storage").into_shared();
    let state = RelayState::from_config(config, storage)
        .await
        .expect("relay state");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app(state.clone())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    Relay {
        base_url: format!("http://{}", addr),
        state,
        shutdown: Some(shutdown_tx),
    }
}

/// RSA generation is slow; every test shares the same four identities.
fn keypairs() -> &'static [StoredKeypair; 4] {
    static KEYS: OnceLock<[StoredKeypair; 4]> = OnceLock::new();
    KEYS.get_or_init(|| {
        [
            generate_keypair().unwrap(),
            generate_keypair().unwrap(),
            generate_keypair().unwrap(),
            generate_keypair().unwrap(),
        ]
    })
}

fn keys_for(user_id: &str) -> &'static StoredKeypair {
    let index = match user_id {
        "alice" => 0,
        "bob" => 1,
        "carol" => 2,
        _ => 3,
    };
    &keypairs()[index]
}

fn material(user_id: &str) -> KeyMaterial {
    KeyMaterial::from_stored(keys_for(user_id)).unwrap()
}

async fn register(relay: &Relay, user_id: &str, escrowed: bool) {
    let keys = keys_for(user_id);
    relay
        .storage()
        .lock()
        .await
        .insert_user(&UserRow {
            id: user_id.to_string(),
            name: user_id.to_string(),
            public_key: keys.public_key.clone(),
            private_key: escrowed.then(|| keys.private_key.clone()),
            created_at: now_millis(),
        })
        .unwrap();
}

async fn befriend(relay: &Relay, a: &str, b: &str) {
    relay.storage().lock().await.add_friendship(a, b).unwrap();
}

async fn connect(
    relay: &Relay,
    user_id: &str,
) -> (LiveSession, mpsc::UnboundedReceiver<SessionEvent>) {
    let connected = LiveSession::connect(
        &relay.ws_url(),
        &relay.token(user_id),
        material(user_id),
        user_id,
    )
    .await
    .expect("connect session");
    wait_until_connected(relay, user_id).await;
    connected
}

async fn wait_until_connected(relay: &Relay, user_id: &str) {
    tokio::time::timeout(WAIT, async {
        while !relay.state.registry().is_connected(user_id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration timed out");
}

async fn wait_for_stored(relay: &Relay, message_id: &str) {
    tokio::time::timeout(WAIT, async {
        loop {
            if relay
                .storage()
                .lock()
                .await
                .get_message(message_id)
                .unwrap()
                .is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message was never stored");
}

async fn next_message(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> tandem::client::ViewEntry {
    match tokio::time::timeout(WAIT, events.recv()).await {
        Ok(Some(SessionEvent::Message(entry))) => entry,
        other => panic!("expected a message, got {other:?}"),
    }
}

fn connected_client(user_id: &str) -> ChatClient {
    let mut client = ChatClient::new(user_id);
    client.set_key_material(material(user_id));
    client.apply(ConnectionEvent::Opened).unwrap();
    client
}

async fn history(relay: &Relay, user_id: &str, peer: &str) -> Vec<HistoryRecord> {
    let base_url = relay.base_url.clone();
    let token = relay.token(user_id);
    let peer = peer.to_string();
    tokio::task::spawn_blocking(move || fetch_history(&base_url, &token, &peer))
        .await
        .unwrap()
        .expect("fetch history")
}

async fn raw_socket(
    relay: &Relay,
    user_id: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("{}?token={}", relay.ws_url(), relay.token(user_id));
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("raw connect");
    wait_until_connected(relay, user_id).await;
    socket
}

fn text_frame(to: &str, id: &str) -> String {
    json!({
        "to": to,
        "id": id,
        "type": "text",
        "text": "Y2lwaGVyLWZvci1yZWNlaXZlcg==",
        "textForSender": "Y2lwaGVyLWZvci1zZW5kZXI=",
    })
    .to_string()
}

#[tokio::test]
async fn live_text_reaches_connected_recipient() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    register(&relay, "bob", true).await;
    befriend(&relay, "alice", "bob").await;

    let (_bob_session, mut bob_events) = connect(&relay, "bob").await;
    let (alice_session, _alice_events) = connect(&relay, "alice").await;

    let mut alice = connected_client("alice");
    let bob_public = material("bob").public_key().clone();
    let frame = alice.send_text("bob", "hello", &bob_public).unwrap();
    let message_id = frame.id.clone().unwrap();
    alice_session.send(&frame).await.unwrap();

    let received = next_message(&mut bob_events).await;
    assert_eq!(received.id, message_id);
    assert_eq!(received.sender, "alice");
    assert_eq!(received.content, ViewContent::Text("hello".into()));

    wait_for_stored(&relay, &message_id).await;
    let stored = relay
        .storage()
        .lock()
        .await
        .get_message(&message_id)
        .unwrap()
        .unwrap();
    let OutboundPayload::Text {
        text,
        text_for_sender,
    } = &stored.payload
    else {
        panic!("expected a text record");
    };
    assert_eq!(decrypt_text(text, &material("bob")).unwrap(), "hello");
    assert_eq!(
        decrypt_text(text_for_sender, &material("alice")).unwrap(),
        "hello"
    );

    let alice_history = history(&relay, "alice", "bob").await;
    assert_eq!(alice_history.len(), 1);
    let entry = decrypt_history(&material("alice"), &alice_history[0], "alice");
    assert_eq!(entry.content, ViewContent::Text("hello".into()));

    alice.load_history("bob", &alice_history).unwrap();
    let view = alice.conversation("bob");
    assert_eq!(view.len(), 1);
    assert!(!view[0].pending);
}

#[tokio::test]
async fn offline_recipient_recovers_image_from_history() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    register(&relay, "bob", true).await;
    befriend(&relay, "alice", "bob").await;

    let mut image = vec![0u8; 2 * 1024 * 1024];
    ChaCha20Rng::seed_from_u64(7).fill_bytes(&mut image);
    let metadata = ImageMetadata {
        filename: "photo.png".into(),
        mimetype: "image/png".into(),
        size: image.len() as u64,
    };

    let (alice_session, _alice_events) = connect(&relay, "alice").await;
    let mut alice = connected_client("alice");
    let bob_public = material("bob").public_key().clone();
    let frame = alice
        .send_image("bob", &image, metadata.clone(), &bob_public)
        .unwrap();
    let message_id = frame.id.clone().unwrap();
    alice_session.send(&frame).await.unwrap();

    wait_for_stored(&relay, &message_id).await;
    assert!(!relay.state.registry().is_connected("bob").await);

    // Bob comes online later and catches up over HTTP.
    let (_bob_session, _bob_events) = connect(&relay, "bob").await;
    let records = history(&relay, "bob", "alice").await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].read);

    // Decrypt off the runtime, then merge into the view.
    let entries = tokio::task::spawn_blocking(move || {
        let keys = material("bob");
        records
            .iter()
            .map(|record| decrypt_history(&keys, record, "bob"))
            .collect::<Vec<_>>()
    })
    .await
    .unwrap();
    let mut bob = ChatClient::new("bob");
    bob.set_key_material(material("bob"));
    assert_eq!(bob.merge_history("alice", entries), 0);
    assert_eq!(
        bob.conversation("alice")[0].content,
        ViewContent::Image {
            data: image,
            metadata
        }
    );

    let again = history(&relay, "bob", "alice").await;
    assert!(again[0].read);
}

#[tokio::test]
async fn bad_or_missing_token_refuses_handshake() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;

    let forged = TokenAuthority::new("some-other-secret")
        .unwrap()
        .issue("alice", None)
        .unwrap();
    match LiveSession::connect(&relay.ws_url(), &forged, material("alice"), "alice").await {
        Err(SessionError::Rejected(status)) => assert_eq!(status, 401),
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("forged token was accepted"),
    }

    let bare = tokio_tungstenite::connect_async(relay.ws_url().as_str()).await;
    match bare {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401)
        }
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
    assert!(relay.state.registry().is_empty().await);
}

#[tokio::test]
async fn gate_blocks_strangers_before_persisting() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    for user in ["alice", "bob", "carol"] {
        register(&relay, user, true).await;
    }
    befriend(&relay, "carol", "alice").await;

    let (_bob_session, mut bob_events) = connect(&relay, "bob").await;
    let mut carol = raw_socket(&relay, "carol").await;

    let blocked = uuid::Uuid::new_v4().to_string();
    let allowed = uuid::Uuid::new_v4().to_string();
    carol
        .send(WsMessage::Text(text_frame("bob", &blocked)))
        .await
        .unwrap();
    carol
        .send(WsMessage::Text(text_frame("carol", &uuid::Uuid::new_v4().to_string())))
        .await
        .unwrap();
    carol
        .send(WsMessage::Text(text_frame("alice", &allowed)))
        .await
        .unwrap();

    // Frames from one connection are handled in order.
    wait_for_stored(&relay, &allowed).await;
    let storage = relay.storage().lock().await;
    assert!(storage.get_message(&blocked).unwrap().is_none());
    assert!(storage.list_conversation("carol", "bob").unwrap().is_empty());
    assert!(storage.list_conversation("carol", "carol").unwrap().is_empty());
    drop(storage);

    assert!(bob_events.try_recv().is_err());
}

#[tokio::test]
async fn open_gate_allows_strangers() {
    let mut config = RelayConfig::with_secret(SECRET);
    config.gate = GateMode::Open;
    let relay = start_relay(config).await;
    assert_eq!(relay.state.gate_name(), "open");
    register(&relay, "bob", true).await;
    register(&relay, "carol", true).await;

    let mut carol = raw_socket(&relay, "carol").await;
    let id = uuid::Uuid::new_v4().to_string();
    carol
        .send(WsMessage::Text(text_frame("bob", &id)))
        .await
        .unwrap();
    wait_for_stored(&relay, &id).await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    register(&relay, "carol", true).await;
    befriend(&relay, "carol", "alice").await;

    let (_alice_session, mut alice_events) = connect(&relay, "alice").await;
    let mut carol = raw_socket(&relay, "carol").await;

    for bad in [
        "not json".to_string(),
        json!({ "to": "alice" }).to_string(),
        json!({ "type": "text", "text": "a", "textForSender": "b" }).to_string(),
        json!({ "to": "alice", "type": "text", "text": "only one copy" }).to_string(),
        json!({ "to": "alice", "type": "video" }).to_string(),
    ] {
        carol.send(WsMessage::Text(bad)).await.unwrap();
    }
    let good = uuid::Uuid::new_v4().to_string();
    carol
        .send(WsMessage::Text(text_frame("alice", &good)))
        .await
        .unwrap();

    wait_for_stored(&relay, &good).await;
    assert_eq!(
        relay
            .storage()
            .lock()
            .await
            .list_conversation("alice", "carol")
            .unwrap()
            .len(),
        1
    );

    // Only the valid frame is forwarded, and only the recipient's fields.
    let entry = next_message(&mut alice_events).await;
    assert_eq!(entry.id, good);
    assert!(alice_events.try_recv().is_err());
}

#[tokio::test]
async fn forwarded_frame_omits_sender_fields() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    register(&relay, "bob", true).await;
    befriend(&relay, "alice", "bob").await;

    let mut bob = raw_socket(&relay, "bob").await;
    let mut alice = raw_socket(&relay, "alice").await;
    let id = uuid::Uuid::new_v4().to_string();
    alice
        .send(WsMessage::Text(text_frame("bob", &id)))
        .await
        .unwrap();

    let delivered = tokio::time::timeout(WAIT, bob.next())
        .await
        .expect("delivery timed out")
        .expect("stream ended")
        .expect("websocket error");
    let WsMessage::Text(text) = delivered else {
        panic!("expected a text frame");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["from"], "alice");
    assert_eq!(value["id"], id.as_str());
    assert_eq!(value["type"], "text");
    assert_eq!(value["text"], "Y2lwaGVyLWZvci1yZWNlaXZlcg==");
    assert!(value.get("textForSender").is_none());
    assert!(value["createdAt"].as_u64().is_some());
}

#[tokio::test]
async fn reused_message_id_is_replaced_with_a_fresh_one() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    register(&relay, "bob", true).await;
    befriend(&relay, "alice", "bob").await;

    let (bob_session, mut bob_events) = connect(&relay, "bob").await;
    let (alice_session, mut alice_events) = connect(&relay, "alice").await;

    let mut bob = connected_client("bob");
    let alice_public = material("alice").public_key().clone();
    let original = bob
        .send_text("alice", "see you at noon", &alice_public)
        .unwrap();
    let original_id = original.id.clone().unwrap();
    bob_session.send(&original).await.unwrap();
    wait_for_stored(&relay, &original_id).await;
    assert_eq!(next_message(&mut alice_events).await.id, original_id);

    // Alice replays the id she just saw on a message of her own.
    let mut alice = connected_client("alice");
    let bob_public = material("bob").public_key().clone();
    let mut reply = alice
        .send_text("bob", "I owe you $1000", &bob_public)
        .unwrap();
    reply.id = Some(original_id.clone());
    alice_session.send(&reply).await.unwrap();

    let incoming = next_message(&mut bob_events).await;
    assert_ne!(incoming.id, original_id);
    assert_eq!(incoming.content, ViewContent::Text("I owe you $1000".into()));
    wait_for_stored(&relay, &incoming.id).await;
    bob.on_incoming(incoming);

    let view = bob.conversation("alice");
    assert_eq!(view.len(), 2);
    let mine = view.iter().find(|e| e.id == original_id).unwrap();
    assert_eq!(mine.sender, "bob");
    assert_eq!(mine.content, ViewContent::Text("see you at noon".into()));

    let storage = relay.storage().lock().await;
    let stored = storage.get_message(&original_id).unwrap().unwrap();
    assert_eq!(stored.sender_id, "bob");
    assert_eq!(storage.list_conversation("bob", "alice").unwrap().len(), 2);
}

#[tokio::test]
async fn reconnect_supersedes_and_stale_close_keeps_new_route() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    register(&relay, "bob", true).await;
    befriend(&relay, "alice", "bob").await;

    let mut alice = raw_socket(&relay, "alice").await;
    let (first, mut first_events) = connect(&relay, "bob").await;
    let (_second, mut second_events) = LiveSession::connect(
        &relay.ws_url(),
        &relay.token("bob"),
        material("bob"),
        "bob",
    )
    .await
    .unwrap();

    // Keep sending until the newer connection has taken over routing.
    let bob_public = material("bob").public_key().clone();
    let mut sender = connected_client("alice");
    let taken_over = tokio::time::timeout(WAIT, async {
        loop {
            let frame = sender.send_text("bob", "are you there", &bob_public).unwrap();
            alice
                .send(WsMessage::Text(serde_json::to_string(&frame).unwrap()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Ok(SessionEvent::Message(_)) = second_events.try_recv() {
                break;
            }
        }
    })
    .await;
    assert!(taken_over.is_ok(), "second connection never became the route");
    while first_events.try_recv().is_ok() {}

    first.close().await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            match first_events.recv().await {
                Some(SessionEvent::Closed) | None => break,
                Some(SessionEvent::Message(_)) => {}
            }
        }
    })
    .await
    .expect("first session never closed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.state.registry().is_connected("bob").await);

    let frame = sender.send_text("bob", "after", &bob_public).unwrap();
    let after_id = frame.id.clone().unwrap();
    alice
        .send(WsMessage::Text(serde_json::to_string(&frame).unwrap()))
        .await
        .unwrap();
    let entry = tokio::time::timeout(WAIT, async {
        loop {
            match second_events.recv().await {
                Some(SessionEvent::Message(entry)) if entry.id == after_id => return entry,
                Some(_) => continue,
                None => panic!("second session ended"),
            }
        }
    })
    .await
    .expect("message after stale close was not delivered");
    assert_eq!(entry.content, ViewContent::Text("after".into()));
}

#[tokio::test]
async fn http_lookups_require_token_and_report_not_found() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    register(&relay, "bob", false).await;
    register(&relay, "dave/?x", true).await;
    befriend(&relay, "alice", "bob").await;

    let base_url = relay.base_url.clone();
    let alice_token = relay.token("alice");
    let bob_token = relay.token("bob");
    let expected_alice = keys_for("alice").clone();
    let bob_public = keys_for("bob").public_key.clone();
    let odd_public = keys_for("dave/?x").public_key.clone();

    tokio::task::spawn_blocking(move || {
        let status = match ureq::get(&format!("{base_url}/messages/bob")).call() {
            Err(ureq::Error::Status(code, _)) => code,
            other => panic!("expected 401, got {:?}", other.map(|r| r.status())),
        };
        assert_eq!(status, 401);

        let key = fetch_public_key(&base_url, &alice_token, "bob").unwrap();
        assert_eq!(key.to_base64(), bob_public);
        assert!(matches!(
            fetch_public_key(&base_url, &alice_token, "nobody"),
            Err(TransportError::NotFound(_))
        ));
        // Reserved characters in an id stay inside their path segment.
        let key = fetch_public_key(&base_url, &alice_token, "dave/?x").unwrap();
        assert_eq!(key.to_base64(), odd_public);

        assert_eq!(
            fetch_escrowed_keys(&base_url, &alice_token).unwrap(),
            expected_alice
        );
        assert!(matches!(
            fetch_escrowed_keys(&base_url, &bob_token),
            Err(TransportError::NotFound(_))
        ));

        assert_eq!(fetch_friends(&base_url, &alice_token).unwrap(), vec!["bob"]);
        assert!(matches!(
            fetch_friends(&base_url, "garbage"),
            Err(TransportError::Unauthorized)
        ));
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn client_held_custody_never_serves_private_keys() {
    let mut config = RelayConfig::with_secret(SECRET);
    config.key_custody = KeyCustody::ClientHeld;
    let relay = start_relay(config).await;
    // Even a stray escrowed row is not served under client-held custody.
    register(&relay, "alice", true).await;

    let base_url = relay.base_url.clone();
    let token = relay.token("alice");
    let result = tokio::task::spawn_blocking(move || fetch_escrowed_keys(&base_url, &token))
        .await
        .unwrap();
    assert!(matches!(result, Err(TransportError::NotFound(_))));
}

#[tokio::test]
async fn concurrent_senders_share_one_registry() {
    let mut config = RelayConfig::with_secret(SECRET);
    config.gate = GateMode::Open;
    let relay = Arc::new(start_relay(config).await);
    register(&relay, "bob", true).await;
    let (_bob_session, mut bob_events) = connect(&relay, "bob").await;

    let senders = ["alice", "carol", "dave"];
    for user in senders {
        register(&relay, user, true).await;
    }

    let mut tasks = Vec::new();
    for user in senders {
        let relay = Arc::clone(&relay);
        tasks.push(tokio::spawn(async move {
            let mut socket = raw_socket(&relay, user).await;
            let bob_public = material("bob").public_key().clone();
            let mut client = connected_client(user);
            for n in 0..3 {
                let frame = client
                    .send_text("bob", &format!("{user} #{n}"), &bob_public)
                    .unwrap();
                socket
                    .send(WsMessage::Text(serde_json::to_string(&frame).unwrap()))
                    .await
                    .unwrap();
            }
            socket
        }));
    }
    let mut sockets = Vec::new();
    for task in tasks {
        sockets.push(task.await.unwrap());
    }

    let mut per_sender: std::collections::HashMap<String, Vec<String>> = Default::default();
    for _ in 0..9 {
        let entry = next_message(&mut bob_events).await;
        let ViewContent::Text(text) = entry.content else {
            panic!("expected text");
        };
        per_sender.entry(entry.sender).or_default().push(text);
    }
    for user in senders {
        let expected: Vec<String> = (0..3).map(|n| format!("{user} #{n}")).collect();
        assert_eq!(per_sender[user], expected, "{user}'s messages out of order");
    }
    drop(sockets);
}

#[tokio::test]
async fn healthcheck_reports_connections() {
    let relay = start_relay(RelayConfig::with_secret(SECRET)).await;
    register(&relay, "alice", true).await;
    let (_session, _events) = connect(&relay, "alice").await;

    let base_url = relay.base_url.clone();
    let body: serde_json::Value = tokio::task::spawn_blocking(move || {
        ureq::get(&format!("{base_url}/health"))
            .call()
            .unwrap()
            .into_json()
            .unwrap()
    })
    .await
    .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["gate"], "friends");
}
