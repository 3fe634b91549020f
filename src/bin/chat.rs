use std::error::Error;
use std::path::Path;
use std::thread;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;

use tandem::auth::peek_claims;
use tandem::client::{decrypt_history, ChatClient, ConnectionEvent, ViewEntry};
use tandem::config::{ChatCli, ChatConfig};
use tandem::crypto::{KeyMaterial, PublicKey, StoredKeypair};
use tandem::protocol::ImageMetadata;
use tandem::relay_transport::{fetch_escrowed_keys, fetch_friends, fetch_history, fetch_public_key};
use tandem::session::{LiveSession, SessionEvent};

const PROMPT: &str = "\x1b[1;34mtandem>\x1b[0m ";

struct OpenPeer {
    id: String,
    public_key: PublicKey,
}

#[tokio::main]
async fn main() {
    tandem::logging::init();
    if let Err(error) = run().await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = ChatConfig::from_cli_and_env(ChatCli::parse());
    let token = config
        .token
        .clone()
        .ok_or("no token: pass --token or set TANDEM_TOKEN")?;
    let self_id = peek_claims(&token)?.id;

    let stored = load_keys(&config, &token).await?;
    let keys = KeyMaterial::from_stored(&stored)?;

    let mut client = ChatClient::new(self_id.clone());
    client.set_key_material(keys.clone());

    let (session, mut events) =
        match LiveSession::connect(&config.ws_url(), &token, keys, &self_id).await {
            Ok(connected) => {
                client.apply(ConnectionEvent::Opened)?;
                connected
            }
            Err(e) => {
                client.apply(ConnectionEvent::Failed)?;
                return Err(e.into());
            }
        };

    println!("Connected as {self_id}. Relay: {}", config.relay_url);
    print_help();

    let mut lines = spawn_prompt();
    let mut open: Option<OpenPeer> = None;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                match handle_line(&line, &config, &token, &mut client, &session, &mut open).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) => eprintln!("error: {error}"),
                }
            }
            event = events.recv() => {
                match event {
                    Some(SessionEvent::Message(entry)) => {
                        let from_open = open.as_ref().is_some_and(|p| p.id == entry.sender);
                        if from_open {
                            print_entry(&entry, &self_id);
                        } else {
                            println!("(new message from {})", entry.sender);
                        }
                        client.on_incoming(entry);
                    }
                    Some(SessionEvent::Closed) | None => {
                        client.apply(ConnectionEvent::Closed)?;
                        println!("Disconnected from relay. Restart to reconnect.");
                        break;
                    }
                }
            }
        }
    }

    let _ = session.close().await;
    println!("Goodbye!");
    Ok(())
}

async fn load_keys(config: &ChatConfig, token: &str) -> Result<StoredKeypair, Box<dyn Error>> {
    if let Some(path) = &config.key_file {
        let raw = std::fs::read(path)
            .map_err(|e| format!("cannot read key file {}: {e}", path.display()))?;
        return Ok(serde_json::from_slice(&raw)?);
    }
    let relay_url = config.relay_url.clone();
    let token = token.to_string();
    let keys = tokio::task::spawn_blocking(move || fetch_escrowed_keys(&relay_url, &token)).await??;
    Ok(keys)
}

/// Read lines on a dedicated thread so the prompt never blocks the runtime.
fn spawn_prompt() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(error) => {
                eprintln!("error: {error}");
                return;
            }
        };
        loop {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    let input = line.trim().to_string();
                    if input.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(input.as_str());
                    if tx.send(input).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => println!("(ctrl-c) type /quit to exit."),
                Err(_) => {
                    let _ = tx.send("/quit".to_string());
                    break;
                }
            }
        }
    });
    rx
}

/// Returns `false` when the user asked to quit.
async fn handle_line(
    input: &str,
    config: &ChatConfig,
    token: &str,
    client: &mut ChatClient,
    session: &LiveSession,
    open: &mut Option<OpenPeer>,
) -> Result<bool, Box<dyn Error>> {
    let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
    let rest = rest.trim();

    match command {
        "/quit" | "/exit" => return Ok(false),
        "/help" => print_help(),
        "/friends" => {
            let relay_url = config.relay_url.clone();
            let token = token.to_string();
            let friends =
                tokio::task::spawn_blocking(move || fetch_friends(&relay_url, &token)).await??;
            if friends.is_empty() {
                println!("No friends yet.");
            }
            for friend in friends {
                println!("  {friend}");
            }
        }
        "/open" => {
            if rest.is_empty() {
                return Err("usage: /open <user-id>".into());
            }
            let relay_url = config.relay_url.clone();
            let token = token.to_string();
            let peer = rest.to_string();
            let keys = client.key_material().cloned().ok_or("no key material loaded")?;
            let self_id = client.user_id().to_string();
            let (public_key, entries) = tokio::task::spawn_blocking(move || {
                let public_key = fetch_public_key(&relay_url, &token, &peer)?;
                let entries: Vec<ViewEntry> = fetch_history(&relay_url, &token, &peer)?
                    .iter()
                    .map(|record| decrypt_history(&keys, record, &self_id))
                    .collect();
                Ok::<_, tandem::relay_transport::TransportError>((public_key, entries))
            })
            .await??;

            let unreadable = client.merge_history(rest, entries);
            println!("--- conversation with {rest} ---");
            for entry in client.conversation(rest) {
                print_entry(entry, client.user_id());
            }
            if unreadable > 0 {
                println!("({unreadable} message(s) could not be decrypted)");
            }
            *open = Some(OpenPeer {
                id: rest.to_string(),
                public_key,
            });
        }
        "/image" => {
            let peer = open.as_ref().ok_or("open a conversation first: /open <user-id>")?;
            if rest.is_empty() {
                return Err("usage: /image <path>".into());
            }
            let path = Path::new(rest);
            let data = std::fs::read(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            let metadata = ImageMetadata {
                filename: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "image".to_string()),
                mimetype: guess_mimetype(path).to_string(),
                size: data.len() as u64,
            };
            let frame = client.send_image(&peer.id, &data, metadata, &peer.public_key)?;
            session.send(&frame).await?;
            println!("(sent {} bytes)", data.len());
        }
        _ if command.starts_with('/') => {
            return Err(format!("unknown command {command}; try /help").into());
        }
        _ => {
            let peer = open.as_ref().ok_or("open a conversation first: /open <user-id>")?;
            let frame = client.send_text(&peer.id, input, &peer.public_key)?;
            session.send(&frame).await?;
        }
    }
    Ok(true)
}

fn guess_mimetype(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn print_entry(entry: &ViewEntry, self_id: &str) {
    let who = if entry.sender == self_id {
        "you"
    } else {
        entry.sender.as_str()
    };
    let marker = if entry.pending { " …" } else { "" };
    println!("[{who}] {}{marker}", entry.content.display_text());
}

fn print_help() {
    println!("Commands:");
    println!("  /open <user-id>   load history and start chatting with a user");
    println!("  /image <path>     send an image to the open conversation");
    println!("  /friends          list who you can message");
    println!("  /quit             exit");
    println!("Anything else is sent as a text message.");
}
