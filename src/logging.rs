//! Log setup and identifier formatting.
//!
//! All crate code logs through [`tracing`] macros. Binaries call [`init`] once
//! at startup to install a `tracing-subscriber` fmt layer filtered by
//! `RUST_LOG` (default `tandem=info`):
//!
//! ```text
//! 2026-10-19T21:33:12.000Z  INFO tandem::relay: relay: websocket connected peer=p-6f1c2a9
//! ```
//!
//! When stderr is a terminal, output is colour-coded and identities and
//! message ids get consistent colours based on their content. Ciphertext and
//! key material never reach a log line; only ids, sizes and outcomes do.

use std::fmt;
use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "tandem=info";

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init() {
    let is_terminal = io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(is_terminal)
        .try_init();
}

/// Install a subscriber writing to the test harness's captured output.
pub fn init_for_tests() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

/// 256-colour foreground codes that read well on dark and light terminals.
const PALETTE: &[u8] = &[33, 39, 45, 75, 81, 113, 149, 170, 176, 203, 209, 214];
const MESSAGE_COLOUR: u8 = 228;
const SHORT_LEN: usize = 7;

/// FNV-1a, so an identity keeps its colour across runs.
fn palette_code(id: &str) -> u8 {
    let hash = id
        .bytes()
        .fold(0x811c_9dc5u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193));
    PALETTE[hash as usize % PALETTE.len()]
}

fn short(id: &str) -> &str {
    id.char_indices()
        .nth(SHORT_LEN)
        .map_or(id, |(end, _)| &id[..end])
}

fn write_tagged(f: &mut fmt::Formatter<'_>, prefix: &str, id: &str, colour: u8) -> fmt::Result {
    if colour_enabled() {
        write!(f, "\x1b[38;5;{colour}m{prefix}-{}\x1b[0m", short(id))
    } else {
        write!(f, "{prefix}-{}", short(id))
    }
}

/// A user identity as it appears in log output, e.g. `p-6f1c2a9`. Usable both
/// inline and as a field: `tracing::info!(peer = %peer_id(id), "...")`.
#[derive(Debug, Clone, Copy)]
pub struct PeerTag<'a>(&'a str);

impl fmt::Display for PeerTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tagged(f, "p", self.0, palette_code(self.0))
    }
}

/// A message id as it appears in log output, e.g. `m-3b1c6f0`.
#[derive(Debug, Clone, Copy)]
pub struct MsgTag<'a>(&'a str);

impl fmt::Display for MsgTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tagged(f, "m", self.0, MESSAGE_COLOUR)
    }
}

pub fn peer_id(id: &str) -> PeerTag<'_> {
    PeerTag(id)
}

pub fn msg_id(id: &str) -> MsgTag<'_> {
    MsgTag(id)
}
