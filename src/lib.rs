//! Live media ingest with signed segment delivery.
//!
//! Producers stream media over a WebSocket; each connection is issued a
//! session with its own P-256 key pair, its bytes are transcoded into HLS
//! segments, and viewers fetch those segments with a SHA-256 hash and an
//! ECDSA signature they can check against the session's public key.

pub mod config;
pub mod modules;
pub mod server;

pub use config::{load_config, ConfigError, ServerSettings};
pub use server::{router, run, AppState};
