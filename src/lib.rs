//! cdp-relay: a local Chrome DevTools Protocol relay bridging CDP clients
//! to a browser extension that holds the real per-page debugger
//! attachments.
//!
//! The crate is organized leaf-first: `wire` (codec) at the bottom,
//! `registry` and `router` above it, `client_link`/`extension_link` driving
//! the WebSocket actors, `http` and `server` composing the listening port,
//! and `lifecycle`/`wait` as standalone utilities consumed by the CLI
//! front-end.

pub mod client_link;
pub mod config;
pub mod error;
pub mod extension_link;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod server;
pub mod wait;
pub mod wire;

pub use error::{Error, Result};

/// Relay version, also the identity used by the lifecycle supervisor's
/// version probe and reported by `Browser.getVersion`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
