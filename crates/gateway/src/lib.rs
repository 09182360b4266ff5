//! # Hideaway Gateway Library
//!
//! This crate wires the [`access`] core to the outside world: configuration,
//! logging, file operations inside the secure root and the `hideaway`
//! administration binary.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Gateway                           │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │    Config    │  │   Logging    │  │  JsonFileStore  │  │
//! │  └──────────────┘  └──────────────┘  └─────────────────┘  │
//! │                                                           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │                access::AccessGate                   │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │                                                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │   Browser    │  │   Streamer   │  │   remove_tree   │  │
//! │  └──────────────┘  └──────────────┘  └─────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration, defaults and validation
//! - [`logging`]: `tracing` subscriber setup
//! - [`files`]: Listing, streaming and bounded deletion
//! - [`app`]: The [`Gateway`] tying everything together

pub mod app;
pub mod config;
pub mod files;
pub mod logging;

pub use app::Gateway;
pub use config::{default_config_path, Config, ConfigError};
pub use files::{DirectoryBrowser, DirectoryEntry, EntryType, FileInfo, FileStreamer};
