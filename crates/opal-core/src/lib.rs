//! # opal-core
//!
//! Shared types used across the Opal workspace: the unified server
//! configuration, client identifiers, and the numeric event codes that
//! tag every structured log line.

pub mod client_id;
pub mod config;
pub mod events;

pub use client_id::ClientId;
pub use config::{ByteaFormat, Config, ConfigError, Dialect, PoisonPolicy, TlsSettings, TransportSelection};
