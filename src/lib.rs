//! # shellgate
//!
//! A policy-enforcing shell execution gateway speaking the Model Context
//! Protocol over stdio. Every tool — synchronous execution, background
//! jobs, SSH remote execution with host-key pinning, SFTP transfer, and
//! diagnostics — funnels through one validation pipeline before any
//! subprocess is spawned or any bytes leave the host.
//!
//! ## Subsystems
//!
//! - [`security`] — the validation pipeline: Unicode screening, quote-aware
//!   parsing, command/argument blocklists, canonical path containment, and
//!   environment hygiene.
//! - [`exec`] — the process executor, bounded command history, and the
//!   background job registry with streaming output windows.
//! - [`ssh`] — pooled connections with LRU eviction and backoff
//!   reconnection, a trust-on-first-use known-hosts store, and SFTP.
//! - [`server`] — the MCP tool catalog tying everything together.
//! - [`config`] — the JSON config document and its locked, atomic store.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod exec;
pub mod sanitize;
pub mod security;
pub mod server;
pub mod ssh;

mod lockfile;

pub use config::{ConfigStore, ServerConfig};
pub use security::{ErrorCode, PolicyEngine, PolicyError};
pub use server::GatewayServer;
