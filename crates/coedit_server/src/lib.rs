//! Coedit Collaboration Server
//!
//! Real-time collaborative editing backend: many clients attach to a shared
//! document over WebSocket, submit operations and awareness signals, and
//! converge on one gap-free, server-assigned total order of changes.
//!
//! ## Features
//!
//! - **Operation sequencing**: serialized version assignment with durable,
//!   atomic append per document
//! - **Presence/awareness**: ephemeral per-document user state with TTL expiry
//! - **Block locks**: lease-based advisory locks per (document, block)
//! - **Idempotent delivery**: at-least-once client retransmits are absorbed
//! - **Fan-out**: best-effort broadcast to a document's sessions, never
//!   echoing to the sender
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3040)
//! - `DATABASE_PATH`: Path to SQLite database (default: ./coedit.db)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins
//! - `PRESENCE_TTL_SECS`: Presence entry TTL (default: 60)
//! - `LOCK_LEASE_SECS`: Block lock lease (default: 30)
//! - `IDEMPOTENCY_TTL_SECS`: Idempotency marker TTL (default: 300)
//! - `SESSION_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `SYNC_WINDOW`: Max operations per sync payload (default: 100)
//! - `COMPACTION_THRESHOLD`: Log size that triggers compaction (default: 1000)
//! - `COMPACTION_RETAIN`: Operations kept after compaction (default: 500)

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod ephemeral;
pub mod error;
pub mod handlers;
pub mod sequencer;
pub mod sync;

pub use config::Config;
