//! # Intake Core
//!
//! Engine library for the Intake event ingestion and routing platform.
//!
//! ## Overview
//!
//! Intake receives inbound messages from heterogeneous sources (IMAP
//! mailboxes, webhooks), normalizes them into a single canonical event
//! type, persists raw payloads durably, delivers events exactly-once
//! through a broker stream into classification and handler stages, and
//! drives asynchronous multi-step workflows with human-approval hold
//! points.
//!
//! ## Architecture
//!
//! - PostgreSQL for persistent rows (events, raw mail, suggestions)
//! - Redis for the event stream, distributed locks, and checkpoints
//! - An S3-compatible remote object store with local-disk fallback
//! - An in-process workflow runtime for approval holds and handlers

/// Classifier port and implementations
pub mod classify;

/// Database ports and repositories
pub mod db;

/// Stream consumer, idempotency, and handler dispatch
pub mod dispatch;

/// Error types and handling
pub mod error;

/// IMAP fetching, MIME parsing, and raw-mail persistence
pub mod mail;

/// Outbound notification surface
pub mod notify;

/// Blob storage backends
pub mod storage;

/// Event stream and distributed locking over the broker
pub mod stream;

/// Suggestion review lifecycle
pub mod suggest;

/// Worker supervision
pub mod workers;

/// Workflow runtime and built-in workflow definitions
pub mod workflow;

pub use error::{CoreError, Result};
