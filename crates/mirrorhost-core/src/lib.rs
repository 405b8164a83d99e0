//! mirrorhost-core: Core library for mirrorhost
//!
//! Clones a host from a source monitoring server onto a destination server,
//! snapshots the source host's recent history, and replays that history into
//! the clone forever, one sample per item per tick, stamped with the current
//! time.
//!
//! # Architecture
//!
//! ```text
//! LifecycleController ──► MonitoringApi (source, destination)
//!        │                       │
//!        ▼                       ▼
//!    TaskStore (SQLite) ◄── MappingRebuilder / HistoryCollector
//!        ▲
//!        │
//! ReplayScheduler ──► ReplayEngine ──► FaultInjector ──► TelemetrySink
//! ```
//!
//! # Modules
//!
//! - `model`: Replication task record, typed maps, statuses
//! - `store`: SQLite task store with contention retry
//! - `retry`: Backoff policy and the contention-retry wrapper
//! - `replay`: Tick planning and the replay engine
//! - `scheduler`: Per-host recurring ticks with persisted registrations
//! - `faults`: Synthetic problem injection
//! - `mapping`: Source item to destination key mapping rebuild
//! - `lifecycle`: Replicate / relink pipelines and the operator surface
//! - `remote`: Monitoring server API boundary
//! - `history`: History snapshot collection
//! - `sink`: Telemetry sink trait and the trapper protocol client
//! - `filter`: Item ingestion filter
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod faults;
pub mod filter;
pub mod history;
pub mod lifecycle;
pub mod logging;
pub mod mapping;
pub mod model;
pub mod remote;
pub mod replay;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod store;

pub use error::{Error, Result, StorageError};
