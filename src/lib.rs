//! VectoriaDB: a disk-backed vector database node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     HTTP API (axum)                         │
//! │     create / upload (NDJSON) / build / search / drop        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Index Manager                         │
//! │   per-index state machine · build/search mode · drain gate  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           DataStore · IndexBuilder · IndexReader            │
//! │           append-only vector log, packed .idx files         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The node runs in exactly one of two modes. In build mode clients create
//! indexes, stream vectors into them and schedule index builds; in search
//! mode built indexes answer k-nearest-neighbour queries through a shared
//! disk page cache. Switching modes drains every in-flight operation first.

pub mod api;
pub mod config;
pub mod error;
pub mod index;
pub mod manager;
pub mod memory;

pub use config::Config;
pub use error::Status;
pub use manager::IndexManager;
