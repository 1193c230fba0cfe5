//! tsdb-event-streamer
//!
//! Streams row-level changes of TimescaleDB hypertables and plain tables out
//! of PostgreSQL logical replication (`pgoutput`) as Debezium-style change
//! envelopes, with at-least-once delivery and durable offsets.
//!
//! # CLI Usage
//!
//! ```bash
//! # Stream changes using a config file
//! tsdb-event-streamer run --config streamer.toml
//!
//! # Override connection settings from the command line
//! tsdb-event-streamer run --config streamer.toml \
//!   --connection-string postgresql://streamer@db:5432/metrics --slot events_slot
//!
//! # Inspect or move the stored offset
//! tsdb-event-streamer offsets show --config streamer.toml
//! tsdb-event-streamer offsets set --config streamer.toml 0/16B3748
//! ```

pub mod app;
pub mod config;

pub use app::{run_stream, set_offset, show_offset, stream_with, Overrides};
pub use config::Config;
