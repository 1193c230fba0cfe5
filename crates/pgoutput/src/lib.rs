//! Decoder for the `pgoutput` logical replication protocol (version 1).
//!
//! [`Decoder::decode`] turns one replication message into a [`WalRecord`].
//! The decoder is stateless: relation metadata is tracked by the caller.

mod decoder;
mod message;

#[doc(hidden)]
pub mod testing;

pub use decoder::{pg_timestamp, DecodeError, Decoder, Result};
pub use message::*;
