//! # missive-store
//!
//! Local persistence for the message-delivery core: raw messages awaiting
//! resend, pending delivery confirmations, partially received segments, and
//! group messages waiting for their key.
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every table.

pub mod confirmations;
pub mod database;
pub mod hash_ratchet;
pub mod migrations;
pub mod models;
pub mod raw_messages;
pub mod segments;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
