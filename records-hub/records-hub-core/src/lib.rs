//! Core of the records hub: a per-owner folder tree of medical documents,
//! read-only sharing between users, and an append-only audit history.
//!
//! Everything here is transport agnostic. The HTTP layer lives in the
//! `records-hub` crate.

pub mod access;
pub mod auth;
pub mod blob;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod model;
pub mod paths;
pub mod sharing;
pub mod storage;

pub use engine::MutationEngine;
pub use error::{Error, Result};
pub use model::{Actor, ActionType, HistoryEntry, Item, ItemId, ItemKind, Role, ShareGrant};
