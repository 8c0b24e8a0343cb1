//! Resumable, crash-safe batch conversion of audio albums.

pub mod album;
pub mod audit;
pub mod config;
pub mod dedup;
pub mod ledger;
pub mod pipeline;
pub mod sqlite_persistence;
pub mod staging;
pub mod transcoder;
