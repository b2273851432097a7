/// Core types and traits for the tabledger validator
///
/// This crate contains the shared vocabulary of the validator: error and
/// result types, chain event and receipt models, configuration structures,
/// and the trait seams (`SqlParser`, `BlockFeed`, `RawEventSink`) that the
/// parser, feed, executor and gateway crates plug into.
pub mod config;
pub mod error;
pub mod feed;
pub mod parser;
pub mod types;

pub use error::{Error, Result};
