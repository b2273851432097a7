/// Event processing pipeline for the tabledger validator
///
/// One `EventProcessor` task per chain owns that chain's write loop: it
/// pulls finalized blocks from the feed, drives the executor through a
/// block scope, retries on infrastructure failures and publishes the chain
/// cursor to observers strictly after each commit.
pub mod processor;

pub use processor::{EventProcessor, ProcessorHandle, ProcessorState};
