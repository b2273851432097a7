/// EVM chain integration for the tabledger validator
///
/// Wraps an ethers provider behind a small interface (`EvmProvider`),
/// decodes registry contract logs into typed table events, and drives the
/// per-chain `EvmEventFeed` that yields finalized blocks to the event
/// processor in strict order.
pub mod event;
pub mod feed;
pub mod provider;

pub use ethers::types::Address;
pub use event::EventDecoder;
pub use feed::EvmEventFeed;
pub use provider::{parse_address, EvmProvider, EvmProviderConfig};
