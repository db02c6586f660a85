pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod overload;
pub mod parse;
pub mod repair;
pub mod retry;
pub mod sink;

pub use chain::{ProviderChain, ProviderFactory};
pub use dispatch::{GenerationRequest, GenerationResult, StreamObserver, WithThoughts};
pub use error::RelayError;
