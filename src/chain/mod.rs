//! Chain module - JSON-RPC connectivity
//!
//! Every other component is generic over `ethers::providers::Middleware`;
//! this module only knows how to dial an HTTP endpoint.

pub mod provider;

pub use provider::ChainClient;
