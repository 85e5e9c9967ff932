//! An off-chain state-channel node: ledger channels managed by a
//! leader/follower consensus protocol, virtual payment and swap channels
//! funded through them, and the objective state machines plus engine
//! runtime that drive everything.

pub mod abiencode;
pub mod chain;
pub mod channel;
pub mod engine;
pub mod payments;
pub mod protocols;
pub mod sig;
pub mod store;
pub mod types;

pub use engine::{Engine, EngineEvent, PermissivePolicy, PolicyMaker};
pub use types::{Address, Destination, Funds, Hash, Signature, U256};
