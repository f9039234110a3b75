//! Client-side coordination logic for Ark (§4.6-4.8): an [`Identity`], a set of
//! [`provider::ArkProvider`]-family implementations, and a [`settlement::SettlementEngine`]
//! that drives one round between them.
//!
//! This crate deliberately stops at the trait boundary for every external system (§4.8,
//! Non-goals): no HTTP client, no gRPC stubs, no on-disk wallet storage. A full client
//! application wires a concrete transport into [`provider::ArkProvider`] and
//! [`provider::ChainProvider`], then drives [`settlement::SettlementEngine::run`] per
//! round.

pub mod error;
pub mod identity;
pub mod provider;
pub mod settlement;

pub use error::Error;
pub use error::ErrorContext;
pub use identity::Identity;
pub use identity::KeypairIdentity;
pub use identity::VhtlcClaimIdentity;
pub use provider::ArkProvider;
pub use provider::Broadcaster;
pub use provider::ChainProvider;
pub use provider::IndexedVtxo;
pub use provider::RequestId;
pub use provider::SettlementInput;
pub use settlement::SettlementEngine;
