//! Arkade script extension: tapscript vocabulary, key tweaking, and address codec.
//!
//! This crate has no network or async dependencies. It is the leaf layer consumed by
//! `ark-core`: every composite Taproot tree the protocol recognises (default vtxo,
//! boarding UTXO, VHTLC) is built out of the leaf scripts and helpers exposed here.

pub mod address;
pub mod opcodes;
pub mod taproot;

pub use address::ArkAddress;
pub use taproot::TapLeafScript;
pub use taproot::UNSPENDABLE_KEY;
