//! External-system boundaries (§4.8): everything the settlement engine needs from an Ark
//! server, an on-chain indexer, and a broadcaster, expressed as traits only. Nothing in
//! this crate implements HTTP, gRPC, or any other wire transport over these traits — that
//! is explicitly out of scope (§2, Non-goals).

use crate::error::Error;
use ark_core::intent::Intent;
use ark_core::server::Info;
use ark_core::server::NoncePks;
use ark_core::server::PartialSigTree;
use ark_core::server::StreamEvent;
use ark_core::ExplorerUtxo;
use ark_core::Vtxo;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Address;
use bitcoin::Psbt;
use bitcoin::Txid;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// An input being registered for the next settlement round, keyed by its outpoint already
/// (`ark_core::input::SettlementInput` carries everything else).
pub use ark_core::input::SettlementInput;

/// The identifier the server assigns to a registration, echoed back on every ping and
/// carried through the rest of the round.
pub type RequestId = String;

/// Everything the settlement engine needs from the Ark server (§4.8, §6).
///
/// Spec §4.8 describes registration as two calls, `registerInputsForNextRound` and
/// `registerOutputsForNextRound`; the server this crate actually targets collapses both
/// into a single signed intent proof (`ark_core::intent::make_intent`), so registration
/// here is one call, `register_intent`, that submits that proof and gets a request id back.
#[async_trait]
pub trait ArkProvider: Send + Sync {
    async fn get_info(&self) -> Result<Info, Error>;

    async fn register_intent(&self, intent: &Intent) -> Result<RequestId, Error>;

    async fn confirm_registration(&self, request_id: &RequestId) -> Result<(), Error>;

    async fn submit_tree_nonces(
        &self,
        request_id: &RequestId,
        cosigner_pk: PublicKey,
        nonces: NoncePks,
    ) -> Result<(), Error>;

    async fn submit_tree_signatures(
        &self,
        request_id: &RequestId,
        cosigner_pk: PublicKey,
        signatures: PartialSigTree,
    ) -> Result<(), Error>;

    async fn submit_signed_forfeit_txs(
        &self,
        signed_forfeit_txs: &[Psbt],
        signed_commitment_tx: Option<Psbt>,
    ) -> Result<(), Error>;

    async fn ping(&self, request_id: &RequestId) -> Result<(), Error>;

    async fn submit_virtual_tx(&self, psbt: &Psbt) -> Result<Txid, Error>;

    /// A stream of settlement events, reconnecting on transient failures until
    /// `cancellation` fires (the sole internally-retried operation; see §7).
    fn get_event_stream(
        &self,
        cancellation: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>;
}

/// A read-only view of on-chain coins for a set of scripts (§4.8).
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn get_coins(&self, address: &Address) -> Result<Vec<ExplorerUtxo>, Error>;
}

/// Broadcasts a finished transaction (§4.8). Deliberately narrow: this crate never decides
/// *when* to broadcast, only exposes the capability to callers that do.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid, Error>;
}

/// A vtxo returned by an indexer lookup, paired with the vtxo policy it was constructed
/// under (needed to rebuild its leaf scripts for spending).
#[derive(Clone)]
pub struct IndexedVtxo {
    pub vtxo: Vtxo,
    pub outpoint: bitcoin::OutPoint,
    pub amount: bitcoin::Amount,
}
