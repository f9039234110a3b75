//! End-to-end settlement engine scenarios driven against a mock provider: no real server,
//! no real signatures beyond what a note redemption needs, covering the two outcomes that
//! don't depend on constructing a live MuSig2 tree-signing round (cancellation, and a
//! server-side batch failure).

use ark_client::provider::ArkProvider;
use ark_client::provider::RequestId;
use ark_client::provider::SettlementInput;
use ark_client::Error;
use ark_client::KeypairIdentity;
use ark_client::SettlementEngine;
use ark_core::forfeit::OnChainInput;
use ark_core::intent;
use ark_core::intent::Intent;
use ark_core::server::BatchFailed;
use ark_core::server::BatchStartedEvent;
use ark_core::server::Info;
use ark_core::server::NoncePks;
use ark_core::server::PartialSigTree;
use ark_core::server::StreamEvent;
use ark_core::ArkNote;
use async_trait::async_trait;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::Network;
use bitcoin::Psbt;
use bitcoin::Txid;
use futures::stream;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A provider whose event stream replays a fixed, pre-baked script of events, and whose
/// every other call trivially succeeds. Good enough to drive the engine's state machine
/// without a real Ark server.
struct ScriptedProvider {
    info: Info,
    events: Mutex<Option<Vec<StreamEvent>>>,
}

impl ScriptedProvider {
    fn new(events: Vec<StreamEvent>) -> Self {
        let secp = Secp256k1::new();
        let server_keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (internal_key, _) = server_keypair.x_only_public_key();
        let forfeit_address = Address::p2tr(&secp, internal_key, None, Network::Regtest);

        Self {
            info: Info {
                pk: server_keypair.public_key(),
                vtxo_tree_expiry: bitcoin::Sequence::from_consensus(144),
                unilateral_exit_delay: bitcoin::Sequence::from_consensus(144),
                boarding_exit_delay: bitcoin::Sequence::from_consensus(144),
                round_interval: 10,
                network: Network::Regtest,
                dust: Amount::from_sat(1_000),
                forfeit_address,
                version: "test".to_string(),
                utxo_min_amount: None,
                utxo_max_amount: None,
                vtxo_min_amount: None,
                vtxo_max_amount: None,
            },
            events: Mutex::new(Some(events)),
        }
    }
}

#[async_trait]
impl ArkProvider for ScriptedProvider {
    async fn get_info(&self) -> Result<Info, Error> {
        Ok(self.info.clone())
    }

    async fn register_intent(&self, _intent: &Intent) -> Result<RequestId, Error> {
        Ok("request-1".to_string())
    }

    async fn confirm_registration(&self, _request_id: &RequestId) -> Result<(), Error> {
        Ok(())
    }

    async fn submit_tree_nonces(
        &self,
        _request_id: &RequestId,
        _cosigner_pk: PublicKey,
        _nonces: NoncePks,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn submit_tree_signatures(
        &self,
        _request_id: &RequestId,
        _cosigner_pk: PublicKey,
        _signatures: PartialSigTree,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn submit_signed_forfeit_txs(
        &self,
        _signed_forfeit_txs: &[Psbt],
        _signed_commitment_tx: Option<Psbt>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn ping(&self, _request_id: &RequestId) -> Result<(), Error> {
        Ok(())
    }

    async fn submit_virtual_tx(&self, psbt: &Psbt) -> Result<Txid, Error> {
        Ok(psbt.unsigned_tx.compute_txid())
    }

    fn get_event_stream(
        &self,
        _cancellation: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>> {
        let events = self
            .events
            .lock()
            .expect("events mutex poisoned")
            .take()
            .unwrap_or_default();

        Box::pin(stream::iter(events.into_iter().map(Ok)))
    }
}

fn note_input() -> SettlementInput {
    let note = ArkNote::new([9u8; 32], Amount::from_sat(5_000)).expect("valid note");
    SettlementInput::Note(note)
}

fn identity() -> Arc<KeypairIdentity> {
    let secp = Secp256k1::new();
    let keypair = Keypair::new(&secp, &mut rand::thread_rng());
    Arc::new(KeypairIdentity::new(keypair))
}

#[tokio::test]
async fn cancellation_before_round_events_stops_the_engine() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let engine = SettlementEngine::new(provider, identity());

    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let outputs: Vec<intent::Output> = Vec::new();
    let onchain_inputs: Vec<OnChainInput> = Vec::new();

    let result = engine
        .run(
            &mut rand::thread_rng(),
            vec![note_input()],
            outputs,
            onchain_inputs,
            cancellation,
        )
        .await;

    assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
}

#[tokio::test]
async fn a_batch_failure_event_surfaces_the_servers_reason() {
    let events = vec![
        StreamEvent::BatchStarted(BatchStartedEvent {
            id: "batch-1".to_string(),
            intent_id_hashes: vec![],
            batch_expiry: 0,
        }),
        StreamEvent::BatchFailed(BatchFailed {
            id: "batch-1".to_string(),
            reason: "insufficient liquidity".to_string(),
        }),
    ];

    let provider = Arc::new(ScriptedProvider::new(events));
    let engine = SettlementEngine::new(provider, identity());

    let outputs: Vec<intent::Output> = Vec::new();
    let onchain_inputs: Vec<OnChainInput> = Vec::new();

    let result = engine
        .run(
            &mut rand::thread_rng(),
            vec![note_input()],
            outputs,
            onchain_inputs,
            CancellationToken::new(),
        )
        .await;

    match result {
        Err(Error::SettlementFailed { reason }) => assert_eq!(reason, "insufficient liquidity"),
        other => panic!("expected SettlementFailed, got {other:?}"),
    }
}
