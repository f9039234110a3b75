//! The settlement engine (§4.6): drives one round from registration through forfeit
//! submission to a finished commitment txid, as a strictly sequential state machine over
//! the provider's event stream (§5 — event handling for event N must finish before event
//! N+1 is processed; there is no shared mutable state between concurrent settlements, so a
//! second settlement needs its own [`SettlementEngine::run`] call).

use crate::error::Error;
use crate::error::ErrorContext;
use crate::identity::sign_for_pk_fn;
use crate::identity::sign_input_for_leaf;
use crate::identity::Identity;
use crate::provider::ArkProvider;
use crate::provider::SettlementInput;
use ark_core::forfeit::create_and_sign_forfeit_txs;
use ark_core::forfeit::sign_commitment_psbt;
use ark_core::forfeit::OnChainInput;
use ark_core::intent;
use ark_core::intent::make_intent;
use ark_core::intent::IntentMessage;
use ark_core::musig::aggregate_nonces;
use ark_core::server::BatchTreeEventType;
use ark_core::server::StreamEvent;
use ark_core::server::TxTree;
use ark_core::tree::validate_connectors_tree;
use ark_core::tree::validate_vtxo_tree;
use ark_core::tree::TreeTxNoncePks;
use ark_core::TxGraph;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::Txid;
use futures::StreamExt;
use rand::CryptoRng;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often the engine pings the server to keep a registration alive while waiting for
/// the round to start (§4.6, §5).
const PING_INTERVAL: Duration = Duration::from_millis(1000);

/// The stages a settlement moves through, in the order §4.6 lays out. Events that arrive
/// out of order for the current stage are dropped with a warning rather than treated as
/// errors: the server may re-broadcast events, or multiplex unrelated rounds onto the same
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Registering,
    BatchStarted,
    Nonces,
    Signatures,
    Forfeiting,
}

impl Stage {
    fn next(self) -> Self {
        match self {
            Stage::Registering => Stage::BatchStarted,
            Stage::BatchStarted => Stage::Nonces,
            Stage::Nonces => Stage::Signatures,
            Stage::Signatures => Stage::Forfeiting,
            Stage::Forfeiting => Stage::Forfeiting,
        }
    }
}

/// Drives a single settlement round end to end. Stateless between calls: every
/// [`Self::run`] is an independent session with its own cosigner keypair and signing
/// session, per §5's "no shared mutable state between concurrent settlements".
pub struct SettlementEngine<P, I> {
    provider: Arc<P>,
    identity: Arc<I>,
}

impl<P, I> SettlementEngine<P, I>
where
    P: ArkProvider,
    I: Identity,
{
    pub fn new(provider: Arc<P>, identity: Arc<I>) -> Self {
        Self { provider, identity }
    }

    /// Register `inputs` against `outputs`, then drive the round through to completion,
    /// returning the commitment transaction's txid.
    ///
    /// `onchain_inputs` carries the boarding UTXOs among `inputs` again, this time as full
    /// [`OnChainInput`]s: the commitment PSBT co-signing step needs each one's
    /// [`ark_core::vtxo::BoardingOutput`] to rebuild its forfeit leaf, which a generic
    /// [`SettlementInput`] does not carry. Pass an empty vec if none of `inputs` board.
    pub async fn run<R>(
        &self,
        rng: &mut R,
        inputs: Vec<SettlementInput>,
        outputs: Vec<intent::Output>,
        onchain_inputs: Vec<OnChainInput>,
        cancellation: CancellationToken,
    ) -> Result<Txid, Error>
    where
        R: Rng + CryptoRng,
    {
        if inputs.is_empty() {
            return Err(Error::protocol("cannot settle without inputs"));
        }

        let registered_leaf_scripts: Vec<ScriptBuf> = outputs
            .iter()
            .filter_map(|o| match o {
                intent::Output::Offchain(txout) => Some(txout.script_pubkey.clone()),
                intent::Output::Onchain(_) => None,
            })
            .collect();

        let server_info = self.provider.get_info().await?;
        let (server_pk, _) = server_info.pk.x_only_public_key();

        let secp = Secp256k1::new();
        let own_cosigner_kp = Keypair::new(&secp, rng);
        let own_cosigner_pk = own_cosigner_kp.public_key();

        let vtxo_inputs = inputs
            .iter()
            .filter(|i| i.needs_forfeit())
            .cloned()
            .collect::<Vec<_>>();

        let intent_inputs = inputs
            .iter()
            .map(SettlementInput::to_intent_input)
            .collect::<Result<Vec<_>, _>>()?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| Error::protocol(e.to_string()))?
            .as_secs();

        let message = IntentMessage::Register {
            onchain_output_indexes: outputs
                .iter()
                .enumerate()
                .filter_map(|(i, o)| matches!(o, intent::Output::Onchain(_)).then_some(i))
                .collect(),
            valid_at: now,
            expire_at: now + 2 * 60,
            own_cosigner_pks: vec![own_cosigner_pk],
        };

        let identity = self.identity.clone();
        let sign_for_vtxo_fn = |psbt_input: &mut bitcoin::psbt::Input,
                                msg: bitcoin::secp256k1::Message|
         -> Result<
            Vec<(
                bitcoin::secp256k1::schnorr::Signature,
                bitcoin::XOnlyPublicKey,
            )>,
            ark_core::Error,
        > { sign_input_for_leaf(identity.as_ref(), psbt_input, msg) };

        let identity = self.identity.clone();
        let sign_for_onchain_fn = |psbt_input: &mut bitcoin::psbt::Input,
                                   msg: bitcoin::secp256k1::Message|
         -> Result<
            (
                bitcoin::secp256k1::schnorr::Signature,
                bitcoin::XOnlyPublicKey,
            ),
            ark_core::Error,
        > {
            let pk = identity.x_only_public_key();
            let sig = sign_for_pk_fn(identity.as_ref(), &pk, &msg)?;
            Ok((sig, pk))
        };

        let intent = make_intent(
            sign_for_vtxo_fn,
            sign_for_onchain_fn,
            intent_inputs,
            outputs,
            message,
        )?;

        let request_id = self.provider.register_intent(&intent).await?;

        tracing::info!(request_id, "registered settlement intent");

        let ping_handle = self.spawn_ping_loop(request_id.clone(), cancellation.clone());

        let result = self
            .drive_round(
                rng,
                &request_id,
                &server_info,
                server_pk,
                own_cosigner_kp,
                vtxo_inputs,
                onchain_inputs,
                &registered_leaf_scripts,
                cancellation.clone(),
            )
            .await;

        ping_handle.abort();

        match &result {
            Ok(txid) => tracing::info!(request_id, %txid, "settlement finalized"),
            Err(e) => tracing::warn!(request_id, error = %e, "settlement did not finish"),
        }

        result
    }

    fn spawn_ping_loop(
        &self,
        request_id: String,
        cancellation: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let provider = self.provider.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        tracing::debug!(request_id, "ping loop cancelled");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = provider.ping(&request_id).await {
                            tracing::warn!(request_id, error = %e, "ping failed");
                        }
                    }
                }
            }
        })
    }

    async fn drive_round<R>(
        &self,
        rng: &mut R,
        request_id: &str,
        server_info: &ark_core::server::Info,
        server_pk: bitcoin::XOnlyPublicKey,
        own_cosigner_kp: Keypair,
        vtxo_inputs: Vec<SettlementInput>,
        onchain_inputs: Vec<OnChainInput>,
        registered_leaf_scripts: &[ScriptBuf],
        cancellation: CancellationToken,
    ) -> Result<Txid, Error>
    where
        R: Rng + CryptoRng,
    {
        let vtxo_intent_inputs = vtxo_inputs
            .iter()
            .map(SettlementInput::to_intent_input)
            .collect::<Result<Vec<_>, _>>()?;

        let mut stage = Stage::Registering;

        let mut vtxo_graph_chunks = Some(Vec::new());
        let mut connectors_graph_chunks = Some(Vec::new());
        let mut vtxo_graph: Option<TxGraph> = None;
        let mut commitment_tx: Option<Psbt> = None;
        let mut signing_session = self.identity.signer_session()?;

        let mut stream = self.provider.get_event_stream(cancellation.clone());

        loop {
            if cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let event = tokio::select! {
                _ = cancellation.cancelled() => return Err(Error::Cancelled),
                event = stream.next() => event,
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) if e.is_transient() => {
                    tracing::warn!(error = %e, "transient event stream error, continuing");
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::protocol("event stream ended unexpectedly")),
            };

            tracing::debug!(event = event.name(), ?stage, "settlement event");

            match event {
                StreamEvent::BatchStarted(_) if stage == Stage::Registering => {
                    stage = stage.next();
                }
                StreamEvent::TreeTx(e) if stage == Stage::BatchStarted || stage == Stage::Nonces => {
                    match e.batch_tree_event_type {
                        BatchTreeEventType::Vtxo => {
                            if let Some(chunks) = vtxo_graph_chunks.as_mut() {
                                chunks.push(e.tx_graph_chunk);
                            }
                        }
                        BatchTreeEventType::Connector => {
                            if let Some(chunks) = connectors_graph_chunks.as_mut() {
                                chunks.push(e.tx_graph_chunk);
                            }
                        }
                    }
                }
                StreamEvent::TreeSigningStarted(e) if stage == Stage::BatchStarted => {
                    let chunks = vtxo_graph_chunks
                        .take()
                        .ok_or_else(|| Error::protocol("missing VTXO graph chunks"))?;

                    if !e.cosigners_pubkeys.contains(&own_cosigner_kp.public_key()) {
                        return Err(Error::protocol(
                            "our cosigner PK was not included in the round's cosigner set",
                        ));
                    }

                    let shared_output = e
                        .unsigned_commitment_tx
                        .unsigned_tx
                        .output
                        .first()
                        .ok_or_else(|| Error::protocol("commitment TX has no shared output"))?
                        .clone();

                    let tree = TxTree::from_chunks(&chunks)
                        .map_err(Error::from)
                        .context("reconstructing VTXO tree from event chunks")?;

                    validate_vtxo_tree(
                        &tree,
                        &shared_output,
                        server_pk,
                        server_info.vtxo_tree_expiry,
                        registered_leaf_scripts,
                    )
                    .map_err(Error::from)
                    .context("validating VTXO tree")?;

                    let graph = TxGraph::from_chunks(chunks);

                    let nonces = signing_session
                        .generate_nonces(rng, &graph, &e.unsigned_commitment_tx)
                        .map_err(Error::from)
                        .context("generating tree nonces")?;

                    self.provider
                        .submit_tree_nonces(
                            &request_id.to_string(),
                            own_cosigner_kp.public_key(),
                            nonces,
                        )
                        .await?;

                    vtxo_graph = Some(graph);
                    commitment_tx = Some(e.unsigned_commitment_tx);
                    stage = stage.next();
                }
                StreamEvent::TreeNoncesAggregated(e) if stage == Stage::Nonces => {
                    signing_session.acknowledge_aggregated_nonces()?;

                    let graph = vtxo_graph
                        .as_ref()
                        .ok_or_else(|| Error::protocol("missing VTXO graph"))?;
                    let commitment = commitment_tx
                        .as_ref()
                        .ok_or_else(|| Error::protocol("missing commitment TX"))?;

                    for txid in graph.as_map().keys() {
                        let nonce = e.tree_nonces.get(txid).ok_or_else(|| {
                            Error::protocol(format!("missing aggregated nonce for TX {txid}"))
                        })?;

                        // The event already carries the per-node nonce aggregated across all
                        // cosigners; wrap it as a singleton and reuse the same aggregation
                        // routine rather than reach for a private wire-format conversion.
                        let mut singleton = TreeTxNoncePks::new();
                        singleton.insert(own_cosigner_kp.public_key(), nonce);
                        let agg_nonce = aggregate_nonces(singleton);

                        let partial_sigs = signing_session.sign(
                            *txid,
                            server_info.vtxo_tree_expiry,
                            server_pk,
                            agg_nonce,
                            graph,
                            commitment,
                        )?;

                        self.provider
                            .submit_tree_signatures(
                                &request_id.to_string(),
                                own_cosigner_kp.public_key(),
                                partial_sigs,
                            )
                            .await?;
                    }

                    stage = stage.next();
                }
                StreamEvent::TreeSignature(_) if stage == Stage::Signatures => {
                    // The server's own aggregated signature broadcast; nothing for the
                    // client to act on, it already submitted its partial signature.
                }
                StreamEvent::BatchFinalization(e) if stage == Stage::Signatures => {
                    let mut commitment_psbt = e.commitment_tx;

                    let signed_forfeit_psbts = if vtxo_intent_inputs.is_empty() {
                        Vec::new()
                    } else {
                        let chunks = connectors_graph_chunks
                            .take()
                            .ok_or_else(|| Error::protocol("missing connectors graph chunks"))?;

                        let shared_output = commitment_psbt
                            .unsigned_tx
                            .output
                            .get(1)
                            .ok_or_else(|| {
                                Error::protocol("commitment TX has no connectors output (vout 1)")
                            })?
                            .clone();

                        let connectors_tree = TxTree::from_chunks(&chunks)
                            .map_err(Error::from)
                            .context("reconstructing connectors tree from event chunks")?;

                        validate_connectors_tree(
                            &connectors_tree,
                            &shared_output,
                            server_pk,
                            server_info.vtxo_tree_expiry,
                        )
                        .map_err(Error::from)
                        .context("validating connectors tree")?;

                        let connectors_graph = TxGraph::from_chunks(chunks);

                        let identity = self.identity.clone();
                        let sign_fn = |psbt_input: &mut bitcoin::psbt::Input,
                                       msg: bitcoin::secp256k1::Message|
                         -> Result<
                            Vec<(
                                bitcoin::secp256k1::schnorr::Signature,
                                bitcoin::XOnlyPublicKey,
                            )>,
                            ark_core::Error,
                        > { sign_input_for_leaf(identity.as_ref(), psbt_input, msg) };

                        create_and_sign_forfeit_txs(
                            sign_fn,
                            &vtxo_intent_inputs,
                            &connectors_graph.leaves(),
                            &server_info.forfeit_address,
                            server_info.dust,
                        )
                        .map_err(Error::from)
                        .context("building forfeit transactions")?
                    };

                    if !onchain_inputs.is_empty() {
                        let identity = self.identity.clone();
                        let sign_for_pk = move |pk: &bitcoin::XOnlyPublicKey,
                                                msg: &bitcoin::secp256k1::Message|
                              -> Result<bitcoin::secp256k1::schnorr::Signature, ark_core::Error> {
                            sign_for_pk_fn(identity.as_ref(), pk, msg)
                        };

                        sign_commitment_psbt(sign_for_pk, &mut commitment_psbt, &onchain_inputs)
                            .map_err(Error::from)
                            .context("co-signing commitment TX for boarding inputs")?;
                    }

                    let commitment_to_submit = (!onchain_inputs.is_empty()).then_some(commitment_psbt);

                    self.provider
                        .submit_signed_forfeit_txs(&signed_forfeit_psbts, commitment_to_submit)
                        .await?;

                    stage = stage.next();
                }
                StreamEvent::BatchFinalized(e) if stage == Stage::Forfeiting => {
                    return Ok(e.commitment_txid);
                }
                StreamEvent::BatchFailed(e) => {
                    return Err(Error::settlement_failed(e.reason));
                }
                other => {
                    tracing::warn!(event = other.name(), ?stage, "dropping out-of-order event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Stage;

    #[test]
    fn stage_progression_is_linear_and_saturating() {
        assert_eq!(Stage::Registering.next(), Stage::BatchStarted);
        assert_eq!(Stage::BatchStarted.next(), Stage::Nonces);
        assert_eq!(Stage::Nonces.next(), Stage::Signatures);
        assert_eq!(Stage::Signatures.next(), Stage::Forfeiting);
        assert_eq!(Stage::Forfeiting.next(), Stage::Forfeiting);
    }
}
