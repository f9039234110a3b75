//! MuSig2 tree-signing session (§4.4): nonce generation, aggregated-nonce intake, and
//! partial-signature emission, with the strict `getNonces → setAggregatedNonces → sign`
//! stage order enforced at the type level.

use crate::conversions::from_musig_xonly;
use crate::conversions::to_musig_pk;
use crate::server::NoncePks;
use crate::server::PartialSigTree;
use crate::tree::TreeTxOutputScript;
use crate::tree::VTXO_COSIGNER_PSBT_KEY;
use crate::Error;
use crate::TxGraph;
use crate::VTXO_INPUT_INDEX;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::Psbt;
use bitcoin::Sequence;
use bitcoin::TapSighashType;
use bitcoin::Txid;
use bitcoin::XOnlyPublicKey;
use musig::musig;
use rand::CryptoRng;
use rand::Rng;
use std::collections::HashMap;

/// The stages a [`TreeSigningSession`] moves through, in order. Calling the wrong method
/// for the current stage is a programmer error ([`Error::SigningStageViolation`]), not a
/// transient failure: the caller must fix the call order, not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingNonces,
    NoncesGenerated,
    AggregatedNonceSet,
}

/// A nonce key pair per tree transaction output that we are a cosigner of.
///
/// The [`musig::SecretNonce`] element is an [`Option`] because it cannot be cloned: once
/// [`TreeSigningSession::sign`] takes it to produce a partial signature, it is gone for
/// good, which is what prevents nonce reuse.
#[allow(clippy::type_complexity)]
struct NonceKps(HashMap<Txid, (Option<musig::SecretNonce>, musig::PublicNonce)>);

impl NonceKps {
    fn take_sk(&mut self, txid: &Txid) -> Option<musig::SecretNonce> {
        self.0.get_mut(txid).and_then(|(sec, _)| sec.take())
    }

    fn to_nonce_pks(&self) -> NoncePks {
        let nonce_pks = self
            .0
            .iter()
            .map(|(txid, (_, pub_nonce))| (*txid, *pub_nonce))
            .collect::<HashMap<_, _>>();

        NoncePks::new(nonce_pks)
    }
}

/// One party's view of signing every internal node of a single batch's vtxo (or
/// connectors) tree.
///
/// Construct one session per tree per round; it cannot be reused once all of its secret
/// nonces have been consumed.
pub struct TreeSigningSession {
    own_cosigner_kp: Keypair,
    nonce_kps: Option<NonceKps>,
    stage: Stage,
}

impl TreeSigningSession {
    pub fn new(own_cosigner_kp: Keypair) -> Self {
        Self {
            own_cosigner_kp,
            nonce_kps: None,
            stage: Stage::AwaitingNonces,
        }
    }

    pub fn own_cosigner_pk(&self) -> PublicKey {
        self.own_cosigner_kp.public_key()
    }

    /// Generate a nonce key pair for each tree transaction output this party cosigns.
    /// Corresponds to the `getNonces()` stage of §4.4.
    pub fn generate_nonces<R>(
        &mut self,
        rng: &mut R,
        tree_graph: &TxGraph,
        commitment_tx: &Psbt,
    ) -> Result<NoncePks, Error>
    where
        R: Rng + CryptoRng,
    {
        if self.stage != Stage::AwaitingNonces {
            return Err(Error::signing_stage_violation(
                "nonces were already generated for this session",
            ));
        }

        let secp_musig = musig::Secp256k1::new();
        let own_cosigner_pk = self.own_cosigner_pk();

        let tree_tx_map = tree_graph.as_map();

        let nonce_tree = tree_tx_map
            .iter()
            .map(|(txid, tx)| {
                let cosigner_pks = extract_cosigner_pks_from_vtxo_psbt(tx)?;

                if !cosigner_pks.contains(&own_cosigner_pk) {
                    return Err(Error::crypto(format!(
                        "cosigner PKs does not contain {own_cosigner_pk} for tree TX {txid}"
                    )));
                }

                let session_id = musig::SessionSecretRand::new();
                let extra_rand = rng.r#gen();

                let msg = tree_tx_sighash(tx, &tree_tx_map, commitment_tx)?;

                let key_agg_cache = {
                    let cosigner_pks = cosigner_pks
                        .iter()
                        .map(|pk| to_musig_pk(*pk))
                        .collect::<Vec<_>>();
                    musig::KeyAggCache::new(&secp_musig, &cosigner_pks.iter().collect::<Vec<_>>())
                };

                let (nonce, pub_nonce) = key_agg_cache.nonce_gen(
                    &secp_musig,
                    session_id,
                    to_musig_pk(own_cosigner_pk),
                    msg,
                    extra_rand,
                );

                Ok((*txid, (Some(nonce), pub_nonce)))
            })
            .collect::<Result<HashMap<_, _>, Error>>()?;

        let nonce_kps = NonceKps(nonce_tree);
        let pks = nonce_kps.to_nonce_pks();

        self.nonce_kps = Some(nonce_kps);
        self.stage = Stage::NoncesGenerated;

        Ok(pks)
    }

    /// Record that the server has aggregated every cosigner's nonces. Corresponds to the
    /// `setAggregatedNonces()` stage; calling [`Self::sign`] before this returns
    /// [`Error::SigningStageViolation`].
    pub fn acknowledge_aggregated_nonces(&mut self) -> Result<(), Error> {
        if self.stage != Stage::NoncesGenerated {
            return Err(Error::signing_stage_violation(
                "nonces must be generated before aggregated nonces can be acknowledged",
            ));
        }

        self.stage = Stage::AggregatedNonceSet;
        Ok(())
    }

    /// Emit this party's partial signature for one tree transaction. Corresponds to the
    /// `sign()` stage; may be called once per transaction in the tree after
    /// [`Self::acknowledge_aggregated_nonces`].
    pub fn sign(
        &mut self,
        tree_txid: Txid,
        vtxo_tree_expiry: Sequence,
        server_pk: XOnlyPublicKey,
        agg_nonce_pk: musig::AggregatedNonce,
        tree_graph: &TxGraph,
        commitment_psbt: &Psbt,
    ) -> Result<PartialSigTree, Error> {
        if self.stage != Stage::AggregatedNonceSet {
            return Err(Error::signing_stage_violation(
                "aggregated nonces must be acknowledged before signing",
            ));
        }

        let own_cosigner_pk = self.own_cosigner_pk();
        let internal_node_script = TreeTxOutputScript::new(vtxo_tree_expiry, server_pk);

        let secp = Secp256k1::new();
        let secp_musig = musig::Secp256k1::new();

        let own_cosigner_kp =
            musig::Keypair::from_seckey_slice(&secp_musig, &self.own_cosigner_kp.secret_bytes())
                .map_err(|e| Error::ad_hoc(format!("invalid keypair: {e}")))?;

        let tree_tx_map = tree_graph.as_map();

        let psbt = tree_tx_map
            .get(&tree_txid)
            .ok_or_else(|| Error::ad_hoc(format!("TXID {tree_txid} not found in tree map")))?;

        let mut cosigner_pks = extract_cosigner_pks_from_vtxo_psbt(psbt)?;
        cosigner_pks.sort_by_key(|k| k.serialize());

        if !cosigner_pks.contains(&own_cosigner_pk) {
            return Err(Error::ad_hoc(
                "own cosigner PK not found among tree transaction cosigner PKs",
            ));
        }

        tracing::debug!(%tree_txid, "generating partial signature");

        let mut key_agg_cache = {
            let cosigner_pks = cosigner_pks
                .iter()
                .map(|pk| to_musig_pk(*pk))
                .collect::<Vec<_>>();
            musig::KeyAggCache::new(&secp_musig, &cosigner_pks.iter().collect::<Vec<_>>())
        };

        let sweep_tap_tree =
            internal_node_script.sweep_spend_leaf(&secp, from_musig_xonly(key_agg_cache.agg_pk()))?;

        let tweak = musig::Scalar::from(
            musig::SecretKey::from_slice(sweep_tap_tree.tap_tweak().as_byte_array())
                .map_err(|e| Error::ad_hoc(format!("invalid tweak: {e}")))?,
        );

        key_agg_cache
            .pubkey_xonly_tweak_add(&secp_musig, &tweak)
            .map_err(Error::crypto)?;

        let msg = tree_tx_sighash(psbt, &tree_tx_map, commitment_psbt)?;

        let nonce_sk = self
            .nonce_kps
            .as_mut()
            .and_then(|kps| kps.take_sk(&tree_txid))
            .ok_or_else(|| Error::crypto(format!("missing nonce for tree TX {tree_txid}")))?;

        let sig = musig::Session::new(&secp_musig, &key_agg_cache, agg_nonce_pk, msg).partial_sign(
            &secp_musig,
            nonce_sk,
            &own_cosigner_kp,
            &key_agg_cache,
        );

        Ok(PartialSigTree(HashMap::from_iter([(tree_txid, sig)])))
    }
}

/// Compute the aggregated nonce public key for a transaction in the tree, from every
/// cosigner's public nonce.
pub fn aggregate_nonces(tree_tx_nonce_pks: crate::tree::TreeTxNoncePks) -> musig::AggregatedNonce {
    let secp_musig = musig::Secp256k1::new();

    let pks = tree_tx_nonce_pks.to_pks();
    let ref_pks = pks.iter().collect::<Vec<_>>();
    musig::AggregatedNonce::new(&secp_musig, &ref_pks)
}

fn tree_tx_sighash(
    psbt: &Psbt,
    tx_map: &HashMap<Txid, &Psbt>,
    commitment_tx: &Psbt,
) -> Result<musig::Message, Error> {
    let tx = &psbt.unsigned_tx;

    let previous_output = tx.input[VTXO_INPUT_INDEX].previous_output;

    let parent_tx = tx_map
        .get(&previous_output.txid)
        .or_else(|| {
            (previous_output.txid == commitment_tx.unsigned_tx.compute_txid())
                .then_some(&commitment_tx)
        })
        .ok_or_else(|| {
            Error::crypto(format!(
                "parent transaction {} not found for tree TX {}",
                previous_output.txid,
                tx.compute_txid()
            ))
        })?;
    let previous_output = parent_tx
        .unsigned_tx
        .output
        .get(previous_output.vout as usize)
        .ok_or_else(|| {
            Error::crypto(format!(
                "previous output {} not found for tree TX {}",
                previous_output,
                tx.compute_txid()
            ))
        })?;

    let prevouts = [previous_output];
    let prevouts = Prevouts::All(&prevouts);

    // A key-spend sighash: tree outputs are signed by every party with a vtxo in this
    // batch, coordinated efficiently through one MuSig2 aggregate key.
    let tap_sighash = SighashCache::new(tx)
        .taproot_key_spend_signature_hash(VTXO_INPUT_INDEX, &prevouts, TapSighashType::Default)
        .map_err(Error::crypto)?;

    Ok(musig::Message::from_digest(
        tap_sighash.to_raw_hash().to_byte_array(),
    ))
}

pub(crate) fn extract_cosigner_pks_from_vtxo_psbt(psbt: &Psbt) -> Result<Vec<PublicKey>, Error> {
    let vtxo_input = &psbt.inputs[VTXO_INPUT_INDEX];

    let mut cosigner_pks = Vec::new();
    for (key, pk) in vtxo_input.unknown.iter() {
        if key.key.starts_with(&VTXO_COSIGNER_PSBT_KEY) {
            cosigner_pks.push(
                bitcoin::PublicKey::from_slice(pk)
                    .map_err(Error::crypto)?
                    .inner,
            );
        }
    }
    Ok(cosigner_pks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_before_nonces_are_generated_is_a_stage_violation() {
        let secp = Secp256k1::new();
        let kp = Keypair::new(&secp, &mut bitcoin::secp256k1::rand::thread_rng());
        let mut session = TreeSigningSession::new(kp);

        let err = session.acknowledge_aggregated_nonces().unwrap_err();
        assert!(matches!(err, Error::SigningStageViolation(_)));
    }

    #[test]
    fn generating_nonces_twice_is_a_stage_violation() {
        let secp = Secp256k1::new();
        let kp = Keypair::new(&secp, &mut bitcoin::secp256k1::rand::thread_rng());
        let mut session = TreeSigningSession::new(kp);
        session.stage = Stage::NoncesGenerated;

        let mut rng = bitcoin::secp256k1::rand::thread_rng();
        let empty_graph = TxGraph::default();
        let commitment = empty_psbt();

        let err = session
            .generate_nonces(&mut rng, &empty_graph, &commitment)
            .unwrap_err();
        assert!(matches!(err, Error::SigningStageViolation(_)));
    }

    fn empty_psbt() -> Psbt {
        use bitcoin::absolute::LockTime;
        use bitcoin::transaction::Version;
        use bitcoin::Transaction;

        Psbt::from_unsigned_tx(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        })
        .unwrap()
    }
}
