//! The signer abstraction (§4.7): an [`Identity`] owns (or has access to) exactly the key
//! material needed to produce Schnorr signatures and MuSig2 cosigner sessions, without the
//! rest of this crate ever needing to know whether that means an in-memory keypair, a
//! hardware signer, or something else entirely.

use crate::error::Error;
use crate::error::ErrorContext;
use ark_core::musig::TreeSigningSession;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::psbt;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot;
use bitcoin::Psbt;
use bitcoin::TapLeafHash;
use bitcoin::TapSighashType;
use bitcoin::Witness;
use bitcoin::XOnlyPublicKey;

/// A source of Schnorr signatures and MuSig2 cosigner sessions for one owner key.
///
/// `sign` finalises the inputs named in `input_indexes` (or every input, if `None`):
/// it expects each selected input to already carry the `(script, control_block)` pair of
/// the leaf it spends under (as every builder in `ark-core` leaves them), computes the
/// script-path sighash, signs it, and writes the finished witness stack back onto the
/// PSBT input.
pub trait Identity: Send + Sync {
    fn x_only_public_key(&self) -> XOnlyPublicKey;

    fn sign_for_pk(
        &self,
        pk: &XOnlyPublicKey,
        msg: &secp256k1::Message,
    ) -> Result<schnorr::Signature, Error>;

    /// A fresh MuSig2 tree-signing session for this identity's cosigner keypair. Every
    /// settlement round needs its own session; this is a factory, not a handle to shared
    /// state.
    fn signer_session(&self) -> Result<TreeSigningSession, Error>;

    fn sign(&self, psbt: &mut Psbt, input_indexes: Option<&[usize]>) -> Result<(), Error> {
        sign_leaf_inputs(self, psbt, input_indexes, &[])
    }
}

/// Compute the leaf sighash for `psbt.inputs[index]` and finalise its witness as
/// `[sig, script, control_block]`, with `leading_witness` elements (if any) pushed ahead of
/// the signature.
fn sign_leaf_inputs<I>(
    identity: &I,
    psbt: &mut Psbt,
    input_indexes: Option<&[usize]>,
    leading_witness: &[Vec<u8>],
) -> Result<(), Error>
where
    I: Identity + ?Sized,
{
    let secp = Secp256k1::new();

    let prevouts = psbt
        .inputs
        .iter()
        .filter_map(|i| i.witness_utxo.clone())
        .collect::<Vec<_>>();

    let indexes: Vec<usize> = match input_indexes {
        Some(indexes) => indexes.to_vec(),
        None => (0..psbt.inputs.len()).collect(),
    };

    for i in indexes {
        let (script, control_block) = psbt.inputs[i]
            .tap_scripts
            .first_key_value()
            .map(|(cb, (script, _))| (script.clone(), cb.clone()))
            .ok_or_else(|| Error::protocol(format!("input {i} has no annotated leaf script")))?;

        let leaf_hash = TapLeafHash::from_script(&script, control_block.leaf_version);

        let tap_sighash = {
            let prevouts = Prevouts::All(&prevouts);
            SighashCache::new(&psbt.unsigned_tx)
                .taproot_script_spend_signature_hash(
                    i,
                    &prevouts,
                    leaf_hash,
                    TapSighashType::Default,
                )
                .map_err(|e| Error::protocol(e.to_string()))
                .with_context(|| format!("computing sighash for input {i}"))?
        };

        let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());
        let pk = identity.x_only_public_key();

        let sig = identity
            .sign_for_pk(&pk, &msg)
            .with_context(|| format!("signing input {i}"))?;

        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|e| Error::protocol(e.to_string()))
            .context("failed to verify own signature")?;

        let sig = taproot::Signature {
            signature: sig,
            sighash_type: TapSighashType::Default,
        };

        let mut witness = Witness::new();
        for element in leading_witness {
            witness.push(element);
        }
        witness.push(sig.to_vec());
        witness.push(script.as_bytes());
        witness.push(control_block.serialize());

        psbt.inputs[i].final_script_witness = Some(witness);
    }

    Ok(())
}

/// An [`Identity`] holding an in-memory [`Keypair`] directly. The only concrete
/// implementation in this crate; production callers with a hardware signer or remote
/// signing service would implement [`Identity`] directly instead.
#[derive(Clone)]
pub struct KeypairIdentity {
    keypair: Keypair,
}

impl KeypairIdentity {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }
}

impl Identity for KeypairIdentity {
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    fn sign_for_pk(
        &self,
        pk: &XOnlyPublicKey,
        msg: &secp256k1::Message,
    ) -> Result<schnorr::Signature, Error> {
        let own_pk = self.x_only_public_key();
        if &own_pk != pk {
            return Err(Error::protocol(format!(
                "identity holds {own_pk}, asked to sign for {pk}"
            )));
        }

        let secp = Secp256k1::new();
        Ok(secp.sign_schnorr(msg, &self.keypair))
    }

    fn signer_session(&self) -> Result<TreeSigningSession, Error> {
        Ok(TreeSigningSession::new(self.keypair))
    }
}

/// Wraps an [`Identity`] to claim a VHTLC: `sign` prepends the preimage as the leading
/// witness element on input 0 (the VHTLC being claimed), producing the witness ordering
/// `[preimage, sig, script, control_block]`. Every other input, and every other method,
/// delegates to the inner identity unchanged.
pub struct VhtlcClaimIdentity<I> {
    inner: I,
    preimage: [u8; 32],
}

impl<I> VhtlcClaimIdentity<I> {
    pub fn new(inner: I, preimage: [u8; 32]) -> Self {
        Self { inner, preimage }
    }
}

impl<I> Identity for VhtlcClaimIdentity<I>
where
    I: Identity,
{
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.inner.x_only_public_key()
    }

    fn sign_for_pk(
        &self,
        pk: &XOnlyPublicKey,
        msg: &secp256k1::Message,
    ) -> Result<schnorr::Signature, Error> {
        self.inner.sign_for_pk(pk, msg)
    }

    fn signer_session(&self) -> Result<TreeSigningSession, Error> {
        self.inner.signer_session()
    }

    fn sign(&self, psbt: &mut Psbt, input_indexes: Option<&[usize]>) -> Result<(), Error> {
        const CLAIM_INPUT_INDEX: usize = 0;

        let indexes = match input_indexes {
            Some(indexes) => indexes.to_vec(),
            None => (0..psbt.inputs.len()).collect(),
        };

        let (claim, rest): (Vec<usize>, Vec<usize>) =
            indexes.into_iter().partition(|&i| i == CLAIM_INPUT_INDEX);

        if !claim.is_empty() {
            sign_leaf_inputs(&self.inner, psbt, Some(&claim), &[self.preimage.to_vec()])?;
        }
        if !rest.is_empty() {
            sign_leaf_inputs(&self.inner, psbt, Some(&rest), &[])?;
        }

        Ok(())
    }
}

/// Co-sign one input of a PSBT under a specific leaf, without finalising the whole PSBT.
/// Matches the `sign_fn` closure shape `ark_core::forfeit` expects, which accumulates
/// signatures from multiple cosigners onto one `psbt::Input` rather than finalising it
/// outright; errors are converted to `ark_core::Error` since that is the error type the
/// forfeit builder's generic bound is stated in terms of.
pub fn sign_input_for_leaf<I: Identity + ?Sized>(
    identity: &I,
    psbt_input: &mut psbt::Input,
    msg: secp256k1::Message,
) -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, ark_core::Error> {
    let _ = psbt_input;
    let pk = identity.x_only_public_key();
    let sig = identity
        .sign_for_pk(&pk, &msg)
        .map_err(|e| ark_core::Error::crypto(e.to_string()))?;
    Ok(vec![(sig, pk)])
}

/// Co-sign a single boarding-output input of the commitment PSBT under its forfeit leaf.
/// Matches the `sign_for_pk_fn` closure shape `ark_core::forfeit::sign_commitment_psbt`
/// expects.
pub fn sign_for_pk_fn<I: Identity + ?Sized>(
    identity: &I,
    pk: &XOnlyPublicKey,
    msg: &secp256k1::Message,
) -> Result<schnorr::Signature, ark_core::Error> {
    identity
        .sign_for_pk(pk, msg)
        .map_err(|e| ark_core::Error::crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::rand;

    fn identity() -> KeypairIdentity {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        KeypairIdentity::new(keypair)
    }

    #[test]
    fn sign_for_pk_rejects_a_foreign_public_key() {
        let id = identity();
        let secp = Secp256k1::new();
        let other = Keypair::new(&secp, &mut rand::thread_rng())
            .x_only_public_key()
            .0;

        let msg = secp256k1::Message::from_digest([7u8; 32]);
        let err = id.sign_for_pk(&other, &msg).unwrap_err();
        assert!(err.to_string().contains("asked to sign for"));
    }

    #[test]
    fn vhtlc_claim_identity_delegates_pubkey_and_session() {
        let inner = identity();
        let pk = inner.x_only_public_key();
        let wrapped = VhtlcClaimIdentity::new(inner, [1u8; 32]);

        assert_eq!(wrapped.x_only_public_key(), pk);
        assert!(wrapped.signer_session().is_ok());
    }
}
