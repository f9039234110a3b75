//! Leaf script builders and parsers for the tapscript vocabulary of §4.1.
//!
//! All four leaf templates share one rule: the spending condition comes first, an
//! `N`-of-`N` (or `1`-of-`1`) `CHECKSIG`/`CHECKSIGVERIFY` chain comes last. A reader only
//! has to learn the prefix opcode to recognise which of the four leaves they are looking
//! at.

use bitcoin::absolute;
use bitcoin::opcodes::all::*;
use bitcoin::script::Instruction;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;
use std::fmt;

/// An `M`-of-`N` `CHECKSIG`/`CHECKSIGVERIFY` chain. The last key uses a plain `CHECKSIG` so
/// the script returns the verification result to the stack.
///
/// Panics if `pks` is empty.
pub fn multisig_script(pks: &[XOnlyPublicKey]) -> ScriptBuf {
    assert!(!pks.is_empty(), "multisig script needs at least one key");

    let mut builder = ScriptBuf::builder();
    let (last, rest) = pks.split_last().expect("non-empty");
    for pk in rest {
        builder = builder
            .push_x_only_key(pk)
            .push_opcode(OP_CHECKSIGVERIFY);
    }
    builder
        .push_x_only_key(last)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// A conventional 2-of-2 multisig script, the most common shape in the protocol (vtxo
/// forfeit leaves, VHTLC claim/refund leaves).
pub fn multisig_script_2(pk_0: XOnlyPublicKey, pk_1: XOnlyPublicKey) -> ScriptBuf {
    multisig_script(&[pk_0, pk_1])
}

/// `<sequence> OP_CSV OP_DROP <multisig>`.
///
/// `sequence` must already be relative-locktime-encoded (see [`encode_csv_delay`]).
pub fn csv_script(sequence: Sequence, pks: &[XOnlyPublicKey]) -> ScriptBuf {
    let prefix = ScriptBuf::builder()
        .push_int(sequence.to_consensus_u32() as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .into_script();
    concat_scripts(prefix, multisig_script(pks))
}

/// `<locktime> OP_CLTV OP_DROP <multisig>`.
pub fn cltv_script(locktime: absolute::LockTime, pks: &[XOnlyPublicKey]) -> ScriptBuf {
    let prefix = ScriptBuf::builder()
        .push_int(locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .into_script();
    concat_scripts(prefix, multisig_script(pks))
}

/// `OP_HASH160 <20-byte hash> OP_EQUALVERIFY <multisig>`.
pub fn htlc_gate_script(preimage_hash160: [u8; 20], pks: &[XOnlyPublicKey]) -> ScriptBuf {
    let prefix = ScriptBuf::builder()
        .push_opcode(OP_HASH160)
        .push_slice(preimage_hash160)
        .push_opcode(OP_EQUALVERIFY)
        .into_script();
    concat_scripts(prefix, multisig_script(pks))
}

/// `OP_SHA256 <32-byte hash> OP_EQUAL`: a bare hash-lock with no signature check, the
/// spending condition for an Arkade note (a bearer token redeemable by anyone who knows
/// the preimage).
pub fn hash_lock_script(preimage_hash: [u8; 32]) -> ScriptBuf {
    ScriptBuf::builder()
        .push_opcode(OP_SHA256)
        .push_slice(preimage_hash)
        .push_opcode(OP_EQUAL)
        .into_script()
}

fn concat_scripts(prefix: ScriptBuf, suffix: ScriptBuf) -> ScriptBuf {
    let mut bytes = prefix.into_bytes();
    bytes.extend(suffix.into_bytes());
    ScriptBuf::from_bytes(bytes)
}

/// A relative-locktime unit, per BIP-68.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayUnit {
    Blocks,
    Seconds,
}

/// Encode `(unit, value)` into a BIP-68 [`Sequence`].
///
/// `Blocks` emits the disable-flag-cleared 16-bit block count directly. `Seconds` emits
/// the type-flag-set, 512-second-granular form; `value` must already be a multiple of 512
/// (the caller rounds up beforehand, as the protocol's delays are always declared in
/// 512-second units).
pub fn encode_csv_delay(unit: DelayUnit, value: u32) -> Result<Sequence, InvalidDelayError> {
    match unit {
        DelayUnit::Blocks => {
            let height: u16 = value
                .try_into()
                .map_err(|_| InvalidDelayError(format!("block delay {value} does not fit u16")))?;
            Ok(Sequence::from_height(height))
        }
        DelayUnit::Seconds => Sequence::from_seconds_ceil(value)
            .map_err(|e| InvalidDelayError(format!("invalid seconds delay {value}: {e}"))),
    }
}

/// Encode an absolute CLTV value. Values `>= 500_000_000` are median-time-past, below are
/// block heights, per BIP-65.
pub fn encode_cltv_locktime(value: u32) -> Result<absolute::LockTime, InvalidDelayError> {
    if value >= absolute::LOCK_TIME_THRESHOLD {
        absolute::LockTime::from_time(value)
            .map(absolute::LockTime::from)
            .map_err(|e| InvalidDelayError(format!("invalid MTP locktime {value}: {e}")))
    } else {
        Ok(absolute::LockTime::from_height(value)
            .map_err(|e| InvalidDelayError(format!("invalid height locktime {value}: {e}")))?)
    }
}

/// Extracts every x-only public key immediately followed by `OP_CHECKSIG` or
/// `OP_CHECKSIGVERIFY`, in script order.
///
/// Used both to recover the cosigner set embedded in a multisig leaf and, for the
/// connectors tree (§4.3), to check that a leaf is single-signature.
pub fn extract_checksig_pubkeys(script: &ScriptBuf) -> Vec<XOnlyPublicKey> {
    let instructions: Vec<_> = script.instructions().filter_map(|inst| inst.ok()).collect();

    let mut pubkeys = Vec::new();
    for window in instructions.windows(2) {
        let (push, checksig) = (&window[0], &window[1]);

        if let Instruction::PushBytes(bytes) = push {
            if bytes.len() != 32 {
                continue;
            }

            let is_checksig = matches!(
                checksig,
                Instruction::Op(op) if *op == OP_CHECKSIG || *op == OP_CHECKSIGVERIFY
            );

            if is_checksig {
                if let Ok(pk) = XOnlyPublicKey::from_slice(bytes.as_bytes()) {
                    pubkeys.push(pk);
                }
            }
        }
    }

    pubkeys
}

/// Recover the [`Sequence`] encoded in a `csv_script`-shaped script.
pub fn extract_sequence_from_csv_sig_script(
    script: &ScriptBuf,
) -> Result<Sequence, InvalidCsvScriptError> {
    let bytes = script.to_bytes();

    let csv_index = bytes
        .windows(2)
        .position(|window| *window == [OP_CSV.to_u8(), OP_DROP.to_u8()])
        .ok_or(InvalidCsvScriptError)?;

    let before_csv = &bytes[..csv_index];

    // Either a single `OP_PUSHNUM_X` byte, or `OP_PUSHBYTES_X <bytes>`.
    let sequence_bytes = if before_csv.len() > 1 {
        &before_csv[1..]
    } else {
        before_csv
    };

    let mut sequence_bytes = sequence_bytes.to_vec();
    sequence_bytes.reverse();

    let mut buffer = [0u8; 4];
    let start = 4usize
        .checked_sub(sequence_bytes.len())
        .ok_or(InvalidCsvScriptError)?;
    buffer[start..].copy_from_slice(&sequence_bytes);

    Ok(Sequence::from_consensus(u32::from_be_bytes(buffer)))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid delay: {0}")]
pub struct InvalidDelayError(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCsvScriptError;

impl fmt::Display for InvalidCsvScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid CSV-gated script")
    }
}

impl std::error::Error for InvalidCsvScriptError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pk(seed: u8) -> XOnlyPublicKey {
        let hex = format!("{seed:02x}845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        XOnlyPublicKey::from_str(&hex).unwrap()
    }

    #[test]
    fn multisig_script_n_of_n_round_trips_pubkeys() {
        let pks = vec![pk(1), pk(2), pk(3)];
        let script = multisig_script(&pks);
        let extracted = extract_checksig_pubkeys(&script);
        assert_eq!(extracted, pks);
    }

    #[test]
    fn csv_seconds_round_trips_through_extraction() {
        let sequence = encode_csv_delay(DelayUnit::Seconds, 1024).unwrap();
        let script = csv_script(sequence, &[pk(1)]);
        let parsed = extract_sequence_from_csv_sig_script(&script).unwrap();
        assert_eq!(parsed, sequence);
    }

    #[test]
    fn csv_blocks_round_trips_through_extraction() {
        let sequence = encode_csv_delay(DelayUnit::Blocks, 144).unwrap();
        let script = csv_script(sequence, &[pk(1), pk(2)]);
        let parsed = extract_sequence_from_csv_sig_script(&script).unwrap();
        assert_eq!(parsed, sequence);
    }

    #[test]
    fn cltv_below_threshold_is_a_block_height() {
        let locktime = encode_cltv_locktime(700_000).unwrap();
        assert!(locktime.is_block_height());
    }

    #[test]
    fn cltv_at_or_above_threshold_is_median_time_past() {
        let locktime = encode_cltv_locktime(absolute::LOCK_TIME_THRESHOLD).unwrap();
        assert!(locktime.is_block_time());
    }

    #[test]
    fn htlc_gate_script_contains_hash_and_multisig_key() {
        let hash = [7u8; 20];
        let script = htlc_gate_script(hash, &[pk(1), pk(2)]);
        let bytes = script.to_bytes();
        assert!(bytes.windows(20).any(|w| w == hash));
        assert_eq!(extract_checksig_pubkeys(&script), vec![pk(1), pk(2)]);
    }

    #[test]
    fn extract_checksig_pubkeys_on_empty_script_is_empty() {
        assert!(extract_checksig_pubkeys(&ScriptBuf::new()).is_empty());
    }

    #[test]
    fn hash_lock_script_has_no_checksig() {
        let hash = [9u8; 32];
        let script = hash_lock_script(hash);
        let bytes = script.to_bytes();

        assert_eq!(bytes[0], OP_SHA256.to_u8());
        assert!(bytes.windows(32).any(|w| w == hash));
        assert!(extract_checksig_pubkeys(&script).is_empty());
    }
}
