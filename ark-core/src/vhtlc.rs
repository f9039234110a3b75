//! Virtual Hash Time Lock Contract (VHTLC): a vtxo whose spending policy encodes a
//! hash-preimage swap plus a refund branch plus unilateral exits (§3, §4.1).

use ark_script::opcodes::cltv_script;
use ark_script::opcodes::csv_script;
use ark_script::opcodes::htlc_gate_script;
use ark_script::opcodes::multisig_script;
use ark_script::taproot::tr_script_pubkey;
use ark_script::taproot::unspendable_internal_key;
use ark_script::taproot::TapLeafScript;
use ark_script::ArkAddress;
use bitcoin::absolute;
use bitcoin::hashes::hash160;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VhtlcError {
    #[error("invalid locktime: {0}")]
    InvalidLocktime(String),
    #[error("invalid delay: {0}")]
    InvalidDelay(String),
    #[error("taproot construction failed: {0}")]
    TaprootError(String),
}

/// Parameters needed to construct a VHTLC's six-leaf Taproot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhtlcOptions {
    pub sender: XOnlyPublicKey,
    pub receiver: XOnlyPublicKey,
    pub server: XOnlyPublicKey,
    pub preimage_hash: hash160::Hash,
    pub refund_locktime: absolute::LockTime,
    pub unilateral_claim_delay: Sequence,
    pub unilateral_refund_delay: Sequence,
    pub unilateral_refund_without_receiver_delay: Sequence,
}

impl VhtlcOptions {
    /// Enforces `unilateralClaimDelay < unilateralRefundDelay <
    /// unilateralRefundWithoutReceiverDelay`, along with any non-positive delay.
    pub fn validate(&self) -> Result<(), VhtlcError> {
        for (name, delay) in [
            ("unilateral claim delay", self.unilateral_claim_delay),
            ("unilateral refund delay", self.unilateral_refund_delay),
            (
                "unilateral refund without receiver delay",
                self.unilateral_refund_without_receiver_delay,
            ),
        ] {
            if !delay.is_relative_lock_time() || delay.to_consensus_u32() == 0 {
                return Err(VhtlcError::InvalidDelay(format!(
                    "{name} must be a valid non-zero CSV relative lock time"
                )));
            }
        }

        if self.unilateral_claim_delay.to_consensus_u32()
            >= self.unilateral_refund_delay.to_consensus_u32()
        {
            return Err(VhtlcError::InvalidDelay(
                "unilateral claim delay must be strictly less than unilateral refund delay"
                    .to_string(),
            ));
        }

        if self.unilateral_refund_delay.to_consensus_u32()
            >= self.unilateral_refund_without_receiver_delay.to_consensus_u32()
        {
            return Err(VhtlcError::InvalidDelay(
                "unilateral refund delay must be strictly less than unilateral refund without \
                 receiver delay"
                    .to_string(),
            ));
        }

        if self.refund_locktime.to_consensus_u32() == 0 {
            return Err(VhtlcError::InvalidLocktime(
                "refund locktime must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// `claim = HTLC-gate ∧ multisig(receiver, server)`.
    pub fn claim_script(&self) -> ScriptBuf {
        htlc_gate_script(*self.preimage_hash.as_byte_array(), &[self.receiver, self.server])
    }

    /// `refund = multisig(sender, receiver, server)`.
    pub fn refund_script(&self) -> ScriptBuf {
        multisig_script(&[self.sender, self.receiver, self.server])
    }

    /// `refundWithoutReceiver = CLTV(refundLocktime) ∧ multisig(sender, server)`.
    pub fn refund_without_receiver_script(&self) -> ScriptBuf {
        cltv_script(self.refund_locktime, &[self.sender, self.server])
    }

    /// `unilateralClaim = CSV(claimDelay) ∧ HTLC-gate ∧ multisig(receiver)`.
    pub fn unilateral_claim_script(&self) -> ScriptBuf {
        let gate = htlc_gate_script(*self.preimage_hash.as_byte_array(), &[self.receiver]);
        prefix_with_csv(self.unilateral_claim_delay, gate)
    }

    /// `unilateralRefund = CSV(refundDelay) ∧ multisig(sender, receiver)`.
    pub fn unilateral_refund_script(&self) -> ScriptBuf {
        csv_script(self.unilateral_refund_delay, &[self.sender, self.receiver])
    }

    /// `unilateralRefundWithoutReceiver = CSV(refundWithoutReceiverDelay) ∧ multisig(sender)`.
    pub fn unilateral_refund_without_receiver_script(&self) -> ScriptBuf {
        csv_script(
            self.unilateral_refund_without_receiver_delay,
            &[self.sender],
        )
    }

    fn leaves(&self) -> [ScriptBuf; 6] {
        [
            self.claim_script(),
            self.refund_script(),
            self.refund_without_receiver_script(),
            self.unilateral_claim_script(),
            self.unilateral_refund_script(),
            self.unilateral_refund_without_receiver_script(),
        ]
    }

    fn build_taproot(&self) -> Result<TaprootSpendInfo, VhtlcError> {
        // Every leaf is equally likely; a perfectly balanced tree minimises the worst-case
        // control block size across all six spend paths.
        let mut builder = TaprootBuilder::new();
        for script in self.leaves() {
            builder = builder
                .add_leaf(3, script)
                .map_err(|e| VhtlcError::TaprootError(format!("failed to add leaf: {e}")))?;
        }

        let secp = Secp256k1::new();
        builder
            .finalize(&secp, unspendable_internal_key())
            .map_err(|e| VhtlcError::TaprootError(format!("failed to finalize taproot: {e:?}")))
    }
}

/// `CSV(delay) OP_DROP <rest>`, prepended onto an already-built script.
fn prefix_with_csv(delay: Sequence, rest: ScriptBuf) -> ScriptBuf {
    use bitcoin::opcodes::all::OP_CSV;
    use bitcoin::opcodes::all::OP_DROP;

    let mut bytes = bitcoin::script::Builder::new()
        .push_int(delay.to_consensus_u32() as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .into_script()
        .into_bytes();
    bytes.extend(rest.into_bytes());
    ScriptBuf::from_bytes(bytes)
}

/// The VHTLC's six-leaf Taproot tree, with accessors for each named spend path.
pub struct VhtlcScript {
    options: VhtlcOptions,
    spend_info: TaprootSpendInfo,
    network: Network,
}

impl VhtlcScript {
    pub fn new(options: VhtlcOptions, network: Network) -> Result<Self, VhtlcError> {
        options.validate()?;
        let spend_info = options.build_taproot()?;

        Ok(Self {
            options,
            spend_info,
            network,
        })
    }

    pub fn taproot_spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        tr_script_pubkey(&self.spend_info)
    }

    pub fn address(&self) -> ArkAddress {
        ArkAddress::new(
            self.network,
            self.options.server,
            self.spend_info.output_key().to_inner(),
        )
    }

    fn leaf(&self, script: ScriptBuf) -> Result<TapLeafScript, VhtlcError> {
        TapLeafScript::from_spend_info(&self.spend_info, script)
            .ok_or_else(|| VhtlcError::TaprootError("leaf not found in tree".to_string()))
    }

    pub fn claim_leaf(&self) -> Result<TapLeafScript, VhtlcError> {
        self.leaf(self.options.claim_script())
    }

    pub fn refund_leaf(&self) -> Result<TapLeafScript, VhtlcError> {
        self.leaf(self.options.refund_script())
    }

    pub fn refund_without_receiver_leaf(&self) -> Result<TapLeafScript, VhtlcError> {
        self.leaf(self.options.refund_without_receiver_script())
    }

    pub fn unilateral_claim_leaf(&self) -> Result<TapLeafScript, VhtlcError> {
        self.leaf(self.options.unilateral_claim_script())
    }

    pub fn unilateral_refund_leaf(&self) -> Result<TapLeafScript, VhtlcError> {
        self.leaf(self.options.unilateral_refund_script())
    }

    pub fn unilateral_refund_without_receiver_leaf(&self) -> Result<TapLeafScript, VhtlcError> {
        self.leaf(self.options.unilateral_refund_without_receiver_script())
    }

    pub fn get_script_map(&self) -> BTreeMap<&'static str, ScriptBuf> {
        BTreeMap::from([
            ("claim", self.options.claim_script()),
            ("refund", self.options.refund_script()),
            (
                "refund_without_receiver",
                self.options.refund_without_receiver_script(),
            ),
            (
                "unilateral_claim",
                self.options.unilateral_claim_script(),
            ),
            (
                "unilateral_refund",
                self.options.unilateral_refund_script(),
            ),
            (
                "unilateral_refund_without_receiver",
                self.options.unilateral_refund_without_receiver_script(),
            ),
        ])
    }

    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        self.options.leaves().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::PublicKey;
    use std::str::FromStr;

    fn pubkey_to_xonly(pubkey_hex: &str) -> XOnlyPublicKey {
        let pubkey = PublicKey::from_str(pubkey_hex).expect("valid public key");
        XOnlyPublicKey::from(pubkey.inner)
    }

    fn sample_options() -> VhtlcOptions {
        VhtlcOptions {
            sender: pubkey_to_xonly(
                "030192e796452d6df9697c280542e1560557bcf79a347d925895043136225c7cb4",
            ),
            receiver: pubkey_to_xonly(
                "021e1bb85455fe3f5aed60d101aa4dbdb9e7714f6226769a97a17a5331dadcd53b",
            ),
            server: pubkey_to_xonly(
                "03aad52d58162e9eefeafc7ad8a1cdca8060b5f01df1e7583362d052e266208f88",
            ),
            preimage_hash: hash160::Hash::from_str("4d487dd3753a89bc9fe98401d1196523058251fc")
                .unwrap(),
            refund_locktime: absolute::LockTime::from_height(265).unwrap(),
            unilateral_claim_delay: Sequence::from_height(17),
            unilateral_refund_delay: Sequence::from_height(144),
            unilateral_refund_without_receiver_delay: Sequence::from_height(288),
        }
    }

    #[test]
    fn all_six_leaves_resolve_in_the_built_tree() {
        let vhtlc = VhtlcScript::new(sample_options(), Network::Testnet).unwrap();

        assert!(vhtlc.claim_leaf().is_ok());
        assert!(vhtlc.refund_leaf().is_ok());
        assert!(vhtlc.refund_without_receiver_leaf().is_ok());
        assert!(vhtlc.unilateral_claim_leaf().is_ok());
        assert!(vhtlc.unilateral_refund_leaf().is_ok());
        assert!(vhtlc.unilateral_refund_without_receiver_leaf().is_ok());
    }

    #[test]
    fn claim_script_embeds_preimage_hash_and_receiver_server_multisig() {
        let options = sample_options();
        let script = options.claim_script();
        let bytes = script.to_bytes();

        assert!(bytes
            .windows(20)
            .any(|w| w == options.preimage_hash.as_byte_array()));
        assert_eq!(
            ark_script::opcodes::extract_checksig_pubkeys(&script),
            vec![options.receiver, options.server]
        );
    }

    #[test]
    fn delay_ordering_violation_is_a_config_error() {
        let mut options = sample_options();
        options.unilateral_claim_delay = options.unilateral_refund_delay;

        assert!(matches!(
            options.validate(),
            Err(VhtlcError::InvalidDelay(_))
        ));
    }

    #[test]
    fn refund_delay_must_be_strictly_less_than_refund_without_receiver_delay() {
        let mut options = sample_options();
        options.unilateral_refund_without_receiver_delay = options.unilateral_refund_delay;

        assert!(matches!(
            options.validate(),
            Err(VhtlcError::InvalidDelay(_))
        ));
    }

    #[test]
    fn zero_refund_locktime_is_rejected() {
        let mut options = sample_options();
        options.refund_locktime = absolute::LockTime::ZERO;

        assert!(matches!(
            options.validate(),
            Err(VhtlcError::InvalidLocktime(_))
        ));
    }

    #[test]
    fn address_round_trips_through_the_ark_script_codec() {
        let vhtlc = VhtlcScript::new(sample_options(), Network::Testnet).unwrap();
        let address = vhtlc.address();
        let encoded = address.encode().unwrap();

        assert_eq!(ArkAddress::decode(&encoded).unwrap(), address);
    }
}
