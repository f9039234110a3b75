//! Unspendable internal key, script-pubkey derivation, and the `TapLeafScript` handle
//! every composite tree in `ark-core` uses to describe one spend path.

use bitcoin::key::PublicKey;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::script::Builder;
use bitcoin::taproot::ControlBlock;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootMerkleBranch;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;

/// A NUMS point with no known discrete log, used as the Taproot internal key of every
/// composite tree in the protocol. No key-path spend is ever possible; every output is
/// spendable only through one of its script-path leaves.
pub const UNSPENDABLE_KEY: &str =
    "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";

/// Parse [`UNSPENDABLE_KEY`] into an x-only key.
///
/// Panics if the hardcoded constant is malformed, which would be a programming error.
pub fn unspendable_internal_key() -> XOnlyPublicKey {
    let pk: PublicKey = UNSPENDABLE_KEY.parse().expect("UNSPENDABLE_KEY is valid");
    pk.inner.x_only_public_key().0
}

/// `OP_1 <32-byte output key>`, the script pubkey of a Taproot output.
pub fn tr_script_pubkey(spend_info: &TaprootSpendInfo) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_PUSHNUM_1)
        .push_slice(spend_info.output_key().serialize())
        .into_script()
}

/// One spend path of a composite Taproot tree: the leaf script together with the control
/// block that proves its membership in the committed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapLeafScript {
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
}

impl TapLeafScript {
    /// Look up the control block for `script` inside `spend_info`. Returns `None` if the
    /// script is not one of the tree's leaves.
    pub fn from_spend_info(spend_info: &TaprootSpendInfo, script: ScriptBuf) -> Option<Self> {
        let control_block = spend_info.control_block(&(script.clone(), LeafVersion::TapScript))?;
        Some(Self {
            script,
            control_block,
        })
    }

    pub fn leaf_version(&self) -> LeafVersion {
        self.control_block.leaf_version
    }

    /// The merkle path from this leaf up to the tree's root, as carried in the control
    /// block.
    pub fn merkle_path(&self) -> &TaprootMerkleBranch {
        &self.control_block.merkle_branch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::taproot::TaprootBuilder;
    use std::str::FromStr;

    fn pk(seed: u8) -> XOnlyPublicKey {
        let hex = format!("{seed:02x}845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        XOnlyPublicKey::from_str(&hex).unwrap()
    }

    #[test]
    fn unspendable_key_parses() {
        let _ = unspendable_internal_key();
    }

    #[test]
    fn control_block_round_trips_for_known_leaf() {
        let secp = Secp256k1::new();
        let script_a = crate::opcodes::multisig_script(&[pk(1)]);
        let script_b = crate::opcodes::multisig_script(&[pk(2)]);

        let spend_info = TaprootBuilder::new()
            .add_leaf(1, script_a.clone())
            .unwrap()
            .add_leaf(1, script_b.clone())
            .unwrap()
            .finalize(&secp, unspendable_internal_key())
            .unwrap();

        let leaf = TapLeafScript::from_spend_info(&spend_info, script_a).unwrap();
        assert!(spend_info.output_key().to_inner().serialize().len() == 32);
        assert_eq!(leaf.leaf_version(), LeafVersion::TapScript);
    }

    #[test]
    fn unknown_script_has_no_control_block() {
        let secp = Secp256k1::new();
        let script_a = crate::opcodes::multisig_script(&[pk(1)]);
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, script_a)
            .unwrap()
            .finalize(&secp, unspendable_internal_key())
            .unwrap();

        let other = crate::opcodes::multisig_script(&[pk(9)]);
        assert!(TapLeafScript::from_spend_info(&spend_info, other).is_none());
    }
}
