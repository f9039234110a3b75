//! The default vtxo and boarding-UTXO composite Taproot trees (§4.1).

use crate::anchor_output;
use crate::Error;
use crate::ErrorContext;
use ark_script::opcodes::cltv_script;
use ark_script::opcodes::csv_script;
use ark_script::opcodes::multisig_script;
use ark_script::taproot::tr_script_pubkey;
use ark_script::taproot::unspendable_internal_key;
use ark_script::taproot::TapLeafScript;
use ark_script::ArkAddress;
use bitcoin::absolute;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::relative;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;
use std::time::Duration;

pub use anchor_output as anchor_tx_out;

/// A vtxo: an off-chain coin redeemable against the Ark server's shared output.
///
/// The Taproot tree always carries at least a forfeit leaf (server + owner multisig) and
/// an exit leaf (owner, after a relative timelock); [`Vtxo::new_with_custom_scripts`]
/// allows additional leaves for richer policies (the VHTLC module builds its own
/// six-leaf tree instead of using this type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vtxo {
    server_pk: XOnlyPublicKey,
    owner_pk: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    tapscripts: Vec<ScriptBuf>,
    script_pubkey: ScriptBuf,
    exit_delay: Sequence,
    exit_delay_seconds: u64,
    network: Network,
}

impl Vtxo {
    /// Two Schnorr signatures, the cost of the forfeit witness.
    pub const FORFEIT_WITNESS_SIZE: usize = 64 * 2;

    /// Build a vtxo from an arbitrary set of leaf scripts.
    ///
    /// - All unilateral spend paths MUST be timelocked.
    /// - All other spend paths MUST involve the Ark server's signature.
    pub fn new_with_custom_scripts<C>(
        secp: &Secp256k1<C>,
        server_pk: XOnlyPublicKey,
        owner_pk: XOnlyPublicKey,
        scripts: Vec<ScriptBuf>,
        exit_delay: Sequence,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        if scripts.is_empty() {
            return Err(Error::config("a vtxo needs at least one leaf script"));
        }

        let depths = balanced_leaf_depths(scripts.len());

        let mut builder = TaprootBuilder::new();
        for (script, depth) in scripts.iter().zip(depths.iter()) {
            builder = builder
                .add_leaf(*depth as u8, script.clone())
                .map_err(Error::ad_hoc)?;
        }

        let spend_info = builder
            .finalize(secp, unspendable_internal_key())
            .map_err(|_| Error::ad_hoc("failed to finalize vtxo Taproot tree"))?;

        let exit_delay_seconds = match exit_delay.to_relative_lock_time() {
            Some(relative::LockTime::Time(time)) => time.value() as u64 * 512,
            _ => {
                return Err(Error::config(
                    "vtxo exit delay must be a seconds-denominated relative locktime",
                ))
            }
        };

        let script_pubkey = tr_script_pubkey(&spend_info);

        Ok(Self {
            server_pk,
            owner_pk,
            spend_info,
            tapscripts: scripts,
            script_pubkey,
            exit_delay,
            exit_delay_seconds,
            network,
        })
    }

    /// A vtxo with the two canonical leaves: `forfeit = multisig(owner, server)`,
    /// `exit = CSV(unilateralExitDelay, owner)`.
    pub fn new_default<C>(
        secp: &Secp256k1<C>,
        server_pk: XOnlyPublicKey,
        owner_pk: XOnlyPublicKey,
        exit_delay: Sequence,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        let forfeit_script = multisig_script(&[owner_pk, server_pk]);
        let exit_script = csv_script(exit_delay, &[owner_pk]);

        Self::new_with_custom_scripts(
            secp,
            server_pk,
            owner_pk,
            vec![forfeit_script, exit_script],
            exit_delay,
            network,
        )
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.script_pubkey.clone()
    }

    pub fn owner_pk(&self) -> XOnlyPublicKey {
        self.owner_pk
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server_pk
    }

    pub fn exit_delay(&self) -> Sequence {
        self.exit_delay
    }

    pub fn exit_delay_duration(&self) -> Duration {
        Duration::from_secs(self.exit_delay_seconds)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        self.tapscripts.clone()
    }

    pub fn to_ark_address(&self) -> ArkAddress {
        ArkAddress::new(
            self.network,
            self.server_pk,
            self.spend_info.output_key().to_inner(),
        )
    }

    /// The `(script, control block)` pair for an arbitrary leaf of this tree.
    pub fn leaf(&self, script: ScriptBuf) -> Result<TapLeafScript, Error> {
        TapLeafScript::from_spend_info(&self.spend_info, script)
            .ok_or_else(|| Error::ad_hoc("script is not a leaf of this vtxo's tree"))
    }

    pub fn forfeit_leaf(&self) -> Result<TapLeafScript, Error> {
        let script = multisig_script(&[self.owner_pk, self.server_pk]);
        self.leaf(script).context("missing default forfeit leaf")
    }

    pub fn exit_leaf(&self) -> Result<TapLeafScript, Error> {
        let script = csv_script(self.exit_delay, &[self.owner_pk]);
        self.leaf(script).context("missing default exit leaf")
    }

    /// Whether the owner's unilateral exit path is already spendable, given when the vtxo
    /// was confirmed.
    pub fn can_be_claimed_unilaterally_by_owner(
        &self,
        now: Duration,
        confirmation_blocktime: Duration,
    ) -> bool {
        now > confirmation_blocktime + self.exit_delay_duration()
    }
}

/// An on-chain UTXO with an Ark-compatible script, awaiting conversion into a vtxo at the
/// next settlement round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardingOutput {
    server_pk: XOnlyPublicKey,
    owner_pk: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    script_pubkey: ScriptBuf,
    exit_locktime: absolute::LockTime,
    network: Network,
}

impl BoardingOutput {
    /// `forfeit = multisig(owner, server)`, `exit = CLTV(boardingExitDelay + funding
    /// height, owner)`.
    pub fn new<C>(
        secp: &Secp256k1<C>,
        server_pk: XOnlyPublicKey,
        owner_pk: XOnlyPublicKey,
        exit_locktime: absolute::LockTime,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        let forfeit_script = multisig_script(&[owner_pk, server_pk]);
        let exit_script = cltv_script(exit_locktime, &[owner_pk]);

        let spend_info = TaprootBuilder::new()
            .add_leaf(1, forfeit_script)
            .map_err(Error::ad_hoc)?
            .add_leaf(1, exit_script)
            .map_err(Error::ad_hoc)?
            .finalize(secp, unspendable_internal_key())
            .map_err(|_| Error::ad_hoc("failed to finalize boarding output Taproot tree"))?;

        let script_pubkey = tr_script_pubkey(&spend_info);

        Ok(Self {
            server_pk,
            owner_pk,
            spend_info,
            script_pubkey,
            exit_locktime,
            network,
        })
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.script_pubkey.clone()
    }

    pub fn owner_pk(&self) -> XOnlyPublicKey {
        self.owner_pk
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn exit_locktime(&self) -> absolute::LockTime {
        self.exit_locktime
    }

    pub fn forfeit_leaf(&self) -> Result<TapLeafScript, Error> {
        let script = multisig_script(&[self.owner_pk, self.server_pk]);
        TapLeafScript::from_spend_info(&self.spend_info, script)
            .ok_or_else(|| Error::ad_hoc("missing boarding forfeit leaf"))
    }

    pub fn exit_leaf(&self) -> Result<TapLeafScript, Error> {
        let script = cltv_script(self.exit_locktime, &[self.owner_pk]);
        TapLeafScript::from_spend_info(&self.spend_info, script)
            .ok_or_else(|| Error::ad_hoc("missing boarding exit leaf"))
    }
}

/// Distribute `n` leaves across as balanced a binary tree as possible, the same shape
/// Taproot tree construction uses throughout this crate.
pub(crate) fn balanced_leaf_depths(n: usize) -> Vec<usize> {
    if n == 0 {
        return vec![];
    }
    if n == 1 {
        return vec![0];
    }
    if n == 2 {
        return vec![1, 1];
    }

    let min_depth = (n as f64).log2().ceil() as usize;
    let nodes_at_max_depth = n - (1 << (min_depth - 1)) + 1;
    let nodes_at_min_depth = (1 << min_depth) - nodes_at_max_depth;

    let mut result = Vec::with_capacity(n);
    result.extend(std::iter::repeat(min_depth).take(nodes_at_max_depth));
    result.extend(std::iter::repeat(min_depth - 1).take(nodes_at_min_depth));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;
    use std::str::FromStr;

    fn pk(seed: u8) -> XOnlyPublicKey {
        let hex = format!("{seed:02x}845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        XOnlyPublicKey::from_str(&hex).unwrap()
    }

    #[test]
    fn default_vtxo_exposes_both_canonical_leaves() {
        let secp = Secp256k1::new();
        let exit_delay = Sequence::from_seconds_ceil(1024).unwrap();

        let vtxo = Vtxo::new_default(&secp, pk(1), pk(2), exit_delay, Network::Regtest).unwrap();

        assert!(vtxo.forfeit_leaf().is_ok());
        assert!(vtxo.exit_leaf().is_ok());
        assert_eq!(vtxo.exit_delay_duration(), Duration::from_secs(1024));
    }

    #[test]
    fn unilateral_claim_only_after_exit_delay_elapses() {
        let secp = Secp256k1::new();
        let exit_delay = Sequence::from_seconds_ceil(1024).unwrap();
        let vtxo = Vtxo::new_default(&secp, pk(1), pk(2), exit_delay, Network::Regtest).unwrap();

        let confirmed = Duration::from_secs(1_000_000);
        assert!(!vtxo
            .can_be_claimed_unilaterally_by_owner(confirmed + Duration::from_secs(1), confirmed));
        assert!(vtxo.can_be_claimed_unilaterally_by_owner(
            confirmed + vtxo.exit_delay_duration() + Duration::from_secs(1),
            confirmed
        ));
    }

    #[test]
    fn boarding_output_exposes_forfeit_and_cltv_exit() {
        let secp = Secp256k1::new();
        let locktime = absolute::LockTime::from_height(800_000).unwrap();
        let boarding = BoardingOutput::new(&secp, pk(1), pk(2), locktime, Network::Regtest).unwrap();

        assert!(boarding.forfeit_leaf().is_ok());
        assert!(boarding.exit_leaf().is_ok());
    }

    #[test]
    fn balanced_depths_match_known_shapes() {
        assert_eq!(balanced_leaf_depths(1), vec![0]);
        assert_eq!(balanced_leaf_depths(2), vec![1, 1]);
        assert_eq!(balanced_leaf_depths(3), vec![2, 2, 1]);
    }
}
