//! The VTXO and connector trees that fan out of a settlement (commitment) transaction's
//! shared output (§4.3), and the internal-node sweep script every non-leaf output carries
//! (§4.4's key-aggregation tweak target).

use crate::conversions::from_musig_xonly;
use crate::conversions::to_musig_pk;
use crate::musig::extract_cosigner_pks_from_vtxo_psbt;
use crate::server::TxTree;
use crate::server::TxTreeNode;
use crate::Error;
use ark_script::opcodes::csv_script;
use ark_script::opcodes::extract_checksig_pubkeys;
use ark_script::taproot::tr_script_pubkey;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Amount;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Txid;
use bitcoin::XOnlyPublicKey;
use musig::musig;
use std::collections::HashMap;

/// The byte value corresponds to the string "cosigner".
pub const VTXO_COSIGNER_PSBT_KEY: [u8; 8] = [99, 111, 115, 105, 103, 110, 101, 114];

/// The server-spendable fallback path every internal tree node carries: after
/// `vtxoTreeExpiry` has elapsed, the server may sweep the node unilaterally rather than
/// have it rot on-chain forever.
#[derive(Debug, Clone, Copy)]
pub struct TreeTxOutputScript {
    vtxo_tree_expiry: Sequence,
    server_pk: XOnlyPublicKey,
}

impl TreeTxOutputScript {
    pub fn new(vtxo_tree_expiry: Sequence, server_pk: XOnlyPublicKey) -> Self {
        Self {
            vtxo_tree_expiry,
            server_pk,
        }
    }

    /// `CSV(vtxoTreeExpiry) ∧ server_pk`, the single leaf of every internal node's Taproot
    /// tree.
    pub fn sweep_script(&self) -> ScriptBuf {
        csv_script(self.vtxo_tree_expiry, &[self.server_pk])
    }

    /// Build the node's Taproot tree: `internal_key` is the (tweaked) aggregated cosigner
    /// key, spendable directly via MuSig2 key-path signing; the sweep leaf is the only
    /// script path.
    pub fn sweep_spend_leaf<C>(
        &self,
        secp: &Secp256k1<C>,
        internal_key: XOnlyPublicKey,
    ) -> Result<TaprootSpendInfo, Error>
    where
        C: Verification,
    {
        TaprootBuilder::new()
            .add_leaf(0, self.sweep_script())
            .map_err(Error::ad_hoc)?
            .finalize(secp, internal_key)
            .map_err(|_| Error::ad_hoc("failed to finalize internal tree node Taproot tree"))
    }

    pub fn script_pubkey<C>(
        &self,
        secp: &Secp256k1<C>,
        internal_key: XOnlyPublicKey,
    ) -> Result<ScriptBuf, Error>
    where
        C: Verification,
    {
        Ok(tr_script_pubkey(&self.sweep_spend_leaf(secp, internal_key)?))
    }
}

/// The public nonces contributed by every cosigner of one tree transaction, keyed by
/// cosigner public key; [`crate::musig::aggregate_nonces`] consumes the values.
#[derive(Debug, Clone, Default)]
pub struct TreeTxNoncePks(HashMap<bitcoin::secp256k1::PublicKey, musig::PublicNonce>);

impl TreeTxNoncePks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cosigner_pk: bitcoin::secp256k1::PublicKey, nonce: musig::PublicNonce) {
        self.0.insert(cosigner_pk, nonce);
    }

    pub fn to_pks(&self) -> Vec<musig::PublicNonce> {
        self.0.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a leaf of the vtxo tree is allowed to pay to: one of the vtxo script pubkeys
/// registered for this round.
pub fn validate_vtxo_tree(
    tree: &TxTree,
    shared_output: &bitcoin::TxOut,
    server_pk: XOnlyPublicKey,
    vtxo_tree_expiry: Sequence,
    registered_leaf_scripts: &[ScriptBuf],
) -> Result<(), Error> {
    validate_tree(
        tree,
        shared_output,
        server_pk,
        vtxo_tree_expiry,
        registered_leaf_scripts,
        false,
    )
}

/// Connector leaves are treated as an opaque single-checksig-pubkey-equals-server-pk
/// script rather than being checked against a registered-outputs set (§9, Open Question:
/// connector leaf script policy). The connectors tree hangs off the settlement
/// transaction's second output (vout 1), not the vtxo tree's vout 0.
pub fn validate_connectors_tree(
    tree: &TxTree,
    shared_output: &bitcoin::TxOut,
    server_pk: XOnlyPublicKey,
    vtxo_tree_expiry: Sequence,
) -> Result<(), Error> {
    validate_tree(tree, shared_output, server_pk, vtxo_tree_expiry, &[], true)
}

fn validate_tree(
    tree: &TxTree,
    shared_output: &bitcoin::TxOut,
    server_pk: XOnlyPublicKey,
    vtxo_tree_expiry: Sequence,
    registered_leaf_scripts: &[ScriptBuf],
    is_connectors_tree: bool,
) -> Result<(), Error> {
    let secp = Secp256k1::new();
    let secp_musig = musig::Secp256k1::new();
    let internal_node_script = TreeTxOutputScript::new(vtxo_tree_expiry, server_pk);
    let expected_root_vout = if is_connectors_tree { 1 } else { 0 };

    let by_txid: HashMap<Txid, &TxTreeNode> =
        tree.nodes.values().map(|node| (node.txid, node)).collect();

    for (level, nodes) in tree.iter_levels() {
        for node in nodes {
            let index = node.level_index as usize;
            let tx = &node.tx.unsigned_tx;

            let previous_output = tx.input.first().ok_or_else(|| {
                Error::invalid_tree_structure(level, index, "node has no input")
            })?;

            // The amount and script a node's single input spends: the settlement
            // transaction's shared output for the root, or an ancestor node's own output
            // for everyone else. Resolving this per node (rather than always comparing
            // against the root's shared output) is what lets rules 2 and 3 hold at every
            // depth, not just the first level.
            let input_amount = if level == 0 {
                if previous_output.previous_output.vout != expected_root_vout {
                    return Err(Error::invalid_tree_structure(
                        level,
                        index,
                        format!(
                            "root node does not spend the settlement transaction's shared \
                             output (vout {expected_root_vout})"
                        ),
                    ));
                }

                shared_output.value
            } else {
                let parent = by_txid.get(&node.parent_txid).ok_or_else(|| {
                    Error::invalid_tree_structure(level, index, "parent node not found in tree")
                })?;

                let vout = previous_output.previous_output.vout as usize;
                let parent_output = parent.tx.unsigned_tx.output.get(vout).ok_or_else(|| {
                    Error::invalid_tree_structure(
                        level,
                        index,
                        "input spends a non-existent parent output",
                    )
                })?;

                let internal_key = if is_connectors_tree {
                    server_pk
                } else {
                    let mut cosigner_pks = extract_cosigner_pks_from_vtxo_psbt(&node.tx)?;
                    cosigner_pks.sort_by_key(|pk| pk.serialize());

                    if cosigner_pks.is_empty() {
                        return Err(Error::invalid_tree_structure(
                            level,
                            index,
                            "node carries no cosigner PKs to verify its parent's output script",
                        ));
                    }

                    let cosigner_pks = cosigner_pks
                        .iter()
                        .map(|pk| to_musig_pk(*pk))
                        .collect::<Vec<_>>();
                    let key_agg_cache = musig::KeyAggCache::new(
                        &secp_musig,
                        &cosigner_pks.iter().collect::<Vec<_>>(),
                    );

                    from_musig_xonly(key_agg_cache.agg_pk())
                };

                let expected_script = internal_node_script.script_pubkey(&secp, internal_key)?;
                if parent_output.script_pubkey != expected_script {
                    return Err(Error::invalid_tree_structure(
                        parent.level as usize,
                        parent.level_index as usize,
                        "internal output script is not the tweaked sweep Taproot output",
                    ));
                }

                parent_output.value
            };

            let children_total: Amount = tx
                .output
                .iter()
                .filter(|out| out.value != Amount::ZERO) // the zero-value P2A anchor is fee-exempt
                .map(|out| out.value)
                .sum();

            if !node.leaf && children_total != input_amount {
                return Err(Error::invalid_tree_structure(
                    level,
                    index,
                    "children outputs do not exactly conserve this node's input amount",
                ));
            }

            if node.leaf && !is_connectors_tree && !registered_leaf_scripts.is_empty() {
                let all_registered = tx
                    .output
                    .iter()
                    .filter(|out| out.value != Amount::ZERO)
                    .all(|out| registered_leaf_scripts.contains(&out.script_pubkey));
                if !all_registered {
                    return Err(Error::invalid_tree_structure(
                        level,
                        index,
                        "leaf script is not among the outputs registered for this round",
                    ));
                }
            }

            if node.leaf && is_connectors_tree {
                for output in &tx.output {
                    if output.value == Amount::ZERO {
                        continue;
                    }
                    let pks = extract_checksig_pubkeys(&output.script_pubkey);
                    if pks != vec![server_pk] {
                        return Err(Error::invalid_tree_structure(
                            level,
                            index,
                            "connector leaf script is not a single-signature server checksig",
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::TxTreeNode;
    use bitcoin::absolute::LockTime;
    use bitcoin::key::Keypair;
    use bitcoin::transaction::Version;
    use bitcoin::Psbt;
    use bitcoin::hashes::Hash;
    use bitcoin::Transaction;
    use bitcoin::TxOut;
    use std::str::FromStr;

    fn pk(seed: u8) -> XOnlyPublicKey {
        let hex = format!("{seed:02x}845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        XOnlyPublicKey::from_str(&hex).unwrap()
    }

    fn empty_psbt() -> Psbt {
        Psbt::from_unsigned_tx(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        })
        .unwrap()
    }

    #[test]
    fn sweep_leaf_resolves_for_an_aggregated_internal_key() {
        let secp = Secp256k1::new();
        let script = TreeTxOutputScript::new(Sequence::from_height(144), pk(1));
        let spend_info = script.sweep_spend_leaf(&secp, pk(2)).unwrap();

        assert!(spend_info
            .control_block(&(script.sweep_script(), bitcoin::taproot::LeafVersion::TapScript))
            .is_some());
    }

    #[test]
    fn nonce_pks_start_empty_and_track_insert_count() {
        let nonces = TreeTxNoncePks::new();
        assert!(nonces.is_empty());
        assert_eq!(nonces.len(), 0);
        assert!(nonces.to_pks().is_empty());
    }

    #[test]
    fn root_node_must_spend_vout_zero_of_the_shared_output() {
        let mut tree = TxTree::new();
        tree.insert(
            TxTreeNode {
                txid: empty_psbt().unsigned_tx.compute_txid(),
                tx: empty_psbt(),
                parent_txid: bitcoin::Txid::all_zeros(),
                level: 0,
                level_index: 0,
                leaf: true,
            },
            0,
            0,
        );

        let shared_output = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new(),
        };

        let err = validate_vtxo_tree(
            &tree,
            &shared_output,
            pk(1),
            Sequence::from_height(144),
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("level 0, index 0"));
    }

    fn cosigner_annotation(cosigner_pk: bitcoin::secp256k1::PublicKey) -> (bitcoin::psbt::raw::Key, Vec<u8>) {
        (
            bitcoin::psbt::raw::Key {
                type_value: 222,
                key: VTXO_COSIGNER_PSBT_KEY.to_vec(),
            },
            cosigner_pk.serialize().to_vec(),
        )
    }

    fn psbt_spending(
        previous_output: bitcoin::OutPoint,
        outputs: Vec<TxOut>,
        cosigner_pk: Option<bitcoin::secp256k1::PublicKey>,
    ) -> Psbt {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        if let Some(cosigner_pk) = cosigner_pk {
            let (key, value) = cosigner_annotation(cosigner_pk);
            psbt.inputs[0].unknown.insert(key, value);
        }
        psbt
    }

    fn aggregated_internal_key(cosigner_pk: bitcoin::secp256k1::PublicKey) -> XOnlyPublicKey {
        let secp_musig = musig::Secp256k1::new();
        let musig_pk = to_musig_pk(cosigner_pk);
        let key_agg_cache = musig::KeyAggCache::new(&secp_musig, &[&musig_pk]);
        from_musig_xonly(key_agg_cache.agg_pk())
    }

    #[test]
    fn connectors_tree_root_must_spend_vout_one_of_the_settlement_transaction() {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut bitcoin::secp256k1::rand::thread_rng());
        let server_pk = keypair.x_only_public_key().0;

        let root_tx = psbt_spending(
            bitcoin::OutPoint {
                txid: bitcoin::Txid::all_zeros(),
                vout: 0, // wrong: connectors hang off vout 1
            },
            vec![],
            None,
        );

        let mut tree = TxTree::new();
        tree.insert(
            TxTreeNode {
                txid: root_tx.unsigned_tx.compute_txid(),
                tx: root_tx,
                parent_txid: bitcoin::Txid::all_zeros(),
                level: 0,
                level_index: 0,
                leaf: true,
            },
            0,
            0,
        );

        let shared_output = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new(),
        };

        let err = validate_connectors_tree(
            &tree,
            &shared_output,
            server_pk,
            Sequence::from_height(144),
        )
        .unwrap_err();
        assert!(err.to_string().contains("vout 1"));
    }

    #[test]
    fn internal_node_amount_conservation_is_an_exact_equality() {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut bitcoin::secp256k1::rand::thread_rng());
        let cosigner_pk = keypair.public_key();
        let server_pk = keypair.x_only_public_key().0;
        let vtxo_tree_expiry = Sequence::from_height(144);

        let internal_key = aggregated_internal_key(cosigner_pk);
        let internal_script = TreeTxOutputScript::new(vtxo_tree_expiry, server_pk)
            .script_pubkey(&secp, internal_key)
            .unwrap();

        let root_tx = psbt_spending(
            bitcoin::OutPoint {
                txid: bitcoin::Txid::all_zeros(),
                vout: 0,
            },
            vec![TxOut {
                value: Amount::from_sat(900), // short-pays the declared 1_000 sat input
                script_pubkey: internal_script,
            }],
            None,
        );
        let root_txid = root_tx.unsigned_tx.compute_txid();

        let leaf_tx = psbt_spending(
            bitcoin::OutPoint {
                txid: root_txid,
                vout: 0,
            },
            vec![TxOut {
                value: Amount::from_sat(900),
                script_pubkey: ScriptBuf::new(),
            }],
            Some(cosigner_pk),
        );

        let mut tree = TxTree::new();
        tree.insert(
            TxTreeNode {
                txid: root_txid,
                tx: root_tx,
                parent_txid: bitcoin::Txid::all_zeros(),
                level: 0,
                level_index: 0,
                leaf: false,
            },
            0,
            0,
        );
        tree.insert(
            TxTreeNode {
                txid: leaf_tx.unsigned_tx.compute_txid(),
                tx: leaf_tx,
                parent_txid: root_txid,
                level: 1,
                level_index: 0,
                leaf: true,
            },
            1,
            0,
        );

        let shared_output = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new(),
        };

        let err = validate_vtxo_tree(&tree, &shared_output, server_pk, vtxo_tree_expiry, &[])
            .unwrap_err();
        assert!(err.to_string().contains("conserve"));
    }

    #[test]
    fn internal_output_script_must_match_the_tweaked_sweep_taproot_output() {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut bitcoin::secp256k1::rand::thread_rng());
        let cosigner_pk = keypair.public_key();
        let server_pk = keypair.x_only_public_key().0;
        let vtxo_tree_expiry = Sequence::from_height(144);

        let root_tx = psbt_spending(
            bitcoin::OutPoint {
                txid: bitcoin::Txid::all_zeros(),
                vout: 0,
            },
            vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(), // not the tweaked sweep output
            }],
            None,
        );
        let root_txid = root_tx.unsigned_tx.compute_txid();

        let leaf_tx = psbt_spending(
            bitcoin::OutPoint {
                txid: root_txid,
                vout: 0,
            },
            vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
            Some(cosigner_pk),
        );

        let mut tree = TxTree::new();
        tree.insert(
            TxTreeNode {
                txid: root_txid,
                tx: root_tx,
                parent_txid: bitcoin::Txid::all_zeros(),
                level: 0,
                level_index: 0,
                leaf: false,
            },
            0,
            0,
        );
        tree.insert(
            TxTreeNode {
                txid: leaf_tx.unsigned_tx.compute_txid(),
                tx: leaf_tx,
                parent_txid: root_txid,
                level: 1,
                level_index: 0,
                leaf: true,
            },
            1,
            0,
        );

        let shared_output = TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new(),
        };

        let err = validate_vtxo_tree(&tree, &shared_output, server_pk, vtxo_tree_expiry, &[])
            .unwrap_err();
        assert!(err.to_string().contains("tweaked sweep"));
    }
}
