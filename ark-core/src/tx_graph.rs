//! A flat store of the PSBTs making up one settlement round's vtxo or connectors tree,
//! indexed by txid for the sighash and signing lookups in [`crate::musig`].

use bitcoin::Psbt;
use bitcoin::Txid;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct TxGraph {
    nodes: HashMap<Txid, Psbt>,
    leaves: Vec<Txid>,
}

impl TxGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, psbt: Psbt) {
        let txid = psbt.unsigned_tx.compute_txid();
        self.nodes.insert(txid, psbt);
    }

    /// Rebuild a tree from the flat chunk stream the event feed delivers (§6): each chunk
    /// already knows its own children, so leaf-ness is read off directly rather than
    /// recomputed.
    pub fn from_chunks(chunks: Vec<TxGraphChunk>) -> Self {
        let mut graph = Self::default();
        for chunk in &chunks {
            if chunk.children.is_empty() {
                graph.leaves.push(chunk.txid);
            }
        }
        for chunk in chunks {
            graph.nodes.insert(chunk.txid, chunk.tx);
        }
        graph
    }

    pub fn get(&self, txid: &Txid) -> Option<&Psbt> {
        self.nodes.get(txid)
    }

    pub fn as_map(&self) -> HashMap<Txid, &Psbt> {
        self.nodes.iter().map(|(txid, psbt)| (*txid, psbt)).collect()
    }

    /// The tree's leaves: for the connectors tree, these are the actual connector-paying
    /// transactions the forfeit builder pairs against vtxo inputs.
    pub fn leaves(&self) -> Vec<&Psbt> {
        self.leaves
            .iter()
            .filter_map(|txid| self.nodes.get(txid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One node of the tree as transmitted over the event stream (§6): the transaction
/// itself plus enough topology to place it.
#[derive(Debug, Clone)]
pub struct TxGraphChunk {
    pub txid: Txid,
    pub tx: Psbt,
    pub children: Vec<Txid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::Transaction;

    fn psbt() -> Psbt {
        Psbt::from_unsigned_tx(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        })
        .unwrap()
    }

    #[test]
    fn insert_is_keyed_by_computed_txid() {
        let mut graph = TxGraph::new();
        let psbt = psbt();
        let txid = psbt.unsigned_tx.compute_txid();
        graph.insert(psbt);

        assert_eq!(graph.len(), 1);
        assert!(graph.get(&txid).is_some());
    }
}
