use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::TxOut;

pub mod arknote;
pub mod forfeit;
pub mod input;
pub mod intent;
pub mod musig;
pub mod server;
pub mod tree;
pub mod vhtlc;
pub mod vtxo;

pub(crate) mod conversions;
mod error;
mod tx_graph;
mod utils;

pub use arknote::ArkNote;
pub use error::Error;
pub use error::ErrorContext;
pub use tx_graph::TxGraph;
pub use tx_graph::TxGraphChunk;
pub use vtxo::BoardingOutput;
pub use vtxo::Vtxo;

pub use ark_script::opcodes::extract_sequence_from_csv_sig_script;
pub use ark_script::taproot::UNSPENDABLE_KEY;
pub use ark_script::ArkAddress;

/// The shared output of a settlement (commitment) transaction is always its first
/// output; every vtxo and connector tree hangs off vout 0.
pub const VTXO_INPUT_INDEX: usize = 0;

const ANCHOR_SCRIPT_PUBKEY: [u8; 4] = [0x51, 0x02, 0x4e, 0x73];

/// Information about a UTXO as reported by an on-chain explorer.
#[derive(Clone, Copy, Debug)]
pub struct ExplorerUtxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub confirmation_blocktime: Option<u64>,
    pub is_spent: bool,
}

/// The canonical zero-value "pay to anchor" output every commitment, tree, and forfeit
/// transaction carries (§4.2), letting anyone attach fees via CPFP without an extra
/// signature.
pub fn anchor_output() -> TxOut {
    let script_pubkey = ScriptBuf::from_bytes(ANCHOR_SCRIPT_PUBKEY.to_vec());

    TxOut {
        value: Amount::ZERO,
        script_pubkey,
    }
}
