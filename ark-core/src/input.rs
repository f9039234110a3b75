//! The tagged settlement input union (§9): either a structured vtxo/boarding spend, or an
//! opaque Arkade note forwarded as-is, requiring no forfeit transaction (§4.6).

use crate::arknote::ArkNote;
use crate::intent;
use crate::Error;
use bitcoin::OutPoint;

/// One input registered for a settlement round.
#[derive(Debug, Clone)]
pub enum SettlementInput {
    /// A bearer-token note, redeemed by revealing its preimage. Notes need no forfeit
    /// transaction: there is no vtxo for the server to forfeit against.
    Note(ArkNote),
    /// A structured vtxo or boarding UTXO spend, carrying everything needed to build its
    /// intent proof input and (for vtxos) its forfeit transaction.
    Spendable(intent::Input),
}

impl SettlementInput {
    pub fn outpoint(&self) -> OutPoint {
        match self {
            SettlementInput::Note(note) => note.outpoint(),
            SettlementInput::Spendable(input) => input.outpoint(),
        }
    }

    /// Whether this input needs a forfeit transaction built and signed during the
    /// `FORFEITING` stage of settlement. Notes and boarding UTXOs do not; only vtxos do.
    pub fn needs_forfeit(&self) -> bool {
        match self {
            SettlementInput::Note(_) => false,
            SettlementInput::Spendable(input) => !input.is_onchain(),
        }
    }

    pub fn to_intent_input(&self) -> Result<intent::Input, Error> {
        match self {
            SettlementInput::Note(note) => note.to_intent_input(),
            SettlementInput::Spendable(input) => Ok(input.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Amount;

    #[test]
    fn notes_never_need_a_forfeit() {
        let note = ArkNote::new([7u8; 32], Amount::from_sat(1_000)).unwrap();
        let input = SettlementInput::Note(note);
        assert!(!input.needs_forfeit());
    }
}
