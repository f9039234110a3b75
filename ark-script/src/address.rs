//! Ark address codec (§4.2): a bech32m encoding of `server_xonly || tweaked_xonly`,
//! tagged with a network-specific human-readable prefix.

use bech32::Bech32m;
use bech32::Hrp;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::script::Builder;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;

const PAYLOAD_LEN: usize = 64;

/// Human-readable prefix: `ark` on mainnet, `tark` everywhere else (testnet, signet,
/// mutinynet, regtest all share one decoder-visible network).
fn hrp_for(network: Network) -> Hrp {
    let s = match network {
        Network::Bitcoin => "ark",
        _ => "tark",
    };
    Hrp::parse(s).expect("static hrp is valid")
}

/// An Ark address: the server's forfeit/cosigner key together with the tweaked Taproot
/// output key of a vtxo, bech32m-encoded with a network-tagged prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArkAddress {
    network: Network,
    server_pk: XOnlyPublicKey,
    vtxo_tap_key: XOnlyPublicKey,
}

impl ArkAddress {
    pub fn new(network: Network, server_pk: XOnlyPublicKey, vtxo_tap_key: XOnlyPublicKey) -> Self {
        Self {
            network,
            server_pk,
            vtxo_tap_key,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server_pk
    }

    pub fn vtxo_tap_key(&self) -> XOnlyPublicKey {
        self.vtxo_tap_key
    }

    /// `0x51 0x20 <tweaked_xonly>`, the P2TR payment script this address pays to.
    pub fn to_script_pubkey(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(self.vtxo_tap_key.serialize())
            .into_script()
    }

    pub fn encode(&self) -> Result<String, Error> {
        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.extend_from_slice(&self.server_pk.serialize());
        payload.extend_from_slice(&self.vtxo_tap_key.serialize());

        let hrp = hrp_for(self.network);
        bech32::encode::<Bech32m>(hrp, &payload).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn decode(s: &str) -> Result<Self, Error> {
        let (hrp, payload) = bech32::decode(s).map_err(|e| Error::Decode(e.to_string()))?;

        let network = if hrp.as_str() == "ark" {
            Network::Bitcoin
        } else if hrp.as_str() == "tark" {
            Network::Testnet
        } else {
            return Err(Error::UnknownHrp(hrp.to_string()));
        };

        if payload.len() != PAYLOAD_LEN {
            return Err(Error::InvalidLength(payload.len()));
        }

        let server_pk = XOnlyPublicKey::from_slice(&payload[..32])
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let vtxo_tap_key = XOnlyPublicKey::from_slice(&payload[32..])
            .map_err(|e| Error::InvalidKey(e.to_string()))?;

        Ok(Self {
            network,
            server_pk,
            vtxo_tap_key,
        })
    }
}

impl std::fmt::Display for ArkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.encode() {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl std::str::FromStr for ArkAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("failed to bech32m-encode address: {0}")]
    Encode(String),
    #[error("failed to bech32m-decode address: {0}")]
    Decode(String),
    #[error("unrecognised address hrp: {0}")]
    UnknownHrp(String),
    #[error("address payload has length {0}, expected {PAYLOAD_LEN}")]
    InvalidLength(usize),
    #[error("invalid x-only public key in address payload: {0}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pk(seed: u8) -> XOnlyPublicKey {
        let hex = format!("{seed:02x}845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        XOnlyPublicKey::from_str(&hex).unwrap()
    }

    #[test]
    fn round_trips_mainnet() {
        let address = ArkAddress::new(Network::Bitcoin, pk(1), pk(2));
        let encoded = address.encode().unwrap();
        assert!(encoded.starts_with("ark1"));

        let decoded = ArkAddress::decode(&encoded).unwrap();
        assert_eq!(decoded, address);
    }

    #[test]
    fn round_trips_testnet() {
        let address = ArkAddress::new(Network::Testnet, pk(3), pk(4));
        let encoded = address.encode().unwrap();
        assert!(encoded.starts_with("tark1"));

        let decoded = ArkAddress::decode(&encoded).unwrap();
        assert_eq!(decoded, address);
    }

    #[test]
    fn rejects_mutated_checksum() {
        let address = ArkAddress::new(Network::Bitcoin, pk(1), pk(2));
        let mut encoded = address.encode().unwrap();

        let last = encoded.pop().unwrap();
        let replacement = if last == 'q' { 'p' } else { 'q' };
        encoded.push(replacement);

        assert!(ArkAddress::decode(&encoded).is_err());
    }

    #[test]
    fn script_pubkey_matches_tweaked_key() {
        let address = ArkAddress::new(Network::Bitcoin, pk(1), pk(2));
        let script = address.to_script_pubkey();
        let bytes = script.to_bytes();

        assert_eq!(bytes[0], 0x51);
        assert_eq!(bytes[1], 0x20);
        assert_eq!(&bytes[2..], &pk(2).serialize());
    }

    #[test]
    fn decode_rejects_unknown_hrp() {
        let address = ArkAddress::new(Network::Bitcoin, pk(1), pk(2));
        let mut payload = Vec::new();
        payload.extend_from_slice(&pk(1).serialize());
        payload.extend_from_slice(&pk(2).serialize());
        let bogus_hrp = Hrp::parse("arkx").unwrap();
        let encoded = bech32::encode::<Bech32m>(bogus_hrp, &payload).unwrap();

        assert!(ArkAddress::decode(&encoded).is_err());
        let _ = address;
    }
}
