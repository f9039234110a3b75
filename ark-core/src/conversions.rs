//! Conversions between `bitcoin`'s secp256k1 types and the `musig`-aliased `secp256k1`
//! crate used for MuSig2 key aggregation and nonce generation.

use bitcoin::secp256k1::PublicKey;
use bitcoin::XOnlyPublicKey;

/// Converts a Bitcoin public key into the MuSig2 crate's own key type.
///
/// Panics if the conversion fails, which cannot happen for a valid Bitcoin public key.
pub fn to_musig_pk(pk: PublicKey) -> musig::PublicKey {
    musig::PublicKey::from_slice(&pk.serialize()).expect("valid conversion")
}

/// Converts a MuSig2 x-only public key (e.g. an aggregated or tweaked key) back into
/// Bitcoin's x-only key type.
///
/// Panics if the conversion fails, which cannot happen for a valid MuSig2 x-only key.
pub fn from_musig_xonly(pk: musig::XOnlyPublicKey) -> XOnlyPublicKey {
    XOnlyPublicKey::from_slice(&pk.serialize()).expect("valid conversion")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::rand;
    use bitcoin::secp256k1::Secp256k1;

    #[test]
    fn round_trips_through_musig_public_key() {
        let secp = Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());

        let musig_pk = to_musig_pk(pk);
        assert_eq!(musig_pk.serialize(), pk.serialize());
    }
}
