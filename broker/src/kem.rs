//! Minimal KEM interface over ephemeral X25519.
//!
//! Provides the `generate/encapsulate/decapsulate` shape expected by hybrid
//! key derivation. The encapsulation ciphertext is the ephemeral public key;
//! the shared secret feeds [`crate::SecureChannel::new`] as the extra
//! `pq_secret` input.

use x25519_dalek::PublicKey;
use x25519_dalek::StaticSecret;

use crate::channel::random_bytes;

/// Return a `(public, secret)` keypair.
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let secret: [u8; 32] = random_bytes();
    let public = PublicKey::from(&StaticSecret::from(secret)).to_bytes();
    (public, secret)
}

/// Encapsulate a fresh shared secret to `peer_public`. Returns
/// `(ciphertext, shared_secret)`.
pub fn encapsulate(peer_public: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let eph: [u8; 32] = random_bytes();
    let eph_secret = StaticSecret::from(eph);
    let ciphertext = PublicKey::from(&eph_secret).to_bytes();
    let shared = eph_secret
        .diffie_hellman(&PublicKey::from(*peer_public))
        .to_bytes();
    (ciphertext, shared)
}

/// Recover the shared secret from `ciphertext` with our `secret` key.
pub fn decapsulate(ciphertext: &[u8; 32], secret: &[u8; 32]) -> [u8; 32] {
    StaticSecret::from(*secret)
        .diffie_hellman(&PublicKey::from(*ciphertext))
        .to_bytes()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::SecureChannel;
    use pretty_assertions::assert_eq;

    #[test]
    fn encapsulation_round_trips() {
        let (public, secret) = generate_keypair();
        let (ciphertext, shared_a) = encapsulate(&public);
        let shared_b = decapsulate(&ciphertext, &secret);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn kem_secret_feeds_a_hybrid_channel() {
        let (pub_a, priv_a) = generate_keypair();
        let (pub_b, priv_b) = generate_keypair();
        let (ciphertext, shared_a) = encapsulate(&pub_b);
        let shared_b = decapsulate(&ciphertext, &priv_b);

        let a = SecureChannel::new(&priv_a, &pub_b, Some(&shared_a), None);
        let b = SecureChannel::new(&priv_b, &pub_a, Some(&shared_b), None);
        let frame = a.frame(b"hybrid").unwrap();
        assert_eq!(b.unframe(&frame).unwrap(), b"hybrid");
    }
}
