// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::sync::Mutex;

use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::Key;
use chacha20poly1305::Nonce;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::aead::KeyInit;
use hkdf::Hkdf;
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::PublicKey;
use x25519_dalek::StaticSecret;

/// Nonce counters saturate here: one more frame is permitted exactly at the
/// limit, the next one overflows.
pub const CTR_LIMIT: u128 = (1u128 << 96) - 1;

pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Domain separation for the HKDF expansion.
const HKDF_INFO: &[u8] = b"warden-broker v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelErr {
    /// Frame too short, too long, or failed authentication.
    #[error("invalid frame")]
    InvalidFrame,

    /// Frame counter does not match the expected receive counter.
    #[error("replayed or out-of-order frame")]
    Replay,

    /// A counter is exhausted; the channel must be rotated.
    #[error("channel counter overflow")]
    Overflow,
}

struct ChannelState {
    cipher: ChaCha20Poly1305,
    tx_ctr: u128,
    rx_ctr: u128,
}

/// One end of an authenticated framed transport.
///
/// All counter and key mutations happen under a single mutex, so both ends
/// are safe for concurrent `frame`/`unframe`/`rotate` calls.
pub struct SecureChannel {
    inner: Mutex<ChannelState>,
    max_frame_len: Option<usize>,
}

impl SecureChannel {
    /// Derive the shared AEAD key from `private` and `peer_public`,
    /// optionally mixing in an extra KEM shared secret for a hybrid key.
    pub fn new(
        private: &[u8; 32],
        peer_public: &[u8; 32],
        pq_secret: Option<&[u8]>,
        max_frame_len: Option<usize>,
    ) -> Self {
        let key = derive_key(private, peer_public, pq_secret);
        Self {
            inner: Mutex::new(ChannelState {
                cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
                tx_ctr: 0,
                rx_ctr: 0,
            }),
            max_frame_len,
        }
    }

    /// Seal `plaintext` into `nonce || ciphertext_with_tag` and advance the
    /// send counter.
    pub fn frame(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelErr> {
        let mut state = self.inner.lock().unwrap();
        if state.tx_ctr > CTR_LIMIT {
            return Err(ChannelErr::Overflow);
        }
        let nonce = counter_nonce(state.tx_ctr);
        let ciphertext = state
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ChannelErr::InvalidFrame)?;
        state.tx_ctr += 1;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a frame, enforcing the strict monotonic receive counter.
    ///
    /// Every failure path runs a decryption first so ill-formed and replayed
    /// frames are not distinguishable from authentication failures by
    /// timing. The counter comparison itself is constant-time.
    pub fn unframe(&self, frame: &[u8]) -> Result<Vec<u8>, ChannelErr> {
        let mut state = self.inner.lock().unwrap();
        if state.rx_ctr > CTR_LIMIT {
            return Err(ChannelErr::Overflow);
        }
        let expected = counter_nonce(state.rx_ctr);

        if frame.len() < NONCE_LEN + TAG_LEN {
            decrypt_dummy(&state.cipher, &expected, frame.len().max(TAG_LEN));
            return Err(ChannelErr::InvalidFrame);
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        if let Some(max) = self.max_frame_len
            && ciphertext.len() > max
        {
            decrypt_dummy(&state.cipher, &expected, TAG_LEN);
            return Err(ChannelErr::InvalidFrame);
        }

        if !bool::from(nonce.ct_eq(&expected)) {
            // Burn a real decryption over the received body anyway.
            let _ = state.cipher.decrypt(Nonce::from_slice(&expected), ciphertext);
            return Err(ChannelErr::Replay);
        }

        let plaintext = state
            .cipher
            .decrypt(Nonce::from_slice(&expected), ciphertext)
            .map_err(|_| ChannelErr::InvalidFrame)?;
        state.rx_ctr += 1;
        Ok(plaintext)
    }

    /// Re-derive the key from a fresh exchange and reset both counters.
    pub fn rotate(&self, private: &[u8; 32], peer_public: &[u8; 32], pq_secret: Option<&[u8]>) {
        let key = derive_key(private, peer_public, pq_secret);
        let mut state = self.inner.lock().unwrap();
        state.cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        state.tx_ctr = 0;
        state.rx_ctr = 0;
    }

    #[cfg(test)]
    fn set_counters(&self, tx: u128, rx: u128) {
        let mut state = self.inner.lock().unwrap();
        state.tx_ctr = tx;
        state.rx_ctr = rx;
    }
}

/// Generate (or reuse) a local keypair and return the public half together
/// with a channel keyed against `peer_public`. Peers exchange publics out of
/// band.
pub fn handshake(
    peer_public: &[u8; 32],
    private: Option<[u8; 32]>,
    max_frame_len: Option<usize>,
) -> ([u8; 32], SecureChannel) {
    let private = private.unwrap_or_else(random_bytes);
    let secret = StaticSecret::from(private);
    let public = PublicKey::from(&secret).to_bytes();
    let channel = SecureChannel::new(&private, peer_public, None, max_frame_len);
    (public, channel)
}

fn derive_key(private: &[u8; 32], peer_public: &[u8; 32], pq_secret: Option<&[u8]>) -> [u8; 32] {
    let secret = StaticSecret::from(*private);
    let peer = PublicKey::from(*peer_public);
    let shared = secret.diffie_hellman(&peer);

    let mut ikm = shared.as_bytes().to_vec();
    if let Some(extra) = pq_secret {
        ikm.extend_from_slice(extra);
    }

    let mut key = [0u8; 32];
    // Expanding 32 bytes out of SHA-256 cannot fail.
    Hkdf::<Sha256>::new(None, &ikm)
        .expand(HKDF_INFO, &mut key)
        .unwrap();
    key
}

fn counter_nonce(ctr: u128) -> [u8; NONCE_LEN] {
    let bytes = ctr.to_le_bytes();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[..NONCE_LEN]);
    nonce
}

fn decrypt_dummy(cipher: &ChaCha20Poly1305, nonce: &[u8; NONCE_LEN], len: usize) {
    let dummy = vec![0u8; len];
    let _ = cipher.decrypt(Nonce::from_slice(nonce), dummy.as_slice());
}

pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes[..]);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_pair() -> (SecureChannel, SecureChannel) {
        make_pair_with_limit(Some(4096))
    }

    fn make_pair_with_limit(max_len: Option<usize>) -> (SecureChannel, SecureChannel) {
        let priv_a: [u8; 32] = random_bytes();
        let priv_b: [u8; 32] = random_bytes();
        let pub_a = PublicKey::from(&StaticSecret::from(priv_a)).to_bytes();
        let pub_b = PublicKey::from(&StaticSecret::from(priv_b)).to_bytes();
        let a = SecureChannel::new(&priv_a, &pub_b, None, max_len);
        let b = SecureChannel::new(&priv_b, &pub_a, None, max_len);
        (a, b)
    }

    #[test]
    fn roundtrip() {
        let (a, b) = make_pair();
        let frame = a.frame(b"secret").unwrap();
        assert_eq!(b.unframe(&frame).unwrap(), b"secret");
    }

    #[test]
    fn replay_detection() {
        let (a, b) = make_pair();
        let frame = a.frame(b"hi").unwrap();
        b.unframe(&frame).unwrap();
        assert_eq!(b.unframe(&frame).unwrap_err(), ChannelErr::Replay);
    }

    #[test]
    fn out_of_order_frames() {
        let (a, b) = make_pair();
        let dropped = a.frame(b"one").unwrap();
        let later = a.frame(b"two").unwrap();
        assert_eq!(b.unframe(&later).unwrap_err(), ChannelErr::Replay);
        // Deliver the dropped frame, then the next.
        assert_eq!(b.unframe(&dropped).unwrap(), b"one");
        assert_eq!(b.unframe(&later).unwrap(), b"two");
    }

    #[test]
    fn short_frame_is_invalid() {
        let (_, b) = make_pair();
        assert_eq!(b.unframe(b"short").unwrap_err(), ChannelErr::InvalidFrame);
    }

    #[test]
    fn oversize_frame_is_invalid() {
        let (a, b) = make_pair_with_limit(Some(8));
        let frame = a.frame(&[0u8; 64]).unwrap();
        assert_eq!(b.unframe(&frame).unwrap_err(), ChannelErr::InvalidFrame);
    }

    #[test]
    fn tampered_frame_fails_authentication() {
        let (a, b) = make_pair();
        let mut frame = a.frame(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(b.unframe(&frame).unwrap_err(), ChannelErr::InvalidFrame);
    }

    #[test]
    fn tx_counter_overflow() {
        let (a, _) = make_pair();
        a.set_counters(CTR_LIMIT, 0);
        a.frame(b"final").unwrap();
        assert_eq!(a.frame(b"boom").unwrap_err(), ChannelErr::Overflow);
    }

    #[test]
    fn rx_counter_overflow() {
        let (a, b) = make_pair();
        b.set_counters(0, CTR_LIMIT + 1);
        let frame = a.frame(b"hi").unwrap();
        assert_eq!(b.unframe(&frame).unwrap_err(), ChannelErr::Overflow);
    }

    #[test]
    fn final_frame_at_limit_is_allowed() {
        let (a, b) = make_pair();
        a.set_counters(CTR_LIMIT, 0);
        b.set_counters(0, CTR_LIMIT);
        let frame = a.frame(b"edge").unwrap();
        assert_eq!(b.unframe(&frame).unwrap(), b"edge");
    }

    #[test]
    fn rotate_resets_counters() {
        let (a, b) = make_pair();
        for _ in 0..3 {
            let frame = a.frame(b"spin").unwrap();
            b.unframe(&frame).unwrap();
        }

        let new_priv_a: [u8; 32] = random_bytes();
        let new_priv_b: [u8; 32] = random_bytes();
        let new_pub_a = PublicKey::from(&StaticSecret::from(new_priv_a)).to_bytes();
        let new_pub_b = PublicKey::from(&StaticSecret::from(new_priv_b)).to_bytes();
        a.rotate(&new_priv_a, &new_pub_b, None);
        b.rotate(&new_priv_b, &new_pub_a, None);

        let frame = a.frame(b"rotated").unwrap();
        assert_eq!(frame[..NONCE_LEN], [0u8; NONCE_LEN]);
        assert_eq!(b.unframe(&frame).unwrap(), b"rotated");
    }

    #[test]
    fn handshake_helper() {
        let priv_b: [u8; 32] = random_bytes();
        let pub_b = PublicKey::from(&StaticSecret::from(priv_b)).to_bytes();

        let (pub_a, a) = handshake(&pub_b, None, Some(4096));
        let b = SecureChannel::new(&priv_b, &pub_a, None, Some(4096));

        let frame = a.frame(b"hi").unwrap();
        assert_eq!(b.unframe(&frame).unwrap(), b"hi");
    }

    #[test]
    fn hybrid_secret_changes_the_key() {
        let priv_a: [u8; 32] = random_bytes();
        let priv_b: [u8; 32] = random_bytes();
        let pub_a = PublicKey::from(&StaticSecret::from(priv_a)).to_bytes();
        let pub_b = PublicKey::from(&StaticSecret::from(priv_b)).to_bytes();

        let a = SecureChannel::new(&priv_a, &pub_b, Some(b"extra"), None);
        let plain_b = SecureChannel::new(&priv_b, &pub_a, None, None);
        let hybrid_b = SecureChannel::new(&priv_b, &pub_a, Some(b"extra"), None);

        let frame = a.frame(b"kem").unwrap();
        assert_eq!(plain_b.unframe(&frame).unwrap_err(), ChannelErr::InvalidFrame);
        assert_eq!(hybrid_b.unframe(&frame).unwrap(), b"kem");
    }

    #[test]
    fn concurrent_senders_do_not_corrupt_counters() {
        use std::sync::Arc;

        let (a, b) = make_pair();
        let a = Arc::new(a);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let a = Arc::clone(&a);
                std::thread::spawn(move || {
                    let msg = format!("m{i}").into_bytes();
                    a.frame(&msg).unwrap()
                })
            })
            .collect();
        let mut frames: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Frames carry distinct counters; delivering in counter order works.
        frames.sort_by_key(|f| {
            let mut ctr = [0u8; 16];
            ctr[..NONCE_LEN].copy_from_slice(&f[..NONCE_LEN]);
            u128::from_le_bytes(ctr)
        });
        for frame in frames {
            b.unframe(&frame).unwrap();
        }
    }
}
