//! Authenticated broker channel.
//!
//! Two peers derive a shared ChaCha20-Poly1305 key from an X25519 exchange
//! (optionally mixed with an extra KEM secret) and exchange frames carrying
//! strictly monotonic little-endian nonce counters. Failure paths always
//! perform a decryption so their timing matches a genuine AEAD failure.

mod channel;
pub mod kem;

pub use channel::CTR_LIMIT;
pub use channel::ChannelErr;
pub use channel::NONCE_LEN;
pub use channel::SecureChannel;
pub use channel::handshake;
