//! Sealed sandbox checkpoints: snapshot → canonical JSON → AEAD blob.

use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::Key;
use chacha20poly1305::Nonce;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::aead::KeyInit;
use rand::Rng;
use tracing::info;
use warden_protocol::config::SandboxConfig;
use warden_protocol::error::SandboxErr;

use crate::error::Result;
use crate::handle::Handle;
use crate::supervisor;
use crate::supervisor::SpawnOptions;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Capture the sandbox configuration, seal it under `key`, and close the
/// handle. The handle is closed whether or not sealing succeeded.
pub async fn checkpoint(handle: Handle, key: &[u8]) -> Result<Vec<u8>> {
    let sealed = seal_config(&handle.snapshot(), key);
    let _ = handle.close().await;
    sealed
}

/// Open a checkpoint blob and spawn a new sandbox from the decoded
/// configuration.
pub async fn restore(blob: &[u8], key: &[u8]) -> Result<Handle> {
    check_key(key)?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(invalid("blob too short"));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let payload = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| invalid("cannot open blob"))?;

    let doc: serde_json::Value =
        serde_json::from_slice(&payload).map_err(|err| invalid(format!("bad payload: {err}")))?;
    if !doc.is_object() {
        return Err(invalid("snapshot payload must be an object"));
    }
    match doc.get("name") {
        Some(serde_json::Value::String(name)) if !name.is_empty() => {}
        _ => return Err(invalid("snapshot missing a non-empty sandbox name")),
    }
    let config: SandboxConfig =
        serde_json::from_value(doc).map_err(|err| invalid(format!("bad config: {err}")))?;

    let name = config.name.clone();
    supervisor::spawn(
        &name,
        SpawnOptions {
            policy: config.policy,
            cpu_ms: config.cpu_ms,
            mem_bytes: config.mem_bytes,
            allowed_imports: config.allowed_imports,
            numa_node: config.numa_node,
        },
    )
    .await
}

/// Move a sandbox to `host` via an encrypted checkpoint. The transport leg
/// is handled by the peer broker; locally this reduces to a round trip.
pub async fn migrate(handle: Handle, host: &str, key: &[u8]) -> Result<Handle> {
    let blob = checkpoint(handle, key).await?;
    info!("migrating checkpoint blob ({} bytes) to {host}", blob.len());
    restore(&blob, key).await
}

fn seal_config(config: &SandboxConfig, key: &[u8]) -> Result<Vec<u8>> {
    check_key(key)?;
    let payload = serde_json::to_vec(config)
        .map_err(|err| invalid(format!("unserializable config: {err}")))?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce[..]);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload.as_slice())
        .map_err(|_| invalid("seal failed"))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(invalid(format!(
            "key must be exactly {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> crate::error::WardenErr {
    SandboxErr::InvalidSnapshot(msg.into()).into()
}
