// AES-256-GCM for levels 2 and 3

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::envelope::{AEAD_TAG_LEN, NONCE_LEN};
use crate::error::{CryptoError, CryptoResult};

pub struct Sealed {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Encrypt under a fresh random nonce. The GCM tag is split off the ciphertext.
pub fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> CryptoResult<Sealed> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = vec![0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(format!("AES-GCM: {}", e)))?;
    let tag = ciphertext.split_off(ciphertext.len() - AEAD_TAG_LEN);

    Ok(Sealed {
        nonce: nonce_bytes,
        ciphertext,
        tag,
    })
}

/// Decrypt and authenticate. Any mismatch is an `IntegrityFailure`.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN || tag.len() != AEAD_TAG_LEN {
        return Err(CryptoError::MalformedEnvelope("bad nonce or tag length".to_string()));
    }
    let cipher = Aes256Gcm::new(key.into());

    let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: &combined, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::IntegrityFailure)
}
