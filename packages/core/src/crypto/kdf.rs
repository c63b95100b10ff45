// HKDF-SHA256 derivations. Every context string is distinct so no derived key
// can collide with another use of the same QKD bytes.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::key_pool::KeyId;

pub const AES_CONTEXT: &[u8] = b"qumail-aes-encryption";
pub const HYBRID_CONTEXT: &[u8] = b"qumail-pqc-hybrid";
pub const OTP_MAC_CONTEXT: &[u8] = b"qumail-otp-mac";

pub type DerivedKey = Zeroizing<[u8; 32]>;

fn expand(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> CryptoResult<DerivedKey> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut okm[..])?;
    Ok(okm)
}

/// Level 2: AES-256 key from a 32-byte QKD seed.
pub fn derive_aes_key(seed: &[u8]) -> CryptoResult<DerivedKey> {
    if seed.len() != 32 {
        return Err(CryptoError::KeyDerivation(format!(
            "aes seed must be 32 bytes, got {}",
            seed.len()
        )));
    }
    expand(None, seed, AES_CONTEXT)
}

/// Level 3: AES-256 key from the KEM shared secret combined with a QKD seed.
pub fn derive_hybrid_key(shared_secret: &[u8], seed: &[u8]) -> CryptoResult<DerivedKey> {
    if seed.len() != 32 {
        return Err(CryptoError::KeyDerivation(format!(
            "aes seed must be 32 bytes, got {}",
            seed.len()
        )));
    }
    let mut ikm = Zeroizing::new(Vec::with_capacity(shared_secret.len() + seed.len()));
    ikm.extend_from_slice(shared_secret);
    ikm.extend_from_slice(seed);
    expand(None, &ikm, HYBRID_CONTEXT)
}

/// Level 1: MAC key bound to one pad and its key id. Never the raw pad bytes.
pub fn derive_otp_mac_key(pad: &[u8], key_id: &KeyId) -> CryptoResult<DerivedKey> {
    expand(Some(key_id.as_bytes()), pad, OTP_MAC_CONTEXT)
}
