// Level 1: one-time pad with an HMAC-SHA256 tag

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::kdf::derive_otp_mac_key;
use crate::error::{CryptoError, CryptoResult};
use crate::key_pool::KeyId;

type HmacSha256 = Hmac<Sha256>;

fn check_length(pad: &[u8], data_len: usize) -> CryptoResult<()> {
    if pad.len() != data_len {
        return Err(CryptoError::MalformedEnvelope(format!(
            "one-time pad is {} bytes but message is {} bytes",
            pad.len(),
            data_len
        )));
    }
    Ok(())
}

fn mac(pad: &[u8], key_id: &KeyId, aad: &[u8], ciphertext: &[u8]) -> CryptoResult<HmacSha256> {
    let mac_key = derive_otp_mac_key(pad, key_id)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&(aad.len() as u32).to_be_bytes());
    mac.update(aad);
    mac.update(ciphertext);
    Ok(mac)
}

/// XOR `plaintext` with `pad` and tag the result. Returns `(ciphertext, tag)`.
pub fn seal(pad: &[u8], key_id: &KeyId, aad: &[u8], plaintext: &[u8]) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
    check_length(pad, plaintext.len())?;

    let ciphertext: Vec<u8> = plaintext.iter().zip(pad).map(|(p, k)| p ^ k).collect();
    let tag = mac(pad, key_id, aad, &ciphertext)?.finalize().into_bytes().to_vec();
    Ok((ciphertext, tag))
}

/// Verify the tag, then XOR. Nothing is decrypted unless the tag matches.
pub fn open(
    pad: &[u8],
    key_id: &KeyId,
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    check_length(pad, ciphertext.len())?;

    mac(pad, key_id, aad, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::IntegrityFailure)?;

    Ok(Zeroizing::new(
        ciphertext.iter().zip(pad).map(|(c, k)| c ^ k).collect(),
    ))
}
