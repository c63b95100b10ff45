// Encryption engine: one transform per security level.
//
// `seal`/`open` are pure over explicit key material. `EncryptionEngine` adds
// the key lifecycle around them: acquire a lease, seal, commit or release.

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::aead;
use crate::crypto::envelope::{header_bytes, SecurityEnvelope, ENVELOPE_VERSION};
use crate::crypto::kdf::{derive_aes_key, derive_hybrid_key};
use crate::crypto::level::{SecurityLevel, ALG_AES, ALG_OTP, ALG_PQC, ALG_PQC_SIGNED};
use crate::crypto::otp;
use crate::crypto::pqc::{self, SigningKeyPair};
use crate::error::{CryptoError, CryptoResult, KeyError};
use crate::key_pool::{KeyMaterial, PeerId};
use crate::lifecycle::KeyLifecycleTracker;

/// Recipient-side keys needed to open level 3 envelopes.
#[derive(Default)]
pub struct DecryptionKeys {
    /// Kyber768 secret key of the recipient
    pub kem_secret_key: Option<Zeroizing<Vec<u8>>>,
    /// Dilithium3 public key of the sender; required when the envelope is signed
    pub sender_verifying_key: Option<Vec<u8>>,
}

impl DecryptionKeys {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_kem_secret(mut self, secret_key: &[u8]) -> Self {
        self.kem_secret_key = Some(Zeroizing::new(secret_key.to_vec()));
        self
    }

    pub fn with_sender_key(mut self, public_key: &[u8]) -> Self {
        self.sender_verifying_key = Some(public_key.to_vec());
        self
    }
}

fn require_key<'a>(key: Option<&'a KeyMaterial>, level: SecurityLevel) -> CryptoResult<&'a KeyMaterial> {
    key.ok_or_else(|| CryptoError::MalformedEnvelope(format!("{} needs key material", level)))
}

/// Encrypt `plaintext` at `level` with the given key material.
///
/// Level 1 requires a pad exactly as long as the plaintext. Level 3 requires
/// the recipient's encapsulation key and signs when `signer` is given.
pub fn seal(
    level: SecurityLevel,
    key: Option<&KeyMaterial>,
    recipient_kem_key: Option<&[u8]>,
    signer: Option<&SigningKeyPair>,
    plaintext: &[u8],
) -> CryptoResult<SecurityEnvelope> {
    match level {
        SecurityLevel::Plain => Ok(SecurityEnvelope::plain(plaintext)),
        SecurityLevel::Otp => {
            let key = require_key(key, level)?;
            let aad = header_bytes(ENVELOPE_VERSION, level, ALG_OTP, Some(key.key_id));
            let (ciphertext, tag) = otp::seal(key.expose(), &key.key_id, &aad, plaintext)?;
            Ok(SecurityEnvelope {
                version: ENVELOPE_VERSION,
                security_level: level,
                algorithm_id: ALG_OTP.to_string(),
                key_id: Some(key.key_id),
                nonce: None,
                tag: Some(tag),
                ciphertext,
                kem_ciphertext: None,
                signature: None,
            })
        }
        SecurityLevel::Aes => {
            let key = require_key(key, level)?;
            let aes_key = derive_aes_key(key.expose())?;
            let aad = header_bytes(ENVELOPE_VERSION, level, ALG_AES, Some(key.key_id));
            let sealed = aead::seal(&aes_key, &aad, plaintext)?;
            Ok(SecurityEnvelope {
                version: ENVELOPE_VERSION,
                security_level: level,
                algorithm_id: ALG_AES.to_string(),
                key_id: Some(key.key_id),
                nonce: Some(sealed.nonce),
                tag: Some(sealed.tag),
                ciphertext: sealed.ciphertext,
                kem_ciphertext: None,
                signature: None,
            })
        }
        SecurityLevel::Pqc => {
            let key = require_key(key, level)?;
            let recipient_kem_key = recipient_kem_key.ok_or_else(|| {
                CryptoError::KeyDerivation("level 3 needs the recipient's encapsulation key".to_string())
            })?;
            let (shared_secret, kem_ciphertext) = pqc::encapsulate(recipient_kem_key)?;
            let aes_key = derive_hybrid_key(&shared_secret, key.expose())?;

            let algorithm_id = if signer.is_some() { ALG_PQC_SIGNED } else { ALG_PQC };
            let aad = header_bytes(ENVELOPE_VERSION, level, algorithm_id, Some(key.key_id));
            let sealed = aead::seal(&aes_key, &aad, plaintext)?;

            let mut envelope = SecurityEnvelope {
                version: ENVELOPE_VERSION,
                security_level: level,
                algorithm_id: algorithm_id.to_string(),
                key_id: Some(key.key_id),
                nonce: Some(sealed.nonce),
                tag: Some(sealed.tag),
                ciphertext: sealed.ciphertext,
                kem_ciphertext: Some(kem_ciphertext),
                signature: None,
            };
            if let Some(signer) = signer {
                envelope.signature = Some(pqc::sign(&envelope.signed_bytes(), &signer.secret_key)?);
            }
            Ok(envelope)
        }
    }
}

/// Decrypt a validated envelope. Tags and signatures are checked before any
/// plaintext is produced.
pub fn open(
    envelope: &SecurityEnvelope,
    key: Option<&KeyMaterial>,
    keys: &DecryptionKeys,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    envelope.validate()?;
    let level = envelope.security_level;
    if level == SecurityLevel::Plain {
        return Ok(Zeroizing::new(envelope.ciphertext.clone()));
    }

    let key = require_key(key, level)?;
    if envelope.key_id != Some(key.key_id) {
        return Err(CryptoError::MalformedEnvelope("key id does not match envelope".to_string()));
    }
    let aad = envelope.associated_data();
    let nonce = envelope.nonce.as_deref().unwrap_or_default();
    let tag = envelope.tag.as_deref().unwrap_or_default();

    match level {
        SecurityLevel::Otp => otp::open(key.expose(), &key.key_id, &aad, &envelope.ciphertext, tag),
        SecurityLevel::Aes => {
            let aes_key = derive_aes_key(key.expose())?;
            aead::open(&aes_key, nonce, &aad, &envelope.ciphertext, tag)
        }
        SecurityLevel::Pqc => {
            if let Some(signature) = envelope.signature.as_deref() {
                let verifying_key = keys
                    .sender_verifying_key
                    .as_deref()
                    .ok_or(CryptoError::IntegrityFailure)?;
                pqc::verify(signature, &envelope.signed_bytes(), verifying_key)?;
            }
            let secret_key = keys.kem_secret_key.as_deref().ok_or(CryptoError::MissingDecryptionKey)?;
            let kem_ciphertext = envelope.kem_ciphertext.as_deref().unwrap_or_default();
            let shared_secret = pqc::decapsulate(kem_ciphertext, secret_key)?;
            let aes_key = derive_hybrid_key(&shared_secret, key.expose())?;
            // a wrong KEM secret yields a different key, so this fails closed as well
            aead::open(&aes_key, nonce, &aad, &envelope.ciphertext, tag)
        }
        SecurityLevel::Plain => Ok(Zeroizing::new(envelope.ciphertext.clone())),
    }
}

/// Engine bound to a key lifecycle tracker.
pub struct EncryptionEngine {
    tracker: KeyLifecycleTracker,
    signer: Option<SigningKeyPair>,
}

impl EncryptionEngine {
    pub fn new(tracker: KeyLifecycleTracker) -> Self {
        Self { tracker, signer: None }
    }

    /// Sign every level 3 envelope with this key pair.
    pub fn with_signer(mut self, signer: SigningKeyPair) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn tracker(&self) -> &KeyLifecycleTracker {
        &self.tracker
    }

    pub fn signing_public_key(&self) -> Option<&[u8]> {
        self.signer.as_ref().map(|s| s.public_key.as_slice())
    }

    /// Encrypt for `recipient` at `level`.
    ///
    /// The key is leased for the duration of the operation: committed when the
    /// envelope is produced, returned to the pool on any failure.
    pub async fn encrypt(
        &self,
        level: SecurityLevel,
        recipient: &PeerId,
        plaintext: &[u8],
        recipient_kem_key: Option<&[u8]>,
    ) -> CryptoResult<SecurityEnvelope> {
        let Some((purpose, size)) = level.key_requirement(plaintext.len()) else {
            return seal(level, None, None, None, plaintext);
        };
        if level == SecurityLevel::Pqc && recipient_kem_key.is_none() {
            return Err(CryptoError::MissingRecipientKey(recipient.clone()));
        }

        let lease = self.tracker.acquire(recipient, size, purpose).await?;
        let sealed = seal(
            level,
            Some(lease.material()),
            recipient_kem_key,
            self.signer.as_ref(),
            plaintext,
        );

        match sealed {
            Ok(envelope) => {
                let key_id = lease.key_id();
                lease.commit().await?;
                debug!(
                    target: "crypto::engine",
                    key_id = %key_id,
                    peer = %recipient,
                    level = level.as_u8(),
                    size = plaintext.len(),
                    "message encrypted"
                );
                Ok(envelope)
            }
            Err(err) => {
                let key_id = lease.key_id();
                if let Err(release_err) = lease.release().await {
                    warn!(target: "crypto::engine", key_id = %key_id, error = %release_err, "release after failed encryption");
                }
                Err(err)
            }
        }
    }

    /// Decrypt a received envelope.
    ///
    /// A level 1 key is consumed on the first successful decryption; the
    /// plaintext is withheld if the consumption is not confirmed. A message
    /// whose one-time key is already gone fails with `KeyUnavailableForDecrypt`.
    pub async fn decrypt(&self, envelope: &SecurityEnvelope, keys: &DecryptionKeys) -> CryptoResult<Zeroizing<Vec<u8>>> {
        envelope.validate()?;
        if envelope.security_level == SecurityLevel::Plain {
            return open(envelope, None, keys);
        }

        let key_id = envelope.require_key_id()?;
        let material = self.tracker.fetch_for_decrypt(key_id).await.map_err(|err| match err {
            KeyError::Gone(_) | KeyError::NotFound(_) | KeyError::AlreadyConsumed(_) | KeyError::InvalidState { .. } => {
                CryptoError::KeyUnavailableForDecrypt(key_id)
            }
            other => CryptoError::Key(other),
        })?;

        let plaintext = match open(envelope, Some(&material), keys) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(
                    target: "crypto::engine",
                    key_id = %key_id,
                    level = envelope.security_level.as_u8(),
                    error = %err,
                    "decryption rejected"
                );
                return Err(err);
            }
        };

        if material.purpose.is_one_time() {
            self.tracker.mark_used(key_id).await.map_err(|err| match err {
                KeyError::AlreadyConsumed(_) | KeyError::Gone(_) => CryptoError::KeyUnavailableForDecrypt(key_id),
                other => CryptoError::Key(other),
            })?;
        }

        debug!(
            target: "crypto::engine",
            key_id = %key_id,
            level = envelope.security_level.as_u8(),
            "message decrypted"
        );
        Ok(plaintext)
    }
}
