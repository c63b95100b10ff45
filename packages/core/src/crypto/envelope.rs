//! The security envelope carried by the message transport.

use serde::{Deserialize, Serialize};

use crate::crypto::level::{SecurityLevel, ALG_AES, ALG_OTP, ALG_PLAIN, ALG_PQC, ALG_PQC_SIGNED};
use crate::error::{CryptoError, CryptoResult};
use crate::key_pool::KeyId;

pub const ENVELOPE_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;
pub const OTP_TAG_LEN: usize = 32;
pub const KEM_CIPHERTEXT_LEN: usize = 1088;

const AAD_DOMAIN: &[u8] = b"qumail-envelope";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEnvelope {
    pub version: u8,
    pub security_level: SecurityLevel,
    pub algorithm_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub nonce: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub tag: Option<Vec<u8>>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub kem_ciphertext: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub signature: Option<Vec<u8>>,
}

fn malformed(msg: impl Into<String>) -> CryptoError {
    CryptoError::MalformedEnvelope(msg.into())
}

fn require<'a>(field: &'a Option<Vec<u8>>, name: &str, len: Option<usize>) -> CryptoResult<&'a [u8]> {
    let value = field.as_deref().ok_or_else(|| malformed(format!("missing {}", name)))?;
    if let Some(expected) = len {
        if value.len() != expected {
            return Err(malformed(format!(
                "{} must be {} bytes, got {}",
                name,
                expected,
                value.len()
            )));
        }
    }
    Ok(value)
}

fn forbid(field: &Option<Vec<u8>>, name: &str, level: SecurityLevel) -> CryptoResult<()> {
    match field {
        Some(_) => Err(malformed(format!("{} not allowed at {}", name, level))),
        None => Ok(()),
    }
}

impl SecurityEnvelope {
    /// Level 4: the payload travels as is.
    pub fn plain(plaintext: &[u8]) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            security_level: SecurityLevel::Plain,
            algorithm_id: ALG_PLAIN.to_string(),
            key_id: None,
            nonce: None,
            tag: None,
            ciphertext: plaintext.to_vec(),
            kem_ciphertext: None,
            signature: None,
        }
    }

    /// Structural checks done before any key is fetched or any crypto runs.
    pub fn validate(&self) -> CryptoResult<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(malformed(format!("unsupported version {}", self.version)));
        }
        let level = self.security_level;

        let expected_alg = match level {
            SecurityLevel::Otp => ALG_OTP,
            SecurityLevel::Aes => ALG_AES,
            SecurityLevel::Pqc if self.signature.is_some() => ALG_PQC_SIGNED,
            SecurityLevel::Pqc => ALG_PQC,
            SecurityLevel::Plain => ALG_PLAIN,
        };
        if self.algorithm_id != expected_alg {
            return Err(malformed(format!(
                "algorithm {} does not match {}",
                self.algorithm_id, level
            )));
        }

        match level {
            SecurityLevel::Otp => {
                self.require_key_id()?;
                require(&self.tag, "tag", Some(OTP_TAG_LEN))?;
                forbid(&self.nonce, "nonce", level)?;
                forbid(&self.kem_ciphertext, "kem_ciphertext", level)?;
                forbid(&self.signature, "signature", level)?;
            }
            SecurityLevel::Aes => {
                self.require_key_id()?;
                require(&self.nonce, "nonce", Some(NONCE_LEN))?;
                require(&self.tag, "tag", Some(AEAD_TAG_LEN))?;
                forbid(&self.kem_ciphertext, "kem_ciphertext", level)?;
                forbid(&self.signature, "signature", level)?;
            }
            SecurityLevel::Pqc => {
                self.require_key_id()?;
                require(&self.nonce, "nonce", Some(NONCE_LEN))?;
                require(&self.tag, "tag", Some(AEAD_TAG_LEN))?;
                require(&self.kem_ciphertext, "kem_ciphertext", Some(KEM_CIPHERTEXT_LEN))?;
            }
            SecurityLevel::Plain => {
                if self.key_id.is_some() {
                    return Err(malformed("key_id not allowed at level 4"));
                }
                forbid(&self.nonce, "nonce", level)?;
                forbid(&self.tag, "tag", level)?;
                forbid(&self.kem_ciphertext, "kem_ciphertext", level)?;
                forbid(&self.signature, "signature", level)?;
            }
        }
        Ok(())
    }

    pub fn require_key_id(&self) -> CryptoResult<KeyId> {
        self.key_id.ok_or_else(|| malformed("missing key_id"))
    }

    /// Header bytes bound into every MAC, AEAD tag and signature.
    pub fn associated_data(&self) -> Vec<u8> {
        header_bytes(self.version, self.security_level, &self.algorithm_id, self.key_id)
    }

    /// What the level 3 signature covers.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = self.associated_data();
        for part in [&self.kem_ciphertext, &self.nonce] {
            let bytes = part.as_deref().unwrap_or_default();
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(self.tag.as_deref().unwrap_or_default());
        out
    }
}

/// Canonical, length-prefixed header encoding.
pub fn header_bytes(version: u8, level: SecurityLevel, algorithm_id: &str, key_id: Option<KeyId>) -> Vec<u8> {
    let mut out = Vec::with_capacity(AAD_DOMAIN.len() + 2 + 2 + algorithm_id.len() + 17);
    out.extend_from_slice(AAD_DOMAIN);
    out.push(version);
    out.push(level.as_u8());
    out.extend_from_slice(&(algorithm_id.len() as u16).to_be_bytes());
    out.extend_from_slice(algorithm_id.as_bytes());
    match key_id {
        Some(id) => {
            out.push(1);
            out.extend_from_slice(id.as_bytes());
        }
        None => out.push(0),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn aes_envelope() -> SecurityEnvelope {
        SecurityEnvelope {
            version: ENVELOPE_VERSION,
            security_level: SecurityLevel::Aes,
            algorithm_id: ALG_AES.to_string(),
            key_id: Some(Uuid::new_v4()),
            nonce: Some(vec![0; NONCE_LEN]),
            tag: Some(vec![0; AEAD_TAG_LEN]),
            ciphertext: vec![1, 2, 3],
            kem_ciphertext: None,
            signature: None,
        }
    }

    #[test]
    fn test_valid_shapes() {
        assert!(aes_envelope().validate().is_ok());
        assert!(SecurityEnvelope::plain(b"hi").validate().is_ok());
    }

    #[test]
    fn test_rejects_structural_mismatch() {
        let mut env = aes_envelope();
        env.nonce = Some(vec![0; 8]);
        assert!(matches!(env.validate(), Err(CryptoError::MalformedEnvelope(_))));

        let mut env = aes_envelope();
        env.kem_ciphertext = Some(vec![0; KEM_CIPHERTEXT_LEN]);
        assert!(matches!(env.validate(), Err(CryptoError::MalformedEnvelope(_))));

        let mut env = aes_envelope();
        env.algorithm_id = ALG_OTP.to_string();
        assert!(matches!(env.validate(), Err(CryptoError::MalformedEnvelope(_))));

        let mut env = aes_envelope();
        env.version = 2;
        assert!(matches!(env.validate(), Err(CryptoError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_associated_data_binds_header() {
        let env = aes_envelope();
        let mut other = env.clone();
        other.key_id = Some(Uuid::new_v4());
        assert_ne!(env.associated_data(), other.associated_data());

        let mut other = env.clone();
        other.ciphertext.push(0);
        assert_eq!(env.associated_data(), other.associated_data());
        assert_ne!(env.signed_bytes(), other.signed_bytes());
    }
}
