//! Post-quantum primitives for level 3: Kyber768 encapsulation and optional
//! Dilithium3 detached signatures.
//!
//! Built with the `post-quantum` feature (on by default). Without it every
//! operation fails with `CryptoError::Unsupported` and level 3 is unavailable.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoResult;

/// Hex SHA-256 of a public key, as published in peer capabilities.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Recipient-side Kyber768 key pair.
pub struct KemKeyPair {
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl KemKeyPair {
    pub fn generate() -> CryptoResult<Self> {
        let (public_key, secret_key) = imp::kem_keypair()?;
        Ok(Self {
            public_key,
            secret_key,
        })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// Sender-side Dilithium3 key pair.
pub struct SigningKeyPair {
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl SigningKeyPair {
    pub fn generate() -> CryptoResult<Self> {
        let (public_key, secret_key) = imp::sign_keypair()?;
        Ok(Self {
            public_key,
            secret_key,
        })
    }
}

/// Returns `(shared_secret, kem_ciphertext)`.
pub fn encapsulate(public_key: &[u8]) -> CryptoResult<(Zeroizing<Vec<u8>>, Vec<u8>)> {
    imp::encapsulate(public_key)
}

pub fn decapsulate(kem_ciphertext: &[u8], secret_key: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
    imp::decapsulate(kem_ciphertext, secret_key)
}

pub fn sign(message: &[u8], secret_key: &[u8]) -> CryptoResult<Vec<u8>> {
    imp::sign(message, secret_key)
}

/// `IntegrityFailure` on any mismatch, including an unparseable key or signature.
pub fn verify(signature: &[u8], message: &[u8], public_key: &[u8]) -> CryptoResult<()> {
    imp::verify(signature, message, public_key)
}

#[cfg(feature = "post-quantum")]
mod imp {
    use pqcrypto_dilithium::dilithium3;
    use pqcrypto_kyber::kyber768;
    use pqcrypto_traits::kem::{
        Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
    };
    use pqcrypto_traits::sign::{
        DetachedSignature as _, PublicKey as _, SecretKey as _,
    };
    use zeroize::Zeroizing;

    use crate::error::{CryptoError, CryptoResult};

    pub fn kem_keypair() -> CryptoResult<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let (pk, sk) = kyber768::keypair();
        Ok((pk.as_bytes().to_vec(), Zeroizing::new(sk.as_bytes().to_vec())))
    }

    pub fn sign_keypair() -> CryptoResult<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let (pk, sk) = dilithium3::keypair();
        Ok((pk.as_bytes().to_vec(), Zeroizing::new(sk.as_bytes().to_vec())))
    }

    pub fn encapsulate(public_key: &[u8]) -> CryptoResult<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        let pk = kyber768::PublicKey::from_bytes(public_key)
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid Kyber public key: {}", e)))?;
        let (ss, ct) = kyber768::encapsulate(&pk);
        Ok((Zeroizing::new(ss.as_bytes().to_vec()), ct.as_bytes().to_vec()))
    }

    pub fn decapsulate(kem_ciphertext: &[u8], secret_key: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let ct = kyber768::Ciphertext::from_bytes(kem_ciphertext)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("invalid KEM ciphertext: {}", e)))?;
        let sk = kyber768::SecretKey::from_bytes(secret_key)
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid Kyber secret key: {}", e)))?;
        let ss = kyber768::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }

    pub fn sign(message: &[u8], secret_key: &[u8]) -> CryptoResult<Vec<u8>> {
        let sk = dilithium3::SecretKey::from_bytes(secret_key)
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid Dilithium secret key: {}", e)))?;
        Ok(dilithium3::detached_sign(message, &sk).as_bytes().to_vec())
    }

    pub fn verify(signature: &[u8], message: &[u8], public_key: &[u8]) -> CryptoResult<()> {
        let pk = dilithium3::PublicKey::from_bytes(public_key).map_err(|_| CryptoError::IntegrityFailure)?;
        let sig = dilithium3::DetachedSignature::from_bytes(signature).map_err(|_| CryptoError::IntegrityFailure)?;
        dilithium3::verify_detached_signature(&sig, message, &pk).map_err(|_| CryptoError::IntegrityFailure)
    }
}

#[cfg(not(feature = "post-quantum"))]
mod imp {
    use zeroize::Zeroizing;

    use crate::error::{CryptoError, CryptoResult};

    fn unsupported<T>() -> CryptoResult<T> {
        Err(CryptoError::Unsupported(
            "built without the post-quantum feature".to_string(),
        ))
    }

    pub fn kem_keypair() -> CryptoResult<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        unsupported()
    }

    pub fn sign_keypair() -> CryptoResult<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        unsupported()
    }

    pub fn encapsulate(_public_key: &[u8]) -> CryptoResult<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        unsupported()
    }

    pub fn decapsulate(_kem_ciphertext: &[u8], _secret_key: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        unsupported()
    }

    pub fn sign(_message: &[u8], _secret_key: &[u8]) -> CryptoResult<Vec<u8>> {
        unsupported()
    }

    pub fn verify(_signature: &[u8], _message: &[u8], _public_key: &[u8]) -> CryptoResult<()> {
        unsupported()
    }
}

#[cfg(all(test, feature = "post-quantum"))]
mod tests {
    use super::*;
    use crate::crypto::envelope::KEM_CIPHERTEXT_LEN;
    use crate::error::CryptoError;

    #[test]
    fn test_kem_agreement() {
        let recipient = KemKeyPair::generate().unwrap();
        let (ss, ct) = encapsulate(&recipient.public_key).unwrap();
        assert_eq!(ct.len(), KEM_CIPHERTEXT_LEN);
        let recovered = decapsulate(&ct, &recipient.secret_key).unwrap();
        assert_eq!(ss.as_slice(), recovered.as_slice());
    }

    #[test]
    fn test_signature_rejects_other_message() {
        let signer = SigningKeyPair::generate().unwrap();
        let sig = sign(b"envelope", &signer.secret_key).unwrap();
        assert!(verify(&sig, b"envelope", &signer.public_key).is_ok());
        assert!(matches!(
            verify(&sig, b"envelopf", &signer.public_key),
            Err(CryptoError::IntegrityFailure)
        ));
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = fingerprint(b"pk");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint(b"pk"));
    }
}
