//! Tests for the encryption engine
//!
//! This test suite covers:
//! - Round trips at every security level, including empty messages
//! - Tamper detection on ciphertext, tag, KEM ciphertext and header
//! - The one-time pad length invariant
//! - One-time keys: a level 1 message reads exactly once
//! - Envelope wire codec

use std::sync::Arc;

use proptest::prelude::*;
use qumail_core::config::{PoolConfig, RetryPolicy};
use qumail_core::crypto::engine::{open, seal};
use qumail_core::crypto::{DecryptionKeys, EncryptionEngine, SecurityEnvelope, SecurityLevel};
use qumail_core::error::CryptoError;
use qumail_core::key_pool::{KeyMaterial, KeyPool, KeyPurpose, KeyState, PeerId};
use qumail_core::lifecycle::KeyLifecycleTracker;
use qumail_core::protocol::{pack_envelope, unpack_envelope};

fn setup() -> (Arc<KeyPool>, EncryptionEngine) {
    let pool = Arc::new(KeyPool::new(PoolConfig::default()));
    let tracker = KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none());
    (pool, EncryptionEngine::new(tracker))
}

fn bob() -> PeerId {
    PeerId::new("bob@example.com")
}

fn material(purpose: KeyPurpose, bytes: Vec<u8>) -> KeyMaterial {
    let now = chrono::Utc::now();
    KeyMaterial::new(
        uuid::Uuid::new_v4(),
        bob(),
        purpose,
        now,
        now + chrono::Duration::hours(1),
        bytes,
    )
}

/// Test that levels 1 and 2 round-trip through the key pool
#[tokio::test]
async fn test_round_trip_levels_one_and_two() {
    let (_pool, engine) = setup();
    let message = b"Quantum keys protect this email body.";

    for level in [SecurityLevel::Otp, SecurityLevel::Aes] {
        let envelope = engine.encrypt(level, &bob(), message, None).await.unwrap();
        assert_eq!(envelope.security_level, level);
        assert_ne!(envelope.ciphertext.as_slice(), message.as_slice());

        let plaintext = engine.decrypt(&envelope, &DecryptionKeys::none()).await.unwrap();
        assert_eq!(plaintext.as_slice(), message, "round trip failed at {}", level);
    }
}

/// Test that level 4 is an identity transform with no key material
#[tokio::test]
async fn test_plain_passthrough() {
    let (pool, engine) = setup();
    let envelope = engine.encrypt(SecurityLevel::Plain, &bob(), b"hi", None).await.unwrap();
    assert_eq!(envelope.ciphertext, b"hi");
    assert!(envelope.key_id.is_none());
    assert_eq!(pool.stats().total_allocated, 0);

    let plaintext = engine.decrypt(&envelope, &DecryptionKeys::none()).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"hi");
}

/// Test that empty messages are supported at levels 1 and 2
#[tokio::test]
async fn test_empty_message() {
    let (_pool, engine) = setup();
    for level in [SecurityLevel::Otp, SecurityLevel::Aes] {
        let envelope = engine.encrypt(level, &bob(), b"", None).await.unwrap();
        assert!(envelope.ciphertext.is_empty());
        let plaintext = engine.decrypt(&envelope, &DecryptionKeys::none()).await.unwrap();
        assert!(plaintext.is_empty());
    }
}

/// Test that a level 1 message can be decrypted only once
#[tokio::test]
async fn test_one_time_message_reads_once() {
    let (pool, engine) = setup();
    let envelope = engine.encrypt(SecurityLevel::Otp, &bob(), b"burn after reading", None).await.unwrap();
    let key_id = envelope.key_id.unwrap();
    assert_eq!(pool.key_state(key_id), Some(KeyState::Retained));

    let first = engine.decrypt(&envelope, &DecryptionKeys::none()).await.unwrap();
    assert_eq!(first.as_slice(), b"burn after reading");
    assert_eq!(pool.key_state(key_id), Some(KeyState::Consumed));

    let second = engine.decrypt(&envelope, &DecryptionKeys::none()).await;
    assert!(matches!(second, Err(CryptoError::KeyUnavailableForDecrypt(id)) if id == key_id));
}

/// Test that a level 1 message is unreadable from another process once consumed
#[tokio::test]
async fn test_one_time_message_unreadable_after_consume_elsewhere() {
    let pool = Arc::new(KeyPool::new(PoolConfig::default()));
    let sender = EncryptionEngine::new(KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none()));
    let first_reader = EncryptionEngine::new(KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none()));
    let second_reader = EncryptionEngine::new(KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none()));

    let envelope = sender.encrypt(SecurityLevel::Otp, &bob(), b"once", None).await.unwrap();
    assert!(first_reader.decrypt(&envelope, &DecryptionKeys::none()).await.is_ok());
    assert!(matches!(
        second_reader.decrypt(&envelope, &DecryptionKeys::none()).await,
        Err(CryptoError::KeyUnavailableForDecrypt(_))
    ));
}

/// Test that level 2 keys stay usable for repeated decryption
#[tokio::test]
async fn test_reusable_key_decrypts_repeatedly() {
    let (pool, engine) = setup();
    let envelope = engine.encrypt(SecurityLevel::Aes, &bob(), b"archived", None).await.unwrap();
    for _ in 0..3 {
        let plaintext = engine.decrypt(&envelope, &DecryptionKeys::none()).await.unwrap();
        assert_eq!(plaintext.as_slice(), b"archived");
    }
    assert_eq!(pool.key_state(envelope.key_id.unwrap()), Some(KeyState::Retained));
}

/// Test that ciphertext or tag tampering fails closed without burning the key
#[tokio::test]
async fn test_tamper_detection_does_not_consume() {
    let (pool, engine) = setup();
    for level in [SecurityLevel::Otp, SecurityLevel::Aes] {
        let envelope = engine.encrypt(level, &bob(), b"integrity matters", None).await.unwrap();

        let mut flipped = envelope.clone();
        flipped.ciphertext[0] ^= 0x01;
        assert!(matches!(
            engine.decrypt(&flipped, &DecryptionKeys::none()).await,
            Err(CryptoError::IntegrityFailure)
        ));

        let mut bad_tag = envelope.clone();
        if let Some(tag) = bad_tag.tag.as_mut() {
            tag[0] ^= 0x80;
        }
        assert!(matches!(
            engine.decrypt(&bad_tag, &DecryptionKeys::none()).await,
            Err(CryptoError::IntegrityFailure)
        ));

        assert_eq!(pool.key_state(envelope.key_id.unwrap()), Some(KeyState::Retained));
        let plaintext = engine.decrypt(&envelope, &DecryptionKeys::none()).await.unwrap();
        assert_eq!(plaintext.as_slice(), b"integrity matters");
    }
}

/// Test that a forged header fails before any plaintext is released
#[tokio::test]
async fn test_header_tamper_is_rejected() {
    let (_pool, engine) = setup();
    let envelope = engine.encrypt(SecurityLevel::Aes, &bob(), b"header bound", None).await.unwrap();

    let mut forged = envelope.clone();
    forged.key_id = Some(uuid::Uuid::new_v4());
    let err = engine.decrypt(&forged, &DecryptionKeys::none()).await.unwrap_err();
    assert!(matches!(err, CryptoError::KeyUnavailableForDecrypt(_)));

    let mut forged = envelope;
    forged.security_level = SecurityLevel::Otp;
    let err = engine.decrypt(&forged, &DecryptionKeys::none()).await.unwrap_err();
    assert!(matches!(err, CryptoError::MalformedEnvelope(_)));
}

/// Test that the pad must be exactly as long as the message
#[test]
fn test_otp_length_invariant() {
    let short = material(KeyPurpose::OtpSeed, vec![0xAA; 4]);
    let err = seal(SecurityLevel::Otp, Some(&short), None, None, b"hello").unwrap_err();
    assert!(matches!(err, CryptoError::MalformedEnvelope(_)));

    let exact = material(KeyPurpose::OtpSeed, vec![0xAA; 5]);
    let envelope = seal(SecurityLevel::Otp, Some(&exact), None, None, b"hello").unwrap();

    let long = KeyMaterial::new(
        exact.key_id,
        bob(),
        KeyPurpose::OtpSeed,
        exact.created_at,
        exact.expires_at,
        vec![0xAA; 6],
    );
    let err = open(&envelope, Some(&long), &DecryptionKeys::none()).unwrap_err();
    assert!(matches!(err, CryptoError::MalformedEnvelope(_)));
}

/// Test that a failed encryption returns the leased key to the pool
#[tokio::test]
async fn test_failed_level_three_send_leaks_nothing() {
    let (pool, engine) = setup();
    let err = engine.encrypt(SecurityLevel::Pqc, &bob(), b"no key", None).await.unwrap_err();
    assert!(matches!(err, CryptoError::MissingRecipientKey(_)));
    assert_eq!(pool.stats().total_allocated, 0);

    // a malformed recipient key fails after acquisition and must release it
    let result = engine.encrypt(SecurityLevel::Pqc, &bob(), b"bad key", Some(&[1u8, 2, 3][..])).await;
    assert!(result.is_err());
    let stats = pool.stats();
    assert_eq!(stats.total_allocated, 1);
    assert_eq!(stats.total_released, 1);
    assert_eq!(pool.status(Some(&bob())).key_count, 0);
}

/// Test the level 3 hybrid round trip, signed and unsigned
#[cfg(feature = "post-quantum")]
#[tokio::test]
async fn test_round_trip_level_three() {
    use qumail_core::crypto::{KemKeyPair, SigningKeyPair};

    let recipient = KemKeyPair::generate().unwrap();
    let pool = Arc::new(KeyPool::new(PoolConfig::default()));
    let tracker = KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none());
    let signer = SigningKeyPair::generate().unwrap();
    let sender_key = signer.public_key.clone();
    let engine = EncryptionEngine::new(tracker).with_signer(signer);

    let envelope = engine
        .encrypt(SecurityLevel::Pqc, &bob(), b"post-quantum hello", Some(&recipient.public_key))
        .await
        .unwrap();
    assert!(envelope.signature.is_some());
    assert_eq!(envelope.kem_ciphertext.as_ref().map(Vec::len), Some(1088));

    let keys = DecryptionKeys::none()
        .with_kem_secret(&recipient.secret_key)
        .with_sender_key(&sender_key);
    let plaintext = engine.decrypt(&envelope, &keys).await.unwrap();
    assert_eq!(plaintext.as_slice(), b"post-quantum hello");

    // wrong recipient secret derives a different key
    let stranger = KemKeyPair::generate().unwrap();
    let wrong = DecryptionKeys::none()
        .with_kem_secret(&stranger.secret_key)
        .with_sender_key(&sender_key);
    assert!(matches!(engine.decrypt(&envelope, &wrong).await, Err(CryptoError::IntegrityFailure)));

    // tampered signature
    let mut forged = envelope.clone();
    if let Some(sig) = forged.signature.as_mut() {
        sig[0] ^= 0x01;
    }
    assert!(matches!(engine.decrypt(&forged, &keys).await, Err(CryptoError::IntegrityFailure)));

    // unsigned engine
    let unsigned = EncryptionEngine::new(KeyLifecycleTracker::new(pool, RetryPolicy::none()));
    let envelope = unsigned
        .encrypt(SecurityLevel::Pqc, &bob(), b"", Some(&recipient.public_key))
        .await
        .unwrap();
    assert!(envelope.signature.is_none());
    let keys = DecryptionKeys::none().with_kem_secret(&recipient.secret_key);
    assert!(unsigned.decrypt(&envelope, &keys).await.unwrap().is_empty());
}

/// Test that level 3 tampering fails closed on signed and unsigned envelopes
#[cfg(feature = "post-quantum")]
#[tokio::test]
async fn test_level_three_tamper_detection() {
    use qumail_core::crypto::{KemKeyPair, SigningKeyPair};

    let recipient = KemKeyPair::generate().unwrap();
    let signer = SigningKeyPair::generate().unwrap();
    let sender_key = signer.public_key.clone();
    let (pool, unsigned) = setup();
    let signed = EncryptionEngine::new(KeyLifecycleTracker::new(pool.clone(), RetryPolicy::none())).with_signer(signer);

    for engine in [&signed, &unsigned] {
        let envelope = engine
            .encrypt(SecurityLevel::Pqc, &bob(), b"quantum safe", Some(&recipient.public_key))
            .await
            .unwrap();
        let keys = DecryptionKeys::none()
            .with_kem_secret(&recipient.secret_key)
            .with_sender_key(&sender_key);

        let mut flipped = envelope.clone();
        flipped.ciphertext[0] ^= 0x01;
        let mut bad_tag = envelope.clone();
        if let Some(tag) = bad_tag.tag.as_mut() {
            tag[0] ^= 0x80;
        }
        let mut bad_kem = envelope.clone();
        if let Some(kem) = bad_kem.kem_ciphertext.as_mut() {
            kem[0] ^= 0x01;
        }

        for tampered in [&flipped, &bad_tag, &bad_kem] {
            assert!(matches!(
                engine.decrypt(tampered, &keys).await,
                Err(CryptoError::IntegrityFailure)
            ));
        }

        assert_eq!(pool.key_state(envelope.key_id.unwrap()), Some(KeyState::Retained));
        let plaintext = engine.decrypt(&envelope, &keys).await.unwrap();
        assert_eq!(plaintext.as_slice(), b"quantum safe");
    }
}

/// Test that an envelope survives the MessagePack wire codec
#[tokio::test]
async fn test_envelope_wire_round_trip() {
    let (_pool, engine) = setup();
    let envelope = engine.encrypt(SecurityLevel::Aes, &bob(), b"over the wire", None).await.unwrap();
    let packed = pack_envelope(&envelope).unwrap();
    let unpacked: SecurityEnvelope = unpack_envelope(&packed).unwrap();
    assert_eq!(unpacked, envelope);
    assert_eq!(
        engine.decrypt(&unpacked, &DecryptionKeys::none()).await.unwrap().as_slice(),
        b"over the wire"
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Round trip holds for arbitrary plaintext at levels 1 and 2
    #[test]
    fn prop_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..512), aes in any::<bool>()) {
        let (level, purpose, len) = if aes {
            (SecurityLevel::Aes, KeyPurpose::AesSeed, 32)
        } else {
            (SecurityLevel::Otp, KeyPurpose::OtpSeed, plaintext.len())
        };
        let key = material(purpose, (0..len).map(|i| (i * 31 + 7) as u8).collect());
        let envelope = seal(level, Some(&key), None, None, &plaintext).unwrap();
        let opened = open(&envelope, Some(&key), &DecryptionKeys::none()).unwrap();
        prop_assert_eq!(opened.as_slice(), plaintext.as_slice());
    }

    /// Any single flipped bit in ciphertext or tag is detected
    #[test]
    fn prop_single_bit_tamper(plaintext in proptest::collection::vec(any::<u8>(), 1..128), bit in any::<usize>(), aes in any::<bool>()) {
        let (level, purpose, len) = if aes {
            (SecurityLevel::Aes, KeyPurpose::AesSeed, 32)
        } else {
            (SecurityLevel::Otp, KeyPurpose::OtpSeed, plaintext.len())
        };
        let key = material(purpose, vec![0x5A; len]);
        let envelope = seal(level, Some(&key), None, None, &plaintext).unwrap();

        let tag_len = envelope.tag.as_ref().map(Vec::len).unwrap_or(0);
        let total_bits = (envelope.ciphertext.len() + tag_len) * 8;
        let bit = bit % total_bits;
        let mut tampered = envelope.clone();
        if bit / 8 < tampered.ciphertext.len() {
            tampered.ciphertext[bit / 8] ^= 1 << (bit % 8);
        } else if let Some(tag) = tampered.tag.as_mut() {
            let idx = bit / 8 - envelope.ciphertext.len();
            tag[idx] ^= 1 << (bit % 8);
        }
        let result = open(&tampered, Some(&key), &DecryptionKeys::none());
        prop_assert!(matches!(result, Err(CryptoError::IntegrityFailure)), "bit {} not detected", bit);
    }
}
