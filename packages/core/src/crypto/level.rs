use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key_pool::{KeyPurpose, AES_SEED_LEN};

pub const ALG_OTP: &str = "OTP-XOR-HMAC-SHA256";
pub const ALG_AES: &str = "AES-256-GCM";
pub const ALG_PQC: &str = "KYBER768-AES-256-GCM";
pub const ALG_PQC_SIGNED: &str = "KYBER768-AES-256-GCM+DILITHIUM3";
pub const ALG_PLAIN: &str = "PLAIN";

/// The four protection levels, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SecurityLevel {
    /// One-time pad over QKD bytes
    Otp = 1,
    /// AES-256-GCM keyed from a QKD seed
    Aes = 2,
    /// Kyber768 encapsulation combined with a QKD seed
    Pqc = 3,
    /// No protection
    Plain = 4,
}

impl SecurityLevel {
    pub const ALL: [SecurityLevel; 4] = [
        SecurityLevel::Otp,
        SecurityLevel::Aes,
        SecurityLevel::Pqc,
        SecurityLevel::Plain,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            SecurityLevel::Otp => "Quantum Secure OTP",
            SecurityLevel::Aes => "Quantum-Aided AES",
            SecurityLevel::Pqc => "Post-Quantum Crypto",
            SecurityLevel::Plain => "No Security (Plain)",
        }
    }

    /// Key purpose and size drawn from the pool for a payload of `payload_len` bytes.
    pub fn key_requirement(self, payload_len: usize) -> Option<(KeyPurpose, usize)> {
        match self {
            SecurityLevel::Otp => Some((KeyPurpose::OtpSeed, payload_len)),
            SecurityLevel::Aes | SecurityLevel::Pqc => Some((KeyPurpose::AesSeed, AES_SEED_LEN)),
            SecurityLevel::Plain => None,
        }
    }
}

impl TryFrom<u8> for SecurityLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SecurityLevel::Otp),
            2 => Ok(SecurityLevel::Aes),
            3 => Ok(SecurityLevel::Pqc),
            4 => Ok(SecurityLevel::Plain),
            other => Err(format!("unknown security level {}", other)),
        }
    }
}

impl From<SecurityLevel> for u8 {
    fn from(level: SecurityLevel) -> Self {
        level.as_u8()
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {} ({})", self.as_u8(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_wire_value() {
        for level in SecurityLevel::ALL {
            assert_eq!(SecurityLevel::try_from(level.as_u8()), Ok(level));
        }
        assert!(SecurityLevel::try_from(0).is_err());
        assert!(SecurityLevel::try_from(5).is_err());
        assert_eq!(serde_json::to_string(&SecurityLevel::Pqc).unwrap(), "3");
        assert!(serde_json::from_str::<SecurityLevel>("9").is_err());
    }

    #[test]
    fn test_key_requirement() {
        assert_eq!(SecurityLevel::Otp.key_requirement(100), Some((KeyPurpose::OtpSeed, 100)));
        assert_eq!(SecurityLevel::Pqc.key_requirement(100), Some((KeyPurpose::AesSeed, 32)));
        assert_eq!(SecurityLevel::Plain.key_requirement(100), None);
    }
}
