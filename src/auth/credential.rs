//! Client credential records

use super::AuthError;
use crate::crypto::{random_bytes, ClientKey, CryptoError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a client identity in bytes
pub const ID_LEN: usize = 16;

/// Length of a client secret in bytes
pub const SECRET_LEN: usize = 16;

/// Opaque 16-byte client identity, rendered as 32 hex characters
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId([u8; ID_LEN]);

impl ClientId {
    /// Generate a random identity with RFC 4122 version-4 bits set
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; ID_LEN];
        random_bytes(&mut bytes)?;
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for ClientId {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| AuthError::InvalidIdentity(e.to_string()))?;
        let bytes: [u8; ID_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            AuthError::InvalidIdentity(format!("expected {} bytes, got {}", ID_LEN, b.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.to_hex())
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 16-byte bearer token proving possession of an identity
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; SECRET_LEN];
        random_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison against a claimed secret
    pub fn verify(&self, claimed: &Secret) -> bool {
        self.0.ct_eq(&claimed.0).into()
    }
}

impl FromStr for Secret {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| AuthError::InvalidSecret)?;
        let bytes: [u8; SECRET_LEN] = bytes.try_into().map_err(|_| AuthError::InvalidSecret)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Full credential record, including the bearer secret and key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredential {
    pub id: ClientId,
    pub secret: Secret,
    pub key: ClientKey,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub bytes_up: u64,
    #[serde(default)]
    pub bytes_down: u64,
}

impl ClientCredential {
    /// Whether the credential may open a session at `now`
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        !self.blocked && now < self.expires_at
    }

    /// View without the secret and key
    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            id: self.id,
            created_at: self.created_at,
            expires_at: self.expires_at,
            blocked: self.blocked,
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
        }
    }
}

/// Redacted credential view for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: ClientId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub blocked: bool,
    pub bytes_up: u64,
    pub bytes_down: u64,
}
