// src/services/fingerprint.rs
//! Fixed-size content digests used as an equality proxy for normalized text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl FingerprintAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintAlgorithm::Blake3 => "blake3",
            FingerprintAlgorithm::Sha256 => "sha256",
        }
    }
}

impl FromStr for FingerprintAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blake3" => Ok(FingerprintAlgorithm::Blake3),
            "sha256" => Ok(FingerprintAlgorithm::Sha256),
            other => Err(format!("unknown fingerprint algorithm {other:?}")),
        }
    }
}

/// `<algorithm>:<64 hex chars>` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint {
    algorithm: FingerprintAlgorithm,
    digest: [u8; 32],
}

impl Fingerprint {
    pub fn compute(algorithm: FingerprintAlgorithm, bytes: &[u8]) -> Self {
        let digest = match algorithm {
            FingerprintAlgorithm::Blake3 => *blake3::hash(bytes).as_bytes(),
            FingerprintAlgorithm::Sha256 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&Sha256::digest(bytes));
                out
            }
        };
        Self { algorithm, digest }
    }

    pub fn algorithm(&self) -> FingerprintAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex_part) = s
            .split_once(':')
            .ok_or_else(|| format!("fingerprint {s:?} lacks an algorithm prefix"))?;
        let algorithm = algo.parse::<FingerprintAlgorithm>()?;
        let bytes = hex::decode(hex_part).map_err(|e| format!("fingerprint hex: {e}"))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("fingerprint digest must be 32 bytes, got {}", b.len()))?;
        Ok(Self { algorithm, digest })
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
