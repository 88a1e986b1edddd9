use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::TransferError;

/// Checksum algorithms accepted for transfer verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl FromStr for ChecksumAlgorithm {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(TransferError::Configuration(format!(
                "unsupported checksum algorithm: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Sha1 => write!(f, "sha1"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

/// Streaming hasher over the configured algorithm.
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    /// Consumes the hasher and returns the hex-encoded digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Computes the checksum of an entire file with the given algorithm.
pub async fn file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_algorithms() {
        assert_eq!(
            "md5".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Md5
        );
        assert_eq!(
            "SHA1".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Sha1
        );
        assert_eq!(
            "sha256".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Sha256
        );
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let err = "crc32".parse::<ChecksumAlgorithm>().unwrap_err();
        assert!(matches!(err, TransferError::Configuration(_)));
    }

    #[test]
    fn display_round_trips() {
        for algo in [
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha1,
            ChecksumAlgorithm::Sha256,
        ] {
            assert_eq!(algo.to_string().parse::<ChecksumAlgorithm>().unwrap(), algo);
        }
    }

    #[test]
    fn known_digests_of_abc() {
        let input = b"abc";

        let mut md5 = Hasher::new(ChecksumAlgorithm::Md5);
        md5.update(input);
        assert_eq!(md5.finalize_hex(), "900150983cd24fb0d6963f7d28e17f72");

        let mut sha1 = Hasher::new(ChecksumAlgorithm::Sha1);
        sha1.update(input);
        assert_eq!(sha1.finalize_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");

        let mut sha256 = Hasher::new(ChecksumAlgorithm::Sha256);
        sha256.update(input);
        assert_eq!(
            sha256.finalize_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_update_matches_single_shot() {
        let mut split = Hasher::new(ChecksumAlgorithm::Sha256);
        split.update(b"hello ");
        split.update(b"world");

        let mut whole = Hasher::new(ChecksumAlgorithm::Sha256);
        whole.update(b"hello world");

        assert_eq!(split.finalize_hex(), whole.finalize_hex());
    }

    #[tokio::test]
    async fn file_checksum_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut hasher = Hasher::new(ChecksumAlgorithm::Sha256);
        hasher.update(&data);
        let expected = hasher.finalize_hex();

        let actual = file_checksum(&path, ChecksumAlgorithm::Sha256)
            .await
            .unwrap();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn file_checksum_missing_file_is_io_error() {
        let err = file_checksum(Path::new("/nonexistent/file"), ChecksumAlgorithm::Md5)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
