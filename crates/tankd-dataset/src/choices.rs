//! Values offered for dataset properties.

use crate::service::DatasetService;
use serde_json::{Map, Value};
use tankd_core::size::{format_block_size, KIB, MIB};
use tankd_core::{Result, TankdError};

pub const ENCRYPTION_ALGORITHMS: &[&str] = &[
    "AES-128-CCM",
    "AES-192-CCM",
    "AES-256-CCM",
    "AES-128-GCM",
    "AES-192-GCM",
    "AES-256-GCM",
];

pub const CHECKSUM_CHOICES: &[&str] = &[
    "ON", "FLETCHER2", "FLETCHER4", "SHA256", "SHA512", "SKEIN", "EDONR", "BLAKE3",
];

const BASE_COMPRESSION: &[&str] = &[
    "OFF", "LZ4", "GZIP", "GZIP-1", "GZIP-9", "ZSTD", "ZSTD-FAST", "ZLE", "LZJB",
];

const MIN_RECORDSIZE: u64 = 512;
const MAX_RECORDSIZE: u64 = 16 * MIB;
const DRAID_MIN_RECORDSIZE: u64 = 128 * KIB;

/// Every compression algorithm ZFS accepts, in display order
pub fn compression_algorithms() -> Vec<String> {
    let mut out: Vec<String> = BASE_COMPRESSION.iter().map(|s| s.to_string()).collect();
    out.extend((1..=19).map(|level| format!("ZSTD-{}", level)));
    let fast_levels = (1..=10).chain((20..=100).step_by(10)).chain([500, 1000]);
    out.extend(fast_levels.map(|level| format!("ZSTD-FAST-{}", level)));
    out
}

/// Compression choices keyed by themselves
pub fn compression_choices() -> Map<String, Value> {
    compression_algorithms()
        .into_iter()
        .map(|c| (c.clone(), Value::String(c)))
        .collect()
}

/// Powers of two from 512 bytes to 16M; dRAID pools start at 128K
pub fn recordsize_choices(is_draid: bool) -> Vec<String> {
    let min = if is_draid {
        DRAID_MIN_RECORDSIZE
    } else {
        MIN_RECORDSIZE
    };
    std::iter::successors(Some(min), |size| Some(size * 2))
        .take_while(|size| *size <= MAX_RECORDSIZE)
        .map(format_block_size)
        .collect()
}

/// Block size suggested for a new zvol
pub fn recommended_zvol_blocksize(is_draid: bool) -> &'static str {
    if is_draid {
        "128K"
    } else {
        "16K"
    }
}

pub fn is_valid_encryption_algorithm(algorithm: &str) -> bool {
    ENCRYPTION_ALGORITHMS
        .iter()
        .any(|a| a.eq_ignore_ascii_case(algorithm))
}

impl DatasetService {
    pub fn checksum_choices(&self) -> Vec<String> {
        CHECKSUM_CHOICES.iter().map(|s| s.to_string()).collect()
    }

    pub fn compression_choices(&self) -> Map<String, Value> {
        compression_choices()
    }

    pub fn encryption_algorithm_choices(&self) -> Vec<String> {
        ENCRYPTION_ALGORITHMS.iter().map(|s| s.to_string()).collect()
    }

    /// Whether `pool` is a dRAID pool
    pub(crate) async fn pool_is_draid(&self, pool: &str) -> Result<bool> {
        let pool = pool.to_string();
        self.executor
            .run(move |zfs| match zfs.pool_info(&pool) {
                Ok(info) => Ok(info.is_draid),
                Err(e) if e.is_not_found() => {
                    Err(TankdError::not_found(format!("\"{}\" not found.", pool)))
                }
                Err(e) => Err(TankdError::from(e)),
            })
            .await
    }

    pub async fn recordsize_choices(&self, pool: Option<&str>) -> Result<Vec<String>> {
        let is_draid = match pool {
            Some(pool) => self.pool_is_draid(pool).await?,
            None => false,
        };
        Ok(recordsize_choices(is_draid))
    }

    pub async fn recommended_zvol_blocksize(&self, pool: &str) -> Result<String> {
        let is_draid = self.pool_is_draid(pool).await?;
        Ok(recommended_zvol_blocksize(is_draid).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::harness;
    use tankd_core::ErrorKind;

    #[test]
    fn test_compression_choices() {
        let all = compression_algorithms();
        assert_eq!(all[0], "OFF");
        assert!(all.contains(&"ZSTD-19".to_string()));
        assert!(all.contains(&"ZSTD-FAST-1000".to_string()));
        assert!(!all.contains(&"ZSTD-20".to_string()));
        assert_eq!(all.len(), 9 + 19 + 10 + 9 + 2);
        assert_eq!(compression_choices()["LZ4"], "LZ4");
    }

    #[test]
    fn test_recordsize_choices() {
        let choices = recordsize_choices(false);
        assert_eq!(choices.first().map(String::as_str), Some("512"));
        assert_eq!(choices.last().map(String::as_str), Some("16M"));
        assert!(choices.contains(&"128K".to_string()));
        assert_eq!(choices.len(), 16);

        let draid = recordsize_choices(true);
        assert_eq!(draid.first().map(String::as_str), Some("128K"));
        assert!(!draid.contains(&"64K".to_string()));
    }

    #[test]
    fn test_encryption_algorithm_lookup() {
        assert!(is_valid_encryption_algorithm("aes-256-gcm"));
        assert!(!is_valid_encryption_algorithm("AES-512-GCM"));
        assert_eq!(recommended_zvol_blocksize(true), "128K");
        assert_eq!(recommended_zvol_blocksize(false), "16K");
    }

    #[tokio::test]
    async fn test_pool_dependent_choices() {
        let h = harness();
        assert_eq!(h.service.recommended_zvol_blocksize("tank").await.unwrap(), "16K");
        h.zfs.set_draid("tank", true);
        assert_eq!(h.service.recommended_zvol_blocksize("tank").await.unwrap(), "128K");
        let sizes = h.service.recordsize_choices(Some("tank")).await.unwrap();
        assert_eq!(sizes.first().map(String::as_str), Some("128K"));
        assert_eq!(h.service.recordsize_choices(None).await.unwrap().len(), 16);

        let err = h.service.recommended_zvol_blocksize("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(h.service.checksum_choices()[0], "ON");
        assert_eq!(h.service.encryption_algorithm_choices().len(), 6);
        assert!(h.service.compression_choices().contains_key("ZSTD-FAST"));
    }
}
