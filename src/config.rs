//! Volume configuration record: the persisted, immutable-after-creation
//! description of a volume's geometry and partition bindings (§3, §6).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One partition reference within a volume's configuration: a logical name
/// plus the provider endpoint that resolves it (via the DHT, externally).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionRef {
    pub name: String,
    pub provider: String,
}

/// The on-disk JSON record written atomically at volume creation and never
/// modified thereafter. Field names match the wire shape in §3 exactly
/// (`blockSize`, `blockCount`, `dataBlocks`, `codeBlocks`, `partitions`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeConfig {
    #[serde(rename = "blockSize")]
    pub block_size: usize,
    #[serde(rename = "blockCount")]
    pub block_count: u64,
    #[serde(rename = "dataBlocks")]
    pub data_count: u64,
    #[serde(rename = "codeBlocks")]
    pub code_count: u64,
    pub partitions: Vec<PartitionRef>,
}

impl VolumeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_count == 0 {
            return Err(Error::BadConfig("dataBlocks must be >= 1".into()));
        }
        if self.data_count + self.code_count > 256 {
            return Err(Error::BadConfig(
                "dataBlocks + codeBlocks must be <= 256".into(),
            ));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::BadConfig("blockSize must be a power of two".into()));
        }
        if self.block_size % 64 != 0 {
            return Err(Error::BadConfig("blockSize must be a multiple of 64".into()));
        }
        let expected = (self.data_count + self.code_count) as usize;
        if self.partitions.len() != expected {
            return Err(Error::BadConfig(format!(
                "expected {} partitions, found {}",
                expected,
                self.partitions.len()
            )));
        }
        Ok(())
    }

    /// Writes the config atomically: serialize to a sibling temp file, then
    /// rename over the destination so a crash mid-write never leaves a
    /// partially-written `volume.conf`.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::BadConfig(format!("failed to serialize config: {e}")))?;
        let tmp = tmp_path(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::BadConfig(format!("failed to create config dir: {e}")))?;
        }
        std::fs::write(&tmp, &json)
            .map_err(|e| Error::BadConfig(format!("failed to write config: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::BadConfig(format!("failed to commit config: {e}")))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::BadConfig(format!("failed to read config: {e}")))?;
        let config: VolumeConfig = serde_json::from_slice(&data)
            .map_err(|e| Error::BadConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// `<config-root>/<volume-name>/volume.conf` per §6.
    pub fn path_for(config_root: &Path, volume_name: &str) -> PathBuf {
        config_root.join(volume_name).join("volume.conf")
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Control-plane collaborator, specified only by its interface: given a
/// volume name, produce the in-memory config and (separately) create the
/// partitions backing a brand-new volume. DHT lookups, contract issuance
/// and storage reservation all live behind this trait, out of scope here.
pub trait Loader: Send + Sync {
    fn load(&self, name: &str) -> Result<VolumeConfig>;

    fn create_partitions(
        &self,
        name: &str,
        size: u64,
        data_count: u64,
        code_count: u64,
    ) -> Result<VolumeConfig>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> VolumeConfig {
        VolumeConfig {
            block_size: 65536,
            block_count: 16,
            data_count: 4,
            code_count: 2,
            partitions: (0..6)
                .map(|i| PartitionRef {
                    name: format!("p{i}"),
                    provider: format!("https://provider{i}.example"),
                })
                .collect(),
        }
    }

    #[test]
    fn validates_well_formed_config() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn rejects_partition_count_mismatch() {
        let mut cfg = sample_config();
        cfg.partitions.pop();
        assert!(matches!(cfg.validate(), Err(Error::BadConfig(_))));
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut cfg = sample_config();
        cfg.block_size = 1000;
        assert!(matches!(cfg.validate(), Err(Error::BadConfig(_))));
    }

    #[test]
    fn write_and_read_round_trip() {
        let dir = std::env::temp_dir().join(format!("stripevolume-cfg-test-{}", std::process::id()));
        let path = VolumeConfig::path_for(&dir, "vol1");
        let cfg = sample_config();
        cfg.write_atomic(&path).unwrap();
        let read_back = VolumeConfig::read(&path).unwrap();
        assert_eq!(cfg, read_back);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn wire_shape_field_names_match_spec() {
        let cfg = sample_config();
        let json = serde_json::to_value(&cfg).unwrap();
        assert!(json.get("blockSize").is_some());
        assert!(json.get("blockCount").is_some());
        assert!(json.get("dataBlocks").is_some());
        assert!(json.get("codeBlocks").is_some());
        assert!(json.get("partitions").is_some());
    }
}
