use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "utxo-chain.json";

const GENESIS_COINBASE_DATA: &str = "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of the block store
    pub data_dir: PathBuf,

    /// Proof of work difficulty used when creating a chain
    pub target_bits: u32,

    /// Data stored in the genesis coinbase input
    pub genesis_message: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/blockchain"),
            target_bits: 16,
            genesis_message: GENESIS_COINBASE_DATA.to_string(),
        }
    }
}

impl Config {
    /// Loads the config from `path`, or from [`DEFAULT_CONFIG_FILE`] if it exists,
    /// falling back to defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.target_bits < 256,
            "target_bits must be below 256, got {}",
            self.target_bits
        );
        Ok(())
    }
}
