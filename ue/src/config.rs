//! Configuration structures for the sidelink UE
//!
//! Loaded from YAML or TOML, chosen by file extension. Every field has a
//! default so an empty file (or no file at all) yields a working two-node
//! loopback setup.

use anyhow::{anyhow, Context};
use common::types::Bandwidth;
use layers::mac::MacConfig;
use layers::phy::{CombineSource, ResourcePoolConfig, SlPhyConfig, TxSchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SidelinkConfig {
    #[serde(default)]
    pub carrier: CarrierConfig,
    #[serde(default)]
    pub resource_pool: ResourcePoolConfig,
    #[serde(default)]
    pub phy: PhyConfig,
    #[serde(default)]
    pub mac: MacConfig,
    #[serde(default)]
    pub tx: TxSchedulerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Carrier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CarrierConfig {
    /// Channel bandwidth in MHz
    #[serde(default = "default_bandwidth_mhz")]
    pub bandwidth_mhz: f32,
}

fn default_bandwidth_mhz() -> f32 {
    5.0
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self { bandwidth_mhz: default_bandwidth_mhz() }
    }
}

/// PHY processing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhyConfig {
    /// Ticks processed concurrently
    #[serde(default = "default_nof_workers")]
    pub nof_workers: usize,
    /// Minimum PSCCH DMRS SNR in dB
    #[serde(default = "default_min_snr_db")]
    pub min_snr_db: f32,
    /// Buffer reported when fresh and combined both decode ("fresh" or "combined")
    #[serde(default)]
    pub combine_preference: CombineSource,
    #[serde(default)]
    pub crc_mask: u16,
    /// Sidelink synchronisation identity of the sync master
    #[serde(default)]
    pub sync_id: u16,
}

fn default_nof_workers() -> usize {
    4
}

fn default_min_snr_db() -> f32 {
    3.0
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            nof_workers: default_nof_workers(),
            min_snr_db: default_min_snr_db(),
            combine_preference: CombineSource::default(),
            crc_mask: 0,
            sync_id: 0,
        }
    }
}

/// Loopback simulation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Nodes sharing the loopback channel
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Subframes each node processes
    #[serde(default = "default_ticks")]
    pub ticks: u64,
    /// Per-dimension channel noise standard deviation
    #[serde(default)]
    pub noise_std: f32,
    #[serde(default = "default_random_phase")]
    pub random_phase: bool,
    /// How long a node waits for the others in one tick
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default)]
    pub seed: u64,
    /// Node sending the sync subframes, none when absent
    #[serde(default = "default_sync_master")]
    pub sync_master: Option<usize>,
    #[serde(default)]
    pub traffic: TrafficConfig,
}

fn default_nodes() -> usize {
    2
}

fn default_ticks() -> u64 {
    1000
}

fn default_random_phase() -> bool {
    true
}

fn default_receive_timeout_ms() -> u64 {
    2000
}

fn default_sync_master() -> Option<usize> {
    Some(0)
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            ticks: default_ticks(),
            noise_std: 0.0,
            random_phase: default_random_phase(),
            receive_timeout_ms: default_receive_timeout_ms(),
            seed: 0,
            sync_master: default_sync_master(),
            traffic: TrafficConfig::default(),
        }
    }
}

/// SDUs queued on every node before the simulation starts
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    #[serde(default = "default_sdus_per_node")]
    pub sdus_per_node: u64,
    #[serde(default = "default_sdu_size")]
    pub sdu_size: usize,
    #[serde(default = "default_lcid")]
    pub lcid: u8,
}

fn default_sdus_per_node() -> u64 {
    10
}

fn default_sdu_size() -> usize {
    64
}

fn default_lcid() -> u8 {
    3
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            sdus_per_node: default_sdus_per_node(),
            sdu_size: default_sdu_size(),
            lcid: default_lcid(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl SidelinkConfig {
    /// Load configuration from a YAML (`.yaml`, `.yml`) or TOML (`.toml`) file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            Some("toml") => Self::from_toml_str(&contents),
            _ => Err(anyhow!("Unsupported configuration format: {}", path.display())),
        }
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn bandwidth(&self) -> anyhow::Result<Bandwidth> {
        Bandwidth::from_mhz(self.carrier.bandwidth_mhz)
            .ok_or_else(|| anyhow!("Invalid bandwidth: {} MHz", self.carrier.bandwidth_mhz))
    }

    /// PHY configuration of node `sidelink_id`
    pub fn phy_config(&self, sidelink_id: u32) -> SlPhyConfig {
        SlPhyConfig {
            nof_workers: self.phy.nof_workers,
            min_snr_db: self.phy.min_snr_db,
            combine_preference: self.phy.combine_preference,
            crc_mask: self.phy.crc_mask,
            max_tbs: self.mac.max_tbs,
            sync_master: self.simulation.sync_master == Some(sidelink_id as usize),
            sync_id: self.phy.sync_id,
            pool: self.resource_pool.clone(),
            tx: TxSchedulerConfig {
                sidelink_id,
                ..self.tx.clone()
            },
        }
    }

    /// MAC configuration of node `sidelink_id`
    pub fn mac_config(&self, sidelink_id: u32) -> MacConfig {
        MacConfig {
            src_id: self.mac.src_id + sidelink_id,
            ..self.mac.clone()
        }
    }

    /// Check what the layers cannot check on their own
    pub fn validate(&self) -> anyhow::Result<()> {
        let nof_prb = self.bandwidth()?.nof_prb();
        self.resource_pool.validate(nof_prb)?;

        let nodes = self.simulation.nodes;
        if nodes == 0 {
            return Err(anyhow!("Simulation needs at least one node"));
        }
        if nodes as u32 > self.tx.node_count {
            return Err(anyhow!(
                "{} nodes do not fit a transmit group of {}",
                nodes,
                self.tx.node_count
            ));
        }
        if let Some(master) = self.simulation.sync_master {
            if master >= nodes {
                return Err(anyhow!("Sync master {} is not one of the {} nodes", master, nodes));
            }
        }
        for id in 0..nodes as u32 {
            self.phy_config(id).tx.validate()?;
        }
        if self.simulation.traffic.sdu_size == 0 {
            return Err(anyhow!("SDU size must be positive"));
        }
        Ok(())
    }
}
