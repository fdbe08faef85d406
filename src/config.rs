use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use das_sim_core::DasConfig;

/// Complete simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network and workload shape
    pub simulation: SimulationConfig,
    /// Reputation and sampling tunables shared by every node
    pub das: DasConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed of every random choice in the run
    pub seed: u64,
    /// Number of nodes, builder excluded
    pub nodes: usize,
    /// How many of the nodes are validators
    pub validators: usize,
    /// Fraction of nodes withholding samples
    pub malicious_fraction: f64,
    /// Fraction of nodes that never answer
    pub down_fraction: f64,
    /// Width of the keyspace in bits
    pub key_bits: u32,
    /// Rows (and columns) of each block
    pub block_size: u32,
    /// Number of blocks announced
    pub blocks: u64,
    /// Logical time between blocks
    pub block_interval: u64,
    /// Delay between the builder and the other nodes learning a block
    pub block_propagation_delay: u64,
    /// Message latency bounds
    pub min_latency: u64,
    pub max_latency: u64,
    /// Direct neighbours each node starts with
    pub bootstrap_neighbours: usize,
    /// Stop processing events after this time (0 = run to quiescence)
    pub end_time: u64,
    /// Write the summaries of running operations too
    pub include_unfinished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level
    pub level: String,
    /// Enable JSON logging
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            das: DasConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            nodes: 200,
            validators: 40,
            malicious_fraction: 0.0,
            down_fraction: 0.0,
            key_bits: 256,
            block_size: 32,
            blocks: 3,
            block_interval: 12_000, // 12s slots in ms
            block_propagation_delay: 4_000,
            min_latency: 50,
            max_latency: 150,
            bootstrap_neighbours: 50,
            end_time: 0,
            include_unfinished: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, content)
            .context("Failed to write configuration file")?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let sim = &self.simulation;

        if sim.nodes == 0 {
            anyhow::bail!("nodes must be greater than 0");
        }

        if sim.validators > sim.nodes {
            anyhow::bail!("validators ({}) cannot exceed nodes ({})", sim.validators, sim.nodes);
        }

        for (name, fraction) in [("malicious_fraction", sim.malicious_fraction), ("down_fraction", sim.down_fraction)] {
            if !(0.0..=1.0).contains(&fraction) {
                anyhow::bail!("{} must be between 0 and 1", name);
            }
        }

        if sim.key_bits == 0 || sim.key_bits > 256 {
            anyhow::bail!("key_bits must be between 1 and 256");
        }

        if sim.block_size == 0 {
            anyhow::bail!("block_size must be greater than 0");
        }

        // The grid needs one distinct key per sample.
        let samples = u64::from(sim.block_size) * u64::from(sim.block_size);
        if sim.key_bits < 64 && samples > (1u64 << sim.key_bits) - 1 {
            anyhow::bail!("{} samples do not fit in a {}-bit keyspace", samples, sim.key_bits);
        }

        // Every node and the builder need a distinct id.
        if sim.key_bits < 64 && sim.nodes as u64 + 1 > 1u64 << sim.key_bits {
            anyhow::bail!(
                "{} nodes and the builder do not fit in a {}-bit keyspace",
                sim.nodes,
                sim.key_bits
            );
        }

        if sim.min_latency > sim.max_latency {
            anyhow::bail!("min_latency cannot exceed max_latency");
        }

        if sim.blocks > 0 && sim.block_interval == 0 {
            anyhow::bail!("block_interval must be greater than 0");
        }

        self.das.validate().context("Invalid [das] section")?;

        Ok(())
    }

    /// Get configuration for a named scenario
    pub fn for_scenario(scenario: &str) -> Result<Self> {
        let mut config = Config::default();

        match scenario.to_lowercase().as_str() {
            "default" => {}
            "small" => {
                config.simulation.nodes = 40;
                config.simulation.validators = 8;
                config.simulation.block_size = 8;
                config.simulation.blocks = 1;
                config.simulation.bootstrap_neighbours = 20;
                config.das.num_samples = 16;
            }
            "adversarial" => {
                config.simulation.malicious_fraction = 0.3;
                config.simulation.down_fraction = 0.05;
                config.das.purge_defunct = true;
            }
            "insecure" => {
                config.simulation.malicious_fraction = 0.3;
                config.das.security_active = false;
            }
            _ => anyhow::bail!("Unknown scenario: {}", scenario),
        }

        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("das-sim.toml")
    }
}
