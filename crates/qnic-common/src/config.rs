//! NIC Configuration
//!
//! Startup parameters for one interface. Defaults follow the reference
//! bench build (32-entry operation tables, 9214 byte frames, 256-entry
//! indirection table).

use crate::error::{DatapathError, DatapathResult};
use serde::{Deserialize, Serialize};

/// Interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NicConfig {
    /// Physical ports served by this interface
    pub num_ports: u16,
    /// Number of TX queues
    pub tx_queues: u32,
    /// Number of RX queues
    pub rx_queues: u32,
    /// Number of completion queues
    pub completion_queues: u32,
    /// Number of event queues
    pub event_queues: u32,
    /// TX operation table capacity (in-flight descriptors)
    pub tx_op_table_size: usize,
    /// RX operation table capacity
    pub rx_op_table_size: usize,
    /// Largest frame the TX engine will fetch
    pub max_tx_size: u32,
    /// Largest frame the RX engine will accept
    pub max_rx_size: u32,
    /// Frames buffered between transport and RX engine
    pub rx_fifo_depth: usize,
    /// log2 of the per-port indirection table length
    pub indir_table_log2: u8,
    /// Bytes skipped before the receive checksum starts (L2 header)
    pub rx_checksum_skip: usize,
    /// Global TX checksum offload toggle
    pub checksum_enable: bool,
    /// Global RSS toggle (off = static offset mapping everywhere)
    pub rss_enable: bool,
    /// Receive hash settings
    pub rss_hash: HashConfig,
    /// Backpressure retry policy
    pub retry: RetryPolicy,
    /// Worker pool sizing
    pub workers: WorkerConfig,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            num_ports: 1,
            tx_queues: 32,
            rx_queues: 8,
            completion_queues: 40,
            event_queues: 4,
            tx_op_table_size: 32,
            rx_op_table_size: 32,
            max_tx_size: 9214,
            max_rx_size: 9214,
            rx_fifo_depth: 128,
            indir_table_log2: 8,
            rx_checksum_skip: 14,
            checksum_enable: true,
            rss_enable: true,
            rss_hash: HashConfig::default(),
            retry: RetryPolicy::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl NicConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tracing::debug!(path, tx = config.tx_queues, rx = config.rx_queues, "loaded nic config");
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Check structural limits
    pub fn validate(&self) -> DatapathResult<()> {
        if self.num_ports == 0 {
            return Err(DatapathError::InvalidConfig("at least one port required".into()));
        }
        if self.tx_queues == 0 || self.rx_queues == 0 {
            return Err(DatapathError::InvalidConfig("queue counts must be non-zero".into()));
        }
        if self.tx_queues > u16::MAX as u32 || self.rx_queues > u16::MAX as u32 {
            return Err(DatapathError::InvalidConfig(
                "queue indices must fit the 16-bit completion field".into(),
            ));
        }
        if self.completion_queues == 0 || self.event_queues == 0 {
            return Err(DatapathError::InvalidConfig(
                "completion and event queue counts must be non-zero".into(),
            ));
        }
        if self.tx_op_table_size == 0 || self.rx_op_table_size == 0 {
            return Err(DatapathError::InvalidConfig("operation tables need capacity".into()));
        }
        if self.tx_op_table_size > u16::MAX as usize || self.rx_op_table_size > u16::MAX as usize {
            return Err(DatapathError::InvalidConfig("operation table tags are 16-bit".into()));
        }
        if self.indir_table_log2 > 16 {
            return Err(DatapathError::InvalidConfig(format!(
                "indirection table 2^{} too large",
                self.indir_table_log2
            )));
        }
        if self.rx_fifo_depth == 0 {
            return Err(DatapathError::InvalidConfig("rx fifo depth must be non-zero".into()));
        }
        if let Some(ref key) = self.rss_hash.key {
            if key.len() < 16 {
                return Err(DatapathError::InvalidConfig(
                    "toeplitz key must cover a 96-bit tuple plus 32 bits".into(),
                ));
            }
        }
        Ok(())
    }

    /// Indirection table length
    pub fn indir_table_len(&self) -> usize {
        1usize << self.indir_table_log2
    }
}

/// Hash strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// Toeplitz hash (RSS convention)
    #[default]
    Toeplitz,
    /// XOR fold of the tuple words
    XorFold,
}

/// Receive hash configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Hash function
    pub algorithm: HashAlgorithm,
    /// Hash IPv4 addresses
    pub ipv4: bool,
    /// Hash IPv6 addresses
    pub ipv6: bool,
    /// Include TCP ports
    pub tcp: bool,
    /// Include UDP ports
    pub udp: bool,
    /// Toeplitz secret key (standard 40-byte key when absent)
    pub key: Option<Vec<u8>>,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Toeplitz,
            ipv4: true,
            ipv6: true,
            tcp: true,
            udp: true,
            key: None,
        }
    }
}

/// Backoff shape between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay every attempt
    Fixed,
    /// Delay doubles up to the cap
    #[default]
    Exponential,
}

/// Retry policy for transient backpressure (table full, transport busy, CQ full)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before giving up on this pass
    pub max_attempts: u32,
    /// Backoff shape
    pub backoff: BackoffKind,
    /// First delay (microseconds); zero spins instead of sleeping
    pub base_delay_us: u64,
    /// Delay cap (microseconds)
    pub max_delay_us: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            backoff: BackoffKind::Exponential,
            base_delay_us: 0,
            max_delay_us: 100,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// TX worker threads
    pub tx_workers: usize,
    /// RX worker threads
    pub rx_workers: usize,
    /// Idle sleep between empty polls (microseconds)
    pub idle_sleep_us: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tx_workers: 2,
            rx_workers: 2,
            idle_sleep_us: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = NicConfig::default();
        config.validate().unwrap();
        assert_eq!(config.indir_table_len(), 256);
        assert_eq!(config.tx_op_table_size, 32);
    }

    #[test]
    fn test_rejects_empty_tables() {
        let config = NicConfig {
            tx_op_table_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DatapathError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NicConfig =
            serde_json::from_str(r#"{"rx_queues": 4, "rss_hash": {"algorithm": "xor_fold"}}"#)
                .unwrap();
        assert_eq!(config.rx_queues, 4);
        assert_eq!(config.rss_hash.algorithm, HashAlgorithm::XorFold);
        assert!(config.rss_hash.tcp);
        assert_eq!(config.max_rx_size, 9214);
    }

    #[test]
    fn test_save_load() {
        let path = std::env::temp_dir().join(format!("qnic-config-{}.json", std::process::id()));
        let path = path.to_str().unwrap().to_string();

        let config = NicConfig {
            event_queues: 2,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = NicConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.event_queues, 2);
    }
}
