//! RX Queue Mapper
//!
//! Chooses the receive queue for each frame. Every port owns an
//! indirection table; entries, masks and modes are individual atomics so
//! control-plane updates apply to subsequent frames without stalling the
//! receive path.

use qnic_common::{DatapathError, DatapathResult, NicConfig, PortId, QueueId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

/// Per-port selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MapMode {
    /// Every frame goes to the port's static queue offset
    Static = 0,
    /// `indir[hash & mask]`
    Rss = 1,
}

impl MapMode {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => MapMode::Static,
            _ => MapMode::Rss,
        }
    }
}

struct PortMap {
    mode: AtomicU8,
    static_offset: AtomicU32,
    rss_mask: AtomicU32,
    indir: Box<[AtomicU32]>,
}

impl PortMap {
    fn new(table_len: usize) -> Self {
        Self {
            mode: AtomicU8::new(MapMode::Rss as u8),
            static_offset: AtomicU32::new(0),
            rss_mask: AtomicU32::new(0),
            indir: (0..table_len).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

/// Snapshot of one port's mapping registers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapStatus {
    /// Selection mode
    pub mode: MapMode,
    /// Queue used in static mode
    pub static_offset: QueueId,
    /// Mask applied to the hash
    pub rss_mask: u32,
    /// Indirection table
    pub indir: Vec<QueueId>,
}

/// Receive queue mapper for all ports of an interface
pub struct RxQueueMapper {
    ports: Vec<PortMap>,
    table_len: usize,
    rss_enable: AtomicBool,
}

impl RxQueueMapper {
    /// Mapper for `num_ports` ports with `2^indir_log2`-entry tables
    pub fn new(num_ports: u16, indir_log2: u8, rss_enable: bool) -> Self {
        Self::with_table_len(num_ports, 1usize << indir_log2, rss_enable)
    }

    /// Mapper sized by the interface configuration
    pub fn from_config(config: &NicConfig) -> Self {
        Self::with_table_len(config.num_ports, config.indir_table_len(), config.rss_enable)
    }

    fn with_table_len(num_ports: u16, table_len: usize, rss_enable: bool) -> Self {
        Self {
            ports: (0..num_ports).map(|_| PortMap::new(table_len)).collect(),
            table_len,
            rss_enable: AtomicBool::new(rss_enable),
        }
    }

    /// Indirection table length
    pub fn table_len(&self) -> usize {
        self.table_len
    }

    fn port(&self, port: PortId) -> DatapathResult<&PortMap> {
        self.ports
            .get(port as usize)
            .ok_or_else(|| DatapathError::InvalidConfig(format!("unknown port {}", port)))
    }

    /// Pick the receive queue for a frame
    #[inline]
    pub fn select_queue(
        &self,
        port: PortId,
        hash: u32,
        dest_override: Option<QueueId>,
    ) -> DatapathResult<QueueId> {
        let map = self.port(port)?;
        if let Some(queue) = dest_override {
            return Ok(queue);
        }
        let mode = MapMode::from_raw(map.mode.load(Ordering::Acquire));
        if mode == MapMode::Static || !self.rss_enable.load(Ordering::Acquire) {
            return Ok(map.static_offset.load(Ordering::Acquire));
        }
        let index = (hash & map.rss_mask.load(Ordering::Acquire)) as usize;
        // mask is validated against the table length on write
        Ok(map.indir[index % self.table_len].load(Ordering::Acquire))
    }

    /// Write one indirection entry
    pub fn set_indir_entry(&self, port: PortId, index: usize, queue: QueueId) -> DatapathResult<()> {
        let map = self.port(port)?;
        let entry = map.indir.get(index).ok_or_else(|| {
            DatapathError::InvalidConfig(format!(
                "indirection index {} outside table of {}",
                index, self.table_len
            ))
        })?;
        entry.store(queue, Ordering::Release);
        Ok(())
    }

    /// Spread `queues` round robin across the whole table
    pub fn fill_indir(&self, port: PortId, queues: &[QueueId]) -> DatapathResult<()> {
        if queues.is_empty() {
            return Err(DatapathError::InvalidConfig("no queues to spread".into()));
        }
        let map = self.port(port)?;
        for (i, entry) in map.indir.iter().enumerate() {
            entry.store(queues[i % queues.len()], Ordering::Release);
        }
        Ok(())
    }

    /// Set the hash mask; `mask + 1` must be a power of two within the table
    pub fn set_rss_mask(&self, port: PortId, mask: u32) -> DatapathResult<()> {
        let map = self.port(port)?;
        let span = mask as u64 + 1;
        if !span.is_power_of_two() || span > self.table_len as u64 {
            return Err(DatapathError::InvalidConfig(format!(
                "rss mask {:#x} invalid for table of {}",
                mask, self.table_len
            )));
        }
        map.rss_mask.store(mask, Ordering::Release);
        Ok(())
    }

    /// Queue used in static mode
    pub fn set_static_offset(&self, port: PortId, queue: QueueId) -> DatapathResult<()> {
        self.port(port)?.static_offset.store(queue, Ordering::Release);
        Ok(())
    }

    /// Switch a port between RSS and static mapping
    pub fn set_mode(&self, port: PortId, mode: MapMode) -> DatapathResult<()> {
        self.port(port)?.mode.store(mode as u8, Ordering::Release);
        tracing::debug!(port, ?mode, "rx queue map mode");
        Ok(())
    }

    /// Global RSS switch; off forces static mapping on every port
    pub fn set_rss_enable(&self, enable: bool) {
        self.rss_enable.store(enable, Ordering::Release);
    }

    /// Global RSS switch
    pub fn rss_enabled(&self) -> bool {
        self.rss_enable.load(Ordering::Acquire)
    }

    /// Register snapshot
    pub fn status(&self, port: PortId) -> DatapathResult<PortMapStatus> {
        let map = self.port(port)?;
        Ok(PortMapStatus {
            mode: MapMode::from_raw(map.mode.load(Ordering::Acquire)),
            static_offset: map.static_offset.load(Ordering::Acquire),
            rss_mask: map.rss_mask.load(Ordering::Acquire),
            indir: map.indir.iter().map(|e| e.load(Ordering::Acquire)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_maps_to_entry_zero() {
        let mapper = RxQueueMapper::new(1, 8, true);
        assert_eq!(mapper.table_len(), 256);
        assert_eq!(mapper.select_queue(0, 0xDEAD_BEEF, None).unwrap(), 0);
    }

    #[test]
    fn test_from_config() {
        let config = NicConfig { num_ports: 2, indir_table_log2: 4, rss_enable: false, ..NicConfig::default() };
        let mapper = RxQueueMapper::from_config(&config);
        assert_eq!(mapper.table_len(), 16);
        assert!(mapper.set_indir_entry(1, 15, 3).is_ok());
        assert!(mapper.set_indir_entry(1, 16, 3).is_err());
        assert!(mapper.select_queue(2, 0, None).is_err());
    }

    #[test]
    fn test_offset_mapping() {
        let mapper = RxQueueMapper::new(1, 8, true);
        for k in 0..8 {
            mapper.set_indir_entry(0, 0, k).unwrap();
            assert_eq!(mapper.select_queue(0, 0x1234_5677, None).unwrap(), k);
        }
    }

    #[test]
    fn test_rss_mask_selects_entry() {
        let mapper = RxQueueMapper::new(2, 8, true);
        mapper.fill_indir(1, &[4, 5, 6, 7]).unwrap();
        mapper.set_rss_mask(1, 0x3).unwrap();
        for hash in 0..16u32 {
            assert_eq!(mapper.select_queue(1, hash, None).unwrap(), 4 + (hash & 3));
        }
        // Port 0 untouched
        assert_eq!(mapper.select_queue(0, 3, None).unwrap(), 0);
    }

    #[test]
    fn test_static_mode_and_global_disable() {
        let mapper = RxQueueMapper::new(1, 4, true);
        mapper.fill_indir(0, &[1, 2]).unwrap();
        mapper.set_rss_mask(0, 1).unwrap();
        mapper.set_static_offset(0, 6).unwrap();
        assert_eq!(mapper.select_queue(0, 1, None).unwrap(), 2);

        mapper.set_mode(0, MapMode::Static).unwrap();
        assert_eq!(mapper.select_queue(0, 1, None).unwrap(), 6);

        mapper.set_mode(0, MapMode::Rss).unwrap();
        mapper.set_rss_enable(false);
        assert_eq!(mapper.select_queue(0, 1, None).unwrap(), 6);
    }

    #[test]
    fn test_override_wins() {
        let mapper = RxQueueMapper::new(1, 4, true);
        mapper.set_static_offset(0, 3).unwrap();
        assert_eq!(mapper.select_queue(0, 0, Some(11)).unwrap(), 11);
    }

    #[test]
    fn test_invalid_writes() {
        let mapper = RxQueueMapper::new(1, 4, true);
        assert!(mapper.set_rss_mask(0, 0x5).is_err());
        assert!(mapper.set_rss_mask(0, 0x1F).is_err());
        assert!(mapper.set_rss_mask(0, 0xF).is_ok());
        assert!(mapper.set_indir_entry(0, 16, 1).is_err());
        assert!(mapper.select_queue(3, 0, None).is_err());
        assert!(mapper.fill_indir(0, &[]).is_err());
    }
}
