//! Bench scenarios over a loopback cable

use anyhow::{bail, ensure};
use bytes::Bytes;
use clap::ValueEnum;
use qnic_common::{DatapathError, NicConfig};
use qnic_datapath::checksum::{fold, ones_complement_sum, rx_checksum};
use qnic_datapath::stats::InterfaceStats;
use qnic_datapath::{DmaRegion, DriverConfig, HostCompletion, HostDriver, Interface, LoopbackTransport};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MEM_SIZE: usize = 32 << 20;
const WIRE_DEPTH: usize = 1024;
const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    All,
    Single,
    Checksum,
    Offset,
    Rss,
    Small,
    Large,
    Jumbo,
    Pause,
}

impl Scenario {
    pub fn each() -> &'static [Scenario] {
        &[
            Scenario::Single,
            Scenario::Checksum,
            Scenario::Offset,
            Scenario::Rss,
            Scenario::Small,
            Scenario::Large,
            Scenario::Jumbo,
            Scenario::Pause,
        ]
    }
}

pub struct Sim {
    driver: HostDriver,
    wire: Arc<LoopbackTransport>,
    /// Looped-back frames the RX FIFO has not accepted yet
    backlog: VecDeque<Bytes>,
    rx_queues: u32,
    max_rx_size: u32,
    checksum_skip: usize,
    workers: bool,
}

impl Sim {
    pub fn new(config: NicConfig, workers: bool) -> anyhow::Result<Self> {
        let mem = Arc::new(DmaRegion::new(MEM_SIZE));
        let wire = Arc::new(LoopbackTransport::new(config.num_ports, WIRE_DEPTH));
        let driver_config = DriverConfig {
            tx_queues: 1,
            rx_queues: config.rx_queues.min(4),
            ..DriverConfig::default()
        };
        let (rx_queues, max_rx_size, checksum_skip) =
            (driver_config.rx_queues, config.max_rx_size, config.rx_checksum_skip);
        let worker_config = config.workers.clone();

        let iface = Arc::new(Interface::builder(config, mem.clone(), wire.clone()).build()?);
        let driver = HostDriver::open(iface, mem, &driver_config)?;
        if workers {
            driver.interface().start(&worker_config)?;
        }

        Ok(Self {
            driver,
            wire,
            backlog: VecDeque::new(),
            rx_queues,
            max_rx_size,
            checksum_skip,
            workers,
        })
    }

    fn iface(&self) -> &Interface {
        self.driver.interface()
    }

    pub fn run(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        tracing::info!(?scenario, "running");
        let start = Instant::now();
        match scenario {
            Scenario::All => {
                for &one in Scenario::each() {
                    self.run(one)?;
                }
            }
            Scenario::Single => self.single()?,
            Scenario::Checksum => self.checksum()?,
            Scenario::Offset => self.offset()?,
            Scenario::Rss => self.rss()?,
            Scenario::Small => self.burst(60, 64)?,
            Scenario::Large => self.burst(1514, 64)?,
            Scenario::Jumbo => {
                if self.max_rx_size < 9014 {
                    tracing::warn!(max_rx_size = self.max_rx_size, "jumbo frames disabled, skipping");
                } else {
                    self.burst(9014, 16)?;
                }
            }
            Scenario::Pause => self.pause()?,
        }
        tracing::info!(?scenario, elapsed_ms = start.elapsed().as_millis() as u64, "passed");
        Ok(())
    }

    pub fn finish(self) -> InterfaceStats {
        self.iface().stop();
        self.iface().stats()
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn pump(&mut self) -> anyhow::Result<()> {
        if self.workers {
            std::thread::sleep(Duration::from_micros(200));
        } else {
            self.iface().run_until_idle()?;
        }
        self.backlog.extend(self.wire.drain(0));
        while let Some(frame) = self.backlog.pop_front() {
            match self.driver.interface().receive(0, frame.clone()) {
                Ok(()) => {}
                Err(DatapathError::TransportBusy) => {
                    self.backlog.push_front(frame);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !self.workers {
            self.iface().run_until_idle()?;
        }
        Ok(())
    }

    fn xmit(&mut self, frame: &[u8], csum: Option<(u8, u8)>) -> anyhow::Result<()> {
        let deadline = Instant::now() + TIMEOUT;
        while !self.driver.start_xmit(0, frame, csum)? {
            if Instant::now() > deadline {
                bail!("tx ring stayed full");
            }
            self.pump()?;
            self.driver.poll()?;
        }
        Ok(())
    }

    fn recv_n(&mut self, count: usize) -> anyhow::Result<Vec<HostCompletion>> {
        let deadline = Instant::now() + TIMEOUT;
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            self.pump()?;
            while let Some(pkt) = self.driver.recv()? {
                out.push(pkt);
            }
            if Instant::now() > deadline {
                bail!("received {} of {} packets", out.len(), count);
            }
        }
        Ok(out)
    }

    fn check(&self, pkt: &HostCompletion, sent: &[u8]) -> anyhow::Result<()> {
        let data = match pkt.data {
            Some(ref data) => data,
            None => bail!("error completion {:?} on queue {}", pkt.record.error_flags, pkt.queue()),
        };
        ensure!(data.as_ref() == sent, "payload mismatch on queue {}", pkt.queue());
        ensure!(
            pkt.record.rx_checksum == rx_checksum(data, self.checksum_skip),
            "rx checksum {:#06x} wrong",
            pkt.record.rx_checksum
        );
        tracing::debug!(
            queue = pkt.queue(),
            len = pkt.record.length,
            hash = pkt.record.rx_hash,
            csum = pkt.record.rx_checksum,
            "packet"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------

    fn single(&mut self) -> anyhow::Result<()> {
        let data = pattern(1024, 0);
        self.xmit(&data, None)?;
        let pkt = self.recv_n(1)?.remove(0);
        self.check(&pkt, &data)
    }

    fn checksum(&mut self) -> anyhow::Result<()> {
        let request = udp_offload_frame([192, 168, 1, 100], [192, 168, 1, 101], 1, 2, &pattern(256, 0));
        self.xmit(&request, Some((34, 6)))?;
        let pkt = self.recv_n(1)?.remove(0);

        let data = pkt.data.clone().unwrap_or_default();
        ensure!(data.len() == request.len(), "length changed in flight");
        ensure!(data[..40] == request[..40] && data[42..] == request[42..], "frame modified outside the checksum field");
        let seed = u16::from_be_bytes([request[40], request[41]]);
        ensure!(
            fold(ones_complement_sum(&data[34..]) + seed as u64) == 0xFFFF,
            "udp checksum does not verify"
        );
        self.check(&pkt, &data)
    }

    fn offset(&mut self) -> anyhow::Result<()> {
        let data = pattern(1024, 0);
        for k in 0..self.rx_queues {
            self.iface().set_indir_entry(0, 0, k)?;
            self.xmit(&data, None)?;
            let pkt = self.recv_n(1)?.remove(0);
            self.check(&pkt, &data)?;
            ensure!(pkt.queue() == k, "expected queue {}, got {}", k, pkt.queue());
        }
        self.iface().set_indir_entry(0, 0, 0)?;
        Ok(())
    }

    fn rss(&mut self) -> anyhow::Result<()> {
        let queues = self.rx_queues.next_power_of_two();
        self.iface().set_rss_mask(0, queues - 1)?;
        for k in 0..queues {
            self.iface().set_indir_entry(0, k as usize, k % self.rx_queues)?;
        }

        let payload = pattern(256, 0);
        for k in 0..64u16 {
            let frame = udp_offload_frame([192, 168, 1, 100], [192, 168, 1, 101], 1, k, &payload);
            self.xmit(&frame, Some((34, 6)))?;
        }

        let mut seen = HashSet::new();
        for pkt in self.recv_n(64)? {
            let data = pkt.data.clone().unwrap_or_default();
            self.check(&pkt, &data)?;
            seen.insert(pkt.queue());
        }
        ensure!(seen.len() == self.rx_queues as usize, "flows reached {} queues", seen.len());

        self.iface().set_rss_mask(0, 0)?;
        for k in 0..queues {
            self.iface().set_indir_entry(0, k as usize, 0)?;
        }
        Ok(())
    }

    fn burst(&mut self, len: usize, count: usize) -> anyhow::Result<()> {
        let pkts: Vec<Vec<u8>> = (0..count).map(|k| pattern(len, k)).collect();
        for p in &pkts {
            self.xmit(p, None)?;
        }
        let received = self.recv_n(count)?;
        for (pkt, sent) in received.iter().zip(&pkts) {
            self.check(pkt, sent)?;
        }
        Ok(())
    }

    fn pause(&mut self) -> anyhow::Result<()> {
        self.iface().set_port_paused(0, true)?;
        let pkts: Vec<Vec<u8>> = (0..16).map(|k| pattern(1514, k)).collect();
        for p in &pkts {
            self.xmit(p, None)?;
        }
        self.pump()?;
        ensure!(self.wire.pending(0) == 0, "paused port transmitted");
        ensure!(self.driver.recv()?.is_none(), "paused port received");

        self.iface().set_port_paused(0, false)?;
        let received = self.recv_n(16)?;
        for (pkt, sent) in received.iter().zip(&pkts) {
            self.check(pkt, sent)?;
        }
        Ok(())
    }
}

/// Bench payload: `len` bytes of `(x + k) % 256`
fn pattern(len: usize, k: usize) -> Vec<u8> {
    (0..len).map(|x| ((x + k) % 256) as u8).collect()
}

/// Ethernet / IPv4 / UDP frame whose UDP checksum field holds the
/// pseudo-header seed, ready for offload at (34, 6)
fn udp_offload_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = (8 + payload.len()) as u16;
    let mut frame = Vec::with_capacity(42 + payload.len());
    frame.extend_from_slice(&[0xDA, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0x5A, 0x51, 0x52, 0x53, 0x54, 0x55]);
    frame.extend_from_slice(&[0x08, 0x00]);

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(udp_len + 20).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    let ip_csum = !fold(ones_complement_sum(&ip));
    ip[10..12].copy_from_slice(&ip_csum.to_be_bytes());
    frame.extend_from_slice(&ip);

    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src);
    pseudo[4..8].copy_from_slice(&dst);
    pseudo[9] = 17;
    pseudo[10..12].copy_from_slice(&udp_len.to_be_bytes());
    let seed = fold(ones_complement_sum(&pseudo));

    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&seed.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
