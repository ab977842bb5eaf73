//! Shared harness for the end-to-end datapath tests.
//!
//! One interface over a loopback cable, opened by the host driver, plus
//! reference frame builders and checksum arithmetic written independently
//! of the crate.

#![allow(dead_code)]

use bytes::Bytes;
use qnic_common::{NicConfig, PortId};
use qnic_datapath::{
    DmaRegion, DriverConfig, HostCompletion, HostDriver, Interface, InterruptLog,
    LoopbackTransport,
};
use std::sync::Arc;

/// Host memory per bench
pub const MEM_SIZE: usize = 16 << 20;

pub struct Bench {
    pub driver: HostDriver,
    pub wire: Arc<LoopbackTransport>,
    pub irqs: Arc<InterruptLog>,
}

impl Bench {
    pub fn new() -> Self {
        Self::with(NicConfig::default(), DriverConfig::default(), 1024)
    }

    pub fn with(config: NicConfig, driver: DriverConfig, wire_depth: usize) -> Self {
        let mem = Arc::new(DmaRegion::new(MEM_SIZE));
        let wire = Arc::new(LoopbackTransport::new(config.num_ports, wire_depth));
        let irqs = Arc::new(InterruptLog::new());
        let iface = Interface::builder(config, mem.clone(), wire.clone())
            .interrupts(irqs.clone())
            .build()
            .expect("interface");
        let driver = HostDriver::open(Arc::new(iface), mem, &driver).expect("driver open");
        Self { driver, wire, irqs }
    }

    pub fn iface(&self) -> &Interface {
        self.driver.interface()
    }

    /// Post one frame on TX queue `queue`, panicking if the ring is full
    pub fn xmit(&mut self, queue: u32, frame: &[u8], csum: Option<(u8, u8)>) {
        assert!(self.driver.start_xmit(queue, frame, csum).expect("start_xmit"), "tx ring full");
    }

    /// Run both engines until neither makes progress
    pub fn run(&self) {
        self.iface().run_until_idle().expect("run");
    }

    /// Frames transmitted on `port` so far
    pub fn wire_frames(&self, port: PortId) -> Vec<Bytes> {
        self.wire.drain(port)
    }

    /// Feed every transmitted frame on port 0 back into the receive side
    pub fn loopback(&self) -> usize {
        let frames = self.wire.drain(0);
        let n = frames.len();
        for frame in frames {
            self.iface().receive(0, frame).expect("receive");
        }
        n
    }

    /// One drive cycle: transmit, loop back, receive; expects exactly
    /// `count` packets
    pub fn recv_n(&mut self, count: usize) -> Vec<HostCompletion> {
        self.run();
        self.loopback();
        self.run();
        let out: Vec<_> = std::iter::from_fn(|| self.driver.recv().expect("recv")).collect();
        assert_eq!(out.len(), count, "expected {} packets", count);
        out
    }
}

/// One's-complement sum folded to 16 bits (reference arithmetic)
pub fn folded_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += ((data[i] as u32) << 8) | data[i + 1] as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Internet checksum (complemented)
pub fn internet_checksum(data: &[u8]) -> u16 {
    !folded_sum(data)
}

/// What the NIC must report for a received frame
pub fn expected_rx_checksum(frame: &[u8]) -> u16 {
    !internet_checksum(&frame[14..])
}

/// Bench frame: `len` bytes of `(x + k) % 256`
pub fn pattern(len: usize, k: usize) -> Vec<u8> {
    (0..len).map(|x| ((x + k) % 256) as u8).collect()
}

/// Ethernet / IPv4 / UDP frame with a fully computed UDP checksum
pub fn udp_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ip_len = 20 + udp_len;
    let mut frame = Vec::with_capacity(14 + ip_len);

    frame.extend_from_slice(&[0xDA, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5]);
    frame.extend_from_slice(&[0x5A, 0x51, 0x52, 0x53, 0x54, 0x55]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(ip_len as u16).to_be_bytes());
    ip[4..6].copy_from_slice(&1u16.to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    let ip_csum = internet_checksum(&ip);
    ip[10..12].copy_from_slice(&ip_csum.to_be_bytes());
    frame.extend_from_slice(&ip);

    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);

    let seed = pseudo_header_sum(src, dst, udp_len as u16);
    let mut csum_input = seed.to_be_bytes().to_vec();
    csum_input.extend_from_slice(&frame[34..]);
    let udp_csum = internet_checksum(&csum_input);
    frame[40..42].copy_from_slice(&udp_csum.to_be_bytes());
    frame
}

/// Folded IPv4 pseudo-header sum for UDP
pub fn pseudo_header_sum(src: [u8; 4], dst: [u8; 4], udp_len: u16) -> u16 {
    let mut pseudo = Vec::with_capacity(12);
    pseudo.extend_from_slice(&src);
    pseudo.extend_from_slice(&dst);
    pseudo.extend_from_slice(&[0, 17]);
    pseudo.extend_from_slice(&udp_len.to_be_bytes());
    folded_sum(&pseudo)
}

/// The same frame prepared for checksum offload: the UDP checksum field
/// carries the pseudo-header seed instead of the final value
pub fn offload_request(frame: &[u8]) -> Vec<u8> {
    let mut out = frame.to_vec();
    let src = [frame[26], frame[27], frame[28], frame[29]];
    let dst = [frame[30], frame[31], frame[32], frame[33]];
    let udp_len = u16::from_be_bytes([frame[38], frame[39]]);
    out[40..42].copy_from_slice(&pseudo_header_sum(src, dst, udp_len).to_be_bytes());
    out
}
