//! Receive-side scaling hash
//!
//! Frames are parsed just far enough to extract the flow tuple (addresses,
//! and ports for TCP/UDP), which is then fed to a pluggable hash strategy.
//! The resulting 32-bit hash indexes the port's indirection table.

use bitflags::bitflags;
use qnic_common::{DatapathError, DatapathResult, HashAlgorithm, HashConfig};

/// Microsoft RSS verification key
pub const DEFAULT_RSS_KEY: [u8; 40] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f,
    0xb0, 0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30,
    0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Longest hash input: two IPv6 addresses and two ports
const MAX_INPUT: usize = 36;

bitflags! {
    /// Tuple fields that contributed to a hash (reported in completions)
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct HashTypes: u8 {
        const IPV4 = 0x01;
        const IPV6 = 0x02;
        const TCP = 0x04;
        const UDP = 0x08;
    }
}

impl HashTypes {
    /// Fields enabled by a hash configuration
    pub fn from_config(config: &HashConfig) -> Self {
        let mut types = HashTypes::empty();
        types.set(HashTypes::IPV4, config.ipv4);
        types.set(HashTypes::IPV6, config.ipv6);
        types.set(HashTypes::TCP, config.tcp);
        types.set(HashTypes::UDP, config.udp);
        types
    }
}

/// Network addresses of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAddrs {
    /// IPv4 pair
    V4 {
        /// Source address
        src: [u8; 4],
        /// Destination address
        dst: [u8; 4],
    },
    /// IPv6 pair
    V6 {
        /// Source address
        src: [u8; 16],
        /// Destination address
        dst: [u8; 16],
    },
}

/// Flow tuple extracted from an Ethernet frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    /// Source and destination addresses
    pub addrs: FlowAddrs,
    /// IP protocol number
    pub protocol: u8,
    /// `(src, dst)` when the frame carries an unfragmented TCP/UDP header
    pub ports: Option<(u16, u16)>,
}

impl FlowTuple {
    /// Parse an Ethernet II frame (one optional VLAN tag)
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let mut l3 = 14;
        let mut ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
        if ethertype == ETHERTYPE_VLAN {
            ethertype = u16::from_be_bytes([*frame.get(16)?, *frame.get(17)?]);
            l3 = 18;
        }
        let ip = frame.get(l3..)?;

        let (addrs, protocol, l4, fragmented) = match ethertype {
            ETHERTYPE_IPV4 => {
                if ip.len() < 20 || ip[0] >> 4 != 4 {
                    return None;
                }
                let ihl = (ip[0] & 0x0F) as usize * 4;
                let frag = u16::from_be_bytes([ip[6], ip[7]]);
                let mut src = [0u8; 4];
                let mut dst = [0u8; 4];
                src.copy_from_slice(&ip[12..16]);
                dst.copy_from_slice(&ip[16..20]);
                // MF set or non-zero fragment offset
                (FlowAddrs::V4 { src, dst }, ip[9], ihl, frag & 0x3FFF != 0)
            }
            ETHERTYPE_IPV6 => {
                if ip.len() < 40 || ip[0] >> 4 != 6 {
                    return None;
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&ip[8..24]);
                dst.copy_from_slice(&ip[24..40]);
                (FlowAddrs::V6 { src, dst }, ip[6], 40, false)
            }
            _ => return None,
        };

        let ports = match protocol {
            PROTO_TCP | PROTO_UDP if !fragmented => ip
                .get(l4..l4 + 4)
                .map(|p| (u16::from_be_bytes([p[0], p[1]]), u16::from_be_bytes([p[2], p[3]]))),
            _ => None,
        };

        Some(Self { addrs, protocol, ports })
    }

    /// Serialize the enabled fields as hash input (src addr, dst addr,
    /// src port, dst port); returns the bytes used and the contributing types
    pub fn hash_input(&self, enabled: HashTypes, buf: &mut [u8; MAX_INPUT]) -> (usize, HashTypes) {
        let (mut len, mut types) = match self.addrs {
            FlowAddrs::V4 { src, dst } if enabled.contains(HashTypes::IPV4) => {
                buf[0..4].copy_from_slice(&src);
                buf[4..8].copy_from_slice(&dst);
                (8, HashTypes::IPV4)
            }
            FlowAddrs::V6 { src, dst } if enabled.contains(HashTypes::IPV6) => {
                buf[0..16].copy_from_slice(&src);
                buf[16..32].copy_from_slice(&dst);
                (32, HashTypes::IPV6)
            }
            _ => return (0, HashTypes::empty()),
        };

        let l4 = match self.protocol {
            PROTO_TCP => HashTypes::TCP,
            PROTO_UDP => HashTypes::UDP,
            _ => HashTypes::empty(),
        };
        if let Some((sport, dport)) = self.ports {
            if !l4.is_empty() && enabled.contains(l4) {
                buf[len..len + 2].copy_from_slice(&sport.to_be_bytes());
                buf[len + 2..len + 4].copy_from_slice(&dport.to_be_bytes());
                len += 4;
                types |= l4;
            }
        }
        (len, types)
    }
}

/// Hash strategy
pub trait RssHasher: Send + Sync {
    /// Hash a serialized flow tuple
    fn hash(&self, input: &[u8]) -> u32;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

/// Toeplitz hash over a secret key
#[derive(Debug, Clone)]
pub struct ToeplitzHasher {
    key: Vec<u8>,
}

impl ToeplitzHasher {
    /// Hasher with a custom key (at least 4 bytes)
    pub fn new(key: Vec<u8>) -> DatapathResult<Self> {
        if key.len() < 4 {
            return Err(DatapathError::InvalidConfig("toeplitz key shorter than 32 bits".into()));
        }
        Ok(Self { key })
    }
}

impl Default for ToeplitzHasher {
    fn default() -> Self {
        Self { key: DEFAULT_RSS_KEY.to_vec() }
    }
}

impl RssHasher for ToeplitzHasher {
    fn hash(&self, input: &[u8]) -> u32 {
        let mut result = 0u32;
        let mut window = u32::from_be_bytes([self.key[0], self.key[1], self.key[2], self.key[3]]);
        for (i, &byte) in input.iter().enumerate() {
            // Key bits past the end shift in as zero
            let next = self.key.get(i + 4).copied().unwrap_or(0);
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    result ^= window;
                }
                window = (window << 1) | ((next >> (7 - bit)) & 1) as u32;
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "toeplitz"
    }
}

/// Keyless XOR fold of the tuple into 32 bits
#[derive(Debug, Clone, Copy, Default)]
pub struct XorFoldHasher;

impl RssHasher for XorFoldHasher {
    fn hash(&self, input: &[u8]) -> u32 {
        input.chunks(4).fold(0u32, |acc, chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            acc ^ u32::from_be_bytes(word)
        })
    }

    fn name(&self) -> &'static str {
        "xor_fold"
    }
}

/// Hash computed for one received frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxHash {
    /// 32-bit flow hash (zero when nothing was hashed)
    pub hash: u32,
    /// Fields that went into the hash
    pub hash_type: HashTypes,
}

/// Frame hasher: parse, select fields, run the strategy
pub struct FlowHasher {
    hasher: Box<dyn RssHasher>,
    enabled: HashTypes,
}

impl FlowHasher {
    /// Wrap a strategy with the fields it may use
    pub fn new(hasher: Box<dyn RssHasher>, enabled: HashTypes) -> Self {
        Self { hasher, enabled }
    }

    /// Build from configuration
    pub fn from_config(config: &HashConfig) -> DatapathResult<Self> {
        let hasher: Box<dyn RssHasher> = match config.algorithm {
            HashAlgorithm::Toeplitz => match config.key {
                Some(ref key) => Box::new(ToeplitzHasher::new(key.clone())?),
                None => Box::new(ToeplitzHasher::default()),
            },
            HashAlgorithm::XorFold => Box::new(XorFoldHasher),
        };
        Ok(Self::new(hasher, HashTypes::from_config(config)))
    }

    /// Strategy name
    pub fn algorithm(&self) -> &'static str {
        self.hasher.name()
    }

    /// Hash a frame; non-IP or disabled traffic hashes to zero
    pub fn hash_frame(&self, frame: &[u8]) -> RxHash {
        let tuple = match FlowTuple::parse(frame) {
            Some(t) => t,
            None => return RxHash::default(),
        };
        let mut buf = [0u8; MAX_INPUT];
        let (len, hash_type) = tuple.hash_input(self.enabled, &mut buf);
        if len == 0 {
            return RxHash::default();
        }
        RxHash { hash: self.hasher.hash(&buf[..len]), hash_type }
    }
}

impl std::fmt::Debug for FlowHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHasher")
            .field("algorithm", &self.hasher.name())
            .field("enabled", &self.enabled)
            .finish()
    }
}
