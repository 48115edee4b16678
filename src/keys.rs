use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// On-disk timestamps are 32-bit seconds/microseconds, GMT. The 2106
/// rollover is accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeVal32 {
    pub sec: u32,
    pub usec: u32,
}

impl TimeVal32 {
    pub fn new(sec: u32, usec: u32) -> Self {
        Self { sec, usec }
    }

    pub const MAX: TimeVal32 = TimeVal32 { sec: u32::MAX, usec: u32::MAX };

    /// Parse an `<epoch>.<usec>` string (e.g. `1454509487.534286`).
    pub fn parse(s: &str) -> Result<Self> {
        let (sec_str, usec_str) = match s.split_once('.') {
            Some(pair) => pair,
            None => (s, "0"),
        };
        let sec: u32 = sec_str.parse()?;
        let usec: u32 = usec_str.parse()?;
        Ok(Self { sec, usec })
    }
}

impl fmt::Display for TimeVal32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

pub const IP_VERS_UNKNOWN: u8 = 0;
pub const IP_VERS_4: u8 = 4;
pub const IP_VERS_6: u8 = 6;

/// A source or destination address with its version tag. IPv4 addresses
/// occupy the first four bytes (network order); the tail is zero. An IPv4
/// address always sorts below an IPv6 address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IpKey {
    pub vers: u8,
    pub bytes: [u8; 16],
}

impl IpKey {
    pub fn unknown() -> Self {
        Self { vers: IP_VERS_UNKNOWN, bytes: [0; 16] }
    }

    pub fn v4(addr: Ipv4Addr) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&addr.octets());
        Self { vers: IP_VERS_4, bytes }
    }

    pub fn v6(addr: Ipv6Addr) -> Self {
        Self { vers: IP_VERS_6, bytes: addr.octets() }
    }

    pub fn v4_bytes(&self) -> [u8; 4] {
        [self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]
    }
}

impl Ord for IpKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Unknown/other version pairs compare equal, matching the index
        // trees which never hold them.
        if self.vers != other.vers {
            return self.vers.cmp(&other.vers);
        }
        match self.vers {
            IP_VERS_4 => self.bytes[..4].cmp(&other.bytes[..4]),
            IP_VERS_6 => self.bytes.cmp(&other.bytes),
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for IpKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vers {
            IP_VERS_4 => Ipv4Addr::from(self.v4_bytes()).fmt(f),
            IP_VERS_6 => Ipv6Addr::from(self.bytes).fmt(f),
            v => write!(f, "ip?v{v}"),
        }
    }
}

/// The parsed five-tuple of one packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FiveTuple {
    pub src: IpKey,
    pub dst: IpKey,
    pub srcport: u16,
    pub dstport: u16,
    pub proto: u8,
}

impl FiveTuple {
    /// Flow comparison order: ports first (cheap and most likely to
    /// differ), then addresses, then protocol.
    pub fn cmp_flow(&self, other: &Self) -> Ordering {
        self.srcport
            .cmp(&other.srcport)
            .then_with(|| self.dstport.cmp(&other.dstport))
            .then_with(|| self.src.cmp(&other.src))
            .then_with(|| self.dst.cmp(&other.dst))
            .then_with(|| self.proto.cmp(&other.proto))
    }

    /// Compare two tuples under the given index key type.
    pub fn cmp_key(&self, other: &Self, kt: KeyType) -> Ordering {
        match kt {
            KeyType::Flow => self.cmp_flow(other),
            KeyType::SrcV4 | KeyType::SrcV6 => self.src.cmp(&other.src),
            KeyType::DstV4 | KeyType::DstV6 => self.dst.cmp(&other.dst),
            KeyType::SrcPort => self.srcport.cmp(&other.srcport),
            KeyType::DstPort => self.dstport.cmp(&other.dstport),
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}->{}|{},{}",
            self.src, self.srcport, self.dst, self.dstport, self.proto
        )
    }
}

/// The seven index key types, in on-disk order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
    Flow,
    SrcV4,
    DstV4,
    SrcV6,
    DstV6,
    SrcPort,
    DstPort,
}

impl KeyType {
    pub const ALL: [KeyType; 7] = [
        KeyType::Flow,
        KeyType::SrcV4,
        KeyType::DstV4,
        KeyType::SrcV6,
        KeyType::DstV6,
        KeyType::SrcPort,
        KeyType::DstPort,
    ];

    pub const PROJECTIONS: [KeyType; 6] = [
        KeyType::SrcV4,
        KeyType::DstV4,
        KeyType::SrcV6,
        KeyType::DstV6,
        KeyType::SrcPort,
        KeyType::DstPort,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KeyType::Flow => "FLOW",
            KeyType::SrcV4 => "SRCv4",
            KeyType::DstV4 => "DSTv4",
            KeyType::SrcV6 => "SRCv6",
            KeyType::DstV6 => "DSTv6",
            KeyType::SrcPort => "SRCPORT",
            KeyType::DstPort => "DSTPORT",
        }
    }

    pub fn from_name(s: &str) -> Option<KeyType> {
        KeyType::ALL.into_iter().find(|kt| kt.name() == s)
    }

    /// Serialized key width for this index type.
    pub fn key_size(self) -> usize {
        match self {
            KeyType::Flow => FLOW_KEY_SIZE,
            KeyType::SrcV4 | KeyType::DstV4 => 4,
            KeyType::SrcV6 | KeyType::DstV6 => 16,
            KeyType::SrcPort | KeyType::DstPort => 2,
        }
    }

    pub fn from_disk(v: u8) -> Option<KeyType> {
        KeyType::ALL.get(v as usize).copied()
    }

    pub fn to_disk(self) -> u8 {
        KeyType::ALL.iter().position(|k| *k == self).unwrap() as u8
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A projection key value, as stored in a sub-index file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKey {
    V4([u8; 4]),
    V6([u8; 16]),
    Port(u16),
}

impl IndexKey {
    pub fn for_tuple(tuple: &FiveTuple, kt: KeyType) -> IndexKey {
        match kt {
            KeyType::SrcV4 => IndexKey::V4(tuple.src.v4_bytes()),
            KeyType::DstV4 => IndexKey::V4(tuple.dst.v4_bytes()),
            KeyType::SrcV6 => IndexKey::V6(tuple.src.bytes),
            KeyType::DstV6 => IndexKey::V6(tuple.dst.bytes),
            KeyType::SrcPort => IndexKey::Port(tuple.srcport),
            KeyType::DstPort => IndexKey::Port(tuple.dstport),
            KeyType::Flow => unreachable!("flow keys are not projection keys"),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            IndexKey::V4(b) => out.extend_from_slice(b),
            IndexKey::V6(b) => out.extend_from_slice(b),
            IndexKey::Port(p) => out.extend_from_slice(&p.to_le_bytes()),
        }
    }

    pub fn decode(kt: KeyType, buf: &[u8]) -> IndexKey {
        match kt {
            KeyType::SrcV4 | KeyType::DstV4 => {
                IndexKey::V4([buf[0], buf[1], buf[2], buf[3]])
            }
            KeyType::SrcV6 | KeyType::DstV6 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(&buf[..16]);
                IndexKey::V6(b)
            }
            KeyType::SrcPort | KeyType::DstPort => {
                IndexKey::Port(u16::from_le_bytes([buf[0], buf[1]]))
            }
            KeyType::Flow => unreachable!("flow keys are not projection keys"),
        }
    }

    /// Parse a key from its search-descriptor representation.
    pub fn parse(kt: KeyType, s: &str) -> Result<IndexKey> {
        match kt {
            KeyType::SrcV4 | KeyType::DstV4 => {
                let addr: Ipv4Addr = s.parse()?;
                Ok(IndexKey::V4(addr.octets()))
            }
            KeyType::SrcV6 | KeyType::DstV6 => {
                let addr: Ipv6Addr = s.parse()?;
                Ok(IndexKey::V6(addr.octets()))
            }
            KeyType::SrcPort | KeyType::DstPort => Ok(IndexKey::Port(s.parse()?)),
            KeyType::Flow => bail!("flow indexes aren't searchable by key"),
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // IPv4 addresses compare in network byte order, which is the
            // same as their numeric order.
            (IndexKey::V4(a), IndexKey::V4(b)) => a.cmp(b),
            (IndexKey::V6(a), IndexKey::V6(b)) => a.cmp(b),
            (IndexKey::Port(a), IndexKey::Port(b)) => a.cmp(b),
            _ => unreachable!("mismatched index key variants"),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::V4(b) => Ipv4Addr::from(*b).fmt(f),
            IndexKey::V6(b) => Ipv6Addr::from(*b).fmt(f),
            IndexKey::Port(p) => p.fmt(f),
        }
    }
}

pub const FLOW_KEY_SIZE: usize = 64;
/// A flow record plus its offset within the FLOW index file.
pub const FLOW_REC_SIZE: usize = FLOW_KEY_SIZE + 8;

/// Exponent value that marks size/packets as overflowed beyond what the
/// base-times-power encoding can express.
pub const POW_OVERFLOW: u8 = 15;

/// The packed 64-byte flow record written to FLOW index files.
///
/// `size` and `packets` store `base × 2^pow`; an exponent of 15 means the
/// value overflowed and the fields are invalid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowKey {
    pub first_ts: TimeVal32,
    pub last_ts: TimeVal32,
    pub src: IpKey,
    pub proto: u8,
    pub srcport: u16,
    pub packets: u32,
    pub dst: IpKey,
    pub size_pow: u8,
    pub packets_pow: u8,
    pub dstport: u16,
    pub size: u32,
}

impl FlowKey {
    pub fn tuple(&self) -> FiveTuple {
        FiveTuple {
            src: self.src,
            dst: self.dst,
            srcport: self.srcport,
            dstport: self.dstport,
            proto: self.proto,
        }
    }

    pub fn cmp_flow(&self, other: &Self) -> Ordering {
        self.tuple().cmp_flow(&other.tuple())
    }

    pub fn decoded_packets(&self) -> u64 {
        (self.packets as u64) << self.packets_pow
    }

    pub fn decoded_size(&self) -> u64 {
        (self.size as u64) << self.size_pow
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= FLOW_KEY_SIZE);
        LittleEndian::write_u32(&mut out[0..], self.first_ts.sec);
        LittleEndian::write_u32(&mut out[4..], self.first_ts.usec);
        LittleEndian::write_u32(&mut out[8..], self.last_ts.sec);
        LittleEndian::write_u32(&mut out[12..], self.last_ts.usec);
        out[16..32].copy_from_slice(&self.src.bytes);
        out[32] = self.src.vers;
        out[33] = self.proto;
        LittleEndian::write_u16(&mut out[34..], self.srcport);
        LittleEndian::write_u32(&mut out[36..], self.packets);
        out[40..56].copy_from_slice(&self.dst.bytes);
        out[56] = self.dst.vers;
        out[57] = (self.size_pow & 0x0f) | (self.packets_pow << 4);
        LittleEndian::write_u16(&mut out[58..], self.dstport);
        LittleEndian::write_u32(&mut out[60..], self.size);
    }

    pub fn decode(buf: &[u8]) -> FlowKey {
        debug_assert!(buf.len() >= FLOW_KEY_SIZE);
        let mut src_bytes = [0u8; 16];
        src_bytes.copy_from_slice(&buf[16..32]);
        let mut dst_bytes = [0u8; 16];
        dst_bytes.copy_from_slice(&buf[40..56]);
        FlowKey {
            first_ts: TimeVal32::new(
                LittleEndian::read_u32(&buf[0..]),
                LittleEndian::read_u32(&buf[4..]),
            ),
            last_ts: TimeVal32::new(
                LittleEndian::read_u32(&buf[8..]),
                LittleEndian::read_u32(&buf[12..]),
            ),
            src: IpKey { vers: buf[32], bytes: src_bytes },
            proto: buf[33],
            srcport: LittleEndian::read_u16(&buf[34..]),
            packets: LittleEndian::read_u32(&buf[36..]),
            dst: IpKey { vers: buf[56], bytes: dst_bytes },
            size_pow: buf[57] & 0x0f,
            packets_pow: buf[57] >> 4,
            dstport: LittleEndian::read_u16(&buf[58..]),
            size: LittleEndian::read_u32(&buf[60..]),
        }
    }

    /// Merge `other` into `self`, assuming both describe the same flow
    /// across capture files. Takes the earliest first timestamp, the latest
    /// last timestamp, and sums packet/size counts with exponent
    /// renormalization.
    pub fn merge(&mut self, other: &FlowKey) {
        if other.first_ts < self.first_ts {
            self.first_ts = other.first_ts;
        }
        if other.last_ts > self.last_ts {
            self.last_ts = other.last_ts;
        }

        let (packets, packets_pow) = merge_pow(
            self.packets,
            self.packets_pow,
            other.packets,
            other.packets_pow,
        );
        self.packets = packets;
        self.packets_pow = packets_pow;

        let (size, size_pow) =
            merge_pow(self.size, self.size_pow, other.size, other.size_pow);
        self.size = size;
        self.size_pow = size_pow;
    }
}

/// Sum two base-times-power values, renormalizing the result to fit the
/// 32-bit base and 4-bit exponent. An exponent of 15 marks overflow.
fn merge_pow(a: u32, a_pow: u8, b: u32, b_pow: u8) -> (u32, u8) {
    if a_pow >= POW_OVERFLOW || b_pow >= POW_OVERFLOW {
        return (0, POW_OVERFLOW);
    }
    let mut total = ((a as u64) << a_pow) + ((b as u64) << b_pow);
    let mut pow = 0u8;
    while total > u32::MAX as u64 {
        total >>= 1;
        pow += 1;
    }
    if pow >= POW_OVERFLOW {
        (0, POW_OVERFLOW)
    } else {
        (total as u32, pow)
    }
}

/// A flow record together with its FLOW-index file offset, as stored in
/// `.flows` search result files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowRec {
    pub key: FlowKey,
    pub flow_offset: u64,
}

impl FlowRec {
    pub fn encode(&self, out: &mut [u8]) {
        self.key.encode(out);
        LittleEndian::write_u64(&mut out[FLOW_KEY_SIZE..], self.flow_offset);
    }

    pub fn decode(buf: &[u8]) -> FlowRec {
        FlowRec {
            key: FlowKey::decode(buf),
            flow_offset: LittleEndian::read_u64(&buf[FLOW_KEY_SIZE..]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpKey {
        IpKey::v4(s.parse().unwrap())
    }

    #[test]
    fn ip_ordering_v4_before_v6() {
        let a = v4("255.255.255.255");
        let b = IpKey::v6("::1".parse().unwrap());
        assert!(a < b);
    }

    #[test]
    fn ip_ordering_numeric() {
        assert!(v4("1.2.3.4") < v4("1.2.3.5"));
        assert!(v4("9.0.0.0") < v4("10.0.0.0"));
        assert!(v4("127.0.0.1") < v4("128.0.0.1"));
    }

    #[test]
    fn flow_key_roundtrip() {
        let key = FlowKey {
            first_ts: TimeVal32::new(100, 5),
            last_ts: TimeVal32::new(110, 6),
            src: v4("10.0.0.1"),
            proto: 17,
            srcport: 53,
            packets: 9,
            dst: v4("10.0.0.2"),
            size_pow: 3,
            packets_pow: 2,
            dstport: 5353,
            size: 1234,
        };
        let mut buf = [0u8; FLOW_KEY_SIZE];
        key.encode(&mut buf);
        assert_eq!(FlowKey::decode(&buf), key);
    }

    #[test]
    fn flow_merge_sums_and_spans() {
        let mut a = FlowKey {
            first_ts: TimeVal32::new(100, 0),
            last_ts: TimeVal32::new(150, 0),
            packets: 5,
            size: 500,
            ..Default::default()
        };
        let b = FlowKey {
            first_ts: TimeVal32::new(200, 0),
            last_ts: TimeVal32::new(250, 0),
            packets: 7,
            size: 700,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.first_ts, TimeVal32::new(100, 0));
        assert_eq!(a.last_ts, TimeVal32::new(250, 0));
        assert_eq!(a.packets, 12);
        assert_eq!(a.size, 1200);
        assert_eq!(a.packets_pow, 0);
    }

    #[test]
    fn flow_merge_renormalizes_exponents() {
        let mut a = FlowKey { packets: u32::MAX, size: u32::MAX, ..Default::default() };
        let b = a;
        a.merge(&b);
        // 2 * (2^32 - 1) needs one shift to fit, and halving is exact here.
        assert_eq!(a.packets_pow, 1);
        assert_eq!(a.decoded_packets(), (u32::MAX as u64) * 2);
    }

    #[test]
    fn flow_merge_uses_each_operands_exponent() {
        let mut a = FlowKey { packets: 4, packets_pow: 2, ..Default::default() };
        let b = FlowKey { packets: 8, packets_pow: 3, ..Default::default() };
        a.merge(&b);
        // 4*4 + 8*8 = 80
        assert_eq!(a.decoded_packets(), 80);
    }

    #[test]
    fn index_key_codec() {
        for (kt, key) in [
            (KeyType::SrcV4, IndexKey::parse(KeyType::SrcV4, "1.2.3.4").unwrap()),
            (KeyType::SrcV6, IndexKey::parse(KeyType::SrcV6, "fe80::1").unwrap()),
            (KeyType::DstPort, IndexKey::Port(8080)),
        ] {
            let mut buf = Vec::new();
            key.encode(&mut buf);
            assert_eq!(buf.len(), kt.key_size());
            assert_eq!(IndexKey::decode(kt, &buf), key);
        }
    }

    #[test]
    fn keytype_names_roundtrip() {
        for kt in KeyType::ALL {
            assert_eq!(KeyType::from_name(kt.name()), Some(kt));
            assert_eq!(KeyType::from_disk(kt.to_disk()), Some(kt));
        }
    }
}
