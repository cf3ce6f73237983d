//! IP subnet (address + prefix length)

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// An IP address with a prefix length, describing a contiguous address range
///
/// Both IPv4 and IPv6 are supported. A `Subnet` is immutable once constructed,
/// its `prefix_len` never exceeds the bit length of its address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    address: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet, returns `None` if `prefix_len` is out of range for the address family
    pub fn new(address: IpAddr, prefix_len: u8) -> Option<Subnet> {
        if u32::from(prefix_len) > address_bits(&address) {
            return None;
        }
        Some(Subnet { address, prefix_len })
    }

    /// Create a subnet that only contains `address`
    pub fn from_addr(address: IpAddr) -> Subnet {
        Subnet {
            address,
            prefix_len: address_bits(&address) as u8,
        }
    }

    /// Parse `<ip>` or `<ip>/<prefix_len>`
    ///
    /// Returns `None` for malformed input instead of failing.
    pub fn parse(s: &str) -> Option<Subnet> {
        let mut parts = s.splitn(2, '/');
        let address = parts.next()?.parse::<IpAddr>().ok()?;
        match parts.next() {
            None => Some(Subnet::from_addr(address)),
            Some(prefix) => {
                // u8::from_str accepts a leading `+`
                if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let prefix_len = prefix.parse::<u8>().ok()?;
                Subnet::new(address, prefix_len)
            }
        }
    }

    /// The address as it was written (not masked)
    #[inline]
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length in bits
    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if the prefix covers the whole address, which is a single host
    #[inline]
    pub fn is_full_width(&self) -> bool {
        u32::from(self.prefix_len) == address_bits(&self.address)
    }

    /// The first address of this subnet
    pub fn network(&self) -> IpAddr {
        let mut bytes = address_bytes(&self.address);
        let len = bytes.len();
        mask_bytes(&mut bytes[..len], self.prefix_len);
        match self.address {
            IpAddr::V4(..) => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[..4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpAddr::V6(..) => IpAddr::V6(Ipv6Addr::from(bytes_16(&bytes))),
        }
    }

    /// Check if `addr` is inside of this subnet
    ///
    /// Always `false` if `addr` is not in the same address family.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(a), IpAddr::V4(b)) => prefix_equal(&a.octets(), &b.octets(), self.prefix_len),
            (IpAddr::V6(a), IpAddr::V6(b)) => prefix_equal(&a.octets(), &b.octets(), self.prefix_len),
            _ => false,
        }
    }

    /// Check if raw address bytes (4 bytes for IPv4, 16 bytes for IPv6) are inside of this subnet
    pub fn matches_bytes(&self, addr: &[u8]) -> bool {
        match self.address {
            IpAddr::V4(a) => addr.len() == 4 && prefix_equal(&a.octets(), addr, self.prefix_len),
            IpAddr::V6(a) => addr.len() == 16 && prefix_equal(&a.octets(), addr, self.prefix_len),
        }
    }
}

#[inline]
fn address_bits(addr: &IpAddr) -> u32 {
    match *addr {
        IpAddr::V4(..) => 32,
        IpAddr::V6(..) => 128,
    }
}

fn address_bytes(addr: &IpAddr) -> Vec<u8> {
    match *addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn bytes_16(bytes: &[u8]) -> [u8; 16] {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    octets
}

fn mask_bytes(bytes: &mut [u8], prefix_len: u8) {
    let full = (prefix_len / 8) as usize;
    let rem = prefix_len % 8;
    for (idx, b) in bytes.iter_mut().enumerate() {
        if idx < full {
            continue;
        }
        if idx == full && rem != 0 {
            *b &= 0xffu8 << (8 - rem);
        } else {
            *b = 0;
        }
    }
}

fn prefix_equal(a: &[u8], b: &[u8], prefix_len: u8) -> bool {
    let full = (prefix_len / 8) as usize;
    if a[..full] != b[..full] {
        return false;
    }
    let rem = prefix_len % 8;
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    (a[full] & mask) == (b[full] & mask)
}

impl PartialOrd for Subnet {
    fn partial_cmp(&self, other: &Subnet) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Subnet {
    // IPv4 goes first, then unsigned address bytes, then prefix length
    fn cmp(&self, other: &Subnet) -> Ordering {
        let lhs = address_bytes(&self.address);
        let rhs = address_bytes(&other.address);
        lhs.len()
            .cmp(&rhs.len())
            .then_with(|| lhs.cmp(&rhs))
            .then_with(|| self.prefix_len.cmp(&other.prefix_len))
    }
}

impl Display for Subnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_full_width() {
            Display::fmt(&self.address, f)
        } else {
            write!(f, "{}/{}", self.address, self.prefix_len)
        }
    }
}

impl Debug for Subnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl From<IpAddr> for Subnet {
    fn from(addr: IpAddr) -> Subnet {
        Subnet::from_addr(addr)
    }
}

/// Parse `Subnet` error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetError;

impl Display for SubnetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("invalid subnet")
    }
}

impl std::error::Error for SubnetError {}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Subnet, SubnetError> {
        Subnet::parse(s).ok_or(SubnetError)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn subnet(s: &str) -> Subnet {
        Subnet::parse(s).unwrap()
    }

    #[test]
    fn parse_accepts_plain_and_prefixed() {
        let s = subnet("192.168.1.1");
        assert_eq!(s.prefix_len(), 32);
        assert!(s.is_full_width());

        let s = subnet("10.0.0.0/8");
        assert_eq!(s.prefix_len(), 8);
        assert_eq!(s.address(), "10.0.0.0".parse::<IpAddr>().unwrap());

        let s = subnet("2001:db8::/32");
        assert_eq!(s.prefix_len(), 32);

        let s = subnet("::1");
        assert_eq!(s.prefix_len(), 128);

        assert_eq!(subnet("0.0.0.0/0").prefix_len(), 0);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "",
            "10.0.0.0/",
            "10.0.0.0/33",
            "10.0.0.0/-1",
            "10.0.0.0/+8",
            "10.0.0.0/8/8",
            "10.0.0.0/8 ",
            "10.0.0.0x",
            "::/129",
            "example.com",
            "(^|\\.)google\\.com$",
        ] {
            assert!(Subnet::parse(bad).is_none(), "{bad} should be rejected");
        }
    }

    #[test]
    fn display_canonical_round_trip() {
        for text in ["1.2.3.4", "10.0.0.0/8", "2001:db8::/32", "::1", "0.0.0.0/0"] {
            let s = subnet(text);
            assert_eq!(s.to_string(), text);
            assert_eq!(subnet(&s.to_string()), s);
        }

        // Non canonical IPv6 text gets normalized
        assert_eq!(subnet("2001:0db8:0000::1/64").to_string(), "2001:db8::1/64");
    }

    #[test]
    fn matches_reflexive_full_width() {
        for text in ["1.2.3.4", "255.255.255.255", "::1", "fe80::1234"] {
            let s = subnet(text);
            assert!(s.matches(&s.address()));
        }
    }

    #[test]
    fn matches_by_prefix_bits() {
        let s = subnet("10.0.0.0/8");
        assert!(s.matches(&"10.255.1.2".parse().unwrap()));
        assert!(!s.matches(&"11.0.0.0".parse().unwrap()));

        let s = subnet("192.168.0.0/23");
        assert!(s.matches(&"192.168.1.255".parse().unwrap()));
        assert!(!s.matches(&"192.168.2.0".parse().unwrap()));

        let s = subnet("0.0.0.0/0");
        assert!(s.matches(&"8.8.8.8".parse().unwrap()));

        let s = subnet("2001:db8::/33");
        assert!(s.matches(&"2001:db8:7fff::1".parse().unwrap()));
        assert!(!s.matches(&"2001:db8:8000::1".parse().unwrap()));
    }

    #[test]
    fn matches_every_prefix_len() {
        let base = Ipv4Addr::new(0b1010_1010, 0b0101_0101, 0b1100_1100, 0b0011_0011);
        let base_bits = u32::from(base);
        for p in 0..32u8 {
            let s = Subnet::new(IpAddr::V4(base), p).unwrap();
            // flip the first bit after the prefix
            let beyond = Ipv4Addr::from(base_bits ^ (1 << (31 - u32::from(p))));
            assert!(s.matches(&IpAddr::V4(beyond)), "prefix {p}");
            if p > 0 {
                // flip the last bit of the prefix
                let inside_diff = Ipv4Addr::from(base_bits ^ (1 << (32 - u32::from(p))));
                assert!(!s.matches(&IpAddr::V4(inside_diff)), "prefix {p}");
            }
            // flip the last bit of the address, beyond any prefix shorter than 32
            let tail = Ipv4Addr::from(base_bits ^ 1);
            assert_eq!(s.matches(&IpAddr::V4(tail)), p < 32, "prefix {p}");
        }
    }

    #[test]
    fn matches_family_mismatch() {
        let s = subnet("0.0.0.0/0");
        assert!(!s.matches(&"::ffff:1.2.3.4".parse().unwrap()));
        assert!(!s.matches_bytes(&[0u8; 16]));
        assert!(s.matches_bytes(&[1, 2, 3, 4]));
        assert!(!s.matches_bytes(&[1, 2, 3]));

        let s = subnet("::/0");
        assert!(!s.matches(&"1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn network_masks_address() {
        assert_eq!(subnet("10.1.2.3/8").network(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(subnet("192.168.3.7/23").network(), "192.168.2.0".parse::<IpAddr>().unwrap());
        assert_eq!(
            subnet("2001:db8:ffff::1/33").network(),
            "2001:db8:8000::".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn ordering_is_total() {
        let mut v = vec![
            subnet("::1"),
            subnet("10.0.0.0/16"),
            subnet("10.0.0.0/8"),
            subnet("9.255.0.0/16"),
            subnet("200.0.0.1"),
        ];
        v.sort();
        let s: Vec<String> = v.iter().map(ToString::to_string).collect();
        assert_eq!(s, ["9.255.0.0/16", "10.0.0.0/8", "10.0.0.0/16", "200.0.0.1", "::1"]);
    }
}
