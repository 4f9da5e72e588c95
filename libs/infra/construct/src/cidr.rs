//! CIDR arithmetic and sequential IPv4 subnet allocation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{SynthError, SynthResult};

/// An IPv4 block with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Cidr {
    base: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> SynthResult<Self> {
        let text = format!("{}/{}", addr, prefix);
        if prefix > 32 {
            return Err(SynthError::InvalidCidr {
                value: text,
                reason: "prefix length must be at most 32".to_string(),
            });
        }
        let base = u32::from(addr);
        if base & !mask_bits(prefix) != 0 {
            return Err(SynthError::InvalidCidr {
                value: text,
                reason: "host bits are set".to_string(),
            });
        }
        Ok(Self { base, prefix })
    }

    pub const fn any() -> Self {
        Self { base: 0, prefix: 0 }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn first(&self) -> Ipv4Addr {
        self.network()
    }

    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.last_u32())
    }

    /// Number of addresses in the block
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.base & mask_bits(self.prefix) == self.base
    }

    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_bits(self.prefix) == self.base
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    pub fn is_any(&self) -> bool {
        self.prefix == 0
    }

    /// Split into every `/new_prefix` block, in address order
    pub fn subnets(&self, new_prefix: u8) -> SynthResult<Vec<Ipv4Cidr>> {
        if new_prefix < self.prefix || new_prefix > 32 {
            return Err(SynthError::InvalidCidr {
                value: self.to_string(),
                reason: format!("cannot split into /{} blocks", new_prefix),
            });
        }
        let mut planner = CidrPlanner::new(*self);
        let count = 1u64 << (new_prefix - self.prefix);
        (0..count).map(|_| planner.allocate(new_prefix)).collect()
    }

    fn last_u32(&self) -> u32 {
        self.base | !mask_bits(self.prefix)
    }
}

fn mask_bits(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SynthError::InvalidCidr {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected address/prefix"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("malformed address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("malformed prefix length"))?;
        Ipv4Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

/// An IPv6 block with its host bits cleared. Displays in canonical
/// compressed form, so `0::/0` and `::0/0` both render as `::/0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv6Cidr {
    base: u128,
    prefix: u8,
}

impl Ipv6Cidr {
    pub fn new(addr: Ipv6Addr, prefix: u8) -> SynthResult<Self> {
        let text = format!("{}/{}", addr, prefix);
        if prefix > 128 {
            return Err(SynthError::InvalidCidr {
                value: text,
                reason: "prefix length must be at most 128".to_string(),
            });
        }
        let base = u128::from(addr);
        if base & !mask_bits_v6(prefix) != 0 {
            return Err(SynthError::InvalidCidr {
                value: text,
                reason: "host bits are set".to_string(),
            });
        }
        Ok(Self { base, prefix })
    }

    pub const fn any() -> Self {
        Self { base: 0, prefix: 0 }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.base)
    }

    pub fn is_any(&self) -> bool {
        self.prefix == 0
    }

    pub fn contains(&self, other: &Ipv6Cidr) -> bool {
        other.prefix >= self.prefix && other.base & mask_bits_v6(self.prefix) == self.base
    }
}

fn mask_bits_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for Ipv6Cidr {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SynthError::InvalidCidr {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected address/prefix"))?;
        let addr: Ipv6Addr = addr.parse().map_err(|_| invalid("malformed address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("malformed prefix length"))?;
        Ipv6Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Ipv6Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

/// Whether a rendered `CidrIp` / `CidrIpv6` value admits every address.
///
/// Any spelling of an IPv4 or IPv6 address with a zero-length prefix
/// counts, host bits included; unparseable text does not.
pub fn is_unrestricted_cidr(text: &str) -> bool {
    let Some((addr, prefix)) = text.trim().split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.trim().parse::<u8>() else {
        return false;
    };
    prefix == 0 && addr.trim().parse::<IpAddr>().is_ok()
}

/// Hands out aligned, non-overlapping blocks from a parent range in order.
#[derive(Debug, Clone)]
pub struct CidrPlanner {
    parent: Ipv4Cidr,
    // next free address, as u64 so the end of 255.255.255.255 is representable
    cursor: u64,
}

impl CidrPlanner {
    pub fn new(parent: Ipv4Cidr) -> Self {
        Self {
            parent,
            cursor: u64::from(parent.base),
        }
    }

    pub fn parent(&self) -> Ipv4Cidr {
        self.parent
    }

    fn end(&self) -> u64 {
        u64::from(self.parent.last_u32()) + 1
    }

    /// Addresses left after the cursor
    pub fn remaining(&self) -> u64 {
        self.end().saturating_sub(self.cursor)
    }

    /// Allocate the next `/mask` block, aligned to its own size.
    pub fn allocate(&mut self, mask: u8) -> SynthResult<Ipv4Cidr> {
        let exhausted = || SynthError::AddressSpaceExhausted {
            parent: self.parent.to_string(),
            mask,
        };
        if mask < self.parent.prefix || mask > 32 {
            return Err(exhausted());
        }
        let size = 1u64 << (32 - u32::from(mask));
        let start = self.cursor.div_ceil(size) * size;
        if start + size > self.end() {
            return Err(exhausted());
        }
        self.cursor = start + size;
        // start < 2^32 because end() <= 2^32
        Ipv4Cidr::new(Ipv4Addr::from(start as u32), mask)
    }

    /// Largest mask that lets `count` equal blocks fit in the remaining space.
    pub fn mask_for_remaining(&self, count: usize) -> SynthResult<u8> {
        let exhausted = SynthError::AddressSpaceExhausted {
            parent: self.parent.to_string(),
            mask: 32,
        };
        if count == 0 {
            return Err(exhausted);
        }
        let per_block = self.remaining() / count as u64;
        if per_block == 0 {
            return Err(exhausted);
        }
        let host_bits = 63 - per_block.leading_zeros() as u8;
        Ok(32 - host_bits.min(32))
    }
}

/// Check that every block lies inside `parent` and no two blocks overlap.
pub fn verify_disjoint_within(parent: &Ipv4Cidr, blocks: &[Ipv4Cidr]) -> SynthResult<()> {
    for (i, block) in blocks.iter().enumerate() {
        if !parent.contains(block) {
            return Err(SynthError::SubnetOutsideVpc {
                subnet: block.to_string(),
                parent: parent.to_string(),
            });
        }
        if let Some(other) = blocks[i + 1..].iter().find(|b| b.overlaps(block)) {
            return Err(SynthError::OverlappingSubnets {
                first: block.to_string(),
                second: other.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let block = cidr("10.0.0.0/22");
        assert_eq!(block.prefix(), 22);
        assert_eq!(block.size(), 1024);
        assert_eq!(block.last(), Ipv4Addr::new(10, 0, 3, 255));
        assert_eq!(block.to_string(), "10.0.0.0/22");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.1.0/22".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/16".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let parent = cidr("10.0.0.0/22");
        assert!(parent.contains(&cidr("10.0.3.0/24")));
        assert!(!parent.contains(&cidr("10.0.4.0/24")));
        assert!(!cidr("10.0.0.0/24").contains(&parent));
        assert!(cidr("10.0.0.0/24").overlaps(&parent));
        assert!(!cidr("10.0.0.0/24").overlaps(&cidr("10.0.1.0/24")));
        assert!(Ipv4Cidr::any().contains(&parent));
        assert!(parent.contains_addr(Ipv4Addr::new(10, 0, 2, 17)));
    }

    #[test]
    fn test_planner_allocates_sequential_aligned_blocks() {
        let mut planner = CidrPlanner::new(cidr("10.0.0.0/22"));
        assert_eq!(planner.allocate(24).unwrap(), cidr("10.0.0.0/24"));
        assert_eq!(planner.allocate(26).unwrap(), cidr("10.0.1.0/26"));
        // a /24 after a /26 must skip to the next /24 boundary
        assert_eq!(planner.allocate(24).unwrap(), cidr("10.0.2.0/24"));
        assert_eq!(planner.remaining(), 256);
        assert_eq!(planner.allocate(24).unwrap(), cidr("10.0.3.0/24"));
        assert!(matches!(
            planner.allocate(28),
            Err(SynthError::AddressSpaceExhausted { .. })
        ));
    }

    #[test]
    fn test_subnets_split() {
        let blocks = cidr("10.0.0.0/22").subnets(24).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[3], cidr("10.0.3.0/24"));
        assert_eq!(blocks[0].first(), Ipv4Addr::new(10, 0, 0, 0));
        assert!(cidr("10.0.0.0/22").subnets(20).is_err());
    }

    #[test]
    fn test_planner_rejects_mask_larger_than_parent() {
        let mut planner = CidrPlanner::new(cidr("10.0.0.0/22"));
        assert!(planner.allocate(20).is_err());
    }

    #[test]
    fn test_mask_for_remaining() {
        let planner = CidrPlanner::new(cidr("10.0.0.0/16"));
        assert_eq!(planner.mask_for_remaining(4).unwrap(), 18);
        assert_eq!(planner.mask_for_remaining(6).unwrap(), 19);
        assert_eq!(planner.mask_for_remaining(1).unwrap(), 16);
        assert!(planner.mask_for_remaining(0).is_err());
    }

    #[test]
    fn test_planned_blocks_are_disjoint_and_contained() {
        for parent in ["10.0.0.0/16", "172.16.0.0/20", "192.168.0.0/22"] {
            let parent = cidr(parent);
            for mask in parent.prefix() + 1..=28 {
                let mut planner = CidrPlanner::new(parent);
                let mut blocks = Vec::new();
                // alternate sizes to exercise re-alignment
                for i in 0..64u8 {
                    let m = if i % 2 == 0 { mask } else { (mask + 2).min(28) };
                    match planner.allocate(m) {
                        Ok(block) => blocks.push(block),
                        Err(_) => break,
                    }
                }
                verify_disjoint_within(&parent, &blocks).unwrap();
            }
        }
    }

    #[test]
    fn test_ipv6_parse_is_canonical() {
        let world: Ipv6Cidr = "0::/0".parse().unwrap();
        assert!(world.is_any());
        assert_eq!(world.to_string(), "::/0");
        assert_eq!("::0/0".parse::<Ipv6Cidr>().unwrap(), Ipv6Cidr::any());

        let block: Ipv6Cidr = "2001:DB8:0::/32".parse().unwrap();
        assert_eq!(block.to_string(), "2001:db8::/32");
        assert!(block.contains(&"2001:db8:1::/48".parse().unwrap()));
        assert!("2001:db8::1/32".parse::<Ipv6Cidr>().is_err());
        assert!("2001:db8::/129".parse::<Ipv6Cidr>().is_err());
        assert!("10.0.0.0/8".parse::<Ipv6Cidr>().is_err());
    }

    #[test]
    fn test_unrestricted_spellings() {
        for text in ["0.0.0.0/0", "::/0", "0::/0", "::0/0", "0:0:0:0:0:0:0:0/0", " ::/0 ", "10.1.2.3/0"] {
            assert!(is_unrestricted_cidr(text), "{} should be unrestricted", text);
        }
        for text in ["10.0.0.0/8", "::/1", "2001:db8::/32", "not-a-cidr/0", "::"] {
            assert!(!is_unrestricted_cidr(text), "{} should be restricted", text);
        }
    }

    #[test]
    fn test_verify_detects_overlap_and_escape() {
        let parent = cidr("10.0.0.0/22");
        let err = verify_disjoint_within(&parent, &[cidr("10.0.0.0/24"), cidr("10.0.0.128/25")])
            .unwrap_err();
        assert!(matches!(err, SynthError::OverlappingSubnets { .. }));

        let err = verify_disjoint_within(&parent, &[cidr("10.0.4.0/24")]).unwrap_err();
        assert!(matches!(err, SynthError::SubnetOutsideVpc { .. }));
    }
}
