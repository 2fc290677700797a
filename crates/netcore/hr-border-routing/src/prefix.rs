//! IPv6 prefix classification and derivation helpers.

use std::fmt;
use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ── Route preference ────────────────────────────────────────────────────────

/// Route preference (RFC 4191). Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePreference {
    Low,
    Medium,
    High,
}

impl RoutePreference {
    /// Decodes the 2-bit wire value. The reserved value `0b10` is rejected.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x03 {
            0b00 => Some(Self::Medium),
            0b01 => Some(Self::High),
            0b11 => Some(Self::Low),
            _ => None,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Medium => 0b00,
            Self::High => 0b01,
            Self::Low => 0b11,
        }
    }
}

impl Default for RoutePreference {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for RoutePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

// ── Construction ────────────────────────────────────────────────────────────

/// Builds a truncated prefix, clamping the length to 128.
pub fn new_prefix(addr: Ipv6Addr, len: u8) -> Ipv6Net {
    let len = len.min(128);
    // Length is clamped above, so construction cannot fail.
    Ipv6Net::new(addr, len).map(|n| n.trunc()).unwrap_or_default()
}

/// `::/0`
pub fn default_route() -> Ipv6Net {
    Ipv6Net::default()
}

/// `fc00::/7`
pub fn ula_aggregate() -> Ipv6Net {
    new_prefix(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7)
}

// ── Classification ──────────────────────────────────────────────────────────

pub fn is_ula(prefix: &Ipv6Net) -> bool {
    prefix.prefix_len() >= 7 && (prefix.addr().octets()[0] & 0xfe) == 0xfc
}

pub fn is_link_local(prefix: &Ipv6Net) -> bool {
    let o = prefix.addr().octets();
    prefix.prefix_len() >= 10 && o[0] == 0xfe && (o[1] & 0xc0) == 0x80
}

pub fn is_multicast(prefix: &Ipv6Net) -> bool {
    prefix.prefix_len() >= 8 && prefix.addr().octets()[0] == 0xff
}

pub fn is_valid_omr_prefix(prefix: &Ipv6Net) -> bool {
    prefix.prefix_len() == 64 && !is_link_local(prefix) && !is_multicast(prefix)
}

pub fn is_valid_on_link_prefix(prefix: &Ipv6Net) -> bool {
    is_valid_omr_prefix(prefix)
}

pub fn is_valid_br_ula_prefix(prefix: &Ipv6Net) -> bool {
    prefix.prefix_len() == 48 && prefix.addr().octets()[0] == 0xfd
}

pub fn is_valid_nat64_prefix(prefix: &Ipv6Net) -> bool {
    matches!(prefix.prefix_len(), 32 | 40 | 48 | 56 | 64 | 96)
}

pub fn is_valid_pd_prefix(prefix: &Ipv6Net) -> bool {
    prefix.prefix_len() <= 64 && !is_link_local(prefix) && !is_multicast(prefix)
}

// ── Derivation ──────────────────────────────────────────────────────────────

pub const OMR_SUBNET_ID: u16 = 1;
pub const NAT64_SUBNET_ID: u16 = 2;

/// Random `fdxx:xxxx:xxxx::/48` (RFC 4193 global id drawn from the rng).
pub fn generate_br_ula_prefix() -> Ipv6Net {
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    rand::rng().fill(&mut octets[1..6]);
    new_prefix(Ipv6Addr::from(octets), 48)
}

/// `/64` with the given subnet id under a `/48`.
pub fn subnet_prefix(br_ula: &Ipv6Net, subnet_id: u16) -> Ipv6Net {
    let mut octets = br_ula.addr().octets();
    octets[6..8].copy_from_slice(&subnet_id.to_be_bytes());
    new_prefix(Ipv6Addr::from(octets), 64)
}

pub fn local_omr_prefix(br_ula: &Ipv6Net) -> Ipv6Net {
    subnet_prefix(br_ula, OMR_SUBNET_ID)
}

/// `/96` NAT64 prefix (subnet 2, bytes 8..12 zero).
pub fn local_nat64_prefix(br_ula: &Ipv6Net) -> Ipv6Net {
    let subnet = subnet_prefix(br_ula, NAT64_SUBNET_ID);
    new_prefix(subnet.addr(), 96)
}

/// On-link ULA `/64` derived from the mesh extended PAN id:
/// `fd` + ext_pan_id[0..5] as global id, ext_pan_id[6..8] as subnet id.
pub fn on_link_prefix_from_ext_pan_id(ext_pan_id: &[u8; 8]) -> Ipv6Net {
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    octets[1..6].copy_from_slice(&ext_pan_id[0..5]);
    octets[6..8].copy_from_slice(&ext_pan_id[6..8]);
    new_prefix(Ipv6Addr::from(octets), 64)
}

/// Pads a prefix no longer than 64 bits to a `/64` with trailing zero bits.
pub fn pad_to_64(prefix: &Ipv6Net) -> Option<Ipv6Net> {
    if prefix.prefix_len() > 64 {
        return None;
    }
    Some(new_prefix(prefix.trunc().addr(), 64))
}
