//! Neighbor Discovery message codec (RFC 4861, RFC 4191, RFC 5175, RFC 8106).
//!
//! Parsing is lenient at the option level: an option whose length is zero or
//! overruns the message ends option iteration, while a well-framed but
//! invalid PIO/RIO/RDNSS record is skipped on its own.

use std::net::Ipv6Addr;

use bytes::{BufMut, BytesMut};
use ipnet::Ipv6Net;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::prefix::{new_prefix, RoutePreference};

// ── ICMPv6 types ────────────────────────────────────────────────────────────

pub const ICMP6_ROUTER_SOLICIT: u8 = 133;
pub const ICMP6_ROUTER_ADVERT: u8 = 134;
pub const ICMP6_NEIGHBOR_SOLICIT: u8 = 135;
pub const ICMP6_NEIGHBOR_ADVERT: u8 = 136;

// ── ND option types ─────────────────────────────────────────────────────────

const OPT_SOURCE_LL_ADDR: u8 = 1;
const OPT_TARGET_LL_ADDR: u8 = 2;
const OPT_PREFIX_INFO: u8 = 3;
const OPT_ROUTE_INFO: u8 = 24;
const OPT_RDNSS: u8 = 25;
const OPT_RA_FLAGS_EXT: u8 = 26;

// ── Flags ───────────────────────────────────────────────────────────────────

const RA_FLAG_MANAGED: u8 = 0x80;
const RA_FLAG_OTHER: u8 = 0x40;
const RA_FLAG_SNAC_ROUTER: u8 = 0x02;
const RA_PREFERENCE_SHIFT: u8 = 3;
const RA_PREFERENCE_MASK: u8 = 0x03 << RA_PREFERENCE_SHIFT;

const PIO_FLAG_ON_LINK: u8 = 0x80;
const PIO_FLAG_AUTO_CONFIG: u8 = 0x40;
const PIO_FLAG_DHCP6_PD_PREFERRED: u8 = 0x10;

const FLAGS_EXT_STUB_ROUTER: u8 = 0x80;

const NA_FLAG_ROUTER: u8 = 0x80;
const NA_FLAG_SOLICITED: u8 = 0x40;
const NA_FLAG_OVERRIDE: u8 = 0x20;

const RA_HEADER_LEN: usize = 16;
const NA_LEN: usize = 24;

/// Upper bound of an RA this engine emits (IPv6 minimum MTU).
pub const MAX_RA_SIZE: usize = 1280;

/// Link-scope all-nodes multicast (`ff02::1`).
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
/// Link-scope all-routers multicast (`ff02::2`).
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn addr_from(b: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&b[..16]);
    Ipv6Addr::from(octets)
}

// ── RA header ───────────────────────────────────────────────────────────────

/// The fixed part of a Router Advertisement after the ICMPv6 type/code/checksum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaHeader {
    pub cur_hop_limit: u8,
    pub flags: u8,
    pub router_lifetime: u16,
    pub reachable_time: u32,
    pub retrans_timer: u32,
}

impl RaHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RA_HEADER_LEN || data[0] != ICMP6_ROUTER_ADVERT || data[1] != 0 {
            return None;
        }
        Some(Self {
            cur_hop_limit: data[4],
            flags: data[5],
            router_lifetime: be_u16(&data[6..8]),
            reachable_time: be_u32(&data[8..12]),
            retrans_timer: be_u32(&data[12..16]),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(ICMP6_ROUTER_ADVERT);
        buf.put_u8(0);
        buf.put_u16(0); // checksum, filled by the kernel
        buf.put_u8(self.cur_hop_limit);
        buf.put_u8(self.flags);
        buf.put_u16(self.router_lifetime);
        buf.put_u32(self.reachable_time);
        buf.put_u32(self.retrans_timer);
    }

    pub fn managed_flag(&self) -> bool {
        self.flags & RA_FLAG_MANAGED != 0
    }

    pub fn other_flag(&self) -> bool {
        self.flags & RA_FLAG_OTHER != 0
    }

    pub fn snac_router_flag(&self) -> bool {
        self.flags & RA_FLAG_SNAC_ROUTER != 0
    }

    pub fn set_managed_flag(&mut self, on: bool) {
        self.set_flag(RA_FLAG_MANAGED, on);
    }

    pub fn set_other_flag(&mut self, on: bool) {
        self.set_flag(RA_FLAG_OTHER, on);
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Default router preference; the reserved encoding reads as medium.
    pub fn default_route_preference(&self) -> RoutePreference {
        RoutePreference::from_bits((self.flags & RA_PREFERENCE_MASK) >> RA_PREFERENCE_SHIFT)
            .unwrap_or(RoutePreference::Medium)
    }

    pub fn set_default_route_preference(&mut self, preference: RoutePreference) {
        self.flags = (self.flags & !RA_PREFERENCE_MASK) | (preference.to_bits() << RA_PREFERENCE_SHIFT);
    }
}

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInfoOption {
    pub prefix: Ipv6Net,
    pub on_link: bool,
    pub auto_addr_config: bool,
    pub dhcp6_pd_preferred: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

impl PrefixInfoOption {
    /// `body` is the full option including type and length.
    fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 32 {
            return None;
        }
        let prefix_len = body[2];
        let valid_lifetime = be_u32(&body[4..8]);
        let preferred_lifetime = be_u32(&body[8..12]);
        if prefix_len > 128 || preferred_lifetime > valid_lifetime {
            return None;
        }
        Some(Self {
            prefix: new_prefix(addr_from(&body[16..32]), prefix_len),
            on_link: body[3] & PIO_FLAG_ON_LINK != 0,
            auto_addr_config: body[3] & PIO_FLAG_AUTO_CONFIG != 0,
            dhcp6_pd_preferred: body[3] & PIO_FLAG_DHCP6_PD_PREFERRED != 0,
            valid_lifetime,
            preferred_lifetime,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInfoOption {
    pub prefix: Ipv6Net,
    pub preference: RoutePreference,
    pub lifetime: u32,
}

impl RouteInfoOption {
    /// Option length in 8-octet units needed for a prefix of `prefix_len` bits.
    pub fn length_for_prefix(prefix_len: u8) -> u8 {
        match prefix_len {
            0 => 1,
            1..=64 => 2,
            _ => 3,
        }
    }

    fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 8 {
            return None;
        }
        let prefix_len = body[2];
        if prefix_len > 128 || body.len() < Self::length_for_prefix(prefix_len) as usize * 8 {
            return None;
        }
        let preference = RoutePreference::from_bits(body[3] >> 3)?;
        let mut octets = [0u8; 16];
        let prefix_bytes = (prefix_len as usize).div_ceil(8);
        octets[..prefix_bytes].copy_from_slice(&body[8..8 + prefix_bytes]);
        Some(Self {
            prefix: new_prefix(Ipv6Addr::from(octets), prefix_len),
            preference,
            lifetime: be_u32(&body[4..8]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdnssOption {
    pub lifetime: u32,
    pub addresses: Vec<Ipv6Addr>,
}

impl RdnssOption {
    fn parse(body: &[u8]) -> Option<Self> {
        let units = body[1] as usize;
        if units < 3 || units % 2 == 0 {
            return None;
        }
        let addresses = body[8..units * 8].chunks_exact(16).map(addr_from).collect();
        Some(Self {
            lifetime: be_u32(&body[4..8]),
            addresses,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdOption {
    PrefixInfo(PrefixInfoOption),
    RouteInfo(RouteInfoOption),
    Rdnss(RdnssOption),
    FlagsExt { stub_router: bool },
    SourceLinkLayer(Vec<u8>),
    TargetLinkLayer(Vec<u8>),
}

/// Walks the TLV options in `data`, skipping invalid records.
pub fn parse_options(data: &[u8]) -> Vec<NdOption> {
    let mut options = Vec::new();
    let mut offset = 0;

    while offset + 2 <= data.len() {
        let kind = data[offset];
        let len = data[offset + 1] as usize * 8;
        if len == 0 || offset + len > data.len() {
            debug!("ND option at offset {} has invalid length, stopping", offset);
            break;
        }
        let body = &data[offset..offset + len];

        let parsed = match kind {
            OPT_PREFIX_INFO => PrefixInfoOption::parse(body).map(NdOption::PrefixInfo),
            OPT_ROUTE_INFO => RouteInfoOption::parse(body).map(NdOption::RouteInfo),
            OPT_RDNSS => RdnssOption::parse(body).map(NdOption::Rdnss),
            OPT_RA_FLAGS_EXT => Some(NdOption::FlagsExt {
                stub_router: body[2] & FLAGS_EXT_STUB_ROUTER != 0,
            }),
            OPT_SOURCE_LL_ADDR => Some(NdOption::SourceLinkLayer(body[2..].to_vec())),
            OPT_TARGET_LL_ADDR => Some(NdOption::TargetLinkLayer(body[2..].to_vec())),
            _ => None,
        };

        match parsed {
            Some(option) => options.push(option),
            None if matches!(kind, OPT_PREFIX_INFO | OPT_ROUTE_INFO | OPT_RDNSS) => {
                debug!("Skipping invalid ND option type {}", kind);
            }
            None => {}
        }

        offset += len;
    }

    options
}

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvert {
    pub header: RaHeader,
    pub options: Vec<NdOption>,
}

impl RouterAdvert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = RaHeader::parse(data).ok_or(Error::Parse("router advertisement header"))?;
        Ok(Self {
            header,
            options: parse_options(&data[RA_HEADER_LEN..]),
        })
    }

    pub fn prefix_infos(&self) -> impl Iterator<Item = &PrefixInfoOption> {
        self.options.iter().filter_map(|o| match o {
            NdOption::PrefixInfo(pio) => Some(pio),
            _ => None,
        })
    }

    pub fn route_infos(&self) -> impl Iterator<Item = &RouteInfoOption> {
        self.options.iter().filter_map(|o| match o {
            NdOption::RouteInfo(rio) => Some(rio),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborAdvert {
    pub router: bool,
    pub solicited: bool,
    pub override_flag: bool,
    pub target: Ipv6Addr,
}

impl NeighborAdvert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NA_LEN || data[0] != ICMP6_NEIGHBOR_ADVERT || data[1] != 0 {
            return Err(Error::Parse("neighbor advertisement"));
        }
        Ok(Self {
            router: data[4] & NA_FLAG_ROUTER != 0,
            solicited: data[4] & NA_FLAG_SOLICITED != 0,
            override_flag: data[4] & NA_FLAG_OVERRIDE != 0,
            target: addr_from(&data[8..24]),
        })
    }
}

pub fn is_router_solicit(data: &[u8]) -> bool {
    data.len() >= 8 && data[0] == ICMP6_ROUTER_SOLICIT && data[1] == 0
}

// ── Builders ────────────────────────────────────────────────────────────────

/// Incrementally builds a Router Advertisement.
#[derive(Debug)]
pub struct RaBuilder {
    buf: BytesMut,
    option_count: usize,
}

impl RaBuilder {
    pub fn new(header: &RaHeader) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        header.write(&mut buf);
        Self { buf, option_count: 0 }
    }

    fn reserve(&mut self, len: usize) -> Result<()> {
        if self.buf.len() + len > MAX_RA_SIZE {
            return Err(Error::NoBufs);
        }
        self.option_count += 1;
        Ok(())
    }

    /// Appends a PIO with the on-link and autonomous flags set.
    pub fn append_pio(&mut self, prefix: &Ipv6Net, valid_lifetime: u32, preferred_lifetime: u32) -> Result<()> {
        self.reserve(32)?;
        self.buf.put_u8(OPT_PREFIX_INFO);
        self.buf.put_u8(4);
        self.buf.put_u8(prefix.prefix_len());
        self.buf.put_u8(PIO_FLAG_ON_LINK | PIO_FLAG_AUTO_CONFIG);
        self.buf.put_u32(valid_lifetime);
        self.buf.put_u32(preferred_lifetime);
        self.buf.put_u32(0);
        self.buf.put_slice(&prefix.trunc().addr().octets());
        Ok(())
    }

    pub fn append_rio(&mut self, prefix: &Ipv6Net, lifetime: u32, preference: RoutePreference) -> Result<()> {
        let units = RouteInfoOption::length_for_prefix(prefix.prefix_len());
        self.reserve(units as usize * 8)?;
        self.buf.put_u8(OPT_ROUTE_INFO);
        self.buf.put_u8(units);
        self.buf.put_u8(prefix.prefix_len());
        self.buf.put_u8(preference.to_bits() << 3);
        self.buf.put_u32(lifetime);
        let octets = prefix.trunc().addr().octets();
        self.buf.put_slice(&octets[..(units as usize - 1) * 8]);
        Ok(())
    }

    pub fn append_flags_ext(&mut self, stub_router: bool) -> Result<()> {
        self.reserve(8)?;
        self.buf.put_u8(OPT_RA_FLAGS_EXT);
        self.buf.put_u8(1);
        self.buf.put_u8(if stub_router { FLAGS_EXT_STUB_ROUTER } else { 0 });
        self.buf.put_bytes(0, 5);
        Ok(())
    }

    pub fn has_options(&self) -> bool {
        self.option_count > 0
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

pub fn build_router_solicit() -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(ICMP6_ROUTER_SOLICIT);
    buf.push(0);
    buf.extend_from_slice(&[0, 0]); // checksum
    buf.extend_from_slice(&[0, 0, 0, 0]); // reserved
    buf
}

/// Neighbor Solicitation for `target`, carrying a source link-layer option
/// when the interface address is known.
pub fn build_neighbor_solicit(target: Ipv6Addr, source_ll: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.push(ICMP6_NEIGHBOR_SOLICIT);
    buf.push(0);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.extend_from_slice(&target.octets());

    if let Some(ll) = source_ll.filter(|ll| !ll.is_empty()) {
        let units = (2 + ll.len()).div_ceil(8);
        buf.push(OPT_SOURCE_LL_ADDR);
        buf.push(units as u8);
        buf.extend_from_slice(ll);
        buf.resize(buf.len() + units * 8 - 2 - ll.len(), 0);
    }

    buf
}

/// SHA-256 of an RA with the checksum field zeroed, so that a copy looped
/// back by the kernel (checksum filled in) still matches.
pub fn ra_hash(ra: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if ra.len() >= 4 {
        hasher.update(&ra[..2]);
        hasher.update([0, 0]);
        hasher.update(&ra[4..]);
    } else {
        hasher.update(ra);
    }
    hasher.finalize().into()
}
