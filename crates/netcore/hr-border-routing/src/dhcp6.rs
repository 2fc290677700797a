//! DHCPv6 wire format (RFC 8415) as used by the prefix delegation client.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use crate::error::{Error, Result};
use crate::prefix::new_prefix;

// ── DHCPv6 message types ────────────────────────────────────────────────────

pub const MSG_SOLICIT: u8 = 1;
pub const MSG_ADVERTISE: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_RENEW: u8 = 5;
pub const MSG_REBIND: u8 = 6;
pub const MSG_REPLY: u8 = 7;
pub const MSG_RELEASE: u8 = 8;

// ── DHCPv6 option codes ─────────────────────────────────────────────────────

pub const OPT_CLIENTID: u16 = 1;
pub const OPT_SERVERID: u16 = 2;
pub const OPT_ORO: u16 = 6;
pub const OPT_PREFERENCE: u16 = 7;
pub const OPT_ELAPSED_TIME: u16 = 8;
pub const OPT_UNICAST: u16 = 12;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_IA_PD: u16 = 25;
pub const OPT_IAPREFIX: u16 = 26;
pub const OPT_SOL_MAX_RT: u16 = 82;

// ── Ports and addresses ─────────────────────────────────────────────────────

pub const CLIENT_PORT: u16 = 546;
pub const SERVER_PORT: u16 = 547;

/// All_DHCP_Relay_Agents_and_Servers (`ff02::1:2`).
pub const ALL_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

pub const SOL_MAX_RT_MIN: u32 = 60;
pub const SOL_MAX_RT_MAX: u32 = 86400;

const HEADER_LEN: usize = 4;
const IA_PD_FIXED_LEN: usize = 12;
const IAPREFIX_FIXED_LEN: usize = 25;

pub type TransactionId = [u8; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    UnspecFail,
    NoAddrsAvail,
    NoBinding,
    NotOnLink,
    UseMulticast,
    NoPrefixAvail,
    Other(u16),
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::UnspecFail,
            2 => Self::NoAddrsAvail,
            3 => Self::NoBinding,
            4 => Self::NotOnLink,
            5 => Self::UseMulticast,
            6 => Self::NoPrefixAvail,
            other => Self::Other(other),
        }
    }
}

// ── Option iteration ────────────────────────────────────────────────────────

/// Iterates `(code, data)` pairs, stopping at the first option that does
/// not fit in the buffer.
pub struct OptionIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;
        if self.offset + 4 > data.len() {
            return None;
        }
        let code = u16::from_be_bytes([data[self.offset], data[self.offset + 1]]);
        let len = u16::from_be_bytes([data[self.offset + 2], data[self.offset + 3]]) as usize;
        let start = self.offset + 4;
        if start + len > data.len() {
            self.offset = data.len();
            return None;
        }
        self.offset = start + len;
        Some((code, &data[start..start + len]))
    }
}

pub fn iter_options(data: &[u8]) -> OptionIter<'_> {
    OptionIter { data, offset: 0 }
}

/// Checks that `data` is an exact sequence of well-formed options.
fn options_fit(data: &[u8]) -> bool {
    let mut offset = 0;
    while offset < data.len() {
        if offset + 4 > data.len() {
            return false;
        }
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4 + len;
    }
    offset == data.len()
}

pub fn find_option(data: &[u8], option_code: u16) -> Option<&[u8]> {
    iter_options(data).find(|(code, _)| *code == option_code).map(|(_, d)| d)
}

/// Status carried in `data`. A missing option means success.
pub fn read_status(data: &[u8]) -> StatusCode {
    match find_option(data, OPT_STATUS_CODE) {
        None => StatusCode::Success,
        Some(d) if d.len() >= 2 => StatusCode::from(u16::from_be_bytes([d[0], d[1]])),
        Some(_) => StatusCode::UnspecFail,
    }
}

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Dhcp6Message<'a> {
    pub msg_type: u8,
    pub transaction_id: TransactionId,
    options: &'a [u8],
}

impl<'a> Dhcp6Message<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Parse("dhcpv6 header"));
        }
        let options = &data[HEADER_LEN..];
        if !options_fit(options) {
            return Err(Error::Parse("dhcpv6 option overruns message"));
        }
        Ok(Self {
            msg_type: data[0],
            transaction_id: [data[1], data[2], data[3]],
            options,
        })
    }

    pub fn option(&self, code: u16) -> Option<&'a [u8]> {
        find_option(self.options, code)
    }

    pub fn options_of(&self, code: u16) -> impl Iterator<Item = &'a [u8]> {
        iter_options(self.options).filter(move |(c, _)| *c == code).map(|(_, d)| d)
    }

    pub fn status(&self) -> StatusCode {
        read_status(self.options)
    }

    /// Preference option value; zero when absent.
    pub fn preference(&self) -> u8 {
        self.option(OPT_PREFERENCE).and_then(|d| d.first().copied()).unwrap_or(0)
    }

    pub fn server_unicast(&self) -> Option<Ipv6Addr> {
        let data = self.option(OPT_UNICAST)?;
        let octets: [u8; 16] = data.get(..16)?.try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    }

    pub fn sol_max_rt(&self) -> Option<u32> {
        let data = self.option(OPT_SOL_MAX_RT)?;
        Some(u32::from_be_bytes(data.get(..4)?.try_into().ok()?))
    }
}

// ── IA_PD / IA Prefix ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct IaPd<'a> {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub options: &'a [u8],
}

impl<'a> IaPd<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < IA_PD_FIXED_LEN {
            return None;
        }
        Some(Self {
            iaid: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            t1: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            t2: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            options: &data[IA_PD_FIXED_LEN..],
        })
    }

    pub fn status(&self) -> StatusCode {
        read_status(self.options)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = IaPrefix> + 'a {
        iter_options(self.options)
            .filter(|(code, _)| *code == OPT_IAPREFIX)
            .filter_map(|(_, data)| IaPrefix::parse(data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaPrefix {
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
}

impl IaPrefix {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IAPREFIX_FIXED_LEN {
            return None;
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[9..25]);
        Some(Self {
            preferred_lifetime: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            valid_lifetime: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            prefix_len: data[8],
            prefix: Ipv6Addr::from(octets),
        })
    }

    pub fn net(&self) -> Ipv6Net {
        new_prefix(self.prefix, self.prefix_len)
    }
}

// ── Builders ────────────────────────────────────────────────────────────────

pub fn append_option(buf: &mut Vec<u8>, code: u16, data: &[u8]) {
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

pub fn append_header(buf: &mut Vec<u8>, msg_type: u8, xid: &TransactionId) {
    buf.push(msg_type);
    buf.extend_from_slice(xid);
}

/// IA_PD option data with T1 = T2 = 0 and one IA Prefix hint with zero
/// lifetimes.
pub fn build_ia_pd(iaid: u32, prefix: &Ipv6Net) -> Vec<u8> {
    let mut data = Vec::with_capacity(IA_PD_FIXED_LEN + 4 + IAPREFIX_FIXED_LEN);

    data.extend_from_slice(&iaid.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes()); // T1
    data.extend_from_slice(&0u32.to_be_bytes()); // T2

    let mut prefix_data = Vec::with_capacity(IAPREFIX_FIXED_LEN);
    prefix_data.extend_from_slice(&0u32.to_be_bytes()); // preferred lifetime
    prefix_data.extend_from_slice(&0u32.to_be_bytes()); // valid lifetime
    prefix_data.push(prefix.prefix_len());
    prefix_data.extend_from_slice(&prefix.trunc().addr().octets());
    append_option(&mut data, OPT_IAPREFIX, &prefix_data);

    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_overrunning_option() {
        let mut msg = vec![MSG_REPLY, 1, 2, 3];
        append_option(&mut msg, OPT_SERVERID, &[0xaa; 4]);
        assert!(Dhcp6Message::parse(&msg).is_ok());

        msg.extend_from_slice(&[0, 13, 0, 10, 0]);
        assert!(Dhcp6Message::parse(&msg).is_err());
        assert!(Dhcp6Message::parse(&[MSG_REPLY, 1]).is_err());
    }

    #[test]
    fn test_status_defaults_to_success() {
        let mut msg = vec![MSG_REPLY, 1, 2, 3];
        append_option(&mut msg, OPT_SERVERID, &[0xaa; 4]);
        assert_eq!(Dhcp6Message::parse(&msg).unwrap().status(), StatusCode::Success);

        append_option(&mut msg, OPT_STATUS_CODE, &[0, 6]);
        assert_eq!(Dhcp6Message::parse(&msg).unwrap().status(), StatusCode::NoPrefixAvail);
    }

    #[test]
    fn test_ia_pd_roundtrip() {
        let hint: Ipv6Net = "2001:db8:0:10::/60".parse().unwrap();
        let data = build_ia_pd(0, &hint);

        let ia = IaPd::parse(&data).unwrap();
        assert_eq!((ia.iaid, ia.t1, ia.t2), (0, 0, 0));
        assert_eq!(ia.status(), StatusCode::Success);
        let prefixes: Vec<_> = ia.prefixes().collect();
        assert_eq!(prefixes.len(), 1);
        assert_eq!(prefixes[0].net(), hint);
        assert_eq!(prefixes[0].valid_lifetime, 0);
    }

    #[test]
    fn test_optional_scalars() {
        let server: Ipv6Addr = "2001:db8::547".parse().unwrap();
        let mut msg = vec![MSG_ADVERTISE, 9, 9, 9];
        append_option(&mut msg, OPT_PREFERENCE, &[255]);
        append_option(&mut msg, OPT_UNICAST, &server.octets());
        append_option(&mut msg, OPT_SOL_MAX_RT, &7200u32.to_be_bytes());

        let parsed = Dhcp6Message::parse(&msg).unwrap();
        assert_eq!(parsed.transaction_id, [9, 9, 9]);
        assert_eq!(parsed.preference(), 255);
        assert_eq!(parsed.server_unicast(), Some(server));
        assert_eq!(parsed.sol_max_rt(), Some(7200));
    }
}
