//! Client address allow-list
//!
//! Syntax: items separated by commas or whitespace, each one of
//! `addr`, `low-high` or `addr/prefix`. IPv4 and IPv6 may be mixed.
//! IPv4-mapped IPv6 peers match IPv4 items.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

fn octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.octets().to_vec(),
            None => v6.octets().to_vec(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IpRange {
    low: Vec<u8>,
    high: Vec<u8>,
}

impl IpRange {
    fn contains(&self, addr: &[u8]) -> bool {
        addr.len() == self.low.len() && self.low.as_slice() <= addr && addr <= self.high.as_slice()
    }
}

fn parse_addr(text: &str, item: &str) -> Result<Vec<u8>> {
    text.trim()
        .parse::<IpAddr>()
        .map(octets)
        .map_err(|_| Error::InvalidRange(item.to_string()))
}

fn parse_item(item: &str) -> Result<IpRange> {
    if let Some((addr, prefix)) = item.split_once('/') {
        let base = parse_addr(addr, item)?;
        let bits = base.len() * 8;
        let prefix: usize = prefix
            .trim()
            .parse()
            .ok()
            .filter(|p| *p <= bits)
            .ok_or_else(|| Error::InvalidRange(item.to_string()))?;
        let mut low = base.clone();
        let mut high = base;
        for i in 0..bits {
            if i >= prefix {
                let (byte, bit) = (i / 8, 7 - (i % 8));
                low[byte] &= !(1 << bit);
                high[byte] |= 1 << bit;
            }
        }
        return Ok(IpRange { low, high });
    }
    if let Some((a, b)) = item.split_once('-') {
        let low = parse_addr(a, item)?;
        let high = parse_addr(b, item)?;
        if low.len() != high.len() || low > high {
            return Err(Error::InvalidRange(item.to_string()));
        }
        return Ok(IpRange { low, high });
    }
    let addr = parse_addr(item, item)?;
    Ok(IpRange {
        low: addr.clone(),
        high: addr,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRangeList {
    ranges: Vec<IpRange>,
    text: String,
}

impl IpRangeList {
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = octets(addr);
        self.ranges.iter().any(|r| r.contains(&addr))
    }
}

impl FromStr for IpRangeList {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let ranges = text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(parse_item)
            .collect::<Result<Vec<_>>>()?;
        if ranges.is_empty() {
            return Err(Error::InvalidRange(text.to_string()));
        }
        Ok(Self {
            ranges,
            text: text.to_string(),
        })
    }
}

impl fmt::Display for IpRangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_and_list() {
        let list: IpRangeList = "127.0.0.1, 10.0.0.5 ::1".parse().unwrap();
        assert!(list.contains(ip("127.0.0.1")));
        assert!(list.contains(ip("10.0.0.5")));
        assert!(list.contains(ip("::1")));
        assert!(!list.contains(ip("10.0.0.6")));
    }

    #[test]
    fn test_prefix() {
        let list: IpRangeList = "192.168.0.0/16".parse().unwrap();
        assert!(list.contains(ip("192.168.44.3")));
        assert!(!list.contains(ip("192.169.0.1")));

        let all: IpRangeList = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(ip("8.8.8.8")));
        assert!(!all.contains(ip("fe80::1")));
    }

    #[test]
    fn test_span_and_mapped_v6() {
        let list: IpRangeList = "10.0.0.1-10.0.0.9".parse().unwrap();
        assert!(list.contains(ip("10.0.0.9")));
        assert!(!list.contains(ip("10.0.0.10")));
        assert!(list.contains(ip("::ffff:10.0.0.3")));
    }

    #[test]
    fn test_invalid_ranges() {
        assert!("".parse::<IpRangeList>().is_err());
        assert!("10.0.0.1/33".parse::<IpRangeList>().is_err());
        assert!("10.0.0.9-10.0.0.1".parse::<IpRangeList>().is_err());
        assert!("not-an-ip".parse::<IpRangeList>().is_err());
        assert!("10.0.0.1-::1".parse::<IpRangeList>().is_err());
    }
}
