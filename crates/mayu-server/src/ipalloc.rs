//! IPv4 address arithmetic and allocation from configured ranges

use mayu_common::IpRange;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("cannot increment {0}: address space exhausted")]
    Overflow(Ipv4Addr),

    #[error("no free address left in range {start}-{end}")]
    RangeExhausted { start: Ipv4Addr, end: Ipv4Addr },

    #[error("invalid range {start}-{end}")]
    InvalidRange { start: Ipv4Addr, end: Ipv4Addr },
}

/// The next address, carrying into higher octets
pub fn increment(ip: Ipv4Addr) -> Result<Ipv4Addr, AllocError> {
    u32::from(ip)
        .checked_add(1)
        .map(Ipv4Addr::from)
        .ok_or(AllocError::Overflow(ip))
}

pub fn less_than_or_equal(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    u32::from(a) <= u32::from(b)
}

pub fn greater_than_or_equal(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    u32::from(a) >= u32::from(b)
}

pub fn in_range(range: &IpRange, ip: Ipv4Addr) -> bool {
    greater_than_or_equal(ip, range.start) && less_than_or_equal(ip, range.end)
}

/// Lowest address of `range` that is neither multicast nor in `taken`
pub fn next_free(range: &IpRange, taken: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, AllocError> {
    if !less_than_or_equal(range.start, range.end) {
        return Err(AllocError::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }

    let mut ip = range.start;
    loop {
        if !ip.is_multicast() && !taken.contains(&ip) {
            return Ok(ip);
        }
        if ip == range.end {
            break;
        }
        ip = increment(ip)?;
    }
    Err(AllocError::RangeExhausted {
        start: range.start,
        end: range.end,
    })
}
