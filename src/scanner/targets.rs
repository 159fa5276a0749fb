use std::{
    fmt, mem,
    net::{Ipv4Addr, SocketAddrV4},
    str::FromStr,
};

use perfect_rand::PerfectRng;

/// The input was neither a CIDR block, a dotted `start-end` range, nor a
/// single address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    Empty,
    InvalidAddress(String),
    InvalidPrefix(String),
    ReversedRange { start: Ipv4Addr, end: Ipv4Addr },
    Malformed(String),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::Empty => write!(f, "empty range"),
            InputError::InvalidAddress(addr) => write!(f, "invalid IPv4 address {addr:?}"),
            InputError::InvalidPrefix(prefix) => {
                write!(f, "invalid prefix length {prefix:?} (must be 0-32)")
            }
            InputError::ReversedRange { start, end } => {
                write!(f, "invalid range {start}-{end} (start cannot be greater than end)")
            }
            InputError::Malformed(input) => write!(
                f,
                "invalid range {input:?} (expected a.b.c.d/n or a.b.c.d-e.f.g.h)"
            ),
        }
    }
}

impl std::error::Error for InputError {}

/// Parse a range like `10.0.0.0/24`, `10.0.0.1-10.0.0.9`, or a single
/// address.
///
/// Host bits in a CIDR block are ignored, so `10.0.0.7/30` is the same as
/// `10.0.0.4/30`.
pub fn parse_range(input: &str) -> Result<Ipv4Range, InputError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(InputError::Empty);
    }

    let is_slash = input.contains('/');
    let is_hyphen = input.contains('-');
    if is_slash && is_hyphen {
        return Err(InputError::Malformed(input.to_string()));
    }

    if is_slash {
        let (ip, prefix) = input
            .split_once('/')
            .ok_or_else(|| InputError::Malformed(input.to_string()))?;
        let ip = parse_addr(ip)?;
        let prefix = prefix
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|&p| p <= 32)
            .ok_or_else(|| InputError::InvalidPrefix(prefix.trim().to_string()))?;

        Ok(Ipv4Range::cidr(ip, prefix))
    } else if is_hyphen {
        let (start, end) = input
            .split_once('-')
            .ok_or_else(|| InputError::Malformed(input.to_string()))?;
        let start = parse_addr(start)?;
        let end = parse_addr(end)?;
        if start > end {
            return Err(InputError::ReversedRange { start, end });
        }
        Ok(Ipv4Range { start, end })
    } else {
        Ok(Ipv4Range::single(parse_addr(input)?))
    }
}

fn parse_addr(s: &str) -> Result<Ipv4Addr, InputError> {
    let s = s.trim();
    Ipv4Addr::from_str(s).map_err(|_| InputError::InvalidAddress(s.to_string()))
}

fn host_mask(prefix: u8) -> u32 {
    let host_bits = 32 - prefix as u32;
    if host_bits == 32 {
        u32::MAX
    } else {
        (1u32 << host_bits) - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub addr_start: Ipv4Addr,
    pub addr_end: Ipv4Addr,
    pub port_start: u16,
    pub port_end: u16,
}

impl ScanRange {
    pub fn count_addresses(&self) -> usize {
        (u32::from(self.addr_end) - u32::from(self.addr_start)) as usize + 1
    }

    pub fn count_ports(&self) -> usize {
        (self.port_end - self.port_start) as usize + 1
    }

    /// Count the number of combinations of addresses and ports in this range.
    pub fn count(&self) -> usize {
        self.count_addresses() * self.count_ports()
    }

    /// Get the address and port at the given index.
    pub fn index(&self, index: usize) -> SocketAddrV4 {
        let port_count = self.count_ports();
        let addr_index = index / port_count;
        let port_index = index % port_count;
        let addr = u32::from(self.addr_start) + addr_index as u32;
        let port = self.port_start + port_index as u16;
        SocketAddrV4::new(Ipv4Addr::from(addr), port)
    }

    pub fn single(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr_start: addr,
            addr_end: addr,
            port_start: port,
            port_end: port,
        }
    }
    pub fn single_port(addr_start: Ipv4Addr, addr_end: Ipv4Addr, port: u16) -> Self {
        Self {
            addr_start,
            addr_end,
            port_start: port,
            port_end: port,
        }
    }
    pub fn from_ipv4_range(range: Ipv4Range, port: u16) -> Self {
        Self::single_port(range.start, range.end, port)
    }
}

#[derive(Default, Clone, Debug, PartialEq)]
pub struct ScanRanges {
    /// The ranges in order of `addr_start`.
    ranges: Vec<ScanRange>,
}

impl ScanRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to the set of ranges. There is no push function because it'd be too
    /// inefficient, you can call this with a single-item vec if you really need
    /// to.
    pub fn extend(&mut self, ranges: Vec<ScanRange>) {
        self.ranges.extend(ranges);
        self.ranges.sort_by_key(|r| (r.addr_start, r.port_start));
    }

    /// Merge ranges that overlap or touch and scan the same ports, so no target
    /// is produced twice.
    pub fn merge_overlapping(&mut self) {
        let mut merged: Vec<ScanRange> = Vec::with_capacity(self.ranges.len());
        for range in mem::take(&mut self.ranges) {
            if let Some(last) = merged.iter_mut().rev().find(|r| {
                r.port_start == range.port_start && r.port_end == range.port_end
            }) && u32::from(range.addr_start) as u64 <= u32::from(last.addr_end) as u64 + 1
            {
                if range.addr_end > last.addr_end {
                    last.addr_end = range.addr_end;
                }
                continue;
            }
            merged.push(range);
        }
        self.ranges = merged;
    }

    /// Remove the given ranges from this set of ranges. Returns the ranges that
    /// were removed.
    pub fn apply_exclude(&mut self, exclude_ranges: &Ipv4Ranges) -> Vec<Ipv4Range> {
        let mut ranges: Vec<ScanRange> = Vec::with_capacity(self.ranges.len());
        let mut removed_ranges: Vec<Ipv4Range> = Vec::new();
        let excludes = &exclude_ranges.ranges;

        for scan_range in mem::take(&mut self.ranges) {
            // u64 so we don't overflow after 255.255.255.255
            let mut start = u32::from(scan_range.addr_start) as u64;
            let end = u32::from(scan_range.addr_end) as u64;

            // the excludes are sorted and don't overlap, so skip the ones that
            // end before this range
            let first = excludes.partition_point(|e| e.end < scan_range.addr_start);
            for exclude in &excludes[first..] {
                let exclude_start = u32::from(exclude.start) as u64;
                let exclude_end = u32::from(exclude.end) as u64;
                if start > end || exclude_start > end {
                    break;
                }
                if exclude_start > start {
                    ranges.push(ScanRange {
                        addr_start: Ipv4Addr::from(start as u32),
                        addr_end: Ipv4Addr::from((exclude_start - 1) as u32),
                        port_start: scan_range.port_start,
                        port_end: scan_range.port_end,
                    });
                }
                removed_ranges.push(Ipv4Range {
                    start: Ipv4Addr::from(start.max(exclude_start) as u32),
                    end: Ipv4Addr::from(end.min(exclude_end) as u32),
                });
                start = exclude_end + 1;
            }

            if start <= end {
                ranges.push(ScanRange {
                    addr_start: Ipv4Addr::from(start as u32),
                    addr_end: scan_range.addr_end,
                    port_start: scan_range.port_start,
                    port_end: scan_range.port_end,
                });
            }
        }

        self.ranges = ranges;

        removed_ranges
    }

    /// Count the total number of targets that are going to be scanned.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(ScanRange::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &Vec<ScanRange> {
        &self.ranges
    }

    pub fn to_static(self) -> StaticScanRanges {
        let mut ranges = Vec::with_capacity(self.ranges.len());
        let mut index = 0;
        for range in self.ranges {
            let count = range.count();
            ranges.push(StaticScanRange {
                count,
                range,
                index,
            });
            index += count;
        }
        StaticScanRanges {
            ranges,
            count: index,
        }
    }
}

pub struct StaticScanRanges {
    pub ranges: Vec<StaticScanRange>,
    pub count: usize,
}
pub struct StaticScanRange {
    pub range: ScanRange,
    count: usize,
    index: usize,
}

impl StaticScanRanges {
    pub fn index(&self, index: usize) -> SocketAddrV4 {
        // binary search to find the range that contains the index
        let mut start = 0;
        let mut end = self.ranges.len();
        while start < end {
            let mid = (start + end) / 2;
            let range = &self.ranges[mid];
            if range.index + range.count <= index {
                start = mid + 1;
            } else if range.index > index {
                end = mid;
            } else {
                return range.range.index(index - range.index);
            }
        }
        panic!("index out of bounds");
    }
}

/// Lazily produces every target of a set of ranges, either in order or
/// permuted by a [`PerfectRng`].
pub struct Targets {
    ranges: StaticScanRanges,
    rng: Option<PerfectRng>,
    position: usize,
}

impl Targets {
    pub fn new(ranges: StaticScanRanges, rng: Option<PerfectRng>) -> Self {
        Self {
            ranges,
            rng,
            position: 0,
        }
    }
}

impl Iterator for Targets {
    type Item = SocketAddrV4;

    fn next(&mut self) -> Option<SocketAddrV4> {
        if self.position >= self.ranges.count {
            return None;
        }
        let index = match &self.rng {
            Some(rng) => rng.shuffle(self.position as u64) as usize,
            None => self.position,
        };
        self.position += 1;
        Some(self.ranges.index(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ranges.count - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Targets {}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Ipv4Range {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Ipv4Range {
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// The whole block `addr/prefix`, including the network and broadcast
    /// addresses.
    pub fn cidr(addr: Ipv4Addr, prefix: u8) -> Self {
        let mask_bits = host_mask(prefix);
        let addr = u32::from(addr);
        Self {
            start: Ipv4Addr::from(addr & !mask_bits),
            end: Ipv4Addr::from(addr | mask_bits),
        }
    }

    /// The usable hosts of the block `addr/prefix`. The network and broadcast
    /// addresses are left out unless the block is a /31 or /32.
    pub fn hosts(addr: Ipv4Addr, prefix: u8) -> Self {
        let block = Self::cidr(addr, prefix);
        if prefix >= 31 {
            return block;
        }
        Self {
            start: Ipv4Addr::from(u32::from(block.start) + 1),
            end: Ipv4Addr::from(u32::from(block.end) - 1),
        }
    }

    pub fn count(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start)) as usize + 1
    }
}

#[derive(Default, Debug)]
pub struct Ipv4Ranges {
    ranges: Vec<Ipv4Range>,
}

impl Ipv4Ranges {
    /// Overlapping or adjacent ranges are merged.
    pub fn new(mut ranges: Vec<Ipv4Range>) -> Self {
        ranges.sort_by_key(|r| r.start);
        let mut merged: Vec<Ipv4Range> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if let Some(last) = merged.last_mut()
                && u32::from(range.start) as u64 <= u32::from(last.end) as u64 + 1
            {
                if range.end > last.end {
                    last.end = range.end;
                }
                continue;
            }
            merged.push(range);
        }
        Self { ranges: merged }
    }

    /// Count the number of addresses covered.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(Ipv4Range::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &Vec<Ipv4Range> {
        &self.ranges
    }
}
