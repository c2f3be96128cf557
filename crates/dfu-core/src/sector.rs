//! DfuSe memory sectors.
//!
//! ST devices describe their memory layout in the interface string, e.g.
//! `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`. Each zone is an
//! address followed by comma-separated groups of `count*size` with a
//! multiplier (`B`, `K`, `M`) and a capability letter `a`..`g`.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectorCaps: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERASABLE = 1 << 2;
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SectorError {
    #[error("Invalid zone address: {0}")]
    InvalidAddress(String),
    #[error("No sector section after zone address {0}")]
    MissingSectors(String),
    #[error("Invalid number of sectors: {0}")]
    InvalidCount(String),
    #[error("Invalid sector ID: {0}")]
    InvalidId(String),
    #[error("Invalid sector size: {0}")]
    InvalidSize(String),
    #[error("Invalid sector multiplier: {0}")]
    InvalidMultiplier(String),
    #[error("Invalid sector type: {0}")]
    InvalidType(String),
    #[error("Zone at 0x{0:08X} exceeds the 32-bit address space")]
    Overflow(u32),
}

/// One erase block of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    address: u32,
    size: u32,
    size_left: u32,
    zone: u16,
    group: u16,
    caps: SectorCaps,
}

impl Sector {
    pub fn new(address: u32, size: u32, caps: SectorCaps) -> Self {
        Self {
            address,
            size,
            size_left: size,
            zone: 0,
            group: 0,
            caps,
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// Erase-block size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes from the start of this sector to the end of its group.
    pub fn size_left(&self) -> u32 {
        self.size_left
    }

    pub fn zone(&self) -> u16 {
        self.zone
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    pub fn caps(&self) -> SectorCaps {
        self.caps
    }

    pub fn has_cap(&self, cap: SectorCaps) -> bool {
        self.caps.contains(cap)
    }

    /// Identifies the zone and group this sector belongs to.
    pub fn id(&self) -> u32 {
        ((self.zone as u32) << 16) | self.group as u32
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && (address as u64) < self.end()
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut caps = String::new();
        caps.push(if self.has_cap(SectorCaps::READABLE) { 'R' } else { '-' });
        caps.push(if self.has_cap(SectorCaps::ERASABLE) { 'E' } else { '-' });
        caps.push(if self.has_cap(SectorCaps::WRITABLE) { 'W' } else { '-' });
        write!(
            f,
            "Zone:{}, Sec#:{}, Addr:0x{:08x}, Size:0x{:04x}, Caps:0x{:01x} [{}]",
            self.zone,
            self.group,
            self.address,
            self.size,
            self.caps.bits(),
            caps
        )
    }
}

/// Find the sector whose range contains `address`.
pub fn find_sector(sectors: &[Sector], address: u32) -> Option<&Sector> {
    sectors.iter().find(|s| s.contains(address))
}

fn caps_from_letter(letter: char) -> Option<SectorCaps> {
    let caps = match letter {
        'a' => SectorCaps::READABLE,
        'b' => SectorCaps::ERASABLE,
        'c' => SectorCaps::READABLE | SectorCaps::ERASABLE,
        'd' => SectorCaps::WRITABLE,
        'e' => SectorCaps::READABLE | SectorCaps::WRITABLE,
        'f' => SectorCaps::ERASABLE | SectorCaps::WRITABLE,
        'g' => SectorCaps::READABLE | SectorCaps::ERASABLE | SectorCaps::WRITABLE,
        _ => return None,
    };
    Some(caps)
}

fn split_number(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

/// Parse one `NN*SSS[B|K|M]x` group starting at `address`.
fn parse_group(
    desc: &str,
    address: u32,
    zone: u16,
    group: u16,
    out: &mut Vec<Sector>,
) -> Result<u32, SectorError> {
    let desc = desc.trim();
    let (count, rest) = split_number(desc);
    let count: u32 = count
        .parse()
        .ok()
        .filter(|n| *n <= 999)
        .ok_or_else(|| SectorError::InvalidCount(desc.to_string()))?;

    let rest = rest
        .strip_prefix('*')
        .ok_or_else(|| SectorError::InvalidId(desc.to_string()))?;
    let (size, rest) = split_number(rest);
    let size: u32 = size
        .parse()
        .ok()
        .filter(|n| *n <= 999)
        .ok_or_else(|| SectorError::InvalidSize(desc.to_string()))?;

    // a space in place of the multiplier means bytes
    let trimmed = rest.trim_start_matches(' ');
    let spaced = trimmed.len() != rest.len();
    let (size, rest) = match trimmed.chars().next() {
        Some('B') => (size, &trimmed[1..]),
        Some('K') => (size * 0x400, &trimmed[1..]),
        Some('M') => (size * 0x10_0000, &trimmed[1..]),
        Some(_) if spaced => (size, trimmed),
        _ => return Err(SectorError::InvalidMultiplier(desc.to_string())),
    };
    let caps = rest
        .chars()
        .next()
        .and_then(caps_from_letter)
        .ok_or_else(|| SectorError::InvalidType(desc.to_string()))?;

    let total = count as u64 * size as u64;
    if address as u64 + total > u32::MAX as u64 + 1 {
        return Err(SectorError::Overflow(address));
    }
    for i in 0..count {
        let offset = i * size;
        out.push(Sector {
            address: address + offset,
            size,
            size_left: (total - offset as u64) as u32,
            zone,
            group,
            caps,
        });
    }
    Ok(total as u32)
}

fn parse_hex_address(s: &str) -> Option<u32> {
    let digits = s.trim().strip_prefix("0x")?;
    let end = digits
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(digits.len());
    u32::from_str_radix(&digits[..end], 16).ok()
}

/// Sector layout parsed from an interface name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorLayout {
    /// Human name preceding the first `/`, if the name used the DfuSe form.
    pub name: Option<String>,
    pub sectors: Vec<Sector>,
}

/// Parse the sector descriptor in a DfuSe alternate-setting name.
///
/// Names not starting with `@` have no sectors, except the `RAM 0xADDR`
/// form which yields one readable and writable sector spanning to the top
/// of the address space.
pub fn parse_alt_name(alt_name: &str) -> Result<SectorLayout, SectorError> {
    if let Some(addr) = alt_name.strip_prefix("RAM ") {
        let address = parse_hex_address(addr)
            .filter(|a| *a != 0)
            .ok_or_else(|| SectorError::InvalidAddress(alt_name.to_string()))?;
        let size = u32::MAX - address + 1;
        return Ok(SectorLayout {
            name: None,
            sectors: vec![Sector::new(
                address,
                size,
                SectorCaps::READABLE | SectorCaps::WRITABLE,
            )],
        });
    }

    let Some(body) = alt_name.strip_prefix('@') else {
        return Ok(SectorLayout::default());
    };

    let mut parts = body.split('/');
    let name = parts.next().map(|n| n.trim_end().to_string());
    let mut sectors = Vec::new();
    let mut zone: u16 = 0;
    while let Some(addr) = parts.next() {
        // trailing slash
        if addr.trim().is_empty() {
            continue;
        }
        let mut address = parse_hex_address(addr)
            .ok_or_else(|| SectorError::InvalidAddress(addr.to_string()))?;
        let groups = parts
            .next()
            .ok_or_else(|| SectorError::MissingSectors(addr.to_string()))?;
        for (group, desc) in groups.split(',').enumerate() {
            let len = parse_group(desc, address, zone, group as u16, &mut sectors)?;
            address = address.wrapping_add(len);
        }
        zone += 1;
    }
    tracing::debug!(name = ?name, sectors = sectors.len(), "Parsed DfuSe sector layout");
    Ok(SectorLayout { name, sectors })
}
