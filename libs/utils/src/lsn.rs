//! WAL log sequence number, formatted the way PostgreSQL prints it:
//! two hex halves separated by a slash, e.g. `2/A1B2C3D4`.

use std::fmt;
use std::str::FromStr;

/// A 64-bit, monotonically increasing position in the write-ahead log.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// High and low 32-bit halves, in that order.
    pub fn segments(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }

    /// Index of the WAL segment containing this LSN, given the cluster's
    /// configured segment size (must be a power of two).
    pub fn segment_number(self, wal_seg_size: u64) -> u64 {
        self.0 / wal_seg_size
    }

    /// Offset of this LSN within its WAL segment.
    pub fn segment_offset(self, wal_seg_size: u64) -> u64 {
        self.0 % wal_seg_size
    }

    pub fn checked_add(self, n: u64) -> Option<Lsn> {
        self.0.checked_add(n).map(Lsn)
    }

    pub fn checked_sub(self, n: u64) -> Option<Lsn> {
        self.0.checked_sub(n).map(Lsn)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (hi, lo) = self.segments();
        write!(f, "{hi:X}/{lo:X}")
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid LSN: {0:?}")]
pub struct LsnParseError(pub String);

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| LsnParseError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl From<Lsn> for u64 {
    fn from(v: Lsn) -> Self {
        v.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cases = ["0/0", "2/A1B2C3D4", "FFFFFFFF/FFFFFFFF"];
        for c in cases {
            let lsn: Lsn = c.parse().unwrap();
            assert_eq!(lsn.to_string(), c);
        }
    }

    #[test]
    fn ordering() {
        let a: Lsn = "0/100".parse().unwrap();
        let b: Lsn = "0/200".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-an-lsn".parse::<Lsn>().is_err());
        assert!("1".parse::<Lsn>().is_err());
    }
}
