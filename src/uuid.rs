//! Bluetooth UUIDs.
//!
//! GATT services and characteristics are identified by 128-bit UUIDs. BlueZ reports them as
//! hyphenated lowercase strings; [`Uuid`] normalizes them so that lookups do not depend on the
//! letter case used by the caller.

use core::fmt;
use std::str::FromStr;

/// A 128-bit UUID, identifying a Bluetooth service or characteristic.
///
/// [`Uuid`]s can be parsed from their hyphenated string form, or constructed from a 16-bit
/// "alias" assigned by the Bluetooth SIG via [`Uuid::from_u16`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// The Bluetooth base UUID that 16- and 32-bit aliases are expanded into.
    pub const BASE: Self = Self([
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34,
        0xfb,
    ]);

    /// Creates a [`Uuid`] from its raw big-endian bytes.
    #[inline]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a [`Uuid`] from a 16-bit alias.
    pub const fn from_u16(short: u16) -> Self {
        let [hi, lo] = short.to_be_bytes();
        let mut uuid = Self::BASE;
        uuid.0[2] = hi;
        uuid.0[3] = lo;
        uuid
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Parses a hyphenated UUID like `0000180d-0000-1000-8000-00805f9b34fb`.
impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const GROUPS: [usize; 5] = [4, 2, 2, 2, 6];

        let mut out = [0; 16];
        let mut pos = 0;
        let mut groups = s.split('-');
        for len in GROUPS {
            let group = groups.next().ok_or(ParseUuidError(ErrorKind::Eof))?;
            if group.len() != len * 2 {
                return Err(ParseUuidError(ErrorKind::GroupLength));
            }
            for i in 0..len {
                let digits = group
                    .get(i * 2..i * 2 + 2)
                    .ok_or(ParseUuidError(ErrorKind::InvalidDigit))?;
                out[pos] = u8::from_str_radix(digits, 16)
                    .map_err(|_| ParseUuidError(ErrorKind::InvalidDigit))?;
                pos += 1;
            }
        }

        if groups.next().is_some() {
            return Err(ParseUuidError(ErrorKind::TrailingData));
        }

        Ok(Self(out))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Uuid`].
#[derive(Debug)]
pub struct ParseUuidError(ErrorKind);

#[derive(Debug)]
enum ErrorKind {
    Eof,
    GroupLength,
    InvalidDigit,
    TrailingData,
}

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self.0 {
            ErrorKind::Eof => "unexpected end of input",
            ErrorKind::GroupLength => "invalid UUID group length",
            ErrorKind::InvalidDigit => "invalid hex digit",
            ErrorKind::TrailingData => "invalid trailing data",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ParseUuidError {}
