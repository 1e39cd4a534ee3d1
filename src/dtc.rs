//! Module for OBD-II diagnostic trouble codes (SAE J2012 / ISO15031-6 format)
//!
//! A stored code travels as two bytes:
//!
//! | Bits  | Meaning |
//! |--|--|
//! | 15-14 | System: `00` P, `01` C, `10` B, `11` U |
//! | 13-12 | First digit (0-3) |
//! | 11-0  | Remaining three digits, one hex nibble each |
//!
//! so `[0x01, 0x04]` is `P0104` and `[0xC1, 0x00]` is `U0100`.

use std::{fmt::Display, str::FromStr};

use strum_macros::{EnumIter, EnumString};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumString, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// System a DTC belongs to
pub enum DtcCategory {
    /// Engine and transmission (`P`)
    Powertrain,
    /// Brakes, steering, suspension (`C`)
    Chassis,
    /// Airbags, climate control, lighting (`B`)
    Body,
    /// Inter-module communication (`U`)
    Network,
}

impl DtcCategory {
    /// Letter used in the printed code
    pub const fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    /// Category from the printed letter (case insensitive)
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'P' => Some(Self::Powertrain),
            'C' => Some(Self::Chassis),
            'B' => Some(Self::Body),
            'U' => Some(Self::Network),
            _ => None,
        }
    }

    const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Powertrain,
            0b01 => Self::Chassis,
            0b10 => Self::Body,
            _ => Self::Network,
        }
    }

    const fn bits(&self) -> u8 {
        match self {
            DtcCategory::Powertrain => 0b00,
            DtcCategory::Chassis => 0b01,
            DtcCategory::Body => 0b10,
            DtcCategory::Network => 0b11,
        }
    }
}

/// Diagnostic trouble code, EG: `P0301`
///
/// With the `serde` feature it serializes as its raw 16 bit value
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "u16", into = "u16"))]
pub struct DtcCode {
    category: DtcCategory,
    first_digit: u8,
    digits: u16,
}

impl DtcCode {
    /// Creates a DTC from its parts.
    ///
    /// Returns `None` if `first_digit` is above 3 or `digits` does not fit in 3 hex digits
    pub const fn new(category: DtcCategory, first_digit: u8, digits: u16) -> Option<Self> {
        if first_digit > 3 || digits > 0x0FFF {
            None
        } else {
            Some(Self {
                category,
                first_digit,
                digits,
            })
        }
    }

    /// Decodes the two raw bytes returned by the vehicle
    pub const fn decode(raw: [u8; 2]) -> Self {
        Self {
            category: DtcCategory::from_bits(raw[0] >> 6),
            first_digit: (raw[0] >> 4) & 0b11,
            digits: ((raw[0] as u16 & 0x0F) << 8) | raw[1] as u16,
        }
    }

    /// Encodes the DTC back into the two bytes the vehicle uses. Exact inverse of [DtcCode::decode]
    pub const fn encode(&self) -> [u8; 2] {
        [
            (self.category.bits() << 6) | (self.first_digit << 4) | ((self.digits >> 8) as u8),
            self.digits as u8,
        ]
    }

    /// Raw 16 bit value of the DTC
    pub const fn raw(&self) -> u16 {
        u16::from_be_bytes(self.encode())
    }

    /// System the DTC belongs to
    pub const fn category(&self) -> DtcCategory {
        self.category
    }

    /// First digit after the letter. `0` is SAE defined, `1` manufacturer specific,
    /// `2` and `3` depend on the system
    pub const fn first_digit(&self) -> u8 {
        self.first_digit
    }

    /// The last three digits as a 12 bit number
    pub const fn digits(&self) -> u16 {
        self.digits
    }

    /// True if the code is defined by SAE rather than the vehicle manufacturer
    pub const fn is_generic(&self) -> bool {
        match self.category {
            // P2xxx is SAE controlled, P3xxx is split so it counts as manufacturer
            DtcCategory::Powertrain => self.first_digit == 0 || self.first_digit == 2,
            _ => self.first_digit == 0,
        }
    }
}

impl From<u16> for DtcCode {
    fn from(raw: u16) -> Self {
        Self::decode(raw.to_be_bytes())
    }
}

impl From<DtcCode> for u16 {
    fn from(code: DtcCode) -> Self {
        code.raw()
    }
}

impl Display for DtcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{:03X}", self.category.letter(), self.first_digit, self.digits)
    }
}

/// Error returned when parsing a printed DTC fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a valid DTC, expected a letter followed by 4 hex digits (EG: P0301)")]
pub struct DtcParseError(pub String);

impl FromStr for DtcCode {
    type Err = DtcParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DtcParseError(s.to_string());
        let s = s.trim();
        let mut chars = s.chars();
        let category = chars.next().and_then(DtcCategory::from_letter).ok_or_else(err)?;
        let rest = chars.as_str();
        if rest.len() != 4 || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(err());
        }
        let first_digit = rest[..1].parse::<u8>().map_err(|_| err())?;
        let digits = u16::from_str_radix(&rest[1..], 16).map_err(|_| err())?;
        DtcCode::new(category, first_digit, digits).ok_or_else(err)
    }
}

/// MIL state and number of stored DTCs, as reported by service 01 PID 01 (byte A)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtcStatus {
    /// Malfunction indicator lamp (Check engine light) is on
    pub mil_on: bool,
    /// Number of confirmed emission related DTCs (0-127)
    pub dtc_count: u8,
}

impl DtcStatus {
    /// Decodes the status byte. Bit 7 is the MIL, bits 0-6 are the DTC count
    pub const fn from_byte(b: u8) -> Self {
        Self {
            mil_on: b & 0x80 != 0,
            dtc_count: b & 0x7F,
        }
    }

    /// Encodes back to the status byte. The count is masked to 7 bits
    pub const fn to_byte(&self) -> u8 {
        (if self.mil_on { 0x80 } else { 0x00 }) | (self.dtc_count & 0x7F)
    }
}

impl From<u8> for DtcStatus {
    fn from(b: u8) -> Self {
        Self::from_byte(b)
    }
}

/// Result of reading stored DTCs from the vehicle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtcReport {
    /// MIL state and the count reported by the ECU
    pub status: DtcStatus,
    /// Stored codes, in the order the ECU reported them
    pub codes: Vec<DtcCode>,
}

/// Decodes a run of 2 byte DTC groups. All zero groups are padding and are dropped.
/// A trailing odd byte is ignored
pub fn decode_dtc_list(bytes: &[u8]) -> Vec<DtcCode> {
    bytes
        .chunks_exact(2)
        .filter(|pair| pair.iter().any(|b| *b != 0x00))
        .map(|pair| DtcCode::decode([pair[0], pair[1]]))
        .collect()
}
