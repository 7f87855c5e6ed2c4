// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Fuse addressing: parsing of the `<letter><number>[:<range>]` wire form and
//! the derived chip/register/mask tuple it resolves to.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{self, ErrorKind};

/// `fuse` registers, one per 4-fuse group.
const FUSE_REGISTERS: [u8; 4] = [0x14, 0x15, 0x16, 0x17];
/// `error` registers, one per 8-fuse group.
const ERROR_REGISTERS: [u8; 2] = [0x1d, 0x1e];

/// Chip tag -> 7-bit I2C address table, loaded from configuration.
pub type ChipTable = BTreeMap<char, u8>;

/// A parsed, immutable fuse address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address {
    letter: char,
    number: u8,
    range: u8,
    chip_i2c_addr: u8,
    fuse_register: u8,
    error_register: u8,
    fuse_mask: u8,
    rev_fuse_mask: u8,
}

impl Address {
    /// Parse `raw` (e.g. `"a0"`, `"B12:4"`) against the given chip table.
    ///
    /// Letter matching is case-insensitive; the canonical form is lowercase.
    /// `range` defaults to 1 when omitted.
    pub fn parse(raw: &str, chips: &ChipTable) -> error::Result<Self> {
        let mut chars = raw.chars();
        let letter = chars
            .next()
            .ok_or_else(|| ErrorKind::AddressSyntax(raw.to_string()))?
            .to_ascii_lowercase();
        let rest: String = chars.collect();

        let (number_part, range_part) = match rest.find(':') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest.as_str(), None),
        };

        if number_part.is_empty() || !number_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(ErrorKind::AddressSyntax(raw.to_string()).into());
        }
        let number: u32 = number_part
            .parse()
            .map_err(|_| ErrorKind::AddressSyntax(raw.to_string()))?;

        let range: u32 = match range_part {
            None => 1,
            Some(s) => {
                if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
                    return Err(ErrorKind::AddressSyntax(raw.to_string()).into());
                }
                s.parse()
                    .map_err(|_| ErrorKind::AddressSyntax(raw.to_string()))?
            }
        };

        let chip_i2c_addr = *chips
            .get(&letter)
            .ok_or_else(|| ErrorKind::UnknownChip(raw.to_string()))?;

        if number > 15 {
            return Err(ErrorKind::OutOfRangeFuse(raw.to_string()).into());
        }
        let number = number as u8;

        if range < 1 || range > 4 || range > 4 - (number % 4) as u32 {
            return Err(ErrorKind::RangeOverflow(raw.to_string()).into());
        }
        let range = range as u8;

        Ok(Self::new_unchecked(letter, number, range, chip_i2c_addr))
    }

    /// Build an address directly from already-validated components. Used by
    /// `enumerate_all` and tests where the chip table lookup has already
    /// happened.
    fn new_unchecked(letter: char, number: u8, range: u8, chip_i2c_addr: u8) -> Self {
        let fuse_register = FUSE_REGISTERS[(number / 4) as usize];
        let error_register = ERROR_REGISTERS[(number / 8) as usize];

        let mut fuse_mask: u8 = 0;
        for k in 0..range {
            fuse_mask |= 1 << (2 * ((number + k) % 4));
        }
        let rev_fuse_mask = 0xff ^ fuse_mask;

        Self {
            letter,
            number,
            range,
            chip_i2c_addr,
            fuse_register,
            error_register,
            fuse_mask,
            rev_fuse_mask,
        }
    }

    /// Every `(letter, 0..15)` address on the given chip table, range 1.
    pub fn enumerate_all(chips: &ChipTable) -> Vec<Self> {
        let mut result = Vec::with_capacity(chips.len() * 16);
        for (&letter, &chip_i2c_addr) in chips.iter() {
            for number in 0..16u8 {
                result.push(Self::new_unchecked(letter, number, 1, chip_i2c_addr));
            }
        }
        result
    }

    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn range(&self) -> u8 {
        self.range
    }

    pub fn chip_i2c_addr(&self) -> u8 {
        self.chip_i2c_addr
    }

    pub fn fuse_register(&self) -> u8 {
        self.fuse_register
    }

    pub fn error_register(&self) -> u8 {
        self.error_register
    }

    pub fn fuse_mask(&self) -> u8 {
        self.fuse_mask
    }

    pub fn rev_fuse_mask(&self) -> u8 {
        self.rev_fuse_mask
    }

    /// The fuse slots, relative to the chip, this address spans.
    pub fn covered_slots(&self) -> impl Iterator<Item = u8> {
        self.number..(self.number + self.range)
    }

    /// `<letter><number>:<range>`, lowercase. Stable across reparses of the
    /// same input.
    pub fn canonical_string(&self) -> String {
        format!("{}{}:{}", self.letter, self.number, self.range)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chips() -> ChipTable {
        let mut m = ChipTable::new();
        m.insert('a', 0x20);
        m.insert('b', 0x21);
        m.insert('c', 0x22);
        m
    }

    /// S1 from the specification: `"c14:2"` against `{a:0x20,b:0x21,c:0x22}`.
    #[test]
    fn test_s1_parse() {
        let addr = Address::parse("c14:2", &chips()).unwrap();
        assert_eq!(addr.letter(), 'c');
        assert_eq!(addr.number(), 14);
        assert_eq!(addr.range(), 2);
        assert_eq!(addr.chip_i2c_addr(), 0x22);
        assert_eq!(addr.fuse_register(), 0x17);
        assert_eq!(addr.error_register(), 0x1e);
        assert_eq!(addr.fuse_mask(), 0x30);
        assert_eq!(addr.rev_fuse_mask(), 0xcf);
    }

    /// S2: range exactly at the register boundary is fine, one past is not.
    #[test]
    fn test_s2_range_overflow() {
        let chips = chips();
        assert!(Address::parse("a13:3", &chips).is_ok());
        assert!(matches!(
            Address::parse("a13:4", &chips).unwrap_err().kind(),
            ErrorKind::RangeOverflow(_)
        ));
    }

    #[test]
    fn test_case_insensitive_and_canonical() {
        let chips = chips();
        let addr = Address::parse("B12:4", &chips).unwrap();
        assert_eq!(addr.letter(), 'b');
        assert_eq!(addr.canonical_string(), "b12:4");
    }

    #[test]
    fn test_unknown_chip() {
        let chips = chips();
        assert!(matches!(
            Address::parse("z0", &chips).unwrap_err().kind(),
            ErrorKind::UnknownChip(_)
        ));
    }

    #[test]
    fn test_out_of_range_fuse() {
        let chips = chips();
        assert!(matches!(
            Address::parse("a16", &chips).unwrap_err().kind(),
            ErrorKind::OutOfRangeFuse(_)
        ));
    }

    #[test]
    fn test_syntax_error() {
        let chips = chips();
        assert!(Address::parse("", &chips).is_err());
        assert!(Address::parse("a", &chips).is_err());
        assert!(Address::parse("aX", &chips).is_err());
    }

    /// Invariant 1: masks partition the register byte.
    #[test]
    fn test_mask_invariant() {
        let chips = chips();
        for raw in &["a0", "a1:3", "a4:4", "a13:3", "c15"] {
            let addr = Address::parse(raw, &chips).unwrap();
            assert_eq!(addr.fuse_mask() | addr.rev_fuse_mask(), 0xff);
            assert_eq!(addr.fuse_mask() & addr.rev_fuse_mask(), 0x00);
            assert!(addr.range() as u32 + (addr.number() % 4) as u32 <= 4);
        }
    }

    /// Round-trip property: canonical string is stable under reparsing.
    #[test]
    fn test_roundtrip() {
        let chips = chips();
        for raw in &["a0", "b5:2", "c15", "a12:4"] {
            let once = Address::parse(raw, &chips).unwrap().canonical_string();
            let twice = Address::parse(&once, &chips).unwrap().canonical_string();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_enumerate_all() {
        let chips = chips();
        let all = Address::enumerate_all(&chips);
        assert_eq!(all.len(), chips.len() * 16);
    }
}
