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

//! Fixed-resolution (decisecond) duration used to offset fire commands
//! within a program.

use std::time::Duration;

use crate::error::{self, ErrorKind};

/// An immutable `h:m:s.ds` offset, accurate to a tenth of a second.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timestamp {
    hours: u32,
    minutes: u32,
    seconds: u32,
    deciseconds: u32,
}

impl Timestamp {
    pub fn new(hours: u32, minutes: u32, seconds: u32, deciseconds: u32) -> error::Result<Self> {
        if minutes > 59 || seconds > 59 || deciseconds > 9 {
            return Err(ErrorKind::InvalidTimestamp(hours, minutes, seconds, deciseconds).into());
        }
        Ok(Self {
            hours,
            minutes,
            seconds,
            deciseconds,
        })
    }

    /// Split a fractional `total_seconds` into its `(h, m, s, ds)` components.
    pub fn from_total_seconds(total_seconds: f64) -> Self {
        let total_seconds = total_seconds.max(0.0);
        let whole = total_seconds.trunc() as u64;
        let deciseconds = ((total_seconds - total_seconds.trunc()) * 10.0).round() as u32;
        let (minutes_total, seconds) = (whole / 60, (whole % 60) as u32);
        let (hours, minutes) = (minutes_total / 60, (minutes_total % 60) as u32);
        Self {
            hours: hours as u32,
            minutes,
            seconds,
            deciseconds: deciseconds.min(9),
        }
    }

    pub fn hours(&self) -> u32 {
        self.hours
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn deciseconds(&self) -> u32 {
        self.deciseconds
    }

    pub fn total_seconds(&self) -> f64 {
        (self.hours * 3600 + self.minutes * 60 + self.seconds) as f64 + self.deciseconds as f64 / 10.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_seconds())
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.total_seconds()
            .partial_cmp(&other.total_seconds())
            .expect("total_seconds is always finite")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_total_seconds() {
        let ts = Timestamp::new(1, 2, 3, 4).unwrap();
        assert_eq!(ts.total_seconds(), 3723.4);
    }

    #[test]
    fn test_invalid_fields() {
        assert!(Timestamp::new(0, 60, 0, 0).is_err());
        assert!(Timestamp::new(0, 0, 60, 0).is_err());
        assert!(Timestamp::new(0, 0, 0, 10).is_err());
    }

    #[test]
    fn test_roundtrip_components() {
        let ts = Timestamp::new(2, 30, 15, 7).unwrap();
        let back = Timestamp::from_total_seconds(ts.total_seconds());
        assert_eq!(ts, back);
    }

    #[test]
    fn test_equality_by_total_seconds() {
        let a = Timestamp::new(0, 1, 0, 0).unwrap();
        let b = Timestamp::from_total_seconds(60.0);
        assert_eq!(a.total_seconds(), b.total_seconds());
        assert_eq!(a, b);
    }
}
