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

//! High-level chip operations (light/unlight/lock/unlock/error handling)
//! built on top of [`crate::bus::SharedBus`].

use std::collections::HashMap;

use futures::lock::Mutex;

use crate::address::{Address, ChipTable};
use crate::bus::SharedBus;
use crate::error;

const LOCK_REGISTER: u8 = 0x00;
const LOCK_BIT: u8 = 0x10;
const ERROR_CONTROL_REGISTER: u8 = 0x01;
const ERROR_CONTROL_CLEAR_EDGE_BIT: u8 = 0x80;

/// Per-chip fault bits, lowest-indexed fuse first.
pub type ChipErrors = HashMap<char, [bool; 16]>;

/// Per-chip lock state.
pub type ChipLocks = HashMap<char, bool>;

pub struct HardwareController {
    bus: SharedBus,
    chips: ChipTable,
    /// Guards the set/clear write pair in `clear_error_flags` so no other
    /// write to the same chip's error-control register can land between
    /// them.
    error_control_locks: HashMap<char, Mutex<()>>,
    log: slog::Logger,
}

impl HardwareController {
    pub fn new(bus: SharedBus, chips: ChipTable, log: slog::Logger) -> Self {
        let error_control_locks = chips.keys().map(|&letter| (letter, Mutex::new(()))).collect();
        Self {
            bus,
            chips,
            error_control_locks,
            log,
        }
    }

    /// byte ← (read AND rev_mask) OR mask; write back.
    pub async fn light(&self, addr: &Address) -> error::Result<()> {
        let current = self.bus.read(addr.chip_i2c_addr(), addr.fuse_register()).await?;
        let value = (current & addr.rev_fuse_mask()) | addr.fuse_mask();
        self.bus.write(addr.chip_i2c_addr(), addr.fuse_register(), value).await?;
        slog::info!(self.log, "lit"; "address" => %addr);
        Ok(())
    }

    /// byte ← read AND rev_mask; write back.
    pub async fn unlight(&self, addr: &Address) -> error::Result<()> {
        let current = self.bus.read(addr.chip_i2c_addr(), addr.fuse_register()).await?;
        let value = current & addr.rev_fuse_mask();
        self.bus.write(addr.chip_i2c_addr(), addr.fuse_register(), value).await?;
        slog::info!(self.log, "unlit"; "address" => %addr);
        Ok(())
    }

    pub async fn lock(&self) -> error::Result<()> {
        for &chip_addr in self.chips.values() {
            self.bus.write(chip_addr, LOCK_REGISTER, LOCK_BIT).await?;
        }
        slog::info!(self.log, "hardware lock engaged");
        Ok(())
    }

    pub async fn unlock(&self) -> error::Result<()> {
        for &chip_addr in self.chips.values() {
            self.bus.write(chip_addr, LOCK_REGISTER, 0x00).await?;
        }
        slog::info!(self.log, "hardware lock released");
        Ok(())
    }

    /// Safety gate: true if *any* chip reports its lock bit set.
    pub async fn is_locked(&self) -> error::Result<bool> {
        for &chip_addr in self.chips.values() {
            let value = self.bus.read(chip_addr, LOCK_REGISTER).await?;
            if value & LOCK_BIT != 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Per-chip lock state (used by the heartbeat/status facade, where a
    /// per-chip breakdown is more useful than the single aggregate bit
    /// `is_locked` returns).
    pub async fn locks(&self) -> error::Result<ChipLocks> {
        let mut result = ChipLocks::new();
        for (&letter, &chip_addr) in self.chips.iter() {
            let value = self.bus.read(chip_addr, LOCK_REGISTER).await?;
            result.insert(letter, value & LOCK_BIT != 0);
        }
        Ok(result)
    }

    /// Set then clear the clear-edge bit, per chip, under that chip's
    /// error-control mutex.
    pub async fn clear_error_flags(&self) -> error::Result<()> {
        for (&letter, &chip_addr) in self.chips.iter() {
            let guard = self
                .error_control_locks
                .get(&letter)
                .expect("error_control_locks built from same chip table");
            let _held = guard.lock().await;

            let current = self.bus.read(chip_addr, ERROR_CONTROL_REGISTER).await?;
            self.bus
                .write(chip_addr, ERROR_CONTROL_REGISTER, current | ERROR_CONTROL_CLEAR_EDGE_BIT)
                .await?;
            self.bus
                .write(chip_addr, ERROR_CONTROL_REGISTER, current & !ERROR_CONTROL_CLEAR_EDGE_BIT)
                .await?;
        }
        slog::info!(self.log, "error flags cleared");
        Ok(())
    }

    /// Per-chip, 16-element fault vector: bit `j` of (error_reg0 ++
    /// error_reg1), LSB-first within each register.
    pub async fn errors(&self) -> error::Result<ChipErrors> {
        let mut result = ChipErrors::new();
        for (&letter, &chip_addr) in self.chips.iter() {
            let low = self.bus.read(chip_addr, 0x1d).await?;
            let high = self.bus.read(chip_addr, 0x1e).await?;
            let mut faults = [false; 16];
            for j in 0..8 {
                faults[j] = (low >> j) & 1 != 0;
                faults[j + 8] = (high >> j) & 1 != 0;
            }
            result.insert(letter, faults);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::test_utils::FakeBus;
    use crate::bus::SharedBus;
    use slog::Discard;

    fn controller() -> (HardwareController, ChipTable) {
        let mut chips = ChipTable::new();
        chips.insert('a', 0x20);
        chips.insert('b', 0x21);
        let bus = SharedBus::new(Box::new(FakeBus::new()));
        let log = slog::Logger::root(Discard, slog::o!());
        (HardwareController::new(bus, chips.clone(), log), chips)
    }

    /// S3: firing a single fuse writes `mask` then `0` to the fuse register.
    #[tokio::test]
    async fn test_s3_light_unlight_single_fuse() {
        let (hw, chips) = controller();
        let addr = Address::parse("a0", &chips).unwrap();

        hw.light(&addr).await.unwrap();
        assert_eq!(hw.bus.read(0x20, 0x14).await.unwrap(), 0x01);

        hw.unlight(&addr).await.unwrap();
        assert_eq!(hw.bus.read(0x20, 0x14).await.unwrap(), 0x00);
    }

    /// Invariant 2: light/unlight of one address preserves other bits in
    /// the same register.
    #[tokio::test]
    async fn test_preserves_other_fuse_bits() {
        let (hw, chips) = controller();
        let addr_a0 = Address::parse("a0", &chips).unwrap();
        let addr_a1 = Address::parse("a1", &chips).unwrap();

        hw.light(&addr_a1).await.unwrap();
        hw.light(&addr_a0).await.unwrap();
        hw.unlight(&addr_a0).await.unwrap();

        // a1's bits should still be set
        assert_eq!(hw.bus.read(0x20, 0x14).await.unwrap() & addr_a1.fuse_mask(), addr_a1.fuse_mask());
    }

    #[tokio::test]
    async fn test_lock_unlock_idempotent() {
        let (hw, _chips) = controller();
        hw.lock().await.unwrap();
        hw.lock().await.unwrap();
        assert_eq!(hw.bus.read(0x20, 0x00).await.unwrap(), 0x10);
        assert!(hw.is_locked().await.unwrap());

        hw.unlock().await.unwrap();
        hw.unlock().await.unwrap();
        assert_eq!(hw.bus.read(0x20, 0x00).await.unwrap(), 0x00);
        assert!(!hw.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_error_flags_writes_set_then_clear() {
        let (hw, _chips) = controller();
        hw.bus.write(0x20, 0x01, 0x00).await.unwrap();
        hw.clear_error_flags().await.unwrap();
        // final written value has the clear-edge bit cleared again
        assert_eq!(hw.bus.read(0x20, 0x01).await.unwrap() & 0x80, 0x00);
    }

    #[tokio::test]
    async fn test_errors_bit_layout() {
        let (hw, _chips) = controller();
        hw.bus.write(0x20, 0x1d, 0b0000_0101).await.unwrap();
        hw.bus.write(0x20, 0x1e, 0b1000_0000).await.unwrap();
        let errors = hw.errors().await.unwrap();
        let a = errors.get(&'a').unwrap();
        assert!(a[0]);
        assert!(!a[1]);
        assert!(a[2]);
        assert!(a[15]);
        assert!(!a[14]);
    }
}
