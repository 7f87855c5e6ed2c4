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

//! A single fuse's place in a program: when to trigger it and its
//! staged/firing/fired lifecycle. The trigger offset ([`Timestamp`]) is
//! distinct from how long the fuse stays energized once triggered — that
//! hold duration is a fixed, process-wide setting (`[timings] ignition`
//! in configuration), since every fuse on the unit is the same kind of
//! device.

use std::sync::Arc;
use std::time::Duration;

use futures::lock::Mutex;
use slog::{error, info};

use crate::address::Address;
use crate::error::{self, ErrorKind};
use crate::hardware::HardwareController;
use crate::timestamp::Timestamp;

/// Where a [`FireCommand`] is in its one-way lifecycle. There is no path
/// back from `Fired` to `Staged`; a command fires exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireStatus {
    Staged,
    Firing,
    Fired,
}

pub struct FireCommand {
    address: Address,
    /// Offset from the owning program's start at which this command
    /// triggers. Meaningless for a bare, program-less `fire`.
    offset: Timestamp,
    name: Option<String>,
    description: Option<String>,
    status: Mutex<FireStatus>,
    log: slog::Logger,
}

impl FireCommand {
    pub fn new(
        address: Address,
        offset: Timestamp,
        name: Option<String>,
        description: Option<String>,
        log: slog::Logger,
    ) -> Self {
        Self {
            address,
            offset,
            name,
            description,
            status: Mutex::new(FireStatus::Staged),
            log,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn offset(&self) -> Timestamp {
        self.offset
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub async fn status(&self) -> FireStatus {
        *self.status.lock().await
    }

    /// Light the fuse, hold it lit for `hold`, then unlight it. Fails
    /// immediately with `AlreadyFired` if this command has already been
    /// fired or is firing; otherwise always attempts the final `unlight`,
    /// even if `light` itself failed, so a fuse is never left energized
    /// because of a transient bus error.
    pub async fn fire(&self, hardware: Arc<HardwareController>, hold: Duration) -> error::Result<()> {
        {
            let mut status = self.status.lock().await;
            if *status != FireStatus::Staged {
                return Err(ErrorKind::AlreadyFired(self.address.canonical_string()).into());
            }
            *status = FireStatus::Firing;
        }

        info!(self.log, "firing"; "address" => %self.address);

        if let Err(e) = hardware.light(&self.address).await {
            error!(self.log, "light failed"; "address" => %self.address, "error" => %e);
        } else {
            tokio::time::sleep(hold).await;
        }

        if let Err(e) = hardware.unlight(&self.address).await {
            error!(self.log, "unlight failed"; "address" => %self.address, "error" => %e);
        }

        *self.status.lock().await = FireStatus::Fired;
        info!(self.log, "fired"; "address" => %self.address);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::ChipTable;
    use crate::bus::test_utils::FakeBus;
    use crate::bus::SharedBus;
    use slog::Discard;

    fn setup() -> (Arc<HardwareController>, ChipTable) {
        let mut chips = ChipTable::new();
        chips.insert('a', 0x20);
        let bus = SharedBus::new(Box::new(FakeBus::new()));
        let log = slog::Logger::root(Discard, slog::o!());
        (
            Arc::new(HardwareController::new(bus, chips.clone(), log)),
            chips,
        )
    }

    #[tokio::test]
    async fn test_fire_lights_then_unlights() {
        let (hw, chips) = setup();
        let addr = Address::parse("a0", &chips).unwrap();
        let log = slog::Logger::root(Discard, slog::o!());
        let cmd = FireCommand::new(addr, Timestamp::new(0, 0, 0, 0).unwrap(), None, None, log);

        cmd.fire(hw.clone(), Duration::from_millis(10)).await.unwrap();

        assert_eq!(cmd.status().await, FireStatus::Fired);
        assert_eq!(hw.errors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_double_fire_rejected() {
        let (hw, chips) = setup();
        let addr = Address::parse("a0", &chips).unwrap();
        let log = slog::Logger::root(Discard, slog::o!());
        let cmd = FireCommand::new(addr, Timestamp::new(0, 0, 0, 0).unwrap(), None, None, log);

        cmd.fire(hw.clone(), Duration::from_millis(10)).await.unwrap();
        let result = cmd.fire(hw, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err().kind(), ErrorKind::AlreadyFired(_)));
    }
}
