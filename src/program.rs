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

//! An ordered list of [`FireCommand`]s and the tick-driven loop that runs
//! them against the wall clock.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::lock::Mutex;
use serde::{Deserialize, Serialize};
use slog::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::address::{Address, ChipTable};
use crate::error::{self, ErrorKind};
use crate::fire_command::{FireCommand, FireStatus};
use crate::hardware::HardwareController;
use crate::timestamp::Timestamp;

/// Invoked once, from inside the execution task itself, when a program
/// runs to completion on its own (every command fired) rather than being
/// stopped by a caller. Lets [`crate::controller::FireController`] make
/// the `RUNNING -> UNLOADED` / `RUNNING_TL -> LOADED` transition the
/// spec's state table calls for without requiring a caller to poll.
pub type OnComplete = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wire form of a single program entry, mirroring the master's submitted
/// command-list record. `ms` is named for milliseconds but is interpreted
/// in deciseconds (tenths of a second), matching [`Timestamp`]'s
/// resolution — the executor's precision floor is one tick anyway, so
/// true millisecond precision could never have been honored. A record
/// whose `device_id` doesn't match the local device is skipped rather
/// than rejected; every other field is required.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawFireCommand {
    pub device_id: String,
    pub address: String,
    pub h: u32,
    pub m: u32,
    pub s: u32,
    pub ms: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Stopped,
}

/// A single fuse slot's label in the per-chip status grid exposed to the
/// heartbeat/boundary facade. `None` is the rest state: no command in the
/// program covers that slot at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuseLabel {
    None,
    Staged,
    Firing,
    Fired,
}

impl FuseLabel {
    /// `None < Staged < Firing < Fired`, used to resolve two commands
    /// whose ranges cover the same slot: the more advanced status wins.
    fn rank(self) -> u8 {
        match self {
            FuseLabel::None => 0,
            FuseLabel::Staged => 1,
            FuseLabel::Firing => 2,
            FuseLabel::Fired => 3,
        }
    }
}

impl From<FireStatus> for FuseLabel {
    fn from(status: FireStatus) -> Self {
        match status {
            FireStatus::Staged => FuseLabel::Staged,
            FireStatus::Firing => FuseLabel::Firing,
            FireStatus::Fired => FuseLabel::Fired,
        }
    }
}

/// Every known chip letter mapped to its 16 fuse slots' labels.
pub type FuseStatusMap = BTreeMap<char, [FuseLabel; 16]>;

/// All slots of every chip in `chips` at rest (`FuseLabel::None`). Used
/// both for [`Program::empty_fuse_status`] and by the controller when no
/// program at all is loaded.
pub fn empty_fuse_status_for(chips: &ChipTable) -> FuseStatusMap {
    chips.keys().map(|&letter| (letter, [FuseLabel::None; 16])).collect()
}

pub struct Program {
    device_id: String,
    name: String,
    chips: ChipTable,
    commands: Vec<Arc<FireCommand>>,
    control: Mutex<Option<watch::Sender<Control>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    log: slog::Logger,
}

impl Program {
    /// An empty, unfinalized program. Use [`Program::add_command`] to
    /// populate it and [`Program::finalize`] to seal the command list.
    pub fn new(device_id: String, name: String, chips: ChipTable, log: slog::Logger) -> Self {
        Self {
            device_id,
            name,
            chips,
            commands: Vec::new(),
            control: Mutex::new(None),
            handle: Mutex::new(None),
            log,
        }
    }

    pub fn add_command(&mut self, address: Address, offset: Timestamp) {
        self.add_command_named(address, offset, None, None)
    }

    /// As [`Program::add_command`], carrying the optional name/description
    /// a wire-submitted command may be tagged with.
    pub fn add_command_named(
        &mut self,
        address: Address,
        offset: Timestamp,
        name: Option<String>,
        description: Option<String>,
    ) {
        let log = self.log.new(slog::o!("address" => address.canonical_string()));
        self.commands
            .push(Arc::new(FireCommand::new(address, offset, name, description, log)));
    }

    /// Sort commands by trigger offset and reject a command list that
    /// fires the same address twice.
    pub fn finalize(mut self) -> error::Result<Self> {
        self.commands.sort_by_key(|c| c.offset());

        let mut seen = HashSet::new();
        for cmd in &self.commands {
            if !seen.insert(cmd.address().canonical_string()) {
                return Err(ErrorKind::InvalidProgram(format!(
                    "address {} appears more than once",
                    cmd.address()
                ))
                .into());
            }
        }
        Ok(self)
    }

    /// Build a finalized program from the wire-level command list. Records
    /// whose `device_id` does not match `device_id` (case-insensitive) are
    /// silently skipped, per spec.md §6; any address or timestamp that
    /// fails to parse rejects the whole submission as `InvalidProgram`.
    pub fn from_command_list(
        device_id: &str,
        name: String,
        raw_commands: Vec<RawFireCommand>,
        chips: &ChipTable,
        log: slog::Logger,
    ) -> error::Result<Self> {
        let mut program = Self::new(device_id.to_string(), name, chips.clone(), log);
        for raw in raw_commands {
            if !raw.device_id.eq_ignore_ascii_case(device_id) {
                continue;
            }
            let address = Address::parse(&raw.address, chips)
                .map_err(|e| ErrorKind::InvalidProgram(format!("{}: {}", raw.address, e)))?;
            let offset = Timestamp::new(raw.h, raw.m, raw.s, raw.ms)
                .map_err(|e| ErrorKind::InvalidProgram(format!("invalid timestamp: {}", e)))?;
            program.add_command_named(address, offset, raw.name, raw.description);
        }
        program.finalize()
    }

    /// A program that cycles every configured address `period` apart, for
    /// exercising the hardware without a real command list loaded.
    pub fn testloop_program(
        device_id: String,
        chips: &ChipTable,
        period: Duration,
        log: slog::Logger,
    ) -> error::Result<Self> {
        let mut program = Self::new(device_id, "testloop".to_string(), chips.clone(), log);
        for (i, address) in Address::enumerate_all(chips).into_iter().enumerate() {
            let offset = Timestamp::from_total_seconds(period.as_secs_f64() * i as f64);
            program.add_command(address, offset);
        }
        program.finalize()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        // best-effort, racy by design: callers serialize through the
        // controller's interaction mutex for anything that matters
        match self.handle.try_lock() {
            Some(guard) => guard.is_some(),
            None => true,
        }
    }

    /// Spawn the execution task. Fails if a previous run is still active.
    /// `hold` is how long each fuse stays energized once triggered (the
    /// configured `[timings] ignition` duration). `resolution` is the
    /// loop's polling period (the configured `[timings] resolution`
    /// duration, spec.md §4.6's "tick"). `on_complete` fires exactly once,
    /// only if the program runs to completion on its own (not via `stop`),
    /// so the caller can react without polling.
    pub async fn run(
        self: &Arc<Self>,
        hardware: Arc<HardwareController>,
        hold: Duration,
        resolution: Duration,
        on_complete: OnComplete,
    ) -> error::Result<()> {
        let mut handle_guard = self.handle.lock().await;
        if handle_guard.is_some() {
            return Err(ErrorKind::ProgramRunning.into());
        }

        let (tx, rx) = watch::channel(Control::Running);
        *self.control.lock().await = Some(tx);

        let program = self.clone();
        let handle =
            tokio::spawn(async move { program.execute(hardware, hold, resolution, rx, on_complete).await });
        *handle_guard = Some(handle);

        info!(self.log, "program started"; "name" => %self.name, "commands" => self.commands.len());
        Ok(())
    }

    async fn execute(
        self: Arc<Self>,
        hardware: Arc<HardwareController>,
        hold: Duration,
        resolution: Duration,
        mut control: watch::Receiver<Control>,
        on_complete: OnComplete,
    ) {
        let mut elapsed = Duration::from_secs(0);
        let mut fired = vec![false; self.commands.len()];
        let mut finished_naturally = false;

        loop {
            match *control.borrow() {
                Control::Stopped => break,
                Control::Paused => {
                    // hold the clock while paused; wake on the next control change
                    if control.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                Control::Running => {}
            }

            for (i, cmd) in self.commands.iter().enumerate() {
                if !fired[i] && cmd.offset().as_duration() <= elapsed {
                    fired[i] = true;
                    let cmd = cmd.clone();
                    let hardware = hardware.clone();
                    // `fire` logs and swallows its own bus errors; the only
                    // `Err` it can return here is `AlreadyFired`, which the
                    // `fired` guard above already rules out.
                    tokio::spawn(async move { cmd.fire(hardware, hold).await });
                }
            }

            if fired.iter().all(|&f| f) {
                finished_naturally = true;
                break;
            }

            tokio::time::sleep(resolution).await;
            elapsed += resolution;
        }

        info!(self.log, "program execution finished"; "name" => %self.name);

        if finished_naturally {
            // `stop()` clears these itself before joining; only a natural
            // finish needs to clear them here, so a later `run()` isn't
            // rejected with `ProgramRunning` for a task that already ended.
            *self.control.lock().await = None;
            *self.handle.lock().await = None;
            on_complete().await;
        }
    }

    pub async fn pause(&self) -> error::Result<()> {
        let guard = self.control.lock().await;
        match guard.as_ref() {
            Some(tx) => {
                tx.send(Control::Paused).ok();
                Ok(())
            }
            None => Err(ErrorKind::NoProgramRunning.into()),
        }
    }

    pub async fn continue_(&self) -> error::Result<()> {
        let guard = self.control.lock().await;
        match guard.as_ref() {
            Some(tx) => {
                tx.send(Control::Running).ok();
                Ok(())
            }
            None => Err(ErrorKind::NoProgramRunning.into()),
        }
    }

    /// Signal the execution task to stop and wait up to `timeout` (the
    /// configured `[timeouts] program_thread` duration) for it to finish.
    pub async fn stop(&self, timeout: Duration) -> error::Result<()> {
        let tx = self.control.lock().await.take();
        let tx = match tx {
            Some(tx) => tx,
            None => return Err(ErrorKind::NoProgramRunning.into()),
        };
        tx.send(Control::Stopped).ok();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => Ok(()),
                Err(_) => Err(ErrorKind::HangingProgramThread.into()),
            }
        } else {
            Ok(())
        }
    }

    /// The per-chip × 16-slot label grid (spec.md §3/§4.6): every slot a
    /// command covers gets that command's current status; slots no
    /// command covers stay `None`. Two commands whose ranges overlap the
    /// same slot resolve by rank (`Fired > Firing > Staged`) so an
    /// already-fired command's slot can't be stomped back to `Staged` by a
    /// later, not-yet-due command sharing that slot; among commands tied
    /// at the same rank, the later one in list order wins.
    pub async fn fuse_status(&self) -> FuseStatusMap {
        let mut grid = empty_fuse_status_for(&self.chips);
        for cmd in &self.commands {
            let label = FuseLabel::from(cmd.status().await);
            if let Some(slots) = grid.get_mut(&cmd.address().letter()) {
                for slot in cmd.address().covered_slots() {
                    let cell = &mut slots[slot as usize];
                    if label.rank() >= cell.rank() {
                        *cell = label;
                    }
                }
            }
        }
        grid
    }

    /// Status projection for a program that has never been run, or when
    /// no program is loaded at all: every slot is `None`.
    pub fn empty_fuse_status(&self) -> FuseStatusMap {
        empty_fuse_status_for(&self.chips)
    }
}
