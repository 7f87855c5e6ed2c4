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

//! The top-level state machine: which program is loaded, whether it is
//! running, paused, or scheduled, and the single gate all of those
//! transitions go through.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use slog::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::address::{Address, ChipTable};
use crate::error::{self, ErrorKind};
use crate::fire_command::FireCommand;
use crate::hardware::HardwareController;
use crate::program::{self, FuseStatusMap, OnComplete, Program};
use crate::timestamp::Timestamp;

/// Where the controller is in its program lifecycle. `RunningTl`/`PausedTl`
/// mirror `Running`/`Paused` but for the built-in hardware test loop rather
/// than a user-submitted program, so the two can't be confused by a caller
/// inspecting only the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramState {
    Unloaded,
    Loaded,
    Running,
    Paused,
    RunningTl,
    PausedTl,
    Scheduled,
}

/// Notable things that happen asynchronously to a caller's request: a
/// program run completing, an individual fuse firing, or a scheduled run
/// starting on its own.
#[derive(Clone, Debug)]
pub enum Event {
    ProgramFinished,
    Fired(Address),
    ScheduledRunStarted,
}

pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: Event);
}

struct Inner {
    state: ProgramState,
    /// The user-loaded program. Untouched by `testloop`/`stop_program`
    /// while the test loop runs against `testloop_program` instead — the
    /// two are independent slots per the data model's "at most one active
    /// program, at most one active testloop program" invariant.
    program: Option<Arc<Program>>,
    testloop_program: Option<Arc<Program>>,
    scheduled_time: Option<DateTime<Utc>>,
    schedule_cancel: Option<watch::Sender<bool>>,
    schedule_handle: Option<JoinHandle<()>>,
}

pub struct FireController {
    hardware: Arc<HardwareController>,
    chips: ChipTable,
    /// How long a fuse stays energized once triggered, whether by a
    /// program command or a bare `fire`. One process-wide value, matching
    /// `Config.get('timings', 'ignition')` in the original.
    ignition_hold: Duration,
    /// The program executor's polling period (`[timings] resolution`),
    /// spec.md §4.6's "tick".
    resolution: Duration,
    /// Spacing between consecutive addresses in a synthesized test loop
    /// (`[timings] testloop_period`).
    testloop_period: Duration,
    /// How long `stop_program`/`delete_program`'s underlying `Program::stop`
    /// waits for the execution worker to join (`[timeouts] program_thread`).
    program_thread_timeout: Duration,
    /// How long `unschedule_program` waits for the schedule worker to join
    /// (`[timeouts] schedule_thread`).
    schedule_thread_timeout: Duration,
    inner: Mutex<Inner>,
    observer: Option<Arc<dyn EventObserver>>,
    log: slog::Logger,
}

impl FireController {
    pub fn new(
        hardware: Arc<HardwareController>,
        chips: ChipTable,
        ignition_hold: Duration,
        resolution: Duration,
        testloop_period: Duration,
        program_thread_timeout: Duration,
        schedule_thread_timeout: Duration,
        observer: Option<Arc<dyn EventObserver>>,
        log: slog::Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            hardware,
            chips,
            ignition_hold,
            resolution,
            testloop_period,
            program_thread_timeout,
            schedule_thread_timeout,
            inner: Mutex::new(Inner {
                state: ProgramState::Unloaded,
                program: None,
                testloop_program: None,
                scheduled_time: None,
                schedule_cancel: None,
                schedule_handle: None,
            }),
            observer,
            log,
        })
    }

    fn emit(&self, event: Event) {
        if let Some(observer) = &self.observer {
            observer.on_event(event);
        }
    }

    /// Describe why an operation that needs the controller `Unloaded`
    /// (`load_program`, `fire`) can't proceed from `inner`'s current state.
    /// Only called once the caller has already confirmed `state !=
    /// Unloaded`.
    fn loaded_conflict(inner: &Inner) -> ErrorKind {
        match inner.state {
            ProgramState::Loaded => ErrorKind::ProgramLoaded,
            ProgramState::Running | ProgramState::RunningTl => ErrorKind::ProgramRunning,
            ProgramState::Paused | ProgramState::PausedTl => ErrorKind::ProgramPaused,
            ProgramState::Scheduled => ErrorKind::ProgramScheduled(Self::scheduled_time_string(inner)),
            ProgramState::Unloaded => unreachable!("caller already excluded Unloaded"),
        }
    }

    /// Describe why an operation that needs a program `Loaded`
    /// (`delete_program`, `run_program`, `schedule_program`, `testloop`)
    /// can't proceed. Only called once the caller has excluded `Loaded`.
    fn not_loaded_conflict(inner: &Inner) -> ErrorKind {
        match inner.state {
            ProgramState::Unloaded => ErrorKind::NoProgramLoaded,
            ProgramState::Running | ProgramState::RunningTl => ErrorKind::ProgramRunning,
            ProgramState::Paused | ProgramState::PausedTl => ErrorKind::ProgramPaused,
            ProgramState::Scheduled => ErrorKind::ProgramScheduled(Self::scheduled_time_string(inner)),
            ProgramState::Loaded => unreachable!("caller already excluded Loaded"),
        }
    }

    /// Describe why an operation that needs something actively running
    /// (`pause_program`, `stop_program`) can't proceed: paused is its own
    /// distinct conflict, everything else just has nothing running.
    fn not_running_conflict(inner: &Inner) -> ErrorKind {
        match inner.state {
            ProgramState::Paused | ProgramState::PausedTl => ErrorKind::ProgramPaused,
            _ => ErrorKind::NoProgramRunning,
        }
    }

    /// Describe why `continue_program` (needs `Paused`/`PausedTl`) can't
    /// proceed: already-running is its own distinct conflict, everything
    /// else has nothing paused to resume.
    fn not_paused_conflict(inner: &Inner) -> ErrorKind {
        match inner.state {
            ProgramState::Running | ProgramState::RunningTl => ErrorKind::ProgramRunning,
            _ => ErrorKind::NoProgramRunning,
        }
    }

    fn scheduled_time_string(inner: &Inner) -> String {
        inner.scheduled_time.map(|t| t.to_rfc3339()).unwrap_or_default()
    }

    pub async fn get_program_state(&self) -> ProgramState {
        self.inner.lock().await.state
    }

    pub async fn get_scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.scheduled_time
    }

    pub async fn get_program_name(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .program
            .as_ref()
            .map(|p| p.name().to_string())
    }

    pub async fn get_fuse_status(&self) -> FuseStatusMap {
        let inner = self.inner.lock().await;
        let active = match inner.state {
            ProgramState::RunningTl | ProgramState::PausedTl => inner.testloop_program.as_ref(),
            _ => inner.program.as_ref(),
        };
        match active {
            Some(program) => program.fuse_status().await,
            None => program::empty_fuse_status_for(&self.chips),
        }
    }

    pub async fn load_program(&self, program: Program) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ProgramState::Unloaded {
            return Err(Self::loaded_conflict(&inner).into());
        }
        inner.program = Some(Arc::new(program));
        inner.state = ProgramState::Loaded;
        info!(self.log, "program loaded");
        Ok(())
    }

    pub async fn delete_program(&self) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ProgramState::Loaded {
            return Err(Self::not_loaded_conflict(&inner).into());
        }
        inner.program = None;
        inner.state = ProgramState::Unloaded;
        info!(self.log, "program deleted");
        Ok(())
    }

    /// Build the callback threaded into `Program::run` so a program that
    /// finishes on its own (without anyone calling `stop_program`) still
    /// drives the `RUNNING -> UNLOADED` / `RUNNING_TL -> LOADED`
    /// transition the state table calls for.
    fn on_complete(self: &Arc<Self>, testloop: bool) -> OnComplete {
        let controller = self.clone();
        Arc::new(move || {
            let controller = controller.clone();
            Box::pin(async move { controller.handle_natural_completion(testloop).await })
        })
    }

    async fn handle_natural_completion(&self, testloop: bool) {
        let mut inner = self.inner.lock().await;
        if testloop {
            if matches!(inner.state, ProgramState::RunningTl | ProgramState::PausedTl) {
                inner.testloop_program = None;
                inner.state = ProgramState::Loaded;
            }
        } else if matches!(inner.state, ProgramState::Running | ProgramState::Paused) {
            inner.program = None;
            inner.state = ProgramState::Unloaded;
        }
        drop(inner);
        info!(self.log, "program finished on its own"; "testloop" => testloop);
        self.emit(Event::ProgramFinished);
    }

    pub async fn run_program(self: &Arc<Self>) -> error::Result<()> {
        if self.hardware.is_locked().await? {
            return Err(ErrorKind::HardwareLocked.into());
        }

        let mut inner = self.inner.lock().await;
        if inner.state != ProgramState::Loaded {
            return Err(Self::not_loaded_conflict(&inner).into());
        }
        let program = inner.program.clone().ok_or(ErrorKind::NoProgramLoaded)?;
        program
            .run(
                self.hardware.clone(),
                self.ignition_hold,
                self.resolution,
                self.on_complete(false),
            )
            .await?;
        inner.state = ProgramState::Running;
        info!(self.log, "program run started");
        Ok(())
    }

    pub async fn pause_program(&self) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, ProgramState::Running | ProgramState::RunningTl) {
            return Err(Self::not_running_conflict(&inner).into());
        }
        let is_testloop = inner.state == ProgramState::RunningTl;
        let program = if is_testloop {
            inner.testloop_program.clone()
        } else {
            inner.program.clone()
        }
        .ok_or(ErrorKind::NoProgramRunning)?;
        program.pause().await?;
        inner.state = if is_testloop {
            ProgramState::PausedTl
        } else {
            ProgramState::Paused
        };
        Ok(())
    }

    pub async fn continue_program(&self) -> error::Result<()> {
        if self.hardware.is_locked().await? {
            return Err(ErrorKind::HardwareLocked.into());
        }

        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, ProgramState::Paused | ProgramState::PausedTl) {
            return Err(Self::not_paused_conflict(&inner).into());
        }
        let is_testloop = inner.state == ProgramState::PausedTl;
        let program = if is_testloop {
            inner.testloop_program.clone()
        } else {
            inner.program.clone()
        }
        .ok_or(ErrorKind::NoProgramRunning)?;
        program.continue_().await?;
        inner.state = if is_testloop {
            ProgramState::RunningTl
        } else {
            ProgramState::Running
        };
        Ok(())
    }

    pub async fn stop_program(&self) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.state,
            ProgramState::Running | ProgramState::Paused | ProgramState::RunningTl | ProgramState::PausedTl
        ) {
            return Err(ErrorKind::NoProgramRunning.into());
        }
        let was_testloop = matches!(inner.state, ProgramState::RunningTl | ProgramState::PausedTl);
        let program = if was_testloop {
            inner.testloop_program.clone()
        } else {
            inner.program.clone()
        }
        .ok_or(ErrorKind::NoProgramRunning)?;
        program.stop(self.program_thread_timeout).await?;

        if was_testloop {
            inner.testloop_program = None;
        }
        inner.state = ProgramState::Loaded;
        self.emit(Event::ProgramFinished);
        info!(self.log, "program stopped");
        Ok(())
    }

    /// Run the built-in per-chip test loop alongside a loaded program,
    /// without disturbing it: `testloop_program` is a slot independent of
    /// `program`, so stopping or finishing the test loop always returns to
    /// `Loaded` with the real program still armed underneath.
    pub async fn testloop(self: &Arc<Self>, device_id: &str) -> error::Result<()> {
        if self.hardware.is_locked().await? {
            return Err(ErrorKind::HardwareLocked.into());
        }

        let mut inner = self.inner.lock().await;
        if inner.state != ProgramState::Loaded {
            return Err(Self::not_loaded_conflict(&inner).into());
        }
        let program = Arc::new(Program::testloop_program(
            device_id.to_string(),
            &self.chips,
            self.testloop_period,
            self.log.clone(),
        )?);
        program
            .run(
                self.hardware.clone(),
                self.ignition_hold,
                self.resolution,
                self.on_complete(true),
            )
            .await?;
        inner.testloop_program = Some(program);
        inner.state = ProgramState::RunningTl;
        info!(self.log, "testloop started");
        Ok(())
    }

    /// Ignite a single fuse outside of any program, for the configured
    /// `ignition_hold` duration. Only permitted when no program is loaded
    /// and no run is scheduled, so a bare `fire` can never race a program
    /// that is about to start on its own.
    pub async fn fire(&self, address: Address) -> error::Result<()> {
        if self.hardware.is_locked().await? {
            return Err(ErrorKind::HardwareLocked.into());
        }

        let inner = self.inner.lock().await;
        if inner.state != ProgramState::Unloaded {
            return Err(Self::loaded_conflict(&inner).into());
        }
        drop(inner);

        let log = self.log.new(slog::o!("address" => address.canonical_string()));
        let command = FireCommand::new(address, Timestamp::new(0, 0, 0, 0)?, None, None, log);
        command.fire(self.hardware.clone(), self.ignition_hold).await?;
        self.emit(Event::Fired(address));
        Ok(())
    }

    pub async fn schedule_program(self: &Arc<Self>, at: DateTime<Utc>) -> error::Result<()> {
        if self.hardware.is_locked().await? {
            return Err(ErrorKind::HardwareLocked.into());
        }

        let mut inner = self.inner.lock().await;
        if inner.state != ProgramState::Loaded {
            return Err(Self::not_loaded_conflict(&inner).into());
        }
        if inner.program.is_none() {
            return Err(ErrorKind::NoProgramLoaded.into());
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let controller = self.clone();
        let target = at;
        let handle = tokio::spawn(async move {
            let now = Utc::now();
            let delay = (target - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if !*cancel_rx.borrow() {
                        controller.run_scheduled().await;
                    }
                }
                _ = cancel_rx.changed() => {}
            }
        });

        inner.scheduled_time = Some(at);
        inner.schedule_cancel = Some(cancel_tx);
        inner.schedule_handle = Some(handle);
        inner.state = ProgramState::Scheduled;
        info!(self.log, "program scheduled"; "at" => %at);
        Ok(())
    }

    async fn run_scheduled(self: Arc<Self>) {
        match self.hardware.is_locked().await {
            Ok(true) => {
                warn!(self.log, "scheduled run suppressed: hardware is locked");
                return;
            }
            Err(e) => {
                warn!(self.log, "scheduled run failed to start"; "error" => %e);
                return;
            }
            Ok(false) => {}
        }

        let mut inner = self.inner.lock().await;
        if inner.state != ProgramState::Scheduled {
            return;
        }
        let program = match inner.program.clone() {
            Some(p) => p,
            None => return,
        };
        let on_complete = self.on_complete(false);
        match program
            .run(self.hardware.clone(), self.ignition_hold, self.resolution, on_complete)
            .await
        {
            Ok(()) => {
                inner.state = ProgramState::Running;
                inner.scheduled_time = None;
                inner.schedule_cancel = None;
                drop(inner);
                self.emit(Event::ScheduledRunStarted);
            }
            Err(e) => warn!(self.log, "scheduled run failed to start"; "error" => %e),
        }
    }

    pub async fn unschedule_program(&self) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ProgramState::Scheduled {
            return Err(ErrorKind::NoProgramScheduled.into());
        }

        if let Some(cancel) = inner.schedule_cancel.take() {
            cancel.send(true).ok();
        }
        let handle = inner.schedule_handle.take();
        let scheduled_time = inner.scheduled_time.take();
        drop(inner);

        if let Some(handle) = handle {
            if tokio::time::timeout(self.schedule_thread_timeout, handle).await.is_err() {
                return Err(ErrorKind::HangingScheduleThread(
                    scheduled_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                )
                .into());
            }
        }

        let mut inner = self.inner.lock().await;
        inner.state = ProgramState::Loaded;
        info!(self.log, "schedule cancelled");
        Ok(())
    }

    pub async fn clear_error_flags(&self) -> error::Result<()> {
        self.hardware.clear_error_flags().await
    }

    pub async fn errors(&self) -> error::Result<crate::hardware::ChipErrors> {
        self.hardware.errors().await
    }

    pub async fn lock(&self) -> error::Result<()> {
        self.hardware.lock().await
    }

    pub async fn unlock(&self) -> error::Result<()> {
        self.hardware.unlock().await
    }

    pub async fn is_locked(&self) -> error::Result<bool> {
        self.hardware.is_locked().await
    }
}
