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

//! The facade a transport layer (HTTP, CLI, whatever carries the wire
//! protocol) dispatches onto: one [`Api`] per running unit, wrapping the
//! controller and hardware in typed request/response pairs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::address::{Address, ChipTable};
use crate::controller::{FireController, ProgramState};
use crate::error::{self, ErrorKind};
use crate::hardware::HardwareController;
use crate::program::{FuseStatusMap, Program, RawFireCommand};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadProgramRequest {
    pub program_name: String,
    pub commands: Vec<RawFireCommand>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FireRequest {
    pub address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramStateWire {
    Unloaded,
    Loaded,
    Running,
    Paused,
    RunningTl,
    PausedTl,
    Scheduled,
}

impl From<ProgramState> for ProgramStateWire {
    fn from(state: ProgramState) -> Self {
        match state {
            ProgramState::Unloaded => Self::Unloaded,
            ProgramState::Loaded => Self::Loaded,
            ProgramState::Running => Self::Running,
            ProgramState::Paused => Self::Paused,
            ProgramState::RunningTl => Self::RunningTl,
            ProgramState::PausedTl => Self::PausedTl,
            ProgramState::Scheduled => Self::Scheduled,
        }
    }
}

/// The payload pushed to a registered master, mirroring
/// `master_communication.py`'s heartbeat body. Outbound transport (the
/// actual HTTP push) is a transport-layer concern; `Api` only assembles
/// the snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub device_id: String,
    pub system_time: DateTime<Utc>,
    pub locked: bool,
    pub program_state: ProgramStateWire,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub program_name: Option<String>,
    pub fuse_states: FuseStatusMap,
    pub error_states: BTreeMap<char, [bool; 16]>,
}

struct MasterRegistration {
    address: String,
    port: u16,
}

pub struct Api {
    device_id: String,
    chips: ChipTable,
    controller: Arc<FireController>,
    hardware: Arc<HardwareController>,
    master: AsyncMutex<Option<MasterRegistration>>,
    log: slog::Logger,
}

impl Api {
    pub fn new(
        device_id: String,
        chips: ChipTable,
        controller: Arc<FireController>,
        hardware: Arc<HardwareController>,
        log: slog::Logger,
    ) -> Self {
        Self {
            device_id,
            chips,
            controller,
            hardware,
            master: AsyncMutex::new(None),
            log,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn load_program(&self, request: LoadProgramRequest) -> error::Result<()> {
        let program = Program::from_command_list(
            &self.device_id,
            request.program_name,
            request.commands,
            &self.chips,
            self.log.clone(),
        )?;
        self.controller.load_program(program).await
    }

    pub async fn delete_program(&self) -> error::Result<()> {
        self.controller.delete_program().await
    }

    pub async fn run_program(&self) -> error::Result<()> {
        self.controller.run_program().await
    }

    pub async fn pause_program(&self) -> error::Result<()> {
        self.controller.pause_program().await
    }

    pub async fn continue_program(&self) -> error::Result<()> {
        self.controller.continue_program().await
    }

    pub async fn stop_program(&self) -> error::Result<()> {
        self.controller.stop_program().await
    }

    pub async fn schedule_program(&self, request: ScheduleRequest) -> error::Result<()> {
        self.controller.schedule_program(request.time).await
    }

    pub async fn unschedule_program(&self) -> error::Result<()> {
        self.controller.unschedule_program().await
    }

    pub async fn testloop(&self) -> error::Result<()> {
        self.controller.testloop(&self.device_id).await
    }

    pub async fn fire(&self, request: FireRequest) -> error::Result<()> {
        let address = Address::parse(&request.address, &self.chips)?;
        self.controller.fire(address).await
    }

    pub async fn is_locked(&self) -> error::Result<bool> {
        self.hardware.is_locked().await
    }

    pub async fn lock(&self) -> error::Result<()> {
        self.hardware.lock().await
    }

    pub async fn unlock(&self) -> error::Result<()> {
        self.hardware.unlock().await
    }

    pub async fn clear_error_flags(&self) -> error::Result<()> {
        self.hardware.clear_error_flags().await
    }

    pub async fn get_program_state(&self) -> ProgramStateWire {
        self.controller.get_program_state().await.into()
    }

    pub async fn get_scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.controller.get_scheduled_time().await
    }

    pub async fn get_program_name(&self) -> Option<String> {
        self.controller.get_program_name().await
    }

    pub async fn get_fuse_status(&self) -> FuseStatusMap {
        self.controller.get_fuse_status().await
    }

    /// Record (or replace) where heartbeats should be sent. Mirrors
    /// `MasterCommunicator.register_master`: state only, no outbound call.
    pub async fn register_master(&self, address: String, port: u16) -> (String, usize) {
        *self.master.lock().await = Some(MasterRegistration { address, port });
        (self.device_id.clone(), self.chips.len())
    }

    /// Mirrors `MasterCommunicator.deregister_master`: errors if nothing
    /// was registered, matching the original's `NotRegistered` guard.
    pub async fn deregister_master(&self) -> error::Result<()> {
        let mut master = self.master.lock().await;
        if master.take().is_none() {
            return Err(ErrorKind::General("no master is currently registered".to_string()).into());
        }
        Ok(())
    }

    pub async fn master_registration(&self) -> Option<(String, u16)> {
        self.master
            .lock()
            .await
            .as_ref()
            .map(|m| (m.address.clone(), m.port))
    }

    /// Assemble the heartbeat payload a transport layer would push to the
    /// registered master, if any.
    pub async fn heartbeat_snapshot(&self) -> error::Result<HeartbeatSnapshot> {
        let errors = self.hardware.errors().await?;
        Ok(HeartbeatSnapshot {
            device_id: self.device_id.clone(),
            system_time: Utc::now(),
            locked: self.hardware.is_locked().await?,
            program_state: self.controller.get_program_state().await.into(),
            scheduled_time: self.controller.get_scheduled_time().await,
            program_name: self.controller.get_program_name().await,
            fuse_states: self.get_fuse_status().await,
            error_states: errors.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::test_utils::FakeBus;
    use crate::bus::SharedBus;
    use slog::Discard;
    use std::time::Duration;

    fn api() -> Api {
        let mut chips = ChipTable::new();
        chips.insert('a', 0x20);
        let bus = SharedBus::new(Box::new(FakeBus::new()));
        let log = slog::Logger::root(Discard, slog::o!());
        let hardware = Arc::new(HardwareController::new(bus, chips.clone(), log.clone()));
        let controller = FireController::new(
            hardware.clone(),
            chips.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(5),
            Duration::from_secs(5),
            None,
            log.clone(),
        );
        Api::new("unit-1".to_string(), chips, controller, hardware, log)
    }

    #[tokio::test]
    async fn test_load_and_run_via_facade() {
        let api = api();
        api.load_program(LoadProgramRequest {
            program_name: "demo".to_string(),
            commands: vec![RawFireCommand {
                device_id: "unit-1".to_string(),
                address: "a0".to_string(),
                h: 0,
                m: 0,
                s: 0,
                ms: 0,
                name: None,
                description: None,
            }],
        })
        .await
        .unwrap();

        assert_eq!(api.get_program_state().await, ProgramStateWire::Loaded);
        assert_eq!(api.get_program_name().await, Some("demo".to_string()));

        api.run_program().await.unwrap();
        assert_eq!(api.get_program_state().await, ProgramStateWire::Running);
    }

    #[tokio::test]
    async fn test_master_registration_roundtrip() {
        let api = api();
        assert!(api.deregister_master().await.is_err());

        api.register_master("10.0.0.5".to_string(), 9000).await;
        assert_eq!(
            api.master_registration().await,
            Some(("10.0.0.5".to_string(), 9000))
        );
        api.deregister_master().await.unwrap();
        assert_eq!(api.master_registration().await, None);
    }

    #[tokio::test]
    async fn test_heartbeat_snapshot_shape() {
        let api = api();
        let snapshot = api.heartbeat_snapshot().await.unwrap();
        assert_eq!(snapshot.device_id, "unit-1");
        assert_eq!(snapshot.program_state, ProgramStateWire::Unloaded);
        assert!(snapshot.error_states.contains_key(&'a'));
    }
}
