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

//! End-to-end coverage across address parsing, hardware, and the
//! controller state machine, exercised the way a master would drive them
//! through `boundary::Api`.

use std::sync::Arc;
use std::time::Duration;

use slog::Discard;

use fuseunit::address::ChipTable;
use fuseunit::boundary::{Api, LoadProgramRequest, ProgramStateWire};
use fuseunit::bus::test_utils::FakeBus;
use fuseunit::bus::SharedBus;
use fuseunit::controller::FireController;
use fuseunit::hardware::HardwareController;
use fuseunit::program::{FuseLabel, RawFireCommand};

fn test_api() -> Api {
    let mut chips = ChipTable::new();
    chips.insert('a', 0x20);
    chips.insert('b', 0x21);

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

/// A command-list record, as a master would submit it: `ms` is the
/// decisecond component of the trigger offset despite its wire name.
fn raw_cmd(address: &str, h: u32, m: u32, s: u32, ms: u32) -> RawFireCommand {
    RawFireCommand {
        device_id: "unit-1".to_string(),
        address: address.to_string(),
        h,
        m,
        s,
        ms,
        name: None,
        description: None,
    }
}

/// S4/S5: a paused program holds its not-yet-due commands staged, and
/// resumes firing them once continued.
#[tokio::test]
async fn test_pause_holds_pending_commands() {
    let api = test_api();
    api.load_program(LoadProgramRequest {
        program_name: "pause-test".to_string(),
        commands: vec![raw_cmd("a0", 0, 0, 5, 0)],
    })
    .await
    .unwrap();

    api.run_program().await.unwrap();
    api.pause_program().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = api.get_fuse_status().await;
    assert_eq!(status.get(&'a').unwrap()[0], FuseLabel::Staged);

    api.continue_program().await.unwrap();
    api.stop_program().await.unwrap();
    assert_eq!(api.get_program_state().await, ProgramStateWire::Loaded);
}

/// S6: stopping an in-flight program returns the controller to `Loaded`
/// without losing the loaded program, so it can be rerun.
#[tokio::test]
async fn test_stop_then_rerun() {
    let api = test_api();
    api.load_program(LoadProgramRequest {
        program_name: "rerun".to_string(),
        commands: vec![raw_cmd("b3", 0, 0, 10, 0)],
    })
    .await
    .unwrap();

    api.run_program().await.unwrap();
    api.stop_program().await.unwrap();
    assert_eq!(api.get_program_state().await, ProgramStateWire::Loaded);

    api.run_program().await.unwrap();
    assert_eq!(api.get_program_state().await, ProgramStateWire::Running);
    api.stop_program().await.unwrap();
}

/// A program with a zero-offset command fires it and settles back into a
/// fully-`Fired` status snapshot without operator intervention.
#[tokio::test]
async fn test_immediate_command_runs_to_completion() {
    let api = test_api();
    api.load_program(LoadProgramRequest {
        program_name: "quick".to_string(),
        commands: vec![raw_cmd("a1", 0, 0, 0, 0)],
    })
    .await
    .unwrap();

    api.run_program().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = api.get_fuse_status().await;
    assert_eq!(status.get(&'a').unwrap()[1], FuseLabel::Fired);
}

/// The hardware lock gate blocks both ad-hoc fire and program runs alike.
#[tokio::test]
async fn test_lock_blocks_fire_and_run() {
    let api = test_api();
    api.lock().await.unwrap();
    assert!(api.is_locked().await.unwrap());

    api.load_program(LoadProgramRequest {
        program_name: "locked".to_string(),
        commands: vec![raw_cmd("a0", 0, 0, 0, 0)],
    })
    .await
    .unwrap();

    assert!(api.run_program().await.is_err());

    api.unlock().await.unwrap();
    api.run_program().await.unwrap();
}

/// A record targeting a different device is silently skipped rather than
/// rejecting the whole submission (spec.md §6).
#[tokio::test]
async fn test_load_program_skips_foreign_device_records() {
    let api = test_api();
    api.load_program(LoadProgramRequest {
        program_name: "mixed".to_string(),
        commands: vec![
            raw_cmd("a0", 0, 0, 0, 0),
            RawFireCommand {
                device_id: "some-other-unit".to_string(),
                address: "a1".to_string(),
                h: 0,
                m: 0,
                s: 0,
                ms: 0,
                name: None,
                description: None,
            },
        ],
    })
    .await
    .unwrap();

    let status = api.get_fuse_status().await;
    let a = status.get(&'a').unwrap();
    assert_eq!(a[0], FuseLabel::Staged);
    assert_eq!(a[1], FuseLabel::None);
}

/// A malformed address in any record rejects the whole submission.
#[tokio::test]
async fn test_load_program_rejects_invalid_address() {
    let api = test_api();
    let result = api
        .load_program(LoadProgramRequest {
            program_name: "bad".to_string(),
            commands: vec![raw_cmd("z9", 0, 0, 0, 0)],
        })
        .await;
    assert!(result.is_err());
}
