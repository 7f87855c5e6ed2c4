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

//! I2C register bus: a single process-wide serialized `read`/`write` pair,
//! backed either by a real `/dev/i2c-N` device node or, when that node is
//! absent, by a JSON-file-backed simulator. Selection happens once at
//! startup and is never switched thereafter.

use slog::{info, warn};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use embedded_hal::blocking::i2c::{Read, Write};
use failure::ResultExt;
use futures::channel::{mpsc, oneshot};
use futures::lock::Mutex;
use futures::stream::StreamExt;
use linux_embedded_hal::I2cdev;
use serde::{Deserialize, Serialize};

use crate::error::{self, ErrorKind};

/// Primitive register read/write contract. A single process-wide mutex
/// (via [`SharedBus`]) serializes every call; no interleaving, no
/// re-entrance.
#[async_trait]
pub trait BusDriver: Send + Sync {
    async fn read(&self, chip: u8, reg: u8) -> error::Result<u8>;
    async fn write(&self, chip: u8, reg: u8, val: u8) -> error::Result<()>;
}

/// Wraps any [`BusDriver`] in a lock, so it can be cloned and shared between
/// concurrent callers while guaranteeing serialized access to the
/// underlying bus.
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<Box<dyn BusDriver>>>,
}

impl SharedBus {
    pub fn new(bus: Box<dyn BusDriver>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    pub async fn read(&self, chip: u8, reg: u8) -> error::Result<u8> {
        let bus = self.inner.lock().await;
        bus.read(chip, reg).await
    }

    pub async fn write(&self, chip: u8, reg: u8, val: u8) -> error::Result<()> {
        let bus = self.inner.lock().await;
        bus.write(chip, reg, val).await
    }
}

/// Probe whether the real bus device node is present, and build the
/// appropriate backend. Called once at startup.
pub fn open(device_path: &Path, simulation_file: &Path, log: slog::Logger) -> error::Result<SharedBus> {
    if device_path.exists() {
        info!(log, "opening real I2C bus"; "device" => %device_path.display());
        let driver = RealBus::open(device_path, log)?;
        Ok(SharedBus::new(Box::new(driver)))
    } else {
        info!(log, "I2C device node not present, falling back to simulated bus";
              "device" => %device_path.display(), "data_file" => %simulation_file.display());
        Ok(SharedBus::new(Box::new(SimulatedBus::new(
            simulation_file.to_path_buf(),
        ))))
    }
}

enum Request {
    Read {
        chip: u8,
        reg: u8,
        reply: oneshot::Sender<error::Result<u8>>,
    },
    Write {
        chip: u8,
        reg: u8,
        val: u8,
        reply: oneshot::Sender<error::Result<()>>,
    },
}

/// Real bus backend: runs the (blocking) `I2cdev` in a dedicated worker
/// thread and forwards requests over a channel, so async callers never
/// block the executor.
pub struct RealBus {
    device_path: String,
    request_tx: mpsc::UnboundedSender<Request>,
}

impl RealBus {
    pub fn open(device_path: &Path, log: slog::Logger) -> error::Result<Self> {
        let device_path_str = device_path.display().to_string();
        let i2c_device = I2cdev::new(device_path)
            .map_err(|e| ErrorKind::BusOpen(device_path_str.clone(), e.to_string()))?;
        let (request_tx, request_rx) = mpsc::unbounded();

        let worker_path = device_path_str.clone();
        std::thread::Builder::new()
            .name("i2c-bus-worker".to_string())
            .spawn(move || serve_requests(i2c_device, request_rx, worker_path, log))
            .context(ErrorKind::BusOpen(device_path_str.clone(), "spawn failed".to_string()))?;

        Ok(Self {
            device_path: device_path_str,
            request_tx,
        })
    }
}

fn serve_requests(
    mut i2c_device: I2cdev,
    mut request_rx: mpsc::UnboundedReceiver<Request>,
    bus_name: String,
    log: slog::Logger,
) {
    while let Some(request) = futures::executor::block_on(request_rx.next()) {
        match request {
            Request::Read { chip, reg, reply } => {
                let mut byte = [0u8; 1];
                let result = i2c_device
                    .write_read(chip, &[reg], &mut byte)
                    .map(|_| byte[0])
                    .map_err(|e| {
                        ErrorKind::BusReadError(bus_name.clone(), chip, reg, e.to_string()).into()
                    });
                if reply.send(result).is_err() {
                    warn!(log, "bus read reply dropped"; "chip" => chip, "reg" => reg);
                }
            }
            Request::Write {
                chip,
                reg,
                val,
                reply,
            } => {
                let result = i2c_device.write(chip, &[reg, val]).map_err(|e| {
                    ErrorKind::BusWriteError(bus_name.clone(), chip, reg, val, e.to_string()).into()
                });
                if reply.send(result).is_err() {
                    warn!(log, "bus write reply dropped"; "chip" => chip, "reg" => reg);
                }
            }
        }
    }
}

#[async_trait]
impl BusDriver for RealBus {
    async fn read(&self, chip: u8, reg: u8) -> error::Result<u8> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .unbounded_send(Request::Read {
                chip,
                reg,
                reply: reply_tx,
            })
            .map_err(|_| ErrorKind::BusOpen(self.device_path.clone(), "worker gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ErrorKind::BusOpen(self.device_path.clone(), "worker gone".to_string()))?
    }

    async fn write(&self, chip: u8, reg: u8, val: u8) -> error::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .unbounded_send(Request::Write {
                chip,
                reg,
                val,
                reply: reply_tx,
            })
            .map_err(|_| ErrorKind::BusOpen(self.device_path.clone(), "worker gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ErrorKind::BusOpen(self.device_path.clone(), "worker gone".to_string()))?
    }
}

/// One chip's 32 register bytes, as persisted in the simulation data file.
type ChipRegisters = [u8; 32];

#[derive(Serialize, Deserialize, Default)]
struct SimulationDocument(HashMap<String, ChipRegisters>);

/// Hardware simulation backend: a JSON document mapping decimal chip
/// address to a 32-byte register array, re-read and rewritten under lock
/// on every access.
pub struct SimulatedBus {
    data_path: PathBuf,
    state: std::sync::Mutex<HashMap<String, ChipRegisters>>,
}

impl SimulatedBus {
    pub fn new(data_path: PathBuf) -> Self {
        let state = Self::load(&data_path).unwrap_or_default();
        Self {
            data_path,
            state: std::sync::Mutex::new(state),
        }
    }

    fn load(path: &Path) -> Option<HashMap<String, ChipRegisters>> {
        let contents = std::fs::read_to_string(path).ok()?;
        let doc: SimulationDocument = serde_json::from_str(&contents).ok()?;
        Some(doc.0)
    }

    fn persist(&self, map: &HashMap<String, ChipRegisters>) -> error::Result<()> {
        let serialized = serde_json::to_string(map)
            .context(ErrorKind::General("failed to serialize simulation data".to_string()))?;
        std::fs::write(&self.data_path, serialized)?;
        Ok(())
    }
}

#[async_trait]
impl BusDriver for SimulatedBus {
    async fn read(&self, chip: u8, reg: u8) -> error::Result<u8> {
        let state = self.state.lock().expect("simulation state poisoned");
        let registers = state.get(&chip.to_string()).copied().unwrap_or([0; 32]);
        Ok(registers[reg as usize])
    }

    async fn write(&self, chip: u8, reg: u8, val: u8) -> error::Result<()> {
        let mut state = self.state.lock().expect("simulation state poisoned");
        let registers = state.entry(chip.to_string()).or_insert([0; 32]);
        registers[reg as usize] = val;
        let snapshot = state.clone();
        drop(state);
        self.persist(&snapshot)
    }
}

impl fmt::Debug for SimulatedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimulatedBus({})", self.data_path.display())
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory fake bus for unit tests: one 256-byte register space per
    /// chip, no file I/O.
    pub struct FakeBus {
        registers: StdMutex<HashMap<u8, [u8; 256]>>,
    }

    impl FakeBus {
        pub fn new() -> Self {
            Self {
                registers: StdMutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl BusDriver for FakeBus {
        async fn read(&self, chip: u8, reg: u8) -> error::Result<u8> {
            let registers = self.registers.lock().unwrap();
            Ok(registers.get(&chip).map(|r| r[reg as usize]).unwrap_or(0))
        }

        async fn write(&self, chip: u8, reg: u8, val: u8) -> error::Result<()> {
            let mut registers = self.registers.lock().unwrap();
            let entry = registers.entry(chip).or_insert([0; 256]);
            entry[reg as usize] = val;
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_utils::FakeBus;
    use super::*;

    #[tokio::test]
    async fn test_shared_bus_serializes_access() {
        let bus = SharedBus::new(Box::new(FakeBus::new()));
        bus.write(0x20, 0x14, 0x05).await.unwrap();
        assert_eq!(bus.read(0x20, 0x14).await.unwrap(), 0x05);
        assert_eq!(bus.read(0x21, 0x14).await.unwrap(), 0x00);
    }

    #[tokio::test]
    async fn test_simulated_bus_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("sim.json");

        {
            let bus = SimulatedBus::new(data_path.clone());
            bus.write(32, 0x14, 0x7f).await.unwrap();
        }
        {
            let bus = SimulatedBus::new(data_path.clone());
            assert_eq!(bus.read(32, 0x14).await.unwrap(), 0x7f);
        }
    }

    #[tokio::test]
    async fn test_simulated_bus_default_zero() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SimulatedBus::new(dir.path().join("sim.json"));
        assert_eq!(bus.read(32, 0x00).await.unwrap(), 0x00);
    }
}
