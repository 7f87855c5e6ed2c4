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

//! Firing unit errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// Address does not parse: malformed token.
    #[fail(display = "address {:?}: syntax error", _0)]
    AddressSyntax(String),

    /// Address names a chip letter not present in the configured chip table.
    #[fail(display = "address {:?}: unknown chip", _0)]
    UnknownChip(String),

    /// Fuse number is outside 0..15.
    #[fail(display = "address {:?}: fuse number out of range", _0)]
    OutOfRangeFuse(String),

    /// `range` would span past the end of the fuse's 4-fuse register.
    #[fail(display = "address {:?}: range overflows register", _0)]
    RangeOverflow(String),

    /// Timestamp field(s) out of their valid range.
    #[fail(display = "timestamp {}:{}:{}.{} out of range", _0, _1, _2, _3)]
    InvalidTimestamp(u32, u32, u32, u32),

    /// The bus device node could not be opened at all; fatal at startup.
    #[fail(display = "I2C bus open failed on {}: {}", _0, _1)]
    BusOpen(String, String),

    /// A single register read failed.
    #[fail(
        display = "I2C read failed: bus {} chip {:#x} reg {:#x}: {}",
        _0, _1, _2, _3
    )]
    BusReadError(String, u8, u8, String),

    /// A single register write failed.
    #[fail(
        display = "I2C write failed: bus {} chip {:#x} reg {:#x} val {:#x}: {}",
        _0, _1, _2, _3, _4
    )]
    BusWriteError(String, u8, u8, u8, String),

    /// Selected backend does not match the configured/expected bus type.
    #[fail(display = "wrong bus type: {}", _0)]
    WrongBusType(String),

    /// Hardware lock engaged; refused to perform an energizing operation.
    #[fail(display = "hardware is locked")]
    HardwareLocked,

    /// A program transition precondition failed for the controller's current state.
    #[fail(display = "no program is loaded")]
    NoProgramLoaded,

    #[fail(display = "a program is already loaded")]
    ProgramLoaded,

    #[fail(display = "a program is already running")]
    ProgramRunning,

    #[fail(display = "the program is paused")]
    ProgramPaused,

    #[fail(display = "no program is running")]
    NoProgramRunning,

    #[fail(display = "a program launch is already scheduled for {}", _0)]
    ProgramScheduled(String),

    #[fail(display = "no program launch is scheduled")]
    NoProgramScheduled,

    /// `Program::stop` could not join the execution worker within its timeout.
    #[fail(display = "program execution worker did not stop within timeout")]
    HangingProgramThread,

    /// `FireController::unschedule_program` could not join the schedule worker in time.
    #[fail(
        display = "schedule worker did not stop within timeout, still set for {}",
        _0
    )]
    HangingScheduleThread(String),

    /// `FireCommand::fire` called a second time on the same command.
    #[fail(display = "address {:?} has already fired or is firing", _0)]
    AlreadyFired(String),

    /// A submitted program command-list record was malformed or incomplete.
    #[fail(display = "invalid program submission: {}", _0)]
    InvalidProgram(String),
}

/// Implement Fail trait instead of use Derive to get more control over custom type.
/// The main advantage is customization of Context type which allows conversion of
/// any error types to this custom error with general error kind by calling context
/// method on any result type.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
