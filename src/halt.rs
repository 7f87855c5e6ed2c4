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

//! This module provides a way to
//!   * spawn tasks in "termination context"
//!   * terminate that context
//!   * wait for "termination" in normal context
//!
//! Termination context means that task is run `select`-ed on termination condition, and when
//! that condition is signaled, select returns and the task is dropped.
//! In case you want to do some cleanup, you can wait on the termination condition and then
//! cancel/cleanup whatever you want.

use std::sync::Arc;
use std::time::Duration;

use core::future::Future;
use futures::future::{select, FutureExt};
use futures::lock::Mutex;
use slog::error;
use tokio::sync::watch;

/// Sender of `Halt` condition
#[derive(Clone)]
pub struct Sender {
    inner: Arc<Mutex<watch::Sender<bool>>>,
}

impl Sender {
    /// Broadcast `Halt` condition, then give spawned tasks a moment to
    /// notice and unwind before the caller proceeds to exit the process.
    pub async fn do_stop(&self) {
        self.inner
            .lock()
            .await
            .send(true)
            .expect("halt broadcast failed: no receivers left");
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Receiver of `Halt` condition
#[derive(Clone)]
pub struct Receiver {
    inner: watch::Receiver<bool>,
    log: slog::Logger,
}

impl Receiver {
    /// Wait for `Halt` to be broadcast.
    pub async fn wait_for_halt(&mut self) {
        loop {
            if *self.inner.borrow() {
                return;
            }
            if self.inner.changed().await.is_err() {
                error!(self.log, "halt sender dropped, shutting down task with no signal");
                return;
            }
        }
    }

    /// Spawn a new task that is dropped as soon as `Halt` is received.
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + 'static + Send,
    {
        let mut receiver = self.clone();
        tokio::spawn(async move {
            select(f.boxed(), receiver.wait_for_halt().boxed()).await;
        });
    }
}

pub fn make_pair(log: slog::Logger) -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(false);
    (
        Sender {
            inner: Arc::new(Mutex::new(tx)),
        },
        Receiver { inner: rx, log },
    )
}
