// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic flush thread.
//!
//! The thread sleeps for the flush interval on a condvar tied to a
//! [`StopSignal`], so stopping it never waits for the interval to elapse.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interruptible stop flag shared between the owner and the flush thread.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.condvar.notify_all();
    }

    /// Check if the flag is raised.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for up to `timeout`.
    ///
    /// Returns `true` as soon as the flag is raised, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.condvar.wait_until(&mut stopped, deadline).timed_out() {
                return *stopped;
            }
        }
        true
    }
}

/// Handle to the running flush thread.
///
/// Dropping the handle stops and joins the thread.
#[derive(Debug)]
pub struct FlushScheduler {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Spawn the flush thread.
    ///
    /// `flush` runs once per `interval` until the signal is raised. It does
    /// not run again after the stop; the owner performs the final flush.
    pub fn spawn<F>(interval: Duration, signal: Arc<StopSignal>, flush: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("bq-output-flush".to_string())
            .spawn(move || {
                tracing::debug!(?interval, "Flush thread started");
                while !thread_signal.wait_timeout(interval) {
                    flush();
                }
                tracing::debug!("Flush thread stopped");
            })?;

        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    /// Raise the stop flag, wake the thread and join it.
    ///
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("Flush thread panicked");
            }
        }
    }

    /// Check if the thread has been joined.
    pub fn is_stopped(&self) -> bool {
        self.thread.is_none()
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
