// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signal handling support, for both the controller (catching Ctrl-C so it
//! can flush and re-raise) and the worker (catching the termination signal
//! so it can finish its current task and stop cleanly).

/// The kind of signal the controller received.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalEvent {
    /// SIGINT / Ctrl-C -- the user wants to cancel the run.
    Interrupt,
    /// SIGTERM -- treated the same as an interrupt for the controller.
    Terminate,
}

/// Listens for interrupt-like signals on the controller side. A no-op
/// variant is provided for tests, which should not install real signal
/// handlers.
pub struct SignalHandler {
    inner: Option<imp::Signals>,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            inner: Some(imp::Signals::new()?),
        })
    }

    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub async fn recv(&mut self) -> Option<SignalEvent> {
        match &mut self.inner {
            Some(signals) => signals.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::SignalEvent;
    use tokio::signal::unix::{signal, SignalKind};

    pub struct Signals {
        interrupt: tokio::signal::unix::Signal,
        terminate: tokio::signal::unix::Signal,
    }

    impl Signals {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        pub async fn recv(&mut self) -> Option<SignalEvent> {
            tokio::select! {
                _ = self.interrupt.recv() => Some(SignalEvent::Interrupt),
                _ = self.terminate.recv() => Some(SignalEvent::Terminate),
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::SignalEvent;

    pub struct Signals;

    impl Signals {
        pub fn new() -> std::io::Result<Self> {
            Ok(Self)
        }

        pub async fn recv(&mut self) -> Option<SignalEvent> {
            match tokio::signal::ctrl_c().await {
                Ok(()) => Some(SignalEvent::Interrupt),
                Err(_) => None,
            }
        }
    }
}

/// Sends the worker's termination signal (SIGTERM on Unix) to a child
/// process group, used by the dispatcher's fail-fast "terminate all"
/// action. On non-Unix targets this falls back to a hard kill, since there
/// is no equivalent cooperative signal.
pub fn terminate_process_group(pid: u32) {
    imp_kill::terminate(pid);
}

/// Sends an unconditional kill to a child process group, used by the hang
/// detector's "kill all" action.
pub fn kill_process_group(pid: u32) {
    imp_kill::kill(pid);
}

#[cfg(unix)]
mod imp_kill {
    pub fn terminate(pid: u32) {
        unsafe {
            // Negative pid targets the whole process group; workers are
            // spawned with `process_group(0)` so each is its own group
            // leader, which lets us reach any grandchildren it spawned
            // (e.g. the server under test) in one signal.
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }

    pub fn kill(pid: u32) {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
mod imp_kill {
    pub fn terminate(_pid: u32) {
        // No cooperative signal equivalent; callers fall back to `Child::kill`.
    }

    pub fn kill(_pid: u32) {}
}
