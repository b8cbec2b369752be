//! Termination signals as a pollable file descriptor.
//!
//! SIGINT, SIGTERM and SIGHUP are blocked for the (single) thread and
//! delivered through a non-blocking signalfd, so the event loop can wait
//! on the X socket and on termination in the same `poll()` and leave
//! through its normal cleanup path.

use std::os::fd::{AsFd, BorrowedFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use super::ServerError;

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

pub struct ShutdownSignal {
    fd: SignalFd,
}

impl ShutdownSignal {
    /// Block the termination signals and open a signalfd for them.
    pub fn install() -> Result<Self, ServerError> {
        let mut mask = SigSet::empty();
        for signal in SHUTDOWN_SIGNALS {
            mask.add(signal);
        }
        mask.thread_block().map_err(ServerError::Signal)?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(ServerError::Signal)?;

        Ok(Self { fd })
    }

    /// Consume one pending signal, if any. Never blocks.
    pub fn pending(&mut self) -> Result<Option<i32>, ServerError> {
        match self.fd.read_signal() {
            Ok(Some(info)) => Ok(Some(info.ssi_signo as i32)),
            Ok(None) => Ok(None),
            Err(nix::Error::EAGAIN) => Ok(None),
            Err(e) => Err(ServerError::Signal(e)),
        }
    }
}

impl AsFd for ShutdownSignal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
