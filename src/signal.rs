// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Waitable primitives shared by the pipeline stages.
//!
//! Both primitives are backed by an `eventfd` registered on a private epoll instance, so every
//! wait is bounded and a waiter can be woken from any thread.

use std::os::fd::AsFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::omx::OmxError;

/// Longest single epoll wait. Longer waits are split in several rounds.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to create eventfd: {0}")]
    EventFd(Errno),
    #[error("failed to set up epoll: {0}")]
    Epoll(Errno),
    #[error("failed to wait for event: {0}")]
    Wait(Errno),
    #[error("failed to write event: {0}")]
    Write(Errno),
    #[error("failed to read event: {0}")]
    Read(Errno),
}

impl From<SignalError> for OmxError {
    fn from(value: SignalError) -> Self {
        log::error!("signal primitive failure: {value}");
        match value {
            SignalError::EventFd(_) | SignalError::Epoll(_) => OmxError::InsufficientResources,
            _ => OmxError::Undefined,
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;

/// An eventfd together with the epoll instance used to wait on it.
struct Waitable {
    event: EventFd,
    epoll: Epoll,
}

impl Waitable {
    fn new(flags: EfdFlags) -> SignalResult<Self> {
        let event = EventFd::from_flags(flags | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(SignalError::EventFd)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(SignalError::Epoll)?;
        epoll
            .add(event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
            .map_err(SignalError::Epoll)?;

        Ok(Self { event, epoll })
    }

    /// Waits until the eventfd is readable or `timeout` expires. Returns whether it is readable.
    fn poll(&self, timeout: Duration) -> SignalResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(MAX_WAIT_SLICE);
            let epoll_timeout =
                EpollTimeout::try_from(slice).map_err(|_| SignalError::Wait(Errno::EINVAL))?;

            let mut events = [EpollEvent::empty()];
            match self.epoll.wait(&mut events, epoll_timeout) {
                Ok(0) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                }
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(SignalError::Wait(err)),
            }
        }
    }

    fn write(&self) -> SignalResult<()> {
        self.event.write(1).map_err(SignalError::Write)?;
        Ok(())
    }

    /// Reads the counter without blocking. Returns `None` if it was zero.
    fn try_read(&self) -> SignalResult<Option<u64>> {
        match self.event.read() {
            Ok(value) => Ok(Some(value)),
            Err(Errno::EAGAIN) => Ok(None),
            Err(err) => Err(SignalError::Read(err)),
        }
    }
}

/// A binary event. Once set it stays set until [`Signal::reset`] is called, and every waiter
/// observes it.
pub struct Signal(Waitable);

impl Signal {
    pub fn new() -> SignalResult<Self> {
        Ok(Self(Waitable::new(EfdFlags::empty())?))
    }

    pub fn set(&self) -> SignalResult<()> {
        self.0.write()
    }

    pub fn reset(&self) -> SignalResult<()> {
        self.0.try_read()?;
        Ok(())
    }

    pub fn is_set(&self) -> SignalResult<bool> {
        self.0.poll(Duration::ZERO)
    }

    /// Waits for the signal to be set. Returns `false` if `timeout` expired first.
    pub fn wait_timeout(&self, timeout: Duration) -> SignalResult<bool> {
        self.0.poll(timeout)
    }
}

/// A counting semaphore.
pub struct Semaphore(Waitable);

impl Semaphore {
    pub fn new() -> SignalResult<Self> {
        Ok(Self(Waitable::new(EfdFlags::EFD_SEMAPHORE)?))
    }

    /// Increments the count by one.
    pub fn post(&self) -> SignalResult<()> {
        self.0.write()
    }

    /// Decrements the count if it is positive. Returns whether it was decremented.
    pub fn try_wait(&self) -> SignalResult<bool> {
        Ok(self.0.try_read()?.is_some())
    }

    /// Decrements the count, waiting up to `timeout` for it to become positive.
    pub fn wait_timeout(&self, timeout: Duration) -> SignalResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            // Another waiter may take the count between the poll and the read.
            self.0.poll(remaining)?;
        }
    }

    /// Drops the whole count back to zero.
    pub fn reset(&self) -> SignalResult<()> {
        while self.try_wait()? {}
        Ok(())
    }
}

/// A start gate: a latched boolean paired with a [`Signal`] to wait for it.
///
/// Waiters can also be woken without opening the gate, to let them observe another condition
/// such as an exit request.
pub struct Gate {
    open: AtomicBool,
    signal: Signal,
}

impl Gate {
    pub fn new() -> SignalResult<Self> {
        Ok(Self {
            open: AtomicBool::new(false),
            signal: Signal::new()?,
        })
    }

    /// Opens the gate. Opening an open gate does nothing.
    pub fn open(&self) -> SignalResult<()> {
        if !self.open.swap(true, Ordering::AcqRel) {
            self.signal.set()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) -> SignalResult<()> {
        self.open.store(false, Ordering::Release);
        self.signal.reset()
    }

    /// Wakes every waiter without opening the gate.
    pub fn wake(&self) -> SignalResult<()> {
        self.signal.set()
    }

    /// Drops pending wake-ups of a closed gate.
    pub fn rearm(&self) -> SignalResult<()> {
        if !self.is_open() {
            self.signal.reset()?;
        }
        Ok(())
    }

    /// Waits until the gate is opened or woken. Returns `false` if `timeout` expired first.
    pub fn wait_timeout(&self, timeout: Duration) -> SignalResult<bool> {
        self.signal.wait_timeout(timeout)
    }
}
