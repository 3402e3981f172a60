//! Reader / Exclusive / Shared-Exclusive latch.
//!
//! Compatibility:
//!
//! | held \ requested | S | SX | X |
//! |------------------|---|----|---|
//! | S                | ✓ | ✓  | ✗ |
//! | SX               | ✓ | ✗  | ✗ |
//! | X                | ✗ | ✗  | ✗ |
//!
//! The SX holder may upgrade to X; while an upgrade is pending, new readers
//! are held back so the upgrader cannot starve. Built as an explicit state
//! machine over a mutex and condvar because the SX mode and upgrader
//! priority have no counterpart in a standard reader-writer lock.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{DbError, Result};

/// Acquisition mode for an [`RwsxLatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    SharedExclusive,
    Exclusive,
}

#[derive(Default)]
struct State {
    readers: u32,
    exclusive: bool,
    x_owner: Option<ThreadId>,
    sx_owner: Option<ThreadId>,
    upgrading: bool,
}

pub struct RwsxLatch {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for RwsxLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RwsxLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.lock_shared(),
            LatchMode::SharedExclusive => self.lock_sx(),
            LatchMode::Exclusive => self.lock_exclusive(),
        }
    }

    pub fn unlock(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.unlock_shared(),
            LatchMode::SharedExclusive => self.unlock_sx(),
            LatchMode::Exclusive => self.unlock_exclusive(),
        }
    }

    /// Acquire in shared mode. Blocks while X is held or an SX holder is
    /// waiting to upgrade.
    pub fn lock_shared(&self) {
        let mut state = self.state.lock();
        while state.exclusive || state.upgrading {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    pub fn unlock_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "shared unlock without holder");
        state.readers -= 1;
        self.cond.notify_all();
    }

    /// Acquire in shared-exclusive mode. Blocks while X or another SX is
    /// held; compatible with concurrent readers.
    pub fn lock_sx(&self) {
        let tid = thread::current().id();
        let mut state = self.state.lock();
        while state.exclusive || state.sx_owner.is_some() {
            self.cond.wait(&mut state);
        }
        state.sx_owner = Some(tid);
    }

    pub fn unlock_sx(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.sx_owner.is_some(), "SX unlock without holder");
        state.sx_owner = None;
        state.upgrading = false;
        self.cond.notify_all();
    }

    /// Acquire exclusively. Blocks until no reader, SX, or X holder remains.
    pub fn lock_exclusive(&self) {
        let tid = thread::current().id();
        let mut state = self.state.lock();
        while state.exclusive || state.sx_owner.is_some() || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.exclusive = true;
        state.x_owner = Some(tid);
    }

    pub fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive, "exclusive unlock without holder");
        state.exclusive = false;
        state.x_owner = None;
        self.cond.notify_all();
    }

    /// Upgrade SX to X. Only the SX owner may call this. Sets the upgrading
    /// flag so no new readers slip in, then waits for existing readers to
    /// drain.
    pub fn upgrade_sx(&self) -> Result<()> {
        let tid = thread::current().id();
        let mut state = self.state.lock();
        if state.sx_owner != Some(tid) {
            return Err(DbError::Latch("upgrade_sx by non-owner".into()));
        }
        state.upgrading = true;
        while state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.sx_owner = None;
        state.upgrading = false;
        state.exclusive = true;
        state.x_owner = Some(tid);
        Ok(())
    }

    /// Downgrade X to SX, reassigning SX ownership to the caller. Only the X
    /// holder may call this.
    pub fn downgrade_sx(&self) -> Result<()> {
        let tid = thread::current().id();
        let mut state = self.state.lock();
        if !state.exclusive || state.x_owner != Some(tid) {
            return Err(DbError::Latch("downgrade_sx by non-holder".into()));
        }
        state.exclusive = false;
        state.x_owner = None;
        state.sx_owner = Some(tid);
        self.cond.notify_all();
        Ok(())
    }

    /// Downgrade X to S. Only the X holder may call this.
    pub fn downgrade_shared(&self) -> Result<()> {
        let tid = thread::current().id();
        let mut state = self.state.lock();
        if !state.exclusive || state.x_owner != Some(tid) {
            return Err(DbError::Latch("downgrade_shared by non-holder".into()));
        }
        state.exclusive = false;
        state.x_owner = None;
        state.readers += 1;
        self.cond.notify_all();
        Ok(())
    }
}
