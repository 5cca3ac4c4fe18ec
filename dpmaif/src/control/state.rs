//! Link lifecycle.
//!
//! # State Machine
//! ```text
//!          PowerOn          BootComplete
//!   OFF ────────────> BOOTING ────────────> RUNNING
//!    ▲                   │                     │
//!    │     Teardown      │      Teardown       │
//!    ├───────────────────┘─────────────────────┘
//!    │
//!    │  Teardown / reset        Fatal (any state)
//!    └──────────────────── FATAL <──────────────
//! ```
//!
//! `StackReady` and `StackDown` only toggle a flag; the data path may be
//! enabled once the link is `RUNNING`, powered and the stack is ready.

use crate::error::{DpmaifError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Off,
    Booting,
    Running,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    /// Modem powered; rings can be set up.
    PowerOn,
    /// Modem firmware finished booting.
    BootComplete,
    /// Host network stack is ready to exchange packets.
    StackReady,
    StackDown,
    /// Orderly shutdown.
    Teardown,
    /// Unrecoverable error reported from outside the data path.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFsm {
    state: LinkState,
    powered: bool,
    stack_ready: bool,
}

impl Default for LinkFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkFsm {
    pub const fn new() -> Self {
        Self {
            state: LinkState::Off,
            powered: false,
            stack_ready: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn is_stack_ready(&self) -> bool {
        self.stack_ready
    }

    /// Whether the data path may be enabled.
    pub fn can_enable(&self) -> bool {
        self.state == LinkState::Running && self.powered && self.stack_ready
    }

    /// State `event` leads to, without applying it.
    pub fn next(&self, event: LinkEvent) -> Result<LinkState> {
        use LinkEvent as E;
        use LinkState as S;

        let next = match (self.state, event) {
            (_, E::Fatal) => S::Fatal,
            (S::Off, E::PowerOn) => S::Booting,
            (S::Booting, E::BootComplete) => S::Running,
            (S::Booting | S::Running | S::Fatal, E::Teardown) => S::Off,
            (s @ (S::Off | S::Booting | S::Running), E::StackReady | E::StackDown) => s,
            (from, event) => return Err(DpmaifError::InvalidState { from, event }),
        };
        Ok(next)
    }

    /// Apply `event`.
    ///
    /// # Returns
    /// The new state.
    pub fn apply(&mut self, event: LinkEvent) -> Result<LinkState> {
        let next = self.next(event)?;
        match event {
            LinkEvent::PowerOn => self.powered = true,
            LinkEvent::Teardown => self.powered = false,
            LinkEvent::StackReady => self.stack_ready = true,
            LinkEvent::StackDown => self.stack_ready = false,
            LinkEvent::BootComplete | LinkEvent::Fatal => {}
        }
        if next != self.state {
            log::info!(target: "dpmaif::control", "link {:?} -> {:?} ({:?})", self.state, next, event);
        }
        self.state = next;
        Ok(next)
    }

    /// Return to `OFF` after recovery. The stack flag survives; the modem
    /// must power on again.
    pub fn force_off(&mut self) {
        if self.state != LinkState::Off {
            log::info!(target: "dpmaif::control", "link {:?} -> Off (reset)", self.state);
        }
        self.state = LinkState::Off;
        self.powered = false;
    }
}
