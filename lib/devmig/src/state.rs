// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device migration state machine.
//!
//! All state changes funnel through [`StateMachine::transition`], which
//! owns the recovery policy: a failed transition is retried into the
//! caller-supplied recover state, and if that also fails the device is
//! reset and forced back to `Running` so the VM can keep going.

use std::sync::{Arc, Mutex};

use slog::{crit, error, info, trace, Logger};
use thiserror::Error;

use crate::driver::{DataChannel, DeviceState, DriverError, MigrationDriver};

/// Outcome of a failed state transition.
#[derive(Debug, Error)]
pub enum StateError {
    /// The requested transition failed, but the device was brought back to
    /// a known-good state. The migration attempt is over; the device is
    /// not.
    #[error(
        "failed to set device state to {requested} \
         (device recovered to {recovered}): {source}"
    )]
    Recovered {
        requested: DeviceState,
        recovered: DeviceState,
        #[source]
        source: DriverError,
    },

    /// Both the transition and its recovery failed. The device has been
    /// reset and forced to `Running`.
    #[error("failed to set device state to {requested}; device was reset: {source}")]
    Fatal {
        requested: DeviceState,
        #[source]
        source: DriverError,
    },

    /// The driver produced a fresh data channel while one was already
    /// installed. This can happen if the device was asynchronously reset,
    /// terminating the transfer the old channel belonged to.
    #[error("device produced a second data channel")]
    DataChannelConflict,

    /// The requested `(from, to, recover)` combination is not in the
    /// transition policy.
    #[error("transition {from} -> {requested} (recover {recover}) is not permitted")]
    ForbiddenTransition {
        from: DeviceState,
        requested: DeviceState,
        recover: DeviceState,
    },
}

impl StateError {
    /// True when the device had to be reset to get out of the failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StateError::Fatal { .. })
    }
}

/// Recovery target of a [`TransitionRule`].
#[derive(Clone, Copy, Debug)]
enum Recover {
    /// Recover into a specific state.
    To(DeviceState),
    /// Recover into whatever state the device was in before the request.
    Current,
    /// No recovery possible; failure resets the device.
    Reset,
}

/// One legal `(from, requested, recover)` combination.
///
/// An empty `from` list is a wildcard. This table is the reviewable
/// policy for which transitions the migration core may request; requests
/// outside it are rejected before the driver is involved.
struct TransitionRule {
    from: &'static [DeviceState],
    to: &'static [DeviceState],
    recover: Recover,
}

const TRANSITION_RULES: &[TransitionRule] = &[
    // Precopy begins while the VM is still running.
    TransitionRule {
        from: &[DeviceState::Running],
        to: &[DeviceState::PreCopy],
        recover: Recover::To(DeviceState::Running),
    },
    // Entering the P2P quiesce window ahead of a VM pause.
    TransitionRule {
        from: &[DeviceState::Running],
        to: &[DeviceState::RunningP2p],
        recover: Recover::Reset,
    },
    TransitionRule {
        from: &[DeviceState::PreCopy],
        to: &[DeviceState::PreCopyP2p],
        recover: Recover::Reset,
    },
    // VM resume (including the best-effort unwind after a failed precopy).
    TransitionRule {
        from: &[],
        to: &[DeviceState::Running],
        recover: Recover::Reset,
    },
    // VM pause.
    TransitionRule {
        from: &[],
        to: &[DeviceState::Stop, DeviceState::StopCopy],
        recover: Recover::Reset,
    },
    // The final stop-copy push.
    TransitionRule {
        from: &[DeviceState::Stop, DeviceState::StopCopy],
        to: &[DeviceState::StopCopy],
        recover: Recover::To(DeviceState::Stop),
    },
    // Winding down out of stop-copy once the migration is over.
    TransitionRule {
        from: &[DeviceState::StopCopy],
        to: &[DeviceState::Stop],
        recover: Recover::Reset,
    },
    // An incoming migration starts loading state.
    TransitionRule {
        from: &[],
        to: &[DeviceState::Resuming],
        recover: Recover::Current,
    },
];

fn rules_allow(from: DeviceState, to: DeviceState, recover: DeviceState) -> bool {
    TRANSITION_RULES.iter().any(|rule| {
        (rule.from.is_empty() || rule.from.contains(&from))
            && rule.to.contains(&to)
            && match rule.recover {
                Recover::To(s) => recover == s,
                Recover::Current => recover == from,
                Recover::Reset => recover == DeviceState::Error,
            }
    })
}

struct Inner {
    current: DeviceState,
    channel: Option<Arc<dyn DataChannel>>,
}

/// Tracks the device's migration state and applies the recovery policy.
pub struct StateMachine<D: MigrationDriver> {
    driver: Arc<D>,
    log: Logger,
    inner: Mutex<Inner>,
}

impl<D: MigrationDriver> StateMachine<D> {
    pub fn new(driver: Arc<D>, log: Logger) -> Self {
        Self {
            driver,
            log,
            inner: Mutex::new(Inner {
                current: DeviceState::Running,
                channel: None,
            }),
        }
    }

    pub fn current(&self) -> DeviceState {
        self.inner.lock().unwrap().current
    }

    /// The data channel installed by the last channel-producing
    /// transition, if any.
    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.inner.lock().unwrap().channel.clone()
    }

    /// Drop the installed data channel. Called when a transfer ends.
    pub fn clear_data_channel(&self) {
        self.inner.lock().unwrap().channel = None;
    }

    /// Request a transition to `new`, falling back to `recover` and then
    /// to a device reset per the policy described in the module docs.
    ///
    /// A [`StateError::Recovered`] return means the migration attempt
    /// failed but the device is healthy; everything else leaves the device
    /// forced to `Running`.
    pub fn transition(
        &self,
        new: DeviceState,
        recover: DeviceState,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();

        if new == inner.current {
            return Ok(());
        }

        if !rules_allow(inner.current, new, recover) {
            return Err(StateError::ForbiddenTransition {
                from: inner.current,
                requested: new,
                recover,
            });
        }

        trace!(
            self.log, "device state transition";
            "from" => %inner.current, "to" => %new, "recover" => %recover,
        );

        let err = match self.driver.set_state(new) {
            Ok(update) => {
                inner.current = update.state;
                info!(self.log, "device state changed"; "state" => %update.state);
                if let Some(channel) = update.channel {
                    if inner.channel.is_some() {
                        error!(self.log, "data channel out of sync");
                        return Err(StateError::DataChannelConflict);
                    }
                    inner.channel = Some(channel);
                }
                return Ok(());
            }
            Err(e) => e,
        };

        if recover == DeviceState::Error {
            error!(
                self.log, "failed setting device state, resetting device";
                "requested" => %new, "error" => %err,
            );
            self.reset_to_running(&mut inner);
            return Err(StateError::Fatal { requested: new, source: err });
        }

        error!(
            self.log, "failed setting device state, entering recover state";
            "requested" => %new, "recover" => %recover, "error" => %err,
        );
        match self.driver.set_state(recover) {
            Ok(update) => {
                // Recovery transitions never carry a data channel; a
                // transfer that failed to start has nothing to stream.
                inner.current = update.state;
                info!(self.log, "device state changed"; "state" => %update.state);
                Err(StateError::Recovered {
                    requested: new,
                    recovered: recover,
                    source: err,
                })
            }
            Err(recover_err) => {
                error!(
                    self.log,
                    "failed setting device recover state, resetting device";
                    "recover" => %recover, "error" => %recover_err,
                );
                self.reset_to_running(&mut inner);
                Err(StateError::Fatal { requested: new, source: err })
            }
        }
    }

    /// Transition with a device reset as the only fallback.
    pub fn transition_or_reset(&self, new: DeviceState) -> Result<(), StateError> {
        self.transition(new, DeviceState::Error)
    }

    fn reset_to_running(&self, inner: &mut Inner) {
        if let Err(e) = self.driver.reset() {
            // Nothing further can be done for the device here; record the
            // failure and let the error from the original transition
            // propagate.
            crit!(self.log, "failed resetting device"; "error" => %e);
        }
        inner.current = DeviceState::Running;
        inner.channel = None;
    }
}
