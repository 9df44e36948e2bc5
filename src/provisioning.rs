//! Process-wide serialisation of device provisioning.
//!
//! The platform supports a single provisioning round-trip at a time across
//! all DRM engines in the process. An engine that finds the device
//! unprovisioned while another engine is provisioning queues its continuation
//! here instead of sending a redundant request.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use crate::callbacks::CallbackQueue;
use crate::error::{Error, Result};

static GLOBAL: LazyLock<Arc<ProvisioningCoordinator>> =
    LazyLock::new(|| Arc::new(ProvisioningCoordinator::new()));

/// Outcome of [`ProvisioningCoordinator::acquire_or_defer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionSlot {
    /// The caller now owns the provisioning round.
    Acquired,
    /// Another round is in flight; the continuation was queued.
    Deferred,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    provisioning: bool,
    deferred: CallbackQueue,
}

/// Idle/provisioning flag plus a FIFO of continuations waiting for the round to end.
#[derive(Debug, Default)]
pub struct ProvisioningCoordinator {
    state: Mutex<CoordinatorState>,
}

impl ProvisioningCoordinator {
    /// Create an isolated coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// The coordinator shared by every engine of this process.
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_provisioning(&self) -> bool {
        self.lock().provisioning
    }

    /// Number of continuations waiting for the current round.
    pub fn pending(&self) -> usize {
        self.lock().deferred.len()
    }

    /// Enter the provisioning state.
    pub fn on_provision_started(&self) -> Result<()> {
        let mut state = self.lock();
        if state.provisioning {
            return Err(Error::ProvisioningInProgress);
        }
        state.provisioning = true;
        Ok(())
    }

    /// Queue a continuation for the end of the current round.
    pub fn defer<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if !state.provisioning {
            return Err(Error::NotProvisioning);
        }
        state.deferred.push(callback);
        Ok(())
    }

    /// Start a round when idle, otherwise queue `callback`, in one step.
    pub fn acquire_or_defer<F>(&self, callback: F) -> ProvisionSlot
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.provisioning {
            state.deferred.push(callback);
            ProvisionSlot::Deferred
        } else {
            state.provisioning = true;
            ProvisionSlot::Acquired
        }
    }

    /// End the current round and run queued continuations in FIFO order.
    ///
    /// A continuation that starts a new round stops the drain; the remaining
    /// continuations wait for that round's `on_provision_done`.
    pub fn on_provision_done(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if !state.provisioning {
                return Err(Error::NotProvisioning);
            }
            state.provisioning = false;
        }

        loop {
            let next = {
                let mut state = self.lock();
                if state.provisioning {
                    debug!(
                        "Provisioning restarted, {} continuation(s) still waiting",
                        state.deferred.len()
                    );
                    break;
                }
                state.deferred.pop()
            };
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
        Ok(())
    }
}
