//! Per-module bookkeeping
//!
//! A `ModuleNode` pairs a spec with its lifecycle state and live instance.
//! `transition` serializes state transitions of this node only; `slot` is a
//! short critical section that is never held across an await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as TransitionLock;

use crate::module::graph::ModuleSpec;
use crate::module::registry::events::StateNotifier;
use crate::module::traits::{Module, ModuleState};

struct NodeSlot {
    state: ModuleState,
    /// Present only while Active or Deactivating
    instance: Option<Arc<dyn Module>>,
    last_error: Option<String>,
}

pub(crate) struct ModuleNode {
    spec: Arc<ModuleSpec>,
    pub(crate) transition: TransitionLock<()>,
    slot: Mutex<NodeSlot>,
    /// Set when a reload removed or replaced this node
    retired: AtomicBool,
}

impl ModuleNode {
    pub(crate) fn new(spec: Arc<ModuleSpec>) -> Self {
        Self {
            spec,
            transition: TransitionLock::new(()),
            slot: Mutex::new(NodeSlot {
                state: ModuleState::Unloaded,
                instance: None,
                last_error: None,
            }),
            retired: AtomicBool::new(false),
        }
    }

    fn slot(&self) -> MutexGuard<'_, NodeSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.spec.name
    }

    pub(crate) fn spec(&self) -> &Arc<ModuleSpec> {
        &self.spec
    }

    pub(crate) fn state(&self) -> ModuleState {
        self.slot().state
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.slot().last_error.clone()
    }

    /// The instance, but only while the node is Active
    pub(crate) fn active_instance(&self) -> Option<Arc<dyn Module>> {
        let slot = self.slot();
        match slot.state {
            ModuleState::Active => slot.instance.clone(),
            _ => None,
        }
    }

    /// The instance regardless of state (used to tear it down)
    pub(crate) fn instance(&self) -> Option<Arc<dyn Module>> {
        self.slot().instance.clone()
    }

    pub(crate) fn set_state(&self, new: ModuleState, notifier: &StateNotifier) {
        let old = {
            let mut slot = self.slot();
            let old = slot.state;
            slot.state = new;
            if new == ModuleState::Unloaded {
                slot.last_error = None;
            }
            old
        };
        if old != new {
            notifier.notify(self.name(), old, new);
        }
    }

    /// Store a freshly activated instance and mark the node Active
    pub(crate) fn install(&self, instance: Arc<dyn Module>, notifier: &StateNotifier) {
        self.slot().instance = Some(instance);
        self.set_state(ModuleState::Active, notifier);
    }

    /// Drop the instance, whatever state the node is in
    pub(crate) fn discard_instance(&self) {
        self.slot().instance = None;
    }

    /// Record a failure and move to Error
    pub(crate) fn fail(&self, cause: impl Into<String>, notifier: &StateNotifier) {
        {
            let mut slot = self.slot();
            slot.instance = None;
            slot.last_error = Some(cause.into());
        }
        self.set_state(ModuleState::Error, notifier);
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}
