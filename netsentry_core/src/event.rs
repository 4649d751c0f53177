//! Events: named configuration plus an ordered action chain.
//!
//! Config and chain are published copy-on-write through `ArcSwap`, so a
//! dispatch holding a snapshot is never disturbed by an edit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::action::{validate_label, Action};
use crate::errors::Error;
use crate::helpers::is_valid_alignment;
use crate::types::{EventConfigFlags, EventId, Policy};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventConfig {
    pub route_private_data_size: usize,
    /// Zero selects the default alignment; otherwise a power of two.
    pub route_private_data_alignment: usize,
    /// Zero means unlimited.
    pub max_connection_count: u32,
    /// Zero disables the penalty box.
    pub derogatory_threshold_for_penaltybox: u16,
    /// Zero boxes indefinitely.
    pub penaltybox_duration: Duration,
    /// Zero never purges.
    pub route_idle_time_for_purge: Duration,
    pub flags: EventConfigFlags,
}

impl EventConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !is_valid_alignment(self.route_private_data_alignment) {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }
}

pub struct Event {
    id: EventId,
    label: String,
    config: ArcSwap<EventConfig>,
    chain: ArcSwap<Vec<Arc<Action>>>,
    default_policy: Policy,
}

impl Event {
    pub(crate) fn new(id: EventId, label: &str, config: EventConfig, default_policy: Policy) -> Self {
        Self {
            id,
            label: label.to_owned(),
            config: ArcSwap::from_pointee(config),
            chain: ArcSwap::from_pointee(Vec::new()),
            default_policy,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> Arc<EventConfig> {
        self.config.load_full()
    }

    pub fn default_policy(&self) -> Policy {
        self.default_policy
    }

    /// Snapshot of the chain in run order.
    pub fn actions(&self) -> Arc<Vec<Arc<Action>>> {
        self.chain.load_full()
    }

    pub(crate) fn set_config(&self, config: EventConfig) {
        self.config.store(Arc::new(config));
    }

    fn edit_chain<F>(&self, action: &Arc<Action>, place: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Vec<Arc<Action>>, Arc<Action>) -> Result<(), Error>,
    {
        let current = self.chain.load();
        if current.iter().any(|a| a.id() == action.id()) {
            return Err(Error::ItemAlreadyPresent);
        }
        let mut next: Vec<Arc<Action>> = current.as_ref().clone();
        place(&mut next, Arc::clone(action))?;
        self.chain.store(Arc::new(next));
        Ok(())
    }

    pub(crate) fn append(&self, action: &Arc<Action>) -> Result<(), Error> {
        self.edit_chain(action, |chain, a| {
            chain.push(a);
            Ok(())
        })
    }

    pub(crate) fn prepend(&self, action: &Arc<Action>) -> Result<(), Error> {
        self.edit_chain(action, |chain, a| {
            chain.insert(0, a);
            Ok(())
        })
    }

    pub(crate) fn insert_after(&self, action: &Arc<Action>, point: &str) -> Result<(), Error> {
        self.edit_chain(action, |chain, a| {
            let at = chain.iter().position(|x| x.label() == point).ok_or(Error::ItemNotFound)?;
            chain.insert(at + 1, a);
            Ok(())
        })
    }

    pub(crate) fn remove(&self, label: &str) -> Result<(), Error> {
        let current = self.chain.load();
        let at = current.iter().position(|a| a.label() == label).ok_or(Error::ItemNotFound)?;
        let mut next: Vec<Arc<Action>> = current.as_ref().clone();
        next.remove(at);
        self.chain.store(Arc::new(next));
        Ok(())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("config", &*self.config.load())
            .field("actions", &self.chain.load().len())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct EventRegistry {
    by_label: HashMap<String, Arc<Event>>,
}

impl EventRegistry {
    pub(crate) fn insert(&mut self, event: Event) -> Result<Arc<Event>, Error> {
        validate_label(event.label())?;
        if self.by_label.contains_key(event.label()) {
            return Err(Error::ItemAlreadyPresent);
        }
        let event = Arc::new(event);
        self.by_label.insert(event.label().to_owned(), Arc::clone(&event));
        Ok(event)
    }

    pub(crate) fn remove(&mut self, label: &str) -> Result<Arc<Event>, Error> {
        validate_label(label)?;
        self.by_label.remove(label).ok_or(Error::ItemNotFound)
    }

    pub(crate) fn get(&self, label: &str) -> Result<&Arc<Event>, Error> {
        validate_label(label)?;
        self.by_label.get(label).ok_or(Error::ItemNotFound)
    }

    /// Drop `action` from every chain that carries it.
    pub(crate) fn detach_action(&self, label: &str) {
        for event in self.by_label.values() {
            let _ = event.remove(label);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_label.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_label.clear();
    }
}
