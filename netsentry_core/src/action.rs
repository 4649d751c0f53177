//! Actions: labelled callbacks run in an event's chain.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{trace, warn};

use crate::constants::MAX_LABEL_BYTES;
use crate::errors::Error;
use crate::event::Event;
use crate::route::Route;
use crate::types::{ActionFlags, ActionId, ActionResults};

/// Why a chain is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// Trigger event of a dispatch that matched nothing.
    Post,
    Insert,
    Update,
    Delete,
    /// Parent event of a matched route during dispatch.
    Decision,
}

/// Everything a handler gets to see.
pub struct ActionCall<'a> {
    pub action: &'a Action,
    pub action_type: ActionType,
    pub trigger_event: Option<&'a Event>,
    pub route: Option<&'a Route>,
    pub caller_arg: Option<&'a dyn Any>,
    /// Results accumulated by the chain so far.
    pub results_so_far: ActionResults,
}

/// Handlers only add bits; earlier contributions are never cleared.
/// They run with the context lock held and must not call back into it.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, call: &ActionCall<'_>, results: &mut ActionResults) -> Result<(), Error>;
}

impl<F> ActionHandler for F
where
    F: Fn(&ActionCall<'_>, &mut ActionResults) -> Result<(), Error> + Send + Sync,
{
    fn handle(&self, call: &ActionCall<'_>, results: &mut ActionResults) -> Result<(), Error> {
        self(call, results)
    }
}

pub struct Action {
    id: ActionId,
    label: String,
    flags: AtomicU32,
    handler: Box<dyn ActionHandler>,
}

impl Action {
    pub(crate) fn new(id: ActionId, label: &str, flags: ActionFlags, handler: Box<dyn ActionHandler>) -> Self {
        Self {
            id,
            label: label.to_owned(),
            flags: AtomicU32::new(flags.bits()),
            handler,
        }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flags(&self) -> ActionFlags {
        ActionFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub fn is_disabled(&self) -> bool {
        self.flags().contains(ActionFlags::DISABLED)
    }

    pub(crate) fn update_flags(&self, set: ActionFlags, clear: ActionFlags) -> (ActionFlags, ActionFlags) {
        let prev = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| Some((f | set.bits()) & !clear.bits()))
            .unwrap_or_else(|f| f);
        let before = ActionFlags::from_bits(prev);
        (before, (before | set) & !clear)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("flags", &self.flags())
            .finish()
    }
}

pub(crate) fn validate_label(label: &str) -> Result<(), Error> {
    if label.is_empty() {
        return Err(Error::InvalidArg);
    }
    if label.len() > MAX_LABEL_BYTES {
        return Err(Error::StringArgTooLong);
    }
    Ok(())
}

pub(crate) struct ChainCall<'a> {
    pub action_type: ActionType,
    pub trigger_event: Option<&'a Event>,
    pub route: Option<&'a Route>,
    pub caller_arg: Option<&'a dyn Any>,
}

/// Run `chain` in order, skipping disabled actions. `STOP` or a handler
/// error ends the chain; an error also sets `ERROR`.
pub(crate) fn run_chain(chain: &[Arc<Action>], call: &ChainCall<'_>, results: &mut ActionResults) {
    for action in chain {
        if action.is_disabled() {
            trace!("[ACTION] skipping disabled \"{}\"", action.label());
            continue;
        }
        let mut contribution = ActionResults::NONE;
        let ac = ActionCall {
            action,
            action_type: call.action_type,
            trigger_event: call.trigger_event,
            route: call.route,
            caller_arg: call.caller_arg,
            results_so_far: *results,
        };
        let outcome = action.handler.handle(&ac, &mut contribution);
        *results |= contribution;
        match outcome {
            Ok(()) if contribution.contains(ActionResults::STOP) => break,
            Ok(()) => {}
            Err(e) => {
                warn!("[ACTION] \"{}\" failed: {e}", action.label());
                *results |= ActionResults::ERROR;
                break;
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct ActionRegistry {
    by_label: HashMap<String, Arc<Action>>,
}

impl ActionRegistry {
    pub(crate) fn insert(&mut self, action: Action) -> Result<Arc<Action>, Error> {
        validate_label(action.label())?;
        if self.by_label.contains_key(action.label()) {
            return Err(Error::ItemAlreadyPresent);
        }
        let action = Arc::new(action);
        self.by_label.insert(action.label().to_owned(), Arc::clone(&action));
        Ok(action)
    }

    pub(crate) fn remove(&mut self, label: &str) -> Result<Arc<Action>, Error> {
        validate_label(label)?;
        self.by_label.remove(label).ok_or(Error::ItemNotFound)
    }

    pub(crate) fn get(&self, label: &str) -> Result<&Arc<Action>, Error> {
        validate_label(label)?;
        self.by_label.get(label).ok_or(Error::ItemNotFound)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_label.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_label.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setter(bits: ActionResults) -> Box<dyn ActionHandler> {
        Box::new(move |_: &ActionCall<'_>, r: &mut ActionResults| {
            *r |= bits;
            Ok(())
        })
    }

    fn call() -> ChainCall<'static> {
        ChainCall {
            action_type: ActionType::Decision,
            trigger_event: None,
            route: None,
            caller_arg: None,
        }
    }

    #[test]
    fn chain_accumulates_and_stops() {
        let chain = vec![
            Arc::new(Action::new(1, "a", ActionFlags::NONE, setter(ActionResults::ACCEPT))),
            Arc::new(Action::new(2, "b", ActionFlags::DISABLED, setter(ActionResults::REJECT))),
            Arc::new(Action::new(3, "c", ActionFlags::NONE, setter(ActionResults::STOP))),
            Arc::new(Action::new(4, "d", ActionFlags::NONE, setter(ActionResults::DEROGATORY))),
        ];
        let mut results = ActionResults::NONE;
        run_chain(&chain, &call(), &mut results);
        assert_eq!(results, ActionResults::ACCEPT | ActionResults::STOP);
    }

    #[test]
    fn handler_error_sets_error_bit() {
        let failing: Box<dyn ActionHandler> =
            Box::new(|_: &ActionCall<'_>, _: &mut ActionResults| Err(Error::InvalidArg));
        let chain = vec![
            Arc::new(Action::new(1, "bad", ActionFlags::NONE, failing)),
            Arc::new(Action::new(2, "later", ActionFlags::NONE, setter(ActionResults::ACCEPT))),
        ];
        let mut results = ActionResults::NONE;
        run_chain(&chain, &call(), &mut results);
        assert_eq!(results, ActionResults::ERROR);
    }

    #[test]
    fn labels_are_validated() {
        let mut reg = ActionRegistry::default();
        let long = "x".repeat(MAX_LABEL_BYTES + 1);
        let err = reg.insert(Action::new(1, &long, ActionFlags::NONE, setter(ActionResults::NONE)));
        assert_eq!(err.err(), Some(Error::StringArgTooLong));
        let err = reg.insert(Action::new(1, "", ActionFlags::NONE, setter(ActionResults::NONE)));
        assert_eq!(err.err(), Some(Error::InvalidArg));
        reg.insert(Action::new(1, "ok", ActionFlags::NONE, setter(ActionResults::NONE))).unwrap();
        let err = reg.insert(Action::new(2, "ok", ActionFlags::NONE, setter(ActionResults::NONE)));
        assert_eq!(err.err(), Some(Error::ItemAlreadyPresent));
        assert_eq!(reg.len(), 1);
    }
}
