//! The engine context: one lock guarding the route table and the event and
//! action registries, plus every administrative operation on them.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use metrics::{counter, gauge};

use crate::action::{run_chain, Action, ActionHandler, ActionRegistry, ActionType, ChainCall};
use crate::alloc::{PrivateData, RouteAllocator, SystemAllocator};
use crate::clock::{MonotonicClock, TimeSource};
use crate::errors::Error;
use crate::event::{Event, EventConfig, EventRegistry};
use crate::route::{EndpointSpec, Route, RouteExport, RouteRef};
use crate::rwlock::{LockGuard, UpgradeableRwLock, Wait};
use crate::table::{validate_route, Query, RouteCursor, RouteTable};
use crate::thread::ThreadContext;
use crate::types::{ActionFlags, ActionId, ActionResults, EntId, EventId, LockFlags, Policy, RouteFlags, RouteId};

pub struct ContextConfig {
    /// Applied to routes without a parent event and to events inserted
    /// without a config of their own.
    pub default_event_config: EventConfig,
    /// Decision when neither a route nor a trigger event decides.
    pub default_policy: Policy,
    pub lock_flags: LockFlags,
    pub allocator: Arc<dyn RouteAllocator>,
    pub clock: Arc<dyn TimeSource>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_event_config: EventConfig::default(),
            default_policy: Policy::default(),
            lock_flags: LockFlags::NONE,
            allocator: Arc::new(SystemAllocator),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextConfig")
            .field("default_event_config", &self.default_event_config)
            .field("default_policy", &self.default_policy)
            .field("lock_flags", &self.lock_flags)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) routes: RouteTable,
    pub(crate) events: EventRegistry,
    pub(crate) actions: ActionRegistry,
}

/// Result of a route delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub n_deleted: usize,
    /// Delete-chain output, plus `DEALLOCATED` when the storage went away.
    pub action_results: ActionResults,
}

pub struct Context {
    pub(crate) lock: UpgradeableRwLock,
    tables: UnsafeCell<Tables>,
    next_id: AtomicU64,
    pub(crate) config: ContextConfig,
}

// SAFETY: `tables` is only reached through `tables` / `tables_mut`, which
// demand a live guard on `lock`. Shared holders only read the tables (route
// counters are atomics); the exclusive holder is the sole writer.
unsafe impl Sync for Context {}

/// Zero-wait for anonymous callers, who must never block.
pub(crate) fn wait_for(thread: Option<&ThreadContext>) -> Wait {
    match thread {
        Some(_) => Wait::Forever,
        None => Wait::Poll,
    }
}

impl Context {
    pub fn new(config: ContextConfig) -> Result<Self, Error> {
        crate::ensure_logging();
        config.default_event_config.validate()?;
        info!(
            "[INIT] context created: default policy {:?}, lock flags {:?}",
            config.default_policy, config.lock_flags
        );
        Ok(Self {
            lock: UpgradeableRwLock::new(config.lock_flags),
            tables: UnsafeCell::new(Tables::default()),
            next_id: AtomicU64::new(1),
            config,
        })
    }

    /// The context lock, for collaborators that coordinate with the engine.
    pub fn lock(&self) -> &UpgradeableRwLock {
        &self.lock
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub(crate) fn next_id(&self) -> EntId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn tables<'g>(&'g self, guard: &'g LockGuard<'_>) -> Result<&'g Tables, Error> {
        if !ptr::eq(guard.lock(), &self.lock) {
            return Err(Error::InvalidArg);
        }
        if guard.mode() == crate::rwlock::HoldMode::Released {
            return Err(Error::LackingReadLock);
        }
        // SAFETY: the guard holds this context's lock at least shared.
        Ok(unsafe { &*self.tables.get() })
    }

    pub(crate) fn tables_mut<'g>(&'g self, guard: &'g mut LockGuard<'_>) -> Result<&'g mut Tables, Error> {
        if !ptr::eq(guard.lock(), &self.lock) {
            return Err(Error::InvalidArg);
        }
        if !guard.is_exclusive() {
            return Err(Error::LackingMutex);
        }
        // SAFETY: the guard holds the exclusive lock and is mutably borrowed
        // for as long as the returned reference lives.
        Ok(unsafe { &mut *self.tables.get() })
    }

    // Engine calls are not reentrant: handlers run with the lock held.
    fn ensure_not_held(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        match thread {
            Some(t) if self.lock.have_either(Some(t)).is_ok() => Err(Error::IncompatibleState),
            _ => Ok(()),
        }
    }

    pub(crate) fn read_guard<'a>(&'a self, thread: Option<&'a ThreadContext>) -> Result<LockGuard<'a>, Error> {
        self.ensure_not_held(thread)?;
        match thread {
            Some(_) => self.lock.read(thread, Wait::Forever),
            None => self.lock.write(None, Wait::Poll),
        }
    }

    pub(crate) fn write_guard<'a>(&'a self, thread: Option<&'a ThreadContext>) -> Result<LockGuard<'a>, Error> {
        self.ensure_not_held(thread)?;
        self.lock.write(thread, wait_for(thread))
    }

    /// Shared view of the tables for iteration and export.
    pub fn read<'a>(&'a self, thread: Option<&'a ThreadContext>) -> Result<ContextReadGuard<'a>, Error> {
        let guard = self.read_guard(thread)?;
        Ok(ContextReadGuard { ctx: self, guard })
    }

    /// Delete every route, clear the registries and retire the lock.
    ///
    /// The lock is destroyed without ever being released, so callers queued
    /// behind the teardown fail with `InvalidArg` instead of slipping in.
    /// When the lock cannot be retired the tables are left as they were.
    pub fn shutdown(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        let mut guard = self.write_guard(thread)?;
        let mut retired = mem::take(self.tables_mut(&mut guard)?);
        if let Err(e) = guard.unlock_and_destroy() {
            *self.tables_mut(&mut guard)? = retired;
            warn!("[SHUTDOWN] lock could not be retired: {e}");
            return Err(e);
        }
        drop(guard);

        let routes = retired.routes.drain();
        let n = routes.len();
        for route in routes {
            route.mark_deleted();
            route.release();
        }
        gauge!("netsentry_routes").set(0.0);
        info!("[SHUTDOWN] context torn down, {n} routes deleted");
        Ok(())
    }

    pub(crate) fn effective_config(&self, parent: Option<&Event>) -> Arc<EventConfig> {
        match parent {
            Some(ev) => ev.config(),
            None => Arc::new(self.config.default_event_config.clone()),
        }
    }

    /// Insert with the exclusive lock already held.
    pub(crate) fn insert_locked(
        &self,
        tables: &mut Tables,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        parent: Option<Arc<Event>>,
    ) -> Result<(Arc<Route>, ActionResults), Error> {
        validate_route(remote, local, flags)?;
        let cfg = self.effective_config(parent.as_deref());
        let private_data = PrivateData::new(
            cfg.route_private_data_size,
            cfg.route_private_data_alignment,
            &self.config.allocator,
        )?;
        let route = Route::new(
            self.next_id(),
            remote.clone(),
            local.clone(),
            flags,
            parent,
            private_data,
            self.config.clock.now(),
        );
        let route = tables.routes.insert(route)?;

        let mut results = ActionResults::NONE;
        if let Some(ev) = route.parent_event() {
            let chain = ev.actions();
            let call = ChainCall {
                action_type: ActionType::Insert,
                trigger_event: Some(&**ev),
                route: Some(&*route),
                caller_arg: None,
            };
            run_chain(&chain, &call, &mut results);
        }
        counter!("netsentry_route_inserts_total").increment(1);
        gauge!("netsentry_routes").set(tables.routes.n_ents() as f64);
        Ok((route, results))
    }

    pub(crate) fn resolve_event(tables: &Tables, label: Option<&str>) -> Result<Option<Arc<Event>>, Error> {
        label.map(|l| tables.events.get(l).map(Arc::clone)).transpose()
    }

    /// Add a route. The parent event, when named, must exist and its
    /// config sizes the route's private data.
    pub fn route_insert(
        &self,
        thread: Option<&ThreadContext>,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        event_label: Option<&str>,
    ) -> Result<(RouteId, ActionResults), Error> {
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        let parent = Self::resolve_event(tables, event_label)?;
        let (route, results) = self.insert_locked(tables, remote, local, flags, parent)?;
        Ok((route.id(), results))
    }

    /// Insert and hand back a counted reference in one step.
    pub fn route_insert_and_check_out(
        &self,
        thread: Option<&ThreadContext>,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        event_label: Option<&str>,
    ) -> Result<(RouteRef, ActionResults), Error> {
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        let parent = Self::resolve_event(tables, event_label)?;
        let (route, results) = self.insert_locked(tables, remote, local, flags, parent)?;
        Ok((RouteRef::checkout(&route), results))
    }

    fn delete_locked(&self, tables: &mut Tables, id: RouteId) -> Result<DeleteOutcome, Error> {
        let route = tables.routes.get(id).cloned().ok_or(Error::ItemNotFound)?;
        let mut results = ActionResults::NONE;
        if let Some(ev) = route.parent_event() {
            let chain = ev.actions();
            let call = ChainCall {
                action_type: ActionType::Delete,
                trigger_event: Some(&**ev),
                route: Some(&*route),
                caller_arg: None,
            };
            run_chain(&chain, &call, &mut results);
        }
        tables.routes.remove(id);
        if route.release() {
            results |= ActionResults::DEALLOCATED;
        }
        counter!("netsentry_route_deletes_total").increment(1);
        gauge!("netsentry_routes").set(tables.routes.n_ents() as f64);
        debug!("[DELETE] route #{id} removed, refcount now {}", route.refcount());
        Ok(DeleteOutcome {
            n_deleted: 1,
            action_results: results,
        })
    }

    /// Delete the route with exactly this identity.
    pub fn route_delete(
        &self,
        thread: Option<&ThreadContext>,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        event_label: Option<&str>,
    ) -> Result<DeleteOutcome, Error> {
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        let parent = Self::resolve_event(tables, event_label)?;
        let id = tables
            .routes
            .find_by_key(remote, local, flags, parent.as_deref())
            .map(|r| r.id())
            .ok_or(Error::ItemNotFound)?;
        self.delete_locked(tables, id)
    }

    pub fn route_delete_by_id(&self, thread: Option<&ThreadContext>, id: RouteId) -> Result<DeleteOutcome, Error> {
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        self.delete_locked(tables, id)
    }

    /// Best match for a tuple, checked out. Returns the inexact report
    /// alongside.
    pub fn route_get_reference(
        &self,
        thread: Option<&ThreadContext>,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        event_label: Option<&str>,
        exact_only: bool,
    ) -> Result<(RouteRef, RouteFlags), Error> {
        let guard = self.read_guard(thread)?;
        let tables = self.tables(&guard)?;
        let event = Self::resolve_event(tables, event_label)?;
        let q = Query {
            remote,
            local,
            flags,
            event: event.as_deref(),
        };
        let m = tables.routes.lookup(&q, exact_only)?;
        Ok((RouteRef::checkout(&m.route), m.inexact))
    }

    /// Toggle status flags (`GREENLISTED`, `PENALTYBOXED`) and run the
    /// parent's chain with `ActionType::Update`. Returns (before, after).
    pub fn route_update_flags(
        &self,
        thread: Option<&ThreadContext>,
        id: RouteId,
        set: RouteFlags,
        clear: RouteFlags,
    ) -> Result<(RouteFlags, RouteFlags), Error> {
        if !RouteFlags::STATUS_FLAGS.contains(set | clear) || set.intersects(clear) {
            return Err(Error::InvalidArg);
        }
        let guard = self.write_guard(thread)?;
        let tables = self.tables(&guard)?;
        let route = tables.routes.get(id).ok_or(Error::ItemNotFound)?;

        let (before, after) = route.update_flags(set, clear);
        if set.contains(RouteFlags::PENALTYBOXED) && !before.contains(RouteFlags::PENALTYBOXED) {
            route.enter_penaltybox(self.config.clock.now());
        }
        if clear.contains(RouteFlags::PENALTYBOXED) {
            route.leave_penaltybox();
        }
        if let Some(ev) = route.parent_event() {
            let chain = ev.actions();
            let call = ChainCall {
                action_type: ActionType::Update,
                trigger_event: Some(&**ev),
                route: Some(&**route),
                caller_arg: None,
            };
            let mut results = ActionResults::NONE;
            run_chain(&chain, &call, &mut results);
        }
        debug!("[UPDATE] route #{id} flags {before:?} -> {after:?}");
        Ok((before & !RouteFlags::INTERNAL_FLAGS, after & !RouteFlags::INTERNAL_FLAGS))
    }

    /// Route consulted when nothing else matches; `None` clears it.
    pub fn route_set_fallback(&self, thread: Option<&ThreadContext>, id: Option<RouteId>) -> Result<(), Error> {
        let mut guard = self.write_guard(thread)?;
        self.tables_mut(&mut guard)?.routes.set_fallback(id)
    }

    pub fn route_export(&self, thread: Option<&ThreadContext>, id: RouteId) -> Result<RouteExport, Error> {
        let guard = self.read_guard(thread)?;
        let tables = self.tables(&guard)?;
        tables.routes.get(id).map(|r| r.export()).ok_or(Error::ItemNotFound)
    }

    fn with_route<T>(
        &self,
        thread: Option<&ThreadContext>,
        id: RouteId,
        f: impl FnOnce(&Route) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let guard = self.write_guard(thread)?;
        let tables = self.tables(&guard)?;
        f(tables.routes.get(id).ok_or(Error::ItemNotFound)?)
    }

    /// Zero the derogatory count; returns the prior value.
    pub fn route_reset_derogatory_count(&self, thread: Option<&ThreadContext>, id: RouteId) -> Result<u16, Error> {
        self.with_route(thread, id, |r| Ok(r.reset_derogatory()))
    }

    pub fn route_reset_commendable_count(&self, thread: Option<&ThreadContext>, id: RouteId) -> Result<u16, Error> {
        self.with_route(thread, id, |r| Ok(r.reset_commendable()))
    }

    /// Add `delta` (may be negative); `OverflowAverted` leaves the count
    /// unchanged.
    pub fn route_increment_derogatory_count(
        &self,
        thread: Option<&ThreadContext>,
        id: RouteId,
        delta: i32,
    ) -> Result<u16, Error> {
        self.with_route(thread, id, |r| r.adjust_derogatory(delta))
    }

    pub fn route_increment_commendable_count(
        &self,
        thread: Option<&ThreadContext>,
        id: RouteId,
        delta: i32,
    ) -> Result<u16, Error> {
        self.with_route(thread, id, |r| r.adjust_commendable(delta))
    }

    /// Move both counters as one step: when either delta would leave the
    /// `u16` range neither count changes. Returns the new
    /// (derogatory, commendable) pair.
    pub fn route_adjust_counts(
        &self,
        thread: Option<&ThreadContext>,
        id: RouteId,
        derogatory_delta: i32,
        commendable_delta: i32,
    ) -> Result<(u16, u16), Error> {
        let fits = |count: u16, delta: i32| u16::try_from(i64::from(count) + i64::from(delta)).is_ok();
        // Counters only move under the exclusive hold taken here.
        self.with_route(thread, id, |r| {
            if !fits(r.derogatory_count(), derogatory_delta) || !fits(r.commendable_count(), commendable_delta) {
                return Err(Error::OverflowAverted);
            }
            Ok((r.adjust_derogatory(derogatory_delta)?, r.adjust_commendable(commendable_delta)?))
        })
    }

    /// Delete routes idle for at least their event's purge time. Returns
    /// how many went.
    pub fn purge_idle_routes(&self, thread: Option<&ThreadContext>) -> Result<usize, Error> {
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        let now = self.config.clock.now();
        let stale: Vec<RouteId> = tables
            .routes
            .cursor()
            .filter(|r| {
                let idle = self.effective_config(r.parent_event().map(|e| &**e)).route_idle_time_for_purge;
                !idle.is_zero() && now.saturating_sub(r.last_activity()) >= idle
            })
            .map(|r| r.id())
            .collect();
        for id in &stale {
            self.delete_locked(tables, *id)?;
        }
        if !stale.is_empty() {
            info!("[PURGE] {} idle routes deleted", stale.len());
        }
        Ok(stale.len())
    }

    pub fn event_insert(
        &self,
        thread: Option<&ThreadContext>,
        label: &str,
        config: Option<EventConfig>,
        default_policy: Policy,
    ) -> Result<EventId, Error> {
        let config = config.unwrap_or_else(|| self.config.default_event_config.clone());
        config.validate()?;
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        let event = tables
            .events
            .insert(Event::new(self.next_id(), label, config, default_policy))?;
        debug!("[EVENT] inserted \"{label}\" as #{}", event.id());
        Ok(event.id())
    }

    /// Routes parented to the event keep it alive until they go.
    pub fn event_delete(&self, thread: Option<&ThreadContext>, label: &str) -> Result<(), Error> {
        let mut guard = self.write_guard(thread)?;
        self.tables_mut(&mut guard)?.events.remove(label)?;
        debug!("[EVENT] deleted \"{label}\"");
        Ok(())
    }

    pub fn event_get_config(&self, thread: Option<&ThreadContext>, label: &str) -> Result<EventConfig, Error> {
        let guard = self.read_guard(thread)?;
        let cfg = self.tables(&guard)?.events.get(label)?.config();
        Ok((*cfg).clone())
    }

    pub fn event_update_config(
        &self,
        thread: Option<&ThreadContext>,
        label: &str,
        config: EventConfig,
    ) -> Result<(), Error> {
        config.validate()?;
        let guard = self.write_guard(thread)?;
        self.tables(&guard)?.events.get(label)?.set_config(config);
        Ok(())
    }

    pub fn event_get_reference(&self, thread: Option<&ThreadContext>, label: &str) -> Result<Arc<Event>, Error> {
        let guard = self.read_guard(thread)?;
        self.tables(&guard)?.events.get(label).map(Arc::clone)
    }

    fn edit_chain(
        &self,
        thread: Option<&ThreadContext>,
        event_label: &str,
        action_label: &str,
        edit: impl FnOnce(&Event, &Arc<Action>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let guard = self.write_guard(thread)?;
        let tables = self.tables(&guard)?;
        let event = tables.events.get(event_label)?;
        let action = tables.actions.get(action_label)?;
        edit(&**event, action)
    }

    pub fn event_action_append(
        &self,
        thread: Option<&ThreadContext>,
        event_label: &str,
        action_label: &str,
    ) -> Result<(), Error> {
        self.edit_chain(thread, event_label, action_label, |e, a| e.append(a))
    }

    pub fn event_action_prepend(
        &self,
        thread: Option<&ThreadContext>,
        event_label: &str,
        action_label: &str,
    ) -> Result<(), Error> {
        self.edit_chain(thread, event_label, action_label, |e, a| e.prepend(a))
    }

    /// Place `action_label` right after `point_label` in the chain.
    pub fn event_action_insert_after(
        &self,
        thread: Option<&ThreadContext>,
        event_label: &str,
        action_label: &str,
        point_label: &str,
    ) -> Result<(), Error> {
        self.edit_chain(thread, event_label, action_label, |e, a| e.insert_after(a, point_label))
    }

    pub fn event_action_delete(
        &self,
        thread: Option<&ThreadContext>,
        event_label: &str,
        action_label: &str,
    ) -> Result<(), Error> {
        let guard = self.write_guard(thread)?;
        self.tables(&guard)?.events.get(event_label)?.remove(action_label)
    }

    /// Action labels in run order.
    pub fn event_action_list(&self, thread: Option<&ThreadContext>, event_label: &str) -> Result<Vec<String>, Error> {
        let guard = self.read_guard(thread)?;
        let chain = self.tables(&guard)?.events.get(event_label)?.actions();
        Ok(chain.iter().map(|a| a.label().to_owned()).collect())
    }

    pub fn action_insert<H>(
        &self,
        thread: Option<&ThreadContext>,
        label: &str,
        flags: ActionFlags,
        handler: H,
    ) -> Result<ActionId, Error>
    where
        H: ActionHandler + 'static,
    {
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        let action = tables
            .actions
            .insert(Action::new(self.next_id(), label, flags, Box::new(handler)))?;
        debug!("[ACTION] inserted \"{label}\" as #{}", action.id());
        Ok(action.id())
    }

    /// Remove the action and detach it from every chain.
    pub fn action_delete(&self, thread: Option<&ThreadContext>, label: &str) -> Result<(), Error> {
        let mut guard = self.write_guard(thread)?;
        let tables = self.tables_mut(&mut guard)?;
        tables.actions.remove(label)?;
        tables.events.detach_action(label);
        Ok(())
    }

    pub fn action_get_reference(&self, thread: Option<&ThreadContext>, label: &str) -> Result<Arc<Action>, Error> {
        let guard = self.read_guard(thread)?;
        self.tables(&guard)?.actions.get(label).map(Arc::clone)
    }

    pub fn action_get_flags(&self, thread: Option<&ThreadContext>, label: &str) -> Result<ActionFlags, Error> {
        let guard = self.read_guard(thread)?;
        Ok(self.tables(&guard)?.actions.get(label)?.flags())
    }

    pub fn action_update_flags(
        &self,
        thread: Option<&ThreadContext>,
        label: &str,
        set: ActionFlags,
        clear: ActionFlags,
    ) -> Result<(ActionFlags, ActionFlags), Error> {
        let guard = self.write_guard(thread)?;
        Ok(self.tables(&guard)?.actions.get(label)?.update_flags(set, clear))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let tables = self.tables.get_mut();
        for route in tables.routes.drain() {
            route.mark_deleted();
            if !route.release() && route.refcount() > 0 {
                warn!("[SHUTDOWN] route #{} still referenced at drop", route.id());
            }
        }
    }
}

/// Shared hold on a context for walking and exporting routes.
#[must_use = "if unused the lock will immediately unlock"]
pub struct ContextReadGuard<'a> {
    ctx: &'a Context,
    guard: LockGuard<'a>,
}

impl<'a> ContextReadGuard<'a> {
    fn tables(&self) -> &Tables {
        debug_assert!(ptr::eq(self.guard.lock(), &self.ctx.lock));
        // SAFETY: `guard` holds this context's lock until the view drops.
        unsafe { &*self.ctx.tables.get() }
    }

    pub fn routes(&self) -> RouteCursor<'_> {
        self.tables().routes.cursor()
    }

    pub fn n_routes(&self) -> usize {
        self.tables().routes.n_ents()
    }

    pub fn n_events(&self) -> usize {
        self.tables().events.len()
    }

    pub fn n_actions(&self) -> usize {
        self.tables().actions.len()
    }

    pub fn export(&self, id: RouteId) -> Option<RouteExport> {
        self.tables().routes.get(id).map(|r| r.export())
    }

    pub fn fallback(&self) -> Option<RouteId> {
        self.tables().routes.fallback()
    }
}
