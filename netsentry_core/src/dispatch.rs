//! Dispatch: classify a connection tuple, run the deciding chain, and keep
//! the per-route derogatory/commendable state that drives the penalty box.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use metrics::counter;

use crate::action::{run_chain, ActionType, ChainCall};
use crate::constants::ENT_ID_NONE;
use crate::context::Context;
use crate::errors::{Error, Status};
use crate::event::{Event, EventConfig};
use crate::route::{EndpointSpec, Route};
use crate::rwlock::{LockGuard, Wait};
use crate::table::{Query, RouteMatch, FALLBACK_INEXACT};
use crate::thread::ThreadContext;
use crate::types::{ActionResults, EventConfigFlags, RouteFlags, RouteId};

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Route that decided, or `ENT_ID_NONE` when a default policy did.
    pub route_id: RouteId,
    pub inexact_matches: RouteFlags,
    pub action_results: ActionResults,
    pub status: Status,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        self.action_results.contains(ActionResults::ACCEPT)
    }

    pub fn is_reject(&self) -> bool {
        self.action_results.contains(ActionResults::REJECT)
    }
}

fn deny(results: &mut ActionResults) {
    results.remove(ActionResults::ACCEPT);
    results.insert(ActionResults::REJECT);
}

impl Context {
    /// Classify `remote`/`local` and return the decision.
    ///
    /// `flags` carries the query's direction bits. `event_label` names the
    /// trigger event; it narrows parent-event matching and supplies the
    /// chain run when nothing matches. `caller_arg` is handed to every
    /// action untouched.
    pub fn dispatch(
        &self,
        thread: Option<&ThreadContext>,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        event_label: Option<&str>,
        caller_arg: Option<&dyn Any>,
    ) -> Result<Verdict, Error> {
        let mut results = ActionResults::NONE;
        self.dispatch_with_inited_result(thread, remote, local, flags, event_label, caller_arg, &mut results)
    }

    /// As `dispatch`, starting from caller-preset result bits.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_with_inited_result(
        &self,
        thread: Option<&ThreadContext>,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        event_label: Option<&str>,
        caller_arg: Option<&dyn Any>,
        results: &mut ActionResults,
    ) -> Result<Verdict, Error> {
        counter!("netsentry_dispatch_total").increment(1);
        let mut guard = self.read_guard(thread)?;

        let (trigger, matched) = {
            let tables = self.tables(&guard)?;
            let trigger = Self::resolve_event(tables, event_label)?;
            let q = Query {
                remote,
                local,
                flags,
                event: trigger.as_deref(),
            };
            let matched = match tables.routes.lookup(&q, false) {
                Ok(m) => Some(m),
                Err(Error::ItemNotFound) => None,
                Err(e) => return Err(e),
            };
            (trigger, matched)
        };

        let verdict = match matched {
            Some(m) => self.dispatch_matched(&mut guard, m, trigger.as_deref(), caller_arg, results)?,
            None => self.dispatch_fallthrough(&mut guard, remote, local, flags, trigger, caller_arg, results)?,
        };
        // Per-packet logging stays out of default builds.
        #[cfg(feature = "trace")]
        trace!(
            "[DISPATCH] {} -> {} => route #{} {:?} {:?}",
            remote,
            local,
            verdict.route_id,
            verdict.action_results,
            verdict.status
        );
        Ok(verdict)
    }

    /// Upgrade to exclusive. When another reader already holds the upgrade
    /// slot, step aside: drop the shared hold and queue for the mutex.
    /// Callers must revalidate anything they looked up before.
    fn promote<'a>(&'a self, guard: &mut LockGuard<'a>) -> Result<(), Error> {
        if guard.is_exclusive() {
            return Ok(());
        }
        match guard.reserve() {
            Ok(()) => guard.redeem(Wait::Forever),
            Err(Error::Busy) => {
                debug!("[DISPATCH] reservation contended, reacquiring exclusively");
                let thread = guard.thread();
                guard.release()?;
                *guard = self.lock.write(thread, Wait::Forever)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch_matched<'a>(
        &'a self,
        guard: &mut LockGuard<'a>,
        m: RouteMatch,
        trigger: Option<&Event>,
        caller_arg: Option<&dyn Any>,
        results: &mut ActionResults,
    ) -> Result<Verdict, Error> {
        let route = m.route;
        let now = self.config.clock.now();
        route.record_hit(now);
        let cfg = self.effective_config(route.parent_event().map(|e| &**e));

        let boxed = route.flags().contains(RouteFlags::PENALTYBOXED);
        let expired = boxed && route.penaltybox_expired(now, cfg.penaltybox_duration);
        if boxed && !expired {
            deny(results);
            trace!("[PENALTYBOX] route #{} still boxed", route.id());
        } else {
            if expired {
                self.promote(guard)?;
                if route.is_in_table() {
                    route.leave_penaltybox();
                    info!("[PENALTYBOX] route #{} released", route.id());
                }
            }
            if route.flags().contains(RouteFlags::GREENLISTED) {
                results.insert(ActionResults::ACCEPT);
            }
            if let Some(parent) = route.parent_event() {
                let chain = parent.actions();
                let call = ChainCall {
                    action_type: ActionType::Decision,
                    trigger_event: trigger.or(Some(&**parent)),
                    route: Some(&*route),
                    caller_arg,
                };
                run_chain(&chain, &call, results);
            }
            let counted = ActionResults::DEROGATORY
                | ActionResults::COMMENDABLE
                | ActionResults::CONNECT
                | ActionResults::DISCONNECT;
            if results.intersects(counted) {
                self.promote(guard)?;
                if route.is_in_table() {
                    Self::apply_counters(&route, &cfg, now, results);
                } else {
                    debug!("[DISPATCH] route #{} deleted while promoting", route.id());
                }
            }
        }

        Ok(Verdict {
            route_id: route.id(),
            inexact_matches: m.inexact,
            action_results: *results,
            status: if m.used_fallback {
                Status::UsedFallback
            } else {
                Status::Ok
            },
        })
    }

    fn apply_counters(route: &Arc<Route>, cfg: &EventConfig, now: Duration, results: &mut ActionResults) {
        if results.contains(ActionResults::DEROGATORY) {
            let derogatory = route.bump_derogatory();
            let effective = if cfg.flags.contains(EventConfigFlags::DEROGATORY_THRESHOLD_IGNORE_COMMENDABLE) {
                derogatory
            } else {
                derogatory.saturating_sub(route.commendable_count())
            };
            let threshold = cfg.derogatory_threshold_for_penaltybox;
            if threshold > 0 && effective >= threshold {
                route.enter_penaltybox(now);
                route.reset_derogatory();
                deny(results);
                counter!("netsentry_penaltybox_total").increment(1);
                info!(
                    "[PENALTYBOX] route #{} boxed at {} derogatory events",
                    route.id(),
                    effective
                );
            }
        }
        if results.contains(ActionResults::COMMENDABLE) {
            route.bump_commendable();
            if cfg.flags.contains(EventConfigFlags::COMMENDABLE_CLEARS_DEROGATORY) {
                route.reset_derogatory();
            }
        }
        if results.contains(ActionResults::CONNECT) && !route.try_connect(cfg.max_connection_count) {
            debug!(
                "[DISPATCH] route #{} at its connection limit {}",
                route.id(),
                cfg.max_connection_count
            );
            deny(results);
        }
        if results.contains(ActionResults::DISCONNECT) {
            route.disconnect();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_fallthrough<'a>(
        &'a self,
        guard: &mut LockGuard<'a>,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        trigger: Option<Arc<Event>>,
        caller_arg: Option<&dyn Any>,
        results: &mut ActionResults,
    ) -> Result<Verdict, Error> {
        counter!("netsentry_dispatch_fallback_total").increment(1);
        results.insert(ActionResults::FALLTHROUGH);
        let mut route_id = ENT_ID_NONE;

        if let Some(ev) = trigger.as_ref() {
            let chain = ev.actions();
            let call = ChainCall {
                action_type: ActionType::Post,
                trigger_event: Some(&**ev),
                route: None,
                caller_arg,
            };
            run_chain(&chain, &call, results);

            if results.contains(ActionResults::INSERT) {
                self.promote(guard)?;
                let tables = self.tables_mut(guard)?;
                let route_flags = flags & RouteFlags::DIRECTION_FLAGS;
                match self.insert_locked(tables, remote, local, route_flags, Some(Arc::clone(ev))) {
                    Ok((route, inserted)) => {
                        *results |= inserted;
                        route_id = route.id();
                        debug!("[DISPATCH] dynamic route #{route_id} added by \"{}\"", ev.label());
                    }
                    Err(e) => {
                        warn!("[DISPATCH] dynamic insert for \"{}\" failed: {e}", ev.label());
                        results.insert(ActionResults::ERROR);
                    }
                }
            }
        }

        if !results.intersects(ActionResults::ACCEPT | ActionResults::REJECT) {
            let policy = trigger
                .as_ref()
                .map_or(self.config.default_policy, |e| e.default_policy());
            results.insert(policy.as_results());
        }

        Ok(Verdict {
            route_id,
            inexact_matches: FALLBACK_INEXACT,
            action_results: *results,
            status: Status::UsedFallback,
        })
    }
}
