//! Route table: id-ordered storage plus a prefix index for ranked lookup.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::errors::Error;
use crate::event::Event;
use crate::helpers::prefix_covers;
use crate::prefix_index::PrefixIndex;
use crate::route::{EndpointSpec, Route, RouteKey};
use crate::types::{RouteFlags, RouteId};

/// Ordering key for candidates: one slot per field in precedence order
/// (family, protocol, remote address, local address, remote port, local
/// port, remote interface, local interface, parent event). Higher wins.
type Specificity = [u16; 9];

/// A lookup query: the connection tuple being classified.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Query<'a> {
    pub remote: &'a EndpointSpec,
    pub local: &'a EndpointSpec,
    pub flags: RouteFlags,
    pub event: Option<&'a Event>,
}

#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// Fields satisfied only through a wildcard or a shorter prefix.
    pub inexact: RouteFlags,
    pub used_fallback: bool,
}

/// Inexact report for a fallback decision.
pub const FALLBACK_INEXACT: RouteFlags = RouteFlags::WILDCARD_FLAGS.union(RouteFlags::PARENT_EVENT_WILDCARD);

/// Reject shapes the matcher cannot honour.
pub(crate) fn validate_route(remote: &EndpointSpec, local: &EndpointSpec, flags: RouteFlags) -> Result<(), Error> {
    if flags.contains(RouteFlags::SA_FAMILY_WILDCARD)
        && !flags.contains(RouteFlags::SA_REMOTE_ADDR_WILDCARD | RouteFlags::SA_LOCAL_ADDR_WILDCARD)
    {
        return Err(Error::InvalidArg);
    }
    if flags.contains(RouteFlags::SA_PROTO_WILDCARD)
        && !flags.contains(RouteFlags::SA_REMOTE_PORT_WILDCARD | RouteFlags::SA_LOCAL_PORT_WILDCARD)
    {
        return Err(Error::InvalidArg);
    }
    if !flags.contains(RouteFlags::SA_FAMILY_WILDCARD) && remote.family != local.family {
        return Err(Error::InvalidArg);
    }
    if !flags.contains(RouteFlags::SA_PROTO_WILDCARD) && remote.protocol != local.protocol {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

fn field(wildcard: bool, equal: bool, bit: RouteFlags, inexact: &mut RouteFlags) -> Option<u16> {
    if wildcard {
        inexact.insert(bit);
        Some(0)
    } else if equal {
        Some(1)
    } else {
        None
    }
}

fn address(
    route: &EndpointSpec,
    query: &EndpointSpec,
    wildcard: bool,
    bit: RouteFlags,
    inexact: &mut RouteFlags,
) -> Option<u16> {
    if wildcard {
        inexact.insert(bit);
        return Some(0);
    }
    if route.addr_bits() != query.addr_bits() || route.prefix_bits() > query.prefix_bits() {
        return None;
    }
    if !prefix_covers(route.key(), route.prefix_bits() as u8, query.key()) {
        return None;
    }
    if route.prefix_bits() < query.prefix_bits() {
        inexact.insert(bit);
    }
    Some(route.prefix_bits() + 1)
}

/// Score `route` against `q`; `None` when it is not a candidate.
pub(crate) fn score(route: &Route, q: &Query<'_>) -> Option<(Specificity, RouteFlags)> {
    let rf = route.flags();
    let wild = |bit: RouteFlags| rf.contains(bit);
    if !(rf & RouteFlags::DIRECTION_FLAGS).contains(q.flags & RouteFlags::DIRECTION_FLAGS) {
        return None;
    }

    let (r, l) = (route.remote(), route.local());
    let mut inexact = RouteFlags::empty();
    let mut s: Specificity = [0; 9];
    s[0] = field(
        wild(RouteFlags::SA_FAMILY_WILDCARD),
        r.family == q.remote.family,
        RouteFlags::SA_FAMILY_WILDCARD,
        &mut inexact,
    )?;
    s[1] = field(
        wild(RouteFlags::SA_PROTO_WILDCARD),
        r.protocol == q.remote.protocol,
        RouteFlags::SA_PROTO_WILDCARD,
        &mut inexact,
    )?;
    s[2] = address(
        r,
        q.remote,
        wild(RouteFlags::SA_REMOTE_ADDR_WILDCARD),
        RouteFlags::SA_REMOTE_ADDR_WILDCARD,
        &mut inexact,
    )?;
    s[3] = address(
        l,
        q.local,
        wild(RouteFlags::SA_LOCAL_ADDR_WILDCARD),
        RouteFlags::SA_LOCAL_ADDR_WILDCARD,
        &mut inexact,
    )?;
    s[4] = field(
        wild(RouteFlags::SA_REMOTE_PORT_WILDCARD),
        r.port == q.remote.port,
        RouteFlags::SA_REMOTE_PORT_WILDCARD,
        &mut inexact,
    )?;
    s[5] = field(
        wild(RouteFlags::SA_LOCAL_PORT_WILDCARD),
        l.port == q.local.port,
        RouteFlags::SA_LOCAL_PORT_WILDCARD,
        &mut inexact,
    )?;
    s[6] = field(
        wild(RouteFlags::REMOTE_INTERFACE_WILDCARD),
        r.interface == q.remote.interface,
        RouteFlags::REMOTE_INTERFACE_WILDCARD,
        &mut inexact,
    )?;
    s[7] = field(
        wild(RouteFlags::LOCAL_INTERFACE_WILDCARD),
        l.interface == q.local.interface,
        RouteFlags::LOCAL_INTERFACE_WILDCARD,
        &mut inexact,
    )?;

    if let Some(ev) = q.event {
        s[8] = match route.parent_event() {
            Some(p) if p.id() == ev.id() && !wild(RouteFlags::PARENT_EVENT_WILDCARD) => 1,
            Some(_) if !wild(RouteFlags::PARENT_EVENT_WILDCARD) => return None,
            _ => {
                inexact.insert(RouteFlags::PARENT_EVENT_WILDCARD);
                0
            }
        };
    }
    Some((s, inexact))
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: BTreeMap<RouteId, Arc<Route>>,
    index: PrefixIndex,
    fallback: Option<RouteId>,
}

impl RouteTable {
    pub fn n_ents(&self) -> usize {
        self.routes.len()
    }

    pub fn get(&self, id: RouteId) -> Option<&Arc<Route>> {
        self.routes.get(&id)
    }

    pub fn fallback(&self) -> Option<RouteId> {
        self.fallback
    }

    pub(crate) fn set_fallback(&mut self, id: Option<RouteId>) -> Result<(), Error> {
        if let Some(id) = id {
            if !self.routes.contains_key(&id) {
                return Err(Error::ItemNotFound);
            }
        }
        self.fallback = id;
        Ok(())
    }

    fn indexed_in_bucket(flags: RouteFlags) -> bool {
        flags.intersects(RouteFlags::SA_FAMILY_WILDCARD | RouteFlags::SA_REMOTE_ADDR_WILDCARD)
    }

    fn candidates(&self, remote: &EndpointSpec) -> Vec<RouteId> {
        self.index
            .candidates(remote.family, remote.key(), remote.prefix_bits() as u8)
    }

    /// Route with exactly this identity, if stored.
    pub(crate) fn find_by_key(
        &self,
        remote: &EndpointSpec,
        local: &EndpointSpec,
        flags: RouteFlags,
        parent: Option<&Event>,
    ) -> Option<&Arc<Route>> {
        let key = RouteKey::new(remote, local, flags, parent);
        self.candidates(remote)
            .into_iter()
            .filter_map(|id| self.routes.get(&id))
            .find(|r| r.key() == key)
    }

    pub(crate) fn insert(&mut self, route: Route) -> Result<Arc<Route>, Error> {
        let flags = route.flags();
        validate_route(route.remote(), route.local(), flags)?;
        if self
            .find_by_key(route.remote(), route.local(), flags, route.parent_event().map(|e| &**e))
            .is_some()
        {
            return Err(Error::ItemAlreadyPresent);
        }
        if self.routes.contains_key(&route.id()) {
            return Err(Error::ItemAlreadyPresent);
        }

        let route = Arc::new(route);
        if Self::indexed_in_bucket(flags) {
            self.index.insert_wildcard(route.id());
        } else {
            let r = route.remote();
            self.index.insert(r.family, r.key(), r.prefix_bits() as u8, route.id());
        }
        self.routes.insert(route.id(), Arc::clone(&route));
        debug!("[INSERT] route #{} {} -> {}", route.id(), route.remote(), route.local());
        Ok(route)
    }

    /// Unlink a route from the table. The caller owns the refcount drop.
    pub(crate) fn remove(&mut self, id: RouteId) -> Option<Arc<Route>> {
        let route = self.routes.remove(&id)?;
        let flags = route.flags();
        let unindexed = if Self::indexed_in_bucket(flags) {
            !self.index.remove_wildcard(id)
        } else {
            let r = route.remote();
            !self.index.remove(r.family, r.key(), r.prefix_bits() as u8, id)
        };
        if unindexed {
            warn!("[DELETE] route #{id} missing from the prefix index");
        }
        if self.fallback == Some(id) {
            self.fallback = None;
        }
        route.mark_deleted();
        Some(route)
    }

    /// Most specific route for `q`. With `exact_only`, relaxed matches are
    /// ignored and the fallback route is not consulted.
    pub(crate) fn lookup(&self, q: &Query<'_>, exact_only: bool) -> Result<RouteMatch, Error> {
        let mut best: Option<(Specificity, RouteFlags, &Arc<Route>)> = None;
        for id in self.candidates(q.remote) {
            let Some(route) = self.routes.get(&id) else {
                continue;
            };
            let Some((s, inexact)) = score(route, q) else {
                continue;
            };
            if exact_only && !inexact.is_empty() {
                continue;
            }
            let better = match &best {
                None => true,
                Some((bs, _, br)) => s > *bs || (s == *bs && route.id() < br.id()),
            };
            if better {
                best = Some((s, inexact, route));
            }
        }

        if let Some((_, inexact, route)) = best {
            trace!("[LOOKUP] matched route #{} inexact {:?}", route.id(), inexact);
            return Ok(RouteMatch {
                route: Arc::clone(route),
                inexact,
                used_fallback: false,
            });
        }
        if !exact_only {
            if let Some(route) = self.fallback.and_then(|id| self.routes.get(&id)) {
                return Ok(RouteMatch {
                    route: Arc::clone(route),
                    inexact: FALLBACK_INEXACT,
                    used_fallback: true,
                });
            }
        }
        Err(Error::ItemNotFound)
    }

    pub fn cursor(&self) -> RouteCursor<'_> {
        RouteCursor {
            table: self,
            position: None,
        }
    }

    /// Empty the table, handing back every route in id order.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Route>> {
        self.index.clear();
        self.fallback = None;
        std::mem::take(&mut self.routes).into_values().collect()
    }

    #[cfg(test)]
    pub(crate) fn index_nodes(&self) -> usize {
        self.index.node_count()
    }
}

/// Id-ordered walk over the table. Borrowing the table keeps the walk
/// consistent: the table cannot change underneath it.
#[derive(Debug, Clone)]
pub struct RouteCursor<'a> {
    table: &'a RouteTable,
    position: Option<RouteId>,
}

impl<'a> RouteCursor<'a> {
    /// Route most recently returned by `next`.
    pub fn current(&self) -> Option<&'a Arc<Route>> {
        self.position.and_then(|id| self.table.routes.get(&id))
    }

    /// Rewind to before the first route.
    pub fn reset(&mut self) {
        self.position = None;
    }
}

impl<'a> Iterator for RouteCursor<'a> {
    type Item = &'a Arc<Route>;

    fn next(&mut self) -> Option<Self::Item> {
        let lower = match self.position {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let (id, route) = self.table.routes.range((lower, Bound::Unbounded)).next()?;
        self.position = Some(*id);
        Some(route)
    }
}
