//! Route entries: one stored match rule with its counters and private data.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Deref;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use crate::alloc::PrivateData;
use crate::clock::duration_to_nanos;
use crate::constants::{AF_INET, AF_INET6, MAX_ADDR_BYTES};
use crate::errors::Error;
use crate::event::Event;
use crate::helpers::{addr_key, canonical};
use crate::types::{ActionResults, EventId, RouteFlags, RouteId};

/// One side of a connection tuple, or one side of a rule.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct EndpointSpec {
    pub family: u16,
    pub protocol: u16,
    pub port: u16,
    pub interface: u8,
    addr: [u8; MAX_ADDR_BYTES],
    addr_len: u8,
    prefix_bits: u16,
}

impl EndpointSpec {
    pub fn new(family: u16, protocol: u16, addr: &[u8], prefix_bits: u16, port: u16) -> Result<Self, Error> {
        if addr.len() > MAX_ADDR_BYTES || usize::from(prefix_bits) > addr.len() * 8 {
            return Err(Error::InvalidArg);
        }
        let mut buf = [0u8; MAX_ADDR_BYTES];
        buf[..addr.len()].copy_from_slice(addr);
        Ok(Self {
            family,
            protocol,
            port,
            interface: 0,
            addr: buf,
            addr_len: addr.len() as u8,
            prefix_bits,
        })
    }

    /// Full-length host address.
    pub fn from_ip(ip: IpAddr, protocol: u16, port: u16) -> Self {
        let (family, bytes): (u16, Vec<u8>) = match ip {
            IpAddr::V4(v4) => (AF_INET, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AF_INET6, v6.octets().to_vec()),
        };
        let mut buf = [0u8; MAX_ADDR_BYTES];
        buf[..bytes.len()].copy_from_slice(&bytes);
        Self {
            family,
            protocol,
            port,
            interface: 0,
            addr: buf,
            addr_len: bytes.len() as u8,
            prefix_bits: (bytes.len() * 8) as u16,
        }
    }

    /// CIDR network; host bits are kept as given.
    pub fn from_net(net: IpNet, protocol: u16, port: u16) -> Self {
        let mut spec = Self::from_ip(net.addr(), protocol, port);
        spec.prefix_bits = u16::from(net.prefix_len());
        spec
    }

    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Shorten (or restore) the prefix; fails past the address width.
    pub fn with_prefix_bits(mut self, prefix_bits: u16) -> Result<Self, Error> {
        if prefix_bits > self.addr_bits() {
            return Err(Error::InvalidArg);
        }
        self.prefix_bits = prefix_bits;
        Ok(self)
    }

    pub fn address(&self) -> &[u8] {
        &self.addr[..usize::from(self.addr_len)]
    }

    pub fn prefix_bits(&self) -> u16 {
        self.prefix_bits
    }

    pub fn addr_bits(&self) -> u16 {
        u16::from(self.addr_len) * 8
    }

    /// Left-aligned key with host bits cleared.
    pub(crate) fn key(&self) -> u128 {
        canonical(addr_key(self.address()), self.prefix_bits as u8)
    }

    /// Copy the address bytes out; `BufferTooSmall` if `out` is short.
    pub fn copy_address(&self, out: &mut [u8]) -> Result<usize, Error> {
        let addr = self.address();
        if out.len() < addr.len() {
            return Err(Error::BufferTooSmall);
        }
        out[..addr.len()].copy_from_slice(addr);
        Ok(addr.len())
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.address();
        match (self.family, a.len()) {
            (AF_INET, 4) => write!(f, "{}", Ipv4Addr::new(a[0], a[1], a[2], a[3]))?,
            (AF_INET6, 16) => {
                let mut b = [0u8; 16];
                b.copy_from_slice(a);
                write!(f, "[{}]", Ipv6Addr::from(b))?
            }
            _ => {
                write!(f, "af{}:", self.family)?;
                for (i, byte) in a.iter().enumerate() {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
            }
        }
        write!(f, "/{}:{}", self.prefix_bits, self.port)?;
        if self.interface != 0 {
            write!(f, "%{}", self.interface)?;
        }
        Ok(())
    }
}

impl fmt::Debug for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointSpec({self}, proto {})", self.protocol)
    }
}

/// Identity of a route for duplicate detection and keyed delete.
/// Wildcarded fields are normalised away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RouteKey {
    family: Option<u16>,
    protocol: Option<u16>,
    remote_addr: Option<(u128, u16)>,
    local_addr: Option<(u128, u16)>,
    remote_port: Option<u16>,
    local_port: Option<u16>,
    remote_interface: Option<u8>,
    local_interface: Option<u8>,
    flags: u32,
    parent: Option<EventId>,
}

impl RouteKey {
    pub(crate) fn new(remote: &EndpointSpec, local: &EndpointSpec, flags: RouteFlags, parent: Option<&Event>) -> Self {
        let keep = |bit: RouteFlags| !flags.contains(bit);
        Self {
            family: keep(RouteFlags::SA_FAMILY_WILDCARD).then_some(remote.family),
            protocol: keep(RouteFlags::SA_PROTO_WILDCARD).then_some(remote.protocol),
            remote_addr: keep(RouteFlags::SA_REMOTE_ADDR_WILDCARD).then(|| (remote.key(), remote.prefix_bits)),
            local_addr: keep(RouteFlags::SA_LOCAL_ADDR_WILDCARD).then(|| (local.key(), local.prefix_bits)),
            remote_port: keep(RouteFlags::SA_REMOTE_PORT_WILDCARD).then_some(remote.port),
            local_port: keep(RouteFlags::SA_LOCAL_PORT_WILDCARD).then_some(local.port),
            remote_interface: keep(RouteFlags::REMOTE_INTERFACE_WILDCARD).then_some(remote.interface),
            local_interface: keep(RouteFlags::LOCAL_INTERFACE_WILDCARD).then_some(local.interface),
            flags: (flags & RouteFlags::KEY_FLAGS).bits(),
            parent: parent.map(Event::id),
        }
    }
}

const NO_STAMP: u64 = u64::MAX;

pub struct Route {
    id: RouteId,
    remote: EndpointSpec,
    local: EndpointSpec,
    flags: AtomicU32,
    parent_event: Option<Arc<Event>>,
    refcount: AtomicU32,
    derogatory: AtomicU16,
    commendable: AtomicU16,
    hit_count: AtomicU64,
    connection_count: AtomicU32,
    inserted_at: Duration,
    last_hit: AtomicU64,
    penaltybox_at: AtomicU64,
    private_data: PrivateData,
}

impl Route {
    pub(crate) fn new(
        id: RouteId,
        remote: EndpointSpec,
        local: EndpointSpec,
        flags: RouteFlags,
        parent_event: Option<Arc<Event>>,
        private_data: PrivateData,
        now: Duration,
    ) -> Self {
        let flags = (flags & !RouteFlags::INTERNAL_FLAGS) | RouteFlags::IN_TABLE;
        Self {
            id,
            remote,
            local,
            flags: AtomicU32::new(flags.bits()),
            parent_event,
            refcount: AtomicU32::new(1),
            derogatory: AtomicU16::new(0),
            commendable: AtomicU16::new(0),
            hit_count: AtomicU64::new(0),
            connection_count: AtomicU32::new(0),
            inserted_at: now,
            last_hit: AtomicU64::new(NO_STAMP),
            penaltybox_at: AtomicU64::new(NO_STAMP),
            private_data,
        }
    }

    pub fn id(&self) -> RouteId {
        self.id
    }

    pub fn remote(&self) -> &EndpointSpec {
        &self.remote
    }

    pub fn local(&self) -> &EndpointSpec {
        &self.local
    }

    pub fn flags(&self) -> RouteFlags {
        RouteFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub fn parent_event(&self) -> Option<&Arc<Event>> {
        self.parent_event.as_ref()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn derogatory_count(&self) -> u16 {
        self.derogatory.load(Ordering::Acquire)
    }

    pub fn commendable_count(&self) -> u16 {
        self.commendable.load(Ordering::Acquire)
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Acquire)
    }

    pub fn is_in_table(&self) -> bool {
        self.flags().contains(RouteFlags::IN_TABLE)
    }

    pub fn private_data(&self) -> &PrivateData {
        &self.private_data
    }

    pub(crate) fn key(&self) -> RouteKey {
        RouteKey::new(&self.remote, &self.local, self.flags(), self.parent_event.as_deref())
    }

    /// Last activity: the latest hit, else insertion.
    pub fn last_activity(&self) -> Duration {
        match self.last_hit.load(Ordering::Relaxed) {
            NO_STAMP => self.inserted_at,
            n => Duration::from_nanos(n),
        }
    }

    pub(crate) fn record_hit(&self, now: Duration) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_hit.store(duration_to_nanos(now), Ordering::Relaxed);
    }

    /// Set then clear status bits; returns (before, after).
    pub(crate) fn update_flags(&self, set: RouteFlags, clear: RouteFlags) -> (RouteFlags, RouteFlags) {
        let prev = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| Some((f | set.bits()) & !clear.bits()))
            .unwrap_or_else(|f| f);
        let before = RouteFlags::from_bits(prev);
        (before, (before | set) & !clear)
    }

    pub(crate) fn mark_deleted(&self) {
        self.update_flags(RouteFlags::DELETED, RouteFlags::IN_TABLE);
    }

    pub(crate) fn enter_penaltybox(&self, now: Duration) {
        self.penaltybox_at.store(duration_to_nanos(now), Ordering::Release);
        self.update_flags(RouteFlags::PENALTYBOXED, RouteFlags::empty());
    }

    pub(crate) fn leave_penaltybox(&self) {
        self.penaltybox_at.store(NO_STAMP, Ordering::Release);
        self.update_flags(RouteFlags::empty(), RouteFlags::PENALTYBOXED);
    }

    /// A box set without a timestamp (at insert) or with a zero duration
    /// never expires.
    pub(crate) fn penaltybox_expired(&self, now: Duration, duration: Duration) -> bool {
        if !self.flags().contains(RouteFlags::PENALTYBOXED) || duration.is_zero() {
            return false;
        }
        match self.penaltybox_at.load(Ordering::Acquire) {
            NO_STAMP => false,
            at => now >= Duration::from_nanos(at).saturating_add(duration),
        }
    }

    pub(crate) fn bump_derogatory(&self) -> u16 {
        bump(&self.derogatory)
    }

    pub(crate) fn bump_commendable(&self) -> u16 {
        bump(&self.commendable)
    }

    pub(crate) fn adjust_derogatory(&self, delta: i32) -> Result<u16, Error> {
        adjust(&self.derogatory, delta)
    }

    pub(crate) fn adjust_commendable(&self, delta: i32) -> Result<u16, Error> {
        adjust(&self.commendable, delta)
    }

    pub(crate) fn reset_derogatory(&self) -> u16 {
        self.derogatory.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn reset_commendable(&self) -> u16 {
        self.commendable.swap(0, Ordering::AcqRel)
    }

    /// Count a connection unless `max` (non-zero) is reached.
    pub(crate) fn try_connect(&self, max: u32) -> bool {
        self.connection_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if max != 0 && c >= max {
                    None
                } else {
                    Some(c.saturating_add(1))
                }
            })
            .is_ok()
    }

    pub(crate) fn disconnect(&self) {
        let _ = self
            .connection_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)));
    }

    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// True when this dropped the last reference.
    pub(crate) fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn export(&self) -> RouteExport {
        RouteExport {
            id: self.id,
            remote: self.remote.clone(),
            local: self.local.clone(),
            flags: self.flags() & !RouteFlags::INTERNAL_FLAGS,
            parent_event: self.parent_event.as_ref().map(|e| e.label().to_owned()),
            derogatory_count: self.derogatory_count(),
            commendable_count: self.commendable_count(),
            hit_count: self.hit_count(),
            connection_count: self.connection_count(),
        }
    }
}

fn bump(counter: &AtomicU16) -> u16 {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1)) {
        Ok(prev) => prev + 1,
        Err(cur) => cur,
    }
}

fn adjust(counter: &AtomicU16, delta: i32) -> Result<u16, Error> {
    let apply = |c: u16| u16::try_from(i32::from(c).checked_add(delta)?).ok();
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, apply)
        .map(|prev| apply(prev).unwrap_or(prev))
        .map_err(|_| Error::OverflowAverted)
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// A checked-out route. Holding one keeps the route's storage alive after
/// it leaves the table.
pub struct RouteRef {
    route: Arc<Route>,
    released: bool,
}

impl RouteRef {
    pub(crate) fn checkout(route: &Arc<Route>) -> Self {
        route.acquire();
        Self {
            route: Arc::clone(route),
            released: false,
        }
    }

    /// Explicit release; reports `DEALLOCATED` when this was the last
    /// reference.
    pub fn drop_reference(mut self) -> ActionResults {
        self.released = true;
        if self.route.release() {
            log::debug!("[DELETE] route #{} deallocated", self.route.id());
            ActionResults::DEALLOCATED
        } else {
            ActionResults::NONE
        }
    }
}

impl Deref for RouteRef {
    type Target = Route;

    fn deref(&self) -> &Route {
        &self.route
    }
}

impl Drop for RouteRef {
    fn drop(&mut self) {
        if !self.released {
            self.route.release();
        }
    }
}

impl fmt::Debug for RouteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouteRef").field(&*self.route).finish()
    }
}

/// Point-in-time copy of a route for rendering by outer layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteExport {
    pub id: RouteId,
    pub remote: EndpointSpec,
    pub local: EndpointSpec,
    pub flags: RouteFlags,
    pub parent_event: Option<String>,
    pub derogatory_count: u16,
    pub commendable_count: u16,
    pub hit_count: u64,
    pub connection_count: u32,
}

impl fmt::Display for RouteExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} -> {} proto {} {:?}",
            self.id, self.remote, self.local, self.remote.protocol, self.flags
        )?;
        if let Some(ev) = &self.parent_event {
            write!(f, " event \"{ev}\"")?;
        }
        write!(
            f,
            " derogatory {} commendable {} hits {} connections {}",
            self.derogatory_count, self.commendable_count, self.hit_count, self.connection_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{RouteAllocator, SystemAllocator};

    fn bare_route() -> Route {
        let alloc: Arc<dyn RouteAllocator> = Arc::new(SystemAllocator);
        let ep = EndpointSpec::new(AF_INET, 6, &[10, 0, 0, 1], 32, 80).unwrap();
        Route::new(
            1,
            ep.clone(),
            ep,
            RouteFlags::DIRECTION_IN,
            None,
            PrivateData::new(0, 0, &alloc).unwrap(),
            Duration::ZERO,
        )
    }

    #[test]
    fn counters_refuse_out_of_range_deltas() {
        let r = bare_route();
        assert_eq!(r.adjust_derogatory(123), Ok(123));
        assert_eq!(r.adjust_derogatory(-124), Err(Error::OverflowAverted));
        assert_eq!(r.adjust_derogatory(65536 - 123), Err(Error::OverflowAverted));
        assert_eq!(r.adjust_derogatory(1), Ok(124));
        assert_eq!(r.reset_derogatory(), 124);
        assert_eq!(r.derogatory_count(), 0);
    }

    #[test]
    fn bump_saturates() {
        let r = bare_route();
        r.adjust_commendable(i32::from(u16::MAX)).unwrap();
        assert_eq!(r.bump_commendable(), u16::MAX);
    }

    #[test]
    fn endpoint_validation_and_display() {
        assert!(EndpointSpec::new(AF_INET, 6, &[1, 2, 3, 4], 33, 0).is_err());
        assert!(EndpointSpec::new(AF_INET, 6, &[0; 17], 0, 0).is_err());
        let net: IpNet = "192.168.0.0/16".parse().unwrap();
        let ep = EndpointSpec::from_net(net, 17, 53).with_interface(2);
        assert_eq!(ep.to_string(), "192.168.0.0/16:53%2");
        let mut small = [0u8; 2];
        assert_eq!(ep.copy_address(&mut small), Err(Error::BufferTooSmall));
        let host = ep.clone().with_prefix_bits(32).unwrap();
        assert_eq!(host.to_string(), "192.168.0.0/32:53%2");
        assert_eq!(ep.with_prefix_bits(33), Err(Error::InvalidArg));
    }

    #[test]
    fn penaltybox_expiry_needs_a_stamp() {
        let r = bare_route();
        r.update_flags(RouteFlags::PENALTYBOXED, RouteFlags::empty());
        assert!(!r.penaltybox_expired(Duration::from_secs(100), Duration::from_secs(1)));
        r.enter_penaltybox(Duration::from_secs(10));
        assert!(!r.penaltybox_expired(Duration::from_millis(10_500), Duration::from_secs(1)));
        assert!(r.penaltybox_expired(Duration::from_secs(11), Duration::from_secs(1)));
        r.leave_penaltybox();
        assert!(!r.flags().contains(RouteFlags::PENALTYBOXED));
    }
}
