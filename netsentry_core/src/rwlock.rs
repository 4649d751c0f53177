//! Upgradeable reader–writer lock.
//!
//! Implements writer preference to avoid starvation: once an exclusive
//! request is queued, no *new* shared hold is granted until it has been
//! served. Exclusive requests are served FIFO. A single reservation slot
//! lets one shared holder announce an upgrade early and later redeem it
//! without releasing its shared hold in between, so two readers racing to
//! promote never deadlock: the loser gets `Busy` or `Already`.
//!
//! Every blocking operation has three forms (`op`, `op_timed`,
//! `op_abstimed`) over a single `op_with(.., Wait, ..)` core.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::Error;
use crate::thread::{CallerId, ThreadContext};
use crate::types::LockFlags;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until granted. Anonymous callers cannot be told apart, so an
    /// anonymous exclusive request made while another anonymous hold is
    /// live queues behind it; if the holder is the same flow of control it
    /// never returns. Anonymous code should poll or use a bounded wait.
    Forever,
    /// Fail with `Busy` instead of waiting.
    Poll,
    /// Relative wait; a zero duration polls.
    For(Duration),
    Until(Instant),
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Never,
    Poll,
    At(Instant),
}

impl Deadline {
    // The thread's standing deadline caps every wait except a poll.
    fn resolve(wait: Wait, thread: Option<&ThreadContext>) -> Self {
        let own = match wait {
            Wait::Forever => Deadline::Never,
            Wait::Poll => return Deadline::Poll,
            Wait::For(d) if d.is_zero() => return Deadline::Poll,
            Wait::For(d) => Deadline::At(Instant::now() + d),
            Wait::Until(t) => Deadline::At(t),
        };
        match (own, thread.and_then(ThreadContext::deadline)) {
            (Deadline::Never, Some(t)) => Deadline::At(t),
            (Deadline::At(a), Some(t)) => Deadline::At(a.min(t)),
            (d, _) => d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Thread(CallerId),
    Anonymous,
}

impl Owner {
    fn of(thread: Option<&ThreadContext>) -> Self {
        match thread {
            Some(t) => Owner::Thread(t.id()),
            None => Owner::Anonymous,
        }
    }
}

// Lock-level flags that also constrain every call.
const INHERITED_FLAGS: LockFlags =
    LockFlags::NONRECURSIVE_SHARED.union(LockFlags::NONRECURSIVE_MUTEX);

#[derive(Default)]
struct LockState {
    flags: LockFlags,
    destroyed: bool,
    // Bumped on every destroy so waiters from before a re-init bail out.
    generation: u64,
    readers: u32,
    shared: HashMap<CallerId, u32>,
    writer: Option<Owner>,
    write_depth: u32,
    reservation: Option<CallerId>,
    promoting: bool,
    write_queue: VecDeque<u64>,
    next_ticket: u64,
    read_waiters: u32,
}

impl LockState {
    fn shared_depth(&self, id: CallerId) -> u32 {
        self.shared.get(&id).copied().unwrap_or(0)
    }

    fn admits_new_reader(&self) -> bool {
        self.writer.is_none() && self.write_queue.is_empty() && !self.promoting
    }

    fn add_shared(&mut self, id: CallerId) {
        *self.shared.entry(id).or_insert(0) += 1;
        self.readers += 1;
    }

    /// Drops one shared hold; true when the caller holds none afterwards.
    fn drop_shared(&mut self, id: CallerId) -> bool {
        self.readers = self.readers.saturating_sub(1);
        match self.shared.get_mut(&id) {
            Some(depth) if *depth > 1 => {
                *depth -= 1;
                false
            }
            _ => {
                self.shared.remove(&id);
                true
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.readers == 0
            && self.writer.is_none()
            && self.write_queue.is_empty()
            && self.read_waiters == 0
            && self.reservation.is_none()
    }
}

macro_rules! wait_variants {
    ($(#[$doc:meta])* $name:ident, $timed:ident, $abstimed:ident => $core:ident) => {
        $(#[$doc])*
        pub fn $name(&self, thread: Option<&ThreadContext>, flags: LockFlags) -> Result<(), Error> {
            self.$core(thread, Wait::Forever, flags)
        }

        /// Relative-deadline form; a zero `max_wait` polls.
        pub fn $timed(
            &self,
            thread: Option<&ThreadContext>,
            max_wait: Duration,
            flags: LockFlags,
        ) -> Result<(), Error> {
            self.$core(thread, Wait::For(max_wait), flags)
        }

        /// Absolute-deadline form.
        pub fn $abstimed(
            &self,
            thread: Option<&ThreadContext>,
            deadline: Instant,
            flags: LockFlags,
        ) -> Result<(), Error> {
            self.$core(thread, Wait::Until(deadline), flags)
        }
    };
}

pub struct UpgradeableRwLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl UpgradeableRwLock {
    pub fn new(flags: LockFlags) -> Self {
        Self {
            state: Mutex::new(LockState {
                flags,
                ..LockState::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn new_arc(flags: LockFlags) -> Arc<Self> {
        Arc::new(Self::new(flags))
    }

    /// Re-arm a destroyed lock.
    pub fn init(&self, flags: LockFlags) -> Result<(), Error> {
        let mut st = self.state.lock();
        if !st.destroyed {
            return Err(Error::Already);
        }
        *st = LockState {
            flags,
            generation: st.generation,
            next_ticket: st.next_ticket,
            ..LockState::default()
        };
        Ok(())
    }

    /// Retire the lock. Fails with `InvalidArg` while anyone holds or
    /// waits on it.
    pub fn destroy(&self) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.destroyed || !st.is_idle() {
            return Err(Error::InvalidArg);
        }
        st.destroyed = true;
        st.generation += 1;
        Ok(())
    }

    /// Retire the lock from inside the caller's sole exclusive hold, so no
    /// other caller can get in between release and destroy. Queued waiters
    /// are woken and fail with `InvalidArg`. Shared holders, a pending
    /// reservation or a nested exclusive hold refuse with `Busy` and leave
    /// the hold in place.
    pub fn unlock_and_destroy(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        let owner = Owner::of(thread);
        let mut st = self.live()?;
        if st.writer != Some(owner) {
            return Err(Error::LackingMutex);
        }
        if st.write_depth != 1 || st.readers != 0 || st.reservation.is_some() {
            return Err(Error::Busy);
        }
        let waiters = st.write_queue.len() as u32 + st.read_waiters;
        st.write_depth = 0;
        st.writer = None;
        st.destroyed = true;
        st.generation += 1;
        if let Some(t) = thread {
            t.note_released();
        }
        self.cond.notify_all();
        if waiters > 0 {
            debug!("[LOCK] destroyed under hold, {waiters} waiters turned away");
        }
        Ok(())
    }

    pub fn get_flags(&self) -> LockFlags {
        self.state.lock().flags
    }

    fn live(&self) -> Result<MutexGuard<'_, LockState>, Error> {
        let st = self.state.lock();
        if st.destroyed {
            return Err(Error::InvalidArg);
        }
        Ok(st)
    }

    fn wait_for<F>(&self, st: &mut MutexGuard<'_, LockState>, deadline: Deadline, ready: F) -> Result<(), Error>
    where
        F: Fn(&LockState) -> bool,
    {
        let generation = st.generation;
        loop {
            if st.destroyed || st.generation != generation {
                return Err(Error::InvalidArg);
            }
            if ready(&**st) {
                return Ok(());
            }
            match deadline {
                Deadline::Poll => return Err(Error::Busy),
                Deadline::Never => self.cond.wait(st),
                Deadline::At(t) => {
                    if Instant::now() >= t {
                        return Err(Error::TimedOut);
                    }
                    let _ = self.cond.wait_until(st, t);
                }
            }
        }
    }

    wait_variants!(
        /// Acquire a shared hold. Anonymous callers are refused.
        lock_shared, lock_shared_timed, lock_shared_abstimed => lock_shared_with
    );

    pub fn lock_shared_with(&self, thread: Option<&ThreadContext>, wait: Wait, flags: LockFlags) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        let id = thread.id();
        let mut st = self.live()?;
        let flags = flags | (st.flags & INHERITED_FLAGS);

        if st.writer == Some(Owner::Thread(id)) {
            if flags.contains(LockFlags::NONRECURSIVE_MUTEX) {
                return Err(Error::Already);
            }
            st.write_depth += 1;
            return Ok(());
        }

        if st.shared_depth(id) > 0 {
            if flags.contains(LockFlags::NONRECURSIVE_SHARED) {
                return Err(Error::Already);
            }
            if flags.intersects(LockFlags::GET_RESERVATION_TOO | LockFlags::TRY_RESERVATION_TOO) {
                match st.reservation {
                    None => st.reservation = Some(id),
                    Some(r) if r == id => {}
                    // Waiting here would deadlock against the holder's redeem.
                    Some(_) if flags.contains(LockFlags::GET_RESERVATION_TOO) => return Err(Error::Busy),
                    Some(_) => {}
                }
            }
            st.add_shared(id);
            return Ok(());
        }

        let want_reservation = flags.contains(LockFlags::GET_RESERVATION_TOO);
        let deadline = Deadline::resolve(wait, Some(thread));
        let generation = st.generation;
        st.read_waiters += 1;
        let res = self.wait_for(&mut st, deadline, |s| {
            s.admits_new_reader() && (!want_reservation || s.reservation.is_none())
        });
        if st.generation == generation {
            st.read_waiters -= 1;
        }
        res?;

        st.add_shared(id);
        if want_reservation || (flags.contains(LockFlags::TRY_RESERVATION_TOO) && st.reservation.is_none()) {
            st.reservation = Some(id);
        }
        thread.note_acquired();
        trace!("[LOCK] shared granted to {:?}, readers={}", id, st.readers);
        Ok(())
    }

    wait_variants!(
        /// Acquire the exclusive hold. A caller already holding shared is
        /// promoted instead.
        lock_mutex, lock_mutex_timed, lock_mutex_abstimed => lock_mutex_with
    );

    pub fn lock_mutex_with(&self, thread: Option<&ThreadContext>, wait: Wait, flags: LockFlags) -> Result<(), Error> {
        if thread.is_some_and(ThreadContext::is_readonly) {
            return Err(Error::NotPermitted);
        }
        let owner = Owner::of(thread);
        let mut st = self.live()?;
        let flags = flags | (st.flags & INHERITED_FLAGS);

        if st.writer == Some(owner) {
            let retain = flags.contains(LockFlags::RETAIN_SEMAPHORE);
            match owner {
                Owner::Thread(_) if flags.contains(LockFlags::NONRECURSIVE_MUTEX) && !retain => {
                    return Err(Error::Already);
                }
                Owner::Thread(_) => {
                    st.write_depth += 1;
                    return Ok(());
                }
                Owner::Anonymous if retain => {
                    st.write_depth += 1;
                    return Ok(());
                }
                // Another anonymous caller: indistinguishable, so it queues.
                Owner::Anonymous => {}
            }
        }

        if let Owner::Thread(id) = owner {
            if st.shared_depth(id) > 0 {
                drop(st);
                return self.lock_shared2mutex_with(thread, wait, flags);
            }
        }

        let deadline = Deadline::resolve(wait, thread);
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.write_queue.push_back(ticket);

        let res = self.wait_for(&mut st, deadline, |s| {
            s.writer.is_none() && s.readers == 0 && !s.promoting && s.write_queue.front() == Some(&ticket)
        });
        if let Err(e) = res {
            st.write_queue.retain(|t| *t != ticket);
            // Our departure may unblock queued readers or the next writer.
            self.cond.notify_all();
            return Err(e);
        }

        st.write_queue.pop_front();
        st.writer = Some(owner);
        st.write_depth = 1;
        if let Some(t) = thread {
            t.note_acquired();
        }
        trace!("[LOCK] mutex granted to {:?}", owner);
        Ok(())
    }

    wait_variants!(
        /// Upgrade the caller's shared hold in place. Fails with `Busy` when
        /// another reader holds the reservation, `Already` when the caller
        /// does.
        lock_shared2mutex, lock_shared2mutex_timed, lock_shared2mutex_abstimed => lock_shared2mutex_with
    );

    pub fn lock_shared2mutex_with(&self, thread: Option<&ThreadContext>, wait: Wait, _flags: LockFlags) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        if thread.is_readonly() {
            return Err(Error::NotPermitted);
        }
        let id = thread.id();
        let mut st = self.live()?;

        if st.writer == Some(Owner::Thread(id)) {
            return Ok(());
        }
        let depth = st.shared_depth(id);
        if depth == 0 {
            return Err(Error::LackingReadLock);
        }
        match st.reservation {
            Some(r) if r == id => return Err(Error::Already),
            Some(_) => return Err(Error::Busy),
            None => {}
        }
        if depth != 1 {
            return Err(Error::IncompatibleState);
        }

        st.reservation = Some(id);
        let deadline = Deadline::resolve(wait, Some(thread));
        if let Err(e) = self.redeem_locked(&mut st, id, deadline) {
            st.reservation = None;
            self.cond.notify_all();
            return Err(e);
        }
        Ok(())
    }

    /// Claim the single upgrade slot without blocking peers. Never waits.
    pub fn lock_shared2mutex_reserve(&self, thread: Option<&ThreadContext>, _flags: LockFlags) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        if thread.is_readonly() {
            return Err(Error::NotPermitted);
        }
        let id = thread.id();
        let mut st = self.live()?;

        if st.writer == Some(Owner::Thread(id)) {
            return Err(Error::Already);
        }
        if st.shared_depth(id) == 0 {
            return Err(Error::LackingReadLock);
        }
        match st.reservation {
            Some(r) if r == id => Err(Error::Already),
            Some(_) => Err(Error::Busy),
            None => {
                st.reservation = Some(id);
                debug!("[LOCK] reservation taken by {:?}", id);
                Ok(())
            }
        }
    }

    wait_variants!(
        /// Convert a held reservation into the exclusive hold. On timeout
        /// the reservation is kept.
        lock_shared2mutex_redeem, lock_shared2mutex_redeem_timed, lock_shared2mutex_redeem_abstimed
            => lock_shared2mutex_redeem_with
    );

    pub fn lock_shared2mutex_redeem_with(
        &self,
        thread: Option<&ThreadContext>,
        wait: Wait,
        _flags: LockFlags,
    ) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        let id = thread.id();
        let mut st = self.live()?;

        if st.writer == Some(Owner::Thread(id)) {
            return Err(Error::Already);
        }
        if st.reservation != Some(id) || st.shared_depth(id) != 1 {
            return Err(Error::IncompatibleState);
        }
        let deadline = Deadline::resolve(wait, Some(thread));
        self.redeem_locked(&mut st, id, deadline)
    }

    fn redeem_locked(&self, st: &mut MutexGuard<'_, LockState>, id: CallerId, deadline: Deadline) -> Result<(), Error> {
        st.promoting = true;
        let res = self.wait_for(st, deadline, |s| s.writer.is_none() && s.readers == 1);
        st.promoting = false;
        if let Err(e) = res {
            self.cond.notify_all();
            return Err(e);
        }
        st.shared.remove(&id);
        st.readers = 0;
        st.reservation = None;
        st.writer = Some(Owner::Thread(id));
        st.write_depth = 1;
        debug!("[LOCK] {:?} promoted to mutex", id);
        Ok(())
    }

    pub fn lock_shared2mutex_abandon(&self, thread: Option<&ThreadContext>, _flags: LockFlags) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        let id = thread.id();
        let mut st = self.live()?;

        if st.writer == Some(Owner::Thread(id)) || st.reservation != Some(id) {
            return Err(Error::IncompatibleState);
        }
        st.reservation = None;
        self.cond.notify_all();
        Ok(())
    }

    /// Downgrade the exclusive hold to shared; with `GET_RESERVATION_TOO`
    /// the caller also keeps the upgrade slot.
    pub fn lock_mutex2shared(&self, thread: Option<&ThreadContext>, flags: LockFlags) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        let id = thread.id();
        let mut st = self.live()?;

        if st.writer != Some(Owner::Thread(id)) {
            return Err(Error::LackingMutex);
        }
        if st.write_depth > 1 {
            return Err(Error::IncompatibleState);
        }
        st.writer = None;
        st.write_depth = 0;
        st.add_shared(id);
        if flags.contains(LockFlags::GET_RESERVATION_TOO) {
            st.reservation = Some(id);
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Release one level of whatever the caller holds.
    pub fn unlock(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        let owner = Owner::of(thread);
        let mut st = self.live()?;

        if st.writer == Some(owner) {
            st.write_depth -= 1;
            if st.write_depth == 0 {
                st.writer = None;
                if let Some(t) = thread {
                    t.note_released();
                }
                self.cond.notify_all();
            }
            return Ok(());
        }

        if let Some(t) = thread {
            let id = t.id();
            if st.shared_depth(id) > 0 {
                if st.drop_shared(id) {
                    if st.reservation == Some(id) {
                        st.reservation = None;
                    }
                    t.note_released();
                }
                self.cond.notify_all();
                return Ok(());
            }
        }
        Err(Error::IncompatibleState)
    }

    pub fn have_shared(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        if self.state.lock().shared_depth(thread.id()) > 0 {
            Ok(())
        } else {
            Err(Error::LackingReadLock)
        }
    }

    pub fn have_mutex(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        if self.state.lock().writer == Some(Owner::of(thread)) {
            Ok(())
        } else {
            Err(Error::LackingMutex)
        }
    }

    pub fn have_either(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        let st = self.state.lock();
        let owner = Owner::of(thread);
        let shared = matches!(owner, Owner::Thread(id) if st.shared_depth(id) > 0);
        if shared || st.writer == Some(owner) {
            Ok(())
        } else {
            Err(Error::LackingMutex)
        }
    }

    pub fn have_shared2mutex_reservation(&self, thread: Option<&ThreadContext>) -> Result<(), Error> {
        let thread = thread.ok_or(Error::InvalidArg)?;
        if self.state.lock().reservation == Some(thread.id()) {
            Ok(())
        } else {
            Err(Error::IncompatibleState)
        }
    }

    /// Shared hold released when the guard drops.
    pub fn read<'a>(&'a self, thread: Option<&'a ThreadContext>, wait: Wait) -> Result<LockGuard<'a>, Error> {
        self.lock_shared_with(thread, wait, LockFlags::NONE)?;
        Ok(LockGuard {
            lock: self,
            thread,
            mode: HoldMode::Shared,
        })
    }

    /// Exclusive hold released when the guard drops.
    pub fn write<'a>(&'a self, thread: Option<&'a ThreadContext>, wait: Wait) -> Result<LockGuard<'a>, Error> {
        self.lock_mutex_with(thread, wait, LockFlags::NONE)?;
        Ok(LockGuard {
            lock: self,
            thread,
            mode: HoldMode::Exclusive,
        })
    }
}

impl Default for UpgradeableRwLock {
    fn default() -> Self {
        Self::new(LockFlags::NONE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldMode {
    Shared,
    Exclusive,
    Released,
}

/// Represents one acquired hold. The hold is released when this guard is
/// dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct LockGuard<'a> {
    lock: &'a UpgradeableRwLock,
    thread: Option<&'a ThreadContext>,
    mode: HoldMode,
}

impl<'a> LockGuard<'a> {
    pub fn mode(&self) -> HoldMode {
        self.mode
    }

    pub fn is_exclusive(&self) -> bool {
        self.mode == HoldMode::Exclusive
    }

    pub fn lock(&self) -> &'a UpgradeableRwLock {
        self.lock
    }

    pub fn thread(&self) -> Option<&'a ThreadContext> {
        self.thread
    }

    pub fn reserve(&mut self) -> Result<(), Error> {
        if self.mode != HoldMode::Shared {
            return Err(Error::IncompatibleState);
        }
        self.lock.lock_shared2mutex_reserve(self.thread, LockFlags::NONE)
    }

    pub fn redeem(&mut self, wait: Wait) -> Result<(), Error> {
        self.lock.lock_shared2mutex_redeem_with(self.thread, wait, LockFlags::NONE)?;
        self.mode = HoldMode::Exclusive;
        Ok(())
    }

    pub fn abandon(&mut self) -> Result<(), Error> {
        self.lock.lock_shared2mutex_abandon(self.thread, LockFlags::NONE)
    }

    /// One-shot upgrade; a no-op when already exclusive.
    pub fn promote(&mut self, wait: Wait) -> Result<(), Error> {
        match self.mode {
            HoldMode::Exclusive => Ok(()),
            HoldMode::Released => Err(Error::IncompatibleState),
            HoldMode::Shared => {
                self.lock.lock_shared2mutex_with(self.thread, wait, LockFlags::NONE)?;
                self.mode = HoldMode::Exclusive;
                Ok(())
            }
        }
    }

    pub fn downgrade(&mut self, flags: LockFlags) -> Result<(), Error> {
        if self.mode != HoldMode::Exclusive {
            return Err(Error::LackingMutex);
        }
        self.lock.lock_mutex2shared(self.thread, flags)?;
        self.mode = HoldMode::Shared;
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), Error> {
        if self.mode == HoldMode::Released {
            return Ok(());
        }
        self.lock.unlock(self.thread)?;
        self.mode = HoldMode::Released;
        Ok(())
    }

    /// Drop the exclusive hold and retire the lock in one step. On error
    /// the hold is kept.
    pub fn unlock_and_destroy(&mut self) -> Result<(), Error> {
        if self.mode != HoldMode::Exclusive {
            return Err(Error::LackingMutex);
        }
        self.lock.unlock_and_destroy(self.thread)?;
        self.mode = HoldMode::Released;
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.mode != HoldMode::Released {
            if let Err(e) = self.lock.unlock(self.thread) {
                warn!("[LOCK] unlock on guard drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_shared_is_refused() {
        let lock = UpgradeableRwLock::default();
        assert_eq!(lock.lock_shared(None, LockFlags::NONE), Err(Error::InvalidArg));
        lock.lock_mutex(None, LockFlags::NONE).unwrap();
        lock.unlock(None).unwrap();
    }

    #[test]
    fn standing_deadline_caps_forever_waits() {
        let lock = UpgradeableRwLock::default();
        lock.lock_mutex(None, LockFlags::NONE).unwrap();

        let t = ThreadContext::new();
        t.set_deadline_rel(Duration::from_millis(20));
        let start = Instant::now();
        assert_eq!(lock.lock_shared(Some(&t), LockFlags::NONE), Err(Error::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(15));
        lock.unlock(None).unwrap();
    }

    #[test]
    fn guard_tracks_mode_and_held_count() {
        let lock = UpgradeableRwLock::default();
        let t = ThreadContext::new();
        {
            let mut g = lock.read(Some(&t), Wait::Forever).unwrap();
            assert_eq!(t.held_locks(), 1);
            g.promote(Wait::Poll).unwrap();
            assert!(g.is_exclusive());
            g.downgrade(LockFlags::GET_RESERVATION_TOO).unwrap();
            assert_eq!(lock.have_shared2mutex_reservation(Some(&t)), Ok(()));
            g.redeem(Wait::Poll).unwrap();
            assert_eq!(lock.have_mutex(Some(&t)), Ok(()));
        }
        assert_eq!(t.held_locks(), 0);
        assert_eq!(lock.have_either(Some(&t)), Err(Error::LackingMutex));
        lock.destroy().unwrap();
    }
}
