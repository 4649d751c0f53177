//! netsentry: an embeddable connection-policy engine.
//!
//! A [`Context`] owns a route table of match rules, a registry of events
//! (named configs with action chains) and a registry of actions, all behind
//! one [`UpgradeableRwLock`]. [`Context::dispatch`] classifies a connection
//! tuple against the table, runs the deciding chain and maintains the
//! derogatory/commendable counters that put misbehaving peers in the
//! penalty box.

pub mod action;
pub mod alloc;
pub mod clock;
pub mod constants;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod event;
pub mod handle_registry;
pub mod helpers;
mod prefix_index;
pub mod public_api;
pub mod route;
pub mod rwlock;
pub mod table;
pub mod telemetry;
pub mod thread;
pub mod types;

use once_cell::sync::OnceCell;

pub use crate::action::{Action, ActionCall, ActionHandler, ActionType};
pub use crate::alloc::{PrivateData, RouteAllocator, SystemAllocator};
pub use crate::clock::{ManualClock, MonotonicClock, TimeSource};
pub use crate::context::{Context, ContextConfig, ContextReadGuard, DeleteOutcome};
pub use crate::dispatch::Verdict;
pub use crate::errors::{Error, ErrorCode, Status};
pub use crate::event::{Event, EventConfig};
pub use crate::route::{EndpointSpec, Route, RouteExport, RouteRef};
pub use crate::rwlock::{HoldMode, LockGuard, UpgradeableRwLock, Wait};
pub use crate::table::{RouteCursor, RouteMatch, RouteTable, FALLBACK_INEXACT};
pub use crate::thread::{CallerId, ThreadContext};
pub use crate::types::{
    ActionFlags, ActionId, ActionResults, EntId, EventConfigFlags, EventId, LockFlags, Policy, RouteFlags, RouteId,
    ThreadFlags,
};

// ---- logging bootstrapper -------------------------------------------------
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        // A host that installed its own logger wins; try_init just fails.
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}
