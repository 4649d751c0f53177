//! Process-wide table of open contexts, keyed by opaque integer handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::context::Context;
use crate::errors::ErrorCode;

/// Handle ID type - safer than raw pointers
pub type HandleId = u64;

static REGISTRY: Lazy<DashMap<HandleId, Arc<Context>>> = Lazy::new(DashMap::new);
// Start from 1, reserve 0 for null/invalid
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

pub fn register_handle(ctx: Context) -> HandleId {
    let id = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    REGISTRY.insert(id, Arc::new(ctx));
    id
}

/// Run `f` against the context behind `handle_id`. The registry shard is
/// not held while `f` runs.
pub fn with_handle<T, F>(handle_id: HandleId, f: F) -> Result<T, ErrorCode>
where
    F: FnOnce(&Context) -> T,
{
    let ctx = lookup(handle_id)?;
    Ok(f(&ctx))
}

fn lookup(handle_id: HandleId) -> Result<Arc<Context>, ErrorCode> {
    if handle_id == 0 {
        return Err(ErrorCode::InvalidHandle);
    }
    REGISTRY
        .get(&handle_id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or(ErrorCode::InvalidHandle)
}

/// Remove the handle; the context is dropped once in-flight calls finish.
pub fn unregister_handle(handle_id: HandleId) -> Result<Arc<Context>, ErrorCode> {
    if handle_id == 0 {
        return Err(ErrorCode::InvalidHandle);
    }
    REGISTRY
        .remove(&handle_id)
        .map(|(_, ctx)| ctx)
        .ok_or(ErrorCode::InvalidHandle)
}
