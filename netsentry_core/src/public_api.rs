//! C ABI over context handles.
//!
//! Every call returns an `ErrorCode` and mirrors it into the thread-local
//! last-error slot. Calls run as the calling OS thread's own
//! `ThreadContext`.

use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr};
use std::os::raw::c_char;

use ipnet::IpNet;

use crate::context::{Context, ContextConfig};
use crate::errors::{map_error, set_last_error, Error, ErrorCode, Status};
use crate::handle_registry::{register_handle, unregister_handle, with_handle, HandleId};
use crate::route::EndpointSpec;
use crate::thread::ThreadContext;
use crate::types::{Policy, RouteFlags, RouteId};

thread_local! {
    static THREAD: ThreadContext = ThreadContext::new();
}

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::InvalidArg);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

#[inline]
fn parse_net(s: &str) -> Result<IpNet, ErrorCode> {
    // Accept "addr/prefix" OR plain address
    s.parse::<IpNet>()
        .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| ErrorCode::InvalidArg)
}

#[inline]
fn finish(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return finish(e),
}}}

/// Run `f` on the handle's context as this thread.
fn on_context<F>(h: HandleId, f: F) -> ErrorCode
where
    F: FnOnce(&Context, &ThreadContext) -> Result<ErrorCode, Error>,
{
    let outcome = with_handle(h, |ctx| THREAD.with(|t| f(ctx, t)));
    match outcome {
        Ok(Ok(code)) => finish(code),
        Ok(Err(e)) => finish(map_error(&e)),
        Err(code) => finish(code),
    }
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create a context. `default_accept` picks the policy applied when nothing
/// decides. Stores the handle in `*out`.
#[no_mangle]
pub extern "C" fn netsentry_open(default_accept: bool, out: *mut HandleId) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::InvalidArg);
    }
    crate::telemetry::init();
    let config = ContextConfig {
        default_policy: if default_accept { Policy::Accept } else { Policy::Reject },
        ..ContextConfig::default()
    };
    let ctx = match Context::new(config) {
        Ok(c) => c,
        Err(e) => return finish(map_error(&e)),
    };
    unsafe { *out = register_handle(ctx) };
    finish(ErrorCode::Success)
}

/// Tear a context down and forget its handle. A failed teardown leaves the
/// handle registered and the context intact.
#[no_mangle]
pub extern "C" fn netsentry_close(h: HandleId) -> ErrorCode {
    let code = on_context(h, |ctx, t| {
        ctx.shutdown(Some(t))?;
        Ok(ErrorCode::Success)
    });
    if code == ErrorCode::Success {
        // A racing close may have taken the handle first; the context is
        // already retired either way.
        let _ = unregister_handle(h);
    }
    code
}

// ───────────────────────── routes ────────────────────────────────────── //

/// Insert a route from two CIDR strings. `flags` is a `RouteFlags` word;
/// only identity and status bits are honoured.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn netsentry_route_insert_cidr(
    h: HandleId,
    remote_cidr: *const c_char,
    remote_port: u16,
    local_cidr: *const c_char,
    local_port: u16,
    protocol: u16,
    flags: u32,
    out_id: *mut RouteId,
) -> ErrorCode {
    let remote = try_c!(cstr(remote_cidr).and_then(parse_net));
    let local = try_c!(cstr(local_cidr).and_then(parse_net));
    let remote = EndpointSpec::from_net(remote, protocol, remote_port);
    let local = EndpointSpec::from_net(local, protocol, local_port);
    let flags = RouteFlags::from_bits(flags) & (RouteFlags::KEY_FLAGS | RouteFlags::STATUS_FLAGS);

    on_context(h, |ctx, t| {
        let (id, _) = ctx.route_insert(Some(t), &remote, &local, flags, None)?;
        if !out_id.is_null() {
            unsafe { *out_id = id };
        }
        Ok(ErrorCode::Success)
    })
}

#[no_mangle]
pub extern "C" fn netsentry_route_delete_by_id(h: HandleId, id: RouteId) -> ErrorCode {
    on_context(h, |ctx, t| {
        ctx.route_delete_by_id(Some(t), id)?;
        Ok(ErrorCode::Success)
    })
}

/// Classify an IPv4 tuple (addresses in host byte order). Writes the
/// `ActionResults` word and the deciding route id (0 for a default
/// policy). Returns `UsedFallback` when no stored route matched exactly.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn netsentry_dispatch_v4(
    h: HandleId,
    remote_addr: u32,
    remote_port: u16,
    local_addr: u32,
    local_port: u16,
    protocol: u16,
    flags: u32,
    out_results: *mut u32,
    out_route_id: *mut RouteId,
) -> ErrorCode {
    if out_results.is_null() {
        return finish(ErrorCode::InvalidArg);
    }
    let remote = EndpointSpec::from_ip(IpAddr::V4(Ipv4Addr::from(remote_addr)), protocol, remote_port);
    let local = EndpointSpec::from_ip(IpAddr::V4(Ipv4Addr::from(local_addr)), protocol, local_port);
    let flags = RouteFlags::from_bits(flags) & RouteFlags::DIRECTION_FLAGS;

    on_context(h, |ctx, t| {
        let verdict = ctx.dispatch(Some(t), &remote, &local, flags, None, None)?;
        unsafe {
            *out_results = verdict.action_results.bits();
            if !out_route_id.is_null() {
                *out_route_id = verdict.route_id;
            }
        }
        Ok(match verdict.status {
            Status::Ok => ErrorCode::Success,
            Status::UsedFallback => ErrorCode::UsedFallback,
        })
    })
}

/// Render a route as NUL-terminated text. `BufferTooSmall` when `len`
/// cannot hold it; `*out_len` then still reports the bytes needed
/// (excluding the NUL).
#[no_mangle]
pub extern "C" fn netsentry_route_render(
    h: HandleId,
    id: RouteId,
    buf: *mut c_char,
    len: usize,
    out_len: *mut usize,
) -> ErrorCode {
    if buf.is_null() {
        return finish(ErrorCode::InvalidArg);
    }
    on_context(h, |ctx, t| {
        let text = ctx.route_export(Some(t), id)?.to_string();
        let bytes = text.as_bytes();
        if !out_len.is_null() {
            unsafe { *out_len = bytes.len() };
        }
        if bytes.len() + 1 > len {
            return Ok(ErrorCode::BufferTooSmall);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, bytes.len());
            *buf.add(bytes.len()) = 0;
        }
        Ok(ErrorCode::Success)
    })
}

/// Adjust a route's derogatory and commendable counts. Either delta may
/// be zero; an out-of-range delta leaves both counts untouched.
#[no_mangle]
pub extern "C" fn netsentry_counter_increment(
    h: HandleId,
    id: RouteId,
    derogatory_delta: i32,
    commendable_delta: i32,
) -> ErrorCode {
    on_context(h, |ctx, t| {
        ctx.route_adjust_counts(Some(t), id, derogatory_delta, commendable_delta)?;
        Ok(ErrorCode::Success)
    })
}
