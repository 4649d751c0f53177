//! Error handling and C-ABI error codes for netsentry

use std::cell::RefCell;
use std::os::raw::c_char;

use thiserror::Error;

/// Every failure the engine reports. Contention and state errors never
/// leave partial changes behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("resource busy")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("already in requested state")]
    Already,
    #[error("operation incompatible with current state")]
    IncompatibleState,
    #[error("caller does not hold the mutex")]
    LackingMutex,
    #[error("caller does not hold a shared lock")]
    LackingReadLock,
    #[error("thread is read-only")]
    NotPermitted,
    #[error("counter overflow averted")]
    OverflowAverted,
    #[error("string argument too long")]
    StringArgTooLong,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("item not found")]
    ItemNotFound,
    #[error("item already present")]
    ItemAlreadyPresent,
    #[error("fatal system operation failure: {0}")]
    SysOpFatal(String),
}

/// Success codes. `UsedFallback` is a success, not an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    UsedFallback,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    UsedFallback = 1,
    InvalidArg = 2,
    Busy = 3,
    TimedOut = 4,
    Already = 5,
    IncompatibleState = 6,
    LackingMutex = 7,
    LackingReadLock = 8,
    NotPermitted = 9,
    OverflowAverted = 10,
    StringArgTooLong = 11,
    BufferTooSmall = 12,
    ItemNotFound = 13,
    ItemAlreadyPresent = 14,
    InvalidHandle = 15,
    Utf8Error = 16,
    SysOpFatal = 254,
    Unknown = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        self.as_cstr().to_str().unwrap_or("Unknown error")
    }

    fn as_cstr(self) -> &'static std::ffi::CStr {
        match self {
            ErrorCode::Success => c"Success",
            ErrorCode::UsedFallback => c"Used fallback",
            ErrorCode::InvalidArg => c"Invalid argument",
            ErrorCode::Busy => c"Busy",
            ErrorCode::TimedOut => c"Timed out",
            ErrorCode::Already => c"Already",
            ErrorCode::IncompatibleState => c"Incompatible state",
            ErrorCode::LackingMutex => c"Lacking mutex",
            ErrorCode::LackingReadLock => c"Lacking read lock",
            ErrorCode::NotPermitted => c"Not permitted",
            ErrorCode::OverflowAverted => c"Overflow averted",
            ErrorCode::StringArgTooLong => c"String argument too long",
            ErrorCode::BufferTooSmall => c"Buffer too small",
            ErrorCode::ItemNotFound => c"Item not found",
            ErrorCode::ItemAlreadyPresent => c"Item already present",
            ErrorCode::InvalidHandle => c"Invalid handle",
            ErrorCode::Utf8Error => c"UTF-8 conversion error",
            ErrorCode::SysOpFatal => c"Fatal system operation failure",
            ErrorCode::Unknown => c"Unknown error",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success | ErrorCode::UsedFallback)
    }
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidArg => ErrorCode::InvalidArg,
            Error::Busy => ErrorCode::Busy,
            Error::TimedOut => ErrorCode::TimedOut,
            Error::Already => ErrorCode::Already,
            Error::IncompatibleState => ErrorCode::IncompatibleState,
            Error::LackingMutex => ErrorCode::LackingMutex,
            Error::LackingReadLock => ErrorCode::LackingReadLock,
            Error::NotPermitted => ErrorCode::NotPermitted,
            Error::OverflowAverted => ErrorCode::OverflowAverted,
            Error::StringArgTooLong => ErrorCode::StringArgTooLong,
            Error::BufferTooSmall => ErrorCode::BufferTooSmall,
            Error::ItemNotFound => ErrorCode::ItemNotFound,
            Error::ItemAlreadyPresent => ErrorCode::ItemAlreadyPresent,
            Error::SysOpFatal(_) => ErrorCode::SysOpFatal,
        }
    }
}

impl From<Status> for ErrorCode {
    fn from(s: Status) -> Self {
        match s {
            Status::Ok => ErrorCode::Success,
            Status::UsedFallback => ErrorCode::UsedFallback,
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    ErrorCode::from(e)
}

#[no_mangle]
pub extern "C" fn netsentry_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn netsentry_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_maps_to_a_failure_code() {
        let all = [
            Error::InvalidArg,
            Error::Busy,
            Error::TimedOut,
            Error::Already,
            Error::IncompatibleState,
            Error::LackingMutex,
            Error::LackingReadLock,
            Error::NotPermitted,
            Error::OverflowAverted,
            Error::StringArgTooLong,
            Error::BufferTooSmall,
            Error::ItemNotFound,
            Error::ItemAlreadyPresent,
            Error::SysOpFatal("x".into()),
        ];
        for e in &all {
            assert!(!map_error(e).is_success(), "{e} mapped to a success code");
        }
        assert!(ErrorCode::from(Status::UsedFallback).is_success());
    }

    #[test]
    fn last_error_is_thread_local() {
        set_last_error(ErrorCode::Busy);
        let other = std::thread::spawn(get_last_error).join().unwrap();
        assert_eq!(other, ErrorCode::Success);
        assert_eq!(get_last_error(), ErrorCode::Busy);
        assert_eq!(ErrorCode::Busy.as_str(), "Busy");
    }
}
