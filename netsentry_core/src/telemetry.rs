//! Minimal run-time metrics sink.
//!
//! Prometheus export is left out; the host process registers a raw
//! callback that receives name/value pairs instead.

use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;

/// Signature for external collectors.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C/other languages. Only the first
/// registration sticks.
#[no_mangle]
pub extern "C" fn netsentry_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct FfiRecorder;

// One NUL-terminated copy of the metric name per registered handle.
struct FfiMetric {
    name: CString,
}

impl FfiMetric {
    fn new(key: &Key) -> Arc<Self> {
        let name = CString::new(key.name()).unwrap_or_default();
        Arc::new(Self { name })
    }

    fn emit(&self, value: u64) {
        if let Some(cb) = CALLBACK.get() {
            // SAFETY: `name` outlives the call; the callback contract is the
            // host's.
            unsafe { cb(self.name.as_ptr(), value as c_ulonglong) };
        }
    }
}

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(FfiMetric::new(key))
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(FfiMetric::new(key))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(FfiMetric::new(key))
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        self.emit(value);
    }
    fn absolute(&self, value: u64) {
        self.emit(value);
    }
}

// Gauges and histograms are truncated to whole numbers.
impl metrics::GaugeFn for FfiMetric {
    fn increment(&self, value: f64) {
        self.emit(value as u64);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as u64);
    }
    fn set(&self, value: f64) {
        self.emit(value as u64);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        self.emit(value as u64);
    }
}

/// Install exactly **once**; called from `netsentry_open`.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(FfiRecorder);
    });
}
