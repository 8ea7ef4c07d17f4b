//! Host-facing side of the drawhook core.
//!
//! `Interceptor` receives every device, resource, pipeline and command-list
//! event a host forwards and routes it to the pipeline state tracker, the
//! action scheduler and the constant shadow store. `trace` replays recorded
//! event streams against the in-memory host for offline inspection.

mod interceptor;
pub mod trace;

pub use interceptor::{CommandListKey, DeviceKey, Interceptor};
pub use trace::{parse_trace, replay, FrameReport, ReplayReport, Trace, TraceEvent};
