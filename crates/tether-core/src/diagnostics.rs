//! Diagnostic channel between the engine and the host.
//!
//! Two host-supplied callbacks, a leveled message sink and an
//! unhandled-fault sink, are the only way internal faults become
//! observable; no operation throws across the boundary. The engine also
//! keeps a small ring of recent diagnostics so embedders (and tests) can
//! inspect what was reported without installing callbacks.

use std::collections::VecDeque;
use std::ffi::CString;
use std::fmt;
use std::os::raw::c_char;
use std::sync::{Mutex, OnceLock};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Severity of a diagnostic message. Crosses the boundary as a raw `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DiagnosticKind {
    Info = 0,
    Warning = 1,
    Error = 2,
}

/// A single diagnostic message.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    /// Operation or entity the message refers to, when known.
    pub context: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DiagnosticKind::Info => "info",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Error => "error",
        };
        match &self.context {
            Some(ctx) => write!(f, "{kind}: [{ctx}] {}", self.message),
            None => write!(f, "{kind}: {}", self.message),
        }
    }
}

/// Host-supplied leveled message callback.
pub type MessageCallbackFn = unsafe extern "C" fn(level: u32, message: *const c_char);

/// Host-supplied unhandled-fault callback.
pub type FaultCallbackFn = unsafe extern "C" fn(message: *const c_char);

const RING_CAPACITY: usize = 256;

struct SinkState {
    message_callback: Option<MessageCallbackFn>,
    fault_callback: Option<FaultCallbackFn>,
    recent: VecDeque<Diagnostic>,
}

static SINK: OnceLock<Mutex<SinkState>> = OnceLock::new();

/// Process-wide diagnostic sink.
pub struct DiagnosticSink;

impl DiagnosticSink {
    fn state() -> &'static Mutex<SinkState> {
        SINK.get_or_init(|| {
            Mutex::new(SinkState {
                message_callback: None,
                fault_callback: None,
                recent: VecDeque::with_capacity(RING_CAPACITY),
            })
        })
    }

    fn lock() -> std::sync::MutexGuard<'static, SinkState> {
        // A panic while holding the sink lock must not silence diagnostics
        // for the rest of the process.
        Self::state().lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_message_callback(callback: Option<MessageCallbackFn>) {
        Self::lock().message_callback = callback;
    }

    pub fn set_fault_callback(callback: Option<FaultCallbackFn>) {
        Self::lock().fault_callback = callback;
    }

    /// Report a diagnostic to the host and the ring.
    pub fn emit(diagnostic: Diagnostic) {
        let mut state = Self::lock();
        if state.recent.len() == RING_CAPACITY {
            state.recent.pop_front();
        }
        state.recent.push_back(diagnostic.clone());
        if let Some(callback) = state.message_callback {
            let text = diagnostic.to_string();
            drop(state);
            if let Ok(c) = CString::new(text) {
                unsafe { callback(diagnostic.kind.into(), c.as_ptr()) };
            }
        }
    }

    pub fn info(context: impl Into<String>, message: impl Into<String>) {
        Self::emit(Diagnostic {
            kind: DiagnosticKind::Info,
            message: message.into(),
            context: Some(context.into()),
        });
    }

    pub fn warning(context: impl Into<String>, message: impl Into<String>) {
        Self::emit(Diagnostic {
            kind: DiagnosticKind::Warning,
            message: message.into(),
            context: Some(context.into()),
        });
    }

    pub fn error(context: impl Into<String>, message: impl Into<String>) {
        Self::emit(Diagnostic {
            kind: DiagnosticKind::Error,
            message: message.into(),
            context: Some(context.into()),
        });
    }

    /// Report an unhandled fault caught at the boundary edge.
    pub fn fault(message: impl Into<String>) {
        let message = message.into();
        let callback = {
            let mut state = Self::lock();
            if state.recent.len() == RING_CAPACITY {
                state.recent.pop_front();
            }
            state.recent.push_back(Diagnostic {
                kind: DiagnosticKind::Error,
                message: message.clone(),
                context: Some("unhandled".into()),
            });
            state.fault_callback
        };
        if let Some(callback) = callback {
            if let Ok(c) = CString::new(message) {
                unsafe { callback(c.as_ptr()) };
            }
        }
    }

    /// Drain the ring of recent diagnostics.
    pub fn drain() -> Vec<Diagnostic> {
        Self::lock().recent.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static MESSAGES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_messages(_level: u32, _message: *const c_char) {
        MESSAGES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn emit_reaches_ring_and_callback() {
        DiagnosticSink::drain();
        DiagnosticSink::set_message_callback(Some(count_messages));
        let before = MESSAGES.load(Ordering::SeqCst);
        DiagnosticSink::warning("unload", "leaked token");
        assert_eq!(MESSAGES.load(Ordering::SeqCst), before + 1);
        DiagnosticSink::set_message_callback(None);

        let drained = DiagnosticSink::drain();
        assert!(
            drained
                .iter()
                .any(|d| d.kind == DiagnosticKind::Warning && d.message.contains("leaked"))
        );
    }

    #[test]
    fn display_format() {
        let d = Diagnostic {
            kind: DiagnosticKind::Error,
            message: "boom".into(),
            context: Some("invoke".into()),
        };
        assert_eq!(d.to_string(), "error: [invoke] boom");
    }
}
