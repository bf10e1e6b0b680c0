//! Keep host errors from unwinding through the parser's stack frames.
//!
//! Every callback body runs inside [`barrier`]. Errors and panics are parked in a thread-local slot
//! and the callback returns a failure sentinel instead, which makes the parser abort whatever it
//! was doing. Once control is back on the host side of the boundary, the session [`take`]s the
//! fault and raises it.
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{BoxError, Error};
use crate::utils::trace_log;

pub(crate) enum FaultKind {
    Error(BoxError),
    Panic(Box<dyn Any + Send + 'static>),
}

pub(crate) struct Fault {
    pub(crate) callback: &'static str,
    pub(crate) kind: FaultKind,
}

impl Fault {
    /// Turn the fault back into what it originally was: errors become [`Error::HostCallback`],
    /// panics continue unwinding with their original payload.
    pub(crate) fn raise(self) -> Error {
        match self.kind {
            FaultKind::Error(source) => Error::HostCallback {
                callback: self.callback,
                source,
            },
            FaultKind::Panic(payload) => panic::resume_unwind(payload),
        }
    }
}

thread_local! {
    // Sessions on other threads must never observe this thread's faults.
    static PENDING: RefCell<Option<Fault>> = const { RefCell::new(None) };
}

pub(crate) fn is_pending() -> bool {
    PENDING.with(|slot| slot.borrow().is_some())
}

pub(crate) fn take() -> Option<Fault> {
    PENDING.with(|slot| slot.borrow_mut().take())
}

fn capture(fault: Fault) {
    PENDING.with(|slot| {
        let mut slot = slot.borrow_mut();
        // the first fault is the interesting one, everything after it is fallout
        if slot.is_none() {
            *slot = Some(fault);
        }
    });
}

/// Run the body of the callback named `callback`, returning `sentinel` if it fails.
///
/// While a fault is pending, `f` is not run at all: the backend is left alone until the fault has
/// been raised.
pub(crate) fn barrier<T>(
    callback: &'static str,
    sentinel: T,
    f: impl FnOnce() -> Result<T, BoxError>,
) -> T {
    if is_pending() {
        trace_log!("{}: skipped, a fault is pending", callback);
        return sentinel;
    }

    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => {
            trace_log!("{}: captured error: {}", callback, error);
            capture(Fault {
                callback,
                kind: FaultKind::Error(error),
            });
            sentinel
        }
        Err(payload) => {
            trace_log!("{}: captured panic", callback);
            capture(Fault {
                callback,
                kind: FaultKind::Panic(payload),
            });
            sentinel
        }
    }
}

#[test]
fn test_error_is_captured_once() {
    assert_eq!(barrier("a", -1, || Err("first".into())), -1);
    assert!(is_pending());
    // later callbacks don't run and don't overwrite the fault
    assert_eq!(barrier("b", -1, || unreachable!()), -1);

    let fault = take().unwrap();
    assert!(!is_pending());
    let error = fault.raise();
    assert_eq!(error.to_string(), "tree builder failed in a: first");
}

#[test]
fn test_panic_is_resumed_with_payload() {
    assert_eq!(barrier("a", 0, || panic!("boom")), 0);
    let fault = take().unwrap();
    assert_eq!(fault.callback, "a");

    let payload = panic::catch_unwind(AssertUnwindSafe(|| fault.raise())).unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    assert!(take().is_none());
}

#[test]
fn test_faults_are_thread_local() {
    assert_eq!(barrier("a", 0, || Err("here".into())), 0);
    std::thread::spawn(|| assert!(!is_pending()))
        .join()
        .unwrap();
    assert!(take().is_some());
}

#[test]
fn test_success_passes_through() {
    assert_eq!(barrier("a", 0, || Ok(42)), 42);
    assert!(!is_pending());
}
