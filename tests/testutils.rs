use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, UnwindSafe};
use std::sync::Once;

use libtest_mimic::Failed;

use html5bridge::testutils::{take_output, trace_log};

/// Run a test body, turning a panic into a failure that carries everything the bridge logged.
///
/// Custom test harnesses can't capture stdout, so `trace_log!` writes into a thread-local buffer
/// instead (compiled out in release mode). On failure, the buffer, the panic message and a
/// trimmed backtrace end up in the failure message. The buffer is emptied either way.
pub fn catch_unwind_and_report(f: impl FnOnce() + UnwindSafe) -> Result<(), Failed> {
    static PANIC_HOOK: Once = Once::new();
    PANIC_HOOK.call_once(|| {
        panic::set_hook(Box::new(|_info| {
            let backtrace = Backtrace::capture();
            if backtrace.status() != BacktraceStatus::Captured {
                trace_log("PANIC BACKTRACE: not captured, set RUST_BACKTRACE=1");
                return;
            }

            // only keep the frames between the panic and the test harness
            let mut frames = String::new();
            let mut in_test = false;
            for line in format!("{:#?}", backtrace).lines() {
                if line.contains("\"std::panicking::try::do_call\"") {
                    break;
                } else if in_test {
                    frames.push_str(line);
                    frames.push('\n');
                } else if line.contains("\"core::panicking::panic_fmt\"") {
                    in_test = true;
                }
            }
            trace_log(&format!("\nPANIC BACKTRACE:\n{}", frames));
        }));
    });

    let result = panic::catch_unwind(f);
    let mut msg = take_output();

    match result {
        Ok(()) => Ok(()),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| payload.downcast_ref::<&'static str>().copied());
            if let Some(reason) = reason {
                msg.push_str("\nPANIC: ");
                msg.push_str(reason);
            }
            Err(msg.into())
        }
    }
}
