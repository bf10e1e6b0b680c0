//! Module of helper functions for integration tests.
//!
//! Those tests should only test public API surface in general, with some exceptions as provided by
//! this module.
use std::cell::Cell;

thread_local! {
    /// Buffer of all debugging output logged internally by html5bridge.
    pub static OUTPUT: Cell<String> = Cell::default();
}

/// Simple debug logger for tests.
///
/// The test harness used by `tests/html5lib_tree_builder.rs` cannot capture stdout, see
/// [libtest-mimic issue #9](https://github.com/LukasKalbertodt/libtest-mimic/issues/9) -- this is
/// much more performant than println anyway though.
///
/// Release builds compile every call site out, see `trace_log!` in src/utils.rs.
pub fn trace_log(msg: &str) {
    OUTPUT.with(|cell| {
        let mut buf = cell.take();
        buf.push_str(msg);
        buf.push('\n');

        if buf.len() > 20 * 1024 * 1024 {
            buf.clear();
            buf.push_str("[truncated output]\n");
        }

        cell.set(buf);
    });
}

/// Take everything logged on this thread so far, leaving the buffer empty.
pub fn take_output() -> String {
    OUTPUT.with(Cell::take)
}
