use std::cell::Ref;
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;
use std::thread;

use crate::capi::{self, ParserOptions};
use crate::dispatch::Bridge;
use crate::dom::{self, DomBuilder};
use crate::error::Error;
use crate::fault;
use crate::registry::ReleasePolicy;
use crate::tree_builder::TreeBuilder;
use crate::utils::trace_log;

/// Where a [`Session`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, nothing fed yet.
    Created,
    /// At least one chunk was fed.
    Feeding,
    /// [`Session::end`] returned the document.
    Ended,
    /// [`Session::feed`] or [`Session::end`] returned an error. The session can only be dropped.
    Failed,
    /// The parser was torn down. Only observable from inside `Drop`.
    Destroyed,
}

/// Knobs for a [`Session`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct SessionOptions {
    /// When nodes the parser no longer references are let go of.
    pub release_policy: ReleasePolicy,
    /// Passed through to the parser.
    pub parser: ParserOptions,
}

impl SessionOptions {
    /// Set [`SessionOptions::release_policy`].
    #[must_use]
    pub fn release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    /// Set [`SessionOptions::parser`].
    #[must_use]
    pub fn parser(mut self, options: ParserOptions) -> Self {
        self.parser = options;
        self
    }
}

/// One parse of one document, from the first byte to the finished tree.
///
/// A session owns a parser instance and a [`TreeBuilder`]. Input is pushed in with
/// [`Session::feed`], in chunks of any size, split anywhere (even inside a UTF-8 sequence). The
/// tree is built while feeding. [`Session::end`] flushes the parser and hands out the document.
///
/// ```
/// use html5bridge::{dom, Session};
///
/// let mut session = Session::new()?;
/// session.feed("<title>hi</tit")?;
/// session.feed("le><p>there")?;
/// let document = session.end()?;
/// assert_eq!(
///     dom::dump(&document),
///     concat!(
///         "| <html>\n|   <head>\n|     <title>\n|       \"hi\"\n",
///         "|   <body>\n|     <p>\n|       \"there\"\n",
///     )
/// );
/// # Ok::<(), html5bridge::Error>(())
/// ```
///
/// A session is neither `Send` nor `Sync`: the parser calls back into the tree builder on the
/// thread that feeds it.
pub struct Session<B: TreeBuilder = DomBuilder> {
    parser: NonNull<capi::Parser>,
    bridge: NonNull<Bridge<B>>,
    document: B::Node,
    state: SessionState,
}

impl Session<DomBuilder> {
    /// Create a session building a [`dom`] tree.
    pub fn new() -> Result<Self, Error> {
        Session::with_tree_builder(DomBuilder::new())
    }
}

impl<B: TreeBuilder> Session<B> {
    /// Create a session building its tree with `builder`.
    pub fn with_tree_builder(builder: B) -> Result<Self, Error> {
        Session::with_options(builder, SessionOptions::default())
    }

    /// Create a session building its tree with `builder`, configured by `options`.
    ///
    /// Calls [`TreeBuilder::new_document`] right away, an error from it is returned as
    /// [`Error::HostCallback`].
    pub fn with_options(mut builder: B, options: SessionOptions) -> Result<Self, Error> {
        let document = builder
            .new_document()
            .map_err(|source| Error::HostCallback {
                callback: "new_document",
                source,
            })?;

        let bridge = Box::new(Bridge::new(builder, options.release_policy));
        let document_handle = bridge.register(document.clone());
        let bridge = NonNull::from(Box::leak(bridge));
        let callbacks = Bridge::<B>::callbacks();

        // SAFETY: the callbacks are only ever handed `bridge`, which outlives the parser
        let parser = unsafe {
            capi::new_parser(
                &callbacks,
                bridge.as_ptr().cast::<c_void>(),
                document_handle,
                &options.parser,
            )
        };

        let Some(parser) = NonNull::new(parser) else {
            // SAFETY: leaked above, never shared since the parser does not exist
            drop(unsafe { Box::from_raw(bridge.as_ptr()) });
            return Err(Error::ConstructionFailure);
        };

        trace_log!("session: created with {:?}", options);
        Ok(Session {
            parser,
            bridge,
            document,
            state: SessionState::Created,
        })
    }

    /// Parse another chunk of input.
    ///
    /// # Panics
    ///
    /// After [`Session::end`] or after an error was returned: that is a precondition violation.
    /// A panic inside the tree builder is resumed from here, with its original payload.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Result<(), Error> {
        match self.state {
            SessionState::Created | SessionState::Feeding => {}
            state => panic!("precondition violation: feed() on a session that is {:?}", state),
        }
        self.state = SessionState::Feeding;

        let chunk = chunk.as_ref();
        trace_log!("session: feeding {} bytes", chunk.len());
        // SAFETY: the parser is alive until drop
        let status =
            unsafe { capi::feed_parser(self.parser.as_ptr(), chunk.as_ptr(), chunk.len()) };
        self.check("feed", status)
    }

    /// Finish parsing and return the document.
    ///
    /// Every handle the parser held is released, under both [`ReleasePolicy`]s.
    ///
    /// # Panics
    ///
    /// If called twice, or after an error was returned.
    pub fn end(&mut self) -> Result<B::Node, Error> {
        match self.state {
            SessionState::Created | SessionState::Feeding => {}
            SessionState::Ended => panic!("precondition violation: end() called twice"),
            state => panic!("precondition violation: end() on a session that is {:?}", state),
        }

        // SAFETY: the parser is alive until drop
        let status = unsafe { capi::end_parser(self.parser.as_ptr()) };
        self.check("end", status)?;

        self.state = SessionState::Ended;
        self.bridge().registry.borrow_mut().clear();
        trace_log!("session: ended");
        Ok(self.document.clone())
    }

    /// Tear the session down, returning any error that the tree builder raised while the parser
    /// was releasing its handles. Dropping the session does the same but discards that error.
    pub fn destroy(mut self) -> Result<(), Error> {
        match self.teardown() {
            Some(fault) => Err(fault.raise()),
            None => Ok(()),
        }
    }

    /// The session's current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The document node, complete only after [`Session::end`].
    pub fn document(&self) -> &B::Node {
        &self.document
    }

    /// The tree builder, e.g. to inspect what it collected.
    ///
    /// # Panics
    ///
    /// When called from inside one of the tree builder's own operations.
    pub fn tree_builder(&self) -> Ref<'_, B> {
        self.bridge().builder.borrow()
    }

    /// How many nodes the session keeps alive on the parser's behalf.
    pub fn live_handles(&self) -> usize {
        self.bridge().registry.borrow().len()
    }

    fn bridge(&self) -> &Bridge<B> {
        // SAFETY: freed only in teardown, which also takes the parser out of service
        unsafe { self.bridge.as_ref() }
    }

    // The one place where faults captured inside callbacks come back out.
    fn check(&mut self, operation: &'static str, status: c_int) -> Result<(), Error> {
        if let Some(fault) = fault::take() {
            trace_log!("session: {} raised a fault from {}", operation, fault.callback);
            self.state = SessionState::Failed;
            return Err(fault.raise());
        }

        if status < 0 {
            trace_log!("session: {} failed with status {}", operation, status);
            self.state = SessionState::Failed;
            return Err(Error::ForeignFault { operation, status });
        }

        Ok(())
    }

    fn teardown(&mut self) -> Option<fault::Fault> {
        if self.state == SessionState::Destroyed {
            return None;
        }
        self.state = SessionState::Destroyed;

        // a fault from an earlier call was already raised, anything pending now came from the
        // parser releasing its handles
        // SAFETY: the parser is destroyed exactly once, here
        unsafe { capi::destroy_parser(self.parser.as_ptr()) };
        let fault = fault::take();

        // SAFETY: the parser is gone, nothing refers to the bridge anymore
        drop(unsafe { Box::from_raw(self.bridge.as_ptr()) });
        trace_log!("session: destroyed");
        fault
    }
}

impl<B: TreeBuilder> Drop for Session<B> {
    fn drop(&mut self) {
        let Some(fault) = self.teardown() else {
            return;
        };

        if thread::panicking() {
            trace_log!("session: discarding a fault from {} while unwinding", fault.callback);
            return;
        }

        match fault.kind {
            fault::FaultKind::Panic(payload) => std::panic::resume_unwind(payload),
            fault::FaultKind::Error(_error) => {
                trace_log!("session: discarding error from {}: {}", fault.callback, _error);
            }
        }
    }
}

/// Parse a complete document into a [`dom`] tree.
///
/// ```
/// let document = html5bridge::parse(b"<!DOCTYPE html><body>x").unwrap();
/// assert_eq!(
///     html5bridge::dom::dump(&document),
///     "| <!DOCTYPE html>\n| <html>\n|   <head>\n|   <body>\n|     \"x\"\n"
/// );
/// ```
pub fn parse(input: impl AsRef<[u8]>) -> Result<dom::Handle, Error> {
    parse_with(DomBuilder::new(), input)
}

/// Parse a complete document with any tree builder.
pub fn parse_with<B: TreeBuilder>(builder: B, input: impl AsRef<[u8]>) -> Result<B::Node, Error> {
    let mut session = Session::with_tree_builder(builder)?;
    session.feed(input)?;
    session.end()
}
