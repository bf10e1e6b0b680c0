//! The parser side of the boundary: html5ever behind a C ABI.
//!
//! html5ever's tree builder wants a [`TreeSink`] that owns the tree. This module implements one
//! that owns nothing: every tree mutation is forwarded through a table of [`Callbacks`] to
//! whoever created the parser, and every node is an opaque [`RawHandle`] chosen by them.
//!
//! The protocol, from the point of view of the callback implementor:
//!
//! * Strings are passed as [`StrSlice`]s: a pointer and a length, always valid UTF-8, never
//!   NUL-terminated. They are only valid for the duration of the call.
//! * Callbacks creating nodes return a fresh non-zero handle. The parser holds exactly one
//!   reference per handle it received and reports dropping it through `release_node`.
//! * Returning [`NULL_HANDLE`] or a negative status from any callback aborts the parse: the parser
//!   stops calling back, and the current and all later `feed_parser`/`end_parser` calls return
//!   [`STATUS_ABORTED`].
//! * The `insert_*_before_sibling` callbacks return `1` if they inserted and `0` if the sibling was
//!   detached, in which case the parser falls back to appending somewhere else.
//!
//! [`crate::Session`] is the safe host-side wrapper around all of this.
use std::borrow::Cow;
use std::cell::{Cell, OnceCell};
use std::fmt;
use std::os::raw::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;
use std::slice;
use std::str;

use html5ever::driver::{self, ParseOpts};
use html5ever::interface::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::tendril::stream::Utf8LossyDecoder;
use html5ever::tendril::{ByteTendril, StrTendril, TendrilSink};
use html5ever::{Attribute, ExpandedName, LocalName, Namespace, QualName};

use crate::utils::trace_log;

/// A node handle on the wire.
pub type RawHandle = u64;

/// Returned by callbacks instead of a handle to abort the parse.
pub const NULL_HANDLE: RawHandle = 0;

/// Success.
pub const STATUS_OK: c_int = 0;
/// A callback returned a failure sentinel, the parse was aborted.
pub const STATUS_ABORTED: c_int = -1;
/// The parser itself panicked. It is unusable from now on.
pub const STATUS_PANICKED: c_int = -2;
/// Null pointers were passed, or the parser already ended.
pub const STATUS_INVALID: c_int = -3;

/// `set_quirks_mode`: no quirks.
pub const QUIRKS_MODE_NO_QUIRKS: c_int = 0;
/// `set_quirks_mode`: limited quirks.
pub const QUIRKS_MODE_LIMITED_QUIRKS: c_int = 1;
/// `set_quirks_mode`: full quirks.
pub const QUIRKS_MODE_QUIRKS: c_int = 2;

/// A borrowed UTF-8 string.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StrSlice {
    /// Start of the string. May be dangling or null if `len` is zero.
    pub ptr: *const u8,
    /// Length in bytes.
    pub len: usize,
}

impl StrSlice {
    /// Borrow `s` for the duration of a call.
    pub fn new(s: &str) -> Self {
        StrSlice {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    /// View the bytes as a string.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that stay alive and unchanged for `'a`.
    pub unsafe fn as_str<'a>(self) -> Result<&'a str, str::Utf8Error> {
        // SAFETY: forwarded to the caller
        str::from_utf8(unsafe { bytes_from_raw(self.ptr, self.len) })
    }
}

/// An empty slice must not be built from a null pointer, C callers like to pass one anyway.
unsafe fn bytes_from_raw<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    if len == 0 || ptr.is_null() {
        return &[];
    }
    // SAFETY: forwarded to the caller
    unsafe { slice::from_raw_parts(ptr, len) }
}

/// The table of functions the parser calls back into. Every function receives the `user_data`
/// pointer that was given to [`new_parser`] as its first argument.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Callbacks {
    /// Create an element from its namespace and local name.
    pub new_element:
        unsafe extern "C" fn(user_data: *mut c_void, ns: StrSlice, local: StrSlice) -> RawHandle,

    /// Create the template contents fragment of an element. Called at most once per element.
    pub element_add_template_contents:
        unsafe extern "C" fn(user_data: *mut c_void, element: RawHandle) -> RawHandle,

    /// Set an attribute unless it is already present.
    pub element_add_attribute_if_missing: unsafe extern "C" fn(
        user_data: *mut c_void,
        element: RawHandle,
        ns: StrSlice,
        local: StrSlice,
        value: StrSlice,
    ) -> c_int,

    /// Create a comment.
    pub new_comment: unsafe extern "C" fn(user_data: *mut c_void, data: StrSlice) -> RawHandle,

    /// Append a doctype to the document.
    pub append_doctype_to_document: unsafe extern "C" fn(
        user_data: *mut c_void,
        document: RawHandle,
        name: StrSlice,
        public_id: StrSlice,
        system_id: StrSlice,
    ) -> c_int,

    /// Append a detached node to a parent.
    pub append_node:
        unsafe extern "C" fn(user_data: *mut c_void, parent: RawHandle, child: RawHandle) -> c_int,

    /// Append text to a parent, merging it with a trailing text node.
    pub append_text:
        unsafe extern "C" fn(user_data: *mut c_void, parent: RawHandle, data: StrSlice) -> c_int,

    /// Insert a node before a sibling. `1`: inserted, `0`: the sibling is detached.
    pub insert_node_before_sibling: unsafe extern "C" fn(
        user_data: *mut c_void,
        sibling: RawHandle,
        new_node: RawHandle,
    ) -> c_int,

    /// Insert text before a sibling. `1`: inserted, `0`: the sibling is detached.
    pub insert_text_before_sibling:
        unsafe extern "C" fn(user_data: *mut c_void, sibling: RawHandle, data: StrSlice) -> c_int,

    /// Move all children of a node to the end of another one.
    pub reparent_children: unsafe extern "C" fn(
        user_data: *mut c_void,
        node: RawHandle,
        new_parent: RawHandle,
    ) -> c_int,

    /// Detach a node from its parent.
    pub remove_from_parent: unsafe extern "C" fn(user_data: *mut c_void, node: RawHandle) -> c_int,

    /// The parser dropped its reference to a handle. If not provided, handles are never released.
    pub release_node: Option<unsafe extern "C" fn(user_data: *mut c_void, node: RawHandle)>,

    /// Report an author conformance error. If not provided, errors are ignored.
    pub parse_error:
        Option<unsafe extern "C" fn(user_data: *mut c_void, message: StrSlice) -> c_int>,

    /// Report the document's quirks mode, one of the `QUIRKS_MODE_*` constants. If not provided,
    /// the quirks mode is not reported.
    pub set_quirks_mode: Option<
        unsafe extern "C" fn(user_data: *mut c_void, document: RawHandle, mode: c_int) -> c_int,
    >,
}

/// Parser configuration, see html5ever's `TreeBuilderOpts`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserOptions {
    /// Parse `<noscript>` as if scripting was enabled. Default: `true`.
    pub scripting_enabled: bool,
    /// Report all parse errors with detailed messages, at some performance cost. Default: `false`.
    pub exact_errors: bool,
    /// The document is an `<iframe srcdoc>` document. Default: `false`.
    pub iframe_srcdoc: bool,
    /// Do not append the doctype to the document. Default: `false`.
    pub drop_doctype: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions {
            scripting_enabled: true,
            exact_errors: false,
            iframe_srcdoc: false,
            drop_doctype: false,
        }
    }
}

impl From<ParserOptions> for ParseOpts {
    fn from(options: ParserOptions) -> ParseOpts {
        let mut opts = ParseOpts::default();
        opts.tokenizer.exact_errors = options.exact_errors;
        opts.tree_builder.exact_errors = options.exact_errors;
        opts.tree_builder.scripting_enabled = options.scripting_enabled;
        opts.tree_builder.iframe_srcdoc = options.iframe_srcdoc;
        opts.tree_builder.drop_doctype = options.drop_doctype;
        opts
    }
}

/// What every handle and the sink share: the way back to the host.
struct Link {
    callbacks: Callbacks,
    user_data: *mut c_void,
    aborted: Cell<bool>,
}

impl Link {
    fn abort(&self) {
        if !self.aborted.replace(true) {
            trace_log!("capi: a callback returned a failure sentinel, aborting");
        }
    }

    fn check_handle(&self, raw: RawHandle) -> RawHandle {
        if raw == NULL_HANDLE {
            self.abort();
        }
        raw
    }

    fn check_status(&self, status: c_int) -> c_int {
        if status < 0 {
            self.abort();
        }
        status
    }
}

macro_rules! invoke {
    ($link:expr, $callback:ident ( $( $arg:expr ),* ) else $aborted:expr) => {{
        let link: &Link = &$link;
        if link.aborted.get() {
            $aborted
        } else {
            // SAFETY: the callbacks and the user data were handed to `new_parser` together, whoever
            // did that vouched for them.
            unsafe { (link.callbacks.$callback)(link.user_data $(, $arg)*) }
        }
    }};
    ($link:expr, ?$callback:ident ( $( $arg:expr ),* ) else $default:expr) => {{
        let link: &Link = &$link;
        match link.callbacks.$callback {
            Some(callback) if !link.aborted.get() => {
                // SAFETY: see above
                unsafe { callback(link.user_data $(, $arg)*) }
            }
            _ => $default,
        }
    }};
}

struct NodeRef {
    id: RawHandle,
    name: QualName,
    mathml_annotation_xml_integration_point: bool,
    template_contents: OnceCell<NodeHandle>,
    link: Rc<Link>,
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        if self.id == NULL_HANDLE {
            return;
        }
        if let Some(release_node) = self.link.callbacks.release_node {
            // SAFETY: see `invoke!`
            unsafe { release_node(self.link.user_data, self.id) }
        }
    }
}

/// The parser's reference to a host node. Clones share the one reference held on the host.
#[derive(Clone)]
struct NodeHandle(Rc<NodeRef>);

impl NodeHandle {
    fn id(&self) -> RawHandle {
        self.0.id
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({:#x} {:?})", self.0.id, self.0.name.local)
    }
}

fn empty_name() -> QualName {
    QualName::new(None, Namespace::from(""), LocalName::from(""))
}

struct CallbackTreeSink {
    link: Rc<Link>,
    document: NodeHandle,
    quirks_mode: Cell<QuirksMode>,
}

impl CallbackTreeSink {
    fn new_handle(
        &self,
        id: RawHandle,
        name: Option<QualName>,
        mathml_integration: bool,
    ) -> NodeHandle {
        NodeHandle(Rc::new(NodeRef {
            id: self.link.check_handle(id),
            name: name.unwrap_or_else(empty_name),
            mathml_annotation_xml_integration_point: mathml_integration,
            template_contents: OnceCell::new(),
            link: self.link.clone(),
        }))
    }

    fn insert_before_sibling(
        &self,
        sibling: &NodeHandle,
        child: NodeOrText<NodeHandle>,
    ) -> Result<(), NodeOrText<NodeHandle>> {
        let status = match child {
            NodeOrText::AppendNode(ref node) => invoke!(
                self.link,
                insert_node_before_sibling(sibling.id(), node.id()) else STATUS_ABORTED
            ),
            NodeOrText::AppendText(ref text) => invoke!(
                self.link,
                insert_text_before_sibling(sibling.id(), StrSlice::new(text)) else STATUS_ABORTED
            ),
        };

        match self.link.check_status(status) {
            0 => Err(child),
            _ => Ok(()),
        }
    }
}

impl TreeSink for CallbackTreeSink {
    type Handle = NodeHandle;
    type Output = ();
    type ElemName<'a> = ExpandedName<'a> where Self: 'a;

    fn finish(self) {}

    fn parse_error(&self, msg: Cow<'static, str>) {
        trace_log!("capi: parse error: {}", msg);
        let status = invoke!(self.link, ?parse_error(StrSlice::new(&msg)) else STATUS_OK);
        self.link.check_status(status);
    }

    fn get_document(&self) -> NodeHandle {
        self.document.clone()
    }

    fn elem_name<'a>(&'a self, target: &'a NodeHandle) -> ExpandedName<'a> {
        target.0.name.expanded()
    }

    fn create_element(
        &self,
        name: QualName,
        attrs: Vec<Attribute>,
        flags: ElementFlags,
    ) -> NodeHandle {
        let id = invoke!(
            self.link,
            new_element(StrSlice::new(&name.ns), StrSlice::new(&name.local)) else NULL_HANDLE
        );
        let element = self.new_handle(
            id,
            Some(name),
            flags.mathml_annotation_xml_integration_point,
        );
        self.add_attrs_if_missing(&element, attrs);
        if flags.template {
            self.get_template_contents(&element);
        }
        element
    }

    fn create_comment(&self, text: StrTendril) -> NodeHandle {
        let id = invoke!(self.link, new_comment(StrSlice::new(&text)) else NULL_HANDLE);
        self.new_handle(id, None, false)
    }

    fn create_pi(&self, target: StrTendril, data: StrTendril) -> NodeHandle {
        // the HTML tokenizer turns `<?...>` into a bogus comment, this is never reached for HTML
        trace_log!("capi: processing instruction {:?} {:?} kept as a comment", target, data);
        let data = format!("?{} {}", target, data);
        let id = invoke!(self.link, new_comment(StrSlice::new(&data)) else NULL_HANDLE);
        self.new_handle(id, None, false)
    }

    fn append(&self, parent: &NodeHandle, child: NodeOrText<NodeHandle>) {
        let status = match child {
            NodeOrText::AppendNode(node) => {
                invoke!(self.link, append_node(parent.id(), node.id()) else STATUS_ABORTED)
            }
            NodeOrText::AppendText(text) => invoke!(
                self.link,
                append_text(parent.id(), StrSlice::new(&text)) else STATUS_ABORTED
            ),
        };
        self.link.check_status(status);
    }

    fn append_based_on_parent_node(
        &self,
        element: &NodeHandle,
        prev_element: &NodeHandle,
        child: NodeOrText<NodeHandle>,
    ) {
        if let Err(child) = self.insert_before_sibling(element, child) {
            self.append(prev_element, child);
        }
    }

    fn append_doctype_to_document(
        &self,
        name: StrTendril,
        public_id: StrTendril,
        system_id: StrTendril,
    ) {
        let status = invoke!(
            self.link,
            append_doctype_to_document(
                self.document.id(),
                StrSlice::new(&name),
                StrSlice::new(&public_id),
                StrSlice::new(&system_id)
            ) else STATUS_ABORTED
        );
        self.link.check_status(status);
    }

    fn get_template_contents(&self, target: &NodeHandle) -> NodeHandle {
        target
            .0
            .template_contents
            .get_or_init(|| {
                let id = invoke!(
                    self.link,
                    element_add_template_contents(target.id()) else NULL_HANDLE
                );
                self.new_handle(id, None, false)
            })
            .clone()
    }

    fn same_node(&self, x: &NodeHandle, y: &NodeHandle) -> bool {
        Rc::ptr_eq(&x.0, &y.0)
    }

    fn set_quirks_mode(&self, mode: QuirksMode) {
        self.quirks_mode.set(mode);
        let raw = match mode {
            QuirksMode::NoQuirks => QUIRKS_MODE_NO_QUIRKS,
            QuirksMode::LimitedQuirks => QUIRKS_MODE_LIMITED_QUIRKS,
            QuirksMode::Quirks => QUIRKS_MODE_QUIRKS,
        };
        let status =
            invoke!(self.link, ?set_quirks_mode(self.document.id(), raw) else STATUS_OK);
        self.link.check_status(status);
    }

    fn append_before_sibling(&self, sibling: &NodeHandle, new_node: NodeOrText<NodeHandle>) {
        if self.insert_before_sibling(sibling, new_node).is_err() {
            // html5ever checks for a parent before it gets here
            trace_log!("capi: {:?} is detached, dropping the new node", sibling);
        }
    }

    fn add_attrs_if_missing(&self, target: &NodeHandle, attrs: Vec<Attribute>) {
        for attr in attrs {
            let status = invoke!(
                self.link,
                element_add_attribute_if_missing(
                    target.id(),
                    StrSlice::new(&attr.name.ns),
                    StrSlice::new(&attr.name.local),
                    StrSlice::new(&attr.value)
                ) else STATUS_ABORTED
            );
            self.link.check_status(status);
        }
    }

    fn remove_from_parent(&self, target: &NodeHandle) {
        let status = invoke!(self.link, remove_from_parent(target.id()) else STATUS_ABORTED);
        self.link.check_status(status);
    }

    fn reparent_children(&self, node: &NodeHandle, new_parent: &NodeHandle) {
        let status = invoke!(
            self.link,
            reparent_children(node.id(), new_parent.id()) else STATUS_ABORTED
        );
        self.link.check_status(status);
    }

    fn is_mathml_annotation_xml_integration_point(&self, handle: &NodeHandle) -> bool {
        handle.0.mathml_annotation_xml_integration_point
    }
}

type Decoder = Utf8LossyDecoder<driver::Parser<CallbackTreeSink>>;

/// An opaque parser instance, see [`new_parser`].
pub struct Parser {
    // `None` once the parser ended or panicked
    decoder: Option<Decoder>,
    link: Rc<Link>,
}

impl Parser {
    fn status(&self) -> c_int {
        if self.link.aborted.get() {
            STATUS_ABORTED
        } else {
            STATUS_OK
        }
    }
}

/// Create a parser that builds its tree through `callbacks`.
///
/// `document` is the handle of the already existing document node; the parser takes over one
/// reference to it. `options` may be null for the defaults. Returns null if `callbacks` is null or
/// `document` is [`NULL_HANDLE`].
///
/// # Safety
///
/// `callbacks` and `options` must be null or point to valid values. The callbacks must be safe to
/// call with `user_data` until [`destroy_parser`] returns.
#[no_mangle]
pub unsafe extern "C" fn new_parser(
    callbacks: *const Callbacks,
    user_data: *mut c_void,
    document: RawHandle,
    options: *const ParserOptions,
) -> *mut Parser {
    // SAFETY: forwarded to the caller
    let (Some(callbacks), options) = (unsafe { callbacks.as_ref() }, unsafe { options.as_ref() })
    else {
        return ptr::null_mut();
    };
    if document == NULL_HANDLE {
        return ptr::null_mut();
    }
    let callbacks = *callbacks;
    let options = options.copied().unwrap_or_default();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let link = Rc::new(Link {
            callbacks,
            user_data,
            aborted: Cell::new(false),
        });
        let sink = CallbackTreeSink {
            document: NodeHandle(Rc::new(NodeRef {
                id: document,
                name: empty_name(),
                mathml_annotation_xml_integration_point: false,
                template_contents: OnceCell::new(),
                link: link.clone(),
            })),
            link: link.clone(),
            quirks_mode: Cell::new(QuirksMode::NoQuirks),
        };
        let decoder = driver::parse_document(sink, options.into()).from_utf8();
        Box::new(Parser {
            decoder: Some(decoder),
            link,
        })
    }));

    match result {
        Ok(parser) => Box::into_raw(parser),
        Err(_) => ptr::null_mut(),
    }
}

/// Run `f` on the parser's decoder, turning panics into [`STATUS_PANICKED`].
fn drive(parser: &mut Parser, f: impl FnOnce(&mut Option<Decoder>)) -> c_int {
    if parser.decoder.is_none() {
        return STATUS_INVALID;
    }
    if parser.link.aborted.get() {
        return STATUS_ABORTED;
    }

    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut parser.decoder))) {
        Ok(()) => parser.status(),
        Err(_) => {
            trace_log!("capi: the parser panicked");
            // the tree builder's state is garbage now
            let decoder = parser.decoder.take();
            let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(decoder)));
            STATUS_PANICKED
        }
    }
}

/// Feed `len` bytes of UTF-8 to the parser. The bytes may end in the middle of a character.
///
/// Returns [`STATUS_OK`] or one of the negative status codes.
///
/// # Safety
///
/// `parser` must come from [`new_parser`] and not be destroyed yet. `ptr` must point to `len`
/// readable bytes, or be null if `len` is zero.
#[no_mangle]
pub unsafe extern "C" fn feed_parser(parser: *mut Parser, ptr: *const u8, len: usize) -> c_int {
    // SAFETY: forwarded to the caller
    let Some(parser) = (unsafe { parser.as_mut() }) else {
        return STATUS_INVALID;
    };
    // SAFETY: forwarded to the caller
    let bytes = unsafe { bytes_from_raw(ptr, len) };

    drive(parser, |decoder| {
        if let Some(decoder) = decoder {
            decoder.process(ByteTendril::from_slice(bytes));
        }
    })
}

/// Finish parsing. All references to handles are released before this returns.
///
/// Returns [`STATUS_OK`] or one of the negative status codes.
///
/// # Safety
///
/// `parser` must come from [`new_parser`] and not be destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn end_parser(parser: *mut Parser) -> c_int {
    // SAFETY: forwarded to the caller
    let Some(parser) = (unsafe { parser.as_mut() }) else {
        return STATUS_INVALID;
    };

    drive(parser, |decoder| {
        if let Some(decoder) = decoder.take() {
            decoder.finish();
        }
    })
}

/// Destroy the parser, releasing every handle it still holds. Null is ignored.
///
/// # Safety
///
/// `parser` must come from [`new_parser`] and not be destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn destroy_parser(parser: *mut Parser) {
    if parser.is_null() {
        return;
    }
    // SAFETY: forwarded to the caller
    let parser = unsafe { Box::from_raw(parser) };
    if panic::catch_unwind(AssertUnwindSafe(move || drop(parser))).is_err() {
        trace_log!("capi: the parser panicked while being destroyed");
    }
}
