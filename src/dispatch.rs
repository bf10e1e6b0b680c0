//! The host side of the callback table: turns raw handles back into tree builder nodes.
use std::cell::RefCell;
use std::os::raw::{c_int, c_void};

use crate::capi::{self, Callbacks, RawHandle, StrSlice, NULL_HANDLE, STATUS_ABORTED, STATUS_OK};
use crate::error::BoxError;
use crate::fault;
use crate::registry::{Handle, HandleRegistry, ReleasePolicy};
use crate::tree_builder::{QuirksMode, TreeBuilder};
use crate::utils::trace_log;

/// What the parser's `user_data` points to.
pub(crate) struct Bridge<B: TreeBuilder> {
    pub(crate) builder: RefCell<B>,
    pub(crate) registry: RefCell<HandleRegistry<B::Node>>,
}

impl<B: TreeBuilder> Bridge<B> {
    pub(crate) fn new(builder: B, policy: ReleasePolicy) -> Self {
        Bridge {
            builder: RefCell::new(builder),
            registry: RefCell::new(HandleRegistry::new(policy)),
        }
    }

    /// # Safety
    ///
    /// `user_data` must be the pointer the session passed to `new_parser`, and the bridge must
    /// still be alive.
    unsafe fn from_user_data<'a>(user_data: *mut c_void) -> &'a Self {
        // SAFETY: forwarded to the caller
        unsafe { &*(user_data as *const Self) }
    }

    pub(crate) fn register(&self, node: B::Node) -> RawHandle {
        self.registry.borrow_mut().register(node).into_raw()
    }

    /// Clone the node out of the registry, so the registry is not borrowed while the builder
    /// runs.
    fn node(&self, raw: RawHandle) -> B::Node {
        match Handle::from_raw(raw) {
            Some(handle) => self.registry.borrow().resolve(handle).clone(),
            None => panic!("contract violation: null handle passed to a tree operation"),
        }
    }

    fn release(&self, raw: RawHandle) {
        let Some(handle) = Handle::from_raw(raw) else {
            panic!("contract violation: null handle released");
        };
        let released = self.registry.borrow_mut().release(handle);
        // a backend node may have a Drop impl of its own, run it without the registry borrowed
        drop(released);
    }

    pub(crate) fn callbacks() -> Callbacks {
        Callbacks {
            new_element: new_element::<B>,
            element_add_template_contents: element_add_template_contents::<B>,
            element_add_attribute_if_missing: element_add_attribute_if_missing::<B>,
            new_comment: new_comment::<B>,
            append_doctype_to_document: append_doctype_to_document::<B>,
            append_node: append_node::<B>,
            append_text: append_text::<B>,
            insert_node_before_sibling: insert_node_before_sibling::<B>,
            insert_text_before_sibling: insert_text_before_sibling::<B>,
            reparent_children: reparent_children::<B>,
            remove_from_parent: remove_from_parent::<B>,
            release_node: Some(release_node::<B>),
            parse_error: Some(parse_error::<B>),
            set_quirks_mode: Some(set_quirks_mode::<B>),
        }
    }
}

/// # Safety
///
/// Same as [`StrSlice::as_str`].
unsafe fn text<'a>(slice: StrSlice) -> Result<&'a str, BoxError> {
    // SAFETY: forwarded to the caller
    Ok(unsafe { slice.as_str() }?)
}

fn status(result: Result<(), BoxError>) -> Result<c_int, BoxError> {
    result.map(|()| STATUS_OK)
}

fn inserted(result: Result<bool, BoxError>) -> Result<c_int, BoxError> {
    result.map(c_int::from)
}

unsafe extern "C" fn new_element<B: TreeBuilder>(
    user_data: *mut c_void,
    ns: StrSlice,
    local: StrSlice,
) -> RawHandle {
    fault::barrier("new_element", NULL_HANDLE, || {
        // SAFETY: the parser passes back the pointer and strings it got
        let (bridge, ns, local) =
            unsafe { (Bridge::<B>::from_user_data(user_data), text(ns)?, text(local)?) };
        trace_log!("new_element {{{}}}{}", ns, local);
        let node = bridge.builder.borrow_mut().new_element(ns, local)?;
        Ok(bridge.register(node))
    })
}

unsafe extern "C" fn element_add_template_contents<B: TreeBuilder>(
    user_data: *mut c_void,
    element: RawHandle,
) -> RawHandle {
    fault::barrier("element_add_template_contents", NULL_HANDLE, || {
        // SAFETY: see above
        let bridge = unsafe { Bridge::<B>::from_user_data(user_data) };
        trace_log!("element_add_template_contents {:#x}", element);
        let element = bridge.node(element);
        let contents = bridge
            .builder
            .borrow_mut()
            .element_add_template_contents(&element)?;
        Ok(bridge.register(contents))
    })
}

unsafe extern "C" fn element_add_attribute_if_missing<B: TreeBuilder>(
    user_data: *mut c_void,
    element: RawHandle,
    ns: StrSlice,
    local: StrSlice,
    value: StrSlice,
) -> c_int {
    fault::barrier("element_add_attribute_if_missing", STATUS_ABORTED, || {
        // SAFETY: see above
        let (bridge, ns, local, value) = unsafe {
            (
                Bridge::<B>::from_user_data(user_data),
                text(ns)?,
                text(local)?,
                text(value)?,
            )
        };
        trace_log!(
            "element_add_attribute_if_missing {:#x} {{{}}}{}={:?}",
            element,
            ns,
            local,
            value
        );
        let element = bridge.node(element);
        status(
            bridge
                .builder
                .borrow_mut()
                .element_add_attribute_if_missing(&element, ns, local, value),
        )
    })
}

unsafe extern "C" fn new_comment<B: TreeBuilder>(
    user_data: *mut c_void,
    data: StrSlice,
) -> RawHandle {
    fault::barrier("new_comment", NULL_HANDLE, || {
        // SAFETY: see above
        let (bridge, data) = unsafe { (Bridge::<B>::from_user_data(user_data), text(data)?) };
        trace_log!("new_comment {:?}", data);
        let node = bridge.builder.borrow_mut().new_comment(data)?;
        Ok(bridge.register(node))
    })
}

unsafe extern "C" fn append_doctype_to_document<B: TreeBuilder>(
    user_data: *mut c_void,
    document: RawHandle,
    name: StrSlice,
    public_id: StrSlice,
    system_id: StrSlice,
) -> c_int {
    fault::barrier("append_doctype_to_document", STATUS_ABORTED, || {
        // SAFETY: see above
        let (bridge, name, public_id, system_id) = unsafe {
            (
                Bridge::<B>::from_user_data(user_data),
                text(name)?,
                text(public_id)?,
                text(system_id)?,
            )
        };
        trace_log!("append_doctype_to_document {:?} {:?} {:?}", name, public_id, system_id);
        let document = bridge.node(document);
        status(
            bridge
                .builder
                .borrow_mut()
                .append_doctype_to_document(&document, name, public_id, system_id),
        )
    })
}

unsafe extern "C" fn append_node<B: TreeBuilder>(
    user_data: *mut c_void,
    parent: RawHandle,
    child: RawHandle,
) -> c_int {
    fault::barrier("append_node", STATUS_ABORTED, || {
        // SAFETY: see above
        let bridge = unsafe { Bridge::<B>::from_user_data(user_data) };
        trace_log!("append_node {:#x} {:#x}", parent, child);
        let (parent, child) = (bridge.node(parent), bridge.node(child));
        status(bridge.builder.borrow_mut().append_node(&parent, &child))
    })
}

unsafe extern "C" fn append_text<B: TreeBuilder>(
    user_data: *mut c_void,
    parent: RawHandle,
    data: StrSlice,
) -> c_int {
    fault::barrier("append_text", STATUS_ABORTED, || {
        // SAFETY: see above
        let (bridge, data) = unsafe { (Bridge::<B>::from_user_data(user_data), text(data)?) };
        trace_log!("append_text {:#x} {:?}", parent, data);
        let parent = bridge.node(parent);
        status(bridge.builder.borrow_mut().append_text(&parent, data))
    })
}

unsafe extern "C" fn insert_node_before_sibling<B: TreeBuilder>(
    user_data: *mut c_void,
    sibling: RawHandle,
    new_node: RawHandle,
) -> c_int {
    fault::barrier("insert_node_before_sibling", STATUS_ABORTED, || {
        // SAFETY: see above
        let bridge = unsafe { Bridge::<B>::from_user_data(user_data) };
        trace_log!("insert_node_before_sibling {:#x} {:#x}", sibling, new_node);
        let (sibling, new_node) = (bridge.node(sibling), bridge.node(new_node));
        inserted(
            bridge
                .builder
                .borrow_mut()
                .insert_node_before_sibling(&sibling, &new_node),
        )
    })
}

unsafe extern "C" fn insert_text_before_sibling<B: TreeBuilder>(
    user_data: *mut c_void,
    sibling: RawHandle,
    data: StrSlice,
) -> c_int {
    fault::barrier("insert_text_before_sibling", STATUS_ABORTED, || {
        // SAFETY: see above
        let (bridge, data) = unsafe { (Bridge::<B>::from_user_data(user_data), text(data)?) };
        trace_log!("insert_text_before_sibling {:#x} {:?}", sibling, data);
        let sibling = bridge.node(sibling);
        inserted(
            bridge
                .builder
                .borrow_mut()
                .insert_text_before_sibling(&sibling, data),
        )
    })
}

unsafe extern "C" fn reparent_children<B: TreeBuilder>(
    user_data: *mut c_void,
    node: RawHandle,
    new_parent: RawHandle,
) -> c_int {
    fault::barrier("reparent_children", STATUS_ABORTED, || {
        // SAFETY: see above
        let bridge = unsafe { Bridge::<B>::from_user_data(user_data) };
        trace_log!("reparent_children {:#x} {:#x}", node, new_parent);
        let (node, new_parent) = (bridge.node(node), bridge.node(new_parent));
        status(
            bridge
                .builder
                .borrow_mut()
                .reparent_children(&node, &new_parent),
        )
    })
}

unsafe extern "C" fn remove_from_parent<B: TreeBuilder>(
    user_data: *mut c_void,
    node: RawHandle,
) -> c_int {
    fault::barrier("remove_from_parent", STATUS_ABORTED, || {
        // SAFETY: see above
        let bridge = unsafe { Bridge::<B>::from_user_data(user_data) };
        trace_log!("remove_from_parent {:#x}", node);
        let node = bridge.node(node);
        status(bridge.builder.borrow_mut().remove_from_parent(&node))
    })
}

unsafe extern "C" fn release_node<B: TreeBuilder>(user_data: *mut c_void, node: RawHandle) {
    fault::barrier("release_node", (), || {
        // SAFETY: see above
        let bridge = unsafe { Bridge::<B>::from_user_data(user_data) };
        trace_log!("release_node {:#x}", node);
        bridge.release(node);
        Ok(())
    })
}

unsafe extern "C" fn parse_error<B: TreeBuilder>(
    user_data: *mut c_void,
    message: StrSlice,
) -> c_int {
    fault::barrier("parse_error", STATUS_ABORTED, || {
        // SAFETY: see above
        let (bridge, message) = unsafe { (Bridge::<B>::from_user_data(user_data), text(message)?) };
        status(bridge.builder.borrow_mut().parse_error(message))
    })
}

unsafe extern "C" fn set_quirks_mode<B: TreeBuilder>(
    user_data: *mut c_void,
    document: RawHandle,
    mode: c_int,
) -> c_int {
    fault::barrier("set_quirks_mode", STATUS_ABORTED, || {
        // SAFETY: see above
        let bridge = unsafe { Bridge::<B>::from_user_data(user_data) };
        let mode = match mode {
            capi::QUIRKS_MODE_NO_QUIRKS => QuirksMode::NoQuirks,
            capi::QUIRKS_MODE_LIMITED_QUIRKS => QuirksMode::LimitedQuirks,
            capi::QUIRKS_MODE_QUIRKS => QuirksMode::Quirks,
            other => return Err(format!("unknown quirks mode {}", other).into()),
        };
        trace_log!("set_quirks_mode {:#x} {:?}", document, mode);
        let document = bridge.node(document);
        status(bridge.builder.borrow_mut().set_quirks_mode(&document, mode))
    })
}
