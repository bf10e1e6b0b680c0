//! The contract every tree backend implements.
use crate::error::BoxError;

/// The result type of every [`TreeBuilder`] operation.
pub type BuildResult<T> = Result<T, BoxError>;

/// The document's compatibility mode, as decided by the parser from the doctype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuirksMode {
    /// Standards mode.
    #[default]
    NoQuirks,
    /// Limited-quirks ("almost standards") mode.
    LimitedQuirks,
    /// Quirks mode.
    Quirks,
}

/// A tree backend: everything the parser may ask for while it constructs a document.
///
/// The parser only ever sees opaque handles, the actual tree is owned by the implementation of this
/// trait. Any type implementing it can be plugged into a [`crate::Session`], see
/// [`crate::dom::DomBuilder`] for the default and [`crate::etree::EtreeBuilder`] for an
/// ElementTree-style alternative.
///
/// Every operation may fail with an arbitrary error. Returning an error aborts the parse: the
/// session stops calling into the builder and the error is returned from the next
/// [`crate::Session::feed`] or [`crate::Session::end`]. Panics are caught as well and resumed at
/// the same point.
///
/// Namespaces and names are passed exactly as the parser knows them, e.g. `new_element` for a
/// `<p>` receives `"http://www.w3.org/1999/xhtml"` and `"p"`. Attributes without a namespace
/// receive an empty string as `ns`.
pub trait TreeBuilder {
    /// Whatever the parser holds on to through a handle: documents, elements, comments,
    /// template contents.
    type Node: Clone + 'static;

    /// Create the root document. Called exactly once, when the session is constructed.
    fn new_document(&mut self) -> BuildResult<Self::Node>;

    /// Create an element that is not attached to anything yet.
    fn new_element(&mut self, ns: &str, local: &str) -> BuildResult<Self::Node>;

    /// Create the document fragment holding the contents of a `<template>` element.
    ///
    /// The parser calls this at most once per element and remembers the result.
    fn element_add_template_contents(&mut self, element: &Self::Node) -> BuildResult<Self::Node>;

    /// Set an attribute, unless the element already has one with the same name.
    ///
    /// The first value always wins, duplicate attributes are dropped.
    fn element_add_attribute_if_missing(
        &mut self,
        element: &Self::Node,
        ns: &str,
        local: &str,
        value: &str,
    ) -> BuildResult<()>;

    /// Create a comment that is not attached to anything yet.
    fn new_comment(&mut self, data: &str) -> BuildResult<Self::Node>;

    /// Append a doctype to the document.
    fn append_doctype_to_document(
        &mut self,
        document: &Self::Node,
        name: &str,
        public_id: &str,
        system_id: &str,
    ) -> BuildResult<()>;

    /// Append `child` as the last child of `parent`. `child` is always detached at this point.
    fn append_node(&mut self, parent: &Self::Node, child: &Self::Node) -> BuildResult<()>;

    /// Append text to `parent`.
    ///
    /// If the last child of `parent` is a text node, `data` has to be appended to it instead of
    /// creating a new one: two text nodes are never adjacent siblings.
    fn append_text(&mut self, parent: &Self::Node, data: &str) -> BuildResult<()>;

    /// Insert `new_node` immediately before `sibling`.
    ///
    /// Returns `false` without touching the tree if `sibling` has no parent. That is expected to
    /// happen during table foster parenting, the parser then appends the node somewhere else.
    fn insert_node_before_sibling(
        &mut self,
        sibling: &Self::Node,
        new_node: &Self::Node,
    ) -> BuildResult<bool>;

    /// Insert text immediately before `sibling`, merging it into a preceding text node if there
    /// is one. Same return value as [`TreeBuilder::insert_node_before_sibling`].
    fn insert_text_before_sibling(&mut self, sibling: &Self::Node, data: &str)
        -> BuildResult<bool>;

    /// Move all children of `old_parent`, in order, to the end of `new_parent`'s children.
    fn reparent_children(&mut self, old_parent: &Self::Node, new_parent: &Self::Node)
        -> BuildResult<()>;

    /// Detach `node` from its parent. The parser only calls this for nodes that have one.
    fn remove_from_parent(&mut self, node: &Self::Node) -> BuildResult<()>;

    /// The parser found an author conformance error. Ignored by default.
    fn parse_error(&mut self, message: &str) -> BuildResult<()> {
        let _ = message;
        Ok(())
    }

    /// The parser decided on a compatibility mode for `document`. Ignored by default.
    fn set_quirks_mode(&mut self, document: &Self::Node, mode: QuirksMode) -> BuildResult<()> {
        let _ = (document, mode);
        Ok(())
    }
}

/// Tree builders can also be chosen at runtime, as `Box<dyn TreeBuilder<Node = ...>>`.
impl<B: TreeBuilder + ?Sized> TreeBuilder for Box<B> {
    type Node = B::Node;

    fn new_document(&mut self) -> BuildResult<Self::Node> {
        (**self).new_document()
    }

    fn new_element(&mut self, ns: &str, local: &str) -> BuildResult<Self::Node> {
        (**self).new_element(ns, local)
    }

    fn element_add_template_contents(&mut self, element: &Self::Node) -> BuildResult<Self::Node> {
        (**self).element_add_template_contents(element)
    }

    fn element_add_attribute_if_missing(
        &mut self,
        element: &Self::Node,
        ns: &str,
        local: &str,
        value: &str,
    ) -> BuildResult<()> {
        (**self).element_add_attribute_if_missing(element, ns, local, value)
    }

    fn new_comment(&mut self, data: &str) -> BuildResult<Self::Node> {
        (**self).new_comment(data)
    }

    fn append_doctype_to_document(
        &mut self,
        document: &Self::Node,
        name: &str,
        public_id: &str,
        system_id: &str,
    ) -> BuildResult<()> {
        (**self).append_doctype_to_document(document, name, public_id, system_id)
    }

    fn append_node(&mut self, parent: &Self::Node, child: &Self::Node) -> BuildResult<()> {
        (**self).append_node(parent, child)
    }

    fn append_text(&mut self, parent: &Self::Node, data: &str) -> BuildResult<()> {
        (**self).append_text(parent, data)
    }

    fn insert_node_before_sibling(
        &mut self,
        sibling: &Self::Node,
        new_node: &Self::Node,
    ) -> BuildResult<bool> {
        (**self).insert_node_before_sibling(sibling, new_node)
    }

    fn insert_text_before_sibling(
        &mut self,
        sibling: &Self::Node,
        data: &str,
    ) -> BuildResult<bool> {
        (**self).insert_text_before_sibling(sibling, data)
    }

    fn reparent_children(
        &mut self,
        old_parent: &Self::Node,
        new_parent: &Self::Node,
    ) -> BuildResult<()> {
        (**self).reparent_children(old_parent, new_parent)
    }

    fn remove_from_parent(&mut self, node: &Self::Node) -> BuildResult<()> {
        (**self).remove_from_parent(node)
    }

    fn parse_error(&mut self, message: &str) -> BuildResult<()> {
        (**self).parse_error(message)
    }

    fn set_quirks_mode(&mut self, document: &Self::Node, mode: QuirksMode) -> BuildResult<()> {
        (**self).set_quirks_mode(document, mode)
    }
}
