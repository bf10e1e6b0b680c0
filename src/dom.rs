//! The default tree backend: a reference-counted DOM.
//!
//! Children are owned by their parent through strong references, the parent link is a weak
//! back-reference used for navigation only. The parser keeps additional nodes alive through the
//! session's handle registry, so detached nodes stay valid for as long as it may refer to them.
//!
//! ```
//! use html5bridge::dom::NodeData;
//!
//! let document = html5bridge::parse("<p class=intro>hello</p>").unwrap();
//! let html = document.children.borrow()[0].clone();
//! let body = html.children.borrow()[1].clone();
//! let p = body.children.borrow()[0].clone();
//! assert_eq!(p.attribute("", "class").as_deref(), Some("intro"));
//! let text = p.children.borrow()[0].clone();
//! match text.data {
//!     NodeData::Text { ref contents } => assert_eq!(*contents.borrow(), "hello"),
//!     _ => unreachable!(),
//! }
//! ```
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::mem;
use std::rc::{Rc, Weak};

use crate::tree_builder::{BuildResult, QuirksMode, TreeBuilder};

/// Namespace of all regular HTML elements.
pub const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";
const SVG_NAMESPACE: &str = "http://www.w3.org/2000/svg";
const MATHML_NAMESPACE: &str = "http://www.w3.org/1998/Math/MathML";
const XLINK_NAMESPACE: &str = "http://www.w3.org/1999/xlink";
const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

/// Reference to a DOM node.
pub type Handle = Rc<Node>;

/// Weak reference to a DOM node, used for parent pointers.
pub type WeakHandle = Weak<Node>;

/// A namespace URI and a local name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The namespace URI, empty for "no namespace".
    pub ns: String,
    /// The local name.
    pub local: String,
}

impl QualifiedName {
    /// Construct a name from its parts.
    pub fn new(ns: &str, local: &str) -> Self {
        QualifiedName {
            ns: ns.to_owned(),
            local: local.to_owned(),
        }
    }
}

/// The different kinds of nodes in the DOM.
#[derive(Debug)]
pub enum NodeData {
    /// The `Document` itself - the root node of an HTML document.
    Document {
        /// The compatibility mode the parser settled on.
        quirks_mode: Cell<QuirksMode>,
    },

    /// A document fragment, used for the contents of `<template>` elements.
    DocumentFragment,

    /// A `DOCTYPE` with name, public id, and system id.
    Doctype {
        /// The doctype's name.
        name: String,
        /// The doctype's public identifier.
        public_id: String,
        /// The doctype's system identifier.
        system_id: String,
    },

    /// A text node.
    Text {
        /// The text, grows while adjacent text is merged into it.
        contents: RefCell<String>,
    },

    /// A comment.
    Comment {
        /// The comment's text.
        contents: String,
    },

    /// An element with attributes.
    Element {
        /// The element's name.
        name: QualifiedName,
        /// The element's attributes, keyed by name.
        attrs: RefCell<BTreeMap<QualifiedName, String>>,
        /// For HTML `<template>` elements, the template contents.
        template_contents: RefCell<Option<Handle>>,
    },
}

/// A DOM node.
pub struct Node {
    /// Parent node.
    pub parent: Cell<Option<WeakHandle>>,
    /// Child nodes of this node.
    pub children: RefCell<Vec<Handle>>,
    /// Represents this node's data.
    pub data: NodeData,
}

impl Node {
    /// Create a new, detached node.
    pub fn new(data: NodeData) -> Handle {
        Rc::new(Node {
            parent: Cell::new(None),
            children: RefCell::new(Vec::new()),
            data,
        })
    }

    /// The parent of this node, if it is attached and the parent is still alive.
    pub fn parent(&self) -> Option<Handle> {
        let weak = self.parent.take();
        let parent = weak.as_ref().and_then(Weak::upgrade);
        self.parent.set(weak);
        parent
    }

    /// The value of the attribute `ns:local`, if this is an element that has it.
    pub fn attribute(&self, ns: &str, local: &str) -> Option<String> {
        match self.data {
            NodeData::Element { ref attrs, .. } => {
                attrs.borrow().get(&QualifiedName::new(ns, local)).cloned()
            }
            _ => None,
        }
    }

    /// The template contents, if this is a `<template>` element that has them.
    pub fn template_contents(&self) -> Option<Handle> {
        match self.data {
            NodeData::Element {
                ref template_contents,
                ..
            } => template_contents.borrow().clone(),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("data", &self.data)
            .field("children", &self.children)
            .finish()
    }
}

impl Drop for Node {
    // Deep trees would overflow the stack if children were dropped recursively.
    fn drop(&mut self) {
        let mut nodes = mem::take(&mut *self.children.borrow_mut());
        while let Some(node) = nodes.pop() {
            // someone else still holds this subtree, it has to stay intact
            if Rc::strong_count(&node) > 1 {
                continue;
            }
            let children = mem::take(&mut *node.children.borrow_mut());
            nodes.extend(children);
            if let NodeData::Element {
                ref template_contents,
                ..
            } = node.data
            {
                if let Some(template_contents) = template_contents.borrow_mut().take() {
                    nodes.push(template_contents);
                }
            }
        }
    }
}

fn parent_and_index(target: &Handle) -> Option<(Handle, usize)> {
    let parent = target.parent()?;
    let index = parent
        .children
        .borrow()
        .iter()
        .position(|child| Rc::ptr_eq(child, target))?;
    Some((parent, index))
}

fn append_to_existing_text(prev: &Handle, text: &str) -> bool {
    match prev.data {
        NodeData::Text { ref contents } => {
            contents.borrow_mut().push_str(text);
            true
        }
        _ => false,
    }
}

fn prepend_to_existing_text(next: &Handle, text: &str) -> bool {
    match next.data {
        NodeData::Text { ref contents } => {
            contents.borrow_mut().insert_str(0, text);
            true
        }
        _ => false,
    }
}

fn new_text(data: &str) -> Handle {
    Node::new(NodeData::Text {
        contents: RefCell::new(data.to_owned()),
    })
}

fn attach(parent: &Handle, child: &Handle) {
    let previous_parent = child.parent.replace(Some(Rc::downgrade(parent)));
    if previous_parent.is_some() {
        panic!("precondition violation: node is already attached to a parent");
    }
}

/// The default [`TreeBuilder`], building a tree of [`Node`]s.
#[derive(Debug, Default)]
pub struct DomBuilder {
    errors: Vec<String>,
}

impl DomBuilder {
    /// Create a builder.
    pub fn new() -> Self {
        DomBuilder::default()
    }

    /// The parse errors reported so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

impl TreeBuilder for DomBuilder {
    type Node = Handle;

    fn new_document(&mut self) -> BuildResult<Handle> {
        Ok(Node::new(NodeData::Document {
            quirks_mode: Cell::new(QuirksMode::NoQuirks),
        }))
    }

    fn new_element(&mut self, ns: &str, local: &str) -> BuildResult<Handle> {
        Ok(Node::new(NodeData::Element {
            name: QualifiedName::new(ns, local),
            attrs: RefCell::new(BTreeMap::new()),
            template_contents: RefCell::new(None),
        }))
    }

    fn element_add_template_contents(&mut self, element: &Handle) -> BuildResult<Handle> {
        let NodeData::Element {
            ref template_contents,
            ..
        } = element.data
        else {
            panic!("contract violation: template contents requested for a non-element");
        };

        let mut template_contents = template_contents.borrow_mut();
        if template_contents.is_some() {
            panic!("contract violation: template contents were already created for this element");
        }
        let fragment = Node::new(NodeData::DocumentFragment);
        *template_contents = Some(fragment.clone());
        Ok(fragment)
    }

    fn element_add_attribute_if_missing(
        &mut self,
        element: &Handle,
        ns: &str,
        local: &str,
        value: &str,
    ) -> BuildResult<()> {
        let NodeData::Element { ref attrs, .. } = element.data else {
            panic!("contract violation: attribute added to a non-element");
        };

        attrs
            .borrow_mut()
            .entry(QualifiedName::new(ns, local))
            .or_insert_with(|| value.to_owned());
        Ok(())
    }

    fn new_comment(&mut self, data: &str) -> BuildResult<Handle> {
        Ok(Node::new(NodeData::Comment {
            contents: data.to_owned(),
        }))
    }

    fn append_doctype_to_document(
        &mut self,
        document: &Handle,
        name: &str,
        public_id: &str,
        system_id: &str,
    ) -> BuildResult<()> {
        let doctype = Node::new(NodeData::Doctype {
            name: name.to_owned(),
            public_id: public_id.to_owned(),
            system_id: system_id.to_owned(),
        });
        self.append_node(document, &doctype)
    }

    fn append_node(&mut self, parent: &Handle, child: &Handle) -> BuildResult<()> {
        attach(parent, child);
        parent.children.borrow_mut().push(child.clone());
        Ok(())
    }

    fn append_text(&mut self, parent: &Handle, data: &str) -> BuildResult<()> {
        if let Some(last) = parent.children.borrow().last() {
            if append_to_existing_text(last, data) {
                return Ok(());
            }
        }

        let text = new_text(data);
        self.append_node(parent, &text)
    }

    fn insert_node_before_sibling(
        &mut self,
        sibling: &Handle,
        new_node: &Handle,
    ) -> BuildResult<bool> {
        let Some((parent, index)) = parent_and_index(sibling) else {
            return Ok(false);
        };

        attach(&parent, new_node);
        parent.children.borrow_mut().insert(index, new_node.clone());
        Ok(true)
    }

    fn insert_text_before_sibling(&mut self, sibling: &Handle, data: &str) -> BuildResult<bool> {
        let Some((parent, index)) = parent_and_index(sibling) else {
            return Ok(false);
        };

        let mut children = parent.children.borrow_mut();
        if index > 0 && append_to_existing_text(&children[index - 1], data) {
            return Ok(true);
        }
        if prepend_to_existing_text(sibling, data) {
            return Ok(true);
        }

        let text = new_text(data);
        attach(&parent, &text);
        children.insert(index, text);
        Ok(true)
    }

    fn reparent_children(&mut self, old_parent: &Handle, new_parent: &Handle) -> BuildResult<()> {
        let moved = mem::take(&mut *old_parent.children.borrow_mut());
        for child in &moved {
            child.parent.set(Some(Rc::downgrade(new_parent)));
        }
        new_parent.children.borrow_mut().extend(moved);
        Ok(())
    }

    fn remove_from_parent(&mut self, node: &Handle) -> BuildResult<()> {
        let Some((parent, index)) = parent_and_index(node) else {
            panic!("precondition violation: remove_from_parent on a detached node");
        };

        parent.children.borrow_mut().remove(index);
        node.parent.set(None);
        Ok(())
    }

    fn parse_error(&mut self, message: &str) -> BuildResult<()> {
        self.errors.push(message.to_owned());
        Ok(())
    }

    fn set_quirks_mode(&mut self, document: &Handle, mode: QuirksMode) -> BuildResult<()> {
        if let NodeData::Document { ref quirks_mode } = document.data {
            quirks_mode.set(mode);
        }
        Ok(())
    }
}

/// Render the children of `node` in the format of the html5lib tree-construction tests.
///
/// ```
/// let document = html5bridge::parse("<p>x").unwrap();
/// assert_eq!(
///     html5bridge::dom::dump(&document),
///     "| <html>\n|   <head>\n|   <body>\n|     <p>\n|       \"x\"\n"
/// );
/// ```
pub fn dump(node: &Handle) -> String {
    let mut buf = String::new();
    for child in node.children.borrow().iter() {
        dump_node(&mut buf, 1, child);
    }
    buf
}

fn dump_node(buf: &mut String, indent: usize, node: &Handle) {
    buf.push('|');
    buf.push_str(&" ".repeat(indent));

    match node.data {
        NodeData::Document { .. } | NodeData::DocumentFragment => {
            buf.push_str("#document\n");
        }

        NodeData::Doctype {
            ref name,
            ref public_id,
            ref system_id,
        } => {
            buf.push_str("<!DOCTYPE ");
            buf.push_str(name);
            if !public_id.is_empty() || !system_id.is_empty() {
                let _ = write!(buf, " \"{}\" \"{}\"", public_id, system_id);
            }
            buf.push_str(">\n");
        }

        NodeData::Text { ref contents } => {
            let _ = writeln!(buf, "\"{}\"", contents.borrow());
        }

        NodeData::Comment { ref contents } => {
            let _ = writeln!(buf, "<!-- {} -->", contents);
        }

        NodeData::Element {
            ref name,
            ref attrs,
            ..
        } => {
            buf.push('<');
            match name.ns.as_str() {
                SVG_NAMESPACE => buf.push_str("svg "),
                MATHML_NAMESPACE => buf.push_str("math "),
                _ => (),
            }
            buf.push_str(&name.local);
            buf.push_str(">\n");

            let attrs = attrs.borrow();
            let mut attrs: Vec<_> = attrs.iter().collect();
            attrs.sort_by(|(x, _), (y, _)| (&x.local, &x.ns).cmp(&(&y.local, &y.ns)));

            for (name, value) in attrs {
                buf.push('|');
                buf.push_str(&" ".repeat(indent + 2));
                match name.ns.as_str() {
                    XLINK_NAMESPACE => buf.push_str("xlink "),
                    XML_NAMESPACE => buf.push_str("xml "),
                    XMLNS_NAMESPACE => buf.push_str("xmlns "),
                    _ => (),
                }
                let _ = writeln!(buf, "{}=\"{}\"", name.local, value);
            }
        }
    }

    for child in node.children.borrow().iter() {
        dump_node(buf, indent + 2, child);
    }

    if let Some(content) = node.template_contents() {
        buf.push('|');
        buf.push_str(&" ".repeat(indent + 2));
        buf.push_str("content\n");
        for child in content.children.borrow().iter() {
            dump_node(buf, indent + 4, child);
        }
    }
}

#[cfg(test)]
fn children_of(node: &Handle) -> Vec<Handle> {
    node.children.borrow().clone()
}

#[cfg(test)]
fn texts_of(node: &Handle) -> Vec<String> {
    children_of(node)
        .iter()
        .map(|child| match child.data {
            NodeData::Text { ref contents } => contents.borrow().clone(),
            NodeData::Element { ref name, .. } => format!("<{}>", name.local),
            _ => "?".to_owned(),
        })
        .collect()
}

#[test]
fn test_append_text_merges_runs() {
    let mut builder = DomBuilder::new();
    let div = builder.new_element(HTML_NAMESPACE, "div").unwrap();
    builder.append_text(&div, "a").unwrap();
    builder.append_text(&div, "b").unwrap();
    let span = builder.new_element(HTML_NAMESPACE, "span").unwrap();
    builder.append_node(&div, &span).unwrap();
    builder.append_text(&div, "c").unwrap();
    builder.append_text(&div, "d").unwrap();

    assert_eq!(texts_of(&div), ["ab", "<span>", "cd"]);
    assert!(Rc::ptr_eq(&span.parent().unwrap(), &div));
}

#[test]
fn test_insert_text_before_sibling_merges_runs() {
    let mut builder = DomBuilder::new();
    let div = builder.new_element(HTML_NAMESPACE, "div").unwrap();
    let a = builder.new_element(HTML_NAMESPACE, "a").unwrap();
    let b = builder.new_element(HTML_NAMESPACE, "b").unwrap();
    builder.append_text(&div, "x").unwrap();
    builder.append_node(&div, &a).unwrap();
    builder.append_node(&div, &b).unwrap();

    assert!(builder.insert_text_before_sibling(&a, "y").unwrap());
    assert!(builder.insert_text_before_sibling(&b, "z").unwrap());
    assert!(builder.insert_text_before_sibling(&b, "w").unwrap());
    assert_eq!(texts_of(&div), ["xy", "<a>", "zw", "<b>"]);

    // inserting before a text node grows that node instead
    let text = children_of(&div)[2].clone();
    assert!(builder.insert_text_before_sibling(&text, "v").unwrap());
    assert_eq!(texts_of(&div), ["xy", "<a>", "vzw", "<b>"]);
}

#[test]
fn test_insert_before_detached_sibling_fails() {
    let mut builder = DomBuilder::new();
    let detached = builder.new_element(HTML_NAMESPACE, "table").unwrap();
    let node = builder.new_element(HTML_NAMESPACE, "p").unwrap();

    assert!(!builder.insert_node_before_sibling(&detached, &node).unwrap());
    assert!(!builder.insert_text_before_sibling(&detached, "x").unwrap());
    assert!(node.parent().is_none());
    assert!(detached.children.borrow().is_empty());
}

#[test]
fn test_attributes_first_writer_wins() {
    let mut builder = DomBuilder::new();
    let p = builder.new_element(HTML_NAMESPACE, "p").unwrap();
    builder
        .element_add_attribute_if_missing(&p, "", "id", "first")
        .unwrap();
    builder
        .element_add_attribute_if_missing(&p, "", "id", "second")
        .unwrap();
    builder
        .element_add_attribute_if_missing(&p, XLINK_NAMESPACE, "id", "other namespace")
        .unwrap();
    builder
        .element_add_attribute_if_missing(&p, "", "id", "third")
        .unwrap();

    assert_eq!(p.attribute("", "id").as_deref(), Some("first"));
    assert_eq!(p.attribute(XLINK_NAMESPACE, "id").as_deref(), Some("other namespace"));
}

#[test]
fn test_reparent_children() {
    let mut builder = DomBuilder::new();
    let old = builder.new_element(HTML_NAMESPACE, "b").unwrap();
    let new = builder.new_element(HTML_NAMESPACE, "i").unwrap();
    let existing = builder.new_element(HTML_NAMESPACE, "u").unwrap();
    builder.append_node(&new, &existing).unwrap();
    builder.append_text(&old, "1").unwrap();
    let em = builder.new_element(HTML_NAMESPACE, "em").unwrap();
    builder.append_node(&old, &em).unwrap();
    builder.append_text(&old, "2").unwrap();

    builder.reparent_children(&old, &new).unwrap();
    assert!(old.children.borrow().is_empty());
    assert_eq!(texts_of(&new), ["<u>", "1", "<em>", "2"]);
    assert!(Rc::ptr_eq(&em.parent().unwrap(), &new));
}

#[test]
fn test_remove_from_parent() {
    let mut builder = DomBuilder::new();
    let div = builder.new_element(HTML_NAMESPACE, "div").unwrap();
    let p = builder.new_element(HTML_NAMESPACE, "p").unwrap();
    builder.append_node(&div, &p).unwrap();
    builder.remove_from_parent(&p).unwrap();
    assert!(p.parent().is_none());
    assert!(div.children.borrow().is_empty());
}

#[test]
#[should_panic(expected = "precondition violation")]
fn test_remove_detached_node() {
    let mut builder = DomBuilder::new();
    let p = builder.new_element(HTML_NAMESPACE, "p").unwrap();
    let _ = builder.remove_from_parent(&p);
}

#[test]
fn test_template_contents_created_once() {
    let mut builder = DomBuilder::new();
    let template = builder.new_element(HTML_NAMESPACE, "template").unwrap();
    let contents = builder.element_add_template_contents(&template).unwrap();
    assert!(matches!(contents.data, NodeData::DocumentFragment));
    assert!(Rc::ptr_eq(&template.template_contents().unwrap(), &contents));

    let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        builder.element_add_template_contents(&template)
    }));
    assert!(second.is_err());
}

#[test]
fn test_deep_tree_drops_without_recursion() {
    let mut builder = DomBuilder::new();
    let root = builder.new_element(HTML_NAMESPACE, "div").unwrap();
    let mut current = root.clone();
    for _ in 0..100_000 {
        let child = builder.new_element(HTML_NAMESPACE, "div").unwrap();
        builder.append_node(&current, &child).unwrap();
        current = child;
    }
    drop(current);
    drop(root);
}

#[test]
fn test_dropping_document_keeps_held_subtrees() {
    let document = crate::parse("<p>hello</p>").unwrap();
    let html = document.children.borrow()[0].clone();
    let body = html.children.borrow()[1].clone();
    drop(html);
    drop(document);

    assert_eq!(body.children.borrow().len(), 1);
    assert_eq!(dump(&body), "| <p>\n|   \"hello\"\n");
}

#[test]
fn test_released_parent_keeps_registered_child() {
    use crate::registry::{HandleRegistry, ReleasePolicy};

    let mut builder = DomBuilder::new();
    let mut registry = HandleRegistry::new(ReleasePolicy::WhenUnreferenced);
    let div = builder.new_element(HTML_NAMESPACE, "div").unwrap();
    let b = builder.new_element(HTML_NAMESPACE, "b").unwrap();
    builder.append_node(&div, &b).unwrap();
    builder.append_text(&b, "kept").unwrap();

    let div_handle = registry.register(div);
    let b_handle = registry.register(b);
    drop(registry.release(div_handle));

    assert_eq!(dump(registry.resolve(b_handle)), "| \"kept\"\n");
}

#[test]
fn test_node_debug() {
    let mut builder = DomBuilder::new();
    let p = builder.new_element(HTML_NAMESPACE, "p").unwrap();
    builder.append_text(&p, "x").unwrap();
    let debug = format!("{:?}", p);
    assert!(debug.starts_with("Node { data: Element"));
    assert!(debug.contains("\"x\""));
}
