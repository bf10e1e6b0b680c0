//! An ElementTree-style tree backend.
//!
//! This is the tree model used by Python's `xml.etree` and lxml, a popular interchange format for
//! XML-ish documents:
//!
//! * There are no text nodes. Text before an element's first child lives in that element's
//!   `text`, text after an element lives in the element's `tail`.
//! * Comments are elements with a special tag.
//! * The document ([`ElementTree`]) holds exactly one root element and an optional doctype.
//!   Comments outside of the root element are dropped.
//! * Element names use Clark notation: `{namespace}local`, or just `local` without a namespace.
//!
//! ```
//! use html5bridge::etree::EtreeBuilder;
//!
//! let tree = html5bridge::parse_with(EtreeBuilder::new(), "<p>a<br>b</p>").unwrap();
//! let tree = tree.as_tree().unwrap();
//! assert_eq!(
//!     tree.root().unwrap().to_string(),
//!     "<html><head></head><body><p>a<br></br>b</p></body></html>"
//! );
//! ```
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::dom::HTML_NAMESPACE;
use crate::tree_builder::{BuildResult, TreeBuilder};

/// The name of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// A regular element, in Clark notation.
    Name(String),
    /// A comment. Its data is stored as the element's `text`.
    Comment,
}

/// The `name`, `public_id` and `system_id` of a doctype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Doctype {
    /// The doctype's name.
    pub name: String,
    /// The doctype's public identifier.
    pub public_id: String,
    /// The doctype's system identifier.
    pub system_id: String,
}

/// The document: a root element and a doctype.
#[derive(Debug, Default)]
pub struct ElementTree {
    root: RefCell<Option<Rc<Element>>>,
    doctype: RefCell<Option<Doctype>>,
}

impl ElementTree {
    /// The root element, usually `<html>`.
    pub fn root(&self) -> Option<Rc<Element>> {
        self.root.borrow().clone()
    }

    /// The doctype, if the document had one.
    pub fn doctype(&self) -> Option<Doctype> {
        self.doctype.borrow().clone()
    }
}

#[derive(Debug, Clone)]
enum Parent {
    Tree(Weak<ElementTree>),
    Element(Weak<Element>),
}

/// An element or a comment.
#[derive(Debug)]
pub struct Element {
    tag: Tag,
    attrib: RefCell<BTreeMap<String, String>>,
    text: RefCell<Option<String>>,
    tail: RefCell<Option<String>>,
    children: RefCell<Vec<Rc<Element>>>,
    parent: RefCell<Option<Parent>>,
}

impl Element {
    fn new(tag: Tag, text: Option<String>) -> Rc<Element> {
        Rc::new(Element {
            tag,
            attrib: RefCell::default(),
            text: RefCell::new(text),
            tail: RefCell::default(),
            children: RefCell::default(),
            parent: RefCell::default(),
        })
    }

    /// This element's tag.
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Get an attribute by its Clark notation name.
    pub fn get(&self, name: &str) -> Option<String> {
        self.attrib.borrow().get(name).cloned()
    }

    /// All attributes, keyed by their Clark notation names.
    pub fn attrib(&self) -> BTreeMap<String, String> {
        self.attrib.borrow().clone()
    }

    /// Text before the first child.
    pub fn text(&self) -> Option<String> {
        self.text.borrow().clone()
    }

    /// Text after this element, before its next sibling.
    pub fn tail(&self) -> Option<String> {
        self.tail.borrow().clone()
    }

    /// The child elements.
    pub fn children(&self) -> Vec<Rc<Element>> {
        self.children.borrow().clone()
    }
}

fn push_text(slot: &RefCell<Option<String>>, data: &str) {
    slot.borrow_mut()
        .get_or_insert_with(String::new)
        .push_str(data);
}

/// Append `data` at the end of `element`'s content: after the last child if there is one.
fn append_content_text(element: &Element, data: &str) {
    match element.children.borrow().last() {
        Some(last) => push_text(&last.tail, data),
        None => push_text(&element.text, data),
    }
}

fn qname(ns: &str, local: &str) -> String {
    if ns.is_empty() {
        local.to_owned()
    } else {
        format!("{{{}}}{}", ns, local)
    }
}

/// Everything an [`EtreeBuilder`] hands out as a node.
#[derive(Debug, Clone)]
pub enum EtreeNode {
    /// The document.
    Tree(Rc<ElementTree>),
    /// An element or comment.
    Element(Rc<Element>),
}

impl EtreeNode {
    /// The document, if this is one.
    pub fn as_tree(&self) -> Option<&Rc<ElementTree>> {
        match self {
            EtreeNode::Tree(tree) => Some(tree),
            EtreeNode::Element(_) => None,
        }
    }

    /// The element, if this is one.
    pub fn as_element(&self) -> Option<&Rc<Element>> {
        match self {
            EtreeNode::Tree(_) => None,
            EtreeNode::Element(element) => Some(element),
        }
    }

    fn element(&self, operation: &str) -> BuildResult<&Rc<Element>> {
        self.as_element()
            .ok_or_else(|| format!("{}: expected an element, got the document", operation).into())
    }
}

/// A [`TreeBuilder`] that produces an [`ElementTree`].
///
/// `<template>` contents are stored as children of the `<template>` element itself.
#[derive(Debug, Default)]
pub struct EtreeBuilder {
    _private: (),
}

impl EtreeBuilder {
    /// Create a builder.
    pub fn new() -> Self {
        EtreeBuilder::default()
    }
}

impl TreeBuilder for EtreeBuilder {
    type Node = EtreeNode;

    fn new_document(&mut self) -> BuildResult<EtreeNode> {
        Ok(EtreeNode::Tree(Rc::default()))
    }

    fn new_element(&mut self, ns: &str, local: &str) -> BuildResult<EtreeNode> {
        Ok(EtreeNode::Element(Element::new(
            Tag::Name(qname(ns, local)),
            None,
        )))
    }

    fn element_add_template_contents(&mut self, element: &EtreeNode) -> BuildResult<EtreeNode> {
        element.element("element_add_template_contents")?;
        Ok(element.clone())
    }

    fn element_add_attribute_if_missing(
        &mut self,
        element: &EtreeNode,
        ns: &str,
        local: &str,
        value: &str,
    ) -> BuildResult<()> {
        let element = element.element("element_add_attribute_if_missing")?;
        element
            .attrib
            .borrow_mut()
            .entry(qname(ns, local))
            .or_insert_with(|| value.to_owned());
        Ok(())
    }

    fn new_comment(&mut self, data: &str) -> BuildResult<EtreeNode> {
        Ok(EtreeNode::Element(Element::new(
            Tag::Comment,
            Some(data.to_owned()),
        )))
    }

    fn append_doctype_to_document(
        &mut self,
        document: &EtreeNode,
        name: &str,
        public_id: &str,
        system_id: &str,
    ) -> BuildResult<()> {
        let tree = document
            .as_tree()
            .ok_or("append_doctype_to_document: expected the document")?;
        *tree.doctype.borrow_mut() = Some(Doctype {
            name: name.to_owned(),
            public_id: public_id.to_owned(),
            system_id: system_id.to_owned(),
        });
        Ok(())
    }

    fn append_node(&mut self, parent: &EtreeNode, child: &EtreeNode) -> BuildResult<()> {
        let child = child.element("append_node")?;
        match parent {
            EtreeNode::Tree(tree) => {
                if child.tag == Tag::Comment {
                    return Ok(());
                }
                let mut root = tree.root.borrow_mut();
                if root.is_some() {
                    return Err("append_node: the document already has a root element".into());
                }
                *root = Some(child.clone());
                *child.parent.borrow_mut() = Some(Parent::Tree(Rc::downgrade(tree)));
            }
            EtreeNode::Element(parent) => {
                parent.children.borrow_mut().push(child.clone());
                *child.parent.borrow_mut() = Some(Parent::Element(Rc::downgrade(parent)));
            }
        }
        Ok(())
    }

    fn append_text(&mut self, parent: &EtreeNode, data: &str) -> BuildResult<()> {
        let parent = parent.element("append_text")?;
        append_content_text(parent, data);
        Ok(())
    }

    fn insert_node_before_sibling(
        &mut self,
        sibling: &EtreeNode,
        new_node: &EtreeNode,
    ) -> BuildResult<bool> {
        let sibling = sibling.element("insert_node_before_sibling")?;
        let new_node = new_node.element("insert_node_before_sibling")?;
        let parent = match sibling.parent.borrow().clone() {
            None => return Ok(false),
            Some(Parent::Tree(_)) => {
                return Err("insert_node_before_sibling: cannot insert next to the root".into())
            }
            Some(Parent::Element(parent)) => parent
                .upgrade()
                .ok_or("insert_node_before_sibling: parent is gone")?,
        };

        let mut children = parent.children.borrow_mut();
        let position = children
            .iter()
            .position(|child| Rc::ptr_eq(child, sibling))
            .ok_or("insert_node_before_sibling: sibling is not a child of its parent")?;
        children.insert(position, new_node.clone());
        *new_node.parent.borrow_mut() = Some(Parent::Element(Rc::downgrade(&parent)));
        Ok(true)
    }

    fn insert_text_before_sibling(&mut self, sibling: &EtreeNode, data: &str) -> BuildResult<bool> {
        let sibling = sibling.element("insert_text_before_sibling")?;
        let parent = match sibling.parent.borrow().clone() {
            None => return Ok(false),
            Some(Parent::Tree(_)) => {
                return Err("insert_text_before_sibling: no text allowed next to the root".into())
            }
            Some(Parent::Element(parent)) => parent
                .upgrade()
                .ok_or("insert_text_before_sibling: parent is gone")?,
        };

        let children = parent.children.borrow();
        let position = children
            .iter()
            .position(|child| Rc::ptr_eq(child, sibling))
            .ok_or("insert_text_before_sibling: sibling is not a child of its parent")?;
        match position.checked_sub(1) {
            Some(previous) => push_text(&children[previous].tail, data),
            None => push_text(&parent.text, data),
        }
        Ok(true)
    }

    fn reparent_children(
        &mut self,
        old_parent: &EtreeNode,
        new_parent: &EtreeNode,
    ) -> BuildResult<()> {
        let old_parent = old_parent.element("reparent_children")?;
        let new_parent = new_parent.element("reparent_children")?;

        if let Some(text) = old_parent.text.borrow_mut().take() {
            append_content_text(new_parent, &text);
        }
        let moved = std::mem::take(&mut *old_parent.children.borrow_mut());
        for child in &moved {
            *child.parent.borrow_mut() = Some(Parent::Element(Rc::downgrade(new_parent)));
        }
        new_parent.children.borrow_mut().extend(moved);
        Ok(())
    }

    fn remove_from_parent(&mut self, node: &EtreeNode) -> BuildResult<()> {
        let node = node.element("remove_from_parent")?;
        let parent = node
            .parent
            .borrow_mut()
            .take()
            .ok_or("remove_from_parent: node has no parent")?;

        match parent {
            Parent::Tree(tree) => {
                if let Some(tree) = tree.upgrade() {
                    tree.root.borrow_mut().take();
                }
            }
            Parent::Element(parent) => {
                let parent = parent
                    .upgrade()
                    .ok_or("remove_from_parent: parent is gone")?;
                let mut children = parent.children.borrow_mut();
                let position = children
                    .iter()
                    .position(|child| Rc::ptr_eq(child, node))
                    .ok_or("remove_from_parent: node is not a child of its parent")?;
                children.remove(position);

                // the tail is part of the parent's content and stays where it was
                if let Some(tail) = node.tail.borrow_mut().take() {
                    match position.checked_sub(1) {
                        Some(previous) => push_text(&children[previous].tail, &tail),
                        None => push_text(&parent.text, &tail),
                    }
                }
            }
        }
        Ok(())
    }
}

fn escape(f: &mut fmt::Formatter<'_>, text: &str, attribute: bool) -> fmt::Result {
    for c in text.chars() {
        match c {
            '&' => f.write_str("&amp;")?,
            '<' => f.write_str("&lt;")?,
            '>' => f.write_str("&gt;")?,
            '"' if attribute => f.write_str("&quot;")?,
            c => write!(f, "{}", c)?,
        }
    }
    Ok(())
}

/// Serializes the element as XML, without its own tail.
///
/// Names in the HTML namespace are written without it, other names keep their Clark notation.
impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.tag {
            Tag::Comment => {
                write!(f, "<!--{}-->", self.text.borrow().as_deref().unwrap_or(""))?;
                return Ok(());
            }
            Tag::Name(ref name) => name
                .strip_prefix(&format!("{{{}}}", HTML_NAMESPACE))
                .unwrap_or(name.as_str()),
        };

        write!(f, "<{}", name)?;
        for (key, value) in self.attrib.borrow().iter() {
            write!(f, " {}=\"", key)?;
            escape(f, value, true)?;
            f.write_str("\"")?;
        }
        f.write_str(">")?;
        if let Some(ref text) = *self.text.borrow() {
            escape(f, text, false)?;
        }
        for child in self.children.borrow().iter() {
            write!(f, "{}", child)?;
            if let Some(ref tail) = *child.tail.borrow() {
                escape(f, tail, false)?;
            }
        }
        write!(f, "</{}>", name)
    }
}

#[cfg(test)]
fn element(builder: &mut EtreeBuilder, local: &str) -> EtreeNode {
    builder.new_element(HTML_NAMESPACE, local).unwrap()
}

#[test]
fn test_text_and_tail() {
    let mut builder = EtreeBuilder::new();
    let p = element(&mut builder, "p");
    let br = element(&mut builder, "br");
    builder.append_text(&p, "a").unwrap();
    builder.append_text(&p, "b").unwrap();
    builder.append_node(&p, &br).unwrap();
    builder.append_text(&p, "c").unwrap();

    let p = p.as_element().unwrap();
    assert_eq!(p.text().as_deref(), Some("ab"));
    assert_eq!(p.children()[0].tail().as_deref(), Some("c"));
    assert_eq!(p.to_string(), "<p>ab<br></br>c</p>");
}

#[test]
fn test_comments_outside_root_are_dropped() {
    let mut builder = EtreeBuilder::new();
    let document = builder.new_document().unwrap();
    let comment = builder.new_comment("hi").unwrap();
    builder.append_node(&document, &comment).unwrap();
    let html = element(&mut builder, "html");
    builder.append_node(&document, &html).unwrap();

    let tree = document.as_tree().unwrap();
    assert!(Rc::ptr_eq(&tree.root().unwrap(), html.as_element().unwrap()));

    let second = element(&mut builder, "html");
    assert!(builder.append_node(&document, &second).is_err());
}

#[test]
fn test_insert_text_before_sibling() {
    let mut builder = EtreeBuilder::new();
    let table = element(&mut builder, "table");
    let body = element(&mut builder, "body");
    let detached = element(&mut builder, "tr");
    builder.append_node(&body, &table).unwrap();

    assert!(builder.insert_text_before_sibling(&table, "x").unwrap());
    let b = element(&mut builder, "b");
    assert!(builder.insert_node_before_sibling(&table, &b).unwrap());
    assert!(builder.insert_text_before_sibling(&table, "y").unwrap());
    assert!(!builder.insert_text_before_sibling(&detached, "z").unwrap());

    assert_eq!(
        body.as_element().unwrap().to_string(),
        "<body>x<b></b>y<table></table></body>"
    );
}

#[test]
fn test_remove_keeps_tail_text() {
    let mut builder = EtreeBuilder::new();
    let div = element(&mut builder, "div");
    let a = element(&mut builder, "a");
    let b = element(&mut builder, "b");
    builder.append_text(&div, "1").unwrap();
    builder.append_node(&div, &a).unwrap();
    builder.append_text(&div, "2").unwrap();
    builder.append_node(&div, &b).unwrap();
    builder.append_text(&div, "3").unwrap();

    builder.remove_from_parent(&b).unwrap();
    builder.remove_from_parent(&a).unwrap();
    assert_eq!(div.as_element().unwrap().to_string(), "<div>123</div>");
    assert!(builder.remove_from_parent(&a).is_err());
}

#[test]
fn test_reparent_children_moves_text() {
    let mut builder = EtreeBuilder::new();
    let old = element(&mut builder, "b");
    let new = element(&mut builder, "i");
    let u = element(&mut builder, "u");
    builder.append_node(&new, &u).unwrap();
    builder.append_text(&old, "x").unwrap();
    let em = element(&mut builder, "em");
    builder.append_node(&old, &em).unwrap();
    builder.append_text(&old, "y").unwrap();

    builder.reparent_children(&old, &new).unwrap();
    assert_eq!(old.as_element().unwrap().to_string(), "<b></b>");
    assert_eq!(
        new.as_element().unwrap().to_string(),
        "<i><u></u>x<em></em>y</i>"
    );
}

#[test]
fn test_attribute_names_use_clark_notation() {
    let mut builder = EtreeBuilder::new();
    let svg = builder
        .new_element("http://www.w3.org/2000/svg", "svg")
        .unwrap();
    builder
        .element_add_attribute_if_missing(&svg, "http://www.w3.org/1999/xlink", "href", "#a")
        .unwrap();
    builder
        .element_add_attribute_if_missing(&svg, "http://www.w3.org/1999/xlink", "href", "#b")
        .unwrap();
    builder
        .element_add_attribute_if_missing(&svg, "", "width", "1")
        .unwrap();

    let svg = svg.as_element().unwrap();
    assert_eq!(svg.tag(), &Tag::Name("{http://www.w3.org/2000/svg}svg".to_owned()));
    assert_eq!(svg.get("{http://www.w3.org/1999/xlink}href").as_deref(), Some("#a"));
    assert_eq!(svg.get("width").as_deref(), Some("1"));
}
