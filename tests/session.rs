use std::error::Error as _;
use std::fmt;

use html5bridge::dom::{self, NodeData};
use html5bridge::etree::EtreeNode;
use html5bridge::{
    parse, parse_with, BuildResult, DomBuilder, Error, EtreeBuilder, QuirksMode, ReleasePolicy,
    Session, SessionOptions, SessionState, TreeBuilder,
};
use pretty_assertions::assert_eq;

#[derive(Debug)]
struct Tripped(String);

impl fmt::Display for Tripped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tripped over {:?}", self.0)
    }
}

impl std::error::Error for Tripped {}

/// A [`DomBuilder`] that fails, or panics, when asked to create a particular comment.
#[derive(Default)]
struct Tripwire {
    inner: DomBuilder,
    panic: bool,
    comments_seen: usize,
}

impl TreeBuilder for Tripwire {
    type Node = dom::Handle;

    fn new_document(&mut self) -> BuildResult<dom::Handle> {
        self.inner.new_document()
    }

    fn new_element(&mut self, ns: &str, local: &str) -> BuildResult<dom::Handle> {
        self.inner.new_element(ns, local)
    }

    fn element_add_template_contents(&mut self, element: &dom::Handle) -> BuildResult<dom::Handle> {
        self.inner.element_add_template_contents(element)
    }

    fn element_add_attribute_if_missing(
        &mut self,
        element: &dom::Handle,
        ns: &str,
        local: &str,
        value: &str,
    ) -> BuildResult<()> {
        self.inner
            .element_add_attribute_if_missing(element, ns, local, value)
    }

    fn new_comment(&mut self, data: &str) -> BuildResult<dom::Handle> {
        self.comments_seen += 1;
        if data == "boom" {
            if self.panic {
                panic!("kaboom");
            }
            return Err(Box::new(Tripped(data.to_owned())));
        }
        self.inner.new_comment(data)
    }

    fn append_doctype_to_document(
        &mut self,
        document: &dom::Handle,
        name: &str,
        public_id: &str,
        system_id: &str,
    ) -> BuildResult<()> {
        self.inner
            .append_doctype_to_document(document, name, public_id, system_id)
    }

    fn append_node(&mut self, parent: &dom::Handle, child: &dom::Handle) -> BuildResult<()> {
        self.inner.append_node(parent, child)
    }

    fn append_text(&mut self, parent: &dom::Handle, data: &str) -> BuildResult<()> {
        self.inner.append_text(parent, data)
    }

    fn insert_node_before_sibling(
        &mut self,
        sibling: &dom::Handle,
        new_node: &dom::Handle,
    ) -> BuildResult<bool> {
        self.inner.insert_node_before_sibling(sibling, new_node)
    }

    fn insert_text_before_sibling(
        &mut self,
        sibling: &dom::Handle,
        data: &str,
    ) -> BuildResult<bool> {
        self.inner.insert_text_before_sibling(sibling, data)
    }

    fn reparent_children(
        &mut self,
        old_parent: &dom::Handle,
        new_parent: &dom::Handle,
    ) -> BuildResult<()> {
        self.inner.reparent_children(old_parent, new_parent)
    }

    fn remove_from_parent(&mut self, node: &dom::Handle) -> BuildResult<()> {
        self.inner.remove_from_parent(node)
    }
}

fn child(node: &dom::Handle, index: usize) -> dom::Handle {
    node.children.borrow()[index].clone()
}

#[test]
fn test_body_text() {
    let document = parse("<body>x").unwrap();
    assert_eq!(
        dom::dump(&document),
        "| <html>\n|   <head>\n|   <body>\n|     \"x\"\n"
    );
}

#[test]
fn test_chunk_boundaries_are_invisible() {
    let input = "<p title=\"grüße\">日本語 🦀 &amp; <b>x</b></p><!-- ü -->";
    let expected = dom::dump(&parse(input).unwrap());

    for chunk_size in 1..=5 {
        let mut session = Session::new().unwrap();
        for chunk in input.as_bytes().chunks(chunk_size) {
            session.feed(chunk).unwrap();
        }
        let document = session.end().unwrap();
        assert_eq!(dom::dump(&document), expected);
    }
}

#[test]
fn test_empty_feeds() {
    let mut session = Session::new().unwrap();
    session.feed("").unwrap();
    session.feed("<p>").unwrap();
    session.feed(b"").unwrap();
    let document = session.end().unwrap();
    assert_eq!(
        dom::dump(&document),
        "| <html>\n|   <head>\n|   <body>\n|     <p>\n"
    );
}

#[test]
fn test_state_transitions() {
    let mut session = Session::new().unwrap();
    assert_eq!(session.state(), SessionState::Created);
    session.feed("x").unwrap();
    assert_eq!(session.state(), SessionState::Feeding);
    let document = session.end().unwrap();
    assert_eq!(session.state(), SessionState::Ended);
    assert!(std::rc::Rc::ptr_eq(&document, session.document()));
    session.destroy().unwrap();
}

#[test]
fn test_end_without_feed() {
    let mut session = Session::new().unwrap();
    let document = session.end().unwrap();
    assert_eq!(dom::dump(&document), "| <html>\n|   <head>\n|   <body>\n");
}

#[test]
#[should_panic(expected = "end() called twice")]
fn test_end_twice() {
    let mut session = Session::new().unwrap();
    session.feed("x").unwrap();
    session.end().unwrap();
    let _ = session.end();
}

#[test]
#[should_panic(expected = "precondition violation")]
fn test_feed_after_end() {
    let mut session = Session::new().unwrap();
    session.end().unwrap();
    let _ = session.feed("x");
}

#[test]
fn test_host_error_is_returned_unchanged() {
    let mut session = Session::with_tree_builder(Tripwire::default()).unwrap();
    session.feed("<p>fine</p>").unwrap();
    let err = session.feed("<!--boom--><!--later-->").unwrap_err();
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(
        err,
        Error::HostCallback {
            callback: "new_comment",
            ..
        }
    ));
    assert_eq!(err.source().unwrap().to_string(), "tripped over \"boom\"");

    // nothing was called after the failure
    assert_eq!(session.tree_builder().comments_seen, 1);

    let tripped = err
        .into_host_error()
        .unwrap()
        .downcast::<Tripped>()
        .unwrap();
    assert_eq!(tripped.0, "boom");
}

#[test]
fn test_host_error_in_final_chunk() {
    let mut session = Session::with_tree_builder(Tripwire::default()).unwrap();
    // the comment is only complete once the parser sees the end of input
    session.feed("<p>x<!--boom").unwrap();
    let err = session.end().unwrap_err();
    assert!(matches!(err, Error::HostCallback { callback: "new_comment", .. }));
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
#[should_panic(expected = "precondition violation")]
fn test_feed_after_failure() {
    let mut session = Session::with_tree_builder(Tripwire::default()).unwrap();
    session.feed("<!--boom-->").unwrap_err();
    let _ = session.feed("x");
}

#[test]
#[should_panic(expected = "kaboom")]
fn test_panic_is_resumed() {
    let builder = Tripwire {
        panic: true,
        ..Tripwire::default()
    };
    let mut session = Session::with_tree_builder(builder).unwrap();
    let _ = session.feed("<!--boom-->");
}

#[test]
fn test_new_document_failure() {
    struct NoDocument;

    impl TreeBuilder for NoDocument {
        type Node = ();

        fn new_document(&mut self) -> BuildResult<()> {
            Err("no documents today".into())
        }

        fn new_element(&mut self, _: &str, _: &str) -> BuildResult<()> {
            unreachable!()
        }

        fn element_add_template_contents(&mut self, _: &()) -> BuildResult<()> {
            unreachable!()
        }

        fn element_add_attribute_if_missing(
            &mut self,
            _: &(),
            _: &str,
            _: &str,
            _: &str,
        ) -> BuildResult<()> {
            unreachable!()
        }

        fn new_comment(&mut self, _: &str) -> BuildResult<()> {
            unreachable!()
        }

        fn append_doctype_to_document(
            &mut self,
            _: &(),
            _: &str,
            _: &str,
            _: &str,
        ) -> BuildResult<()> {
            unreachable!()
        }

        fn append_node(&mut self, _: &(), _: &()) -> BuildResult<()> {
            unreachable!()
        }

        fn append_text(&mut self, _: &(), _: &str) -> BuildResult<()> {
            unreachable!()
        }

        fn insert_node_before_sibling(&mut self, _: &(), _: &()) -> BuildResult<bool> {
            unreachable!()
        }

        fn insert_text_before_sibling(&mut self, _: &(), _: &str) -> BuildResult<bool> {
            unreachable!()
        }

        fn reparent_children(&mut self, _: &(), _: &()) -> BuildResult<()> {
            unreachable!()
        }

        fn remove_from_parent(&mut self, _: &()) -> BuildResult<()> {
            unreachable!()
        }
    }

    let err = match Session::with_tree_builder(NoDocument) {
        Ok(_) => panic!("session constructed without a document"),
        Err(err) => err,
    };
    assert_eq!(
        err.to_string(),
        "tree builder failed in new_document: no documents today"
    );
}

#[test]
fn test_release_policies() {
    let input = "<p>a</p><p>b</p><!--c--><!--d--><div>e</div>";

    let mut eager = Session::new().unwrap();
    eager.feed(input).unwrap();

    let options = SessionOptions::default().release_policy(ReleasePolicy::WhenUnreferenced);
    let mut lazy = Session::with_options(DomBuilder::new(), options).unwrap();
    lazy.feed(input).unwrap();

    // document, html, head, body, 2x p, 2x comment, div
    assert!(eager.live_handles() >= 9);
    assert!(lazy.live_handles() < eager.live_handles());

    let eager_document = eager.end().unwrap();
    let lazy_document = lazy.end().unwrap();
    assert_eq!(eager.live_handles(), 0);
    assert_eq!(lazy.live_handles(), 0);
    assert_eq!(dom::dump(&eager_document), dom::dump(&lazy_document));
}

#[test]
fn test_boxed_tree_builder() {
    let builder: Box<dyn TreeBuilder<Node = dom::Handle>> = Box::new(DomBuilder::new());
    let document = parse_with(builder, "<p>x").unwrap();
    assert_eq!(dom::dump(&document), dom::dump(&parse("<p>x").unwrap()));
}

#[test]
fn test_etree() {
    let document = parse_with(
        EtreeBuilder::new(),
        "<!DOCTYPE html><!--dropped--><p class=a>one<br>two</p><p>three",
    )
    .unwrap();
    let EtreeNode::Tree(ref tree) = document else {
        panic!("expected a tree, got {:?}", document);
    };

    assert_eq!(tree.doctype().unwrap().name, "html");
    let root = tree.root().unwrap();
    assert_eq!(
        root.to_string(),
        "<html><head></head><body><p class=\"a\">one<br></br>two</p><p>three</p></body></html>"
    );

    let body = root.children()[1].clone();
    let p = body.children()[0].clone();
    assert_eq!(p.text().as_deref(), Some("one"));
    assert_eq!(p.children()[0].tail().as_deref(), Some("two"));
    assert_eq!(p.get("class").as_deref(), Some("a"));
}

#[test]
fn test_template_contents() {
    let document = parse("<template><b>x</b></template>").unwrap();
    let head = child(&child(&document, 0), 0);
    let template = child(&head, 0);

    assert!(template.children.borrow().is_empty());
    let contents = template.template_contents().unwrap();
    assert!(matches!(contents.data, NodeData::DocumentFragment));
    assert_eq!(
        dom::dump(&contents),
        "| <b>\n|   \"x\"\n"
    );
}

#[test]
fn test_parse_errors_are_recorded() {
    let mut session = Session::new().unwrap();
    session.feed("<!DOCTYPE html><p></div>").unwrap();
    session.end().unwrap();
    assert!(!session.tree_builder().errors().is_empty());

    let mut session = Session::new().unwrap();
    session.feed("<!DOCTYPE html><p>fine</p>").unwrap();
    session.end().unwrap();
    assert_eq!(session.tree_builder().errors(), &[] as &[String]);
}

#[test]
fn test_quirks_mode() {
    fn quirks_mode(input: &str) -> QuirksMode {
        match parse(input).unwrap().data {
            NodeData::Document { ref quirks_mode } => quirks_mode.get(),
            _ => unreachable!(),
        }
    }

    assert_eq!(quirks_mode("<p>x"), QuirksMode::Quirks);
    assert_eq!(quirks_mode("<!DOCTYPE html><p>x"), QuirksMode::NoQuirks);
    assert_eq!(
        quirks_mode(concat!(
            r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Transitional//EN" "#,
            r#""http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd">"#,
        )),
        QuirksMode::LimitedQuirks
    );
}

#[test]
fn test_foster_parenting() {
    let document = parse("<table>a<tr><td>b</td></tr>c</table>").unwrap();
    assert_eq!(
        dom::dump(&document),
        concat!(
            "| <html>\n",
            "|   <head>\n",
            "|   <body>\n",
            "|     \"ac\"\n",
            "|     <table>\n",
            "|       <tbody>\n",
            "|         <tr>\n",
            "|           <td>\n",
            "|             \"b\"\n",
        )
    );
}

#[test]
fn test_sessions_on_threads() {
    let threads: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let input = format!("<p>{}<!--boom-->", i);
                let mut session = Session::with_tree_builder(Tripwire::default()).unwrap();
                let failed = session.feed(&input).is_err();
                let fine = dom::dump(&parse(&input).unwrap());
                (failed, fine)
            })
        })
        .collect();

    for (i, thread) in threads.into_iter().enumerate() {
        let (failed, fine) = thread.join().unwrap();
        assert!(failed);
        assert!(fine.contains(&format!("\"{}\"", i)));
    }
}
