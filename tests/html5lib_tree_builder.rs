// The .dat parsing and the reference serializer follow html5ever's own test harness.
//
// Copyright 2014-2017 The html5ever Project Developers. See the
// COPYRIGHT file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use glob::glob;
use libtest_mimic::{self, Arguments, Trial};

use html5bridge::capi::ParserOptions;
use html5bridge::{dom, testutils::trace_log, DomBuilder, Session, SessionOptions};
use html5ever::tendril::TendrilSink;
use html5ever::{namespace_url, ns};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use pretty_assertions::assert_eq;

mod testutils;

/// Documents exercising every tree operation, compared against html5ever's own DOM.
const CORPUS: &[(&str, &str)] = &[
    ("empty", ""),
    ("text-only", "hello world"),
    ("doctype", "<!DOCTYPE html><title>t</title>"),
    (
        "legacy-doctype",
        concat!(
            r#"<!DOCTYPE html PUBLIC "-//W3C//DTD HTML 4.01//EN" "#,
            r#""http://www.w3.org/TR/html4/strict.dtd"><p>x"#,
        ),
    ),
    (
        "comments",
        "<!-- before --><html><!-- inside --><p>a<!-- c -->b</p></html><!-- after -->",
    ),
    ("bogus-comment", "<?xml version=\"1.0\"?><p>x"),
    ("foster-parenting-text", "<table>foo<tr><td>bar</td></tr>baz</table>"),
    ("foster-parenting-elements", "<table><b>x<tr><td>y</table>z"),
    ("foster-parenting-nested", "<table><tr><td><table>a<tr>b</table></td></tr></table>"),
    ("adoption-agency", "<b>1<p>2</b>3</p>"),
    ("adoption-agency-nested", "<a><p><a>x</a></p></a><i><b><u>y</i>z"),
    ("misnested-formatting", "<p><b><i>x</p>y</i>z"),
    ("template", "<template><td>cell</td><p>para</template>"),
    ("nested-template", "<template><template><b>x</b></template></template>"),
    ("template-in-table", "<table><template><tr><td>x</td></tr></template></table>"),
    (
        "svg",
        r#"<svg viewBox="0 0 1 1"><foreignObject><p>x</p></foreignObject><path d="M0"/></svg>"#,
    ),
    ("svg-xlink", r##"<svg><a xlink:href="#a" xml:lang="en">x</a></svg>"##),
    (
        "mathml",
        "<math><mi>x</mi><annotation-xml encoding=\"text/html\"><p>y</p></annotation-xml></math>",
    ),
    ("duplicate-attributes", r#"<p a=1 b=2 a=3>x"#),
    ("html-attributes-merged", "<html a=1><body><html b=2 a=3>"),
    ("body-attributes-merged", "<body x=1><body y=2 x=3>"),
    ("implied-end-tags", "<ul><li>one<li>two</ul><dl><dt>a<dd>b</dl>"),
    ("select", "<select><option>a<option>b<optgroup><option>c</select>"),
    ("frameset", "<frameset><frame></frameset><noframes>x</noframes>"),
    ("script-and-style", "<script>if (a < b) {}</script><style>p > a {}</style>"),
    ("textarea-newline", "<textarea>\nfirst</textarea><pre>\n\nx</pre>"),
    ("entities", "&amp; &lt;&gt &notin; &#x1F600; &bogus;"),
    ("unicode", "<p>grüße, 日本語, 🦀</p>"),
    ("stray-end-tags", "</p></div>x</br></html>y"),
    ("after-body-text", "<body></body> <!-- x --> text"),
    ("table-in-paragraph", "<p><table><tr><td>x</td></tr></table>"),
    ("heading-nesting", "<h1><h2>x</h1>y"),
    ("form-pointer", "<form><div><form>x</form></div></form>"),
    ("null-bytes", "a\0b<p\0>c"),
];

fn rcdom_dump(input: &str) -> String {
    let rcdom = html5ever::parse_document(RcDom::default(), Default::default())
        .from_utf8()
        .one(input.as_bytes());
    let mut buf = String::new();
    for child in rcdom.document.children.borrow().iter() {
        serialize(&mut buf, 1, child);
    }
    buf
}

fn parse_in_chunks(input: &str, chunk_size: usize, scripting: bool) -> dom::Handle {
    let options = SessionOptions::default().parser(ParserOptions {
        scripting_enabled: scripting,
        ..ParserOptions::default()
    });
    let mut session = Session::with_options(DomBuilder::new(), options).unwrap();
    for chunk in input.as_bytes().chunks(chunk_size.max(1)) {
        session.feed(chunk).unwrap();
    }
    session.end().unwrap()
}

fn build_differential_test(name: &'static str, input: &'static str) -> Trial {
    Trial::test(format!("differential:{}", name), move || {
        testutils::catch_unwind_and_report(move || {
            let expected = rcdom_dump(input);
            let document = html5bridge::parse(input).unwrap();
            assert_eq!(dom::dump(&document), expected);
        })
    })
}

fn build_chunked_test(name: &'static str, input: &'static str) -> Trial {
    Trial::test(format!("chunked:{}", name), move || {
        testutils::catch_unwind_and_report(move || {
            let expected = dom::dump(&html5bridge::parse(input).unwrap());
            // one byte at a time splits every multi-byte character
            for chunk_size in [1, 2, 3, 7] {
                let document = parse_in_chunks(input, chunk_size, true);
                assert_eq!(dom::dump(&document), expected, "chunk size {}", chunk_size);
            }
        })
    })
}

#[derive(Default, Debug, Clone)]
struct Testcase {
    data: String,
    errors: Option<String>,
    new_errors: Option<String>,
    document_fragment: Option<String>,
    script_off: Option<String>,
    script_on: Option<String>,
    document: Option<String>,
}

impl Testcase {
    fn parse(path: &Path, iter: impl Iterator<Item = std::io::Result<Vec<u8>>>) -> Option<Self> {
        let mut rv = Testcase::default();
        let mut current_field: Option<&mut String> = Some(&mut rv.data);
        let mut has_errors = false;

        for line in iter {
            let line = String::from_utf8(line.unwrap()).unwrap();

            match line.as_str() {
                "#data" => {
                    if let Some(ref mut field) = current_field {
                        if field.ends_with("\n\n") {
                            field.pop();
                        }

                        if has_errors {
                            return Some(rv);
                        }
                    }
                }
                "#errors" => {
                    current_field = Some(rv.errors.get_or_insert_with(Default::default));
                    has_errors = true;
                }
                "#new-errors" => {
                    current_field = Some(rv.new_errors.get_or_insert_with(Default::default))
                }
                "#document-fragment" => {
                    current_field = Some(rv.document_fragment.get_or_insert_with(Default::default))
                }
                "#script-on" => {
                    current_field = Some(rv.script_on.get_or_insert_with(Default::default))
                }
                "#script-off" => {
                    current_field = Some(rv.script_off.get_or_insert_with(Default::default))
                }
                "#document" => {
                    current_field = Some(rv.document.get_or_insert_with(Default::default))
                }
                x => match current_field {
                    Some(ref mut current_field) => {
                        current_field.push_str(x);
                        current_field.push('\n');
                    }
                    None => {
                        panic!("{:?}: Unexpected character: {:?}", path, x);
                    }
                },
            }
        }

        None
    }
}

fn produce_testcases_from_file(tests: &mut Vec<Trial>, path: &Path) {
    let fname = path.file_name().unwrap().to_str().unwrap();

    let mut lines_iter = BufReader::new(File::open(path).unwrap())
        .split(b'\n')
        .peekable();

    let mut i = 0;

    while let Some(testcase) = Testcase::parse(path, &mut lines_iter) {
        i += 1;

        // sessions always parse whole documents
        if testcase.document_fragment.is_some() {
            continue;
        }

        if testcase.script_on.is_none() {
            tests.push(build_dat_test(testcase.clone(), fname, i, false));
        }

        if testcase.script_off.is_none() {
            tests.push(build_dat_test(testcase, fname, i, true));
        }
    }
}

fn build_dat_test(testcase: Testcase, fname: &str, i: usize, scripting: bool) -> Trial {
    let scripting_text = if scripting { "yesscript" } else { "noscript" };
    Trial::test(format!("{}:{}:{scripting_text}", fname, i), move || {
        testutils::catch_unwind_and_report(move || {
            trace_log(&format!("{:#?}", testcase));
            let input = testcase.data.trim_end_matches('\n');
            let document = parse_in_chunks(input, input.len(), scripting);
            assert_eq!(dom::dump(&document), testcase.document.unwrap());
        })
    })
}

fn serialize(buf: &mut String, indent: usize, node: &Handle) {
    buf.push('|');
    buf.push_str(&" ".repeat(indent));

    match node.data {
        NodeData::Document => panic!("should not reach Document"),

        NodeData::Doctype {
            ref name,
            ref public_id,
            ref system_id,
        } => {
            buf.push_str("<!DOCTYPE ");
            buf.push_str(name);
            if !public_id.is_empty() || !system_id.is_empty() {
                buf.push_str(&format!(" \"{}\" \"{}\"", public_id, system_id));
            }
            buf.push_str(">\n");
        }

        NodeData::Text { ref contents } => {
            buf.push('"');
            buf.push_str(&contents.borrow());
            buf.push_str("\"\n");
        }

        NodeData::Comment { ref contents } => {
            buf.push_str("<!-- ");
            buf.push_str(contents);
            buf.push_str(" -->\n");
        }

        NodeData::Element {
            ref name,
            ref attrs,
            ..
        } => {
            buf.push('<');
            match name.ns {
                ns!(svg) => buf.push_str("svg "),
                ns!(mathml) => buf.push_str("math "),
                _ => (),
            }
            buf.push_str(&name.local);
            buf.push_str(">\n");

            let mut attrs = attrs.borrow().clone();
            attrs.sort_by(|x, y| {
                (&*x.name.local, &*x.name.ns).cmp(&(&*y.name.local, &*y.name.ns))
            });

            for attr in attrs.into_iter() {
                buf.push('|');
                buf.push_str(&" ".repeat(indent + 2));
                match attr.name.ns {
                    ns!(xlink) => buf.push_str("xlink "),
                    ns!(xml) => buf.push_str("xml "),
                    ns!(xmlns) => buf.push_str("xmlns "),
                    _ => (),
                }
                buf.push_str(&format!("{}=\"{}\"\n", attr.name.local, attr.value));
            }
        }

        NodeData::ProcessingInstruction { .. } => unreachable!(),
    }

    for child in node.children.borrow().iter() {
        serialize(buf, indent + 2, child);
    }

    if let NodeData::Element {
        ref template_contents,
        ..
    } = node.data
    {
        if let Some(ref content) = &*template_contents.borrow() {
            buf.push('|');
            buf.push_str(&" ".repeat(indent + 2));
            buf.push_str("content\n");
            for child in content.children.borrow().iter() {
                serialize(buf, indent + 4, child);
            }
        }
    }
}

fn main() {
    let args = Arguments::from_args();
    let mut tests = Vec::new();

    for &(name, input) in CORPUS {
        tests.push(build_differential_test(name, input));
        tests.push(build_chunked_test(name, input));
    }

    // checkout of https://github.com/html5lib/html5lib-tests, optional
    for entry in glob("tests/html5lib-tests/tree-construction/*.dat").unwrap() {
        produce_testcases_from_file(&mut tests, &entry.unwrap());
    }

    libtest_mimic::run(&args, tests).exit();
}
