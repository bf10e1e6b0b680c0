/// Parse HTML from stdin (or a file) in fixed-size chunks and print the resulting tree.
///
/// ```text
/// echo '<p>hello<b>world' | cargo run --example build_tree -- --chunk-size 3
/// ```
use std::fs::File;
use std::io::{stdin, Read};
use std::process::ExitCode;

use argh::FromArgs;
use html5bridge::{dom, EtreeBuilder, Session, SessionOptions, TreeBuilder};

/// Build a tree from HTML, feeding the parser chunk by chunk.
#[derive(FromArgs)]
struct Cli {
    /// size of the chunks fed to the parser, in bytes
    #[argh(option, default = "8192")]
    chunk_size: usize,

    /// build an ElementTree and print it as XML, instead of dumping the DOM
    #[argh(switch)]
    etree: bool,

    /// print parse errors after the tree
    #[argh(switch)]
    errors: bool,

    /// read from this file instead of stdin
    #[argh(positional)]
    path: Option<String>,
}

fn run<B: TreeBuilder>(
    builder: B,
    mut input: impl Read,
    chunk_size: usize,
) -> Result<Session<B>, Box<dyn std::error::Error>> {
    let mut session = Session::with_options(builder, SessionOptions::default())?;
    let mut buf = vec![0; chunk_size.max(1)];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        session.feed(&buf[..n])?;
    }
    session.end()?;
    Ok(session)
}

fn main() -> ExitCode {
    let cli: Cli = argh::from_env();

    let input: Box<dyn Read> = match cli.path {
        Some(ref path) => match File::open(path) {
            Ok(file) => Box::new(file),
            Err(e) => {
                eprintln!("{}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => Box::new(stdin().lock()),
    };

    let result = if cli.etree {
        run(EtreeBuilder::new(), input, cli.chunk_size).map(|session| {
            let tree = session.document().as_tree().cloned();
            if let Some(doctype) = tree.as_ref().and_then(|tree| tree.doctype()) {
                println!("<!DOCTYPE {}>", doctype.name);
            }
            if let Some(root) = tree.and_then(|tree| tree.root()) {
                println!("{}", root);
            }
        })
    } else {
        run(dom::DomBuilder::new(), input, cli.chunk_size).map(|session| {
            print!("{}", dom::dump(session.document()));
            if cli.errors {
                let builder = session.tree_builder();
                println!("\nParse errors:");
                for error in builder.errors() {
                    println!("    {}", error);
                }
            }
        })
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
