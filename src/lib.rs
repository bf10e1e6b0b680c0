#![deny(missing_docs)]
// The parser runs behind a C ABI, every unsafe operation has to say why it is fine.
#![deny(unsafe_op_in_unsafe_fn)]
#![doc = include_str!("../README.md")]

pub mod capi;
mod dispatch;
pub mod dom;
mod error;
pub mod etree;
mod fault;
mod registry;
mod session;
#[doc(hidden)]
pub mod testutils;
mod tree_builder;
mod utils;

pub use dom::DomBuilder;
pub use error::{BoxError, Error};
pub use etree::EtreeBuilder;
pub use registry::{Handle, HandleRegistry, ReleasePolicy};
pub use session::{parse, parse_with, Session, SessionOptions, SessionState};
pub use tree_builder::{BuildResult, QuirksMode, TreeBuilder};
