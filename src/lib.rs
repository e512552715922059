#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation, // TODO
    clippy::too_many_lines, // TODO
)]

pub mod buffer;
pub mod client;
pub mod connection;
pub mod error;
pub mod flags;
pub mod flow_control;
pub mod frame;
pub mod hpack;
pub mod http1;
pub mod huffman;
pub mod pool;
pub mod request;
pub mod response;
pub mod settings;
pub mod socket;
pub mod stream;
pub mod stream_coordinator;
pub mod types;

pub use bytes::Bytes;
pub use client::{Breaker, Client, Config};
pub use error::{Error, ErrorCategory, Result};
pub use request::{Method, Request};
pub use response::Response;
pub use types::Protocol;
pub use url::Url;
