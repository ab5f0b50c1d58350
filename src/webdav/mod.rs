pub mod client;
pub mod config;
pub mod connection;
pub mod props;
pub mod xml;

pub use client::{Depth, PutOutcome, WebDavClient};
pub use config::{RetryConfig, WebDavConfig};
pub use connection::{ServerCapabilities, WebDavConnection};
pub use props::{href_to_relative, ListedResource};
pub use xml::ResourceProps;
