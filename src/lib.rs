pub mod config;
pub mod errors;
pub mod sync;
pub mod webdav;

pub use config::Settings;
pub use errors::{SyncError, WebDavError};
