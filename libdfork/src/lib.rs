// Library crate for dfork: copy-on-write image forking on top of an object
// store. The CLI in `dfork/` is a thin layer over `client::DforkClient`.

pub mod cache;
pub mod client;
pub mod cls;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod locations;
pub mod locator;
pub mod object_map;
pub mod progress;
pub mod protocol;
pub mod request;
pub mod store;
pub mod throttle;

pub use client::DforkClient;
pub use config::DforkConfig;
pub use error::{DforkError, Result};
pub use identity::ImageIdentity;
pub use protocol::DirtyProtocol;
