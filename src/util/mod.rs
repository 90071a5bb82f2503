//! Small helpers shared by the configuration layer and file exporters.

mod fs;
mod link;

pub use fs::write_atomic;
pub use link::{validate_feed_link, UrlValidationError};
