//! Progress reporting module
//!
//! Terminal feedback for transfers and table refreshes.

mod reporter;

pub use reporter::*;
