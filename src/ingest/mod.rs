//! Paginated ingestion pipeline
//!
//! Pulls remote tables page by page, retrying transient failures, bounding
//! concurrent requests, checkpointing progress after every staged page and
//! swapping complete tables into the local store.

mod cancel;
mod checkpoint;
mod ingestor;
mod limiter;
mod pager;
mod retry;
mod source;
mod table;

#[cfg(test)]
pub(crate) mod test_support;

pub use cancel::*;
pub use checkpoint::*;
pub use ingestor::*;
pub use limiter::*;
pub use pager::*;
pub use retry::*;
pub use source::*;
pub use table::*;
