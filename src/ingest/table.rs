//! Table descriptions

use serde::{Deserialize, Serialize};
use std::fmt;

/// How pages of a table are addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagingMode {
    /// "Greater than last seen key" filtering on the primary key
    Cursor,
    /// `skip`/`top` numeric windows
    Offset,
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cursor => write!(f, "cursor"),
            Self::Offset => write!(f, "offset"),
        }
    }
}

/// Immutable description of one remote table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    name: String,
    primary_key: Option<String>,
    page_size: usize,
    chunk_size: usize,
}

impl TableSpec {
    /// Create a table spec. A primary key selects cursor paging.
    pub fn new(
        name: impl Into<String>,
        primary_key: Option<String>,
        page_size: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.filter(|k| !k.is_empty()),
            page_size: page_size.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Offset-paged table
    pub fn offset(name: impl Into<String>, page_size: usize) -> Self {
        Self::new(name, None, page_size, page_size)
    }

    /// Cursor-paged table keyed on `primary_key`
    pub fn cursor(name: impl Into<String>, primary_key: impl Into<String>, chunk_size: usize) -> Self {
        Self::new(name, Some(primary_key.into()), chunk_size, chunk_size)
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary key column, if declared
    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    /// Paging mode implied by the primary key
    pub fn paging_mode(&self) -> PagingMode {
        if self.primary_key.is_some() {
            PagingMode::Cursor
        } else {
            PagingMode::Offset
        }
    }

    /// Records per offset page
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Records per cursor page
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Records requested per page in the table's paging mode
    pub fn request_size(&self) -> usize {
        match self.paging_mode() {
            PagingMode::Cursor => self.chunk_size,
            PagingMode::Offset => self.page_size,
        }
    }
}
