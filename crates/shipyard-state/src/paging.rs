//! Listing windows.

use serde::{Deserialize, Serialize};

/// A page of records in ID order. `page` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub page: u32,
    /// Records per page; `None` returns everything from `page` 0.
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl Paging {
    /// Every live record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn page(page: u32, per_page: u32) -> Self {
        Self {
            page,
            per_page: Some(per_page),
            include_deleted: false,
        }
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub(crate) fn skip(&self) -> usize {
        match self.per_page {
            Some(per_page) => self.page as usize * per_page as usize,
            None => 0,
        }
    }

    pub(crate) fn take(&self) -> usize {
        self.per_page.map_or(usize::MAX, |p| p as usize)
    }
}
