use std::collections::HashMap;
use std::collections::hash_map::Entry;

use thiserror::Error;

use crate::file::{FileId, PageNo};
use crate::replacer::FrameId;

/// Errors from the page mapping table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageTableError {
    /// The (file, page) pair is already mapped to a frame.
    #[error("page {1} of file {0:?} is already mapped")]
    Duplicate(FileId, PageNo),
    /// The (file, page) pair has no mapping.
    #[error("page {1} of file {0:?} has no mapping")]
    Missing(FileId, PageNo),
}

/// Maps (file, page) pairs to the frame currently caching them.
///
/// Keys are unique: a page lives in at most one frame, and the descriptor
/// table is the authority on the reverse direction.
#[derive(Debug, Default)]
pub struct PageTable {
    map: HashMap<(FileId, PageNo), FrameId>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the frame caching (file, page_no). A miss is ordinary
    /// control flow for callers, so this is an `Option`, not an error.
    pub fn get(&self, file: FileId, page_no: PageNo) -> Option<FrameId> {
        self.map.get(&(file, page_no)).copied()
    }

    /// Registers a mapping; fails if the pair is already mapped.
    pub fn insert(
        &mut self,
        file: FileId,
        page_no: PageNo,
        frame_id: FrameId,
    ) -> Result<(), PageTableError> {
        match self.map.entry((file, page_no)) {
            Entry::Occupied(_) => Err(PageTableError::Duplicate(file, page_no)),
            Entry::Vacant(slot) => {
                slot.insert(frame_id);
                Ok(())
            }
        }
    }

    /// Drops a mapping, returning the frame it pointed at.
    pub fn remove(&mut self, file: FileId, page_no: PageNo) -> Result<FrameId, PageTableError> {
        self.map
            .remove(&(file, page_no))
            .ok_or(PageTableError::Missing(file, page_no))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F1: FileId = FileId(1);
    const F2: FileId = FileId(2);

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = PageTable::new();
        table.insert(F1, 7, 0).unwrap();

        assert_eq!(table.get(F1, 7), Some(0));
        assert_eq!(table.get(F1, 8), None);
        assert_eq!(table.len(), 1);

        assert_eq!(table.remove(F1, 7), Ok(0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = PageTable::new();
        table.insert(F1, 7, 0).unwrap();

        let err = table.insert(F1, 7, 3).unwrap_err();
        assert_eq!(err, PageTableError::Duplicate(F1, 7));
        // original mapping untouched
        assert_eq!(table.get(F1, 7), Some(0));
    }

    #[test]
    fn test_remove_missing() {
        let mut table = PageTable::new();
        assert_eq!(table.remove(F1, 7), Err(PageTableError::Missing(F1, 7)));
    }

    #[test]
    fn test_same_page_no_different_files() {
        let mut table = PageTable::new();
        table.insert(F1, 7, 0).unwrap();
        table.insert(F2, 7, 1).unwrap();

        assert_eq!(table.get(F1, 7), Some(0));
        assert_eq!(table.get(F2, 7), Some(1));
    }
}
