use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::file::{FileId, PageFile, PageNo};
use crate::frame::FrameDesc;
use crate::page::Page;
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, FrameId, Replacer};

/// Errors returned by the buffer manager.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The buffer pool lock was poisoned.
    #[error("buffer pool lock poisoned")]
    LockPoisoned,
    /// The file was never registered with this pool.
    #[error("file {0:?} is not registered with the buffer pool")]
    UnknownFile(FileId),
    /// The page is not resident in the pool.
    #[error("page {page_no} of file {file:?} is not in the buffer pool")]
    PageNotFound { file: FileId, page_no: PageNo },
    /// Unpin was called on a page nobody holds pinned.
    #[error("page {page_no} of file {file:?} is not pinned")]
    PageNotPinned { file: FileId, page_no: PageNo },
    /// Every frame is pinned; no victim exists.
    #[error("all buffer frames are pinned")]
    AllFramesPinned,
    /// A file flush ran into a page that is still in use.
    #[error("page {page_no} of file {file:?} is still pinned")]
    PagePinned { file: FileId, page_no: PageNo },
    /// The page table and descriptor table disagree. Signals a bug, not a
    /// recoverable condition.
    #[error("page table out of sync for page {page_no} of file {file:?}")]
    PageTableCorrupted { file: FileId, page_no: PageNo },
    /// A frame descriptor is in a state the lifecycle cannot produce.
    #[error("frame {frame_id} descriptor state is inconsistent")]
    InconsistentFrame { frame_id: FrameId },
    /// The page file collaborator failed.
    #[error("page file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for buffer manager results.
pub type BufferResult<T> = Result<T, BufferError>;

/// Guard that provides access to a pinned page while holding the pool lock.
///
/// Dropping the guard only releases the lock; the pin it was handed out with
/// stays until [`BufferManager::unpin_page`]. A pin is a promise "do not
/// evict me", not a lock against other readers.
pub struct PageGuard<'a> {
    state: MutexGuard<'a, BufferState>,
    frame_id: FrameId,
}

impl PageGuard<'_> {
    /// Returns the frame id backing this guard.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page number this guard pins.
    pub fn page_no(&self) -> PageNo {
        self.state.frames[self.frame_id].page_no
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.state.pool[self.frame_id]
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.pool[self.frame_id]
    }
}

struct BufferState {
    files: HashMap<FileId, Box<dyn PageFile>>,
    next_file_id: u32,
    frames: Vec<FrameDesc>,
    pool: Vec<Page>,
    page_table: PageTable,
    replacer: ClockReplacer,
}

impl Drop for BufferState {
    // Write unflushed pages back before the pool goes away. Failures here
    // have no caller to report to; they are logged and the page is lost.
    fn drop(&mut self) {
        for frame_id in 0..self.frames.len() {
            let desc = &self.frames[frame_id];
            if !desc.valid || !desc.dirty {
                continue;
            }
            let Some(owner) = desc.owner else { continue };
            let Some(file) = self.files.get_mut(&owner) else {
                continue;
            };
            if let Err(error) = file.write_page(desc.page_no, self.pool[frame_id].data()) {
                warn!(
                    "failed to write back page {} of file {:?} on shutdown: {}",
                    desc.page_no, owner, error
                );
            }
        }
    }
}

/// Fixed-capacity page cache mediating all access to paged files.
///
/// Callers request a page by (file, page number), receive a pinned guard,
/// mutate it, and release the pin through [`unpin_page`]. The pool decides
/// which pages stay resident and writes dirty victims back before reuse.
///
/// [`unpin_page`]: BufferManager::unpin_page
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<Mutex<BufferState>>,
}

impl BufferManager {
    /// Creates a buffer manager with a fixed number of frames.
    pub fn new(pool_size: usize) -> Self {
        let state = BufferState {
            files: HashMap::new(),
            next_file_id: 0,
            frames: (0..pool_size).map(FrameDesc::new).collect(),
            pool: vec![Page::new(); pool_size],
            page_table: PageTable::new(),
            replacer: ClockReplacer::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock_state(&self) -> BufferResult<MutexGuard<'_, BufferState>> {
        self.inner.lock().map_err(|_| BufferError::LockPoisoned)
    }

    /// Registers a page file and returns the token all other operations
    /// name it by.
    pub fn register_file(&self, file: Box<dyn PageFile>) -> BufferResult<FileId> {
        let mut state = self.lock_state()?;
        let id = FileId(state.next_file_id);
        state.next_file_id += 1;
        state.files.insert(id, file);
        Ok(id)
    }

    /// Picks a frame for a new occupant, evicting the current page if the
    /// frame is still in use by one.
    fn take_victim_frame(state: &mut BufferState) -> BufferResult<FrameId> {
        let frame_id = {
            let BufferState {
                replacer, frames, ..
            } = state;
            replacer
                .victim(frames)
                .ok_or(BufferError::AllFramesPinned)?
        };
        if state.frames[frame_id].valid {
            Self::evict_frame(state, frame_id)?;
        }
        Ok(frame_id)
    }

    /// Write-back, unmap, and reset for a valid victim frame. On a failed
    /// write the frame keeps its content, dirty flag, and mapping, so the
    /// eviction can be retried later.
    fn evict_frame(state: &mut BufferState, frame_id: FrameId) -> BufferResult<()> {
        let BufferState {
            files,
            frames,
            pool,
            page_table,
            ..
        } = state;
        let desc = &mut frames[frame_id];
        let owner = desc
            .owner
            .ok_or(BufferError::InconsistentFrame { frame_id })?;
        if desc.dirty {
            let file = files
                .get_mut(&owner)
                .ok_or(BufferError::UnknownFile(owner))?;
            file.write_page(desc.page_no, pool[frame_id].data())?;
            desc.dirty = false;
        }
        trace!(
            "evicting page {} of file {:?} from frame {}",
            desc.page_no, owner, frame_id
        );
        page_table
            .remove(owner, desc.page_no)
            .map_err(|_| BufferError::PageTableCorrupted {
                file: owner,
                page_no: desc.page_no,
            })?;
        desc.clear();
        Ok(())
    }

    /// Fetches a page and pins it, returning a guarded reference.
    ///
    /// A resident page costs no I/O; otherwise a victim frame is found and
    /// the page is read from its file. Every successful call adds one pin
    /// that the caller must balance with [`unpin_page`].
    ///
    /// [`unpin_page`]: BufferManager::unpin_page
    pub fn fetch_page(&self, file: FileId, page_no: PageNo) -> BufferResult<PageGuard<'_>> {
        let mut state = self.lock_state()?;
        if !state.files.contains_key(&file) {
            return Err(BufferError::UnknownFile(file));
        }

        if let Some(frame_id) = state.page_table.get(file, page_no) {
            let desc = &mut state.frames[frame_id];
            desc.ref_bit = true;
            desc.pin_count += 1;
            trace!("buffer hit for page {} of file {:?}", page_no, file);
            return Ok(PageGuard { state, frame_id });
        }

        debug!(
            "buffer miss for page {} of file {:?}, reading from disk",
            page_no, file
        );
        let frame_id = Self::take_victim_frame(&mut state)?;
        {
            // a failed read leaves the frame free and unmapped
            let BufferState { files, pool, .. } = &mut *state;
            let handle = files.get(&file).ok_or(BufferError::UnknownFile(file))?;
            handle.read_page(page_no, pool[frame_id].data_mut())?;
        }
        if state.page_table.insert(file, page_no, frame_id).is_err() {
            state.frames[frame_id].clear();
            return Err(BufferError::PageTableCorrupted { file, page_no });
        }
        state.frames[frame_id].set(file, page_no);
        Ok(PageGuard { state, frame_id })
    }

    /// Releases one pin on a page; with `mark_dirty` the in-memory copy is
    /// flagged as newer than disk. The dirty flag is sticky: passing `false`
    /// never clears it, only a successful write-back does.
    pub fn unpin_page(&self, file: FileId, page_no: PageNo, mark_dirty: bool) -> BufferResult<()> {
        let mut state = self.lock_state()?;
        let frame_id = state
            .page_table
            .get(file, page_no)
            .ok_or(BufferError::PageNotFound { file, page_no })?;
        let desc = &mut state.frames[frame_id];
        if desc.pin_count == 0 {
            return Err(BufferError::PageNotPinned { file, page_no });
        }
        desc.pin_count -= 1;
        if mark_dirty {
            desc.dirty = true;
        }
        Ok(())
    }

    /// Allocates a brand-new page in `file` and pins it, returning the new
    /// page number and a guard. The slot starts zeroed.
    pub fn allocate_page(&self, file: FileId) -> BufferResult<(PageNo, PageGuard<'_>)> {
        let mut state = self.lock_state()?;
        let page_no = state
            .files
            .get_mut(&file)
            .ok_or(BufferError::UnknownFile(file))?
            .allocate_page()?;
        let frame_id = Self::take_victim_frame(&mut state)?;
        state.pool[frame_id].reset();
        if state.page_table.insert(file, page_no, frame_id).is_err() {
            state.frames[frame_id].clear();
            return Err(BufferError::PageTableCorrupted { file, page_no });
        }
        state.frames[frame_id].set(file, page_no);
        debug!("allocated page {} in file {:?}", page_no, file);
        Ok((page_no, PageGuard { state, frame_id }))
    }

    /// Drops a page from the cache if resident, then releases the page
    /// number back to its file. The file call happens either way and its
    /// result is this method's result.
    pub fn dispose_page(&self, file: FileId, page_no: PageNo) -> BufferResult<()> {
        let mut state = self.lock_state()?;
        if !state.files.contains_key(&file) {
            return Err(BufferError::UnknownFile(file));
        }
        if let Some(frame_id) = state.page_table.get(file, page_no) {
            state.frames[frame_id].clear();
            state.page_table.remove(file, page_no).ok();
        }
        state
            .files
            .get_mut(&file)
            .ok_or(BufferError::UnknownFile(file))?
            .dispose_page(page_no)?;
        Ok(())
    }

    /// Writes a resident page's current bytes through to its file without
    /// evicting it or touching pins.
    pub fn flush_page(&self, file: FileId, page_no: PageNo) -> BufferResult<()> {
        let mut state = self.lock_state()?;
        let frame_id = state
            .page_table
            .get(file, page_no)
            .ok_or(BufferError::PageNotFound { file, page_no })?;
        let BufferState {
            files,
            frames,
            pool,
            ..
        } = &mut *state;
        let handle = files
            .get_mut(&file)
            .ok_or(BufferError::UnknownFile(file))?;
        handle.write_page(page_no, pool[frame_id].data())?;
        frames[frame_id].dirty = false;
        Ok(())
    }

    /// Writes back and releases every resident page of `file`.
    ///
    /// The scan runs in frame order and stops at the first pinned page with
    /// `PagePinned`; frames processed before it stay flushed and freed.
    pub fn flush_file(&self, file: FileId) -> BufferResult<()> {
        let mut state = self.lock_state()?;
        if !state.files.contains_key(&file) {
            return Err(BufferError::UnknownFile(file));
        }
        debug!("flushing file {:?}", file);
        for frame_id in 0..state.frames.len() {
            let desc = &state.frames[frame_id];
            if desc.owner != Some(file) {
                continue;
            }
            if !desc.valid {
                return Err(BufferError::InconsistentFrame { frame_id });
            }
            if desc.pin_count > 0 {
                return Err(BufferError::PagePinned {
                    file,
                    page_no: desc.page_no,
                });
            }
            let page_no = desc.page_no;
            if desc.dirty {
                let BufferState {
                    files,
                    frames,
                    pool,
                    ..
                } = &mut *state;
                let handle = files
                    .get_mut(&file)
                    .ok_or(BufferError::UnknownFile(file))?;
                handle.write_page(page_no, pool[frame_id].data())?;
                frames[frame_id].dirty = false;
            }
            state
                .page_table
                .remove(file, page_no)
                .map_err(|_| BufferError::PageTableCorrupted { file, page_no })?;
            state.frames[frame_id].clear();
        }
        Ok(())
    }

    /// Returns whether (file, page_no) is currently resident.
    pub fn contains(&self, file: FileId, page_no: PageNo) -> BufferResult<bool> {
        Ok(self.lock_state()?.page_table.get(file, page_no).is_some())
    }

    /// Human-readable snapshot of frame occupancy and pin state.
    pub fn dump(&self) -> BufferResult<String> {
        let state = self.lock_state()?;
        let mut out = String::new();
        for desc in &state.frames {
            let line = match desc.owner {
                Some(owner) => format!(
                    "frame {:>3}: file {:?} page {:>6} pin={} dirty={} ref={}\n",
                    desc.frame_id(),
                    owner,
                    desc.page_no,
                    desc.pin_count,
                    desc.dirty,
                    desc.ref_bit
                ),
                None => format!("frame {:>3}: free\n", desc.frame_id()),
            };
            out.push_str(&line);
        }
        Ok(out)
    }
}
