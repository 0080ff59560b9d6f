use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::MapSegment;

/// Immutable, reference-counted view of one page image.
///
/// A view pins whatever owns the backing bytes (a data-file mapping segment,
/// a scratch-file mapping, or an owned buffer) so the bytes stay valid for as
/// long as the view is alive, independent of later file growth or remapping.
pub struct PageView {
    ptr: *const u8,
    len: usize,
    _owner: ViewOwner,
}

enum ViewOwner {
    Segment(Arc<MapSegment>),
    Pinned(Arc<dyn Any + Send + Sync>),
    Owned(Arc<[u8]>),
}

// The view is a read-only window into memory whose owner is Send + Sync and
// whose bytes are never mutated while any view exists (scratch slots are only
// rewritten after generation-based reclamation proves no view can remain).
unsafe impl Send for PageView {}
unsafe impl Sync for PageView {}

impl PageView {
    pub(crate) fn mapped(segment: Arc<MapSegment>, off: usize, len: usize) -> Self {
        let slice = segment
            .bytes()
            .expect("mapped view requires a live mapping");
        assert!(off + len <= slice.len(), "mapped view out of segment bounds");
        let ptr = slice[off..off + len].as_ptr();
        Self {
            ptr,
            len,
            _owner: ViewOwner::Segment(segment),
        }
    }

    /// Wraps an owned buffer.
    pub fn owned(data: Arc<[u8]>) -> Self {
        let ptr = data.as_ptr();
        let len = data.len();
        Self {
            ptr,
            len,
            _owner: ViewOwner::Owned(data),
        }
    }

    /// Builds a view over raw memory kept alive by `owner`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and unmutated for as long as `owner`
    /// is retained by this view.
    pub(crate) unsafe fn pinned(
        owner: Arc<dyn Any + Send + Sync>,
        ptr: *const u8,
        len: usize,
    ) -> Self {
        Self {
            ptr,
            len,
            _owner: ViewOwner::Pinned(owner),
        }
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        // Validity is guaranteed by the pinned owner; see constructors.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Deref for PageView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for PageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageView").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_view_exposes_bytes() {
        let data: Arc<[u8]> = vec![1u8, 2, 3, 4].into();
        let view = PageView::owned(data);
        assert_eq!(&view[..], &[1, 2, 3, 4]);
        assert_eq!(view.data().len(), 4);
    }
}
