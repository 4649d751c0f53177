//! Pluggable allocation for route private data.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::constants::DEFAULT_PRIVATE_DATA_ALIGNMENT;
use crate::errors::Error;

/// Host allocator hook. Memory handed out must be zeroed.
pub trait RouteAllocator: Send + Sync {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error>;

    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Global-allocator backed default.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl RouteAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        // SAFETY: callers never pass a zero-size layout (see PrivateData::new).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| Error::SysOpFatal(format!("allocation of {} bytes failed", layout.size())))
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Aligned, zero-initialised byte region owned by a route. The engine never
/// reads or writes it.
pub struct PrivateData {
    ptr: NonNull<u8>,
    layout: Layout,
    allocator: Option<Arc<dyn RouteAllocator>>,
}

// SAFETY: the region is plain bytes, exclusively owned by this value; the
// allocator is Send + Sync.
unsafe impl Send for PrivateData {}
unsafe impl Sync for PrivateData {}

impl PrivateData {
    pub(crate) fn new(size: usize, align: usize, allocator: &Arc<dyn RouteAllocator>) -> Result<Self, Error> {
        let align = if align == 0 { DEFAULT_PRIVATE_DATA_ALIGNMENT } else { align };
        let layout = Layout::from_size_align(size, align).map_err(|_| Error::InvalidArg)?;
        if size == 0 {
            // Dangling but aligned; nothing to release.
            let ptr = NonNull::new(align as *mut u8).ok_or(Error::InvalidArg)?;
            return Ok(Self { ptr, layout, allocator: None });
        }
        let ptr = allocator.allocate(layout)?;
        Ok(Self {
            ptr,
            layout,
            allocator: Some(Arc::clone(allocator)),
        })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The caller must ensure no other reference to this region is live for
    /// the returned lifetime.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size())
    }
}

impl Drop for PrivateData {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            // SAFETY: allocated by this allocator with this layout in new().
            unsafe { allocator.release(self.ptr, self.layout) };
        }
    }
}

impl std::fmt::Debug for PrivateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateData")
            .field("len", &self.len())
            .field("align", &self.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn honours_alignment_and_zeroes() {
        let alloc: Arc<dyn RouteAllocator> = Arc::new(SystemAllocator);
        let pd = PrivateData::new(32, 64, &alloc).unwrap();
        assert_eq!(pd.as_ptr() as usize % 64, 0);
        assert_eq!(pd.len(), 32);
        let bytes = unsafe { pd.as_mut_slice() };
        assert!(bytes.iter().all(|b| *b == 0));

        assert!(PrivateData::new(8, 3, &alloc).is_err());
        assert!(PrivateData::new(0, 16, &alloc).unwrap().is_empty());
    }
}
