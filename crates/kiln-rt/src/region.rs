//! Bump allocator for values created by compiled code.
//!
//! A `GlobalRegion` belongs to one compiler instance. Compiled code
//! allocates from it through [`kiln_rt_alloc`], hosts through
//! [`GlobalRegion::alloc_bytes`]. Nothing is freed before the region is
//! dropped, so pointers stay valid for the compiler's lifetime.

use parking_lot::Mutex;

/// Default page size in words (64 KiB).
const PAGE_WORDS: usize = 8 * 1024;

struct Pages {
    /// Boxed slices never move when the outer vector grows.
    pages: Vec<Box<[u64]>>,
    /// Offset in words into the last page.
    offset: usize,
    allocated: usize,
}

impl Pages {
    fn alloc(&mut self, words: usize) -> *mut u64 {
        let words = words.max(1);
        let fits = self
            .pages
            .last()
            .is_some_and(|p| self.offset + words <= p.len());
        if !fits {
            let size = words.max(PAGE_WORDS);
            self.pages.push(vec![0u64; size].into_boxed_slice());
            self.offset = 0;
        }
        let offset = self.offset;
        self.offset += words;
        self.allocated += words;
        match self.pages.last_mut() {
            Some(page) => page[offset..].as_mut_ptr(),
            None => std::ptr::null_mut(),
        }
    }
}

/// Zeroed, 8-byte aligned memory that lives as long as the region.
pub struct GlobalRegion {
    inner: Mutex<Pages>,
}

impl GlobalRegion {
    pub fn new() -> Self {
        GlobalRegion {
            inner: Mutex::new(Pages {
                pages: Vec::new(),
                offset: 0,
                allocated: 0,
            }),
        }
    }

    /// Allocate `words` zeroed 8-byte words.
    pub fn alloc_words(&self, words: usize) -> *mut u64 {
        self.inner.lock().alloc(words)
    }

    /// Allocate at least `bytes` zeroed bytes, rounded up to whole words.
    pub fn alloc_bytes(&self, bytes: usize) -> *mut u8 {
        self.alloc_words(bytes.div_ceil(8)) as *mut u8
    }

    /// Copy `words` into fresh region memory and return its address.
    pub fn store_words(&self, words: &[u64]) -> *mut u64 {
        let ptr = self.alloc_words(words.len());
        // SAFETY: `ptr` points at `words.len()` (at least one) freshly
        // allocated words that nothing else references.
        unsafe { std::ptr::copy_nonoverlapping(words.as_ptr(), ptr, words.len()) };
        ptr
    }

    /// Words handed out so far.
    pub fn allocated_words(&self) -> usize {
        self.inner.lock().allocated
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }
}

impl Default for GlobalRegion {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate `words` zeroed words from `region`.
///
/// # Safety
///
/// `region` must point to a live `GlobalRegion`. Generated code receives the
/// address of the compiler's region, which outlives every artifact.
#[no_mangle]
pub unsafe extern "C" fn kiln_rt_alloc(region: *const GlobalRegion, words: u64) -> *mut u64 {
    match region.as_ref() {
        Some(region) => region.alloc_words(words as usize),
        None => std::ptr::null_mut(),
    }
}
