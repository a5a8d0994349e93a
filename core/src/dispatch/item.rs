//! Work items.
//!
//! A work item carries a closure, an optional inline argument copy and the
//! timer state for deferred and repeating execution. Items are pooled per
//! queue: relinquishing returns an item to its queue's cache, and a later
//! acquisition reuses any cached item whose argument region is large
//! enough.

use core::alloc::Layout;
use core::ffi::c_void;
use core::ptr;

use vireo_abi::dispatch::MAX_ARG_BYTES;
use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;

use crate::sync::semaphore::Semaphore;

/// Dispatch closure: called with the dispatch context and the argument
/// pointer (the caller's pointer, or the in-item copy).
pub type DispatchFn = extern "C" fn(*mut c_void, *mut c_void);

pub(crate) const ITEM_FLAG_TIMER: u8 = 0x01;
pub(crate) const ITEM_FLAG_REPEATING: u8 = 0x02;
pub(crate) const ITEM_FLAG_SYNC: u8 = 0x04;
pub(crate) const ITEM_FLAG_INTERRUPTED: u8 = 0x08;
pub(crate) const ITEM_FLAG_USER: u8 = 0x10;

/// Inline argument regions are allocated in word multiples so a cached
/// item can serve any request up to its capacity.
pub(crate) const ARG_WORD_SIZE: usize = core::mem::size_of::<usize>();

pub struct WorkItem {
    pub(crate) next: *mut WorkItem,
    pub(crate) func: Option<DispatchFn>,
    pub(crate) context: *mut c_void,
    pub(crate) arg: *mut c_void,
    pub(crate) tag: usize,
    /// Timer state; meaningful when `ITEM_FLAG_TIMER` is set.
    pub(crate) deadline: TimeInterval,
    pub(crate) interval: TimeInterval,
    /// Completion signaller for sync dispatch; signalled exactly once.
    pub(crate) completion: Option<Semaphore>,
    /// Word-rounded inline argument region, reused across acquisitions.
    pub(crate) arg_storage: *mut u8,
    pub(crate) arg_capacity: usize,
    pub(crate) flags: u8,
}

impl WorkItem {
    /// Heap-allocate a blank item.
    pub(crate) fn allocate() -> Result<*mut WorkItem, Errno> {
        let layout = Layout::new::<WorkItem>();
        // SAFETY: non-zero size.
        let raw = unsafe { alloc::alloc::alloc(layout) } as *mut WorkItem;
        if raw.is_null() {
            return Err(Errno::NoMem);
        }

        // SAFETY: raw is valid for writes.
        unsafe {
            raw.write(WorkItem {
                next: ptr::null_mut(),
                func: None,
                context: ptr::null_mut(),
                arg: ptr::null_mut(),
                tag: 0,
                deadline: TimeInterval::ZERO,
                interval: TimeInterval::ZERO,
                completion: None,
                arg_storage: ptr::null_mut(),
                arg_capacity: 0,
                flags: 0,
            });
        }
        Ok(raw)
    }

    /// Free an item and its argument region.
    ///
    /// # Safety
    /// `item` must come from [`WorkItem::allocate`] and be unlinked.
    pub(crate) unsafe fn free(item: *mut WorkItem) {
        if !(*item).arg_storage.is_null() {
            let layout =
                Layout::from_size_align_unchecked((*item).arg_capacity, ARG_WORD_SIZE);
            alloc::alloc::dealloc((*item).arg_storage, layout);
        }
        ptr::drop_in_place(item);
        alloc::alloc::dealloc(item as *mut u8, Layout::new::<WorkItem>());
    }

    /// Grow the inline argument region to hold `nbytes` (word-rounded).
    ///
    /// # Safety
    /// `item` must be valid and owned by the caller.
    pub(crate) unsafe fn ensure_arg_capacity(item: *mut WorkItem, nbytes: usize) -> Errno {
        debug_assert!(nbytes <= MAX_ARG_BYTES);

        let needed = nbytes.next_multiple_of(ARG_WORD_SIZE);
        if needed == 0 || (*item).arg_capacity >= needed {
            return Errno::Ok;
        }

        if !(*item).arg_storage.is_null() {
            let layout =
                Layout::from_size_align_unchecked((*item).arg_capacity, ARG_WORD_SIZE);
            alloc::alloc::dealloc((*item).arg_storage, layout);
            (*item).arg_storage = ptr::null_mut();
            (*item).arg_capacity = 0;
        }

        let layout = Layout::from_size_align_unchecked(needed, ARG_WORD_SIZE);
        let storage = alloc::alloc::alloc(layout);
        if storage.is_null() {
            return Errno::NoMem;
        }
        (*item).arg_storage = storage;
        (*item).arg_capacity = needed;
        Errno::Ok
    }

    /// (Re-)initialize an item for a new dispatch. The argument pointer is
    /// the caller's `args` when `nargs == 0`, otherwise the in-item copy.
    ///
    /// # Safety
    /// `item` must be valid with sufficient argument capacity; `args` must
    /// be readable for `nargs` bytes when `nargs > 0`.
    pub(crate) unsafe fn reinit(
        item: *mut WorkItem,
        func: DispatchFn,
        context: *mut c_void,
        args: *const u8,
        nargs: usize,
        tag: usize,
    ) {
        (*item).next = ptr::null_mut();
        (*item).func = Some(func);
        (*item).context = context;
        (*item).tag = tag;
        (*item).deadline = TimeInterval::ZERO;
        (*item).interval = TimeInterval::ZERO;
        (*item).completion = None;
        (*item).flags = 0;

        if nargs == 0 {
            (*item).arg = args as *mut c_void;
        } else {
            debug_assert!((*item).arg_capacity >= nargs);
            ptr::copy_nonoverlapping(args, (*item).arg_storage, nargs);
            (*item).arg = (*item).arg_storage as *mut c_void;
        }
    }

    #[inline]
    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Singly-linked item queue: cheap append and head removal, linear
/// removal elsewhere.
pub(crate) struct ItemList {
    pub(crate) first: *mut WorkItem,
    pub(crate) last: *mut WorkItem,
}

impl ItemList {
    pub(crate) const fn new() -> Self {
        Self {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    /// # Safety
    /// `item` must be valid and unlinked.
    pub(crate) unsafe fn insert_last(&mut self, item: *mut WorkItem) {
        (*item).next = ptr::null_mut();
        if self.last.is_null() {
            self.first = item;
        } else {
            (*self.last).next = item;
        }
        self.last = item;
    }

    /// Insert after `prev`; null `prev` inserts at the head.
    ///
    /// # Safety
    /// `item` must be valid and unlinked; `prev` must be a member or null.
    pub(crate) unsafe fn insert_after(&mut self, item: *mut WorkItem, prev: *mut WorkItem) {
        if prev.is_null() {
            (*item).next = self.first;
            self.first = item;
            if self.last.is_null() {
                self.last = item;
            }
        } else {
            (*item).next = (*prev).next;
            (*prev).next = item;
            if self.last == prev {
                self.last = item;
            }
        }
    }

    /// Detach and return the head, or null.
    ///
    /// # Safety
    /// Links must be consistent.
    pub(crate) unsafe fn remove_first(&mut self) -> *mut WorkItem {
        let item = self.first;
        if !item.is_null() {
            self.first = (*item).next;
            if self.first.is_null() {
                self.last = ptr::null_mut();
            }
            (*item).next = ptr::null_mut();
        }
        item
    }

    /// Remove a specific item. Returns false if it is not a member.
    ///
    /// # Safety
    /// Links must be consistent.
    pub(crate) unsafe fn remove_item(&mut self, item: *mut WorkItem) -> bool {
        let mut prev: *mut WorkItem = ptr::null_mut();
        let mut cur = self.first;
        while !cur.is_null() {
            if cur == item {
                if prev.is_null() {
                    self.first = (*cur).next;
                } else {
                    (*prev).next = (*cur).next;
                }
                if self.last == cur {
                    self.last = prev;
                }
                (*cur).next = ptr::null_mut();
                return true;
            }
            prev = cur;
            cur = (*cur).next;
        }
        false
    }

    pub(crate) fn contains_tag(&self, tag: usize) -> bool {
        let mut cur = self.first;
        while !cur.is_null() {
            // SAFETY: members are valid while linked.
            unsafe {
                if (*cur).tag == tag {
                    return true;
                }
                cur = (*cur).next;
            }
        }
        false
    }
}
