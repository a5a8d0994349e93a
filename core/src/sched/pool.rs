//! Virtual processor pool.
//!
//! Caches idle virtual processors so that acquiring a worker does not pay
//! for stack allocation every time. VPs in the reuse cache are suspended;
//! `acquire` revives one (or creates a fresh VP), configures priority and
//! closure, and hands it back still suspended; the caller resumes it.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr;

use vireo_abi::errno::Errno;
use vireo_lib::OnceLock;

use crate::sched::switch::EntryFn;
use crate::sched::vp::{
    VirtualProcessor, VpClosure, vp_create, vp_is_suspended, vp_set_closure,
    vp_set_dispatch_queue, vp_set_priority, vp_suspend, vp_terminate,
};
use crate::sync::mutex::Mutex;

pub const REUSE_CACHE_CAPACITY: usize = 16;

/// Everything needed to configure an acquired VP.
#[derive(Clone, Copy)]
pub struct VpAcquisitionParams {
    pub func: EntryFn,
    pub context: *mut c_void,
    pub kernel_stack_size: usize,
    pub user_stack_size: usize,
    pub priority: i8,
}

struct PoolInner {
    /// VPs handed out and not yet relinquished. Singly linked through
    /// `pool_next`.
    inuse_first: *mut VirtualProcessor,
    /// Suspended VPs available for reuse.
    reuse_first: *mut VirtualProcessor,
    inuse_count: usize,
    reuse_count: usize,
    reuse_capacity: usize,
}

impl PoolInner {
    /// # Safety
    /// `vp` must be valid and not on any pool list.
    unsafe fn push(list: &mut *mut VirtualProcessor, vp: *mut VirtualProcessor) {
        (*vp).pool_next = *list;
        *list = vp;
    }

    /// # Safety
    /// List links must be consistent.
    unsafe fn remove(list: &mut *mut VirtualProcessor, vp: *mut VirtualProcessor) -> bool {
        let mut prev: *mut VirtualProcessor = ptr::null_mut();
        let mut cur = *list;
        while !cur.is_null() {
            if cur == vp {
                if prev.is_null() {
                    *list = (*cur).pool_next;
                } else {
                    (*prev).pool_next = (*cur).pool_next;
                }
                (*cur).pool_next = ptr::null_mut();
                return true;
            }
            prev = cur;
            cur = (*cur).pool_next;
        }
        false
    }
}

pub struct VirtualProcessorPool {
    lock: Mutex,
    inner: UnsafeCell<PoolInner>,
}

// SAFETY: the inner state is only accessed while holding the pool mutex.
unsafe impl Send for VirtualProcessorPool {}
unsafe impl Sync for VirtualProcessorPool {}

impl VirtualProcessorPool {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(),
            inner: UnsafeCell::new(PoolInner {
                inuse_first: ptr::null_mut(),
                reuse_first: ptr::null_mut(),
                inuse_count: 0,
                reuse_count: 0,
                reuse_capacity: REUSE_CACHE_CAPACITY,
            }),
        }
    }

    /// Acquire a VP configured with `params`. Reuses a cached suspended VP
    /// when possible. The returned VP is suspended; resume it to start the
    /// closure.
    pub fn acquire(
        &self,
        params: VpAcquisitionParams,
    ) -> Result<*mut VirtualProcessor, Errno> {
        let mut vp: *mut VirtualProcessor = ptr::null_mut();

        self.lock.lock();
        // SAFETY: pool lock held.
        unsafe {
            let inner = &mut *self.inner.get();

            // A relinquishing VP inserts itself into the reuse list shortly
            // before it finishes suspending, so skip entries that have not
            // completed the transition yet.
            let mut cur = inner.reuse_first;
            while !cur.is_null() {
                if vp_is_suspended(cur) {
                    vp = cur;
                    break;
                }
                cur = (*cur).pool_next;
            }

            if !vp.is_null() {
                PoolInner::remove(&mut inner.reuse_first, vp);
                inner.reuse_count -= 1;
                PoolInner::push(&mut inner.inuse_first, vp);
                inner.inuse_count += 1;
            }
        }
        self.lock.unlock();

        if vp.is_null() {
            vp = vp_create()?;
            // SAFETY: vp is valid; vpid is immutable.
            vireo_lib::klog_debug!("POOL: created vp {}", unsafe { (*vp).vpid() });

            self.lock.lock();
            // SAFETY: pool lock held.
            unsafe {
                let inner = &mut *self.inner.get();
                PoolInner::push(&mut inner.inuse_first, vp);
                inner.inuse_count += 1;
            }
            self.lock.unlock();
        }

        vp_set_priority(vp, params.priority);
        let err = vp_set_closure(
            vp,
            VpClosure::with_stack_sizes(
                params.func,
                params.context,
                params.kernel_stack_size,
                params.user_stack_size,
            ),
        );
        if err != Errno::Ok {
            return Err(err);
        }

        Ok(vp)
    }

    /// Relinquish the calling VP. Re-caches and suspends it if the reuse
    /// cache has room, otherwise terminates it. Does not return: the VP is
    /// next seen with a freshly seeded context, or never.
    pub fn relinquish(&self, vp: *mut VirtualProcessor) -> ! {
        // The VP no longer works for any dispatch queue.
        vp_set_dispatch_queue(vp, ptr::null_mut(), -1);

        let mut reused = false;

        self.lock.lock();
        // SAFETY: pool lock held.
        unsafe {
            let inner = &mut *self.inner.get();

            PoolInner::remove(&mut inner.inuse_first, vp);
            inner.inuse_count -= 1;

            if inner.reuse_count < inner.reuse_capacity {
                PoolInner::push(&mut inner.reuse_first, vp);
                inner.reuse_count += 1;
                reused = true;
            }
        }
        self.lock.unlock();

        if reused {
            let _ = vp_suspend(vp);
            // The suspended context is discarded when the next acquirer
            // seeds a new closure; this continuation never runs.
            unreachable!("relinquished vp resumed with a stale context");
        }

        vp_terminate(vp);
    }

    /// (in-use, cached) VP counts. Diagnostic only.
    pub fn counts(&self) -> (usize, usize) {
        self.lock.lock();
        // SAFETY: pool lock held.
        let counts = unsafe {
            let inner = &*self.inner.get();
            (inner.inuse_count, inner.reuse_count)
        };
        self.lock.unlock();
        counts
    }
}

impl Default for VirtualProcessorPool {
    fn default() -> Self {
        Self::new()
    }
}

static POOL: OnceLock<VirtualProcessorPool> = OnceLock::new();

/// Create the shared pool. Called once during kernel bring-up.
pub fn pool_init() {
    POOL.call_once(VirtualProcessorPool::new);
}

/// The shared pool. Panics if `pool_init` has not run.
pub fn pool_shared() -> &'static VirtualProcessorPool {
    match POOL.get() {
        Some(pool) => pool,
        None => panic!("vp pool not initialized"),
    }
}
