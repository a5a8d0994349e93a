//! Dispatch queues.
//!
//! A dispatch queue executes submitted closures on a set of worker virtual
//! processors acquired lazily from the shared VP pool. Each queue has
//! between `min_concurrency` and `max_concurrency` concurrency lanes; a
//! lane holds one worker VP and the item it is currently executing.
//!
//! Locking: the queue mutex protects everything in `QueueInner`. Worker VPs
//! hold it at all times except while waiting for work and while running a
//! closure.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr;

use alloc::boxed::Box;
use alloc::vec::Vec;

use vireo_abi::dispatch::{
    DISPATCH_MAX_CONCURRENCY, DISPATCH_PRIORITY_COUNT, DISPATCH_PRIORITY_HIGHEST,
    DISPATCH_PRIORITY_LOWEST, DispatchOptions, DispatchQos, MAX_ARG_BYTES,
    MAX_ITEM_CACHE_COUNT, QueueState,
};
use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;
use vireo_abi::vp::{
    VP_DEFAULT_KERNEL_STACK_SIZE, VP_DEFAULT_USER_STACK_SIZE, VP_PRIORITIES_RESERVED_LOW,
};

use crate::clock;
use crate::dispatch::item::{
    DispatchFn, ITEM_FLAG_INTERRUPTED, ITEM_FLAG_REPEATING, ITEM_FLAG_SYNC, ITEM_FLAG_TIMER,
    ITEM_FLAG_USER, ItemList, WorkItem,
};
use crate::sched::pool::{VpAcquisitionParams, pool_shared};
use crate::sched::vp::{
    VirtualProcessor, vp_call_as_user, vp_current, vp_dispatch_lane_index, vp_dispatch_queue,
    vp_resume, vp_set_dispatch_queue,
};
use crate::sync::condvar::ConditionVariable;
use crate::sync::mutex::Mutex;
use crate::sync::semaphore::Semaphore;

/// Work items stop being queued-only and an extra worker becomes worth
/// acquiring past this backlog.
const QUEUED_BACKLOG_FOR_EXTRA_VP: i32 = 4;

/// How long an idle worker waits for new work before offering to
/// relinquish itself (serial queues keep their minimum crew).
const IDLE_WAIT: TimeInterval = TimeInterval::from_secs(2);

/// One slot of queue concurrency: a worker VP and the item it is running.
pub struct ConcurrencyLane {
    vp: *mut VirtualProcessor,
    active_item: *mut WorkItem,
}

impl ConcurrencyLane {
    const fn empty() -> Self {
        Self {
            vp: ptr::null_mut(),
            active_item: ptr::null_mut(),
        }
    }
}

struct QueueInner {
    /// Immediate work, FIFO.
    item_queue: ItemList,
    /// Timed work, ascending deadline.
    timer_queue: ItemList,
    /// Reusable items.
    item_cache: ItemList,
    items_queued_count: i32,
    state: QueueState,
    min_concurrency: i8,
    max_concurrency: i8,
    /// Number of occupied lanes. Always equals the non-null lane count.
    available_concurrency: i8,
    qos: DispatchQos,
    priority: i8,
    item_cache_capacity: usize,
    item_cache_count: usize,
    lanes: Vec<ConcurrencyLane>,
}

pub struct DispatchQueue {
    lock: Mutex,
    /// Signalled when a new item or timer is enqueued.
    work_available: ConditionVariable,
    /// Signalled by a worker leaving while the queue terminates.
    vp_shutdown: ConditionVariable,
    inner: UnsafeCell<QueueInner>,
}

// SAFETY: the inner state is only accessed while holding the queue mutex
// (or during Drop, with exclusive access).
unsafe impl Send for DispatchQueue {}
unsafe impl Sync for DispatchQueue {}

impl DispatchQueue {
    /// Create a dispatch queue.
    ///
    /// `min_concurrency` workers are acquired up front and kept; up to
    /// `max_concurrency` may be acquired under load. `qos` and `priority`
    /// select the scheduling priority of the workers.
    pub fn create(
        min_concurrency: i8,
        max_concurrency: i8,
        qos: DispatchQos,
        priority: i8,
    ) -> Result<Box<DispatchQueue>, Errno> {
        if max_concurrency < 1 || max_concurrency > DISPATCH_MAX_CONCURRENCY {
            return Err(Errno::Inval);
        }
        if min_concurrency < 0 || min_concurrency > max_concurrency {
            return Err(Errno::Inval);
        }
        if !(DISPATCH_PRIORITY_LOWEST..=DISPATCH_PRIORITY_HIGHEST).contains(&priority) {
            return Err(Errno::Inval);
        }

        let mut lanes = Vec::new();
        if lanes.try_reserve_exact(max_concurrency as usize).is_err() {
            return Err(Errno::NoMem);
        }
        lanes.resize_with(max_concurrency as usize, ConcurrencyLane::empty);

        let queue = Box::new(DispatchQueue {
            lock: Mutex::new(),
            work_available: ConditionVariable::new("dq_work"),
            vp_shutdown: ConditionVariable::new("dq_shutdown"),
            inner: UnsafeCell::new(QueueInner {
                item_queue: ItemList::new(),
                timer_queue: ItemList::new(),
                item_cache: ItemList::new(),
                items_queued_count: 0,
                state: QueueState::Running,
                min_concurrency,
                max_concurrency,
                available_concurrency: 0,
                qos,
                priority,
                item_cache_capacity: MAX_ITEM_CACHE_COUNT.max(max_concurrency as usize),
                item_cache_count: 0,
                lanes,
            }),
        });

        queue.lock.lock();
        let mut err = Errno::Ok;
        for _ in 0..min_concurrency {
            // SAFETY: queue lock held.
            err = unsafe { queue.acquire_vp_locked() };
            if err != Errno::Ok {
                break;
            }
        }
        queue.lock.unlock();

        if err != Errno::Ok {
            // Roll back the partially built crew before the queue is ever
            // visible to anyone else.
            queue.terminate();
            queue.wait_for_termination();
            return Err(err);
        }

        Ok(queue)
    }

    /// The dispatch queue the calling VP is working for, or null when the
    /// caller does not run on a dispatch-queue worker.
    pub fn current() -> *mut DispatchQueue {
        let vp = vp_current();
        if vp.is_null() {
            return ptr::null_mut();
        }
        vp_dispatch_queue(vp) as *mut DispatchQueue
    }

    #[inline]
    unsafe fn inner(&self) -> &mut QueueInner {
        &mut *self.inner.get()
    }

    // =========================================================================
    // Worker acquisition
    // =========================================================================

    /// Acquire another worker if the queue is running and undermanned:
    /// no workers at all, fewer than the minimum, or a backlog worth an
    /// extra lane. Expects the queue lock held.
    unsafe fn acquire_vp_locked(&self) -> Errno {
        let inner = self.inner();

        let wants_vp = inner.state == QueueState::Running
            && (inner.available_concurrency == 0
                || inner.available_concurrency < inner.min_concurrency
                || (inner.items_queued_count > QUEUED_BACKLOG_FOR_EXTRA_VP
                    && inner.available_concurrency < inner.max_concurrency));
        if !wants_vp {
            return Errno::Ok;
        }

        let mut lane_idx = None;
        for (idx, lane) in inner.lanes.iter().enumerate() {
            if lane.vp.is_null() {
                lane_idx = Some(idx);
                break;
            }
        }
        let Some(lane_idx) = lane_idx else {
            panic!("dispatch queue concurrency accounting corrupt: no free lane");
        };

        let params = VpAcquisitionParams {
            func: dispatch_queue_run,
            context: self as *const DispatchQueue as *mut c_void,
            kernel_stack_size: VP_DEFAULT_KERNEL_STACK_SIZE,
            user_stack_size: VP_DEFAULT_USER_STACK_SIZE,
            priority: worker_priority(inner.qos, inner.priority),
        };

        match pool_shared().acquire(params) {
            Ok(vp) => {
                vp_set_dispatch_queue(vp, self as *const DispatchQueue as *mut c_void, lane_idx as i8);
                inner.lanes[lane_idx].vp = vp;
                inner.lanes[lane_idx].active_item = ptr::null_mut();
                inner.available_concurrency += 1;
                vp_resume(vp, false)
            }
            Err(err) => err,
        }
    }

    /// Free up the worker's lane right before it leaves the run loop.
    /// Expects the queue lock held.
    unsafe fn detach_vp_locked(&self, vp: *mut VirtualProcessor) {
        let inner = self.inner();
        let lane_idx = vp_dispatch_lane_index(vp);
        assert!(
            lane_idx >= 0 && (lane_idx as usize) < inner.lanes.len(),
            "worker vp with corrupt lane index"
        );

        vp_set_dispatch_queue(vp, ptr::null_mut(), -1);
        inner.lanes[lane_idx as usize].vp = ptr::null_mut();
        inner.lanes[lane_idx as usize].active_item = ptr::null_mut();
        inner.available_concurrency -= 1;
    }

    // =========================================================================
    // Item management
    // =========================================================================

    /// Get a work item for the given closure, reusing a cached item whose
    /// argument region is large enough. Expects the queue lock held.
    unsafe fn acquire_item_locked(
        &self,
        func: DispatchFn,
        context: *mut c_void,
        args: *const u8,
        nargs: usize,
        tag: usize,
    ) -> Result<*mut WorkItem, Errno> {
        let inner = self.inner();
        let needed = nargs.next_multiple_of(crate::dispatch::item::ARG_WORD_SIZE);

        let mut reused: *mut WorkItem = ptr::null_mut();
        let mut cur = inner.item_cache.first;
        while !cur.is_null() {
            if (*cur).arg_capacity >= needed {
                inner.item_cache.remove_item(cur);
                inner.item_cache_count -= 1;
                reused = cur;
                break;
            }
            cur = (*cur).next;
        }

        let item = if reused.is_null() {
            let item = WorkItem::allocate()?;
            let err = WorkItem::ensure_arg_capacity(item, nargs);
            if err != Errno::Ok {
                WorkItem::free(item);
                return Err(err);
            }
            item
        } else {
            reused
        };

        WorkItem::reinit(item, func, context, args, nargs, tag);
        Ok(item)
    }

    /// Return an item to the cache, or free it if the cache is full.
    /// Expects the queue lock held.
    unsafe fn relinquish_item_locked(&self, item: *mut WorkItem) {
        let inner = self.inner();

        // Dropping the semaphore asserts that no waiter is still parked.
        (*item).completion = None;
        (*item).func = None;
        (*item).context = ptr::null_mut();
        (*item).arg = ptr::null_mut();
        (*item).tag = 0;
        (*item).flags = 0;

        if inner.item_cache_count < inner.item_cache_capacity {
            inner.item_cache.insert_after(item, ptr::null_mut());
            inner.item_cache_count += 1;
        } else {
            WorkItem::free(item);
        }
    }

    /// Signal a sync item's completion, recording whether it was
    /// interrupted. Exactly one signal per sync dispatch.
    unsafe fn signal_completion(&self, item: *mut WorkItem, interrupted: bool) {
        if (*item).has_flag(ITEM_FLAG_SYNC) {
            if interrupted {
                (*item).flags |= ITEM_FLAG_INTERRUPTED;
            } else {
                (*item).flags &= !ITEM_FLAG_INTERRUPTED;
            }
            if let Some(completion) = (*item).completion.as_ref() {
                completion.release();
            }
        }
    }

    /// Append to the immediate queue. Expects the queue lock held.
    unsafe fn add_item_locked(&self, item: *mut WorkItem) {
        let inner = self.inner();
        inner.item_queue.insert_last(item);
        inner.items_queued_count += 1;
    }

    /// Insert into the timed queue in deadline order. Expects the queue
    /// lock held.
    unsafe fn add_timed_item_locked(&self, item: *mut WorkItem) {
        let inner = self.inner();

        let mut prev: *mut WorkItem = ptr::null_mut();
        let mut cur = inner.timer_queue.first;
        while !cur.is_null() {
            if (*cur).deadline > (*item).deadline {
                break;
            }
            prev = cur;
            cur = (*cur).next;
        }
        inner.timer_queue.insert_after(item, prev);
        inner.items_queued_count += 1;
    }

    /// True if an item with `tag` is queued or currently executing.
    /// Expects the queue lock held.
    unsafe fn has_item_with_tag_locked(&self, tag: usize) -> bool {
        let inner = self.inner();

        for lane in inner.lanes.iter() {
            if !lane.active_item.is_null() && (*lane.active_item).tag == tag {
                return true;
            }
        }

        inner.item_queue.contains_tag(tag) || inner.timer_queue.contains_tag(tag)
    }

    /// Drop every queued item and timer. Queued sync dispatches are
    /// signalled as interrupted. Expects the queue lock held.
    unsafe fn flush_locked(&self) {
        let inner = self.inner();

        loop {
            let item = inner.item_queue.remove_first();
            if item.is_null() {
                break;
            }
            inner.items_queued_count -= 1;
            self.signal_completion(item, true);
            if (*item).has_flag(ITEM_FLAG_SYNC) {
                // The sync waiter owns the item now and relinquishes it.
                continue;
            }
            self.relinquish_item_locked(item);
        }

        loop {
            let item = inner.timer_queue.remove_first();
            if item.is_null() {
                break;
            }
            inner.items_queued_count -= 1;
            self.relinquish_item_locked(item);
        }
    }

    // =========================================================================
    // Dispatch API
    // =========================================================================

    /// Asynchronously execute `func(context, null)` as soon as possible.
    pub fn dispatch_async(&self, func: DispatchFn, context: *mut c_void) -> Errno {
        self.dispatch_closure(func, context, ptr::null(), 0, DispatchOptions::empty(), 0)
    }

    /// Execute `func(context, null)` and block until it has finished.
    pub fn dispatch_sync(&self, func: DispatchFn, context: *mut c_void) -> Errno {
        self.dispatch_closure(func, context, ptr::null(), 0, DispatchOptions::SYNC, 0)
    }

    /// General dispatch: closure, optional argument copy (up to 256
    /// bytes), options and tag.
    ///
    /// With `SYNC`, blocks until the closure completes and reports
    /// `Terminated` if the queue terminated before or while it ran, or
    /// `Intr` if the item was removed by tag. With `COALESCE`, returns
    /// `Ok` without enqueueing when an equally-tagged item is already
    /// queued or executing.
    pub fn dispatch_closure(
        &self,
        func: DispatchFn,
        context: *mut c_void,
        args: *const u8,
        nargs: usize,
        options: DispatchOptions,
        tag: usize,
    ) -> Errno {
        if nargs > MAX_ARG_BYTES {
            return Errno::Inval;
        }
        let is_sync = options.contains(DispatchOptions::SYNC);

        self.lock.lock();
        // SAFETY: queue lock held until the matching unlock.
        let item = unsafe {
            if self.inner().state >= QueueState::Terminating {
                self.lock.unlock();
                return Errno::Terminated;
            }

            if options.contains(DispatchOptions::COALESCE) && self.has_item_with_tag_locked(tag) {
                self.lock.unlock();
                return Errno::Ok;
            }

            let item = match self.acquire_item_locked(func, context, args, nargs, tag) {
                Ok(item) => item,
                Err(err) => {
                    self.lock.unlock();
                    return err;
                }
            };

            if is_sync {
                // The executing worker signals completion but does not
                // relinquish; the waiter below does, after reading the
                // flags.
                (*item).completion = Some(Semaphore::new(0));
                (*item).flags |= ITEM_FLAG_SYNC;
            }
            if options.contains(DispatchOptions::USER) {
                (*item).flags |= ITEM_FLAG_USER;
            }

            self.add_item_locked(item);

            let err = self.acquire_vp_locked();
            if err != Errno::Ok {
                let inner = self.inner();
                inner.item_queue.remove_item(item);
                inner.items_queued_count -= 1;
                self.relinquish_item_locked(item);
                self.lock.unlock();
                return err;
            }

            self.work_available.signal();
            item
        };
        self.lock.unlock();

        if !is_sync {
            return Errno::Ok;
        }

        self.wait_for_sync_completion(item)
    }

    /// Block on a sync item's completion semaphore and translate the
    /// outcome.
    fn wait_for_sync_completion(&self, item: *mut WorkItem) -> Errno {
        // SAFETY: a sync item stays alive until this waiter relinquishes
        // it; the worker only touches it up to the completion signal.
        unsafe {
            loop {
                let err = (*item)
                    .completion
                    .as_ref()
                    .map(|sem| sem.acquire(TimeInterval::INFINITY))
                    .unwrap_or(Errno::Ok);

                if err == Errno::Ok {
                    break;
                }

                // The wait itself was interrupted (forced abort). If the
                // item has not started executing, withdraw it; otherwise
                // the completion signal is still coming, so keep waiting.
                self.lock.lock();
                let inner = self.inner();
                if inner.item_queue.remove_item(item) {
                    inner.items_queued_count -= 1;
                    self.relinquish_item_locked(item);
                    self.lock.unlock();
                    return Errno::Intr;
                }
                self.lock.unlock();
            }

            self.lock.lock();
            let err = if self.inner().state >= QueueState::Terminating {
                Errno::Terminated
            } else if (*item).has_flag(ITEM_FLAG_INTERRUPTED) {
                Errno::Intr
            } else {
                Errno::Ok
            };
            self.relinquish_item_locked(item);
            self.lock.unlock();
            err
        }
    }

    /// Execute `func` on or after `deadline`. The item can be referenced
    /// by `tag`.
    pub fn dispatch_after(
        &self,
        deadline: TimeInterval,
        func: DispatchFn,
        context: *mut c_void,
        tag: usize,
    ) -> Errno {
        self.dispatch_timer(
            deadline,
            TimeInterval::ZERO,
            func,
            context,
            ptr::null(),
            0,
            DispatchOptions::empty(),
            tag,
        )
    }

    /// Execute `func` on or after `deadline` and every `interval`
    /// thereafter until removed by tag or the queue terminates. A
    /// non-positive interval is rejected.
    pub fn dispatch_periodically(
        &self,
        deadline: TimeInterval,
        interval: TimeInterval,
        func: DispatchFn,
        context: *mut c_void,
        tag: usize,
    ) -> Errno {
        if interval <= TimeInterval::ZERO {
            return Errno::Inval;
        }
        self.dispatch_timer(
            deadline,
            interval,
            func,
            context,
            ptr::null(),
            0,
            DispatchOptions::empty(),
            tag,
        )
    }

    /// General timed dispatch. The item repeats when `interval` is a
    /// proper positive interval. Sync timers are not a thing.
    pub fn dispatch_timer(
        &self,
        deadline: TimeInterval,
        interval: TimeInterval,
        func: DispatchFn,
        context: *mut c_void,
        args: *const u8,
        nargs: usize,
        options: DispatchOptions,
        tag: usize,
    ) -> Errno {
        if options.contains(DispatchOptions::SYNC) {
            return Errno::Inval;
        }
        if nargs > MAX_ARG_BYTES {
            return Errno::Inval;
        }

        self.lock.lock();
        // SAFETY: queue lock held.
        let err = unsafe {
            if self.inner().state >= QueueState::Terminating {
                Errno::Terminated
            } else if options.contains(DispatchOptions::COALESCE)
                && self.has_item_with_tag_locked(tag)
            {
                Errno::Ok
            } else {
                match self.acquire_item_locked(func, context, args, nargs, tag) {
                    Err(err) => err,
                    Ok(item) => {
                        (*item).deadline = deadline;
                        (*item).interval = interval;
                        (*item).flags |= ITEM_FLAG_TIMER;
                        if interval > TimeInterval::ZERO && interval < TimeInterval::INFINITY {
                            (*item).flags |= ITEM_FLAG_REPEATING;
                        }
                        if options.contains(DispatchOptions::USER) {
                            (*item).flags |= ITEM_FLAG_USER;
                        }

                        self.add_timed_item_locked(item);

                        let err = self.acquire_vp_locked();
                        if err != Errno::Ok {
                            let inner = self.inner();
                            inner.timer_queue.remove_item(item);
                            inner.items_queued_count -= 1;
                            self.relinquish_item_locked(item);
                            err
                        } else {
                            self.work_available.signal();
                            Errno::Ok
                        }
                    }
                }
            }
        };
        self.lock.unlock();
        err
    }

    /// Remove every queued item and timer whose tag matches. Items already
    /// executing run to completion. Returns whether anything was removed.
    pub fn remove_by_tag(&self, tag: usize) -> bool {
        let mut removed = false;

        self.lock.lock();
        // SAFETY: queue lock held.
        unsafe {
            let inner = self.inner();

            for list in [&raw mut inner.item_queue, &raw mut inner.timer_queue] {
                let mut cur = (*list).first;
                while !cur.is_null() {
                    let next = (*cur).next;
                    if (*cur).tag == tag {
                        self.signal_completion(cur, true);
                        (*list).remove_item(cur);
                        inner.items_queued_count -= 1;
                        if !(*cur).has_flag(ITEM_FLAG_SYNC) {
                            self.relinquish_item_locked(cur);
                        }
                        removed = true;
                    }
                    cur = next;
                }
            }
        }
        self.lock.unlock();

        removed
    }

    /// Drop everything queued. Queued sync dispatches return `Intr`.
    pub fn flush(&self) {
        self.lock.lock();
        // SAFETY: queue lock held.
        unsafe {
            self.flush_locked();
        }
        self.lock.unlock();
    }

    // =========================================================================
    // Worker run loop
    // =========================================================================

    /// Pick the next item to execute: a due timer beats immediate work
    /// because timers carry deadlines. With nothing due, waits on
    /// `work_available` until the next timer deadline (or a flat two
    /// seconds), and offers to relinquish the worker after an idle timeout
    /// when the crew is above the minimum. Returns null when the worker
    /// should leave. Expects the queue lock held.
    unsafe fn next_work_locked(&self) -> *mut WorkItem {
        let mut may_relinquish = false;

        loop {
            let inner = self.inner();
            let now = clock::clock_current_time();
            let mut item: *mut WorkItem = ptr::null_mut();

            let first_timer = inner.timer_queue.first;
            if !first_timer.is_null() && (*first_timer).deadline <= now {
                item = inner.timer_queue.remove_first();
            }

            if item.is_null() {
                item = inner.item_queue.remove_first();
            }

            if !item.is_null() {
                inner.items_queued_count -= 1;
                return item;
            }

            if may_relinquish {
                return ptr::null_mut();
            }

            let deadline = if !inner.timer_queue.first.is_null() {
                (*inner.timer_queue.first).deadline
            } else {
                now.add(IDLE_WAIT)
            };

            // Drops the queue lock while waiting.
            let err = self.work_available.wait(&self.lock, deadline);

            let inner = self.inner();
            if inner.state != QueueState::Running {
                return ptr::null_mut();
            }
            if err == Errno::TimedOut && inner.available_concurrency > inner.min_concurrency {
                may_relinquish = true;
            }
        }
    }

    /// Re-arm a repeating timer with the next fire date that has not been
    /// missed already. Expects the queue lock held.
    unsafe fn rearm_timer_locked(&self, item: *mut WorkItem) {
        let now = clock::clock_current_time();

        loop {
            (*item).deadline = (*item).deadline.add((*item).interval);
            if (*item).deadline > now {
                break;
            }
        }

        self.add_timed_item_locked(item);
    }

    fn run(&self) {
        let vp = vp_current();
        let lane_idx = vp_dispatch_lane_index(vp) as usize;

        self.lock.lock();
        // SAFETY: the queue lock is held everywhere inside except while
        // waiting for work and while the closure runs.
        unsafe {
            while self.inner().state == QueueState::Running {
                let item = self.next_work_locked();
                if item.is_null() {
                    break;
                }

                self.inner().lanes[lane_idx].active_item = item;
                self.lock.unlock();

                let func = match (*item).func {
                    Some(func) => func,
                    None => panic!("work item without a closure in run loop"),
                };
                if (*item).has_flag(ITEM_FLAG_USER) {
                    vp_call_as_user(func, (*item).context, (*item).arg);
                } else {
                    func((*item).context, (*item).arg);
                }

                // A sync item belongs to its waiter once signalled; do not
                // touch it after this.
                let recycle = if (*item).has_flag(ITEM_FLAG_SYNC) {
                    self.signal_completion(item, false);
                    ptr::null_mut()
                } else {
                    item
                };

                self.lock.lock();
                self.inner().lanes[lane_idx].active_item = ptr::null_mut();

                if !recycle.is_null() {
                    if (*recycle).has_flag(ITEM_FLAG_REPEATING)
                        && self.inner().state == QueueState::Running
                    {
                        self.rearm_timer_locked(recycle);
                    } else {
                        self.relinquish_item_locked(recycle);
                    }
                }
            }

            self.detach_vp_locked(vp);
            if self.inner().state >= QueueState::Terminating {
                self.vp_shutdown.signal();
            }
        }
        self.lock.unlock();
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Begin terminating the queue: flush everything queued, stop
    /// accepting work, and tell every worker to leave. Returns without
    /// waiting; pair with [`wait_for_termination`].
    ///
    /// [`wait_for_termination`]: DispatchQueue::wait_for_termination
    pub fn terminate(&self) {
        self.lock.lock();
        // SAFETY: queue lock held.
        unsafe {
            if self.inner().state >= QueueState::Terminating {
                self.lock.unlock();
                return;
            }
            self.inner().state = QueueState::Terminating;

            self.flush_locked();

            // Every worker has to notice and relinquish itself.
            self.work_available.broadcast();
        }
        self.lock.unlock();
    }

    /// Block until every worker has left, then mark the queue Terminated.
    pub fn wait_for_termination(&self) {
        self.lock.lock();
        // SAFETY: queue lock held except inside the condvar wait.
        unsafe {
            while self.inner().available_concurrency > 0 {
                let _ = self.vp_shutdown.wait(&self.lock, TimeInterval::INFINITY);
            }
            self.inner().state = QueueState::Terminated;
        }
        self.lock.unlock();
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn state(&self) -> QueueState {
        self.lock.lock();
        // SAFETY: queue lock held.
        let state = unsafe { self.inner().state };
        self.lock.unlock();
        state
    }

    /// Number of queued (immediate plus timed) items.
    pub fn queued_count(&self) -> i32 {
        self.lock.lock();
        // SAFETY: queue lock held.
        let count = unsafe { self.inner().items_queued_count };
        self.lock.unlock();
        count
    }

    /// Number of occupied concurrency lanes.
    pub fn available_concurrency(&self) -> i8 {
        self.lock.lock();
        // SAFETY: queue lock held.
        let conc = unsafe { self.inner().available_concurrency };
        self.lock.unlock();
        conc
    }
}

impl Drop for DispatchQueue {
    /// Destruction requires a terminated queue: both lists flushed and all
    /// workers relinquished.
    fn drop(&mut self) {
        // SAFETY: &mut self gives exclusive access.
        let inner = unsafe { &mut *self.inner.get() };
        assert!(
            inner.state == QueueState::Terminated,
            "dispatch queue destroyed without termination"
        );
        debug_assert!(inner.item_queue.is_empty());
        debug_assert!(inner.timer_queue.is_empty());

        loop {
            // SAFETY: cached items are owned by the queue.
            unsafe {
                let item = inner.item_cache.remove_first();
                if item.is_null() {
                    break;
                }
                WorkItem::free(item);
            }
        }
        inner.item_cache_count = 0;
    }
}

/// Worker priority inside the global 64-level space: six QoS bands of ten,
/// centered priorities, shifted past the scheduler's reserved low band.
fn worker_priority(qos: DispatchQos, priority: i8) -> i8 {
    qos.as_i8() * DISPATCH_PRIORITY_COUNT
        + (priority + DISPATCH_PRIORITY_COUNT / 2)
        + VP_PRIORITIES_RESERVED_LOW
}

/// Entry closure of every worker VP.
pub(crate) extern "C" fn dispatch_queue_run(context: *mut c_void) {
    // SAFETY: the queue outlives its workers; it cannot be destroyed
    // before wait_for_termination saw all of them leave.
    let queue = unsafe { &*(context as *const DispatchQueue) };
    queue.run();
}
