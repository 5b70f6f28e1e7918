//! Thread manager, global VM lock and blocking primitives.
//!
//! Every Java thread maps to one native thread. Shared state mutation is
//! serialised by a single recursive VM lock; a thread's `safe` counter is
//! positive while it waits for or holds that lock, and `stop_the_world`
//! spins until every registered thread reports itself safe. All condition
//! variables (monitor conditions, per-thread sleep and join conditions, the
//! finalizer queue condition) wait on the lock's own state mutex, releasing
//! the logical lock in full and restoring its depth on wakeup.

use crate::build_exception;
use crate::error::VmError;
use crate::heap::{Heap, HeapRef};
use crate::keys::ThreadId;
use crate::thread::monitor::MonitorTable;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub mod monitor;

/// Per-thread VM state shared with the collector and the other threads.
pub struct ThreadHandle {
    pub id: ThreadId,
    /// Positive while the thread waits for or holds the VM lock, i.e. while
    /// it may be observed by the collector.
    safe: AtomicU32,
    interrupted: AtomicBool,
    alive: AtomicBool,
    /// The java.lang.Thread object of this thread.
    obj: AtomicU64,
    /// Pending Java exception, observed by the frame walker.
    exception: AtomicU64,
    /// Raw pointer to the thread's Java stack, valid while registered.
    stack: AtomicUsize,
    /// Broadcast when the thread unregisters; join waits here.
    dead_cond: Arc<Condvar>,
    /// Private condition for sleep and other interruptible timed waits.
    sleep_cond: Arc<Condvar>,
    /// Condition the thread is currently parked on, poked by interrupt.
    parked_cond: Mutex<Option<Arc<Condvar>>>,
}

// Safety: the stack pointer is only dereferenced by the collector while the
// owning thread is stopped in a safe region.
unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    fn new(id: ThreadId) -> Self {
        Self {
            id,
            safe: AtomicU32::new(0),
            interrupted: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            obj: AtomicU64::new(0),
            exception: AtomicU64::new(0),
            stack: AtomicUsize::new(0),
            dead_cond: Arc::new(Condvar::new()),
            sleep_cond: Arc::new(Condvar::new()),
            parked_cond: Mutex::new(None),
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safe.load(Ordering::Acquire) > 0
    }

    pub(crate) fn safe_inc(&self) {
        self.safe.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn safe_dec(&self) {
        let previous = self.safe.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_obj(&self, obj: HeapRef) {
        self.obj.store(obj as u64, Ordering::Release);
    }

    pub fn obj(&self) -> HeapRef {
        self.obj.load(Ordering::Acquire) as HeapRef
    }

    pub fn set_exception(&self, exception: HeapRef) {
        self.exception.store(exception as u64, Ordering::Release);
    }

    pub fn clear_exception(&self) {
        self.exception.store(0, Ordering::Release);
    }

    pub fn exception(&self) -> HeapRef {
        self.exception.load(Ordering::Acquire) as HeapRef
    }

    pub fn set_stack_ptr(&self, stack: *const crate::interpreter::stack::JavaStack) {
        self.stack.store(stack as usize, Ordering::Release);
    }

    pub fn clear_stack_ptr(&self) {
        self.stack.store(0, Ordering::Release);
    }

    /// The thread's Java stack, readable only while the world is stopped.
    pub(crate) unsafe fn stack_for_scan(
        &self,
    ) -> Option<&crate::interpreter::stack::JavaStack> {
        let raw = self.stack.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(unsafe { &*(raw as *const crate::interpreter::stack::JavaStack) })
        }
    }

    pub fn interrupt_flag(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadHandle>>> = const { RefCell::new(None) };
}

/// The executing thread's handle.
pub fn current() -> Arc<ThreadHandle> {
    CURRENT.with(|cell| cell.borrow().clone().expect("thread registered with the VM"))
}

pub fn try_current() -> Option<Arc<ThreadHandle>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

pub fn set_current(handle: Arc<ThreadHandle>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(handle));
}

struct TmState {
    owner: Option<ThreadId>,
    depth: u32,
    threads: Vec<Arc<ThreadHandle>>,
    next_thread_id: u32,
    monitors: MonitorTable,
    finalizing: VecDeque<HeapRef>,
}

pub struct ThreadManager {
    state: Mutex<TmState>,
    /// Waiters for the logical VM lock.
    lock_free: Condvar,
    /// Signalled when the mark phase queues objects for finalization.
    finalizer_cond: Condvar,
    /// Set while a collection is bringing the world to a stop; the
    /// interpreter polls it at backward branches.
    stopping: AtomicBool,
}

/// Scope of one logical VM lock acquisition.
pub struct VmLockGuard<'a> {
    tm: &'a ThreadManager,
    handle: Arc<ThreadHandle>,
}

impl Drop for VmLockGuard<'_> {
    fn drop(&mut self) {
        self.tm.unlock(&self.handle);
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TmState {
                owner: None,
                depth: 0,
                threads: Vec::new(),
                next_thread_id: 1,
                monitors: MonitorTable::default(),
                finalizing: VecDeque::new(),
            }),
            lock_free: Condvar::new(),
            finalizer_cond: Condvar::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Creates a handle for a new thread and installs it as the calling
    /// native thread's identity.
    pub fn adopt_current_thread(&self) -> Arc<ThreadHandle> {
        let id = {
            let mut st = self.state.lock();
            let id = ThreadId::from_usize(st.next_thread_id as usize);
            st.next_thread_id += 1;
            id
        };
        let handle = Arc::new(ThreadHandle::new(id));
        set_current(handle.clone());
        handle
    }

    /// Registers the thread with the manager so the collector scans it.
    pub fn register(&self, handle: &Arc<ThreadHandle>) {
        let guard = self.lock(handle);
        self.state.lock().threads.push(handle.clone());
        drop(guard);
    }

    /// Unregisters a dying thread and wakes its joiners. Nobody can join on
    /// it after this point.
    pub fn unregister(&self, handle: &Arc<ThreadHandle>) {
        let guard = self.lock(handle);
        {
            let mut st = self.state.lock();
            st.threads.retain(|other| other.id != handle.id);
        }
        handle.alive.store(false, Ordering::Release);
        handle.clear_stack_ptr();
        handle.dead_cond.notify_all();
        drop(guard);
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    pub fn threads_snapshot(&self) -> Vec<Arc<ThreadHandle>> {
        self.state.lock().threads.clone()
    }

    // The global VM lock. Recursive: reentrant calls during
    // allocation-during-resolution are expected. The safe counter covers
    // both the waiting and the holding span.

    pub fn lock(&self, handle: &Arc<ThreadHandle>) -> VmLockGuard<'_> {
        handle.safe_inc();

        let mut st = self.state.lock();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(handle.id);
                    st.depth = 1;
                    break;
                }
                Some(owner) if owner == handle.id => {
                    st.depth += 1;
                    break;
                }
                _ => self.lock_free.wait(&mut st),
            }
        }

        VmLockGuard {
            tm: self,
            handle: handle.clone(),
        }
    }

    fn unlock(&self, handle: &Arc<ThreadHandle>) {
        {
            let mut st = self.state.lock();
            debug_assert_eq!(st.owner, Some(handle.id));
            st.depth -= 1;
            if st.depth == 0 {
                st.owner = None;
                self.lock_free.notify_one();
            }
        }
        handle.safe_dec();
    }

    /// Cooperative safepoint: parks briefly on the VM lock when a
    /// collection is stopping the world.
    pub fn safepoint(&self, handle: &Arc<ThreadHandle>) {
        if self.stopping.load(Ordering::Acquire) {
            drop(self.lock(handle));
        }
    }

    /// Waits for every other registered thread to report itself safe. The
    /// caller must hold the VM lock.
    pub fn stop_the_world(&self, me: &ThreadHandle) {
        self.stopping.store(true, Ordering::Release);

        loop {
            let snapshot = self.threads_snapshot();
            let stopped = snapshot
                .iter()
                .filter(|thread| thread.id != me.id)
                .all(|thread| thread.is_safe());
            if stopped {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Lets the mutators run again after a collection.
    pub fn resume_the_world(&self) {
        self.stopping.store(false, Ordering::Release);
    }

    /// Releases the logical VM lock in full, waits on `cond` (optionally
    /// until `deadline`) and reacquires the lock with its previous depth.
    /// The caller must hold the lock. A timeout wake is indistinguishable
    /// from a spurious one.
    fn wait_on(&self, handle: &ThreadHandle, cond: &Condvar, deadline: Option<Instant>) {
        let mut st = self.state.lock();
        debug_assert_eq!(st.owner, Some(handle.id));
        let depth = st.depth;
        st.owner = None;
        st.depth = 0;
        self.lock_free.notify_one();

        match deadline {
            Some(deadline) => {
                let _ = cond.wait_until(&mut st, deadline);
            }
            None => cond.wait(&mut st),
        }

        loop {
            match st.owner {
                None => {
                    st.owner = Some(handle.id);
                    st.depth = depth;
                    return;
                }
                _ => self.lock_free.wait(&mut st),
            }
        }
    }

    fn park_on(
        &self,
        handle: &Arc<ThreadHandle>,
        cond: &Arc<Condvar>,
        deadline: Option<Instant>,
    ) {
        *handle.parked_cond.lock() = Some(cond.clone());
        self.wait_on(handle, cond, deadline);
        *handle.parked_cond.lock() = None;
    }

    fn deadline_from(millis: i64, nanos: i32) -> Option<Instant> {
        if millis == 0 && nanos == 0 {
            None
        } else {
            Some(
                Instant::now()
                    + Duration::from_millis(millis as u64)
                    + Duration::from_nanos(nanos as u64),
            )
        }
    }

    // Monitors.

    /// Implements MONITORENTER: claims the monitor, bumps the recursion
    /// count, or spins (yielding) on contention.
    pub fn monitor_enter(&self, handle: &Arc<ThreadHandle>, obj: HeapRef) {
        loop {
            let guard = self.lock(handle);
            let done = {
                let mut st = self.state.lock();
                let entry = st.monitors.entry_mut(obj);
                match entry.owner {
                    None => {
                        entry.owner = Some(handle.id);
                        entry.count = 1;
                        true
                    }
                    Some(owner) if owner == handle.id => {
                        entry.count += 1;
                        true
                    }
                    _ => false,
                }
            };
            drop(guard);

            if done {
                return;
            }
            // Contended: release everything and retry.
            std::thread::yield_now();
        }
    }

    /// Implements MONITOREXIT. Returns false when the caller does not own
    /// the monitor, which the interpreter turns into
    /// `IllegalMonitorStateException`.
    pub fn monitor_exit(&self, handle: &Arc<ThreadHandle>, obj: HeapRef) -> bool {
        let guard = self.lock(handle);
        let done = {
            let mut st = self.state.lock();
            match st.monitors.get_mut(obj) {
                Some(entry) if entry.owner == Some(handle.id) => {
                    if entry.count == 1 {
                        entry.owner = None;
                    }
                    entry.count -= 1;
                    true
                }
                _ => false,
            }
        };
        drop(guard);
        done
    }

    /// `Object.wait`: requires sole, non-recursive ownership; drops the
    /// monitor, waits on its lazily created condition and reacquires.
    /// Returns false when the monitor was not held that way.
    pub fn monitor_wait(
        &self,
        handle: &Arc<ThreadHandle>,
        obj: HeapRef,
        millis: i64,
        nanos: i32,
    ) -> Result<bool, VmError> {
        let guard = self.lock(handle);

        let cond = {
            let mut st = self.state.lock();
            match st.monitors.get_mut(obj) {
                Some(entry) if entry.owner == Some(handle.id) && entry.count == 1 => {
                    entry.owner = None;
                    entry.count = 0;
                    let cond = entry
                        .cond
                        .get_or_insert_with(|| Arc::new(Condvar::new()))
                        .clone();
                    entry.waiters += 1;
                    cond
                }
                _ => {
                    drop(st);
                    drop(guard);
                    return Ok(false);
                }
            }
        };

        if handle.take_interrupt() {
            // A pending interrupt fires before waiting; the monitor is
            // still released and reacquired like a regular wait.
            let mut st = self.state.lock();
            if let Some(entry) = st.monitors.get_mut(obj) {
                entry.waiters -= 1;
            }
            drop(st);
            drop(guard);
            self.monitor_enter(handle, obj);
            return Err(build_exception!(InterruptedException));
        }

        self.park_on(handle, &cond, Self::deadline_from(millis, nanos));

        {
            let mut st = self.state.lock();
            if let Some(entry) = st.monitors.get_mut(obj) {
                entry.waiters -= 1;
            }
        }

        let interrupted = handle.take_interrupt();
        drop(guard);

        // Reacquire the monitor before returning to bytecode.
        self.monitor_enter(handle, obj);

        if interrupted {
            return Err(build_exception!(InterruptedException));
        }
        Ok(true)
    }

    /// `Object.notify`/`notifyAll`. Returns false when the caller does not
    /// own the monitor.
    pub fn monitor_notify(
        &self,
        handle: &Arc<ThreadHandle>,
        obj: HeapRef,
        broadcast: bool,
    ) -> bool {
        let guard = self.lock(handle);
        let done = {
            let st = self.state.lock();
            match st.monitors.get(obj) {
                Some(entry) if entry.owner == Some(handle.id) => {
                    if let Some(cond) = &entry.cond {
                        if broadcast {
                            cond.notify_all();
                        } else {
                            cond.notify_one();
                        }
                    }
                    true
                }
                _ => false,
            }
        };
        drop(guard);
        done
    }

    /// `Thread.sleep`, interruptible, parked on the thread's own condition.
    pub fn sleep(&self, handle: &Arc<ThreadHandle>, millis: i64) -> Result<(), VmError> {
        let guard = self.lock(handle);

        if handle.take_interrupt() {
            drop(guard);
            return Err(build_exception!(InterruptedException));
        }

        let deadline = Some(Instant::now() + Duration::from_millis(millis.max(0) as u64));
        let cond = handle.sleep_cond.clone();
        self.park_on(handle, &cond, deadline);

        let interrupted = handle.take_interrupt();
        drop(guard);

        if interrupted {
            return Err(build_exception!(InterruptedException));
        }
        Ok(())
    }

    /// `Thread.join`: waits on the target's private dead condition, which
    /// is broadcast when the target unregisters.
    pub fn join(
        &self,
        handle: &Arc<ThreadHandle>,
        target: &Arc<ThreadHandle>,
        millis: i64,
    ) -> Result<(), VmError> {
        let guard = self.lock(handle);

        if handle.take_interrupt() {
            drop(guard);
            return Err(build_exception!(InterruptedException));
        }

        if target.is_alive() {
            let deadline = if millis > 0 {
                Some(Instant::now() + Duration::from_millis(millis as u64))
            } else {
                None
            };
            let cond = target.dead_cond.clone();
            self.park_on(handle, &cond, deadline);
        }

        let interrupted = handle.take_interrupt();
        drop(guard);

        if interrupted {
            return Err(build_exception!(InterruptedException));
        }
        Ok(())
    }

    /// `Thread.interrupt`: flags the target and pokes whatever condition it
    /// is parked on. Only wait, sleep and join observe this synchronously.
    pub fn interrupt(&self, handle: &Arc<ThreadHandle>, target: &Arc<ThreadHandle>) {
        let guard = self.lock(handle);
        target.interrupted.store(true, Ordering::Release);
        if let Some(cond) = target.parked_cond.lock().as_ref() {
            cond.notify_all();
        }
        drop(guard);
    }

    // Finalizer queue.

    /// Queues objects resurrected by the finalizable mark pass and wakes
    /// the finalizer thread.
    pub fn queue_finalizables(&self, refs: impl IntoIterator<Item = HeapRef>) {
        let mut st = self.state.lock();
        let mut queued = false;
        for r in refs {
            st.finalizing.push_back(r);
            queued = true;
        }
        if queued {
            self.finalizer_cond.notify_one();
        }
    }

    /// Blocks until an object is waiting for finalization and dequeues it.
    pub fn take_finalizable(&self, handle: &Arc<ThreadHandle>) -> HeapRef {
        let guard = self.lock(handle);
        loop {
            if let Some(obj) = self.state.lock().finalizing.pop_front() {
                drop(guard);
                return obj;
            }
            self.wait_on(handle, &self.finalizer_cond, None);
        }
    }

    /// Roots contributed by the finalizing queue (objects must stay alive
    /// until their finalizer ran).
    pub fn finalizing_snapshot(&self) -> Vec<HeapRef> {
        self.state.lock().finalizing.iter().copied().collect()
    }

    /// Sweep-purge of the monitor table; world stopped.
    pub fn purge_monitors(&self, heap: &Heap) {
        self.state.lock().monitors.purge(heap);
    }

    /// Inspection helper for the monitor invariants.
    pub fn monitor_state(&self, obj: HeapRef) -> Option<(Option<ThreadId>, u32)> {
        let st = self.state.lock();
        st.monitors.get(obj).map(|entry| (entry.owner, entry.count))
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}
