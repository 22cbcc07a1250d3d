//! Blocking primitives shared by callers and the interrupt bottom half.
//!
//! Memory-ordering contract: the bottom half updates pipe state (DMA lock,
//! wake bits) and then calls [`WaitQueue::wake_all`], which takes the queue
//! mutex. A waiter re-checks its predicate under the same mutex, so a waiter
//! that observes a cleared wake bit also observes every store the bottom half
//! made before clearing it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

bitflags! {
    /// What a pipe is waiting for, plus the sticky host-closed bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WaitFlags: u32 {
        const CLOSED_ON_HOST = 1 << 0;
        const WAKE_ON_WRITE = 1 << 1;
        const WAKE_ON_READ = 1 << 2;
        const WAKE_ON_UNLOCK_DMA = 1 << 3;
    }
}

/// Lock-free [`WaitFlags`] cell.
#[derive(Debug, Default)]
pub(crate) struct AtomicWaitFlags(AtomicU32);

impl AtomicWaitFlags {
    pub(crate) fn load(&self) -> WaitFlags {
        WaitFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn contains(&self, flags: WaitFlags) -> bool {
        self.load().contains(flags)
    }

    pub(crate) fn insert(&self, flags: WaitFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove(&self, flags: WaitFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Replaces every bit at once.
    pub(crate) fn store(&self, flags: WaitFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A condition variable paired with the mutex every waker must pass through.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_all(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until `ready` returns true or `cancel` fires.
    ///
    /// `ready` is evaluated with the queue mutex held; whoever makes it true
    /// must call [`WaitQueue::wake_all`] afterwards.
    pub fn wait_until(
        self: &Arc<Self>,
        cancel: &CancelToken,
        mut ready: impl FnMut() -> bool,
    ) -> Result<(), Cancelled> {
        let _registration = cancel.register(self);
        let mut generation = lock(&self.generation);
        loop {
            if ready() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            generation = self
                .cond
                .wait(generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Returned when a wait was abandoned because its [`CancelToken`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiting_on: Mutex<Vec<Arc<WaitQueue>>>,
}

/// Cancellation request, the analogue of a pending signal.
///
/// Clones share one state. Cancelling wakes every queue a holder is currently
/// blocked on, and the token stays cancelled until [`CancelToken::reset`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let queues = lock(&self.inner.waiting_on).clone();
        for queue in queues {
            queue.wake_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
    }

    fn register(&self, queue: &Arc<WaitQueue>) -> Registration<'_> {
        lock(&self.inner.waiting_on).push(queue.clone());
        Registration {
            token: self,
            queue: queue.clone(),
        }
    }
}

struct Registration<'a> {
    token: &'a CancelToken,
    queue: Arc<WaitQueue>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut waiting_on = lock(&self.token.inner.waiting_on);
        if let Some(i) = waiting_on.iter().position(|q| Arc::ptr_eq(q, &self.queue)) {
            waiting_on.swap_remove(i);
        }
    }
}

/// Sleeping lock serializing use of one pipe's command buffer.
///
/// Acquisition can be abandoned through a [`CancelToken`].
#[derive(Debug, Default)]
pub(crate) struct CommandLock {
    held: AtomicBool,
    queue: Arc<WaitQueue>,
}

impl CommandLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn try_lock(&self) -> Option<CommandLockGuard<'_>> {
        self.try_acquire().then_some(CommandLockGuard { lock: self })
    }

    pub(crate) fn lock_interruptible(
        &self,
        cancel: &CancelToken,
    ) -> Result<CommandLockGuard<'_>, Cancelled> {
        loop {
            if self.try_acquire() {
                return Ok(CommandLockGuard { lock: self });
            }
            self.queue
                .wait_until(cancel, || !self.held.load(Ordering::Acquire))?;
        }
    }

    /// Uninterruptible acquisition, used on teardown paths.
    pub(crate) fn lock(&self) -> CommandLockGuard<'_> {
        loop {
            if let Ok(guard) = self.lock_interruptible(&CancelToken::new()) {
                return guard;
            }
        }
    }
}

pub(crate) struct CommandLockGuard<'a> {
    lock: &'a CommandLock,
}

impl Drop for CommandLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        self.lock.queue.wake_all();
    }
}
