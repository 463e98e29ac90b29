//! Shared-context lock.
//!
//! A minimal mutex container used by the arena, the dict/data core and the
//! stats block. Two interchangeable implementations are selected at build
//! time: the default is a futex-based lock with a waiter counter; the
//! `pthread-lock` feature switches to a process-shared pthread mutex.
//!
//! The futex variant wakes waiters in roughly FIFO order; the pthread
//! variant is best-effort.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

#[cfg(not(feature = "pthread-lock"))]
mod raw {
    use std::sync::atomic::{AtomicU32, Ordering};

    const FREE: u32 = 0;
    const LOCKED: u32 = 1;
    const CONTENDED: u32 = 2;

    pub struct RawLock {
        state: AtomicU32,
        waiters: AtomicU32,
    }

    impl RawLock {

        pub fn new() -> Self {
            RawLock {
                state: AtomicU32::new(FREE),
                waiters: AtomicU32::new(0),
            }
        }

        pub fn lock(&self) {
            if self
                .state
                .compare_exchange(FREE, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            self.waiters.fetch_add(1, Ordering::Relaxed);

            loop {
                if self.state.swap(CONTENDED, Ordering::Acquire) == FREE {
                    break;
                }
                futex_wait(&self.state, CONTENDED);
            }

            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }

        pub fn unlock(&self) {
            let prev = self.state.swap(FREE, Ordering::Release);

            if prev == CONTENDED || self.waiters.load(Ordering::Relaxed) > 0 {
                futex_wake(&self.state, 1);
            }
        }
    }

    fn futex_wait(atom: &AtomicU32, expected: u32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                atom as *const AtomicU32 as *mut u32,
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
                0usize,
                0u32,
            );
        }
    }

    fn futex_wake(atom: &AtomicU32, count: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                atom as *const AtomicU32 as *mut u32,
                libc::FUTEX_WAKE,
                count,
                std::ptr::null::<libc::timespec>(),
                0usize,
                0u32,
            );
        }
    }
}

#[cfg(feature = "pthread-lock")]
mod raw {

    pub struct RawLock {
        // boxed so the mutex address stays stable
        mutex: Box<libc::pthread_mutex_t>,
    }

    impl RawLock {

        pub fn new() -> Self {
            unsafe {
                let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
                libc::pthread_mutexattr_init(&mut attr);
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);

                let mut mutex: Box<libc::pthread_mutex_t> = Box::new(std::mem::zeroed());
                libc::pthread_mutex_init(&mut *mutex, &attr);
                libc::pthread_mutexattr_destroy(&mut attr);

                RawLock { mutex }
            }
        }

        fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
            &*self.mutex as *const libc::pthread_mutex_t as *mut libc::pthread_mutex_t
        }

        pub fn lock(&self) {
            unsafe {
                libc::pthread_mutex_lock(self.mutex_ptr());
            }
        }

        pub fn unlock(&self) {
            unsafe {
                libc::pthread_mutex_unlock(self.mutex_ptr());
            }
        }
    }

    impl Drop for RawLock {
        fn drop(&mut self) {
            unsafe {
                libc::pthread_mutex_destroy(self.mutex_ptr());
            }
        }
    }
}

/// A value guarded by the shared-context lock.
pub struct ShCtx<T> {
    lock: raw::RawLock,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ShCtx<T> {}
unsafe impl<T: Send> Sync for ShCtx<T> {}

impl<T> ShCtx<T> {

    pub fn new(value: T) -> Self {
        ShCtx {
            lock: raw::RawLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> ShGuard<T> {
        self.lock.lock();
        ShGuard { ctx: self }
    }
}

pub struct ShGuard<'a, T> {
    ctx: &'a ShCtx<T>,
}

impl<'a, T> Deref for ShGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.ctx.value.get() }
    }
}

impl<'a, T> DerefMut for ShGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.ctx.value.get() }
    }
}

impl<'a, T> Drop for ShGuard<'a, T> {
    fn drop(&mut self) {
        self.ctx.lock.unlock();
    }
}

#[cfg(test)]
mod tests {

    use std::sync::Arc;

    use super::*;

    #[test]
    fn exclusive_increment() {
        let counter = Arc::new(ShCtx::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 40_000);
    }

    #[test]
    fn guard_releases_on_drop() {
        let ctx = ShCtx::new(7u32);

        {
            let mut guard = ctx.lock();
            *guard = 8;
        }

        assert_eq!(*ctx.lock(), 8);
    }
}
