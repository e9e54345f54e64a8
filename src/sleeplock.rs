//! 睡眠锁：可跨阻塞操作长期持有的互斥原语
//!
//! 与自旋锁不同，竞争者让出 CPU 而不是忙等，
//! 因此可以在持有期间发起磁盘 I/O 或再次睡眠。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

/// 睡眠锁。
///
/// `locked` 标志本身由内部自旋锁保护；拿不到锁的进程以
/// `locked` 单元的地址为通道睡眠，持有者释放时在同一通道上唤醒。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁，锁被占用时当前进程睡眠等待。
    ///
    /// 醒来后重新拿内部自旋锁并再次检查条件，
    /// 虚假唤醒或广播唤醒因此是无害的。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            unsafe {
                CPU_MANAGER
                    .my_proc()
                    .sleep(self.locked.as_ptr() as usize, guard);
            }
            guard = self.lock.lock();
        }

        self.locked.set(true);
        drop(guard);
        SleepLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        unsafe {
            PROC_MANAGER.wakeup(self.locked.as_ptr() as usize);
        }
        drop(guard);
    }
}

/// 睡眠锁守卫，离开作用域时释放锁并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
