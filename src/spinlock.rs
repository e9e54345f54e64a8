//! 自旋锁：内核中最底层的互斥原语
//!
//! 锁把被保护的数据包在自身内部，`lock()` 返回守卫，
//! 守卫在作用域结束时自动释放。持锁期间本 CPU 的中断保持关闭。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};
use core::ptr::addr_of_mut;
use core::sync::atomic::{fence, AtomicBool, Ordering};

use crate::process::{pop_off, push_off, CpuManager};

/// 多核互斥的自旋锁。
///
/// 获取时先通过 [`push_off`] 关闭本 CPU 中断（防止中断处理程序
/// 重入同一把锁造成死锁），再在原子标志上忙等。
/// `cpuid` 记录持有者，用于重入检查与调试。
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str,
    cpuid: Cell<isize>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T: ?Sized> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            cpuid: Cell::new(-1),
            data: UnsafeCell::new(data),
        }
    }

    /// 为一块尚未完全初始化的锁写入名字字段。
    ///
    /// 只用于配合 `Arc::try_new_zeroed` 的原地构造路径（如管道创建）。
    ///
    /// # 安全性
    /// 调用者须保证此刻没有其他线程能访问该锁。
    #[inline(always)]
    pub unsafe fn init_name(lock: *mut Self, name: &'static str) {
        addr_of_mut!((*lock).name).write(name);
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取锁并返回守卫，守卫离开作用域时自动释放。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 本 CPU 是否持有该锁。
    /// 前提：中断已关闭，否则判断途中可能被迁移。
    unsafe fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpuid.get() == CpuManager::cpu_id() as isize
    }

    fn acquire(&self) {
        push_off();
        if unsafe { self.holding() } {
            panic!("spinlock {} acquire twice", self.name);
        }
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {}
        // 临界区内的访存不得越过获取点
        fence(Ordering::SeqCst);
        unsafe {
            self.cpuid.set(CpuManager::cpu_id() as isize);
        }
    }

    fn release(&self) {
        if unsafe { !self.holding() } {
            panic!("spinlock {} release while not holding", self.name);
        }
        self.cpuid.set(-1);
        // 临界区内的访存不得越过释放点
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// 不经守卫直接释放。
    ///
    /// 仅用于锁的持有者和释放者不在同一执行流的场合
    /// （fork 出的子进程在 fork_ret 中释放调度器传来的进程锁）。
    ///
    /// # 安全性
    /// 调用者必须确实持有该锁，且此后不再访问受保护数据。
    pub unsafe fn unlock(&self) {
        self.release();
    }
}

/// 自旋锁守卫，提供对内部数据的独占访问。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// 调试用：校验本 CPU 确实持有守卫对应的锁。
    /// 前提：中断已关闭。
    pub unsafe fn holding(&self) -> bool {
        self.lock.holding()
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 基础冒烟测试：两次独立的获取/释放应当都能通过。
    pub fn smoke() {
        let m = SpinLock::new(0usize, "smoke");
        {
            let mut g = m.lock();
            *g = 42;
        }
        assert_eq!(*m.lock(), 42);
    }
}
