//! 内存管理：内核堆、页帧引用计数、页表与地址抽象

use alloc::boxed::Box;
use core::alloc::AllocError;
use core::ptr;

use crate::consts::PGSIZE;
use crate::process::CPU_MANAGER;

pub use addr::{Addr, PhysAddr, VirtAddr};
pub use kvm::{kvm_init, kvm_init_hart, kvm_map};
pub use pagetable::{PageTable, PteFlag};

mod addr;
pub mod frame;
pub mod kalloc;
mod kvm;
mod list;
pub mod pagetable;

/// 页对齐内存块的分配接口。
///
/// 各种固定大小的物理页类型实现该 trait 之后，
/// 即可经全局堆分配器取得页对齐的裸内存，
/// 并在使用完毕后经 [`RawPage::from_raw_and_drop`] 归还。
pub trait RawPage: Sized {
    /// 分配一块清零的页对齐内存，返回裸指针。
    ///
    /// # 安全性
    /// 返回的指针必须最终经 `from_raw_and_drop` 释放，且只释放一次。
    unsafe fn new_zeroed() -> *mut u8 {
        let boxed_page = Box::<Self>::new_zeroed().assume_init();
        Box::into_raw(boxed_page) as *mut u8
    }

    /// 同 [`RawPage::new_zeroed`]，内存不足时返回错误而非 panic。
    unsafe fn try_new_zeroed() -> Result<*mut u8, AllocError> {
        let boxed_page = Box::<Self>::try_new_zeroed()?.assume_init();
        Ok(Box::into_raw(boxed_page) as *mut u8)
    }

    /// 分配但不初始化内容。
    unsafe fn try_new_uninit() -> Result<*mut u8, AllocError> {
        let boxed_page = Box::<Self>::try_new_uninit()?.assume_init();
        Ok(Box::into_raw(boxed_page) as *mut u8)
    }

    /// 把 `new_*` 返回的裸指针重新装回 Box 并析构。
    ///
    /// # 安全性
    /// `raw` 必须来自同类型的 `new_*`，调用后立即失效。
    unsafe fn from_raw_and_drop(raw: *mut u8) {
        drop(Box::from_raw(raw as *mut Self));
    }
}

/// 单页（4096 字节）。
#[repr(C, align(4096))]
pub struct RawSinglePage {
    data: [u8; PGSIZE],
}

impl RawPage for RawSinglePage {}

/// 连续四页，用作进程的内核栈。
#[repr(C, align(4096))]
pub struct RawQuadPage {
    data: [u8; PGSIZE * 4],
}

impl RawPage for RawQuadPage {}

/// 一个"可能在用户空间也可能在内核空间"的目标地址。
///
/// 文件、管道、设备的读写路径用它统一处理两种目的地：
/// 用户虚拟地址经当前进程页表拷贝，内核指针直接 memcpy。
#[derive(Clone, Copy, Debug)]
pub enum Address {
    Virtual(usize),
    Kernel(*const u8),
    KernelMut(*mut u8),
}

impl Address {
    /// 地址前移 count 字节。
    pub fn offset(self, count: usize) -> Self {
        debug_assert!(count < isize::MAX as usize);
        match self {
            Self::Virtual(p) => Self::Virtual(p + count),
            Self::Kernel(p) => Self::Kernel(unsafe { p.offset(count as isize) }),
            Self::KernelMut(p) => Self::KernelMut(unsafe { p.offset(count as isize) }),
        }
    }

    /// 从内核缓冲区 src 向本地址写入 count 字节。
    pub fn copy_out(self, src: *const u8, count: usize) -> Result<(), ()> {
        match self {
            Self::Virtual(dst) => {
                let p = unsafe { CPU_MANAGER.my_proc() };
                p.data.get_mut().copy_out(src, dst, count)
            }
            Self::Kernel(dst) => {
                panic!("cannot copy to a const pointer {:p}", dst)
            }
            Self::KernelMut(dst) => {
                unsafe {
                    ptr::copy(src, dst, count);
                }
                Ok(())
            }
        }
    }

    /// 从本地址读出 count 字节写入内核缓冲区 dst。
    pub fn copy_in(self, dst: *mut u8, count: usize) -> Result<(), ()> {
        match self {
            Self::Virtual(src) => {
                let p = unsafe { CPU_MANAGER.my_proc() };
                p.data.get_mut().copy_in(src, dst, count)
            }
            Self::Kernel(src) => {
                unsafe {
                    ptr::copy(src, dst, count);
                }
                Ok(())
            }
            Self::KernelMut(src) => {
                unsafe {
                    ptr::copy(src as *const u8, dst, count);
                }
                Ok(())
            }
        }
    }
}

/// 向上取整到页边界。
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + PGSIZE - 1) & !(PGSIZE - 1)
}

/// 向下取整到页边界。
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}
