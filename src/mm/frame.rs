//! 用户页帧的引用计数
//!
//! 写时复制让同一个物理页帧出现在多个页表里，
//! 这里为 [KERNBASE, PHYSTOP) 间的每个页帧维护一个计数：
//! 计数恒等于引用该帧的有效叶级页表项数目。
//! 页帧本身仍由内核堆分配，只有计数归零的那次释放
//! 才真正把页还给堆。

use core::ptr;

use super::{RawPage, RawSinglePage};
use crate::consts::{KERNBASE, NFRAME, PGSIZE};
use crate::spinlock::SpinLock;

/// 全局页帧引用计数表。
pub static FRAME_REFS: FrameRefs = FrameRefs::new();

pub struct FrameRefs(SpinLock<[u16; NFRAME]>);

impl FrameRefs {
    const fn new() -> Self {
        Self(SpinLock::new([0; NFRAME], "frame refs"))
    }

    /// 物理地址到计数表下标。
    fn index(pa: usize) -> usize {
        if pa % PGSIZE != 0 {
            panic!("frame refs: pa {:#x} not aligned", pa);
        }
        if pa < usize::from(KERNBASE) {
            panic!("frame refs: pa {:#x} below kernel base", pa);
        }
        let i = (pa - usize::from(KERNBASE)) / PGSIZE;
        if i >= NFRAME {
            panic!("frame refs: pa {:#x} out of range", pa);
        }
        i
    }

    /// 新取得的页帧登记为引用计数 1。
    fn set_fresh(&self, pa: usize) {
        let i = Self::index(pa);
        let mut refs = self.0.lock();
        debug_assert_eq!(refs[i], 0);
        refs[i] = 1;
    }

    /// 引用计数加一，fork 共享页帧时调用。
    pub fn inc(&self, pa: usize) {
        let i = Self::index(pa);
        let mut refs = self.0.lock();
        if refs[i] == 0 {
            panic!("frame refs: inc a free frame {:#x}", pa);
        }
        refs[i] += 1;
    }

    /// 引用计数减一；只有降到零的那次把页帧还给内核堆。
    pub fn dec(&self, pa: usize) {
        let i = Self::index(pa);
        let mut refs = self.0.lock();
        if refs[i] == 0 {
            panic!("frame refs: double free of frame {:#x}", pa);
        }
        refs[i] -= 1;
        if refs[i] == 0 {
            unsafe {
                RawSinglePage::from_raw_and_drop(pa as *mut u8);
            }
        }
    }

    /// 写时复制的分裂点。
    ///
    /// 计数为 1 时该帧已独占，原样返回；
    /// 否则分配新帧、拷贝内容、旧帧计数减一，返回新帧。
    /// 新帧分配失败时一切保持原状。
    ///
    /// # 安全性
    /// pa 必须是一个仍被当前页表映射的用户页帧。
    pub unsafe fn try_clone(&self, pa: usize) -> Result<usize, ()> {
        let i = Self::index(pa);
        let mut refs = self.0.lock();
        if refs[i] == 0 {
            panic!("frame refs: clone a free frame {:#x}", pa);
        }
        if refs[i] == 1 {
            return Ok(pa);
        }

        let mem = RawSinglePage::try_new_uninit().map_err(|_| ())?;
        ptr::copy_nonoverlapping(pa as *const u8, mem, PGSIZE);
        refs[i] -= 1;
        refs[Self::index(mem as usize)] = 1;
        Ok(mem as usize)
    }
}

/// 分配一个清零的用户页帧，计数置 1。
pub fn alloc_page_zeroed() -> Result<*mut u8, ()> {
    let mem = unsafe { RawSinglePage::try_new_zeroed().map_err(|_| ())? };
    FRAME_REFS.set_fresh(mem as usize);
    Ok(mem)
}

/// 同上，但不初始化内容。
pub fn alloc_page_uninit() -> Result<*mut u8, ()> {
    let mem = unsafe { RawSinglePage::try_new_uninit().map_err(|_| ())? };
    FRAME_REFS.set_fresh(mem as usize);
    Ok(mem)
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 独占帧原样返回，共享帧分裂成新帧且旧帧计数回落。
    pub fn clone_and_refs() {
        let pa = alloc_page_zeroed().unwrap() as usize;
        assert_eq!(unsafe { FRAME_REFS.try_clone(pa).unwrap() }, pa);

        FRAME_REFS.inc(pa);
        let cloned = unsafe { FRAME_REFS.try_clone(pa).unwrap() };
        assert_ne!(cloned, pa);

        FRAME_REFS.dec(cloned);
        FRAME_REFS.dec(pa);
    }
}
