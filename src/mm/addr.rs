//! 物理地址与虚拟地址的新类型封装

use core::convert::TryFrom;
use core::ops::{Add, Sub};

use crate::consts::{ConstAddr, MAXVA, PGMASK, PGMASKLEN, PGSHIFT, PGSIZE, PHYSTOP};

/// 两种地址共有的操作。
pub trait Addr {
    fn data_ref(&self) -> &usize;

    fn data_mut(&mut self) -> &mut usize;

    /// 向上取整到页边界。
    #[inline]
    fn pg_round_up(&mut self) {
        *self.data_mut() = (*self.data_mut() + PGSIZE - 1) & !(PGSIZE - 1)
    }

    /// 向下取整到页边界。
    #[inline]
    fn pg_round_down(&mut self) {
        *self.data_mut() = *self.data_mut() & !(PGSIZE - 1)
    }

    /// 前进一页，不检查结果是否仍然合法。
    #[inline]
    fn add_page(&mut self) {
        *self.data_mut() += PGSIZE;
    }

    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    #[inline]
    fn as_ptr(&self) -> *const u8 {
        *self.data_ref() as *const u8
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        *self.data_mut() as *mut u8
    }
}

/// 物理地址。
///
/// `TryFrom<usize>` 路径要求页对齐且不超过 PHYSTOP；
/// 已知合法的地址可以用 `from_raw` 绕过检查。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    /// # 安全性
    /// 调用者保证 raw 是合法、页对齐且不超界的物理地址。
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }
}

impl TryFrom<usize> for PhysAddr {
    type Error = &'static str;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr % PGSIZE != 0 {
            return Err("PhysAddr not page aligned");
        }
        if addr > usize::from(PHYSTOP) {
            return Err("PhysAddr out of range");
        }
        Ok(PhysAddr(addr))
    }
}

impl From<ConstAddr> for PhysAddr {
    fn from(const_addr: ConstAddr) -> Self {
        Self(const_addr.into())
    }
}

/// Sv39 虚拟地址，高位保证为零。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VirtAddr(usize);

impl Addr for VirtAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl VirtAddr {
    /// # 安全性
    /// 调用者保证 raw 满足 Sv39 的高位约束。
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }

    /// 取第 level 级页表中的 9 位页号，level 取 0..=2。
    #[inline]
    pub fn page_num(&self, level: usize) -> usize {
        (self.0 >> (PGSHIFT + level * PGMASKLEN)) & PGMASK
    }
}

impl TryFrom<usize> for VirtAddr {
    type Error = &'static str;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr > MAXVA.into() {
            Err("VirtAddr out of Sv39 range")
        } else {
            Ok(Self(addr))
        }
    }
}

impl From<ConstAddr> for VirtAddr {
    fn from(const_addr: ConstAddr) -> Self {
        Self(const_addr.into())
    }
}

impl Add for VirtAddr {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl Sub for VirtAddr {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}
