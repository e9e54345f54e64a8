//! CLINT：机器态定时器的内存映射寄存器

use core::convert::Into;
use core::ptr;

use crate::consts::{CLINT_MTIME, CLINT_MTIMECMP};

#[inline]
unsafe fn read_mtime() -> u64 {
    ptr::read_volatile(Into::<usize>::into(CLINT_MTIME) as *const u64)
}

#[inline]
unsafe fn write_mtimecmp(mhartid: usize, value: u64) {
    let offset = Into::<usize>::into(CLINT_MTIMECMP) + 8 * mhartid;
    ptr::write_volatile(offset as *mut u64, value);
}

/// 以当前 mtime 为基准，把本 hart 的下一次时钟中断推后 interval 周期。
pub unsafe fn add_mtimecmp(mhartid: usize, interval: u64) {
    let value = read_mtime();
    write_mtimecmp(mhartid, value + interval);
}
