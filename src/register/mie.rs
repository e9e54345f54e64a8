//! 机器态中断使能寄存器 mie

use core::arch::asm;

use bit_field::BitField;

#[inline]
unsafe fn read() -> usize {
    let ret: usize;
    asm!("csrr {}, mie", out(reg) ret);
    ret
}

#[inline]
unsafe fn write(x: usize) {
    asm!("csrw mie, {}", in(reg) x);
}

/// 打开机器态时钟中断（MTIE，第 7 位）。
pub unsafe fn set_mtie() {
    let mut mie = read();
    mie.set_bit(7, true);
    write(mie);
}
