//! 机器态状态寄存器 mstatus

use core::arch::asm;

use bit_field::BitField;

#[inline]
unsafe fn read() -> usize {
    let ret: usize;
    asm!("csrr {}, mstatus", out(reg) ret);
    ret
}

#[inline]
unsafe fn write(x: usize) {
    asm!("csrw mstatus, {}", in(reg) x);
}

/// mret 的目标特权级。
pub enum MPP {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

/// 设置 MPP 字段（第 11..13 位），决定 mret 落到哪个特权级。
pub unsafe fn set_mpp(mpp: MPP) {
    let mut mstatus = read();
    mstatus.set_bits(11..13, mpp as usize);
    write(mstatus);
}

/// 打开机器态全局中断（MIE，第 3 位）。
pub unsafe fn set_mie() {
    let mut mstatus = read();
    mstatus.set_bit(3, true);
    write(mstatus);
}
