//! 16550 串口驱动
//!
//! 输出分两条路：printf 走同步阻塞的 putc_sync，
//! 用户写控制台走带发送环的中断驱动路径。

use core::convert::Into;
use core::num::Wrapping;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::consts::{driver::UART_BUF, UART0};
use crate::process::{pop_off, push_off, CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

use super::console;
use super::PANICKED;

macro_rules! Reg {
    ($reg: expr) => {
        Into::<usize>::into(UART0) + $reg
    };
}

macro_rules! ReadReg {
    ($reg: expr) => {
        unsafe { ptr::read_volatile(Reg!($reg) as *const u8) }
    };
}

macro_rules! WriteReg {
    ($reg: expr, $value: expr) => {
        unsafe {
            ptr::write_volatile(Reg!($reg) as *mut u8, $value);
        }
    };
}

/// 初始化串口：38.4K 波特率、8N1、开 FIFO 与接收中断。
pub(super) fn init() {
    // 关中断
    WriteReg!(IER, 0x00);

    // 进入设置波特率的模式
    WriteReg!(LCR, 0x80);

    // 38.4K 的除数，低字节与高字节
    WriteReg!(0, 0x03);
    WriteReg!(1, 0x00);

    // 退出波特率模式，字长 8 位无校验
    WriteReg!(LCR, 0x03);

    // 复位并启用 FIFO
    WriteReg!(FCR, 0x07);

    // 打开发送与接收中断
    WriteReg!(IER, 0x03);
}

/// 同步输出一个字符，printf 专用。
/// 已经 panic 时在这里打转，不再往外送字符。
pub(super) fn putc_sync(c: u8) {
    push_off();
    if PANICKED.load(Ordering::Relaxed) {
        loop {}
    }
    while !is_idle() {}
    WriteReg!(THR, c);
    pop_off();
}

/// 全局 UART 实例。
pub static UART: SpinLock<Uart> = SpinLock::new(
    Uart {
        buf: [0; UART_BUF],
        ri: Wrapping(0),
        wi: Wrapping(0),
    },
    "uart",
);

impl SpinLock<Uart> {
    /// 异步输出：字符进发送环，环满时睡等中断腾位置。
    pub fn putc(&self, c: u8) {
        let mut uart = self.lock();

        if PANICKED.load(Ordering::Relaxed) {
            loop {}
        }

        loop {
            if uart.wi == uart.ri + Wrapping(UART_BUF) {
                let p = unsafe { CPU_MANAGER.my_proc() };
                p.sleep(&uart.ri as *const Wrapping<_> as usize, uart);
                uart = self.lock();
            } else {
                let wi = uart.wi.0 % UART_BUF;
                uart.buf[wi] = c;
                uart.wi += Wrapping(1);
                uart.transmit();
                break;
            }
        }
    }

    /// 串口中断：收完所有已到的字符交给控制台，再续传发送环。
    pub fn intr(&self) {
        loop {
            let c: u8;
            if ReadReg!(LSR) & 1 > 0 {
                c = ReadReg!(RHR);
            } else {
                break;
            }
            console::intr(c);
        }

        self.lock().transmit();
    }
}

pub struct Uart {
    buf: [u8; UART_BUF],
    ri: Wrapping<usize>,
    wi: Wrapping<usize>,
}

impl Uart {
    /// 硬件空闲且环里有数据时持续送出，
    /// 每送一个字符唤醒可能等在环上的写者。
    fn transmit(&mut self) {
        while self.wi != self.ri && is_idle() {
            let ri = self.ri.0 % UART_BUF;
            let c = self.buf[ri];
            self.ri += Wrapping(1);
            unsafe {
                PROC_MANAGER.wakeup(&self.ri as *const Wrapping<_> as usize);
            }
            WriteReg!(THR, c);
        }
    }
}

// 16550 寄存器偏移
const RHR: usize = 0; // 接收保持（读）
const THR: usize = 0; // 发送保持（写）
const IER: usize = 1; // 中断使能
const FCR: usize = 2; // FIFO 控制
const LCR: usize = 3; // 线路控制
const LSR: usize = 5; // 线路状态

/// 发送保持寄存器空（LSR 第 5 位）即可再送一个字符。
#[inline]
fn is_idle() -> bool {
    ReadReg!(LSR) & (1 << 5) > 0
}
