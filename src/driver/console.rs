//! 控制台：带行编辑的用户输入输出设备

use core::num::Wrapping;
use core::sync::atomic::Ordering;

use crate::consts::driver::*;
use crate::mm::Address;
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

use super::uart;

/// 初始化控制台（目前就是初始化底层串口）。
///
/// # 安全性
/// 启动时调用一次。
pub unsafe fn init() {
    uart::init();
}

/// 控制台读：整行可用后才返回给调用者。
///
/// 缓冲区空时睡在读索引上等输入中断补货；
/// Ctrl-D 提前结束，换行收尾。被杀返回错误。
pub(super) fn read(mut dst: Address, tot: u32) -> Result<u32, ()> {
    let mut console = CONSOLE.lock();

    let mut left = tot;
    while left > 0 {
        while console.ri == console.wi {
            let p = unsafe { CPU_MANAGER.my_proc() };
            if p.killed.load(Ordering::Relaxed) {
                return Err(());
            }
            p.sleep(&console.ri as *const Wrapping<_> as usize, console);
            console = CONSOLE.lock();
        }

        let c = console.buf[console.ri.0 % CONSOLE_BUF];
        console.ri += Wrapping(1);

        // EOF：这次没读到东西时把它留给下一次
        if c == CTRL_EOT {
            if left < tot {
                console.ri -= Wrapping(1);
            }
            break;
        }

        if dst.copy_out(&c as *const u8, 1).is_err() {
            break;
        }

        dst = dst.offset(1);
        left -= 1;

        if c == CTRL_LF {
            break;
        }
    }

    Ok(tot - left)
}

/// 控制台写：逐字节送往串口的异步输出路径。
pub(super) fn write(mut src: Address, tot: u32) -> Result<u32, ()> {
    for i in 0..tot {
        let mut c = 0u8;
        if src.copy_in(&mut c as *mut u8, 1).is_err() {
            return Ok(i);
        }
        uart::UART.putc(c);
        src = src.offset(1);
    }
    Ok(tot)
}

/// printf 的单字符出口；退格要擦掉屏幕上的字符。
pub(crate) fn putc(c: u8) {
    if c == CTRL_BS {
        uart::putc_sync(CTRL_BS);
        uart::putc_sync(b' ');
        uart::putc_sync(CTRL_BS);
    } else {
        uart::putc_sync(c);
    }
}

/// 输入中断：串口每收到一个字符送到这里做行编辑。
///
/// Ctrl-U 删整行、退格删一个字符、普通字符回显进编辑区；
/// 收到换行、EOF 或编辑区满时把整行交给读者并唤醒。
pub(super) fn intr(c: u8) {
    let mut console = CONSOLE.lock();

    match c {
        CTRL_PRINT_PROCESS => {
            // TODO: 打印进程表，排查卡死时用
        }
        CTRL_BS_LINE => {
            while console.ei != console.wi
                && console.buf[(console.ei - Wrapping(1)).0 % CONSOLE_BUF] != CTRL_LF
            {
                console.ei -= Wrapping(1);
                putc(CTRL_BS);
            }
        }
        CTRL_BS | CTRL_DEL => {
            if console.ei != console.wi {
                console.ei -= Wrapping(1);
                putc(CTRL_BS);
            }
        }
        _ => {
            if c != 0 && (console.ei - console.ri).0 < CONSOLE_BUF {
                let c = if c == CTRL_CR { CTRL_LF } else { c };
                // 回显
                putc(c);
                let ei = console.ei.0 % CONSOLE_BUF;
                console.buf[ei] = c;
                console.ei += Wrapping(1);
                if c == CTRL_LF || c == CTRL_EOT || (console.ei - console.ri).0 == CONSOLE_BUF {
                    console.wi = console.ei;
                    unsafe {
                        PROC_MANAGER.wakeup(&console.ri as *const Wrapping<_> as usize);
                    }
                }
            }
        }
    }
}

static CONSOLE: SpinLock<Console> = SpinLock::new(
    Console {
        buf: [0; CONSOLE_BUF],
        ri: Wrapping(0),
        wi: Wrapping(0),
        ei: Wrapping(0),
    },
    "console",
);

struct Console {
    buf: [u8; CONSOLE_BUF],
    /// 读索引：读者消费到的位置
    ri: Wrapping<usize>,
    /// 写索引：已成行、对读者可见的位置
    wi: Wrapping<usize>,
    /// 编辑索引：行内正在输入的位置
    ei: Wrapping<usize>,
}
