//! 内核格式化输出与 panic 处理

use core::fmt;
use core::panic;
use core::sync::atomic::Ordering;

use crate::driver::{console, PANICKED};
use crate::spinlock::SpinLock;

/// 零大小的写入器，把格式化结果逐字节送往控制台。
struct Writer;

impl Writer {
    fn putc(&self, c: u8) {
        console::putc(c);
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.putc(byte);
        }
        Ok(())
    }
}

/// print!/println! 宏背后的实现。
///
/// 正常情况下持自旋锁输出，保证多核下整行不被交错；
/// 某个 hart 已经 panic 时放弃加锁，保证 panic 信息总能打出来。
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PR: SpinLock<()> = SpinLock::new((), "pr");

    if PANICKED.load(Ordering::Relaxed) {
        Writer.write_fmt(args).expect("_print: error");
    } else {
        let guard = PR.lock();
        Writer.write_fmt(args).expect("_print: error");
        drop(guard);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// 打印 panic 信息，标记全局 panic 状态，然后挂起本 hart。
/// 其余 hart 在输出路径上看到 PANICKED 后也会停下。
#[panic_handler]
fn panic(info: &panic::PanicInfo<'_>) -> ! {
    crate::println!("{}", info);
    PANICKED.store(true, Ordering::Relaxed);
    loop {}
}

#[no_mangle]
fn abort() -> ! {
    panic!("abort");
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use crate::consts::NCPU;
    use crate::process::CpuManager;
    use core::sync::atomic::{AtomicU8, Ordering};

    /// 多核同时打印，人工检查输出行没有交错。
    pub fn println_simo() {
        let cpu_id = unsafe { CpuManager::cpu_id() };

        static STARTED: AtomicU8 = AtomicU8::new(0);
        STARTED.fetch_add(1, Ordering::Relaxed);
        while (STARTED.load(Ordering::Relaxed) as usize) < NCPU {}

        for i in 0..10 {
            println!("println_simo round {}: hart {}", i, cpu_id);
        }

        STARTED.fetch_sub(1, Ordering::Relaxed);
        while STARTED.load(Ordering::Relaxed) != 0 {}
    }
}
