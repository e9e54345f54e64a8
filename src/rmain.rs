//! 监督态入口：各 hart 的初始化次序

use core::sync::atomic::{AtomicBool, Ordering};

use crate::driver::{console, virtio_disk::DISK};
use crate::fs::BCACHE;
use crate::mm::kalloc::KERNEL_HEAP;
use crate::mm::{kvm_init, kvm_init_hart};
use crate::plic;
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::register::tp;
use crate::trap::trap_init_hart;

/// 主 hart 完成全局初始化后置位，其余 hart 在此之前自旋等待。
static STARTED: AtomicBool = AtomicBool::new(false);

/// 每个 hart 经 start() 的 mret 进入这里。
///
/// hart 0 负责全局资源：堆、内核页表、进程表、PLIC、块缓存、
/// 磁盘与第一个用户进程；其余 hart 只做本地初始化。
/// 全部就绪后进入各自的调度器循环，不再返回。
///
/// # 安全性
/// 依赖启动汇编建立的栈和 tp 中的 hartid；
/// 全局初始化只能由 hart 0 执行一次。
pub unsafe fn rust_main() -> ! {
    let cpuid = tp::read();

    if cpuid == 0 {
        console::init();
        println!();
        println!("rvos booting");
        println!();
        KERNEL_HEAP.kinit();
        kvm_init(); // 内核页表
        PROC_MANAGER.proc_init(); // 进程表与内核栈
        kvm_init_hart(); // 打开分页
        trap_init_hart(); // 安装内核陷阱向量
        plic::init();
        plic::init_hart(cpuid);
        BCACHE.binit(); // 块缓冲
        DISK.lock().init(); // virtio 磁盘
        PROC_MANAGER.user_init(); // 第一个用户进程

        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {}

        println!("hart {} starting", cpuid);
        kvm_init_hart();
        trap_init_hart();
        plic::init_hart(cpuid);
    }

    #[cfg(feature = "unit_test")]
    crate::test_main_entry();

    CPU_MANAGER.scheduler();
}
