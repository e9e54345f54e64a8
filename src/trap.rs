//! 陷阱分发：用户陷阱、内核陷阱与时钟

use core::num::Wrapping;
use core::sync::atomic::Ordering;

use crate::consts::{TRAMPOLINE, TRAPFRAME, UART0_IRQ, VIRTIO0_IRQ};
use crate::driver::uart::UART;
use crate::driver::virtio_disk::DISK;
use crate::plic;
use crate::process::{CpuManager, Proc, CPU_MANAGER, PROC_MANAGER};
use crate::register::{
    scause::{self, ScauseType},
    sepc, sip, sstatus, stval, stvec,
};
use crate::spinlock::SpinLock;

/// 本 hart 的陷阱向量指向 kernelvec，启动期调用。
pub unsafe fn trap_init_hart() {
    extern "C" {
        fn kernelvec();
    }

    stvec::write(kernelvec as usize);
}

/// 用户态陷阱入口，跳板页的 uservec 保存完寄存器后跳到这里。
///
/// 先把陷阱向量切回内核入口、保存用户 pc，再按原因分发：
/// - 系统调用：跳过 ecall、开中断、进入分发表；
/// - 外部中断：问 PLIC，交给 UART 或磁盘驱动；
/// - 时钟（经机器态转发的软件中断）：hart 0 推进全局 tick，
///   随后做本进程的报警记账并让出 CPU；
/// - 写缺页：先试写时复制，不是 CoW 页才算真错；
/// - 读缺页与其他原因：打印并杀掉进程。
/// 处理后统一检查 killed 标志，最后经跳板返回用户态。
#[no_mangle]
pub unsafe extern "C" fn user_trap() {
    if !sstatus::is_from_user() {
        panic!("user_trap: not from user mode, sstatus={:#x}", sstatus::read());
    }

    extern "C" {
        fn kernelvec();
    }
    stvec::write(kernelvec as usize);

    let p = CPU_MANAGER.my_proc();

    // 保存用户程序计数器
    let tf = p.data.get_mut().tf.as_mut().unwrap();
    tf.epc = sepc::read();

    match scause::get_scause() {
        ScauseType::ExcUEcall => {
            p.check_killed(-1);
            p.syscall();
            p.check_killed(-1);
        }
        ScauseType::IntSExt => {
            let irq = plic::claim();

            if irq as usize == UART0_IRQ {
                UART.intr();
            } else if irq as usize == VIRTIO0_IRQ {
                DISK.lock().intr();
            }

            if irq > 0 {
                plic::complete(irq);
            }

            p.check_killed(-1);
        }
        ScauseType::IntSSoft => {
            if CpuManager::cpu_id() == 0 {
                clock_intr();
            }

            sip::clear_ssip();

            p.check_killed(-1);
            p.alarm_tick();
            p.yielding();
        }
        ScauseType::ExcStorePageFault => {
            let va = stval::read();
            let pd = p.data.get_mut();
            if pd.pagetable.as_mut().unwrap().cow_fault(va).is_err() {
                println!(
                    "user_trap: store page fault at va={:#x} pid={}",
                    va,
                    p.excl.lock().pid
                );
                p.abandon(-1);
            }
            p.check_killed(-1);
        }
        ScauseType::ExcLoadPageFault => {
            println!(
                "user_trap: load page fault at va={:#x} pid={}",
                stval::read(),
                p.excl.lock().pid
            );
            p.abandon(-1);
        }
        ScauseType::Unknown => {
            println!("scause {:#x}", scause::read());
            println!("sepc={:#x} stval={:#x}", sepc::read(), stval::read());
            p.abandon(-1);
        }
    }

    user_trap_ret();
}

/// 返回用户态，不再回来。
///
/// 关中断、把陷阱向量指回跳板里的 uservec、填好陷阱帧的
/// 内核侧字段并恢复保存的用户 pc，最后跳进跳板页：
/// 那里切换页表并执行 sret。
pub unsafe fn user_trap_ret() -> ! {
    sstatus::intr_off();
    sstatus::user_ret_prepare();

    stvec::write(TRAMPOLINE.into());

    let satp = {
        let pd = CPU_MANAGER.my_proc().data.get_mut();
        pd.user_ret_prepare()
    };

    // userret 在跳板页中的虚拟地址
    extern "C" {
        fn trampoline();
        fn userret();
    }
    let distance = userret as usize - trampoline as usize;
    let userret_virt: extern "C" fn(usize, usize) -> ! =
        core::mem::transmute(Into::<usize>::into(TRAMPOLINE) + distance);

    userret_virt(TRAPFRAME.into(), satp);
}

/// 内核态陷阱入口，kernelvec 保存完寄存器后进到这里。
///
/// 内核里只应出现设备中断与时钟；时钟时让当前进程（如有）
/// 让出 CPU。其余原因一律视为内核错误。
#[no_mangle]
pub unsafe fn kerneltrap() {
    let local_sepc = sepc::read();
    let local_sstatus = sstatus::read();

    if !sstatus::is_from_supervisor() {
        panic!("kerneltrap: not from supervisor mode");
    }
    if sstatus::intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    match scause::get_scause() {
        ScauseType::IntSExt => {
            let irq = plic::claim();
            if irq as usize == UART0_IRQ {
                UART.intr();
            } else if irq as usize == VIRTIO0_IRQ {
                DISK.lock().intr();
            }
            if irq > 0 {
                plic::complete(irq);
            }
        }
        ScauseType::IntSSoft => {
            if CpuManager::cpu_id() == 0 {
                clock_intr();
            }

            sip::clear_ssip();

            CPU_MANAGER.my_cpu_mut().try_yield_proc();
        }
        ScauseType::ExcUEcall => {
            panic!("kerneltrap: ecall from supervisor mode");
        }
        ScauseType::ExcStorePageFault | ScauseType::ExcLoadPageFault | ScauseType::Unknown => {
            println!("scause {:#x}", scause::read());
            println!("sepc={:#x} stval={:#x}", sepc::read(), stval::read());
            panic!("kerneltrap: unexpected trap");
        }
    }

    // yield 期间可能发生别的陷阱，恢复现场寄存器
    sepc::write(local_sepc);
    sstatus::write(local_sstatus);
}

/// 全局时钟计数，所有 hart 共享，只有 hart 0 推进。
static TICKS: SpinLock<Wrapping<usize>> = SpinLock::new(Wrapping(0), "time");

/// 时钟 tick：计数加一并唤醒睡在计数器上的进程。
fn clock_intr() {
    let mut guard = TICKS.lock();
    *guard += Wrapping(1);
    unsafe {
        PROC_MANAGER.wakeup(&TICKS as *const _ as usize);
    }
    drop(guard);
}

/// 睡过 count 个 tick；睡眠期间被杀则返回错误。
pub fn clock_sleep(p: &Proc, count: usize) -> Result<(), ()> {
    let mut guard = TICKS.lock();
    let old_ticks = *guard;

    while (*guard - old_ticks) < Wrapping(count) {
        if p.killed.load(Ordering::Relaxed) {
            return Err(());
        }

        p.sleep(&TICKS as *const _ as usize, guard);
        guard = TICKS.lock();
    }
    Ok(())
}

/// 开机以来的 tick 数。
pub fn clock_read() -> usize {
    TICKS.lock().0
}
