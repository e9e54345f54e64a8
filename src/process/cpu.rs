//! 每 CPU 状态：当前进程、调度器上下文与中断嵌套计数

use array_macro::array;

use core::arch::asm;
use core::ptr;

use super::proc::ProcExcl;
use super::{Context, Proc, ProcState, PROC_MANAGER};
use crate::consts::NCPU;
use crate::register::{sstatus, tp};
use crate::spinlock::SpinLockGuard;

/// 全局 CPU 表。
///
/// 每个 hart 只访问自己的条目（以关中断为前提），
/// 所以不加锁；跨 hart 的信息交换都走进程表。
pub static mut CPU_MANAGER: CpuManager = CpuManager::new();

pub struct CpuManager {
    table: [Cpu; NCPU],
}

impl CpuManager {
    const fn new() -> Self {
        Self {
            table: array![_ => Cpu::new(); NCPU],
        }
    }

    /// 当前 hart 编号，从 tp 读出。
    /// 必须在关中断时调用，否则读到一半可能被迁移。
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        tp::read()
    }

    /// 本 hart 的 Cpu 条目。中断必须已关闭。
    unsafe fn my_cpu(&self) -> &Cpu {
        &self.table[Self::cpu_id()]
    }

    /// 本 hart 的 Cpu 条目（可变）。中断必须已关闭。
    pub unsafe fn my_cpu_mut(&mut self) -> &mut Cpu {
        let id = Self::cpu_id();
        &mut self.table[id]
    }

    /// 当前 hart 上正在运行的进程。
    ///
    /// 短暂关中断读出 proc 指针；没有进程在跑时 panic。
    pub fn my_proc(&self) -> &mut Proc {
        let p;
        push_off();
        unsafe {
            let c = self.my_cpu();
            if c.proc.is_null() {
                panic!("my_proc: no process running");
            }
            p = &mut *c.proc;
        }
        pop_off();
        p
    }

    /// 本 hart 的调度器主循环，boot 完成后进入，永不返回。
    ///
    /// 每轮先开中断让积压的设备中断有机会投递，
    /// 然后从进程表取一个可运行进程并切换过去；
    /// 没有可运行进程时停在 wfi 上等待中断。
    pub unsafe fn scheduler(&mut self) -> ! {
        extern "C" {
            fn swtch(old: *mut Context, new: *mut Context);
        }

        let c = self.my_cpu_mut();

        loop {
            sstatus::intr_on();

            match PROC_MANAGER.alloc_runnable() {
                Some(p) => {
                    c.proc = p as *mut _;
                    let mut guard = p.excl.lock();
                    guard.state = ProcState::RUNNING;

                    swtch(
                        &mut c.scheduler as *mut Context,
                        p.data.get_mut().get_context(),
                    );

                    if c.proc.is_null() {
                        panic!("scheduler: switched back with no process");
                    }
                    c.proc = ptr::null_mut();
                    drop(guard);
                }
                None => {
                    // 没有活可干，等一个中断再看
                    asm!("wfi");
                }
            }
        }
    }
}

/// 单个 hart 的本地状态。
pub struct Cpu {
    /// 正在本 hart 上运行的进程，空闲时为 null
    proc: *mut Proc,
    /// 调度器自己的上下文，进程切回来时的目标
    scheduler: Context,
    /// push_off 的嵌套深度
    noff: u8,
    /// 最外层 push_off 之前中断是否开启
    intena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null_mut(),
            scheduler: Context::new(),
            noff: 0,
            intena: false,
        }
    }

    /// 从进程上下文切回调度器。
    ///
    /// 前置条件逐一校验：调用者持有该进程的锁、本 hart 恰好
    /// 只有这一层关中断（noff == 1）、进程已不处于 RUNNING、
    /// 中断确实关闭。intena 跨切换保存再恢复——它属于本次
    /// 执行流，而调度器在切换期间可能跑了别的进程。
    pub unsafe fn sched<'a>(
        &mut self,
        guard: SpinLockGuard<'a, ProcExcl>,
        ctx: *mut Context,
    ) -> SpinLockGuard<'a, ProcExcl> {
        extern "C" {
            fn swtch(old: *mut Context, new: *mut Context);
        }

        if !guard.holding() {
            panic!("sched: not holding proc lock");
        }
        if self.noff != 1 {
            panic!("sched: holding extra locks");
        }
        if guard.state == ProcState::RUNNING {
            panic!("sched: proc still running");
        }
        if sstatus::intr_get() {
            panic!("sched: interruptible");
        }

        let intena = self.intena;
        swtch(ctx, &mut self.scheduler as *mut Context);
        self.intena = intena;

        guard
    }

    /// 若本 hart 上有处于 RUNNING 的进程，让它让出 CPU。
    /// 内核态时钟中断走这条路径实现抢占。
    pub fn try_yield_proc(&mut self) {
        if !self.proc.is_null() {
            let p = unsafe { self.proc.as_mut().unwrap() };
            let guard = p.excl.lock();
            if guard.state == ProcState::RUNNING {
                drop(guard);
                p.yielding();
            } else {
                drop(guard);
            }
        }
    }
}

/// 关中断并压一层嵌套。
///
/// 第一层时记住之前的中断开关状态，供 pop_off 归零时恢复。
/// 与 pop_off 必须严格配对。
pub fn push_off() {
    let old = sstatus::intr_get();
    sstatus::intr_off();
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        c.intena = old;
    }
    c.noff += 1;
}

/// 弹一层关中断嵌套；归零且最外层原本开中断时重新开中断。
pub fn pop_off() {
    if sstatus::intr_get() {
        panic!("pop_off: interruptible");
    }
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        panic!("pop_off: count not match");
    }
    c.noff -= 1;
    if c.noff == 0 && c.intena {
        sstatus::intr_on();
    }
}
