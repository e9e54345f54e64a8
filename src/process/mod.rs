//! 进程表与进程生命周期管理

use array_macro::array;

use core::convert::TryFrom;
use core::mem;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::consts::{fs::ROOTDEV, NPROC, PGSIZE, TRAMPOLINE};
use crate::fs;
use crate::mm::{kvm_map, PageTable, PhysAddr, PteFlag, RawPage, RawQuadPage, RawSinglePage, VirtAddr};
use crate::spinlock::SpinLock;
use crate::trap::user_trap_ret;

pub use cpu::{pop_off, push_off, CpuManager, CPU_MANAGER};
pub use proc::Proc;

mod context;
mod cpu;
mod proc;
mod trapframe;

use context::Context;
use proc::ProcState;
use trapframe::TrapFrame;

/// 全局进程管理器。
///
/// 持有固定容量的进程表、父子关系映射和 pid 分配器。
/// 进程表本身不整体加锁：每个槽位的排他状态由槽内自旋锁保护，
/// 父子关系由 parents 的锁保护（即等待锁，先于任何进程锁获取）。
pub static mut PROC_MANAGER: ProcManager = ProcManager::new();

pub struct ProcManager {
    table: [Proc; NPROC],
    /// 父子关系：下标为子进程，值为父进程下标。
    /// 它的锁就是 wait/exit 共用的等待锁。
    parents: SpinLock<[Option<usize>; NPROC]>,
    /// init 进程在表中的下标
    init_proc: usize,
    pid: SpinLock<usize>,
}

impl ProcManager {
    const fn new() -> Self {
        Self {
            table: array![i => Proc::new(i); NPROC],
            parents: SpinLock::new(array![_ => None; NPROC], "proc parents"),
            init_proc: 0,
            pid: SpinLock::new(0, "pid"),
        }
    }

    /// 为每个进程槽位分配内核栈并映射进内核地址空间。
    ///
    /// 栈占四页，相邻栈之间留一页未映射作溢出保护。
    ///
    /// # 安全性
    /// 启动期由 hart 0 在分页开启前调用一次。
    pub unsafe fn proc_init(&mut self) {
        for (pos, p) in self.table.iter_mut().enumerate() {
            let pa = RawQuadPage::new_zeroed() as usize;
            let va = kstack(pos);
            kvm_map(
                VirtAddr::try_from(va).unwrap(),
                PhysAddr::try_from(pa).unwrap(),
                PGSIZE * 4,
                PteFlag::R | PteFlag::W,
            );
            p.data.get_mut().set_kstack(va);
        }
    }

    /// 分配一个唯一的递增 pid。
    fn alloc_pid(&self) -> usize {
        let ret_pid: usize;
        let mut pid = self.pid.lock();
        ret_pid = *pid;
        *pid += 1;
        drop(pid);
        ret_pid
    }

    /// 在表中找一个 UNUSED 槽位并初始化为 ALLOCATED。
    ///
    /// 持着槽位锁完成状态转换，观察者要么看到 UNUSED
    /// 要么看到已填好 pid 的 ALLOCATED。
    /// 同时分配陷阱帧页、报警快照页和带跳板映射的空页表；
    /// 任何一步资源不足都回退并返回 None。
    fn alloc_proc(&mut self) -> Option<&mut Proc> {
        let new_pid = self.alloc_pid();

        for p in self.table.iter_mut() {
            let mut guard = p.excl.lock();
            match guard.state {
                ProcState::UNUSED => {
                    let pd = p.data.get_mut();

                    // 陷阱帧一页
                    pd.tf = unsafe { RawSinglePage::try_new_zeroed().ok()? as *mut TrapFrame };

                    // 报警快照一页
                    pd.alarm_tf =
                        match unsafe { RawSinglePage::try_new_zeroed() } {
                            Ok(mem) => mem as *mut TrapFrame,
                            Err(_) => {
                                unsafe { RawSinglePage::from_raw_and_drop(pd.tf as *mut u8) };
                                pd.tf = ptr::null_mut();
                                return None;
                            }
                        };

                    debug_assert!(pd.pagetable.is_none());
                    match PageTable::alloc_proc_pagetable(pd.tf as usize) {
                        Some(pgt) => pd.pagetable = Some(pgt),
                        None => {
                            unsafe {
                                RawSinglePage::from_raw_and_drop(pd.tf as *mut u8);
                                RawSinglePage::from_raw_and_drop(pd.alarm_tf as *mut u8);
                            }
                            pd.tf = ptr::null_mut();
                            pd.alarm_tf = ptr::null_mut();
                            return None;
                        }
                    }
                    pd.init_context();
                    guard.pid = new_pid;
                    guard.state = ProcState::ALLOCATED;

                    drop(guard);
                    return Some(p);
                }
                _ => drop(guard),
            }
        }

        None
    }

    /// 调度器的取活接口：找到第一个 RUNNABLE 的进程，
    /// 标成 ALLOCATED 后返回（不带锁）。
    fn alloc_runnable(&mut self) -> Option<&mut Proc> {
        for p in self.table.iter_mut() {
            let mut guard = p.excl.lock();
            match guard.state {
                ProcState::RUNNABLE => {
                    guard.state = ProcState::ALLOCATED;
                    drop(guard);
                    return Some(p);
                }
                _ => {
                    drop(guard);
                }
            }
        }

        None
    }

    /// 创建第一个用户进程。
    ///
    /// # 安全性
    /// 启动期由 hart 0 调用一次，此时进程表必然还有空位。
    pub unsafe fn user_init(&mut self) {
        let p = self.alloc_proc().expect("all slots should be unused");
        p.user_init();
        let mut guard = p.excl.lock();
        guard.state = ProcState::RUNNABLE;
    }

    /// 唤醒所有睡在 channel 上的进程。
    ///
    /// 调用者必须持有与等待条件相应的条件锁，否则会丢失唤醒；
    /// 同时不得持有任何进程锁，否则死锁。
    pub fn wakeup(&self, channel: usize) {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state == ProcState::SLEEPING && guard.channel == channel {
                guard.state = ProcState::RUNNABLE;
            }
            drop(guard);
        }
    }

    /// 登记 child_i 的父进程为 parent_i。
    fn set_parent(&self, child_i: usize, parent_i: usize) {
        let mut guard = self.parents.lock();
        let ret = guard[child_i].replace(parent_i);
        debug_assert!(ret.is_none());
        drop(guard);
    }

    /// 进程退出路径，不返回。
    ///
    /// 关闭打开的文件并放掉 cwd，把自己的子进程过继给 init
    /// 并唤醒它，唤醒自己的父进程，然后持着自身槽位锁
    /// 写入退出码、转成 ZOMBIE，最后切回调度器。
    /// 资源回收留给父进程的 wait。
    fn exiting(&self, exit_pi: usize, exit_status: i32) {
        if exit_pi == self.init_proc {
            panic!("init process exiting");
        }

        unsafe {
            self.table[exit_pi].data.get().as_mut().unwrap().close_files();
        }

        let mut parent_map = self.parents.lock();

        // 子进程全部过继给 init
        let mut have_child = false;
        for child in parent_map.iter_mut() {
            match child {
                Some(parent) if *parent == exit_pi => {
                    *parent = self.init_proc;
                    have_child = true;
                }
                _ => {}
            }
        }
        if have_child {
            self.wakeup(&self.table[self.init_proc] as *const Proc as usize);
        }
        let exit_parenti = *parent_map[exit_pi].as_ref().unwrap();
        self.wakeup(&self.table[exit_parenti] as *const Proc as usize);

        let mut exit_pexcl = self.table[exit_pi].excl.lock();
        exit_pexcl.exit_status = exit_status;
        exit_pexcl.state = ProcState::ZOMBIE;
        drop(parent_map);
        unsafe {
            let exit_ctx = self.table[exit_pi].data.get().as_mut().unwrap().get_context();
            CPU_MANAGER.my_cpu_mut().sched(exit_pexcl, exit_ctx);
        }

        unreachable!("exiting {}", exit_pi);
    }

    /// 等待任一子进程退出。
    ///
    /// 在等待锁（parents 的锁）下扫描：
    /// 发现 ZOMBIE 子进程就拷出退出码、释放其全部资源并返回 pid；
    /// 有子进程但都活着就睡在自身地址上等 exiting 来唤醒；
    /// 没有子进程或自己已被杀则返回错误。
    fn waiting(&self, pi: usize, addr: usize) -> Result<usize, ()> {
        let mut parent_map = self.parents.lock();
        let p = unsafe { CPU_MANAGER.my_proc() };
        let pdata = unsafe { p.data.get().as_mut().unwrap() };

        loop {
            let mut have_child = false;
            for i in 0..NPROC {
                if parent_map[i].is_none() || *parent_map[i].as_ref().unwrap() != pi {
                    continue;
                }

                let mut child_excl = self.table[i].excl.lock();
                have_child = true;
                if child_excl.state != ProcState::ZOMBIE {
                    continue;
                }
                let child_pid = child_excl.pid;
                if addr != 0
                    && pdata
                        .copy_out(
                            &child_excl.exit_status as *const _ as *const u8,
                            addr,
                            mem::size_of_val(&child_excl.exit_status),
                        )
                        .is_err()
                {
                    return Err(());
                }
                parent_map[i].take();
                self.table[i].killed.store(false, Ordering::Relaxed);
                let child_data = unsafe { self.table[i].data.get().as_mut().unwrap() };
                child_data.cleanup();
                child_excl.cleanup();
                return Ok(child_pid);
            }

            if !have_child || p.killed.load(Ordering::Relaxed) {
                return Err(());
            }

            // 有子进程但没人退出，睡等
            let channel = p as *const Proc as usize;
            p.sleep(channel, parent_map);
            parent_map = self.parents.lock();
        }
    }

    /// 按 pid 杀进程：置 killed 标志，
    /// 睡着的顺手改成 RUNNABLE 让它尽快跑到检查点。
    pub fn kill(&self, pid: usize) -> Result<(), ()> {
        for i in 0..NPROC {
            let mut guard = self.table[i].excl.lock();
            if guard.pid == pid {
                self.table[i].killed.store(true, Ordering::Relaxed);
                if guard.state == ProcState::SLEEPING {
                    guard.state = ProcState::RUNNABLE;
                }
                return Ok(());
            }
        }

        Err(())
    }
}

/// fork 出的子进程第一次被调度时从这里开始执行。
///
/// 此时仍持有调度器传来的进程锁，先释放它。
/// 第一个进程顺便完成文件系统挂载（挂载要做磁盘 I/O，
/// 必须在进程上下文里，不能在 rust_main 里做）。
///
/// 安全性：非重入，且文件系统初始化只会发生一次。
unsafe fn fork_ret() -> ! {
    static mut INITIALIZED: bool = false;

    CPU_MANAGER.my_proc().excl.unlock();

    if !INITIALIZED {
        INITIALIZED = true;
        fs::init(ROOTDEV);
    }

    user_trap_ret();
}

/// 第 pos 个进程的内核栈起始虚拟地址。
/// 栈区从跳板页往下按 5 页一跨排布：4 页栈体加 1 页保护。
#[inline]
fn kstack(pos: usize) -> usize {
    Into::<usize>::into(TRAMPOLINE) - (pos + 1) * 5 * PGSIZE
}
