//! 单个进程：状态机、私有数据与进程级操作

use array_macro::array;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::mem;
use core::option::Option;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::{
    fs::{NFILE, ROOTIPATH},
    PGSIZE,
};
use crate::fs::{File, Inode, ICACHE, LOG};
use crate::mm::{PageTable, RawPage, RawSinglePage};
use crate::register::{satp, sepc, sstatus};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::trap::user_trap;

use super::cpu::CPU_MANAGER;
use super::CpuManager;
use super::PROC_MANAGER;
use super::{fork_ret, Context, TrapFrame};

use self::syscall::Syscall;

mod elf;
mod syscall;

/// 进程生命周期的六个状态。
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ProcState {
    /// 槽位空闲
    UNUSED,
    /// 已被占用但尚不可运行（分配中或被调度器摘走）
    ALLOCATED,
    /// 睡在某个通道上
    SLEEPING,
    /// 等待被调度
    RUNNABLE,
    /// 正在某个 hart 上执行
    RUNNING,
    /// 已退出，等父进程收尸
    ZOMBIE,
}

/// 进程的排他状态，由槽位自旋锁保护。
///
/// 其他 hart（调度器、wakeup、kill、wait）都可能并发读写，
/// 因此任何修改必须持锁。
pub struct ProcExcl {
    pub state: ProcState,
    pub exit_status: i32,
    /// 睡眠通道：一个内核对象的地址，仅比较相等性
    pub channel: usize,
    pub pid: usize,
}

impl ProcExcl {
    const fn new() -> Self {
        Self {
            state: ProcState::UNUSED,
            exit_status: 0,
            channel: 0,
            pid: 0,
        }
    }

    pub fn cleanup(&mut self) {
        self.pid = 0;
        self.channel = 0;
        self.exit_status = 0;
        self.state = ProcState::UNUSED;
    }
}

/// 进程的私有数据。
///
/// 只有进程自己运行时访问，或持有该进程排他锁的
/// 其他进程（fork、wait 收尸）访问，因此不单独加锁。
pub struct ProcData {
    /// 内核栈起始虚拟地址
    kstack: usize,
    /// 用户地址空间大小（字节）
    sz: usize,
    /// 上下文切换的保存区
    context: Context,
    /// 进程名，调试用
    name: [u8; 16],
    /// 打开文件表
    open_files: [Option<Arc<File>>; NFILE],
    /// 陷阱帧页
    pub tf: *mut TrapFrame,
    /// 用户页表
    pub pagetable: Option<Box<PageTable>>,
    /// 当前工作目录
    pub cwd: Option<Inode>,
    /// 报警间隔（tick 数），0 表示未设置
    alarm_period: usize,
    /// 用户态报警处理函数的入口
    alarm_handler: usize,
    /// 距上次报警派发已过的 tick 数
    alarm_ticks: usize,
    /// 报警处理函数尚未 sigreturn，抑制重入
    in_alarm: bool,
    /// 派发报警时的陷阱帧快照页
    pub alarm_tf: *mut TrapFrame,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            context: Context::new(),
            name: [0; 16],
            open_files: array![_ => None; NFILE],
            tf: ptr::null_mut(),
            pagetable: None,
            cwd: None,
            alarm_period: 0,
            alarm_handler: 0,
            alarm_ticks: 0,
            in_alarm: false,
            alarm_tf: ptr::null_mut(),
        }
    }

    pub fn set_kstack(&mut self, kstack: usize) {
        self.kstack = kstack;
    }

    /// 初始化上下文：新进程第一次被调度时
    /// 从 fork_ret "返回"，栈指向内核栈顶。
    pub fn init_context(&mut self) {
        self.context.clear();
        self.context.set_ra(fork_ret as *const () as usize);
        self.context.set_sp(self.kstack + PGSIZE * 4);
    }

    pub fn get_context(&mut self) -> *mut Context {
        &mut self.context as *mut _
    }

    /// 回用户态前填好陷阱帧的内核侧字段，
    /// 返回用户页表的 satp 值供跳板切换。
    pub fn user_ret_prepare(&mut self) -> usize {
        let tf: &mut TrapFrame = unsafe { self.tf.as_mut().unwrap() };
        tf.kernel_satp = satp::read();
        // 回到内核时栈上的旧内容已无意义，从栈顶重新开始
        tf.kernel_sp = self.kstack + PGSIZE * 4;
        tf.kernel_trap = user_trap as usize;
        tf.kernel_hartid = unsafe { CpuManager::cpu_id() };

        sepc::write(tf.epc);

        self.pagetable.as_ref().unwrap().as_satp()
    }

    /// 粗检用户传入的地址是否落在进程地址空间内。
    fn check_user_addr(&self, user_addr: usize) -> Result<(), ()> {
        if user_addr > self.sz {
            Err(())
        } else {
            Ok(())
        }
    }

    /// 拷贝 count 字节到用户虚拟地址 dst。
    #[inline]
    pub fn copy_out(&mut self, src: *const u8, dst: usize, count: usize) -> Result<(), ()> {
        self.pagetable.as_mut().unwrap().copy_out(src, dst, count)
    }

    /// 从用户虚拟地址 src 拷贝 count 字节进内核。
    #[inline]
    pub fn copy_in(&self, src: usize, dst: *mut u8, count: usize) -> Result<(), ()> {
        self.pagetable.as_ref().unwrap().copy_in(src, dst, count)
    }

    /// 找一个空闲文件描述符。
    fn alloc_fd(&mut self) -> Option<usize> {
        self.open_files
            .iter()
            .enumerate()
            .find(|(_, f)| f.is_none())
            .map(|(i, _)| i)
    }

    /// 找一对空闲文件描述符，pipe 用。
    fn alloc_fd2(&mut self) -> Option<(usize, usize)> {
        let mut iter = self
            .open_files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_none())
            .take(2)
            .map(|(i, _)| i);
        let fd1 = iter.next()?;
        let fd2 = iter.next()?;
        Some((fd1, fd2))
    }

    /// 释放进程私有资源：陷阱帧页、报警快照页、
    /// 用户页表与全部用户内存。由收尸方在持排他锁时调用。
    pub fn cleanup(&mut self) {
        self.name[0] = 0;
        let tf = self.tf;
        self.tf = ptr::null_mut();
        if !tf.is_null() {
            unsafe {
                RawSinglePage::from_raw_and_drop(tf as *mut u8);
            }
        }
        let alarm_tf = self.alarm_tf;
        self.alarm_tf = ptr::null_mut();
        if !alarm_tf.is_null() {
            unsafe {
                RawSinglePage::from_raw_and_drop(alarm_tf as *mut u8);
            }
        }
        self.alarm_period = 0;
        self.alarm_handler = 0;
        self.alarm_ticks = 0;
        self.in_alarm = false;
        let pgt = self.pagetable.take();
        if let Some(mut pgt) = pgt {
            pgt.dealloc_proc_pagetable(self.sz);
        }
        self.sz = 0;
    }

    /// 关闭全部打开文件并放掉 cwd（后者要走日志事务）。
    pub fn close_files(&mut self) {
        for f in self.open_files.iter_mut() {
            drop(f.take())
        }
        LOG.begin_op();
        debug_assert!(self.cwd.is_some());
        drop(self.cwd.take());
        LOG.end_op();
    }

    /// sbrk：按 increment 伸缩用户地址空间，返回旧大小。
    /// 伸长失败或缩过零点时大小不变并报错。
    fn sbrk(&mut self, increment: i32) -> Result<usize, ()> {
        let old_size = self.sz;
        if increment > 0 {
            let new_size = old_size + increment as usize;
            self.pagetable.as_mut().unwrap().uvm_alloc(old_size, new_size)?;
            self.sz = new_size;
        } else if increment < 0 {
            let new_size = old_size.checked_sub((-increment) as usize).ok_or(())?;
            self.pagetable.as_mut().unwrap().uvm_dealloc(old_size, new_size);
            self.sz = new_size;
        }
        Ok(old_size)
    }
}

/// 进程表中的一个槽位。
pub struct Proc {
    /// 在进程表中的下标
    index: usize,
    /// 排他状态，槽位锁
    pub excl: SpinLock<ProcExcl>,
    /// 私有数据（见 [`ProcData`] 的访问约定）
    pub data: UnsafeCell<ProcData>,
    /// 终止信号，陷阱出入口与睡眠返回处轮询
    pub killed: AtomicBool,
}

impl Proc {
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            excl: SpinLock::new(ProcExcl::new(), "proc excl"),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
        }
    }

    /// 把第一个用户进程装配起来：映射 initcode、
    /// 设好初始 pc/sp、取根目录作为 cwd。
    pub fn user_init(&mut self) {
        let pd = self.data.get_mut();

        pd.pagetable.as_mut().unwrap().uvm_init(&INITCODE);
        pd.sz = PGSIZE;

        let tf = unsafe { pd.tf.as_mut().unwrap() };
        tf.epc = 0;
        tf.sp = PGSIZE;

        let init_name = b"initcode\0";
        unsafe {
            ptr::copy_nonoverlapping(init_name.as_ptr(), pd.name.as_mut_ptr(), init_name.len());
        }

        debug_assert!(pd.cwd.is_none());
        pd.cwd = Some(ICACHE.namei(&ROOTIPATH).expect("cannot find root inode"));
    }

    /// killed 标志已置位时就地退出。
    pub fn check_killed(&mut self, exit_status: i32) {
        if self.killed.load(Ordering::Relaxed) {
            unsafe {
                PROC_MANAGER.exiting(self.index, exit_status);
            }
        }
    }

    /// 置 killed 标志并立刻退出，用户态异常走这条路。
    pub fn abandon(&mut self, exit_status: i32) {
        self.killed.store(true, Ordering::Relaxed);
        unsafe {
            PROC_MANAGER.exiting(self.index, exit_status);
        }
    }

    /// 系统调用分发：a7 选函数，结果写回 a0，失败统一 -1。
    pub fn syscall(&mut self) {
        sstatus::intr_on();

        let tf = unsafe { self.data.get_mut().tf.as_mut().unwrap() };
        let a7 = tf.a7;
        tf.admit_ecall();
        let sys_result = match a7 {
            1 => self.sys_fork(),
            2 => self.sys_exit(),
            3 => self.sys_wait(),
            4 => self.sys_pipe(),
            5 => self.sys_read(),
            6 => self.sys_kill(),
            7 => self.sys_exec(),
            8 => self.sys_fstat(),
            9 => self.sys_chdir(),
            10 => self.sys_dup(),
            11 => self.sys_getpid(),
            12 => self.sys_sbrk(),
            13 => self.sys_sleep(),
            14 => self.sys_uptime(),
            15 => self.sys_open(),
            16 => self.sys_write(),
            17 => self.sys_mknod(),
            18 => self.sys_unlink(),
            19 => self.sys_link(),
            20 => self.sys_mkdir(),
            21 => self.sys_close(),
            22 => self.sys_sigalarm(),
            23 => self.sys_sigreturn(),
            _ => {
                println!("unknown syscall num: {}", a7);
                Err(())
            }
        };
        tf.a0 = match sys_result {
            Ok(ret) => ret,
            Err(()) => -1isize as usize,
        };
    }

    /// 时钟路径的报警推进。
    ///
    /// 设置了报警且不在处理函数中时计一个 tick；
    /// 计满一个周期就把陷阱帧整帧快照下来、
    /// 清零计数（派发点即重置点）、置重入抑制标志，
    /// 并把保存的 pc 改指处理函数。真正的跳转发生在
    /// 本次陷阱返回用户态时。
    pub fn alarm_tick(&mut self) {
        let pd = self.data.get_mut();
        if pd.alarm_period == 0 || pd.in_alarm {
            return;
        }
        pd.alarm_ticks += 1;
        if pd.alarm_ticks >= pd.alarm_period {
            pd.alarm_ticks = 0;
            pd.in_alarm = true;
            unsafe {
                ptr::copy_nonoverlapping(pd.tf as *const TrapFrame, pd.alarm_tf, 1);
                pd.tf.as_mut().unwrap().epc = pd.alarm_handler;
            }
        }
    }

    /// 主动让出 CPU：RUNNING 改 RUNNABLE，切回调度器。
    pub fn yielding(&mut self) {
        let mut guard = self.excl.lock();
        assert_eq!(guard.state, ProcState::RUNNING);
        guard.state = ProcState::RUNNABLE;
        guard = unsafe {
            CPU_MANAGER
                .my_cpu_mut()
                .sched(guard, self.data.get_mut().get_context())
        };
        drop(guard);
    }

    /// 原子地释放条件锁并睡到 channel 上。
    ///
    /// 先拿自己的槽位锁再放条件锁：唤醒方必须经过槽位锁，
    /// 所以这中间不会丢唤醒。醒来后清通道、放槽位锁；
    /// 条件锁不在此处重取，由调用方决定。
    /// 唤醒可能是虚假或广播的，调用方必须重查等待条件。
    pub fn sleep<T>(&self, channel: usize, guard: SpinLockGuard<'_, T>) {
        let mut excl_guard = self.excl.lock();
        drop(guard);

        excl_guard.channel = channel;
        excl_guard.state = ProcState::SLEEPING;

        unsafe {
            let c = CPU_MANAGER.my_cpu_mut();
            excl_guard = c.sched(excl_guard, &mut (*self.data.get()).context as *mut _);
        }

        excl_guard.channel = 0;
        drop(excl_guard);
    }

    /// fork：写时复制地克隆当前进程。
    ///
    /// 子进程共享全部数据页（两侧叶项都改为只读加 C 标记），
    /// 陷阱帧按值拷贝且 a0 清零，文件表和 cwd 逐项克隆引用。
    /// 任何失败都把子进程槽位清回 UNUSED。
    fn fork(&mut self) -> Result<usize, ()> {
        let pdata = self.data.get_mut();
        let child = unsafe { PROC_MANAGER.alloc_proc().ok_or(())? };
        let mut cexcl = child.excl.lock();
        let cdata = unsafe { child.data.get().as_mut().unwrap() };

        // 共享用户内存
        let cpgt = cdata.pagetable.as_mut().unwrap();
        let size = pdata.sz;
        if pdata.pagetable.as_mut().unwrap().uvm_copy(cpgt, size).is_err() {
            debug_assert_eq!(child.killed.load(Ordering::Relaxed), false);
            child.killed.store(false, Ordering::Relaxed);
            cdata.cleanup();
            cexcl.cleanup();
            return Err(());
        }
        cdata.sz = size;

        // 克隆陷阱帧，子进程在 a0 看到 0
        unsafe {
            ptr::copy_nonoverlapping(pdata.tf, cdata.tf, 1);
            cdata.tf.as_mut().unwrap().a0 = 0;
        }

        // 克隆打开文件与当前目录
        cdata.open_files.clone_from(&pdata.open_files);
        cdata.cwd.clone_from(&pdata.cwd);

        cdata.name.copy_from_slice(&pdata.name);

        let cpid = cexcl.pid;

        drop(cexcl);

        unsafe {
            PROC_MANAGER.set_parent(child.index, self.index);
        }

        let mut cexcl = child.excl.lock();
        cexcl.state = ProcState::RUNNABLE;
        drop(cexcl);

        Ok(cpid)
    }
}

impl Proc {
    /// 第 n 个系统调用参数的原始值，n 取 0..=5。
    fn arg_raw(&self, n: usize) -> usize {
        let tf = unsafe { self.data.get().as_ref().unwrap().tf.as_ref().unwrap() };
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("arg_raw: n larger than 5"),
        }
    }

    /// 按 i32 取参数，usize 与 i32 之间 as 转换。
    #[inline]
    fn arg_i32(&self, n: usize) -> i32 {
        self.arg_raw(n) as i32
    }

    /// 按用户虚拟地址取参数，可能为空，仅用于访问用户空间。
    #[inline]
    fn arg_addr(&self, n: usize) -> usize {
        self.arg_raw(n)
    }

    /// 按文件描述符取参数，校验范围与打开状态。
    #[inline]
    fn arg_fd(&mut self, n: usize) -> Result<usize, ()> {
        let fd = self.arg_raw(n);
        if fd >= NFILE || self.data.get_mut().open_files[fd].is_none() {
            Err(())
        } else {
            Ok(fd)
        }
    }

    /// 按字符串取参数：从参数指向的用户地址拷一个
    /// 以 0 结尾的字符串到 buf。
    fn arg_str(&self, n: usize, buf: &mut [u8]) -> Result<(), &'static str> {
        let addr: usize = self.arg_raw(n);
        let pagetable = unsafe {
            self.data
                .get()
                .as_ref()
                .unwrap()
                .pagetable
                .as_ref()
                .unwrap()
        };
        pagetable.copy_in_str(addr, buf)?;
        Ok(())
    }

    /// 从用户地址 addr 读一个 usize。
    fn fetch_addr(&self, addr: usize) -> Result<usize, &'static str> {
        let pd = unsafe { self.data.get().as_ref().unwrap() };
        if addr + mem::size_of::<usize>() > pd.sz {
            Err("fetch_addr: addr out of range")
        } else {
            let mut ret: usize = 0;
            match pd.copy_in(addr, &mut ret as *mut usize as *mut u8, mem::size_of::<usize>()) {
                Ok(_) => Ok(ret),
                Err(_) => Err("fetch_addr: copy_in error"),
            }
        }
    }

    /// 从用户地址 addr 读一个以 0 结尾的字符串到 dst。
    fn fetch_str(&self, addr: usize, dst: &mut [u8]) -> Result<(), &'static str> {
        let pd = unsafe { self.data.get().as_ref().unwrap() };
        pd.pagetable.as_ref().unwrap().copy_in_str(addr, dst)
    }
}

/// 第一个用户程序：调用 exec("/init") 的手写机器码。
static INITCODE: [u8; 51] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x05, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x05, 0x02,
    0x9d, 0x48, 0x73, 0x00, 0x00, 0x00, 0x89, 0x48, 0x73, 0x00, 0x00, 0x00, 0xef, 0xf0, 0xbf, 0xff,
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00,
];
