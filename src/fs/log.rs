//! 预写日志：多块文件系统更新的原子性
//!
//! 磁盘布局：一个日志头块，后面跟固定数量的日志数据块。
//! 事务里被修改的块先拷到日志区，写下日志头的那一刻即提交；
//! 之后再把各块安装回原位。任何时刻崩溃，重启回放日志头里
//! 记录的块即可恢复到最近一次提交后的状态，重复回放无害。

use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr;

use super::{BufData, Buf, BCACHE, SUPER_BLOCK};
use crate::consts::fs::{BSIZE, LOGSIZE, MAXOPBLOCKS};
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

/// 全局日志实例。
///
/// begin_op / write / end_op 是文件系统全部写路径的必经之门。
pub static LOG: SpinLock<Log> = SpinLock::new(Log::uninit(), "log");

pub struct Log {
    /// 日志区起始块号（读自超级块）
    start: u32,
    /// 日志区块数（含日志头块）
    size: u32,
    dev: u32,
    /// 进行中的文件系统操作数
    outstanding: u32,
    /// 正在提交，期间禁止新的操作进入
    committing: bool,
    /// 当前事务的内存日志头
    lh: LogHeader,
}

impl Log {
    const fn uninit() -> Self {
        Self {
            start: 0,
            size: 0,
            dev: 0,
            outstanding: 0,
            committing: false,
            lh: LogHeader {
                len: 0,
                blocknos: [0; LOGSIZE - 1],
            },
        }
    }

    /// 读取日志区位置并执行崩溃恢复。
    ///
    /// # 安全性
    /// 过程要做磁盘 I/O，调用时不得持有自旋锁。
    pub unsafe fn init(&mut self, dev: u32) {
        debug_assert!(mem::size_of::<LogHeader>() < BSIZE);
        debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<LogHeader>(), 0);
        let (start, size) = SUPER_BLOCK.read_log();
        self.start = start;
        self.size = size;
        self.dev = dev;
        self.recover();
    }

    /// 日志头非空说明上次的提交没安装完，重放一遍再清头。
    fn recover(&mut self) {
        println!("file system: checking logs");
        self.read_head();
        if self.lh.len > 0 {
            println!("file system: recovering from logs");
            self.install_trans(true);
            self.empty_head();
        } else {
            println!("file system: no need to recover");
        }
    }

    /// 把磁盘上的日志头读进内存。
    fn read_head(&mut self) {
        let buf = BCACHE.bread(self.dev, self.start);
        unsafe {
            ptr::copy_nonoverlapping(buf.raw_data() as *const LogHeader, &mut self.lh, 1);
        }
        drop(buf);
    }

    /// 把内存日志头写到磁盘。这一步就是事务的提交点。
    fn write_head(&mut self) {
        let mut buf = BCACHE.bread(self.dev, self.start);
        unsafe {
            ptr::copy_nonoverlapping(&self.lh, buf.raw_data_mut() as *mut LogHeader, 1);
        }
        buf.bwrite();
        drop(buf);
    }

    /// 内存与磁盘上的日志头长度同时清零，日志区可复用。
    fn empty_head(&mut self) {
        self.lh.len = 0;
        let mut buf = BCACHE.bread(self.dev, self.start);
        let raw_lh = buf.raw_data_mut() as *mut LogHeader;
        unsafe {
            raw_lh.as_mut().unwrap().len = 0;
        }
        buf.bwrite();
        drop(buf);
    }

    /// 把日志区的块安装回各自的原位。
    ///
    /// 提交路径（recovering=false）安装完顺带解除缓存块的
    /// pin；恢复路径只做安装。重复执行效果相同。
    fn install_trans(&mut self, recovering: bool) {
        for i in 0..self.lh.len {
            let log_buf = BCACHE.bread(self.dev, self.start + 1 + i);
            let mut disk_buf = BCACHE.bread(self.dev, self.lh.blocknos[i as usize]);
            unsafe {
                ptr::copy(log_buf.raw_data(), disk_buf.raw_data_mut(), 1);
            }
            disk_buf.bwrite();
            if !recovering {
                disk_buf.unpin();
            }
            drop(log_buf);
            drop(disk_buf);
        }
    }

    /// 提交当前事务。
    ///
    /// 顺序依次是：被改的块拷到日志区并落盘；写日志头（提交点）；
    /// 逐块安装回家并解除 pin；清日志头。
    /// 每一步之间由缓冲写的同步性充当屏障。
    ///
    /// # 安全性
    /// 仅在 committing 置位后、不持日志锁时调用。
    pub unsafe fn commit(&mut self) {
        if !self.committing {
            panic!("log: commit without committing flag");
        }
        if self.lh.len > 0 {
            self.write_log();
            self.write_head();
            self.install_trans(false);
            self.empty_head();
        }
    }

    /// 把事务涉及的缓存块内容拷到日志区并落盘。
    fn write_log(&mut self) {
        for i in 0..self.lh.len {
            let mut log_buf = BCACHE.bread(self.dev, self.start + 1 + i);
            let cache_buf = BCACHE.bread(self.dev, self.lh.blocknos[i as usize]);
            unsafe {
                ptr::copy(cache_buf.raw_data(), log_buf.raw_data_mut(), 1);
            }
            log_buf.bwrite();
            drop(cache_buf);
            drop(log_buf);
        }
    }
}

impl SpinLock<Log> {
    /// 文件系统操作的开场白。
    ///
    /// 日志正在提交、或本操作按最坏情况预留后会超出日志容量时，
    /// 睡等 end_op 的唤醒；否则把进行中操作数加一后放行。
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                || 1 + guard.lh.len as usize + (guard.outstanding + 1) as usize * MAXOPBLOCKS
                    > LOGSIZE
            {
                let channel = guard.deref() as *const Log as usize;
                unsafe {
                    CPU_MANAGER.my_proc().sleep(channel, guard);
                }
                guard = self.lock();
            } else {
                guard.outstanding += 1;
                drop(guard);
                break;
            }
        }
    }

    /// 把修改过的缓冲块登记到当前事务。
    ///
    /// 同一块号在事务内只占一个日志槽（吸收）；
    /// 新登记的块被 pin 在缓存里直到安装完成。
    /// 必须在 begin_op/end_op 之间调用。
    pub fn write(&self, buf: Buf<'_>) {
        let mut guard = self.lock();

        if (guard.lh.len + 1) as usize >= LOGSIZE || guard.lh.len + 1 >= guard.size {
            panic!("log: too big a transaction");
        }
        if guard.outstanding < 1 {
            panic!("log: write outside of transaction");
        }

        // 吸收：已登记过的块号直接复用原槽位
        for i in 0..guard.lh.len {
            if guard.lh.blocknos[i as usize] == buf.read_blockno() {
                drop(guard);
                drop(buf);
                return;
            }
        }
        if (guard.lh.len + 2) as usize >= LOGSIZE || guard.lh.len + 2 >= guard.size {
            panic!("log: too big a transaction");
        }
        buf.pin();
        let len = guard.lh.len as usize;
        guard.lh.blocknos[len] = buf.read_blockno();
        guard.lh.len += 1;
        drop(guard);
        drop(buf);
    }

    /// 文件系统操作的收场白。
    ///
    /// 进行中操作数减一；归零的那一次负责提交。
    /// 提交在放掉日志锁之后进行，期间 committing 标志
    /// 挡住新操作；提交完成后唤醒所有等待者。
    pub fn end_op(&self) {
        let mut log_ptr: *mut Log = ptr::null_mut();

        let mut guard = self.lock();
        guard.outstanding -= 1;
        if guard.committing {
            panic!("log: end_op while committing");
        }
        if guard.outstanding == 0 {
            guard.committing = true;
            log_ptr = guard.deref_mut() as *mut Log;
        } else {
            // 腾出了预留空间，可能有人等得进来了
            let channel = guard.deref() as *const Log as usize;
            unsafe {
                PROC_MANAGER.wakeup(channel);
            }
        }
        drop(guard);

        if !log_ptr.is_null() {
            // 不持锁地提交，committing 标志保护日志状态
            unsafe {
                log_ptr.as_mut().unwrap().commit();
            }
            let mut guard = self.lock();
            guard.committing = false;
            let channel = guard.deref() as *const Log as usize;
            unsafe {
                PROC_MANAGER.wakeup(channel);
            }
            drop(guard);
        }
    }
}

/// 日志头：一次事务涉及的块号清单。
/// 内存里一份，磁盘日志区第一块上一份。
#[repr(C)]
struct LogHeader {
    len: u32,
    blocknos: [u32; LOGSIZE - 1],
}
