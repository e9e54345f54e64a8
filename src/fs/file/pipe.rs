//! 管道

use alloc::sync::Arc;
use core::cmp::min;
use core::mem;
use core::num::Wrapping;
use core::ptr::addr_of_mut;
use core::sync::atomic::Ordering;

use crate::consts::fs::{PIPESIZE, PIPESIZE_U32};
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

use super::{File, FileInner};

/// 进程间的字节管道。
///
/// 一把自旋锁保护一个环形缓冲区和两端的开闭状态；
/// 读空、写满时各自睡在读/写计数器的地址上，
/// 对端推进后唤醒。
#[derive(Debug)]
pub struct Pipe(SpinLock<PipeInner>);

impl Pipe {
    /// 建一条管道，返回绑定到它的一对读端/写端文件。
    ///
    /// 管道体用 `Arc::try_new_zeroed` 原地构造
    /// （零值恰好是合法的初始状态，锁名随后补上）。
    pub fn create() -> Option<(Arc<File>, Arc<File>)> {
        debug_assert!(mem::size_of::<Pipe>() <= 1024);

        let mut pipe = Arc::<Self>::try_new_zeroed().ok()?;
        let pipe = unsafe {
            let ptr = Arc::get_mut_unchecked(&mut pipe).as_mut_ptr();
            SpinLock::init_name(addr_of_mut!((*ptr).0), "pipe");
            pipe.assume_init()
        };
        let mut guard = pipe.0.lock();
        guard.read_open = true;
        guard.write_open = true;
        drop(guard);

        let read_file = Arc::try_new(File {
            inner: FileInner::Pipe(Arc::clone(&pipe)),
            readable: true,
            writable: false,
        })
        .ok()?;
        let write_file = Arc::try_new(File {
            inner: FileInner::Pipe(Arc::clone(&pipe)),
            readable: false,
            writable: true,
        })
        .ok()?;

        Some((read_file, write_file))
    }

    /// 读至多 count 字节到用户地址。
    ///
    /// 管道空且写端还开着时睡等；写端关闭后读到多少算多少
    /// （可能为 0，即 EOF）。等待中被杀返回错误。
    pub(super) fn read(&self, addr: usize, count: u32) -> Result<u32, ()> {
        let p = unsafe { CPU_MANAGER.my_proc() };

        let mut pipe = self.0.lock();

        while pipe.read_cnt == pipe.write_cnt && pipe.write_open {
            if p.killed.load(Ordering::Relaxed) {
                return Err(());
            }
            p.sleep(&pipe.read_cnt as *const Wrapping<_> as usize, pipe);
            pipe = self.0.lock();
        }

        let count = min(count, (pipe.write_cnt - pipe.read_cnt).0);
        let mut read_count = count;
        for i in 0..count {
            let index = (pipe.read_cnt.0 % PIPESIZE_U32) as usize;
            let byte = pipe.data[index];
            pipe.read_cnt += Wrapping(1);
            if p.data
                .get_mut()
                .copy_out(&byte as *const u8, addr + i as usize, 1)
                .is_err()
            {
                read_count = i;
                break;
            }
        }
        unsafe {
            PROC_MANAGER.wakeup(&pipe.write_cnt as *const Wrapping<_> as usize);
        }
        drop(pipe);
        Ok(read_count)
    }

    /// 从用户地址写至多 count 字节进管道。
    ///
    /// 写满时唤醒读者并睡等空间；读端关闭或自己被杀
    /// 都立即失败。返回实际写入的字节数。
    pub(super) fn write(&self, addr: usize, count: u32) -> Result<u32, ()> {
        let p = unsafe { CPU_MANAGER.my_proc() };

        let mut pipe = self.0.lock();

        let mut write_count = 0;
        while write_count < count {
            if !pipe.read_open || p.killed.load(Ordering::Relaxed) {
                return Err(());
            }

            if pipe.write_cnt == pipe.read_cnt + Wrapping(PIPESIZE_U32) {
                unsafe {
                    PROC_MANAGER.wakeup(&pipe.read_cnt as *const Wrapping<_> as usize);
                }
                p.sleep(&pipe.write_cnt as *const Wrapping<_> as usize, pipe);
                pipe = self.0.lock();
            } else {
                let mut byte: u8 = 0;
                if p.data
                    .get_mut()
                    .copy_in(addr + write_count as usize, &mut byte, 1)
                    .is_err()
                {
                    break;
                }
                let i = (pipe.write_cnt.0 % PIPESIZE_U32) as usize;
                pipe.data[i] = byte;
                pipe.write_cnt += Wrapping(1);
                write_count += 1;
            }
        }
        unsafe {
            PROC_MANAGER.wakeup(&pipe.read_cnt as *const Wrapping<_> as usize);
        }
        drop(pipe);
        Ok(write_count)
    }

    /// 关掉一端并唤醒对端，让它感知到关闭事件。
    pub(super) fn close(&self, is_write: bool) {
        let mut pipe = self.0.lock();
        if is_write {
            pipe.write_open = false;
            unsafe {
                PROC_MANAGER.wakeup(&pipe.read_cnt as *const Wrapping<_> as usize);
            }
        } else {
            pipe.read_open = false;
            unsafe {
                PROC_MANAGER.wakeup(&pipe.write_cnt as *const Wrapping<_> as usize);
            }
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // 两端应当都已关闭才会走到这里
        debug_assert!({
            let guard = self.0.lock();
            guard.read_open == guard.write_open
        });
    }
}

/// 管道的内部状态。
///
/// 读写计数单调递增并按 Wrapping 语义回绕，
/// 差值即缓冲区里未读的字节数。
#[derive(Debug)]
struct PipeInner {
    read_open: bool,
    write_open: bool,
    read_cnt: Wrapping<u32>,
    write_cnt: Wrapping<u32>,
    data: [u8; PIPESIZE],
}
