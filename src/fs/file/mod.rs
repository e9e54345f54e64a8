//! 文件抽象：常规文件、设备与管道的统一接口

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::cmp::min;
use core::convert::TryInto;

use crate::consts::driver::NDEV;
use crate::consts::fs::{BSIZE, MAXOPBLOCKS};
use crate::driver::DEVICES;
use crate::mm::Address;

use super::inode::FileStat;
use super::{Inode, InodeType, ICACHE, LOG};

mod pipe;

pub use pipe::Pipe;

// open 的标志位
pub const O_RDONLY: i32 = 0x000;
pub const O_WRONLY: i32 = 0x001;
pub const O_RDWR: i32 = 0x002;
pub const O_CREATE: i32 = 0x200;
pub const O_TRUNC: i32 = 0x400;

/// 打开的文件。
///
/// 经 `Arc<File>` 在 fork/dup 之间共享；内部按实际类型
/// 分成常规文件（inode 加偏移）、设备（主设备号查表）
/// 和管道三种。析构时释放 inode 引用或关掉管道一端。
#[derive(Debug)]
pub struct File {
    inner: FileInner,
    readable: bool,
    writable: bool,
}

unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    /// 按 flags 打开 path 处的文件。
    ///
    /// 带 O_CREATE 时不存在则创建；目录只许只读打开；
    /// 设备检查主设备号范围；O_TRUNC 截断常规文件。
    /// 所有失败路径都收好 inode 并结束日志事务。
    pub fn open(path: &[u8], flags: i32) -> Option<Arc<Self>> {
        LOG.begin_op();

        let inode: Inode;
        if flags & O_CREATE > 0 {
            match ICACHE.create(&path, InodeType::File, 0, 0, true) {
                Some(i) => inode = i,
                None => {
                    LOG.end_op();
                    return None;
                }
            }
        } else {
            match ICACHE.namei(&path) {
                Some(i) => inode = i,
                None => {
                    LOG.end_op();
                    return None;
                }
            }
        }

        let mut idata = inode.lock();
        let inner;
        let readable = flags & O_WRONLY == 0;
        let writable = (flags & O_WRONLY) | (flags & O_RDWR) > 0;
        match idata.get_itype() {
            InodeType::Empty => panic!("open: empty inode"),
            InodeType::Directory => {
                if flags != O_RDONLY {
                    drop(idata);
                    drop(inode);
                    LOG.end_op();
                    return None;
                }
                drop(idata);
                inner = FileInner::Regular(FileRegular {
                    offset: UnsafeCell::new(0),
                    inode: Some(inode),
                });
            }
            InodeType::File => {
                if flags & O_TRUNC > 0 {
                    idata.truncate();
                }
                drop(idata);
                inner = FileInner::Regular(FileRegular {
                    offset: UnsafeCell::new(0),
                    inode: Some(inode),
                });
            }
            InodeType::Device => {
                let (major, _) = idata.get_devnum();
                if major as usize >= NDEV {
                    drop(idata);
                    drop(inode);
                    LOG.end_op();
                    return None;
                }
                drop(idata);
                inner = FileInner::Device(FileDevice {
                    major,
                    inode: Some(inode),
                });
            }
        }

        LOG.end_op();
        Some(Arc::new(File {
            inner,
            readable,
            writable,
        }))
    }

    /// 读至多 count 字节到用户地址 addr，返回实际读到的字节数。
    ///
    /// 常规文件在 inode 锁内读取并推进偏移
    /// （偏移的内部可变性正是由这把锁保护）。
    pub fn fread(&self, addr: usize, count: u32) -> Result<u32, ()> {
        if !self.readable {
            return Err(());
        }

        match self.inner {
            FileInner::Pipe(ref pipe) => pipe.read(addr, count),
            FileInner::Regular(ref file) => {
                let mut idata = file.inode.as_ref().unwrap().lock();
                let offset = unsafe { &mut *file.offset.get() };
                match idata.try_iread(Address::Virtual(addr), *offset, count.try_into().unwrap()) {
                    Ok(read_count) => {
                        *offset += read_count;
                        drop(idata);
                        Ok(read_count)
                    }
                    Err(()) => Err(()),
                }
            }
            FileInner::Device(ref dev) => {
                let dev_read = DEVICES[dev.major as usize].as_ref().ok_or(())?.read;
                dev_read(Address::Virtual(addr), count)
            }
        }
    }

    /// 把用户地址 addr 处的 count 字节写入文件。
    ///
    /// 常规文件按日志容量分批：每批一个事务，
    /// 批大小取 (MAXOPBLOCKS-4)/2 个块，留出 inode、
    /// 间接块和位图的余量。部分成功返回已写字节数。
    pub fn fwrite(&self, addr: usize, count: u32) -> Result<u32, ()> {
        if !self.writable {
            return Err(());
        }

        match self.inner {
            FileInner::Pipe(ref pipe) => pipe.write(addr, count),
            FileInner::Regular(ref file) => {
                let batch = ((MAXOPBLOCKS - 4) / 2 * BSIZE) as u32;
                let mut addr = Address::Virtual(addr);
                for i in (0..count).step_by(batch as usize) {
                    let write_count = min(batch, count - i);
                    LOG.begin_op();
                    let mut idata = file.inode.as_ref().unwrap().lock();
                    let offset = unsafe { &mut *file.offset.get() };
                    let ret = idata.try_iwrite(addr, *offset, write_count);
                    if let Ok(actual_count) = ret {
                        *offset += actual_count;
                    }
                    drop(idata);
                    LOG.end_op();

                    match ret {
                        Ok(actual_count) => {
                            if actual_count != write_count {
                                return Ok(i + actual_count);
                            }
                        }
                        Err(()) => return Err(()),
                    }
                    addr = addr.offset(write_count as usize);
                }
                Ok(count)
            }
            FileInner::Device(ref dev) => {
                let dev_write = DEVICES[dev.major as usize].as_ref().ok_or(())?.write;
                dev_write(Address::Virtual(addr), count)
            }
        }
    }

    /// 查询文件元信息；管道不支持。
    pub fn fstat(&self, stat: &mut FileStat) -> Result<(), ()> {
        let inode: &Inode;
        match self.inner {
            FileInner::Pipe(_) => return Err(()),
            FileInner::Regular(ref file) => inode = file.inode.as_ref().unwrap(),
            FileInner::Device(ref dev) => inode = dev.inode.as_ref().unwrap(),
        }
        let idata = inode.lock();
        idata.istat(stat);
        Ok(())
    }
}

impl Drop for File {
    /// 最后一个 `Arc<File>` 消失时释放底层资源：
    /// 管道关掉本端，常规文件/设备在日志事务里放掉 inode
    /// （可能触发降零回收）。
    fn drop(&mut self) {
        match self.inner {
            FileInner::Pipe(ref pipe) => pipe.close(self.writable),
            FileInner::Regular(ref mut file) => {
                LOG.begin_op();
                drop(file.inode.take());
                LOG.end_op();
            }
            FileInner::Device(ref mut dev) => {
                LOG.begin_op();
                drop(dev.inode.take());
                LOG.end_op();
            }
        }
    }
}

/// 文件的实际形态。
#[derive(Debug)]
enum FileInner {
    Pipe(Arc<Pipe>),
    Regular(FileRegular),
    Device(FileDevice),
}

/// 常规文件：inode 加当前偏移。
#[derive(Debug)]
struct FileRegular {
    /// 下一次读写的起点；由 inode 的睡眠锁保护
    offset: UnsafeCell<u32>,
    /// 关闭时 take 出来放掉
    inode: Option<Inode>,
}

/// 设备文件：主设备号索引 DEVICES 函数表。
#[derive(Debug)]
struct FileDevice {
    major: u16,
    inode: Option<Inode>,
}
