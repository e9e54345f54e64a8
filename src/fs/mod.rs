//! 文件系统：块缓存、日志、inode 与文件抽象

use core::ops::DerefMut;

mod bio;
mod block;
mod file;
mod inode;
mod log;
mod superblock;

pub use bio::{Buf, BCACHE};
pub use file::{File, Pipe};
pub use inode::{FileStat, Inode, InodeData, InodeType, ICACHE};
pub use log::LOG;

use bio::BufData;
use inode::{icheck, reclaim_orphans};
use log::Log;
use superblock::SUPER_BLOCK;

/// 挂载根文件系统。
///
/// 读超级块、回放日志、清理崩溃遗留的孤儿 inode。
/// 其中要做磁盘 I/O，必须在第一个进程的上下文里执行。
///
/// # 安全性
/// 只能在启动时调用一次。
pub unsafe fn init(dev: u32) {
    SUPER_BLOCK.init(dev);
    let log_ptr = LOG.lock().deref_mut() as *mut Log;
    log_ptr.as_mut().unwrap().init(dev);
    icheck();
    reclaim_orphans(dev);
    println!("file system: setup done");
}
