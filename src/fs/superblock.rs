//! 超级块：文件系统几何信息

use core::mem::{self, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{inode::IPB, BufData, BCACHE};
use crate::consts::fs::{BPB, FSMAGIC};

/// 全局超级块，挂载时读入一次，之后只读。
pub static mut SUPER_BLOCK: SuperBlock = SuperBlock::uninit();

pub struct SuperBlock {
    data: MaybeUninit<RawSuperBlock>,
    initialized: AtomicBool,
}

unsafe impl Sync for SuperBlock {}

impl SuperBlock {
    const fn uninit() -> Self {
        Self {
            data: MaybeUninit::uninit(),
            initialized: AtomicBool::new(false),
        }
    }

    /// 从设备的 1 号块读入超级块并校验魔数。
    ///
    /// # 安全性
    /// 挂载时在第一个进程里调用一次。
    pub unsafe fn init(&mut self, dev: u32) {
        debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<RawSuperBlock>(), 0);
        if self.initialized.load(Ordering::Relaxed) {
            return;
        }

        let buf = BCACHE.bread(dev, 1);
        ptr::copy_nonoverlapping(
            buf.raw_data() as *const RawSuperBlock,
            self.data.as_mut_ptr(),
            1,
        );
        if self.data.as_ptr().as_ref().unwrap().magic != FSMAGIC {
            panic!("invalid file system magic number");
        }
        self.initialized.store(true, Ordering::SeqCst);
        drop(buf);
    }

    fn read(&self) -> &RawSuperBlock {
        debug_assert!(self.initialized.load(Ordering::Relaxed));
        unsafe { self.data.as_ptr().as_ref().unwrap() }
    }

    /// 日志区的 (起始块号, 块数)。
    pub fn read_log(&self) -> (u32, u32) {
        let sb = self.read();
        (sb.logstart, sb.nlog)
    }

    /// inum 号 inode 所在的磁盘块号。
    pub fn locate_inode(&self, inum: u32) -> u32 {
        let sb = self.read();
        if inum >= sb.ninodes {
            panic!("inum {} exceeds total inode count {}", inum, sb.ninodes);
        }
        inum / IPB as u32 + sb.inodestart
    }

    /// 文件系统的 inode 总数。
    pub fn inode_size(&self) -> u32 {
        self.read().ninodes
    }

    /// 管理 blockno 的位图块号。
    pub fn bitmap_blockno(&self, blockno: u32) -> u32 {
        let sb = self.read();
        blockno / BPB + sb.bmapstart
    }

    /// 文件系统总块数。
    pub fn size(&self) -> u32 {
        self.read().size
    }
}

/// 磁盘上的超级块，字段顺序与磁盘映像一致。
#[repr(C)]
#[derive(Debug)]
struct RawSuperBlock {
    /// 必须等于 FSMAGIC
    magic: u32,
    /// 映像总块数
    size: u32,
    /// 数据块数
    nblocks: u32,
    /// inode 总数
    ninodes: u32,
    /// 日志块数
    nlog: u32,
    /// 第一个日志块
    logstart: u32,
    /// 第一个 inode 块
    inodestart: u32,
    /// 第一个位图块
    bmapstart: u32,
}
