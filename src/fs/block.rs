//! 磁盘块与磁盘 inode 的分配

use core::ptr;

use bit_field::BitField;

use crate::consts::fs::BPB;

use super::inode::{locate_inode_offset, DiskInode, InodeType};
use super::{superblock::SUPER_BLOCK, BCACHE, LOG};

/// 从位图里找一个空闲块，标记占用并把块内容清零，返回块号。
///
/// 位图位与清零后的数据块都写进日志，保持事务一致。
/// 一个空闲块都找不到说明磁盘满，panic。
pub fn bm_alloc(dev: u32) -> u32 {
    let total_block = unsafe { SUPER_BLOCK.size() };
    for base in (0..total_block).step_by(BPB as usize) {
        let mut buf = BCACHE.bread(dev, unsafe { SUPER_BLOCK.bitmap_blockno(base) });
        for offset in 0..BPB {
            if base + offset >= total_block {
                break;
            }
            let index = (offset / 8) as isize;
            let bit = (offset % 8) as usize;
            let byte = unsafe { (buf.raw_data_mut() as *mut u8).offset(index).as_mut().unwrap() };
            if byte.get_bit(bit) {
                continue;
            }
            byte.set_bit(bit, true);
            LOG.write(buf);

            // 新块内容清零
            let free_bn = base + offset;
            let mut free_buf = BCACHE.bread(dev, free_bn);
            unsafe {
                ptr::write_bytes(free_buf.raw_data_mut(), 0, 1);
            }
            LOG.write(free_buf);
            return free_bn;
        }
        drop(buf);
    }

    panic!("bitmap: no free block");
}

/// 释放一个磁盘块：位图里对应位清零。
/// 释放一个本就空闲的块是内核逻辑错误。
pub fn bm_free(dev: u32, blockno: u32) {
    let bm_blockno = unsafe { SUPER_BLOCK.bitmap_blockno(blockno) };
    let bm_offset = blockno % BPB;
    let index = (bm_offset / 8) as isize;
    let bit = (bm_offset % 8) as usize;
    let mut buf = BCACHE.bread(dev, bm_blockno);

    let byte = unsafe { (buf.raw_data_mut() as *mut u8).offset(index).as_mut().unwrap() };
    if !byte.get_bit(bit) {
        panic!("bitmap: double freeing block {}", blockno);
    }
    byte.set_bit(bit, false);
    LOG.write(buf);
}

/// 在磁盘 inode 表里分配一个空闲 inode，设好类型后返回编号。
/// 全表占满时 panic。
pub fn inode_alloc(dev: u32, itype: InodeType) -> u32 {
    let size = unsafe { SUPER_BLOCK.inode_size() };
    for inum in 1..size {
        let blockno = unsafe { SUPER_BLOCK.locate_inode(inum) };
        let offset = locate_inode_offset(inum);
        let mut buf = BCACHE.bread(dev, blockno);
        let dinode = unsafe { (buf.raw_data_mut() as *mut DiskInode).offset(offset) };
        let dinode = unsafe { &mut *dinode };
        if dinode.try_alloc(itype).is_ok() {
            LOG.write(buf);
            return inum;
        }
    }

    panic!("no free inode on disk");
}
