//! inode 层：磁盘 inode 的内存缓存、块映射、目录与路径解析

use array_macro::array;

use core::{cmp::min, mem, ptr};

use crate::consts::fs::{
    BSIZE, MAX_DIR_SIZE, MAX_FILE_SIZE, NDIRECT, NINDIRECT, NINODE, ROOTDEV, ROOTINUM,
};
use crate::mm::Address;
use crate::process::CPU_MANAGER;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

use super::block::{bm_alloc, bm_free, inode_alloc};
use super::{superblock::SUPER_BLOCK, BufData, BCACHE, LOG};

/// 全局 inode 缓存。
///
/// 所有路径解析、打开、创建得到的 inode 都从这里取；
/// 引用计数配合 [`Inode`] 的 Drop 自动维护。
pub static ICACHE: InodeCache = InodeCache::new();

/// 内存中活跃 inode 的缓存池。
///
/// 元信息（设备号、编号、引用计数）集中放在一把自旋锁下，
/// 用于查重、分配与回收；每个条目的内容各有一把睡眠锁，
/// 读写期间可以跨磁盘 I/O 持有。
pub struct InodeCache {
    meta: SpinLock<[InodeMeta; NINODE]>,
    data: [SleepLock<InodeData>; NINODE],
}

impl InodeCache {
    const fn new() -> Self {
        Self {
            meta: SpinLock::new(array![_ => InodeMeta::new(); NINODE], "icache"),
            data: array![_ => SleepLock::new(InodeData::new(), "inode"); NINODE],
        }
    }

    /// 取 (dev, inum) 的缓存句柄。
    ///
    /// 命中则引用计数加一；未命中占一个空条目，
    /// 不读磁盘——内容推迟到第一次 lock 时载入。
    /// 缓存占满视为配置不足，panic。
    fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut guard = self.meta.lock();

        let mut spare: Option<usize> = None;
        for (i, meta) in guard.iter_mut().enumerate() {
            if meta.refs == 0 {
                spare.get_or_insert(i);
                continue;
            }
            if meta.dev == dev && meta.inum == inum {
                meta.refs += 1;
                return Inode { dev, inum, index: i };
            }
        }

        let index = spare.expect("icache: no free entry");
        guard[index] = InodeMeta { dev, inum, refs: 1 };
        Inode { dev, inum, index }
    }

    /// 克隆句柄：同一条目引用计数加一。
    fn dup(&self, inode: &Inode) -> Inode {
        let mut guard = self.meta.lock();
        guard[inode.index].refs += 1;
        Inode {
            dev: inode.dev,
            inum: inode.inum,
            index: inode.index,
        }
    }

    /// 放掉一个引用；由 [`Inode`] 的 Drop 调用。
    ///
    /// 最后一个引用离开且磁盘上链接数也为零时，
    /// 这里顺手把文件本体回收：截断数据、类型清空。
    /// 回收动作发生在缓存内容仍然有效的时候，
    /// 过早把条目让出去会让未写回的内容被人覆盖。
    fn put(&self, inode: &mut Inode) {
        let mut guard = self.meta.lock();
        let i = inode.index;

        if guard[i].refs > 1 {
            guard[i].refs -= 1;
            return;
        }

        // 引用只剩这一个，数据睡眠锁必然空闲，锁不会睡
        let mut idata = self.data[i].lock();
        if idata.valid.is_none() || idata.dinode.nlink > 0 {
            idata.valid.take();
            drop(idata);
            guard[i].refs -= 1;
            return;
        }

        // 链接数已为零：截断要做磁盘 I/O，放开 meta 锁再动手；
        // 条目本身等缓存内容失效后才让出，
        // 否则未写回的内容可能被新占用者覆盖。
        drop(guard);
        idata.dinode.itype = InodeType::Empty;
        idata.truncate();
        idata.valid.take();
        drop(idata);

        let mut guard = self.meta.lock();
        guard[i].refs -= 1;
        debug_assert_eq!(guard[i].refs, 0);
    }

    /// 路径解析的公共部分。
    ///
    /// 绝对路径从根 inode 出发，相对路径从当前进程的 cwd 出发；
    /// 逐个分量下行，每步锁住当前 inode 验证它是目录再查子项。
    /// `is_parent` 为真时在最后一个分量前停下，
    /// 返回父目录并把最后分量留在 name 里。
    fn namex(&self, path: &[u8], name: &mut [u8; MAX_DIR_SIZE], is_parent: bool) -> Option<Inode> {
        let mut inode = if path[0] == b'/' {
            self.get(ROOTDEV, ROOTINUM)
        } else {
            let p = unsafe { CPU_MANAGER.my_proc() };
            self.dup(p.data.get_mut().cwd.as_ref().unwrap())
        };

        let mut cur = skip_path(path, 0, name);
        while cur != 0 {
            let mut data_guard = inode.lock();
            if data_guard.dinode.itype != InodeType::Directory {
                return None;
            }
            if is_parent && path[cur] == 0 {
                drop(data_guard);
                return Some(inode);
            }
            let child = data_guard.dir_lookup(name, false);
            drop(data_guard);
            inode = child?.0;
            cur = skip_path(path, cur, name);
        }

        if is_parent {
            // 只有查根 inode 的父目录才会走到这里
            None
        } else {
            Some(inode)
        }
    }

    /// 解析路径，返回末端的 inode。
    /// path 必须以 0 字节结尾。
    pub fn namei(&self, path: &[u8]) -> Option<Inode> {
        let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
        self.namex(path, &mut name, false)
    }

    /// 同 [`InodeCache::namei`]，但返回父目录，
    /// 最后一个分量拷进 name。
    pub fn namei_parent(&self, path: &[u8], name: &mut [u8; MAX_DIR_SIZE]) -> Option<Inode> {
        self.namex(path, name, true)
    }

    /// 沿路径创建（或按 reuse 复用）一个 inode。
    ///
    /// 末端已存在时：reuse 为真返回现有 inode，否则失败。
    /// 新建目录先在自身备好 `.`/`..` 两项，再挂进父目录，
    /// 全部成功后才给父目录的链接数加一。
    /// 目录项写不进去（目录已长到文件大小上限）属于资源耗尽：
    /// 把新 inode 的链接数清零后放掉引用，
    /// 标准的降零路径会连同已写的目录项一起回收它，
    /// 调用方拿到 None，对应系统调用返回 -1。
    pub fn create(
        &self,
        path: &[u8],
        itype: InodeType,
        major: u16,
        minor: u16,
        reuse: bool,
    ) -> Option<Inode> {
        let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
        let dir_inode = self.namei_parent(path, &mut name)?;
        let mut dir_idata = dir_inode.lock();

        if let Some((inode, _)) = dir_idata.dir_lookup(&name, false) {
            return if reuse { Some(inode) } else { None };
        }

        let (dev, _) = dir_idata.get_dev_inum();
        let inum = inode_alloc(dev, itype);
        let inode = self.get(dev, inum);
        let mut idata = inode.lock();
        idata.dinode.major = major;
        idata.dinode.minor = minor;
        idata.dinode.nlink = 1;
        idata.update();
        debug_assert_eq!(idata.dinode.itype, itype);

        let linked = (|| {
            if itype == InodeType::Directory {
                let mut dot: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
                // . 指向自身
                dot[0] = b'.';
                idata.dir_link(&dot, inum).ok()?;
                // .. 指向父目录
                dot[1] = b'.';
                idata.dir_link(&dot, dir_inode.inum).ok()?;
            }
            dir_idata.dir_link(&name, inum).ok()
        })()
        .is_some();

        if !linked {
            idata.dinode.nlink = 0;
            idata.update();
            drop(idata);
            drop(dir_idata);
            drop(dir_inode);
            drop(inode);
            return None;
        }

        if itype == InodeType::Directory {
            // 新目录的 .. 落定了，父目录多出一个链接
            dir_idata.link();
            dir_idata.update();
        }

        drop(dir_idata);
        drop(dir_inode);
        drop(idata);
        Some(inode)
    }
}

/// 跳过 path 中 cur 处的一个路径分量，拷进 name，
/// 返回下一个未处理字符的位置；已到结尾返回 0。
fn skip_path(path: &[u8], mut cur: usize, name: &mut [u8; MAX_DIR_SIZE]) -> usize {
    while path[cur] == b'/' {
        cur += 1;
    }
    if path[cur] == 0 {
        return 0;
    }

    let start = cur;
    while path[cur] != b'/' && path[cur] != 0 {
        cur += 1;
    }
    let mut count = cur - start;
    if count >= name.len() {
        count = name.len() - 1;
    }
    unsafe {
        ptr::copy(path.as_ptr().offset(start as isize), name.as_mut_ptr(), count);
    }
    name[count] = 0;

    while path[cur] == b'/' {
        cur += 1;
    }
    cur
}

/// 缓存中一个活跃 inode 的轻量句柄。
///
/// 真实数据在 [`ICACHE`] 里，经 `lock()` 访问；
/// 句柄克隆与析构即引用计数的增减。
#[derive(Debug)]
pub struct Inode {
    dev: u32,
    inum: u32,
    /// 在缓存数组中的位置
    index: usize,
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        ICACHE.dup(self)
    }
}

impl Inode {
    /// 锁住 inode 内容；第一次使用时从磁盘载入。
    pub fn lock<'a>(&'a self) -> SleepLockGuard<'a, InodeData> {
        let mut guard = ICACHE.data[self.index].lock();

        if guard.valid.is_none() {
            let buf = BCACHE.bread(self.dev, unsafe { SUPER_BLOCK.locate_inode(self.inum) });
            let offset = locate_inode_offset(self.inum);
            let dinode = unsafe { (buf.raw_data() as *const DiskInode).offset(offset) };
            guard.dinode = unsafe { ptr::read(dinode) };
            drop(buf);
            guard.valid = Some((self.dev, self.inum));
            if guard.dinode.itype == InodeType::Empty {
                panic!("inode: locking an empty inode");
            }
        }

        guard
    }
}

impl Drop for Inode {
    /// 放掉引用；缓存里没人引用且磁盘上没有链接时，
    /// 文件本体随之释放。
    fn drop(&mut self) {
        ICACHE.put(self);
    }
}

/// 缓存条目的元信息。
struct InodeMeta {
    dev: u32,
    inum: u32,
    /// 为零表示条目空闲可复用
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refs: 0,
        }
    }
}

/// inode 的内存副本。
#[derive(Debug)]
pub struct InodeData {
    /// None 表示尚未从磁盘载入；Some 里是 (dev, inum)
    valid: Option<(u32, u32)>,
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: None,
            dinode: DiskInode::new(),
        }
    }

    #[inline]
    pub fn get_dev_inum(&self) -> (u32, u32) {
        self.valid.unwrap()
    }

    #[inline]
    pub fn get_itype(&self) -> InodeType {
        self.dinode.itype
    }

    #[inline]
    pub fn get_devnum(&self) -> (u16, u16) {
        (self.dinode.major, self.dinode.minor)
    }

    /// 硬链接数加一。
    #[inline]
    pub fn link(&mut self) {
        self.dinode.nlink += 1;
    }

    /// 硬链接数减一。
    pub fn unlink(&mut self) {
        self.dinode.nlink -= 1;
    }

    /// 丢弃全部数据块并把大小清零。
    ///
    /// 直接块、间接块指到的块、间接块本身依次归还位图，
    /// 最后写回元数据。须在日志事务中调用。
    pub fn truncate(&mut self) {
        let (dev, _) = *self.valid.as_ref().unwrap();

        for i in 0..NDIRECT {
            if self.dinode.addrs[i] > 0 {
                bm_free(dev, self.dinode.addrs[i]);
                self.dinode.addrs[i] = 0;
            }
        }

        if self.dinode.addrs[NDIRECT] > 0 {
            let buf = BCACHE.bread(dev, self.dinode.addrs[NDIRECT]);
            let buf_ptr = buf.raw_data() as *const BlockNo;
            for i in 0..NINDIRECT {
                let bn = unsafe { ptr::read(buf_ptr.offset(i as isize)) };
                if bn > 0 {
                    bm_free(dev, bn);
                }
            }
            drop(buf);
            bm_free(dev, self.dinode.addrs[NDIRECT]);
            self.dinode.addrs[NDIRECT] = 0;
        }

        self.dinode.size = 0;
        self.update();
    }

    /// 把内存里的 inode 元数据经日志写回磁盘。
    pub fn update(&mut self) {
        let (dev, inum) = *self.valid.as_ref().unwrap();

        let mut buf = BCACHE.bread(dev, unsafe { SUPER_BLOCK.locate_inode(inum) });
        let offset = locate_inode_offset(inum);
        let dinode = unsafe { (buf.raw_data_mut() as *mut DiskInode).offset(offset) };
        unsafe { ptr::write(dinode, self.dinode) };
        LOG.write(buf);
    }

    /// 从文件偏移 offset 读 count 字节到 dst。
    /// 范围必须整个落在文件内，逐块经缓存拷贝。
    pub fn iread(&mut self, mut dst: Address, offset: u32, count: u32) -> Result<(), ()> {
        let end = offset.checked_add(count).ok_or(())?;
        if end > self.dinode.size {
            return Err(());
        }

        let (dev, _) = *self.valid.as_ref().unwrap();
        let offset = offset as usize;
        let mut count = count as usize;
        let mut block_base = offset / BSIZE;
        let block_offset = offset % BSIZE;
        let mut read_count = min(BSIZE - block_offset, count);
        let mut block_offset = block_offset as isize;
        while count > 0 {
            let buf = BCACHE.bread(dev, self.map_blockno(block_base));
            let src_ptr = unsafe { (buf.raw_data() as *const u8).offset(block_offset) };
            dst.copy_out(src_ptr, read_count)?;
            drop(buf);

            count -= read_count;
            dst = dst.offset(read_count);
            block_base += 1;
            block_offset = 0;
            read_count = min(BSIZE, count);
        }
        Ok(())
    }

    /// 宽松版读取：超出文件末尾的部分自动截短，
    /// 返回实际读到的字节数。
    pub fn try_iread(&mut self, dst: Address, offset: u32, count: u32) -> Result<u32, ()> {
        if offset > self.dinode.size {
            return Ok(0);
        }
        let end = offset.checked_add(count).ok_or(())?;
        let actual_count = if end > self.dinode.size {
            self.dinode.size - offset
        } else {
            count
        };
        self.iread(dst, offset, actual_count)?;
        Ok(actual_count)
    }

    /// 全量写入：count 字节一个不少才算成功。
    pub fn iwrite(&mut self, src: Address, offset: u32, count: u32) -> Result<(), ()> {
        match self.try_iwrite(src, offset, count) {
            Ok(ret) => {
                if ret == count {
                    Ok(())
                } else {
                    Err(())
                }
            }
            Err(()) => Err(()),
        }
    }

    /// 写入并允许部分成功，返回写进去的字节数。
    ///
    /// 起点不得越过文件末尾（文件没有空洞）；
    /// 需要的新块沿途分配，写超出旧大小时更新 size。
    /// 分配可能改了地址表，所以无论如何最后都 update。
    /// 须在日志事务中调用。
    pub fn try_iwrite(&mut self, mut src: Address, offset: u32, count: u32) -> Result<u32, ()> {
        if offset > self.dinode.size {
            return Err(());
        }
        let end = offset.checked_add(count).ok_or(())? as usize;
        if end > MAX_FILE_SIZE {
            return Err(());
        }

        let (dev, _) = *self.valid.as_ref().unwrap();
        let mut block_base = offset as usize / BSIZE;
        let block_offset = offset as usize % BSIZE;
        let mut count = count as usize;
        let mut write_count = min(BSIZE - block_offset, count);
        let mut block_offset = block_offset as isize;
        while count > 0 {
            let mut buf = BCACHE.bread(dev, self.map_blockno(block_base));
            let dst_ptr = unsafe { (buf.raw_data_mut() as *mut u8).offset(block_offset) };
            if src.copy_in(dst_ptr, write_count).is_err() {
                break;
            };
            LOG.write(buf);

            count -= write_count;
            src = src.offset(write_count);
            block_base += 1;
            block_offset = 0;
            write_count = min(BSIZE, count);
        }

        // end <= MAX_FILE_SIZE <= u32::MAX
        let size = (end - count) as u32;
        if size > self.dinode.size {
            self.dinode.size = size;
        }
        self.update();
        Ok(size - offset)
    }

    /// 填充 stat 结构。
    pub fn istat(&self, stat: &mut FileStat) {
        let (dev, inum) = self.valid.unwrap();
        stat.dev = dev;
        stat.inum = inum;
        stat.itype = self.dinode.itype;
        stat.nlink = self.dinode.nlink;
        stat.size = self.dinode.size as u64;
    }

    /// 文件内第 offset_bn 块对应的磁盘块号，未分配则现场分配。
    ///
    /// 直接块直接查地址表；间接区先保证间接块本身存在，
    /// 再查（或填）其中的表项。超出直接加间接的范围 panic。
    fn map_blockno(&mut self, offset_bn: usize) -> u32 {
        let (dev, _) = *self.valid.as_ref().unwrap();

        if offset_bn < NDIRECT {
            return slot_or_alloc(dev, &mut self.dinode.addrs[offset_bn]);
        }
        if offset_bn >= NDIRECT + NINDIRECT {
            panic!("inode: block offset {} out of range", offset_bn);
        }

        let indirect_bn = slot_or_alloc(dev, &mut self.dinode.addrs[NDIRECT]);
        let mut indirect_buf = BCACHE.bread(dev, indirect_bn);
        let bn_ptr = unsafe {
            (indirect_buf.raw_data_mut() as *mut BlockNo).offset((offset_bn - NDIRECT) as isize)
        };
        let bn = unsafe { ptr::read(bn_ptr) };
        if bn != 0 {
            return bn;
        }
        let free_bn = bm_alloc(dev);
        unsafe {
            ptr::write(bn_ptr, free_bn);
        }
        LOG.write(indirect_buf);
        free_bn
    }

    /// 读出目录文件中 offset 处的一个目录项。
    /// 读失败说明目录数据已不一致，panic。
    fn read_entry(&mut self, offset: u32) -> DirEntry {
        let mut dir_entry = DirEntry::empty();
        self.iread(
            Address::KernelMut(&mut dir_entry as *mut _ as *mut u8),
            offset,
            mem::size_of::<DirEntry>() as u32,
        )
        .expect("read dir entry");
        dir_entry
    }

    /// 在目录里找名字为 name 的目录项。
    ///
    /// 命中返回对应 inode；need_offset 为真时一并返回
    /// 该项在目录文件里的偏移，删除路径要用。
    /// inum 为 0 的项是墓碑，跳过。
    fn dir_lookup(
        &mut self,
        name: &[u8; MAX_DIR_SIZE],
        need_offset: bool,
    ) -> Option<(Inode, Option<u32>)> {
        let (dev, _) = *self.valid.as_ref().unwrap();
        debug_assert!(dev != 0);
        if self.dinode.itype != InodeType::Directory {
            panic!("dir_lookup: not a directory");
        }

        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut offset = 0;
        while offset < self.dinode.size {
            let dir_entry = self.read_entry(offset);
            if dir_entry.inum != 0 && dir_entry.name_matches(name) {
                return Some((
                    ICACHE.get(dev, dir_entry.inum as u32),
                    if need_offset { Some(offset) } else { None },
                ));
            }
            offset += de_size;
        }

        None
    }

    /// 往目录里添一个 name -> inum 的目录项。
    ///
    /// 名字已存在、或目录已长到文件大小上限写不进新项时
    /// 返回错误，由调用方向上传为 -1。
    pub fn dir_link(&mut self, name: &[u8; MAX_DIR_SIZE], inum: u32) -> Result<(), ()> {
        if inum > u16::MAX as u32 {
            panic!("dir_link: inum {} too large", inum);
        }
        let inum = inum as u16;

        if self.dir_lookup(name, false).is_some() {
            // 查到的 inode 随即自动放掉
            return Err(());
        }

        // 优先复用墓碑槽位，没有就落在文件末尾追加
        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut offset = 0;
        while offset < self.dinode.size {
            if self.read_entry(offset).inum == 0 {
                break;
            }
            offset += de_size;
        }
        debug_assert_eq!(offset % de_size, 0);

        let mut dir_entry = DirEntry::empty();
        dir_entry.name.copy_from_slice(name);
        dir_entry.inum = inum;
        let dir_entry_ptr = Address::Kernel(&dir_entry as *const _ as *const u8);
        // 追加可能需要新的数据块，目录满时在这里失败
        self.iwrite(dir_entry_ptr, offset, de_size)
    }

    /// 从目录里摘掉名字为 name 的目录项。
    ///
    /// `.`/`..` 不许删；目标是目录时必须为空。
    /// 槽位写成墓碑，目标的链接数减一（目录再给本目录减一，
    /// 对应消失的 `..`）。须在日志事务中调用。
    pub fn dir_unlink(&mut self, name: &[u8; MAX_DIR_SIZE]) -> Result<(), ()> {
        if name[0] == b'.' && (name[1] == 0 || (name[1] == b'.' && name[2] == 0)) {
            return Err(());
        }

        let inode: Inode;
        let offset: u32;
        match self.dir_lookup(&name, true) {
            Some((i, Some(off))) => {
                inode = i;
                offset = off;
            }
            _ => return Err(()),
        }

        let mut idata = inode.lock();
        if idata.dinode.nlink < 1 {
            panic!("dir_unlink: entry has zero links");
        }
        if idata.dinode.itype == InodeType::Directory && !idata.dir_is_empty() {
            return Err(());
        }

        let de_size = mem::size_of::<DirEntry>() as u32;
        let dir_entry = DirEntry::empty();
        let dir_entry_ptr = Address::Kernel(&dir_entry as *const DirEntry as *const u8);
        if self.iwrite(dir_entry_ptr, offset, de_size).is_err() {
            panic!("dir_unlink: cannot clear entry");
        }

        if idata.dinode.itype == InodeType::Directory {
            self.dinode.nlink -= 1;
            self.update();
        }
        idata.dinode.nlink -= 1;
        idata.update();

        Ok(())
    }

    /// 除 `.`/`..` 外没有任何有效目录项即为空目录。
    fn dir_is_empty(&mut self) -> bool {
        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut offset = 2 * de_size;
        while offset < self.dinode.size {
            if self.read_entry(offset).inum != 0 {
                return false;
            }
            offset += de_size;
        }

        true
    }
}

/// 地址槽为零时分配一个新块填进去，返回槽里的块号。
/// 块映射的直接项与间接块本身都走这条路。
fn slot_or_alloc(dev: u32, slot: &mut u32) -> u32 {
    if *slot == 0 {
        *slot = bm_alloc(dev);
    }
    *slot
}

/// 每个磁盘块能装的 inode 数。
pub const IPB: usize = BSIZE / mem::size_of::<DiskInode>();

/// inum 号 inode 在其所在块内的下标。
#[inline]
pub fn locate_inode_offset(inum: u32) -> isize {
    (inum as usize % IPB) as isize
}

/// 磁盘结构的布局前提，挂载时统一检查。
pub fn icheck() {
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<DiskInode>(), 0);
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<BlockNo>(), 0);
    debug_assert_eq!(mem::size_of::<BlockNo>(), mem::size_of::<u32>());
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<DirEntry>(), 0);
    debug_assert!(MAX_FILE_SIZE <= u32::MAX as usize);
}

/// 挂载时回收孤儿 inode。
///
/// 类型非空但链接数为零的磁盘 inode，是崩溃时
/// 已被 unlink 却还有进程打开着的文件遗骸。
/// 对每个这样的 inode 取一个缓存引用、载入后随即放掉，
/// 标准的降零路径就会在事务里完成截断和释放。
pub fn reclaim_orphans(dev: u32) {
    let size = unsafe { SUPER_BLOCK.inode_size() };
    for inum in 1..size {
        let blockno = unsafe { SUPER_BLOCK.locate_inode(inum) };
        let offset = locate_inode_offset(inum);
        let buf = BCACHE.bread(dev, blockno);
        let dinode = unsafe { ptr::read((buf.raw_data() as *const DiskInode).offset(offset)) };
        drop(buf);

        if dinode.itype != InodeType::Empty && dinode.nlink == 0 {
            println!("file system: reclaiming orphaned inode {}", inum);
            LOG.begin_op();
            let inode = ICACHE.get(dev, inum);
            drop(inode.lock());
            drop(inode);
            LOG.end_op();
        }
    }
}

type BlockNo = u32;

/// fstat 返回给用户的文件状态。
#[repr(C)]
#[derive(Debug)]
pub struct FileStat {
    dev: u32,
    inum: u32,
    itype: InodeType,
    nlink: u16,
    size: u64,
}

impl FileStat {
    pub const fn uninit() -> Self {
        Self {
            dev: 0,
            inum: 0,
            itype: InodeType::Empty,
            nlink: 0,
            size: 0,
        }
    }
}

/// 磁盘上的 inode。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    /// 类型；Empty 表示该 inode 空闲
    itype: InodeType,
    /// 主设备号，只对设备 inode 有意义
    major: u16,
    /// 次设备号，只对设备 inode 有意义
    minor: u16,
    /// 硬链接数
    nlink: u16,
    /// 文件字节数
    size: u32,
    /// 前 NDIRECT 项直接块，最后一项一级间接块
    addrs: [u32; NDIRECT + 1],
}

impl DiskInode {
    const fn new() -> Self {
        Self {
            itype: InodeType::Empty,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    /// 空闲时设上类型完成分配，否则报错。
    pub fn try_alloc(&mut self, itype: InodeType) -> Result<(), ()> {
        if self.itype == InodeType::Empty {
            unsafe {
                ptr::write_bytes(self, 0, 1);
            }
            self.itype = itype;
            Ok(())
        } else {
            Err(())
        }
    }
}

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Empty = 0,
    Directory = 1,
    File = 2,
    Device = 3,
}

/// 目录文件里的一项：2 字节 inum 加定长名字。
/// inum 为 0 的项是空位（墓碑）。
#[repr(C)]
struct DirEntry {
    inum: u16,
    name: [u8; MAX_DIR_SIZE],
}

impl DirEntry {
    const fn empty() -> Self {
        Self {
            inum: 0,
            name: [0; MAX_DIR_SIZE],
        }
    }

    /// 逐字节比较名字，遇到公共的 0 结尾即命中；
    /// 名字占满全长时没有 0 结尾，比到最后一字节为止。
    fn name_matches(&self, name: &[u8; MAX_DIR_SIZE]) -> bool {
        for i in 0..MAX_DIR_SIZE {
            if self.name[i] != name[i] {
                return false;
            }
            if self.name[i] == 0 {
                return true;
            }
        }
        true
    }
}
