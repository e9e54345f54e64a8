//! 块缓存层
//!
//! 固定数量的缓冲槽位缓存磁盘块。查找与 LRU 替换由一把
//! 自旋锁保护的控制结构完成；每个槽位的数据字节另有自己的
//! 睡眠锁，磁盘 I/O 期间可以长期持有。

use array_macro::array;

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::fs::{BSIZE, NBUF};
use crate::driver::virtio_disk::DISK;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

pub static BCACHE: Bcache = Bcache::new();

/// 全局块缓存。
///
/// `ctrl` 管元信息（设备号、块号、引用计数、LRU 位置），
/// `bufs` 放数据与有效位。两个数组按下标一一对应。
pub struct Bcache {
    ctrl: SpinLock<BufLru>,
    bufs: [BufInner; NBUF],
}

impl Bcache {
    const fn new() -> Self {
        Self {
            ctrl: SpinLock::new(BufLru::new(), "bcache"),
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// 把控制数组按下标串成 LRU 双向链表，启动时调用一次。
    pub fn binit(&self) {
        let mut ctrl = self.ctrl.lock();
        let len = ctrl.inner.len();

        ctrl.head = Some(0);
        ctrl.tail = Some(len - 1);

        for i in 0..len {
            ctrl.inner[i].prev = if i == 0 { None } else { Some(i - 1) };
            ctrl.inner[i].next = if i == len - 1 { None } else { Some(i + 1) };
        }
    }

    /// 找到（或腾出）(dev, blockno) 的缓冲槽位。
    ///
    /// 命中则引用计数加一；未命中从 LRU 尾部找一个
    /// 引用计数为零的槽位改头换面，数据标为无效。
    /// 返回的 Buf 已持有数据睡眠锁。
    /// 所有槽位都在使用中属于配置不足，panic。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut ctrl = self.ctrl.lock();

        let index = match ctrl.find_cached(dev, blockno) {
            Some(index) => index,
            None => match ctrl.recycle(dev, blockno) {
                Some(index) => {
                    self.bufs[index].valid.store(false, Ordering::Relaxed);
                    index
                }
                None => panic!("bcache: no usable buffer"),
            },
        };
        drop(ctrl);

        Buf {
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 读一个磁盘块：取槽位，数据无效时驱动磁盘读入。
    pub fn bread<'a>(&'a self, dev: u32, blockno: u32) -> Buf<'a> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            DISK.rw(&mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// Buf 析构时回来：引用清零的槽位挪到 LRU 头部。
    fn brelse(&self, index: usize) {
        self.ctrl.lock().move_if_no_ref(index);
    }

    /// 槽位引用计数加一，不碰数据睡眠锁。
    /// 计数与查找/回收路径同在缓存锁下互斥。
    fn pin(&self, index: usize) {
        let mut ctrl = self.ctrl.lock();
        ctrl.inner[index].refcnt += 1;
    }

    /// 解除 pin；计数必须仍大于持有者自己的那一份。
    fn unpin(&self, index: usize) {
        let mut ctrl = self.ctrl.lock();
        let rc = ctrl.inner[index].refcnt;
        if rc <= 1 {
            panic!("bcache: unpin not matched");
        }
        ctrl.inner[index].refcnt = rc - 1;
    }
}

/// 一次被锁定的缓冲块。
///
/// 生命周期内持有槽位的数据睡眠锁；析构时释放锁
/// 并更新 LRU 状态。
pub struct Buf<'a> {
    /// 在缓冲数组中的下标
    index: usize,
    dev: u32,
    blockno: u32,
    /// 数据睡眠锁的守卫，始终为 Some，析构时先行释放
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 同步写回磁盘。持有数据锁（Buf 存在即持有）。
    pub fn bwrite(&mut self) {
        DISK.rw(self, true);
    }

    pub fn raw_data(&self) -> *const BufData {
        let guard = self.data.as_ref().unwrap();
        guard.deref()
    }

    pub fn raw_data_mut(&mut self) -> *mut BufData {
        let guard = self.data.as_mut().unwrap();
        guard.deref_mut()
    }

    /// 引用计数加一，钉住槽位防止被回收。
    /// 日志用它让数据在事务提交前一直留在缓存里。
    /// 与 unpin 配对使用。
    pub fn pin(&self) {
        BCACHE.pin(self.index);
    }

    /// 解除此前的 pin。
    pub fn unpin(&self) {
        BCACHE.unpin(self.index);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        BCACHE.brelse(self.index);
    }
}

/// 缓冲槽位的元信息与 LRU 链表。
///
/// 链表不用裸指针：每个槽位记前驱/后继的数组下标，
/// head 端最近使用，tail 端最久未用，回收从 tail 往前找。
/// 整个结构躲在自旋锁后面。
struct BufLru {
    inner: [BufCtrl; NBUF],
    head: Option<usize>,
    tail: Option<usize>,
}

impl BufLru {
    const fn new() -> Self {
        Self {
            inner: array![_ => BufCtrl::new(); NBUF],
            head: None,
            tail: None,
        }
    }

    /// 从头部开始找已缓存的 (dev, blockno)；
    /// 命中则计数加一并返回槽位下标。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut cur = self.head;
        while let Some(i) = cur {
            let b = &mut self.inner[i];
            if b.dev == dev && b.blockno == blockno {
                b.refcnt += 1;
                return Some(i);
            }
            cur = b.next;
        }
        None
    }

    /// 从尾部往前找一个引用计数为零的槽位，
    /// 换成新的 (dev, blockno) 并把计数置一。
    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut cur = self.tail;
        while let Some(i) = cur {
            let b = &mut self.inner[i];
            if b.refcnt == 0 {
                b.dev = dev;
                b.blockno = blockno;
                b.refcnt += 1;
                return Some(i);
            }
            cur = b.prev;
        }
        None
    }

    /// 计数减一；清零且不在头部时摘下来插到头部。
    fn move_if_no_ref(&mut self, index: usize) {
        let b = &mut self.inner[index];
        b.refcnt -= 1;
        if b.refcnt == 0 && self.head != Some(index) {
            let prev = b.prev;
            let next = b.next;

            // b 在尾部时 tail 前移；b 也可能是唯一节点
            if self.tail == Some(index) && prev.is_some() {
                self.tail = prev;
            }

            // 摘除
            if let Some(n) = next {
                self.inner[n].prev = prev;
            }
            if let Some(p) = prev {
                self.inner[p].next = next;
            }

            // 插到头部
            self.inner[index].prev = None;
            self.inner[index].next = self.head;
            if let Some(h) = self.head {
                self.inner[h].prev = Some(index);
            }
            self.head = Some(index);
        }
    }
}

/// 单个槽位的控制信息。
struct BufCtrl {
    dev: u32,
    blockno: u32,
    /// LRU 链表里的前驱/后继，存数组下标
    prev: Option<usize>,
    next: Option<usize>,
    /// 非零即钉在缓存里，零才是合法的回收对象
    refcnt: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            prev: None,
            next: None,
            refcnt: 0,
        }
    }
}

/// 槽位的数据部分。
///
/// valid 在持缓存自旋锁或数据睡眠锁时才可访问。
struct BufInner {
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buf data"),
        }
    }
}

/// 一个磁盘块的字节，按 8 对齐，
/// 足以安置会从它转换出来的各种磁盘结构。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}
