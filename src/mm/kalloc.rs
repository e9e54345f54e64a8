//! 内核堆：伙伴系统分配器
//!
//! 管理内核镜像末尾到 PHYSTOP 之间的全部物理内存，
//! 同时作为 `#[global_allocator]` 支撑 Box/Arc 等堆类型。
//! 用户页、页表页、内核栈都从这里取。

use bit_field::BitField;

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::mem::{size_of, MaybeUninit};
use core::ptr;

use super::list::List;
use crate::consts::{LEAF_SIZE, PGSIZE, PHYSTOP};
use crate::spinlock::SpinLock;

/// 全局内核堆。
///
/// 在 `kinit()` 之前不得有任何堆分配。
#[global_allocator]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::uninit();

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("alloc error: {:?}", layout)
}

/// 对外的堆句柄：一把自旋锁包住伙伴系统。
pub struct KernelHeap(SpinLock<BuddySystem>);

impl KernelHeap {
    const fn uninit() -> Self {
        Self(SpinLock::new(BuddySystem::uninit(), "kernel heap"))
    }

    /// 启动早期由 hart 0 调用一次，把 [end, PHYSTOP) 纳入堆管理。
    ///
    /// # 安全性
    /// 依赖链接脚本导出的 `end` 符号；只能调用一次，
    /// 且在此之前不得使用任何堆类型。
    pub unsafe fn kinit(&self) {
        extern "C" {
            fn end();
        }
        let end = end as usize;
        println!(
            "kernel heap: physical memory [{:#x}, {:#x})",
            end,
            usize::from(PHYSTOP)
        );
        self.0.lock().init(end, usize::from(PHYSTOP));
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.0.lock().dealloc(ptr, layout)
    }
}

/// 经典伙伴系统。
///
/// 堆被划分成 2 的幂大小的块，小到 LEAF_SIZE、大到整个堆；
/// 每级各有一条空闲链表、一张分配位图和（除最小级外）一张分裂位图。
/// 元数据本身也存放在被管理的内存区间开头，
/// 初始化时把这一段标成已分配。
pub struct BuddySystem {
    /// 管理区间的起始地址（页对齐）
    base: usize,
    /// 管理区间的结束地址（页对齐，不含）
    actual_end: usize,
    /// 支持的块大小级数
    nsizes: usize,
    initialized: bool,
    /// 每级的链表与位图，指向元数据区内手工布置的切片
    infos: MaybeUninit<*mut [BuddyInfo]>,
}

// *mut [T] 不是 Send，而整个结构始终躲在自旋锁后面
unsafe impl Send for BuddySystem {}

impl BuddySystem {
    const fn uninit() -> Self {
        Self {
            base: 0,
            actual_end: 0,
            nsizes: 0,
            initialized: false,
            infos: MaybeUninit::uninit(),
        }
    }

    /// 把 [start, end) 建成可用的伙伴系统。
    ///
    /// 步骤：对齐区间、算出级数、在区间开头布置各级的
    /// BuddyInfo/位图，然后把元数据区和因幂对齐而不存在的
    /// 尾部都标成已分配，剩余内存挂进空闲链表。
    /// 最后对账：空闲 + 元数据 + 不可用 必须等于总量。
    unsafe fn init(&mut self, start: usize, end: usize) {
        if self.initialized {
            panic!("buddy system: init twice");
        }

        let mut cur: usize = round_up(start, cmp::max(LEAF_SIZE, PGSIZE));
        self.base = cur;
        self.actual_end = round_down(end, cmp::max(LEAF_SIZE, PGSIZE));

        self.nsizes = log2((self.actual_end - cur) / LEAF_SIZE) + 1;
        if self.actual_end - cur > blk_size(self.max_size()) {
            self.nsizes += 1;
        }

        println!(
            "  buddy system: managing {:#x} bytes in {} sizes",
            self.actual_end - self.base,
            self.nsizes
        );

        // 在区间开头切出各级的管理结构
        let info_slice_ptr = init_slice_zeroed(&mut cur, self.nsizes);
        self.infos.as_mut_ptr().write(info_slice_ptr);

        for i in 0..self.nsizes {
            let nblk = self.n_blk(i);
            let info = self.get_info_mut(i);

            info.free.init();

            let alloc_size = round_up(nblk, 8) / 8;
            let alloc_slice_ptr = init_slice_zeroed(&mut cur, alloc_size);
            info.alloc.as_mut_ptr().write(alloc_slice_ptr);
        }

        // 最小一级的块不会分裂，不需要 split 位图
        for i in 1..self.nsizes {
            let nblk = self.n_blk(i);
            let info = self.get_info_mut(i);

            let split_size = round_up(nblk, 8) / 8;
            let split_slice_ptr = init_slice_zeroed(&mut cur, split_size);
            info.split.as_mut_ptr().write(split_slice_ptr);
        }

        cur = round_up(cur, LEAF_SIZE);

        // [base, cur) 是元数据
        let meta = cur - self.base;
        self.mark(self.base, cur);

        // [actual_end, base + 2^max) 是幂对齐造成的空洞
        let unavail = blk_size(self.max_size()) - (self.actual_end - self.base);
        self.mark(self.actual_end, self.actual_end + unavail);

        // 其余内存进空闲链表
        let free = self.init_free(cur);

        if free != blk_size(self.max_size()) - meta - unavail {
            panic!(
                "  buddy system: meta {}, free {}, unavail {}",
                meta, free, unavail
            );
        }

        self.initialized = true;
    }

    /// 分配满足 layout 的内存块，失败返回空指针。
    ///
    /// 从能容纳该大小的最小级向上找第一条非空链表，
    /// 拿到大块后逐级对半分裂，伙伴块回挂到低一级的链表。
    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return ptr::null_mut();
        }

        if layout.align() > PGSIZE {
            panic!(
                "buddy system: alignment {} > PGSIZE {}",
                layout.align(),
                PGSIZE
            );
        }
        // 值的大小总是其对齐的倍数，下面只需考虑大小

        let smalli = if layout.size() <= LEAF_SIZE {
            0
        } else {
            (layout.size().next_power_of_two() / LEAF_SIZE).trailing_zeros() as usize
        };
        let mut sizei = smalli;
        while sizei < self.nsizes {
            let info = unsafe { self.get_info_mut(sizei) };
            if !info.free.is_empty() {
                break;
            }
            sizei += 1;
        }
        if sizei >= self.nsizes {
            return ptr::null_mut();
        }

        let info = unsafe { self.get_info_mut(sizei) };
        let raw_addr = unsafe { info.free.pop() };
        let bi = self.blk_index(sizei, raw_addr);
        unsafe {
            self.get_info_mut(sizei).alloc_set(bi, true);
        }

        while sizei > smalli {
            let bi = self.blk_index(sizei, raw_addr);
            let info = unsafe { self.get_info_mut(sizei) };
            info.split_set(bi, true);

            let bi1 = self.blk_index(sizei - 1, raw_addr);
            let info1 = unsafe { self.get_info_mut(sizei - 1) };
            info1.alloc_set(bi1, true);

            let buddy_addr = raw_addr + blk_size(sizei - 1);
            unsafe {
                info1.free.push(buddy_addr);
            }

            sizei -= 1;
        }

        raw_addr as *mut u8
    }

    /// 归还 alloc 得到的内存块，并尽量与伙伴块合并成大块。
    fn dealloc(&mut self, ptr: *mut u8, layout: Layout) {
        let mut raw_addr = ptr as usize;
        if raw_addr < self.base || raw_addr >= self.actual_end {
            panic!("buddy system: dealloc ptr out of range");
        }

        // 借助 split 位图推断这个块当初按哪一级分配
        let mut sizei = self.nsizes;
        for i in 0..self.max_size() {
            let bi = self.blk_index(i + 1, raw_addr);
            let info = unsafe { self.get_info_mut(i + 1) };
            if info.is_split_set(bi) {
                sizei = i;
                break;
            }
        }
        if sizei == self.nsizes {
            panic!("buddy system: dealloc cannot locate block");
        }

        if layout.size() > blk_size(sizei) {
            panic!(
                "buddy system: layout {:?} > block size {}",
                layout,
                blk_size(sizei)
            );
        }

        while sizei < self.max_size() {
            let bi = self.blk_index(sizei, raw_addr);
            let buddyi = if bi % 2 == 0 { bi + 1 } else { bi - 1 };
            let info = unsafe { self.get_info_mut(sizei) };
            info.alloc_set(bi, false);

            if info.is_alloc_set(buddyi) {
                break;
            }
            let buddy_addr = self.blk_addr(sizei, buddyi);
            unsafe {
                (buddy_addr as *mut List).as_mut().unwrap().remove();
            }
            if buddyi % 2 == 0 {
                raw_addr = buddy_addr;
            }

            sizei += 1;
            let spliti = self.blk_index(sizei, raw_addr);
            let info = unsafe { self.get_info_mut(sizei) };
            info.split_set(spliti, false);
        }

        let info = unsafe { self.get_info_mut(sizei) };
        unsafe {
            info.free.push(raw_addr);
        }
    }

    /// 把 [left, right) 在所有级上标成已分配（并标分裂），
    /// 初始化时用于元数据区和尾部空洞。
    fn mark(&mut self, left: usize, right: usize) {
        assert_eq!(left % LEAF_SIZE, 0);
        assert_eq!(right % LEAF_SIZE, 0);

        for i in 0..self.nsizes {
            let mut bi = self.blk_index(i, left);
            let bj = self.blk_index_next(i, right);
            while bi < bj {
                let info = unsafe { self.get_info_mut(i) };
                info.alloc_set(bi, true);
                if i > 0 {
                    info.split_set(bi, true);
                }
                bi += 1;
            }
        }
    }

    /// 把 [left, actual_end) 中真正空闲的块挂进各级链表，
    /// 返回挂入的总字节数用于对账。
    fn init_free(&mut self, left: usize) -> usize {
        let right = self.actual_end;
        let mut free = 0;
        for i in 0..self.max_size() {
            let lbi = self.blk_index_next(i, left);
            let rbi = self.blk_index(i, right);
            free += self.init_free_pair(i, lbi);
            if left < right {
                free += self.init_free_pair(i, rbi);
            }
        }
        free
    }

    /// 一对伙伴中恰好一个空闲时，把空闲的那个挂进链表。
    fn init_free_pair(&mut self, sizei: usize, bi: usize) -> usize {
        let buddyi = if bi % 2 == 0 { bi + 1 } else { bi - 1 };
        let blk_addr_bi = self.blk_addr(sizei, bi);
        let blk_addr_buddyi = self.blk_addr(sizei, buddyi);

        let info = unsafe { self.get_info_mut(sizei) };
        if info.is_alloc_set(bi) != info.is_alloc_set(buddyi) {
            unsafe {
                if info.is_alloc_set(bi) {
                    info.free.push(blk_addr_buddyi);
                } else {
                    info.free.push(blk_addr_bi);
                }
            }
            blk_size(sizei)
        } else {
            0
        }
    }

    /// 安全性：infos 初始化之后才能调用。
    unsafe fn get_info_mut(&mut self, index: usize) -> &mut BuddyInfo {
        let info_slice_ptr = *self.infos.as_ptr();
        info_slice_ptr.get_unchecked_mut(index).as_mut().unwrap()
    }

    /// 最大一级的下标。
    #[inline]
    fn max_size(&self) -> usize {
        self.nsizes - 1
    }

    /// 第 k 级总共有多少块。
    #[inline]
    fn n_blk(&self, k: usize) -> usize {
        1 << (self.max_size() - k)
    }

    fn blk_index(&self, k: usize, addr: usize) -> usize {
        (addr - self.base) / blk_size(k)
    }

    fn blk_index_next(&self, k: usize, addr: usize) -> usize {
        let mut i = (addr - self.base) / blk_size(k);
        if (addr - self.base) % blk_size(k) > 0 {
            i += 1;
        }
        i
    }

    fn blk_addr(&self, k: usize, bi: usize) -> usize {
        self.base + bi * blk_size(k)
    }
}

/// 第 k 级的管理信息。
#[repr(C)]
struct BuddyInfo {
    /// 该级的空闲块链表
    free: List,
    /// 分配位图
    alloc: MaybeUninit<*mut [u8]>,
    /// 分裂位图（第 0 级没有）
    split: MaybeUninit<*mut [u8]>,
}

impl BuddyInfo {
    /// 安全性：alloc 位图初始化之后才能调用。
    unsafe fn get_alloc(&self, index: usize) -> &u8 {
        let alloc_slice_ptr = *self.alloc.as_ptr() as *const [u8];
        alloc_slice_ptr.get_unchecked(index).as_ref().unwrap()
    }

    unsafe fn get_alloc_mut(&mut self, index: usize) -> &mut u8 {
        let alloc_slice_ptr = *self.alloc.as_ptr();
        alloc_slice_ptr.get_unchecked_mut(index).as_mut().unwrap()
    }

    /// 安全性：split 位图初始化之后才能调用。
    unsafe fn get_split(&self, index: usize) -> &u8 {
        let split_slice_ptr = *self.split.as_ptr() as *const [u8];
        split_slice_ptr.get_unchecked(index).as_ref().unwrap()
    }

    unsafe fn get_split_mut(&mut self, index: usize) -> &mut u8 {
        let split_slice_ptr = *self.split.as_ptr();
        split_slice_ptr.get_unchecked_mut(index).as_mut().unwrap()
    }

    fn alloc_set(&mut self, index: usize, val: bool) {
        unsafe {
            self.get_alloc_mut(index / 8).set_bit(index % 8, val);
        }
    }

    fn split_set(&mut self, index: usize, val: bool) {
        unsafe {
            self.get_split_mut(index / 8).set_bit(index % 8, val);
        }
    }

    fn is_alloc_set(&self, index: usize) -> bool {
        unsafe { self.get_alloc(index / 8).get_bit(index % 8) }
    }

    fn is_split_set(&self, index: usize) -> bool {
        unsafe { self.get_split(index / 8).get_bit(index % 8) }
    }
}

/// 在元数据区 cur 处切出长度 len 的清零切片并推进 cur。
unsafe fn init_slice_zeroed<T>(cur: &mut usize, len: usize) -> *mut [T] {
    let raw_ptr = *cur as *mut T;
    *cur += size_of::<T>() * len;
    ptr::write_bytes(raw_ptr, 0, len);
    ptr::slice_from_raw_parts_mut(raw_ptr, len)
}

#[inline]
fn round_up(n: usize, size: usize) -> usize {
    ((n - 1) / size + 1) * size
}

#[inline]
fn round_down(n: usize, size: usize) -> usize {
    n / size * size
}

fn log2(mut n: usize) -> usize {
    let mut k = 0;
    while n > 1 {
        k += 1;
        n >>= 1;
    }
    k
}

#[inline]
fn blk_size(k: usize) -> usize {
    (1 << k) * LEAF_SIZE
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use crate::consts::NCPU;
    use crate::mm::{RawPage, RawSinglePage};
    use crate::process::CpuManager;
    use core::sync::atomic::{AtomicU8, Ordering};

    /// 多核同时分配/释放页，检验堆锁。
    pub fn alloc_simo() {
        static STARTED: AtomicU8 = AtomicU8::new(0);
        STARTED.fetch_add(1, Ordering::Relaxed);
        while (STARTED.load(Ordering::Relaxed) as usize) < NCPU {}

        let id = unsafe { CpuManager::cpu_id() };

        for _ in 0..10 {
            unsafe {
                let page = RawSinglePage::new_zeroed();
                println!("hart {} alloc page at {:#x}", id, page as usize);
                RawSinglePage::from_raw_and_drop(page);
            }
        }

        STARTED.fetch_sub(1, Ordering::Relaxed);
        while STARTED.load(Ordering::Relaxed) != 0 {}
    }
}
