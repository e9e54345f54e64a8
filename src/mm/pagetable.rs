//! Sv39 三级页表

use array_macro::array;

use alloc::boxed::Box;
use core::convert::TryFrom;
use core::{cmp::min, ptr};

use super::frame::{alloc_page_zeroed, FRAME_REFS};
use super::kvm::sfence_vma;
use super::{pg_round_up, Addr, PhysAddr, RawPage, RawSinglePage, VirtAddr};
use crate::consts::{PGSHIFT, PGSIZE, SATP_SV39, SV39FLAGLEN, TRAMPOLINE, TRAPFRAME, USERTEXT};

bitflags! {
    /// 页表项的权限与状态位。
    ///
    /// RSW 的低位（bit 8）被内核挪用为写时复制标记：
    /// 置位的叶项有效、可读但不可写，
    /// 写缺页处理程序看到它时执行克隆而不是杀进程。
    pub struct PteFlag: usize {
        /// 有效
        const V = 1 << 0;
        /// 可读
        const R = 1 << 1;
        /// 可写
        const W = 1 << 2;
        /// 可执行
        const X = 1 << 3;
        /// 用户态可访问
        const U = 1 << 4;
        /// 全局映射
        const G = 1 << 5;
        /// 硬件置位：被访问过
        const A = 1 << 6;
        /// 硬件置位：被写过
        const D = 1 << 7;
        /// 写时复制标记（软件保留位）
        const C = 1 << 8;
    }
}

/// 单个页表项。
#[repr(C)]
#[derive(Debug)]
pub struct PageTableEntry {
    data: usize,
}

impl PageTableEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.data & PteFlag::V.bits() > 0
    }

    #[inline]
    fn is_leaf(&self) -> bool {
        self.data & (PteFlag::R | PteFlag::W | PteFlag::X).bits() != 0
    }

    #[inline]
    fn is_user(&self) -> bool {
        self.data & PteFlag::U.bits() > 0
    }

    #[inline]
    fn is_cow(&self) -> bool {
        self.data & PteFlag::C.bits() > 0
    }

    #[inline]
    fn is_writable(&self) -> bool {
        self.data & PteFlag::W.bits() > 0
    }

    #[inline]
    fn clear_user(&mut self) {
        self.data &= !PteFlag::U.bits()
    }

    #[inline]
    fn as_page_table(&self) -> *mut PageTable {
        ((self.data >> SV39FLAGLEN) << PGSHIFT) as *mut PageTable
    }

    #[inline]
    pub fn as_phys_addr(&self) -> PhysAddr {
        unsafe { PhysAddr::from_raw((self.data >> SV39FLAGLEN) << PGSHIFT) }
    }

    #[inline]
    fn write_zero(&mut self) {
        self.data = 0;
    }

    #[inline]
    fn write(&mut self, pa: PhysAddr) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | PteFlag::V.bits();
    }

    #[inline]
    fn write_perm(&mut self, pa: PhysAddr, perm: PteFlag) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (perm | PteFlag::V).bits()
    }

    #[inline]
    fn read_perm(&self) -> PteFlag {
        PteFlag::from_bits_truncate(self.data)
    }
}

/// 一页大小的页表节点：512 个页表项。
///
/// 既当根、也当中间级和叶级用；用户地址空间和内核地址空间
/// 各有自己的根，二者都在最高处映射跳板页。
#[repr(C, align(4096))]
pub struct PageTable {
    data: [PageTableEntry; 512],
}

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            data: array![_ => PageTableEntry { data: 0 }; 512],
        }
    }

    /// 根页表对应的 satp 值。
    pub fn as_satp(&self) -> usize {
        SATP_SV39 | ((self as *const PageTable as usize) >> PGSHIFT)
    }

    /// 建立 [va, va+size) 到 [pa, ...) 的映射，权限为 perm。
    ///
    /// 虚拟区间自动页对齐；目标项已有映射时视为内核逻辑错误，panic。
    /// 中间级页表页分配失败时返回错误，已建立的项保持原样。
    pub fn map_pages(
        &mut self,
        mut va: VirtAddr,
        size: usize,
        mut pa: PhysAddr,
        perm: PteFlag,
    ) -> Result<(), &'static str> {
        let mut last = VirtAddr::try_from(va.as_usize() + size)?;
        va.pg_round_down();
        last.pg_round_up();

        while va != last {
            match self.walk_alloc(va) {
                Some(pte) => {
                    if pte.is_valid() {
                        println!(
                            "va: {:#x}, pa: {:#x}, pte: {:#x}",
                            va.as_usize(),
                            pa.as_usize(),
                            pte.data
                        );
                        panic!("remap");
                    }
                    pte.write_perm(pa, perm);
                    va.add_page();
                    pa.add_page();
                }
                None => return Err("map_pages: no memory for page table"),
            }
        }

        Ok(())
    }

    /// 下行到叶级，必要时分配中间级页表页。
    /// 返回 va 对应的叶项；分配失败返回 None。
    fn walk_alloc(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut pgt.as_mut().unwrap().data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                let zeroed_pgt = unsafe { Box::<Self>::try_new_zeroed().ok()?.assume_init() };
                pgt = Box::into_raw(zeroed_pgt);
                pte.write(PhysAddr::try_from(pgt as usize).unwrap());
            }
        }
        unsafe { Some(&mut pgt.as_mut().unwrap().data[va.page_num(0)]) }
    }

    /// 同 [walk_alloc]，但缺中间级时不分配，直接返回 None。
    fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut pgt.as_mut().unwrap().data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None;
            }
        }
        unsafe { Some(&mut pgt.as_mut().unwrap().data[va.page_num(0)]) }
    }

    /// 只读版本的叶项查找。
    pub fn walk(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        let mut pgt = self as *const PageTable;
        for level in (1..=2).rev() {
            let pte = unsafe { &pgt.as_ref().unwrap().data[va.page_num(level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None;
            }
        }
        unsafe { Some(&pgt.as_ref().unwrap().data[va.page_num(0)]) }
    }

    /// 用户虚拟地址到物理地址（只读访问）。
    pub fn walk_addr(&self, va: VirtAddr) -> Result<PhysAddr, &'static str> {
        match self.walk(va) {
            Some(pte) => {
                if !pte.is_valid() {
                    Err("walk_addr: pte not valid")
                } else if !pte.is_user() {
                    Err("walk_addr: pte not user")
                } else {
                    Ok(pte.as_phys_addr())
                }
            }
            None => Err("walk_addr: va not mapped"),
        }
    }

    /// 用户虚拟地址到可写物理页。
    ///
    /// 叶项带写时复制标记时先克隆，保证返回的页可以放心写入；
    /// 真正只读的页拒绝，返回错误。
    pub fn walk_addr_writable(&mut self, va: VirtAddr) -> Result<PhysAddr, &'static str> {
        let need_clone = {
            match self.walk_mut(va) {
                Some(pte) => {
                    if !pte.is_valid() {
                        return Err("walk_addr_writable: pte not valid");
                    }
                    if !pte.is_user() {
                        return Err("walk_addr_writable: pte not user");
                    }
                    if !pte.is_cow() && !pte.is_writable() {
                        return Err("walk_addr_writable: pte read-only");
                    }
                    pte.is_cow()
                }
                None => return Err("walk_addr_writable: va not mapped"),
            }
        };

        if need_clone {
            self.cow_fault(va.as_usize())
                .map_err(|()| "walk_addr_writable: cow clone failed")?;
        }

        let pte = self.walk_mut(va).unwrap();
        Ok(pte.as_phys_addr())
    }

    /// 写缺页的写时复制处理。
    ///
    /// 出错地址落在一个带 C 标记的有效用户叶项上时，
    /// 经引用计数表克隆页帧，然后把叶项改写为：
    /// 新帧、可写、C 清除。其他情况一律返回错误，由调用方杀进程。
    pub fn cow_fault(&mut self, va: usize) -> Result<(), ()> {
        let mut va = VirtAddr::try_from(va).map_err(|_| ())?;
        va.pg_round_down();

        let pa;
        let mut perm;
        match self.walk_mut(va) {
            Some(pte) => {
                if !pte.is_valid() || !pte.is_user() || !pte.is_cow() {
                    return Err(());
                }
                pa = pte.as_phys_addr().into_raw();
                perm = pte.read_perm();
            }
            None => return Err(()),
        }

        let new_pa = unsafe { FRAME_REFS.try_clone(pa)? };

        perm.remove(PteFlag::C);
        perm.insert(PteFlag::W);
        let pte = self.walk_mut(va).unwrap();
        pte.write_perm(unsafe { PhysAddr::from_raw(new_pa) }, perm);
        sfence_vma();
        Ok(())
    }

    /// 为新进程建立空的用户页表：只含跳板页与陷阱帧两个映射。
    pub fn alloc_proc_pagetable(trapframe: usize) -> Option<Box<Self>> {
        extern "C" {
            fn trampoline();
        }

        let mut pagetable = unsafe { Box::<Self>::try_new_zeroed().ok()?.assume_init() };
        pagetable
            .map_pages(
                VirtAddr::from(TRAMPOLINE),
                PGSIZE,
                PhysAddr::try_from(trampoline as usize).unwrap(),
                PteFlag::R | PteFlag::X,
            )
            .ok()?;
        pagetable
            .map_pages(
                VirtAddr::from(TRAPFRAME),
                PGSIZE,
                PhysAddr::try_from(trapframe).unwrap(),
                PteFlag::R | PteFlag::W,
            )
            .ok()?;

        Some(pagetable)
    }

    /// 撤销进程页表：解除跳板/陷阱帧映射（不释放那两页），
    /// 再释放整个用户地址空间。
    pub fn dealloc_proc_pagetable(&mut self, proc_size: usize) {
        self.uvm_unmap(TRAMPOLINE.into(), 1, false);
        self.uvm_unmap(TRAPFRAME.into(), 1, false);
        if proc_size > 0 {
            self.uvm_unmap(0, pg_round_up(proc_size) / PGSIZE, true);
        }
    }

    /// 把第一个用户进程的引导代码放进地址空间的第一页。
    pub fn uvm_init(&mut self, code: &[u8]) {
        if code.len() >= PGSIZE {
            panic!("initcode more than a page");
        }

        let mem = alloc_page_zeroed().expect("alloc initcode page");
        self.map_pages(
            VirtAddr::from(USERTEXT),
            PGSIZE,
            PhysAddr::try_from(mem as usize).unwrap(),
            PteFlag::R | PteFlag::W | PteFlag::X | PteFlag::U,
        )
        .expect("map initcode page");
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), mem, code.len());
        }
    }

    /// 用户地址空间从 old_size 增长到 new_size。
    ///
    /// 逐页分配清零的可写用户页；任何一步失败都把本次
    /// 新增的映射全部回退，地址空间保持调用前的状态。
    /// 用户内存不得长进陷阱帧及其上方的保留区。
    pub fn uvm_alloc(&mut self, old_size: usize, new_size: usize) -> Result<usize, ()> {
        if new_size <= old_size {
            return Ok(old_size);
        }
        if new_size > TRAPFRAME.into() {
            return Err(());
        }

        let old_size = pg_round_up(old_size);
        for cur_size in (old_size..new_size).step_by(PGSIZE) {
            match alloc_page_zeroed() {
                Err(()) => {
                    self.uvm_dealloc(cur_size, old_size);
                    return Err(());
                }
                Ok(mem) => {
                    match self.map_pages(
                        unsafe { VirtAddr::from_raw(cur_size) },
                        PGSIZE,
                        unsafe { PhysAddr::from_raw(mem as usize) },
                        PteFlag::R | PteFlag::W | PteFlag::X | PteFlag::U,
                    ) {
                        Err(s) => {
                            #[cfg(feature = "kernel_warning")]
                            println!("kernel warning: uvm_alloc: {}", s);
                            #[cfg(not(feature = "kernel_warning"))]
                            let _ = s;
                            FRAME_REFS.dec(mem as usize);
                            self.uvm_dealloc(cur_size, old_size);
                            return Err(());
                        }
                        Ok(_) => {
                            // 页帧的所有权此后记录在页表里
                        }
                    }
                }
            }
        }

        Ok(new_size)
    }

    /// 用户地址空间从 old_size 收缩到 new_size，返回调整后的大小。
    pub fn uvm_dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let old_size_aligned = pg_round_up(old_size);
        let new_size_aligned = pg_round_up(new_size);
        if new_size_aligned < old_size_aligned {
            let count = (old_size_aligned - new_size_aligned) / PGSIZE;
            self.uvm_unmap(new_size_aligned, count, true);
        }

        new_size
    }

    /// 解除从 va 开始 count 页的映射。
    ///
    /// freeing 为真时经引用计数表归还页帧
    /// （共享中的帧只减计数，最后一个引用消失才真正释放）。
    pub fn uvm_unmap(&mut self, va: usize, count: usize, freeing: bool) {
        if va % PGSIZE != 0 {
            panic!("uvm_unmap: va not aligned");
        }

        for ca in (va..va + PGSIZE * count).step_by(PGSIZE) {
            let pte = self
                .walk_mut(unsafe { VirtAddr::from_raw(ca) })
                .expect("uvm_unmap: walk");
            if !pte.is_valid() {
                panic!("uvm_unmap: pte not valid");
            }
            if !pte.is_leaf() {
                panic!("uvm_unmap: pte not a leaf");
            }
            if freeing {
                let pa = pte.as_phys_addr();
                FRAME_REFS.dec(pa.into_raw());
            }
            pte.write_zero();
        }
    }

    /// 清掉某页的用户访问位，exec 用它把栈下那页变成保护页。
    pub fn uvm_clear(&mut self, va: usize) {
        let pte = self
            .walk_mut(VirtAddr::try_from(va).unwrap())
            .expect("uvm_clear: walk");
        pte.clear_user();
    }

    /// fork 的地址空间复制：写时复制，不拷贝任何数据页。
    ///
    /// 每个有效叶项：原本可写的清掉 W、打上 C（父子两侧一致），
    /// 子页表映射到同一页帧并把帧计数加一。
    /// 中途失败时回退子侧已建立的映射（计数随之回落），
    /// 父侧已改的权限保持 CoW 状态，语义不受影响。
    pub fn uvm_copy(&mut self, child_pgt: &mut Self, size: usize) -> Result<(), ()> {
        for i in (0..size).step_by(PGSIZE) {
            let va = unsafe { VirtAddr::from_raw(i) };
            let pte = self.walk_mut(va).expect("uvm_copy: pte not exist");
            if !pte.is_valid() {
                panic!("uvm_copy: pte not valid");
            }
            let pa = pte.as_phys_addr();
            let mut perm = pte.read_perm();
            if perm.contains(PteFlag::W) {
                perm.remove(PteFlag::W);
                perm.insert(PteFlag::C);
                pte.write_perm(pa, perm);
            }

            if child_pgt.map_pages(va, PGSIZE, pa, perm).is_err() {
                child_pgt.uvm_unmap(0, i / PGSIZE, true);
                return Err(());
            }
            FRAME_REFS.inc(pa.into_raw());
        }
        sfence_vma();
        Ok(())
    }

    /// 从用户地址 srcva 拷贝一个以 0 结尾的字符串到内核缓冲区。
    pub fn copy_in_str(&self, srcva: usize, dst: &mut [u8]) -> Result<(), &'static str> {
        let mut i: usize = 0;
        let mut va = VirtAddr::try_from(srcva)?;

        // 逐页推进
        while i < dst.len() {
            let mut base = va;
            base.pg_round_down();
            let distance = (va - base).as_usize();
            let mut pa_ptr = unsafe { self.walk_addr(base)?.as_ptr().offset(distance as isize) };

            let mut count = min(PGSIZE - distance, dst.len() - i);
            while count > 0 {
                unsafe {
                    dst[i] = ptr::read(pa_ptr);
                    if dst[i] == 0 {
                        return Ok(());
                    }
                    i += 1;
                    count -= 1;
                    pa_ptr = pa_ptr.add(1);
                }
            }

            base.add_page();
            va = base;
        }

        Err("copy_in_str: dst too small")
    }

    /// 把内核缓冲区 src 的 count 字节写到用户地址 dst。
    ///
    /// 跨页时分段处理；目标页带写时复制标记时先克隆，
    /// 真正只读的页导致整个操作失败。
    pub fn copy_out(
        &mut self,
        mut src: *const u8,
        mut dst: usize,
        mut count: usize,
    ) -> Result<(), ()> {
        if count == 0 {
            return Ok(());
        }

        let mut va = VirtAddr::try_from(dst).map_err(|_| ())?;
        va.pg_round_down();
        loop {
            let mut pa;
            match self.walk_addr_writable(va) {
                Ok(phys_addr) => pa = phys_addr,
                Err(s) => {
                    #[cfg(feature = "kernel_warning")]
                    println!("kernel warning: copy_out: {}", s);
                    #[cfg(not(feature = "kernel_warning"))]
                    let _ = s;
                    return Err(());
                }
            }
            let off = dst - va.as_usize();
            let off_from_end = PGSIZE - off;
            let off = off as isize;
            let dst_ptr = unsafe { pa.as_mut_ptr().offset(off) };
            if off_from_end > count {
                unsafe {
                    ptr::copy(src, dst_ptr, count);
                }
                return Ok(());
            }
            unsafe {
                ptr::copy(src, dst_ptr, off_from_end);
            }
            count -= off_from_end;
            src = unsafe { src.offset(off_from_end as isize) };
            dst += off_from_end;
            va.add_page();
            debug_assert_eq!(dst, va.as_usize());
        }
    }

    /// 从用户地址 src 读 count 字节到内核缓冲区 dst。
    pub fn copy_in(&self, mut src: usize, mut dst: *mut u8, mut count: usize) -> Result<(), ()> {
        let mut va = VirtAddr::try_from(src).map_err(|_| ())?;
        va.pg_round_down();

        if count == 0 {
            return self.walk_addr(va).map(|_| ()).map_err(|_| ());
        }

        loop {
            let pa;
            match self.walk_addr(va) {
                Ok(phys_addr) => pa = phys_addr,
                Err(s) => {
                    #[cfg(feature = "kernel_warning")]
                    println!("kernel warning: copy_in: {}", s);
                    #[cfg(not(feature = "kernel_warning"))]
                    let _ = s;
                    return Err(());
                }
            }
            let off = src - va.as_usize();
            let off_from_end = PGSIZE - off;
            let off = off as isize;
            let src_ptr = unsafe { pa.as_ptr().offset(off) };
            if off_from_end > count {
                unsafe {
                    ptr::copy(src_ptr, dst, count);
                }
                return Ok(());
            }
            unsafe {
                ptr::copy(src_ptr, dst, off_from_end);
            }
            count -= off_from_end;
            src += off_from_end;
            dst = unsafe { dst.offset(off_from_end as isize) };
            va.add_page();
            debug_assert_eq!(src, va.as_usize());
        }
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;
    use alloc::boxed::Box;

    /// 建映射、查映射、拆映射走一个来回。
    pub fn map_walk_unmap() {
        let mut pgt = unsafe { Box::<PageTable>::new_zeroed().assume_init() };
        let mem = alloc_page_zeroed().unwrap();
        pgt.map_pages(
            unsafe { VirtAddr::from_raw(0) },
            PGSIZE,
            unsafe { PhysAddr::from_raw(mem as usize) },
            PteFlag::R | PteFlag::W | PteFlag::U,
        )
        .unwrap();

        let pa = pgt.walk_addr(unsafe { VirtAddr::from_raw(0) }).unwrap();
        assert_eq!(pa.into_raw(), mem as usize);

        pgt.uvm_unmap(0, 1, true);
        assert!(pgt.walk_addr(unsafe { VirtAddr::from_raw(0) }).is_err());
    }

    /// 写时复制：fork 复制共享页帧，写缺页后分道扬镳。
    pub fn cow_copy_and_split() {
        let mut parent = unsafe { Box::<PageTable>::new_zeroed().assume_init() };
        let mut child = unsafe { Box::<PageTable>::new_zeroed().assume_init() };

        parent.uvm_alloc(0, PGSIZE).unwrap();
        parent.uvm_copy(child.as_mut(), PGSIZE).unwrap();

        let va = unsafe { VirtAddr::from_raw(0) };
        let pa_parent = parent.walk(va).unwrap().as_phys_addr();
        let pa_child = child.walk(va).unwrap().as_phys_addr();
        assert_eq!(pa_parent, pa_child);

        // 子进程一侧的写缺页把共享帧分裂开
        child.cow_fault(0).unwrap();
        let pa_child = child.walk(va).unwrap().as_phys_addr();
        assert_ne!(pa_parent, pa_child);

        // 父进程一侧此后独占原帧，原地解除只读
        parent.cow_fault(0).unwrap();
        let pa_parent_after = parent.walk(va).unwrap().as_phys_addr();
        assert_eq!(pa_parent, pa_parent_after);

        child.uvm_unmap(0, 1, true);
        parent.uvm_unmap(0, 1, true);
    }
}

impl Drop for PageTable {
    /// 释放两级中间节点。
    ///
    /// 三级结构用两层显式循环走完，不借助递归：
    /// 根的每个有效项指向一张二级表，二级表的每个有效项
    /// 指向一张叶级表；叶级表中的数据页必须早已由
    /// uvm_unmap 解除，这里只回收页表页本身。
    fn drop(&mut self) {
        for pte2 in self.data.iter_mut() {
            if !pte2.is_valid() {
                continue;
            }
            if pte2.is_leaf() {
                panic!("pagetable drop: leaf not unmapped");
            }
            let mid = pte2.as_page_table();
            let mid_ref = unsafe { mid.as_mut().unwrap() };
            for pte1 in mid_ref.data.iter_mut() {
                if !pte1.is_valid() {
                    continue;
                }
                if pte1.is_leaf() {
                    panic!("pagetable drop: leaf not unmapped");
                }
                let leaf_table = pte1.as_page_table();
                unsafe {
                    for pte0 in leaf_table.as_mut().unwrap().data.iter() {
                        if pte0.is_valid() {
                            panic!("pagetable drop: data page not unmapped");
                        }
                    }
                    RawSinglePage::from_raw_and_drop(leaf_table as *mut u8);
                }
                pte1.write_zero();
            }
            unsafe {
                RawSinglePage::from_raw_and_drop(mid as *mut u8);
            }
            pte2.write_zero();
        }
    }
}
