//! 内核地址空间

use core::arch::asm;
use core::convert::{Into, TryFrom};
use core::mem;

use super::{Addr, PageTable, PhysAddr, PteFlag, RawQuadPage, RawSinglePage, VirtAddr};
use crate::consts::{
    CLINT, CLINT_MAP_SIZE, KERNBASE, PGSIZE, PHYSTOP, PLIC, PLIC_MAP_SIZE, TRAMPOLINE, UART0,
    UART0_MAP_SIZE, VIRTIO0, VIRTIO0_MAP_SIZE,
};
use crate::register::satp;

/// 全局唯一的内核页表根。
///
/// 所有 hart 共享同一张表；启动阶段由 hart 0 填好，
/// 之后每个 hart 把它装入自己的 satp。
static mut KERNEL_PAGE_TABLE: PageTable = PageTable::empty();

/// 刷新本 hart 的地址翻译缓存。
#[inline]
pub fn sfence_vma() {
    unsafe {
        asm!("sfence.vma zero, zero");
    }
}

/// 本 hart 启用分页：装入内核页表并刷新 TLB。
pub unsafe fn kvm_init_hart() {
    satp::write(KERNEL_PAGE_TABLE.as_satp());
    sfence_vma();
}

/// 建立内核地址空间的全部映射。
///
/// MMIO 设备、内核代码段（只读可执行）、数据段加空余物理内存
/// （可读写）均为恒等映射；跳板页映射到虚拟空间顶端。
///
/// # 安全性
/// 只能在分页开启前由 hart 0 调用一次。
pub unsafe fn kvm_init() {
    // 页类型与页表页必须布局一致，Drop 里会互相转换
    debug_assert_eq!(mem::size_of::<RawSinglePage>(), PGSIZE);
    debug_assert_eq!(mem::align_of::<RawSinglePage>(), PGSIZE);
    debug_assert_eq!(mem::size_of::<RawSinglePage>(), mem::size_of::<PageTable>());
    debug_assert_eq!(mem::align_of::<RawSinglePage>(), mem::align_of::<PageTable>());
    debug_assert_eq!(mem::size_of::<RawQuadPage>(), PGSIZE * 4);
    debug_assert_eq!(mem::align_of::<RawQuadPage>(), PGSIZE);

    // UART 寄存器
    kvm_map(
        VirtAddr::from(UART0),
        PhysAddr::from(UART0),
        UART0_MAP_SIZE,
        PteFlag::R | PteFlag::W,
    );

    // virtio mmio 磁盘接口
    kvm_map(
        VirtAddr::from(VIRTIO0),
        PhysAddr::from(VIRTIO0),
        VIRTIO0_MAP_SIZE,
        PteFlag::R | PteFlag::W,
    );

    // CLINT
    kvm_map(
        VirtAddr::from(CLINT),
        PhysAddr::from(CLINT),
        CLINT_MAP_SIZE,
        PteFlag::R | PteFlag::W,
    );

    // PLIC
    kvm_map(
        VirtAddr::from(PLIC),
        PhysAddr::from(PLIC),
        PLIC_MAP_SIZE,
        PteFlag::R | PteFlag::W,
    );

    // 内核代码段 [KERNBASE, etext)
    extern "C" {
        fn etext();
    }
    let etext = etext as usize;
    kvm_map(
        VirtAddr::from(KERNBASE),
        PhysAddr::from(KERNBASE),
        etext - Into::<usize>::into(KERNBASE),
        PteFlag::R | PteFlag::X,
    );

    // 数据段与其余物理内存 [etext, PHYSTOP)
    kvm_map(
        VirtAddr::try_from(etext).unwrap(),
        PhysAddr::try_from(etext).unwrap(),
        usize::from(PHYSTOP) - etext,
        PteFlag::R | PteFlag::W,
    );

    // 跳板页放在虚拟空间顶端
    extern "C" {
        fn trampoline();
    }
    kvm_map(
        VirtAddr::from(TRAMPOLINE),
        PhysAddr::try_from(trampoline as usize).unwrap(),
        PGSIZE,
        PteFlag::R | PteFlag::X,
    );
}

/// 在内核页表上加一段映射，失败即 panic（启动期的映射不允许失败）。
pub unsafe fn kvm_map(va: VirtAddr, pa: PhysAddr, size: usize, perm: PteFlag) {
    #[cfg(feature = "verbose_init_info")]
    println!(
        "kvm_map: va={:#x}, pa={:#x}, size={:#x}",
        va.as_usize(),
        pa.as_usize(),
        size
    );

    if let Err(err) = KERNEL_PAGE_TABLE.map_pages(va, size, pa, perm) {
        panic!("kvm_map: {}", err);
    }
}
