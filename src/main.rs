//! rvos：运行在 qemu virt 平台上的多核 RISC-V 教学内核

#![no_std]
#![no_main]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]
#![feature(new_zeroed_alloc)]
#![feature(get_mut_unchecked)]
#![feature(slice_ptr_get)]
#![allow(dead_code)]
#![warn(rust_2018_idioms)]

use core::arch::global_asm;

#[macro_use]
extern crate bitflags;

extern crate alloc;

global_asm!(include_str!("asm/entry.S"));
global_asm!(include_str!("asm/kernelvec.S"));
global_asm!(include_str!("asm/swtch.S"));
global_asm!(include_str!("asm/trampoline.S"));

#[macro_use]
mod printf;

mod consts;
mod driver;
mod fs;
mod mm;
mod plic;
mod process;
mod register;
mod rmain;
mod sleeplock;
mod spinlock;
mod start;
mod trap;

/// 启动完成后在各 hart 上执行的内核内测试入口。
/// 只在启用 unit_test 特性时编译。
#[cfg(feature = "unit_test")]
fn test_main_entry() {
    let cpu_id = unsafe { process::CpuManager::cpu_id() };

    // 单 hart 的测试用例
    if cpu_id == 0 {
        spinlock::tests::smoke();
        mm::frame::tests::clone_and_refs();
        mm::pagetable::tests::map_walk_unmap();
        mm::pagetable::tests::cow_copy_and_split();
    }

    // 需要多 hart 同时执行的测试用例
    printf::tests::println_simo();
    mm::kalloc::tests::alloc_simo();

    if cpu_id == 0 {
        println!("all tests pass.");
    }
}
