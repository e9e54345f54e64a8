//! exec：把 ELF 可执行文件装进进程地址空间

use alloc::boxed::Box;
use core::{
    cmp::min,
    convert::TryFrom,
    mem::{self, MaybeUninit},
};

use crate::consts::{MAXARG, MAXARGLEN, PGSIZE};
use crate::fs::{InodeData, ICACHE, LOG};
use crate::mm::{pg_round_up, Addr, Address, PageTable, VirtAddr};
use crate::sleeplock::SleepLockGuard;

use super::Proc;

/// 加载 path 指向的 ELF 文件并重建进程映像。
///
/// 新页表先在一旁组装：逐个载入 LOAD 段，再加两页用户栈
/// （下面那页清掉用户位当保护页），把 argv 逐条压进栈里。
/// 全部就绪后才一次性替换进程的页表、大小与入口，
/// 旧地址空间随后释放；中途任何失败都只丢弃新页表，
/// 原进程映像不受影响。成功时返回 argc（落在用户 a0）。
pub fn load(
    p: &mut Proc,
    path: &[u8],
    argv: &[Option<Box<[u8; MAXARGLEN]>>],
) -> Result<usize, &'static str> {
    let inode;
    LOG.begin_op();
    match ICACHE.namei(path) {
        Some(i) => inode = i,
        None => {
            LOG.end_op();
            return Err("cannot find executable");
        }
    }

    // 校验 ELF 头
    let mut idata = inode.lock();
    let mut elf = MaybeUninit::<ElfHeader>::uninit();
    if idata
        .iread(
            Address::KernelMut(elf.as_mut_ptr() as *mut u8),
            0,
            mem::size_of::<ElfHeader>() as u32,
        )
        .is_err()
    {
        drop(idata);
        drop(inode);
        LOG.end_op();
        return Err("cannot read elf header");
    }
    let elf = unsafe { elf.assume_init() };
    if elf.magic != ELF_MAGIC {
        drop(idata);
        drop(inode);
        LOG.end_op();
        return Err("bad elf magic number");
    }

    // 组装新页表，先不交给进程
    let pdata = p.data.get_mut();
    let mut pgt;
    match PageTable::alloc_proc_pagetable(pdata.tf as usize) {
        Some(p) => pgt = p,
        None => {
            drop(idata);
            drop(inode);
            LOG.end_op();
            return Err("no memory for page table");
        }
    }
    let mut proc_size = 0usize;

    // 逐段载入
    let ph_size = mem::size_of::<ProgHeader>() as u32;
    let mut off = elf.phoff as u32;
    for _ in 0..elf.phnum {
        let mut ph = MaybeUninit::<ProgHeader>::uninit();
        if idata
            .iread(Address::KernelMut(ph.as_mut_ptr() as *mut u8), off, ph_size)
            .is_err()
        {
            pgt.dealloc_proc_pagetable(proc_size);
            drop(pgt);
            drop(idata);
            drop(inode);
            LOG.end_op();
            return Err("cannot read program header");
        }
        let ph = unsafe { ph.assume_init() };

        if ph.pg_type != ELF_PROG_LOAD {
            off += ph_size;
            continue;
        }

        if ph.memsz < ph.filesz
            || ph.vaddr + ph.memsz < ph.vaddr
            || ph.vaddr % (PGSIZE as u64) != 0
        {
            pgt.dealloc_proc_pagetable(proc_size);
            drop(pgt);
            drop(idata);
            drop(inode);
            LOG.end_op();
            return Err("bad program header");
        }

        match pgt.uvm_alloc(proc_size, (ph.vaddr + ph.memsz) as usize) {
            Ok(cur_size) => proc_size = cur_size,
            Err(_) => {
                pgt.dealloc_proc_pagetable(proc_size);
                drop(pgt);
                drop(idata);
                drop(inode);
                LOG.end_op();
                return Err("no memory for program segment");
            }
        }

        if load_seg(
            pgt.as_mut(),
            ph.vaddr as usize,
            &mut idata,
            ph.off as u32,
            ph.filesz as u32,
        )
        .is_err()
        {
            pgt.dealloc_proc_pagetable(proc_size);
            drop(pgt);
            drop(idata);
            drop(inode);
            LOG.end_op();
            return Err("cannot load program segment");
        }

        off += ph_size;
    }
    drop(idata);
    drop(inode);
    LOG.end_op();

    // 两页用户栈：低的一页作保护页
    proc_size = pg_round_up(proc_size);
    match pgt.uvm_alloc(proc_size, proc_size + 2 * PGSIZE) {
        Ok(ret_size) => proc_size = ret_size,
        Err(_) => {
            pgt.dealloc_proc_pagetable(proc_size);
            return Err("no memory for user stack");
        }
    }
    pgt.uvm_clear(proc_size - 2 * PGSIZE);
    let mut stack_pointer = proc_size;
    let stack_base = stack_pointer - PGSIZE;

    // 把命令行参数压进用户栈
    let argc = argv.len();
    debug_assert!(argc < MAXARG);
    let mut ustack = [0usize; MAXARG + 1];
    for i in 0..argc {
        let arg_slice = argv[i].as_deref().unwrap();
        let max_pos = arg_slice.iter().position(|x| *x == 0).unwrap();
        let count = max_pos + 1; // 连同结尾的 0
        stack_pointer -= count;
        stack_pointer = align_sp(stack_pointer);
        if stack_pointer < stack_base {
            pgt.dealloc_proc_pagetable(proc_size);
            return Err("args overflow user stack");
        }
        if pgt.copy_out(arg_slice.as_ptr(), stack_pointer, count).is_err() {
            pgt.dealloc_proc_pagetable(proc_size);
            return Err("cannot copy args to user stack");
        }
        ustack[i] = stack_pointer;
    }
    debug_assert!(argc == 0 || ustack[argc - 1] != 0);
    debug_assert_eq!(ustack[argc], 0);
    stack_pointer -= (argc + 1) * mem::size_of::<usize>();
    stack_pointer = align_sp(stack_pointer);
    if stack_pointer < stack_base {
        pgt.dealloc_proc_pagetable(proc_size);
        return Err("args overflow user stack");
    }
    if pgt
        .copy_out(
            ustack.as_ptr() as *const u8,
            stack_pointer,
            (argc + 1) * mem::size_of::<usize>(),
        )
        .is_err()
    {
        pgt.dealloc_proc_pagetable(proc_size);
        return Err("cannot copy args to user stack");
    }

    // 一切就绪，切换进程映像
    let tf = unsafe { pdata.tf.as_mut().unwrap() };
    tf.a1 = stack_pointer;
    let off = path.iter().position(|x| *x != b'/').unwrap();
    let count = min(path.len() - off, pdata.name.len());
    for i in 0..count {
        pdata.name[i] = path[i + off];
    }
    let mut old_pgt = pdata.pagetable.replace(pgt).unwrap();
    let old_size = pdata.sz;
    pdata.sz = proc_size;
    tf.epc = elf.entry as usize;
    tf.sp = stack_pointer;
    old_pgt.dealloc_proc_pagetable(old_size);

    Ok(argc)
}

/// 把文件中 [offset, offset+size) 的内容读到
/// 已映射好的虚拟地址 va 处，va 必须页对齐。
fn load_seg(
    pgt: &mut PageTable,
    va: usize,
    idata: &mut SleepLockGuard<'_, InodeData>,
    offset: u32,
    size: u32,
) -> Result<(), ()> {
    if va % PGSIZE != 0 {
        panic!("load_seg: va {:#x} not page aligned", va);
    }
    let mut va = VirtAddr::try_from(va).unwrap();

    for i in (0..size).step_by(PGSIZE) {
        let pa = match pgt.walk_addr_writable(va) {
            Ok(phys_addr) => phys_addr.into_raw(),
            Err(s) => panic!("load_seg: va {:#x} not mapped: {}", va.into_raw(), s),
        };
        let count = if size - i < PGSIZE as u32 {
            size - i
        } else {
            PGSIZE as u32
        };
        if idata
            .iread(Address::KernelMut(pa as *mut u8), offset + i, count)
            .is_err()
        {
            return Err(());
        }
        va.add_page();
    }

    Ok(())
}

#[inline(always)]
fn align_sp(sp: usize) -> usize {
    sp - sp % 16
}

/// ELF 文件头。
#[repr(C)]
struct ElfHeader {
    /// 魔数，必须等于 [`ELF_MAGIC`]
    magic: u32,
    elf: [u8; 12],
    elf_type: u16,
    machine: u16,
    version: u32,
    /// 程序入口虚拟地址
    entry: u64,
    /// 程序头表在文件中的偏移
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    /// 程序头数量
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// ELF 程序头（一个段）。
#[repr(C)]
struct ProgHeader {
    pg_type: u32,
    flags: u32,
    /// 段内容在文件中的偏移
    off: u64,
    /// 段映射到的虚拟地址
    vaddr: u64,
    paddr: u64,
    /// 文件中的大小
    filesz: u64,
    /// 内存中的大小，>= filesz，差值填零
    memsz: u64,
    align: u64,
}

const ELF_MAGIC: u32 = 0x464C457F;
const ELF_PROG_LOAD: u32 = 1;
