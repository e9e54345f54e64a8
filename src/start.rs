//! 机器态启动：每个 hart 在 entry.S 之后进入这里

use core::arch::asm;
use core::convert::Into;

use crate::consts::{CLINT_MTIMECMP, NCPU};
use crate::register::{
    clint, medeleg, mepc, mhartid, mideleg, mie, mscratch, mstatus, mtvec, satp, sie, tp,
};
use crate::rmain::rust_main;

/// 每个 hart 的机器态 scratch 区，供 timervec 使用。
///
/// 每 hart 占 32 个 usize，实际只用前 6 项：
/// - \[0..3\] timervec 暂存寄存器的空间
/// - \[4\] 本 hart 的 CLINT MTIMECMP 寄存器地址
/// - \[5\] 期望的时钟中断间隔（周期数）
static mut MSCRATCH0: [usize; NCPU * 32] = [0; NCPU * 32];

/// 机器态入口。
///
/// 把异常与中断全部委托给监督态，放开物理内存保护，
/// 配置好每 hart 的时钟中断，然后 mret 进入监督态的 rust_main。
#[no_mangle]
pub unsafe fn start() -> ! {
    // mret 之后落在监督态
    mstatus::set_mpp(mstatus::MPP::Supervisor);

    // mret 的目的地
    mepc::write(rust_main as usize);

    // 启动阶段关闭分页
    satp::write(0);

    // 异常与中断全部委托给监督态
    medeleg::write(0xffff);
    mideleg::write(0xffff);
    sie::intr_on();

    // 放开全部物理地址的 PMP 检查
    asm!(
        "
        li t0, -1
        csrw pmpaddr0, t0
        li t0, 0x7f
        csrw pmpcfg0, t0
    "
    );

    // 配置时钟中断
    timer_init();

    // hartid 存进 tp，之后 cpu_id() 都从这里取
    let id = mhartid::read();
    tp::write(id);

    asm!("mret");

    // 此处不可 panic 或打印，控制台尚未建立
    loop {}
}

/// 为本 hart 配置机器态时钟中断。
///
/// 时钟中断由汇编里的 timervec 处理，它把事件转成监督态软件中断
/// 交给内核，同时把 mtimecmp 推后一个间隔。
unsafe fn timer_init() {
    let id = mhartid::read();

    // qemu 上大约 0.1 秒一次
    let interval: u64 = 1_000_000;
    clint::add_mtimecmp(id, interval);

    // 填好 timervec 需要的 scratch 信息
    let offset = 32 * id;
    MSCRATCH0[offset + 4] = 8 * id + Into::<usize>::into(CLINT_MTIMECMP);
    MSCRATCH0[offset + 5] = interval as usize;
    mscratch::write(MSCRATCH0.as_ptr() as usize + offset * core::mem::size_of::<usize>());

    extern "C" {
        fn timervec();
    }
    mtvec::write(timervec as usize);

    mstatus::set_mie();
    mie::set_mtie();
}
