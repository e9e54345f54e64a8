//! 监督态陷阱原因寄存器 scause

const INTERRUPT: usize = 1 << 63;
const INTERRUPT_SUPERVISOR_SOFTWARE: usize = INTERRUPT + 1;
const INTERRUPT_SUPERVISOR_EXTERNAL: usize = INTERRUPT + 9;
const EXCEPTION_ECALL_USER: usize = 8;
const EXCEPTION_LOAD_PAGE_FAULT: usize = 13;
const EXCEPTION_STORE_PAGE_FAULT: usize = 15;

/// 内核关心的几类陷阱原因。
///
/// 软件中断由机器态时钟入口转发而来，即时钟事件；
/// 写缺页单列出来，由写时复制路径先行处理。
pub enum ScauseType {
    IntSSoft,
    IntSExt,
    ExcUEcall,
    ExcLoadPageFault,
    ExcStorePageFault,
    Unknown,
}

#[inline]
pub fn read() -> usize {
    let ret: usize;
    unsafe {
        core::arch::asm!("csrr {}, scause", out(reg) ret);
    }
    ret
}

pub fn get_scause() -> ScauseType {
    match read() {
        INTERRUPT_SUPERVISOR_SOFTWARE => ScauseType::IntSSoft,
        INTERRUPT_SUPERVISOR_EXTERNAL => ScauseType::IntSExt,
        EXCEPTION_ECALL_USER => ScauseType::ExcUEcall,
        EXCEPTION_LOAD_PAGE_FAULT => ScauseType::ExcLoadPageFault,
        EXCEPTION_STORE_PAGE_FAULT => ScauseType::ExcStorePageFault,
        _ => ScauseType::Unknown,
    }
}
