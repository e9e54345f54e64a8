//! 内核全局常量：平台内存布局、调度与文件系统参数

use core::ops::Add;

/// 编译期常量地址。
///
/// 平台上固定的物理/虚拟地址（MMIO 基址、跳板页位置等）统一用该
/// 新类型表示，避免和普通的 usize 运算混在一起；
/// 需要参与运算时再显式转换。
#[derive(Clone, Copy, Debug)]
pub struct ConstAddr(usize);

impl ConstAddr {
    const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// 编译期的地址偏移。
    pub const fn const_add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl From<ConstAddr> for usize {
    fn from(c: ConstAddr) -> Self {
        c.0
    }
}

impl Add<usize> for ConstAddr {
    type Output = Self;

    fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

/// 支持的最大 hart 数
pub const NCPU: usize = 8;
/// 进程表容量
pub const NPROC: usize = 64;

/// 页大小与页内偏移位数
pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;
/// Sv39 每级页号宽度与掩码
pub const PGMASKLEN: usize = 9;
pub const PGMASK: usize = 0x1ff;
/// 页表项中标志位所占的低位数
pub const SV39FLAGLEN: usize = 10;
/// satp 的 Sv39 模式位
pub const SATP_SV39: usize = 8 << 60;

/// 伙伴系统的最小分配单元
pub const LEAF_SIZE: usize = 16;

/// Sv39 虚拟地址上限（最高位须为 0，再留一位防溢出回绕）
pub const MAXVA: ConstAddr = ConstAddr::new(1 << (9 + 9 + 9 + 12 - 1));

/// 跳板页：所有地址空间中的最高一页
pub const TRAMPOLINE: ConstAddr = ConstAddr::new(MAXVA.0 - PGSIZE);
/// 陷阱帧：用户地址空间中跳板页的下一页
pub const TRAPFRAME: ConstAddr = ConstAddr::new(TRAMPOLINE.0 - PGSIZE);

/// 用户代码段起始虚拟地址
pub const USERTEXT: ConstAddr = ConstAddr::new(0);

/// 内核装载的物理基址，qemu -machine virt 从这里起跳
pub const KERNBASE: ConstAddr = ConstAddr::new(0x8000_0000);
/// 物理内存上限：内核基址之后 128 MiB
pub const PHYSTOP: ConstAddr = ConstAddr::new(KERNBASE.0 + 128 * 1024 * 1024);

/// 物理页帧总数（参考计数表的容量）
pub const NFRAME: usize = (PHYSTOP.0 - KERNBASE.0) / PGSIZE;

// qemu virt 平台的 MMIO 布局
pub const UART0: ConstAddr = ConstAddr::new(0x1000_0000);
pub const UART0_MAP_SIZE: usize = PGSIZE;
pub const UART0_IRQ: usize = 10;

pub const VIRTIO0: ConstAddr = ConstAddr::new(0x1000_1000);
pub const VIRTIO0_MAP_SIZE: usize = PGSIZE;
pub const VIRTIO0_IRQ: usize = 1;

pub const CLINT: ConstAddr = ConstAddr::new(0x200_0000);
pub const CLINT_MAP_SIZE: usize = 0x10000;
pub const CLINT_MTIMECMP: ConstAddr = CLINT.const_add(0x4000);
pub const CLINT_MTIME: ConstAddr = CLINT.const_add(0xbff8);

pub const PLIC: ConstAddr = ConstAddr::new(0xc00_0000);
pub const PLIC_MAP_SIZE: usize = 0x40_0000;

/// exec 的路径与参数上限
pub const MAXPATH: usize = 128;
pub const MAXARG: usize = 16;
pub const MAXARGLEN: usize = 64;

pub mod fs {
    /// 根文件系统所在的设备号与根 inode 编号
    pub const ROOTDEV: u32 = 1;
    pub const ROOTINUM: u32 = 1;
    /// 根目录路径，作为字节串传给路径解析
    pub const ROOTIPATH: [u8; 2] = *b"/\0";

    /// 磁盘块大小
    pub const BSIZE: usize = 1024;
    /// 超级块魔数
    pub const FSMAGIC: u32 = 0x10203040;

    /// 每个 inode 的直接块数与一级间接块可容纳的块号数
    pub const NDIRECT: usize = 12;
    pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();
    /// 单个文件的最大字节数
    pub const MAX_FILE_SIZE: usize = (NDIRECT + NINDIRECT) * BSIZE;

    /// 目录项中名字字段的长度
    pub const MAX_DIR_SIZE: usize = 14;

    /// 每个位图块管理的块数
    pub const BPB: u32 = (BSIZE * 8) as u32;

    /// 内存中 inode 缓存的容量
    pub const NINODE: usize = 50;
    /// 块缓冲区的数量
    pub const NBUF: usize = 30;

    /// 单次文件系统调用最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;
    /// 磁盘日志区块数（含日志头块）
    pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

    /// 每个进程可同时打开的文件数
    pub const NFILE: usize = 16;

    /// 管道环形缓冲区的容量
    pub const PIPESIZE: usize = 512;
    pub const PIPESIZE_U32: u32 = PIPESIZE as u32;
}

pub mod driver {
    /// 设备表容量（以主设备号索引）
    pub const NDEV: usize = 10;
    /// 控制台的主设备号
    pub const CONSOLE: usize = 1;

    /// UART 发送环与控制台输入环的容量
    pub const UART_BUF: usize = 32;
    pub const CONSOLE_BUF: usize = 128;

    // 控制台关心的控制字符
    pub const CTRL_EOT: u8 = 0x04; // Ctrl-D，文件结束
    pub const CTRL_BS: u8 = 0x08; // 退格
    pub const CTRL_LF: u8 = 0x0a; // 换行
    pub const CTRL_CR: u8 = 0x0d; // 回车
    pub const CTRL_PRINT_PROCESS: u8 = 0x10; // Ctrl-P
    pub const CTRL_BS_LINE: u8 = 0x15; // Ctrl-U，删除整行
    pub const CTRL_DEL: u8 = 0x7f; // Delete
}
