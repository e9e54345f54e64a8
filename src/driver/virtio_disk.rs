//! virtio-blk 磁盘驱动（legacy MMIO 接口）
//!
//! 队列的三个区域按 virtio 规范排布：
//! 描述符表、可用环（driver 区）、已用环（device 区），
//! 用填充结构保证各自页对齐。一次块请求占三个描述符：
//! 请求头、数据缓冲、状态字节。

use array_macro::array;

use core::convert::{TryFrom, TryInto};
use core::option::Option;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::consts::{fs::BSIZE, PGSHIFT, PGSIZE, VIRTIO0};
use crate::fs::Buf;
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

pub static DISK: SpinLock<Disk> = SpinLock::new(Disk::new(), "virtio disk");

/// 磁盘驱动的全部状态，整体按页对齐。
#[repr(C, align(4096))]
pub struct Disk {
    // 第一页：描述符表与可用环
    pad1: Pad,
    desc: [VQDesc; NUM],
    avail: VQAvail,
    // 第二页：已用环
    pad2: Pad,
    used: VQUsed,
    // 余下是驱动自己的记账
    pad3: Pad,
    free: [bool; NUM],
    used_idx: u16,
    info: [Info; NUM],
    ops: [VirtIOBlkReq; NUM],
}

impl Disk {
    const fn new() -> Self {
        Self {
            pad1: Pad::new(),
            desc: array![_ => VQDesc::new(); NUM],
            avail: VQAvail::new(),
            pad2: Pad::new(),
            pad3: Pad::new(),
            used: VQUsed::new(),
            free: [false; NUM],
            used_idx: 0,
            info: array![_ => Info::new(); NUM],
            ops: array![_ => VirtIOBlkReq::new(); NUM],
        }
    }

    /// 设备初始化：验明身份、协商特征、配置 0 号队列。
    ///
    /// # 安全性
    /// 启动时调用一次，期间独占磁盘结构。
    pub unsafe fn init(&mut self) {
        debug_assert_eq!((&self.desc as *const _ as usize) % PGSIZE, 0);
        debug_assert_eq!((&self.used as *const _ as usize) % PGSIZE, 0);
        debug_assert_eq!((&self.free as *const _ as usize) % PGSIZE, 0);

        if read(VIRTIO_MMIO_MAGIC_VALUE) != 0x74726976
            || read(VIRTIO_MMIO_VERSION) != 1
            || read(VIRTIO_MMIO_DEVICE_ID) != 2
            || read(VIRTIO_MMIO_VENDOR_ID) != 0x554d4551
        {
            panic!("could not find virtio disk");
        }

        // 依次点亮 ACKNOWLEDGE 与 DRIVER
        let mut status: u32 = 0;
        status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
        write(VIRTIO_MMIO_STATUS, status);
        status |= VIRTIO_CONFIG_S_DRIVER;
        write(VIRTIO_MMIO_STATUS, status);

        // 特征协商：用不上的全部关掉
        let mut features: u32 = read(VIRTIO_MMIO_DEVICE_FEATURES);
        features &= !(1u32 << VIRTIO_BLK_F_RO);
        features &= !(1u32 << VIRTIO_BLK_F_SCSI);
        features &= !(1u32 << VIRTIO_BLK_F_CONFIG_WCE);
        features &= !(1u32 << VIRTIO_BLK_F_MQ);
        features &= !(1u32 << VIRTIO_F_ANY_LAYOUT);
        features &= !(1u32 << VIRTIO_RING_F_EVENT_IDX);
        features &= !(1u32 << VIRTIO_RING_F_INDIRECT_DESC);
        write(VIRTIO_MMIO_DRIVER_FEATURES, features);

        status |= VIRTIO_CONFIG_S_FEATURES_OK;
        write(VIRTIO_MMIO_STATUS, status);

        status |= VIRTIO_CONFIG_S_DRIVER_OK;
        write(VIRTIO_MMIO_STATUS, status);

        write(VIRTIO_MMIO_GUEST_PAGE_SIZE, PGSIZE as u32);

        // 0 号队列
        write(VIRTIO_MMIO_QUEUE_SEL, 0);
        let max = read(VIRTIO_MMIO_QUEUE_NUM_MAX);
        if max == 0 {
            panic!("virtio disk has no queue 0");
        }
        if max < NUM as u32 {
            panic!("virtio disk queue too short, max={}", max);
        }
        write(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);
        let pfn: usize = (self as *const Disk as usize) >> PGSHIFT;
        write(VIRTIO_MMIO_QUEUE_PFN, u32::try_from(pfn).unwrap());

        self.free.iter_mut().for_each(|f| *f = true);
    }

    /// 连续申请三个描述符，不够就整体回退。
    fn alloc3_desc(&mut self, idx: &mut [usize; 3]) -> bool {
        for i in 0..idx.len() {
            match self.alloc_desc() {
                Some(ix) => idx[i] = ix,
                None => {
                    for j in 0..i {
                        self.free_desc(idx[j]);
                    }
                    return false;
                }
            }
        }
        true
    }

    fn alloc_desc(&mut self) -> Option<usize> {
        for i in 0..NUM {
            if self.free[i] {
                self.free[i] = false;
                return Some(i);
            }
        }
        None
    }

    /// 归还一个描述符并唤醒等描述符的请求方。
    fn free_desc(&mut self, i: usize) {
        if i >= NUM || self.free[i] {
            panic!("virtio disk: bad desc index");
        }
        self.desc[i].addr = 0;
        self.desc[i].len = 0;
        self.desc[i].flags = 0;
        self.desc[i].next = 0;
        self.free[i] = true;
        unsafe {
            PROC_MANAGER.wakeup(&self.free[0] as *const bool as usize);
        }
    }

    /// 沿 NEXT 标志归还整条描述符链。
    fn free_chain(&mut self, mut i: usize) {
        loop {
            let flag = self.desc[i].flags;
            let next = self.desc[i].next;
            self.free_desc(i);
            if flag & VRING_DESC_F_NEXT != 0 {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    /// 磁盘中断：确认中断、收割已用环、唤醒等结果的进程。
    /// 设备报出的非零状态没有重试路径，直接 panic。
    pub fn intr(&mut self) {
        unsafe {
            let intr_stat = read(VIRTIO_MMIO_INTERRUPT_STATUS);
            write(VIRTIO_MMIO_INTERRUPT_ACK, intr_stat & 0x3);
        }

        fence(Ordering::SeqCst);

        while self.used_idx != self.used.idx {
            fence(Ordering::SeqCst);
            let id = self.used.ring[self.used_idx as usize % NUM].id as usize;

            if self.info[id].status != 0 {
                panic!("virtio disk: bad request status");
            }

            let buf_channel = self.info[id]
                .buf_channel
                .expect("virtio disk intr: no channel to wake");
            self.info[id].in_flight = false;
            unsafe {
                PROC_MANAGER.wakeup(buf_channel);
            }

            self.used_idx += 1;
        }
    }
}

impl SpinLock<Disk> {
    /// 读写一个块，writing 为真表示写。
    ///
    /// 组好三段描述符链放进可用环、敲门铃，
    /// 然后以缓冲区数据地址为通道睡等中断收割。
    pub fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        let mut guard = self.lock();
        let buf_raw_data = buf.raw_data_mut();

        let mut idx: [usize; 3] = [0; 3];
        loop {
            if guard.alloc3_desc(&mut idx) {
                break;
            } else {
                unsafe {
                    CPU_MANAGER
                        .my_proc()
                        .sleep(&guard.free[0] as *const bool as usize, guard);
                }
                guard = self.lock();
            }
        }

        // 请求头
        let buf0 = &mut guard.ops[idx[0]];
        buf0.type_ = if writing { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN };
        buf0.reserved = 0;
        buf0.sector = (buf.read_blockno() as usize * (BSIZE / 512)) as u64;

        guard.desc[idx[0]].addr = buf0 as *mut _ as u64;
        guard.desc[idx[0]].len = core::mem::size_of::<VirtIOBlkReq>().try_into().unwrap();
        guard.desc[idx[0]].flags = VRING_DESC_F_NEXT;
        guard.desc[idx[0]].next = idx[1].try_into().unwrap();

        // 数据缓冲
        guard.desc[idx[1]].addr = buf_raw_data as u64;
        guard.desc[idx[1]].len = BSIZE.try_into().unwrap();
        guard.desc[idx[1]].flags = if writing { 0 } else { VRING_DESC_F_WRITE };
        guard.desc[idx[1]].flags |= VRING_DESC_F_NEXT;
        guard.desc[idx[1]].next = idx[2].try_into().unwrap();

        // 状态字节
        guard.info[idx[0]].status = 0xff;
        guard.desc[idx[2]].addr = &mut guard.info[idx[0]].status as *mut _ as u64;
        guard.desc[idx[2]].len = 1;
        guard.desc[idx[2]].flags = VRING_DESC_F_WRITE;
        guard.desc[idx[2]].next = 0;

        // 记下唤醒通道，中断处理程序取用
        guard.info[idx[0]].in_flight = true;
        guard.info[idx[0]].buf_channel = Some(buf_raw_data as usize);

        {
            let i = guard.avail.idx as usize % NUM;
            guard.avail.ring[i] = idx[0].try_into().unwrap();
        }

        fence(Ordering::SeqCst);

        guard.avail.idx += 1;

        fence(Ordering::SeqCst);

        unsafe {
            write(VIRTIO_MMIO_QUEUE_NOTIFY, 0);
        }

        // 等设备做完
        while guard.info[idx[0]].in_flight {
            unsafe {
                CPU_MANAGER.my_proc().sleep(buf_raw_data as usize, guard);
            }
            guard = self.lock();
        }

        let buf_channel = guard.info[idx[0]].buf_channel.take();
        debug_assert_eq!(buf_channel.unwrap(), buf_raw_data as usize);
        guard.free_chain(idx[0]);

        drop(guard);
    }
}

/// 对齐用的零大小填充。
#[repr(C, align(4096))]
struct Pad();

impl Pad {
    const fn new() -> Self {
        Self()
    }
}

#[repr(C, align(16))]
struct VQDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

impl VQDesc {
    const fn new() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        }
    }
}

#[repr(C, align(2))]
struct VQAvail {
    flags: u16,
    idx: u16,
    ring: [u16; NUM],
    unused: u16,
}

impl VQAvail {
    const fn new() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: [0; NUM],
            unused: 0,
        }
    }
}

#[repr(C, align(4))]
struct VQUsed {
    flags: u16,
    idx: u16,
    ring: [VQUsedElem; NUM],
}

impl VQUsed {
    const fn new() -> Self {
        Self {
            flags: 0,
            idx: 0,
            ring: array![_ => VQUsedElem::new(); NUM],
        }
    }
}

#[repr(C)]
struct VQUsedElem {
    id: u32,
    len: u32,
}

impl VQUsedElem {
    const fn new() -> Self {
        Self { id: 0, len: 0 }
    }
}

#[repr(C)]
struct Info {
    /// 发起方的睡眠通道，中断处理程序凭它唤醒
    buf_channel: Option<usize>,
    status: u8,
    /// 缓冲区是否仍在设备手里
    in_flight: bool,
}

impl Info {
    const fn new() -> Self {
        Self {
            buf_channel: None,
            status: 0,
            in_flight: false,
        }
    }
}

#[repr(C)]
struct VirtIOBlkReq {
    type_: u32,
    reserved: u32,
    sector: u64,
}

impl VirtIOBlkReq {
    const fn new() -> Self {
        Self {
            type_: 0,
            reserved: 0,
            sector: 0,
        }
    }
}

// virtio mmio 寄存器偏移，见 qemu 的 virtio_mmio.h
const VIRTIO_MMIO_MAGIC_VALUE: usize = 0x000;
const VIRTIO_MMIO_VERSION: usize = 0x004;
const VIRTIO_MMIO_DEVICE_ID: usize = 0x008;
const VIRTIO_MMIO_VENDOR_ID: usize = 0x00c;
const VIRTIO_MMIO_DEVICE_FEATURES: usize = 0x010;
const VIRTIO_MMIO_DRIVER_FEATURES: usize = 0x020;
const VIRTIO_MMIO_GUEST_PAGE_SIZE: usize = 0x028;
const VIRTIO_MMIO_QUEUE_SEL: usize = 0x030;
const VIRTIO_MMIO_QUEUE_NUM_MAX: usize = 0x034;
const VIRTIO_MMIO_QUEUE_NUM: usize = 0x038;
const VIRTIO_MMIO_QUEUE_PFN: usize = 0x040;
const VIRTIO_MMIO_QUEUE_NOTIFY: usize = 0x050;
const VIRTIO_MMIO_INTERRUPT_STATUS: usize = 0x060;
const VIRTIO_MMIO_INTERRUPT_ACK: usize = 0x064;
const VIRTIO_MMIO_STATUS: usize = 0x070;

// 状态寄存器位，见 qemu 的 virtio_config.h
const VIRTIO_CONFIG_S_ACKNOWLEDGE: u32 = 1;
const VIRTIO_CONFIG_S_DRIVER: u32 = 2;
const VIRTIO_CONFIG_S_DRIVER_OK: u32 = 4;
const VIRTIO_CONFIG_S_FEATURES_OK: u32 = 8;

// 设备特征位
const VIRTIO_BLK_F_RO: u8 = 5;
const VIRTIO_BLK_F_SCSI: u8 = 7;
const VIRTIO_BLK_F_CONFIG_WCE: u8 = 11;
const VIRTIO_BLK_F_MQ: u8 = 12;
const VIRTIO_F_ANY_LAYOUT: u8 = 27;
const VIRTIO_RING_F_INDIRECT_DESC: u8 = 28;
const VIRTIO_RING_F_EVENT_IDX: u8 = 29;

// 描述符标志位
const VRING_DESC_F_NEXT: u16 = 1;
const VRING_DESC_F_WRITE: u16 = 2;

// 请求类型
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

// 描述符数量，须为 2 的幂
const NUM: usize = 8;

#[inline]
unsafe fn read(offset: usize) -> u32 {
    let src = (Into::<usize>::into(VIRTIO0) + offset) as *const u32;
    ptr::read_volatile(src)
}

#[inline]
unsafe fn write(offset: usize, data: u32) {
    let dst = (Into::<usize>::into(VIRTIO0) + offset) as *mut u32;
    ptr::write_volatile(dst, data);
}
