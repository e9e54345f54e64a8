//! 设备驱动：串口、控制台与 virtio 磁盘

use core::sync::atomic::AtomicBool;

use crate::consts::driver::NDEV;
use crate::mm::Address;

pub mod console;
pub mod uart;
pub mod virtio_disk;

/// 有任何 hart panic 过则置位，输出路径据此放弃加锁。
pub(crate) static PANICKED: AtomicBool = AtomicBool::new(false);

/// 按主设备号索引的设备函数表。
/// 目前只有控制台（主设备号 1）。
pub static DEVICES: [Option<Device>; NDEV] = [
    /* 0 */ None,
    /* 1 */
    Some(Device {
        read: console::read,
        write: console::write,
    }),
    /* 2 */ None,
    /* 3 */ None,
    /* 4 */ None,
    /* 5 */ None,
    /* 6 */ None,
    /* 7 */ None,
    /* 8 */ None,
    /* 9 */ None,
];

pub struct Device {
    /// 从设备读 count 字节写到 [Address]
    pub read: fn(Address, u32) -> Result<u32, ()>,
    /// 把 [Address] 处的 count 字节写进设备
    pub write: fn(Address, u32) -> Result<u32, ()>,
}
