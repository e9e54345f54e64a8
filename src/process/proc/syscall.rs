//! 系统调用实现

use array_macro::array;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::convert::TryInto;
use core::mem;

use crate::consts::{fs::MAX_DIR_SIZE, MAXARG, MAXARGLEN, MAXPATH};
use crate::fs::{File, FileStat, InodeType, Pipe, ICACHE, LOG};
use crate::process::PROC_MANAGER;
use crate::trap;

use super::{elf, Proc};

/// 系统调用的统一结果：成功值放进 a0，失败变成 -1。
pub type SysResult = Result<usize, ()>;

/// 全部系统调用的接口，由 [`Proc`] 实现。
pub trait Syscall {
    fn sys_fork(&mut self) -> SysResult;
    fn sys_exit(&mut self) -> SysResult;
    fn sys_wait(&mut self) -> SysResult;
    fn sys_pipe(&mut self) -> SysResult;
    fn sys_read(&mut self) -> SysResult;
    fn sys_kill(&mut self) -> SysResult;
    fn sys_exec(&mut self) -> SysResult;
    fn sys_fstat(&mut self) -> SysResult;
    fn sys_chdir(&mut self) -> SysResult;
    fn sys_dup(&mut self) -> SysResult;
    fn sys_getpid(&mut self) -> SysResult;
    fn sys_sbrk(&mut self) -> SysResult;
    fn sys_sleep(&mut self) -> SysResult;
    fn sys_uptime(&mut self) -> SysResult;
    fn sys_open(&mut self) -> SysResult;
    fn sys_write(&mut self) -> SysResult;
    fn sys_mknod(&mut self) -> SysResult;
    fn sys_unlink(&mut self) -> SysResult;
    fn sys_link(&mut self) -> SysResult;
    fn sys_mkdir(&mut self) -> SysResult;
    fn sys_close(&mut self) -> SysResult;
    fn sys_sigalarm(&mut self) -> SysResult;
    fn sys_sigreturn(&mut self) -> SysResult;
}

impl Syscall for Proc {
    /// 创建子进程；父进程得到子 pid，子进程得到 0。
    fn sys_fork(&mut self) -> SysResult {
        let ret = self.fork();

        #[cfg(feature = "trace_syscall")]
        println!("[{}].fork() = {:?}", self.excl.lock().pid, ret);

        ret
    }

    /// 终止当前进程，不返回。
    fn sys_exit(&mut self) -> SysResult {
        let exit_status = self.arg_i32(0);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].exit({})", self.excl.lock().pid, exit_status);

        unsafe {
            PROC_MANAGER.exiting(self.index, exit_status);
        }
        unreachable!("process exit");
    }

    /// 等任一子进程退出，退出码写到用户给的地址（非零时）。
    fn sys_wait(&mut self) -> SysResult {
        let addr = self.arg_addr(0);
        let ret = unsafe { PROC_MANAGER.waiting(self.index, addr) };

        #[cfg(feature = "trace_syscall")]
        println!("[{}].wait({:#x}) = {:?}", self.excl.lock().pid, addr, ret);

        ret
    }

    /// 创建管道，读写两端的描述符写回用户数组。
    fn sys_pipe(&mut self) -> SysResult {
        let pipefds_addr = self.arg_addr(0);
        let addr_fdread = pipefds_addr;
        let addr_fdwrite = pipefds_addr + mem::size_of::<u32>();

        let pdata = self.data.get_mut();
        let (fd_read, fd_write) = pdata.alloc_fd2().ok_or(())?;

        let (file_read, file_write) = Pipe::create().ok_or(())?;

        let fd_read_u32: u32 = fd_read.try_into().unwrap();
        let fd_write_u32: u32 = fd_write.try_into().unwrap();
        pdata.copy_out(
            &fd_read_u32 as *const u32 as *const u8,
            addr_fdread,
            mem::size_of::<u32>(),
        )?;
        pdata.copy_out(
            &fd_write_u32 as *const u32 as *const u8,
            addr_fdwrite,
            mem::size_of::<u32>(),
        )?;

        pdata.open_files[fd_read].replace(file_read);
        pdata.open_files[fd_write].replace(file_write);

        Ok(0)
    }

    /// 从文件描述符读 count 字节到用户缓冲区。
    fn sys_read(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let user_addr = self.arg_addr(1);
        let count = self.arg_i32(2);
        if count <= 0 || self.data.get_mut().check_user_addr(user_addr).is_err() {
            return Err(());
        }
        let count = count as u32;

        let file = self.data.get_mut().open_files[fd].as_ref().unwrap();
        let ret = file.fread(user_addr, count);

        #[cfg(feature = "trace_syscall")]
        println!(
            "[{}].read({}, {:#x}, {}) = {:?}",
            self.excl.lock().pid,
            fd,
            user_addr,
            count,
            ret
        );

        ret.map(|count| count as usize)
    }

    /// 向指定 pid 发送终止信号。
    fn sys_kill(&mut self) -> SysResult {
        let pid = self.arg_i32(0);
        if pid < 0 {
            return Err(());
        }
        let ret = unsafe { PROC_MANAGER.kill(pid as usize) };
        ret.map(|()| 0)
    }

    /// 用指定的可执行文件替换当前进程映像。
    fn sys_exec(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;

        let mut result: SysResult = Err(());
        let mut error = "too many arguments";
        let mut uarg: usize;
        let uargv = self.arg_addr(1);
        let mut argv: [Option<Box<[u8; MAXARGLEN]>>; MAXARG] = array![_ => None; MAXARG];
        for i in 0..MAXARG {
            // 第 i 个参数指针
            match self.fetch_addr(uargv + i * mem::size_of::<usize>()) {
                Ok(addr) => uarg = addr,
                Err(s) => {
                    error = s;
                    break;
                }
            }
            if uarg == 0 {
                match elf::load(self, &path, &argv[..i]) {
                    Ok(ret) => result = Ok(ret),
                    Err(s) => error = s,
                }
                break;
            }

            match Box::try_new_zeroed() {
                Ok(b) => unsafe { argv[i] = Some(b.assume_init()) },
                Err(_) => {
                    error = "not enough kernel memory";
                    break;
                }
            }

            if let Err(s) = self.fetch_str(uarg, argv[i].as_deref_mut().unwrap()) {
                error = s;
                break;
            }
        }

        if result.is_err() {
            syscall_warning(error);
        }
        result
    }

    /// 把文件元信息拷到用户空间。
    fn sys_fstat(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let addr = self.arg_addr(1);

        let mut stat = FileStat::uninit();
        let pdata = self.data.get_mut();
        let file = pdata.open_files[fd].as_ref().unwrap();
        file.fstat(&mut stat)?;
        pdata.copy_out(
            &stat as *const FileStat as *const u8,
            addr,
            mem::size_of::<FileStat>(),
        )?;
        Ok(0)
    }

    /// 切换当前工作目录。
    fn sys_chdir(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;

        LOG.begin_op();
        let inode = match ICACHE.namei(&path) {
            Some(i) => i,
            None => {
                LOG.end_op();
                return Err(());
            }
        };
        let idata = inode.lock();
        if idata.get_itype() != InodeType::Directory {
            drop(idata);
            drop(inode);
            LOG.end_op();
            return Err(());
        }
        drop(idata);
        let pdata = self.data.get_mut();
        drop(pdata.cwd.replace(inode));
        LOG.end_op();
        Ok(0)
    }

    /// 复制一个文件描述符。
    fn sys_dup(&mut self) -> SysResult {
        let old_fd = self.arg_fd(0)?;
        let pdata = self.data.get_mut();
        let new_fd = pdata.alloc_fd().ok_or(())?;
        let file = Arc::clone(pdata.open_files[old_fd].as_ref().unwrap());
        let none = pdata.open_files[new_fd].replace(file);
        debug_assert!(none.is_none());
        Ok(new_fd)
    }

    /// 当前进程号。
    fn sys_getpid(&mut self) -> SysResult {
        Ok(self.excl.lock().pid)
    }

    /// 伸缩用户地址空间，返回调整前的大小。
    fn sys_sbrk(&mut self) -> SysResult {
        let increment = self.arg_i32(0);
        self.data.get_mut().sbrk(increment)
    }

    /// 睡过指定的时钟 tick 数，被杀时提前返回错误。
    fn sys_sleep(&mut self) -> SysResult {
        let count = self.arg_i32(0);
        if count < 0 {
            return Err(());
        }
        trap::clock_sleep(self, count as usize).map(|()| 0)
    }

    /// 开机以来的时钟 tick 数。
    fn sys_uptime(&mut self) -> SysResult {
        Ok(trap::clock_read())
    }

    /// 打开（必要时创建）文件，返回描述符。
    fn sys_open(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;
        let flags = self.arg_i32(1);

        let file = File::open(&path, flags).ok_or(())?;
        let pdata = self.data.get_mut();
        let fd = pdata.alloc_fd().ok_or(())?;
        let none = pdata.open_files[fd].replace(file);
        debug_assert!(none.is_none());

        #[cfg(feature = "trace_syscall")]
        println!("[{}].open(..., {:#x}) = {}", self.excl.lock().pid, flags, fd);

        Ok(fd)
    }

    /// 把用户缓冲区的 count 字节写入文件描述符。
    fn sys_write(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let user_addr = self.arg_addr(1);
        let count = self.arg_i32(2);
        if count <= 0 || self.data.get_mut().check_user_addr(user_addr).is_err() {
            return Err(());
        }
        let count = count as u32;

        let file = self.data.get_mut().open_files[fd].as_ref().unwrap();
        let ret = file.fwrite(user_addr, count);

        #[cfg(feature = "trace_syscall")]
        println!(
            "[{}].write({}, {:#x}, {}) = {:?}",
            self.excl.lock().pid,
            fd,
            user_addr,
            count,
            ret
        );

        ret.map(|count| count as usize)
    }

    /// 创建设备节点。
    fn sys_mknod(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;
        let major = self.arg_i32(1);
        let minor = self.arg_i32(2);
        if major < 0 || minor < 0 {
            return Err(());
        }

        LOG.begin_op();
        let ret = ICACHE
            .create(&path, InodeType::Device, major as u16, minor as u16, true)
            .ok_or(());
        LOG.end_op();
        ret.map(|inode| {
            drop(inode);
            0
        })
    }

    /// 删除目录项；最后一个硬链接消失且无人打开时释放文件本体。
    fn sys_unlink(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;

        LOG.begin_op();
        let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
        let dir_inode = match ICACHE.namei_parent(&path, &mut name) {
            Some(i) => i,
            None => {
                LOG.end_op();
                return Err(());
            }
        };
        let mut dir_idata = dir_inode.lock();
        let ret = dir_idata.dir_unlink(&name);
        drop(dir_idata);
        drop(dir_inode);
        LOG.end_op();
        ret.map(|()| 0)
    }

    /// 给既有文件再建一个硬链接。
    fn sys_link(&mut self) -> SysResult {
        let mut old_path: [u8; MAXPATH] = [0; MAXPATH];
        let mut new_path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut old_path).map_err(syscall_warning)?;
        self.arg_str(1, &mut new_path).map_err(syscall_warning)?;

        LOG.begin_op();
        let old_inode = match ICACHE.namei(&old_path) {
            Some(i) => i,
            None => {
                LOG.end_op();
                return Err(());
            }
        };

        // 目录不允许再链接，同时先乐观地把计数加上
        let mut old_idata = old_inode.lock();
        if old_idata.get_itype() == InodeType::Directory {
            drop(old_idata);
            drop(old_inode);
            LOG.end_op();
            return Err(());
        }
        let (old_dev, old_inum) = old_idata.get_dev_inum();
        old_idata.link();
        old_idata.update();
        drop(old_idata);

        let mut name: [u8; MAX_DIR_SIZE] = [0; MAX_DIR_SIZE];
        let mut linked = false;
        if let Some(dir_inode) = ICACHE.namei_parent(&new_path, &mut name) {
            let mut dir_idata = dir_inode.lock();
            let (dir_dev, _) = dir_idata.get_dev_inum();
            if dir_dev == old_dev && dir_idata.dir_link(&name, old_inum).is_ok() {
                linked = true;
            }
            drop(dir_idata);
            drop(dir_inode);
        }

        if !linked {
            // 回退刚才加上的链接数
            let mut old_idata = old_inode.lock();
            old_idata.unlink();
            old_idata.update();
            drop(old_idata);
            drop(old_inode);
            LOG.end_op();
            return Err(());
        }

        drop(old_inode);
        LOG.end_op();
        Ok(0)
    }

    /// 创建目录。
    fn sys_mkdir(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;

        LOG.begin_op();
        let ret = ICACHE
            .create(&path, InodeType::Directory, 0, 0, false)
            .ok_or(());
        LOG.end_op();
        ret.map(|inode| {
            drop(inode);
            0
        })
    }

    /// 关闭文件描述符。
    fn sys_close(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let file = self.data.get_mut().open_files[fd].take();
        debug_assert!(file.is_some());
        drop(file);
        Ok(0)
    }

    /// 设置周期性的用户态报警回调。
    /// sigalarm(0, 0) 撤销报警。
    fn sys_sigalarm(&mut self) -> SysResult {
        let ticks = self.arg_i32(0);
        let handler = self.arg_addr(1);
        if ticks < 0 {
            return Err(());
        }

        let pd = self.data.get_mut();
        pd.alarm_period = ticks as usize;
        pd.alarm_handler = handler;
        pd.alarm_ticks = 0;
        Ok(0)
    }

    /// 从报警处理函数返回：整帧恢复快照并解除重入抑制。
    /// 返回值取恢复后的 a0，保证被打断处的寄存器原样继续。
    fn sys_sigreturn(&mut self) -> SysResult {
        let pd = self.data.get_mut();
        if !pd.in_alarm {
            return Err(());
        }
        unsafe {
            core::ptr::copy_nonoverlapping(pd.alarm_tf as *const super::TrapFrame, pd.tf, 1);
        }
        pd.in_alarm = false;
        let a0 = unsafe { pd.tf.as_ref().unwrap().a0 };
        Ok(a0)
    }
}

/// 把内部错误串打出来，再折叠成 ()。
/// 只在带 kernel_warning 特性编译时出声。
fn syscall_warning<T: core::fmt::Display>(s: T) {
    #[cfg(feature = "kernel_warning")]
    println!("kernel warning: syscall: {}", s);
    #[cfg(not(feature = "kernel_warning"))]
    let _ = s;
}
