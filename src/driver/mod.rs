//! 设备驱动模块，定义缓冲区缓存所依赖的块设备接口

use alloc::sync::Arc;

use crate::fs::Buf;

pub mod ramdisk;

pub use ramdisk::RamDisk;

/// 块设备：按 `(dev, blockno)` 同步读写一个块。
///
/// 调用 [`BlockDevice::rw`] 时调用者必须持有 `buf` 的睡眠锁，
/// 读写完成前函数不返回，实现可以任意长时间地阻塞。
pub trait BlockDevice: Send + Sync {
    /// - `writing == false`：把磁盘上的块读入 `buf` 的数据区；
    /// - `writing == true`：把 `buf` 的数据区写回磁盘。
    fn rw(&self, buf: &mut Buf<'_>, writing: bool);
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        (**self).rw(buf, writing)
    }
}
