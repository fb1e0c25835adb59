//! 以内存模拟的块设备

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::fs::BSIZE;
use crate::fs::{Buf, BufData};
use crate::spinlock::SpinLock;

use super::BlockDevice;

/// 只服务单个设备号的内存磁盘，并统计读写次数
pub struct RamDisk {
    dev: u32,
    blocks: SpinLock<Vec<BufData>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// 创建设备号为 `dev`、共 `nblocks` 个全零块的内存磁盘
    pub fn new(dev: u32, nblocks: usize) -> Self {
        let mut blocks = Vec::with_capacity(nblocks);
        blocks.resize_with(nblocks, BufData::new);
        Self {
            dev,
            blocks: SpinLock::new(blocks, "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn nblocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// 直接写入块内容，不经过缓存，也不计入写次数
    pub fn load(&self, blockno: u32, content: &[u8]) {
        let mut blocks = self.blocks.lock();
        let block = &mut blocks[blockno as usize];
        let n = content.len().min(BSIZE);
        block[..n].copy_from_slice(&content[..n]);
    }

    /// 读取块内容的副本，不经过缓存，也不计入读次数
    pub fn peek(&self, blockno: u32) -> BufData {
        let blocks = self.blocks.lock();
        blocks[blockno as usize].clone()
    }

    /// 至今为止经由 `rw` 完成的读次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, buf: &mut Buf<'_>, writing: bool) {
        if buf.dev() != self.dev {
            panic!("ramdisk: no device {}", buf.dev());
        }
        let blockno = buf.blockno();
        let mut blocks = self.blocks.lock();
        if blockno as usize >= blocks.len() {
            panic!("ramdisk: blockno {} out of range", blockno);
        }
        let block = &mut blocks[blockno as usize];
        if writing {
            block.copy_from_slice(buf.data());
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            buf.data_mut().copy_from_slice(&block[..]);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }
}
