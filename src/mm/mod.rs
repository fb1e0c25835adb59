//! 内存管理模块

use crate::consts::PGSIZE;

pub use addr::{Addr, PhysAddr};
pub use kalloc::{KallocError, Kmem, KmemConfig};

mod addr;
pub mod kalloc;
mod list;

/// 单页大小（4096字节）的内存页结构
///
/// # 内存布局
/// - `#[repr(C, align(4096)]` 确保页对齐
/// - 固定大小：`PGSIZE`
///
/// 宿主环境下可以用 `Vec<RawSinglePage>` 充当交给 [`Kmem`] 管理的物理内存。
#[repr(C, align(4096))]
pub struct RawSinglePage {
    data: [u8; PGSIZE],
}

impl RawSinglePage {
    pub const fn new() -> Self {
        Self { data: [0; PGSIZE] }
    }
}

impl Default for RawSinglePage {
    fn default() -> Self {
        Self::new()
    }
}

/// 向上取整到页边界
///
/// # 功能说明
/// 计算大于等于`address`的最小页对齐地址
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 向下取整到页边界
///
/// # 功能说明
/// 计算小于等于`address`的最大页对齐地址
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}
