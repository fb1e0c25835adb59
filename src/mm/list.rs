//! 空闲页链表
//!
//! 链表中保存的是页在分配器管理区间内的序号，而不是地址本身。
//! 容量在初始化时一次性预留为全部页数，之后在自旋锁内的压入与弹出都不会再分配内存。

use alloc::vec::Vec;

/// 后进先出的空闲页栈
pub struct FreeList {
    pages: Vec<u32>,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// 预留可以容纳 `npages` 个页的空间
    pub fn reserve(&mut self, npages: usize) {
        self.pages.reserve_exact(npages.saturating_sub(self.pages.len()));
    }

    #[inline]
    pub fn push(&mut self, page: u32) {
        self.pages.push(page);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<u32> {
        self.pages.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// 从 `victim` 的栈顶搬运最多 `count` 个页到本链表，返回实际搬运的数量
    pub fn steal_from(&mut self, victim: &mut FreeList, count: usize) -> usize {
        let n = count.min(victim.len());
        let at = victim.len() - n;
        // 保持搬运前后的相对顺序，先被弹出的仍是原来栈顶的页
        self.pages.extend(victim.pages.drain(at..));
        n
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
