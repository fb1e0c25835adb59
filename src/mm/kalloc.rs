//! 物理页分配器
//!
//! 以整页（4096 字节）为单位管理内核镜像之后的物理内存，供页表、进程内核栈、
//! 管道缓冲区以及写时复制（copy-on-write）使用。
//! - 每个处理器拥有自己的空闲链表，分配与释放优先在本处理器的链表上进行；
//! - 本地链表为空时，依次从其他处理器的链表批量窃取空闲页；
//! - 所有页共享一张引用计数表，计数从 1 降到 0 时页才回到空闲链表。

use alloc::vec;
use alloc::vec::Vec;

use array_macro::array;
use core::ptr;

use crate::consts::{KALLOC_FILL, KFREE_FILL, KMEM_STEAL_BATCH, NCPU, PGSIZE};
use crate::process::{cpu_id, pop_off, push_off};
use crate::spinlock::{SpinLock, SpinLockGuard};

use super::addr::{Addr, PhysAddr};
use super::list::FreeList;
use super::{pg_round_down, pg_round_up};

/// 分配器的运行时配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmemConfig {
    /// 空闲链表的数量，为 1 时退化为单一全局链表
    pub ncpu: usize,
    /// 单次窃取最多搬运的页数
    pub steal_batch: usize,
}

impl Default for KmemConfig {
    fn default() -> Self {
        Self {
            ncpu: NCPU,
            steal_batch: KMEM_STEAL_BATCH,
        }
    }
}

/// 可恢复的分配失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KallocError {
    #[error("out of physical memory")]
    OutOfMemory,
}

/// 物理页分配器。
///
/// 在内核启动时构造一次，之后由所有处理器并发使用。
///
/// 锁的获取顺序：
/// - `refs` 之后才可以获取某个空闲链表的锁，反之不行；
/// - 同时持有两个空闲链表时，总是先锁处理器编号较小的那个。
pub struct Kmem {
    /// 第一个受管理页的地址
    base: usize,
    npages: usize,
    ncpu: usize,
    steal_batch: usize,

    /// 每个处理器的空闲链表，只有前 `ncpu` 个被使用
    lists: [SpinLock<FreeList>; NCPU],

    /// 每个页的引用计数，下标为页序号
    refs: SpinLock<Vec<u32>>,
}

impl Kmem {
    /// 接管 `[start, end)` 内的全部整页。
    ///
    /// # 功能说明
    /// 把 `start` 向上、`end` 向下取整到页边界，用释放填充字节擦除每一页，
    /// 并把这些页按地址连续地均分给 `config.ncpu` 个空闲链表。
    /// 链表中地址较低的页先被分配。
    ///
    /// # 参数
    /// - `start`: 可用物理内存的起点，通常是内核镜像的结束地址；
    /// - `end`: 可用物理内存的终点（不含）；
    /// - `config`: 链表数量与窃取批量。
    ///
    /// # 可能的错误
    /// `ncpu` 为 0 或超过 `NCPU`，或 `steal_batch` 为 0 时触发 panic。
    ///
    /// # 安全性
    /// 区间内的内存从此只归分配器所有，调用者不得再以其他方式访问，
    /// 且该区间在分配器的整个生命周期内都必须有效、可写。
    pub unsafe fn new(start: usize, end: usize, config: KmemConfig) -> Self {
        if config.ncpu == 0 || config.ncpu > NCPU || config.steal_batch == 0 {
            panic!("kinit: bad config {:?}", config);
        }

        let base = pg_round_up(start);
        let top = pg_round_down(end);
        let npages = if top > base { (top - base) / PGSIZE } else { 0 };
        if npages > u32::MAX as usize {
            panic!("kinit: too many pages {}", npages);
        }

        let mut lists = array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU];
        for (cpu, list) in lists.iter_mut().take(config.ncpu).enumerate() {
            let list = list.get_mut();
            // 窃取时链表可能暂时容纳全部页
            list.reserve(npages);
            let lo = cpu * npages / config.ncpu;
            let hi = (cpu + 1) * npages / config.ncpu;
            for page in (lo..hi).rev() {
                ptr::write_bytes((base + page * PGSIZE) as *mut u8, KFREE_FILL, PGSIZE);
                list.push(page as u32);
            }
            #[cfg(feature = "verbose_init_info")]
            log::info!("kmem: cpu {} owns pages [{}, {})", cpu, lo, hi);
        }

        log::info!(
            "kmem: {} pages in [{:#x}, {:#x}) over {} free lists",
            npages,
            base,
            top,
            config.ncpu
        );

        Self {
            base,
            npages,
            ncpu: config.ncpu,
            steal_batch: config.steal_batch,
            lists,
            refs: SpinLock::new(vec![0; npages], "pgref"),
        }
    }

    /// 分配一个物理页。
    ///
    /// # 流程解释
    /// 1. 从当前处理器的空闲链表弹出一页；
    /// 2. 本地链表为空时从其他处理器窃取一批页后重试；
    /// 3. 在锁外用分配填充字节填满该页，再把引用计数置为 1。
    ///
    /// # 返回值
    /// - `Ok(PhysAddr)`: 新页的地址，引用计数为 1；
    /// - `Err(KallocError::OutOfMemory)`: 所有链表都没有空闲页。
    pub fn alloc_page(&self) -> Result<PhysAddr, KallocError> {
        let id = self.current_list();
        let page = match self.take_page(id) {
            Some(page) => page as usize,
            None => {
                log::debug!("kmem: out of memory on cpu {}", id);
                return Err(KallocError::OutOfMemory);
            }
        };

        let mut pa = self.page_addr(page);
        unsafe { ptr::write_bytes(pa.as_mut_ptr(), KALLOC_FILL, PGSIZE) };

        let mut refs = self.refs.lock();
        if refs[page] != 0 {
            panic!("kalloc: free page {:?} has {} references", pa, refs[page]);
        }
        refs[page] = 1;
        drop(refs);

        Ok(pa)
    }

    /// 释放对物理页的一个引用。
    ///
    /// 引用计数减一，降到 0 时用释放填充字节擦除该页并放回当前处理器的空闲链表。
    ///
    /// # 可能的错误
    /// 地址未对齐、不在管理区间内，或该页已经空闲时触发 panic（`"kfree"`）。
    pub fn free_page(&self, pa: PhysAddr) {
        let page = match self.page_of(pa) {
            Some(page) => page,
            None => panic!("kfree"),
        };

        let mut refs = self.refs.lock();
        if refs[page] == 0 {
            panic!("kfree");
        }
        refs[page] -= 1;
        if refs[page] > 0 {
            return;
        }

        // 计数归零与回到链表在同一个 pgref 临界区内完成
        unsafe { ptr::write_bytes(pa.as_ptr() as *mut u8, KFREE_FILL, PGSIZE) };
        self.lists[self.current_list()].lock().push(page as u32);
        drop(refs);
    }

    /// 为已分配的页增加一个引用，用于 fork 时共享写时复制页。
    ///
    /// # 可能的错误
    /// 地址不受管理或该页空闲时触发 panic。
    pub fn share_page(&self, pa: PhysAddr) {
        let page = match self.page_of(pa) {
            Some(page) => page,
            None => panic!("krefpage: {:?} not managed", pa),
        };
        let mut refs = self.refs.lock();
        if refs[page] == 0 {
            panic!("krefpage: {:?} is free", pa);
        }
        refs[page] += 1;
    }

    /// 写时复制：为即将写入的页取得一份独占的副本。
    ///
    /// # 功能说明
    /// - 引用计数不超过 1 时该页已被独占，原样返回，不复制；
    /// - 否则分配新页，复制原页的全部内容，并释放对原页的一个引用。
    ///
    /// # 返回值
    /// - `Ok(PhysAddr)`: 调用者可以独占写入的页；
    /// - `Err(KallocError::OutOfMemory)`: 无法分配新页，原页的引用计数不变。
    ///
    /// # 可能的错误
    /// 地址不受管理或该页空闲时触发 panic。
    pub fn resolve_cow(&self, pa: PhysAddr) -> Result<PhysAddr, KallocError> {
        let page = match self.page_of(pa) {
            Some(page) => page,
            None => panic!("kalloc_n_deref: {:?} not managed", pa),
        };
        let count = self.refs.lock()[page];
        match count {
            0 => panic!("kalloc_n_deref: {:?} is free", pa),
            1 => return Ok(pa),
            _ => {}
        }

        let mut new = self.alloc_page()?;
        unsafe { ptr::copy_nonoverlapping(pa.as_ptr(), new.as_mut_ptr(), PGSIZE) };
        // 其他共享者可能同时释放了原页，由 free_page 处理计数归零
        self.free_page(pa);
        Ok(new)
    }

    /// 所有空闲链表中的空闲页总数，仅在没有并发分配时精确
    pub fn nfree(&self) -> usize {
        self.lists[..self.ncpu].iter().map(|l| l.lock().len()).sum()
    }

    /// 第 `cpu` 个空闲链表中的空闲页数
    pub fn nfree_on(&self, cpu: usize) -> usize {
        self.lists[cpu].lock().len()
    }

    /// 受管理的页总数
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// 页当前的引用计数
    ///
    /// # 可能的错误
    /// 地址不受管理时触发 panic。
    pub fn refcount(&self, pa: PhysAddr) -> u32 {
        match self.page_of(pa) {
            Some(page) => self.refs.lock()[page],
            None => panic!("refcount: {:?} not managed", pa),
        }
    }

    pub fn config(&self) -> KmemConfig {
        KmemConfig {
            ncpu: self.ncpu,
            steal_batch: self.steal_batch,
        }
    }

    /// 当前处理器对应的空闲链表编号
    fn current_list(&self) -> usize {
        push_off();
        let id = cpu_id() % self.ncpu;
        pop_off();
        id
    }

    /// 先查本地链表，为空则窃取后重试；所有链表都为空时返回 `None`
    fn take_page(&self, id: usize) -> Option<u32> {
        loop {
            let local = self.lists[id].lock().pop();
            if local.is_some() {
                return local;
            }
            if self.steal(id) == 0 {
                return None;
            }
        }
    }

    /// 按 `id+1, id+2, ...` 的顺序访问其他链表，凑够 `steal_batch` 页即停止。
    /// 返回搬入本地链表的页数。
    fn steal(&self, id: usize) -> usize {
        let mut stolen = 0;
        for victim in (1..self.ncpu).map(|k| (id + k) % self.ncpu) {
            if stolen >= self.steal_batch {
                break;
            }
            let (mut mine, mut theirs) = self.lock_pair(id, victim);
            let n = mine.steal_from(&mut theirs, self.steal_batch - stolen);
            drop(theirs);
            drop(mine);
            if n > 0 {
                log::trace!("kmem: cpu {} stole {} pages from cpu {}", id, n, victim);
            }
            stolen += n;
        }
        stolen
    }

    /// 按处理器编号从小到大的顺序锁住两个链表，返回 `(mine, victim)`
    fn lock_pair(
        &self,
        mine: usize,
        victim: usize,
    ) -> (SpinLockGuard<'_, FreeList>, SpinLockGuard<'_, FreeList>) {
        if mine < victim {
            let m = self.lists[mine].lock();
            let v = self.lists[victim].lock();
            (m, v)
        } else {
            let v = self.lists[victim].lock();
            let m = self.lists[mine].lock();
            (m, v)
        }
    }

    fn page_addr(&self, page: usize) -> PhysAddr {
        unsafe { PhysAddr::from_raw(self.base + page * PGSIZE) }
    }

    /// 对齐且落在管理区间内的地址对应的页序号
    fn page_of(&self, pa: PhysAddr) -> Option<usize> {
        let raw = pa.into_raw();
        if !pa.is_aligned() || raw < self.base {
            return None;
        }
        let page = (raw - self.base) / PGSIZE;
        if page < self.npages {
            Some(page)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::mm::RawSinglePage;
    use crate::process::cpu_id;
    use std::collections::HashSet;
    use std::slice;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn kmem(npages: usize, ncpu: usize, steal_batch: usize) -> (Vec<RawSinglePage>, Kmem) {
        let mut arena: Vec<RawSinglePage> = (0..npages).map(|_| RawSinglePage::new()).collect();
        let start = arena.as_mut_ptr() as usize;
        let config = KmemConfig { ncpu, steal_batch };
        let kmem = unsafe { Kmem::new(start, start + npages * PGSIZE, config) };
        (arena, kmem)
    }

    fn page<'a>(pa: PhysAddr) -> &'a mut [u8] {
        unsafe { slice::from_raw_parts_mut(pa.into_raw() as *mut u8, PGSIZE) }
    }

    #[test]
    fn init_scrubs_and_partitions() {
        let (arena, kmem) = kmem(8, 2, 4);
        assert_eq!(kmem.npages(), 8);
        assert_eq!(kmem.nfree(), 8);
        assert_eq!(kmem.nfree_on(0), 4);
        assert_eq!(kmem.nfree_on(1), 4);
        assert!(arena.iter().all(|p| p.data.iter().all(|&b| b == KFREE_FILL)));
    }

    #[test]
    fn partial_pages_at_the_edges_are_skipped() {
        let mut arena: Vec<RawSinglePage> = (0..4).map(|_| RawSinglePage::new()).collect();
        let start = arena.as_mut_ptr() as usize;
        let config = KmemConfig { ncpu: 1, steal_batch: 1 };
        let kmem = unsafe { Kmem::new(start + 1, start + 4 * PGSIZE - 1, config) };
        assert_eq!(kmem.npages(), 2);
        // 首尾两个不完整的页保持原样
        assert!(arena[0].data.iter().all(|&b| b == 0));
        assert!(arena[3].data.iter().all(|&b| b == 0));
    }

    #[test]
    fn lower_addresses_come_out_first() {
        let (arena, kmem) = kmem(3, 1, 1);
        let base = arena.as_ptr() as usize;
        for i in 0..3 {
            assert_eq!(kmem.alloc_page().unwrap().into_raw(), base + i * PGSIZE);
        }
    }

    #[test]
    fn alloc_fills_and_counts() {
        let (_arena, kmem) = kmem(4, 1, 1);
        let pa = kmem.alloc_page().unwrap();
        assert!(pa.is_aligned());
        assert!(page(pa).iter().all(|&b| b == KALLOC_FILL));
        assert_eq!(kmem.refcount(pa), 1);
        assert_eq!(kmem.nfree(), 3);
    }

    #[test]
    fn page_returns_to_free_list_exactly_once() {
        let (_arena, kmem) = kmem(4, 1, 1);
        let pa = kmem.alloc_page().unwrap();
        kmem.share_page(pa);
        kmem.share_page(pa);
        assert_eq!(kmem.refcount(pa), 3);

        kmem.free_page(pa);
        kmem.free_page(pa);
        assert_eq!(kmem.refcount(pa), 1);
        assert_eq!(kmem.nfree(), 3);
        assert!(page(pa).iter().all(|&b| b == KALLOC_FILL));

        kmem.free_page(pa);
        assert_eq!(kmem.refcount(pa), 0);
        assert_eq!(kmem.nfree(), 4);
        assert!(page(pa).iter().all(|&b| b == KFREE_FILL));
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn double_free_is_fatal() {
        let (_arena, kmem) = kmem(2, 1, 1);
        let pa = kmem.alloc_page().unwrap();
        kmem.free_page(pa);
        kmem.free_page(pa);
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn misaligned_free_is_fatal() {
        let (_arena, kmem) = kmem(2, 1, 1);
        let pa = kmem.alloc_page().unwrap();
        kmem.free_page(unsafe { PhysAddr::from_raw(pa.into_raw() + 8) });
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn out_of_range_free_is_fatal() {
        let (arena, kmem) = kmem(2, 1, 1);
        let past_end = arena.as_ptr() as usize + 2 * PGSIZE;
        kmem.free_page(unsafe { PhysAddr::from_raw(past_end) });
    }

    #[test]
    #[should_panic(expected = "krefpage")]
    fn sharing_a_free_page_is_fatal() {
        let (arena, kmem) = kmem(2, 1, 1);
        kmem.share_page(unsafe { PhysAddr::from_raw(arena.as_ptr() as usize) });
    }

    #[test]
    #[should_panic(expected = "bad config")]
    fn zero_free_lists_is_fatal() {
        let _ = kmem(2, 0, 1);
    }

    #[test]
    fn empty_pool_reports_out_of_memory() {
        let (_arena, kmem) = kmem(0, 1, 1);
        assert_eq!(kmem.npages(), 0);
        assert_eq!(kmem.alloc_page(), Err(KallocError::OutOfMemory));
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let (_arena, kmem) = kmem(2, 1, 1);
        let a = kmem.alloc_page().unwrap();
        let _b = kmem.alloc_page().unwrap();
        assert_eq!(kmem.alloc_page(), Err(KallocError::OutOfMemory));
        kmem.free_page(a);
        assert_eq!(kmem.alloc_page(), Ok(a));
    }

    #[test]
    fn resolve_cow_keeps_exclusive_page() {
        let (_arena, kmem) = kmem(4, 1, 1);
        let pa = kmem.alloc_page().unwrap();
        page(pa)[0] = 0xab;

        assert_eq!(kmem.resolve_cow(pa), Ok(pa));
        assert_eq!(kmem.refcount(pa), 1);
        assert_eq!(kmem.nfree(), 3);
        assert_eq!(page(pa)[0], 0xab);
    }

    #[test]
    fn resolve_cow_copies_shared_page() {
        let (_arena, kmem) = kmem(4, 1, 1);
        let pa = kmem.alloc_page().unwrap();
        for (i, b) in page(pa).iter_mut().enumerate() {
            *b = i as u8;
        }
        kmem.share_page(pa);

        let new = kmem.resolve_cow(pa).unwrap();
        assert_ne!(new, pa);
        assert_eq!(page(new), page(pa));
        assert_eq!(kmem.refcount(pa), 1);
        assert_eq!(kmem.refcount(new), 1);
        assert_eq!(kmem.nfree(), 2);
    }

    #[test]
    fn resolve_cow_propagates_out_of_memory() {
        let (_arena, kmem) = kmem(1, 1, 1);
        let pa = kmem.alloc_page().unwrap();
        kmem.share_page(pa);
        assert_eq!(kmem.resolve_cow(pa), Err(KallocError::OutOfMemory));
        assert_eq!(kmem.refcount(pa), 2);
    }

    #[test]
    fn empty_local_list_steals_a_batch() {
        let (_arena, kmem) = kmem(8, 2, 2);
        let me = cpu_id() % 2;
        let other = 1 - me;

        for _ in 0..4 {
            kmem.alloc_page().unwrap();
        }
        assert_eq!(kmem.nfree_on(me), 0);
        assert_eq!(kmem.nfree_on(other), 4);

        let pa = kmem.alloc_page().unwrap();
        assert_eq!(kmem.nfree_on(other), 2);
        assert_eq!(kmem.nfree_on(me), 1);

        // 释放的页回到释放者所在处理器的链表
        kmem.free_page(pa);
        assert_eq!(kmem.nfree_on(me), 2);

        for _ in 0..4 {
            kmem.alloc_page().unwrap();
        }
        assert_eq!(kmem.nfree(), 0);
        assert_eq!(kmem.alloc_page(), Err(KallocError::OutOfMemory));
    }

    #[test]
    fn steal_visits_lists_until_the_batch_is_met() {
        let (_arena, kmem) = kmem(6, 3, 3);
        let me = cpu_id() % 3;
        let next = (me + 1) % 3;
        let last = (me + 2) % 3;

        kmem.alloc_page().unwrap();
        kmem.alloc_page().unwrap();
        // 下一个链表只剩一页可偷
        {
            let (mut mine, mut theirs) = kmem.lock_pair(me, next);
            mine.steal_from(&mut theirs, 1);
        }
        kmem.alloc_page().unwrap();
        assert_eq!(kmem.nfree_on(me), 0);
        assert_eq!(kmem.nfree_on(next), 1);

        kmem.alloc_page().unwrap();
        assert_eq!(kmem.nfree_on(next), 0);
        assert_eq!(kmem.nfree_on(last), 0);
        assert_eq!(kmem.nfree_on(me), 2);
    }

    #[test]
    fn concurrent_use_conserves_pages() {
        let threads = 8;
        let npages = 64;
        let (_arena, kmem) = kmem(npages, 4, 3);
        let outstanding = AtomicUsize::new(0);
        let midway = Barrier::new(threads + 1);
        let resume = Barrier::new(threads + 1);

        thread::scope(|s| {
            for t in 0..threads {
                let (kmem, outstanding) = (&kmem, &outstanding);
                let (midway, resume) = (&midway, &resume);
                s.spawn(move || {
                    let tag = t as u8 + 0x10;
                    let mut held: Vec<PhysAddr> = Vec::new();
                    for i in 0..500 {
                        if i % 3 != 2 {
                            if let Ok(pa) = kmem.alloc_page() {
                                page(pa).fill(tag);
                                held.push(pa);
                                outstanding.fetch_add(1, Ordering::SeqCst);
                            }
                        } else if let Some(pa) = held.pop() {
                            // 其他线程从未拿到过同一页
                            assert!(page(pa).iter().all(|&b| b == tag));
                            kmem.share_page(pa);
                            match kmem.resolve_cow(pa) {
                                Ok(own) => {
                                    assert_ne!(own, pa);
                                    assert!(page(own).iter().all(|&b| b == tag));
                                    kmem.free_page(own);
                                }
                                Err(KallocError::OutOfMemory) => kmem.free_page(pa),
                            }
                            kmem.free_page(pa);
                            outstanding.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    midway.wait();
                    resume.wait();
                    for pa in held {
                        kmem.free_page(pa);
                    }
                });
            }

            midway.wait();
            assert_eq!(kmem.nfree() + outstanding.load(Ordering::SeqCst), npages);
            resume.wait();
        });

        assert_eq!(kmem.nfree(), npages);
        let mut seen = HashSet::new();
        while let Ok(pa) = kmem.alloc_page() {
            assert!(seen.insert(pa));
        }
        assert_eq!(seen.len(), npages);
    }
}
