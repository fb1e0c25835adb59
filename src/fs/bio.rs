//! 缓存层
//!
//! 缓冲区缓存持有固定数量的块缓冲，按 `(dev, blockno)` 哈希到若干个桶中。
//! - 每个桶由自己的自旋锁保护，桶内保存当前哈希到该桶的缓冲的元信息（块号、引用计数、释放时间）；
//! - 缓冲数据由各自的睡眠锁保护，同一时刻只有一个持有者可以读写；
//! - 未命中时，在全局 `bcache` 锁的保护下，扫描所有桶挑选引用计数为 0 且最久未被释放的缓冲复用。

use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::boxed::Box;

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

/// 缓冲区缓存的几何配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcacheConfig {
    /// 缓冲数量
    pub nbuf: usize,
    /// 哈希桶数量
    pub nbucket: usize,
}

impl Default for BcacheConfig {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            nbucket: NBUCKET,
        }
    }
}

/// 缓存命中、未命中与替换次数的快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BcacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
}

/// 缓冲区缓存（Buffer Cache），用于块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据，
/// 以减少重复的磁盘访问，同时作为多个执行上下文访问同一磁盘块时的同步点。
/// 它在内核初始化阶段被构造一次，之后贯穿操作系统运行期间。
///
/// 锁的获取顺序：
/// - 桶锁之后绝不再获取 `lock`，未命中路径总是先释放桶锁再获取 `lock`；
/// - 只有持有 `lock` 的替换扫描会同时持有两把桶锁，且总是按桶编号递增的顺序获取；
/// - 睡眠锁只在所有自旋锁都释放之后才获取。
pub struct Bcache {
    /// 全局替换锁，同一时刻只允许一个执行上下文挑选并搬移被替换的缓冲
    lock: SpinLock<()>,

    /// 哈希桶，每个桶单独加锁
    buckets: Box<[SpinLock<Bucket>]>,

    /// 缓冲数据，下标与 `BufCtrl::index` 一一对应
    bufs: Box<[BufInner]>,

    /// 逻辑时钟，引用计数归零时用它为缓冲盖上释放时间戳
    ticks: AtomicU64,

    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,

    disk: Arc<dyn BlockDevice>,
}

impl Bcache {
    /// 创建并初始化缓冲区缓存。
    ///
    /// # 功能说明
    /// 预先分配全部 `nbuf` 个缓冲，初始时全部放入 0 号桶，首次使用时再逐步重新哈希到各自的桶中；
    /// 为每个桶以及全局替换过程分别创建自旋锁。
    ///
    /// # 参数
    /// - `config`: 缓冲数量与桶数量；
    /// - `disk`: 负责实际读写磁盘块的块设备。
    ///
    /// # 可能的错误
    /// - `nbuf` 或 `nbucket` 为 0 时触发 panic。
    pub fn new(config: BcacheConfig, disk: Arc<dyn BlockDevice>) -> Self {
        if config.nbuf == 0 || config.nbucket == 0 {
            panic!("binit: empty cache geometry {:?}", config);
        }

        // 每个桶都预留容纳全部缓冲的空间，之后在自旋锁内搬移缓冲时不会再分配内存
        let buckets: Vec<SpinLock<Bucket>> = (0..config.nbucket)
            .map(|_| SpinLock::new(Bucket::with_capacity(config.nbuf), "bcache.bucket"))
            .collect();
        {
            let mut first = buckets[0].lock();
            for index in 0..config.nbuf {
                first.chain.push(BufCtrl::new(index));
            }
        }

        let bufs: Vec<BufInner> = (0..config.nbuf).map(|_| BufInner::new()).collect();

        log::info!(
            "bcache: {} buffers of {} bytes in {} buckets",
            config.nbuf,
            BSIZE,
            config.nbucket
        );

        Self {
            lock: SpinLock::new((), "bcache"),
            buckets: buckets.into_boxed_slice(),
            bufs: bufs.into_boxed_slice(),
            ticks: AtomicU64::new(0),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            disk,
        }
    }

    #[inline]
    fn hash(&self, dev: u32, blockno: u32) -> usize {
        (((dev as usize) << 15) + blockno as usize) % self.buckets.len()
    }

    /// 获取指定设备与块号对应的缓冲块，并持有其睡眠锁。
    ///
    /// # 流程解释
    /// 1. 在目标桶锁下查找，命中则增加引用计数，释放桶锁后获取睡眠锁；
    /// 2. 未命中则释放桶锁，获取全局替换锁后重新查找目标桶，
    ///    期间其他执行上下文可能已经把同一个块放入了缓存；
    /// 3. 仍未命中时依次锁住每个桶，在整个缓存范围内挑选引用计数为 0、
    ///    释放时间戳最小的缓冲（时间戳相同时取桶编号最小、在链中位置最靠前者），
    ///    扫描过程中只保留当前最优候选所在桶的锁；
    /// 4. 把选中的缓冲从原桶摘下并挂到目标桶，重置块号、清除 `valid`、引用计数置 1。
    ///
    /// 该函数不涉及磁盘读写，调用者需通过 `valid` 判断是否需要从磁盘加载数据。
    ///
    /// # 可能的错误
    /// - 所有缓冲的引用计数都大于 0 时无法替换，触发 panic（`"bget: no buffers"`）。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let key = self.hash(dev, blockno);

        let mut bucket = self.buckets[key].lock();
        if let Some(index) = bucket.find_cached(dev, blockno) {
            drop(bucket);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return self.lock_buf(index, dev, blockno);
        }
        drop(bucket);

        let evict = self.lock.lock();

        // 等待全局锁期间其他人可能已经缓存了该块
        let mut bucket = self.buckets[key].lock();
        if let Some(index) = bucket.find_cached(dev, blockno) {
            drop(bucket);
            drop(evict);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return self.lock_buf(index, dev, blockno);
        }
        drop(bucket);

        let mut least: Option<Victim<'_>> = None;
        for (i, lock) in self.buckets.iter().enumerate() {
            let guard = lock.lock();
            if let Some((pos, last_use)) = guard.least_recent() {
                if least.as_ref().map_or(true, |v| last_use < v.last_use) {
                    // 替换旧候选的同时释放其所在桶的锁
                    least = Some(Victim {
                        bucket: i,
                        guard,
                        pos,
                        last_use,
                    });
                }
            }
        }

        let Victim {
            bucket: holding,
            guard: mut bucket,
            pos,
            ..
        } = match least {
            Some(v) => v,
            None => panic!("bget: no buffers"),
        };

        let mut ctrl = bucket.chain.remove(pos);
        let index = ctrl.index;
        log::debug!(
            "bcache: evict buf {} ({}, {}) for ({}, {})",
            index,
            ctrl.dev,
            ctrl.blockno,
            dev,
            blockno
        );
        ctrl.dev = dev;
        ctrl.blockno = blockno;
        ctrl.refcnt = 1;
        self.bufs[index].valid.store(false, Ordering::Relaxed);

        if holding == key {
            bucket.chain.push(ctrl);
            drop(bucket);
        } else {
            drop(bucket);
            self.buckets[key].lock().chain.push(ctrl);
        }
        drop(evict);

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.lock_buf(index, dev, blockno)
    }

    /// 在所有自旋锁都已释放的前提下获取缓冲的睡眠锁
    fn lock_buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: ManuallyDrop::new(self.bufs[index].data.lock()),
        }
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 若缓冲块未被标记为有效（即替换后尚未从磁盘加载），则会先调用块设备读取，再设置 `valid`。
    ///
    /// # 返回值
    /// 返回仍持有睡眠锁、内容有效的缓冲块 `Buf`。
    ///
    /// # 可能的错误
    /// - 若所有缓冲都在使用中，将触发 panic。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.rw(&mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 显式释放缓冲块，与直接丢弃 `Buf` 等价。
    ///
    /// # 可能的错误
    /// - `buf` 不属于本缓存时触发 panic；
    /// - 当前执行上下文未持有 `buf` 的睡眠锁时触发 panic（`"brelse"`）。
    pub fn brelse(&self, buf: Buf<'_>) {
        if !ptr::eq(buf.cache, self) {
            panic!("brelse: foreign buffer");
        }
        drop(buf);
    }

    /// 引用计数减一，归零时记录释放时间，调用前睡眠锁必须已经释放
    fn release_ref(&self, index: usize, dev: u32, blockno: u32) {
        let mut bucket = self.buckets[self.hash(dev, blockno)].lock();
        let ctrl = bucket.get_mut(index);
        ctrl.refcnt -= 1;
        if ctrl.refcnt == 0 {
            // 没有人在等待该缓冲
            ctrl.last_use = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        }
    }

    /// 缓存当前是否持有该块（不增加引用计数，结果仅供参考）
    pub fn cached(&self, dev: u32, blockno: u32) -> bool {
        self.buckets[self.hash(dev, blockno)]
            .lock()
            .chain
            .iter()
            .any(|b| {
                b.dev == dev
                    && b.blockno == blockno
                    && (b.refcnt > 0 || self.bufs[b.index].valid.load(Ordering::Relaxed))
            })
    }

    pub fn stats(&self) -> BcacheStats {
        BcacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> BcacheConfig {
        BcacheConfig {
            nbuf: self.bufs.len(),
            nbucket: self.buckets.len(),
        }
    }
}

/// 替换扫描过程中的当前最优候选，持有其所在桶的锁
struct Victim<'a> {
    bucket: usize,
    guard: SpinLockGuard<'a, Bucket>,
    pos: usize,
    last_use: u64,
}

/// 缓冲块，表示一个已分配的磁盘块缓存实体。
///
/// `Buf` 代表一个特定 `(dev, blockno)` 的缓冲区块，
/// 持有对其数据的独占访问权限（由睡眠锁守卫保护），
/// 在生命周期结束时先释放睡眠锁，再在桶锁下减少引用计数。
pub struct Buf<'a> {
    cache: &'a Bcache,

    /// 缓冲块在缓存数组中的索引位置
    index: usize,

    dev: u32,

    blockno: u32,

    /// 只在 `Drop` 中提前释放，以实现先放睡眠锁、再减引用计数的顺序
    data: ManuallyDrop<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// 当前执行上下文是否持有该缓冲的睡眠锁
    pub fn holding(&self) -> bool {
        self.data.holding()
    }

    /// 将缓冲内容写回磁盘。
    ///
    /// # 可能的错误
    /// 当前执行上下文未持有该缓冲的睡眠锁时触发 panic（`"bwrite"`）。
    pub fn bwrite(&mut self) {
        if !self.holding() {
            panic!("bwrite");
        }
        let cache = self.cache;
        cache.disk.rw(self, true);
    }

    /// 将当前缓冲块的引用计数加一，表示“钉住”该块，防止其被替换。
    ///
    /// 不需要也不改变睡眠锁的持有状态，钉住的效果在 `Buf` 释放后依然保留，
    /// 直到与之配对的 [`Buf::unpin`] 被调用。
    pub fn pin(&self) {
        let mut bucket = self.cache.buckets[self.cache.hash(self.dev, self.blockno)].lock();
        bucket.get_mut(self.index).refcnt += 1;
    }

    /// 将当前缓冲块的引用计数减一，释放“钉住”状态。
    ///
    /// # 可能的错误
    /// 必须与 [`Buf::pin`] 配对调用；若引用计数只剩当前持有者自己的那一份，触发 panic。
    pub fn unpin(&self) {
        let mut bucket = self.cache.buckets[self.cache.hash(self.dev, self.blockno)].lock();
        let ctrl = bucket.get_mut(self.index);
        if ctrl.refcnt <= 1 {
            panic!("buf unpin not match");
        }
        ctrl.refcnt -= 1;
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if !self.holding() {
            panic!("brelse");
        }
        // 先释放睡眠锁，让等待者尽早继续
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release_ref(self.index, self.dev, self.blockno);
    }
}

/// 哈希桶，链中保存当前哈希到此桶的全部缓冲的元信息
struct Bucket {
    chain: Vec<BufCtrl>,
}

impl Bucket {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            chain: Vec::with_capacity(capacity),
        }
    }

    /// 查找已缓存的块，命中时引用计数加一并返回缓冲索引
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let b = self
            .chain
            .iter_mut()
            .find(|b| b.dev == dev && b.blockno == blockno)?;
        b.refcnt += 1;
        Some(b.index)
    }

    fn get_mut(&mut self, index: usize) -> &mut BufCtrl {
        match self.chain.iter_mut().find(|b| b.index == index) {
            Some(b) => b,
            None => panic!("bcache: buf {} not in its bucket", index),
        }
    }

    /// 本桶内引用计数为 0 且释放时间最早的缓冲：返回其在链中的位置与时间戳
    fn least_recent(&self) -> Option<(usize, u64)> {
        let mut least: Option<(usize, u64)> = None;
        for (pos, b) in self.chain.iter().enumerate() {
            if b.refcnt == 0 && least.map_or(true, |(_, t)| b.last_use < t) {
                least = Some((pos, b.last_use));
            }
        }
        least
    }
}

/// 缓冲块控制结构，记录缓冲的身份与替换所需的元信息
struct BufCtrl {
    /// 在缓存数组中的索引位置，终生不变
    index: usize,
    dev: u32,
    blockno: u32,
    /// 活跃持有者与钉住者的数量，为 0 时才可被替换
    refcnt: usize,
    /// 最近一次引用计数归零时的逻辑时间
    last_use: u64,
}

impl BufCtrl {
    const fn new(index: usize) -> Self {
        Self {
            index,
            dev: 0,
            blockno: 0,
            refcnt: 0,
            last_use: 0,
        }
    }
}

/// 缓冲块的数据部分，包含实际的磁盘块内容及其有效性标志。
struct BufInner {
    /// 缓冲数据是否反映磁盘内容。
    ///
    /// 由 `bget` 在替换时清除（此时引用计数为 0，无人持有睡眠锁），
    /// 由 `bread` 在持有睡眠锁时设置。
    valid: AtomicBool,

    /// 缓冲块的实际数据，受睡眠锁保护
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[derive(Clone, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl core::fmt::Debug for BufData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BufData({:02x?}..)", &self.0[..8])
    }
}
