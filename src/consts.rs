//! 内核常量

/// 最多支持的处理器数量
pub const NCPU: usize = 8;

/// 页大小（字节）
pub const PGSIZE: usize = 4096;

/// 页内偏移的位数
pub const PGSHIFT: usize = 12;

/// 单次窃取时最多搬运的空闲页数
pub const KMEM_STEAL_BATCH: usize = 64;

/// 分配页时写入的填充字节，用于暴露对未初始化内存的使用
pub const KALLOC_FILL: u8 = 5;

/// 释放页时写入的填充字节，用于捕获悬垂引用
pub const KFREE_FILL: u8 = 1;

pub mod fs {
    /// 块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 单个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 磁盘块缓存的容量
    pub const NBUF: usize = MAXOPBLOCKS * 3;

    /// 缓冲区哈希表的桶数
    pub const NBUCKET: usize = 13;
}
