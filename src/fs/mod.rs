//! 文件系统的缓存层
//!
//! 上层（日志、inode 层）通过 [`Bcache::bread`] 取得持锁的 [`Buf`]，
//! 修改后调用 [`Buf::bwrite`] 写回，丢弃 `Buf` 即释放。

mod bio;

pub use bio::{Bcache, BcacheConfig, BcacheStats, Buf, BufData};
