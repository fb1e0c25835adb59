//! xv6 内核的内存核心：块缓冲区缓存与物理页分配器

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(dead_code)]
#![warn(rust_2018_idioms)]

extern crate alloc;

pub mod consts;
pub mod driver;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use driver::{BlockDevice, RamDisk};
pub use fs::{Bcache, BcacheConfig, BcacheStats, Buf, BufData};
pub use mm::{KallocError, Kmem, KmemConfig, PhysAddr};
