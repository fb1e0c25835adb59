//! 睡眠锁模块
//! 提供基于让出处理器的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的执行上下文会让出处理器，避免忙等待。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{context_id, holding_spinlocks, scheduler};
use crate::spinlock::SpinLock;

/// 睡眠锁，持有者为执行上下文而不是处理器。
///
/// 内部的自旋锁只保护 `locked` 与 `pid` 两个字段，持有时间极短；
/// 被保护的数据本身可以在持锁期间被长时间访问（例如等待磁盘 I/O）。
/// 等待者在每次检查失败后都会释放内部自旋锁并让出处理器，
/// 因此在持有任何自旋锁的情况下等待睡眠锁是致命错误。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    /// 持有者的执行上下文编号，0 表示无人持有
    pid: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为 SleepLock 实现 Sync，允许跨线程共享（要求 T 是 Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            pid: Cell::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁。
    ///
    /// # 功能说明
    /// 在内部自旋锁的保护下检查 `locked`；若锁已被占用，则释放内部自旋锁并让出处理器，
    /// 重新被调度后再次检查，直到成功占有为止。不保证等待者之间的公平性。
    ///
    /// # 可能的错误
    /// 需要等待时若调用者仍持有自旋锁，触发 panic。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            let guard = self.lock.lock();
            if !self.locked.get() {
                self.locked.set(true);
                self.pid.set(context_id());
                drop(guard);
                break;
            }
            drop(guard);

            if holding_spinlocks() {
                panic!("sleeplock {} wait while holding spinlock", self.name);
            }
            scheduler().yield_now();
        }

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前执行上下文是否持有该睡眠锁
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let holding = self.locked.get() && self.pid.get() == context_id();
        drop(guard);
        holding
    }

    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.pid.set(0);
        drop(guard);
    }
}

/// 睡眠锁守卫，离开作用域时释放锁
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
