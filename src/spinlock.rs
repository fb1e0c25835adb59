//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{cpu_id, pop_off, push_off};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 持有期间当前处理器的中断保持关闭，避免中断处理程序在同一处理器上重入同一把锁。
/// 该锁还跟踪持有锁的处理器编号，用于检测重复获取和错误释放。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的处理器编号（-1 表示无处理器持有）；
/// - `data`: 被保护的数据，通过 `UnsafeCell` 实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为 SpinLock 实现 Sync trait，允许跨线程共享（要求 T 是 Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，出现在 panic 信息中。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }

    /// 拥有 `&mut self` 时不存在竞争，可直接取得内部数据
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回守卫对象。
    ///
    /// # 功能说明
    /// 关闭当前处理器的中断，然后忙等待直到锁可用。守卫离开作用域时自动释放锁并恢复中断。
    ///
    /// # 可能的错误
    /// 当前处理器已经持有该锁时触发 panic，这种重入在真实内核中必然死锁。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 判断当前处理器是否持有该锁，调用时必须已关中断
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == cpu_id() as isize
    }

    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu_id() as isize, Ordering::Relaxed);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫，离开作用域时释放锁
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    pub fn holding(&self) -> bool {
        push_off();
        let holding = self.lock.holding();
        pop_off();
        holding
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::process::{holding_spinlocks, scheduler};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    #[should_panic(expected = "spinlock smoke acquire")]
    fn smoke() {
        let m = SpinLock::new((), "smoke");
        let _a = m.lock();
        let _b = m.lock();
    }

    #[test]
    fn interrupts_off_while_held() {
        let m = SpinLock::new(0u32, "intr");
        {
            let mut g = m.lock();
            *g += 1;
            assert!(!scheduler().intr_get());
            assert!(holding_spinlocks());
            assert!(g.holding());
        }
        assert!(scheduler().intr_get());
        assert!(!holding_spinlocks());
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn foreign_release_is_fatal() {
        let m = SpinLock::new(0u8, "foreign");
        let g = m.lock();
        thread::scope(|s| {
            let res = s.spawn(move || drop(g)).join();
            let err = res.expect_err("releasing from another processor must panic");
            assert_eq!(
                err.downcast_ref::<std::string::String>().map(|s| s.as_str()),
                Some("spinlock foreign release")
            );
        });
    }

    #[test]
    fn contended_increments_are_exact_and_exclusive() {
        let threads = 8;
        let iters = 2_000;

        let lock = SpinLock::new(0usize, "counter");
        let in_cs = AtomicUsize::new(0);
        let start = Barrier::new(threads);

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    start.wait();
                    for _ in 0..iters {
                        let mut v = lock.lock();
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                        drop(v);
                        thread::yield_now();
                    }
                });
            }
        });

        assert_eq!(*lock.lock(), threads * iters);
    }
}
