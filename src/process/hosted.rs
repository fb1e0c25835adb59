//! 基于宿主线程的调度器实现
//!
//! 每个宿主线程同时扮演一个处理器和一个执行上下文：
//! - 处理器编号在存活线程之间唯一，线程退出后回收复用；
//! - 执行上下文编号全局递增，从不复用；
//! - 中断开关只是线程本地的标志位，用于检验 `push_off`/`pop_off` 的配对。

extern crate std;

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::vec::Vec;

use super::{Cpu, Scheduler};

pub static HOSTED: HostScheduler = HostScheduler;

/// 以宿主线程模拟处理器的调度器
pub struct HostScheduler;

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);
static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);
static FREE_CPUS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

struct Hart {
    cpu_id: usize,
    context_id: usize,
    intr: Cell<bool>,
    cpu: UnsafeCell<Cpu>,
}

impl Hart {
    fn new() -> Self {
        let recycled = FREE_CPUS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        Self {
            cpu_id: recycled.unwrap_or_else(|| NEXT_CPU.fetch_add(1, Ordering::Relaxed)),
            context_id: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            intr: Cell::new(true),
            cpu: UnsafeCell::new(Cpu::new()),
        }
    }
}

impl Drop for Hart {
    fn drop(&mut self) {
        FREE_CPUS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.cpu_id);
    }
}

thread_local! {
    static HART: Hart = Hart::new();
}

impl Scheduler for HostScheduler {
    fn cpu_id(&self) -> usize {
        HART.with(|h| h.cpu_id)
    }

    fn context_id(&self) -> usize {
        HART.with(|h| h.context_id)
    }

    fn my_cpu(&self) -> *mut Cpu {
        HART.with(|h| h.cpu.get())
    }

    fn intr_get(&self) -> bool {
        HART.with(|h| h.intr.get())
    }

    fn intr_on(&self) {
        HART.with(|h| h.intr.set(true))
    }

    fn intr_off(&self) {
        HART.with(|h| h.intr.set(false))
    }

    fn yield_now(&self) {
        thread::yield_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn live_threads_get_distinct_cpus_and_contexts() {
        let start = Barrier::new(4);
        let ids: Vec<(usize, usize)> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let ids = (HOSTED.cpu_id(), HOSTED.context_id());
                        // 保证四个线程同时存活
                        start.wait();
                        ids
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a.0, b.0);
                assert_ne!(a.1, b.1);
            }
        }
    }

    #[test]
    fn context_ids_are_never_zero() {
        assert_ne!(HOSTED.context_id(), 0);
        let other = thread::spawn(|| HOSTED.context_id()).join().unwrap();
        assert_ne!(other, 0);
        assert_ne!(other, HOSTED.context_id());
    }
}
