//! 处理器与调度器接口
//!
//! 缓存与分配器只依赖调度器提供的少量能力：当前处理器编号、当前执行上下文编号、
//! 中断开关以及让出处理器。内核在启动时通过 [`install`] 注册自己的实现；
//! 宿主环境（`std` 特性或单元测试）下默认使用基于线程的 [`hosted::HostScheduler`]。

mod cpu;
#[cfg(any(test, feature = "std"))]
pub mod hosted;

pub use cpu::{holding_spinlocks, pop_off, push_off, Cpu};

/// 调度器需要向内存核心提供的能力。
///
/// 每个执行上下文（进程或内核线程）在任意时刻都运行在某个处理器上。
/// 自旋锁以处理器为持有者，睡眠锁以执行上下文为持有者。
pub trait Scheduler: Sync {
    /// 当前处理器的编号。
    ///
    /// 只有在关中断期间读取的结果才是稳定的，调用者应在 `push_off` 与 `pop_off` 之间使用。
    fn cpu_id(&self) -> usize;

    /// 当前执行上下文的编号，在整个系统中唯一，不为 0。
    fn context_id(&self) -> usize;

    /// 当前处理器的状态块。
    ///
    /// # 安全性
    /// 返回的指针只能在关中断期间由当前处理器解引用。
    fn my_cpu(&self) -> *mut Cpu;

    /// 当前处理器是否允许中断
    fn intr_get(&self) -> bool;

    fn intr_on(&self);

    fn intr_off(&self);

    /// 让出处理器，稍后再被调度回来。调用时不得持有任何自旋锁。
    fn yield_now(&self);
}

static mut SCHEDULER: Option<&'static dyn Scheduler> = None;

/// 注册内核的调度器实现。
///
/// # 安全性
/// 必须在其他处理器启动之前、且在任何锁被使用之前调用，且只能调用一次。
pub unsafe fn install(scheduler: &'static dyn Scheduler) {
    SCHEDULER = Some(scheduler);
}

/// 当前生效的调度器
#[inline]
pub fn scheduler() -> &'static dyn Scheduler {
    match unsafe { SCHEDULER } {
        Some(s) => s,
        None => fallback(),
    }
}

#[cfg(any(test, feature = "std"))]
fn fallback() -> &'static dyn Scheduler {
    &hosted::HOSTED
}

#[cfg(not(any(test, feature = "std")))]
fn fallback() -> &'static dyn Scheduler {
    panic!("scheduler not installed")
}

/// 当前处理器编号的便捷读取
#[inline]
pub fn cpu_id() -> usize {
    scheduler().cpu_id()
}

/// 当前执行上下文编号的便捷读取
#[inline]
pub fn context_id() -> usize {
    scheduler().context_id()
}
