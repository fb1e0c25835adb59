//! 处理器状态管理，用于控制中断开关的嵌套

use super::scheduler;

/// 单个处理器的中断嵌套状态。
///
/// 自旋锁在获取前调用 [`push_off`] 关中断，在释放后调用 [`pop_off`]，
/// 嵌套持有多把自旋锁时只有最外层的 `pop_off` 才会恢复中断。
#[derive(Debug)]
pub struct Cpu {
    /// `push_off` 的嵌套深度
    noff: u8,

    /// 最外层 `push_off` 之前中断是否开启
    intena: bool,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            noff: 0,
            intena: false,
        }
    }

    /// 当前处理器持有的自旋锁层数
    #[inline]
    pub fn noff(&self) -> u8 {
        self.noff
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// 关中断并记录嵌套深度。
///
/// 与 `intr_off` 不同，`push_off` 与 [`pop_off`] 成对出现，
/// 两次 `push_off` 需要两次 `pop_off` 才会撤销；若最初中断就是关闭的，
/// 则成对调用结束后中断仍保持关闭。
pub fn push_off() {
    let s = scheduler();
    let old = s.intr_get();
    s.intr_off();
    let c = unsafe { &mut *s.my_cpu() };
    if c.noff == 0 {
        c.intena = old;
    }
    c.noff += 1;
}

/// 撤销一次 [`push_off`]。
///
/// # 可能的错误
/// - 此时中断是开启的，说明有人绕过了 `push_off`，触发 panic；
/// - 嵌套深度已为 0，说明 `push_off` 与 `pop_off` 不配对，触发 panic。
pub fn pop_off() {
    let s = scheduler();
    if s.intr_get() {
        panic!("pop_off(): interruptable");
    }
    let c = unsafe { &mut *s.my_cpu() };
    if c.noff.checked_sub(1).is_none() {
        panic!("pop_off(): count not match");
    }
    c.noff -= 1;
    if c.noff == 0 && c.intena {
        s.intr_on();
    }
}

/// 当前处理器是否持有至少一把自旋锁
pub fn holding_spinlocks() -> bool {
    push_off();
    let noff = unsafe { (*scheduler().my_cpu()).noff };
    pop_off();
    // 减去上面这一层 push_off
    noff > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_push_off_restores_interrupts_once() {
        let s = scheduler();
        assert!(s.intr_get());

        push_off();
        push_off();
        assert!(!s.intr_get());
        pop_off();
        // 内层撤销后仍然关中断
        assert!(!s.intr_get());
        pop_off();
        assert!(s.intr_get());
    }

    #[test]
    fn push_off_keeps_interrupts_off_if_they_were_off() {
        let s = scheduler();
        s.intr_off();
        push_off();
        pop_off();
        assert!(!s.intr_get());
        s.intr_on();
    }

    #[test]
    #[should_panic(expected = "pop_off(): count not match")]
    fn unmatched_pop_off_is_fatal() {
        scheduler().intr_off();
        pop_off();
    }

    #[test]
    fn holding_spinlocks_tracks_nesting() {
        assert!(!holding_spinlocks());
        push_off();
        assert!(holding_spinlocks());
        pop_off();
        assert!(!holding_spinlocks());
    }
}
