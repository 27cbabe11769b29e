//! 可注入的单调时钟。
//!
//! 超时调度只需要“读取当前时间”这一项能力，因此这里的 [`Clock`] 比运行时层的时钟抽象更窄：
//! 没有睡眠 Future，计时到期由宿主通过 [`TimerDriver`](crate::TimerDriver) 回调通知。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 抽象可注入的时钟。
///
/// # 接口约束（What）
/// - `now` 必须单调不减；
/// - 推荐通过 `Arc<dyn Clock>` 传入分发器，测试可与分发器共享同一个 [`ManualClock`]。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;
}

/// 直接读取 [`Instant::now`] 的系统时钟。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的确定性时钟。
///
/// # 教案式说明
/// - **意图 (Why)**：超时测试需要精确控制“过去了多久”，而不能依赖真实睡眠；
/// - **契约 (What)**：`now()` 返回构造时刻加上累计推进量，只有 [`ManualClock::advance`] 会改变它；
/// - **实现 (How)**：以纳秒为单位把偏移量存入 `AtomicU64`，共享引用即可推进，无需加锁。
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    /// 以当前系统时间为起点创建时钟。
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以指定起点创建时钟。
    pub fn with_start(origin: Instant) -> Self {
        Self {
            origin,
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, delta: Duration) {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// 自起点以来累计推进的时间。
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = Instant::now();
        let clock = ManualClock::with_start(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_millis(1500));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), start + Duration::from_secs(2));
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }
}
