//! # timer 模块说明
//!
//! ## 角色定位（Why）
//! - 整个分发器只占用一个平台定时器，始终指向所有存活的带时限事务中最近的截止时间；
//! - 平台定时器由宿主提供，这里通过 [`TimerDriver`] 抽象其“布置/撤销”两项能力。
//!
//! ## 核心逻辑（How）
//! - 每次重算先撤销旧定时器，用“距上次重算经过的时间”扣减每个事务的剩余时限；
//! - 剩余时限耗尽的事务时限归零，由调用方决定是否立即让所属流失效；
//! - 最后以最小剩余时限重新布置定时器。
//!
//! ## 风险提示（Trade-offs）
//! - 布置失败属于平台资源配置错误，记录 `error!` 后 panic，不尝试降级运行。

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::error;

/// 平台定时器错误。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TimerError {
    /// 平台无法再分配定时器。
    #[error("timer unavailable: {reason}")]
    Unavailable { reason: &'static str },
}

/// 宿主提供的单个平台定时器。
///
/// # 契约说明（What）
/// - `arm`：布置在 `deadline` 到期的定时器；到期后宿主调用
///   [`Dispatcher::handle_timer_expired`](crate::Dispatcher::handle_timer_expired)；
/// - `disarm`：撤销尚未到期的定时器，未布置时调用应无副作用；
/// - 同一时刻最多只有一个已布置的定时器，再次 `arm` 之前分发器总会先 `disarm`。
pub trait TimerDriver {
    fn arm(&mut self, deadline: Instant) -> Result<(), TimerError>;

    fn disarm(&mut self);
}

/// 单定时器超时调度器。
pub(crate) struct TimeoutScheduler {
    driver: Box<dyn TimerDriver>,
    reference: Instant,
}

impl TimeoutScheduler {
    pub(crate) fn new(driver: Box<dyn TimerDriver>, now: Instant) -> Self {
        Self {
            driver,
            reference: now,
        }
    }

    /// 开始一次重算：撤销定时器并返回距上次重算经过的时间。
    pub(crate) fn begin(&mut self, now: Instant) -> Duration {
        self.driver.disarm();
        let delta = now.saturating_duration_since(self.reference);
        self.reference = now;
        delta
    }

    /// 以最小剩余时限重新布置定时器；没有带时限的事务时保持撤销状态。
    pub(crate) fn finish(&mut self, now: Instant, min_ttl: Option<Duration>) {
        let Some(min_ttl) = min_ttl else {
            return;
        };
        if let Err(err) = self.driver.arm(now + min_ttl) {
            error!(
                target: "hds_dispatcher::timer",
                error = %err,
                "failed to arm the transaction timer"
            );
            panic!("data stream dispatcher cannot run without its transaction timer: {err}");
        }
    }
}

/// 以经过时间扣减单个剩余时限；返回该时限是否已经耗尽。
pub(crate) fn age_ttl(ttl: &mut Duration, delta: Duration) -> bool {
    if *ttl <= delta {
        *ttl = Duration::ZERO;
        true
    } else {
        *ttl -= delta;
        false
    }
}
