use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// 将绝对截止时间与相对超时合并为单一唤醒点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 阻塞读写既要尊重 `set_deadline` 设置的绝对时间，也要尊重 `set_timeout` 的相对时长；
///   两者同时存在时取较早者。
///
/// ## 逻辑（How）
/// - 构造时一次性计算 `expiry`，每次阻塞调用重新构造，不跨调用保存；
/// - [`DeadlineTimer::has_expired`] 必须在每轮等待循环阻塞前调用，保证已过期的截止时间永不阻塞；
/// - [`DeadlineTimer::wait`] 借助 `Condvar::wait_until` 在到期时自行醒来，无需额外定时线程，
///   因而也没有需要在退出时释放的计时资源。
///
/// ## 契约（What）
/// - `deadline = None` 且 `timeout = None`：永不过期，`wait` 无限期等待通知；
/// - `timeout = Some(Duration::ZERO)`：构造时刻即过期，相当于“不等待”；
/// - 相对超时溢出 `Instant` 表示范围时视为未设置。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeadlineTimer {
    expiry: Option<Instant>,
}

impl DeadlineTimer {
    /// 以当前时刻为起点计算过期时间。
    pub fn new(deadline: Option<Instant>, timeout: Option<Duration>) -> Self {
        Self::starting_at(Instant::now(), deadline, timeout)
    }

    /// 以给定时刻为起点计算过期时间。
    pub fn starting_at(start: Instant, deadline: Option<Instant>, timeout: Option<Duration>) -> Self {
        let relative = timeout.and_then(|timeout| start.checked_add(timeout));
        let expiry = match (deadline, relative) {
            (Some(deadline), Some(relative)) => Some(deadline.min(relative)),
            (deadline, relative) => deadline.or(relative),
        };
        Self { expiry }
    }

    /// 生效的过期时刻。
    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// 过期时刻已设置且不晚于 `now` 时返回 `true`。
    pub fn has_expired(&self, now: Instant) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }

    /// 释放锁并等待通知；设置了过期时刻时最迟在该时刻醒来。
    pub fn wait<T>(&self, cond: &Condvar, guard: &mut MutexGuard<'_, T>) {
        match self.expiry {
            Some(expiry) => {
                cond.wait_until(guard, expiry);
            }
            None => cond.wait(guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn earlier_of_deadline_and_timeout_wins() {
        let start = Instant::now();
        let deadline = start + Duration::from_secs(10);

        let timer = DeadlineTimer::starting_at(start, Some(deadline), Some(Duration::from_secs(1)));
        assert_eq!(timer.expiry(), Some(start + Duration::from_secs(1)));

        let timer = DeadlineTimer::starting_at(start, Some(deadline), Some(Duration::from_secs(60)));
        assert_eq!(timer.expiry(), Some(deadline), "绝对截止时间更早时应取截止时间");
    }

    #[test]
    fn unset_timer_never_expires() {
        let timer = DeadlineTimer::new(None, None);
        assert_eq!(timer.expiry(), None);
        assert!(!timer.has_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let start = Instant::now();
        let timer = DeadlineTimer::starting_at(start, None, Some(Duration::ZERO));
        assert!(timer.has_expired(start), "零超时等价于不等待");
    }

    #[test]
    fn past_deadline_has_expired() {
        let now = Instant::now();
        let past = now.checked_sub(Duration::from_millis(5)).unwrap_or(now);
        let timer = DeadlineTimer::new(Some(past), None);
        assert!(timer.has_expired(Instant::now()));
    }

    #[test]
    fn wait_returns_at_expiry_without_notification() {
        let lock = Mutex::new(());
        let cond = Condvar::new();
        let timer = DeadlineTimer::new(None, Some(Duration::from_millis(20)));

        let started = Instant::now();
        let mut guard = lock.lock();
        while !timer.has_expired(Instant::now()) {
            timer.wait(&cond, &mut guard);
        }
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
