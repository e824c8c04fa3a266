//! Block 时序状态机
//!
//! STOPPED ⇄ RUNNING。每处理完一个 block 推进一次 cursor，
//! 绕回 0 时打时间戳并递增 loop count。
//!
//! 定时器驱动模式下，下一次超时按理想网格计算：
//! `timeout = period + (scheduled - now)`，`scheduled += period`。
//! 计划时间只在理想网格上累加，从不取观测时间，误差不会累积。

/// 宿主定时器
///
/// 只需要"在 N 纳秒后回调一次"和"取消"两个能力，
/// 回调本身由宿主的 work loop 派发到 `ReacEngine::timer_fired`
pub trait BlockTimer: Send {
    fn set_timeout_ns(&mut self, timeout_ns: u64);
    fn cancel(&mut self);
}

/// 缓冲区时间戳
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// 单调时间（纳秒）
    pub time_ns: u64,
    /// 完整绕圈次数
    pub loop_count: u64,
}

/// 时序状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingState {
    Stopped,
    Running,
}

/// 理想调度累加器
#[derive(Debug, Clone, Copy)]
pub struct DriftScheduler {
    period_ns: u64,
    next_time_ns: u64,
}

impl DriftScheduler {
    pub fn new(period_ns: u64) -> Self {
        Self {
            period_ns,
            next_time_ns: 0,
        }
    }

    /// 从 now 开始排第一次触发，返回首个超时
    pub fn arm(&mut self, now_ns: u64) -> u64 {
        self.next_time_ns = now_ns + self.period_ns;
        self.period_ns
    }

    /// 处理一次触发，返回 (下一次超时, 本次偏差)
    ///
    /// 偏差 = now - scheduled，迟到为正。
    /// 必须用有符号运算，否则几个周期后就会失真
    pub fn on_fire(&mut self, now_ns: u64) -> (u64, i64) {
        let diff = self.next_time_ns as i64 - now_ns as i64;
        let timeout = (self.period_ns as i64 + diff).max(0) as u64;
        self.next_time_ns += self.period_ns;
        (timeout, -diff)
    }

    #[inline]
    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    #[inline]
    pub fn set_period_ns(&mut self, period_ns: u64) {
        self.period_ns = period_ns;
    }

    /// 下一次计划触发时间
    #[inline]
    pub fn next_time_ns(&self) -> u64 {
        self.next_time_ns
    }
}

/// Block 时序控制器
pub struct TimingController {
    state: TimingState,
    cursor: u32,
    num_blocks: u32,
    timestamp: Timestamp,
    scheduler: DriftScheduler,
    timer: Option<Box<dyn BlockTimer>>,
    timer_armed: bool,
}

impl TimingController {
    pub fn new(num_blocks: u32, block_timeout_ns: u64) -> Self {
        Self {
            state: TimingState::Stopped,
            cursor: 0,
            num_blocks,
            timestamp: Timestamp::default(),
            scheduler: DriftScheduler::new(block_timeout_ns),
            timer: None,
            timer_armed: false,
        }
    }

    /// 安装宿主定时器（bring-up 时调用）
    pub fn set_timer(&mut self, timer: Box<dyn BlockTimer>) {
        self.timer = Some(timer);
    }

    #[inline]
    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// STOPPED → RUNNING
    ///
    /// cursor 归零，打初始时间戳但不递增 loop count。
    /// `arm_timer` 为 true 且装有定时器时按 block 周期启动定时器。
    /// 返回定时器是否已启动
    pub fn start(&mut self, now_ns: u64, arm_timer: bool) -> bool {
        self.cursor = 0;
        self.timestamp.time_ns = now_ns;
        self.state = TimingState::Running;

        if arm_timer {
            self.arm_timer(now_ns);
        }
        self.timer_armed
    }

    /// RUNNING → STOPPED，取消已启动的定时器
    pub fn stop(&mut self) {
        self.disarm_timer();
        self.state = TimingState::Stopped;
    }

    /// 从 now 起按 block 周期启动定时器（已启动时不变）
    ///
    /// 没装定时器时返回 false
    pub fn arm_timer(&mut self, now_ns: u64) -> bool {
        if !self.timer_armed {
            if let Some(timer) = self.timer.as_mut() {
                let timeout = self.scheduler.arm(now_ns);
                timer.set_timeout_ns(timeout);
                self.timer_armed = true;
            }
        }
        self.timer_armed
    }

    /// 取消定时器，运行状态不变
    pub fn disarm_timer(&mut self) {
        if self.timer_armed {
            if let Some(timer) = self.timer.as_mut() {
                timer.cancel();
            }
            self.timer_armed = false;
        }
    }

    /// 推进一个 block
    ///
    /// 返回是否发生了绕圈
    #[inline]
    pub fn advance(&mut self, now_ns: u64) -> bool {
        self.cursor += 1;
        if self.cursor >= self.num_blocks {
            self.cursor = 0;
            self.timestamp = Timestamp {
                time_ns: now_ns,
                loop_count: self.timestamp.loop_count + 1,
            };
            return true;
        }
        false
    }

    /// 定时器触发后重新设置下一次超时
    ///
    /// 定时器未启动时返回 None，否则返回本次触发偏差（纳秒）
    pub fn rearm(&mut self, now_ns: u64) -> Option<i64> {
        if !self.timer_armed {
            return None;
        }
        let timer = self.timer.as_mut()?;
        let (timeout, lateness) = self.scheduler.on_fire(now_ns);
        timer.set_timeout_ns(timeout);
        Some(lateness)
    }

    /// 采样率变化后更新 block 周期
    pub fn set_block_timeout_ns(&mut self, block_timeout_ns: u64) {
        self.scheduler.set_period_ns(block_timeout_ns);
    }

    #[inline]
    pub fn block_timeout_ns(&self) -> u64 {
        self.scheduler.period_ns()
    }

    #[inline]
    pub fn scheduled_next_ns(&self) -> u64 {
        self.scheduler.next_time_ns()
    }

    #[inline]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    #[inline]
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn state(&self) -> TimingState {
        self.state
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == TimingState::Running
    }

    #[inline]
    pub fn is_timer_armed(&self) -> bool {
        self.timer_armed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// 记录所有超时设置的测试定时器
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTimer {
        pub timeouts: Arc<Mutex<Vec<u64>>>,
        pub cancelled: Arc<Mutex<u32>>,
    }

    impl BlockTimer for RecordingTimer {
        fn set_timeout_ns(&mut self, timeout_ns: u64) {
            self.timeouts.lock().unwrap().push(timeout_ns);
        }

        fn cancel(&mut self) {
            *self.cancelled.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_cursor_wraps_after_num_blocks() {
        let mut tc = TimingController::new(8, 1_000);
        tc.start(100, false);
        assert_eq!(tc.cursor(), 0);
        assert_eq!(tc.timestamp().loop_count, 0);

        let mut wraps = 0;
        for i in 1..=8u64 {
            if tc.advance(100 + i) {
                wraps += 1;
            }
            assert!(tc.cursor() < 8);
        }
        assert_eq!(tc.cursor(), 0);
        assert_eq!(wraps, 1);
        assert_eq!(tc.timestamp(), Timestamp { time_ns: 108, loop_count: 1 });
    }

    #[test]
    fn test_start_does_not_increment_loop_count() {
        let mut tc = TimingController::new(2, 1_000);
        tc.start(10, false);
        tc.advance(11);
        tc.advance(12);
        assert_eq!(tc.timestamp().loop_count, 1);

        tc.stop();
        tc.start(50, false);
        assert_eq!(tc.cursor(), 0);
        assert_eq!(tc.timestamp(), Timestamp { time_ns: 50, loop_count: 1 });
    }

    #[test]
    fn test_start_without_timer_does_not_arm() {
        let mut tc = TimingController::new(4, 1_000);
        assert!(!tc.start(0, true));
        assert!(tc.is_running());
        assert_eq!(tc.rearm(1_000), None);
        tc.stop();
        assert_eq!(tc.state(), TimingState::Stopped);
    }

    #[test]
    fn test_stop_cancels_armed_timer() {
        let timer = RecordingTimer::default();
        let mut tc = TimingController::new(4, 1_000);
        tc.set_timer(Box::new(timer.clone()));

        assert!(tc.start(0, true));
        assert_eq!(*timer.timeouts.lock().unwrap(), vec![1_000]);

        tc.stop();
        tc.stop();
        assert_eq!(*timer.cancelled.lock().unwrap(), 1);
        assert!(!tc.is_timer_armed());
    }

    #[test]
    fn test_arm_and_disarm_while_running() {
        let timer = RecordingTimer::default();
        let mut tc = TimingController::new(4, 1_000);
        tc.set_timer(Box::new(timer.clone()));
        tc.start(0, false);
        assert!(!tc.is_timer_armed());

        assert!(tc.arm_timer(500));
        assert!(tc.arm_timer(700));
        assert_eq!(*timer.timeouts.lock().unwrap(), vec![1_000]);
        assert_eq!(tc.scheduled_next_ns(), 1_500);

        tc.disarm_timer();
        assert!(!tc.is_timer_armed());
        assert!(tc.is_running());
        assert_eq!(*timer.cancelled.lock().unwrap(), 1);
        assert_eq!(tc.rearm(1_500), None);
    }

    #[test]
    fn test_drift_correction_tracks_ideal_grid() {
        let period = 11_609_977u64;
        let start = 5_000_000u64;
        let timer = RecordingTimer::default();
        let mut tc = TimingController::new(1024, period);
        tc.set_timer(Box::new(timer.clone()));
        tc.start(start, true);

        let initial = tc.scheduled_next_ns();
        assert_eq!(initial, start + period);

        // 每次触发带 ±40µs 的抖动
        let jitter = [40_000i64, -25_000, 3_000, -40_000, 17_000, 0, 39_999];
        let fires = 50u64;
        for n in 0..fires {
            let ideal = initial + n * period;
            let actual = (ideal as i64 + jitter[n as usize % jitter.len()]) as u64;
            let lateness = tc.rearm(actual).unwrap();
            assert_eq!(lateness, actual as i64 - ideal as i64);

            // 下一次回调正好落在理想网格上
            let next_timeout = *timer.timeouts.lock().unwrap().last().unwrap();
            assert_eq!(actual + next_timeout, ideal + period);
        }

        assert_eq!(tc.scheduled_next_ns(), fires * period + initial);
    }

    #[test]
    fn test_very_late_fire_floors_timeout_at_zero() {
        let mut sched = DriftScheduler::new(1_000);
        sched.arm(0);
        let (timeout, lateness) = sched.on_fire(5_000);
        assert_eq!(timeout, 0);
        assert_eq!(lateness, 4_000);
        assert_eq!(sched.next_time_ns(), 2_000);
    }

    #[test]
    fn test_period_change() {
        let mut tc = TimingController::new(4, 1_000);
        tc.set_block_timeout_ns(2_000);
        assert_eq!(tc.block_timeout_ns(), 2_000);
    }
}
