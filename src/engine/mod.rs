//! REAC 流引擎
//!
//! 整合缓冲、重排、时序各模块。
//! 核心设计：没有内部线程，所有工作都在宿主 work loop 派发的回调里完成：
//! - 包驱动（SPLIT）：每个网络包一次 `deliver`，重排后推进 cursor
//! - 定时器驱动（MASTER/SLAVE）：每次定时器触发一次 `timer_fired`
//!
//! 宿主保证这些回调互相串行（`&mut self`），消费端线程通过
//! `PositionHandle` 无锁读取已完成的位置。

pub mod block_timer;
pub mod host;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::audio::ring_buffer::AllocationError;
use crate::audio::timing::block_timeout_ns;
use crate::audio::{
    Direction, EngineStats, MonotonicClock, RingBufferManager, SampleRate, SampleReformatter,
    StreamFormat,
};
use crate::control::{ChannelControlState, ControlRegistry, EngineHandle};
use crate::transport::{self, ReacMode, Transport};

use block_timer::TimingController;
pub use block_timer::{BlockTimer, Timestamp, TimingState};
pub use host::HostAdapter;

/// 引擎配置
///
/// 对应设备属性：block 大小/数量覆盖、描述、两个方向的流格式
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 每个 block 的帧数（默认一个 REAC 包）
    pub block_size: u32,
    /// ring buffer 的 block 数
    pub num_blocks: u32,
    /// 初始采样率
    pub initial_sample_rate: u32,
    /// 设备描述
    pub description: Option<String>,
    /// 输入流格式，None 表示格式描述缺失
    pub input_format: Option<StreamFormat>,
    /// 输出流格式，None 表示格式描述缺失
    pub output_format: Option<StreamFormat>,
    /// 是否 mlock 样本缓冲区
    pub lock_memory: bool,
    /// 启用定时器驱动的 MASTER/SLAVE 模式（未经硬件验证）
    pub timer_roles: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let format = StreamFormat::new(
            transport::MAX_CHANNELS as u16,
            (transport::RESOLUTION * 8) as u16,
            transport::SAMPLE_RATE,
        );
        Self {
            block_size: transport::SAMPLES_PER_PACKET,
            num_blocks: transport::NUM_BLOCKS,
            initial_sample_rate: transport::SAMPLE_RATE,
            description: None,
            input_format: Some(format),
            output_format: Some(format),
            lock_memory: false,
            timer_roles: false,
        }
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    AllocationFailure(#[from] AllocationError),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("unsupported REAC mode {0}")]
    UnsupportedMode(ReacMode),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// 宿主生命周期接口
///
/// 宿主适配器只通过这个接口驱动引擎
pub trait AudioEngine {
    /// bring-up：分配缓冲区、登记控制状态。失败时已获取的资源全部回滚
    fn init_hardware(&mut self) -> Result<(), EngineError>;
    fn start(&mut self) -> Result<(), EngineError>;
    fn stop(&mut self) -> Result<(), EngineError>;
    /// 格式和采样率可以只给其一
    fn on_format_change(
        &mut self,
        direction: Direction,
        format: Option<StreamFormat>,
        sample_rate: Option<SampleRate>,
    ) -> Result<(), EngineError>;
    /// 已完成写入的帧位置（block 对齐）
    fn current_position(&self) -> u32;
    /// 释放缓冲区、注销控制状态（幂等）
    fn teardown(&mut self);
}

/// 跨线程发布的位置
///
/// cursor 在 block 写完之后才以 Release 存入，
/// 消费端 Acquire 读到的位置之前的数据一定已经完整
pub struct PositionHandle {
    cursor: CachePadded<AtomicU32>,
    loop_count: CachePadded<AtomicU64>,
    block_size: u32,
}

impl PositionHandle {
    fn new(block_size: u32) -> Self {
        Self {
            cursor: CachePadded::new(AtomicU32::new(0)),
            loop_count: CachePadded::new(AtomicU64::new(0)),
            block_size,
        }
    }

    #[inline]
    fn publish(&self, cursor: u32, loop_count: u64) {
        self.loop_count.store(loop_count, Ordering::Relaxed);
        self.cursor.store(cursor, Ordering::Release);
    }

    #[inline]
    pub fn cursor(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }

    /// 当前帧位置（= cursor × blockSize）
    #[inline]
    pub fn current_position(&self) -> u32 {
        self.cursor() * self.block_size
    }

    #[inline]
    pub fn loop_count(&self) -> u64 {
        self.loop_count.load(Ordering::Relaxed)
    }
}

/// REAC 流引擎
pub struct ReacEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn MonotonicClock>,
    buffers: RingBufferManager,
    timing: TimingController,
    input_format: Option<StreamFormat>,
    output_format: Option<StreamFormat>,
    sample_rate: SampleRate,
    reformatter: Option<SampleReformatter>,
    controls: Arc<ChannelControlState>,
    registry: Arc<ControlRegistry>,
    control_handle: Option<EngineHandle>,
    stats: Arc<EngineStats>,
    position: Arc<PositionHandle>,
    output_clients: u32,
    output_cleared: bool,
    unsupported_warned: bool,
    attached: bool,
}

impl ReacEngine {
    /// 创建引擎（尚未分配任何资源）
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn MonotonicClock>,
        registry: Arc<ControlRegistry>,
    ) -> Self {
        let buffers = RingBufferManager::new(config.block_size, config.num_blocks);
        let timeout = block_timeout_ns(config.block_size, config.initial_sample_rate).unwrap_or(0);
        let timing = TimingController::new(config.num_blocks, timeout);
        let position = Arc::new(PositionHandle::new(config.block_size));

        Self {
            sample_rate: SampleRate::new(config.initial_sample_rate),
            config,
            transport,
            clock,
            buffers,
            timing,
            input_format: None,
            output_format: None,
            reformatter: None,
            controls: Arc::new(ChannelControlState::new()),
            registry,
            control_handle: None,
            stats: Arc::new(EngineStats::new()),
            position,
            output_clients: 0,
            output_cleared: false,
            unsupported_warned: false,
            attached: false,
        }
    }

    /// 安装宿主定时器（MASTER/SLAVE 模式用）
    pub fn with_timer(mut self, timer: Box<dyn BlockTimer>) -> Self {
        self.timing.set_timer(timer);
        self
    }

    fn validate_format(direction: Direction, format: &StreamFormat) -> Result<(), EngineError> {
        if format.channels == 0 {
            return Err(EngineError::ConfigurationError(format!(
                "{} format has no channels",
                direction
            )));
        }
        if format.bit_width == 0 || format.bit_width % 8 != 0 {
            return Err(EngineError::ConfigurationError(format!(
                "{} format bit width {} is not byte aligned",
                direction, format.bit_width
            )));
        }
        if direction == Direction::Input && format.resolution() < transport::RESOLUTION {
            return Err(EngineError::ConfigurationError(format!(
                "input format needs at least {}-bit samples, got {}",
                transport::RESOLUTION * 8,
                format.bit_width
            )));
        }
        Ok(())
    }

    fn rebuild_reformatter(&mut self) {
        self.reformatter = self.input_format.map(|format| {
            SampleReformatter::new(
                format.resolution(),
                format.channels as usize,
                self.transport.device_info().in_channels as usize,
            )
        });
    }

    fn bring_up(&mut self) -> Result<(), EngineError> {
        if self.config.block_size == 0 || self.config.num_blocks == 0 {
            return Err(EngineError::ConfigurationError(
                "block size and block count must be non-zero".into(),
            ));
        }
        // 帧位置以 u32 报告，一整圈必须放得下
        if self.config.block_size as u64 * self.config.num_blocks as u64 > u32::MAX as u64 {
            return Err(EngineError::ConfigurationError(format!(
                "{} blocks x {} frames exceeds the 32-bit frame position",
                self.config.num_blocks, self.config.block_size
            )));
        }

        // 控制状态
        self.controls.reset();
        self.control_handle = Some(self.registry.register(&self.controls));

        // 流格式
        let rate = SampleRate::new(self.config.initial_sample_rate);
        let timeout = block_timeout_ns(self.config.block_size, rate.whole).ok_or_else(|| {
            EngineError::ConfigurationError("initial sample rate is zero".into())
        })?;

        let mut formats = [
            (Direction::Input, self.config.input_format),
            (Direction::Output, self.config.output_format),
        ];
        for (direction, format) in formats.iter_mut() {
            let format = format.as_mut().ok_or_else(|| {
                EngineError::ConfigurationError(format!("{} format descriptor missing", direction))
            })?;
            Self::validate_format(*direction, format)?;
            format.sample_rate = rate;
        }

        if let Some(ref desc) = self.config.description {
            log::info!("Device: {}", desc);
        }

        // 缓冲区
        for (direction, format) in formats.iter() {
            if let Some(format) = format {
                self.buffers.allocate(
                    *direction,
                    format.bytes_per_frame(),
                    self.config.lock_memory,
                )?;
            }
        }

        self.input_format = formats[0].1;
        self.output_format = formats[1].1;
        self.sample_rate = rate;
        self.timing.set_block_timeout_ns(timeout);
        self.rebuild_reformatter();

        Ok(())
    }

    /// bring-up 失败或 teardown 时按获取的逆序释放
    fn unwind(&mut self) {
        self.reformatter = None;
        self.buffers.release();
        if let Some(handle) = self.control_handle.take() {
            self.registry.unregister(handle);
        }
        self.input_format = None;
        self.output_format = None;
        self.attached = false;
    }

    /// 推进一个 block 并发布位置
    ///
    /// 必须是处理一个 block 的最后一步
    #[inline]
    fn advance_at(&mut self, now_ns: u64) {
        if self.timing.advance(now_ns) {
            self.stats.record_wrap();
        }
        self.position
            .publish(self.timing.cursor(), self.timing.timestamp().loop_count);
    }

    /// 样本入口：每个网络包调用一次
    ///
    /// 把 `raw` 里的 num_samples 帧重排到当前 block，然后推进 cursor。
    /// cursor 任何时刻只有一个驱动者：定时器已启动时归定时器，否则归包回调。
    /// 实时路径上的异常全部在本地吸收：
    /// - 缓冲区还没分配：静默丢弃
    /// - MASTER/SLAVE 模式但没有可用的定时器：记录诊断，不写也不推进
    pub fn deliver(&mut self, num_samples: usize, raw: &[u8]) {
        let mode = self.transport.mode();
        let timer_driven = mode.is_timer_driven();

        if timer_driven {
            // 运行中从 SPLIT 切过来：定时器接管推进
            if self.config.timer_roles && self.timing.is_running() {
                let now = self.clock.now_ns();
                self.timing.arm_timer(now);
            }
            if !self.timing.is_timer_armed() {
                self.stats.record_unsupported_mode();
                if !self.unsupported_warned {
                    self.unsupported_warned = true;
                    log::warn!("deliver(): {}", EngineError::UnsupportedMode(mode));
                }
                return;
            }
        }
        self.unsupported_warned = false;

        let Some(reformatter) = self.reformatter else {
            self.stats.record_dropped_no_buffer();
            return;
        };
        let reformatter =
            reformatter.with_wire_channels(self.transport.device_info().in_channels as usize);

        let cursor = self.timing.cursor();
        let Some(dst) = self.buffers.block_mut(Direction::Input, cursor) else {
            self.stats.record_dropped_no_buffer();
            return;
        };

        let frames = reformatter.reformat(dst, num_samples, raw);
        self.stats.record_block(frames);

        if !timer_driven {
            let now = self.clock.now_ns();
            self.advance_at(now);
        }
    }

    /// 定时器回调（MASTER/SLAVE）
    ///
    /// 传输层已切回 SPLIT 时取消定时器，推进交还给包回调。
    /// 否则没有消费者时先清空输出缓冲区，避免反复播放断开客户端的最后一段数据；
    /// 然后推进 cursor，并按理想网格重新设置下一次超时
    pub fn timer_fired(&mut self) {
        if !self.timing.is_timer_armed() {
            return;
        }

        let mode = self.transport.mode();
        if !mode.is_timer_driven() {
            self.timing.disarm_timer();
            log::info!("Block timer disarmed: transport switched to {}", mode);
            return;
        }

        let now = self.clock.now_ns();

        if self.output_clients == 0 {
            if !self.output_cleared {
                self.buffers.clear(Direction::Output);
                self.output_cleared = true;
                self.stats.record_consumer_gated();
            }
        } else {
            self.output_cleared = false;
        }

        self.advance_at(now);

        if let Some(lateness) = self.timing.rearm(now) {
            self.stats.on_timer_fired(lateness);
        }
    }

    /// 输出流上连接的客户端数
    pub fn set_output_clients(&mut self, clients: u32) {
        self.output_clients = clients;
        if clients > 0 {
            self.output_cleared = false;
        }
    }

    #[inline]
    pub fn output_clients(&self) -> u32 {
        self.output_clients
    }

    pub fn input_buffer(&self) -> Option<&[u8]> {
        self.buffers.buffer(Direction::Input)
    }

    pub fn output_buffer(&self) -> Option<&[u8]> {
        self.buffers.buffer(Direction::Output)
    }

    /// 宿主写输出数据用
    pub fn output_buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.buffers.buffer_mut(Direction::Output)
    }

    #[inline]
    pub fn cursor(&self) -> u32 {
        self.timing.cursor()
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timing.timestamp()
    }

    #[inline]
    pub fn timing_state(&self) -> TimingState {
        self.timing.state()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.timing.is_running()
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    #[inline]
    pub fn block_timeout_ns(&self) -> u64 {
        self.timing.block_timeout_ns()
    }

    #[inline]
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    pub fn format(&self, direction: Direction) -> Option<StreamFormat> {
        match direction {
            Direction::Input => self.input_format,
            Direction::Output => self.output_format,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 一整圈的帧数
    pub fn frames_per_buffer(&self) -> u64 {
        self.buffers.frames_per_buffer()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn position_handle(&self) -> Arc<PositionHandle> {
        Arc::clone(&self.position)
    }

    pub fn controls(&self) -> Arc<ChannelControlState> {
        Arc::clone(&self.controls)
    }

    /// 控制回调用的句柄，未 attach 时为 None
    pub fn control_handle(&self) -> Option<EngineHandle> {
        self.control_handle
    }
}

impl AudioEngine for ReacEngine {
    fn init_hardware(&mut self) -> Result<(), EngineError> {
        if self.attached {
            return Ok(());
        }

        match self.bring_up() {
            Ok(()) => {
                self.attached = true;
                log::info!(
                    "Engine attached: {} blocks x {} frames @ {}Hz, block period {}ns",
                    self.config.num_blocks,
                    self.config.block_size,
                    self.sample_rate.whole,
                    self.timing.block_timeout_ns()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("init_hardware() failed: {}", e);
                self.unwind();
                Err(e)
            }
        }
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if !self.attached {
            return Err(EngineError::InvalidState("engine is not attached"));
        }
        if self.timing.is_running() {
            return Ok(());
        }

        let mode = self.transport.mode();
        let mut arm = false;
        if mode.is_timer_driven() {
            if !self.config.timer_roles {
                log::warn!("start(): {}", EngineError::UnsupportedMode(mode));
            } else if !self.timing.has_timer() {
                log::warn!("start(): {} mode without a block timer", mode);
            } else {
                arm = true;
            }
        }

        let now = self.clock.now_ns();
        let armed = self.timing.start(now, arm);
        self.output_cleared = false;
        self.unsupported_warned = false;
        self.position
            .publish(0, self.timing.timestamp().loop_count);

        log::info!("Engine started ({} mode, timer armed: {})", mode, armed);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if self.timing.is_running() {
            self.timing.stop();
            log::info!("Engine stopped at block {}", self.timing.cursor());
        }
        Ok(())
    }

    fn on_format_change(
        &mut self,
        direction: Direction,
        format: Option<StreamFormat>,
        sample_rate: Option<SampleRate>,
    ) -> Result<(), EngineError> {
        // 先校验，失败时不改任何状态
        let rate_change = match sample_rate {
            Some(rate) => {
                let timeout = block_timeout_ns(self.config.block_size, rate.whole)
                    .ok_or_else(|| EngineError::ConfigurationError("sample rate is zero".into()))?;
                Some((rate, timeout))
            }
            None => None,
        };

        if let Some(mut format) = format {
            Self::validate_format(direction, &format)?;
            format.sample_rate = self.sample_rate;

            if !self
                .buffers
                .set_bytes_per_frame(direction, format.bytes_per_frame())
            {
                return Err(EngineError::ConfigurationError(format!(
                    "{} format ({}ch {}bit) does not fit the allocated buffer",
                    direction, format.channels, format.bit_width
                )));
            }
            match direction {
                Direction::Input => {
                    self.input_format = Some(format);
                    self.rebuild_reformatter();
                }
                Direction::Output => self.output_format = Some(format),
            }
            log::info!(
                "{} format changed: {}ch {}bit",
                direction,
                format.channels,
                format.bit_width
            );
        }

        if let Some((rate, timeout)) = rate_change {
            self.timing.set_block_timeout_ns(timeout);
            self.sample_rate = rate;
            for format in [&mut self.input_format, &mut self.output_format]
                .into_iter()
                .flatten()
            {
                format.sample_rate = rate;
            }
            log::info!("Sample rate changed: {}Hz, block period {}ns", rate.whole, timeout);
        }

        Ok(())
    }

    fn current_position(&self) -> u32 {
        self.buffers.current_position(self.timing.cursor())
    }

    fn teardown(&mut self) {
        self.timing.stop();
        if self.attached || self.control_handle.is_some() {
            log::info!("Engine detached");
        }
        self.unwind();
    }
}

impl Drop for ReacEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
