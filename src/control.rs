//! 声道控制状态
//!
//! 每个声道（0 = 全部，1..=16）一组音量/增益/静音值。
//! 控制回调是单写者：每次变更只有一个串行化的回调写入，
//! 所以只需要原子标量写，不需要锁。
//!
//! 控制回调不持有引擎：它们拿到的是 `EngineHandle`，
//! 在 `ControlRegistry` 里查到 `Weak` 引用后再写入。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use crate::transport::MAX_CHANNELS;

/// 音量上限
pub const VOLUME_MAX: u32 = 65535;

/// 增益上限
pub const GAIN_MAX: u32 = 65535;

/// 声道 id 数量（含 0 号"全部"声道）
const CHANNEL_SLOTS: usize = MAX_CHANNELS + 1;

/// 控制变更错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("channel {0} out of range (0..=16)")]
    ChannelOutOfRange(u32),
    #[error("value {0} out of range (0..={1})")]
    ValueOutOfRange(i32, u32),
    #[error("engine {0:?} is no longer attached")]
    EngineGone(EngineHandle),
}

/// 单个声道的状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    pub volume: u32,
    pub gain: u32,
    pub mute_in: bool,
    pub mute_out: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            volume: VOLUME_MAX,
            gain: GAIN_MAX,
            mute_in: false,
            mute_out: false,
        }
    }
}

/// 全部声道的控制状态
pub struct ChannelControlState {
    volume: [AtomicU32; CHANNEL_SLOTS],
    gain: [AtomicU32; CHANNEL_SLOTS],
    mute_in: [AtomicBool; CHANNEL_SLOTS],
    mute_out: [AtomicBool; CHANNEL_SLOTS],
}

impl ChannelControlState {
    pub fn new() -> Self {
        Self {
            volume: std::array::from_fn(|_| AtomicU32::new(VOLUME_MAX)),
            gain: std::array::from_fn(|_| AtomicU32::new(GAIN_MAX)),
            mute_in: std::array::from_fn(|_| AtomicBool::new(false)),
            mute_out: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// 校验声道 id；超出 16 的一律拒绝，不截断
    #[inline]
    fn index(channel: u32) -> Result<usize, ControlError> {
        let idx = channel as usize;
        if idx < CHANNEL_SLOTS {
            Ok(idx)
        } else {
            Err(ControlError::ChannelOutOfRange(channel))
        }
    }

    #[inline]
    fn level(value: i32, max: u32) -> Result<u32, ControlError> {
        u32::try_from(value)
            .ok()
            .filter(|&v| v <= max)
            .ok_or(ControlError::ValueOutOfRange(value, max))
    }

    pub fn set_volume(&self, channel: u32, value: i32) -> Result<(), ControlError> {
        let idx = Self::index(channel)?;
        let value = Self::level(value, VOLUME_MAX)?;
        self.volume[idx].store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_gain(&self, channel: u32, value: i32) -> Result<(), ControlError> {
        let idx = Self::index(channel)?;
        let value = Self::level(value, GAIN_MAX)?;
        self.gain[idx].store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_mute_in(&self, channel: u32, muted: bool) -> Result<(), ControlError> {
        let idx = Self::index(channel)?;
        self.mute_in[idx].store(muted, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_mute_out(&self, channel: u32, muted: bool) -> Result<(), ControlError> {
        let idx = Self::index(channel)?;
        self.mute_out[idx].store(muted, Ordering::Relaxed);
        Ok(())
    }

    pub fn volume(&self, channel: u32) -> Result<u32, ControlError> {
        Ok(self.volume[Self::index(channel)?].load(Ordering::Relaxed))
    }

    pub fn gain(&self, channel: u32) -> Result<u32, ControlError> {
        Ok(self.gain[Self::index(channel)?].load(Ordering::Relaxed))
    }

    pub fn mute_in(&self, channel: u32) -> Result<bool, ControlError> {
        Ok(self.mute_in[Self::index(channel)?].load(Ordering::Relaxed))
    }

    pub fn mute_out(&self, channel: u32) -> Result<bool, ControlError> {
        Ok(self.mute_out[Self::index(channel)?].load(Ordering::Relaxed))
    }

    /// 单个声道的快照
    pub fn snapshot(&self, channel: u32) -> Result<ChannelState, ControlError> {
        let idx = Self::index(channel)?;
        Ok(ChannelState {
            volume: self.volume[idx].load(Ordering::Relaxed),
            gain: self.gain[idx].load(Ordering::Relaxed),
            mute_in: self.mute_in[idx].load(Ordering::Relaxed),
            mute_out: self.mute_out[idx].load(Ordering::Relaxed),
        })
    }

    /// 恢复默认值
    pub fn reset(&self) {
        for idx in 0..CHANNEL_SLOTS {
            self.volume[idx].store(VOLUME_MAX, Ordering::Relaxed);
            self.gain[idx].store(GAIN_MAX, Ordering::Relaxed);
            self.mute_in[idx].store(false, Ordering::Relaxed);
            self.mute_out[idx].store(false, Ordering::Relaxed);
        }
    }
}

impl Default for ChannelControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// 控制回调用的非持有句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(u32);

impl EngineHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// 句柄 → 控制状态的查找表
///
/// 表里只存 `Weak`，引擎析构后查找自然失败
#[derive(Default)]
pub struct ControlRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u32,
    entries: HashMap<EngineHandle, Weak<ChannelControlState>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个引擎的控制状态
    pub fn register(&self, state: &Arc<ChannelControlState>) -> EngineHandle {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let handle = EngineHandle(inner.next_id);
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.entries.insert(handle, Arc::downgrade(state));
        handle
    }

    /// 注销（幂等）
    pub fn unregister(&self, handle: EngineHandle) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(&handle);
    }

    pub fn lookup(&self, handle: EngineHandle) -> Option<Arc<ChannelControlState>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(&handle).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_state<F>(&self, handle: EngineHandle, f: F) -> Result<(), ControlError>
    where
        F: FnOnce(&ChannelControlState) -> Result<(), ControlError>,
    {
        let state = self
            .lookup(handle)
            .ok_or(ControlError::EngineGone(handle))?;
        f(&state)
    }

    /// 音量控制回调 `(channel, old, new)`
    pub fn volume_changed(
        &self,
        handle: EngineHandle,
        channel: u32,
        old_value: i32,
        new_value: i32,
    ) -> Result<(), ControlError> {
        log::trace!("volume ch{}: {} -> {}", channel, old_value, new_value);
        self.with_state(handle, |s| s.set_volume(channel, new_value))
    }

    /// 增益控制回调 `(channel, old, new)`
    pub fn gain_changed(
        &self,
        handle: EngineHandle,
        channel: u32,
        old_value: i32,
        new_value: i32,
    ) -> Result<(), ControlError> {
        log::trace!("gain ch{}: {} -> {}", channel, old_value, new_value);
        self.with_state(handle, |s| s.set_gain(channel, new_value))
    }

    /// 输入静音回调，非 0 即静音
    pub fn input_mute_changed(
        &self,
        handle: EngineHandle,
        channel: u32,
        _old_value: i32,
        new_value: i32,
    ) -> Result<(), ControlError> {
        self.with_state(handle, |s| s.set_mute_in(channel, new_value != 0))
    }

    /// 输出静音回调，非 0 即静音
    pub fn output_mute_changed(
        &self,
        handle: EngineHandle,
        channel: u32,
        _old_value: i32,
        new_value: i32,
    ) -> Result<(), ControlError> {
        self.with_state(handle, |s| s.set_mute_out(channel, new_value != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let state = ChannelControlState::new();
        for ch in 0..=16 {
            assert_eq!(state.snapshot(ch).unwrap(), ChannelState::default());
        }
        assert_eq!(state.volume(3).unwrap(), 65535);
        assert!(!state.mute_out(0).unwrap());
    }

    #[test]
    fn test_last_channel_is_writable() {
        let state = ChannelControlState::new();
        state.set_volume(16, 1234).unwrap();
        assert_eq!(state.volume(16).unwrap(), 1234);
    }

    #[test]
    fn test_channel_17_is_rejected() {
        let state = ChannelControlState::new();
        assert_eq!(
            state.set_volume(17, 10),
            Err(ControlError::ChannelOutOfRange(17))
        );
        assert_eq!(state.set_mute_in(17, true), Err(ControlError::ChannelOutOfRange(17)));
        assert!(state.volume(17).is_err());

        // 相邻声道没有被截断写入
        assert_eq!(state.volume(16).unwrap(), VOLUME_MAX);
    }

    #[test]
    fn test_value_range() {
        let state = ChannelControlState::new();
        assert_eq!(
            state.set_gain(1, 70000),
            Err(ControlError::ValueOutOfRange(70000, GAIN_MAX))
        );
        assert_eq!(
            state.set_volume(1, -1),
            Err(ControlError::ValueOutOfRange(-1, VOLUME_MAX))
        );
        state.set_gain(1, 0).unwrap();
        assert_eq!(state.gain(1).unwrap(), 0);
    }

    #[test]
    fn test_reset() {
        let state = ChannelControlState::new();
        state.set_volume(2, 0).unwrap();
        state.set_mute_out(2, true).unwrap();
        state.reset();
        assert_eq!(state.snapshot(2).unwrap(), ChannelState::default());
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = ControlRegistry::new();
        let state = Arc::new(ChannelControlState::new());
        let handle = registry.register(&state);

        registry.volume_changed(handle, 4, 65535, 100).unwrap();
        registry.gain_changed(handle, 4, 65535, 200).unwrap();
        registry.input_mute_changed(handle, 0, 0, 1).unwrap();
        registry.output_mute_changed(handle, 0, 0, 1).unwrap();

        let snap = state.snapshot(4).unwrap();
        assert_eq!(snap.volume, 100);
        assert_eq!(snap.gain, 200);
        assert!(state.mute_in(0).unwrap());
        assert!(state.mute_out(0).unwrap());

        assert_eq!(
            registry.volume_changed(handle, 17, 0, 1),
            Err(ControlError::ChannelOutOfRange(17))
        );
    }

    #[test]
    fn test_registry_does_not_keep_state_alive() {
        let registry = ControlRegistry::new();
        let state = Arc::new(ChannelControlState::new());
        let handle = registry.register(&state);
        assert!(registry.lookup(handle).is_some());

        drop(state);
        assert!(registry.lookup(handle).is_none());
        assert_eq!(
            registry.volume_changed(handle, 1, 0, 1),
            Err(ControlError::EngineGone(handle))
        );
    }

    #[test]
    fn test_unregister() {
        let registry = ControlRegistry::new();
        let state = Arc::new(ChannelControlState::new());
        let a = registry.register(&state);
        let b = registry.register(&state);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.unregister(a);
        registry.unregister(a);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(a).is_none());
    }
}
