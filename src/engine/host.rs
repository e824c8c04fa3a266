//! 宿主适配层
//!
//! 把宿主的驱动生命周期（加载 / 启动 / 停止 / 卸载）映射到 `AudioEngine`。
//! 加载失败时引擎已经自行回滚，适配器只负责记录并把错误交回宿主。

use super::{AudioEngine, EngineError};
use crate::audio::{Direction, SampleRate, StreamFormat};

pub struct HostAdapter<E: AudioEngine> {
    engine: E,
    attached: bool,
}

impl<E: AudioEngine> HostAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            attached: false,
        }
    }

    /// 驱动加载：执行引擎 bring-up
    pub fn attach(&mut self) -> Result<(), EngineError> {
        if self.attached {
            return Ok(());
        }
        if let Err(e) = self.engine.init_hardware() {
            log::error!("Driver load failed: {}", e);
            return Err(e);
        }
        self.attached = true;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if !self.attached {
            return Err(EngineError::InvalidState("driver is not loaded"));
        }
        self.engine.start()
    }

    pub fn stop(&mut self) -> Result<(), EngineError> {
        if !self.attached {
            return Ok(());
        }
        self.engine.stop()
    }

    /// 驱动卸载：停止并释放引擎资源（幂等）
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        if let Err(e) = self.engine.stop() {
            log::warn!("Stop during detach failed: {}", e);
        }
        self.engine.teardown();
        self.attached = false;
    }

    /// 宿主发起的格式/采样率切换
    pub fn format_change(
        &mut self,
        direction: Direction,
        format: Option<StreamFormat>,
        sample_rate: Option<SampleRate>,
    ) -> Result<(), EngineError> {
        self.engine.on_format_change(direction, format, sample_rate)
    }

    #[inline]
    pub fn current_position(&self) -> u32 {
        self.engine.current_position()
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: AudioEngine> Drop for HostAdapter<E> {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::audio::ManualClock;
    use crate::control::ControlRegistry;
    use crate::engine::{EngineConfig, ReacEngine};
    use crate::transport::{DeviceInfo, ReacMode, StaticTransport};

    fn adapter(config: EngineConfig, registry: &Arc<ControlRegistry>) -> HostAdapter<ReacEngine> {
        let transport = Arc::new(StaticTransport::new(
            DeviceInfo {
                in_channels: 16,
                out_channels: 16,
            },
            ReacMode::Split,
        ));
        let engine = ReacEngine::new(
            config,
            transport,
            Arc::new(ManualClock::new(0)),
            Arc::clone(registry),
        );
        HostAdapter::new(engine)
    }

    #[test]
    fn test_lifecycle() {
        let registry = Arc::new(ControlRegistry::new());
        let mut host = adapter(EngineConfig::default(), &registry);

        assert!(matches!(host.start(), Err(EngineError::InvalidState(_))));

        host.attach().unwrap();
        host.attach().unwrap();
        assert!(host.is_attached());
        assert_eq!(registry.len(), 1);

        host.start().unwrap();
        assert!(host.engine().is_running());

        let raw = vec![0u8; 12 * 48];
        host.engine_mut().deliver(12, &raw);
        assert_eq!(host.current_position(), 12);

        host.detach();
        assert!(!host.is_attached());
        assert!(!host.engine().is_running());
        assert!(host.engine().input_buffer().is_none());
        assert!(registry.is_empty());

        // 卸载后停止是空操作
        host.stop().unwrap();
    }

    #[test]
    fn test_attach_failure_leaves_nothing_behind() {
        let registry = Arc::new(ControlRegistry::new());
        let config = EngineConfig {
            input_format: None,
            ..EngineConfig::default()
        };
        let mut host = adapter(config, &registry);

        assert!(matches!(
            host.attach(),
            Err(EngineError::ConfigurationError(_))
        ));
        assert!(!host.is_attached());
        assert!(registry.is_empty());
        assert!(host.engine().output_buffer().is_none());
    }

    #[test]
    fn test_format_change_passthrough() {
        let registry = Arc::new(ControlRegistry::new());
        let mut host = adapter(EngineConfig::default(), &registry);
        host.attach().unwrap();

        host.format_change(Direction::Input, None, Some(SampleRate::new(96000)))
            .unwrap();
        assert_eq!(host.engine().block_timeout_ns(), 125_000);
        assert_eq!(host.engine().sample_rate().whole, 96000);
    }

    #[test]
    fn test_drop_detaches() {
        let registry = Arc::new(ControlRegistry::new());
        {
            let mut host = adapter(EngineConfig::default(), &registry);
            host.attach().unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
