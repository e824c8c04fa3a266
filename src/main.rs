//! REAC Engine - REAC 虚拟声卡流核心
//!
//! 没有真实网卡时用两种方式驱动引擎：
//! - simulate：手动时钟 + 随机线上数据，按包驱动（或模拟定时器）跑固定数量的 block
//! - run：宿主单调时钟 + 截止时间定时器，实时跑 MASTER/SLAVE 定时器路径

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use reac_engine::audio::{
    timing, Direction, HostClock, ManualClock, MonotonicClock, StreamFormat,
};
use reac_engine::control::ControlRegistry;
use reac_engine::engine::{AudioEngine, BlockTimer, EngineConfig, HostAdapter, ReacEngine};
use reac_engine::transport::{self, DeviceInfo, ReacMode, StaticTransport};

/// REAC Engine - REAC virtual sound card streaming core
#[derive(Parser)]
#[command(name = "reac-engine")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Clone)]
struct GeometryArgs {
    /// Frames per block
    #[arg(long, default_value_t = transport::SAMPLES_PER_PACKET)]
    block_size: u32,

    /// Blocks in the ring buffer
    #[arg(long, default_value_t = transport::NUM_BLOCKS)]
    num_blocks: u32,

    /// Device channel count (both directions)
    #[arg(short, long, default_value_t = transport::MAX_CHANNELS as u16)]
    channels: u16,

    /// Sample rate in Hz
    #[arg(short = 'r', long, default_value_t = transport::SAMPLE_RATE)]
    sample_rate: u32,

    /// Lock sample buffers into memory
    #[arg(long)]
    lock_memory: bool,
}

impl GeometryArgs {
    fn config(&self, timer_roles: bool) -> EngineConfig {
        let format = StreamFormat::new(
            self.channels,
            (transport::RESOLUTION * 8) as u16,
            self.sample_rate,
        );
        EngineConfig {
            block_size: self.block_size,
            num_blocks: self.num_blocks,
            initial_sample_rate: self.sample_rate,
            description: Some(format!("REAC virtual device ({}ch)", self.channels)),
            input_format: Some(format),
            output_format: Some(format),
            lock_memory: self.lock_memory,
            timer_roles,
        }
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            in_channels: self.channels as u32,
            out_channels: self.channels as u32,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show buffer geometry and block timing
    Info {
        #[command(flatten)]
        geometry: GeometryArgs,
    },

    /// Feed random wire data through the engine with a simulated clock
    Simulate {
        #[command(flatten)]
        geometry: GeometryArgs,

        /// REAC mode (split, master, slave)
        #[arg(short, long, default_value = "split")]
        mode: ReacMode,

        /// Number of packets to deliver
        #[arg(short, long, default_value = "4096")]
        blocks: u64,

        /// Enable the timer-driven MASTER/SLAVE path
        #[arg(long)]
        timer_roles: bool,

        /// RNG seed for the wire data
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Drive the block timer in real time until Ctrl+C
    Run {
        #[command(flatten)]
        geometry: GeometryArgs,

        /// REAC mode (master or slave)
        #[arg(short, long, default_value = "master")]
        mode: ReacMode,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Output clients to report as connected
        #[arg(long, default_value = "0")]
        output_clients: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Info { ref geometry } => show_info(geometry),
        Commands::Simulate {
            ref geometry,
            mode,
            blocks,
            timer_roles,
            seed,
        } => simulate(geometry, mode, blocks, timer_roles, seed),
        Commands::Run {
            ref geometry,
            mode,
            seconds,
            output_clients,
        } => run(geometry, mode, seconds, output_clients),
    }
}

/// 显示缓冲区几何和 block 周期
fn show_info(geometry: &GeometryArgs) -> anyhow::Result<()> {
    let config = geometry.config(false);
    let bytes_per_frame = geometry.channels as usize * transport::RESOLUTION;
    let frames = config.block_size as u64 * config.num_blocks as u64;
    let timeout = timing::block_timeout_ns(config.block_size, config.initial_sample_rate)
        .context("sample rate must be non-zero")?;

    println!("=== REAC Engine Geometry ===\n");
    println!("Channels:        {} ({}-bit)", geometry.channels, transport::RESOLUTION * 8);
    println!("Sample rate:     {} Hz", config.initial_sample_rate);
    println!("Block size:      {} frames", config.block_size);
    println!("Blocks:          {}", config.num_blocks);
    println!("Frames/buffer:   {}", frames);
    println!(
        "Buffer size:     {} bytes per direction",
        frames * bytes_per_frame as u64
    );
    println!(
        "Block period:    {} ns ({:.3} ms)",
        timeout,
        timeout as f64 / 1_000_000.0
    );
    println!(
        "Buffer period:   {:.3} ms",
        (timeout as f64 * config.num_blocks as f64) / 1_000_000.0
    );
    println!("Wire frame:      {}", wire_frame_layout(geometry.channels));
    Ok(())
}

/// 线上帧布局说明：两个声道的 24-bit 样本拆开放在一个 6 字节子字里
fn wire_frame_layout(channels: u16) -> String {
    let bytes = channels as usize * transport::RESOLUTION;
    let subwords = (channels as usize + 1) / 2;
    format!(
        "{} bytes ({}-bit samples, {} x 6-byte sub-words of split channel pairs)",
        bytes,
        transport::RESOLUTION * 8,
        subwords
    )
}

/// 模拟定时器：只记住下一次超时，由调用方推进手动时钟
#[derive(Clone, Default)]
struct PendingTimer {
    timeout: Arc<AtomicU64>,
    armed: Arc<AtomicBool>,
}

impl BlockTimer for PendingTimer {
    fn set_timeout_ns(&mut self, timeout_ns: u64) {
        self.timeout.store(timeout_ns, Ordering::Relaxed);
        self.armed.store(true, Ordering::Relaxed);
    }

    fn cancel(&mut self) {
        self.armed.store(false, Ordering::Relaxed);
    }
}

fn simulate(
    geometry: &GeometryArgs,
    mode: ReacMode,
    blocks: u64,
    timer_roles: bool,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let device = Arc::new(StaticTransport::new(geometry.device_info(), mode));
    let clock = Arc::new(ManualClock::new(0));
    let registry = Arc::new(ControlRegistry::new());
    let timer = PendingTimer::default();

    let engine = ReacEngine::new(
        geometry.config(timer_roles),
        device,
        clock.clone(),
        registry,
    )
    .with_timer(Box::new(timer.clone()));
    let stats = engine.stats();

    let mut host = HostAdapter::new(engine);
    host.attach().context("engine bring-up failed")?;
    host.start()?;

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let block_size = geometry.block_size as usize;
    let wire_bytes = block_size * geometry.channels as usize * transport::RESOLUTION;
    let mut raw = vec![0u8; wire_bytes];
    let period = host.engine().block_timeout_ns();

    println!(
        "Simulating {} packets ({} mode, {} frames each)...",
        blocks, mode, block_size
    );

    for _ in 0..blocks {
        rng.fill(&mut raw[..]);
        host.engine_mut().deliver(block_size, &raw);

        if timer.armed.load(Ordering::Relaxed) {
            clock.advance(timer.timeout.load(Ordering::Relaxed));
            host.engine_mut().timer_fired();
        } else {
            clock.advance(period);
        }
    }

    let engine = host.engine();
    let timestamp = engine.timestamp();
    println!(
        "Position: {} frames (block {}), loops: {}, last wrap at {} ns\n",
        engine.current_position(),
        engine.cursor(),
        timestamp.loop_count,
        timestamp.time_ns
    );
    print!("{}", stats.report(period));

    if let (Some(buffer), Some(format)) = (engine.input_buffer(), engine.format(Direction::Input)) {
        let frames = if stats.wraps() > 0 {
            engine.frames_per_buffer() as usize
        } else {
            engine.current_position() as usize
        };
        print_peaks(&buffer[..frames * format.bytes_per_frame()], &format);
    }

    host.stop()?;
    host.detach();
    Ok(())
}

/// 按通道打印峰值电平
fn print_peaks(bytes: &[u8], format: &StreamFormat) {
    let channels = format.channels as usize;
    if bytes.is_empty() || channels == 0 {
        return;
    }

    let mut samples = vec![0i32; bytes.len() / format.resolution()];
    let count = format.bytes_to_samples(bytes, &mut samples);

    let mut peaks = vec![0u32; channels];
    for (i, sample) in samples[..count].iter().enumerate() {
        let peak = &mut peaks[i % channels];
        *peak = (*peak).max(sample.unsigned_abs());
    }

    println!("\nInput peaks:");
    for (ch, peak) in peaks.iter().enumerate() {
        let level = *peak as f64 / 2_147_483_648.0;
        let db = if level > 0.0 {
            20.0 * level.log10()
        } else {
            f64::NEG_INFINITY
        };
        println!("  ch{:<2} {:>7.2} dBFS", ch + 1, db);
    }
}

/// 截止时间定时器
///
/// 记录绝对截止时间，主循环到点后派发 `timer_fired`
struct DeadlineTimer {
    clock: Arc<dyn MonotonicClock>,
    deadline_ns: Arc<AtomicU64>,
}

impl BlockTimer for DeadlineTimer {
    fn set_timeout_ns(&mut self, timeout_ns: u64) {
        let deadline = self.clock.now_ns().saturating_add(timeout_ns);
        self.deadline_ns.store(deadline, Ordering::Release);
    }

    fn cancel(&mut self) {
        self.deadline_ns.store(u64::MAX, Ordering::Release);
    }
}

fn run(
    geometry: &GeometryArgs,
    mode: ReacMode,
    seconds: Option<u64>,
    output_clients: u32,
) -> anyhow::Result<()> {
    if !mode.is_timer_driven() {
        anyhow::bail!("run needs a timer-driven mode (master or slave), got {}", mode);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let clock: Arc<dyn MonotonicClock> = Arc::new(HostClock);
    let deadline_ns = Arc::new(AtomicU64::new(u64::MAX));
    let timer = DeadlineTimer {
        clock: clock.clone(),
        deadline_ns: deadline_ns.clone(),
    };

    let device = Arc::new(StaticTransport::new(geometry.device_info(), mode));
    let registry = Arc::new(ControlRegistry::new());
    let engine = ReacEngine::new(geometry.config(true), device, clock.clone(), registry)
        .with_timer(Box::new(timer));
    let stats = engine.stats();
    let position = engine.position_handle();

    let mut host = HostAdapter::new(engine);
    host.attach().context("engine bring-up failed")?;
    host.engine_mut().set_output_clients(output_clients);
    host.start()?;

    let period = host.engine().block_timeout_ns();
    println!(
        "Running {} mode, block period {:.3} ms. Press Ctrl+C to stop.\n",
        mode,
        period as f64 / 1_000_000.0
    );

    let started = Instant::now();
    let limit = seconds.map(Duration::from_secs);
    let mut last_status = Instant::now();

    while running.load(Ordering::SeqCst) {
        if limit.map_or(false, |limit| started.elapsed() >= limit) {
            break;
        }

        let deadline = deadline_ns.load(Ordering::Acquire);
        let now = clock.now_ns();
        if now >= deadline {
            host.engine_mut().timer_fired();
        } else {
            let wait = (deadline - now).min(1_000_000);
            std::thread::sleep(Duration::from_nanos(wait));
        }

        if last_status.elapsed() >= Duration::from_millis(500) {
            print!(
                "\r  Position: {:>8}  |  Loops: {:>6}  |  Fires: {:>8}  ",
                position.current_position(),
                position.loop_count(),
                stats.timer_fires()
            );
            std::io::stdout().flush()?;
            last_status = Instant::now();
        }
    }

    println!("\n");
    host.stop()?;
    print!("{}", stats.report(period));
    host.detach();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_frame_layout() {
        assert_eq!(
            wire_frame_layout(16),
            "48 bytes (24-bit samples, 8 x 6-byte sub-words of split channel pairs)"
        );
        assert_eq!(
            wire_frame_layout(3),
            "9 bytes (24-bit samples, 2 x 6-byte sub-words of split channel pairs)"
        );
    }
}
