//! 循环样本缓冲区
//!
//! 设计目标：
//! - 零分配：输入/输出两块缓冲区只在 bring-up 时分配一次
//! - 按 block 寻址：`offset = cursor × blockSize × bytesPerFrame`
//! - 内存锁定：可选 mlock 防止实时路径上的 page fault
//!
//! 缓冲区由引擎独占，宿主消费端只读到 `current_position()` 为止

use thiserror::Error;

use super::format::Direction;

/// 缓冲区分配失败
#[derive(Debug, Error)]
#[error("failed to allocate {bytes} bytes for {direction} buffer")]
pub struct AllocationError {
    pub direction: Direction,
    pub bytes: usize,
}

/// 计算 block 的字节偏移
#[inline]
pub fn block_offset(cursor: u32, block_size: u32, bytes_per_frame: usize) -> usize {
    cursor as usize * block_size as usize * bytes_per_frame
}

/// 单方向的样本缓冲区
pub struct SampleBuffer {
    data: Box<[u8]>,
    memory_locked: bool,
}

impl SampleBuffer {
    /// 分配并清零指定大小的缓冲区
    ///
    /// 分配器拿不到内存（或大小为 0）时返回 `AllocationError`，不会 abort
    pub fn allocate(direction: Direction, size_bytes: usize) -> Result<Self, AllocationError> {
        let err = || AllocationError {
            direction,
            bytes: size_bytes,
        };
        if size_bytes == 0 {
            return Err(err());
        }

        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(size_bytes).map_err(|_| err())?;
        data.resize(size_bytes, 0);

        Ok(Self {
            data: data.into_boxed_slice(),
            memory_locked: false,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let ptr = self.data.as_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.data.len()) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Sample buffer memory locked: {} bytes", self.data.len());
            true
        } else {
            log::warn!(
                "Failed to lock sample buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        let ptr = self.data.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.data.len());
        }

        self.memory_locked = false;
        log::debug!("Sample buffer memory unlocked");
    }

    #[inline]
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked
    }
}

impl Drop for SampleBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 一个方向的缓冲区及其帧宽度
struct Slot {
    buffer: Option<SampleBuffer>,
    bytes_per_frame: usize,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            buffer: None,
            bytes_per_frame: 0,
        }
    }
}

/// 输入/输出缓冲区管理
pub struct RingBufferManager {
    block_size: u32,
    num_blocks: u32,
    input: Slot,
    output: Slot,
}

impl RingBufferManager {
    pub fn new(block_size: u32, num_blocks: u32) -> Self {
        Self {
            block_size,
            num_blocks,
            input: Slot::empty(),
            output: Slot::empty(),
        }
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// 一整圈的帧数
    #[inline]
    pub fn frames_per_buffer(&self) -> u64 {
        self.block_size as u64 * self.num_blocks as u64
    }

    /// 给定帧宽度时的缓冲区大小，溢出时返回 None
    pub fn buffer_size(&self, bytes_per_frame: usize) -> Option<usize> {
        (self.block_size as usize)
            .checked_mul(self.num_blocks as usize)?
            .checked_mul(bytes_per_frame)
    }

    fn slot(&self, direction: Direction) -> &Slot {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut Slot {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    /// 分配一个方向的缓冲区
    ///
    /// 已经分配过时保留原缓冲区，只更新帧宽度（前提是放得下）
    pub fn allocate(
        &mut self,
        direction: Direction,
        bytes_per_frame: usize,
        lock_memory: bool,
    ) -> Result<(), AllocationError> {
        let size = self
            .buffer_size(bytes_per_frame)
            .ok_or(AllocationError {
                direction,
                bytes: usize::MAX,
            })?;

        let slot = self.slot_mut(direction);
        if let Some(ref buffer) = slot.buffer {
            if buffer.len() >= size {
                slot.bytes_per_frame = bytes_per_frame;
                return Ok(());
            }
            return Err(AllocationError {
                direction,
                bytes: size,
            });
        }

        log::info!("Allocating {} buffer - {} bytes", direction, size);
        let mut buffer = SampleBuffer::allocate(direction, size)?;
        if lock_memory {
            buffer.lock_memory();
        }
        slot.buffer = Some(buffer);
        slot.bytes_per_frame = bytes_per_frame;
        Ok(())
    }

    /// 释放两块缓冲区（幂等）
    pub fn release(&mut self) {
        for direction in [Direction::Input, Direction::Output] {
            let slot = self.slot_mut(direction);
            if slot.buffer.take().is_some() {
                log::info!("Released {} buffer", direction);
            }
            slot.bytes_per_frame = 0;
        }
    }

    #[inline]
    pub fn is_allocated(&self, direction: Direction) -> bool {
        self.slot(direction).buffer.is_some()
    }

    /// 一个方向当前的帧宽度（未分配时为 0）
    #[inline]
    pub fn bytes_per_frame(&self, direction: Direction) -> usize {
        self.slot(direction).bytes_per_frame
    }

    /// 重新协商帧宽度
    ///
    /// 新的一整圈必须放得进已分配的缓冲区，否则返回 false 且不做修改
    pub fn set_bytes_per_frame(&mut self, direction: Direction, bytes_per_frame: usize) -> bool {
        let needed = self.buffer_size(bytes_per_frame);
        let slot = self.slot_mut(direction);
        match (&slot.buffer, needed) {
            (Some(buffer), Some(needed)) if needed <= buffer.len() => {
                slot.bytes_per_frame = bytes_per_frame;
                true
            }
            _ => false,
        }
    }

    /// cursor 对应 block 的字节偏移
    #[inline]
    pub fn offset(&self, direction: Direction, cursor: u32) -> usize {
        block_offset(cursor, self.block_size, self.bytes_per_frame(direction))
    }

    /// 宿主可见的当前帧位置
    ///
    /// 只报告已完成的 block，宁可偏早也不能偏晚：
    /// erase head 会擦到这个位置为止（不含）
    #[inline]
    pub fn current_position(&self, cursor: u32) -> u32 {
        cursor * self.block_size
    }

    /// 整个缓冲区（只读）
    pub fn buffer(&self, direction: Direction) -> Option<&[u8]> {
        self.slot(direction).buffer.as_ref().map(SampleBuffer::as_slice)
    }

    /// 整个缓冲区（可写）
    pub fn buffer_mut(&mut self, direction: Direction) -> Option<&mut [u8]> {
        self.slot_mut(direction)
            .buffer
            .as_mut()
            .map(SampleBuffer::as_mut_slice)
    }

    /// cursor 对应的一个 block 区域
    ///
    /// 缓冲区未分配或 cursor 越界时返回 None
    pub fn block_mut(&mut self, direction: Direction, cursor: u32) -> Option<&mut [u8]> {
        if cursor >= self.num_blocks {
            return None;
        }
        let start = self.offset(direction, cursor);
        let len = self.block_size as usize * self.bytes_per_frame(direction);
        self.buffer_mut(direction)?.get_mut(start..start + len)
    }

    /// 清零一个方向的缓冲区，不重新分配
    pub fn clear(&mut self, direction: Direction) {
        if let Some(buffer) = self.buffer_mut(direction) {
            buffer.fill(0);
        }
    }
}

impl Drop for RingBufferManager {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_formula() {
        assert_eq!(block_offset(0, 12, 48), 0);
        assert_eq!(block_offset(1, 12, 48), 576);
        assert_eq!(block_offset(3, 512, 6), 3 * 512 * 6);
    }

    #[test]
    fn test_every_block_fits_in_buffer() {
        let mut rb = RingBufferManager::new(12, 64);
        rb.allocate(Direction::Input, 48, false).unwrap();
        let size = rb.buffer(Direction::Input).unwrap().len();
        assert_eq!(size, 12 * 64 * 48);

        for cursor in 0..rb.num_blocks() {
            let end = rb.offset(Direction::Input, cursor) + 12 * 48;
            assert!(end <= size, "block {} overruns buffer", cursor);
            assert_eq!(rb.block_mut(Direction::Input, cursor).unwrap().len(), 12 * 48);
        }
        assert!(rb.block_mut(Direction::Input, 64).is_none());
    }

    #[test]
    fn test_current_position_is_block_aligned() {
        let rb = RingBufferManager::new(12, 1024);
        assert_eq!(rb.current_position(0), 0);
        assert_eq!(rb.current_position(5), 60);
        assert_eq!(rb.frames_per_buffer(), 12 * 1024);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut rb = RingBufferManager::new(12, 8);
        rb.allocate(Direction::Input, 6, false).unwrap();
        rb.allocate(Direction::Output, 6, false).unwrap();
        assert!(rb.is_allocated(Direction::Output));

        rb.release();
        rb.release();
        assert!(!rb.is_allocated(Direction::Input));
        assert!(!rb.is_allocated(Direction::Output));
        assert!(rb.block_mut(Direction::Input, 0).is_none());
    }

    #[test]
    fn test_allocate_keeps_existing_buffer() {
        let mut rb = RingBufferManager::new(4, 2);
        rb.allocate(Direction::Input, 6, false).unwrap();
        rb.buffer_mut(Direction::Input).unwrap()[0] = 0xAB;

        // 第二次 bring-up 不重新分配
        rb.allocate(Direction::Input, 6, false).unwrap();
        assert_eq!(rb.buffer(Direction::Input).unwrap()[0], 0xAB);

        // 更宽的帧放不下
        assert!(rb.allocate(Direction::Input, 12, false).is_err());
    }

    #[test]
    fn test_zero_size_is_allocation_failure() {
        let err = SampleBuffer::allocate(Direction::Output, 0).err().unwrap();
        assert_eq!(err.direction, Direction::Output);
        assert_eq!(err.bytes, 0);
    }

    #[test]
    fn test_huge_size_is_allocation_failure() {
        let mut rb = RingBufferManager::new(u32::MAX, u32::MAX);
        assert!(rb.allocate(Direction::Input, usize::MAX / 2, false).is_err());
        assert!(!rb.is_allocated(Direction::Input));
    }

    #[test]
    fn test_set_bytes_per_frame() {
        let mut rb = RingBufferManager::new(4, 4);
        assert!(!rb.set_bytes_per_frame(Direction::Input, 6));

        rb.allocate(Direction::Input, 6, false).unwrap();
        assert!(rb.set_bytes_per_frame(Direction::Input, 3));
        assert_eq!(rb.bytes_per_frame(Direction::Input), 3);
        assert!(!rb.set_bytes_per_frame(Direction::Input, 9));
        assert_eq!(rb.bytes_per_frame(Direction::Input), 3);
    }

    #[test]
    fn test_clear() {
        let mut rb = RingBufferManager::new(2, 2);
        rb.allocate(Direction::Output, 3, false).unwrap();
        rb.buffer_mut(Direction::Output).unwrap().fill(0x55);
        rb.clear(Direction::Output);
        assert!(rb.buffer(Direction::Output).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_memory_lock_state() {
        let mut buf = SampleBuffer::allocate(Direction::Input, 4096).unwrap();
        assert!(!buf.is_memory_locked());

        // 受 RLIMIT_MEMLOCK 限制，锁定可能失败，但状态必须和返回值一致
        let locked = buf.lock_memory();
        assert_eq!(buf.is_memory_locked(), locked);

        buf.unlock_memory();
        assert!(!buf.is_memory_locked());
    }
}
