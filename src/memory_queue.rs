//! 有界内存块队列
//!
//! 单生产者/单消费者，容量固定，用于解耦管道的相邻阶段并提供背压。
//! push/pop在满/空时按固定间隔轮询等待，每个周期检查一次共享中断标志，
//! 中断后不会永久阻塞。

use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::block_allocator::{Block, BlockAllocator};
use crate::error::interrupted;
use crate::interrupt::Interrupt;

/// 默认容量：1280块，8 KiB块时约10 MiB
pub const DEFAULT_QUEUE_CAPACITY: usize = 1280;

/// 轮询等待周期
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 队列中的条目，`None` 为流结束的毒丸
type Slot = Option<Block>;

/// 有界内存块队列
pub struct MemoryQueue {
    name: &'static str,
    allocator: Arc<BlockAllocator>,
    interrupt: Interrupt,
    sender: Sender<Slot>,
    receiver: Receiver<Slot>,
}

impl MemoryQueue {
    pub fn new(
        name: &'static str,
        allocator: Arc<BlockAllocator>,
        capacity: usize,
        interrupt: Interrupt,
    ) -> MemoryQueue {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        MemoryQueue { name, allocator, interrupt, sender, receiver }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 从分配器取一个空块
    pub fn allocate(&self) -> Block {
        self.allocator.allocate_block()
    }

    /// 把块归还分配器
    pub fn free(&self, block: Block) {
        self.allocator.free(block);
    }

    pub fn block_size(&self) -> usize {
        self.allocator.block_size()
    }

    /// 入队一个块
    ///
    /// 中断时返回 `false`，块不会入队而是直接归还分配器
    pub fn push(&self, block: Block) -> bool {
        match self.push_slot(Some(block)) {
            Ok(()) => true,
            Err(Some(block)) => {
                self.allocator.free(block);
                false
            }
            Err(None) => false,
        }
    }

    /// 通知消费者流已结束
    pub fn done(&self) -> bool {
        self.push_slot(None).is_ok()
    }

    fn push_slot(&self, mut slot: Slot) -> Result<(), Slot> {
        loop {
            if self.interrupt.is_set() {
                return Err(slot);
            }
            match self.sender.send_timeout(slot, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => slot = returned,
                // 接收端与发送端同属本结构，不会断开
                Err(SendTimeoutError::Disconnected(returned)) => return Err(returned),
            }
        }
    }

    /// 出队一个块
    ///
    /// 收到毒丸或被中断时返回 `None`，调用方用 `is_interrupted` 区分
    pub fn pop(&self) -> Option<Block> {
        loop {
            if self.interrupt.is_set() {
                return None;
            }
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(slot) => return slot,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        // 提前终止时队列里可能还有块
        while let Ok(slot) = self.receiver.try_recv() {
            if let Some(block) = slot {
                self.allocator.free(block);
            }
        }
    }
}

/// 把任意字节流切成块写入队列
pub struct QueueWriter<'a> {
    queue: &'a MemoryQueue,
    current: Option<Block>,
    written: u64,
}

impl<'a> QueueWriter<'a> {
    pub fn new(queue: &'a MemoryQueue) -> QueueWriter<'a> {
        QueueWriter { queue, current: None, written: 0 }
    }

    /// 写入的总字节数
    pub fn written(&self) -> u64 {
        self.written
    }

    fn push_current(&mut self) -> io::Result<()> {
        if let Some(block) = self.current.take() {
            if block.is_empty() {
                self.queue.free(block);
            } else if !self.queue.push(block) {
                return Err(interrupted());
            }
        }
        Ok(())
    }

    /// 推送最后一个未满的块
    pub fn finish(mut self) -> io::Result<u64> {
        self.push_current()?;
        Ok(self.written)
    }
}

impl Write for QueueWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.as_ref().is_some_and(|block| block.is_full()) {
            self.push_current()?;
        }
        let block = self.current.get_or_insert_with(|| self.queue.allocate());
        let n = block.append(buf);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.push_current()
    }
}

impl Drop for QueueWriter<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.current.take() {
            self.queue.free(block);
        }
    }
}

/// 把队列当作字节流读取：每次 `pop` 重新填充读取窗口
pub struct QueueReader<'a> {
    queue: &'a MemoryQueue,
    current: Option<Block>,
    offset: usize,
    finished: bool,
    consumed: u64,
}

impl<'a> QueueReader<'a> {
    pub fn new(queue: &'a MemoryQueue) -> QueueReader<'a> {
        QueueReader { queue, current: None, offset: 0, finished: false, consumed: 0 }
    }

    /// 已读取的总字节数
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl BufRead for QueueReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while !self.finished
            && self.current.as_ref().is_none_or(|block| self.offset >= block.len())
        {
            if let Some(block) = self.current.take() {
                self.queue.free(block);
            }
            self.offset = 0;
            match self.queue.pop() {
                Some(block) => self.current = Some(block),
                None if self.queue.is_interrupted() => return Err(interrupted()),
                None => self.finished = true,
            }
        }

        match &self.current {
            Some(block) if !self.finished => Ok(&block.data()[self.offset..]),
            _ => Ok(&[]),
        }
    }

    fn consume(&mut self, amt: usize) {
        self.offset += amt;
        self.consumed += amt as u64;
    }
}

impl Read for QueueReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl Drop for QueueReader<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.current.take() {
            self.queue.free(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn queue(capacity: usize, interrupt: &Interrupt) -> (Arc<BlockAllocator>, MemoryQueue) {
        let allocator = Arc::new(BlockAllocator::new(16, 256).unwrap());
        let queue = MemoryQueue::new("test", allocator.clone(), capacity, interrupt.clone());
        (allocator, queue)
    }

    #[test]
    fn test_fifo_and_poison() {
        let interrupt = Interrupt::new();
        let (allocator, queue) = queue(4, &interrupt);

        for i in 0..3u8 {
            let mut block = queue.allocate();
            block.append(&[i]);
            assert!(queue.push(block));
        }
        assert!(queue.done());

        for i in 0..3u8 {
            let block = queue.pop().unwrap();
            assert_eq!(block.data(), &[i]);
            queue.free(block);
        }
        assert!(queue.pop().is_none());
        assert!(!queue.is_interrupted());

        drop(queue);
        assert_eq!(allocator.stats().blocks_in_flight, 0);
    }

    #[test]
    fn test_backpressure_and_interrupt_unblocks_push() {
        let interrupt = Interrupt::new();
        let (allocator, queue) = queue(2, &interrupt);
        let queue = Arc::new(queue);

        assert!(queue.push(queue.allocate()));
        assert!(queue.push(queue.allocate()));
        assert_eq!(queue.len(), 2);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let pushed = queue.push(queue.allocate());
                (pushed, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(250));
        // 生产者仍然被阻塞
        assert!(!producer.is_finished());

        interrupt.set();
        let (pushed, elapsed) = producer.join().unwrap();
        assert!(!pushed);
        assert!(elapsed < Duration::from_millis(250) + POLL_INTERVAL * 3);

        drop(queue);
        assert_eq!(allocator.stats().blocks_in_flight, 0);
    }

    #[test]
    fn test_interrupt_unblocks_pop() {
        let interrupt = Interrupt::new();
        let (_allocator, queue) = queue(2, &interrupt);
        let queue = Arc::new(queue);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop().is_none() && queue.is_interrupted())
        };

        thread::sleep(Duration::from_millis(150));
        interrupt.set();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_writer_and_reader_stream() {
        let interrupt = Interrupt::new();
        let (allocator, queue) = queue(64, &interrupt);

        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        {
            let mut writer = QueueWriter::new(&queue);
            writer.write_all(&payload[..50]).unwrap();
            writer.write_all(&payload[50..]).unwrap();
            assert_eq!(writer.finish().unwrap(), 200);
        }
        queue.done();

        let mut reader = QueueReader::new(&queue);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(reader.consumed(), 200);
        drop(reader);

        assert_eq!(allocator.stats().blocks_in_flight, 0);
    }

    #[test]
    fn test_reader_reports_interrupt() {
        let interrupt = Interrupt::new();
        let (_allocator, queue) = queue(4, &interrupt);
        interrupt.set();

        let mut reader = QueueReader::new(&queue);
        let mut buf = [0u8; 8];
        let error = reader.read(&mut buf).unwrap_err();
        assert!(crate::error::is_interrupted(&error));
    }
}
