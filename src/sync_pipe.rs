//! 同步内存管道
//!
//! 一个写端、一个读端。写端的每次 `write` 都会阻塞，直到这次写入的数据被读端全部读走，
//! 因此读端随时知道写端当前这次写入还剩多少字节：当写端每次写入恰好一个完整单元
//! （例如一行）时，这就是下一个单元的边界。

use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::interrupted;
use crate::interrupt::Interrupt;
use crate::memory_queue::POLL_INTERVAL;
use crate::transaction_buffer::UnitBoundary;

#[derive(Default)]
struct PipeState {
    data: Vec<u8>,
    offset: usize,
    writer_closed: bool,
    reader_closed: bool,
}

impl PipeState {
    fn pending(&self) -> usize {
        self.data.len() - self.offset
    }
}

struct Shared {
    state: Mutex<PipeState>,
    readable: Condvar,
    consumed: Condvar,
    interrupt: Interrupt,
}

/// 创建一对同步管道端点
pub fn sync_pipe(interrupt: Interrupt) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState::default()),
        readable: Condvar::new(),
        consumed: Condvar::new(),
        interrupt,
    });
    (PipeWriter { shared: shared.clone() }, PipeReader { shared })
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let shared = &*self.shared;
        let mut state = shared.state.lock();
        if state.reader_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "同步管道的读端已关闭"));
        }

        state.data.clear();
        state.data.extend_from_slice(buf);
        state.offset = 0;
        shared.readable.notify_all();

        while state.pending() > 0 {
            if state.reader_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "同步管道的读端已关闭"));
            }
            if shared.interrupt.is_set() {
                return Err(interrupted());
            }
            shared.consumed.wait_for(&mut state, POLL_INTERVAL);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.writer_closed = true;
        self.shared.readable.notify_all();
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// 返回一个共享同一管道的单元边界探针
    pub fn probe(&self) -> PipeProbe {
        PipeProbe { shared: self.shared.clone() }
    }
}

/// 等待写端有数据在途或已关闭，返回在途的字节数
fn wait_pending(shared: &Shared) -> io::Result<Option<usize>> {
    let mut state = shared.state.lock();
    loop {
        let pending = state.pending();
        if pending > 0 {
            return Ok(Some(pending));
        }
        if state.writer_closed {
            return Ok(None);
        }
        if shared.interrupt.is_set() {
            return Err(interrupted());
        }
        shared.readable.wait_for(&mut state, POLL_INTERVAL);
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if wait_pending(&self.shared)?.is_none() {
            return Ok(0);
        }

        let mut state = self.shared.state.lock();
        let offset = state.offset;
        let n = buf.len().min(state.pending());
        buf[..n].copy_from_slice(&state.data[offset..offset + n]);
        state.offset += n;
        if state.pending() == 0 {
            self.shared.consumed.notify_all();
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.reader_closed = true;
        self.shared.consumed.notify_all();
    }
}

/// 读端的单元边界探针
pub struct PipeProbe {
    shared: Arc<Shared>,
}

impl UnitBoundary for PipeProbe {
    fn pending_unit_size(&mut self) -> io::Result<Option<usize>> {
        wait_pending(&self.shared)
    }
}
