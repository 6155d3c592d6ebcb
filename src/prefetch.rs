//! 双缓冲预读
//!
//! 后台线程负责从底层输入读取数据，两个缓冲槽在读取线程与消费者之间
//! 按所有权来回移动：消费者读完一个槽就把它交还，后台线程填充后再送回。
//! 任一时刻最多有一个预读请求在途。

use std::io::{self, Read};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::trace_log;

/// 默认槽大小
pub const DEFAULT_SLOT_SIZE: usize = 256 * 1024;

/// 双缓冲预读器
pub struct PrefetchReader {
    filled: Receiver<io::Result<Vec<u8>>>,
    recycle: Sender<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl PrefetchReader {
    pub fn new<R>(inner: R) -> io::Result<PrefetchReader>
    where
        R: Read + Send + 'static,
    {
        PrefetchReader::with_slot_size(inner, DEFAULT_SLOT_SIZE)
    }

    /// 启动预读线程，线程无法创建时返回错误
    pub fn with_slot_size<R>(mut inner: R, slot_size: usize) -> io::Result<PrefetchReader>
    where
        R: Read + Send + 'static,
    {
        let slot_size = slot_size.max(1);
        let (filled_tx, filled_rx) = crossbeam_channel::bounded(1);
        let (recycle_tx, recycle_rx) = crossbeam_channel::bounded(2);

        for _ in 0..2 {
            // 接收端还在本函数中，容量为2的通道不会满
            let _ = recycle_tx.send(Vec::with_capacity(slot_size));
        }

        thread::Builder::new()
            .name("prefetch".to_string())
            .spawn(move || fetch_loop(&mut inner, slot_size, recycle_rx, filled_tx))?;

        Ok(PrefetchReader {
            filled: filled_rx,
            recycle: recycle_tx,
            current: Vec::new(),
            offset: 0,
            eof: false,
        })
    }

    fn next_slot(&mut self) -> io::Result<()> {
        let previous = std::mem::take(&mut self.current);
        if previous.capacity() > 0 {
            // 后台线程已退出时交还失败，忽略即可
            let _ = self.recycle.send(previous);
        }
        self.offset = 0;

        match self.filled.recv() {
            Ok(Ok(slot)) if slot.is_empty() => self.eof = true,
            Ok(Ok(slot)) => self.current = slot,
            Ok(Err(e)) => {
                self.eof = true;
                return Err(e);
            }
            Err(_) => self.eof = true,
        }
        Ok(())
    }
}

fn fetch_loop<R: Read>(
    inner: &mut R,
    slot_size: usize,
    recycle: Receiver<Vec<u8>>,
    filled: Sender<io::Result<Vec<u8>>>,
) {
    while let Ok(mut slot) = recycle.recv() {
        slot.resize(slot_size, 0);

        let result = fill(inner, &mut slot);
        let finished = !matches!(result, Ok(n) if n > 0);
        let message = result.map(|n| {
            slot.truncate(n);
            slot
        });

        if filled.send(message).is_err() || finished {
            break;
        }
    }
    trace_log!("预读线程退出");
}

/// 尽量填满缓冲区，只有到达流末尾时才返回不足的长度
fn fill<R: Read>(inner: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match inner.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

impl Read for PrefetchReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.current.len() {
            if self.eof {
                return Ok(0);
            }
            self.next_slot()?;
        }

        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
