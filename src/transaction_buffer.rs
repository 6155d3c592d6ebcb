//! 按事务字节预算切分行格式数据
//!
//! `TransactionBuffer` 包装一个行格式输入，对外表现为一串连续的事务：
//! `read` 返回 0 表示当前事务结束，调用方此时提交，然后用 `has_more`
//! 判断是否还有下一个事务。事务总是结束在行边界上，只有单独一行就超过预算时
//! 才会发出一个超预算的事务（这一行被完整地单独发送）。

use std::io::{self, Read};

use crate::debug_log;
use crate::error::truncated;
use crate::row_boundary::{Dialect, RowBoundary};
use crate::warn_log;

const FILL_SIZE: usize = 64 * 1024;

/// 下一个单元边界的探测接口
///
/// 由与读取方一一配对、逐单元写入的生产者实现
pub trait UnitBoundary {
    /// 阻塞直到生产者有写入在途，返回这次写入尚未被读走的字节数；
    /// 生产者已关闭时返回 `None`
    fn pending_unit_size(&mut self) -> io::Result<Option<usize>>;
}

enum Mode {
    /// 不切分，整个输入就是一个事务
    Passthrough,
    /// 在读入的数据中查找行边界
    Search(RowBoundary),
    /// 由生产者告知单元边界，不做查找
    Fast(Box<dyn UnitBoundary + Send>),
}

pub struct TransactionBuffer<R> {
    source: R,
    mode: Mode,
    max_trx_size: usize,

    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
    /// `buffer[pos]` 之前的那个字节，用于转义判断
    prev_byte: Option<u8>,

    /// 当前事务还可以发送的字节数，`None` 表示边界尚未确定
    remaining: Option<usize>,
    /// 正在流式发送一个尚未看到结束符的超大行
    partial: bool,
    /// 超大行中已确认不含结束符、可以直接发送的字节数
    partial_safe: usize,
    /// 当前事务已发送的字节数
    sent: usize,
    /// 快速模式下当前单元还未读取的字节数
    unit_remaining: usize,
    /// 快速模式下当前单元发送完后结束事务
    close_after_unit: bool,

    transactions: u64,
    oversized_rows: u64,
    partial_row_sent: bool,
    on_oversized_row: Option<Box<dyn FnOnce() + Send>>,
}

impl<R: Read> TransactionBuffer<R> {
    /// `max_trx_size` 为0，或者行结束符与字段分隔符相同时，不做切分
    pub fn new(source: R, dialect: &Dialect, max_trx_size: usize) -> io::Result<TransactionBuffer<R>> {
        let mode = if max_trx_size == 0 {
            Mode::Passthrough
        } else if dialect.has_ambiguous_rows() {
            warn_log!("行结束符与字段分隔符相同，无法识别行边界，不按事务切分");
            Mode::Passthrough
        } else {
            Mode::Search(RowBoundary::for_dialect(dialect)?)
        };

        Ok(TransactionBuffer {
            source,
            mode,
            max_trx_size,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
            prev_byte: None,
            remaining: None,
            partial: false,
            partial_safe: 0,
            sent: 0,
            unit_remaining: 0,
            close_after_unit: false,
            transactions: 0,
            oversized_rows: 0,
            partial_row_sent: false,
            on_oversized_row: None,
        })
    }

    /// 第一次遇到超预算的行时调用一次
    pub fn on_oversized_row(mut self, callback: impl FnOnce() + Send + 'static) -> TransactionBuffer<R> {
        self.on_oversized_row = Some(Box::new(callback));
        self
    }

    /// 由生产者提供单元边界，跳过行边界查找
    ///
    /// 只在生产者每次写入恰好一个完整行、且与本缓冲一一配对时有效。
    /// 不切分的模式下不生效。
    pub fn fast_sub_chunking(mut self, probe: Box<dyn UnitBoundary + Send>) -> TransactionBuffer<R> {
        if !matches!(self.mode, Mode::Passthrough) {
            self.mode = Mode::Fast(probe);
        }
        self
    }

    /// 已结束的事务数
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    /// 超预算的行数
    pub fn oversized_rows(&self) -> u64 {
        self.oversized_rows
    }

    /// 是否曾经在看到行结束符之前就开始发送一个超大行
    pub fn partial_row_sent(&self) -> bool {
        self.partial_row_sent
    }

    /// 是否还有数据，可以开始下一个事务
    pub fn has_more(&mut self) -> io::Result<bool> {
        if self.unit_remaining > 0 || self.pos < self.buffer.len() {
            return Ok(true);
        }
        if let Mode::Fast(probe) = &mut self.mode {
            return Ok(probe.pending_unit_size()?.is_some());
        }
        while !self.eof {
            if self.fill()? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn available(&self) -> usize {
        self.buffer.len() - self.pos
    }

    fn fill(&mut self) -> io::Result<usize> {
        if self.pos > 0 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }

        let old = self.buffer.len();
        self.buffer.resize(old + FILL_SIZE, 0);
        let result = loop {
            match self.source.read(&mut self.buffer[old..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let n = *result.as_ref().unwrap_or(&0);
        self.buffer.truncate(old + n);

        let n = result?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    fn emit(&mut self, buf: &mut [u8], limit: usize) -> usize {
        let n = buf.len().min(limit).min(self.available());
        buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        if n > 0 {
            self.prev_byte = Some(self.buffer[self.pos + n - 1]);
        }
        self.pos += n;
        self.sent += n;
        n
    }

    fn note_oversized_row(&mut self) {
        self.oversized_rows += 1;
        debug_log!("第{}个超过事务预算{}字节的行", self.oversized_rows, self.max_trx_size);
        if let Some(callback) = self.on_oversized_row.take() {
            callback();
        }
    }

    /// 结束当前事务，重置为空闲状态
    fn end_transaction(&mut self) -> usize {
        if self.sent > 0 {
            self.transactions += 1;
        }
        self.remaining = None;
        self.partial = false;
        self.partial_safe = 0;
        self.sent = 0;
        self.close_after_unit = false;
        0
    }

    /// 为当前事务确定结束位置
    fn plan(&mut self, boundary: &RowBoundary) -> io::Result<()> {
        let max = self.max_trx_size;
        while self.available() <= max && !self.eof {
            self.fill()?;
        }

        let window = &self.buffer[self.pos..];
        if window.len() <= max {
            // 已到输入末尾，剩余的全部数据是最后一个事务
            self.remaining = Some(window.len());
            return Ok(());
        }

        let terminator_len = boundary.terminator_len();
        if let Some(at) = boundary.find_last(window, max, self.prev_byte) {
            self.remaining = Some(at + terminator_len);
            return Ok(());
        }

        // 第一行就超过了预算，单独发送这一行
        let found = boundary.find_first(window, 0, self.prev_byte);
        self.note_oversized_row();
        match found {
            Some(at) => self.remaining = Some(at + terminator_len),
            None => {
                self.partial = true;
                self.partial_row_sent = true;
            }
        }
        Ok(())
    }

    /// 流式发送超大行，直到看到它的结束符
    ///
    /// 返回 `None` 表示结束符已找到，`remaining` 已确定
    fn read_partial(&mut self, buf: &mut [u8], boundary: &RowBoundary) -> io::Result<Option<usize>> {
        let terminator_len = boundary.terminator_len();
        loop {
            if self.partial_safe > 0 {
                let n = self.emit(buf, self.partial_safe);
                self.partial_safe -= n;
                return Ok(Some(n));
            }

            let window = &self.buffer[self.pos..];
            let len = window.len();
            if let Some(at) = boundary.find_first(window, 0, self.prev_byte) {
                self.partial = false;
                self.remaining = Some(at + terminator_len);
                return Ok(None);
            }
            if self.eof {
                self.partial = false;
                self.remaining = Some(len);
                return Ok(None);
            }

            // 保留可能是结束符开头的尾部字节
            self.partial_safe = len.saturating_sub(terminator_len - 1);
            if self.partial_safe == 0 {
                self.fill()?;
            }
        }
    }

    fn read_search(&mut self, buf: &mut [u8], boundary: &RowBoundary) -> io::Result<usize> {
        if self.remaining.is_none() && !self.partial {
            if self.available() == 0 && self.eof {
                return Ok(self.end_transaction());
            }
            self.plan(boundary)?;
        }

        if self.partial {
            if let Some(n) = self.read_partial(buf, boundary)? {
                return Ok(n);
            }
        }

        match self.remaining {
            Some(0) | None => Ok(self.end_transaction()),
            Some(remaining) => {
                let n = self.emit(buf, remaining);
                self.remaining = Some(remaining - n);
                Ok(n)
            }
        }
    }

    fn read_passthrough(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.available() > 0 {
            return Ok(self.emit(buf, usize::MAX));
        }
        if self.eof {
            return Ok(self.end_transaction());
        }

        let n = self.source.read(buf)?;
        if n == 0 {
            self.eof = true;
            return Ok(self.end_transaction());
        }
        self.sent += n;
        Ok(n)
    }

    fn read_fast(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Mode::Fast(probe) = &mut self.mode else {
            unreachable!("只在快速模式下调用");
        };

        if self.unit_remaining == 0 {
            if self.close_after_unit {
                return Ok(self.end_transaction());
            }

            let Some(pending) = probe.pending_unit_size()? else {
                self.eof = true;
                return Ok(self.end_transaction());
            };
            if self.sent > 0 && self.sent + pending > self.max_trx_size {
                return Ok(self.end_transaction());
            }
            if self.sent == 0 && pending > self.max_trx_size {
                self.note_oversized_row();
                self.close_after_unit = true;
            }
            self.unit_remaining = pending;
        }

        let want = buf.len().min(self.unit_remaining);
        let n = self.source.read(&mut buf[..want])?;
        if n == 0 {
            return Err(truncated(format!("生产者在单元中途关闭，还有{}字节未到达", self.unit_remaining)));
        }
        self.unit_remaining -= n;
        self.sent += n;
        Ok(n)
    }
}

impl<R: Read> Read for TransactionBuffer<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // 查找策略在整个读取过程中不变，暂时取出以便借用 self
        match std::mem::replace(&mut self.mode, Mode::Passthrough) {
            Mode::Search(boundary) => {
                let result = self.read_search(buf, &boundary);
                self.mode = Mode::Search(boundary);
                result
            }
            Mode::Passthrough => self.read_passthrough(buf),
            fast @ Mode::Fast(_) => {
                self.mode = fast;
                self.read_fast(buf)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::Interrupt;
    use crate::sync_pipe::sync_pipe;
    use std::io::{Cursor, Write};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// 读出所有事务
    fn transactions<R: Read>(buffer: &mut TransactionBuffer<R>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while buffer.has_more().unwrap() {
            let mut transaction = Vec::new();
            let mut chunk = [0u8; 5];
            loop {
                let n = buffer.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                transaction.extend_from_slice(&chunk[..n]);
            }
            out.push(transaction);
        }
        out
    }

    fn lines(data: &str) -> TransactionBuffer<Cursor<Vec<u8>>> {
        TransactionBuffer::new(Cursor::new(data.as_bytes().to_vec()), &Dialect::new(b"\n", None), 10)
            .unwrap()
    }

    #[test]
    fn test_splits_at_row_boundaries() {
        let mut buffer = lines("aaa\nbbb\nccc\ndd\ne\n");
        let out = transactions(&mut buffer);
        assert_eq!(out, vec![b"aaa\nbbb\n".to_vec(), b"ccc\ndd\ne\n".to_vec()]);
        assert_eq!(buffer.transactions(), 2);
        assert_eq!(buffer.oversized_rows(), 0);
    }

    #[test]
    fn test_last_transaction_without_terminator() {
        let mut buffer = lines("aaa\nbbb\ncccccc");
        let out = transactions(&mut buffer);
        assert_eq!(out, vec![b"aaa\nbbb\n".to_vec(), b"cccccc".to_vec()]);
    }

    #[test]
    fn test_oversized_row_is_sent_alone() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let counter = warnings.clone();
        let data = "ab\nthis row is too long\nc\nanother long row!!\n";
        let mut buffer = lines(data).on_oversized_row(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let out = transactions(&mut buffer);
        assert_eq!(
            out,
            vec![
                b"ab\n".to_vec(),
                b"this row is too long\n".to_vec(),
                b"c\n".to_vec(),
                b"another long row!!\n".to_vec(),
            ]
        );
        assert_eq!(out.concat(), data.as_bytes());
        assert_eq!(buffer.oversized_rows(), 2);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_row_larger_than_read_ahead() {
        let mut data = vec![b'x'; FILL_SIZE * 3];
        data.extend_from_slice(b"\nshort\n");
        let mut buffer =
            TransactionBuffer::new(Cursor::new(data.clone()), &Dialect::new(b"\n", None), 100).unwrap();

        let out = transactions(&mut buffer);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), FILL_SIZE * 3 + 1);
        assert_eq!(out[1], b"short\n");
        assert!(buffer.partial_row_sent());
        assert_eq!(buffer.oversized_rows(), 1);
    }

    #[test]
    fn test_escaped_terminator_is_not_a_boundary() {
        let dialect = Dialect::new(b"\n", Some(b'\\'));
        let data = b"ab\\\ncd\nef\n".to_vec();
        let mut buffer = TransactionBuffer::new(Cursor::new(data), &dialect, 8).unwrap();
        let out = transactions(&mut buffer);
        assert_eq!(out, vec![b"ab\\\ncd\n".to_vec(), b"ef\n".to_vec()]);
    }

    #[test]
    fn test_passthrough_modes() {
        let data = "aaa\nbbb\nccc\n";
        let mut disabled =
            TransactionBuffer::new(Cursor::new(data.as_bytes().to_vec()), &Dialect::default(), 0).unwrap();
        assert_eq!(transactions(&mut disabled), vec![data.as_bytes().to_vec()]);

        let ambiguous = Dialect {
            lines_terminated_by: b",".to_vec(),
            fields_terminated_by: b",".to_vec(),
            fields_escaped_by: None,
        };
        let mut buffer =
            TransactionBuffer::new(Cursor::new(data.as_bytes().to_vec()), &ambiguous, 4).unwrap();
        assert_eq!(transactions(&mut buffer), vec![data.as_bytes().to_vec()]);
        assert_eq!(buffer.transactions(), 1);
    }

    #[test]
    fn test_empty_input_has_no_transactions() {
        let mut buffer = lines("");
        assert!(!buffer.has_more().unwrap());
        assert!(transactions(&mut buffer).is_empty());
        assert_eq!(buffer.transactions(), 0);
    }

    #[test]
    fn test_fast_sub_chunking_uses_producer_units() {
        let (mut writer, reader) = sync_pipe(Interrupt::new());
        let probe = reader.probe();

        let rows: Vec<&[u8]> = vec![b"aaa\n", b"bbb\n", b"cccccccccccc\n", b"d\n", b"e\n"];
        let producer = {
            let rows: Vec<Vec<u8>> = rows.iter().map(|row| row.to_vec()).collect();
            thread::spawn(move || {
                for row in rows {
                    writer.write_all(&row).unwrap();
                }
            })
        };

        let mut buffer = TransactionBuffer::new(reader, &Dialect::new(b"\n", None), 10)
            .unwrap()
            .fast_sub_chunking(Box::new(probe));
        let out = transactions(&mut buffer);
        producer.join().unwrap();

        assert_eq!(
            out,
            vec![b"aaa\nbbb\n".to_vec(), b"cccccccccccc\n".to_vec(), b"d\ne\n".to_vec()]
        );
        assert_eq!(buffer.oversized_rows(), 1);
    }

    #[test]
    fn test_concatenation_property() {
        fn prop(rows: Vec<Vec<u8>>, budget: u8) -> bool {
            let rows: Vec<Vec<u8>> = rows
                .into_iter()
                .map(|row| row.into_iter().filter(|b| *b != b'\n').collect::<Vec<u8>>())
                .collect();
            let data: Vec<u8> = rows.iter().flat_map(|row| [row.as_slice(), b"\n"].concat()).collect();
            let budget = budget as usize % 32 + 1;

            let mut buffer =
                TransactionBuffer::new(Cursor::new(data.clone()), &Dialect::new(b"\n", None), budget)
                    .unwrap();
            let out = transactions(&mut buffer);

            let whole_rows = out.iter().all(|transaction| transaction.ends_with(b"\n"));
            let within_budget = out
                .iter()
                .all(|transaction| transaction.len() <= budget || transaction.iter().filter(|b| **b == b'\n').count() == 1);
            whole_rows && within_budget && out.concat() == data
        }

        quickcheck::QuickCheck::new()
            .tests(200)
            .quickcheck(prop as fn(Vec<Vec<u8>>, u8) -> bool);
    }
}
