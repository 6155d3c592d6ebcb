//! 行边界查找
//!
//! 按数据格式（行结束符、转义字符）在构造时选定一种查找策略，
//! 之后所有正向/反向查找都走同一个策略，不再重复判断格式。

use std::fs::File;
use std::io::{self, Read};
use std::ops::Range;
use std::path::Path;

use fault_injection::fallible;

use crate::error::config_error;
use crate::prefetch::PrefetchReader;

/// 分块时每次从输入读取的字节数
const CHUNK_READ_SIZE: usize = 64 * 1024;

/// 行格式数据的方言
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    /// 行结束符
    pub lines_terminated_by: Vec<u8>,
    /// 字段分隔符
    pub fields_terminated_by: Vec<u8>,
    /// 转义字符，`None` 表示不转义
    pub fields_escaped_by: Option<u8>,
}

impl Default for Dialect {
    fn default() -> Dialect {
        Dialect {
            lines_terminated_by: b"\n".to_vec(),
            fields_terminated_by: b"\t".to_vec(),
            fields_escaped_by: Some(b'\\'),
        }
    }
}

impl Dialect {
    pub fn new(lines_terminated_by: &[u8], fields_escaped_by: Option<u8>) -> Dialect {
        Dialect {
            lines_terminated_by: lines_terminated_by.to_vec(),
            fields_escaped_by,
            ..Dialect::default()
        }
    }

    /// 行结束符与字段分隔符相同时无法可靠地识别行边界
    pub fn has_ambiguous_rows(&self) -> bool {
        self.lines_terminated_by == self.fields_terminated_by
    }
}

/// 行边界查找策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowBoundary {
    /// 单字节结束符，无转义
    Byte(u8),
    /// 多字节结束符，无转义
    Bytes(Vec<u8>),
    /// 带转义字符：紧跟在转义字符后面的结束符不算边界
    Escaped { terminator: Vec<u8>, escape: u8 },
}

impl RowBoundary {
    pub fn for_dialect(dialect: &Dialect) -> io::Result<RowBoundary> {
        let terminator = &dialect.lines_terminated_by;
        if terminator.is_empty() {
            return Err(config_error("行结束符不能为空"));
        }

        Ok(match (terminator.len(), dialect.fields_escaped_by) {
            (_, Some(escape)) => RowBoundary::Escaped { terminator: terminator.clone(), escape },
            (1, None) => RowBoundary::Byte(terminator[0]),
            (_, None) => RowBoundary::Bytes(terminator.clone()),
        })
    }

    pub fn terminator_len(&self) -> usize {
        match self {
            RowBoundary::Byte(_) => 1,
            RowBoundary::Bytes(terminator) => terminator.len(),
            RowBoundary::Escaped { terminator, .. } => terminator.len(),
        }
    }

    /// 从 `from` 开始查找第一个行结束符，返回它的起始下标
    ///
    /// `before` 是 `hay[0]` 之前的那个字节，用于判断位于开头的结束符是否被转义
    pub fn find_first(&self, hay: &[u8], from: usize, before: Option<u8>) -> Option<usize> {
        match self {
            RowBoundary::Byte(byte) => {
                let rest = hay.get(from..)?;
                rest.iter().position(|b| b == byte).map(|at| from + at)
            }
            RowBoundary::Bytes(terminator) => find_subslice(hay, terminator, from),
            RowBoundary::Escaped { terminator, escape } => {
                let mut from = from;
                while let Some(at) = find_subslice(hay, terminator, from) {
                    if !is_escaped(hay, at, before, *escape) {
                        return Some(at);
                    }
                    from = at + 1;
                }
                None
            }
        }
    }

    /// 查找结束位置不超过 `limit` 的最后一个行结束符，返回它的起始下标
    pub fn find_last(&self, hay: &[u8], limit: usize, before: Option<u8>) -> Option<usize> {
        let end = limit.min(hay.len());
        match self {
            RowBoundary::Byte(byte) => hay[..end].iter().rposition(|b| b == byte),
            RowBoundary::Bytes(terminator) => rfind_subslice(&hay[..end], terminator),
            RowBoundary::Escaped { terminator, escape } => {
                let mut end = end;
                while let Some(at) = rfind_subslice(&hay[..end], terminator) {
                    if !is_escaped(hay, at, before, *escape) {
                        return Some(at);
                    }
                    // 继续查找起点在 at 之前的匹配
                    end = at + terminator.len() - 1;
                }
                None
            }
        }
    }
}

fn is_escaped(hay: &[u8], at: usize, before: Option<u8>, escape: u8) -> bool {
    let previous = if at == 0 { before } else { Some(hay[at - 1]) };
    previous == Some(escape)
}

fn find_subslice(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    let rest = hay.get(from..)?;
    if rest.len() < needle.len() {
        return None;
    }
    rest.windows(needle.len()).position(|window| window == needle).map(|at| from + at)
}

fn rfind_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).rposition(|window| window == needle)
}

/// 把行格式数据切分为字节区间
///
/// 每个区间至少 `max_bytes` 字节（最后一个区间除外），并且总是结束在行边界上。
/// 所有区间首尾相接，恰好覆盖整个输入。
pub fn chunk_by_max_bytes<R: Read>(
    mut reader: R,
    dialect: &Dialect,
    max_bytes: u64,
) -> io::Result<Vec<Range<u64>>> {
    let boundary = RowBoundary::for_dialect(dialect)?;
    let terminator_len = boundary.terminator_len() as u64;
    let max_bytes = max_bytes.max(1);

    let mut chunks = Vec::new();
    // buffer[0] 位于输入偏移 start 处
    let mut buffer: Vec<u8> = Vec::new();
    let mut start = 0u64;
    let mut before: Option<u8> = None;
    // 已经确认没有可用边界的位置，下次从这里继续查找
    let mut resume = 0u64;
    let mut scratch = vec![0u8; CHUNK_READ_SIZE];
    let mut eof = false;

    loop {
        let target = (start + max_bytes).saturating_sub(terminator_len).max(start).max(resume);
        let from = (target - start) as usize;

        if let Some(at) = boundary.find_first(&buffer, from, before) {
            let consumed = at + terminator_len as usize;
            let end = start + consumed as u64;
            chunks.push(start..end);

            before = Some(buffer[consumed - 1]);
            buffer.drain(..consumed);
            start = end;
            resume = end;
            continue;
        }

        if eof {
            break;
        }

        // 跨读取边界的结束符需要回看 terminator_len - 1 字节
        let searched = (start + buffer.len() as u64).saturating_sub(terminator_len - 1);
        resume = resume.max(searched);

        match reader.read(&mut scratch) {
            Ok(0) => eof = true,
            Ok(n) => buffer.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    if !buffer.is_empty() {
        chunks.push(start..start + buffer.len() as u64);
    }
    Ok(chunks)
}

/// 对文件分块，通过预读线程读取
pub fn chunk_file(path: &Path, dialect: &Dialect, max_bytes: u64) -> io::Result<Vec<Range<u64>>> {
    let file = fallible!(File::open(path));
    chunk_by_max_bytes(PrefetchReader::new(file)?, dialect, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};
    use std::io::Cursor;

    fn chunks_of(data: &[u8], dialect: &Dialect, max: u64) -> Vec<Vec<u8>> {
        chunk_by_max_bytes(Cursor::new(data.to_vec()), dialect, max)
            .unwrap()
            .into_iter()
            .map(|range| data[range.start as usize..range.end as usize].to_vec())
            .collect()
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            RowBoundary::for_dialect(&Dialect::new(b"\n", None)).unwrap(),
            RowBoundary::Byte(b'\n')
        );
        assert_eq!(
            RowBoundary::for_dialect(&Dialect::new(b"\r\n", None)).unwrap(),
            RowBoundary::Bytes(b"\r\n".to_vec())
        );
        assert!(matches!(
            RowBoundary::for_dialect(&Dialect::new(b"\n", Some(b'\\'))).unwrap(),
            RowBoundary::Escaped { escape: b'\\', .. }
        ));
        let error = RowBoundary::for_dialect(&Dialect::new(b"", None)).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_find_first_and_last() {
        let boundary = RowBoundary::Bytes(b"||".to_vec());
        let hay = b"ab||cd||ef";
        assert_eq!(boundary.find_first(hay, 0, None), Some(2));
        assert_eq!(boundary.find_first(hay, 3, None), Some(6));
        assert_eq!(boundary.find_first(hay, 7, None), None);
        assert_eq!(boundary.find_last(hay, hay.len(), None), Some(6));
        assert_eq!(boundary.find_last(hay, 7, None), Some(2));
        assert_eq!(boundary.find_last(hay, 1, None), None);
    }

    #[test]
    fn test_escaped_terminator_is_skipped() {
        let boundary = RowBoundary::Escaped { terminator: b"\n".to_vec(), escape: b'\\' };
        let hay = b"a\\\nb\nc";
        assert_eq!(boundary.find_first(hay, 0, None), Some(4));
        assert_eq!(boundary.find_last(hay, hay.len(), None), Some(4));
        assert_eq!(boundary.find_last(hay, 4, None), None);

        // 位于缓冲区开头的结束符要看前一个字节
        assert_eq!(boundary.find_first(b"\nx\n", 0, Some(b'\\')), Some(2));
        assert_eq!(boundary.find_first(b"\nx\n", 0, Some(b'a')), Some(0));
    }

    #[test]
    fn test_escaped_multibyte_overlap() {
        let boundary = RowBoundary::Escaped { terminator: b"ab".to_vec(), escape: b'x' };
        // "xab" 被转义，紧跟的 "ab" 才是真正的边界
        let hay = b"1xabab2";
        assert_eq!(boundary.find_first(hay, 0, None), Some(4));
        assert_eq!(boundary.find_last(hay, hay.len(), None), Some(4));
    }

    #[test]
    fn test_escaped_then_real_terminator_chunks() {
        let dialect = Dialect::new(b"\n", Some(b'\\'));
        let data = b"one\\\n\ntwo\nthree";
        let chunks = chunks_of(data, &dialect, 1);
        assert_eq!(
            chunks,
            vec![b"one\\\n\n".to_vec(), b"two\n".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn test_chunks_respect_budget() {
        let dialect = Dialect::new(b"\n", None);
        let data = b"aaaa\nbb\ncccccc\nd\ne\n";
        let chunks = chunks_of(data, &dialect, 6);
        assert_eq!(
            chunks,
            vec![b"aaaa\nbb\n".to_vec(), b"cccccc\n".to_vec(), b"d\ne\n".to_vec()]
        );
    }

    #[test]
    fn test_empty_input() {
        let chunks = chunk_by_max_bytes(io::empty(), &Dialect::default(), 10).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.tsv");
        let data: Vec<u8> = (0..1000).flat_map(|i| format!("{}\trow\n", i).into_bytes()).collect();
        std::fs::write(&path, &data).unwrap();

        let chunks = chunk_file(&path, &Dialect::default(), 1000).unwrap();
        assert_eq!(chunks.first().unwrap().start, 0);
        assert_eq!(chunks.last().unwrap().end, data.len() as u64);
        for chunk in &chunks {
            assert_eq!(data[chunk.end as usize - 1], b'\n');
        }
    }

    /// 随机的行数据：行内容不包含结束符，也不以转义字符结尾
    #[derive(Debug, Clone)]
    struct Rows {
        terminator: Vec<u8>,
        escape: Option<u8>,
        rows: Vec<Vec<u8>>,
    }

    impl Arbitrary for Rows {
        fn arbitrary(g: &mut Gen) -> Rows {
            let terminators: [&[u8]; 4] = [b"\n", b"\r\n", b"|", b"$$$"];
            let terminator = g.choose(&terminators).unwrap().to_vec();
            let escape = if bool::arbitrary(g) { Some(b'\\') } else { None };

            let alphabet = b"abc\\ \t\n|$\r";
            let rows = (0..usize::arbitrary(g) % 20)
                .map(|_| {
                    let len = usize::arbitrary(g) % 12;
                    let mut row: Vec<u8> = Vec::new();
                    for _ in 0..len {
                        let byte = *g.choose(alphabet).unwrap();
                        match escape {
                            // 行内的结束符字节总是被转义
                            Some(escape) if terminator.contains(&byte) => {
                                row.push(escape);
                                row.push(byte);
                            }
                            None if terminator.contains(&byte) => {}
                            _ => row.push(byte),
                        }
                    }
                    row
                })
                .collect();
            Rows { terminator, escape, rows }
        }
    }

    impl Rows {
        fn is_well_formed(&self) -> bool {
            self.rows.iter().all(|row| {
                if row.last() == self.escape.as_ref() {
                    return false;
                }
                let mut joined = row.clone();
                joined.extend_from_slice(&self.terminator);
                let boundary = RowBoundary::for_dialect(&self.dialect()).unwrap();
                boundary.find_first(&joined, 0, None) == Some(row.len())
            })
        }

        fn dialect(&self) -> Dialect {
            Dialect::new(&self.terminator, self.escape)
        }

        fn data(&self) -> Vec<u8> {
            self.rows.iter().flat_map(|row| [row.as_slice(), &self.terminator].concat()).collect()
        }
    }

    #[test]
    fn test_one_chunk_per_row_property() {
        fn prop(rows: Rows) -> TestResult {
            if !rows.is_well_formed() {
                return TestResult::discard();
            }
            let data = rows.data();
            let chunks = chunk_by_max_bytes(Cursor::new(data.clone()), &rows.dialect(), 1).unwrap();

            if chunks.len() != rows.rows.len() {
                return TestResult::failed();
            }
            let mut expected_start = 0;
            for (chunk, row) in chunks.iter().zip(&rows.rows) {
                if chunk.start != expected_start
                    || chunk.end - chunk.start != (row.len() + rows.terminator.len()) as u64
                {
                    return TestResult::failed();
                }
                expected_start = chunk.end;
            }
            TestResult::from_bool(expected_start == data.len() as u64)
        }

        QuickCheck::new()
            .tests(300)
            .quickcheck(prop as fn(Rows) -> TestResult);
    }

    #[test]
    fn test_small_reads_property() {
        /// 每次只返回一个字节的输入，覆盖跨读取边界的结束符
        struct Trickle(Cursor<Vec<u8>>);

        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let len = buf.len().min(1);
                self.0.read(&mut buf[..len])
            }
        }

        fn prop(rows: Rows, budget: u8) -> TestResult {
            if !rows.is_well_formed() {
                return TestResult::discard();
            }
            let data = rows.data();
            let budget = budget as u64 % 16 + 1;
            let whole = chunk_by_max_bytes(Cursor::new(data.clone()), &rows.dialect(), budget);
            let trickled = chunk_by_max_bytes(Trickle(Cursor::new(data)), &rows.dialect(), budget);
            TestResult::from_bool(whole.unwrap() == trickled.unwrap())
        }

        QuickCheck::new()
            .tests(200)
            .quickcheck(prop as fn(Rows, u8) -> TestResult);
    }
}
