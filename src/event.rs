//! 二进制日志事件分帧
//!
//! 只关心事件的分帧（固定19字节头部、头部中的事件总长度与位置字段），
//! 以及需要解读内容的两类事件：FORMAT_DESCRIPTION与GTID。
//!
//! 头部布局（小端）：
//!
//! ```text
//! [timestamp: 4] [type: 1] [server_id: 4] [event_size: 4] [log_pos: 4] [flags: 2]
//! ```

use std::io::{self, Read};

use crate::error::{invalid_data, truncated};
use crate::gtid::{Gtid, Sid};
use crate::trace_log;

/// 合法binlog字节流开头的4字节标识
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, b'b', b'i', b'n'];

/// v4事件通用头部长度
pub const LOG_EVENT_HEADER_LEN: usize = 19;

const EVENT_TYPE_OFFSET: usize = 4;
const EVENT_SIZE_OFFSET: usize = 9;
const LOG_POS_OFFSET: usize = 13;

/// 单个事件的上限，超过视为数据损坏
const MAX_EVENT_SIZE: usize = 1024 * 1024 * 1024;

/// 校验和长度
pub const CHECKSUM_LEN: usize = 4;

pub mod event_type {
    pub const QUERY_EVENT: u8 = 2;
    pub const STOP_EVENT: u8 = 3;
    pub const ROTATE_EVENT: u8 = 4;
    pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
    pub const XID_EVENT: u8 = 16;
    pub const GTID_LOG_EVENT: u8 = 33;
    pub const ANONYMOUS_GTID_LOG_EVENT: u8 = 34;
    pub const PREVIOUS_GTIDS_LOG_EVENT: u8 = 35;
    pub const GTID_TAGGED_LOG_EVENT: u8 = 42;
}

/// 校验和算法
pub const CHECKSUM_ALG_OFF: u8 = 0;
pub const CHECKSUM_ALG_CRC32: u8 = 1;

/// 一个完整事件的视图，`data` 在下一次读取之前有效
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    /// 包含头部在内的完整原始字节
    pub data: &'a [u8],
    pub event_type: u8,
    pub size: u32,
    /// 本事件在日志文件中的偏移
    pub position: u64,
    /// 下一个事件在日志文件中的偏移
    pub next_position: u64,
}

impl Event<'_> {
    pub fn is_format_description(&self) -> bool {
        self.event_type == event_type::FORMAT_DESCRIPTION_EVENT
    }

    pub fn is_gtid(&self) -> bool {
        matches!(
            self.event_type,
            event_type::GTID_LOG_EVENT | event_type::GTID_TAGGED_LOG_EVENT
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct EventMeta {
    event_type: u8,
    size: u32,
    position: u64,
    next_position: u64,
}

/// 从字节流中逐个解析事件
pub struct EventReader<R> {
    input: R,
    buffer: Vec<u8>,
    current: Option<EventMeta>,
    /// 流中下一个事件的预期偏移
    offset: u64,
    events: u64,
    bytes: u64,
}

impl<R: Read> EventReader<R> {
    /// `start_position` 是流中第一个事件在日志文件里的偏移
    pub fn new(input: R, start_position: u64) -> EventReader<R> {
        EventReader {
            input,
            buffer: vec![0; LOG_EVENT_HEADER_LEN],
            current: None,
            offset: start_position,
            events: 0,
            bytes: 0,
        }
    }

    /// 读取下一个事件
    ///
    /// 只有输入恰好在事件边界结束时才返回 `Ok(None)`。
    /// 头部或事件体读到一半就结束（文件被截断或仍在写入）不会返回 `None`，
    /// 而是返回 `UnexpectedEof` 错误，调用方不能把它当作正常的流结束。
    pub fn next_event(&mut self) -> io::Result<Option<Event<'_>>> {
        self.current = None;

        let header_read = read_full(&mut self.input, &mut self.buffer[..LOG_EVENT_HEADER_LEN])?;
        if header_read == 0 {
            return Ok(None);
        }
        if header_read < LOG_EVENT_HEADER_LEN {
            return Err(truncated(format!(
                "偏移{}处的事件头部被截断: {}/{}字节",
                self.offset, header_read, LOG_EVENT_HEADER_LEN
            )));
        }

        let event_type = self.buffer[EVENT_TYPE_OFFSET];
        let size = read_u32(&self.buffer, EVENT_SIZE_OFFSET);
        let log_pos = read_u32(&self.buffer, LOG_POS_OFFSET) as u64;

        let total = size as usize;
        if !(LOG_EVENT_HEADER_LEN..=MAX_EVENT_SIZE).contains(&total) {
            return Err(invalid_data(format!(
                "偏移{}处的事件长度无效: {}",
                self.offset, size
            )));
        }

        if self.buffer.len() < total {
            self.buffer.resize(total, 0);
        }
        let body_read = read_full(&mut self.input, &mut self.buffer[LOG_EVENT_HEADER_LEN..total])?;
        if body_read < total - LOG_EVENT_HEADER_LEN {
            return Err(truncated(format!(
                "偏移{}处的事件(类型{})被截断: {}/{}字节",
                self.offset,
                event_type,
                LOG_EVENT_HEADER_LEN + body_read,
                total
            )));
        }

        // 头部中的log_pos为0时（例如人工构造的事件）按流内偏移推算
        let (position, next_position) = if log_pos >= size as u64 && log_pos != 0 {
            (log_pos - size as u64, log_pos)
        } else {
            (self.offset, self.offset + size as u64)
        };
        self.offset = next_position;
        self.events += 1;
        self.bytes += size as u64;

        trace_log!("读取事件 类型={} 长度={} 位置={}", event_type, size, position);

        self.current = Some(EventMeta { event_type, size, position, next_position });
        Ok(self.current())
    }

    /// 最近一次读取的事件
    pub fn current(&self) -> Option<Event<'_>> {
        self.current.map(|meta| Event {
            data: &self.buffer[..meta.size as usize],
            event_type: meta.event_type,
            size: meta.size,
            position: meta.position,
            next_position: meta.next_position,
        })
    }

    pub fn events_read(&self) -> u64 {
        self.events
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> R {
        self.input
    }
}

/// 读满缓冲区或到达流末尾，返回实际读取的字节数
pub(crate) fn read_full<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match input.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// 读取并校验流开头的4字节标识
pub fn read_magic<R: Read + ?Sized>(input: &mut R) -> io::Result<()> {
    let mut magic = [0u8; 4];
    let n = read_full(input, &mut magic)?;
    if n != magic.len() || magic != BINLOG_MAGIC {
        return Err(invalid_data("缺少binlog文件头标识"));
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// 当前binlog的格式描述
///
/// 每遇到一个FORMAT_DESCRIPTION事件就整体替换，后续GTID事件的解析依赖它
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub common_header_len: u8,
    pub post_header_lens: Vec<u8>,
    pub checksum_alg: u8,
}

impl FormatDescription {
    /// 固定字段：binlog_version(2) + server_version(50) + create_timestamp(4) + header_len(1)
    const FIXED_LEN: usize = 57;

    pub fn parse(event: &Event<'_>) -> io::Result<FormatDescription> {
        if !event.is_format_description() {
            return Err(invalid_data(format!("不是FORMAT_DESCRIPTION事件: 类型{}", event.event_type)));
        }

        let payload = &event.data[LOG_EVENT_HEADER_LEN..];
        if payload.len() < Self::FIXED_LEN {
            return Err(invalid_data(format!(
                "FORMAT_DESCRIPTION事件过短: {}字节",
                event.data.len()
            )));
        }

        let binlog_version = u16::from_le_bytes([payload[0], payload[1]]);
        let server_version = String::from_utf8_lossy(&payload[2..52])
            .trim_end_matches('\0')
            .to_string();
        let create_timestamp = read_u32(payload, 52);
        let common_header_len = payload[56];

        if (common_header_len as usize) < LOG_EVENT_HEADER_LEN {
            return Err(invalid_data(format!("通用头部长度无效: {}", common_header_len)));
        }

        // 支持校验和的服务器在末尾写入 [checksum_alg: 1][crc32: 4]
        let rest = &payload[Self::FIXED_LEN..];
        let (post_header_lens, checksum_alg) =
            if version_has_checksum(&server_version) && rest.len() >= 1 + CHECKSUM_LEN {
                let alg_at = rest.len() - 1 - CHECKSUM_LEN;
                (rest[..alg_at].to_vec(), rest[alg_at])
            } else {
                (rest.to_vec(), CHECKSUM_ALG_OFF)
            };

        Ok(FormatDescription {
            binlog_version,
            server_version,
            create_timestamp,
            common_header_len,
            post_header_lens,
            checksum_alg,
        })
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum_alg == CHECKSUM_ALG_CRC32
    }

    /// 校验事件末尾的CRC32
    pub fn verify_checksum(&self, event: &Event<'_>) -> io::Result<()> {
        // FORMAT_DESCRIPTION事件本身总是带校验和字段，按它自己声明的算法判断
        if !self.has_checksum() {
            return Ok(());
        }
        let data = event.data;
        if data.len() < LOG_EVENT_HEADER_LEN + CHECKSUM_LEN {
            return Err(invalid_data("事件过短，无法校验"));
        }
        let split = data.len() - CHECKSUM_LEN;
        let expected = read_u32(data, split);
        let actual = crc32fast::hash(&data[..split]);
        if expected != actual {
            return Err(invalid_data(format!(
                "位置{}处事件(类型{})校验和不匹配: 期望{:08x} 实际{:08x}",
                event.position, event.event_type, expected, actual
            )));
        }
        Ok(())
    }

    /// 解析GTID事件（普通或带标签）
    pub fn decode_gtid(&self, event: &Event<'_>) -> io::Result<Gtid> {
        let start = self.common_header_len as usize;
        let end = if self.has_checksum() {
            event.data.len().saturating_sub(CHECKSUM_LEN)
        } else {
            event.data.len()
        };
        if start > end {
            return Err(invalid_data("GTID事件过短"));
        }
        let body = &event.data[start..end];

        match event.event_type {
            event_type::GTID_LOG_EVENT => decode_plain_gtid(body),
            event_type::GTID_TAGGED_LOG_EVENT => decode_tagged_gtid(body),
            other => Err(invalid_data(format!("不是GTID事件: 类型{}", other))),
        }
    }
}

/// 5.6.1及以后的版本带校验和字段
fn version_has_checksum(version: &str) -> bool {
    let numbers: Vec<u32> = version
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .map(|part| part.parse().unwrap_or(0))
        .collect();
    match numbers.as_slice() {
        [major, minor, patch, ..] => (*major, *minor, *patch) >= (5, 6, 1),
        // 无法解析时按新版本处理
        _ => true,
    }
}

/// `[flags: 1] [sid: 16] [gno: 8] ...`
fn decode_plain_gtid(body: &[u8]) -> io::Result<Gtid> {
    if body.len() < 25 {
        return Err(invalid_data(format!("GTID事件过短: {}字节", body.len())));
    }
    let mut sid = [0u8; 16];
    sid.copy_from_slice(&body[1..17]);
    let gno = read_u64(body, 17);
    if gno == 0 || gno > i64::MAX as u64 {
        return Err(invalid_data(format!("GTID序号无效: {}", gno)));
    }
    Ok(Gtid::new(Sid(sid), gno))
}

/// 带标签的GTID事件使用变长字段编码：
///
/// ```text
/// [message_size] [last_non_ignorable_field_id] { [field_id] [value] }*
/// ```
///
/// 字段0为flags，1为16字节UUID，2为gno（zigzag编码），3为标签字符串
fn decode_tagged_gtid(body: &[u8]) -> io::Result<Gtid> {
    let corrupt = || invalid_data("带标签的GTID事件格式错误");

    let mut cursor = VarlenCursor { data: body, pos: 0 };
    let message_size = cursor.unsigned().ok_or_else(corrupt)? as usize;
    let limit = message_size.min(body.len());
    cursor.unsigned().ok_or_else(corrupt)?;

    let mut sid = None;
    let mut gno = None;
    let mut tag = String::new();

    while cursor.pos < limit {
        match cursor.unsigned().ok_or_else(corrupt)? {
            0 => {
                cursor.unsigned().ok_or_else(corrupt)?;
            }
            1 => {
                let bytes = cursor.fixed(16).ok_or_else(corrupt)?;
                let mut raw = [0u8; 16];
                raw.copy_from_slice(bytes);
                sid = Some(Sid(raw));
            }
            2 => gno = Some(cursor.signed().ok_or_else(corrupt)?),
            3 => {
                let len = cursor.unsigned().ok_or_else(corrupt)? as usize;
                let bytes = cursor.fixed(len).ok_or_else(corrupt)?;
                tag = String::from_utf8(bytes.to_vec()).map_err(|_| corrupt())?;
            }
            // 其余字段与GTID本身无关
            _ => break,
        }
    }

    match (sid, gno) {
        (Some(sid), Some(gno)) if gno > 0 => Ok(Gtid::tagged(sid, tag, gno as u64)),
        _ => Err(corrupt()),
    }
}

struct VarlenCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl VarlenCursor<'_> {
    /// 首字节末尾连续1的个数加一即为总字节数，值左移相应位数后小端存放；
    /// 9字节形式首字节为0xff，后跟8字节原值
    fn unsigned(&mut self) -> Option<u64> {
        let first = *self.data.get(self.pos)?;
        let len = (first.trailing_ones() + 1) as usize;
        let bytes = self.data.get(self.pos..self.pos + len)?;

        let value = if len == 9 {
            read_u64(bytes, 1)
        } else {
            let mut raw = [0u8; 8];
            raw[..len].copy_from_slice(bytes);
            u64::from_le_bytes(raw) >> len
        };
        self.pos += len;
        Some(value)
    }

    fn signed(&mut self) -> Option<i64> {
        let raw = self.unsigned()?;
        Some((raw >> 1) as i64 ^ -((raw & 1) as i64))
    }

    fn fixed(&mut self, len: usize) -> Option<&[u8]> {
        let bytes = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(bytes)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::io::Cursor;

    fn sid() -> Sid {
        "3e11fa47-71ca-11e1-9e33-c80aa9429562".parse().unwrap()
    }

    fn stream(checksum: bool) -> Vec<u8> {
        let mut data = Vec::new();
        let fde = format_description(4, checksum);
        let mut position = 4 + fde.len() as u64;
        data.extend(fde);
        for gno in 1..=3 {
            let event = gtid(sid(), gno, position, checksum);
            position += event.len() as u64;
            data.extend(event);
            let event = query("INSERT INTO t VALUES (1)", position, checksum);
            position += event.len() as u64;
            data.extend(event);
        }
        data
    }

    #[test]
    fn test_reads_events_with_positions() {
        let data = stream(false);
        let total = data.len() as u64;
        let mut reader = EventReader::new(Cursor::new(data), 4);

        let mut positions = Vec::new();
        let mut types = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            assert_eq!(event.data.len(), event.size as usize);
            assert_eq!(event.next_position, event.position + event.size as u64);
            positions.push(event.position);
            types.push(event.event_type);
        }

        assert_eq!(positions[0], 4);
        assert_eq!(types.len(), 7);
        assert_eq!(types[0], event_type::FORMAT_DESCRIPTION_EVENT);
        assert_eq!(reader.events_read(), 7);
        assert_eq!(reader.bytes_read(), total);
        assert!(reader.current().is_none());
    }

    #[test]
    fn test_truncated_body_is_reported() {
        let mut data = stream(false);
        data.truncate(data.len() - 3);
        let mut reader = EventReader::new(Cursor::new(data), 4);

        let mut result = Ok(());
        loop {
            match reader.next_event() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncated_header_is_reported() {
        let mut data = stream(false);
        data.extend_from_slice(&[0u8; 5]);
        let mut reader = EventReader::new(Cursor::new(data), 4);
        for _ in 0..7 {
            assert!(reader.next_event().unwrap().is_some());
        }
        assert_eq!(reader.next_event().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_invalid_size() {
        let mut data = header(event_type::QUERY_EVENT, 5, 0);
        data.extend_from_slice(&[0u8; 10]);
        let mut reader = EventReader::new(Cursor::new(data), 4);
        assert_eq!(reader.next_event().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_format_description_and_gtid() {
        for checksum in [false, true] {
            let data = stream(checksum);
            let mut reader = EventReader::new(Cursor::new(data), 4);

            let event = reader.next_event().unwrap().unwrap();
            let fde = FormatDescription::parse(&event).unwrap();
            assert_eq!(fde.binlog_version, 4);
            assert_eq!(fde.server_version, SERVER_VERSION);
            assert_eq!(fde.common_header_len as usize, LOG_EVENT_HEADER_LEN);
            assert_eq!(fde.has_checksum(), checksum);
            fde.verify_checksum(&event).unwrap();

            let event = reader.next_event().unwrap().unwrap();
            assert!(event.is_gtid());
            fde.verify_checksum(&event).unwrap();
            assert_eq!(fde.decode_gtid(&event).unwrap(), Gtid::new(sid(), 1));
        }
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut data = stream(true);
        let last = data.len() - 1;
        data[last] ^= 0xff;

        let mut reader = EventReader::new(Cursor::new(data), 4);
        let event = reader.next_event().unwrap().unwrap();
        let fde = FormatDescription::parse(&event).unwrap();

        let mut failures = 0;
        while let Some(event) = reader.next_event().unwrap() {
            if fde.verify_checksum(&event).is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_tagged_gtid() {
        let fde_bytes = format_description(4, true);
        let mut data = fde_bytes.clone();
        data.extend(tagged_gtid(sid(), "alpha", 300, 4 + fde_bytes.len() as u64, true));

        let mut reader = EventReader::new(Cursor::new(data), 4);
        let fde = FormatDescription::parse(&reader.next_event().unwrap().unwrap()).unwrap();
        let event = reader.next_event().unwrap().unwrap();
        assert!(event.is_gtid());
        assert_eq!(fde.decode_gtid(&event).unwrap(), Gtid::tagged(sid(), "alpha", 300));
    }

    #[test]
    fn test_varlen_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20, 1 << 40, u64::MAX] {
            let encoded = varlen(value);
            let mut cursor = VarlenCursor { data: &encoded, pos: 0 };
            assert_eq!(cursor.unsigned(), Some(value));
            assert_eq!(cursor.pos, encoded.len());
        }
    }

    #[test]
    fn test_magic() {
        let mut ok = Cursor::new(BINLOG_MAGIC.to_vec());
        read_magic(&mut ok).unwrap();
        let mut bad = Cursor::new(b"abcd".to_vec());
        assert!(read_magic(&mut bad).is_err());
    }

    #[test]
    fn test_version_has_checksum() {
        assert!(version_has_checksum("8.0.36-log"));
        assert!(version_has_checksum("5.6.1"));
        assert!(!version_has_checksum("5.5.60"));
    }
}
