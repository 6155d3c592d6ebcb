//! 集成测试共用的binlog构造工具

#![allow(dead_code)]

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use binlog_shuttle::event::{BINLOG_MAGIC, EventReader, FormatDescription};
use binlog_shuttle::{Gtid, GtidSet, Sid};

pub const UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

const HEADER_LEN: usize = 19;
const QUERY_EVENT: u8 = 2;
const FORMAT_DESCRIPTION_EVENT: u8 = 15;
const XID_EVENT: u8 = 16;
const GTID_LOG_EVENT: u8 = 33;

pub fn sid() -> Sid {
    UUID.parse().unwrap()
}

pub fn gtid(gno: u64) -> Gtid {
    Gtid::new(sid(), gno)
}

pub fn gtid_set(text: &str) -> GtidSet {
    text.parse().unwrap()
}

/// 按文件内偏移构造binlog，每个事件的log_pos都指向下一个事件
pub struct BinlogBuilder {
    data: Vec<u8>,
    checksum: bool,
}

impl BinlogBuilder {
    /// 写入magic头和FORMAT_DESCRIPTION事件
    pub fn new(checksum: bool) -> BinlogBuilder {
        let mut builder = BinlogBuilder { data: BINLOG_MAGIC.to_vec(), checksum };
        builder.format_description();
        builder
    }

    pub fn position(&self) -> u64 {
        self.data.len() as u64
    }

    fn event(&mut self, event_type: u8, payload: &[u8], checksum: bool) {
        let size = HEADER_LEN + payload.len() + if checksum { 4 } else { 0 };
        let log_pos = self.position() + size as u64;
        let start = self.data.len();
        self.data.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        self.data.push(event_type);
        self.data.extend_from_slice(&1u32.to_le_bytes());
        self.data.extend_from_slice(&(size as u32).to_le_bytes());
        self.data.extend_from_slice(&(log_pos as u32).to_le_bytes());
        self.data.extend_from_slice(&0u16.to_le_bytes());
        self.data.extend_from_slice(payload);
        if checksum {
            let crc = crc32fast::hash(&self.data[start..]);
            self.data.extend_from_slice(&crc.to_le_bytes());
        }
    }

    fn format_description(&mut self) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; 50];
        version[..6].copy_from_slice(b"8.0.36");
        payload.extend_from_slice(&version);
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(HEADER_LEN as u8);
        payload.extend_from_slice(&[0u8; 41]);
        payload.push(if self.checksum { 1 } else { 0 });
        // FORMAT_DESCRIPTION事件总是带校验和字段
        self.event(FORMAT_DESCRIPTION_EVENT, &payload, true);
    }

    pub fn gtid(&mut self, gno: u64) -> &mut BinlogBuilder {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&sid().0);
        payload.extend_from_slice(&gno.to_le_bytes());
        payload.push(2);
        payload.extend_from_slice(&[0u8; 16]);
        self.event(GTID_LOG_EVENT, &payload, self.checksum);
        self
    }

    pub fn query(&mut self, text: &str) -> &mut BinlogBuilder {
        self.event(QUERY_EVENT, text.as_bytes(), self.checksum);
        self
    }

    pub fn xid(&mut self, xid: u64) -> &mut BinlogBuilder {
        self.event(XID_EVENT, &xid.to_le_bytes(), self.checksum);
        self
    }

    /// 一个完整的事务：GTID、语句和提交
    pub fn transaction(&mut self, gno: u64) -> &mut BinlogBuilder {
        self.gtid(gno)
            .query(&format!("insert into t values ({})", gno))
            .xid(gno)
    }

    /// 追加任意字节，例如被截断的事件
    pub fn raw(&mut self, bytes: &[u8]) -> &mut BinlogBuilder {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn write(&self, path: &Path) {
        fs::write(path, &self.data).unwrap();
    }
}

/// 两个binlog：第一个包含GTID 1-50，第二个包含51-105，
/// `end_of_100` 是第二个文件中事务100之后的位置
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub end_of_100: u64,
}

impl Fixture {
    pub fn new(checksum: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        let mut first = BinlogBuilder::new(checksum);
        for gno in 1..=50 {
            first.transaction(gno);
        }
        first.write(&dir.path().join("binlog.000001"));

        let mut second = BinlogBuilder::new(checksum);
        for gno in 51..=100 {
            second.transaction(gno);
        }
        let end_of_100 = second.position();
        for gno in 101..=105 {
            second.transaction(gno);
        }
        second.write(&dir.path().join("binlog.000002"));

        Fixture { dir, end_of_100 }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn binlog(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// 解析binlog字节流（含magic头）中的所有GTID
pub fn decode_gtids(data: &[u8]) -> GtidSet {
    assert_eq!(&data[..4], &BINLOG_MAGIC, "缺少magic头");
    let mut reader = EventReader::new(io::Cursor::new(&data[4..]), 4);
    let mut format = None;
    let mut gtids = GtidSet::new();
    while let Some(event) = reader.next_event().unwrap() {
        if event.is_format_description() {
            format = Some(FormatDescription::parse(&event).unwrap());
        } else if event.is_gtid() {
            let gtid = format.as_ref().expect("GTID之前没有FORMAT_DESCRIPTION").decode_gtid(&event).unwrap();
            assert!(gtids.add(&gtid), "重复的GTID {}", gtid);
        }
    }
    gtids
}

pub fn read_file(path: &Path) -> Vec<u8> {
    let mut data = Vec::new();
    fs::File::open(path).unwrap().read_to_end(&mut data).unwrap();
    data
}
