//! binlog来源
//!
//! 导出只通过 `BinlogSource` 访问源服务器：列出binlog文件、查询已执行的GTID集合、
//! 打开一个从指定位置开始的事件流。每个导出任务各自打开自己的流。

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fault_injection::fallible;
use serde::{Deserialize, Serialize};

use crate::error::{invalid_data, with_context};
use crate::event::{BINLOG_MAGIC, EventReader, read_magic};
use crate::event_filter::{Action, EventFilter};
use crate::gtid::{Gtid, GtidSet};
use crate::trace_log;

/// binlog中的一个位置
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, position: u64) -> BinlogPosition {
        BinlogPosition { file: file.into(), position }
    }
}

/// 源服务器上的一个binlog文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogFile {
    pub name: String,
    pub size: u64,
}

pub trait BinlogSource: Send + Sync {
    /// 用于日志和元数据的来源描述，不包含密码
    fn describe(&self) -> String;

    /// 按顺序列出所有binlog文件
    fn list_binlogs(&self) -> io::Result<Vec<BinlogFile>>;

    /// 源服务器已执行的GTID集合
    fn gtid_executed(&self) -> io::Result<GtidSet>;

    /// 打开从 `position` 开始的事件流，不包含magic头
    ///
    /// `position` 大于magic头长度时，流的第一个事件是该文件的FORMAT_DESCRIPTION事件，
    /// 随后才是 `position` 处的事件
    fn open_binlog(&self, name: &str, position: u64) -> io::Result<Box<dyn Read + Send>>;

    /// 计算 `a - b`
    fn subtract_gtids(&self, a: &GtidSet, b: &GtidSet) -> io::Result<GtidSet> {
        Ok(a.subtract(b))
    }
}

/// 本地目录中的binlog文件
///
/// 文件名形如 `<basename>.<序号>`，按文件名排序
#[derive(Debug, Clone)]
pub struct LocalBinlogSource {
    dir: PathBuf,
}

impl LocalBinlogSource {
    pub fn new(dir: impl Into<PathBuf>) -> LocalBinlogSource {
        LocalBinlogSource { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open_checked(&self, name: &str) -> io::Result<File> {
        let path = self.dir.join(name);
        let mut file = fallible!(File::open(&path));
        read_magic(&mut file).map_err(|e| with_context(e, path.display()))?;
        Ok(file)
    }
}

fn is_binlog_name(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((base, sequence)) => {
            !base.is_empty() && !sequence.is_empty() && sequence.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

impl BinlogSource for LocalBinlogSource {
    fn describe(&self) -> String {
        format!("file://{}", self.dir.display())
    }

    fn list_binlogs(&self) -> io::Result<Vec<BinlogFile>> {
        let mut binlogs = Vec::new();
        for entry in fallible!(fs::read_dir(&self.dir)) {
            let entry = fallible!(entry);
            let metadata = fallible!(entry.metadata());
            let name = entry.file_name().to_string_lossy().into_owned();
            if metadata.is_file() && is_binlog_name(&name) {
                binlogs.push(BinlogFile { name, size: metadata.len() });
            }
        }
        binlogs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(binlogs)
    }

    fn gtid_executed(&self) -> io::Result<GtidSet> {
        let mut executed = GtidSet::new();
        for binlog in self.list_binlogs()? {
            let file = self.open_checked(&binlog.name)?;
            let mut filter = EventFilter::new(EventReader::new(io::BufReader::new(file), BINLOG_MAGIC.len() as u64));
            let mut collect = |_: &crate::event::Event<'_>, gtid: &Gtid| {
                executed.add(gtid);
                Ok(Action::Skip)
            };
            filter
                .filter(|_| Ok(Action::Skip), Some(&mut collect), |_| Ok(()))
                .map_err(|e| with_context(e, &binlog.name))?;
        }
        Ok(executed)
    }

    fn open_binlog(&self, name: &str, position: u64) -> io::Result<Box<dyn Read + Send>> {
        let magic_len = BINLOG_MAGIC.len() as u64;
        let mut file = self.open_checked(name)?;
        if position <= magic_len {
            return Ok(Box::new(file));
        }

        // 取出文件开头的FORMAT_DESCRIPTION事件放在流的最前面
        let mut reader = EventReader::new(io::BufReader::new(file.try_clone()?), magic_len);
        let format_description = match reader.next_event()? {
            Some(event) if event.is_format_description() => event.data.to_vec(),
            _ => return Err(invalid_data(format!("{}: 第一个事件不是FORMAT_DESCRIPTION", name))),
        };
        drop(reader);

        fallible!(file.seek(SeekFrom::Start(position)));
        trace_log!("打开 {} 位置 {}", name, position);
        Ok(Box::new(Cursor::new(format_description).chain(file)))
    }
}
