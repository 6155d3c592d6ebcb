//! 导出目录的JSON元数据
//!
//! 目录结构：
//!
//! ```text
//! <root>/@.binlog.json                 根标记，每个根目录写一次
//! <root>/<日期>/@.json                  本次导出的清单
//! <root>/<日期>/<basename><扩展名>      段文件
//! <root>/<日期>/<basename>.json         段元数据
//! <root>/<日期>/@.done.json             只在导出成功后写入
//! ```

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CompressionAlgorithm;
use crate::error::{ItemErrors, invalid_data, with_context};
use crate::source::BinlogPosition;
use crate::storage::Storage;

pub const DUMPER: &str = "binlog_shuttle";
pub const FORMAT_VERSION: &str = "1.0.0";

pub const ROOT_MARKER: &str = "@.binlog.json";
pub const RUN_MANIFEST: &str = "@.json";
pub const RUN_DONE: &str = "@.done.json";

/// 文件名的最大长度
pub const MAX_FILE_NAME_LEN: usize = 255;
/// 为冲突后缀（`-N`）预留的长度
const SUFFIX_RESERVE: usize = 8;
/// 最长的扩展名（`.json`）
const MAX_EXTENSION_LEN: usize = 5;

const DIRECTORY_FORMAT: &str = "%Y-%m-%d--%H-%M-%S";

/// 根目录标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootMarker {
    pub dumper: String,
    pub version: String,
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// 导出时使用的选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpOptions {
    pub threads: usize,
    pub compression: CompressionAlgorithm,
    pub verify_checksums: bool,
    pub since: bool,
    pub start_from: Option<BinlogPosition>,
    pub end_at: Option<BinlogPosition>,
    pub gtid_executed: Option<String>,
}

/// 一次导出的清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub dumper: String,
    pub version: String,
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub options: DumpOptions,
    pub start_from: BinlogPosition,
    pub end_at: BinlogPosition,
    /// 源服务器的目标GTID集合
    pub gtid_set: String,
    /// 按顺序排列的段名
    pub binlogs: Vec<String>,
    /// 段名到文件basename的映射
    pub basenames: BTreeMap<String, String>,
}

/// 单个段的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetadata {
    pub name: String,
    /// 只有范围导出的第一个段才有
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start_position: Option<u64>,
    /// 只有范围导出的最后一个段才有
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_position: Option<u64>,
    pub compression: CompressionAlgorithm,
    pub extension: String,
    pub gtid_set: String,
    /// 写入的事件字节数（含magic头，压缩前）
    pub data_bytes: u64,
    /// 段文件的实际字节数
    pub file_bytes: u64,
    pub event_count: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// 导出完成标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompletion {
    pub timestamp: DateTime<Utc>,
    /// 源服务器目标GTID集合减去本次导出的部分
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gtid_executed: Option<String>,
    /// 下一次增量导出的起点
    pub start_from: BinlogPosition,
}

pub fn write_json<T: Serialize>(storage: &dyn Storage, path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    storage
        .write_all(path, &data)
        .map_err(|e| with_context(e, path.display()))
}

pub fn read_json<T: DeserializeOwned>(storage: &dyn Storage, path: &Path) -> io::Result<T> {
    let data = storage
        .read_to_vec(path)
        .map_err(|e| with_context(e, path.display()))?;
    serde_json::from_slice(&data)
        .map_err(|e| invalid_data(format!("{}: {}", path.display(), e)))
}

/// 本次导出的目录名
pub fn dated_directory_name(now: DateTime<Utc>) -> String {
    now.format(DIRECTORY_FORMAT).to_string()
}

/// 返回第一个不冲突的名字：`base`、`base-1`、`base-2`……
pub fn unique_name(base: &str, mut taken: impl FnMut(&str) -> io::Result<bool>) -> io::Result<String> {
    if !taken(base)? {
        return Ok(base.to_string());
    }
    for n in 1.. {
        let candidate = format!("{}-{}", base, n);
        if !taken(&candidate)? {
            return Ok(candidate);
        }
    }
    unreachable!("候选名字不会耗尽")
}

/// 把段名编码为安全的文件basename
///
/// 保留字母、数字和 `_-.`，其余字节编码为 `%XX`。开头的 `@` 也被编码，
/// 避免与元数据文件冲突。长度截断到加上冲突后缀和扩展名后不超过255。
pub fn encode_basename(name: &str) -> String {
    let limit = MAX_FILE_NAME_LEN - SUFFIX_RESERVE - MAX_EXTENSION_LEN;
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        let piece = if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.') {
            (byte as char).to_string()
        } else {
            format!("%{:02X}", byte)
        };
        if encoded.len() + piece.len() > limit {
            break;
        }
        encoded.push_str(&piece);
    }
    if encoded.is_empty() || encoded.starts_with('.') {
        encoded.insert(0, '_');
    }
    encoded
}

/// 为一次导出中的所有段分配互不冲突的basename
#[derive(Debug, Default)]
pub struct BasenameAllocator {
    used: HashSet<String>,
}

impl BasenameAllocator {
    pub fn new() -> BasenameAllocator {
        BasenameAllocator::default()
    }

    pub fn allocate(&mut self, name: &str) -> String {
        let base = encode_basename(name);
        // 和 `unique_name` 相同的后缀规则
        let mut basename = base.clone();
        let mut n = 0u64;
        while self.used.contains(&basename) {
            n += 1;
            basename = format!("{}-{}", base, n);
        }
        self.used.insert(basename.clone());
        basename
    }
}

/// 根目录下的一次导出
#[derive(Debug, Clone)]
pub struct RunInfo {
    /// 相对根目录的子目录
    pub dir: PathBuf,
    pub manifest: RunManifest,
    pub completion: Option<RunCompletion>,
}

impl RunInfo {
    pub fn is_complete(&self) -> bool {
        self.completion.is_some()
    }

    pub fn segment_metadata(&self, storage: &dyn Storage, name: &str) -> io::Result<SegmentMetadata> {
        let basename = self
            .manifest
            .basenames
            .get(name)
            .ok_or_else(|| invalid_data(format!("{}: 清单中没有段 {}", self.dir.display(), name)))?;
        read_json(storage, &self.dir.join(format!("{}.json", basename)))
    }
}

/// 按时间顺序列出根目录下的所有导出
///
/// 没有清单或清单无法解析的子目录作为非致命错误收集
pub fn list_runs(storage: &dyn Storage, errors: &mut ItemErrors) -> io::Result<Vec<RunInfo>> {
    let mut runs = Vec::new();
    for name in storage.list_dir(Path::new(""))? {
        if name.starts_with('@') {
            continue;
        }
        let dir = PathBuf::from(&name);
        let manifest_path = dir.join(RUN_MANIFEST);
        if !storage.exists(&manifest_path)? {
            errors.push(name, io::Error::new(io::ErrorKind::NotFound, "缺少导出清单"));
            continue;
        }

        let manifest: RunManifest = match read_json(storage, &manifest_path) {
            Ok(manifest) => manifest,
            Err(error) => {
                errors.push(name, error);
                continue;
            }
        };

        let done_path = dir.join(RUN_DONE);
        let completion = if storage.exists(&done_path)? {
            Some(read_json(storage, &done_path)?)
        } else {
            None
        };
        runs.push(RunInfo { dir, manifest, completion });
    }

    runs.sort_by(|a, b| {
        a.manifest
            .timestamp
            .cmp(&b.manifest.timestamp)
            .then_with(|| a.dir.cmp(&b.dir))
    });
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use chrono::TimeZone;

    #[test]
    fn test_basename_encoding() {
        assert_eq!(encode_basename("binlog.000001"), "binlog.000001");
        assert_eq!(encode_basename("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_basename("@x"), "%40x");
        assert_eq!(encode_basename(".hidden"), "_.hidden");

        let long = "x".repeat(400);
        let encoded = encode_basename(&long);
        assert!(encoded.len() + SUFFIX_RESERVE + MAX_EXTENSION_LEN <= MAX_FILE_NAME_LEN);
    }

    #[test]
    fn test_basename_collisions() {
        let long = "y".repeat(400);
        let mut allocator = BasenameAllocator::new();
        let first = allocator.allocate(&format!("{}1", long));
        let second = allocator.allocate(&format!("{}2", long));
        assert_ne!(first, second);
        assert_eq!(second, format!("{}-1", first));
        assert!(second.len() + MAX_EXTENSION_LEN <= MAX_FILE_NAME_LEN);

        let third = allocator.allocate(&format!("{}3", long));
        assert_eq!(third, format!("{}-2", first));
        // 不冲突的名字保持不变，也不会和带后缀的名字重复
        assert_eq!(allocator.allocate("binlog.000001"), "binlog.000001");
        assert_eq!(allocator.allocate("binlog.000001"), "binlog.000001-1");
    }

    #[test]
    fn test_dated_directory_name() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(dated_directory_name(now), "2024-03-09--07-05-01");

        let taken = ["2024-03-09--07-05-01", "2024-03-09--07-05-01-1"];
        let name = unique_name("2024-03-09--07-05-01", |c| Ok(taken.contains(&c))).unwrap();
        assert_eq!(name, "2024-03-09--07-05-01-2");
    }

    #[test]
    fn test_segment_metadata_json() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let segment = SegmentMetadata {
            name: "binlog.000001".to_string(),
            start_position: Some(1234),
            end_position: None,
            compression: CompressionAlgorithm::Zstd,
            extension: ".zst".to_string(),
            gtid_set: "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5".to_string(),
            data_bytes: 10,
            file_bytes: 8,
            event_count: 3,
            started_at: now,
            finished_at: now,
        };
        let json = serde_json::to_value(&segment).unwrap();
        assert_eq!(json["startPosition"], 1234);
        assert!(json.get("endPosition").is_none());
        assert_eq!(json["compression"], "zstd");
        assert_eq!(json["gtidSet"], "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5");

        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        write_json(&storage, Path::new("s.json"), &segment).unwrap();
        let back: SegmentMetadata = read_json(&storage, Path::new("s.json")).unwrap();
        assert_eq!(back, segment);

        storage.write_all(Path::new("bad.json"), b"{").unwrap();
        let error = read_json::<SegmentMetadata>(&storage, Path::new("bad.json")).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_list_runs_collects_broken_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.create_dir_all(Path::new("2024-01-01--00-00-00")).unwrap();
        storage.write_all(Path::new(ROOT_MARKER), b"{}").unwrap();

        let mut errors = ItemErrors::new();
        let runs = list_runs(&storage, &mut errors).unwrap();
        assert!(runs.is_empty());
        assert_eq!(errors.items().collect::<Vec<_>>(), vec!["2024-01-01--00-00-00"]);
    }
}
