use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::block_allocator::{DEFAULT_BLOCK_SIZE, DEFAULT_PAGE_SIZE};
use crate::error::config_error;
use crate::gtid::{Gtid, GtidSet};
use crate::memory_queue::DEFAULT_QUEUE_CAPACITY;
use crate::source::BinlogPosition;

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Self {
                self.$name = to;
                self
            }
        )*
    }
}

/// 段文件的压缩算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// 不压缩
    None,
    /// zstd帧格式
    #[default]
    Zstd,
    /// lz4帧格式
    Lz4,
}

impl CompressionAlgorithm {
    /// 段文件名的扩展名
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "",
            CompressionAlgorithm::Zstd => ".zst",
            CompressionAlgorithm::Lz4 => ".lz4",
        }
    }
}

/// 块分配器与内存队列的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// 每个块的字节数。默认为8 KiB
    pub block_size: usize,
    /// 每次向系统申请的页大小。默认为1 MiB
    pub page_size: usize,
    /// 每个内存队列最多容纳的块数。默认为1280
    pub queue_capacity: usize,
}

impl Default for AllocatorConfig {
    fn default() -> AllocatorConfig {
        AllocatorConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl AllocatorConfig {
    builder!(
        (block_size, usize, "每个块的字节数。"),
        (page_size, usize, "每次向系统申请的页大小。"),
        (queue_capacity, usize, "每个内存队列最多容纳的块数。")
    );

    pub fn validate(&self) -> io::Result<()> {
        if self.block_size == 0 {
            return Err(config_error("块大小不能为0"));
        }
        if self.page_size < self.block_size {
            return Err(config_error(format!(
                "页大小{}小于块大小{}",
                self.page_size, self.block_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(config_error("内存队列容量不能为0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// 输出根目录，每次导出在其中创建一个带日期的子目录
    pub output_root: PathBuf,
    /// 并行导出的线程数。默认为4
    pub threads: usize,
    /// 段文件的压缩算法。默认为zstd
    pub compression: CompressionAlgorithm,
    /// zstd压缩级别。默认为3
    pub zstd_compression_level: i32,
    /// 起始位置，`None` 表示从最早的binlog开头
    pub start_from: Option<BinlogPosition>,
    /// 结束位置，`None` 表示到当前最后一个binlog的末尾
    pub end_at: Option<BinlogPosition>,
    /// 从输出根目录中最近一次完成的导出的结束位置继续
    pub since: bool,
    /// 调用方提供的已执行GTID集合，`None` 时从源服务器查询
    pub gtid_executed: Option<GtidSet>,
    /// 校验每个事件的CRC32
    pub verify_checksums: bool,
    /// 写入元数据的来源标记
    pub origin: String,
}

impl Default for DumpConfig {
    fn default() -> DumpConfig {
        DumpConfig {
            output_root: "binlog_dump".into(),
            threads: 4,
            compression: CompressionAlgorithm::Zstd,
            zstd_compression_level: 3,
            start_from: None,
            end_at: None,
            since: false,
            gtid_executed: None,
            verify_checksums: false,
            origin: "binlog_shuttle".to_string(),
        }
    }
}

impl DumpConfig {
    pub fn new() -> DumpConfig {
        DumpConfig::default()
    }

    /// 设置输出根目录（构建器）
    pub fn output_root<P: AsRef<Path>>(mut self, path: P) -> DumpConfig {
        self.output_root = path.as_ref().to_path_buf();
        self
    }

    builder!(
        (threads, usize, "并行导出的线程数。默认为4。"),
        (compression, CompressionAlgorithm, "段文件的压缩算法。默认为zstd。"),
        (zstd_compression_level, i32, "zstd压缩级别。默认为3。"),
        (start_from, Option<BinlogPosition>, "起始位置，`None` 表示从最早的binlog开头。"),
        (end_at, Option<BinlogPosition>, "结束位置，`None` 表示到当前最后一个binlog的末尾。"),
        (since, bool, "从输出根目录中最近一次完成的导出的结束位置继续。"),
        (gtid_executed, Option<GtidSet>, "调用方提供的已执行GTID集合。"),
        (verify_checksums, bool, "校验每个事件的CRC32。"),
        (origin, String, "写入元数据的来源标记。")
    );

    pub fn validate(&self) -> io::Result<()> {
        if self.threads == 0 {
            return Err(config_error("导出线程数不能为0"));
        }
        if self.since && self.start_from.is_some() {
            return Err(config_error("since与start_from不能同时指定"));
        }
        if let (Some(start), Some(end)) = (&self.start_from, &self.end_at) {
            if start > end {
                return Err(config_error(format!(
                    "起始位置 {}:{} 在结束位置 {}:{} 之后",
                    start.file, start.position, end.file, end.position
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// 外部回放程序，从标准输入读取binlog，向标准输出写SQL
    pub replay_program: PathBuf,
    /// 回放程序的参数
    pub replay_args: Vec<String>,
    /// 只运行管道，不在目标服务器上执行语句
    pub dry_run: bool,
    /// 目标服务器上已经执行过的GTID集合，这些事务被跳过
    pub start_gtid_set: GtidSet,
    /// 在产生此GTID的事务之前停止
    pub stop_before_gtid: Option<Gtid>,
    /// 在产生此GTID的事务之后停止
    pub stop_after_gtid: Option<Gtid>,
    /// 批量导入每个事务的最大字节数，0表示不切分
    pub max_transaction_size: usize,
    /// 块分配器与内存队列的参数
    pub allocator: AllocatorConfig,
    /// 输入结束后等待回放进程自行退出的时间
    pub process_exit_timeout: Duration,
}

impl Default for LoadConfig {
    fn default() -> LoadConfig {
        LoadConfig {
            replay_program: "/usr/bin/mysqlbinlog".into(),
            replay_args: vec!["-".to_string()],
            dry_run: false,
            start_gtid_set: GtidSet::new(),
            stop_before_gtid: None,
            stop_after_gtid: None,
            max_transaction_size: 0,
            allocator: AllocatorConfig::default(),
            process_exit_timeout: Duration::from_secs(1),
        }
    }
}

impl LoadConfig {
    pub fn new() -> LoadConfig {
        LoadConfig::default()
    }

    /// 设置回放程序及其参数（构建器）
    pub fn replay_command<P: AsRef<Path>>(mut self, program: P, args: &[&str]) -> LoadConfig {
        self.replay_program = program.as_ref().to_path_buf();
        self.replay_args = args.iter().map(|arg| arg.to_string()).collect();
        self
    }

    builder!(
        (dry_run, bool, "只运行管道，不在目标服务器上执行语句。"),
        (start_gtid_set, GtidSet, "目标服务器上已经执行过的GTID集合。"),
        (stop_before_gtid, Option<Gtid>, "在产生此GTID的事务之前停止。"),
        (stop_after_gtid, Option<Gtid>, "在产生此GTID的事务之后停止。"),
        (max_transaction_size, usize, "批量导入每个事务的最大字节数，0表示不切分。"),
        (allocator, AllocatorConfig, "块分配器与内存队列的参数。"),
        (process_exit_timeout, Duration, "输入结束后等待回放进程自行退出的时间。")
    );

    /// 停止条件，两者最多设置一个
    pub(crate) fn stop_gtid(&self) -> Option<&Gtid> {
        self.stop_before_gtid.as_ref().or(self.stop_after_gtid.as_ref())
    }

    pub fn validate(&self) -> io::Result<()> {
        self.allocator.validate()?;
        if self.stop_before_gtid.is_some() && self.stop_after_gtid.is_some() {
            return Err(config_error("stop_before_gtid与stop_after_gtid不能同时指定"));
        }
        if let Some(stop) = self.stop_gtid() {
            if self.start_gtid_set.contains(stop) {
                return Err(config_error(format!("停止GTID {} 已经包含在起始GTID集合中", stop)));
            }
        }
        Ok(())
    }
}
