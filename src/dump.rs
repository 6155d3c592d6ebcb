//! binlog导出
//!
//! 一次导出把源服务器上一段连续的binlog范围复制为输出根目录下一个带日期的子目录：
//! 每个binlog文件对应一个段文件（magic头 + 原样的事件字节，可选压缩）和一个段元数据文件。
//! 段之间相互独立，由worker池并行导出，每个任务各自打开自己的事件流。
//!
//! 任一段失败或运行被中断时，本次创建的目录会被尽力删除，
//! 存储不支持删除时只给出警告。

use std::cell::RefCell;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;

use crate::compression::OutputFile;
use crate::config::DumpConfig;
use crate::error::{ItemErrors, config_error, interrupted, invalid_data, is_interrupted, with_context};
use crate::event::{BINLOG_MAGIC, EventReader};
use crate::event_filter::{Action, EventFilter, FilterOutcome};
use crate::gtid::{Gtid, GtidSet};
use crate::interrupt::Interrupt;
use crate::logging::{format_bytes, throughput};
use crate::metadata::{
    self, BasenameAllocator, DUMPER, DumpOptions, FORMAT_VERSION, ROOT_MARKER, RUN_DONE,
    RUN_MANIFEST, RootMarker, RunCompletion, RunManifest, SegmentMetadata,
};
use crate::source::{BinlogFile, BinlogPosition, BinlogSource};
use crate::storage::{LocalStorage, Removal, Storage};
use crate::worker_pool::WorkerPool;
use crate::{debug_log, info_log, warn_log};

/// 单个段的导出任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTask {
    pub name: String,
    /// 事件流的起始位置，不小于magic头长度
    pub begin: u64,
    /// 最后一个段的结束位置
    pub end: Option<u64>,
    /// 是否把起始位置记录到段元数据中
    pub record_start: bool,
    pub basename: String,
}

/// 导出范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRange {
    pub start: BinlogPosition,
    pub end: BinlogPosition,
    /// 参与导出的binlog，按顺序
    pub binlogs: Vec<BinlogFile>,
}

impl DumpRange {
    /// 在源服务器的binlog列表中确定 `[start, end)` 覆盖的文件
    pub fn resolve(
        binlogs: &[BinlogFile],
        start: Option<BinlogPosition>,
        end: Option<BinlogPosition>,
    ) -> io::Result<DumpRange> {
        let magic_len = BINLOG_MAGIC.len() as u64;
        let (Some(first), Some(last)) = (binlogs.first(), binlogs.last()) else {
            return Err(config_error("源服务器上没有binlog"));
        };

        let start = start.unwrap_or_else(|| BinlogPosition::new(&first.name, magic_len));
        let end = end.unwrap_or_else(|| BinlogPosition::new(&last.name, last.size));

        let index_of = |position: &BinlogPosition| {
            binlogs
                .iter()
                .position(|binlog| binlog.name == position.file)
                .ok_or_else(|| config_error(format!("源服务器上没有binlog {}", position.file)))
        };
        let first_index = index_of(&start)?;
        let last_index = index_of(&end)?;

        if start.position > binlogs[first_index].size {
            return Err(config_error(format!(
                "起始位置 {}:{} 超出文件大小 {}",
                start.file, start.position, binlogs[first_index].size
            )));
        }
        if end.position > binlogs[last_index].size {
            return Err(config_error(format!(
                "结束位置 {}:{} 超出文件大小 {}",
                end.file, end.position, binlogs[last_index].size
            )));
        }
        if first_index > last_index || (first_index == last_index && start.position > end.position) {
            return Err(config_error(format!(
                "起始位置 {}:{} 在结束位置 {}:{} 之后",
                start.file, start.position, end.file, end.position
            )));
        }

        Ok(DumpRange {
            start,
            end,
            binlogs: binlogs[first_index..=last_index].to_vec(),
        })
    }

    /// 范围内没有任何事件
    pub fn is_empty(&self) -> bool {
        self.start.file == self.end.file
            && self.start.position.max(BINLOG_MAGIC.len() as u64) >= self.end.position
    }
}

/// 运行级统计，段任务完成时累加
#[derive(Debug, Default)]
struct DumpCounters {
    segments: AtomicU64,
    events: AtomicU64,
    data_bytes: AtomicU64,
    file_bytes: AtomicU64,
}

/// 导出统计的快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub segments: u64,
    pub events: u64,
    pub data_bytes: u64,
    pub file_bytes: u64,
}

/// 一次成功导出的结果
#[derive(Debug, Clone)]
pub struct DumpSummary {
    /// 相对输出根目录的子目录，范围为空时没有创建
    pub dir: Option<PathBuf>,
    pub start_from: BinlogPosition,
    pub end_at: BinlogPosition,
    /// 按段顺序
    pub segments: Vec<SegmentMetadata>,
    /// 本次导出包含的GTID
    pub gtid_set: GtidSet,
    /// 目标GTID集合中没有导出的部分，只在未指定 `gtid_executed` 时计算
    pub remaining_gtids: Option<GtidSet>,
    pub stats: DumpStats,
}

/// 段任务共享的只读上下文
struct SegmentContext {
    config: DumpConfig,
    source: Arc<dyn BinlogSource>,
    storage: Arc<dyn Storage>,
    interrupt: Interrupt,
    run_dir: PathBuf,
    counters: Arc<DumpCounters>,
    gtid_set: Arc<Mutex<GtidSet>>,
}

pub struct Dumper {
    config: DumpConfig,
    source: Arc<dyn BinlogSource>,
    storage: Arc<dyn Storage>,
    interrupt: Interrupt,
    counters: Arc<DumpCounters>,
}

impl Dumper {
    /// 输出写到 `config.output_root` 指向的本地目录
    pub fn new(config: DumpConfig, source: Arc<dyn BinlogSource>) -> io::Result<Dumper> {
        let storage = Arc::new(LocalStorage::new(&config.output_root));
        Dumper::with_storage(config, source, storage)
    }

    /// 输出写到指定存储的根目录，忽略 `config.output_root`
    pub fn with_storage(
        config: DumpConfig,
        source: Arc<dyn BinlogSource>,
        storage: Arc<dyn Storage>,
    ) -> io::Result<Dumper> {
        config.validate()?;
        Ok(Dumper {
            config,
            source,
            storage,
            interrupt: Interrupt::new(),
            counters: Arc::new(DumpCounters::default()),
        })
    }

    /// 使用调用方的中断标志，例如和其他组件共享
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Dumper {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt(&self) {
        self.interrupt.set();
    }

    /// 用户发起的中断（例如信号处理函数中）
    pub fn async_interrupt(&self) {
        self.interrupt.set_from_user("导出");
    }

    pub fn interrupt_flag(&self) -> &Interrupt {
        &self.interrupt
    }

    /// 当前的统计，可以在 `run()` 进行时从其他线程读取
    pub fn stats(&self) -> DumpStats {
        DumpStats {
            segments: self.counters.segments.load(Ordering::Relaxed),
            events: self.counters.events.load(Ordering::Relaxed),
            data_bytes: self.counters.data_bytes.load(Ordering::Relaxed),
            file_bytes: self.counters.file_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn run(&self) -> io::Result<DumpSummary> {
        let started = Instant::now();
        info_log!("开始从 {} 导出binlog到 {}", self.source.describe(), self.storage.describe());

        let range = self.resolve_range()?;
        info_log!(
            "导出范围 {}:{} - {}:{}，共 {} 个binlog",
            range.start.file,
            range.start.position,
            range.end.file,
            range.end.position,
            range.binlogs.len()
        );
        if range.is_empty() {
            info_log!("没有新的binlog事件需要导出");
            return Ok(DumpSummary {
                dir: None,
                start_from: range.start,
                end_at: range.end,
                segments: Vec::new(),
                gtid_set: GtidSet::new(),
                remaining_gtids: None,
                stats: DumpStats::default(),
            });
        }

        let target_gtids = match &self.config.gtid_executed {
            Some(gtids) => gtids.clone(),
            None => self.source.gtid_executed()?,
        };
        self.interrupt.check()?;

        let created_marker = self.write_root_marker()?;
        let run_dir = match self.create_run_dir() {
            Ok(dir) => dir,
            Err(error) => {
                self.cleanup(None, created_marker);
                return Err(error);
            }
        };

        let outcome = self.dump_range(&range, &target_gtids, &run_dir).and_then(|(segments, gtid_set)| {
            // 完成文件只能覆盖完整的运行
            self.interrupt.check()?;
            let remaining = self.write_completion(&range, &target_gtids, &gtid_set, &run_dir)?;
            Ok((segments, gtid_set, remaining))
        });

        match outcome {
            Ok((segments, gtid_set, remaining)) => {
                let stats = self.stats();
                info_log!(
                    "导出完成：{} 个段，{} 个事件，{}（文件 {}），{}",
                    stats.segments,
                    stats.events,
                    format_bytes(stats.data_bytes),
                    format_bytes(stats.file_bytes),
                    throughput(stats.data_bytes, started.elapsed())
                );
                Ok(DumpSummary {
                    dir: Some(run_dir),
                    start_from: range.start,
                    end_at: range.end,
                    segments,
                    gtid_set,
                    remaining_gtids: remaining,
                    stats,
                })
            }
            Err(error) => {
                if is_interrupted(&error) {
                    warn_log!("导出被中断，正在清理 {}", run_dir.display());
                }
                self.cleanup(Some(&run_dir), created_marker);
                Err(error)
            }
        }
    }

    fn resolve_range(&self) -> io::Result<DumpRange> {
        let binlogs = self.source.list_binlogs()?;
        let start = if self.config.since {
            Some(self.previous_end()?)
        } else {
            self.config.start_from.clone()
        };
        DumpRange::resolve(&binlogs, start, self.config.end_at.clone())
    }

    /// 最近一次完成的导出记录的下一次起点
    fn previous_end(&self) -> io::Result<BinlogPosition> {
        let mut errors = ItemErrors::new();
        let runs = metadata::list_runs(self.storage.as_ref(), &mut errors)?;
        if !errors.is_empty() {
            warn_log!("输出根目录中有 {} 个无法识别的子目录", errors.len());
        }
        runs.into_iter()
            .rev()
            .find_map(|run| run.completion.map(|completion| completion.start_from))
            .ok_or_else(|| config_error(format!("{} 中没有已完成的导出，无法增量导出", self.storage.describe())))
    }

    /// 根目录标记不存在时写入，返回是否由本次运行创建
    fn write_root_marker(&self) -> io::Result<bool> {
        let path = Path::new(ROOT_MARKER);
        self.storage.create_dir_all(Path::new(""))?;
        if self.storage.exists(path)? {
            return Ok(false);
        }
        let marker = RootMarker {
            dumper: DUMPER.to_string(),
            version: FORMAT_VERSION.to_string(),
            origin: self.config.origin.clone(),
            timestamp: Utc::now(),
            source: self.source.describe(),
        };
        metadata::write_json(self.storage.as_ref(), path, &marker)?;
        Ok(true)
    }

    fn create_run_dir(&self) -> io::Result<PathBuf> {
        let base = metadata::dated_directory_name(Utc::now());
        let storage = self.storage.as_ref();
        let name = metadata::unique_name(&base, |candidate| storage.exists(Path::new(candidate)))?;
        let dir = PathBuf::from(name);
        storage.create_dir_all(&dir)?;
        debug_log!("创建导出目录 {}", dir.display());
        Ok(dir)
    }

    fn plan_segments(&self, range: &DumpRange) -> Vec<SegmentTask> {
        let magic_len = BINLOG_MAGIC.len() as u64;
        let mut basenames = BasenameAllocator::new();
        let count = range.binlogs.len();

        range
            .binlogs
            .iter()
            .enumerate()
            .map(|(index, binlog)| {
                let first = index == 0;
                let last = index + 1 == count;
                SegmentTask {
                    name: binlog.name.clone(),
                    begin: if first { range.start.position.max(magic_len) } else { magic_len },
                    end: last.then_some(range.end.position),
                    record_start: first,
                    basename: basenames.allocate(&binlog.name),
                }
            })
            .collect()
    }

    fn write_manifest(&self, range: &DumpRange, target: &GtidSet, tasks: &[SegmentTask], run_dir: &Path) -> io::Result<()> {
        let config = &self.config;
        let manifest = RunManifest {
            dumper: DUMPER.to_string(),
            version: FORMAT_VERSION.to_string(),
            origin: config.origin.clone(),
            timestamp: Utc::now(),
            source: self.source.describe(),
            options: DumpOptions {
                threads: config.threads,
                compression: config.compression,
                verify_checksums: config.verify_checksums,
                since: config.since,
                start_from: config.start_from.clone(),
                end_at: config.end_at.clone(),
                gtid_executed: config.gtid_executed.as_ref().map(GtidSet::to_string),
            },
            start_from: range.start.clone(),
            end_at: range.end.clone(),
            gtid_set: target.to_string(),
            binlogs: tasks.iter().map(|task| task.name.clone()).collect(),
            basenames: tasks
                .iter()
                .map(|task| (task.name.clone(), task.basename.clone()))
                .collect(),
        };
        metadata::write_json(self.storage.as_ref(), &run_dir.join(RUN_MANIFEST), &manifest)
    }

    fn dump_range(
        &self,
        range: &DumpRange,
        target: &GtidSet,
        run_dir: &Path,
    ) -> io::Result<(Vec<SegmentMetadata>, GtidSet)> {
        let tasks = self.plan_segments(range);
        self.write_manifest(range, target, &tasks, run_dir)?;

        let total = tasks.len();
        let run_gtids = Arc::new(Mutex::new(GtidSet::new()));
        let results: RefCell<Vec<Option<SegmentMetadata>>> = RefCell::new(vec![None; total]);

        let threads = self.config.threads.min(total).max(1);
        let mut pool = WorkerPool::new("binlog-dump", threads, self.interrupt.clone())?;
        for (index, task) in tasks.into_iter().enumerate() {
            let context = SegmentContext {
                config: self.config.clone(),
                source: self.source.clone(),
                storage: self.storage.clone(),
                interrupt: self.interrupt.clone(),
                run_dir: run_dir.to_path_buf(),
                counters: self.counters.clone(),
                gtid_set: run_gtids.clone(),
            };
            let results = &results;
            let counters = &self.counters;
            pool.add_task(
                move || dump_one_segment(&task, &context),
                move |segment: SegmentMetadata| {
                    let done = counters.segments.load(Ordering::Relaxed);
                    info_log!(
                        "[{}/{}] {}：{} 个事件，{}",
                        done,
                        total,
                        segment.name,
                        segment.event_count,
                        format_bytes(segment.data_bytes)
                    );
                    results.borrow_mut()[index] = Some(segment);
                    Ok(())
                },
            )?;
        }
        pool.process()?;
        drop(pool);

        let segments: Vec<SegmentMetadata> = results.into_inner().into_iter().flatten().collect();
        if segments.len() != total {
            return Err(interrupted());
        }
        let gtid_set = run_gtids.lock().clone();
        Ok((segments, gtid_set))
    }

    fn write_completion(
        &self,
        range: &DumpRange,
        target: &GtidSet,
        dumped: &GtidSet,
        run_dir: &Path,
    ) -> io::Result<Option<GtidSet>> {
        let remaining = match self.config.gtid_executed {
            Some(_) => None,
            None => Some(self.source.subtract_gtids(target, dumped)?),
        };
        let completion = RunCompletion {
            timestamp: Utc::now(),
            gtid_executed: remaining.as_ref().map(GtidSet::to_string),
            start_from: range.end.clone(),
        };
        metadata::write_json(self.storage.as_ref(), &run_dir.join(RUN_DONE), &completion)?;
        Ok(remaining)
    }

    /// 尽力删除本次运行创建的文件，失败只给出警告
    fn cleanup(&self, run_dir: Option<&Path>, created_marker: bool) {
        let storage = self.storage.as_ref();
        if let Some(dir) = run_dir {
            report_removal(dir, storage.remove_dir_all(dir));
        }
        if created_marker {
            let marker = Path::new(ROOT_MARKER);
            report_removal(marker, storage.remove_file(marker));
        }
    }
}

fn report_removal(path: &Path, result: io::Result<Removal>) {
    match result {
        Ok(Removal::Removed) => {
            debug_log!("已删除 {}", path.display());
        }
        Ok(Removal::Unsupported) => {
            warn_log!("存储不支持删除，保留 {}", path.display());
        }
        Err(error) => {
            warn_log!("无法删除 {}: {}", path.display(), error);
        }
    }
}

/// 导出一个段：写magic头，然后原样复制事件直到流结束或到达结束位置
fn dump_one_segment(task: &SegmentTask, context: &SegmentContext) -> io::Result<SegmentMetadata> {
    context.interrupt.check()?;
    let started_at = Utc::now();
    let config = &context.config;
    let extension = config.compression.extension();
    let file_path = context.run_dir.join(format!("{}{}", task.basename, extension));
    debug_log!("导出 {} 从位置 {} 到 {}", task.name, task.begin, file_path.display());

    let (gtids, data_bytes, event_count, file_bytes) =
        copy_segment(task, context, &file_path).map_err(|e| with_context(e, &task.name))?;

    let segment = SegmentMetadata {
        name: task.name.clone(),
        start_position: task.record_start.then_some(task.begin),
        end_position: task.end,
        compression: config.compression,
        extension: extension.to_string(),
        gtid_set: gtids.to_string(),
        data_bytes,
        file_bytes,
        event_count,
        started_at,
        finished_at: Utc::now(),
    };
    metadata::write_json(
        context.storage.as_ref(),
        &context.run_dir.join(format!("{}.json", task.basename)),
        &segment,
    )?;

    context.gtid_set.lock().add_set(&gtids);
    let counters = &context.counters;
    counters.events.fetch_add(event_count, Ordering::Relaxed);
    counters.data_bytes.fetch_add(data_bytes, Ordering::Relaxed);
    counters.file_bytes.fetch_add(file_bytes, Ordering::Relaxed);
    counters.segments.fetch_add(1, Ordering::Relaxed);
    Ok(segment)
}

/// 返回 (GTID集合, 数据字节数, 事件数, 文件字节数)
fn copy_segment(
    task: &SegmentTask,
    context: &SegmentContext,
    file_path: &Path,
) -> io::Result<(GtidSet, u64, u64, u64)> {
    let config = &context.config;
    let input = context.source.open_binlog(&task.name, task.begin)?;
    let writer = context.storage.create_file(file_path)?;
    let mut output = OutputFile::new(config.compression, config.zstd_compression_level, writer)?;
    output.write_all(&BINLOG_MAGIC)?;

    let mut filter = EventFilter::new(EventReader::new(io::BufReader::new(input), task.begin))
        .verify_checksums(config.verify_checksums)
        .with_interrupt(context.interrupt.clone());
    if let Some(end) = task.end {
        filter = filter.stop_at_position(end);
    }

    let mut gtids = GtidSet::new();
    let mut on_gtid = |event: &crate::event::Event<'_>, gtid: &Gtid| {
        if !gtids.add(gtid) {
            return Err(invalid_data(format!("位置{}处的GTID {} 重复", event.position, gtid)));
        }
        Ok(Action::Write)
    };
    let outcome = filter.filter(
        |_| Ok(Action::Write),
        Some(&mut on_gtid),
        |event| output.write_all(event.data),
    )?;

    if let (FilterOutcome::Exhausted, Some(end)) = (outcome, task.end) {
        warn_log!("{} 在到达结束位置 {} 之前结束", task.name, end);
    }

    let data_bytes = BINLOG_MAGIC.len() as u64 + filter.written_bytes();
    let event_count = filter.written_events();
    let buffered = output.physical_bytes();
    let file_bytes = output.finish()?;
    if let Some(before_finish) = buffered {
        debug_log!(
            "{}: 压缩器在关闭时又写出了 {} 字节",
            task.name,
            file_bytes.saturating_sub(before_finish)
        );
    }
    Ok((gtids, data_bytes, event_count, file_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binlogs() -> Vec<BinlogFile> {
        vec![
            BinlogFile { name: "binlog.000001".to_string(), size: 1000 },
            BinlogFile { name: "binlog.000002".to_string(), size: 2000 },
            BinlogFile { name: "binlog.000003".to_string(), size: 300 },
        ]
    }

    #[test]
    fn test_resolve_whole_range() {
        let range = DumpRange::resolve(&binlogs(), None, None).unwrap();
        assert_eq!(range.start, BinlogPosition::new("binlog.000001", 4));
        assert_eq!(range.end, BinlogPosition::new("binlog.000003", 300));
        assert_eq!(range.binlogs.len(), 3);
        assert!(!range.is_empty());
    }

    #[test]
    fn test_resolve_partial_range() {
        let range = DumpRange::resolve(
            &binlogs(),
            Some(BinlogPosition::new("binlog.000002", 120)),
            Some(BinlogPosition::new("binlog.000002", 1500)),
        )
        .unwrap();
        assert_eq!(range.binlogs, vec![BinlogFile { name: "binlog.000002".to_string(), size: 2000 }]);

        let empty = DumpRange::resolve(
            &binlogs(),
            Some(BinlogPosition::new("binlog.000003", 300)),
            None,
        )
        .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_resolve_errors() {
        let cases = [
            (Some(BinlogPosition::new("binlog.000009", 4)), None),
            (None, Some(BinlogPosition::new("binlog.000002", 5000))),
            (Some(BinlogPosition::new("binlog.000001", 2000)), None),
            (
                Some(BinlogPosition::new("binlog.000003", 4)),
                Some(BinlogPosition::new("binlog.000001", 400)),
            ),
        ];
        for (start, end) in cases {
            let error = DumpRange::resolve(&binlogs(), start, end).unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        }
        assert!(DumpRange::resolve(&[], None, None).is_err());
    }
}
