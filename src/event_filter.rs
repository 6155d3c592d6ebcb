//! 事件过滤
//!
//! 从 `EventReader` 中取出事件并按回调决定跳过、写出或停止。
//! FORMAT_DESCRIPTION事件总是更新当前格式描述并写出，保证每个输出段都能独立解析；
//! GTID事件交给GTID回调（未提供时按普通事件处理）；其余事件交给事件回调。
//!
//! 回调返回 `Action::Stop` 时，触发停止的事件被保留，
//! 在同一实例下一次调用 `filter` 时作为第一个事件重新投递，
//! 从而可以用不同的条件分多次扫描同一条逻辑流。

use std::io::{self, Read};

use crate::error::invalid_data;
use crate::event::{Event, EventReader, FormatDescription};
use crate::gtid::Gtid;
use crate::interrupt::Interrupt;

/// 单个事件的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    Write,
    Stop,
}

/// 一次 `filter` 调用的结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// 流中没有更多事件
    Exhausted,
    /// 回调要求停止，触发事件已保留
    Stopped,
    /// 到达了 `stop_at_position` 设定的位置
    ReachedPosition,
}

pub type GtidAction<'a> = &'a mut dyn FnMut(&Event<'_>, &Gtid) -> io::Result<Action>;

pub struct EventFilter<R> {
    reader: EventReader<R>,
    format: Option<FormatDescription>,
    pending: bool,
    stop_at: Option<u64>,
    verify_checksums: bool,
    interrupt: Option<Interrupt>,
    last_gtid: Option<Gtid>,
    written_events: u64,
    written_bytes: u64,
}

impl<R: Read> EventFilter<R> {
    pub fn new(reader: EventReader<R>) -> EventFilter<R> {
        EventFilter {
            reader,
            format: None,
            pending: false,
            stop_at: None,
            verify_checksums: false,
            interrupt: None,
            last_gtid: None,
            written_events: 0,
            written_bytes: 0,
        }
    }

    /// 写出 `next_position` 达到 `position` 的事件后停止，
    /// 起始位置已经达到 `position` 的事件不再写出
    pub fn stop_at_position(mut self, position: u64) -> EventFilter<R> {
        self.stop_at = Some(position);
        self
    }

    /// 按当前格式描述校验每个事件的CRC32
    pub fn verify_checksums(mut self, verify: bool) -> EventFilter<R> {
        self.verify_checksums = verify;
        self
    }

    /// 每个事件之前检查中断标志
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> EventFilter<R> {
        self.interrupt = Some(interrupt);
        self
    }

    /// 当前生效的格式描述
    pub fn format(&self) -> Option<&FormatDescription> {
        self.format.as_ref()
    }

    /// 最近一次解析出的GTID
    pub fn last_gtid(&self) -> Option<&Gtid> {
        self.last_gtid.as_ref()
    }

    pub fn written_events(&self) -> u64 {
        self.written_events
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    /// 处理事件直到流结束或某个回调返回 `Action::Stop`
    pub fn filter<E, W>(
        &mut self,
        mut on_event: E,
        mut on_gtid: Option<GtidAction<'_>>,
        mut write: W,
    ) -> io::Result<FilterOutcome>
    where
        E: FnMut(&Event<'_>) -> io::Result<Action>,
        W: FnMut(&Event<'_>) -> io::Result<()>,
    {
        loop {
            if let Some(interrupt) = &self.interrupt {
                interrupt.check()?;
            }

            let event = if self.pending {
                self.pending = false;
                self.reader.current()
            } else {
                self.reader.next_event()?
            };
            let Some(event) = event else {
                return Ok(FilterOutcome::Exhausted);
            };

            if let Some(stop_at) = self.stop_at {
                if event.position >= stop_at && !event.is_format_description() {
                    self.pending = true;
                    return Ok(FilterOutcome::ReachedPosition);
                }
            }

            let action = if event.is_format_description() {
                let format = FormatDescription::parse(&event)?;
                if self.verify_checksums {
                    format.verify_checksum(&event)?;
                }
                self.format = Some(format);
                Action::Write
            } else {
                if self.verify_checksums {
                    if let Some(format) = &self.format {
                        format.verify_checksum(&event)?;
                    }
                }

                match on_gtid.as_mut() {
                    Some(on_gtid) if event.is_gtid() => {
                        let format = self.format.as_ref().ok_or_else(|| {
                            invalid_data(format!(
                                "位置{}处的GTID事件之前没有FORMAT_DESCRIPTION事件",
                                event.position
                            ))
                        })?;
                        let gtid = format.decode_gtid(&event)?;
                        let action = on_gtid(&event, &gtid)?;
                        self.last_gtid = Some(gtid);
                        action
                    }
                    _ => on_event(&event)?,
                }
            };

            match action {
                Action::Skip => {}
                Action::Write => {
                    write(&event)?;
                    self.written_events += 1;
                    self.written_bytes += event.size as u64;

                    if self.stop_at.is_some_and(|stop_at| event.next_position >= stop_at) {
                        return Ok(FilterOutcome::ReachedPosition);
                    }
                }
                Action::Stop => {
                    self.pending = true;
                    return Ok(FilterOutcome::Stopped);
                }
            }
        }
    }

    pub fn into_reader(self) -> EventReader<R> {
        self.reader
    }
}
