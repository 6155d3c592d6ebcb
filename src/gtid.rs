//! GTID与GTID集合
//!
//! GTID由源服务器UUID、可选标签和事务序号组成。
//! 集合按 (UUID, 标签) 分组保存有序、不重叠、不相邻的闭区间，
//! 文本格式与服务器一致：`uuid:1-5:7,uuid2:1-3:tag:1-10`

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use crate::error::invalid_data;

/// 源服务器UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sid(pub [u8; 16]);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Sid {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<Sid> {
        let hex: Vec<u8> = s.bytes().filter(|b| *b != b'-').collect();
        if hex.len() != 32 {
            return Err(invalid_data(format!("无效的UUID: {}", s)));
        }

        let mut bytes = [0u8; 16];
        for (i, pair) in hex.chunks(2).enumerate() {
            let text = std::str::from_utf8(pair).map_err(|_| invalid_data(format!("无效的UUID: {}", s)))?;
            bytes[i] = u8::from_str_radix(text, 16)
                .map_err(|_| invalid_data(format!("无效的UUID: {}", s)))?;
        }
        Ok(Sid(bytes))
    }
}

/// 单个GTID
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gtid {
    pub sid: Sid,
    /// 空字符串表示无标签
    pub tag: String,
    pub gno: u64,
}

impl Gtid {
    pub fn new(sid: Sid, gno: u64) -> Gtid {
        Gtid { sid, tag: String::new(), gno }
    }

    pub fn tagged(sid: Sid, tag: impl Into<String>, gno: u64) -> Gtid {
        Gtid { sid, tag: tag.into(), gno }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag.is_empty() {
            write!(f, "{}:{}", self.sid, self.gno)
        } else {
            write!(f, "{}:{}:{}", self.sid, self.tag, self.gno)
        }
    }
}

impl FromStr for Gtid {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<Gtid> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (sid, tag, gno) = match parts.as_slice() {
            [sid, gno] => (*sid, "", *gno),
            [sid, tag, gno] => (*sid, *tag, *gno),
            _ => return Err(invalid_data(format!("无效的GTID: {}", s))),
        };
        let gno = gno
            .parse::<u64>()
            .ok()
            .filter(|gno| *gno > 0)
            .ok_or_else(|| invalid_data(format!("无效的GTID序号: {}", s)))?;
        if !tag.is_empty() {
            validate_tag(tag)?;
        }
        Ok(Gtid { sid: sid.parse()?, tag: tag.to_string(), gno })
    }
}

fn validate_tag(tag: &str) -> io::Result<()> {
    let mut chars = tag.chars();
    let valid = tag.len() <= 32
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid { Ok(()) } else { Err(invalid_data(format!("无效的GTID标签: {}", tag))) }
}

/// 闭区间 `[start, end]`
type Interval = (u64, u64);

/// GTID集合
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GtidSet {
    members: BTreeMap<(Sid, String), Vec<Interval>>,
}

impl GtidSet {
    pub fn new() -> GtidSet {
        GtidSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 集合中GTID的个数
    pub fn count(&self) -> u64 {
        self.members
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(|(start, end)| end - start + 1)
            .sum()
    }

    /// 添加一个GTID，已存在或序号无效时返回 `false`
    pub fn add(&mut self, gtid: &Gtid) -> bool {
        if gtid.gno == 0 || self.contains(gtid) {
            return false;
        }
        self.add_interval(gtid.sid, &gtid.tag, gtid.gno, gtid.gno);
        true
    }

    pub fn add_interval(&mut self, sid: Sid, tag: &str, start: u64, end: u64) {
        debug_assert!(start > 0 && start <= end);
        let intervals = self.members.entry((sid, tag.to_string())).or_default();
        insert_interval(intervals, (start, end));
    }

    /// 并集
    pub fn add_set(&mut self, other: &GtidSet) {
        for ((sid, tag), intervals) in &other.members {
            for &(start, end) in intervals {
                self.add_interval(*sid, tag, start, end);
            }
        }
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.members
            .get(&(gtid.sid, gtid.tag.clone()))
            .is_some_and(|intervals| interval_contains(intervals, gtid.gno))
    }

    /// `other` 是否是本集合的子集
    pub fn contains_set(&self, other: &GtidSet) -> bool {
        other.subtract(self).is_empty()
    }

    /// 差集：`self - other`
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (key, intervals) in &self.members {
            let remaining = match other.members.get(key) {
                Some(removed) => subtract_intervals(intervals, removed),
                None => intervals.clone(),
            };
            if !remaining.is_empty() {
                result.members.insert(key.clone(), remaining);
            }
        }
        result
    }
}

fn insert_interval(intervals: &mut Vec<Interval>, new: Interval) {
    let mut merged = new;
    let mut placed = false;
    let mut out = Vec::with_capacity(intervals.len() + 1);

    for &(start, end) in intervals.iter() {
        if end.saturating_add(1) < merged.0 {
            out.push((start, end));
        } else if start > merged.1.saturating_add(1) {
            if !placed {
                out.push(merged);
                placed = true;
            }
            out.push((start, end));
        } else {
            merged = (start.min(merged.0), end.max(merged.1));
        }
    }
    if !placed {
        out.push(merged);
    }
    *intervals = out;
}

fn interval_contains(intervals: &[Interval], gno: u64) -> bool {
    let index = intervals.partition_point(|&(_, end)| end < gno);
    intervals.get(index).is_some_and(|&(start, _)| start <= gno)
}

fn subtract_intervals(intervals: &[Interval], removed: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    for &(start, end) in intervals {
        let mut cursor = start;
        for &(r_start, r_end) in removed {
            if r_end < cursor || r_start > end {
                continue;
            }
            if r_start > cursor {
                out.push((cursor, r_start - 1));
            }
            cursor = r_end.saturating_add(1);
            if cursor > end {
                break;
            }
        }
        if cursor <= end {
            out.push((cursor, end));
        }
    }
    out
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current: Option<Sid> = None;
        for ((sid, tag), intervals) in &self.members {
            if current != Some(*sid) {
                if current.is_some() {
                    f.write_str(",")?;
                }
                write!(f, "{}", sid)?;
                current = Some(*sid);
            }
            if !tag.is_empty() {
                write!(f, ":{}", tag)?;
            }
            for (start, end) in intervals {
                if start == end {
                    write!(f, ":{}", start)?;
                } else {
                    write!(f, ":{}-{}", start, end)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<GtidSet> {
        let mut set = GtidSet::new();

        for member in s.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            let mut tokens = member.split(':').map(str::trim);
            let sid: Sid = tokens
                .next()
                .ok_or_else(|| invalid_data(format!("无效的GTID集合: {}", s)))?
                .parse()?;

            let mut tag = String::new();
            let mut tag_has_intervals = true;
            for token in tokens {
                if token.starts_with(|c: char| c.is_ascii_digit()) {
                    let (start, end) = parse_interval(token)
                        .ok_or_else(|| invalid_data(format!("无效的GTID区间: {}", token)))?;
                    set.add_interval(sid, &tag, start, end);
                    tag_has_intervals = true;
                } else {
                    if !tag_has_intervals {
                        return Err(invalid_data(format!("GTID标签缺少区间: {}", member)));
                    }
                    validate_tag(token)?;
                    tag = token.to_string();
                    tag_has_intervals = false;
                }
            }
            if !tag_has_intervals {
                return Err(invalid_data(format!("GTID标签缺少区间: {}", member)));
            }
        }

        Ok(set)
    }
}

fn parse_interval(token: &str) -> Option<Interval> {
    let (start, end) = match token.split_once('-') {
        Some((start, end)) => (start.parse().ok()?, end.parse().ok()?),
        None => {
            let gno = token.parse().ok()?;
            (gno, gno)
        }
    };
    (start > 0 && start <= end).then_some((start, end))
}
