//! Change-stream positions.
//!
//! An [`Offset`] is a totally ordered position in a source's change log. Each
//! source technology gets its own variant; two offsets of different kinds are
//! never ordered against each other. Every kind has two sentinels: *initial*
//! (before the first event) and *no-stopping* (never reached).
//!
//! Offsets serialize as their CLI string, e.g. `binlog:mysql-bin.000003:154`,
//! `lsn:0/1949850`, `scn:8812`, `sequence:42`, `sequence:initial`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

const KIND_KEY: &str = "kind";
const SENTINEL_KEY: &str = "sentinel";
const INITIAL: &str = "initial";
const NO_STOPPING: &str = "no_stopping";

/// Source technology an offset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetKind {
    /// MySQL-style binlog file name plus byte position.
    Binlog,
    /// PostgreSQL-style write-ahead log sequence number.
    Lsn,
    /// Oracle-style redo log system change number.
    Scn,
    /// Monotonic counter, e.g. a trigger-maintained audit table.
    Sequence,
}

/// Ways an offset can be constructed from raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construction {
    Map,
    FilePosition,
    Position,
}

impl Construction {
    fn describe(&self) -> &'static str {
        match self {
            Construction::Map => "a key/value map",
            Construction::FilePosition => "a file name and position",
            Construction::Position => "a bare position",
        }
    }
}

impl OffsetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetKind::Binlog => "binlog",
            OffsetKind::Lsn => "lsn",
            OffsetKind::Scn => "scn",
            OffsetKind::Sequence => "sequence",
        }
    }

    /// Capability table for offset construction paths.
    pub fn supports(&self, construction: Construction) -> bool {
        matches!(
            (self, construction),
            (_, Construction::Map)
                | (OffsetKind::Binlog, Construction::FilePosition)
                | (OffsetKind::Sequence, Construction::Position)
        )
    }
}

impl fmt::Display for OffsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binlog" => Ok(OffsetKind::Binlog),
            "lsn" => Ok(OffsetKind::Lsn),
            "scn" => Ok(OffsetKind::Scn),
            "sequence" => Ok(OffsetKind::Sequence),
            other => Err(SyncError::config(format!("Unknown offset kind: {other}"))),
        }
    }
}

/// A position extended with the two sentinels. Derived ordering puts
/// `Initial` below every position and `NoStopping` above.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bounded<P> {
    Initial,
    At(P),
    NoStopping,
}

impl<P> Bounded<P> {
    fn sentinel(&self) -> Option<&'static str> {
        match self {
            Bounded::Initial => Some(INITIAL),
            Bounded::NoStopping => Some(NO_STOPPING),
            Bounded::At(_) => None,
        }
    }
}

/// Binlog coordinates. File names sort lexicographically, then by position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

/// Position in a source's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Offset {
    Binlog(Bounded<BinlogPosition>),
    Lsn(Bounded<u64>),
    Scn(Bounded<u64>),
    Sequence(Bounded<i64>),
}

impl Offset {
    pub fn binlog(file: impl Into<String>, position: u64) -> Self {
        Offset::Binlog(Bounded::At(BinlogPosition {
            file: file.into(),
            position,
        }))
    }

    pub fn lsn(lsn: u64) -> Self {
        Offset::Lsn(Bounded::At(lsn))
    }

    pub fn scn(scn: u64) -> Self {
        Offset::Scn(Bounded::At(scn))
    }

    pub fn sequence(sequence: i64) -> Self {
        Offset::Sequence(Bounded::At(sequence))
    }

    pub fn initial(kind: OffsetKind) -> Self {
        match kind {
            OffsetKind::Binlog => Offset::Binlog(Bounded::Initial),
            OffsetKind::Lsn => Offset::Lsn(Bounded::Initial),
            OffsetKind::Scn => Offset::Scn(Bounded::Initial),
            OffsetKind::Sequence => Offset::Sequence(Bounded::Initial),
        }
    }

    pub fn no_stopping(kind: OffsetKind) -> Self {
        match kind {
            OffsetKind::Binlog => Offset::Binlog(Bounded::NoStopping),
            OffsetKind::Lsn => Offset::Lsn(Bounded::NoStopping),
            OffsetKind::Scn => Offset::Scn(Bounded::NoStopping),
            OffsetKind::Sequence => Offset::Sequence(Bounded::NoStopping),
        }
    }

    pub fn kind(&self) -> OffsetKind {
        match self {
            Offset::Binlog(_) => OffsetKind::Binlog,
            Offset::Lsn(_) => OffsetKind::Lsn,
            Offset::Scn(_) => OffsetKind::Scn,
            Offset::Sequence(_) => OffsetKind::Sequence,
        }
    }

    fn sentinel(&self) -> Option<&'static str> {
        match self {
            Offset::Binlog(b) => b.sentinel(),
            Offset::Lsn(b) | Offset::Scn(b) => b.sentinel(),
            Offset::Sequence(b) => b.sentinel(),
        }
    }

    fn from_sentinel(kind: OffsetKind, sentinel: &str) -> Option<Self> {
        match sentinel {
            INITIAL => Some(Offset::initial(kind)),
            NO_STOPPING => Some(Offset::no_stopping(kind)),
            _ => None,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.sentinel() == Some(INITIAL)
    }

    pub fn is_no_stopping(&self) -> bool {
        self.sentinel() == Some(NO_STOPPING)
    }

    /// Total order within one kind. Comparing offsets of different kinds is a
    /// configuration error.
    pub fn compare(&self, other: &Offset) -> Result<Ordering> {
        self.partial_cmp(other).ok_or_else(|| {
            SyncError::config(format!(
                "Cannot compare {} offset with {} offset",
                self.kind(),
                other.kind()
            ))
        })
    }

    pub fn is_at_or_before(&self, other: &Offset) -> bool {
        matches!(
            self.partial_cmp(other),
            Some(Ordering::Less | Ordering::Equal)
        )
    }

    pub fn is_at_or_after(&self, other: &Offset) -> bool {
        matches!(
            self.partial_cmp(other),
            Some(Ordering::Greater | Ordering::Equal)
        )
    }

    pub fn is_before(&self, other: &Offset) -> bool {
        self.partial_cmp(other) == Some(Ordering::Less)
    }

    pub fn is_after(&self, other: &Offset) -> bool {
        self.partial_cmp(other) == Some(Ordering::Greater)
    }

    /// Serialize to the string-keyed map exchanged with the host engine.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(KIND_KEY.to_string(), self.kind().as_str().to_string());
        if let Some(sentinel) = self.sentinel() {
            map.insert(SENTINEL_KEY.to_string(), sentinel.to_string());
            return map;
        }
        match self {
            Offset::Binlog(Bounded::At(p)) => {
                map.insert("file".to_string(), p.file.clone());
                map.insert("pos".to_string(), p.position.to_string());
            }
            Offset::Lsn(Bounded::At(lsn)) => {
                map.insert("lsn".to_string(), format_lsn(*lsn));
            }
            Offset::Scn(Bounded::At(scn)) => {
                map.insert("scn".to_string(), scn.to_string());
            }
            Offset::Sequence(Bounded::At(seq)) => {
                map.insert("sequence".to_string(), seq.to_string());
            }
            _ => {}
        }
        map
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let kind: OffsetKind = required(map, KIND_KEY)?.parse()?;
        if let Some(sentinel) = map.get(SENTINEL_KEY) {
            return Offset::from_sentinel(kind, sentinel).ok_or_else(|| {
                SyncError::config(format!("Unknown offset sentinel: {sentinel}"))
            });
        }
        match kind {
            OffsetKind::Binlog => Ok(Offset::binlog(
                required(map, "file")?,
                parse_number(required(map, "pos")?)?,
            )),
            OffsetKind::Lsn => Ok(Offset::lsn(parse_lsn(required(map, "lsn")?)?)),
            OffsetKind::Scn => Ok(Offset::scn(parse_number(required(map, "scn")?)?)),
            OffsetKind::Sequence => Ok(Offset::sequence(parse_number(required(
                map, "sequence",
            )?)?)),
        }
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Offset::Binlog(a), Offset::Binlog(b)) => Some(a.cmp(b)),
            (Offset::Lsn(a), Offset::Lsn(b)) => Some(a.cmp(b)),
            (Offset::Scn(a), Offset::Scn(b)) => Some(a.cmp(b)),
            (Offset::Sequence(a), Offset::Sequence(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            Offset::Binlog(Bounded::At(p)) => write!(f, "{kind}:{}:{}", p.file, p.position),
            Offset::Lsn(Bounded::At(lsn)) => write!(f, "{kind}:{}", format_lsn(*lsn)),
            Offset::Scn(Bounded::At(scn)) => write!(f, "{kind}:{scn}"),
            Offset::Sequence(Bounded::At(seq)) => write!(f, "{kind}:{seq}"),
            other => write!(f, "{kind}:{}", other.sentinel().unwrap_or_default()),
        }
    }
}

impl FromStr for Offset {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = s.split_once(':').ok_or_else(|| {
            SyncError::config(format!(
                "Invalid offset '{s}': expected '<kind>:<position>'"
            ))
        })?;
        let kind: OffsetKind = kind.parse()?;
        if let Some(offset) = Offset::from_sentinel(kind, rest) {
            return Ok(offset);
        }
        match kind {
            OffsetKind::Binlog => {
                let (file, pos) = rest.rsplit_once(':').ok_or_else(|| {
                    SyncError::config(format!(
                        "Invalid binlog offset '{s}': expected 'binlog:<file>:<pos>'"
                    ))
                })?;
                Ok(Offset::binlog(file, parse_number(pos)?))
            }
            OffsetKind::Lsn => Ok(Offset::lsn(parse_lsn(rest)?)),
            OffsetKind::Scn => Ok(Offset::scn(parse_number(rest)?)),
            OffsetKind::Sequence => Ok(Offset::sequence(parse_number(rest)?)),
        }
    }
}

impl TryFrom<String> for Offset {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Offset> for String {
    fn from(offset: Offset) -> Self {
        offset.to_string()
    }
}

fn required<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| SyncError::config(format!("Offset map is missing '{key}'")))
}

fn parse_number<T: FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| SyncError::config(format!("Invalid offset position: {s}")))
}

/// Format an LSN as PostgreSQL does: `HI/LO` in upper-case hex.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

pub fn parse_lsn(s: &str) -> Result<u64> {
    let invalid = || SyncError::config(format!("Invalid LSN '{s}': expected 'X/Y' hex"));
    let (hi, lo) = s.split_once('/').ok_or_else(invalid)?;
    let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

/// Builds offsets for one source kind, failing fast on construction paths the
/// kind does not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetFactory {
    kind: OffsetKind,
}

impl OffsetFactory {
    pub fn new(kind: OffsetKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> OffsetKind {
        self.kind
    }

    fn require(&self, construction: Construction) -> Result<()> {
        if self.kind.supports(construction) {
            Ok(())
        } else {
            Err(SyncError::config(format!(
                "{} offsets cannot be created from {}",
                self.kind,
                construction.describe()
            )))
        }
    }

    pub fn new_offset(&self, map: &BTreeMap<String, String>) -> Result<Offset> {
        self.require(Construction::Map)?;
        let offset = Offset::from_map(map)?;
        self.validate(&offset)?;
        Ok(offset)
    }

    pub fn new_offset_from_file_position(&self, file: &str, position: u64) -> Result<Offset> {
        self.require(Construction::FilePosition)?;
        Ok(Offset::binlog(file, position))
    }

    pub fn new_offset_from_position(&self, position: i64) -> Result<Offset> {
        self.require(Construction::Position)?;
        Ok(Offset::sequence(position))
    }

    pub fn create_initial_offset(&self) -> Offset {
        Offset::initial(self.kind)
    }

    pub fn create_no_stopping_offset(&self) -> Offset {
        Offset::no_stopping(self.kind)
    }

    /// Parse the CLI form of an offset of this factory's kind.
    pub fn parse(&self, s: &str) -> Result<Offset> {
        let offset: Offset = s.parse()?;
        self.validate(&offset)?;
        Ok(offset)
    }

    pub fn validate(&self, offset: &Offset) -> Result<()> {
        if offset.kind() != self.kind {
            return Err(SyncError::config(format!(
                "Expected a {} offset, got {}",
                self.kind, offset
            )));
        }
        Ok(())
    }
}
