//! Log entries: the unit of replication.

use crate::message::codec::{Reader, WireCodec, Writer};
use crate::types::Term;

/// What kind of payload a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Application-defined payload, handed to the state machine verbatim.
    AppLog,
    /// A single membership change (add/remove/promote one server).
    ClusterServer,
    /// A full cluster configuration snapshot, committed atomically.
    Config,
    /// An opaque packed batch of other entries (log store compaction unit).
    Pack,
    /// Marks that a logical snapshot sync completed at this index.
    SnapshotSync,
    /// Engine-internal side-band payload (custom notifications).
    Custom,
}

impl ValueType {
    fn tag(self) -> u8 {
        match self {
            ValueType::AppLog => 0,
            ValueType::ClusterServer => 1,
            ValueType::Config => 2,
            ValueType::Pack => 3,
            ValueType::SnapshotSync => 4,
            ValueType::Custom => 5,
        }
    }

    fn from_tag(tag: u8) -> crate::error::Result<Self> {
        Ok(match tag {
            0 => ValueType::AppLog,
            1 => ValueType::ClusterServer,
            2 => ValueType::Config,
            3 => ValueType::Pack,
            4 => ValueType::SnapshotSync,
            5 => ValueType::Custom,
            other => {
                return Err(crate::error::Error::Codec(format!(
                    "unknown log entry value_type tag {other}"
                )))
            }
        })
    }
}

/// A single replicated log entry. Immutable once committed (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub value_type: ValueType,
    pub payload: Vec<u8>,
    pub timestamp: Option<u64>,
    /// CRC of the *previous* entry, used by some log stores to detect
    /// torn writes; optional because in-memory stores don't need it.
    pub crc_for_prev: Option<u32>,
}

impl LogEntry {
    pub fn new(term: Term, value_type: ValueType, payload: Vec<u8>) -> Self {
        LogEntry {
            term,
            value_type,
            payload,
            timestamp: None,
            crc_for_prev: None,
        }
    }

    /// A dummy zero-term entry used as `entry_at(0)` / the value returned
    /// by `last_entry()` on an empty log store (per NuRaft's `log_store`
    /// contract).
    pub fn dummy() -> Self {
        LogEntry::new(0, ValueType::AppLog, Vec::new())
    }
}

impl WireCodec for LogEntry {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.term);
        w.put_u8(self.value_type.tag());
        w.put_bytes(&self.payload);
        match self.timestamp {
            Some(ts) => {
                w.put_bool(true);
                w.put_u64(ts);
            }
            None => w.put_bool(false),
        }
        match self.crc_for_prev {
            Some(crc) => {
                w.put_bool(true);
                w.put_u32(crc);
            }
            None => w.put_bool(false),
        }
    }

    fn decode(r: &mut Reader) -> crate::error::Result<Self> {
        let term = r.get_u64()?;
        let value_type = ValueType::from_tag(r.get_u8()?)?;
        let payload = r.get_bytes()?;
        let timestamp = if r.get_bool()? {
            Some(r.get_u64()?)
        } else {
            None
        };
        let crc_for_prev = if r.get_bool()? {
            Some(r.get_u32()?)
        } else {
            None
        };
        Ok(LogEntry {
            term,
            value_type,
            payload,
            timestamp,
            crc_for_prev,
        })
    }
}
