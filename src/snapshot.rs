//! Logical, object-addressed snapshots (spec §3, §4.5).

use crate::message::codec::{Reader, WireCodec, Writer};
use crate::srv_config::ClusterConfig;
use crate::types::{LogIndex, Term};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub last_log_idx: LogIndex,
    pub last_log_term: Term,
    pub last_config: ClusterConfig,
    pub size_bytes: u64,
}

impl WireCodec for SnapshotDescriptor {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.last_log_idx);
        w.put_u64(self.last_log_term);
        let cfg_bytes = self.last_config.to_bytes();
        w.put_bytes(&cfg_bytes);
        w.put_u64(self.size_bytes);
    }

    fn decode(r: &mut Reader) -> crate::error::Result<Self> {
        let last_log_idx = r.get_u64()?;
        let last_log_term = r.get_u64()?;
        let cfg_bytes = r.get_bytes()?;
        let last_config = ClusterConfig::from_bytes(&cfg_bytes)?;
        let size_bytes = r.get_u64()?;
        Ok(SnapshotDescriptor {
            last_log_idx,
            last_log_term,
            last_config,
            size_bytes,
        })
    }
}

/// One chunk of a logical snapshot transfer (spec §4.5).
///
/// `obj_id = 0` is reserved for metadata (the first call a receiver makes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSyncReq {
    pub descriptor: SnapshotDescriptor,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

impl WireCodec for SnapshotSyncReq {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(crate::message::codec::CURRENT_VERSION);
        let desc_bytes = self.descriptor.to_bytes();
        w.put_bytes(&desc_bytes);
        w.put_u64(self.offset);
        w.put_bytes(&self.data);
        w.put_bool(self.done);
    }

    fn decode(r: &mut Reader) -> crate::error::Result<Self> {
        let _version = r.get_u8()?;
        let desc_bytes = r.get_bytes()?;
        let descriptor = SnapshotDescriptor::from_bytes(&desc_bytes)?;
        let offset = r.get_u64()?;
        let data = r.get_bytes()?;
        let done = r.get_bool()?;
        Ok(SnapshotSyncReq {
            descriptor,
            offset,
            data,
            done,
        })
    }
}
