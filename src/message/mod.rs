//! The RPC message model (C1, spec §4.1).

pub mod codec;
pub mod notification;

use crate::error::{Error, Result};
use crate::log_entry::LogEntry;
use crate::message::codec::{Reader, WireCodec, Writer};
use crate::message::notification::CustomNotification;
use crate::snapshot::SnapshotSyncReq;
use crate::srv_config::ClusterServer;
use crate::types::{LogIndex, ServerId, Term};

/// Discriminant for every RPC kind the engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    RequestVote,
    PreVote,
    AppendEntries,
    InstallSnapshot,
    JoinCluster,
    LeaveCluster,
    SyncLogToNewSrv,
    CustomNotification,
    ClientAppend,
}

impl MsgType {
    fn tag(self) -> u8 {
        match self {
            MsgType::RequestVote => 0,
            MsgType::PreVote => 1,
            MsgType::AppendEntries => 2,
            MsgType::InstallSnapshot => 3,
            MsgType::JoinCluster => 4,
            MsgType::LeaveCluster => 5,
            MsgType::SyncLogToNewSrv => 6,
            MsgType::CustomNotification => 7,
            MsgType::ClientAppend => 8,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => MsgType::RequestVote,
            1 => MsgType::PreVote,
            2 => MsgType::AppendEntries,
            3 => MsgType::InstallSnapshot,
            4 => MsgType::JoinCluster,
            5 => MsgType::LeaveCluster,
            6 => MsgType::SyncLogToNewSrv,
            7 => MsgType::CustomNotification,
            8 => MsgType::ClientAppend,
            other => return Err(Error::Codec(format!("unknown msg_type tag {other}"))),
        })
    }
}

/// Request-side payload, keyed by [`MsgType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReqPayload {
    /// `force` bypasses priority gating (the forced-vote path, spec §4.3).
    RequestVote { force: bool },
    PreVote,
    AppendEntries { entries: Vec<LogEntry> },
    InstallSnapshot { sync: SnapshotSyncReq },
    JoinCluster { server: ClusterServer },
    LeaveCluster { server_id: ServerId },
    SyncLogToNewSrv,
    CustomNotification { notification: CustomNotification },
    /// A client write relayed by a follower under auto-forwarding (spec
    /// §4.8) — distinct from `AppendEntries` so a forwarded write can
    /// never be mistaken for a leader's own replication RPC.
    ClientAppend { data: Vec<u8> },
}

impl ReqPayload {
    fn msg_type(&self) -> MsgType {
        match self {
            ReqPayload::RequestVote { .. } => MsgType::RequestVote,
            ReqPayload::PreVote => MsgType::PreVote,
            ReqPayload::AppendEntries { .. } => MsgType::AppendEntries,
            ReqPayload::InstallSnapshot { .. } => MsgType::InstallSnapshot,
            ReqPayload::JoinCluster { .. } => MsgType::JoinCluster,
            ReqPayload::LeaveCluster { .. } => MsgType::LeaveCluster,
            ReqPayload::SyncLogToNewSrv => MsgType::SyncLogToNewSrv,
            ReqPayload::CustomNotification { .. } => MsgType::CustomNotification,
            ReqPayload::ClientAppend { .. } => MsgType::ClientAppend,
        }
    }
}

/// A full request envelope (spec §4.1's common envelope plus the
/// type-tagged payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqMsg {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub last_log_idx: LogIndex,
    pub last_log_term: Term,
    pub commit_idx: LogIndex,
    pub payload: ReqPayload,
}

impl ReqMsg {
    pub fn msg_type(&self) -> MsgType {
        self.payload.msg_type()
    }
}

/// Response-side payload, keyed by [`MsgType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespPayload {
    RequestVote,
    PreVote,
    /// `conflict_hint` is the follower's first index of its last divergent
    /// term, present only on rejection (spec §4.4).
    AppendEntries { conflict_hint: Option<LogIndex> },
    /// `next_obj_id` tells the leader which snapshot object to send next;
    /// `None` once the follower has nothing further to request.
    InstallSnapshot { next_obj_id: Option<u64> },
    JoinCluster,
    LeaveCluster,
    SyncLogToNewSrv,
    CustomNotification { notification: Option<CustomNotification> },
    /// Carries the state machine's result bytes for a forwarded write
    /// back to the relaying follower.
    ClientAppend { data: Vec<u8> },
}

impl RespPayload {
    fn msg_type(&self) -> MsgType {
        match self {
            RespPayload::RequestVote => MsgType::RequestVote,
            RespPayload::PreVote => MsgType::PreVote,
            RespPayload::AppendEntries { .. } => MsgType::AppendEntries,
            RespPayload::InstallSnapshot { .. } => MsgType::InstallSnapshot,
            RespPayload::JoinCluster => MsgType::JoinCluster,
            RespPayload::LeaveCluster => MsgType::LeaveCluster,
            RespPayload::SyncLogToNewSrv => MsgType::SyncLogToNewSrv,
            RespPayload::CustomNotification { .. } => MsgType::CustomNotification,
            RespPayload::ClientAppend { .. } => MsgType::ClientAppend,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespMsg {
    pub term: Term,
    pub src: ServerId,
    pub dst: ServerId,
    pub last_log_idx: LogIndex,
    pub last_log_term: Term,
    pub accepted: bool,
    /// The follower's expected next index after processing this request,
    /// present on `AppendEntries`/`InstallSnapshot`/vote responses.
    pub next_idx: Option<LogIndex>,
    pub payload: RespPayload,
}

impl RespMsg {
    pub fn msg_type(&self) -> MsgType {
        self.payload.msg_type()
    }
}

impl WireCodec for ReqMsg {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.msg_type().tag());
        w.put_u64(self.term);
        w.put_i32(self.src);
        w.put_i32(self.dst);
        w.put_u64(self.last_log_idx);
        w.put_u64(self.last_log_term);
        w.put_u64(self.commit_idx);
        match &self.payload {
            ReqPayload::RequestVote { force } => w.put_bool(*force),
            ReqPayload::PreVote => {}
            ReqPayload::AppendEntries { entries } => {
                w.put_u32(entries.len() as u32);
                for e in entries {
                    w.put_bytes(&e.to_bytes());
                }
            }
            ReqPayload::InstallSnapshot { sync } => w.put_bytes(&sync.to_bytes()),
            ReqPayload::JoinCluster { server } => w.put_bytes(&server.to_bytes()),
            ReqPayload::LeaveCluster { server_id } => w.put_i32(*server_id),
            ReqPayload::SyncLogToNewSrv => {}
            ReqPayload::CustomNotification { notification } => {
                w.put_bytes(&notification.to_bytes())
            }
            ReqPayload::ClientAppend { data } => w.put_bytes(data),
        }
    }

    fn decode(r: &mut Reader) -> Result<Self> {
        let msg_type = MsgType::from_tag(r.get_u8()?)?;
        let term = r.get_u64()?;
        let src = r.get_i32()?;
        let dst = r.get_i32()?;
        let last_log_idx = r.get_u64()?;
        let last_log_term = r.get_u64()?;
        let commit_idx = r.get_u64()?;
        let payload = match msg_type {
            MsgType::RequestVote => ReqPayload::RequestVote {
                force: r.get_bool()?,
            },
            MsgType::PreVote => ReqPayload::PreVote,
            MsgType::AppendEntries => {
                let count = r.get_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(LogEntry::from_bytes(&r.get_bytes()?)?);
                }
                ReqPayload::AppendEntries { entries }
            }
            MsgType::InstallSnapshot => ReqPayload::InstallSnapshot {
                sync: SnapshotSyncReq::from_bytes(&r.get_bytes()?)?,
            },
            MsgType::JoinCluster => ReqPayload::JoinCluster {
                server: ClusterServer::from_bytes(&r.get_bytes()?)?,
            },
            MsgType::LeaveCluster => ReqPayload::LeaveCluster {
                server_id: r.get_i32()?,
            },
            MsgType::SyncLogToNewSrv => ReqPayload::SyncLogToNewSrv,
            MsgType::CustomNotification => ReqPayload::CustomNotification {
                notification: CustomNotification::from_bytes(&r.get_bytes()?)?,
            },
            MsgType::ClientAppend => ReqPayload::ClientAppend { data: r.get_bytes()? },
        };
        Ok(ReqMsg {
            term,
            src,
            dst,
            last_log_idx,
            last_log_term,
            commit_idx,
            payload,
        })
    }
}

impl WireCodec for RespMsg {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.msg_type().tag());
        w.put_u64(self.term);
        w.put_i32(self.src);
        w.put_i32(self.dst);
        w.put_u64(self.last_log_idx);
        w.put_u64(self.last_log_term);
        w.put_bool(self.accepted);
        match self.next_idx {
            Some(idx) => {
                w.put_bool(true);
                w.put_u64(idx);
            }
            None => w.put_bool(false),
        }
        match &self.payload {
            RespPayload::RequestVote | RespPayload::PreVote => {}
            RespPayload::AppendEntries { conflict_hint } => match conflict_hint {
                Some(idx) => {
                    w.put_bool(true);
                    w.put_u64(*idx);
                }
                None => w.put_bool(false),
            },
            RespPayload::InstallSnapshot { next_obj_id } => match next_obj_id {
                Some(id) => {
                    w.put_bool(true);
                    w.put_u64(*id);
                }
                None => w.put_bool(false),
            },
            RespPayload::JoinCluster | RespPayload::LeaveCluster | RespPayload::SyncLogToNewSrv => {
            }
            RespPayload::CustomNotification { notification } => match notification {
                Some(n) => {
                    w.put_bool(true);
                    w.put_bytes(&n.to_bytes());
                }
                None => w.put_bool(false),
            },
            RespPayload::ClientAppend { data } => w.put_bytes(data),
        }
    }

    fn decode(r: &mut Reader) -> Result<Self> {
        let msg_type = MsgType::from_tag(r.get_u8()?)?;
        let term = r.get_u64()?;
        let src = r.get_i32()?;
        let dst = r.get_i32()?;
        let last_log_idx = r.get_u64()?;
        let last_log_term = r.get_u64()?;
        let accepted = r.get_bool()?;
        let next_idx = if r.get_bool()? { Some(r.get_u64()?) } else { None };
        let payload = match msg_type {
            MsgType::RequestVote => RespPayload::RequestVote,
            MsgType::PreVote => RespPayload::PreVote,
            MsgType::AppendEntries => {
                let conflict_hint = if r.get_bool()? { Some(r.get_u64()?) } else { None };
                RespPayload::AppendEntries { conflict_hint }
            }
            MsgType::InstallSnapshot => {
                let next_obj_id = if r.get_bool()? { Some(r.get_u64()?) } else { None };
                RespPayload::InstallSnapshot { next_obj_id }
            }
            MsgType::JoinCluster => RespPayload::JoinCluster,
            MsgType::LeaveCluster => RespPayload::LeaveCluster,
            MsgType::SyncLogToNewSrv => RespPayload::SyncLogToNewSrv,
            MsgType::CustomNotification => {
                let notification = if r.get_bool()? {
                    Some(CustomNotification::from_bytes(&r.get_bytes()?)?)
                } else {
                    None
                };
                RespPayload::CustomNotification { notification }
            }
            MsgType::ClientAppend => RespPayload::ClientAppend { data: r.get_bytes()? },
        };
        Ok(RespMsg {
            term,
            src,
            dst,
            last_log_idx,
            last_log_term,
            accepted,
            next_idx,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::ValueType;

    fn base_req(payload: ReqPayload) -> ReqMsg {
        ReqMsg {
            term: 5,
            src: 1,
            dst: 2,
            last_log_idx: 10,
            last_log_term: 4,
            commit_idx: 8,
            payload,
        }
    }

    #[test]
    fn append_entries_request_roundtrips() {
        let req = base_req(ReqPayload::AppendEntries {
            entries: vec![LogEntry::new(5, ValueType::AppLog, vec![1, 2, 3])],
        });
        assert_eq!(ReqMsg::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn empty_append_entries_is_a_heartbeat() {
        let req = base_req(ReqPayload::AppendEntries { entries: vec![] });
        let back = ReqMsg::from_bytes(&req.to_bytes()).unwrap();
        match back.payload {
            ReqPayload::AppendEntries { entries } => assert!(entries.is_empty()),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn request_vote_roundtrips_with_force_flag() {
        let req = base_req(ReqPayload::RequestVote { force: true });
        assert_eq!(ReqMsg::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn custom_notification_request_roundtrips() {
        let req = base_req(ReqPayload::CustomNotification {
            notification: CustomNotification::OutOfLogRangeWarning {
                start_idx_of_leader: 1000,
            },
        });
        assert_eq!(ReqMsg::from_bytes(&req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn append_entries_response_roundtrips_with_conflict_hint() {
        let resp = RespMsg {
            term: 6,
            src: 2,
            dst: 1,
            last_log_idx: 0,
            last_log_term: 0,
            accepted: false,
            next_idx: Some(501),
            payload: RespPayload::AppendEntries {
                conflict_hint: Some(480),
            },
        };
        assert_eq!(RespMsg::from_bytes(&resp.to_bytes()).unwrap(), resp);
    }

    #[test]
    fn client_append_request_and_response_roundtrip() {
        let req = base_req(ReqPayload::ClientAppend { data: vec![9, 9, 9] });
        assert_eq!(ReqMsg::from_bytes(&req.to_bytes()).unwrap(), req);

        let resp = RespMsg {
            term: 5,
            src: 1,
            dst: 2,
            last_log_idx: 0,
            last_log_term: 0,
            accepted: true,
            next_idx: None,
            payload: RespPayload::ClientAppend { data: vec![1, 2, 3] },
        };
        assert_eq!(RespMsg::from_bytes(&resp.to_bytes()).unwrap(), resp);
    }

    #[test]
    fn install_snapshot_response_roundtrips() {
        let resp = RespMsg {
            term: 1,
            src: 3,
            dst: 1,
            last_log_idx: 0,
            last_log_term: 0,
            accepted: true,
            next_idx: None,
            payload: RespPayload::InstallSnapshot {
                next_obj_id: Some(1),
            },
        };
        assert_eq!(RespMsg::from_bytes(&resp.to_bytes()).unwrap(), resp);
    }
}
