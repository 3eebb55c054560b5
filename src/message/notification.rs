//! Custom notification sub-messages (C9, spec §4.7).
//!
//! Wire format mirrors `custom_notification_msg::serialize` in
//! `examples/original_source/src/handle_custom_notification.cxx`:
//! one version byte, one type byte, then a length-prefixed context blob.

use crate::message::codec::{Reader, WireCodec, Writer, CURRENT_VERSION};
use crate::types::LogIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomNotification {
    /// Leader informs a follower that its `last_log_idx` is behind the
    /// leader's `start_index`; the follower must re-sync via snapshot.
    OutOfLogRangeWarning { start_idx_of_leader: LogIndex },
    /// Forces an immediate real-vote round, bypassing priority gating.
    LeadershipTakeover,
    /// A follower asks the leader to give up leadership.
    RequestResignation,
}

impl CustomNotification {
    fn tag(&self) -> u8 {
        match self {
            CustomNotification::OutOfLogRangeWarning { .. } => 0,
            CustomNotification::LeadershipTakeover => 1,
            CustomNotification::RequestResignation => 2,
        }
    }
}

impl WireCodec for CustomNotification {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(CURRENT_VERSION);
        w.put_u8(self.tag());
        match self {
            CustomNotification::OutOfLogRangeWarning { start_idx_of_leader } => {
                let mut ctx = Writer::new();
                ctx.put_u64(*start_idx_of_leader);
                w.put_bytes(&ctx.into_bytes());
            }
            CustomNotification::LeadershipTakeover | CustomNotification::RequestResignation => {
                w.put_bytes(&[]);
            }
        }
    }

    fn decode(r: &mut Reader) -> crate::error::Result<Self> {
        let _version = r.get_u8()?;
        let tag = r.get_u8()?;
        let ctx = r.get_bytes()?;
        Ok(match tag {
            0 => {
                let mut cr = Reader::new(&ctx);
                let start_idx_of_leader = cr.get_u64()?;
                CustomNotification::OutOfLogRangeWarning { start_idx_of_leader }
            }
            1 => CustomNotification::LeadershipTakeover,
            2 => CustomNotification::RequestResignation,
            other => {
                return Err(crate::error::Error::Codec(format!(
                    "unknown custom_notification tag {other}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_roundtrips() {
        for n in [
            CustomNotification::OutOfLogRangeWarning {
                start_idx_of_leader: 1000,
            },
            CustomNotification::LeadershipTakeover,
            CustomNotification::RequestResignation,
        ] {
            assert_eq!(CustomNotification::from_bytes(&n.to_bytes()).unwrap(), n);
        }
    }
}
