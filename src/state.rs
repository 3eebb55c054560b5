//! Durable server state: the bit of state that must hit disk before the
//! engine externalizes a vote or a term increment (spec §3, invariant I2).

use crate::message::codec::{Reader, WireCodec, Writer};
use crate::types::{ServerId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableState {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub election_timer_allowed: bool,
}

impl DurableState {
    pub fn initial() -> Self {
        DurableState {
            current_term: 0,
            voted_for: None,
            election_timer_allowed: true,
        }
    }
}

impl WireCodec for DurableState {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.current_term);
        match self.voted_for {
            Some(id) => {
                w.put_bool(true);
                w.put_i32(id);
            }
            None => w.put_bool(false),
        }
        w.put_bool(self.election_timer_allowed);
    }

    fn decode(r: &mut Reader) -> crate::error::Result<Self> {
        let current_term = r.get_u64()?;
        let voted_for = if r.get_bool()? {
            Some(r.get_i32()?)
        } else {
            None
        };
        let election_timer_allowed = r.get_bool()?;
        Ok(DurableState {
            current_term,
            voted_for,
            election_timer_allowed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let s = DurableState {
            current_term: 7,
            voted_for: Some(3),
            election_timer_allowed: false,
        };
        assert_eq!(DurableState::from_bytes(&s.to_bytes()).unwrap(), s);

        let s2 = DurableState::initial();
        assert_eq!(DurableState::from_bytes(&s2.to_bytes()).unwrap(), s2);
    }
}
