use crate::errors::OfError;
use crate::msgs::{OfConn, OfMsg};
use std::collections::VecDeque;

/// Key of one registered consumer of switch acknowledgments (the `nb_cfg`
/// water-mark and the interface-status manager each register one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqnoType(usize);

#[derive(Debug, Default)]
struct Tracker {
    /// Application seqnos waiting for a barrier, oldest first, paired with
    /// the barrier xid that covers them once sent.
    requests: VecDeque<(u64, Option<u64>)>,
    acked: Option<u64>,
}

/// Binds application-level sequence numbers to actual rule installation.
/// A consumer registers a type, asks for an ack at a seqno, and reads the
/// newest acked seqno back once the switch has confirmed the barrier that
/// followed the corresponding flow messages.
#[derive(Debug, Default)]
pub struct SeqnoSubsys {
    trackers: Vec<Tracker>,
    next_xid: u64,
}

impl SeqnoSubsys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self) -> SeqnoType {
        self.trackers.push(Tracker::default());
        SeqnoType(self.trackers.len() - 1)
    }

    /// Requests an acknowledgment once every message sent so far is
    /// processed. Duplicate requests for the current newest seqno coalesce.
    pub fn want_ack(&mut self, typ: SeqnoType, seqno: u64) {
        let tracker = &mut self.trackers[typ.0];
        if tracker.requests.back().map(|(s, _)| *s) == Some(seqno) {
            return;
        }
        if tracker.acked == Some(seqno) {
            return;
        }
        tracker.requests.push_back((seqno, None));
    }

    /// Emits one barrier covering every request not yet bound to one.
    /// Called after `put()` so the barrier lands behind the flow mods.
    pub fn run(&mut self, conn: &mut dyn OfConn) -> Result<(), OfError> {
        let unbound = self
            .trackers
            .iter()
            .any(|t| t.requests.iter().any(|(_, xid)| xid.is_none()));
        if !unbound {
            return Ok(());
        }
        self.next_xid += 1;
        let xid = self.next_xid;
        conn.send(OfMsg::Barrier { xid })?;
        for tracker in &mut self.trackers {
            for req in tracker.requests.iter_mut().filter(|(_, x)| x.is_none()) {
                req.1 = Some(xid);
            }
        }
        Ok(())
    }

    /// Feed of barrier replies from the switch.
    pub fn ack_barrier(&mut self, xid: u64) {
        for tracker in &mut self.trackers {
            while let Some((seqno, Some(bound))) = tracker.requests.front().copied() {
                if bound > xid {
                    break;
                }
                tracker.acked = Some(seqno);
                tracker.requests.pop_front();
            }
        }
    }

    pub fn acked(&self, typ: SeqnoType) -> Option<u64> {
        self.trackers[typ.0].acked
    }

    pub fn pending(&self, typ: SeqnoType) -> bool {
        !self.trackers[typ.0].requests.is_empty()
    }

    /// An OpenFlow reconnect voids outstanding barriers; unacked requests
    /// are re-armed so they bind to a fresh barrier.
    pub fn reconnected(&mut self) {
        for tracker in &mut self.trackers {
            for req in tracker.requests.iter_mut() {
                req.1 = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct FakeConn {
        sent: Vec<OfMsg>,
    }

    impl OfConn for FakeConn {
        fn connected(&self) -> bool {
            true
        }
        fn backlog(&self) -> usize {
            0
        }
        fn send(&mut self, msg: OfMsg) -> Result<(), OfError> {
            self.sent.push(msg);
            Ok(())
        }
    }

    #[test]
    fn test_ack_advances_on_barrier() {
        let mut subsys = SeqnoSubsys::new();
        let nb_cfg = subsys.register_type();
        let mut conn = FakeConn::default();

        subsys.want_ack(nb_cfg, 11);
        subsys.run(&mut conn).unwrap();
        assert_eq!(subsys.acked(nb_cfg), None);
        assert!(subsys.pending(nb_cfg));

        let OfMsg::Barrier { xid } = conn.sent[0] else {
            panic!("expected barrier");
        };
        subsys.ack_barrier(xid);
        assert_eq!(subsys.acked(nb_cfg), Some(11));
        assert!(!subsys.pending(nb_cfg));
    }

    #[test]
    fn test_requests_coalesce_and_order() {
        let mut subsys = SeqnoSubsys::new();
        let typ = subsys.register_type();
        let mut conn = FakeConn::default();
        subsys.want_ack(typ, 5);
        subsys.want_ack(typ, 5);
        subsys.run(&mut conn).unwrap();
        subsys.want_ack(typ, 6);
        subsys.run(&mut conn).unwrap();
        assert_eq!(conn.sent.len(), 2);

        // Acking the first barrier only covers the first request.
        let OfMsg::Barrier { xid } = conn.sent[0] else {
            panic!();
        };
        subsys.ack_barrier(xid);
        assert_eq!(subsys.acked(typ), Some(5));
        assert!(subsys.pending(typ));
    }

    #[test]
    fn test_reconnect_rebinds_requests() {
        let mut subsys = SeqnoSubsys::new();
        let typ = subsys.register_type();
        let mut conn = FakeConn::default();
        subsys.want_ack(typ, 7);
        subsys.run(&mut conn).unwrap();
        subsys.reconnected();
        // The old barrier must not satisfy the request anymore.
        subsys.ack_barrier(1);
        assert_eq!(subsys.acked(typ), None);
        subsys.run(&mut conn).unwrap();
        subsys.ack_barrier(2);
        assert_eq!(subsys.acked(typ), Some(7));
    }
}
