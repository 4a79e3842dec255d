use crate::errors::OfError;
use crate::flow::{DesiredFlowTable, InstalledFlow, InstalledFlowTable};
use crate::msgs::{FlowModCommand, OfConn, OfMsg};
use flowsync_types::log::debug;
use std::collections::HashSet;

/// Messages outstanding beyond this are a backlog: the desired tables keep
/// accumulating, but no new messages are sent until the switch catches up.
pub const BACKLOG_LIMIT: usize = 4096;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PutResult {
    pub sent: usize,
    pub held_for_backlog: bool,
}

/// Diffs the union of the desired tables against the installed table and
/// emits the flow modifications that close the gap. The installed table is
/// advanced as messages are sent; acknowledgment is observed separately
/// through the barrier/seqno subsystem.
pub fn put(
    desired: &[&DesiredFlowTable],
    installed: &mut InstalledFlowTable,
    conn: &mut dyn OfConn,
) -> Result<PutResult, OfError> {
    if !conn.connected() {
        return Err(OfError::Disconnected);
    }
    if conn.backlog() >= BACKLOG_LIMIT {
        debug!("ofctrl: backlog of {} messages, holding flow sync", conn.backlog());
        return Ok(PutResult {
            sent: 0,
            held_for_backlog: true,
        });
    }

    let mut sent = 0;

    // Additions and modifications.
    for table in desired {
        for (key, flow) in table.iter() {
            let command = match installed.get(key) {
                None => FlowModCommand::Add,
                Some(have) if have.actions != flow.actions || have.cookie != flow.cookie => {
                    FlowModCommand::Modify
                }
                Some(_) => continue,
            };
            conn.send(OfMsg::FlowMod {
                command,
                table: key.table,
                priority: key.priority,
                match_: key.match_.clone(),
                actions: flow.actions.clone(),
                cookie: flow.cookie,
            })?;
            installed.insert(
                key.clone(),
                InstalledFlow {
                    actions: flow.actions.clone(),
                    cookie: flow.cookie,
                },
            );
            sent += 1;
        }
    }

    // Deletions: installed rules no desired table wants anymore.
    let wanted: HashSet<_> = desired
        .iter()
        .flat_map(|t| t.iter().map(|(key, _)| key.clone()))
        .collect();
    let stale: Vec<_> = installed
        .iter()
        .filter(|(key, _)| !wanted.contains(*key))
        .map(|(key, flow)| (key.clone(), flow.cookie))
        .collect();
    for (key, cookie) in stale {
        conn.send(OfMsg::FlowMod {
            command: FlowModCommand::Delete,
            table: key.table,
            priority: key.priority,
            match_: key.match_.clone(),
            actions: String::new(),
            cookie,
        })?;
        installed.remove(&key);
        sent += 1;
    }

    Ok(PutResult {
        sent,
        held_for_backlog: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowKey;
    use flowsync_types::uuid::Uuid;

    #[derive(Debug, Default)]
    struct FakeConn {
        sent: Vec<OfMsg>,
        backlog: usize,
    }

    impl OfConn for FakeConn {
        fn connected(&self) -> bool {
            true
        }
        fn backlog(&self) -> usize {
            self.backlog
        }
        fn send(&mut self, msg: OfMsg) -> Result<(), OfError> {
            self.sent.push(msg);
            Ok(())
        }
    }

    fn key(m: &str) -> FlowKey {
        FlowKey {
            table: 0,
            priority: 100,
            match_: m.to_string(),
        }
    }

    #[test]
    fn test_put_converges_then_is_quiet() {
        let mut desired = DesiredFlowTable::new();
        let origin = Uuid::new_v4();
        desired.add(origin, key("ip"), "next".into());

        let mut installed = InstalledFlowTable::new();
        let mut conn = FakeConn::default();
        let result = put(&[&desired], &mut installed, &mut conn).unwrap();
        assert_eq!(result.sent, 1);

        // Idempotence: nothing left to send.
        let result = put(&[&desired], &mut installed, &mut conn).unwrap();
        assert_eq!(result.sent, 0);

        // Retraction turns into a delete.
        desired.retract(&origin);
        let result = put(&[&desired], &mut installed, &mut conn).unwrap();
        assert_eq!(result.sent, 1);
        assert!(matches!(
            conn.sent.last().unwrap(),
            OfMsg::FlowMod {
                command: FlowModCommand::Delete,
                ..
            }
        ));
        assert_eq!(installed.len(), 0);
    }

    #[test]
    fn test_backlog_holds_messages() {
        let mut desired = DesiredFlowTable::new();
        desired.add(Uuid::new_v4(), key("ip"), "next".into());
        let mut installed = InstalledFlowTable::new();
        let mut conn = FakeConn {
            backlog: BACKLOG_LIMIT,
            ..Default::default()
        };
        let result = put(&[&desired], &mut installed, &mut conn).unwrap();
        assert!(result.held_for_backlog);
        assert_eq!(conn.sent.len(), 0);
        assert_eq!(installed.len(), 0);
    }
}
