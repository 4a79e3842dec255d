//! Line-delimited JSON transports. Production deployments speak the
//! databases' native RPC through these same channel pairs; the framing
//! here is the reference transport used by the daemon binary and the
//! test harnesses. Each connection gets a reader and a writer thread;
//! the engine never blocks on either.

use crate::controller::OfEvent;
use crossbeam::channel::{unbounded, Receiver, Sender};
use flowsync_db::{CondRequest, DbMsg, TxnRequest};
use flowsync_ofctrl::{OfConn, OfError, OfMsg};
use flowsync_types::log::warn;
use flowsync_types::serde_json;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Client-to-server frame of a database connection.
#[derive(Debug, Serialize, Deserialize)]
pub enum DbClientMsg {
    Txn(TxnRequest),
    Cond(CondRequest),
}

pub struct DbChannels {
    pub inbox: Receiver<DbMsg>,
    pub txn_tx: Sender<TxnRequest>,
    pub cond_tx: Sender<CondRequest>,
}

/// Connects one database session. The returned channel ends plug straight
/// into `DbSession::new`.
pub fn connect_db(name: &'static str, addr: &str) -> std::io::Result<DbChannels> {
    let stream = TcpStream::connect(addr)?;
    let write_stream = stream.try_clone()?;
    let (inbox_tx, inbox) = unbounded();
    let (txn_tx, txn_rx) = unbounded::<TxnRequest>();
    let (cond_tx, cond_rx) = unbounded::<CondRequest>();

    thread::Builder::new()
        .name(format!("{name}-rx"))
        .spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                match serde_json::from_str::<DbMsg>(&line) {
                    Ok(msg) => {
                        if inbox_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("{name}: bad frame: {err}"),
                }
            }
            let _ = inbox_tx.send(DbMsg::Reconnected);
        })?;

    thread::Builder::new()
        .name(format!("{name}-tx"))
        .spawn(move || {
            let mut writer = write_stream;
            loop {
                let frame = crossbeam::channel::select! {
                    recv(txn_rx) -> msg => match msg {
                        Ok(txn) => DbClientMsg::Txn(txn),
                        Err(_) => break,
                    },
                    recv(cond_rx) -> msg => match msg {
                        Ok(cond) => DbClientMsg::Cond(cond),
                        Err(_) => break,
                    },
                };
                let Ok(body) = serde_json::to_string(&frame) else {
                    continue;
                };
                if writeln!(writer, "{body}").is_err() {
                    break;
                }
            }
        })?;

    Ok(DbChannels {
        inbox,
        txn_tx,
        cond_tx,
    })
}

/// OpenFlow channel over the same framing. Outbound messages are written
/// inline (the send path must observe backpressure as backlog); inbound
/// events arrive on a channel.
#[derive(Debug)]
pub struct TcpOfConn {
    writer: TcpStream,
    connected: Arc<AtomicBool>,
    backlog: Arc<AtomicUsize>,
}

impl OfConn for TcpOfConn {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    fn send(&mut self, msg: OfMsg) -> Result<(), OfError> {
        if !self.connected() {
            return Err(OfError::Disconnected);
        }
        let body = serde_json::to_string(&msg).map_err(|e| OfError::Channel(Box::new(e)))?;
        writeln!(self.writer, "{body}").map_err(|e| {
            self.connected.store(false, Ordering::Relaxed);
            OfError::Channel(Box::new(e))
        })
    }
}

pub fn connect_switch(addr: &str) -> std::io::Result<(TcpOfConn, Receiver<OfEvent>)> {
    let stream = TcpStream::connect(addr)?;
    let writer = stream.try_clone()?;
    let connected = Arc::new(AtomicBool::new(true));
    let backlog = Arc::new(AtomicUsize::new(0));
    let (event_tx, event_rx) = unbounded();
    let _ = event_tx.send(OfEvent::Connected);

    let conn_flag = connected.clone();
    thread::Builder::new().name("of-rx".to_string()).spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            match serde_json::from_str::<OfEvent>(&line) {
                Ok(event) => {
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
                Err(err) => warn!("openflow: bad frame: {err}"),
            }
        }
        conn_flag.store(false, Ordering::Relaxed);
        let _ = event_tx.send(OfEvent::Disconnected);
    })?;

    Ok((
        TcpOfConn {
            writer,
            connected,
            backlog,
        },
        event_rx,
    ))
}
