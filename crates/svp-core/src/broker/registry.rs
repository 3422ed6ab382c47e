//! Live peer connections and the identities registered on them.

use crate::identity::{ConnId, ProcessorIdentity};
use crate::wire::Signal;
use crate::{Result, SvpError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnRole {
    /// Request/reply traffic. Records are tied to this connection.
    Command,
    /// Receives pushed notifications for its identity.
    Events,
}

/// One accepted connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnId,
    pub peer: String,
    pub identity: Option<ProcessorIdentity>,
    pub pid: Option<u32>,
    pub role: ConnRole,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Signal>,
    close: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConnectionEntry {
    pub fn new(
        id: ConnId,
        peer: impl Into<String>,
        outbound: mpsc::Sender<Signal>,
        close: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            identity: None,
            pid: None,
            role: ConnRole::Command,
            connected_at: Utc::now(),
            outbound,
            close: Mutex::new(Some(close)),
        }
    }

    /// Queue a signal for the connection's writer. False if it is gone.
    ///
    /// A full queue means the peer stopped reading; the signal is dropped
    /// and the connection is asked to hang up.
    pub fn send(&self, signal: Signal) -> bool {
        match self.outbound.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                warn!(
                    "{} ({}) is not reading, dropping {} and closing it",
                    self.id,
                    self.peer,
                    signal.kind()
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection task to hang up.
    pub fn close(&self) {
        let tx = self.close.lock().ok().and_then(|mut close| close.take());
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// Serializable view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub conn: ConnId,
    pub peer: String,
    pub identity: Option<ProcessorIdentity>,
    pub pid: Option<u32>,
    pub role: ConnRole,
    pub connected_at: DateTime<Utc>,
}

/// Registry of live connections, keyed by connection and by identity.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<ConnId, ConnectionEntry>,
    commands: HashMap<ProcessorIdentity, ConnId>,
    event_channels: HashMap<ProcessorIdentity, ConnId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: ConnectionEntry) {
        debug!("{} connected from {}", entry.id, entry.peer);
        self.entries.insert(entry.id, entry);
    }

    pub fn get(&self, conn: ConnId) -> Option<&ConnectionEntry> {
        self.entries.get(&conn)
    }

    /// Drop a connection and every identity mapping pointing at it.
    pub fn remove(&mut self, conn: ConnId) -> Option<ConnectionEntry> {
        let entry = self.entries.remove(&conn)?;
        if let Some(identity) = entry.identity {
            let map = match entry.role {
                ConnRole::Command => &mut self.commands,
                ConnRole::Events => &mut self.event_channels,
            };
            if map.get(&identity) == Some(&conn) {
                map.remove(&identity);
            }
        }
        Some(entry)
    }

    /// Bind `identity` to the command connection `conn`.
    pub fn register(&mut self, conn: ConnId, identity: ProcessorIdentity, pid: u32) -> Result<()> {
        if identity.is_none() || identity.is_general() {
            return Err(SvpError::NotRegistered(identity));
        }
        if self.commands.contains_key(&identity) {
            return Err(SvpError::AlreadyRegistered(identity));
        }
        let entry = self
            .entries
            .get_mut(&conn)
            .ok_or(SvpError::NotRegistered(identity))?;
        if let Some(existing) = entry.identity {
            return Err(SvpError::AlreadyRegistered(existing));
        }
        entry.identity = Some(identity);
        entry.pid = Some(pid);
        entry.role = ConnRole::Command;
        self.commands.insert(identity, conn);
        debug!("{} registered as {} (pid {})", conn, identity, pid);
        Ok(())
    }

    /// Make `conn` the push channel of an already registered `identity`.
    pub fn register_event_channel(&mut self, conn: ConnId, identity: ProcessorIdentity) -> Result<()> {
        if !self.commands.contains_key(&identity) {
            return Err(SvpError::NotRegistered(identity));
        }
        if self.event_channels.contains_key(&identity) {
            return Err(SvpError::AlreadyRegistered(identity));
        }
        let entry = self
            .entries
            .get_mut(&conn)
            .ok_or(SvpError::NotRegistered(identity))?;
        if let Some(existing) = entry.identity {
            return Err(SvpError::AlreadyRegistered(existing));
        }
        entry.identity = Some(identity);
        entry.role = ConnRole::Events;
        self.event_channels.insert(identity, conn);
        debug!("{} is the event channel of {}", conn, identity);
        Ok(())
    }

    pub fn is_registered(&self, identity: &ProcessorIdentity) -> bool {
        self.commands.contains_key(identity)
    }

    /// The identity a command connection acts for.
    pub fn identity_of(&self, conn: ConnId) -> Option<ProcessorIdentity> {
        self.entries
            .get(&conn)
            .filter(|e| e.role == ConnRole::Command)
            .and_then(|e| e.identity)
    }

    pub fn event_channel_of(&self, identity: &ProcessorIdentity) -> Option<ConnId> {
        self.event_channels.get(identity).copied()
    }

    /// Queue a reply on `conn`.
    pub fn send(&self, conn: ConnId, signal: Signal) -> bool {
        self.entries.get(&conn).is_some_and(|e| e.send(signal))
    }

    /// Push a notification to `identity`'s event channel, if it has one.
    pub fn push(&self, identity: &ProcessorIdentity, signal: Signal) -> bool {
        match self.event_channel_of(identity) {
            Some(conn) => {
                debug!("Pushing {} to {}", signal.kind(), identity);
                self.send(conn, signal)
            }
            None => false,
        }
    }

    /// Command connections whose identity descends from `ancestor`.
    pub fn dependents_of(&self, ancestor: &ProcessorIdentity) -> Vec<(ConnId, ProcessorIdentity)> {
        let mut deps: Vec<(ConnId, ProcessorIdentity)> = self
            .commands
            .iter()
            .filter(|(id, _)| id.depends_on(ancestor))
            .map(|(id, conn)| (*conn, *id))
            .collect();
        deps.sort();
        deps
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut conns: Vec<ConnectionSnapshot> = self
            .entries
            .values()
            .map(|e| ConnectionSnapshot {
                conn: e.id,
                peer: e.peer.clone(),
                identity: e.identity,
                pid: e.pid,
                role: e.role,
                connected_at: e.connected_at,
            })
            .collect();
        conns.sort_by_key(|c| c.conn);
        conns
    }
}
