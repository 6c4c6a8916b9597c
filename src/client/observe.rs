//! Resources, instances and objects currently observed by some server.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::path::Lwm2mPath;

/// Observe-option sequence number, wrapping at 24 bits as RFC 7641 bounds the
/// option to three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Seq24(u32);

impl Seq24 {
    const MASK: u32 = 0x00FF_FFFF;

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Advances and returns the new sequence value.
    pub fn bump(&mut self) -> u32 {
        self.0 = (self.0 + 1) & Self::MASK;
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObserveKey {
    path: Lwm2mPath,
    token: Vec<u8>,
}

#[derive(Debug)]
struct Observation<Endpoint> {
    peer: Endpoint,
    seq: Seq24,
}

/// One notification to issue, produced by [`ObserveTable::affected`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PendingNotification<Endpoint> {
    pub peer: Endpoint,
    pub path: Lwm2mPath,
    pub token: Vec<u8>,
    pub seq: u32,
}

/// Table of standing observations, keyed by (path, token).  The token is
/// what demultiplexes notifications at the peer; the path decides which
/// changes touch the observation.
pub(crate) struct ObserveTable<Endpoint> {
    observations: HashMap<ObserveKey, Observation<Endpoint>>,
}

impl<Endpoint: Debug + Clone + Eq + Hash> ObserveTable<Endpoint> {
    pub fn new() -> Self {
        Self {
            observations: HashMap::new(),
        }
    }

    /// Installs (or refreshes) an observation and returns the sequence number
    /// to carry in the installing response.
    pub fn install(&mut self, peer: Endpoint, path: Lwm2mPath, token: Vec<u8>) -> u32 {
        let key = ObserveKey { path, token };
        let observation = self
            .observations
            .entry(key)
            .or_insert_with(|| Observation {
                peer,
                seq: Seq24::zero(),
            });
        observation.seq.value()
    }

    /// Removes the observation for (path, token); true when one existed.
    pub fn remove(&mut self, path: &Lwm2mPath, token: &[u8]) -> bool {
        let key = ObserveKey {
            path: *path,
            token: token.to_vec(),
        };
        self.observations.remove(&key).is_some()
    }

    /// Collects every observation overlapping any of the changed paths,
    /// advancing each matched observation's sequence exactly once.
    pub fn affected(&mut self, changed: &[Lwm2mPath]) -> Vec<PendingNotification<Endpoint>> {
        let mut pending = Vec::new();
        for (key, observation) in &mut self.observations {
            if changed.iter().any(|path| path.covers(&key.path)) {
                pending.push(PendingNotification {
                    peer: observation.peer.clone(),
                    path: key.path,
                    token: key.token.clone(),
                    seq: observation.seq.bump(),
                });
            }
        }
        pending
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }
}
