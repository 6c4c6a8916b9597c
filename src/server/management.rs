//! Outstanding management requests and the observation registry.
//!
//! Every issued request stores a one-shot callback keyed by its CoAP token;
//! observations keep a repeatable callback list per (client, path) and share
//! one wire observation no matter how many local observers attach.

use std::collections::HashMap;
use std::fmt::Debug;

use coap_lite::ResponseType;
use log::debug;
use rand::Rng;

use crate::path::Lwm2mPath;
use crate::server::directory::ClientInfo;
use crate::types::ContentType;

/// Fires exactly once with the final status of a Write/Create/Execute/Delete.
pub type StatusCallback<Endpoint> =
    Box<dyn FnOnce(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType) + Send>;

/// Fires once per Read response, and repeatedly for observations.
pub type ContentCallback<Endpoint> = Box<
    dyn FnMut(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType, Option<ContentType>, &[u8]) + Send,
>;

/// Identity of one attached observer, used to detach it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

pub(crate) enum ResponseSink<Endpoint> {
    Status(StatusCallback<Endpoint>),
    Content(ContentCallback<Endpoint>),
    /// Final notification owed to the last observer after Observe=1 went out.
    ObserveStop(ContentCallback<Endpoint>),
}

pub(crate) struct Pending<Endpoint> {
    pub client_name: String,
    pub path: Lwm2mPath,
    pub sink: ResponseSink<Endpoint>,
}

struct ObservationEntry<Endpoint> {
    token: Vec<u8>,
    last_seq: Option<u32>,
    callbacks: Vec<(ObserverId, ContentCallback<Endpoint>)>,
}

/// What detaching an observer implies for the wire.
pub(crate) enum Detached<Endpoint> {
    /// Other observers remain; nothing to send.
    Shared,
    /// The last observer left: send `GET Observe=1` with the observation's
    /// token and deliver the final response to the departing callback.
    LastObserver {
        token: Vec<u8>,
        callback: ContentCallback<Endpoint>,
    },
}

pub(crate) struct ManagementTable<Endpoint> {
    pending: HashMap<Vec<u8>, Pending<Endpoint>>,
    observations: HashMap<(String, Lwm2mPath), ObservationEntry<Endpoint>>,
    next_observer_id: u64,
}

impl<Endpoint: Debug> ManagementTable<Endpoint> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            observations: HashMap::new(),
            next_observer_id: 0,
        }
    }

    /// Allocates a token unique within the outstanding set.
    pub fn new_token(&self) -> Vec<u8> {
        loop {
            let token = rand::thread_rng().gen::<[u8; 8]>().to_vec();
            let in_use = self.pending.contains_key(&token)
                || self.observations.values().any(|entry| entry.token == token);
            if !in_use {
                return token;
            }
        }
    }

    pub fn insert_pending(&mut self, token: Vec<u8>, pending: Pending<Endpoint>) {
        self.pending.insert(token, pending);
    }

    pub fn take_pending(&mut self, token: &[u8]) -> Option<Pending<Endpoint>> {
        self.pending.remove(token)
    }

    /// The client owning the observation a notification token belongs to.
    pub fn client_for_token(&self, token: &[u8]) -> Option<&str> {
        self.observations
            .iter()
            .find(|(_, entry)| entry.token == token)
            .map(|((client_name, _), _)| client_name.as_str())
    }

    /// Attaches an observer.  Returns the token to establish a new wire
    /// observation with, or `None` when one already exists for this pair and
    /// the observer simply shares it.
    pub fn attach_observer(
        &mut self,
        client_name: &str,
        path: Lwm2mPath,
        callback: ContentCallback<Endpoint>,
    ) -> (ObserverId, Option<Vec<u8>>) {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        let key = (client_name.to_string(), path);
        if let Some(entry) = self.observations.get_mut(&key) {
            entry.callbacks.push((id, callback));
            return (id, None);
        }
        let token = self.new_token();
        self.observations.insert(
            key,
            ObservationEntry {
                token: token.clone(),
                last_seq: None,
                callbacks: vec![(id, callback)],
            },
        );
        (id, Some(token))
    }

    /// Detaches one observer from a (client, path) observation.
    pub fn detach_observer(
        &mut self,
        client_name: &str,
        path: &Lwm2mPath,
        id: ObserverId,
    ) -> Option<Detached<Endpoint>> {
        let key = (client_name.to_string(), *path);
        let entry = self.observations.get_mut(&key)?;
        let index = entry
            .callbacks
            .iter()
            .position(|(observer_id, _)| *observer_id == id)?;
        let (_, callback) = entry.callbacks.remove(index);
        if entry.callbacks.is_empty() {
            let entry = self.observations.remove(&key).expect("entry just seen");
            Some(Detached::LastObserver {
                token: entry.token,
                callback,
            })
        } else {
            Some(Detached::Shared)
        }
    }

    /// Delivers a notification matched by token.  Returns false when no
    /// observation owns the token.  Notifications not newer than the last
    /// seen sequence are dropped.
    pub fn handle_notification(
        &mut self,
        token: &[u8],
        seq: Option<u32>,
        info: &ClientInfo<Endpoint>,
        code: ResponseType,
        content_type: Option<ContentType>,
        payload: &[u8],
    ) -> bool {
        let key = self
            .observations
            .iter()
            .find(|(_, entry)| entry.token == token)
            .map(|(key, _)| key.clone());
        let Some(key) = key else {
            return false;
        };
        let entry = self.observations.get_mut(&key).expect("entry just found");
        if let (Some(last), Some(new)) = (entry.last_seq, seq) {
            if !seq_is_newer(last, new) {
                debug!("dropping stale notification seq {new} (last {last})");
                return true;
            }
        }
        if seq.is_some() {
            entry.last_seq = seq;
        }
        let path = key.1;
        for (_, callback) in &mut entry.callbacks {
            callback(info, &path, code, content_type, payload);
        }
        true
    }

    /// Cancels everything addressed at a client that left the directory:
    /// pending requests complete with 5.03 and observations are dropped.
    pub fn cancel_client(&mut self, info: &ClientInfo<Endpoint>) {
        let tokens: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.client_name == info.name())
            .map(|(token, _)| token.clone())
            .collect();
        for token in tokens {
            if let Some(pending) = self.pending.remove(&token) {
                fire_cancelled(pending, info);
            }
        }
        self.observations
            .retain(|(client_name, _), _| client_name != info.name());
    }
}

fn fire_cancelled<Endpoint: Debug>(pending: Pending<Endpoint>, info: &ClientInfo<Endpoint>) {
    match pending.sink {
        ResponseSink::Status(callback) => {
            callback(info, &pending.path, ResponseType::ServiceUnavailable)
        }
        ResponseSink::Content(mut callback) | ResponseSink::ObserveStop(mut callback) => callback(
            info,
            &pending.path,
            ResponseType::ServiceUnavailable,
            None,
            &[],
        ),
    }
}

/// RFC 7641 freshness: `new` is newer than `last` within the 24-bit sequence
/// space unless it lags by half the space or more.
fn seq_is_newer(last: u32, new: u32) -> bool {
    if last == new {
        return false;
    }
    new.wrapping_sub(last) & 0x00FF_FFFF < 0x0080_0000
}
