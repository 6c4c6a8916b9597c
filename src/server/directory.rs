//! The directory of currently registered clients and its lifecycle monitors.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use log::{debug, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::Instant;

use crate::error::Lwm2mError;
use crate::types::{BindingMode, RegistrationEvent};

/// One object advertised by a client, with its known instance ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientObject {
    pub id: u16,
    pub instances: Vec<u16>,
}

/// Everything the server knows about one registered client.
///
/// Values handed out of the directory are snapshots: they stay valid (and
/// stale) across later registration events, which is what makes it safe to
/// hold them inside monitor and management callbacks.
#[derive(Debug, Clone)]
pub struct ClientInfo<Endpoint> {
    pub(crate) name: String,
    pub(crate) location: String,
    pub(crate) sms: Option<String>,
    pub(crate) objects_path: Option<String>,
    pub(crate) lifetime: Duration,
    pub(crate) binding: BindingMode,
    pub(crate) peer: Endpoint,
    pub(crate) objects: Vec<ClientObject>,
    pub(crate) registered_at: Instant,
    pub(crate) expires_at: Instant,
}

impl<Endpoint> ClientInfo<Endpoint> {
    /// The unique endpoint name from the `ep` register query.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The short location path this server assigned at register time.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn sms(&self) -> Option<&str> {
        self.sms.as_deref()
    }

    pub fn objects_path(&self) -> Option<&str> {
        self.objects_path.as_deref()
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn binding_mode(&self) -> BindingMode {
        self.binding
    }

    pub fn address(&self) -> &Endpoint {
        &self.peer
    }

    pub fn objects(&self) -> &[ClientObject] {
        &self.objects
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Identity of an installed registration monitor, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorId(u64);

pub(crate) type MonitorCallback<Endpoint> =
    Box<dyn FnMut(&ClientInfo<Endpoint>, RegistrationEvent) + Send>;

pub(crate) struct RegisterParams<Endpoint> {
    pub name: String,
    pub lifetime: Duration,
    pub binding: BindingMode,
    pub sms: Option<String>,
    pub objects_path: Option<String>,
    pub objects: Vec<ClientObject>,
    pub peer: Endpoint,
}

#[derive(Default)]
pub(crate) struct UpdateParams {
    pub lifetime: Option<Duration>,
    pub binding: Option<BindingMode>,
    pub sms: Option<String>,
    pub objects: Option<Vec<ClientObject>>,
}

/// Registered clients keyed by their assigned location, plus the monitors to
/// notify on every lifecycle event.  Monitors fire synchronously, after the
/// transition is applied and before the CoAP response goes out.
pub(crate) struct Directory<Endpoint> {
    clients: HashMap<String, ClientInfo<Endpoint>>,
    monitors: Vec<(MonitorId, MonitorCallback<Endpoint>)>,
    next_monitor_id: u64,
}

impl<Endpoint: Debug + Clone> Directory<Endpoint> {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            monitors: Vec::new(),
            next_monitor_id: 0,
        }
    }

    /// Applies a registration, allocating a fresh location.  A client
    /// re-registering under a name already present replaces its old record.
    pub fn register(
        &mut self,
        params: RegisterParams<Endpoint>,
        now: Instant,
    ) -> Result<ClientInfo<Endpoint>, Lwm2mError> {
        let stale = self
            .clients
            .iter()
            .find(|(_, client)| client.name == params.name)
            .map(|(location, _)| location.clone());
        if let Some(location) = stale {
            debug!("client '{}' re-registered, dropping /rd/{location}", params.name);
            self.clients.remove(&location);
        }

        let location = self.new_location();
        let info = ClientInfo {
            name: params.name,
            location: location.clone(),
            sms: params.sms,
            objects_path: params.objects_path,
            lifetime: params.lifetime,
            binding: params.binding,
            peer: params.peer,
            objects: params.objects,
            registered_at: now,
            expires_at: now + params.lifetime,
        };
        self.clients.insert(location.clone(), info.clone());
        self.fire(&info, RegistrationEvent::Register);
        Ok(info)
    }

    /// Refreshes the lifetime timer and applies whatever parameters the
    /// Update carried.
    pub fn update(
        &mut self,
        location: &str,
        params: UpdateParams,
        now: Instant,
    ) -> Result<ClientInfo<Endpoint>, Lwm2mError> {
        let client = self.clients.get_mut(location).ok_or(Lwm2mError::NotFound)?;
        if let Some(lifetime) = params.lifetime {
            client.lifetime = lifetime;
        }
        if let Some(binding) = params.binding {
            client.binding = binding;
        }
        if let Some(sms) = params.sms {
            client.sms = Some(sms);
        }
        if let Some(objects) = params.objects {
            client.objects = objects;
        }
        client.expires_at = now + client.lifetime;
        let info = client.clone();
        self.fire(&info, RegistrationEvent::Update);
        Ok(info)
    }

    pub fn deregister(&mut self, location: &str) -> Result<ClientInfo<Endpoint>, Lwm2mError> {
        let info = self.clients.remove(location).ok_or(Lwm2mError::NotFound)?;
        self.fire(&info, RegistrationEvent::Unregister);
        Ok(info)
    }

    /// Evicts every client whose lifetime elapsed without an Update.
    pub fn expire(&mut self, now: Instant) -> Vec<ClientInfo<Endpoint>> {
        let due: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, client)| client.expires_at <= now)
            .map(|(location, _)| location.clone())
            .collect();
        let mut evicted = Vec::new();
        for location in due {
            if let Some(info) = self.clients.remove(&location) {
                warn!("client '{}' timed out, discarding", info.name);
                self.fire(&info, RegistrationEvent::Timeout);
                evicted.push(info);
            }
        }
        evicted
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.clients.values().map(|client| client.expires_at).min()
    }

    pub fn get(&self, location: &str) -> Option<&ClientInfo<Endpoint>> {
        self.clients.get(location)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ClientInfo<Endpoint>> {
        self.clients.values().find(|client| client.name == name)
    }

    /// Snapshot of every registered client.
    pub fn clients(&self) -> Vec<ClientInfo<Endpoint>> {
        self.clients.values().cloned().collect()
    }

    pub fn add_monitor(&mut self, callback: MonitorCallback<Endpoint>) -> MonitorId {
        let id = MonitorId(self.next_monitor_id);
        self.next_monitor_id += 1;
        self.monitors.push((id, callback));
        id
    }

    pub fn remove_monitor(&mut self, id: MonitorId) -> bool {
        let before = self.monitors.len();
        self.monitors.retain(|(monitor_id, _)| *monitor_id != id);
        self.monitors.len() != before
    }

    fn fire(&mut self, info: &ClientInfo<Endpoint>, event: RegistrationEvent) {
        for (_, callback) in &mut self.monitors {
            callback(info, event);
        }
    }

    fn new_location(&self) -> String {
        loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(5)
                .map(char::from)
                .collect();
            if !self.clients.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}
