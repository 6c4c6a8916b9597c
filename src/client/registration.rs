//! Per-known-server registration lifecycle.
//!
//! One [`KnownServer`] per server discovered from the Security/Server object
//! pair, each running the state machine
//! Unregistered → Registering → Registered ↔ Updating → Deregistering.
//! The machine is pure: it consumes responses, deadlines and user requests
//! and emits [`RegAction`]s; the client loop turns actions into packets and
//! reports what it sent back through [`KnownServer::sent`].  At most one
//! registration message is ever outstanding per server.

use std::time::Duration;

use coap_lite::ResponseType;
use log::{debug, warn};
use tokio::time::Instant;

use crate::types::BindingMode;

/// How long to wait for the answer to a registration message.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff between failed Register attempts, doubling up to the cap.
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegState {
    Unregistered,
    Registering,
    Registered,
    Updating,
    Deregistering,
}

/// What the client loop should put on the wire next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegAction {
    None,
    SendRegister,
    SendUpdate { relist: bool },
    SendDeregister,
}

pub(crate) struct KnownServer<Endpoint> {
    pub uri: String,
    pub endpoint: Endpoint,
    pub short_server_id: u16,
    pub lifetime: Duration,
    pub binding: BindingMode,
    /// Location path assigned by the server at register time.
    pub location: Vec<String>,
    state: RegState,
    txn_token: Option<Vec<u8>>,
    deadline: Option<Instant>,
    first_attempt: Option<Instant>,
    backoff: Duration,
    update_pending: bool,
    advertised_version: Option<u64>,
}

/// Early-update margin before the lifetime expires: a tenth of the lifetime,
/// at least 2 s, never more than half the lifetime.
fn update_margin(lifetime: Duration) -> Duration {
    Duration::max(lifetime / 10, Duration::from_secs(2)).min(lifetime / 2)
}

impl<Endpoint> KnownServer<Endpoint> {
    pub fn new(
        uri: String,
        endpoint: Endpoint,
        short_server_id: u16,
        lifetime: Duration,
        binding: BindingMode,
    ) -> Self {
        Self {
            uri,
            endpoint,
            short_server_id,
            lifetime,
            binding,
            location: Vec::new(),
            state: RegState::Unregistered,
            txn_token: None,
            deadline: None,
            first_attempt: None,
            backoff: INITIAL_BACKOFF,
            update_pending: false,
            advertised_version: None,
        }
    }

    pub fn state(&self) -> RegState {
        self.state
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token_matches(&self, token: &[u8]) -> bool {
        self.txn_token.as_deref() == Some(token)
    }

    /// Begins the lifecycle for this server.
    pub fn start(&mut self, now: Instant) -> RegAction {
        match self.state {
            RegState::Unregistered => {
                self.state = RegState::Registering;
                self.first_attempt = Some(now);
                self.backoff = INITIAL_BACKOFF;
                RegAction::SendRegister
            }
            _ => RegAction::None,
        }
    }

    /// Records the transaction token put on the wire and arms the answer
    /// timeout.  Must follow every non-`None` action.
    pub fn sent(&mut self, token: Vec<u8>, now: Instant) {
        self.txn_token = Some(token);
        self.deadline = Some(now + ANSWER_TIMEOUT);
    }

    /// Records that a full object list went out with the last message.
    pub fn advertised(&mut self, registry_version: u64) {
        self.advertised_version = Some(registry_version);
    }

    /// True when the object list this server last saw is stale.
    pub fn needs_relist(&self, registry_version: u64) -> bool {
        self.advertised_version != Some(registry_version)
    }

    pub fn on_response(
        &mut self,
        code: ResponseType,
        location: Vec<String>,
        now: Instant,
        registry_version: u64,
    ) -> RegAction {
        self.txn_token = None;
        match self.state {
            RegState::Registering => {
                if code == ResponseType::Created && !location.is_empty() {
                    debug!("registered with {} at /{}", self.uri, location.join("/"));
                    self.location = location;
                    self.state = RegState::Registered;
                    self.backoff = INITIAL_BACKOFF;
                    self.first_attempt = None;
                    self.arm_update_timer(now);
                    RegAction::None
                } else {
                    warn!("register with {} failed: {code:?}", self.uri);
                    self.schedule_register_retry(now)
                }
            }
            RegState::Updating => match code {
                ResponseType::Changed => {
                    self.state = RegState::Registered;
                    self.arm_update_timer(now);
                    if std::mem::take(&mut self.update_pending) {
                        self.begin_update(registry_version)
                    } else {
                        RegAction::None
                    }
                }
                ResponseType::NotFound => {
                    // The server forgot us; fall back to a full register.
                    debug!("location at {} is stale, re-registering", self.uri);
                    self.location.clear();
                    self.state = RegState::Registering;
                    self.first_attempt = Some(now);
                    RegAction::SendRegister
                }
                _ => {
                    warn!("update with {} failed: {code:?}", self.uri);
                    self.schedule_register_retry(now)
                }
            },
            RegState::Deregistering => {
                self.reset();
                RegAction::None
            }
            _ => RegAction::None,
        }
    }

    /// Drives the armed timer: answer timeouts, retry delays and the early
    /// update before lifetime expiry.
    pub fn on_deadline(&mut self, now: Instant, registry_version: u64) -> RegAction {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return RegAction::None,
        }
        self.deadline = None;
        match self.state {
            RegState::Registering | RegState::Updating => {
                warn!("no answer from {}", self.uri);
                self.txn_token = None;
                self.schedule_register_retry(now)
            }
            RegState::Unregistered => {
                // Retry delay elapsed after an earlier failure.
                self.state = RegState::Registering;
                RegAction::SendRegister
            }
            RegState::Registered => self.begin_update(registry_version),
            RegState::Deregistering => {
                self.reset();
                RegAction::None
            }
        }
    }

    /// User-driven update.  While an update is already in flight, further
    /// requests coalesce into a single follow-up message.
    pub fn request_update(&mut self, registry_version: u64) -> RegAction {
        match self.state {
            RegState::Registered => self.begin_update(registry_version),
            RegState::Updating => {
                self.update_pending = true;
                RegAction::None
            }
            _ => RegAction::None,
        }
    }

    pub fn stop(&mut self) -> RegAction {
        match self.state {
            RegState::Registered | RegState::Updating => {
                self.update_pending = false;
                self.state = RegState::Deregistering;
                RegAction::SendDeregister
            }
            RegState::Deregistering => RegAction::None,
            RegState::Registering | RegState::Unregistered => {
                self.reset();
                RegAction::None
            }
        }
    }

    fn begin_update(&mut self, registry_version: u64) -> RegAction {
        self.state = RegState::Updating;
        RegAction::SendUpdate {
            relist: self.advertised_version != Some(registry_version),
        }
    }

    fn arm_update_timer(&mut self, now: Instant) {
        self.deadline = Some(now + self.lifetime - update_margin(self.lifetime));
    }

    fn schedule_register_retry(&mut self, now: Instant) -> RegAction {
        self.location.clear();
        self.update_pending = false;
        self.state = RegState::Unregistered;
        // An Update failure after a successful registration opens a fresh
        // failing cycle with the full retry budget.
        let first = *self.first_attempt.get_or_insert(now);
        let give_up = now.duration_since(first) >= self.lifetime;
        if give_up {
            warn!("giving up on {} after {:?}", self.uri, self.lifetime);
            self.deadline = None;
            self.first_attempt = None;
        } else {
            self.deadline = Some(now + self.backoff);
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        }
        RegAction::None
    }

    fn reset(&mut self) {
        self.state = RegState::Unregistered;
        self.location.clear();
        self.txn_token = None;
        self.deadline = None;
        self.first_attempt = None;
        self.backoff = INITIAL_BACKOFF;
        self.update_pending = false;
    }
}
