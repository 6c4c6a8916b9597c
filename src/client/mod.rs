//! The LWM2M client endpoint: object registry, inbound dispatch, observation
//! fan-out and one registration lifecycle per known server, all driven by a
//! single cooperative event loop.

pub use object::{Capabilities, CreatePayload, ObjectDescriptor, ObjectHandler, Operation};

pub mod object;

mod dispatch;
mod observe;
mod registration;

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use coap_lite::{
    CoapRequest, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use futures::stream::Fuse;
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::Lwm2mError;
use crate::link;
use crate::path::Lwm2mPath;
use crate::resource::{Resource, Value};
use crate::transport::{BoxedFramedBinding, FatalError, Transport};
use crate::types::{
    add_uri_query, location_path_of, new_pong_message, oma, set_content_format, set_uri_path,
    BindingMode, LWM2M_VERSION, REGISTRATION_PATH,
};
use object::ObjectRegistry;
use observe::ObserveTable;
use registration::{KnownServer, RegAction};

/// Poll interval when no timer is armed.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Startup configuration of a client endpoint.
///
/// `U` is the single user-state type threaded through every object callback.
pub struct ClientConfig<U> {
    name: String,
    objects_path: Option<String>,
    sms: Option<String>,
    user: U,
    objects: Vec<(ObjectDescriptor, Box<dyn ObjectHandler<U>>)>,
    instances: Vec<(u16, u16)>,
}

impl<U> ClientConfig<U> {
    /// `name` is the unique endpoint name sent in the `ep` register query.
    pub fn new(name: impl Into<String>, user: U) -> Self {
        Self {
            name: name.into(),
            objects_path: None,
            sms: None,
            user,
            objects: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Advertise an alternate objects path (e.g. "lwm2m") that prefixes every
    /// management URI.
    pub fn objects_path(mut self, path: impl Into<String>) -> Self {
        self.objects_path = Some(path.into());
        self
    }

    /// Informational SMS number carried in the register query.
    pub fn sms(mut self, sms: impl Into<String>) -> Self {
        self.sms = Some(sms.into());
        self
    }

    /// Add an object implementation.  Every client needs at least the
    /// Security (0) and Server (1) objects for server discovery.
    pub fn object(
        mut self,
        descriptor: ObjectDescriptor,
        handler: impl ObjectHandler<U>,
    ) -> Self {
        self.objects.push((descriptor, Box::new(handler)));
        self
    }

    /// Pre-register an instance slot before startup.
    pub fn instance(mut self, object_id: u16, instance_id: u16) -> Self {
        self.instances.push((object_id, instance_id));
        self
    }
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<(), Lwm2mError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), Lwm2mError>>,
    },
    SendUpdate {
        reply: oneshot::Sender<Result<(), Lwm2mError>>,
    },
    NotifyObservers {
        paths: Vec<String>,
        reply: oneshot::Sender<Result<(), Lwm2mError>>,
    },
    AddObjectInstance {
        object_id: u16,
        instance_id: Option<u16>,
        reply: oneshot::Sender<Result<u16, Lwm2mError>>,
    },
}

/// Cloneable handle to a running [`Lwm2mClient`].  All methods enqueue a
/// command for the event loop and resolve once it has been applied; network
/// completion is observable only through the servers' registration events.
#[derive(Clone)]
pub struct Lwm2mClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl Lwm2mClientHandle {
    /// Discovers the known servers from the Security/Server objects and
    /// begins registering with each of them.
    pub async fn start(&self) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Start { reply }).await
    }

    /// Deregisters from every server.  Objects and instances survive a stop.
    pub async fn stop(&self) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Stop { reply }).await
    }

    /// Sends a registration Update to every registered server.
    pub async fn send_update(&self) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::SendUpdate { reply }).await
    }

    /// Notifies every observing server that the given paths changed.
    pub async fn notify_observers(
        &self,
        paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), Lwm2mError> {
        let paths = paths.into_iter().map(Into::into).collect();
        self.roundtrip(|reply| Command::NotifyObservers { paths, reply })
            .await
    }

    /// Registers an instance slot, allocating an id when none is given, and
    /// schedules a registration Update advertising the new tree.
    pub async fn add_object_instance(
        &self,
        object_id: u16,
        instance_id: Option<u16>,
    ) -> Result<u16, Lwm2mError> {
        self.roundtrip(|reply| Command::AddObjectInstance {
            object_id,
            instance_id,
            reply,
        })
        .await
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, Lwm2mError>>) -> Command,
    ) -> Result<T, Lwm2mError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Lwm2mError::internal("client loop is gone"))?;
        rx.await
            .map_err(|_| Lwm2mError::internal("client loop dropped the command"))?
    }
}

/// An LWM2M client endpoint bound to a transport.
pub struct Lwm2mClient<U, Endpoint: Debug + Clone + Eq + Hash> {
    binding: Fuse<BoxedFramedBinding<Endpoint>>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    name: String,
    objects_path: Option<String>,
    sms: Option<String>,
    user: U,
    registry: ObjectRegistry<U>,
    observations: ObserveTable<Endpoint>,
    servers: Vec<KnownServer<Endpoint>>,
    next_message_id: u16,
    running: bool,
}

impl<U, Endpoint> Lwm2mClient<U, Endpoint>
where
    U: Send + 'static,
    Endpoint: Debug + Clone + Eq + Hash + Send + 'static,
{
    /// Binds the transport and installs the configured objects.  The client
    /// stays passive until [`Lwm2mClientHandle::start`].
    pub async fn bind<T: Transport<Endpoint = Endpoint>>(
        config: ClientConfig<U>,
        transport: T,
    ) -> Result<Self, FatalError> {
        let binding = transport.bind().await?;
        let mut registry = ObjectRegistry::new();
        for (descriptor, handler) in config.objects {
            registry
                .insert(descriptor, handler)
                .map_err(|e| FatalError::Internal(e.to_string()))?;
        }
        for (object_id, instance_id) in config.instances {
            registry
                .add_instance(object_id, Some(instance_id))
                .map_err(|e| FatalError::Internal(e.to_string()))?;
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Ok(Self {
            binding: binding.fuse(),
            command_rx,
            command_tx,
            name: config.name,
            objects_path: config.objects_path,
            sms: config.sms,
            user: config.user,
            registry,
            observations: ObserveTable::new(),
            servers: Vec::new(),
            next_message_id: rand::thread_rng().gen(),
            running: false,
        })
    }

    pub fn handle(&self) -> Lwm2mClientHandle {
        Lwm2mClientHandle {
            tx: self.command_tx.clone(),
        }
    }

    /// Runs the event loop "forever".  Returns only on fatal transport
    /// failures; per-peer errors are logged and absorbed.
    pub async fn run(mut self) -> Result<(), FatalError> {
        loop {
            let deadline = self
                .servers
                .iter()
                .filter_map(KnownServer::next_deadline)
                .min()
                .unwrap_or_else(|| Instant::now() + IDLE_TICK);
            tokio::select! {
                event = self.binding.select_next_some() => {
                    match event {
                        Ok((packet, peer)) => {
                            trace!("incoming packet from {peer:?}: {packet:?}");
                            self.handle_packet(packet, peer).await;
                        }
                        Err((transport_err, peer)) => {
                            warn!("receive error from {peer:?}: {transport_err}");
                            if peer.is_none() {
                                return Err(transport_err.into());
                            }
                        }
                    }
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle_deadlines().await;
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet, peer: Endpoint) {
        match packet.header.code {
            MessageClass::Request(_) => self.handle_inbound_request(packet, peer).await,
            MessageClass::Response(code) => {
                self.handle_inbound_response(code, packet, peer).await;
            }
            MessageClass::Empty => match packet.header.get_type() {
                MessageType::Confirmable => {
                    self.send(new_pong_message(&packet), peer).await;
                }
                t => debug!("ignoring {t:?} Empty message from {peer:?}"),
            },
            code => warn!("unhandled message code {code} from {peer:?}, ignoring..."),
        }
    }

    async fn handle_inbound_request(&mut self, packet: Packet, peer: Endpoint) {
        if !self.running {
            debug!("dropping request from {peer:?}: client is stopped");
            return;
        }
        let mut request = CoapRequest::from_packet(packet, peer.clone());
        let outcome = dispatch::handle_request(
            &mut self.registry,
            &mut self.user,
            &mut self.observations,
            self.objects_path.as_deref(),
            &mut request,
        );
        match outcome {
            Ok(changed) => {
                if let Some(response) = request.response.take() {
                    self.send(response.message, peer).await;
                }
                if !changed.is_empty() {
                    self.notify_changed(&changed).await;
                    self.refresh_registrations().await;
                }
            }
            Err(e) => {
                if request.apply_from_error(e.into_handling_error()) {
                    if let Some(response) = request.response.take() {
                        self.send(response.message, peer).await;
                    }
                }
            }
        }
    }

    async fn handle_inbound_response(
        &mut self,
        code: ResponseType,
        packet: Packet,
        peer: Endpoint,
    ) {
        let token = packet.get_token().to_vec();
        let index = self
            .servers
            .iter()
            .position(|server| server.endpoint == peer && server.token_matches(&token));
        match index {
            Some(index) => {
                let location = location_path_of(&packet);
                let action = self.servers[index].on_response(
                    code,
                    location,
                    Instant::now(),
                    self.registry.version(),
                );
                self.perform_action(index, action).await;
            }
            None => debug!("response with unmatched token from {peer:?}, dropping"),
        }
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();
        let version = self.registry.version();
        for index in 0..self.servers.len() {
            let action = self.servers[index].on_deadline(now, version);
            self.perform_action(index, action).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                let result = self.start_servers().await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                for index in 0..self.servers.len() {
                    let action = self.servers[index].stop();
                    self.perform_action(index, action).await;
                }
                self.running = false;
                let _ = reply.send(Ok(()));
            }
            Command::SendUpdate { reply } => {
                let version = self.registry.version();
                for index in 0..self.servers.len() {
                    let action = self.servers[index].request_update(version);
                    self.perform_action(index, action).await;
                }
                let _ = reply.send(Ok(()));
            }
            Command::NotifyObservers { paths, reply } => {
                let mut parsed = Vec::with_capacity(paths.len());
                let mut result = Ok(());
                for path in &paths {
                    match Lwm2mPath::parse(path) {
                        Ok(path) => parsed.push(path),
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                if result.is_ok() {
                    self.notify_changed(&parsed).await;
                }
                let _ = reply.send(result);
            }
            Command::AddObjectInstance {
                object_id,
                instance_id,
                reply,
            } => {
                let result = self.registry.add_instance(object_id, instance_id);
                if result.is_ok() {
                    self.refresh_registrations().await;
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Reads the client's own Security and Server objects, pairs them by
    /// short server id and begins registering with every discovered server.
    async fn start_servers(&mut self) -> Result<(), Lwm2mError> {
        if self.running {
            return Ok(());
        }

        let mut security = Vec::new();
        for instance_id in self.registry.instances_of(oma::SECURITY_OBJECT) {
            let uri = string_value(&self.read_own(
                oma::SECURITY_OBJECT,
                instance_id,
                oma::SECURITY_SERVER_URI,
            )?)?;
            let short_id = short_id_value(&self.read_own(
                oma::SECURITY_OBJECT,
                instance_id,
                oma::SECURITY_SHORT_SERVER_ID,
            )?)?;
            security.push((short_id, uri));
        }

        let mut servers = Vec::new();
        for instance_id in self.registry.instances_of(oma::SERVER_OBJECT) {
            let short_id = short_id_value(&self.read_own(
                oma::SERVER_OBJECT,
                instance_id,
                oma::SERVER_SHORT_SERVER_ID,
            )?)?;
            let lifetime = int_value(&self.read_own(
                oma::SERVER_OBJECT,
                instance_id,
                oma::SERVER_LIFETIME,
            )?)?;
            if lifetime <= 0 {
                return Err(Lwm2mError::bad_request("server lifetime must be positive"));
            }
            let binding = BindingMode::parse(&string_value(&self.read_own(
                oma::SERVER_OBJECT,
                instance_id,
                oma::SERVER_BINDING,
            )?)?);
            if binding != BindingMode::U {
                return Err(Lwm2mError::NotImplemented(format!(
                    "binding mode {binding} is not supported"
                )));
            }
            let uri = security
                .iter()
                .find(|(id, _)| *id == short_id)
                .map(|(_, uri)| uri.clone())
                .ok_or_else(|| {
                    Lwm2mError::bad_request(format!(
                        "no security instance for short server id {short_id}"
                    ))
                })?;
            let endpoint = self
                .binding
                .get_ref()
                .resolve_uri(&uri)
                .map_err(|e| Lwm2mError::bad_request(e.to_string()))?;
            servers.push(KnownServer::new(
                uri,
                endpoint,
                short_id,
                Duration::from_secs(lifetime as u64),
                binding,
            ));
        }
        if servers.is_empty() {
            return Err(Lwm2mError::bad_request(
                "no servers found in the Security/Server objects",
            ));
        }

        self.servers = servers;
        self.running = true;
        let now = Instant::now();
        for index in 0..self.servers.len() {
            let action = self.servers[index].start(now);
            self.perform_action(index, action).await;
        }
        Ok(())
    }

    fn read_own(
        &mut self,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> Result<Resource, Lwm2mError> {
        self.registry
            .entry_mut(object_id)?
            .handler
            .read(&mut self.user, instance_id, resource_id)
    }

    /// Triggers an Update on every server whose advertised object list went
    /// stale, e.g. after a Create/Delete or a user-added instance.
    async fn refresh_registrations(&mut self) {
        let version = self.registry.version();
        for index in 0..self.servers.len() {
            if self.servers[index].needs_relist(version) {
                let action = self.servers[index].request_update(version);
                self.perform_action(index, action).await;
            }
        }
    }

    async fn perform_action(&mut self, index: usize, action: RegAction) {
        let now = Instant::now();
        let version = self.registry.version();
        match action {
            RegAction::None => {}
            RegAction::SendRegister => {
                let payload = link::write_registration_payload(
                    self.objects_path.as_deref(),
                    &self.registry.link_entries(),
                );
                let token = new_token();
                let mut packet = self.new_request(RequestType::Post, token.clone());
                set_uri_path(&mut packet, [REGISTRATION_PATH]);
                add_uri_query(&mut packet, "ep", &self.name);
                let server = &mut self.servers[index];
                add_uri_query(&mut packet, "lt", &server.lifetime.as_secs().to_string());
                add_uri_query(&mut packet, "lwm2m", LWM2M_VERSION);
                add_uri_query(&mut packet, "b", server.binding.as_str());
                if let Some(sms) = &self.sms {
                    add_uri_query(&mut packet, "sms", sms);
                }
                packet.set_content_format(ContentFormat::ApplicationLinkFormat);
                packet.payload = payload.into_bytes();
                server.sent(token, now);
                server.advertised(version);
                let peer = server.endpoint.clone();
                self.send(packet, peer).await;
            }
            RegAction::SendUpdate { relist } => {
                let payload = relist.then(|| {
                    link::write_registration_payload(
                        self.objects_path.as_deref(),
                        &self.registry.link_entries(),
                    )
                });
                let token = new_token();
                let mut packet = self.new_request(RequestType::Post, token.clone());
                let server = &mut self.servers[index];
                set_uri_path(&mut packet, server.location.iter().map(String::as_str));
                if let Some(payload) = payload {
                    packet.set_content_format(ContentFormat::ApplicationLinkFormat);
                    packet.payload = payload.into_bytes();
                    server.advertised(version);
                }
                server.sent(token, now);
                let peer = server.endpoint.clone();
                self.send(packet, peer).await;
            }
            RegAction::SendDeregister => {
                let token = new_token();
                let mut packet = self.new_request(RequestType::Delete, token.clone());
                let server = &mut self.servers[index];
                set_uri_path(&mut packet, server.location.iter().map(String::as_str));
                server.sent(token, now);
                let peer = server.endpoint.clone();
                self.send(packet, peer).await;
            }
        }
    }

    async fn notify_changed(&mut self, changed: &[Lwm2mPath]) {
        for pending in self.observations.affected(changed) {
            match dispatch::read_payload(&mut self.registry, &mut self.user, &pending.path) {
                Ok((content_type, payload)) => {
                    let mut packet = Packet::new();
                    packet.header.set_type(MessageType::NonConfirmable);
                    packet.header.code = MessageClass::Response(ResponseType::Content);
                    packet.header.message_id = self.alloc_message_id();
                    packet.set_token(pending.token);
                    packet.set_observe_value(pending.seq);
                    set_content_format(&mut packet, content_type);
                    packet.payload = payload;
                    self.send(packet, pending.peer).await;
                }
                Err(e) => debug!("skipping notification for {}: {e}", pending.path),
            }
        }
    }

    fn new_request(&mut self, method: RequestType, token: Vec<u8>) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(method);
        packet.header.message_id = self.alloc_message_id();
        packet.set_token(token);
        packet
    }

    fn alloc_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    async fn send(&mut self, packet: Packet, peer: Endpoint) {
        trace!("outgoing packet to {peer:?}: {packet:?}");
        if let Err(e) = self.binding.send((packet, peer.clone())).await {
            error!("error sending to {peer:?}: {e}");
        }
    }
}

fn new_token() -> Vec<u8> {
    rand::thread_rng().gen::<[u8; 8]>().to_vec()
}

fn int_value(resource: &Resource) -> Result<i64, Lwm2mError> {
    match resource.value() {
        Value::Int(v) | Value::Time(v) => Ok(*v),
        _ => Err(Lwm2mError::bad_request("expected an integer resource")),
    }
}

fn short_id_value(resource: &Resource) -> Result<u16, Lwm2mError> {
    u16::try_from(int_value(resource)?)
        .map_err(|_| Lwm2mError::bad_request("short server id out of range"))
}

fn string_value(resource: &Resource) -> Result<String, Lwm2mError> {
    match resource.value() {
        Value::String(bytes) => String::from_utf8(bytes.to_vec())
            .map_err(|e| Lwm2mError::bad_request(format!("resource is not UTF-8: {e}"))),
        _ => Err(Lwm2mError::bad_request("expected a string resource")),
    }
}
