//! The LWM2M server endpoint: registration directory, lifetime eviction and
//! the outbound management-interface issuer, driven by one event loop.

pub use directory::{ClientInfo, ClientObject, MonitorId};
pub use management::{ContentCallback, ObserverId, StatusCallback};

pub mod directory;
pub mod management;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::str;
use std::time::Duration;

use coap_lite::{
    CoapOption, CoapRequest, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use futures::stream::Fuse;
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::Lwm2mError;
use crate::link::{parse_registration_links, LinkEntry};
use crate::path::Lwm2mPath;
use crate::resource::Resource;
use crate::tlv;
use crate::transport::{BoxedFramedBinding, FatalError, Transport};
use crate::types::{
    content_format_of, new_pong_message, request_queries, set_content_format, set_uri_path,
    BindingMode, ContentType, RegistrationEvent, REGISTRATION_PATH,
};
use directory::{Directory, MonitorCallback, RegisterParams, UpdateParams};
use management::{Detached, ManagementTable, Pending, ResponseSink};

/// Registration lifetime assumed when the client's query does not carry `lt`.
const DEFAULT_LIFETIME: Duration = Duration::from_secs(86400);

/// Poll interval when no client is due to expire.
const IDLE_TICK: Duration = Duration::from_secs(3600);

type Reply<T> = oneshot::Sender<Result<T, Lwm2mError>>;

enum Command<Endpoint> {
    Read {
        client: String,
        path: String,
        callback: ContentCallback<Endpoint>,
        reply: Reply<()>,
    },
    Observe {
        client: String,
        path: String,
        callback: ContentCallback<Endpoint>,
        reply: Reply<ObserverId>,
    },
    Unobserve {
        client: String,
        path: String,
        observer: ObserverId,
        reply: Reply<()>,
    },
    Write {
        client: String,
        path: String,
        resources: Vec<Resource>,
        callback: StatusCallback<Endpoint>,
        reply: Reply<()>,
    },
    Create {
        client: String,
        path: String,
        resources: Vec<Resource>,
        callback: StatusCallback<Endpoint>,
        reply: Reply<()>,
    },
    Execute {
        client: String,
        path: String,
        args: Option<String>,
        callback: StatusCallback<Endpoint>,
        reply: Reply<()>,
    },
    Delete {
        client: String,
        path: String,
        callback: StatusCallback<Endpoint>,
        reply: Reply<()>,
    },
    Clients {
        reply: oneshot::Sender<Vec<ClientInfo<Endpoint>>>,
    },
    AddMonitor {
        callback: MonitorCallback<Endpoint>,
        reply: oneshot::Sender<MonitorId>,
    },
    RemoveMonitor {
        id: MonitorId,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to a running [`Lwm2mServer`].  Management methods enqueue
/// the request and resolve once it is on the wire; the outcome arrives later
/// through the given callback.
pub struct Lwm2mServerHandle<Endpoint> {
    tx: mpsc::UnboundedSender<Command<Endpoint>>,
}

impl<Endpoint> Clone for Lwm2mServerHandle<Endpoint> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Endpoint: Debug + Clone + Send + 'static> Lwm2mServerHandle<Endpoint> {
    /// Reads an object, instance or resource from a registered client.
    pub async fn read(
        &self,
        client: impl Into<String>,
        path: impl Into<String>,
        callback: impl FnMut(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType, Option<ContentType>, &[u8])
            + Send
            + 'static,
    ) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Read {
            client: client.into(),
            path: path.into(),
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Observes a path on a client.  The callback fires for the initial
    /// representation and again for every notification.
    pub async fn observe(
        &self,
        client: impl Into<String>,
        path: impl Into<String>,
        callback: impl FnMut(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType, Option<ContentType>, &[u8])
            + Send
            + 'static,
    ) -> Result<ObserverId, Lwm2mError> {
        self.roundtrip(|reply| Command::Observe {
            client: client.into(),
            path: path.into(),
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Detaches one observer.  Only when the last observer on the
    /// (client, path) pair leaves is the observation cancelled on the wire.
    pub async fn unobserve(
        &self,
        client: impl Into<String>,
        path: impl Into<String>,
        observer: ObserverId,
    ) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Unobserve {
            client: client.into(),
            path: path.into(),
            observer,
            reply,
        })
        .await
    }

    /// Writes resources to an instance or a single resource, as TLV.
    pub async fn write(
        &self,
        client: impl Into<String>,
        path: impl Into<String>,
        resources: Vec<Resource>,
        callback: impl FnOnce(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType) + Send + 'static,
    ) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Write {
            client: client.into(),
            path: path.into(),
            resources,
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Creates an object instance from the given resources, as TLV.
    pub async fn create(
        &self,
        client: impl Into<String>,
        path: impl Into<String>,
        resources: Vec<Resource>,
        callback: impl FnOnce(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType) + Send + 'static,
    ) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Create {
            client: client.into(),
            path: path.into(),
            resources,
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Executes a resource, optionally with text arguments.
    pub async fn execute(
        &self,
        client: impl Into<String>,
        path: impl Into<String>,
        args: Option<String>,
        callback: impl FnOnce(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType) + Send + 'static,
    ) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Execute {
            client: client.into(),
            path: path.into(),
            args,
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Deletes an object instance.
    pub async fn delete(
        &self,
        client: impl Into<String>,
        path: impl Into<String>,
        callback: impl FnOnce(&ClientInfo<Endpoint>, &Lwm2mPath, ResponseType) + Send + 'static,
    ) -> Result<(), Lwm2mError> {
        self.roundtrip(|reply| Command::Delete {
            client: client.into(),
            path: path.into(),
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Snapshot of every currently registered client.
    pub async fn clients(&self) -> Result<Vec<ClientInfo<Endpoint>>, Lwm2mError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Clients { reply })
            .map_err(|_| Lwm2mError::internal("server loop is gone"))?;
        rx.await
            .map_err(|_| Lwm2mError::internal("server loop dropped the command"))
    }

    /// Installs a monitor invoked on every registration event.
    pub async fn add_registration_monitor(
        &self,
        callback: impl FnMut(&ClientInfo<Endpoint>, RegistrationEvent) + Send + 'static,
    ) -> Result<MonitorId, Lwm2mError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::AddMonitor {
                callback: Box::new(callback),
                reply,
            })
            .map_err(|_| Lwm2mError::internal("server loop is gone"))?;
        rx.await
            .map_err(|_| Lwm2mError::internal("server loop dropped the command"))
    }

    pub async fn remove_registration_monitor(&self, id: MonitorId) -> Result<bool, Lwm2mError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RemoveMonitor { id, reply })
            .map_err(|_| Lwm2mError::internal("server loop is gone"))?;
        rx.await
            .map_err(|_| Lwm2mError::internal("server loop dropped the command"))
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command<Endpoint>,
    ) -> Result<T, Lwm2mError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Lwm2mError::internal("server loop is gone"))?;
        rx.await
            .map_err(|_| Lwm2mError::internal("server loop dropped the command"))?
    }
}

/// An LWM2M server endpoint bound to a transport.
pub struct Lwm2mServer<Endpoint: Debug + Clone + Eq + Hash> {
    binding: Fuse<BoxedFramedBinding<Endpoint>>,
    command_rx: mpsc::UnboundedReceiver<Command<Endpoint>>,
    command_tx: mpsc::UnboundedSender<Command<Endpoint>>,
    directory: Directory<Endpoint>,
    management: ManagementTable<Endpoint>,
    next_message_id: u16,
}

impl<Endpoint> Lwm2mServer<Endpoint>
where
    Endpoint: Debug + Clone + Eq + Hash + Send + 'static,
{
    /// Binds the server; it is operational as soon as [`Lwm2mServer::run`]
    /// is polled.  For plain UDP bind to `("0.0.0.0", DEFAULT_PORT)`.
    pub async fn bind<T: Transport<Endpoint = Endpoint>>(
        transport: T,
    ) -> Result<Self, FatalError> {
        let binding = transport.bind().await?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Ok(Self {
            binding: binding.fuse(),
            command_rx,
            command_tx,
            directory: Directory::new(),
            management: ManagementTable::new(),
            next_message_id: rand::thread_rng().gen(),
        })
    }

    pub fn handle(&self) -> Lwm2mServerHandle<Endpoint> {
        Lwm2mServerHandle {
            tx: self.command_tx.clone(),
        }
    }

    /// Runs the event loop "forever".  Returns only on fatal transport
    /// failures; per-peer errors are logged and absorbed.
    pub async fn run(mut self) -> Result<(), FatalError> {
        loop {
            let deadline = self
                .directory
                .next_expiry()
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
                    self.evict_expired();
                }
            }
        }
    }

    fn evict_expired(&mut self) {
        for info in self.directory.expire(Instant::now()) {
            self.management.cancel_client(&info);
        }
    }

    async fn handle_packet(&mut self, packet: Packet, peer: Endpoint) {
        match packet.header.code {
            MessageClass::Request(_) => {
                let mut request = CoapRequest::from_packet(packet, peer.clone());
                let result = handle_registration_request(
                    &mut self.directory,
                    &mut self.management,
                    &mut request,
                    Instant::now(),
                );
                match result {
                    Ok(()) => {
                        if let Some(response) = request.response.take() {
                            self.send(response.message, peer).await;
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
            MessageClass::Response(code) => self.handle_response(code, packet, peer),
            MessageClass::Empty => match packet.header.get_type() {
                MessageType::Confirmable => {
                    self.send(new_pong_message(&packet), peer).await;
                }
                t => debug!("ignoring {t:?} Empty message from {peer:?}"),
            },
            code => warn!("unhandled message code {code} from {peer:?}, ignoring..."),
        }
    }

    /// Demultiplexes a reply onto its pending request or observation by
    /// token.  Unmatched tokens are dropped.
    fn handle_response(&mut self, code: ResponseType, packet: Packet, peer: Endpoint) {
        let token = packet.get_token().to_vec();
        let content_type = content_format_of(&packet).and_then(ContentType::from_wire);

        if let Some(pending) = self.management.take_pending(&token) {
            let info = self.directory.find_by_name(&pending.client_name).cloned();
            let Some(info) = info else {
                debug!("reply for vanished client '{}', dropping", pending.client_name);
                return;
            };
            match pending.sink {
                ResponseSink::Status(callback) => callback(&info, &pending.path, code),
                ResponseSink::Content(mut callback)
                | ResponseSink::ObserveStop(mut callback) => {
                    callback(&info, &pending.path, code, content_type, &packet.payload)
                }
            }
            return;
        }

        let client_name = self.management.client_for_token(&token).map(str::to_string);
        if let Some(client_name) = client_name {
            let info = self.directory.find_by_name(&client_name).cloned();
            if let Some(info) = info {
                let seq = packet.get_observe_value().and_then(Result::ok);
                self.management.handle_notification(
                    &token,
                    seq,
                    &info,
                    code,
                    content_type,
                    &packet.payload,
                );
                return;
            }
        }
        debug!("reply with unmatched token from {peer:?}, dropping");
    }

    async fn handle_command(&mut self, command: Command<Endpoint>) {
        match command {
            Command::Read {
                client,
                path,
                callback,
                reply,
            } => {
                let result = self
                    .issue(&client, &path, None, RequestType::Get, None, |_| {
                        ResponseSink::Content(callback)
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Observe {
                client,
                path,
                callback,
                reply,
            } => {
                let result = self.start_observe(&client, &path, callback).await;
                let _ = reply.send(result);
            }
            Command::Unobserve {
                client,
                path,
                observer,
                reply,
            } => {
                let result = self.stop_observe(&client, &path, observer).await;
                let _ = reply.send(result);
            }
            Command::Write {
                client,
                path,
                resources,
                callback,
                reply,
            } => {
                let result = self
                    .issue_with_tlv(&client, &path, &resources, RequestType::Put, callback, &[2, 3])
                    .await;
                let _ = reply.send(result);
            }
            Command::Create {
                client,
                path,
                resources,
                callback,
                reply,
            } => {
                let result = self
                    .issue_with_tlv(&client, &path, &resources, RequestType::Post, callback, &[1])
                    .await;
                let _ = reply.send(result);
            }
            Command::Execute {
                client,
                path,
                args,
                callback,
                reply,
            } => {
                let body = args.map(|args| (ContentType::Text, args.into_bytes()));
                let result = self
                    .issue(&client, &path, Some(3), RequestType::Post, body, |_| {
                        ResponseSink::Status(callback)
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Delete {
                client,
                path,
                callback,
                reply,
            } => {
                let result = self
                    .issue(&client, &path, Some(2), RequestType::Delete, None, |_| {
                        ResponseSink::Status(callback)
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Clients { reply } => {
                let _ = reply.send(self.directory.clients());
            }
            Command::AddMonitor { callback, reply } => {
                let _ = reply.send(self.directory.add_monitor(callback));
            }
            Command::RemoveMonitor { id, reply } => {
                let _ = reply.send(self.directory.remove_monitor(id));
            }
        }
    }

    async fn issue_with_tlv(
        &mut self,
        client: &str,
        path: &str,
        resources: &[Resource],
        method: RequestType,
        callback: StatusCallback<Endpoint>,
        allowed_depths: &[usize],
    ) -> Result<(), Lwm2mError> {
        let parsed = Lwm2mPath::parse(path)?;
        if !allowed_depths.contains(&parsed.depth()) {
            return Err(Lwm2mError::bad_request(format!(
                "path {parsed} has the wrong depth for this operation"
            )));
        }
        let mut payload = Vec::new();
        tlv::encode_resources(resources, &mut payload)?;
        self.issue(
            client,
            path,
            None,
            method,
            Some((ContentType::Tlv, payload)),
            |_| ResponseSink::Status(callback),
        )
        .await
    }

    /// Issues one management request: resolves the client, allocates a fresh
    /// token, stores the response sink and puts the packet on the wire.
    async fn issue(
        &mut self,
        client: &str,
        path: &str,
        required_depth: Option<usize>,
        method: RequestType,
        body: Option<(ContentType, Vec<u8>)>,
        make_sink: impl FnOnce(&ClientInfo<Endpoint>) -> ResponseSink<Endpoint>,
    ) -> Result<(), Lwm2mError> {
        let path = Lwm2mPath::parse(path)?;
        if let Some(depth) = required_depth {
            if path.depth() != depth {
                return Err(Lwm2mError::bad_request(format!(
                    "operation requires a depth-{depth} path, got {path}"
                )));
            }
        }
        let info = self
            .directory
            .find_by_name(client)
            .ok_or(Lwm2mError::NotFound)?
            .clone();
        let token = self.management.new_token();
        let sink = make_sink(&info);
        self.management.insert_pending(
            token.clone(),
            Pending {
                client_name: client.to_string(),
                path,
                sink,
            },
        );
        let mut packet = self.management_request(method, token, &info, &path);
        if let Some((content_type, payload)) = body {
            set_content_format(&mut packet, content_type);
            packet.payload = payload;
        }
        let peer = info.peer.clone();
        self.send(packet, peer).await;
        Ok(())
    }

    async fn start_observe(
        &mut self,
        client: &str,
        path: &str,
        callback: ContentCallback<Endpoint>,
    ) -> Result<ObserverId, Lwm2mError> {
        let path = Lwm2mPath::parse(path)?;
        let info = self
            .directory
            .find_by_name(client)
            .ok_or(Lwm2mError::NotFound)?
            .clone();
        let (id, new_token) = self.management.attach_observer(client, path, callback);
        if let Some(token) = new_token {
            let mut packet = self.management_request(RequestType::Get, token, &info, &path);
            packet.set_observe_value(0);
            let peer = info.peer.clone();
            self.send(packet, peer).await;
        }
        Ok(id)
    }

    async fn stop_observe(
        &mut self,
        client: &str,
        path: &str,
        observer: ObserverId,
    ) -> Result<(), Lwm2mError> {
        let path = Lwm2mPath::parse(path)?;
        match self.management.detach_observer(client, &path, observer) {
            None => Err(Lwm2mError::NotFound),
            Some(Detached::Shared) => Ok(()),
            Some(Detached::LastObserver { token, callback }) => {
                let info = self
                    .directory
                    .find_by_name(client)
                    .ok_or(Lwm2mError::NotFound)?
                    .clone();
                self.management.insert_pending(
                    token.clone(),
                    Pending {
                        client_name: client.to_string(),
                        path,
                        sink: ResponseSink::ObserveStop(callback),
                    },
                );
                let mut packet = self.management_request(RequestType::Get, token, &info, &path);
                packet.set_observe_value(1);
                let peer = info.peer.clone();
                self.send(packet, peer).await;
                Ok(())
            }
        }
    }

    fn management_request(
        &mut self,
        method: RequestType,
        token: Vec<u8>,
        info: &ClientInfo<Endpoint>,
        path: &Lwm2mPath,
    ) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(method);
        packet.header.message_id = self.alloc_message_id();
        packet.set_token(token);
        if let Some(prefix) = info.objects_path() {
            set_uri_path(&mut packet, prefix.split('/').filter(|s| !s.is_empty()));
        }
        let rendered = path.to_string();
        set_uri_path(&mut packet, rendered.split('/').filter(|s| !s.is_empty()));
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

/// Handles the registration interface: `POST /rd` (register),
/// `POST /rd/<location>` (update) and `DELETE /rd/<location>` (deregister).
fn handle_registration_request<Endpoint: Debug + Clone>(
    directory: &mut Directory<Endpoint>,
    management: &mut ManagementTable<Endpoint>,
    request: &mut CoapRequest<Endpoint>,
    now: Instant,
) -> Result<(), Lwm2mError> {
    let segments = request.get_path_as_vec().map_err(Lwm2mError::bad_request)?;
    let method = *request.get_method();
    let peer = request
        .source
        .clone()
        .ok_or_else(|| Lwm2mError::internal("request without a source"))?;

    match (method, segments.as_slice()) {
        (RequestType::Post, [root]) if root.as_str() == REGISTRATION_PATH => {
            let queries = request_queries(&request.message)?;
            let name = queries
                .get("ep")
                .cloned()
                .ok_or_else(|| Lwm2mError::bad_request("register without an endpoint name"))?;
            let lifetime = match queries.get("lt") {
                Some(lt) => {
                    let secs = lt
                        .parse::<u64>()
                        .map_err(|_| Lwm2mError::bad_request(format!("bad lifetime '{lt}'")))?;
                    if secs == 0 {
                        return Err(Lwm2mError::bad_request("lifetime must be positive"));
                    }
                    Duration::from_secs(secs)
                }
                None => DEFAULT_LIFETIME,
            };
            let binding = queries
                .get("b")
                .map(|b| BindingMode::parse(b))
                .unwrap_or(BindingMode::U);
            let body = str::from_utf8(&request.message.payload)
                .map_err(|e| Lwm2mError::bad_request(format!("register body is not UTF-8: {e}")))?;
            let links = parse_registration_links(body)?;
            let info = directory.register(
                RegisterParams {
                    name,
                    lifetime,
                    binding,
                    sms: queries.get("sms").cloned(),
                    objects_path: links.objects_path,
                    objects: group_objects(&links.entries),
                    peer,
                },
                now,
            )?;
            let response = request
                .response
                .as_mut()
                .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;
            response.set_status(ResponseType::Created);
            response
                .message
                .add_option(CoapOption::LocationPath, REGISTRATION_PATH.as_bytes().to_vec());
            response
                .message
                .add_option(CoapOption::LocationPath, info.location().as_bytes().to_vec());
            Ok(())
        }
        (RequestType::Post, [root, location]) if root.as_str() == REGISTRATION_PATH => {
            let queries = request_queries(&request.message)?;
            let lifetime = queries
                .get("lt")
                .map(|lt| {
                    lt.parse::<u64>()
                        .map_err(|_| Lwm2mError::bad_request(format!("bad lifetime '{lt}'")))
                        .map(Duration::from_secs)
                })
                .transpose()?;
            let objects = if request.message.payload.is_empty() {
                None
            } else {
                let body = str::from_utf8(&request.message.payload).map_err(|e| {
                    Lwm2mError::bad_request(format!("update body is not UTF-8: {e}"))
                })?;
                Some(group_objects(&parse_registration_links(body)?.entries))
            };
            directory.update(
                location,
                UpdateParams {
                    lifetime,
                    binding: queries.get("b").map(|b| BindingMode::parse(b)),
                    sms: queries.get("sms").cloned(),
                    objects,
                },
                now,
            )?;
            let response = request
                .response
                .as_mut()
                .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;
            response.set_status(ResponseType::Changed);
            Ok(())
        }
        (RequestType::Delete, [root, location]) if root.as_str() == REGISTRATION_PATH => {
            let info = directory.deregister(location)?;
            management.cancel_client(&info);
            let response = request
                .response
                .as_mut()
                .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;
            response.set_status(ResponseType::Deleted);
            Ok(())
        }
        (_, [root, ..]) if root.as_str() == REGISTRATION_PATH => Err(Lwm2mError::MethodNotAllowed),
        _ => Err(Lwm2mError::NotFound),
    }
}

/// Groups the advertised link entries into per-object instance lists.
fn group_objects(entries: &[LinkEntry]) -> Vec<ClientObject> {
    let mut grouped: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
    for entry in entries {
        let instances = grouped.entry(entry.object_id).or_default();
        if let Some(instance_id) = entry.instance_id {
            instances.push(instance_id);
        }
    }
    grouped
        .into_iter()
        .map(|(id, instances)| ClientObject { id, instances })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::add_uri_query;
    use std::sync::{Arc, Mutex};
    use tokio::time;

    type TestEndpoint = i32;

    struct Fixture {
        directory: Directory<TestEndpoint>,
        management: ManagementTable<TestEndpoint>,
        events: Arc<Mutex<Vec<(String, RegistrationEvent)>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut directory = Directory::new();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            directory.add_monitor(Box::new(move |info, event| {
                sink.lock().unwrap().push((info.name().to_string(), event));
            }));
            Self {
                directory,
                management: ManagementTable::new(),
                events,
            }
        }

        fn handle(&mut self, request: &mut CoapRequest<TestEndpoint>) -> Result<(), Lwm2mError> {
            handle_registration_request(
                &mut self.directory,
                &mut self.management,
                request,
                Instant::now(),
            )
        }
    }

    fn new_request(method: RequestType, segments: &[&str]) -> CoapRequest<TestEndpoint> {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(method);
        packet.header.set_type(MessageType::Confirmable);
        packet.header.message_id = 11;
        packet.set_token(b"t".to_vec());
        set_uri_path(&mut packet, segments.iter().copied());
        CoapRequest::from_packet(packet, 9)
    }

    fn register_request(query: &[(&str, &str)], body: &str) -> CoapRequest<TestEndpoint> {
        let mut request = new_request(RequestType::Post, &["rd"]);
        for (key, value) in query {
            add_uri_query(&mut request.message, key, value);
        }
        request.message.payload = body.as_bytes().to_vec();
        request
    }

    fn response_status(request: &CoapRequest<TestEndpoint>) -> ResponseType {
        match request.response.as_ref().unwrap().message.header.code {
            MessageClass::Response(code) => code,
            other => panic!("not a response code: {other:?}"),
        }
    }

    fn location_of(request: &CoapRequest<TestEndpoint>) -> Vec<String> {
        request
            .response
            .as_ref()
            .unwrap()
            .message
            .get_option(CoapOption::LocationPath)
            .map(|values| {
                values
                    .iter()
                    .map(|raw| String::from_utf8_lossy(raw).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_populates_directory() {
        let mut fixture = Fixture::new();
        let before = Instant::now();
        let mut request = register_request(
            &[("ep", "dev"), ("lt", "60"), ("b", "U")],
            "</1/0>,</3/0>",
        );
        fixture.handle(&mut request).unwrap();

        assert_eq!(response_status(&request), ResponseType::Created);
        let location = location_of(&request);
        assert_eq!(location.len(), 2);
        assert_eq!(location[0], "rd");

        let clients = fixture.directory.clients();
        assert_eq!(clients.len(), 1);
        let info = &clients[0];
        assert_eq!(info.name(), "dev");
        assert_eq!(info.binding_mode(), BindingMode::U);
        assert_eq!(info.expires_at(), before + Duration::from_secs(60));
        assert_eq!(
            info.objects(),
            &[
                ClientObject { id: 1, instances: vec![0] },
                ClientObject { id: 3, instances: vec![0] },
            ]
        );
        assert_eq!(
            fixture.events.lock().unwrap().as_slice(),
            &[("dev".to_string(), RegistrationEvent::Register)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_without_endpoint_name_is_rejected() {
        let mut fixture = Fixture::new();
        let mut request = register_request(&[("lt", "60")], "</1/0>");
        let err = fixture.handle(&mut request).unwrap_err();
        assert!(matches!(err, Lwm2mError::BadRequest(_)));
        assert!(fixture.directory.clients().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_refreshes_and_relists() {
        let mut fixture = Fixture::new();
        let mut request = register_request(&[("ep", "dev"), ("lt", "60")], "</1/0>");
        fixture.handle(&mut request).unwrap();
        let location = location_of(&request)[1].clone();

        time::advance(Duration::from_secs(30)).await;
        let refreshed_at = Instant::now();
        let mut update = new_request(RequestType::Post, &["rd", &location]);
        update.message.payload = b"</1/0>,</5/0>".to_vec();
        fixture.handle(&mut update).unwrap();

        assert_eq!(response_status(&update), ResponseType::Changed);
        let info = fixture.directory.find_by_name("dev").unwrap();
        assert_eq!(info.expires_at(), refreshed_at + Duration::from_secs(60));
        assert_eq!(info.objects().len(), 2);
        assert_eq!(
            fixture.events.lock().unwrap()[1],
            ("dev".to_string(), RegistrationEvent::Update)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_unknown_location_is_not_found() {
        let mut fixture = Fixture::new();
        let mut update = new_request(RequestType::Post, &["rd", "zzzzz"]);
        let err = fixture.handle(&mut update).unwrap_err();
        assert!(matches!(err, Lwm2mError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_cancels_pending_requests() {
        let mut fixture = Fixture::new();
        let mut request = register_request(&[("ep", "dev"), ("lt", "60")], "</1/0>");
        fixture.handle(&mut request).unwrap();
        let location = location_of(&request)[1].clone();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let token = fixture.management.new_token();
        fixture.management.insert_pending(
            token,
            Pending {
                client_name: "dev".into(),
                path: Lwm2mPath::instance(1, 0),
                sink: ResponseSink::Status(Box::new(move |_, _, code| {
                    sink.lock().unwrap().push(code);
                })),
            },
        );

        let mut deregister = new_request(RequestType::Delete, &["rd", &location]);
        fixture.handle(&mut deregister).unwrap();

        assert_eq!(response_status(&deregister), ResponseType::Deleted);
        assert!(fixture.directory.clients().is_empty());
        assert_eq!(
            statuses.lock().unwrap().as_slice(),
            &[ResponseType::ServiceUnavailable]
        );
        assert_eq!(
            fixture.events.lock().unwrap()[1],
            ("dev".to_string(), RegistrationEvent::Unregister)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_cancels_pending_requests() {
        let mut fixture = Fixture::new();
        let mut request = register_request(&[("ep", "dev"), ("lt", "60")], "</1/0>");
        fixture.handle(&mut request).unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        let token = fixture.management.new_token();
        fixture.management.insert_pending(
            token,
            Pending {
                client_name: "dev".into(),
                path: Lwm2mPath::object(3),
                sink: ResponseSink::Status(Box::new(move |_, _, code| {
                    sink.lock().unwrap().push(code);
                })),
            },
        );

        time::advance(Duration::from_secs(60)).await;
        for info in fixture.directory.expire(Instant::now()) {
            fixture.management.cancel_client(&info);
        }

        assert!(fixture.directory.clients().is_empty());
        assert_eq!(
            statuses.lock().unwrap().as_slice(),
            &[ResponseType::ServiceUnavailable]
        );
        assert_eq!(
            fixture.events.lock().unwrap()[1],
            ("dev".to_string(), RegistrationEvent::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_interface_method_and_path_errors() {
        let mut fixture = Fixture::new();

        let mut wrong_method = new_request(RequestType::Get, &["rd"]);
        assert!(matches!(
            fixture.handle(&mut wrong_method).unwrap_err(),
            Lwm2mError::MethodNotAllowed
        ));

        let mut wrong_path = new_request(RequestType::Post, &["foo"]);
        assert!(matches!(
            fixture.handle(&mut wrong_path).unwrap_err(),
            Lwm2mError::NotFound
        ));
    }
}
