//! Routing of inbound management requests to object handlers.
//!
//! Maps method + path to the §operation table of the management interface:
//! GET reads (with Observe install/remove), PUT writes, POST creates at
//! object level and executes at resource level, DELETE removes instances.
//! Errors never escape unanswered; the caller converts them to a CoAP
//! response code.

use std::fmt::Debug;
use std::hash::Hash;

use coap_lite::{CoapOption, CoapRequest, ObserveOption, RequestType, ResponseType};
use log::debug;

use crate::client::object::{CreatePayload, ObjectEntry, ObjectRegistry, Operation};
use crate::client::observe::ObserveTable;
use crate::error::Lwm2mError;
use crate::path::Lwm2mPath;
use crate::resource::{Resource, ResourceKind, Value};
use crate::tlv;
use crate::types::{content_format_of, set_content_format, ContentType};

/// Handles one inbound request, filling in the prepared response.  Returns
/// the paths whose values changed so the caller can fan out notifications.
pub(crate) fn handle_request<U: 'static, Endpoint>(
    registry: &mut ObjectRegistry<U>,
    user: &mut U,
    observations: &mut ObserveTable<Endpoint>,
    objects_path: Option<&str>,
    request: &mut CoapRequest<Endpoint>,
) -> Result<Vec<Lwm2mPath>, Lwm2mError>
where
    Endpoint: Debug + Clone + Eq + Hash,
{
    let segments = request.get_path_as_vec().map_err(Lwm2mError::bad_request)?;
    let path = Lwm2mPath::from_segments_stripped(&segments, objects_path)?;
    let method = *request.get_method();
    debug!("dispatching {method:?} {path} from {:?}", request.source);

    match method {
        RequestType::Get => handle_read(registry, user, observations, path, request),
        RequestType::Put => handle_write(registry, user, path, request),
        RequestType::Post => match path.depth() {
            1 => handle_create(registry, user, path, request),
            3 => handle_execute(registry, user, path, request),
            _ => Err(Lwm2mError::MethodNotAllowed),
        },
        RequestType::Delete => handle_delete(registry, user, path, request),
        _ => Err(Lwm2mError::MethodNotAllowed),
    }
}

/// Produces the representation of a node the same way a GET would, shared by
/// reads and observe notifications.
pub(crate) fn read_payload<U: 'static>(
    registry: &mut ObjectRegistry<U>,
    user: &mut U,
    path: &Lwm2mPath,
) -> Result<(ContentType, Vec<u8>), Lwm2mError> {
    let entry = registry.entry_mut(path.object_id())?;
    if !entry.descriptor.capabilities.supports(Operation::Read) {
        return Err(Lwm2mError::MethodNotAllowed);
    }
    match (path.instance_id(), path.resource_id()) {
        (None, _) => {
            let instances: Vec<u16> = entry.instances.iter().copied().collect();
            let mut out = Vec::new();
            for instance_id in instances {
                let resources = read_instance(entry, user, instance_id);
                tlv::encode_instance(instance_id, &resources, &mut out)?;
            }
            Ok((ContentType::Tlv, out))
        }
        (Some(instance_id), None) => {
            if !entry.instances.contains(&instance_id) {
                return Err(Lwm2mError::NotFound);
            }
            let resources = read_instance(entry, user, instance_id);
            let mut out = Vec::new();
            tlv::encode_resources(&resources, &mut out)?;
            Ok((ContentType::Tlv, out))
        }
        (Some(instance_id), Some(resource_id)) => {
            if !entry.instances.contains(&instance_id) {
                return Err(Lwm2mError::NotFound);
            }
            let resource = entry.handler.read(user, instance_id, resource_id)?;
            single_resource_payload(&resource)
        }
    }
}

/// Reads every declared resource of one instance.  Failing sub-reads are
/// elided; the remainder proceeds.
fn read_instance<U: 'static>(
    entry: &mut ObjectEntry<U>,
    user: &mut U,
    instance_id: u16,
) -> Vec<Resource> {
    let mut resources = Vec::new();
    for resource_id in 0..entry.descriptor.resource_count {
        match entry.handler.read(user, instance_id, resource_id) {
            Ok(resource) => resources.push(resource),
            Err(Lwm2mError::NotFound) => {}
            Err(e) => {
                debug!(
                    "eliding resource /{}/{instance_id}/{resource_id} from read: {e}",
                    entry.descriptor.id
                );
            }
        }
    }
    resources
}

/// A single resource follows its type on the wire: numeric types as their
/// text representation, strings as text, opaques as opaque.  Multiple
/// resources and object links only have a TLV form.
fn single_resource_payload(resource: &Resource) -> Result<(ContentType, Vec<u8>), Lwm2mError> {
    if resource.kind() == ResourceKind::Multiple {
        let mut out = Vec::new();
        tlv::encode_resource(resource, &mut out)?;
        return Ok((ContentType::Tlv, out));
    }
    Ok(match resource.value() {
        Value::String(bytes) => (ContentType::Text, bytes.to_vec()),
        Value::Opaque(bytes) => (ContentType::Opaque, bytes.to_vec()),
        Value::Int(v) | Value::Time(v) => (ContentType::Text, v.to_string().into_bytes()),
        Value::Float(v) => (ContentType::Text, v.to_string().into_bytes()),
        Value::Bool(v) => (ContentType::Text, vec![if *v { b'1' } else { b'0' }]),
        Value::ObjLink(_, _) => {
            let mut out = Vec::new();
            tlv::encode_resource(resource, &mut out)?;
            (ContentType::Tlv, out)
        }
    })
}

fn handle_read<U: 'static, Endpoint>(
    registry: &mut ObjectRegistry<U>,
    user: &mut U,
    observations: &mut ObserveTable<Endpoint>,
    path: Lwm2mPath,
    request: &mut CoapRequest<Endpoint>,
) -> Result<Vec<Lwm2mPath>, Lwm2mError>
where
    Endpoint: Debug + Clone + Eq + Hash,
{
    let observe = match request.get_observe_flag() {
        None => None,
        Some(flag) => Some(flag.map_err(Lwm2mError::bad_request)?),
    };
    let (content_type, payload) = read_payload(registry, user, &path)?;

    let token = request.message.get_token().to_vec();
    let peer = request
        .source
        .clone()
        .ok_or_else(|| Lwm2mError::internal("request without a source"))?;
    let response = request
        .response
        .as_mut()
        .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;

    match observe {
        Some(ObserveOption::Register) => {
            let seq = observations.install(peer, path, token);
            response.message.set_observe_value(seq);
        }
        Some(ObserveOption::Deregister) => {
            observations.remove(&path, &token);
        }
        None => {}
    }

    response.set_status(ResponseType::Content);
    set_content_format(&mut response.message, content_type);
    response.message.payload = payload;
    Ok(Vec::new())
}

fn request_content_type<Endpoint>(
    request: &CoapRequest<Endpoint>,
) -> Result<ContentType, Lwm2mError> {
    match content_format_of(&request.message) {
        // An absent Content-Format means plain text per CoAP defaults.
        None => Ok(ContentType::Text),
        Some(value) => match ContentType::from_wire(value) {
            Some(ContentType::Json) | None => Err(Lwm2mError::UnsupportedContentFormat),
            Some(other) => Ok(other),
        },
    }
}

fn handle_write<U: 'static, Endpoint>(
    registry: &mut ObjectRegistry<U>,
    user: &mut U,
    path: Lwm2mPath,
    request: &mut CoapRequest<Endpoint>,
) -> Result<Vec<Lwm2mPath>, Lwm2mError> {
    let instance_id = path.instance_id().ok_or(Lwm2mError::MethodNotAllowed)?;
    let content_type = request_content_type(request)?;
    let entry = registry.entry_mut(path.object_id())?;
    if !entry.instances.contains(&instance_id) {
        return Err(Lwm2mError::NotFound);
    }
    let capabilities = entry.descriptor.capabilities;

    match content_type {
        ContentType::Tlv => {
            if !capabilities.supports(Operation::WriteTlv) {
                return Err(Lwm2mError::MethodNotAllowed);
            }
            let records = tlv::parse(&request.message.payload)?;
            entry.handler.write_tlv(user, instance_id, &records)?;
        }
        ContentType::Text | ContentType::Opaque => {
            if !capabilities.supports(Operation::WriteResource) {
                return Err(Lwm2mError::MethodNotAllowed);
            }
            let resource_id = path
                .resource_id()
                .ok_or_else(|| Lwm2mError::bad_request("text/opaque write needs /O/I/R"))?;
            let value = match content_type {
                ContentType::Text => Value::String(request.message.payload.clone().into()),
                _ => Value::Opaque(request.message.payload.clone().into()),
            };
            let resource = Resource::single(resource_id, value);
            entry.handler.write_resource(user, instance_id, &resource)?;
        }
        ContentType::Json => return Err(Lwm2mError::UnsupportedContentFormat),
    }

    let response = request
        .response
        .as_mut()
        .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;
    response.set_status(ResponseType::Changed);
    Ok(vec![path])
}

fn handle_create<U: 'static, Endpoint>(
    registry: &mut ObjectRegistry<U>,
    user: &mut U,
    path: Lwm2mPath,
    request: &mut CoapRequest<Endpoint>,
) -> Result<Vec<Lwm2mPath>, Lwm2mError> {
    let object_id = path.object_id();
    let content_type = request_content_type(request)?;
    let entry = registry.entry(object_id)?;
    if !entry.descriptor.capabilities.supports(Operation::Create) {
        return Err(Lwm2mError::MethodNotAllowed);
    }

    // A TLV body may wrap the initial content in an ObjectInstance container
    // carrying the instance id the server wants.
    let payload = request.message.payload.clone();
    let mut requested_id = None;
    let mut content: &[u8] = &payload;
    if content_type == ContentType::Tlv {
        let records = tlv::parse(&payload)?;
        if let [record] = records.as_slice() {
            if record.kind == tlv::TlvKind::ObjectInstance {
                requested_id = Some(record.id);
                content = record.content;
            }
        }
    }

    let instance_id = registry.add_instance(object_id, requested_id)?;
    let created = registry.entry_mut(object_id)?.handler.create(
        user,
        instance_id,
        &CreatePayload {
            content_type,
            content,
        },
    );
    if let Err(e) = created {
        let _ = registry.remove_instance(object_id, instance_id);
        return Err(e);
    }

    let response = request
        .response
        .as_mut()
        .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;
    response.set_status(ResponseType::Created);
    response
        .message
        .add_option(CoapOption::LocationPath, object_id.to_string().into_bytes());
    response
        .message
        .add_option(CoapOption::LocationPath, instance_id.to_string().into_bytes());
    Ok(vec![Lwm2mPath::instance(object_id, instance_id)])
}

fn handle_execute<U: 'static, Endpoint>(
    registry: &mut ObjectRegistry<U>,
    user: &mut U,
    path: Lwm2mPath,
    request: &mut CoapRequest<Endpoint>,
) -> Result<Vec<Lwm2mPath>, Lwm2mError> {
    let (instance_id, resource_id) = match (path.instance_id(), path.resource_id()) {
        (Some(i), Some(r)) => (i, r),
        _ => return Err(Lwm2mError::MethodNotAllowed),
    };
    let entry = registry.entry_mut(path.object_id())?;
    if !entry.descriptor.capabilities.supports(Operation::Execute) {
        return Err(Lwm2mError::MethodNotAllowed);
    }
    if !entry.instances.contains(&instance_id) {
        return Err(Lwm2mError::NotFound);
    }
    let args = std::str::from_utf8(&request.message.payload)
        .map_err(|e| Lwm2mError::bad_request(format!("execute arguments are not UTF-8: {e}")))?;
    entry.handler.execute(user, instance_id, resource_id, args)?;

    let response = request
        .response
        .as_mut()
        .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;
    response.set_status(ResponseType::Changed);
    Ok(Vec::new())
}

fn handle_delete<U: 'static, Endpoint>(
    registry: &mut ObjectRegistry<U>,
    user: &mut U,
    path: Lwm2mPath,
    request: &mut CoapRequest<Endpoint>,
) -> Result<Vec<Lwm2mPath>, Lwm2mError> {
    let instance_id = match (path.instance_id(), path.resource_id()) {
        (Some(i), None) => i,
        _ => return Err(Lwm2mError::MethodNotAllowed),
    };
    let entry = registry.entry_mut(path.object_id())?;
    if !entry.descriptor.capabilities.supports(Operation::Delete) {
        return Err(Lwm2mError::MethodNotAllowed);
    }
    if !entry.instances.contains(&instance_id) {
        return Err(Lwm2mError::NotFound);
    }
    entry.handler.delete(user, instance_id)?;
    registry.remove_instance(path.object_id(), instance_id)?;

    let response = request
        .response
        .as_mut()
        .ok_or_else(|| Lwm2mError::internal("request without a response slot"))?;
    response.set_status(ResponseType::Deleted);
    Ok(vec![path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::object::{Capabilities, ObjectDescriptor, ObjectHandler};
    use coap_lite::{MessageClass, MessageType, Packet};
    use std::collections::BTreeMap;

    type TestEndpoint = i32;

    /// Server-object-shaped test double: resource 0 is a string, resource 1
    /// an integer, resource 2 deliberately absent.
    struct TestObject {
        values: BTreeMap<u16, i64>,
        executed: Vec<(u16, String)>,
    }

    impl TestObject {
        fn new() -> Self {
            Self {
                values: BTreeMap::new(),
                executed: Vec::new(),
            }
        }
    }

    impl ObjectHandler<u32> for TestObject {
        fn create(
            &mut self,
            _user: &mut u32,
            instance_id: u16,
            _payload: &CreatePayload<'_>,
        ) -> Result<(), Lwm2mError> {
            self.values.insert(instance_id, 0);
            Ok(())
        }

        fn read(
            &mut self,
            _user: &mut u32,
            instance_id: u16,
            resource_id: u16,
        ) -> Result<Resource, Lwm2mError> {
            match resource_id {
                0 => Ok(Resource::single(0, Value::string("dev"))),
                1 => {
                    let value = self.values.get(&instance_id).copied().unwrap_or(42);
                    Ok(Resource::single(1, Value::Int(value)))
                }
                _ => Err(Lwm2mError::NotFound),
            }
        }

        fn write_tlv(
            &mut self,
            user: &mut u32,
            instance_id: u16,
            records: &[tlv::Tlv<'_>],
        ) -> Result<(), Lwm2mError> {
            for record in records {
                if record.id == 1 {
                    self.values.insert(instance_id, record.as_int()?);
                    *user += 1;
                }
            }
            Ok(())
        }

        fn write_resource(
            &mut self,
            _user: &mut u32,
            instance_id: u16,
            resource: &Resource,
        ) -> Result<(), Lwm2mError> {
            if let Value::String(bytes) = resource.value() {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| Lwm2mError::bad_request(e.to_string()))?;
                let value = text
                    .parse::<i64>()
                    .map_err(|e| Lwm2mError::bad_request(e.to_string()))?;
                self.values.insert(instance_id, value);
            }
            Ok(())
        }

        fn execute(
            &mut self,
            _user: &mut u32,
            instance_id: u16,
            _resource_id: u16,
            args: &str,
        ) -> Result<(), Lwm2mError> {
            self.executed.push((instance_id, args.to_string()));
            Ok(())
        }

        fn delete(&mut self, _user: &mut u32, instance_id: u16) -> Result<(), Lwm2mError> {
            self.values.remove(&instance_id);
            Ok(())
        }
    }

    fn full_caps() -> Capabilities {
        Capabilities::new()
            .with(Operation::Create)
            .with(Operation::Read)
            .with(Operation::WriteResource)
            .with(Operation::WriteTlv)
            .with(Operation::Execute)
            .with(Operation::Delete)
    }

    fn registry(capabilities: Capabilities) -> ObjectRegistry<u32> {
        let mut registry = ObjectRegistry::new();
        registry
            .insert(
                ObjectDescriptor::new(1, 3, capabilities),
                Box::new(TestObject::new()),
            )
            .unwrap();
        registry.add_instance(1, Some(0)).unwrap();
        registry
    }

    fn request(
        method: RequestType,
        path: &str,
        content_type: Option<ContentType>,
        payload: Vec<u8>,
    ) -> CoapRequest<TestEndpoint> {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(method);
        packet.header.set_type(MessageType::Confirmable);
        packet.header.message_id = 7;
        packet.set_token(b"tok".to_vec());
        crate::types::set_uri_path(&mut packet, path.split('/').filter(|s| !s.is_empty()));
        if let Some(content_type) = content_type {
            set_content_format(&mut packet, content_type);
        }
        packet.payload = payload;
        CoapRequest::from_packet(packet, 9)
    }

    fn dispatch(
        registry: &mut ObjectRegistry<u32>,
        user: &mut u32,
        observations: &mut ObserveTable<TestEndpoint>,
        request: &mut CoapRequest<TestEndpoint>,
    ) -> Result<Vec<Lwm2mPath>, Lwm2mError> {
        handle_request(registry, user, observations, None, request)
    }

    fn response_status(request: &CoapRequest<TestEndpoint>) -> ResponseType {
        match request.response.as_ref().unwrap().message.header.code {
            MessageClass::Response(code) => code,
            other => panic!("not a response code: {other:?}"),
        }
    }

    #[test]
    fn test_single_resource_read_is_text() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Get, "/1/0/1", None, vec![]);
        dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();

        assert_eq!(response_status(&request), ResponseType::Content);
        let response = request.response.unwrap();
        assert_eq!(response.message.payload, b"42");
        assert_eq!(content_format_of(&response.message), Some(1541));
    }

    #[test]
    fn test_instance_read_fans_out_and_elides_missing() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Get, "/1/0", None, vec![]);
        dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();

        let response = request.response.unwrap();
        assert_eq!(content_format_of(&response.message), Some(1542));
        let records = tlv::parse(&response.message.payload).unwrap();
        // Resource 2 answered NotFound and is elided.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 0);
        assert_eq!(records[0].bytes(), b"dev");
        assert_eq!(records[1].as_int().unwrap(), 42);
    }

    #[test]
    fn test_object_read_wraps_instances() {
        let mut registry = registry(full_caps());
        registry.add_instance(1, Some(4)).unwrap();
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Get, "/1", None, vec![]);
        dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();

        let response = request.response.unwrap();
        let records = tlv::parse(&response.message.payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, tlv::TlvKind::ObjectInstance);
        assert_eq!(records[0].id, 0);
        assert_eq!(records[1].id, 4);
        assert_eq!(records[0].children().unwrap().len(), 2);
    }

    #[test]
    fn test_read_unknown_instance_is_not_found() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Get, "/1/9", None, vec![]);
        let err = dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap_err();
        assert!(matches!(err, Lwm2mError::NotFound));
    }

    #[test]
    fn test_observe_register_and_deregister() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();

        let mut install = request(RequestType::Get, "/1/0/1", None, vec![]);
        install.message.set_observe_value(0);
        let mut install = CoapRequest::from_packet(install.message, 9);
        dispatch(&mut registry, &mut 0, &mut observations, &mut install).unwrap();
        assert_eq!(observations.len(), 1);
        let response = install.response.unwrap();
        assert_eq!(response.message.get_observe_value().unwrap().unwrap(), 0);

        let mut remove = request(RequestType::Get, "/1/0/1", None, vec![]);
        remove.message.set_observe_value(1);
        let mut remove = CoapRequest::from_packet(remove.message, 9);
        dispatch(&mut registry, &mut 0, &mut observations, &mut remove).unwrap();
        assert_eq!(observations.len(), 0);
    }

    #[test]
    fn test_write_tlv_reaches_handler() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut payload = Vec::new();
        tlv::encode_resource(&Resource::single(1, Value::Int(120)), &mut payload).unwrap();

        let mut user = 0;
        let mut request = request(
            RequestType::Put,
            "/1/0/1",
            Some(ContentType::Tlv),
            payload,
        );
        let changed =
            dispatch(&mut registry, &mut user, &mut observations, &mut request).unwrap();

        assert_eq!(response_status(&request), ResponseType::Changed);
        assert_eq!(changed, vec![Lwm2mPath::resource(1, 0, 1)]);
        assert_eq!(user, 1);

        // The written value is visible through a follow-up read.
        let mut read = self::request(RequestType::Get, "/1/0/1", None, vec![]);
        dispatch(&mut registry, &mut user, &mut observations, &mut read).unwrap();
        assert_eq!(read.response.unwrap().message.payload, b"120");
    }

    #[test]
    fn test_write_text_reaches_write_resource() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(
            RequestType::Put,
            "/1/0/1",
            Some(ContentType::Text),
            b"77".to_vec(),
        );
        dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();
        assert_eq!(response_status(&request), ResponseType::Changed);

        let mut read = self::request(RequestType::Get, "/1/0/1", None, vec![]);
        dispatch(&mut registry, &mut 0, &mut observations, &mut read).unwrap();
        assert_eq!(read.response.unwrap().message.payload, b"77");
    }

    #[test]
    fn test_json_write_is_unsupported() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(
            RequestType::Put,
            "/1/0/1",
            Some(ContentType::Json),
            b"{}".to_vec(),
        );
        let err = dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap_err();
        assert!(matches!(err, Lwm2mError::UnsupportedContentFormat));
    }

    #[test]
    fn test_missing_capability_is_method_not_allowed() {
        let mut registry = registry(Capabilities::new().with(Operation::Read));
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Post, "/1/0/1", None, vec![]);
        let err = dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap_err();
        assert!(matches!(err, Lwm2mError::MethodNotAllowed));
    }

    #[test]
    fn test_execute_passes_arguments() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Post, "/1/0/1", None, b"7,max=20".to_vec());
        dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();
        assert_eq!(response_status(&request), ResponseType::Changed);
    }

    #[test]
    fn test_create_allocates_and_reports_location() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut payload = Vec::new();
        tlv::encode_resource(&Resource::single(1, Value::Int(5)), &mut payload).unwrap();
        let mut request = request(RequestType::Post, "/1", Some(ContentType::Tlv), payload);
        let changed =
            dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();

        assert_eq!(response_status(&request), ResponseType::Created);
        assert_eq!(changed, vec![Lwm2mPath::instance(1, 1)]);
        assert!(registry.has_instance(1, 1));
        let response = request.response.unwrap();
        let location: Vec<Vec<u8>> = response
            .message
            .get_option(CoapOption::LocationPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(location, vec![b"1".to_vec(), b"1".to_vec()]);
    }

    #[test]
    fn test_create_honors_instance_container_id() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut payload = Vec::new();
        let resources = [Resource::single(1, Value::Int(5))];
        tlv::encode_instance(7, &resources, &mut payload).unwrap();

        let mut request = request(RequestType::Post, "/1", Some(ContentType::Tlv), payload);
        let changed =
            dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();
        assert_eq!(changed, vec![Lwm2mPath::instance(1, 7)]);
        assert!(registry.has_instance(1, 7));
    }

    #[test]
    fn test_delete_removes_instance() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Delete, "/1/0", None, vec![]);
        let changed =
            dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap();

        assert_eq!(response_status(&request), ResponseType::Deleted);
        assert_eq!(changed, vec![Lwm2mPath::instance(1, 0)]);
        assert!(!registry.has_instance(1, 0));
    }

    #[test]
    fn test_malformed_tlv_leaves_state_untouched() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(
            RequestType::Put,
            "/1/0",
            Some(ContentType::Tlv),
            vec![0xC8, 0x01],
        );
        let err = dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap_err();
        assert!(matches!(err, Lwm2mError::MalformedTlv(_)));

        let mut read = self::request(RequestType::Get, "/1/0/1", None, vec![]);
        dispatch(&mut registry, &mut 0, &mut observations, &mut read).unwrap();
        assert_eq!(read.response.unwrap().message.payload, b"42");
    }

    #[test]
    fn test_unknown_object_is_not_found() {
        let mut registry = registry(full_caps());
        let mut observations = ObserveTable::new();
        let mut request = request(RequestType::Get, "/9", None, vec![]);
        let err = dispatch(&mut registry, &mut 0, &mut observations, &mut request).unwrap_err();
        assert!(matches!(err, Lwm2mError::NotFound));
    }
}
