//! User-supplied object implementations and the table that indexes them.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Lwm2mError;
use crate::link::LinkEntry;
use crate::resource::Resource;
use crate::tlv::Tlv;
use crate::types::ContentType;

/// The six management operations an object may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    WriteResource,
    WriteTlv,
    Execute,
    Delete,
}

impl Operation {
    fn bit(self) -> u8 {
        match self {
            Self::Create => 1 << 0,
            Self::Read => 1 << 1,
            Self::WriteResource => 1 << 2,
            Self::WriteTlv => 1 << 3,
            Self::Execute => 1 << 4,
            Self::Delete => 1 << 5,
        }
    }
}

/// The set of operations an object descriptor declares support for.  The
/// dispatcher consults this before calling into the handler, so an
/// unsupported operation deterministically becomes 4.05 Method Not Allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, operation: Operation) -> Self {
        self.0 |= operation.bit();
        self
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.0 & operation.bit() != 0
    }
}

/// Static description of one object implementation.
#[derive(Debug, Clone, Copy)]
pub struct ObjectDescriptor {
    pub id: u16,
    /// Number of resource ids the object declares; an instance-level read
    /// iterates ids `0..resource_count`.
    pub resource_count: u16,
    pub capabilities: Capabilities,
}

impl ObjectDescriptor {
    pub fn new(id: u16, resource_count: u16, capabilities: Capabilities) -> Self {
        Self {
            id,
            resource_count,
            capabilities,
        }
    }
}

/// Initial content handed to a Create operation, exactly as it arrived.
#[derive(Debug, Clone, Copy)]
pub struct CreatePayload<'a> {
    pub content_type: ContentType,
    pub content: &'a [u8],
}

/// Callbacks backing one object.  All methods run synchronously on the
/// client's event loop and receive the client-wide user state.  Per-instance
/// state is whatever the implementation keeps in its own fields, keyed by the
/// instance id it is called with; a Delete must release it.
///
/// The default bodies refuse the operation, matching a descriptor that does
/// not declare the corresponding capability.
#[allow(unused_variables)]
pub trait ObjectHandler<U>: Send + 'static {
    /// Creates a new object instance from its initial content.
    fn create(
        &mut self,
        user: &mut U,
        instance_id: u16,
        payload: &CreatePayload<'_>,
    ) -> Result<(), Lwm2mError> {
        Err(Lwm2mError::MethodNotAllowed)
    }

    /// Reads one resource.  Object- and instance-level reads call this once
    /// per declared resource id; returning [`Lwm2mError::NotFound`] elides
    /// the resource from the fan-out without failing it.
    fn read(
        &mut self,
        user: &mut U,
        instance_id: u16,
        resource_id: u16,
    ) -> Result<Resource, Lwm2mError> {
        Err(Lwm2mError::MethodNotAllowed)
    }

    /// Writes one resource delivered as text or opaque content.
    fn write_resource(
        &mut self,
        user: &mut U,
        instance_id: u16,
        resource: &Resource,
    ) -> Result<(), Lwm2mError> {
        Err(Lwm2mError::MethodNotAllowed)
    }

    /// Writes resources delivered as TLV.  The records carry no data type;
    /// the implementation knows which typed view to apply to each id.
    fn write_tlv(
        &mut self,
        user: &mut U,
        instance_id: u16,
        records: &[Tlv<'_>],
    ) -> Result<(), Lwm2mError> {
        Err(Lwm2mError::MethodNotAllowed)
    }

    /// Executes a resource with optional text arguments.
    fn execute(
        &mut self,
        user: &mut U,
        instance_id: u16,
        resource_id: u16,
        args: &str,
    ) -> Result<(), Lwm2mError> {
        Err(Lwm2mError::MethodNotAllowed)
    }

    /// Deletes an object instance and releases whatever state backs it.
    fn delete(&mut self, user: &mut U, instance_id: u16) -> Result<(), Lwm2mError> {
        Err(Lwm2mError::MethodNotAllowed)
    }
}

pub(crate) struct ObjectEntry<U> {
    pub descriptor: ObjectDescriptor,
    pub handler: Box<dyn ObjectHandler<U>>,
    pub instances: BTreeSet<u16>,
}

/// Table of all objects the client exposes, indexed by object id.  The
/// descriptor set is static after startup; the instance sets change through
/// [`ObjectRegistry::add_instance`] and server-driven Create/Delete.
pub(crate) struct ObjectRegistry<U> {
    objects: BTreeMap<u16, ObjectEntry<U>>,
    /// Bumped whenever the advertised tree changes; registration FSMs compare
    /// it against the version they last listed to a server.
    version: u64,
}

impl<U> ObjectRegistry<U> {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn insert(
        &mut self,
        descriptor: ObjectDescriptor,
        handler: Box<dyn ObjectHandler<U>>,
    ) -> Result<(), Lwm2mError> {
        if self.objects.contains_key(&descriptor.id) {
            return Err(Lwm2mError::bad_request(format!(
                "duplicate object id {}",
                descriptor.id
            )));
        }
        self.objects.insert(
            descriptor.id,
            ObjectEntry {
                descriptor,
                handler,
                instances: BTreeSet::new(),
            },
        );
        self.version += 1;
        Ok(())
    }

    pub fn entry_mut(&mut self, object_id: u16) -> Result<&mut ObjectEntry<U>, Lwm2mError> {
        self.objects.get_mut(&object_id).ok_or(Lwm2mError::NotFound)
    }

    pub fn entry(&self, object_id: u16) -> Result<&ObjectEntry<U>, Lwm2mError> {
        self.objects.get(&object_id).ok_or(Lwm2mError::NotFound)
    }

    /// Registers an instance slot, allocating the first free id when none is
    /// given.  Returns the id actually used.
    pub fn add_instance(
        &mut self,
        object_id: u16,
        instance_id: Option<u16>,
    ) -> Result<u16, Lwm2mError> {
        let entry = self.entry_mut(object_id)?;
        let instance_id = match instance_id {
            Some(id) => {
                if entry.instances.contains(&id) {
                    return Err(Lwm2mError::bad_request(format!(
                        "instance {object_id}/{id} already exists"
                    )));
                }
                id
            }
            None => (0..=u16::MAX)
                .find(|id| !entry.instances.contains(id))
                .ok_or_else(|| Lwm2mError::internal("object is out of instance ids"))?,
        };
        entry.instances.insert(instance_id);
        self.version += 1;
        Ok(instance_id)
    }

    pub fn remove_instance(&mut self, object_id: u16, instance_id: u16) -> Result<(), Lwm2mError> {
        let entry = self.entry_mut(object_id)?;
        if !entry.instances.remove(&instance_id) {
            return Err(Lwm2mError::NotFound);
        }
        self.version += 1;
        Ok(())
    }

    pub fn has_instance(&self, object_id: u16, instance_id: u16) -> bool {
        self.objects
            .get(&object_id)
            .map(|entry| entry.instances.contains(&instance_id))
            .unwrap_or(false)
    }

    pub fn instances_of(&self, object_id: u16) -> Vec<u16> {
        self.objects
            .get(&object_id)
            .map(|entry| entry.instances.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The advertised object tree for a registration payload: every instance
    /// as `</O/I>`, instance-less objects as `</O>`.
    pub fn link_entries(&self) -> Vec<LinkEntry> {
        let mut entries = Vec::new();
        for (object_id, entry) in &self.objects {
            if entry.instances.is_empty() {
                entries.push(LinkEntry {
                    object_id: *object_id,
                    instance_id: None,
                });
            } else {
                for instance_id in &entry.instances {
                    entries.push(LinkEntry {
                        object_id: *object_id,
                        instance_id: Some(*instance_id),
                    });
                }
            }
        }
        entries
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;
    impl ObjectHandler<()> for NullHandler {}

    fn registry_with(ids: &[u16]) -> ObjectRegistry<()> {
        let mut registry = ObjectRegistry::new();
        for id in ids {
            registry
                .insert(
                    ObjectDescriptor::new(*id, 1, Capabilities::new()),
                    Box::new(NullHandler),
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_capability_set() {
        let caps = Capabilities::new()
            .with(Operation::Read)
            .with(Operation::WriteTlv);
        assert!(caps.supports(Operation::Read));
        assert!(caps.supports(Operation::WriteTlv));
        assert!(!caps.supports(Operation::Create));
        assert!(!caps.supports(Operation::Execute));
        assert!(!Capabilities::default().supports(Operation::Read));
    }

    #[test]
    fn test_duplicate_object_refused() {
        let mut registry = registry_with(&[3]);
        let result = registry.insert(
            ObjectDescriptor::new(3, 1, Capabilities::new()),
            Box::new(NullHandler),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_instance_allocation() {
        let mut registry = registry_with(&[3]);
        assert_eq!(registry.add_instance(3, None).unwrap(), 0);
        assert_eq!(registry.add_instance(3, Some(5)).unwrap(), 5);
        assert_eq!(registry.add_instance(3, None).unwrap(), 1);
        assert!(registry.add_instance(3, Some(5)).is_err());
        assert!(registry.add_instance(4, None).is_err());
        assert!(registry.has_instance(3, 5));

        registry.remove_instance(3, 5).unwrap();
        assert!(!registry.has_instance(3, 5));
        assert!(registry.remove_instance(3, 5).is_err());
    }

    #[test]
    fn test_link_entries_cover_empty_objects() {
        let mut registry = registry_with(&[1, 3, 5]);
        registry.add_instance(1, Some(0)).unwrap();
        registry.add_instance(3, Some(0)).unwrap();
        registry.add_instance(3, Some(1)).unwrap();

        let entries = registry.link_entries();
        let rendered: Vec<(u16, Option<u16>)> = entries
            .iter()
            .map(|e| (e.object_id, e.instance_id))
            .collect();
        assert_eq!(
            rendered,
            vec![(1, Some(0)), (3, Some(0)), (3, Some(1)), (5, None)]
        );
    }

    #[test]
    fn test_version_tracks_advertised_set() {
        let mut registry = registry_with(&[3]);
        let after_insert = registry.version();
        registry.add_instance(3, None).unwrap();
        assert!(registry.version() > after_insert);
        let after_add = registry.version();
        registry.remove_instance(3, 0).unwrap();
        assert!(registry.version() > after_add);
    }
}
