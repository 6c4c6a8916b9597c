//! Routing of `/objectId[/instanceId[/resourceId]]` paths.

use std::fmt;

use crate::error::Lwm2mError;

/// An address in the object tree: object, object instance or resource level.
///
/// Construction enforces that nothing below a missing level is present, so a
/// value of this type is always one of `/O`, `/O/I` or `/O/I/R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lwm2mPath {
    object: u16,
    instance: Option<u16>,
    resource: Option<u16>,
}

impl Lwm2mPath {
    pub fn object(object: u16) -> Self {
        Self {
            object,
            instance: None,
            resource: None,
        }
    }

    pub fn instance(object: u16, instance: u16) -> Self {
        Self {
            object,
            instance: Some(instance),
            resource: None,
        }
    }

    pub fn resource(object: u16, instance: u16, resource: u16) -> Self {
        Self {
            object,
            instance: Some(instance),
            resource: Some(resource),
        }
    }

    /// Parses an absolute path.  Each segment is an unsigned decimal no
    /// greater than 65535; a trailing slash is ignored.
    pub fn parse(path: &str) -> Result<Self, Lwm2mError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        Self::from_segments(&segments)
    }

    /// Builds a path from already-split segments, stripping the advertised
    /// objects-path prefix first when one is configured.
    pub(crate) fn from_segments_stripped(
        segments: &[impl AsRef<str>],
        objects_path: Option<&str>,
    ) -> Result<Self, Lwm2mError> {
        let mut segments: Vec<&str> = segments.iter().map(AsRef::as_ref).collect();
        if let Some(prefix) = objects_path {
            for expected in prefix.split('/').filter(|s| !s.is_empty()) {
                match segments.first() {
                    Some(first) if *first == expected => {
                        segments.remove(0);
                    }
                    _ => {
                        return Err(Lwm2mError::bad_request(format!(
                            "path does not start with the objects path /{prefix}"
                        )))
                    }
                }
            }
        }
        Self::from_segments(&segments)
    }

    fn from_segments(segments: &[impl AsRef<str>]) -> Result<Self, Lwm2mError> {
        let mut ids = [None::<u16>; 3];
        if segments.is_empty() || segments.len() > ids.len() {
            return Err(Lwm2mError::bad_request("path must be /O, /O/I or /O/I/R"));
        }
        for (slot, segment) in ids.iter_mut().zip(segments) {
            let segment = segment.as_ref();
            let id = segment
                .parse::<u16>()
                .map_err(|_| Lwm2mError::bad_request(format!("bad path segment '{segment}'")))?;
            *slot = Some(id);
        }
        let object = ids[0].ok_or_else(|| Lwm2mError::bad_request("path must name an object"))?;
        Ok(Self {
            object,
            instance: ids[1],
            resource: ids[2],
        })
    }

    pub fn object_id(&self) -> u16 {
        self.object
    }

    pub fn instance_id(&self) -> Option<u16> {
        self.instance
    }

    pub fn resource_id(&self) -> Option<u16> {
        self.resource
    }

    /// Levels present: 1 for `/O`, 2 for `/O/I`, 3 for `/O/I/R`.
    pub fn depth(&self) -> usize {
        1 + usize::from(self.instance.is_some()) + usize::from(self.resource.is_some())
    }

    /// The parent of a resource path, or the path itself at instance and
    /// object level.
    pub(crate) fn instance_level(&self) -> Self {
        Self {
            object: self.object,
            instance: self.instance,
            resource: None,
        }
    }

    /// True when one path is equal to, an ancestor of, or a descendant of the
    /// other.  This is the overlap test used for observation fan-out: a
    /// change at `/3/0` touches an observation on `/3/0/13` and vice versa.
    pub fn covers(&self, other: &Self) -> bool {
        if self.object != other.object {
            return false;
        }
        match (self.instance, other.instance) {
            (Some(a), Some(b)) if a != b => return false,
            (None, _) | (_, None) => return true,
            _ => {}
        }
        match (self.resource, other.resource) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for Lwm2mPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.object)?;
        if let Some(instance) = self.instance {
            write!(f, "/{instance}")?;
        }
        if let Some(resource) = self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}
