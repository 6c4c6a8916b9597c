//! CoRE Link Format payloads of the registration interface.
//!
//! A register (or full update) body lists every advertised object instance as
//! `</O/I>`, instance-less objects as `</O>`, and, when the client uses an
//! alternate objects path, a root link `</path>;rt="oma.lwm2m"` with every
//! entry prefixed by that path.

use coap_lite::link_format::LinkFormatWrite;

use crate::error::Lwm2mError;

const OMA_ROOT_RESOURCE_TYPE: &str = "oma.lwm2m";

/// One advertised entry of the object tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkEntry {
    pub object_id: u16,
    pub instance_id: Option<u16>,
}

/// Parsed registration body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegistrationLinks {
    pub objects_path: Option<String>,
    pub entries: Vec<LinkEntry>,
}

pub(crate) fn write_registration_payload(
    objects_path: Option<&str>,
    entries: &[LinkEntry],
) -> String {
    let mut out = String::new();
    let mut write = LinkFormatWrite::new(&mut out);
    // Writing into a String cannot fail, hence the unwraps below.
    if let Some(path) = objects_path {
        write
            .link(&format!("/{path}"))
            .attr_quoted("rt", OMA_ROOT_RESOURCE_TYPE)
            .finish()
            .unwrap();
    }
    for entry in entries {
        let mut target = String::new();
        if let Some(path) = objects_path {
            target.push('/');
            target.push_str(path);
        }
        target.push_str(&format!("/{}", entry.object_id));
        if let Some(instance_id) = entry.instance_id {
            target.push_str(&format!("/{instance_id}"));
        }
        write.link(&target).finish().unwrap();
    }
    write.finish().unwrap();
    out
}

/// Parses the subset of link format the registration interface accepts.
/// Unknown attributes are tolerated and ignored.
pub(crate) fn parse_registration_links(body: &str) -> Result<RegistrationLinks, Lwm2mError> {
    let mut objects_path = None;
    let mut targets = Vec::new();

    for item in body.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let rest = item
            .strip_prefix('<')
            .ok_or_else(|| Lwm2mError::bad_request("link does not start with '<'"))?;
        let (target, attributes) = rest
            .split_once('>')
            .ok_or_else(|| Lwm2mError::bad_request("unterminated link target"))?;
        if attributes
            .split(';')
            .any(|attr| attr.trim() == format!("rt=\"{OMA_ROOT_RESOURCE_TYPE}\""))
        {
            objects_path = Some(target.trim_matches('/').to_string());
        } else {
            targets.push(target.to_string());
        }
    }

    let mut entries = Vec::new();
    for target in targets {
        let mut segments: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
        if let Some(prefix) = objects_path.as_deref() {
            let prefix_segments: Vec<&str> =
                prefix.split('/').filter(|s| !s.is_empty()).collect();
            if segments.starts_with(&prefix_segments) {
                segments.drain(..prefix_segments.len());
            }
        }
        let entry = match segments.as_slice() {
            [object] => LinkEntry {
                object_id: parse_id(object)?,
                instance_id: None,
            },
            [object, instance] => LinkEntry {
                object_id: parse_id(object)?,
                instance_id: Some(parse_id(instance)?),
            },
            _ => {
                return Err(Lwm2mError::bad_request(format!(
                    "link target <{target}> is not </O> or </O/I>"
                )))
            }
        };
        entries.push(entry);
    }

    Ok(RegistrationLinks {
        objects_path,
        entries,
    })
}

fn parse_id(segment: &str) -> Result<u16, Lwm2mError> {
    segment
        .parse::<u16>()
        .map_err(|_| Lwm2mError::bad_request(format!("bad link segment '{segment}'")))
}
