//! Shared data model: subsystem, KV and event descriptors.
//!
//! Wire layouts (all via the segmented codec):
//!
//! ```text
//! SubsystemInfo   = seg([uuid:16, name_utf8, temporary:1, kv_list, events])
//! kv_list         = seg([KvDescriptor, …])
//! events          = seg([seg([provider_desc, …]), seg([handler_desc, …])])   (may be empty)
//! KvDescriptor    = seg([type, key, published:1, readable:1, writable:1])
//! EventDescriptor = seg([param_type, return_type, name])
//! ```

use anyhow::{anyhow, Context, Result};
use uuid::Uuid;

use crate::seg;
use crate::types::TypeSpecifier;

/// Metadata describing one KV slot on a subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvDescriptor {
    /// Declared value type.
    pub ty: TypeSpecifier,
    /// Key bytes.
    pub key: Vec<u8>,
    /// The owner originates updates; the broker caches and fans out.
    pub published: bool,
    /// Remote GET permitted.
    pub readable: bool,
    /// Remote SET permitted.
    pub writable: bool,
}

impl KvDescriptor {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        seg::encode(&[
            self.ty.encode_type(),
            self.key.clone(),
            vec![u8::from(self.published)],
            vec![u8::from(self.readable)],
            vec![u8::from(self.writable)],
        ])
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let [ty, key, published, readable, writable] =
            seg::decode_exact::<5>(data).context("KV descriptor")?;
        Ok(Self {
            ty: TypeSpecifier::decode_type(&ty)?,
            key,
            published: decode_flag(&published)?,
            readable: decode_flag(&readable)?,
            writable: decode_flag(&writable)?,
        })
    }
}

/// Metadata describing one event a subsystem provides or handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    /// Parameter type of the call.
    pub param_ty: TypeSpecifier,
    /// Return type of each per-target result.
    pub return_ty: TypeSpecifier,
    /// Event name bytes.
    pub name: Vec<u8>,
}

impl EventDescriptor {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        seg::encode(&[
            self.param_ty.encode_type(),
            self.return_ty.encode_type(),
            self.name.clone(),
        ])
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let [param, ret, name] = seg::decode_exact::<3>(data).context("event descriptor")?;
        Ok(Self {
            param_ty: TypeSpecifier::decode_type(&param)?,
            return_ty: TypeSpecifier::decode_type(&ret)?,
            name,
        })
    }
}

/// Identity and descriptor set of one registered subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemInfo {
    /// Stable 128-bit identity used in all wire addressing.
    pub uuid: Uuid,
    /// Human-readable name; not necessarily unique.
    pub name: String,
    /// Deleted from the registry when the owning client disconnects.
    pub temporary: bool,
    /// Declared KV slots.
    pub kvs: Vec<KvDescriptor>,
    /// Events this subsystem can call.
    pub provided_events: Vec<EventDescriptor>,
    /// Events this subsystem implements.
    pub handled_events: Vec<EventDescriptor>,
}

impl SubsystemInfo {
    /// A bare subsystem with no descriptors.
    pub fn new(uuid: Uuid, name: impl Into<String>, temporary: bool) -> Self {
        Self {
            uuid,
            name: name.into(),
            temporary,
            kvs: Vec::new(),
            provided_events: Vec::new(),
            handled_events: Vec::new(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let kv_blob = seg::encode(
            &self.kvs.iter().map(KvDescriptor::encode).collect::<Result<Vec<_>>>()?,
        )?;
        let events_blob = if self.provided_events.is_empty() && self.handled_events.is_empty() {
            Vec::new()
        } else {
            let providers = seg::encode(
                &self
                    .provided_events
                    .iter()
                    .map(EventDescriptor::encode)
                    .collect::<Result<Vec<_>>>()?,
            )?;
            let handlers = seg::encode(
                &self
                    .handled_events
                    .iter()
                    .map(EventDescriptor::encode)
                    .collect::<Result<Vec<_>>>()?,
            )?;
            seg::encode(&[providers, handlers])?
        };
        seg::encode(&[
            self.uuid.as_bytes().to_vec(),
            self.name.as_bytes().to_vec(),
            vec![u8::from(self.temporary)],
            kv_blob,
            events_blob,
        ])
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let [uuid, name, temporary, kv_blob, events_blob] =
            seg::decode_exact::<5>(data).context("subsystem info")?;
        let kvs = seg::decode(&kv_blob)?
            .iter()
            .map(|d| KvDescriptor::decode(d))
            .collect::<Result<Vec<_>>>()?;
        let (provided_events, handled_events) = if events_blob.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let [providers, handlers] =
                seg::decode_exact::<2>(&events_blob).context("events blob")?;
            (
                seg::decode(&providers)?
                    .iter()
                    .map(|d| EventDescriptor::decode(d))
                    .collect::<Result<Vec<_>>>()?,
                seg::decode(&handlers)?
                    .iter()
                    .map(|d| EventDescriptor::decode(d))
                    .collect::<Result<Vec<_>>>()?,
            )
        };
        Ok(Self {
            uuid: decode_uuid(&uuid)?,
            name: String::from_utf8(name).context("subsystem name is not UTF-8")?,
            temporary: decode_flag(&temporary)?,
            kvs,
            provided_events,
            handled_events,
        })
    }
}

/// Decode a 16-byte UUID field.
pub fn decode_uuid(data: &[u8]) -> Result<Uuid> {
    let raw: [u8; 16] = data
        .try_into()
        .map_err(|_| anyhow!("UUID field must be 16 bytes, got {}", data.len()))?;
    Ok(Uuid::from_bytes(raw))
}

fn decode_flag(data: &[u8]) -> Result<bool> {
    match data {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(anyhow!("flag field must be a single 0/1 byte")),
    }
}
