use std::sync::{Arc, OnceLock};

use crate::name::Name;
use crate::wire;

pub const DEFAULT_INTEREST_LIFETIME_MS: u64 = 4000;
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// A request for a named content object. Immutable once built; the
/// restriction setters consume and return the interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub name: Option<Name>,
    pub key_id_restriction: Option<Vec<u8>>,
    pub content_object_hash_restriction: Option<Vec<u8>>,
    pub lifetime_ms: u64,
    pub hop_limit: u8,
    pub payload: Vec<u8>,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name: Some(name),
            key_id_restriction: None,
            content_object_hash_restriction: None,
            lifetime_ms: DEFAULT_INTEREST_LIFETIME_MS,
            hop_limit: DEFAULT_HOP_LIMIT,
            payload: Vec::new(),
        }
    }

    /// A nameless interest, identified only by the hash of the object it
    /// requests.
    pub fn nameless<T: Into<Vec<u8>>>(content_object_hash: T) -> Self {
        Self {
            name: None,
            key_id_restriction: None,
            content_object_hash_restriction: Some(content_object_hash.into()),
            lifetime_ms: DEFAULT_INTEREST_LIFETIME_MS,
            hop_limit: DEFAULT_HOP_LIMIT,
            payload: Vec::new(),
        }
    }

    pub fn with_lifetime(mut self, lifetime_ms: u64) -> Self {
        self.lifetime_ms = lifetime_ms;
        self
    }

    pub fn with_hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    pub fn with_payload<T: Into<Vec<u8>>>(mut self, payload: T) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_key_id_restriction<T: Into<Vec<u8>>>(mut self, key_id: T) -> Self {
        self.key_id_restriction = Some(key_id.into());
        self
    }

    pub fn with_hash_restriction<T: Into<Vec<u8>>>(mut self, hash: T) -> Self {
        self.content_object_hash_restriction = Some(hash.into());
        self
    }
}

/// A named data payload. The content hash is computed lazily over the
/// encoded message body and then cached. Manifests travel as content
/// objects carrying the manifest header flag.
#[derive(Debug, Default)]
pub struct ContentObject {
    pub name: Option<Name>,
    pub key_id: Option<Vec<u8>>,
    pub expiry_ms: Option<u64>,
    pub cache_time_ms: Option<u64>,
    pub manifest: bool,
    pub payload: Vec<u8>,
    hash: OnceLock<Vec<u8>>,
}

impl ContentObject {
    pub fn new(name: Name) -> Self {
        Self { name: Some(name), ..Default::default() }
    }

    pub fn nameless() -> Self {
        Self::default()
    }

    pub fn with_payload<T: Into<Vec<u8>>>(mut self, payload: T) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_key_id<T: Into<Vec<u8>>>(mut self, key_id: T) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn with_expiry(mut self, expiry_ms: u64) -> Self {
        self.expiry_ms = Some(expiry_ms);
        self
    }

    pub fn with_cache_time(mut self, cache_time_ms: u64) -> Self {
        self.cache_time_ms = Some(cache_time_ms);
        self
    }

    pub fn as_manifest(mut self) -> Self {
        self.manifest = true;
        self
    }

    /// sha256 over the encoded message body, cached after first use.
    pub fn content_hash(&self) -> &[u8] {
        self.hash.get_or_init(|| wire::hash(&wire::encode_object_body(self)))
    }
}

impl Clone for ContentObject {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            key_id: self.key_id.clone(),
            expiry_ms: self.expiry_ms,
            cache_time_ms: self.cache_time_ms,
            manifest: self.manifest,
            payload: self.payload.clone(),
            hash: OnceLock::new(),
        }
    }
}

impl PartialEq for ContentObject {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.key_id == other.key_id
            && self.expiry_ms == other.expiry_ms
            && self.cache_time_ms == other.cache_time_ms
            && self.manifest == other.manifest
            && self.payload == other.payload
    }
}

impl Eq for ContentObject {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    NoRoute = 1,
    HopLimitExceeded = 2,
    Congestion = 3,
    MtuTooLarge = 4,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ReturnCode::NoRoute),
            2 => Some(ReturnCode::HopLimitExceeded),
            3 => Some(ReturnCode::Congestion),
            4 => Some(ReturnCode::MtuTooLarge),
            _ => None,
        }
    }
}

/// Explicit negative acknowledgment carrying the refused interest back
/// toward its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestReturn {
    pub interest: Interest,
    pub code: ReturnCode,
}

impl InterestReturn {
    pub fn new(interest: Interest, code: ReturnCode) -> Self {
        Self { interest, code }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CcnxMessage {
    Interest(Arc<Interest>),
    Object(Arc<ContentObject>),
    Return(Arc<InterestReturn>),
}

impl CcnxMessage {
    pub fn name(&self) -> Option<&Name> {
        match self {
            CcnxMessage::Interest(interest) => interest.name.as_ref(),
            CcnxMessage::Object(object) => object.name.as_ref(),
            CcnxMessage::Return(ret) => ret.interest.name.as_ref(),
        }
    }
}
