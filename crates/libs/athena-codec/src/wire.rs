use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::message::{CcnxMessage, ContentObject, Interest, InterestReturn, ReturnCode};
use crate::name::{Name, NameSegment};

pub const SCHEMA_VERSION: u8 = 1;

const HEADER_LENGTH: usize = 8;

const PT_INTEREST: u8 = 0x00;
const PT_OBJECT: u8 = 0x01;
const PT_RETURN: u8 = 0x02;

const T_NAME: u16 = 0x0000;
const T_KEYID_RESTRICTION: u16 = 0x0002;
const T_HASH_RESTRICTION: u16 = 0x0003;
const T_LIFETIME: u16 = 0x0004;
const T_PAYLOAD: u16 = 0x0005;
const T_KEYID: u16 = 0x0006;
const T_EXPIRY: u16 = 0x0007;
const T_CACHE_TIME: u16 = 0x0008;

const FLAG_MANIFEST: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    Framing,
    UnknownPacketType,
    BadName,
}

pub fn min_header_length() -> usize {
    HEADER_LENGTH
}

/// Total packet length declared by the fixed header.
pub fn packet_length(buffer: &[u8]) -> Result<usize, CodecError> {
    if buffer.len() < 4 {
        return Err(CodecError::Truncated);
    }
    let length = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    if length < HEADER_LENGTH {
        return Err(CodecError::Framing);
    }
    Ok(length)
}

pub fn get_schema_version(buffer: &[u8]) -> Result<u8, CodecError> {
    buffer.first().copied().ok_or(CodecError::Truncated)
}

pub fn hop_limit(buffer: &[u8]) -> Result<u8, CodecError> {
    buffer.get(4).copied().ok_or(CodecError::Truncated)
}

/// Patches the hop-limit byte in place; used by the link adapter before a
/// non-local send.
pub fn set_hop_limit(buffer: &mut [u8], hop_limit: u8) -> Result<(), CodecError> {
    let byte = buffer.get_mut(4).ok_or(CodecError::Truncated)?;
    *byte = hop_limit;
    Ok(())
}

/// sha256 over the encoded message body.
pub fn hash(body: &[u8]) -> Vec<u8> {
    Sha256::digest(body).to_vec()
}

pub fn encode(message: &CcnxMessage) -> Vec<u8> {
    let (packet_type, hop_limit, return_code, flags, body) = match message {
        CcnxMessage::Interest(interest) => {
            (PT_INTEREST, interest.hop_limit, 0, 0, encode_interest_body(interest))
        }
        CcnxMessage::Object(object) => {
            let flags = if object.manifest { FLAG_MANIFEST } else { 0 };
            (PT_OBJECT, 0, 0, flags, encode_object_body(object))
        }
        CcnxMessage::Return(ret) => (
            PT_RETURN,
            ret.interest.hop_limit,
            ret.code as u8,
            0,
            encode_interest_body(&ret.interest),
        ),
    };

    let mut out = Vec::with_capacity(HEADER_LENGTH + body.len());
    out.push(SCHEMA_VERSION);
    out.push(packet_type);
    out.extend_from_slice(&((HEADER_LENGTH + body.len()) as u16).to_be_bytes());
    out.push(hop_limit);
    out.push(return_code);
    out.push(flags);
    out.push(HEADER_LENGTH as u8);
    out.extend_from_slice(&body);
    out
}

pub fn decode(buffer: &[u8]) -> Result<CcnxMessage, CodecError> {
    if buffer.len() < HEADER_LENGTH {
        return Err(CodecError::Truncated);
    }

    let version = buffer[0];
    match version {
        SCHEMA_VERSION => {}
        0 => log::warn!("codec: accepting deprecated schema version 0 packet"),
        _ => return Err(CodecError::Framing),
    }

    let declared = packet_length(buffer)?;
    if declared > buffer.len() {
        return Err(CodecError::Truncated);
    }
    let header_length = buffer[7] as usize;
    if header_length < HEADER_LENGTH || header_length > declared {
        return Err(CodecError::Framing);
    }
    let body = &buffer[header_length..declared];

    match buffer[1] {
        PT_INTEREST => {
            let interest = decode_interest_body(body, buffer[4])?;
            Ok(CcnxMessage::Interest(Arc::new(interest)))
        }
        PT_OBJECT => {
            let mut object = decode_object_body(body)?;
            object.manifest = buffer[6] & FLAG_MANIFEST != 0;
            Ok(CcnxMessage::Object(Arc::new(object)))
        }
        PT_RETURN => {
            let interest = decode_interest_body(body, buffer[4])?;
            let code = ReturnCode::from_u8(buffer[5]).ok_or(CodecError::Framing)?;
            Ok(CcnxMessage::Return(Arc::new(InterestReturn::new(interest, code))))
        }
        _ => Err(CodecError::UnknownPacketType),
    }
}

fn encode_interest_body(interest: &Interest) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(name) = &interest.name {
        push_tlv(&mut out, T_NAME, &encode_name(name));
    }
    if let Some(key_id) = &interest.key_id_restriction {
        push_tlv(&mut out, T_KEYID_RESTRICTION, key_id);
    }
    if let Some(hash) = &interest.content_object_hash_restriction {
        push_tlv(&mut out, T_HASH_RESTRICTION, hash);
    }
    push_tlv(&mut out, T_LIFETIME, &interest.lifetime_ms.to_be_bytes());
    if !interest.payload.is_empty() {
        push_tlv(&mut out, T_PAYLOAD, &interest.payload);
    }
    out
}

pub fn encode_object_body(object: &ContentObject) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(name) = &object.name {
        push_tlv(&mut out, T_NAME, &encode_name(name));
    }
    if let Some(key_id) = &object.key_id {
        push_tlv(&mut out, T_KEYID, key_id);
    }
    if let Some(expiry) = object.expiry_ms {
        push_tlv(&mut out, T_EXPIRY, &expiry.to_be_bytes());
    }
    if let Some(cache_time) = object.cache_time_ms {
        push_tlv(&mut out, T_CACHE_TIME, &cache_time.to_be_bytes());
    }
    push_tlv(&mut out, T_PAYLOAD, &object.payload);
    out
}

fn decode_interest_body(body: &[u8], hop_limit: u8) -> Result<Interest, CodecError> {
    let mut name = None;
    let mut key_id_restriction = None;
    let mut content_object_hash_restriction = None;
    let mut lifetime_ms = crate::message::DEFAULT_INTEREST_LIFETIME_MS;
    let mut payload = Vec::new();

    let mut reader = TlvReader::new(body);
    while let Some((tlv_type, value)) = reader.next()? {
        match tlv_type {
            T_NAME => name = Some(decode_name(value)?),
            T_KEYID_RESTRICTION => key_id_restriction = Some(value.to_vec()),
            T_HASH_RESTRICTION => content_object_hash_restriction = Some(value.to_vec()),
            T_LIFETIME => lifetime_ms = decode_u64(value)?,
            T_PAYLOAD => payload = value.to_vec(),
            _ => {} // unrecognized body TLVs are skipped
        }
    }

    if name.is_none() && content_object_hash_restriction.is_none() {
        return Err(CodecError::Framing);
    }

    Ok(Interest {
        name,
        key_id_restriction,
        content_object_hash_restriction,
        lifetime_ms,
        hop_limit,
        payload,
    })
}

fn decode_object_body(body: &[u8]) -> Result<ContentObject, CodecError> {
    let mut object = ContentObject::nameless();

    let mut reader = TlvReader::new(body);
    while let Some((tlv_type, value)) = reader.next()? {
        match tlv_type {
            T_NAME => object.name = Some(decode_name(value)?),
            T_KEYID => object.key_id = Some(value.to_vec()),
            T_EXPIRY => object.expiry_ms = Some(decode_u64(value)?),
            T_CACHE_TIME => object.cache_time_ms = Some(decode_u64(value)?),
            T_PAYLOAD => object.payload = value.to_vec(),
            _ => {}
        }
    }

    Ok(object)
}

fn encode_name(name: &Name) -> Vec<u8> {
    let mut out = Vec::new();
    for segment in name.segments() {
        push_tlv(&mut out, segment.tag, &segment.value);
    }
    out
}

fn decode_name(value: &[u8]) -> Result<Name, CodecError> {
    let mut segments = Vec::new();
    let mut reader = TlvReader::new(value);
    while let Some((tag, segment)) = reader.next()? {
        segments.push(NameSegment::new(tag, segment));
    }
    Ok(Name::new(segments))
}

fn decode_u64(value: &[u8]) -> Result<u64, CodecError> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| CodecError::Framing)?;
    Ok(u64::from_be_bytes(bytes))
}

fn push_tlv(out: &mut Vec<u8>, tlv_type: u16, value: &[u8]) {
    out.extend_from_slice(&tlv_type.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

struct TlvReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> TlvReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    #[allow(clippy::should_implement_trait)]
    fn next(&mut self) -> Result<Option<(u16, &'a [u8])>, CodecError> {
        if self.offset == self.buffer.len() {
            return Ok(None);
        }
        if self.offset + 4 > self.buffer.len() {
            return Err(CodecError::Truncated);
        }
        let tlv_type = u16::from_be_bytes([self.buffer[self.offset], self.buffer[self.offset + 1]]);
        let length =
            u16::from_be_bytes([self.buffer[self.offset + 2], self.buffer[self.offset + 3]])
                as usize;
        let start = self.offset + 4;
        if start + length > self.buffer.len() {
            return Err(CodecError::Truncated);
        }
        self.offset = start + length;
        Ok(Some((tlv_type, &self.buffer[start..start + length])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: CcnxMessage) -> CcnxMessage {
        let wire = encode(&message);
        assert_eq!(packet_length(&wire).expect("length"), wire.len());
        decode(&wire).expect("decode")
    }

    #[test]
    fn interest_round_trip() {
        let interest = Interest::new(Name::from_uri("ccnx:/foo/bar").expect("name"))
            .with_lifetime(250)
            .with_hop_limit(3)
            .with_key_id_restriction(vec![0xaa; 32])
            .with_payload(b"args".to_vec());
        let decoded = round_trip(CcnxMessage::Interest(Arc::new(interest.clone())));
        match decoded {
            CcnxMessage::Interest(out) => assert_eq!(*out, interest),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn nameless_interest_round_trip() {
        let interest = Interest::nameless(vec![0x11; 32]);
        let decoded = round_trip(CcnxMessage::Interest(Arc::new(interest.clone())));
        match decoded {
            CcnxMessage::Interest(out) => {
                assert_eq!(out.name, None);
                assert_eq!(out.content_object_hash_restriction, Some(vec![0x11; 32]));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn object_round_trip() {
        let object = ContentObject::new(Name::from_uri("ccnx:/foo").expect("name"))
            .with_payload(b"hi".to_vec())
            .with_expiry(12345)
            .with_cache_time(999)
            .with_key_id(vec![0xbb; 8]);
        let decoded = round_trip(CcnxMessage::Object(Arc::new(object.clone())));
        match decoded {
            CcnxMessage::Object(out) => assert_eq!(*out, object),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn manifest_flag_round_trips() {
        let manifest = ContentObject::new(Name::from_uri("ccnx:/m").expect("name"))
            .with_payload(b"links")
            .as_manifest();
        let decoded = round_trip(CcnxMessage::Object(Arc::new(manifest)));
        match decoded {
            CcnxMessage::Object(out) => assert!(out.manifest),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn interest_return_round_trip() {
        let interest = Interest::new(Name::from_uri("ccnx:/z").expect("name"));
        let ret = InterestReturn::new(interest, ReturnCode::NoRoute);
        let decoded = round_trip(CcnxMessage::Return(Arc::new(ret.clone())));
        match decoded {
            CcnxMessage::Return(out) => assert_eq!(*out, ret),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn interest_without_name_or_hash_is_framing_error() {
        // Hand-build a lifetime-only interest body.
        let mut body = Vec::new();
        push_tlv(&mut body, T_LIFETIME, &4000u64.to_be_bytes());
        let mut wire = vec![SCHEMA_VERSION, PT_INTEREST, 0, 0, 64, 0, 0, 8];
        wire.extend_from_slice(&body);
        let length = wire.len() as u16;
        wire[2..4].copy_from_slice(&length.to_be_bytes());
        assert_eq!(decode(&wire), Err(CodecError::Framing));
    }

    #[test]
    fn hop_limit_patch_survives_decode() {
        let interest =
            Interest::new(Name::from_uri("ccnx:/foo").expect("name")).with_hop_limit(10);
        let mut wire = encode(&CcnxMessage::Interest(Arc::new(interest)));
        set_hop_limit(&mut wire, 9).expect("patch");
        match decode(&wire).expect("decode") {
            CcnxMessage::Interest(out) => assert_eq!(out.hop_limit, 9),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn content_hash_tracks_body() {
        let a = ContentObject::new(Name::from_uri("ccnx:/x").expect("name")).with_payload(b"a");
        let b = ContentObject::new(Name::from_uri("ccnx:/x").expect("name")).with_payload(b"b");
        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash(), a.clone().content_hash());
    }

    #[test]
    fn truncated_and_bad_length_packets_are_rejected() {
        let interest = Interest::new(Name::from_uri("ccnx:/foo").expect("name"));
        let wire = encode(&CcnxMessage::Interest(Arc::new(interest)));
        assert_eq!(decode(&wire[..wire.len() - 1]), Err(CodecError::Truncated));
        assert_eq!(decode(&wire[..4]), Err(CodecError::Truncated));

        let mut short = wire.clone();
        short[2..4].copy_from_slice(&3u16.to_be_bytes());
        assert_eq!(packet_length(&short), Err(CodecError::Framing));
    }

    #[test]
    fn version_zero_is_accepted() {
        let interest = Interest::new(Name::from_uri("ccnx:/foo").expect("name"));
        let mut wire = encode(&CcnxMessage::Interest(Arc::new(interest)));
        wire[0] = 0;
        assert!(decode(&wire).is_ok());
        wire[0] = 7;
        assert_eq!(decode(&wire), Err(CodecError::Framing));
    }
}
