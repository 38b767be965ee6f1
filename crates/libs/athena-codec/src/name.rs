use core::fmt;

use crate::wire::CodecError;

/// Generic name segment type tag.
pub const SEGMENT_NAME: u16 = 0x0001;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameSegment {
    pub tag: u16,
    pub value: Vec<u8>,
}

impl NameSegment {
    pub fn new<T: Into<Vec<u8>>>(tag: u16, value: T) -> Self {
        Self { tag, value: value.into() }
    }

    pub fn name<T: Into<Vec<u8>>>(value: T) -> Self {
        Self::new(SEGMENT_NAME, value)
    }
}

/// An ordered sequence of typed segments. Names are immutable once built;
/// `append` returns a new name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Name {
    segments: Vec<NameSegment>,
}

impl Name {
    pub fn new(segments: Vec<NameSegment>) -> Self {
        Self { segments }
    }

    /// Parses `ccnx:/seg/seg` or `lci:/seg/seg`. Percent-escapes (`%XX`)
    /// are decoded inside segments. An empty path (`ccnx:/`) is the root name.
    pub fn from_uri(uri: &str) -> Result<Self, CodecError> {
        let rest = uri
            .strip_prefix("ccnx:")
            .or_else(|| uri.strip_prefix("lci:"))
            .ok_or(CodecError::BadName)?;
        let rest = rest.strip_prefix('/').ok_or(CodecError::BadName)?;

        let mut segments = Vec::new();
        if !rest.is_empty() {
            for part in rest.split('/') {
                segments.push(NameSegment::name(unescape(part)?));
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[NameSegment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> Option<&NameSegment> {
        self.segments.get(index)
    }

    /// UTF-8 view of a segment, if it is valid UTF-8.
    pub fn segment_str(&self, index: usize) -> Option<&str> {
        self.segments.get(index).and_then(|s| core::str::from_utf8(&s.value).ok())
    }

    /// True if `prefix` is a segment-wise prefix of this name.
    pub fn starts_with(&self, prefix: &Name) -> bool {
        prefix.segments.len() <= self.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    pub fn append(&self, segment: NameSegment) -> Name {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Name { segments }
    }

    /// First `count` segments as a new name.
    pub fn prefix(&self, count: usize) -> Name {
        Name { segments: self.segments[..count.min(self.segments.len())].to_vec() }
    }

    /// Flat byte rendering used to compose table keys: each segment as
    /// tag, length, value. Distinct names never collide because lengths
    /// delimit the values.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for segment in &self.segments {
            out.extend_from_slice(&segment.tag.to_be_bytes());
            out.extend_from_slice(&(segment.value.len() as u16).to_be_bytes());
            out.extend_from_slice(&segment.value);
        }
        out
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ccnx:/")?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            for &byte in &segment.value {
                if is_token_byte(byte) {
                    write!(f, "{}", byte as char)?;
                } else {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~' | b'=' | b':')
}

fn unescape(part: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = part.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return Err(CodecError::BadName);
            }
            let hi = hex_digit(bytes[i + 1]).ok_or(CodecError::BadName)?;
            let lo = hex_digit(bytes[i + 2]).ok_or(CodecError::BadName)?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let name = Name::from_uri("ccnx:/foo/bar/baz").expect("parse");
        assert_eq!(name.segment_count(), 3);
        assert_eq!(name.segment_str(1), Some("bar"));
        assert_eq!(name.to_string(), "ccnx:/foo/bar/baz");
    }

    #[test]
    fn lci_scheme_is_accepted() {
        let a = Name::from_uri("lci:/foo/bar").expect("parse");
        let b = Name::from_uri("ccnx:/foo/bar").expect("parse");
        assert_eq!(a, b);
    }

    #[test]
    fn root_name_is_empty() {
        let name = Name::from_uri("ccnx:/").expect("parse");
        assert_eq!(name.segment_count(), 0);
    }

    #[test]
    fn starts_with_is_segment_wise() {
        let name = Name::from_uri("ccnx:/foo/bar/baz").expect("parse");
        let prefix = Name::from_uri("ccnx:/foo/bar").expect("parse");
        let not_prefix = Name::from_uri("ccnx:/foo/ba").expect("parse");
        assert!(name.starts_with(&prefix));
        assert!(name.starts_with(&name));
        assert!(!name.starts_with(&not_prefix));
        assert!(!prefix.starts_with(&name));
    }

    #[test]
    fn escapes_round_trip() {
        let name = Name::from_uri("ccnx:/with%20space/%7e").expect("parse");
        assert_eq!(name.segment(0).map(|s| s.value.as_slice()), Some(b"with space".as_ref()));
        let reparsed = Name::from_uri(&name.to_string()).expect("reparse");
        assert_eq!(name, reparsed);
    }

    #[test]
    fn bad_escape_is_rejected() {
        assert!(Name::from_uri("ccnx:/foo%2").is_err());
        assert!(Name::from_uri("ccnx:/foo%zz").is_err());
        assert!(Name::from_uri("http://foo").is_err());
    }

    #[test]
    fn key_bytes_are_prefix_free() {
        let a = Name::from_uri("ccnx:/ab").expect("parse");
        let b = Name::from_uri("ccnx:/a/b").expect("parse");
        assert_ne!(a.key_bytes(), b.key_bytes());
    }
}
