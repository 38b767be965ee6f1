use crate::error::{AthenaError, Result};

/// Fragment header: magic, begin/end flags, and a big-endian fragment
/// number. The magic byte keeps fragments distinguishable from bare TLV
/// packets, whose first byte is a schema version.
pub const FRAGMENT_HEADER_LENGTH: usize = 4;

const FRAGMENT_MAGIC: u8 = 0xBE;
const FLAG_BEGIN: u8 = 0x40;
const FLAG_END: u8 = 0x20;

/// Per-link MTU splitter and in-order reassembler. Reassembly restarts on
/// any gap; out-of-order delivery drops the partial assembly.
pub trait Fragmenter: Send {
    /// Splits `wire` into ordered fragments when it exceeds the MTU;
    /// otherwise returns the buffer untouched as a single element.
    fn split(&self, wire: Vec<u8>) -> Vec<Vec<u8>>;

    /// Feeds one received buffer. Returns the complete packet when
    /// reassembly finishes, the buffer itself when it was never a fragment,
    /// or `None` while more fragments are pending.
    fn receive(&mut self, buffer: Vec<u8>) -> Option<Vec<u8>>;
}

pub fn create_fragmenter(name: &str, mtu: usize) -> Result<Box<dyn Fragmenter>> {
    if mtu <= FRAGMENT_HEADER_LENGTH {
        return Err(AthenaError::Invalid(format!("mtu too small for fragmentation: {}", mtu)));
    }
    match name {
        _ if name.eq_ignore_ascii_case("BEFS") => Ok(Box::new(Befs::new(mtu))),
        _ => Err(AthenaError::Invalid(format!("unknown fragmenter: {}", name))),
    }
}

/// Begin/End flagged sequential fragmentation.
pub struct Befs {
    mtu: usize,
    assembly: Vec<u8>,
    next_fragment: u16,
    active: bool,
}

impl Befs {
    pub fn new(mtu: usize) -> Self {
        Self { mtu, assembly: Vec::new(), next_fragment: 0, active: false }
    }

    fn reset(&mut self) {
        self.assembly.clear();
        self.next_fragment = 0;
        self.active = false;
    }
}

impl Fragmenter for Befs {
    fn split(&self, wire: Vec<u8>) -> Vec<Vec<u8>> {
        if wire.len() + FRAGMENT_HEADER_LENGTH <= self.mtu {
            return vec![wire];
        }

        let payload_per_fragment = self.mtu - FRAGMENT_HEADER_LENGTH;
        let count = wire.len().div_ceil(payload_per_fragment);
        let mut fragments = Vec::with_capacity(count);
        for (number, chunk) in wire.chunks(payload_per_fragment).enumerate() {
            let mut flags = 0;
            if number == 0 {
                flags |= FLAG_BEGIN;
            }
            if number == count - 1 {
                flags |= FLAG_END;
            }
            let mut fragment = Vec::with_capacity(FRAGMENT_HEADER_LENGTH + chunk.len());
            fragment.push(FRAGMENT_MAGIC);
            fragment.push(flags);
            fragment.extend_from_slice(&(number as u16).to_be_bytes());
            fragment.extend_from_slice(chunk);
            fragments.push(fragment);
        }
        fragments
    }

    fn receive(&mut self, buffer: Vec<u8>) -> Option<Vec<u8>> {
        if buffer.first() != Some(&FRAGMENT_MAGIC) {
            return Some(buffer);
        }
        if buffer.len() < FRAGMENT_HEADER_LENGTH {
            self.reset();
            return None;
        }

        let flags = buffer[1];
        let number = u16::from_be_bytes([buffer[2], buffer[3]]);
        let payload = &buffer[FRAGMENT_HEADER_LENGTH..];

        if flags & FLAG_BEGIN != 0 && number == 0 {
            self.reset();
            self.active = true;
        } else if !self.active || number != self.next_fragment {
            // Gap: drop the partial assembly and wait for the next begin.
            self.reset();
            return None;
        }

        self.assembly.extend_from_slice(payload);
        self.next_fragment = number + 1;

        if flags & FLAG_END != 0 {
            let complete = std::mem::take(&mut self.assembly);
            self.reset();
            return Some(complete);
        }
        None
    }
}
