// PM4 command-stream decoding: the type-3 packet header format and the
// opcode dispatch table the graphics/compute rings walk.
//
// Austin Shafer - 2024
use crate::error::{GpuError, GpuResult};

/// Bits [30:31] of a PM4 dword identify the packet type; only type-3
/// (the general command form) and type-0 (register writes with an
/// implicit base) show up in a retail command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Type0,
    Type2,
    Type3,
}

fn packet_type(header: u32) -> PacketType {
    match (header >> 30) & 0x3 {
        0 => PacketType::Type0,
        2 => PacketType::Type2,
        _ => PacketType::Type3,
    }
}

/// A decoded type-3 packet: opcode plus the `count` dwords following
/// the header, not including the header itself.
pub struct Packet3<'a> {
    pub opcode: u8,
    pub body: &'a [u32],
}

/// Known IT_* opcodes this processor understands. Anything else is
/// reported via `GpuError::UNKNOWN_PM4_OPCODE` rather than silently
/// skipped, since a silently-dropped packet desyncs GPU state from
/// what the guest submitted.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    DrawIndex2,
    DrawIndexAuto,
    IndexType,
    NumInstances,
    WaitRegMem,
    WriteData,
    IndirectBuffer,
    EventWrite,
    EventWriteEop,
    EventWriteEos,
    ReleaseMem,
    DmaData,
    AcquireMem,
    SetContextReg,
    SetShReg,
    SetUconfigReg,
    WriteConstRam,
    DumpConstRam,
    IncrementCeCounter,
    IncrementDeCounter,
    WaitOnCeCounter,
    WaitOnDeCounterDiff,
    PushMarker,
    PopMarker,
}

impl Opcode {
    /// IT_* opcode values as emitted by the guest's command buffer
    /// builder. Not contiguous; gaps are opcodes this processor has no
    /// use for and reports as unknown if seen.
    fn from_raw(raw: u8) -> Option<Opcode> {
        Some(match raw {
            0x10 => Opcode::Nop,
            0x36 => Opcode::DrawIndex2,
            0x2d => Opcode::DrawIndexAuto,
            0x2a => Opcode::IndexType,
            0x2f => Opcode::NumInstances,
            0x3c => Opcode::WaitRegMem,
            0x37 => Opcode::WriteData,
            0x3f => Opcode::IndirectBuffer,
            0x46 => Opcode::EventWrite,
            0x47 => Opcode::EventWriteEop,
            0x48 => Opcode::EventWriteEos,
            0x49 => Opcode::ReleaseMem,
            0x41 => Opcode::DmaData,
            0x58 => Opcode::AcquireMem,
            0x69 => Opcode::SetContextReg,
            0x76 => Opcode::SetShReg,
            0x79 => Opcode::SetUconfigReg,
            0x3d => Opcode::WriteConstRam,
            0x3e => Opcode::DumpConstRam,
            0x52 => Opcode::IncrementCeCounter,
            0x53 => Opcode::IncrementDeCounter,
            0x5c => Opcode::WaitOnCeCounter,
            0x5d => Opcode::WaitOnDeCounterDiff,
            0x8c => Opcode::PushMarker,
            0x8d => Opcode::PopMarker,
            _ => return None,
        })
    }
}

/// A cursor over a command buffer, yielding one decoded packet at a
/// time and advancing past type-0/type-2 filler without dispatching
/// them (neither carries guest-visible side effects this processor
/// models).
pub struct Pm4Reader<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Pm4Reader<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }

    /// Advances past the next packet, returning its decoded opcode and
    /// body for type-3 packets. Type-0/type-2 packets are skipped and
    /// yielded as `Ok(None)`.
    pub fn next_packet(&mut self) -> GpuResult<Option<(Opcode, &'a [u32])>> {
        if self.pos >= self.words.len() {
            return Ok(None);
        }
        let header = self.words[self.pos];

        match packet_type(header) {
            PacketType::Type2 => {
                self.pos += 1;
                Ok(None)
            }
            PacketType::Type0 => {
                let count = ((header >> 16) & 0x3fff) as usize + 1;
                self.pos += 1 + count;
                Ok(None)
            }
            PacketType::Type3 => {
                let count = ((header >> 16) & 0x3fff) as usize;
                let raw_op = ((header >> 8) & 0xff) as u8;
                let start = self.pos + 1;
                let end = start + count;
                if end > self.words.len() {
                    return Err(GpuError::RING_OVERRUN);
                }
                let body = &self.words[start..end];
                self.pos = end;

                match Opcode::from_raw(raw_op) {
                    Some(op) => Ok(Some((op, body))),
                    None => Err(GpuError::UNKNOWN_PM4_OPCODE),
                }
            }
        }
    }
}

impl<'a> Iterator for Pm4Reader<'a> {
    type Item = GpuResult<(Opcode, &'a [u32])>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_packet() {
                Ok(Some(pkt)) => return Some(Ok(pkt)),
                Ok(None) if self.pos < self.words.len() => continue,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Builds a type-3 packet header, mirroring the encoding guest command
/// buffer builders produce (used by tests and the indirect-buffer
/// chase-through helper).
pub fn make_type3_header(opcode: Opcode, body_len: u32) -> u32 {
    let raw_op = match opcode {
        Opcode::Nop => 0x10,
        Opcode::DrawIndex2 => 0x36,
        Opcode::DrawIndexAuto => 0x2d,
        Opcode::IndexType => 0x2a,
        Opcode::NumInstances => 0x2f,
        Opcode::WaitRegMem => 0x3c,
        Opcode::WriteData => 0x37,
        Opcode::IndirectBuffer => 0x3f,
        Opcode::EventWrite => 0x46,
        Opcode::EventWriteEop => 0x47,
        Opcode::EventWriteEos => 0x48,
        Opcode::ReleaseMem => 0x49,
        Opcode::DmaData => 0x41,
        Opcode::AcquireMem => 0x58,
        Opcode::SetContextReg => 0x69,
        Opcode::SetShReg => 0x76,
        Opcode::SetUconfigReg => 0x79,
        Opcode::WriteConstRam => 0x3d,
        Opcode::DumpConstRam => 0x3e,
        Opcode::IncrementCeCounter => 0x52,
        Opcode::IncrementDeCounter => 0x53,
        Opcode::WaitOnCeCounter => 0x5c,
        Opcode::WaitOnDeCounterDiff => 0x5d,
        Opcode::PushMarker => 0x8c,
        Opcode::PopMarker => 0x8d,
    };
    (0x3 << 30) | ((body_len & 0x3fff) << 16) | ((raw_op as u32) << 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nop_with_body() {
        let words = [make_type3_header(Opcode::Nop, 2), 0, 0];
        let mut reader = Pm4Reader::new(&words);
        let (op, body) = reader.next_packet().unwrap().unwrap();
        assert_eq!(op, Opcode::Nop);
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn skips_type2_filler() {
        let words = [0x8000_0000u32, make_type3_header(Opcode::SetContextReg, 1), 0xabcd];
        let mut reader = Pm4Reader::new(&words);
        let (op, body) = reader.next().unwrap().unwrap();
        assert_eq!(op, Opcode::SetContextReg);
        assert_eq!(body, &[0xabcd]);
    }

    #[test]
    fn truncated_body_is_ring_overrun() {
        let header = make_type3_header(Opcode::DrawIndex2, 4);
        let words = [header, 0, 0];
        let mut reader = Pm4Reader::new(&words);
        assert_eq!(reader.next_packet(), Err(GpuError::RING_OVERRUN));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let header = (0x3 << 30) | (0u32 << 16) | (0xff << 8);
        let words = [header];
        let mut reader = Pm4Reader::new(&words);
        assert_eq!(reader.next_packet(), Err(GpuError::UNKNOWN_PM4_OPCODE));
    }
}
