// Decodes the self-wrapper envelope around an embedded ELF image.
//
// Only the uncompressed ("identity") variant is supported; a segment
// whose compression differs from identity is a parse error rather
// than something silently mishandled.
//
// Austin Shafer - 2024
use crate::error::{LoaderError, LoaderResult};

pub const SELF_MAGIC: [u8; 4] = [0x4F, 0x15, 0x3D, 0x1D];
const HEADER_SIZE: usize = 32;
const SEGMENT_SIZE: usize = 32;

/// Bit set in `SelfSegment::kind` when the segment is part of the
/// loadable image (as opposed to metadata the loader never maps).
const SEGMENT_LOADABLE_BIT: u64 = 0x800;
/// Non-zero compression id bits; only 0 (identity) is implemented.
const SEGMENT_COMPRESSION_MASK: u64 = 0xFF00;

#[derive(Debug, Clone)]
pub struct SelfHeader {
    pub version: [u8; 4],
    pub flags: [u8; 4],
    pub size1: u16,
    pub size2: u16,
    pub file_size: u64,
    pub segments_num: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct SelfSegment {
    pub kind: u64,
    pub offset: u64,
    pub compressed_size: u64,
    pub decompressed_size: u64,
}

impl SelfSegment {
    pub fn is_loadable(&self) -> bool {
        self.kind & SEGMENT_LOADABLE_BIT != 0
    }

    pub fn is_identity(&self) -> bool {
        self.kind & SEGMENT_COMPRESSION_MASK == 0
    }
}

#[derive(Debug, Clone)]
pub struct SelfWrapper {
    pub header: SelfHeader,
    pub segments: Vec<SelfSegment>,
    /// Offset of the embedded ELF within the file, inferred from the
    /// lowest loadable segment's file offset (the segment table is
    /// immediately followed by non-loadable metadata in some images,
    /// so we can't just assume "right after the segment table").
    pub elf_offset: u64,
}

/// Returns `Ok(None)` when `data` doesn't start with the self magic,
/// meaning the caller should treat offset 0 as a bare ELF.
pub fn parse(data: &[u8]) -> LoaderResult<Option<SelfWrapper>> {
    if data.len() < 4 || data[0..4] != SELF_MAGIC {
        return Ok(None);
    }
    if data.len() < HEADER_SIZE {
        return Err(LoaderError::Parse("self header truncated".into()));
    }

    let version = [data[4], data[5], data[6], data[7]];
    let flags = [data[8], data[9], data[10], data[11]];
    let size1 = u16::from_le_bytes([data[12], data[13]]);
    let size2 = u16::from_le_bytes([data[14], data[15]]);
    let file_size = u64::from_le_bytes(data[16..24].try_into().unwrap());
    let segments_num = u16::from_le_bytes([data[24], data[25]]);

    let mut segments = Vec::with_capacity(segments_num as usize);
    let mut off = HEADER_SIZE;
    for _ in 0..segments_num {
        if data.len() < off + SEGMENT_SIZE {
            return Err(LoaderError::Parse("self segment table truncated".into()));
        }
        let kind = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        let offset = u64::from_le_bytes(data[off + 8..off + 16].try_into().unwrap());
        let compressed_size = u64::from_le_bytes(data[off + 16..off + 24].try_into().unwrap());
        let decompressed_size = u64::from_le_bytes(data[off + 24..off + 32].try_into().unwrap());
        segments.push(SelfSegment {
            kind,
            offset,
            compressed_size,
            decompressed_size,
        });
        off += SEGMENT_SIZE;
    }

    let elf_offset = segments
        .iter()
        .filter(|s| s.is_loadable())
        .map(|s| s.offset)
        .min()
        .unwrap_or(off as u64);

    Ok(Some(SelfWrapper {
        header: SelfHeader {
            version,
            flags,
            size1,
            size2,
            file_size,
            segments_num,
        },
        segments,
        elf_offset,
    }))
}

impl SelfWrapper {
    /// Finds the segment whose in-file blob covers `[file_offset,
    /// file_offset+size)` relative to the embedded ELF's own address
    /// space, and copies the bytes into `dst`.
    ///
    /// Falls back to a tail-append layout (treat the read as a direct
    /// file read past `header.file_size`) when no segment claims the
    /// range but it lies entirely past the recorded file size and
    /// exactly fills the remaining bytes -- some titles ship PT_LOAD
    /// segments whose backing bytes were appended after packing
    /// without a matching self-segment entry.
    pub fn load_segment(&self, file: &[u8], dst: &mut [u8], file_offset: u64, size: u64) -> LoaderResult<()> {
        for seg in &self.segments {
            if !seg.is_loadable() {
                continue;
            }
            if !seg.is_identity() {
                return Err(LoaderError::Parse(format!(
                    "unsupported self-segment compression kind={:#x}",
                    seg.kind
                )));
            }
            if file_offset >= seg.offset && file_offset + size <= seg.offset + seg.decompressed_size {
                let rel = (file_offset - seg.offset) as usize;
                let src_off = seg.offset as usize + rel;
                copy_from_file(file, dst, src_off)?;
                return Ok(());
            }
        }

        if file_offset >= self.header.file_size && file_offset + size <= file.len() as u64 {
            copy_from_file(file, dst, file_offset as usize)?;
            return Ok(());
        }

        Err(LoaderError::Parse(format!(
            "no self-segment covers offset={:#x} size={:#x}",
            file_offset, size
        )))
    }
}

fn copy_from_file(file: &[u8], dst: &mut [u8], src_off: usize) -> LoaderResult<()> {
    let end = src_off + dst.len();
    if end > file.len() {
        return Err(LoaderError::Parse("segment read past end of file".into()));
    }
    dst.copy_from_slice(&file[src_off..end]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_segment(buf: &mut Vec<u8>, kind: u64, offset: u64, size: u64) {
        buf.extend_from_slice(&kind.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
    }

    #[test]
    fn rejects_missing_magic() {
        let data = vec![0u8; 64];
        assert!(parse(&data).unwrap().is_none());
    }

    #[test]
    fn parses_header_and_segments() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SELF_MAGIC);
        buf.extend_from_slice(&[0, 1, 1, 0x12]);
        buf.extend_from_slice(&[1, 1, 0, 0]);
        buf.extend_from_slice(&100u16.to_le_bytes());
        buf.extend_from_slice(&200u16.to_le_bytes());
        buf.extend_from_slice(&4096u64.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&0x22u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        push_segment(&mut buf, 0x800, 64, 32);
        buf.extend_from_slice(&[0u8; 32]);

        let w = parse(&buf).unwrap().unwrap();
        assert_eq!(w.segments.len(), 1);
        assert!(w.segments[0].is_loadable());
        assert!(w.segments[0].is_identity());
        assert_eq!(w.elf_offset, 64);

        let mut dst = [0u8; 8];
        w.load_segment(&buf, &mut dst, 64, 8).unwrap();
    }
}
