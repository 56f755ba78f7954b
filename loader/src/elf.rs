// ELF64 header/program-header/section-header/symbol/relocation layout
// and validation for the self-wrapped dialect this loader accepts.
//
// Austin Shafer - 2024
use crate::error::{LoaderError, LoaderResult};
use crate::selfwrap::{self, SelfWrapper};

pub const EI_CLASS_64: u8 = 2;
pub const EI_DATA_LSB: u8 = 1;
pub const EI_OSABI_FREEBSD: u8 = 9;
pub const EM_X86_64: u16 = 62;

pub const ET_DYNEXEC: u16 = 0xFE10;
pub const ET_DYNAMIC: u16 = 0xFE18;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_TLS: u32 = 7;
pub const PT_OS_DYNLIBDATA: u32 = 0x6100_0000;
pub const PT_OS_PROCPARAM: u32 = 0x6100_0001;
pub const PT_OS_RELRO: u32 = 0x6100_0010;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_GLOB_DAT: u32 = 6;
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_X86_64_RELATIVE: u32 = 8;
pub const R_X86_64_DTPMOD64: u32 = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ehdr {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr {
    /// `(p_memsz + (align-1)) & ~(align-1)`, or `p_memsz` unaligned
    /// when `p_align == 0`.
    pub fn aligned_size(&self) -> u64 {
        if self.p_align != 0 {
            (self.p_memsz + (self.p_align - 1)) & !(self.p_align - 1)
        } else {
            self.p_memsz
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Sym {
    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn sym_type(&self) -> u8 {
        self.st_info & 0xF
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rela {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

impl Rela {
    pub fn sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }

    pub fn reloc_type(&self) -> u32 {
        (self.r_info & 0xFFFF_FFFF) as u32
    }
}

fn u16le(d: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(d[off..off + 2].try_into().unwrap())
}
fn u32le(d: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(d[off..off + 4].try_into().unwrap())
}
fn u64le(d: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(d[off..off + 8].try_into().unwrap())
}
fn i64le(d: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(d[off..off + 8].try_into().unwrap())
}

/// A parsed, validated ELF64 image, still backed by the raw file bytes
/// (segments are not yet copied into guest memory -- that is
/// `linker::place_segments`'s job, via `load_segment`).
pub struct Elf64 {
    file: Vec<u8>,
    self_wrapper: Option<SelfWrapper>,
    elf_base: usize,
    pub ehdr: Ehdr,
    pub phdrs: Vec<Phdr>,
}

impl Elf64 {
    pub fn open(path: &std::path::Path) -> LoaderResult<Self> {
        let file = std::fs::read(path)?;
        Self::parse(file)
    }

    pub fn parse(file: Vec<u8>) -> LoaderResult<Self> {
        let self_wrapper = selfwrap::parse(&file)?;
        let elf_base = self_wrapper.as_ref().map(|w| w.elf_offset as usize).unwrap_or(0);

        let ehdr = parse_ehdr(&file, elf_base)?;
        let phdrs = parse_phdrs(&file, elf_base, &ehdr)?;

        Ok(Self {
            file,
            self_wrapper,
            elf_base,
            ehdr,
            phdrs,
        })
    }

    pub fn is_shared(&self) -> bool {
        self.ehdr.e_type == ET_DYNAMIC
    }

    pub fn entry(&self) -> u64 {
        self.ehdr.e_entry
    }

    /// Reads `size` bytes starting at `file_offset`, which is relative
    /// to the start of the *embedded ELF*, demultiplexing through the
    /// self-wrapper when present.
    pub fn load_segment(&self, dst: &mut [u8], file_offset: u64, size: u64) -> LoaderResult<()> {
        match &self.self_wrapper {
            Some(w) => w.load_segment(&self.file, dst, file_offset, size),
            None => {
                let start = self.elf_base as u64 + file_offset;
                let end = start + size;
                if end > self.file.len() as u64 {
                    return Err(LoaderError::Parse("segment read past end of file".into()));
                }
                dst.copy_from_slice(&self.file[start as usize..end as usize]);
                Ok(())
            }
        }
    }

    /// Maps a `p_vaddr`-relative address to a file offset by finding
    /// the `PT_LOAD`/`PT_OS_RELRO`/`PT_OS_DYNLIBDATA` segment whose
    /// file-backed range covers it. Standard `DT_*` dynamic tags store
    /// pointers this way (vaddr-relative, to be read back out of the
    /// same file bytes that were or will be mapped at that address).
    pub fn vaddr_to_file_offset(&self, vaddr: u64) -> Option<u64> {
        self.phdrs
            .iter()
            .filter(|p| p.p_filesz > 0)
            .find(|p| vaddr >= p.p_vaddr && vaddr < p.p_vaddr + p.p_filesz)
            .map(|p| p.p_offset + (vaddr - p.p_vaddr))
    }
}

fn parse_ehdr(file: &[u8], base: usize) -> LoaderResult<Ehdr> {
    if file.len() < base + 64 {
        return Err(LoaderError::Parse("file too small for ELF header".into()));
    }
    let e_ident = &file[base..base + 16];
    if &e_ident[0..4] != b"\x7fELF" {
        return Err(LoaderError::Parse("bad ELF magic".into()));
    }
    if e_ident[4] != EI_CLASS_64 {
        return Err(LoaderError::Parse("not ELFCLASS64".into()));
    }
    if e_ident[5] != EI_DATA_LSB {
        return Err(LoaderError::Parse("not ELFDATA2LSB".into()));
    }
    if e_ident[7] != EI_OSABI_FREEBSD {
        return Err(LoaderError::Parse(format!("unsupported OSABI: {}", e_ident[7])));
    }
    if !matches!(e_ident[8], 0 | 2) {
        return Err(LoaderError::Parse(format!("unsupported ABIVERSION: {}", e_ident[8])));
    }

    let ehdr = Ehdr {
        e_type: u16le(file, base + 16),
        e_machine: u16le(file, base + 18),
        e_entry: u64le(file, base + 24),
        e_phoff: u64le(file, base + 32),
        e_shoff: u64le(file, base + 40),
        e_phentsize: u16le(file, base + 54),
        e_phnum: u16le(file, base + 56),
        e_shentsize: u16le(file, base + 58),
        e_shnum: u16le(file, base + 60),
        e_shstrndx: if file.len() >= base + 64 { u16le(file, base + 62) } else { 0 },
    };

    if !matches!(ehdr.e_type, ET_DYNEXEC | ET_DYNAMIC) {
        return Err(LoaderError::Parse(format!("unsupported e_type: {:#x}", ehdr.e_type)));
    }
    if ehdr.e_machine != EM_X86_64 {
        return Err(LoaderError::Parse(format!("unsupported e_machine: {}", ehdr.e_machine)));
    }

    Ok(ehdr)
}

fn parse_phdrs(file: &[u8], base: usize, ehdr: &Ehdr) -> LoaderResult<Vec<Phdr>> {
    let mut out = Vec::with_capacity(ehdr.e_phnum as usize);
    for i in 0..ehdr.e_phnum as usize {
        let off = base + ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        if file.len() < off + 56 {
            return Err(LoaderError::Parse("program header table truncated".into()));
        }
        out.push(Phdr {
            p_type: u32le(file, off),
            p_flags: u32le(file, off + 4),
            p_offset: u64le(file, off + 8),
            p_vaddr: u64le(file, off + 16),
            p_paddr: u64le(file, off + 24),
            p_filesz: u64le(file, off + 32),
            p_memsz: u64le(file, off + 40),
            p_align: u64le(file, off + 48),
        });
    }
    Ok(out)
}

pub fn read_dyn(data: &[u8], off: usize) -> Dyn {
    Dyn {
        d_tag: i64le(data, off),
        d_val: u64le(data, off + 8),
    }
}

pub fn read_sym(data: &[u8], off: usize) -> Sym {
    Sym {
        st_name: u32le(data, off),
        st_info: data[off + 4],
        st_other: data[off + 5],
        st_shndx: u16le(data, off + 6),
        st_value: u64le(data, off + 8),
        st_size: u64le(data, off + 16),
    }
}

pub fn read_rela(data: &[u8], off: usize) -> Rela {
    Rela {
        r_offset: u64le(data, off),
        r_info: u64le(data, off + 8),
        r_addend: i64le(data, off + 16),
    }
}

pub const DYN_ENTRY_SIZE: usize = 16;
pub const SYM_ENTRY_SIZE: usize = 24;
pub const RELA_ENTRY_SIZE: usize = 24;
