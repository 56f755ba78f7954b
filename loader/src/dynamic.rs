// Dynamic-segment tag parsing: standard DT_* tags and their OS-mirror
// counterparts in the 0x6100_0000 range.
//
// Austin Shafer - 2024
use crate::elf::{self, Elf64, Phdr, PT_DYNAMIC, PT_OS_DYNLIBDATA};
use crate::error::{LoaderError, LoaderResult};
use crate::nid;
use crate::symbol::{LibraryId, ModuleId};
use utils::log;

pub const DT_NULL: i64 = 0;
pub const DT_NEEDED: i64 = 0x01;
pub const DT_PLTRELSZ: i64 = 0x02;
pub const DT_PLTGOT: i64 = 0x03;
pub const DT_HASH: i64 = 0x04;
pub const DT_STRTAB: i64 = 0x05;
pub const DT_SYMTAB: i64 = 0x06;
pub const DT_RELA: i64 = 0x07;
pub const DT_RELASZ: i64 = 0x08;
pub const DT_RELAENT: i64 = 0x09;
pub const DT_STRSZ: i64 = 0x0a;
pub const DT_SYMENT: i64 = 0x0b;
pub const DT_INIT: i64 = 0x0c;
pub const DT_FINI: i64 = 0x0d;
pub const DT_SONAME: i64 = 0x0e;
pub const DT_REL: i64 = 0x11;
pub const DT_PLTREL: i64 = 0x14;
pub const DT_DEBUG: i64 = 0x15;
pub const DT_TEXTREL: i64 = 0x16;
pub const DT_JMPREL: i64 = 0x17;
pub const DT_INIT_ARRAY: i64 = 0x19;
pub const DT_FINI_ARRAY: i64 = 0x1a;
pub const DT_INIT_ARRAYSZ: i64 = 0x1b;
pub const DT_FINI_ARRAYSZ: i64 = 0x1c;
pub const DT_FLAGS: i64 = 0x1e;
pub const DT_PREINIT_ARRAY: i64 = 0x20;
pub const DT_PREINIT_ARRAYSZ: i64 = 0x21;
pub const DT_RELACOUNT: i64 = 0x6fff_fff9;

pub const DT_OS_FINGERPRINT: i64 = 0x6100_0007;
pub const DT_OS_ORIGINAL_FILENAME: i64 = 0x6100_0009;
pub const DT_OS_ORIGINAL_FILENAME_1: i64 = 0x6100_0041;
pub const DT_OS_MODULE_INFO: i64 = 0x6100_000d;
pub const DT_OS_MODULE_INFO_1: i64 = 0x6100_0043;
pub const DT_OS_NEEDED_MODULE: i64 = 0x6100_000f;
pub const DT_OS_NEEDED_MODULE_1: i64 = 0x6100_0045;
pub const DT_OS_MODULE_ATTR: i64 = 0x6100_0011;
pub const DT_OS_EXPORT_LIB: i64 = 0x6100_0013;
pub const DT_OS_EXPORT_LIB_1: i64 = 0x6100_0047;
pub const DT_OS_EXPORT_LIB_ATTR: i64 = 0x6100_0017;
pub const DT_OS_IMPORT_LIB: i64 = 0x6100_0015;
pub const DT_OS_IMPORT_LIB_1: i64 = 0x6100_0049;
pub const DT_OS_IMPORT_LIB_ATTR: i64 = 0x6100_0019;
pub const DT_OS_HASH: i64 = 0x6100_0025;
pub const DT_OS_PLTGOT: i64 = 0x6100_0027;
pub const DT_OS_JMPREL: i64 = 0x6100_0029;
pub const DT_OS_PLTREL: i64 = 0x6100_002b;
pub const DT_OS_PLTRELSZ: i64 = 0x6100_002d;
pub const DT_OS_RELA: i64 = 0x6100_002f;
pub const DT_OS_RELASZ: i64 = 0x6100_0031;
pub const DT_OS_RELAENT: i64 = 0x6100_0033;
pub const DT_OS_STRTAB: i64 = 0x6100_0035;
pub const DT_OS_STRSZ: i64 = 0x6100_0037;
pub const DT_OS_SYMTAB: i64 = 0x6100_0039;
pub const DT_OS_SYMENT: i64 = 0x6100_003b;
pub const DT_OS_HASHSZ: i64 = 0x6100_003d;
pub const DT_OS_SYMTABSZ: i64 = 0x6100_003f;

/// A table pointer as recorded by one of two alternate dynamic-tag
/// encodings: `Guest` tags (the standard `DT_*` form) hold an
/// ELF-file-relative offset reachable through the normal program
/// header table; `File` tags (the `DT_OS_*` mirror) index directly
/// into the bytes of the `PT_OS_DYNLIBDATA` segment.
#[derive(Debug, Clone, Copy)]
pub enum TableRef {
    Guest(u64),
    File(u64),
}

#[derive(Debug, Default)]
pub struct DynamicInfo {
    pub hash_table: Option<TableRef>,
    pub hash_table_size: u64,
    pub str_table: Option<TableRef>,
    pub str_table_size: u64,
    pub symbol_table: Option<TableRef>,
    pub symbol_table_total_size: u64,
    pub symbol_table_entry_size: u64,
    pub init_vaddr: u64,
    pub fini_vaddr: u64,
    pub init_array_vaddr: u64,
    pub fini_array_vaddr: u64,
    pub preinit_array_vaddr: u64,
    pub init_array_size: u64,
    pub fini_array_size: u64,
    pub preinit_array_size: u64,
    pub pltgot_vaddr: u64,
    pub jmprela_table: Option<TableRef>,
    pub jmprela_table_size: u64,
    pub rela_table: Option<TableRef>,
    pub rela_table_total_size: u64,
    pub rela_table_entry_size: u64,
    pub relative_count: u64,
    pub debug: u64,
    pub flags: u64,
    pub textrel: u64,
    pub needed: Vec<String>,
    pub so_name: String,
    pub import_modules: Vec<ModuleId>,
    pub export_modules: Vec<ModuleId>,
    pub import_libs: Vec<LibraryId>,
    pub export_libs: Vec<LibraryId>,
    /// The `PT_OS_DYNLIBDATA` segment's raw bytes, kept so callers can
    /// re-resolve `TableRef::File` tables (symtab/strtab/rela/jmprela)
    /// without re-walking the program headers.
    pub dynlibdata: Vec<u8>,
}

impl DynamicInfo {
    /// Resolves a table pointer into an owned byte buffer of `len`
    /// bytes, reading through whichever backing store the tag that
    /// set it implied.
    pub fn read_table(&self, table: Option<TableRef>, elf: &Elf64, dynlibdata: &[u8], len: u64) -> LoaderResult<Vec<u8>> {
        let table = table.ok_or_else(|| LoaderError::Parse("missing required dynamic table".into()))?;
        match table {
            TableRef::Guest(vaddr) => {
                let offset = elf
                    .vaddr_to_file_offset(vaddr)
                    .ok_or_else(|| LoaderError::Parse(format!("table vaddr {:#x} not backed by any segment", vaddr)))?;
                let mut buf = vec![0u8; len as usize];
                elf.load_segment(&mut buf, offset, len)?;
                Ok(buf)
            }
            TableRef::File(offset) => {
                let end = offset as usize + len as usize;
                if end > dynlibdata.len() {
                    return Err(LoaderError::Parse("DT_OS_* table read past dynlibdata blob".into()));
                }
                Ok(dynlibdata[offset as usize..end].to_vec())
            }
        }
    }

    /// Resolves the string table entry starting at `str_offset` up to
    /// the next NUL, once `str_table`/`str_table_size` are known.
    pub fn read_cstr(&self, elf: &Elf64, dynlibdata: &[u8], str_offset: u64) -> LoaderResult<String> {
        let remaining = self.str_table_size.saturating_sub(str_offset);
        let raw = self.read_table(self.str_table, elf, dynlibdata, remaining)?;
        let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..nul]).into_owned())
    }
}

fn find_dynlibdata_blob(elf: &Elf64, phdrs: &[Phdr]) -> LoaderResult<Vec<u8>> {
    match phdrs.iter().find(|p| p.p_type == PT_OS_DYNLIBDATA) {
        Some(p) => {
            let mut buf = vec![0u8; p.p_filesz as usize];
            elf.load_segment(&mut buf, p.p_offset, p.p_filesz)?;
            Ok(buf)
        }
        None => Ok(Vec::new()),
    }
}

struct DynEntries {
    entries: Vec<elf::Dyn>,
}

impl DynEntries {
    fn has(&self, tag: i64) -> bool {
        self.entries.iter().any(|d| d.d_tag == tag)
    }

    fn value(&self, tag: i64) -> Option<u64> {
        self.entries.iter().find(|d| d.d_tag == tag).map(|d| d.d_val)
    }

    fn values(&self, tag: i64) -> Vec<u64> {
        self.entries.iter().filter(|d| d.d_tag == tag).map(|d| d.d_val).collect()
    }
}

fn read_dyn_entries(elf: &Elf64, phdrs: &[Phdr]) -> LoaderResult<DynEntries> {
    let dyn_phdr = phdrs
        .iter()
        .find(|p| p.p_type == PT_DYNAMIC)
        .ok_or_else(|| LoaderError::Parse("no PT_DYNAMIC segment".into()))?;

    let mut buf = vec![0u8; dyn_phdr.p_filesz as usize];
    elf.load_segment(&mut buf, dyn_phdr.p_offset, dyn_phdr.p_filesz)?;

    let mut entries = Vec::new();
    let mut off = 0;
    while off + elf::DYN_ENTRY_SIZE <= buf.len() {
        let d = elf::read_dyn(&buf, off);
        if d.d_tag == DT_NULL {
            break;
        }
        entries.push(d);
        off += elf::DYN_ENTRY_SIZE;
    }
    Ok(DynEntries { entries })
}

/// Checked lookup enforcing the invariant that a standard tag
/// and its OS mirror must never both be present.
fn require_one(entries: &DynEntries, os_tag: i64, std_tag: i64) -> LoaderResult<()> {
    if entries.has(os_tag) && entries.has(std_tag) {
        return Err(LoaderError::DuplicateDynTag(os_tag));
    }
    Ok(())
}

fn table_ref(entries: &DynEntries, os_tag: i64, std_tag: i64) -> LoaderResult<Option<TableRef>> {
    require_one(entries, os_tag, std_tag)?;
    if let Some(v) = entries.value(os_tag) {
        return Ok(Some(TableRef::File(v)));
    }
    if let Some(v) = entries.value(std_tag) {
        return Ok(Some(TableRef::Guest(v)));
    }
    Ok(None)
}

fn scalar(entries: &DynEntries, os_tag: i64, std_tag: i64) -> LoaderResult<u64> {
    require_one(entries, os_tag, std_tag)?;
    Ok(entries.value(os_tag).or_else(|| entries.value(std_tag)).unwrap_or(0))
}

fn decode_module_or_lib_needed(need: u64, str_table_fn: impl Fn(u64) -> LoaderResult<String>) -> LoaderResult<(String, String, u8, u8)> {
    let id = nid::encode_id(((need >> 48) & 0xffff) as u16);
    let version_major = ((need >> 40) & 0xff) as u8;
    let version_minor = ((need >> 32) & 0xff) as u8;
    let name = str_table_fn(need & 0xffff_ffff)?;
    Ok((id, name, version_major, version_minor))
}

/// `ParseProgramDynamicInfo`: reads the PT_DYNAMIC array and resolves
/// every tag of interest into a [`DynamicInfo`].
pub fn parse(elf: &Elf64, phdrs: &[Phdr]) -> LoaderResult<DynamicInfo> {
    let entries = read_dyn_entries(elf, phdrs)?;
    let dynlibdata = find_dynlibdata_blob(elf, phdrs)?;

    let mut info = DynamicInfo {
        hash_table: table_ref(&entries, DT_OS_HASH, DT_HASH)?,
        hash_table_size: entries.value(DT_OS_HASHSZ).unwrap_or(0),
        str_table: table_ref(&entries, DT_OS_STRTAB, DT_STRTAB)?,
        str_table_size: entries.value(DT_OS_STRSZ).or_else(|| entries.value(DT_STRSZ)).unwrap_or(0),
        symbol_table: table_ref(&entries, DT_OS_SYMTAB, DT_SYMTAB)?,
        symbol_table_total_size: entries.value(DT_OS_SYMTABSZ).unwrap_or(0),
        symbol_table_entry_size: entries.value(DT_OS_SYMENT).or_else(|| entries.value(DT_SYMENT)).unwrap_or(0),
        init_vaddr: entries.value(DT_INIT).unwrap_or(0),
        fini_vaddr: entries.value(DT_FINI).unwrap_or(0),
        init_array_vaddr: entries.value(DT_INIT_ARRAY).unwrap_or(0),
        fini_array_vaddr: entries.value(DT_FINI_ARRAY).unwrap_or(0),
        preinit_array_vaddr: entries.value(DT_PREINIT_ARRAY).unwrap_or(0),
        init_array_size: entries.value(DT_INIT_ARRAYSZ).unwrap_or(0),
        fini_array_size: entries.value(DT_FINI_ARRAYSZ).unwrap_or(0),
        preinit_array_size: entries.value(DT_PREINIT_ARRAYSZ).unwrap_or(0),
        pltgot_vaddr: {
            let mut v = entries.value(DT_OS_PLTGOT).unwrap_or(0);
            if v == 0 {
                v = entries.value(DT_PLTGOT).unwrap_or(0);
            }
            v
        },
        jmprela_table: None,
        jmprela_table_size: 0,
        rela_table: table_ref(&entries, DT_OS_RELA, DT_RELA)?,
        rela_table_total_size: entries.value(DT_OS_RELASZ).or_else(|| entries.value(DT_RELASZ)).unwrap_or(0),
        rela_table_entry_size: entries.value(DT_OS_RELAENT).or_else(|| entries.value(DT_RELAENT)).unwrap_or(0),
        relative_count: entries.value(DT_RELACOUNT).unwrap_or(0),
        debug: entries.value(DT_DEBUG).unwrap_or(0),
        flags: entries.value(DT_FLAGS).unwrap_or(0),
        textrel: entries.value(DT_TEXTREL).unwrap_or(0),
        needed: Vec::new(),
        so_name: String::new(),
        import_modules: Vec::new(),
        export_modules: Vec::new(),
        import_libs: Vec::new(),
        export_libs: Vec::new(),
        dynlibdata: dynlibdata.clone(),
    };

    if info.debug != 0 {
        return Err(LoaderError::Parse("DT_DEBUG set: not implemented".into()));
    }
    if info.textrel != 0 {
        return Err(LoaderError::Parse("DT_TEXTREL set: not implemented".into()));
    }

    let jmprel_type = entries
        .value(DT_OS_PLTREL)
        .or_else(|| entries.value(DT_PLTREL))
        .unwrap_or(0);
    require_one(&entries, DT_OS_PLTREL, DT_PLTREL)?;
    if jmprel_type != 0 {
        if jmprel_type as i64 != DT_RELA {
            return Err(LoaderError::Parse(format!("unsupported DT_PLTREL kind: {}", jmprel_type)));
        }
        info.jmprela_table = table_ref(&entries, DT_OS_JMPREL, DT_JMPREL)?;
        info.jmprela_table_size = scalar(&entries, DT_OS_PLTRELSZ, DT_OS_PLTRELSZ)?;
        if info.jmprela_table_size == 0 {
            info.jmprela_table_size = entries.value(DT_PLTRELSZ).unwrap_or(0);
        }
    }

    let str_of = |off: u64| -> LoaderResult<String> { info.read_cstr(elf, &dynlibdata, off) };

    for need in entries.values(DT_NEEDED) {
        info.needed.push(str_of(need)?);
    }

    if let Some(so) = entries.value(DT_SONAME) {
        info.so_name = str_of(so)?;
    }

    require_one(&entries, DT_OS_NEEDED_MODULE, DT_OS_NEEDED_MODULE_1)?;
    let module_tag = if entries.has(DT_OS_NEEDED_MODULE) {
        DT_OS_NEEDED_MODULE
    } else {
        DT_OS_NEEDED_MODULE_1
    };
    for need in entries.values(module_tag) {
        let (id, name, major, minor) = decode_module_or_lib_needed(need, &str_of)?;
        info.import_modules.push(ModuleId {
            id,
            name,
            version_major: major,
            version_minor: minor,
        });
    }

    require_one(&entries, DT_OS_MODULE_INFO, DT_OS_MODULE_INFO_1)?;
    let export_module_tag = if entries.has(DT_OS_MODULE_INFO) {
        DT_OS_MODULE_INFO
    } else {
        DT_OS_MODULE_INFO_1
    };
    for need in entries.values(export_module_tag) {
        let (id, name, major, minor) = decode_module_or_lib_needed(need, &str_of)?;
        info.export_modules.push(ModuleId {
            id,
            name,
            version_major: major,
            version_minor: minor,
        });
    }

    require_one(&entries, DT_OS_IMPORT_LIB, DT_OS_IMPORT_LIB_1)?;
    let import_lib_tag = if entries.has(DT_OS_IMPORT_LIB) { DT_OS_IMPORT_LIB } else { DT_OS_IMPORT_LIB_1 };
    for need in entries.values(import_lib_tag) {
        let id = nid::encode_id(((need >> 48) & 0xffff) as u16);
        let version = ((need >> 32) & 0xffff) as u16;
        let name = str_of(need & 0xffff_ffff)?;
        info.import_libs.push(LibraryId { id, name, version });
    }

    require_one(&entries, DT_OS_EXPORT_LIB, DT_OS_EXPORT_LIB_1)?;
    let export_lib_tag = if entries.has(DT_OS_EXPORT_LIB) { DT_OS_EXPORT_LIB } else { DT_OS_EXPORT_LIB_1 };
    for need in entries.values(export_lib_tag) {
        let id = nid::encode_id(((need >> 48) & 0xffff) as u16);
        let version = ((need >> 32) & 0xffff) as u16;
        let name = str_of(need & 0xffff_ffff)?;
        info.export_libs.push(LibraryId { id, name, version });
    }

    log::debug!(
        "ParseProgramDynamicInfo: {} needed, {} import modules, {} export modules",
        info.needed.len(),
        info.import_modules.len(),
        info.export_modules.len()
    );

    Ok(info)
}
