// Symbol records, the resolve descriptor, and the flat symbol
// database keyed by the fully-expanded descriptor.
//
// Austin Shafer - 2024
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolType {
    Unknown,
    NoType,
    Func,
    Object,
    TlsModule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleId {
    pub id: String,
    pub name: String,
    pub version_major: u8,
    pub version_minor: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryId {
    pub id: String,
    pub name: String,
    pub version: u16,
}

/// The fully-expanded descriptor a lookup is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResolveKey {
    name: String,
    library: String,
    library_version: u16,
    module: String,
    module_version_major: u8,
    module_version_minor: u8,
    kind: SymbolType,
}

#[derive(Debug, Clone)]
pub struct SymbolResolve {
    pub name: String,
    pub library: String,
    pub library_version: u16,
    pub module: String,
    pub module_version_major: u8,
    pub module_version_minor: u8,
    pub kind: SymbolType,
}

impl SymbolResolve {
    fn key(&self) -> ResolveKey {
        ResolveKey {
            name: self.name.clone(),
            library: self.library.clone(),
            library_version: self.library_version,
            module: self.module.clone(),
            module_version_major: self.module_version_major,
            module_version_minor: self.module_version_minor,
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SymbolRecord {
    pub name: String,
    pub vaddr: u64,
    pub dbg_name: String,
}

/// Produces the stable, round-trippable textual form used only for
/// diagnostics when a symbol failed to resolve (kept from
/// `RuntimeLinker.cpp`'s `SymbolDatabase::GenerateName`).
pub fn generate_name(sr: &SymbolResolve) -> String {
    format!(
        "{}#{}#{} ({}v{}, {}v{}.{})",
        sr.name,
        sr.library,
        sr.module,
        sr.library,
        sr.library_version,
        sr.module,
        sr.module_version_major,
        sr.module_version_minor
    )
}

/// A flat table of `{descriptor -> vaddr}`. Each image owns one for
/// its exports and one for its imports; the runtime linker also keeps
/// a process-wide override table for symbols satisfied directly by
/// the kernel shim layer rather than any loaded image.
#[derive(Debug, Default)]
pub struct SymbolDatabase {
    entries: HashMap<ResolveKey, SymbolRecord>,
}

impl SymbolDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sr: SymbolResolve, vaddr: u64) {
        let dbg_name = generate_name(&sr);
        let record = SymbolRecord {
            name: sr.name.clone(),
            vaddr,
            dbg_name,
        };
        self.entries.insert(sr.key(), record);
    }

    pub fn find(&self, sr: &SymbolResolve) -> Option<&SymbolRecord> {
        self.entries.get(&sr.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sr(name: &str) -> SymbolResolve {
        SymbolResolve {
            name: name.into(),
            library: "libkernel".into(),
            library_version: 1,
            module: "libkernel".into(),
            module_version_major: 1,
            module_version_minor: 0,
            kind: SymbolType::Func,
        }
    }

    #[test]
    fn add_then_find_round_trips() {
        let mut db = SymbolDatabase::new();
        db.add(sr("sceKernelFoo"), 0x1000);
        let found = db.find(&sr("sceKernelFoo")).unwrap();
        assert_eq!(found.vaddr, 0x1000);
    }

    #[test]
    fn distinct_kind_is_a_distinct_key() {
        let mut db = SymbolDatabase::new();
        db.add(sr("sceKernelFoo"), 0x1000);
        let mut other = sr("sceKernelFoo");
        other.kind = SymbolType::Object;
        assert!(db.find(&other).is_none());
    }
}
