// The GPU-object cache: single authority over CPU<->GPU coherence for
// guest memory, keyed by 1-3 guest-address ranges plus a kind and
// creation parameters.
//
// Austin Shafer - 2024
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use utils::log;
use utils::region::{AddrRange, Overlap};
use vmem::PageWatcher;

pub const VADDR_BLOCKS_MAX: usize = 3;

/// Up to 8 creation-time scalar parameters a factory may need again on
/// reuse (shader/format/tiling ids etc.), mirroring `GpuObject::params`.
pub const PARAMS_MAX: usize = 8;

fn calc_hash(buf: &[u8]) -> u64 {
    if buf.is_empty() {
        0
    } else {
        xxhash_rust::xxh3::xxh3_64(buf)
    }
}

/// Reads a guest range directly out of host memory: loaded images and
/// guest-visible allocations live in this process's own address space,
/// so `vaddr` is a plain pointer once it's known to be mapped.
fn read_range(range: &AddrRange) -> &'static [u8] {
    unsafe { std::slice::from_raw_parts(range.start as *const u8, range.size as usize) }
}

fn hash_ranges(ranges: &[AddrRange]) -> [u64; VADDR_BLOCKS_MAX] {
    let mut hash = [0u64; VADDR_BLOCKS_MAX];
    for (i, r) in ranges.iter().enumerate() {
        hash[i] = calc_hash(read_range(r));
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    VideoOutBuffer,
    DepthStencilBuffer,
    Label,
    IndexBuffer,
    VertexBuffer,
    StorageBuffer,
    Texture,
    RenderTexture,
    StorageTexture,
}

/// The decision the overlap-resolution table reaches for an existing,
/// overlapping object when a new `CreateObject` request comes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Build the new object fresh, keep the old one alongside it.
    Overlap,
    /// Build the new object by reinterpreting the old one's backing
    /// memory (e.g. a storage texture aliasing a texture).
    OverlapFromObjects,
    /// Free every overlapping object before creating the new one.
    DeleteAll,
}

/// `ObjectsRelation`: the combined switch key the original table keys
/// off of. `relation` is `existing.overlap(&new)` — i.e. how the
/// already-cached object relates to the one being requested.
fn classify(existing: ObjectKind, relation: Overlap, requested: ObjectKind) -> Option<Decision> {
    use ObjectKind::*;
    use Overlap::*;
    match (existing, relation, requested) {
        (StorageBuffer, Equals, RenderTexture) => Some(Decision::Overlap),
        (StorageBuffer, Equals, StorageTexture) => Some(Decision::Overlap),
        (StorageBuffer, Equals, Texture) => Some(Decision::Overlap),
        (VideoOutBuffer, Equals, StorageBuffer) => Some(Decision::Overlap),
        (StorageBuffer, Contains, Label) => Some(Decision::DeleteAll),
        (Label, IsContainedWithin, StorageBuffer) => Some(Decision::DeleteAll),
        (Label, Equals, Label) => Some(Decision::DeleteAll),
        (StorageTexture, Equals, Texture) => Some(Decision::OverlapFromObjects),
        (RenderTexture, IsContainedWithin, Texture) => Some(Decision::OverlapFromObjects),
        _ => None,
    }
}

pub struct GpuObject {
    pub id: u64,
    pub kind: ObjectKind,
    ranges: Vec<AddrRange>,
    pub backend_handle: u64,
    pub use_num: u64,
    pub use_last_frame: u64,
    pub in_use: bool,
    pub read_only: bool,
    pub check_hash: bool,
    /// Up to [`VADDR_BLOCKS_MAX`] content hashes, one per range, `0`
    /// when `check_hash` is false for that block.
    pub hash: [u64; VADDR_BLOCKS_MAX],
    /// Up to [`PARAMS_MAX`] creation-time scalars the factory needs
    /// again to `update` or recreate this object.
    pub params: [u64; PARAMS_MAX],
}

struct FoundBlock {
    object_id: u64,
    relation: Overlap,
}

/// Creation parameters a caller supplies for a cache miss; mirrors
/// `GpuObject`'s `create_func_t`/`update_func_t`/`GetWriteBackFunc`
/// trio as a small trait so backend object kinds plug in without the
/// cache depending on `render`.
pub trait ObjectFactory {
    fn create(&self, ranges: &[AddrRange], params: &[u64; PARAMS_MAX]) -> u64;
    fn update(&self, backend_handle: u64, ranges: &[AddrRange], params: &[u64; PARAMS_MAX]);
    fn destroy(&self, backend_handle: u64);
    fn write_back(&self, backend_handle: u64, ranges: &[AddrRange]) {
        let _ = (backend_handle, ranges);
    }
}

#[derive(Default)]
struct Inner {
    objects: HashMap<u64, GpuObject>,
    next_id: u64,
    current_frame: u64,
}

/// `GpuMemory`: the process-wide object cache, one mutex serializing
/// every lookup/creation/eviction.
pub struct GpuMemoryCache {
    inner: Mutex<Inner>,
    watcher: Mutex<PageWatcher>,
}

impl GpuMemoryCache {
    pub fn new(watcher: PageWatcher) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            watcher: Mutex::new(watcher),
        }
    }

    /// Exposes the watcher's `Check` entry point to the process-wide
    /// exception handler: resolves the fault (restoring write access
    /// and firing the dirty callback) if `vaddr` falls in a watched
    /// range.
    pub fn watcher_check(&self, vaddr: u64, size: u64) -> bool {
        self.watcher.lock().unwrap().check(vaddr, size)
    }

    fn find_blocks(inner: &Inner, ranges: &[AddrRange]) -> Vec<FoundBlock> {
        let mut found = Vec::new();
        for obj in inner.objects.values() {
            for new_range in ranges {
                for existing_range in &obj.ranges {
                    let rel = existing_range.overlap(new_range);
                    if rel != Overlap::None {
                        found.push(FoundBlock { object_id: obj.id, relation: rel });
                    }
                }
            }
        }
        found
    }

    /// `CreateObject`: look up an existing object covering `ranges`; if
    /// one of the same kind exists exactly, bump its use count and
    /// return it. Otherwise resolve the overlap decision table against
    /// whatever's there, possibly freeing victims, then build fresh.
    pub fn create_object<F: ObjectFactory>(
        &self,
        kind: ObjectKind,
        ranges: &[AddrRange],
        params: [u64; PARAMS_MAX],
        check_hash: bool,
        factory: &F,
    ) -> u64 {
        assert!(!ranges.is_empty() && ranges.len() <= VADDR_BLOCKS_MAX);

        let mut inner = self.inner.lock().unwrap();
        let others = Self::find_blocks(&inner, ranges);

        if let Some(existing_id) = others.iter().find_map(|b| {
            let obj = inner.objects.get(&b.object_id)?;
            (obj.kind == kind && b.relation == Overlap::Equals).then_some(b.object_id)
        }) {
            let frame = inner.current_frame;
            let obj = inner.objects.get_mut(&existing_id).unwrap();
            factory.update(obj.backend_handle, ranges, &obj.params);
            obj.use_num += 1;
            obj.use_last_frame = frame;
            obj.in_use = true;
            return obj.backend_handle;
        }

        let decision = others.iter().find_map(|b| {
            let existing = inner.objects.get(&b.object_id)?.kind;
            classify(existing, b.relation, kind)
        });

        if !others.is_empty() && decision.is_none() {
            log::error!(
                "GpuMemory::CreateObject: unhandled overlap for kind={:?} against {} existing object(s)",
                kind,
                others.len()
            );
        }

        if decision == Some(Decision::DeleteAll) {
            for b in &others {
                if let Some(obj) = inner.objects.remove(&b.object_id) {
                    factory.destroy(obj.backend_handle);
                }
            }
        }

        let backend_handle = factory.create(ranges, &params);
        let id = inner.next_id;
        inner.next_id += 1;

        let hash = if check_hash { hash_ranges(ranges) } else { [0u64; VADDR_BLOCKS_MAX] };

        inner.objects.insert(
            id,
            GpuObject {
                id,
                kind,
                ranges: ranges.to_vec(),
                backend_handle,
                use_num: 1,
                use_last_frame: inner.current_frame,
                in_use: true,
                read_only: false,
                check_hash,
                hash,
                params,
            },
        );
        drop(inner);

        self.watcher
            .lock()
            .unwrap()
            .watch(
                ranges.to_vec(),
                Arc::new(move |fault_vaddr, fault_size| {
                    log::debug!(
                        "GpuMemory: object {} touched by guest write at {:#x}+{:#x}",
                        id,
                        fault_vaddr,
                        fault_size
                    );
                }),
            )
            .ok();

        backend_handle
    }

    /// `ResetHash`: for every cached block of `kind` overlapping
    /// `range`, recomputes its content hash (or `0` if `check_hash` is
    /// off) and stores it, logging the old/new pair when it changed.
    pub fn reset_hash(&self, range: AddrRange, kind: ObjectKind) {
        let mut inner = self.inner.lock().unwrap();
        for obj in inner.objects.values_mut() {
            if obj.kind != kind {
                continue;
            }
            for (vi, r) in obj.ranges.clone().iter().enumerate() {
                if r.overlap(&range) == Overlap::None {
                    continue;
                }
                let new_hash = if obj.check_hash { calc_hash(read_range(r)) } else { 0 };
                if obj.hash[vi] != new_hash {
                    log::debug!(
                        "GpuMemory::ResetHash: kind={:?} vaddr={:#x} old_hash={:#x} new_hash={:#x}",
                        kind,
                        r.start,
                        obj.hash[vi],
                        new_hash
                    );
                    obj.hash[vi] = new_hash;
                }
            }
        }
    }

    /// `WriteBack`: flushes every dirty, non-read-only cached object
    /// back to guest memory.
    pub fn write_back<F: ObjectFactory>(&self, factory: &F) {
        let inner = self.inner.lock().unwrap();
        for obj in inner.objects.values() {
            if obj.read_only {
                continue;
            }
            factory.write_back(obj.backend_handle, &obj.ranges);
        }
    }

    pub fn advance_frame(&self) {
        self.inner.lock().unwrap().current_frame += 1;
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFactory;
    impl ObjectFactory for NullFactory {
        fn create(&self, _ranges: &[AddrRange], _params: &[u64; PARAMS_MAX]) -> u64 {
            1
        }
        fn update(&self, _backend_handle: u64, _ranges: &[AddrRange], _params: &[u64; PARAMS_MAX]) {}
        fn destroy(&self, _backend_handle: u64) {}
    }

    #[test]
    fn decision_table_known_pairs() {
        assert_eq!(classify(ObjectKind::Label, Overlap::Equals, ObjectKind::Label), Some(Decision::DeleteAll));
        assert_eq!(
            classify(ObjectKind::StorageTexture, Overlap::Equals, ObjectKind::Texture),
            Some(Decision::OverlapFromObjects)
        );
        assert_eq!(classify(ObjectKind::Texture, Overlap::Equals, ObjectKind::Label), None);
    }

    #[test]
    fn repeated_create_with_same_kind_reuses_object() {
        let cache = GpuMemoryCache::new(PageWatcher::new());
        let factory = NullFactory;
        let ranges = vec![AddrRange::new(0x1000, 0x100)];
        cache.create_object(ObjectKind::Texture, &ranges, [0; PARAMS_MAX], false, &factory);
        cache.create_object(ObjectKind::Texture, &ranges, [0; PARAMS_MAX], false, &factory);
        assert_eq!(cache.object_count(), 1);
    }

    #[test]
    fn label_contained_in_storage_buffer_deletes_label() {
        let cache = GpuMemoryCache::new(PageWatcher::new());
        let factory = NullFactory;
        cache.create_object(ObjectKind::Label, &[AddrRange::new(0x1000, 0x10)], [0; PARAMS_MAX], false, &factory);
        cache.create_object(ObjectKind::StorageBuffer, &[AddrRange::new(0x1000, 0x1000)], [0; PARAMS_MAX], false, &factory);
        assert_eq!(cache.object_count(), 1);
    }

    #[test]
    fn params_round_trip_through_update() {
        struct RecordingFactory;
        impl ObjectFactory for RecordingFactory {
            fn create(&self, _ranges: &[AddrRange], _params: &[u64; PARAMS_MAX]) -> u64 {
                7
            }
            fn update(&self, _backend_handle: u64, _ranges: &[AddrRange], params: &[u64; PARAMS_MAX]) {
                assert_eq!(params[0], 42);
            }
            fn destroy(&self, _backend_handle: u64) {}
        }
        let cache = GpuMemoryCache::new(PageWatcher::new());
        let ranges = vec![AddrRange::new(0x2000, 0x100)];
        let mut params = [0u64; PARAMS_MAX];
        params[0] = 42;
        cache.create_object(ObjectKind::VertexBuffer, &ranges, params, false, &RecordingFactory);
        cache.create_object(ObjectKind::VertexBuffer, &ranges, params, false, &RecordingFactory);
    }
}
