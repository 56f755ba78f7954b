// End-of-pipe label writes: the guest-visible value an EVENT_WRITE_EOP/
// EVENT_WRITE_EOS/RELEASE_MEM packet deposits at a guest address once
// the work preceding it on the ring has retired, plus the explicit
// label objects the render engine allocates for its own completion
// tracking.
//
// Austin Shafer - 2024
use std::collections::HashMap;
use std::sync::Mutex;

use utils::log;

use crate::error::{GpuError, GpuResult};

/// A decoded EOP/EOS/RELEASE_MEM write: a destination guest address and
/// the 32- or 64-bit value to deposit there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfPipeEvent {
    pub dst_addr: u64,
    pub value: u64,
    pub is_64bit: bool,
}

fn addr_from_lo_hi(lo: u32, hi_bits: u32) -> u64 {
    (lo as u64) | ((hi_bits as u64 & 0xffff) << 32)
}

/// `cp_op_event_write_eop`: 5-dword body, a 64-bit destination address
/// split across words 1-2 and a 64-bit value across words 3-4.
pub fn decode_event_write_eop(body: &[u32]) -> GpuResult<EndOfPipeEvent> {
    if body.len() < 5 {
        return Err(GpuError::RING_OVERRUN);
    }
    Ok(EndOfPipeEvent {
        dst_addr: addr_from_lo_hi(body[1], body[2] & 0xffff),
        value: (body[3] as u64) | ((body[4] as u64) << 32),
        is_64bit: true,
    })
}

/// `cp_op_event_write_eos`: 4-dword body, a 64-bit destination address
/// split across words 1-2 and a 32-bit value in word 3.
pub fn decode_event_write_eos(body: &[u32]) -> GpuResult<EndOfPipeEvent> {
    if body.len() < 4 {
        return Err(GpuError::RING_OVERRUN);
    }
    Ok(EndOfPipeEvent {
        dst_addr: addr_from_lo_hi(body[1], body[2] & 0xffff),
        value: body[3] as u64,
        is_64bit: false,
    })
}

/// `cp_op_release_mem`: 6-dword body, a 64-bit destination address
/// split across words 2-3 and a 64-bit value across words 4-5.
pub fn decode_release_mem(body: &[u32]) -> GpuResult<EndOfPipeEvent> {
    if body.len() < 6 {
        return Err(GpuError::RING_OVERRUN);
    }
    Ok(EndOfPipeEvent {
        dst_addr: (body[2] as u64) | ((body[3] as u64) << 32),
        value: (body[4] as u64) | ((body[5] as u64) << 32),
        is_64bit: true,
    })
}

/// Deposits `event`'s value at its destination guest address. The
/// original defers this to a worker thread polling a `vkEvent` the
/// backend signals once the preceding draws actually retire; this
/// port's ring decode is synchronous with no separate completion
/// latency to model, so the write happens immediately at decode time.
pub fn signal(event: &EndOfPipeEvent) {
    if event.is_64bit {
        unsafe {
            *(event.dst_addr as *mut u64) = event.value;
        }
        log::debug!("EndOfPipe signal: [{:#x}] <- {:#x}", event.dst_addr, event.value);
    } else {
        unsafe {
            *(event.dst_addr as *mut u32) = event.value as u32;
        }
        log::debug!("EndOfPipe signal: [{:#x}] <- {:#x}", event.dst_addr, event.value as u32);
    }
}

/// `cp_op_event_write`: a bare event trigger with no memory write,
/// used for cache-flush/invalidate notifications that are already
/// fully handled elsewhere in this port's synchronous ring decode
/// (`AcquireMem` covers the cache-action side). Only the event
/// type/index pairs actually observed in practice are accepted.
pub fn trigger_event(event_type: u32, event_index: u32) -> GpuResult<()> {
    match (event_type, event_index) {
        (0x16, 0x7) | (0x31, 0x7) => {
            log::debug!("trigger_event: cache flush+invalidate (pixel data)");
            Ok(())
        }
        (0x2c, 0x7) => {
            log::debug!("trigger_event: flush+invalidate db meta");
            Ok(())
        }
        _ => {
            log::error!("trigger_event: unrecognised event_type={:#x} event_index={:#x}", event_type, event_index);
            Err(GpuError::UNKNOWN_LABEL)
        }
    }
}

/// An explicitly allocated label: a guest address the render engine
/// wants to write a fixed value to once some later condition (frame
/// presented, resource reusable) is met, with optional before/after
/// callbacks. Grounded on `Objects/Label.cpp`'s `Label`/`LabelManager`,
/// minus the background polling thread — `set` performs the write (and
/// runs the callbacks) immediately, since this port has no separate
/// GPU-side event object to wait on.
struct Label {
    dst_addr: u64,
    value: u64,
    is_64bit: bool,
    args: [u64; 4],
}

#[derive(Default)]
pub struct LabelManager {
    next_id: u64,
    labels: HashMap<u64, Label>,
}

impl LabelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, dst_addr: u64, value: u64, is_64bit: bool, args: [u64; 4]) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.labels.insert(id, Label { dst_addr, value, is_64bit, args });
        id
    }

    pub fn delete(&mut self, id: u64) {
        self.labels.remove(&id);
    }

    /// `LabelManager::Set`: writes the label's value to its guest
    /// address, running `before`/`after` around the write the way the
    /// original's callback_1/callback_2 bracket it — `before` returning
    /// `false` suppresses the write, matching `callback_1`'s veto.
    pub fn set<F1, F2>(&self, id: u64, before: Option<F1>, after: Option<F2>) -> GpuResult<()>
    where
        F1: FnOnce(&[u64; 4]) -> bool,
        F2: FnOnce(&[u64; 4]),
    {
        let label = self.labels.get(&id).ok_or(GpuError::UNKNOWN_LABEL)?;
        let write = before.map(|f| f(&label.args)).unwrap_or(true);
        if write {
            signal(&EndOfPipeEvent { dst_addr: label.dst_addr, value: label.value, is_64bit: label.is_64bit });
        }
        if let Some(after) = after {
            after(&label.args);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Process-wide label registry the command processor's `dispatch`
/// reaches through for explicitly-created labels (render-engine
/// allocated, rather than ring-decoded EOP/EOS writes). A single mutex
/// rather than per-`CommandProcessor` state since labels outlive any
/// one ring submission and are shared across the DE/CE/compute rings.
pub static LABELS: Mutex<Option<LabelManager>> = Mutex::new(None);

pub fn with_labels<R>(f: impl FnOnce(&mut LabelManager) -> R) -> R {
    let mut guard = LABELS.lock().unwrap();
    f(guard.get_or_insert_with(LabelManager::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_eop_splits_addr_and_value() {
        let body = [0, 0x1000, 0, 0xdead_beef, 0x1];
        let ev = decode_event_write_eop(&body).unwrap();
        assert_eq!(ev.dst_addr, 0x1000);
        assert_eq!(ev.value, 0x1_dead_beef);
        assert!(ev.is_64bit);
    }

    #[test]
    fn decode_eos_is_32bit() {
        let body = [0, 0x2000, 0, 0x42];
        let ev = decode_event_write_eos(&body).unwrap();
        assert_eq!(ev.dst_addr, 0x2000);
        assert_eq!(ev.value, 0x42);
        assert!(!ev.is_64bit);
    }

    #[test]
    fn trigger_event_rejects_unknown_pair() {
        assert!(trigger_event(0xff, 0x7).is_err());
        assert!(trigger_event(0x16, 0x7).is_ok());
    }

    #[test]
    fn label_set_runs_callbacks_in_order() {
        let mut dest: u64 = 0;
        let mut mgr = LabelManager::new();
        let id = mgr.create(&mut dest as *mut u64 as u64, 77, true, [0; 4]);
        mgr.set(id, Some(|_: &[u64; 4]| true), None::<fn(&[u64; 4])>).unwrap();
        assert_eq!(dest, 77);
    }

    #[test]
    fn label_set_veto_suppresses_write() {
        let mut dest: u64 = 5;
        let mut mgr = LabelManager::new();
        let id = mgr.create(&mut dest as *mut u64 as u64, 77, true, [0; 4]);
        mgr.set(id, Some(|_: &[u64; 4]| false), None::<fn(&[u64; 4])>).unwrap();
        assert_eq!(dest, 5);
    }
}
