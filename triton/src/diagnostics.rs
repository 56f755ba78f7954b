// The abort-with-stack-trace channel an unresolved access violation
// falls through to: `vmem`'s process-wide handler returns `false` to
// signal "this wasn't a dirty-page fault", and this is where the
// process actually goes down, attaching whatever image attribution
// the loader's `ExceptionHandler::install` calls recorded.
//
// Austin Shafer - 2024
use std::sync::Mutex;

use utils::log;
use vmem::ExceptionInfo;

struct ImageRange {
    base: u64,
    size: u64,
    name: String,
}

static IMAGE_RANGES: Mutex<Vec<ImageRange>> = Mutex::new(Vec::new());

/// Registers an image's address range for `{:#x}`-formatted
/// attribution in a later abort report. Called once per loaded
/// program, alongside the loader's own `ExceptionHandler::install`.
pub fn register_image(name: &str, base: u64, size: u64) {
    IMAGE_RANGES.lock().unwrap().push(ImageRange {
        base,
        size,
        name: name.to_string(),
    });
}

fn attribute(vaddr: u64) -> Option<String> {
    let ranges = IMAGE_RANGES.lock().unwrap();
    ranges
        .iter()
        .find(|r| vaddr >= r.base && vaddr < r.base + r.size)
        .map(|r| format!("{} (+{:#x})", r.name, vaddr - r.base))
}

/// Logs a final diagnostic line and aborts the process. Never returns.
pub fn abort(info: &ExceptionInfo) -> ! {
    let attribution = attribute(info.fault_pc).unwrap_or_else(|| "<unknown image>".to_string());
    log::error!(
        "unresolved {:?}/{:?} at fault_pc={:#x} faulting_vaddr={:#x} in {}",
        info.exception_type,
        info.access_violation_type,
        info.fault_pc,
        info.faulting_vaddr,
        attribution
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribution_matches_registered_range() {
        register_image("test-image", 0x1000, 0x1000);
        assert_eq!(attribute(0x1080), Some("test-image (+0x80)".to_string()));
        assert_eq!(attribute(0x5000), None);
    }
}
