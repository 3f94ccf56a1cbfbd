//! Backend selection strategies
//!
//! Both strategies only consider backends active in this process whose
//! admission test passes with a load in `[0, MAX_LOAD]`.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::{Backend, MAX_LOAD};
use crate::entry::StoreEntry;

/// Payload size to place and whether it is final
pub(crate) fn placement_size(entry: &StoreEntry) -> (u64, bool) {
    entry.size_hint()
}

fn acceptable_load(backend: &dyn Backend, entry: &StoreEntry, size: u64) -> Option<u32> {
    if !backend.is_active_in_this_process() {
        return None;
    }
    backend.can_store(entry, size).filter(|load| *load <= MAX_LOAD)
}

/// First acceptable backend, starting one past where the previous call started
///
/// The cursor advances once per selection, not once per candidate, so a
/// backend that keeps rejecting does not push its traffic onto one neighbor.
pub(crate) fn round_robin(
    backends: &[Box<dyn Backend>],
    entry: &StoreEntry,
    cursor: &AtomicUsize,
) -> Option<usize> {
    if backends.is_empty() {
        return None;
    }
    let (size, _) = placement_size(entry);
    let first = cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % backends.len();

    (0..backends.len())
        .map(|i| (first + i) % backends.len())
        .find(|&index| acceptable_load(backends[index].as_ref(), entry, size).is_some())
}

/// Least loaded backend
///
/// Equal loads prefer the tightest max object size for known sizes (the
/// widest for sizes still growing), then the most free bytes.
pub(crate) fn least_load(backends: &[Box<dyn Backend>], entry: &StoreEntry) -> Option<usize> {
    let (size, known) = placement_size(entry);
    let mut chosen: Option<usize> = None;
    let mut least_load = u32::MAX;
    let mut best_object_size: Option<u64> = None;
    let mut most_free = 0u64;

    for (index, backend) in backends.iter().enumerate() {
        backend.set_selected(false);

        let Some(load) = acceptable_load(backend.as_ref(), entry, size) else {
            continue;
        };
        if load > least_load {
            continue;
        }

        let free = backend.max_size().saturating_sub(backend.current_size());
        if load == least_load {
            if let Some(best) = best_object_size {
                let object_size = backend.max_object_size();
                if (known && object_size > best) || (!known && object_size < best) {
                    continue;
                }
            }
            if free < most_free {
                continue;
            }
        }

        least_load = load;
        best_object_size = Some(backend.max_object_size());
        most_free = free;
        chosen = Some(index);
    }

    if let Some(index) = chosen {
        backends[index].set_selected(true);
    }
    chosen
}
