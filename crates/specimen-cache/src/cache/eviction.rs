//! Least-recently-used eviction planning.
//!
//! Victims are chosen in ascending order of last access. Entries with equal
//! access stamps are evicted larger-first so fewer files need to go. Pinned
//! entries (copies currently handed out to a reader) are never chosen.

/// View of one cache entry as seen by the eviction planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: String,
    pub last_access: u64,
    pub size: u64,
    pub pinned: bool,
}

/// Pick the entries to delete so that `incoming_bytes` fit under `max_bytes`.
///
/// Returns `Some(vec![])` when nothing needs to go and `None` when the budget
/// cannot be met (the incoming object alone exceeds the ceiling, or too much of
/// the cache is pinned).
pub fn plan_eviction(
    candidates: &[EvictionCandidate],
    current_bytes: u64,
    incoming_bytes: u64,
    max_bytes: u64,
) -> Option<Vec<String>> {
    if incoming_bytes > max_bytes {
        return None;
    }

    let needed = current_bytes.saturating_add(incoming_bytes).saturating_sub(max_bytes);
    if needed == 0 {
        return Some(Vec::new());
    }

    let mut ordered: Vec<&EvictionCandidate> = candidates.iter().filter(|c| !c.pinned).collect();
    ordered.sort_by(|a, b| {
        a.last_access
            .cmp(&b.last_access)
            .then_with(|| b.size.cmp(&a.size))
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for candidate in ordered {
        if freed >= needed {
            break;
        }
        freed += candidate.size;
        victims.push(candidate.key.clone());
    }

    if freed >= needed { Some(victims) } else { None }
}
