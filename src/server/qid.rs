//! Qid allocation
//!
//! Server-unique 64-bit path identifiers plus per-file version counters.
//! The same path string always maps to the same identifier for the life of
//! the registry, and versions only ever grow.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::proto::Qid;

pub struct QidRegistry {
    entries: Mutex<Entries>,
}

struct Entries {
    next_id: u64,
    by_path: HashMap<String, (u64, u32)>,
}

impl QidRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries { next_id: 1, by_path: HashMap::new() }),
        }
    }

    /// Qid for a path, allocating the identifier on first sight.
    pub fn qid(&self, path: &str, qtype: u8) -> Qid {
        let mut guard = self.entries.lock();
        let entries = &mut *guard;
        let next = &mut entries.next_id;
        let (id, version) = *entries.by_path.entry(path.to_string()).or_insert_with(|| {
            let id = *next;
            *next += 1;
            (id, 0)
        });
        Qid { qtype, version, path: id }
    }

    /// Bump a file's version after a modification.
    pub fn bump(&self, path: &str) {
        let mut guard = self.entries.lock();
        let entries = &mut *guard;
        let next = &mut entries.next_id;
        let entry = entries.by_path.entry(path.to_string()).or_insert_with(|| {
            let id = *next;
            *next += 1;
            (id, 0)
        });
        entry.1 = entry.1.wrapping_add(1);
    }
}

impl Default for QidRegistry {
    fn default() -> Self {
        Self::new()
    }
}
