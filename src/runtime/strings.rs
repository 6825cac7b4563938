//! Two-region string interning.
//!
//! All strings are interned; equality of interned strings is id equality.
//! Strings interned during compilation are promoted to the "old" region,
//! which is never swept; strings created at runtime live in the "young"
//! region and are reclaimed by the collector when unreachable.

use std::collections::HashSet;

use crate::runtime::value::StrId;

#[derive(Debug, Default)]
pub struct Interner {
    slots: Vec<Option<Box<str>>>,
    /// Reusable young slots freed by the collector.
    free: Vec<u32>,
    /// Sorted ids of the permanent region.
    old: Vec<StrId>,
    /// Sorted ids of the collectable region.
    young: Vec<StrId>,
    /// Slots below this index belong to the old region.
    watermark: usize,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning the id of its unique copy.
    pub fn intern(&mut self, s: &str) -> StrId {
        let slots = &self.slots;
        let by_bytes = |id: &StrId| slots[id.0 as usize].as_deref().unwrap_or("").cmp(s);

        if let Ok(i) = self.old.binary_search_by(by_bytes) {
            return self.old[i];
        }
        match self.young.binary_search_by(by_bytes) {
            Ok(i) => self.young[i],
            Err(insert_at) => {
                let id = match self.free.pop() {
                    Some(slot) => {
                        self.slots[slot as usize] = Some(s.into());
                        StrId(slot)
                    }
                    None => {
                        self.slots.push(Some(s.into()));
                        StrId((self.slots.len() - 1) as u32)
                    }
                };
                self.young.insert(insert_at, id);
                id
            }
        }
    }

    /// The text behind an id. Freed slots read as the empty string.
    pub fn get(&self, id: StrId) -> &str {
        self.slots
            .get(id.0 as usize)
            .and_then(|s| s.as_deref())
            .unwrap_or("")
    }

    /// Promote every young string to the permanent region. Called once,
    /// after all modules have compiled.
    pub fn promote(&mut self) {
        let young = std::mem::take(&mut self.young);
        let old = std::mem::take(&mut self.old);
        self.old = merge_sorted(&self.slots, old, young);
        self.watermark = self.slots.len();
    }

    pub fn is_young(&self, id: StrId) -> bool {
        (id.0 as usize) >= self.watermark
    }

    /// Drop young strings not present in `live`, compacting the young index.
    pub fn sweep(&mut self, live: &HashSet<StrId>) {
        let slots = &mut self.slots;
        let free = &mut self.free;
        self.young.retain(|id| {
            if live.contains(id) {
                true
            } else {
                slots[id.0 as usize] = None;
                free.push(id.0);
                false
            }
        });
    }

    pub fn young_len(&self) -> usize {
        self.young.len()
    }

    pub fn old_len(&self) -> usize {
        self.old.len()
    }
}

fn merge_sorted(slots: &[Option<Box<str>>], a: Vec<StrId>, b: Vec<StrId>) -> Vec<StrId> {
    let text = |id: StrId| slots[id.0 as usize].as_deref().unwrap_or("");
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if text(a[i]) <= text(b[j]) {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn interning_is_idempotent() {
        let mut table = Interner::new();
        let a = table.intern("hello");
        let b = table.intern("world");
        let c = table.intern("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.get(a), "hello");
        assert_eq!(table.get(b), "world");
    }

    #[test]
    fn promote_then_sweep_keeps_old_strings() {
        let mut table = Interner::new();
        let a = table.intern("compile-time");
        table.promote();
        let b = table.intern("run-time");
        assert!(!table.is_young(a));
        assert!(table.is_young(b));

        table.sweep(&HashSet::new());
        assert_eq!(table.get(a), "compile-time");
        assert_eq!(table.young_len(), 0);

        // the freed slot is reusable
        let c = table.intern("another");
        assert_eq!(table.get(c), "another");
    }

    #[test]
    fn sweep_retains_live_young_strings() {
        let mut table = Interner::new();
        table.promote();
        let a = table.intern("keep");
        let b = table.intern("drop");
        let mut live = HashSet::new();
        live.insert(a);
        table.sweep(&live);
        assert_eq!(table.get(a), "keep");
        assert_eq!(table.get(b), "");
        assert_eq!(table.young_len(), 1);
    }

    proptest! {
        #[test]
        fn ids_equal_iff_bytes_equal(words in proptest::collection::vec("[a-z]{0,8}", 0..40)) {
            let mut table = Interner::new();
            let ids: Vec<_> = words.iter().map(|w| table.intern(w)).collect();
            for (i, a) in words.iter().enumerate() {
                for (j, b) in words.iter().enumerate() {
                    prop_assert_eq!(ids[i] == ids[j], a == b);
                }
            }
        }

        #[test]
        fn intern_of_intern_is_identity(words in proptest::collection::vec(".{0,12}", 0..20)) {
            let mut table = Interner::new();
            for w in &words {
                let id = table.intern(w);
                let text = table.get(id).to_string();
                prop_assert_eq!(table.intern(&text), id);
            }
        }
    }
}
