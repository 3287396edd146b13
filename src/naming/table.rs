//! Bidirectional mapping between original relative paths and short identifiers.

use super::{IdGenerator, ShortId, MAX_REDRAWS};
use crate::error::{Result, StageError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Kind of a staged entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}

/// One row of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMappingEntry {
    pub path: String,
    pub short_id: ShortId,
    pub kind: EntryKind,
}

/// Authoritative `{relative path <-> short identifier}` mapping for one run.
///
/// Rows are never mutated once inserted. Assigning an already mapped path
/// returns the existing identifier, which is what makes resumed runs reuse
/// their names.
#[derive(Debug, Default)]
pub struct NameTable {
    forward: HashMap<String, NameMappingEntry>,
    reverse: HashMap<ShortId, String>,
    // Walk order, for listings
    order: Vec<String>,
    // Rows from an earlier run, promoted when their path is seen again
    reserved: HashMap<String, NameMappingEntry>,
    reserved_ids: HashSet<ShortId>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `path`, drawing fresh identifiers from `gen` until one is free.
    pub fn assign(&mut self, path: &str, kind: EntryKind, gen: &mut IdGenerator) -> Result<ShortId> {
        if let Some(existing) = self.forward.get(path) {
            if existing.kind != kind {
                return Err(StageError::skippable(
                    path,
                    format!(
                        "already mapped as a {}, now a {}",
                        existing.kind.as_str(),
                        kind.as_str()
                    ),
                ));
            }
            return Ok(existing.short_id.clone());
        }

        if let Some(reserved) = self.reserved.remove(path) {
            if reserved.kind == kind {
                let id = reserved.short_id.clone();
                self.insert_unchecked(reserved);
                return Ok(id);
            }
            // Kind changed since the earlier run; the old id stays reserved
            tracing::debug!("{} changed kind since last run, assigning a new identifier", path);
        }

        let taken = self.reverse.len() + self.reserved_ids.len();
        if (taken as u128) >= gen.space() {
            return Err(StageError::IdentifierSpaceExhausted {
                attempts: 0,
                length: gen.length(),
            });
        }

        for attempt in 0..MAX_REDRAWS {
            let candidate = gen.next_id();
            if self.reverse.contains_key(&candidate) || self.reserved_ids.contains(&candidate) {
                tracing::trace!(
                    "Identifier {} already live, redrawing (attempt {})",
                    candidate,
                    attempt + 1
                );
                continue;
            }
            self.insert_unchecked(NameMappingEntry {
                path: path.to_string(),
                short_id: candidate.clone(),
                kind,
            });
            return Ok(candidate);
        }

        Err(StageError::IdentifierSpaceExhausted {
            attempts: MAX_REDRAWS,
            length: gen.length(),
        })
    }

    /// Hold a row persisted by an earlier run.
    ///
    /// The row becomes live when `assign` is called for its path; until then
    /// its identifier is never handed to another path. Fails if either side
    /// of the pair is already bound to something else.
    pub fn reserve(&mut self, entry: NameMappingEntry) -> Result<()> {
        let path_taken = self
            .forward
            .get(&entry.path)
            .or_else(|| self.reserved.get(&entry.path));
        if let Some(existing) = path_taken {
            if existing == &entry {
                return Ok(());
            }
            return Err(StageError::Config(format!(
                "path {} is already mapped to {}",
                entry.path, existing.short_id
            )));
        }
        if self.reverse.contains_key(&entry.short_id) || self.reserved_ids.contains(&entry.short_id) {
            return Err(StageError::Config(format!(
                "identifier {} is already mapped",
                entry.short_id
            )));
        }
        self.reserved_ids.insert(entry.short_id.clone());
        self.reserved.insert(entry.path.clone(), entry);
        Ok(())
    }

    /// Number of reserved rows not (yet) seen in this run
    pub fn reserved_len(&self) -> usize {
        self.reserved.len()
    }

    fn insert_unchecked(&mut self, entry: NameMappingEntry) {
        self.reverse
            .insert(entry.short_id.clone(), entry.path.clone());
        self.order.push(entry.path.clone());
        self.forward.insert(entry.path.clone(), entry);
    }

    pub fn lookup(&self, path: &str) -> Option<&ShortId> {
        self.forward.get(path).map(|e| &e.short_id)
    }

    pub fn reverse_lookup(&self, id: &ShortId) -> Option<&str> {
        self.reverse.get(id).map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&NameMappingEntry> {
        self.forward.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.forward.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Rows in insertion (walk) order.
    pub fn entries(&self) -> impl Iterator<Item = &NameMappingEntry> {
        self.order.iter().filter_map(|p| self.forward.get(p))
    }

    /// Rows sorted by path
    pub fn sorted_entries(&self) -> Vec<NameMappingEntry> {
        let mut rows: Vec<NameMappingEntry> = self.forward.values().cloned().collect();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows
    }

    /// Write the table as pretty JSON for audit (atomic write).
    pub fn export(&self, path: &Path) -> Result<()> {
        let temp_file = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_file)?;
            serde_json::to_writer_pretty(&mut file, &self.sorted_entries())?;
            writeln!(file)?;
        }
        fs::rename(&temp_file, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn gen() -> IdGenerator {
        IdGenerator::seeded(8, 1).unwrap()
    }

    #[test]
    fn test_assign_and_lookup() {
        let mut table = NameTable::new();
        let mut gen = gen();

        let id = table.assign("sub/b.txt", EntryKind::File, &mut gen).unwrap();
        assert_eq!(table.lookup("sub/b.txt"), Some(&id));
        assert_eq!(table.reverse_lookup(&id), Some("sub/b.txt"));
        assert_eq!(table.lookup("missing"), None);
    }

    #[test]
    fn test_assign_is_idempotent() {
        let mut table = NameTable::new();
        let mut gen = gen();

        let first = table.assign("a.txt", EntryKind::File, &mut gen).unwrap();
        let second = table.assign("a.txt", EntryKind::File, &mut gen).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_kind_change_is_rejected() {
        let mut table = NameTable::new();
        let mut gen = gen();

        table.assign("thing", EntryKind::File, &mut gen).unwrap();
        let err = table
            .assign("thing", EntryKind::Directory, &mut gen)
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_collisions_are_redrawn_not_overwritten() {
        // One-character ids: 36 possible tokens, so collisions are constant
        let mut table = NameTable::new();
        let mut gen = IdGenerator::seeded(1, 99).unwrap();

        let mut seen = HashSet::new();
        for i in 0..36 {
            let id = table
                .assign(&format!("f{}", i), EntryKind::File, &mut gen)
                .unwrap();
            assert!(seen.insert(id), "identifier handed out twice");
        }
        assert_eq!(table.len(), 36);

        let err = table.assign("f36", EntryKind::File, &mut gen).unwrap_err();
        assert!(matches!(err, StageError::IdentifierSpaceExhausted { .. }));
        // Nothing was aliased
        for i in 0..36 {
            let path = format!("f{}", i);
            let id = table.lookup(&path).unwrap().clone();
            assert_eq!(table.reverse_lookup(&id), Some(path.as_str()));
        }
    }

    #[test]
    fn test_reserve_rejects_conflicts() {
        let mut table = NameTable::new();
        let id = ShortId::try_from("AAAA0001".to_string()).unwrap();
        let row = NameMappingEntry {
            path: "a.txt".into(),
            short_id: id.clone(),
            kind: EntryKind::File,
        };
        table.reserve(row.clone()).unwrap();

        // Same row again is fine
        table.reserve(row).unwrap();

        // Same id, different path
        assert!(table
            .reserve(NameMappingEntry {
                path: "b.txt".into(),
                short_id: id,
                kind: EntryKind::File,
            })
            .is_err());
    }

    #[test]
    fn test_reserved_row_is_reused_on_assign() {
        let mut table = NameTable::new();
        let mut gen = gen();
        let id = ShortId::try_from("KEEP0001".to_string()).unwrap();
        table
            .reserve(NameMappingEntry {
                path: "old.txt".into(),
                short_id: id.clone(),
                kind: EntryKind::File,
            })
            .unwrap();

        // Reserved rows are not live
        assert!(table.is_empty());
        assert_eq!(table.reserved_len(), 1);

        assert_eq!(table.assign("old.txt", EntryKind::File, &mut gen).unwrap(), id);
        assert_eq!(table.len(), 1);
        assert_eq!(table.reserved_len(), 0);
        assert_eq!(table.reverse_lookup(&id), Some("old.txt"));
    }

    #[test]
    fn test_reserved_ids_are_never_redrawn() {
        let mut table = NameTable::new();
        let mut probe = IdGenerator::seeded(8, 5).unwrap();
        let taken = probe.next_id();
        table
            .reserve(NameMappingEntry {
                path: "old.txt".into(),
                short_id: taken.clone(),
                kind: EntryKind::File,
            })
            .unwrap();

        // Same seed draws `taken` first; the table must skip it
        let mut gen = IdGenerator::seeded(8, 5).unwrap();
        let fresh = table.assign("new.txt", EntryKind::File, &mut gen).unwrap();
        assert_ne!(fresh, taken);
    }

    #[test]
    fn test_reserved_row_with_new_kind_gets_fresh_id() {
        let mut table = NameTable::new();
        let mut gen = gen();
        let id = ShortId::try_from("WAS0FILE".to_string()).unwrap();
        table
            .reserve(NameMappingEntry {
                path: "thing".into(),
                short_id: id.clone(),
                kind: EntryKind::File,
            })
            .unwrap();

        let fresh = table.assign("thing", EntryKind::Directory, &mut gen).unwrap();
        assert_ne!(fresh, id);
        assert_eq!(table.get("thing").unwrap().kind, EntryKind::Directory);
    }

    #[test]
    fn test_export_sorted_json() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = NameTable::new();
        let mut gen = gen();
        table.assign("z.txt", EntryKind::File, &mut gen).unwrap();
        table.assign("a", EntryKind::Directory, &mut gen).unwrap();

        let out = tmp.path().join("mapping.json");
        table.export(&out).unwrap();

        let rows: Vec<NameMappingEntry> =
            serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].path, "a");
        assert_eq!(rows[0].kind, EntryKind::Directory);
        assert_eq!(rows[1].path, "z.txt");
    }

    proptest! {
        #[test]
        fn prop_reverse_lookup_round_trips(paths in proptest::collection::hash_set("[a-z]{1,6}(/[a-z]{1,6}){0,3}", 1..64)) {
            let mut table = NameTable::new();
            let mut gen = IdGenerator::seeded(8, 3).unwrap();
            let mut ids = HashSet::new();
            for p in &paths {
                let id = table.assign(p, EntryKind::File, &mut gen).unwrap();
                prop_assert_eq!(table.reverse_lookup(&id), Some(p.as_str()));
                ids.insert(id);
            }
            prop_assert_eq!(ids.len(), paths.len());
            prop_assert_eq!(table.len(), paths.len());
        }
    }
}
