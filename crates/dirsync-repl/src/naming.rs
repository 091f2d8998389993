//! Resolution of naming conflicts between concurrently applied
//! add/delete/rename operations.
//!
//! Resolution is always local and deterministic from the entry unique id,
//! the CSN and the current directory state; no network round-trip is ever
//! needed. The losing entry of a DN collision is parked under a synthetic
//! conflict DN and carries its intended DN in the `ds-sync-conflict`
//! attribute, so a later delete of the winner can restore it.

use std::sync::Arc;

use tracing::{debug, error, info};

use dirsync_proto::msg::{AddMsg, DeleteMsg, ModifyDnMsg};

use crate::entry::{parent_dn, rdn, AttrRegistry, Entry, CONFLICT_ATTR};
use crate::entry_history::EntryHistorical;
use crate::metrics::{Counter, ReplicationMonitor};
use crate::store::EntryStore;

/// Outcome of resolving one naming operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingOutcome {
    /// The operation applied at its intended DN.
    Applied,
    /// The operation applied, but the entry was parked under a conflict DN.
    ConflictRenamed {
        /// The conflict DN the entry now occupies.
        dn: String,
    },
    /// The operation was discarded.
    Dropped {
        /// Why it was discarded.
        reason: &'static str,
    },
}

/// The synthetic DN a conflict loser is parked under.
pub fn conflict_dn(uuid: &str, original_dn: &str, suffix: &str) -> String {
    format!("entryuuid={uuid}+{},{suffix}", rdn(original_dn))
}

/// Resolves naming conflicts for one replicated suffix.
pub struct NamingResolver<S> {
    store: Arc<S>,
    suffix: String,
    registry: AttrRegistry,
    monitor: Arc<dyn ReplicationMonitor>,
}

impl<S: EntryStore> NamingResolver<S> {
    /// Create a resolver rooted at `suffix`.
    pub fn new(
        store: Arc<S>,
        suffix: impl Into<String>,
        registry: AttrRegistry,
        monitor: Arc<dyn ReplicationMonitor>,
    ) -> Self {
        Self { store, suffix: suffix.into(), registry, monitor }
    }

    /// Apply a replicated entry addition.
    pub fn apply_add(&self, msg: &AddMsg) -> NamingOutcome {
        let csn = msg.header.csn;
        let uuid = &msg.header.entry_uuid;
        let dn = &msg.header.dn;
        if self.store.get_by_uuid(uuid).is_some() {
            debug!(%uuid, "add already applied, dropping replayed duplicate");
            return NamingOutcome::Dropped { reason: "duplicate add" };
        }

        let mut entry = Entry::new(dn.clone(), uuid.clone());
        for attr in &msg.attributes {
            entry.set_attribute(&attr.name, attr.values.clone());
        }
        let mut hist = EntryHistorical::from_entry(&entry, &self.registry);
        hist.set_entry_add_csn(csn);
        hist.attach_to(&mut entry, 0);

        // Parent deleted concurrently: park the orphan instead of rejecting.
        if let Some(parent) = parent_dn(dn) {
            if !parent.eq_ignore_ascii_case(&self.suffix) && self.store.get_by_dn(parent).is_none()
            {
                return self.park(entry, dn, "parent missing");
            }
        }

        match self.store.get_by_dn(dn) {
            None => {
                self.store.put(entry);
                NamingOutcome::Applied
            }
            Some(existing) => {
                // Two replicas created the same DN with different ids. The
                // identity created first keeps the DN.
                let existing_csn = EntryHistorical::from_entry(&existing, &self.registry)
                    .newest_csn()
                    .unwrap_or_default();
                if csn < existing_csn {
                    let parked = self.park(existing.clone(), dn, "lost add-add conflict");
                    if matches!(parked, NamingOutcome::Dropped { .. }) {
                        return parked;
                    }
                    self.store.put(entry);
                    NamingOutcome::Applied
                } else {
                    self.park(entry, dn, "lost add-add conflict")
                }
            }
        }
    }

    /// Apply a replicated deletion.
    pub fn apply_delete(&self, msg: &DeleteMsg) -> NamingOutcome {
        let uuid = &msg.header.entry_uuid;
        let Some(target) = self.store.get_by_uuid(uuid) else {
            debug!(%uuid, "delete target already gone");
            return NamingOutcome::Dropped { reason: "already deleted" };
        };
        if msg.subtree {
            for descendant in self.store.subtree_of(&target.dn) {
                self.store.remove(&descendant.uuid);
            }
            self.store.remove(uuid);
        } else {
            // Children concurrently added under the deleted entry become
            // orphans and are parked under conflict DNs.
            for child in self.store.children_of(&target.dn) {
                let child_dn = child.dn.clone();
                self.park(child, &child_dn, "parent deleted");
            }
            self.store.remove(uuid);
        }
        self.restore_conflict_loser(&target.dn);
        NamingOutcome::Applied
    }

    /// Apply a replicated rename.
    pub fn apply_modify_dn(&self, msg: &ModifyDnMsg) -> NamingOutcome {
        let csn = msg.header.csn;
        let uuid = &msg.header.entry_uuid;
        let Some(mut entry) = self.store.get_by_uuid(uuid) else {
            debug!(%uuid, "rename target gone, dropping");
            return NamingOutcome::Dropped { reason: "entry gone" };
        };
        let mut hist = EntryHistorical::from_entry(&entry, &self.registry);
        // A rename older than one already applied arrived out of order; the
        // logically-later rename already won.
        let governing = hist.entry_moddn_csn();
        if governing.is_some_and(|g| csn <= g) {
            info!(%uuid, %csn, "discarding out-of-order rename");
            self.monitor.incr(Counter::NamingConflictsResolved);
            return NamingOutcome::Dropped { reason: "out-of-order rename" };
        }

        let parent = msg
            .new_superior
            .clone()
            .or_else(|| parent_dn(&entry.dn).map(str::to_string))
            .unwrap_or_else(|| self.suffix.clone());
        let target_dn = format!("{},{parent}", msg.new_rdn);

        apply_rdn_change(&mut entry, msg);
        hist.set_entry_moddn_csn(csn);
        hist.attach_to(&mut entry, 0);

        match self.store.get_by_dn(&target_dn) {
            Some(occupant) if occupant.uuid != *uuid => {
                self.park(entry, &target_dn, "rename target occupied")
            }
            _ => {
                let old_dn = entry.dn.clone();
                entry.dn = target_dn;
                entry.remove_attribute(CONFLICT_ATTR);
                self.store.put(entry);
                self.restore_conflict_loser(&old_dn);
                NamingOutcome::Applied
            }
        }
    }

    // Parks an entry under its conflict DN with the intended DN recorded in
    // the conflict marker attribute.
    fn park(&self, mut entry: Entry, intended_dn: &str, reason: &'static str) -> NamingOutcome {
        let parked_dn = conflict_dn(&entry.uuid, intended_dn, &self.suffix);
        if self.store.get_by_dn(&parked_dn).is_some_and(|e| e.uuid != entry.uuid) {
            // Cannot happen while uuids are unique; refuse to guess.
            error!(uuid = %entry.uuid, dn = %parked_dn, "conflict DN occupied, dropping operation");
            self.monitor.incr(Counter::NamingConflictsUnresolved);
            return NamingOutcome::Dropped { reason: "conflict DN occupied" };
        }
        info!(uuid = %entry.uuid, from = %intended_dn, to = %parked_dn, reason, "naming conflict");
        entry.set_attribute(CONFLICT_ATTR, vec![intended_dn.as_bytes().to_vec()]);
        entry.dn = parked_dn.clone();
        self.store.put(entry);
        self.monitor.incr(Counter::NamingConflictsResolved);
        NamingOutcome::ConflictRenamed { dn: parked_dn }
    }

    // When a DN becomes free, the best parked loser that wanted it is
    // promoted back and its conflict marker cleared.
    fn restore_conflict_loser(&self, freed_dn: &str) {
        let mut candidates: Vec<Entry> = self
            .store
            .all_entries()
            .into_iter()
            .filter(|e| {
                e.attribute(CONFLICT_ATTR)
                    .and_then(|vs| vs.first())
                    .is_some_and(|v| v.eq_ignore_ascii_case(freed_dn.as_bytes()))
            })
            .collect();
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by_key(|e| {
            let csn = EntryHistorical::from_entry(e, &self.registry)
                .newest_csn()
                .unwrap_or_default();
            (csn, e.uuid.clone())
        });
        let mut winner = candidates.remove(0);
        info!(uuid = %winner.uuid, dn = %freed_dn, "restoring conflict loser to its original DN");
        winner.dn = freed_dn.to_string();
        winner.remove_attribute(CONFLICT_ATTR);
        self.store.put(winner);
        self.monitor.incr(Counter::NamingConflictsResolved);
    }
}

// Applies the RDN attribute changes of a rename: the new RDN value is
// added, the old one removed when requested.
fn apply_rdn_change(entry: &mut Entry, msg: &ModifyDnMsg) {
    let old_rdn = rdn(&entry.dn).to_string();
    if let Some((attr, value)) = split_rdn(&msg.new_rdn) {
        let mut values: Vec<Vec<u8>> =
            entry.attribute(attr).map(|vs| vs.to_vec()).unwrap_or_default();
        if msg.delete_old_rdn {
            if let Some((old_attr, old_value)) = split_rdn(&old_rdn) {
                if old_attr.eq_ignore_ascii_case(attr) {
                    values.retain(|v| v != old_value.as_bytes());
                }
            }
        }
        if !values.iter().any(|v| v == value.as_bytes()) {
            values.push(value.as_bytes().to_vec());
        }
        entry.set_attribute(attr, values);
    }
}

fn split_rdn(rdn: &str) -> Option<(&str, &str)> {
    let (attr, value) = rdn.split_once('=')?;
    Some((attr.trim(), value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterMonitor;
    use crate::store::MemoryEntryStore;
    use dirsync_proto::msg::{UpdateHeader, WireAttribute};
    use dirsync_proto::Csn;

    const SUFFIX: &str = "dc=example,dc=com";

    fn csn(t: u64, replica: u16) -> Csn {
        Csn::new(t, 0, replica)
    }

    fn resolver() -> (NamingResolver<MemoryEntryStore>, Arc<MemoryEntryStore>, Arc<CounterMonitor>)
    {
        let store = Arc::new(MemoryEntryStore::new());
        let monitor = Arc::new(CounterMonitor::new());
        let resolver = NamingResolver::new(
            Arc::clone(&store),
            SUFFIX,
            AttrRegistry::new(),
            monitor.clone() as Arc<dyn ReplicationMonitor>,
        );
        (resolver, store, monitor)
    }

    fn add_msg(t: u64, replica: u16, uuid: &str, dn: &str) -> AddMsg {
        AddMsg {
            header: UpdateHeader::plain(csn(t, replica), uuid, dn),
            attributes: vec![WireAttribute {
                name: "cn".to_string(),
                values: vec![b"x".to_vec()],
            }],
        }
    }

    fn delete_msg(t: u64, replica: u16, uuid: &str, dn: &str, subtree: bool) -> DeleteMsg {
        DeleteMsg { header: UpdateHeader::plain(csn(t, replica), uuid, dn), subtree }
    }

    #[test]
    fn test_plain_add_applies() {
        let (resolver, store, _) = resolver();
        let outcome = resolver.apply_add(&add_msg(1, 1, "u1", "ou=people,dc=example,dc=com"));
        assert_eq!(outcome, NamingOutcome::Applied);
        assert!(store.get_by_dn("ou=people,dc=example,dc=com").is_some());
    }

    #[test]
    fn test_duplicate_add_dropped() {
        let (resolver, store, _) = resolver();
        resolver.apply_add(&add_msg(1, 1, "u1", "ou=p,dc=example,dc=com"));
        let outcome = resolver.apply_add(&add_msg(1, 1, "u1", "ou=p,dc=example,dc=com"));
        assert!(matches!(outcome, NamingOutcome::Dropped { .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_add_conflict_newer_loses() {
        let (resolver, store, monitor) = resolver();
        let dn = "uid=a,dc=example,dc=com";
        resolver.apply_add(&add_msg(1, 1, "u1", dn));
        let outcome = resolver.apply_add(&add_msg(2, 2, "u2", dn));
        let parked_dn = conflict_dn("u2", dn, SUFFIX);
        assert_eq!(outcome, NamingOutcome::ConflictRenamed { dn: parked_dn.clone() });

        assert_eq!(store.get_by_dn(dn).unwrap().uuid, "u1");
        let parked = store.get_by_dn(&parked_dn).unwrap();
        assert_eq!(parked.uuid, "u2");
        assert_eq!(parked.attribute(CONFLICT_ATTR).unwrap(), &[dn.as_bytes().to_vec()]);
        assert_eq!(monitor.get(Counter::NamingConflictsResolved), 1);
    }

    #[test]
    fn test_add_add_conflict_out_of_order_older_still_wins() {
        let (resolver, store, _) = resolver();
        let dn = "uid=a,dc=example,dc=com";
        // The newer add is replayed first, the older one arrives later.
        resolver.apply_add(&add_msg(5, 2, "u2", dn));
        let outcome = resolver.apply_add(&add_msg(1, 1, "u1", dn));
        assert_eq!(outcome, NamingOutcome::Applied);
        assert_eq!(store.get_by_dn(dn).unwrap().uuid, "u1");
        let parked = store.get_by_dn(&conflict_dn("u2", dn, SUFFIX)).unwrap();
        assert_eq!(parked.uuid, "u2");
    }

    #[test]
    fn test_delete_winner_restores_loser() {
        let (resolver, store, _) = resolver();
        let dn = "uid=a,dc=example,dc=com";
        resolver.apply_add(&add_msg(1, 1, "u1", dn));
        resolver.apply_add(&add_msg(2, 2, "u2", dn));

        let outcome = resolver.apply_delete(&delete_msg(3, 1, "u1", dn, false));
        assert_eq!(outcome, NamingOutcome::Applied);

        let restored = store.get_by_dn(dn).expect("loser restored to plain DN");
        assert_eq!(restored.uuid, "u2");
        assert!(restored.attribute(CONFLICT_ATTR).is_none());
        assert!(store.get_by_dn(&conflict_dn("u2", dn, SUFFIX)).is_none());
    }

    #[test]
    fn test_add_under_deleted_parent_is_parked() {
        let (resolver, store, _) = resolver();
        let outcome =
            resolver.apply_add(&add_msg(4, 2, "u9", "uid=kid,ou=gone,dc=example,dc=com"));
        match outcome {
            NamingOutcome::ConflictRenamed { dn } => {
                assert_eq!(dn, conflict_dn("u9", "uid=kid,ou=gone,dc=example,dc=com", SUFFIX));
                assert!(store.get_by_dn(&dn).is_some());
            }
            other => panic!("expected conflict rename, got {other:?}"),
        }
    }

    #[test]
    fn test_non_subtree_delete_parks_orphans() {
        let (resolver, store, _) = resolver();
        resolver.apply_add(&add_msg(1, 1, "p", "ou=p,dc=example,dc=com"));
        resolver.apply_add(&add_msg(2, 1, "c", "uid=c,ou=p,dc=example,dc=com"));

        resolver.apply_delete(&delete_msg(3, 2, "p", "ou=p,dc=example,dc=com", false));
        assert!(store.get_by_uuid("p").is_none());
        let orphan = store.get_by_uuid("c").unwrap();
        assert_eq!(orphan.dn, conflict_dn("c", "uid=c,ou=p,dc=example,dc=com", SUFFIX));
    }

    #[test]
    fn test_subtree_delete_removes_everything_cleanly() {
        let (resolver, store, monitor) = resolver();
        resolver.apply_add(&add_msg(1, 1, "p", "ou=p,dc=example,dc=com"));
        resolver.apply_add(&add_msg(2, 1, "c", "uid=c,ou=p,dc=example,dc=com"));
        resolver.apply_add(&add_msg(3, 1, "g", "uid=g,uid=c,ou=p,dc=example,dc=com"));

        resolver.apply_delete(&delete_msg(4, 2, "p", "ou=p,dc=example,dc=com", true));
        assert!(store.is_empty());
        assert_eq!(monitor.get(Counter::NamingConflictsResolved), 0);
    }

    #[test]
    fn test_delete_of_unknown_entry_dropped() {
        let (resolver, _, _) = resolver();
        let outcome = resolver.apply_delete(&delete_msg(1, 1, "nope", "uid=x,dc=example,dc=com", false));
        assert!(matches!(outcome, NamingOutcome::Dropped { .. }));
    }

    fn moddn_msg(t: u64, uuid: &str, dn: &str, new_rdn: &str) -> ModifyDnMsg {
        ModifyDnMsg {
            header: UpdateHeader::plain(csn(t, 1), uuid, dn),
            new_rdn: new_rdn.to_string(),
            delete_old_rdn: true,
            new_superior: None,
        }
    }

    #[test]
    fn test_rename_applies_and_updates_rdn_attribute() {
        let (resolver, store, _) = resolver();
        resolver.apply_add(&add_msg(1, 1, "u1", "cn=x,dc=example,dc=com"));
        let outcome = resolver.apply_modify_dn(&moddn_msg(2, "u1", "cn=x,dc=example,dc=com", "cn=y"));
        assert_eq!(outcome, NamingOutcome::Applied);
        let entry = store.get_by_dn("cn=y,dc=example,dc=com").unwrap();
        assert!(entry.has_value("cn", b"y"));
        assert!(!entry.has_value("cn", b"x"));
    }

    #[test]
    fn test_out_of_order_rename_discarded() {
        let (resolver, store, _) = resolver();
        resolver.apply_add(&add_msg(1, 1, "u1", "cn=x,dc=example,dc=com"));
        resolver.apply_modify_dn(&moddn_msg(5, "u1", "cn=x,dc=example,dc=com", "cn=late"));
        let outcome =
            resolver.apply_modify_dn(&moddn_msg(3, "u1", "cn=x,dc=example,dc=com", "cn=early"));
        assert!(matches!(outcome, NamingOutcome::Dropped { .. }));
        assert!(store.get_by_dn("cn=late,dc=example,dc=com").is_some());
        assert!(store.get_by_dn("cn=early,dc=example,dc=com").is_none());
    }

    #[test]
    fn test_rename_to_occupied_dn_parks_entry() {
        let (resolver, store, _) = resolver();
        resolver.apply_add(&add_msg(1, 1, "u1", "cn=a,dc=example,dc=com"));
        resolver.apply_add(&add_msg(2, 1, "u2", "cn=b,dc=example,dc=com"));
        let outcome = resolver.apply_modify_dn(&moddn_msg(3, "u2", "cn=b,dc=example,dc=com", "cn=a"));
        match outcome {
            NamingOutcome::ConflictRenamed { dn } => {
                assert!(store.get_by_dn(&dn).is_some());
                assert_eq!(store.get_by_dn("cn=a,dc=example,dc=com").unwrap().uuid, "u1");
            }
            other => panic!("expected conflict rename, got {other:?}"),
        }
    }
}
