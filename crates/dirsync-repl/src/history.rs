//! Per-attribute historical metadata and conflict-resolving replay.
//!
//! Each replicated attribute carries an engine that remembers when values
//! were last added or deleted, keyed by CSN. Replaying a remote
//! modification consults that history to decide whether the modification
//! still applies, applies only in part, or lost against newer state.
//!
//! Conflicts are an expected outcome, not errors: a losing modification is
//! dropped (or narrowed) and the caller rebuilds the applied batch from the
//! returned outcomes.
//!
//! Same-CSN policy: modifications inside one replayed batch share a CSN and
//! apply in request order without conflicting on equality, so an
//! ADD-then-DELETE of one value nets to the delete and DELETE-then-ADD nets
//! to the add. Across batches an equal CSN is a conflict, which makes exact
//! re-replay idempotent.

use std::collections::BTreeMap;

use dirsync_proto::msg::ModOp;
use dirsync_proto::Csn;

use crate::entry::{AttrValue, Entry, Modification};

/// Result of replaying one modification against an attribute's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// The modification (possibly narrowed) was applied to the entry.
    Applied(Modification),
    /// The whole modification lost against newer history and was dropped.
    Conflict,
}

impl Replay {
    /// True when the modification was dropped.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Replay::Conflict)
    }
}

/// Tag of one encoded historical fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum HistTag {
    /// Whole-attribute replace (also acts as a delete barrier).
    Repl,
    /// Whole-attribute delete.
    AttrDel,
    /// Value addition.
    Add,
    /// Value deletion.
    Del,
}

impl HistTag {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            HistTag::Add => "add",
            HistTag::Del => "del",
            HistTag::Repl => "repl",
            HistTag::AttrDel => "attrDel",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(HistTag::Add),
            "del" => Some(HistTag::Del),
            "repl" => Some(HistTag::Repl),
            "attrDel" => Some(HistTag::AttrDel),
            _ => None,
        }
    }
}

/// One encoded historical fact of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HistRecord {
    pub csn: Csn,
    pub tag: HistTag,
    pub value: Option<AttrValue>,
}

/// History engine for a single-valued attribute.
///
/// Only the newest operation matters: anything at or below the recorded
/// CSN is a conflict (newest-CSN-wins), except in-batch sequencing at the
/// same CSN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingleHist {
    csn: Option<Csn>,
    tag: Option<HistTag>,
    value: Option<AttrValue>,
}

impl SingleHist {
    /// The CSN governing this attribute, if any operation was recorded.
    pub fn last_csn(&self) -> Option<Csn> {
        self.csn
    }

    fn outranked(&self, csn: Csn, same_op: bool) -> bool {
        match self.csn {
            None => false,
            Some(last) => csn < last || (csn == last && !same_op),
        }
    }

    fn record(&mut self, csn: Csn, tag: HistTag, value: Option<AttrValue>) {
        self.csn = Some(csn);
        self.tag = Some(tag);
        self.value = value;
    }

    fn replay(
        &mut self,
        csn: Csn,
        modification: &Modification,
        entry: &mut Entry,
        same_op: bool,
    ) -> Replay {
        if self.outranked(csn, same_op) {
            return Replay::Conflict;
        }
        let attr = &modification.attr;
        match modification.op {
            ModOp::Add => {
                let Some(value) = modification.values.first().cloned() else {
                    return Replay::Conflict;
                };
                // An add over an existing value becomes a replace: the
                // newer operation wins the whole attribute.
                let effective = if entry.has_attribute(attr) {
                    Modification::new(ModOp::Replace, attr.clone(), vec![value.clone()])
                } else {
                    modification.clone()
                };
                entry.apply(&effective);
                self.record(csn, HistTag::Add, Some(value));
                Replay::Applied(effective)
            }
            ModOp::Replace => {
                entry.apply(modification);
                match modification.values.first() {
                    Some(v) => self.record(csn, HistTag::Repl, Some(v.clone())),
                    None => self.record(csn, HistTag::AttrDel, None),
                }
                Replay::Applied(modification.clone())
            }
            ModOp::Delete => {
                if !entry.has_attribute(attr) {
                    // Nothing to delete, but the delete still advances the
                    // barrier so older concurrent adds keep losing.
                    self.record(csn, HistTag::AttrDel, None);
                    return Replay::Conflict;
                }
                if let Some(target) = modification.values.first() {
                    if !entry.has_value(attr, target) {
                        return Replay::Conflict;
                    }
                }
                entry.remove_attribute(attr);
                self.record(csn, HistTag::AttrDel, None);
                Replay::Applied(modification.clone())
            }
            ModOp::Increment => {
                if !entry.has_attribute(attr) {
                    return Replay::Conflict;
                }
                entry.apply(modification);
                let value = entry.attribute(attr).and_then(|vs| vs.first().cloned());
                self.record(csn, HistTag::Repl, value);
                Replay::Applied(modification.clone())
            }
        }
    }

    fn records(&self) -> Vec<HistRecord> {
        match (self.csn, self.tag) {
            (Some(csn), Some(tag)) => vec![HistRecord { csn, tag, value: self.value.clone() }],
            _ => Vec::new(),
        }
    }

    fn load(&mut self, record: &HistRecord) {
        // Newest fact wins; an on-disk history may carry several.
        if self.csn.is_none_or(|last| record.csn >= last) {
            self.record(record.csn, record.tag, record.value.clone());
        }
    }
}

/// Per-value history inside a multi-valued attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ValueInfo {
    update_csn: Option<Csn>,
    delete_csn: Option<Csn>,
}

impl ValueInfo {
    fn governing(&self) -> Option<Csn> {
        self.update_csn.max(self.delete_csn)
    }

    fn is_deleted(&self) -> bool {
        match (self.update_csn, self.delete_csn) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(u), Some(d)) => d >= u,
        }
    }
}

/// History engine for a multi-valued attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiHist {
    delete_csn: Option<Csn>,
    last_update_csn: Option<Csn>,
    values: BTreeMap<AttrValue, ValueInfo>,
}

impl MultiHist {
    /// The newest CSN recorded anywhere in this attribute's history.
    pub fn last_csn(&self) -> Option<Csn> {
        let value_max = self.values.values().filter_map(ValueInfo::governing).max();
        value_max.max(self.delete_csn).max(self.last_update_csn)
    }

    fn barrier_blocks(&self, csn: Csn, same_op: bool) -> bool {
        match self.delete_csn {
            None => false,
            Some(d) => csn < d || (csn == d && !same_op),
        }
    }

    fn replay(
        &mut self,
        csn: Csn,
        modification: &Modification,
        entry: &mut Entry,
        same_op: bool,
    ) -> Replay {
        match modification.op {
            ModOp::Add => self.replay_add(csn, modification, entry, same_op),
            ModOp::Delete if modification.values.is_empty() => {
                self.replay_delete_attr(csn, modification, entry, same_op)
            }
            ModOp::Delete => self.replay_delete_values(csn, modification, entry, same_op),
            ModOp::Replace => self.replay_replace(csn, modification, entry, same_op),
            ModOp::Increment => {
                if self.barrier_blocks(csn, same_op) || !entry.has_attribute(&modification.attr) {
                    return Replay::Conflict;
                }
                entry.apply(modification);
                Replay::Applied(modification.clone())
            }
        }
    }

    fn replay_add(
        &mut self,
        csn: Csn,
        modification: &Modification,
        entry: &mut Entry,
        same_op: bool,
    ) -> Replay {
        let attr = &modification.attr;
        let mut kept = Vec::new();
        for value in &modification.values {
            if self.barrier_blocks(csn, same_op) {
                continue;
            }
            if entry.has_value(attr, value) {
                // Duplicate add: conflict for this value, but refresh the
                // record so later catch-up compares against the newest CSN.
                let info = self.values.entry(value.clone()).or_default();
                if info.governing().is_none_or(|g| csn > g) {
                    info.update_csn = Some(csn);
                }
                continue;
            }
            let info = self.values.entry(value.clone()).or_default();
            if let Some(g) = info.governing() {
                if csn < g || (csn == g && !same_op) {
                    continue;
                }
            }
            info.update_csn = Some(csn);
            info.delete_csn = None;
            kept.push(value.clone());
        }
        if kept.is_empty() {
            return Replay::Conflict;
        }
        let effective = Modification::new(ModOp::Add, attr.clone(), kept);
        entry.apply(&effective);
        Replay::Applied(effective)
    }

    fn replay_delete_values(
        &mut self,
        csn: Csn,
        modification: &Modification,
        entry: &mut Entry,
        same_op: bool,
    ) -> Replay {
        let attr = &modification.attr;
        let mut kept = Vec::new();
        for value in &modification.values {
            if entry.has_value(attr, value) {
                let info = self.values.entry(value.clone()).or_default();
                if let Some(g) = info.governing() {
                    if csn < g || (csn == g && !same_op) {
                        continue;
                    }
                }
                info.delete_csn = Some(csn);
                kept.push(value.clone());
            } else {
                // The value is already gone; remember this delete anyway as
                // a tombstone so an older concurrent add keeps losing.
                let info = self.values.entry(value.clone()).or_default();
                if info.governing().is_none_or(|g| csn > g) {
                    info.delete_csn = Some(csn);
                }
            }
        }
        if kept.is_empty() {
            return Replay::Conflict;
        }
        let effective = Modification::new(ModOp::Delete, attr.clone(), kept);
        entry.apply(&effective);
        Replay::Applied(effective)
    }

    fn replay_delete_attr(
        &mut self,
        csn: Csn,
        modification: &Modification,
        entry: &mut Entry,
        same_op: bool,
    ) -> Replay {
        if self.barrier_blocks(csn, same_op) {
            return Replay::Conflict;
        }
        self.delete_csn = Some(csn);
        let attr = &modification.attr;
        let live: Vec<AttrValue> =
            entry.attribute(attr).map(|vs| vs.to_vec()).unwrap_or_default();
        let mut surviving = Vec::new();
        for value in live {
            let info = self.values.entry(value.clone()).or_default();
            match info.governing() {
                // A value added with a newer CSN survives an out-of-order
                // whole-attribute delete.
                Some(g) if g > csn => surviving.push(value),
                _ => info.delete_csn = Some(csn),
            }
        }
        entry.set_attribute(attr, surviving);
        Replay::Applied(modification.clone())
    }

    fn replay_replace(
        &mut self,
        csn: Csn,
        modification: &Modification,
        entry: &mut Entry,
        same_op: bool,
    ) -> Replay {
        if self.barrier_blocks(csn, same_op) {
            return Replay::Conflict;
        }
        let attr = &modification.attr;
        // A replace is an implicit whole-attribute delete followed by adds,
        // all at the same CSN.
        self.delete_csn = Some(csn);
        if !modification.values.is_empty() {
            self.last_update_csn = Some(csn);
        }
        let live: Vec<AttrValue> =
            entry.attribute(attr).map(|vs| vs.to_vec()).unwrap_or_default();
        let mut final_values = Vec::new();
        for value in live {
            let info = self.values.entry(value.clone()).or_default();
            match info.governing() {
                Some(g) if g > csn => final_values.push(value),
                _ => info.delete_csn = Some(csn),
            }
        }
        for value in &modification.values {
            let info = self.values.entry(value.clone()).or_default();
            // A value individually deleted later than this replace stays
            // deleted: the later delete wins over the earlier replace.
            if info.delete_csn.is_some_and(|d| d > csn) {
                continue;
            }
            info.update_csn = Some(csn);
            info.delete_csn = None;
            if !final_values.contains(value) {
                final_values.push(value.clone());
            }
        }
        let effective = Modification::new(ModOp::Replace, attr.clone(), final_values.clone());
        entry.set_attribute(attr, final_values);
        Replay::Applied(effective)
    }

    fn records(&self) -> Vec<HistRecord> {
        let mut out = Vec::new();
        // The replace marker rides on the smallest live value carrying the
        // replace CSN; when none survives, an attrDel record carries the
        // delete barrier instead.
        let repl_value = self.last_update_csn.and_then(|lu| {
            if self.delete_csn != Some(lu) {
                return None;
            }
            self.values
                .iter()
                .find(|(_, info)| !info.is_deleted() && info.update_csn == Some(lu))
                .map(|(v, _)| v.clone())
        });
        if let Some(d) = self.delete_csn {
            if repl_value.is_none() {
                out.push(HistRecord { csn: d, tag: HistTag::AttrDel, value: None });
            }
        }
        for (value, info) in &self.values {
            if info.is_deleted() {
                let Some(d) = info.delete_csn else { continue };
                // A tombstone at or below the whole-attribute barrier is
                // already covered by the attrDel/repl fact.
                if self.delete_csn.is_some_and(|barrier| d <= barrier) {
                    continue;
                }
                out.push(HistRecord { csn: d, tag: HistTag::Del, value: Some(value.clone()) });
            } else if let Some(u) = info.update_csn {
                let tag = if repl_value.as_ref() == Some(value) { HistTag::Repl } else { HistTag::Add };
                out.push(HistRecord { csn: u, tag, value: Some(value.clone()) });
            }
        }
        out.sort_by(|a, b| {
            (a.csn, a.tag, a.value.as_deref().unwrap_or(&[]))
                .cmp(&(b.csn, b.tag, b.value.as_deref().unwrap_or(&[])))
        });
        out
    }

    fn load(&mut self, record: &HistRecord) {
        match record.tag {
            HistTag::AttrDel => {
                if self.delete_csn.is_none_or(|d| record.csn > d) {
                    self.delete_csn = Some(record.csn);
                }
            }
            HistTag::Repl => {
                if self.delete_csn.is_none_or(|d| record.csn > d) {
                    self.delete_csn = Some(record.csn);
                }
                if self.last_update_csn.is_none_or(|u| record.csn > u) {
                    self.last_update_csn = Some(record.csn);
                }
                if let Some(value) = &record.value {
                    let info = self.values.entry(value.clone()).or_default();
                    info.update_csn = Some(record.csn);
                    info.delete_csn = None;
                }
            }
            HistTag::Add => {
                if let Some(value) = &record.value {
                    let info = self.values.entry(value.clone()).or_default();
                    info.update_csn = Some(record.csn);
                    info.delete_csn = None;
                }
            }
            HistTag::Del => {
                if let Some(value) = &record.value {
                    let info = self.values.entry(value.clone()).or_default();
                    if info.delete_csn.is_none_or(|d| record.csn > d) {
                        info.delete_csn = Some(record.csn);
                    }
                }
            }
        }
    }

    fn purge(&mut self, cutoff_ms: u64, newest: Csn) {
        self.values.retain(|_, info| {
            if !info.is_deleted() {
                return true;
            }
            match info.governing() {
                Some(g) => g.time_ms >= cutoff_ms || g == newest,
                None => false,
            }
        });
        if let Some(d) = self.delete_csn {
            if d.time_ms < cutoff_ms && d != newest {
                self.delete_csn = None;
                // The replace marker cannot outlive its delete barrier.
                if self.last_update_csn == Some(d) {
                    self.last_update_csn = None;
                }
            }
        }
        if let Some(u) = self.last_update_csn {
            if u.time_ms < cutoff_ms && u != newest && self.delete_csn.is_none() {
                self.last_update_csn = None;
            }
        }
    }
}

/// History engine for one attribute, single- or multi-valued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrHistory {
    /// Single-valued variant.
    Single(SingleHist),
    /// Multi-valued variant.
    Multi(MultiHist),
}

impl AttrHistory {
    /// A fresh engine of the right variant.
    pub fn new(single_valued: bool) -> Self {
        if single_valued {
            AttrHistory::Single(SingleHist::default())
        } else {
            AttrHistory::Multi(MultiHist::default())
        }
    }

    /// Replay one modification, mutating the entry when it applies.
    ///
    /// `same_op` is true when an earlier modification of the same replayed
    /// batch already touched this attribute.
    pub fn replay(
        &mut self,
        csn: Csn,
        modification: &Modification,
        entry: &mut Entry,
        same_op: bool,
    ) -> Replay {
        match self {
            AttrHistory::Single(h) => h.replay(csn, modification, entry, same_op),
            AttrHistory::Multi(h) => h.replay(csn, modification, entry, same_op),
        }
    }

    /// The newest CSN recorded for this attribute.
    pub fn last_csn(&self) -> Option<Csn> {
        match self {
            AttrHistory::Single(h) => h.last_csn(),
            AttrHistory::Multi(h) => h.last_csn(),
        }
    }

    pub(crate) fn records(&self) -> Vec<HistRecord> {
        match self {
            AttrHistory::Single(h) => h.records(),
            AttrHistory::Multi(h) => h.records(),
        }
    }

    pub(crate) fn load(&mut self, record: &HistRecord) {
        match self {
            AttrHistory::Single(h) => h.load(record),
            AttrHistory::Multi(h) => h.load(record),
        }
    }

    pub(crate) fn purge(&mut self, cutoff_ms: u64) {
        let Some(newest) = self.last_csn() else { return };
        match self {
            // The single record is always the attribute's newest fact.
            AttrHistory::Single(_) => {}
            AttrHistory::Multi(h) => h.purge(cutoff_ms, newest),
        }
    }
}
