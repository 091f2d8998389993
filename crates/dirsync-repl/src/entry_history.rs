//! Entry-level historical metadata: the aggregate of all per-attribute
//! engines, persisted in the `ds-sync-hist` operational attribute.
//!
//! Each value of the historical attribute encodes one fact:
//! `attr:csn:tag[:value]` with tag one of `add`, `del`, `repl`, `attrDel`.
//! Entry-level facts (the entry's own add and last rename) use the pseudo
//! attribute name `dn`. Unparseable values are skipped with a warning so a
//! damaged history never blocks replay.

use std::collections::BTreeMap;

use tracing::warn;

use dirsync_proto::csn::CSN_TEXT_LEN;
use dirsync_proto::msg::ModOp;
use dirsync_proto::Csn;

use crate::entry::{AttrRegistry, AttrValue, Entry, Modification};
use crate::history::{AttrHistory, HistRecord, HistTag, Replay};

/// Name of the synthetic operational attribute holding the history.
pub const HISTORICAL_ATTR: &str = "ds-sync-hist";

const DN_KEY: &str = "dn";
const MODDN_TAG: &str = "moddn";

/// One replayed modification and what became of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedMod {
    /// The modification as it arrived.
    pub original: Modification,
    /// The outcome, carrying the effective modification when applied.
    pub outcome: Replay,
}

impl ReplayedMod {
    /// True when the modification (possibly narrowed) was applied.
    pub fn accepted(&self) -> bool {
        !self.outcome.is_conflict()
    }
}

/// Result of replaying one batch of modifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Per-modification outcomes, in request order.
    pub outcomes: Vec<ReplayedMod>,
}

impl BatchResult {
    /// Number of modifications dropped as conflicts.
    pub fn conflicts(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.accepted()).count()
    }

    /// The modifications that actually applied, in order.
    pub fn applied(&self) -> Vec<Modification> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                Replay::Applied(m) => Some(m.clone()),
                Replay::Conflict => None,
            })
            .collect()
    }
}

/// A reconstructed operation for catch-up replay after an outage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOperation {
    /// The entry's creation.
    Add {
        /// CSN of the creation.
        csn: Csn,
        /// Snapshot of the entry as it stands now.
        entry: Entry,
    },
    /// The entry's last rename.
    ModifyDn {
        /// CSN of the rename.
        csn: Csn,
        /// Current RDN of the entry.
        new_rdn: String,
    },
    /// Modifications reconstructed from attribute history.
    Modify {
        /// CSN shared by the facts folded into this operation.
        csn: Csn,
        /// The reconstructed modifications.
        mods: Vec<Modification>,
    },
}

impl FakeOperation {
    /// CSN of the reconstructed operation.
    pub fn csn(&self) -> Csn {
        match self {
            FakeOperation::Add { csn, .. } => *csn,
            FakeOperation::ModifyDn { csn, .. } => *csn,
            FakeOperation::Modify { csn, .. } => *csn,
        }
    }
}

/// Aggregated conflict-resolution history of one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryHistorical {
    attrs: BTreeMap<String, AttrHistory>,
    entry_add_csn: Option<Csn>,
    entry_moddn_csn: Option<Csn>,
}

impl EntryHistorical {
    /// An empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the history from the entry's `ds-sync-hist` attribute.
    /// A missing or damaged attribute yields an empty (or partial) history.
    pub fn from_entry(entry: &Entry, registry: &AttrRegistry) -> Self {
        let mut hist = Self::new();
        let Some(values) = entry.attribute(HISTORICAL_ATTR) else {
            return hist;
        };
        for raw in values {
            match parse_record(raw) {
                Some(ParsedRecord::EntryAdd(csn)) => hist.entry_add_csn = Some(csn),
                Some(ParsedRecord::EntryModDn(csn)) => hist.entry_moddn_csn = Some(csn),
                Some(ParsedRecord::Attr { attr, record }) => {
                    hist.engine_mut(&attr, registry).load(&record);
                }
                None => {
                    warn!(
                        entry = %entry.dn,
                        value = %String::from_utf8_lossy(raw),
                        "skipping malformed historical value"
                    );
                }
            }
        }
        hist
    }

    fn engine_mut(&mut self, attr: &str, registry: &AttrRegistry) -> &mut AttrHistory {
        let key = attr.to_ascii_lowercase();
        let single = registry.is_single_valued(&key);
        self.attrs.entry(key).or_insert_with(|| AttrHistory::new(single))
    }

    /// Record the CSN at which the entry was created.
    pub fn set_entry_add_csn(&mut self, csn: Csn) {
        self.entry_add_csn = Some(csn);
    }

    /// Record the CSN of the entry's last rename.
    pub fn set_entry_moddn_csn(&mut self, csn: Csn) {
        self.entry_moddn_csn = Some(csn);
    }

    /// CSN of the entry's last rename, if any.
    pub fn entry_moddn_csn(&self) -> Option<Csn> {
        self.entry_moddn_csn
    }

    /// The newest CSN recorded anywhere for this entry.
    pub fn newest_csn(&self) -> Option<Csn> {
        self.attrs
            .values()
            .filter_map(AttrHistory::last_csn)
            .max()
            .max(self.entry_add_csn)
            .max(self.entry_moddn_csn)
    }

    /// Replay a batch of modifications sharing one CSN (one logical
    /// operation) against the entry, applying the survivors.
    pub fn replay_batch(
        &mut self,
        csn: Csn,
        mods: &[Modification],
        entry: &mut Entry,
        registry: &AttrRegistry,
    ) -> BatchResult {
        let mut touched: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut outcomes = Vec::with_capacity(mods.len());
        for modification in mods {
            let key = modification.attr.to_ascii_lowercase();
            let same_op = touched.contains(&key);
            let engine = self.engine_mut(&key, registry);
            let outcome = engine.replay(csn, modification, entry, same_op);
            touched.insert(key);
            outcomes.push(ReplayedMod { original: modification.clone(), outcome });
        }
        BatchResult { outcomes }
    }

    /// Serialize the history back to `ds-sync-hist` values, dropping facts
    /// strictly older than `cutoff_ms`. The newest fact of each attribute
    /// is always kept, whatever its age.
    pub fn encode_and_purge(&mut self, cutoff_ms: u64) -> Vec<AttrValue> {
        let mut out = Vec::new();
        if let Some(csn) = self.entry_add_csn {
            out.push(encode_record(DN_KEY, csn, HistTag::Add.as_str(), None));
        }
        if let Some(csn) = self.entry_moddn_csn {
            out.push(encode_record(DN_KEY, csn, MODDN_TAG, None));
        }
        let mut empty = Vec::new();
        for (attr, engine) in &mut self.attrs {
            engine.purge(cutoff_ms);
            let records = engine.records();
            if records.is_empty() {
                empty.push(attr.clone());
                continue;
            }
            for record in records {
                out.push(encode_record(attr, record.csn, record.tag.as_str(), record.value.as_deref()));
            }
        }
        for attr in empty {
            self.attrs.remove(&attr);
        }
        out
    }

    /// Encode and attach the history to its entry.
    pub fn attach_to(&mut self, entry: &mut Entry, cutoff_ms: u64) {
        let values = self.encode_and_purge(cutoff_ms);
        entry.set_attribute(HISTORICAL_ATTR, values);
    }

    /// Reconstruct the operations this entry went through, ordered by CSN
    /// ascending, for catch-up replay toward a peer that missed them.
    pub fn fake_operations(&self, entry: &Entry) -> Vec<FakeOperation> {
        let mut mods_by_csn: BTreeMap<Csn, Vec<Modification>> = BTreeMap::new();
        for (attr, engine) in &self.attrs {
            for record in engine.records() {
                let modification = match record.tag {
                    HistTag::Add => Modification::new(
                        ModOp::Add,
                        attr.clone(),
                        record.value.iter().cloned().collect(),
                    ),
                    HistTag::Del => Modification::new(
                        ModOp::Delete,
                        attr.clone(),
                        record.value.iter().cloned().collect(),
                    ),
                    HistTag::Repl => Modification::new(
                        ModOp::Replace,
                        attr.clone(),
                        record.value.iter().cloned().collect(),
                    ),
                    HistTag::AttrDel => Modification::new(ModOp::Delete, attr.clone(), vec![]),
                };
                mods_by_csn.entry(record.csn).or_default().push(modification);
            }
        }
        let mut ops = Vec::new();
        if let Some(csn) = self.entry_add_csn {
            ops.push(FakeOperation::Add { csn, entry: entry.clone() });
        }
        if let Some(csn) = self.entry_moddn_csn {
            ops.push(FakeOperation::ModifyDn {
                csn,
                new_rdn: crate::entry::rdn(&entry.dn).to_string(),
            });
        }
        for (csn, mods) in mods_by_csn {
            ops.push(FakeOperation::Modify { csn, mods });
        }
        ops.sort_by_key(|op| (op.csn(), fake_rank(op)));
        ops
    }
}

fn fake_rank(op: &FakeOperation) -> u8 {
    match op {
        FakeOperation::Add { .. } => 0,
        FakeOperation::ModifyDn { .. } => 1,
        FakeOperation::Modify { .. } => 2,
    }
}

enum ParsedRecord {
    EntryAdd(Csn),
    EntryModDn(Csn),
    Attr { attr: String, record: HistRecord },
}

fn encode_record(attr: &str, csn: Csn, tag: &str, value: Option<&[u8]>) -> AttrValue {
    let mut out = Vec::with_capacity(attr.len() + CSN_TEXT_LEN + tag.len() + 8);
    out.extend_from_slice(attr.as_bytes());
    out.push(b':');
    out.extend_from_slice(csn.to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(tag.as_bytes());
    if let Some(v) = value {
        out.push(b':');
        out.extend_from_slice(v);
    }
    out
}

// Format: attr ':' csn(24 hex) ':' tag [':' value]. The value may itself
// contain colons, so only the first three fields are split.
fn parse_record(raw: &[u8]) -> Option<ParsedRecord> {
    let colon = raw.iter().position(|&b| b == b':')?;
    let attr = std::str::from_utf8(&raw[..colon]).ok()?;
    if attr.is_empty() {
        return None;
    }
    let rest = &raw[colon + 1..];
    if rest.len() < CSN_TEXT_LEN + 1 || rest[CSN_TEXT_LEN] != b':' {
        return None;
    }
    let csn: Csn = std::str::from_utf8(&rest[..CSN_TEXT_LEN]).ok()?.parse().ok()?;
    let rest = &rest[CSN_TEXT_LEN + 1..];
    let (tag_bytes, value) = match rest.iter().position(|&b| b == b':') {
        Some(i) => (&rest[..i], Some(rest[i + 1..].to_vec())),
        None => (rest, None),
    };
    let tag_str = std::str::from_utf8(tag_bytes).ok()?;
    // Entry-level facts never carry a value; anything else under the
    // pseudo name is treated as an ordinary attribute record.
    if attr.eq_ignore_ascii_case(DN_KEY) && value.is_none() {
        return match tag_str {
            "add" => Some(ParsedRecord::EntryAdd(csn)),
            MODDN_TAG => Some(ParsedRecord::EntryModDn(csn)),
            _ => None,
        };
    }
    let tag = HistTag::parse(tag_str)?;
    Some(ParsedRecord::Attr {
        attr: attr.to_ascii_lowercase(),
        record: HistRecord { csn, tag, value },
    })
}
