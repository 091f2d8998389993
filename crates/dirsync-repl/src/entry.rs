//! The entry and modification model the core operates on.
//!
//! Entries arriving here are already validated by the front-end; this
//! module only provides the data shapes plus the handful of DN helpers the
//! conflict resolvers need. Attribute names are case-insensitive and
//! normalized to lowercase.

use std::collections::BTreeMap;

use dirsync_proto::msg::{ModOp, WireAttribute, WireModification};

/// An attribute value, kept as an opaque byte string.
pub type AttrValue = Vec<u8>;

/// Operational attribute holding the entry's unique identifier.
pub const ENTRY_UUID_ATTR: &str = "entryuuid";

/// Operational attribute marking an entry renamed by naming-conflict
/// resolution; its value is the DN the entry originally wanted.
pub const CONFLICT_ATTR: &str = "ds-sync-conflict";

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Current DN of the entry.
    pub dn: String,
    /// Replica-independent identity, stable across renames.
    pub uuid: String,
    attributes: BTreeMap<String, Vec<AttrValue>>,
}

impl Entry {
    /// Create an empty entry.
    pub fn new(dn: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self { dn: dn.into(), uuid: uuid.into(), attributes: BTreeMap::new() }
    }

    /// Create an entry with a freshly generated unique identifier, for
    /// entries originating on this replica.
    pub fn with_generated_uuid(dn: impl Into<String>) -> Self {
        Self::new(dn, uuid::Uuid::new_v4().to_string())
    }

    /// Values of an attribute, if present.
    pub fn attribute(&self, name: &str) -> Option<&[AttrValue]> {
        self.attributes.get(&name.to_ascii_lowercase()).map(|v| v.as_slice())
    }

    /// True when the attribute holds the given value.
    pub fn has_value(&self, name: &str, value: &[u8]) -> bool {
        self.attribute(name).is_some_and(|vs| vs.iter().any(|v| v == value))
    }

    /// True when the attribute exists with at least one value.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some_and(|vs| !vs.is_empty())
    }

    /// Replace the whole value set of an attribute. An empty set removes it.
    pub fn set_attribute(&mut self, name: &str, values: Vec<AttrValue>) {
        let key = name.to_ascii_lowercase();
        if values.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, values);
        }
    }

    /// Remove an attribute entirely.
    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.remove(&name.to_ascii_lowercase());
    }

    /// Iterate attributes in name order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[AttrValue])> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Apply one modification to the live attribute values.
    ///
    /// Conflict resolution has already decided the modification applies;
    /// this is pure state mutation, tolerant of redundant operations.
    pub fn apply(&mut self, modification: &Modification) {
        let key = modification.attr.to_ascii_lowercase();
        match modification.op {
            ModOp::Add => {
                let values = self.attributes.entry(key).or_default();
                for v in &modification.values {
                    if !values.contains(v) {
                        values.push(v.clone());
                    }
                }
            }
            ModOp::Delete => {
                if modification.values.is_empty() {
                    self.attributes.remove(&key);
                } else if let Some(values) = self.attributes.get_mut(&key) {
                    values.retain(|v| !modification.values.contains(v));
                    if values.is_empty() {
                        self.attributes.remove(&key);
                    }
                }
            }
            ModOp::Replace => {
                if modification.values.is_empty() {
                    self.attributes.remove(&key);
                } else {
                    self.attributes.insert(key, modification.values.clone());
                }
            }
            ModOp::Increment => {
                if let Some(values) = self.attributes.get_mut(&key) {
                    if let (Some(current), Some(delta)) =
                        (values.first().and_then(parse_i64), modification.values.first().and_then(|v| parse_i64(v)))
                    {
                        values[0] = (current + delta).to_string().into_bytes();
                    }
                }
            }
        }
    }

    /// The wire representation of all attributes, for Add messages.
    pub fn to_wire_attributes(&self) -> Vec<WireAttribute> {
        self.attributes
            .iter()
            .map(|(name, values)| WireAttribute { name: name.clone(), values: values.clone() })
            .collect()
    }
}

fn parse_i64(v: &AttrValue) -> Option<i64> {
    std::str::from_utf8(v).ok()?.parse().ok()
}

/// One modification of a modify operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    /// The operator.
    pub op: ModOp,
    /// Target attribute name.
    pub attr: String,
    /// Values; empty means the whole attribute for Delete/Replace.
    pub values: Vec<AttrValue>,
}

impl Modification {
    /// Convenience constructor.
    pub fn new(op: ModOp, attr: impl Into<String>, values: Vec<AttrValue>) -> Self {
        Self { op, attr: attr.into(), values }
    }

    /// A modification with UTF-8 string values.
    pub fn of_strs(op: ModOp, attr: impl Into<String>, values: &[&str]) -> Self {
        Self::new(op, attr, values.iter().map(|s| s.as_bytes().to_vec()).collect())
    }
}

impl From<WireModification> for Modification {
    fn from(m: WireModification) -> Self {
        Self { op: m.op, attr: m.attr, values: m.values }
    }
}

impl From<Modification> for WireModification {
    fn from(m: Modification) -> Self {
        Self { op: m.op, attr: m.attr, values: m.values }
    }
}

/// Knows which attributes are single-valued.
///
/// The schema proper lives in the front-end; the history engine only needs
/// this one bit per attribute type.
#[derive(Debug, Clone, Default)]
pub struct AttrRegistry {
    single_valued: std::collections::HashSet<String>,
}

impl AttrRegistry {
    /// A registry with no single-valued attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare attributes as single-valued.
    pub fn with_single_valued(mut self, names: &[&str]) -> Self {
        for name in names {
            self.single_valued.insert(name.to_ascii_lowercase());
        }
        self
    }

    /// True when the attribute is single-valued.
    pub fn is_single_valued(&self, name: &str) -> bool {
        self.single_valued.contains(&name.to_ascii_lowercase())
    }
}

/// Parent DN, or `None` at a suffix root.
pub fn parent_dn(dn: &str) -> Option<&str> {
    split_dn(dn).map(|(_, parent)| parent)
}

/// Leading RDN of a DN.
pub fn rdn(dn: &str) -> &str {
    split_dn(dn).map(|(rdn, _)| rdn).unwrap_or(dn)
}

/// True when `dn` sits directly or transitively under `ancestor`.
pub fn is_under(dn: &str, ancestor: &str) -> bool {
    let dn = dn.to_ascii_lowercase();
    let ancestor = ancestor.to_ascii_lowercase();
    dn != ancestor && dn.ends_with(&ancestor) && {
        let prefix = &dn[..dn.len() - ancestor.len()];
        prefix.ends_with(',')
    }
}

// Splits at the first comma not escaped by a backslash.
fn split_dn(dn: &str) -> Option<(&str, &str)> {
    let bytes = dn.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b',' => return Some((&dn[..i], &dn[i + 1..])),
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_description() -> Entry {
        let mut e = Entry::new("dc=example,dc=com", "u-1");
        e.set_attribute("description", vec![b"one".to_vec(), b"two".to_vec()]);
        e
    }

    #[test]
    fn test_attribute_names_case_insensitive() {
        let e = entry_with_description();
        assert!(e.has_value("Description", b"one"));
        assert!(e.has_attribute("DESCRIPTION"));
    }

    #[test]
    fn test_apply_add_skips_duplicates() {
        let mut e = entry_with_description();
        e.apply(&Modification::of_strs(ModOp::Add, "description", &["one", "three"]));
        assert_eq!(e.attribute("description").unwrap().len(), 3);
    }

    #[test]
    fn test_apply_delete_values_and_whole_attribute() {
        let mut e = entry_with_description();
        e.apply(&Modification::of_strs(ModOp::Delete, "description", &["one"]));
        assert!(!e.has_value("description", b"one"));
        assert!(e.has_value("description", b"two"));

        e.apply(&Modification::of_strs(ModOp::Delete, "description", &[]));
        assert!(!e.has_attribute("description"));
    }

    #[test]
    fn test_apply_delete_last_value_removes_attribute() {
        let mut e = Entry::new("dc=example,dc=com", "u-1");
        e.set_attribute("cn", vec![b"x".to_vec()]);
        e.apply(&Modification::of_strs(ModOp::Delete, "cn", &["x"]));
        assert!(!e.has_attribute("cn"));
    }

    #[test]
    fn test_apply_replace() {
        let mut e = entry_with_description();
        e.apply(&Modification::of_strs(ModOp::Replace, "description", &["only"]));
        assert_eq!(e.attribute("description").unwrap(), &[b"only".to_vec()]);

        e.apply(&Modification::of_strs(ModOp::Replace, "description", &[]));
        assert!(!e.has_attribute("description"));
    }

    #[test]
    fn test_apply_increment() {
        let mut e = Entry::new("dc=example,dc=com", "u-1");
        e.set_attribute("uidnumber", vec![b"41".to_vec()]);
        e.apply(&Modification::of_strs(ModOp::Increment, "uidnumber", &["1"]));
        assert_eq!(e.attribute("uidnumber").unwrap(), &[b"42".to_vec()]);
    }

    #[test]
    fn test_generated_uuids_are_unique() {
        let a = Entry::with_generated_uuid("dc=x");
        let b = Entry::with_generated_uuid("dc=x");
        assert_ne!(a.uuid, b.uuid);
        assert!(a.uuid.parse::<uuid::Uuid>().is_ok());
    }

    #[test]
    fn test_registry() {
        let reg = AttrRegistry::new().with_single_valued(&["displayName"]);
        assert!(reg.is_single_valued("displayname"));
        assert!(!reg.is_single_valued("description"));
    }

    #[test]
    fn test_dn_helpers() {
        assert_eq!(parent_dn("uid=a,ou=p,dc=x"), Some("ou=p,dc=x"));
        assert_eq!(parent_dn("dc=x"), None);
        assert_eq!(rdn("uid=a,ou=p,dc=x"), "uid=a");
        assert!(is_under("uid=a,ou=p,dc=x", "ou=p,dc=x"));
        assert!(is_under("uid=a,ou=p,dc=x", "dc=x"));
        assert!(!is_under("ou=p,dc=x", "ou=p,dc=x"));
        assert!(!is_under("uid=a,ou=pp,dc=x", "ou=p,dc=x"));
    }

    #[test]
    fn test_dn_helpers_escaped_comma() {
        assert_eq!(rdn("cn=use\\, backslash,dc=x"), "cn=use\\, backslash");
        assert_eq!(parent_dn("cn=use\\, backslash,dc=x"), Some("dc=x"));
    }
}
