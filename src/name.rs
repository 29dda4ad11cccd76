//! Helpers for working with canonical owner names.
//!
//! The engine stores every owner name as a `Name<Bytes>`, whose `Ord`
//! implementation is the RFC 4034 canonical order (labels compared from the
//! right, case-insensitively).  This module adds the few structural
//! operations the tree code needs on top of that.

use bytes::Bytes;
use domain::base::{Name, ToName};
use octseq::builder::infallible;

/// An owner name as stored by the engine.
pub type StoredName = Name<Bytes>;

/// The immediate ancestor of a name, or `None` at the root.
///
/// A suffix of a valid wire-format name is itself a valid name, so this is
/// a cheap slice of the underlying octets.
pub fn parent(name: &StoredName) -> Option<StoredName> {
    if name.is_root() {
        return None;
    }
    let first_label_len = name.as_slice()[0] as usize;
    let octets = name.as_octets().slice(first_label_len + 1..);
    Some(Name::from_octets(octets).expect("a name suffix is a valid name"))
}

/// Whether `name` is strictly below `ancestor`.
pub fn is_below(name: &StoredName, ancestor: &StoredName) -> bool {
    name != ancestor && name.ends_with(ancestor)
}

/// The strict ancestors of `name`, nearest first, up to and including `apex`.
///
/// Yields nothing if `name` is not below `apex`.
pub fn ancestors_up_to(
    name: &StoredName,
    apex: &StoredName,
) -> impl Iterator<Item = StoredName> + use<> {
    let mut cursor = if is_below(name, apex) {
        parent(name)
    } else {
        None
    };
    let apex = apex.clone();
    std::iter::from_fn(move || {
        let current = cursor.take()?;
        cursor = if current == apex {
            None
        } else {
            parent(&current)
        };
        Some(current)
    })
}

/// A name in absolute presentation form.
///
/// `Name`'s `Display` omits the trailing dot; emitted text must carry it so
/// that it parses back as an absolute name.
pub fn dotted(name: &StoredName) -> String {
    if name.is_root() {
        ".".to_string()
    } else {
        format!("{name}.")
    }
}

/// The canonical (lowercased) wire form of a name.
///
/// This is the form hashed for NSEC3 owner names and composed into RRSIG
/// signing input.
pub fn canonical_wire(name: &StoredName) -> Vec<u8> {
    let mut wire = Vec::with_capacity(name.len());
    infallible(name.compose_canonical(&mut wire));
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn name(text: &str) -> StoredName {
        Name::from_str(text).unwrap()
    }

    #[test]
    fn parent_strips_the_leftmost_label() {
        assert_eq!(parent(&name("a.b.example.")), Some(name("b.example.")));
        assert_eq!(parent(&name("example.")), Some(name(".")));
        assert_eq!(parent(&name(".")), None);
    }

    #[test]
    fn ancestors_stop_at_the_apex() {
        let apex = name("example.");
        let collected: Vec<_> =
            ancestors_up_to(&name("a.b.c.example."), &apex).collect();
        assert_eq!(
            collected,
            vec![name("b.c.example."), name("c.example."), apex.clone()]
        );
        assert_eq!(ancestors_up_to(&apex, &apex).count(), 0);
        assert_eq!(ancestors_up_to(&name("other.test."), &apex).count(), 0);
    }

    #[test]
    fn canonical_wire_lowercases() {
        assert_eq!(
            canonical_wire(&name("WwW.Example.")),
            b"\x03www\x07example\x00".to_vec()
        );
    }
}
