//! RRsets and their pending-change bookkeeping.
//!
//! Adapters stage additions and deletions against an [`Rrset`]; nothing is
//! visible to the signing or denial code until the zone-level commit applies
//! the pending lists.  Committing also decides the fate of the covering
//! RRSIGs: any change to the covered records invalidates them.

use bytes::Bytes;
use domain::base::name::Name;
use domain::base::{CanonicalOrd, Record, Rtype, Ttl};
use domain::rdata::dnssec::RtypeBitmap;
use domain::rdata::{Rrsig, ZoneRecordData};

use crate::name::StoredName;

/// Record data as stored by the engine.
pub type StoredRecordData = ZoneRecordData<Bytes, Name<Bytes>>;

/// A complete record as exchanged with the adapters.
pub type StoredRecord = Record<StoredName, StoredRecordData>;

/// A signature covering one stored RRset.
pub type SigRecord = Rrsig<Bytes, StoredName>;

//----------- Rrset ------------------------------------------------------------

/// The records of one type at one owner name.
///
/// The committed records are kept in canonical order.  Pending additions and
/// deletions are applied by [`Rrset::commit`] and dropped by
/// [`Rrset::rollback`].
#[derive(Clone, Debug)]
pub struct Rrset {
    /// The record type.
    rtype: Rtype,

    /// The TTL shared by the committed records.
    ttl: Ttl,

    /// The committed records, canonically sorted.
    records: Vec<StoredRecordData>,

    /// Pending additions.
    added: Vec<(Ttl, StoredRecordData)>,

    /// Pending deletions.
    removed: Vec<StoredRecordData>,

    /// The signatures covering the committed records.
    signatures: Vec<SigRecord>,

    /// Whether the signatures must be (re)generated.
    needs_signatures: bool,
}

impl Rrset {
    /// Construct an empty RRset.
    pub fn new(rtype: Rtype, ttl: Ttl) -> Self {
        Self {
            rtype,
            ttl,
            records: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
            signatures: Vec::new(),
            needs_signatures: false,
        }
    }

    /// Construct an RRset that is already committed.
    ///
    /// Used when synthesising records (denial chains, NSEC3PARAM) that never
    /// pass through the pending stage.
    pub fn committed(rtype: Rtype, ttl: Ttl, records: Vec<StoredRecordData>) -> Self {
        let mut rrset = Self::new(rtype, ttl);
        rrset.records = records;
        rrset.records.sort_by(|a, b| a.canonical_cmp(b));
        rrset.needs_signatures = true;
        rrset
    }

    /// The record type.
    pub fn rtype(&self) -> Rtype {
        self.rtype
    }

    /// The TTL of the committed records.
    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// The committed records in canonical order.
    pub fn records(&self) -> &[StoredRecordData] {
        &self.records
    }

    /// Whether there are no committed records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether any additions or deletions are pending.
    pub fn has_pending(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Stage an addition.
    pub fn stage_add(&mut self, ttl: Ttl, data: StoredRecordData) {
        self.added.push((ttl, data));
    }

    /// Stage a deletion.
    pub fn stage_remove(&mut self, data: StoredRecordData) {
        self.removed.push(data);
    }

    /// The records once pending changes are applied.
    ///
    /// The structural checks run before commit and must see the staged view.
    pub fn staged_records(&self) -> Vec<StoredRecordData> {
        let mut staged = self.records.clone();
        for removal in &self.removed {
            if let Some(index) = staged.iter().position(|data| data == removal) {
                staged.remove(index);
            }
        }
        for (_, addition) in &self.added {
            if !staged.contains(addition) {
                staged.push(addition.clone());
            }
        }
        staged
    }

    /// The number of records once pending changes are applied.
    pub fn staged_count(&self) -> usize {
        self.staged_records().len()
    }

    /// Apply pending changes.
    ///
    /// Returns whether the committed records changed.  A change drops the
    /// covering signatures.
    pub fn commit(&mut self) -> bool {
        if !self.has_pending() {
            return false;
        }
        let mut changed = false;
        for removal in self.removed.drain(..) {
            if let Some(index) =
                self.records.iter().position(|data| *data == removal)
            {
                self.records.remove(index);
                changed = true;
            }
        }
        for (ttl, addition) in self.added.drain(..) {
            if !self.records.contains(&addition) {
                self.records.push(addition);
                self.ttl = ttl;
                changed = true;
            }
        }
        if changed {
            self.records.sort_by(|a, b| a.canonical_cmp(b));
            self.signatures.clear();
            self.needs_signatures = true;
        }
        changed
    }

    /// Discard pending changes.
    pub fn rollback(&mut self) {
        self.added.clear();
        self.removed.clear();
    }

    /// The signatures covering this RRset.
    pub fn signatures(&self) -> &[SigRecord] {
        &self.signatures
    }

    /// Replace the covering signatures.
    pub fn set_signatures(&mut self, signatures: Vec<SigRecord>) {
        self.signatures = signatures;
        self.needs_signatures = false;
    }

    /// Whether the signatures must be (re)generated.
    pub fn needs_signatures(&self) -> bool {
        self.needs_signatures
    }

    /// Request regeneration of the signatures.
    pub fn invalidate_signatures(&mut self) {
        self.needs_signatures = true;
    }

    /// Overwrite the committed records directly.
    ///
    /// Returns whether they changed; a change drops the signatures.  Used
    /// by the denial builders, which bypass the pending stage.
    pub fn replace_records(
        &mut self,
        ttl: Ttl,
        mut records: Vec<StoredRecordData>,
    ) -> bool {
        records.sort_by(|a, b| a.canonical_cmp(b));
        if records == self.records && ttl == self.ttl {
            return false;
        }
        self.records = records;
        self.ttl = ttl;
        self.signatures.clear();
        self.needs_signatures = true;
        true
    }
}

//----------- type bitmaps -----------------------------------------------------

/// Build an NSEC(3) type bitmap from a list of types.
pub fn type_bitmap(rtypes: impl IntoIterator<Item = Rtype>) -> RtypeBitmap<Bytes> {
    let mut builder = RtypeBitmap::<Bytes>::builder();
    for rtype in rtypes {
        builder.add(rtype).expect("bitmap of in-zone types");
    }
    builder.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::rdata::Ns;
    use std::str::FromStr;

    fn ns(target: &str) -> StoredRecordData {
        ZoneRecordData::Ns(Ns::new(Name::from_str(target).unwrap()))
    }

    #[test]
    fn commit_applies_pending_in_canonical_order() {
        let mut rrset = Rrset::new(Rtype::NS, Ttl::from_secs(3600));
        rrset.stage_add(Ttl::from_secs(3600), ns("ns2.example."));
        rrset.stage_add(Ttl::from_secs(3600), ns("ns1.example."));
        assert!(rrset.is_empty());
        assert_eq!(rrset.staged_count(), 2);

        assert!(rrset.commit());
        assert_eq!(rrset.records(), &[ns("ns1.example."), ns("ns2.example.")]);
        assert!(rrset.needs_signatures());

        // A second commit with nothing pending changes nothing.
        assert!(!rrset.commit());
    }

    #[test]
    fn rollback_restores_the_committed_view() {
        let mut rrset = Rrset::new(Rtype::NS, Ttl::from_secs(3600));
        rrset.stage_add(Ttl::from_secs(3600), ns("ns1.example."));
        rrset.commit();

        rrset.stage_remove(ns("ns1.example."));
        rrset.stage_add(Ttl::from_secs(60), ns("ns9.example."));
        assert_eq!(rrset.staged_count(), 1);
        rrset.rollback();

        assert!(!rrset.has_pending());
        assert!(!rrset.commit());
        assert_eq!(rrset.records(), &[ns("ns1.example.")]);
        assert_eq!(rrset.ttl(), Ttl::from_secs(3600));
    }

    #[test]
    fn deleting_an_absent_record_is_not_a_change() {
        let mut rrset = Rrset::new(Rtype::NS, Ttl::from_secs(3600));
        rrset.stage_add(Ttl::from_secs(3600), ns("ns1.example."));
        rrset.commit();
        rrset.stage_remove(ns("ns2.example."));
        assert!(!rrset.commit());
        assert_eq!(rrset.records().len(), 1);
    }
}
