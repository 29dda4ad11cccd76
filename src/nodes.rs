//! The nodes stored in the domain and denial trees.

use domain::base::{Rtype, Ttl};
use foldhash::HashMap;

use crate::name::StoredName;
use crate::records::{Rrset, StoredRecordData};

//----------- DomainStatus -----------------------------------------------------

/// How a domain relates to the zone around it.
///
/// The status is a function of the domain's contents and of the cuts and
/// DNAMEs above it; it is recomputed whenever either changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainStatus {
    /// Not classified yet.
    None,

    /// The zone apex.
    Apex,

    /// Ordinary authoritative data.
    Auth,

    /// A delegation point.  `secure` when a DS RRset is present.
    Cut {
        /// Whether the delegation carries a DS RRset.
        secure: bool,
    },

    /// An empty non-terminal, existing only to close the tree.
    Ent(EntKind),

    /// Glue for an in-bailiwick name server below a delegation.
    Glue,

    /// Hidden below a DNAME, or non-glue below a cut.
    Occluded,

    /// A hashed NSEC3 owner.
    Hash,
}

/// What an empty non-terminal leads to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntKind {
    /// Authoritative data below.
    Auth,

    /// Only unsigned delegations below.
    Ns,

    /// Only occluded data or glue below.
    Glue,
}

impl DomainStatus {
    /// Whether this is an empty non-terminal.
    pub fn is_ent(&self) -> bool {
        matches!(self, DomainStatus::Ent(_))
    }

    /// Whether a domain with this status belongs on the denial chain.
    ///
    /// Occluded data, glue-only empty non-terminals and unclassified
    /// domains never appear.  Under NSEC3 Opt-Out, unsigned delegations
    /// are dropped too, along with their glue and the empty non-terminals
    /// leading only to them.
    pub fn eligible_for_denial(&self, opt_out: bool) -> bool {
        match self {
            DomainStatus::Apex | DomainStatus::Auth => true,
            DomainStatus::Cut { secure } => *secure || !opt_out,
            DomainStatus::Ent(EntKind::Auth) => true,
            DomainStatus::Ent(EntKind::Ns) => !opt_out,
            DomainStatus::Glue => !opt_out,
            DomainStatus::Ent(EntKind::Glue)
            | DomainStatus::Occluded
            | DomainStatus::Hash
            | DomainStatus::None => false,
        }
    }
}

impl std::fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainStatus::None => f.write_str("none"),
            DomainStatus::Apex => f.write_str("apex"),
            DomainStatus::Auth => f.write_str("auth"),
            DomainStatus::Cut { secure: false } => f.write_str("cut"),
            DomainStatus::Cut { secure: true } => f.write_str("cut-ds"),
            DomainStatus::Ent(EntKind::Auth) => f.write_str("ent-auth"),
            DomainStatus::Ent(EntKind::Ns) => f.write_str("ent-ns"),
            DomainStatus::Ent(EntKind::Glue) => f.write_str("ent-glue"),
            DomainStatus::Glue => f.write_str("glue"),
            DomainStatus::Occluded => f.write_str("occluded"),
            DomainStatus::Hash => f.write_str("hash"),
        }
    }
}

impl std::str::FromStr for DomainStatus {
    type Err = ();

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Ok(match text {
            "none" => DomainStatus::None,
            "apex" => DomainStatus::Apex,
            "auth" => DomainStatus::Auth,
            "cut" => DomainStatus::Cut { secure: false },
            "cut-ds" => DomainStatus::Cut { secure: true },
            "ent-auth" => DomainStatus::Ent(EntKind::Auth),
            "ent-ns" => DomainStatus::Ent(EntKind::Ns),
            "ent-glue" => DomainStatus::Ent(EntKind::Glue),
            "glue" => DomainStatus::Glue,
            "occluded" => DomainStatus::Occluded,
            "hash" => DomainStatus::Hash,
            _ => return Err(()),
        })
    }
}

//----------- DomainNode -------------------------------------------------------

/// A named node of the authoritative (or hashed) name space.
#[derive(Clone, Debug)]
pub struct DomainNode {
    /// The RRsets at this name, by record type.
    rrsets: HashMap<Rtype, Rrset>,

    /// The current classification.
    pub status: DomainStatus,

    /// The number of children in the tree.
    pub subdomain_count: usize,

    /// The number of children that are not glue.
    pub subdomain_auth: usize,

    /// The hashed twin of this domain, or (on a twin) the original.
    ///
    /// Back-references are owner-name handles into the respective tree,
    /// validated on use.
    pub nsec3_twin: Option<StoredName>,

    /// The owner of this domain's denial node, if one exists.
    pub denial: Option<StoredName>,

    /// On an NSEC3 twin, the raw (un-encoded) hash of the original owner.
    pub raw_hash: Option<Vec<u8>>,
}

impl DomainNode {
    /// Construct an empty domain with the given status.
    pub fn new(status: DomainStatus) -> Self {
        Self {
            rrsets: HashMap::default(),
            status,
            subdomain_count: 0,
            subdomain_auth: 0,
            nsec3_twin: None,
            denial: None,
            raw_hash: None,
        }
    }

    /// The RRset of a type, if present.
    pub fn rrset(&self, rtype: Rtype) -> Option<&Rrset> {
        self.rrsets.get(&rtype)
    }

    /// The RRset of a type, mutably, created on demand.
    pub fn rrset_entry(&mut self, rtype: Rtype, ttl: Ttl) -> &mut Rrset {
        self.rrsets
            .entry(rtype)
            .or_insert_with(|| Rrset::new(rtype, ttl))
    }

    /// The RRset of a type, mutably, if present.
    pub fn rrset_mut(&mut self, rtype: Rtype) -> Option<&mut Rrset> {
        self.rrsets.get_mut(&rtype)
    }

    /// Insert or replace a whole RRset.
    pub fn put_rrset(&mut self, rrset: Rrset) {
        self.rrsets.insert(rrset.rtype(), rrset);
    }

    /// Remove the RRset of a type.
    pub fn remove_rrset(&mut self, rtype: Rtype) -> Option<Rrset> {
        self.rrsets.remove(&rtype)
    }

    /// All RRsets, in ascending type order.
    ///
    /// The map itself iterates in arbitrary order; sorting keeps every
    /// caller deterministic.
    pub fn rrsets_sorted(&self) -> Vec<&Rrset> {
        let mut rrsets: Vec<&Rrset> = self.rrsets.values().collect();
        rrsets.sort_by_key(|rrset| rrset.rtype());
        rrsets
    }

    /// All RRsets, mutably, in ascending type order.
    pub fn rrsets_sorted_mut(&mut self) -> Vec<&mut Rrset> {
        let mut rrsets: Vec<&mut Rrset> = self.rrsets.values_mut().collect();
        rrsets.sort_by_key(|rrset| rrset.rtype());
        rrsets
    }

    /// The types with committed records, in ascending order.
    pub fn committed_types(&self) -> Vec<Rtype> {
        let mut types: Vec<Rtype> = self
            .rrsets
            .values()
            .filter(|rrset| !rrset.is_empty())
            .map(|rrset| rrset.rtype())
            .collect();
        types.sort();
        types
    }

    /// Whether a type is present in the staged view.
    pub fn staged_has(&self, rtype: Rtype) -> bool {
        self.rrset(rtype)
            .is_some_and(|rrset| rrset.staged_count() > 0)
    }

    /// The types present in the staged view, in ascending order.
    pub fn staged_types(&self) -> Vec<Rtype> {
        let mut types: Vec<Rtype> = self
            .rrsets
            .values()
            .filter(|rrset| rrset.staged_count() > 0)
            .map(|rrset| rrset.rtype())
            .collect();
        types.sort();
        types
    }

    /// Whether the domain has no committed records at all.
    pub fn committed_is_empty(&self) -> bool {
        self.rrsets.values().all(|rrset| rrset.is_empty())
    }

    /// Whether the staged view has no records at all.
    pub fn staged_is_empty(&self) -> bool {
        self.rrsets.values().all(|rrset| rrset.staged_count() == 0)
    }

    /// Whether any RRset has pending changes.
    pub fn has_pending(&self) -> bool {
        self.rrsets.values().any(|rrset| rrset.has_pending())
    }

    /// Drop RRsets that are empty and have nothing pending.
    pub fn prune_empty_rrsets(&mut self) {
        self.rrsets
            .retain(|_, rrset| !rrset.is_empty() || rrset.has_pending());
    }
}

//----------- DenialNode -------------------------------------------------------

/// A node of the authenticated-denial chain.
///
/// For NSEC the owner equals the domain name; for NSEC3 it is the hashed
/// owner under the apex.  The single denial record and its signatures live
/// in the embedded RRset.
#[derive(Clone, Debug)]
pub struct DenialNode {
    /// The denial RRset (one NSEC or NSEC3 record).
    pub rrset: Rrset,

    /// The originating domain.
    pub domain: StoredName,

    /// Whether the type bitmap changed in the last chain rebuild.
    pub bitmap_changed: bool,

    /// Whether the next-owner pointer changed in the last chain rebuild.
    pub nxt_changed: bool,
}

impl DenialNode {
    /// Construct a denial node from a freshly built record.
    pub fn new(rtype: Rtype, ttl: Ttl, data: StoredRecordData, domain: StoredName) -> Self {
        Self {
            rrset: Rrset::committed(rtype, ttl, vec![data]),
            domain,
            bitmap_changed: true,
            nxt_changed: true,
        }
    }

    /// The denial record itself.
    pub fn record(&self) -> Option<&StoredRecordData> {
        self.rrset.records().first()
    }
}
