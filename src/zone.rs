//! The top-level zone data store.
//!
//! [`ZoneData`] owns the ordered domain tree, the denial chain and the
//! NSEC3 twin tree, and orchestrates the phases a zone moves through on its
//! way to being signed: staging record changes, structural validation,
//! empty-non-terminal closure, commit (or rollback), denial chain
//! construction and signing.
//!
//! All mutation is `&mut self`; a zone is driven by exactly one worker at a
//! time.  Traversals that mutate tree structure first snapshot the name
//! list (the delete-while-iterate protocol).

use std::io;

use domain::base::iana::Class;
use domain::base::{RecordData, Rtype, Serial, ToName, Ttl};
use domain::rdata::{Soa, ZoneRecordData};
use tracing::{debug, info, trace, warn};

use crate::error::{Violation, ZoneError};
use crate::name::{StoredName, ancestors_up_to, dotted, is_below, parent};
use crate::nodes::{DenialNode, DomainNode, DomainStatus, EntKind};
use crate::records::StoredRecord;
use crate::serial::{SerialPolicy, next_serial_now};
use crate::sign::SigningKey;
use crate::tree::NameTree;

//----------- AdapterMode ------------------------------------------------------

/// Which kind of adapter produced the zone contents.
///
/// Structural violations are fatal when the zone arrived over the wire and
/// downgraded to warnings when it was read from a file, where an operator
/// can be asked to fix the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterMode {
    /// The zone was received over the wire.
    Wire,

    /// The zone was read from a file.
    File,
}

//----------- ZoneData ---------------------------------------------------------

/// The in-memory data of one zone.
#[derive(Clone, Debug)]
pub struct ZoneData {
    /// The apex name.
    pub(crate) apex: StoredName,

    /// The class of every record in the zone.
    class: Class,

    /// The fallback TTL for synthesised records.
    default_ttl: Ttl,

    /// The authoritative name space.
    pub(crate) domains: NameTree<DomainNode>,

    /// The denial chain, keyed by NSEC owner or hashed NSEC3 owner.
    pub(crate) denials: NameTree<DenialNode>,

    /// The NSEC3 twins, absent while the zone is NSEC.
    pub(crate) nsec3_domains: Option<NameTree<DomainNode>>,

    /// The last SOA serial observed from input.
    inbound_serial: Option<Serial>,

    /// The current working SOA serial.
    internal_serial: Option<Serial>,

    /// The last SOA serial emitted.
    outbound_serial: Option<Serial>,

    /// Whether a serial was ever assigned.
    initialized: bool,
}

impl ZoneData {
    /// Construct an empty zone.
    pub fn new(apex: StoredName, class: Class, default_ttl: Ttl) -> Self {
        Self {
            apex,
            class,
            default_ttl,
            domains: NameTree::new(),
            denials: NameTree::new(),
            nsec3_domains: None,
            inbound_serial: None,
            internal_serial: None,
            outbound_serial: None,
            initialized: false,
        }
    }

    /// The apex name.
    pub fn apex(&self) -> &StoredName {
        &self.apex
    }

    /// The zone class.
    pub fn class(&self) -> Class {
        self.class
    }

    /// The fallback TTL for synthesised records.
    pub fn default_ttl(&self) -> Ttl {
        self.default_ttl
    }

    /// The authoritative domain tree.
    pub fn domains(&self) -> &NameTree<DomainNode> {
        &self.domains
    }

    /// The denial chain.
    pub fn denials(&self) -> &NameTree<DenialNode> {
        &self.denials
    }

    /// The NSEC3 twin tree, if the zone is NSEC3.
    pub fn nsec3_domains(&self) -> Option<&NameTree<DomainNode>> {
        self.nsec3_domains.as_ref()
    }

    /// The last SOA serial observed from input.
    pub fn inbound_serial(&self) -> Option<Serial> {
        self.inbound_serial
    }

    /// The current working SOA serial.
    pub fn internal_serial(&self) -> Option<Serial> {
        self.internal_serial
    }

    /// The last SOA serial emitted.
    pub fn outbound_serial(&self) -> Option<Serial> {
        self.outbound_serial
    }

    /// Record the SOA serial observed from input.
    pub fn set_inbound_serial(&mut self, serial: Serial) {
        self.inbound_serial = Some(serial);
    }

    /// Whether the working serial is ahead of the emitted one.
    pub fn serial_is_fresh(&self) -> bool {
        match (self.internal_serial, self.outbound_serial) {
            (Some(internal), Some(outbound)) => internal > outbound,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

//--- staging record changes

impl ZoneData {
    /// Stage the addition of a record.
    ///
    /// The owning domain is created on demand; with `at_apex`, a freshly
    /// created domain is classified as the apex right away.
    pub fn add_rr(&mut self, record: StoredRecord, at_apex: bool) -> Result<(), ZoneError> {
        if record.class() != self.class {
            return Err(ZoneError::ClassMismatch);
        }
        let owner = record.owner().clone();
        if !owner.ends_with(&self.apex) {
            warn!("Ignoring record at '{owner}': not below the apex");
            return Err(ZoneError::Arg("record owner outside the zone"));
        }

        if !self.domains.contains(&owner) {
            let status = if at_apex {
                DomainStatus::Apex
            } else {
                DomainStatus::None
            };
            self.domains.insert(owner.clone(), DomainNode::new(status))?;
        }

        let ttl = record.ttl();
        let data = record.into_data();
        let rtype = data.rtype();
        let node = self.domains.get_mut(&owner).expect("domain was just ensured");
        node.rrset_entry(rtype, ttl).stage_add(ttl, data);
        trace!("Staged add of {rtype} at '{owner}'");
        Ok(())
    }

    /// Stage the deletion of a record.
    ///
    /// Deleting at an absent owner or type is a warning, not an error.
    pub fn del_rr(&mut self, record: StoredRecord) -> Result<(), ZoneError> {
        if record.class() != self.class {
            return Err(ZoneError::ClassMismatch);
        }
        let owner = record.owner().clone();
        let data = record.into_data();
        let rtype = data.rtype();

        let Some(node) = self.domains.get_mut(&owner) else {
            warn!("Deletion at unknown name '{owner}'");
            return Ok(());
        };
        let Some(rrset) = node.rrset_mut(rtype) else {
            warn!("Deletion of absent {rtype} RRset at '{owner}'");
            return Ok(());
        };
        rrset.stage_remove(data);
        trace!("Staged delete of {rtype} at '{owner}'");
        Ok(())
    }
}

//--- commit and rollback

impl ZoneData {
    /// Promote all pending changes to the committed state.
    ///
    /// Domains are visited in reverse canonical order so that children are
    /// settled before their parents.  A domain that ends up with no RRsets
    /// is deleted, provided it is a leaf and holds no denial node.
    pub fn commit(&mut self) -> Result<(), ZoneError> {
        let names = self.domains.names();
        for name in names.iter().rev() {
            let node = self
                .domains
                .get_mut(name)
                .expect("snapshotted domains are present");
            for rrset in node.rrsets_sorted_mut() {
                rrset.commit();
            }
            node.prune_empty_rrsets();

            let deletable = node.committed_is_empty() && node.denial.is_none();
            if deletable && self.domains.descendants(name).next().is_none() {
                self.domains.remove(name);
                trace!("Deleted emptied domain '{name}'");
            }
        }
        self.reclassify();
        debug!("Committed zone '{}': {} domains", self.apex, self.domains.len());
        Ok(())
    }

    /// Discard all pending changes, leaving the committed state untouched.
    pub fn rollback(&mut self) {
        let names = self.domains.names();
        for name in &names {
            let node = self
                .domains
                .get_mut(name)
                .expect("snapshotted domains are present");
            for rrset in node.rrsets_sorted_mut() {
                rrset.rollback();
            }
            node.prune_empty_rrsets();
        }
        self.reclassify();
        debug!("Rolled back pending changes for zone '{}'", self.apex);
    }

    /// Mark RRsets whose signatures are no longer valid.
    ///
    /// A signature set is invalidated by pending changes to the covered
    /// records or by a change in the active signing key set.
    pub fn diff(&mut self, keys: &[SigningKey]) {
        let mut zsk_tags: Vec<u16> = keys
            .iter()
            .filter(|key| !key.is_ksk())
            .map(|key| key.key_tag)
            .collect();
        let mut ksk_tags: Vec<u16> =
            keys.iter().filter(|key| key.is_ksk()).map(|key| key.key_tag).collect();
        zsk_tags.sort_unstable();
        ksk_tags.sort_unstable();
        // A zone signed by a lone CSK uses it for everything.
        if zsk_tags.is_empty() {
            zsk_tags = ksk_tags.clone();
        }

        for (_, node) in self.domains.iter_mut() {
            for rrset in node.rrsets_sorted_mut() {
                if rrset.rtype() == Rtype::RRSIG {
                    continue;
                }
                let wanted = if rrset.rtype() == Rtype::DNSKEY {
                    &ksk_tags
                } else {
                    &zsk_tags
                };
                let mut have: Vec<u16> = rrset
                    .signatures()
                    .iter()
                    .map(|sig| sig.key_tag())
                    .collect();
                have.sort_unstable();
                have.dedup();
                if rrset.has_pending() || have != *wanted {
                    rrset.invalidate_signatures();
                }
            }
        }
    }
}

//--- empty non-terminal closure

impl ZoneData {
    /// Close the domain tree under empty non-terminals.
    ///
    /// For every domain below the apex, missing ancestors are created as
    /// empty non-terminals; the reclassification pass then settles their
    /// kinds and the subdomain counters.
    pub fn entize(&mut self) -> Result<(), ZoneError> {
        let names = self.domains.names();
        let mut created = 0usize;
        for name in &names {
            if !is_below(name, &self.apex) {
                continue;
            }
            for ancestor in ancestors_up_to(name, &self.apex) {
                if self.domains.contains(&ancestor) {
                    break;
                }
                self.domains
                    .insert(ancestor.clone(), DomainNode::new(DomainStatus::Ent(EntKind::Auth)))?;
                created += 1;
            }
        }
        if created > 0 {
            debug!("Created {created} empty non-terminals in zone '{}'", self.apex);
        }
        self.reclassify();
        Ok(())
    }
}

//--- classification

/// An ancestor that hides or restricts the names below it.
enum Shadow {
    /// A delegation point and its name server targets.
    Cut(Vec<StoredName>),

    /// A DNAME; everything below is occluded.
    Dname,
}

impl ZoneData {
    /// Recompute every domain's status and the subdomain counters.
    ///
    /// Statuses are a function of the staged contents (so that validation
    /// before a commit sees what the commit would produce); after a commit
    /// or rollback the staged view equals the committed one.
    pub(crate) fn reclassify(&mut self) {
        let names = self.domains.names();

        // Pass 1: statuses, walking parents before children with a stack of
        // the cuts and DNAMEs currently shadowing the traversal.
        let mut shadows: Vec<(StoredName, Shadow)> = Vec::new();
        for name in &names {
            while let Some((owner, _)) = shadows.last() {
                if is_below(name, owner) {
                    break;
                }
                shadows.pop();
            }

            let node = self.domains.get(name).expect("snapshotted domains are present");
            let staged_types = node.staged_types();
            let status = match shadows.last() {
                // Empty names below a shadow stay empty non-terminals; the
                // second pass settles them as glue-only.
                Some(_) if staged_types.is_empty() => DomainStatus::Ent(EntKind::Glue),
                Some((_, Shadow::Dname)) => DomainStatus::Occluded,
                Some((_, Shadow::Cut(targets))) => {
                    let only_addresses = staged_types
                        .iter()
                        .all(|rtype| matches!(*rtype, Rtype::A | Rtype::AAAA));
                    if targets.contains(name) && only_addresses {
                        DomainStatus::Glue
                    } else {
                        DomainStatus::Occluded
                    }
                }
                None => {
                    if *name == self.apex {
                        DomainStatus::Apex
                    } else if staged_types.contains(&Rtype::NS) {
                        DomainStatus::Cut {
                            secure: staged_types.contains(&Rtype::DS),
                        }
                    } else if staged_types.is_empty() {
                        DomainStatus::Ent(EntKind::Auth)
                    } else {
                        DomainStatus::Auth
                    }
                }
            };

            if matches!(status, DomainStatus::Cut { .. }) {
                let targets = self.ns_targets(name);
                shadows.push((name.clone(), Shadow::Cut(targets)));
            }
            if self
                .domains
                .get(name)
                .expect("snapshotted domains are present")
                .staged_has(Rtype::DNAME)
            {
                shadows.push((name.clone(), Shadow::Dname));
            }

            self.domains
                .get_mut(name)
                .expect("snapshotted domains are present")
                .status = status;
        }

        // Pass 2: settle the kind of each empty non-terminal from what it
        // leads to.
        for name in &names {
            if !self
                .domains
                .get(name)
                .is_some_and(|node| node.status.is_ent())
            {
                continue;
            }
            let mut any_auth = false;
            let mut any_insecure_cut = false;
            for (_, below) in self.domains.descendants(name) {
                match below.status {
                    DomainStatus::Auth
                    | DomainStatus::Apex
                    | DomainStatus::Cut { secure: true } => any_auth = true,
                    DomainStatus::Cut { secure: false } => any_insecure_cut = true,
                    _ => {}
                }
            }
            let kind = if any_auth {
                EntKind::Auth
            } else if any_insecure_cut {
                EntKind::Ns
            } else {
                EntKind::Glue
            };
            self.domains
                .get_mut(name)
                .expect("snapshotted domains are present")
                .status = DomainStatus::Ent(kind);
        }

        self.recount();
    }

    /// Recompute the subdomain counters from the current statuses.
    pub(crate) fn recount(&mut self) {
        let mut increments: Vec<(StoredName, bool)> = Vec::new();
        for (name, node) in self.domains.iter() {
            if *name == self.apex {
                continue;
            }
            let Some(parent_name) = parent(name) else {
                continue;
            };
            if !self.domains.contains(&parent_name) {
                continue;
            }
            let counts_as_auth = !matches!(
                node.status,
                DomainStatus::Glue
                    | DomainStatus::Occluded
                    | DomainStatus::Ent(EntKind::Glue)
            );
            increments.push((parent_name, counts_as_auth));
        }
        for (_, node) in self.domains.iter_mut() {
            node.subdomain_count = 0;
            node.subdomain_auth = 0;
        }
        for (parent_name, counts_as_auth) in increments {
            let node = self
                .domains
                .get_mut(&parent_name)
                .expect("parent presence was checked");
            node.subdomain_count += 1;
            if counts_as_auth {
                node.subdomain_auth += 1;
            }
        }
    }

    /// The staged NS targets at a name.
    fn ns_targets(&self, name: &StoredName) -> Vec<StoredName> {
        let Some(rrset) = self.domains.get(name).and_then(|node| node.rrset(Rtype::NS))
        else {
            return Vec::new();
        };
        rrset
            .staged_records()
            .iter()
            .filter_map(|data| match data {
                ZoneRecordData::Ns(ns) => Some(ns.nsdname().clone()),
                _ => None,
            })
            .collect()
    }
}

//--- structural validation

impl ZoneData {
    /// Check the structural rules on the staged contents.
    ///
    /// In [`AdapterMode::Wire`] the first violation is returned as an
    /// error; in [`AdapterMode::File`] violations are logged and the zone
    /// is accepted.
    pub fn examine(&self, mode: AdapterMode) -> Result<(), ZoneError> {
        for (name, node) in self.domains.iter() {
            let staged_types = node.staged_types();

            // An RRset must be alone at a name holding a CNAME.
            if let Some(cname) = node.rrset(Rtype::CNAME)
                && cname.staged_count() > 0
            {
                if cname.staged_count() > 1 {
                    self.flag(mode, name, Rtype::CNAME, Violation::CnameNotSingleton)?;
                }
                let foreign = staged_types.iter().any(|rtype| {
                    !matches!(
                        *rtype,
                        Rtype::CNAME | Rtype::RRSIG | Rtype::NSEC | Rtype::NSEC3
                    )
                });
                if foreign {
                    self.flag(mode, name, Rtype::CNAME, Violation::CnameNotAlone)?;
                }
            }

            // At most one DNAME.
            if let Some(dname) = node.rrset(Rtype::DNAME)
                && dname.staged_count() > 1
            {
                self.flag(mode, name, Rtype::DNAME, Violation::DnameNotSingleton)?;
            }

            // Only delegation data at a zone cut.
            if *name != self.apex && staged_types.contains(&Rtype::NS) {
                let targets = self.ns_targets(name);
                for rtype in &staged_types {
                    let allowed = match *rtype {
                        Rtype::NS | Rtype::DS | Rtype::RRSIG | Rtype::NSEC | Rtype::NSEC3 => {
                            true
                        }
                        Rtype::A | Rtype::AAAA => targets.contains(name),
                        _ => false,
                    };
                    if !allowed {
                        self.flag(mode, name, *rtype, Violation::ForeignDataAtCut)?;
                    }
                }
            }

            // File input may carry data the zone cuts above it occlude; walk
            // the ancestors to point it out.  Wire input is produced from a
            // committed zone and cannot be occluded, so the walk is skipped.
            if mode == AdapterMode::File && !staged_types.is_empty() {
                self.occlusion_walk(name, &staged_types);
            }
        }
        Ok(())
    }

    /// Report one violation according to the adapter mode.
    fn flag(
        &self,
        mode: AdapterMode,
        owner: &StoredName,
        rtype: Rtype,
        violation: Violation,
    ) -> Result<(), ZoneError> {
        match mode {
            AdapterMode::Wire => Err(ZoneError::Structural {
                owner: owner.clone(),
                rtype,
                violation,
            }),
            AdapterMode::File => {
                warn!("{violation} ({rtype} at '{owner}')");
                Ok(())
            }
        }
    }

    /// Warn about data occluded by a DNAME or zone cut above it.
    fn occlusion_walk(&self, name: &StoredName, staged_types: &[Rtype]) {
        for ancestor in ancestors_up_to(name, &self.apex) {
            let Some(above) = self.domains.get(&ancestor) else {
                continue;
            };
            if above.staged_has(Rtype::DNAME) {
                warn!("Data at '{name}' is occluded by the DNAME at '{ancestor}'");
                return;
            }
            if ancestor != self.apex && above.staged_has(Rtype::NS) {
                let glue = self.ns_targets(&ancestor).contains(name)
                    && staged_types
                        .iter()
                        .all(|rtype| matches!(*rtype, Rtype::A | Rtype::AAAA));
                if !glue {
                    warn!("Data at '{name}' is occluded by the delegation at '{ancestor}'");
                }
                return;
            }
        }
    }
}

//--- serial maintenance and emission

impl ZoneData {
    /// Produce the next working serial under a policy and install it.
    ///
    /// The serial is written into the committed apex SOA, which invalidates
    /// that RRset's signatures.
    pub fn update_serial(&mut self, policy: SerialPolicy) -> Result<Serial, ZoneError> {
        let prev = if self.initialized {
            self.internal_serial
        } else {
            None
        };
        let serial = next_serial_now(policy, self.inbound_serial, prev)?;
        self.install_serial(serial)?;
        info!(
            "Zone '{}': serial {} under policy '{policy}'",
            self.apex, serial
        );
        Ok(serial)
    }

    /// Write a serial into the committed apex SOA.
    fn install_serial(&mut self, serial: Serial) -> Result<(), ZoneError> {
        let node = self
            .domains
            .get_mut(&self.apex)
            .ok_or(ZoneError::Arg("zone has no apex domain"))?;
        let rrset = node
            .rrset_mut(Rtype::SOA)
            .ok_or(ZoneError::Arg("zone has no SOA"))?;
        let Some(ZoneRecordData::Soa(soa)) = rrset.records().first() else {
            return Err(ZoneError::Arg("zone has no committed SOA"));
        };
        let soa = Soa::new(
            soa.mname().clone(),
            soa.rname().clone(),
            serial,
            soa.refresh(),
            soa.retry(),
            soa.expire(),
            soa.minimum(),
        );
        let ttl = rrset.ttl();
        rrset.replace_records(ttl, vec![ZoneRecordData::Soa(soa)]);
        self.internal_serial = Some(serial);
        self.initialized = true;
        Ok(())
    }

    /// The TTL for denial records: the SOA MINIMUM, or the zone default.
    pub(crate) fn denial_ttl(&self) -> Ttl {
        self.domains
            .get(&self.apex)
            .and_then(|node| node.rrset(Rtype::SOA))
            .and_then(|rrset| match rrset.records().first() {
                Some(ZoneRecordData::Soa(soa)) => Some(soa.minimum()),
                _ => None,
            })
            .unwrap_or(self.default_ttl)
    }

    /// Emit the committed zone, its signatures and the denial chain.
    ///
    /// Records are written in canonical order, the denial chain after the
    /// authoritative data.  Emission records the outbound serial.
    pub fn write(&mut self, target: &mut impl io::Write) -> io::Result<()> {
        let class = self.class;
        for (name, node) in self.domains.iter() {
            let owner = dotted(name);
            for rrset in node.rrsets_sorted() {
                for data in rrset.records() {
                    writeln!(
                        target,
                        "{owner}\t{}\t{class}\t{}\t{data}",
                        rrset.ttl().as_secs(),
                        rrset.rtype(),
                    )?;
                }
                for sig in rrset.signatures() {
                    writeln!(
                        target,
                        "{owner}\t{}\t{class}\tRRSIG\t{sig}",
                        rrset.ttl().as_secs(),
                    )?;
                }
            }
        }
        for (name, denial) in self.denials.iter() {
            let owner = dotted(name);
            for data in denial.rrset.records() {
                writeln!(
                    target,
                    "{owner}\t{}\t{class}\t{}\t{data}",
                    denial.rrset.ttl().as_secs(),
                    denial.rrset.rtype(),
                )?;
            }
            for sig in denial.rrset.signatures() {
                writeln!(
                    target,
                    "{owner}\t{}\t{class}\tRRSIG\t{sig}",
                    denial.rrset.ttl().as_secs(),
                )?;
            }
        }
        self.outbound_serial = self.internal_serial;
        Ok(())
    }
}
