//! Denial-of-existence chain construction.
//!
//! The chain is rebuilt from the committed tree by [`ZoneData::nsecify`]
//! (NSEC) or [`ZoneData::nsecify3`] (NSEC3).  Rebuilding reuses existing
//! denial nodes where the record would come out unchanged, so that their
//! signatures survive; anything else is replaced and flagged for signing.
//!
//! Hashing follows RFC 5155 §5: iterated SHA-1 over the canonical wire
//! form of the owner name, salted on every round.

use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};
use domain::base::iana::Nsec3HashAlgorithm;
use domain::base::name::NameBuilder;
use domain::base::{Rtype, Ttl};
use domain::rdata::nsec3::{Nsec3Salt, OwnerHash};
use domain::rdata::{Nsec, Nsec3, Nsec3param, ZoneRecordData};
use ring::digest;
use tracing::{debug, trace};

use crate::error::ZoneError;
use crate::name::{StoredName, canonical_wire};
use crate::nodes::{DenialNode, DomainNode, DomainStatus};
use crate::policy::Nsec3Params;
use crate::records::{Rrset, type_bitmap};
use crate::sign::Cancel;
use crate::tree::NameTree;
use crate::zone::ZoneData;

/// The NSEC3 Opt-Out flag bit.
const NSEC3_OPT_OUT: u8 = 0x01;

//--- hashing

/// The RFC 5155 hash of an owner name.
pub fn nsec3_hash(name: &StoredName, params: &Nsec3Params) -> Vec<u8> {
    let mut input = canonical_wire(name);
    input.extend_from_slice(&params.salt);
    let mut hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &input);
    for _ in 0..params.iterations {
        let mut round = hash.as_ref().to_vec();
        round.extend_from_slice(&params.salt);
        hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &round);
    }
    hash.as_ref().to_vec()
}

//--- chain construction

impl ZoneData {
    /// Rebuild the NSEC chain from the committed tree.
    pub fn nsecify(&mut self) -> Result<(), ZoneError> {
        // Leaving NSEC3 behind invalidates the whole chain.
        if self.nsec3_domains.is_some() {
            self.wipe_denial();
        }
        let ttl = self.denial_ttl();

        let eligible: Vec<StoredName> = self
            .domains
            .iter()
            .filter(|(_, node)| node.status.eligible_for_denial(false))
            .map(|(name, _)| name.clone())
            .collect();
        self.drop_stale_denials(&eligible.iter().cloned().collect());
        if eligible.is_empty() {
            debug!("Zone '{}' has no names eligible for NSEC", self.apex);
            return Ok(());
        }

        for (index, owner) in eligible.iter().enumerate() {
            let next = eligible[(index + 1) % eligible.len()].clone();
            let node = self
                .domains
                .get(owner)
                .expect("eligible names are in the tree");
            let mut types = node.committed_types();
            types.push(Rtype::NSEC);
            types.push(Rtype::RRSIG);
            let bitmap = type_bitmap(types);

            let (nxt_changed, bitmap_changed) = match self
                .denials
                .get(owner)
                .and_then(|denial| denial.record())
            {
                Some(ZoneRecordData::Nsec(old)) => {
                    (old.next_name() != &next, old.types() != &bitmap)
                }
                _ => (true, true),
            };
            let data = ZoneRecordData::Nsec(Nsec::new(next, bitmap));
            self.upsert_denial(
                owner.clone(),
                owner.clone(),
                Rtype::NSEC,
                ttl,
                data,
                nxt_changed,
                bitmap_changed,
            );
        }
        debug!(
            "Zone '{}': NSEC chain over {} names",
            self.apex,
            eligible.len()
        );
        Ok(())
    }

    /// Rebuild the NSEC3 chain from the committed tree.
    ///
    /// Every eligible domain gets a hashed twin under the apex; the chain
    /// then runs over the twins in canonical order.  Two names hashing to
    /// the same twin abort the build with both names.
    pub fn nsecify3(
        &mut self,
        params: &Nsec3Params,
        opt_out: bool,
        cancel: &Cancel,
    ) -> Result<(), ZoneError> {
        // Leaving NSEC behind invalidates the whole chain.
        let had_nsec = self
            .denials
            .iter()
            .any(|(_, denial)| denial.rrset.rtype() == Rtype::NSEC);
        if had_nsec {
            self.wipe_denial();
        }
        let ttl = self.denial_ttl();
        let flags = if opt_out {
            params.flags | NSEC3_OPT_OUT
        } else {
            params.flags
        };

        // The apex advertises the hashing parameters.  Its flags field is
        // always zero on the NSEC3PARAM record.
        let apex = self.apex.clone();
        if let Some(node) = self.domains.get_mut(&apex) {
            let param_data = ZoneRecordData::Nsec3param(Nsec3param::new(
                Nsec3HashAlgorithm::from_int(params.algorithm),
                0,
                params.iterations,
                salt_of(params),
            ));
            let unchanged = node
                .rrset(Rtype::NSEC3PARAM)
                .is_some_and(|rrset| rrset.records() == [param_data.clone()]);
            if !unchanged {
                node.put_rrset(Rrset::committed(
                    Rtype::NSEC3PARAM,
                    ttl,
                    vec![param_data],
                ));
            }
        }

        // Hash every eligible name into its twin.  Twin links are rebuilt
        // from scratch; the denial nodes themselves are reused below.
        for (_, node) in self.domains.iter_mut() {
            node.nsec3_twin = None;
        }
        let eligible: Vec<StoredName> = self
            .domains
            .iter()
            .filter(|(_, node)| node.status.eligible_for_denial(opt_out))
            .map(|(name, _)| name.clone())
            .collect();
        let mut twins: NameTree<DomainNode> = NameTree::new();
        for owner in &eligible {
            cancel.check()?;
            let hash = nsec3_hash(owner, params);
            let hashed_owner = self.hashed_owner_name(&hash);
            trace!("'{owner}' hashes to '{hashed_owner}'");
            insert_twin(&mut twins, hashed_owner.clone(), owner.clone(), hash)?;
            self.domains
                .get_mut(owner)
                .expect("eligible names are in the tree")
                .nsec3_twin = Some(hashed_owner);
        }

        // Chain the twins in canonical (hash) order.
        let chain: Vec<(StoredName, StoredName, Vec<u8>)> = twins
            .iter()
            .map(|(hashed, twin)| {
                (
                    hashed.clone(),
                    twin.nsec3_twin.clone().expect("twins link back"),
                    twin.raw_hash.clone().expect("twins carry their hash"),
                )
            })
            .collect();
        self.drop_stale_denials(&chain.iter().map(|(hashed, _, _)| hashed.clone()).collect());
        if chain.is_empty() {
            debug!("Zone '{}' has no names eligible for NSEC3", self.apex);
            self.nsec3_domains = Some(twins);
            return Ok(());
        }

        for (index, (hashed, original, _)) in chain.iter().enumerate() {
            let (_, _, next_hash) = &chain[(index + 1) % chain.len()];
            let node = self
                .domains
                .get(original)
                .expect("originals are in the tree");
            let mut types = node.committed_types();
            types.push(Rtype::RRSIG);
            let bitmap = type_bitmap(types);
            let next_owner = OwnerHash::from_octets(Bytes::copy_from_slice(next_hash))
                .expect("a SHA-1 hash fits an owner hash");

            let (nxt_changed, bitmap_changed) = match self
                .denials
                .get(hashed)
                .and_then(|denial| denial.record())
            {
                Some(ZoneRecordData::Nsec3(old)) => {
                    let params_changed = old.hash_algorithm().to_int() != params.algorithm
                        || old.flags() != flags
                        || old.iterations() != params.iterations
                        || old.salt().as_slice() != params.salt.as_slice();
                    (
                        old.next_owner() != &next_owner || params_changed,
                        old.types() != &bitmap || params_changed,
                    )
                }
                _ => (true, true),
            };
            let data = ZoneRecordData::Nsec3(Nsec3::new(
                Nsec3HashAlgorithm::from_int(params.algorithm),
                flags,
                params.iterations,
                salt_of(params),
                next_owner,
                bitmap,
            ));
            self.upsert_denial(
                hashed.clone(),
                original.clone(),
                Rtype::NSEC3,
                ttl,
                data,
                nxt_changed,
                bitmap_changed,
            );
        }

        debug!(
            "Zone '{}': NSEC3 chain over {} of {} names (opt-out: {opt_out})",
            self.apex,
            chain.len(),
            self.domains.len()
        );
        self.nsec3_domains = Some(twins);
        Ok(())
    }

    /// Destroy the denial chain and all twin linkage.
    ///
    /// The next `nsecify(3)` starts from scratch.
    pub fn wipe_denial(&mut self) {
        for (_, node) in self.domains.iter_mut() {
            node.denial = None;
            node.nsec3_twin = None;
            node.remove_rrset(Rtype::NSEC3PARAM);
        }
        self.denials.clear();
        self.nsec3_domains = None;
        debug!("Wiped the denial chain of zone '{}'", self.apex);
    }

    /// Remove denial nodes whose owner is no longer on the chain.
    fn drop_stale_denials(&mut self, keep: &BTreeSet<StoredName>) {
        let stale: Vec<StoredName> = self
            .denials
            .iter()
            .filter(|(owner, _)| !keep.contains(*owner))
            .map(|(owner, _)| owner.clone())
            .collect();
        for owner in stale {
            if let Some(denial) = self.denials.remove(&owner)
                && let Some(node) = self.domains.get_mut(&denial.domain)
                && node.denial.as_ref() == Some(&owner)
            {
                node.denial = None;
            }
        }
    }

    /// Create or update one denial node and link its domain.
    #[allow(clippy::too_many_arguments)]
    fn upsert_denial(
        &mut self,
        owner: StoredName,
        domain: StoredName,
        rtype: Rtype,
        ttl: Ttl,
        data: crate::records::StoredRecordData,
        nxt_changed: bool,
        bitmap_changed: bool,
    ) {
        match self.denials.get_mut(&owner) {
            Some(denial) => {
                denial.domain = domain.clone();
                denial.bitmap_changed = bitmap_changed;
                denial.nxt_changed = nxt_changed;
                if nxt_changed || bitmap_changed {
                    denial.rrset.replace_records(ttl, vec![data]);
                }
            }
            None => {
                let denial = DenialNode::new(rtype, ttl, data, domain.clone());
                self.denials
                    .insert(owner.clone(), denial)
                    .expect("owner was absent");
            }
        }
        if let Some(node) = self.domains.get_mut(&domain) {
            node.denial = Some(owner);
        }
    }

    /// The owner name of the twin for a raw hash.
    pub(crate) fn hashed_owner_name(&self, hash: &[u8]) -> StoredName {
        let owner_hash = OwnerHash::from_octets(Bytes::copy_from_slice(hash))
            .expect("a SHA-1 hash fits an owner hash");
        let mut builder = NameBuilder::<BytesMut>::new();
        builder
            .append_label(owner_hash.to_string().as_bytes())
            .expect("a hash label is within limits");
        builder
            .append_origin(&self.apex)
            .expect("a hashed owner is within limits")
    }
}

/// The salt in record-data form.
fn salt_of(params: &Nsec3Params) -> Nsec3Salt<Bytes> {
    Nsec3Salt::from_octets(Bytes::copy_from_slice(&params.salt))
        .expect("configured salt is within limits")
}

/// Insert a hashed twin, detecting collisions.
///
/// Returns both original names when two of them hash to the same owner.
fn insert_twin(
    twins: &mut NameTree<DomainNode>,
    hashed_owner: StoredName,
    original: StoredName,
    hash: Vec<u8>,
) -> Result<(), ZoneError> {
    if let Some(existing) = twins.get(&hashed_owner) {
        let existing = existing
            .nsec3_twin
            .clone()
            .expect("twins link back to their original");
        return Err(ZoneError::Nsec3Collision {
            existing,
            conflicting: original,
        });
    }
    let mut twin = DomainNode::new(DomainStatus::Hash);
    twin.nsec3_twin = Some(original);
    twin.raw_hash = Some(hash);
    twins.insert(hashed_owner, twin)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Nsec3Params;
    use crate::zone::tests::{APEX_ONLY, DEEP_NAME, DELEGATED, name, zone_from};

    const MINIMAL: &str = "\
example. 3600 IN SOA ns1.example. admin.example. 1 10800 3600 1209600 300
example. 3600 IN NS ns1.example.
";

    fn params() -> Nsec3Params {
        Nsec3Params::default()
    }

    fn chain_owners(zone: &ZoneData) -> Vec<StoredName> {
        zone.denials().iter().map(|(owner, _)| owner.clone()).collect()
    }

    /// Follow the next pointers and check the ring covers the chain.
    fn assert_ring(zone: &ZoneData) {
        let owners: Vec<StoredName> =
            zone.denials().iter().map(|(owner, _)| owner.clone()).collect();
        for (index, owner) in owners.iter().enumerate() {
            let denial = zone.denials().get(owner).unwrap();
            let expected_next = &owners[(index + 1) % owners.len()];
            match denial.record().unwrap() {
                ZoneRecordData::Nsec(nsec) => {
                    assert_eq!(nsec.next_name(), expected_next);
                }
                ZoneRecordData::Nsec3(nsec3) => {
                    let next_twin = zone
                        .nsec3_domains()
                        .unwrap()
                        .get(expected_next)
                        .unwrap();
                    assert_eq!(
                        nsec3.next_owner().as_slice(),
                        next_twin.raw_hash.as_deref().unwrap()
                    );
                }
                other => panic!("unexpected denial record {other:?}"),
            }
        }
    }

    #[test]
    fn minimal_zone_has_a_self_pointing_nsec() {
        let mut zone = zone_from(MINIMAL);
        zone.nsecify().unwrap();

        assert_eq!(zone.domains().len(), 1);
        assert_eq!(zone.denials().len(), 1);
        let denial = zone.denials().get(&name("example.")).unwrap();
        let ZoneRecordData::Nsec(nsec) = denial.record().unwrap() else {
            panic!("expected NSEC");
        };
        assert_eq!(nsec.next_name(), &name("example."));
        for rtype in [Rtype::SOA, Rtype::NS, Rtype::NSEC, Rtype::RRSIG] {
            assert!(nsec.types().contains(rtype), "{rtype} missing from bitmap");
        }
        assert!(!nsec.types().contains(Rtype::A));
        // The denial TTL follows the SOA MINIMUM.
        assert_eq!(denial.rrset.ttl(), Ttl::from_secs(300));
    }

    #[test]
    fn nsec_chain_includes_empty_non_terminals() {
        let mut zone = zone_from(DEEP_NAME);
        zone.nsecify().unwrap();
        assert_eq!(
            chain_owners(&zone),
            vec![
                name("example."),
                name("c.example."),
                name("b.c.example."),
                name("a.b.c.example."),
            ]
        );
        assert_ring(&zone);

        let ent = zone.denials().get(&name("c.example.")).unwrap();
        let ZoneRecordData::Nsec(nsec) = ent.record().unwrap() else {
            panic!("expected NSEC");
        };
        assert!(nsec.types().contains(Rtype::NSEC));
        assert!(nsec.types().contains(Rtype::RRSIG));
        assert!(!nsec.types().contains(Rtype::A));
    }

    #[test]
    fn nsec3_twins_cover_the_tree() {
        let mut zone = zone_from(DEEP_NAME);
        zone.nsecify3(&params(), false, &Cancel::new()).unwrap();

        let twins = zone.nsec3_domains().unwrap();
        assert_eq!(twins.len(), 4);
        assert_eq!(zone.denials().len(), 4);
        assert_ring(&zone);

        // Every twin's stored hash is the SHA-1 of the original's canonical
        // wire form (no salt, no extra iterations).
        for (_, twin) in twins.iter() {
            let original = twin.nsec3_twin.as_ref().unwrap();
            let expected = digest::digest(
                &digest::SHA1_FOR_LEGACY_USE_ONLY,
                &canonical_wire(original),
            );
            assert_eq!(twin.raw_hash.as_deref().unwrap(), expected.as_ref());
            assert_eq!(twin.status, DomainStatus::Hash);
        }

        // The originals link forward to their twins.
        let apex = zone.domains().get(&name("example.")).unwrap();
        let twin_owner = apex.nsec3_twin.as_ref().unwrap();
        assert!(twins.contains(twin_owner));
        assert_eq!(apex.denial.as_ref(), Some(twin_owner));
    }

    #[test]
    fn nsec3_hash_matches_the_rfc5155_vectors() {
        // RFC 5155 Appendix A: salt aabbccdd, 12 iterations.
        let params = Nsec3Params {
            algorithm: 1,
            flags: 0,
            iterations: 12,
            salt: vec![0xaa, 0xbb, 0xcc, 0xdd],
        };
        let zone = zone_from(MINIMAL);
        let hash = nsec3_hash(&name("example."), &params);
        // Name comparison is case-insensitive, so the base32hex case of the
        // label does not matter here.
        assert_eq!(
            zone.hashed_owner_name(&hash),
            name("0p9mhaveqvm6t7vbl5lop2u3t2rp3tom.example.")
        );

        let hash = nsec3_hash(&name("a.example."), &params);
        assert_eq!(
            zone.hashed_owner_name(&hash),
            name("35mthgpgcu1qg68fab165klnsnk3dpvl.example.")
        );
    }

    #[test]
    fn opt_out_skips_unsigned_delegations_and_their_glue() {
        let mut zone = zone_from(DELEGATED);
        zone.nsecify3(&params(), false, &Cancel::new()).unwrap();
        assert_eq!(zone.denials().len(), 3);

        let mut zone = zone_from(DELEGATED);
        zone.nsecify3(&params(), true, &Cancel::new()).unwrap();
        assert_eq!(zone.denials().len(), 1);
        let (_, only) = zone.denials().first().unwrap();
        assert_eq!(only.domain, name("example."));
        let ZoneRecordData::Nsec3(nsec3) = only.record().unwrap() else {
            panic!("expected NSEC3");
        };
        assert_eq!(nsec3.flags() & NSEC3_OPT_OUT, NSEC3_OPT_OUT);
    }

    #[test]
    fn nsec3_bitmap_lists_the_original_types() {
        let mut zone = zone_from(APEX_ONLY);
        zone.nsecify3(&params(), false, &Cancel::new()).unwrap();
        let apex_twin = zone
            .domains()
            .get(&name("example."))
            .unwrap()
            .denial
            .clone()
            .unwrap();
        let denial = zone.denials().get(&apex_twin).unwrap();
        let ZoneRecordData::Nsec3(nsec3) = denial.record().unwrap() else {
            panic!("expected NSEC3");
        };
        for rtype in [
            Rtype::SOA,
            Rtype::NS,
            Rtype::A,
            Rtype::NSEC3PARAM,
            Rtype::RRSIG,
        ] {
            assert!(nsec3.types().contains(rtype), "{rtype} missing from bitmap");
        }
        // NSEC3 itself is never in its own bitmap.
        assert!(!nsec3.types().contains(Rtype::NSEC3));
    }

    #[test]
    fn rebuilding_reuses_unchanged_nodes() {
        let mut zone = zone_from(DEEP_NAME);
        zone.nsecify().unwrap();
        for (_, denial) in zone.denials.iter_mut() {
            denial.rrset.set_signatures(Vec::new());
            denial.bitmap_changed = false;
            denial.nxt_changed = false;
        }
        zone.nsecify().unwrap();
        for (owner, denial) in zone.denials().iter() {
            assert!(!denial.bitmap_changed, "bitmap changed at '{owner}'");
            assert!(!denial.nxt_changed, "next changed at '{owner}'");
            assert!(!denial.rrset.needs_signatures());
        }
    }

    #[test]
    fn twin_collisions_report_both_names() {
        let mut twins = NameTree::new();
        let hashed = name("deadbeef.example.");
        insert_twin(&mut twins, hashed.clone(), name("a.example."), vec![1]).unwrap();
        let err =
            insert_twin(&mut twins, hashed, name("b.example."), vec![1]).unwrap_err();
        let ZoneError::Nsec3Collision {
            existing,
            conflicting,
        } = err
        else {
            panic!("expected a collision");
        };
        assert_eq!(existing, name("a.example."));
        assert_eq!(conflicting, name("b.example."));
    }

    #[test]
    fn switching_modes_wipes_the_chain() {
        let mut zone = zone_from(DEEP_NAME);
        zone.nsecify().unwrap();
        assert_eq!(zone.denials().len(), 4);

        zone.nsecify3(&params(), false, &Cancel::new()).unwrap();
        assert_eq!(zone.denials().len(), 4);
        assert!(zone
            .denials()
            .iter()
            .all(|(_, denial)| denial.rrset.rtype() == Rtype::NSEC3));

        zone.nsecify().unwrap();
        assert!(zone.nsec3_domains().is_none());
        assert!(zone
            .denials()
            .iter()
            .all(|(_, denial)| denial.rrset.rtype() == Rtype::NSEC));
    }

    #[test]
    fn cancellation_stops_the_hash_walk() {
        let mut zone = zone_from(DEEP_NAME);
        let cancel = Cancel::new();
        cancel.cancel();
        let err = zone.nsecify3(&params(), false, &cancel).unwrap_err();
        assert!(matches!(err, ZoneError::Cancelled));
    }
}
