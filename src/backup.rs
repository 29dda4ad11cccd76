//! The line-oriented backup format.
//!
//! Restarting the signer must not force a full denial-chain rebuild, so the
//! domain skeleton and the denial records are persisted to a tagged ASCII
//! stream: `;DNAME` introduces a domain, `;DNAME3` its hashed twin, `;NSEC`
//! and `;NSEC3` the denial records, all in canonical traversal order and
//! bracketed by a magic first and last line.  Anything outside that grammar
//! marks the backup corrupted, in which case the caller starts over from
//! the source zone instead of trusting partial state.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;

use domain::base::name::FlattenInto;
use domain::base::iana::Class;
use domain::base::{Name, Rtype, Ttl};
use domain::zonefile::inplace::{Entry, Zonefile};
use tracing::{debug, warn};

use crate::error::ZoneError;
use crate::name::{StoredName, dotted};
use crate::nodes::{DenialNode, DomainNode, DomainStatus};
use crate::records::StoredRecord;
use crate::tree::NameTree;
use crate::zone::ZoneData;

/// The first and last line of a backup stream.
const MAGIC: &str = ";;zoneforge backup v1";

impl ZoneData {
    /// Write the domain skeleton and denial chain as a backup stream.
    pub fn backup_write(&self, target: &mut impl Write) -> io::Result<()> {
        writeln!(target, "{MAGIC}")?;
        for (name, node) in self.domains.iter() {
            writeln!(target, ";DNAME {} {}", dotted(name), node.status)?;
            if let Some(twin) = &node.nsec3_twin {
                writeln!(target, ";DNAME3 {}", dotted(twin))?;
            }
            if let Some(owner) = &node.denial
                && let Some(denial) = self.denials.get(owner)
                && let Some(data) = denial.record()
            {
                let tag = match denial.rrset.rtype() {
                    Rtype::NSEC3 => ";NSEC3",
                    _ => ";NSEC",
                };
                writeln!(
                    target,
                    "{tag} {} {} {} {} {data}",
                    dotted(owner),
                    denial.rrset.ttl().as_secs(),
                    self.class(),
                    denial.rrset.rtype(),
                )?;
            }
        }
        writeln!(target, "{MAGIC}")?;
        Ok(())
    }

    /// Write a backup file, replacing any previous one atomically.
    pub fn backup_to_path(&self, path: &Path) -> io::Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut file = match dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };
        self.backup_write(&mut file)?;
        file.persist(path).map_err(|err| err.error)?;
        debug!("Wrote backup to '{}'", path.display());
        Ok(())
    }

    /// Rebuild a zone skeleton from a backup stream.
    ///
    /// Domains are re-linked to their parents by name; the subdomain
    /// counters are recomputed.  RRsets other than the denial records are
    /// not part of a backup and must be re-added from the source zone.
    pub fn recover(
        apex: StoredName,
        class: Class,
        default_ttl: Ttl,
        source: impl BufRead,
    ) -> Result<Self, ZoneError> {
        let mut zone = ZoneData::new(apex, class, default_ttl);
        let mut lines = source.lines().enumerate();

        let (_, first) = lines
            .next()
            .ok_or_else(|| corrupt(1, "empty stream"))?;
        let first = first.map_err(|err| corrupt(1, &err.to_string()))?;
        if first.trim_end() != MAGIC {
            return Err(corrupt(1, "missing magic header"));
        }

        let mut last_domain: Option<StoredName> = None;
        let mut last_twin: Option<StoredName> = None;
        let mut terminated = false;
        for (index, line) in lines {
            let number = index + 1;
            let line = line.map_err(|err| corrupt(number, &err.to_string()))?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line == MAGIC {
                terminated = true;
                continue;
            }
            if terminated {
                return Err(corrupt(number, "content after the trailing magic"));
            }

            let (token, rest) = line
                .split_once(' ')
                .ok_or_else(|| corrupt(number, "bare token"))?;
            match token {
                ";DNAME" => {
                    let (name, status) = rest
                        .split_once(' ')
                        .ok_or_else(|| corrupt(number, "domain without status"))?;
                    let name: StoredName = Name::from_str(name)
                        .map_err(|_| corrupt(number, "unparseable domain name"))?;
                    let status = DomainStatus::from_str(status)
                        .map_err(|_| corrupt(number, "unknown domain status"))?;
                    if let Some(previous) = &last_domain
                        && name <= *previous
                    {
                        return Err(corrupt(number, "domain out of canonical order"));
                    }
                    zone.domains
                        .insert(name.clone(), DomainNode::new(status))
                        .map_err(|_| corrupt(number, "duplicate domain"))?;
                    last_domain = Some(name);
                    last_twin = None;
                }
                ";DNAME3" => {
                    let original = last_domain
                        .clone()
                        .ok_or_else(|| corrupt(number, "twin without a domain"))?;
                    let hashed: StoredName = Name::from_str(rest)
                        .map_err(|_| corrupt(number, "unparseable twin name"))?;
                    let mut twin = DomainNode::new(DomainStatus::Hash);
                    twin.nsec3_twin = Some(original.clone());
                    let twins = zone.nsec3_domains.get_or_insert_with(NameTree::new);
                    twins
                        .insert(hashed.clone(), twin)
                        .map_err(|_| corrupt(number, "duplicate twin"))?;
                    let node = zone
                        .domains
                        .get_mut(&original)
                        .expect("the introducing domain was inserted");
                    node.nsec3_twin = Some(hashed.clone());
                    last_twin = Some(hashed);
                }
                ";NSEC" => {
                    let record = parse_rr(rest, number)?;
                    let domain = last_domain
                        .clone()
                        .ok_or_else(|| corrupt(number, "denial without a domain"))?;
                    if record.rtype() != Rtype::NSEC || *record.owner() != domain {
                        return Err(corrupt(number, "NSEC does not match its domain"));
                    }
                    attach_denial(&mut zone, domain.clone(), domain, record, number)?;
                }
                ";NSEC3" => {
                    let record = parse_rr(rest, number)?;
                    let domain = last_domain
                        .clone()
                        .ok_or_else(|| corrupt(number, "denial without a domain"))?;
                    let twin = last_twin
                        .clone()
                        .ok_or_else(|| corrupt(number, "NSEC3 without a twin"))?;
                    if record.rtype() != Rtype::NSEC3 || *record.owner() != twin {
                        return Err(corrupt(number, "NSEC3 does not match its twin"));
                    }
                    attach_denial(&mut zone, twin, domain, record, number)?;
                }
                _ => return Err(corrupt(number, "unknown token")),
            }
        }
        if !terminated {
            return Err(corrupt(0, "missing trailing magic"));
        }

        zone.recount();
        debug!(
            "Recovered {} domains and {} denial records from backup",
            zone.domains.len(),
            zone.denials.len()
        );
        Ok(zone)
    }

    /// Rebuild a zone skeleton from a backup file.
    pub fn recover_from_path(
        apex: StoredName,
        class: Class,
        default_ttl: Ttl,
        path: &Path,
    ) -> Result<Self, ZoneError> {
        let file = std::fs::File::open(path).map_err(|err| {
            warn!("Cannot open backup '{}': {err}", path.display());
            corrupt(0, &err.to_string())
        })?;
        Self::recover(apex, class, default_ttl, BufReader::new(file))
    }
}

/// A corruption error for one line.
fn corrupt(line: usize, reason: &str) -> ZoneError {
    ZoneError::BackupCorrupt {
        line,
        reason: reason.to_string(),
    }
}

/// Parse a single presentation-format record.
///
/// Names inside record data may have been written without a trailing dot;
/// a root origin makes them absolute again.
fn parse_rr(text: &str, number: usize) -> Result<StoredRecord, ZoneError> {
    let mut zonefile = Zonefile::new();
    zonefile.extend_from_slice(text.as_bytes());
    zonefile.extend_from_slice(b"\n");
    zonefile.set_origin(Name::root_bytes());
    match zonefile.next_entry() {
        Ok(Some(Entry::Record(record))) => Ok(record.flatten_into()),
        _ => Err(corrupt(number, "unparseable record")),
    }
}

/// Attach a recovered denial record to its domain.
fn attach_denial(
    zone: &mut ZoneData,
    owner: StoredName,
    domain: StoredName,
    record: StoredRecord,
    number: usize,
) -> Result<(), ZoneError> {
    let ttl = record.ttl();
    let rtype = record.rtype();
    let data = record.into_data();
    let mut denial = DenialNode::new(rtype, ttl, data, domain.clone());
    denial.bitmap_changed = false;
    denial.nxt_changed = false;
    zone.denials
        .insert(owner.clone(), denial)
        .map_err(|_| corrupt(number, "duplicate denial owner"))?;
    zone.domains
        .get_mut(&domain)
        .expect("the introducing domain was inserted")
        .denial = Some(owner);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Nsec3Params;
    use crate::sign::Cancel;
    use crate::zone::tests::{DEEP_NAME, DELEGATED, name};

    fn nsec_zone() -> ZoneData {
        let mut zone = crate::zone::tests::zone_from(DEEP_NAME);
        zone.nsecify().unwrap();
        zone
    }

    fn backup_string(zone: &ZoneData) -> String {
        let mut raw = Vec::new();
        zone.backup_write(&mut raw).unwrap();
        String::from_utf8(raw).unwrap()
    }

    fn recover_str(text: &str) -> Result<ZoneData, ZoneError> {
        ZoneData::recover(
            name("example."),
            Class::IN,
            Ttl::from_secs(3600),
            text.as_bytes(),
        )
    }

    #[test]
    fn nsec_backup_round_trips() {
        let zone = nsec_zone();
        let text = backup_string(&zone);
        assert!(text.starts_with(MAGIC));
        assert!(text.trim_end().ends_with(MAGIC));

        let recovered = recover_str(&text).unwrap();
        assert_eq!(recovered.domains().len(), zone.domains().len());
        for (name, node) in zone.domains().iter() {
            let twin = recovered.domains().get(name).unwrap();
            assert_eq!(twin.status, node.status);
            assert_eq!(twin.subdomain_count, node.subdomain_count);
            assert_eq!(twin.subdomain_auth, node.subdomain_auth);
        }
        assert_eq!(recovered.denials().len(), zone.denials().len());
        for (owner, denial) in zone.denials().iter() {
            let twin = recovered.denials().get(owner).unwrap();
            assert_eq!(twin.record(), denial.record());
            assert_eq!(twin.domain, denial.domain);
        }
    }

    #[test]
    fn nsec3_backup_round_trips() {
        let mut zone = crate::zone::tests::zone_from(DELEGATED);
        zone.nsecify3(&Nsec3Params::default(), false, &Cancel::new())
            .unwrap();
        let text = backup_string(&zone);

        let recovered = recover_str(&text).unwrap();
        assert_eq!(
            recovered.nsec3_domains().unwrap().len(),
            zone.nsec3_domains().unwrap().len()
        );
        assert_eq!(recovered.denials().len(), zone.denials().len());
        for (owner, denial) in zone.denials().iter() {
            let twin = recovered.denials().get(owner).unwrap();
            assert_eq!(twin.record(), denial.record());
        }
        // Twin linkage survives in both directions.
        for (hashed, twin) in recovered.nsec3_domains().unwrap().iter() {
            let original = twin.nsec3_twin.as_ref().unwrap();
            let node = recovered.domains().get(original).unwrap();
            assert_eq!(node.nsec3_twin.as_ref(), Some(hashed));
        }
    }

    #[test]
    fn unknown_tokens_corrupt_the_backup() {
        let text = format!("{MAGIC}\n;BOGUS example.\n{MAGIC}\n");
        let err = recover_str(&text).unwrap_err();
        assert!(matches!(err, ZoneError::BackupCorrupt { line: 2, .. }));
    }

    #[test]
    fn out_of_order_domains_corrupt_the_backup() {
        let text = format!(
            "{MAGIC}\n;DNAME b.example. auth\n;DNAME a.example. auth\n{MAGIC}\n"
        );
        let err = recover_str(&text).unwrap_err();
        assert!(matches!(err, ZoneError::BackupCorrupt { line: 3, .. }));
    }

    #[test]
    fn truncated_backups_are_rejected() {
        let zone = nsec_zone();
        let text = backup_string(&zone);
        let truncated = text.trim_end().trim_end_matches(MAGIC);
        let err = recover_str(truncated).unwrap_err();
        assert!(matches!(err, ZoneError::BackupCorrupt { .. }));
    }

    #[test]
    fn a_twin_needs_an_introducing_domain() {
        let text = format!("{MAGIC}\n;DNAME3 abcdef.example.\n{MAGIC}\n");
        let err = recover_str(&text).unwrap_err();
        assert!(matches!(err, ZoneError::BackupCorrupt { line: 2, .. }));
    }

    #[test]
    fn backup_files_are_replaced_atomically() {
        let zone = nsec_zone();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zone.backup");
        zone.backup_to_path(&path).unwrap();
        zone.backup_to_path(&path).unwrap();

        let recovered = ZoneData::recover_from_path(
            name("example."),
            Class::IN,
            Ttl::from_secs(3600),
            &path,
        )
        .unwrap();
        assert_eq!(recovered.domains().len(), zone.domains().len());
    }
}
