//! The signing driver.
//!
//! Signing is the only phase allowed to block: the key store may sit in
//! front of an HSM.  The engine assembles the canonical RRset signing
//! input (RFC 4034 §3.1.8.1), asks the store's context for a raw signature
//! per active key, and attaches the resulting RRSIGs to the covered RRset.
//! The context is owned exclusively by the driver and released on every
//! exit path when it is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use domain::base::iana::SecurityAlgorithm;
use domain::base::rdata::ComposeRecordData;
use domain::base::iana::Class;
use domain::base::{Rtype, ToName};
use domain::rdata::Rrsig;
use domain::rdata::dnssec::Timestamp;
use octseq::builder::infallible;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};

use crate::error::ZoneError;
use crate::name::{StoredName, canonical_wire};
use crate::nodes::DomainStatus;
use crate::policy::SigningPolicy;
use crate::records::{Rrset, SigRecord};
use crate::zone::ZoneData;

//----------- Cancel -----------------------------------------------------------

/// A cooperative cancellation flag.
///
/// The flag is checked between domains while signing and between candidates
/// while hashing for NSEC3.  After a cancellation the zone must be rolled
/// back before it is reused.
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    /// Construct an unraised flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the flag was raised.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Bail out if the flag was raised.
    pub fn check(&self) -> Result<(), ZoneError> {
        if self.is_cancelled() {
            Err(ZoneError::Cancelled)
        } else {
            Ok(())
        }
    }
}

//----------- SigningKey -------------------------------------------------------

/// An active signing key as reported by the key store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningKey {
    /// The store's identifier for the key.
    pub locator: String,

    /// The DNSKEY flags.
    pub flags: u16,

    /// The signature algorithm.
    pub algorithm: SecurityAlgorithm,

    /// The key tag of the corresponding DNSKEY.
    pub key_tag: u16,
}

impl SigningKey {
    /// Whether the key is a key-signing key (the SEP bit is set).
    pub fn is_ksk(&self) -> bool {
        self.flags & 0x0001 != 0
    }
}

//----------- KeyStore ---------------------------------------------------------

/// A store of signing keys, possibly backed by an HSM.
pub trait KeyStore {
    /// The per-run signing context.
    type Context: SigningContext;

    /// Open a signing context.
    ///
    /// The context is exclusively owned by the signing driver and released
    /// when dropped, on success and failure alike.
    fn create_context(&self) -> Result<Self::Context, ZoneError>;

    /// The keys currently available for signing.
    fn active_keys(&self) -> &[SigningKey];
}

/// One signing session against a key store.
pub trait SigningContext {
    /// Sign canonical RRset bytes with the identified key.
    fn sign(&mut self, data: &[u8], key: &SigningKey) -> Result<Vec<u8>, ZoneError>;
}

//----------- SignStats --------------------------------------------------------

/// What a signing run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignStats {
    /// RRSIGs newly generated.
    pub created: usize,

    /// RRsets whose existing signatures were kept.
    pub reused: usize,
}

//----------- the driver -------------------------------------------------------

impl ZoneData {
    /// Sign the committed zone.
    ///
    /// RRsets whose signatures were invalidated (see [`ZoneData::diff`]) or
    /// are entering the refresh window are re-signed; everything else keeps
    /// its signatures.  The working serial is refreshed first if it does
    /// not exceed the last emitted one.
    pub fn sign<S: KeyStore>(
        &mut self,
        store: &S,
        policy: &SigningPolicy,
        cancel: &Cancel,
    ) -> Result<SignStats, ZoneError> {
        if !self.serial_is_fresh() {
            self.update_serial(policy.serial_policy)?;
        }

        let keys = store.active_keys().to_vec();
        if keys.is_empty() {
            return Err(ZoneError::Crypto("no active signing keys".into()));
        }
        self.diff(&keys);

        let mut context = store.create_context()?;
        let rng = SystemRandom::new();
        let now = Timestamp::now().into_int();
        let inception = Timestamp::from(now.wrapping_sub(policy.sig_inception_offset));
        let apex = self.apex().clone();
        let class = self.class();
        let mut stats = SignStats::default();

        let names = self.domains.names();
        for name in &names {
            cancel.check()?;
            let node = self
                .domains
                .get_mut(name)
                .expect("snapshotted domains are present");
            let status = node.status;
            for rrset in node.rrsets_sorted_mut() {
                if !signable(status, rrset.rtype()) || rrset.records().is_empty() {
                    continue;
                }
                sign_rrset(
                    &mut context,
                    &rng,
                    &keys,
                    name,
                    &apex,
                    class,
                    rrset,
                    inception,
                    now,
                    policy.sig_validity_default,
                    policy.sig_jitter,
                    policy.sig_remain_time,
                    &mut stats,
                )?;
            }
        }

        let denial_owners = self.denials.names();
        for owner in &denial_owners {
            cancel.check()?;
            let denial = self
                .denials
                .get_mut(owner)
                .expect("snapshotted denials are present");
            sign_rrset(
                &mut context,
                &rng,
                &keys,
                owner,
                &apex,
                class,
                &mut denial.rrset,
                inception,
                now,
                policy.sig_validity_denial,
                policy.sig_jitter,
                policy.sig_remain_time,
                &mut stats,
            )?;
        }

        info!(
            "Signed zone '{apex}': {} new RRSIGs, {} RRsets reused",
            stats.created, stats.reused
        );
        Ok(stats)
    }
}

/// Whether an RRset at a domain of this status receives signatures.
///
/// At a delegation only the DS RRset is signed; NS and glue belong to the
/// child.  Signatures are never signed themselves.
fn signable(status: DomainStatus, rtype: Rtype) -> bool {
    if rtype == Rtype::RRSIG {
        return false;
    }
    match status {
        DomainStatus::Apex | DomainStatus::Auth => true,
        DomainStatus::Cut { .. } => rtype == Rtype::DS,
        _ => false,
    }
}

/// Ensure one RRset carries current signatures.
#[allow(clippy::too_many_arguments)]
fn sign_rrset<C: SigningContext>(
    context: &mut C,
    rng: &SystemRandom,
    keys: &[SigningKey],
    owner: &StoredName,
    apex: &StoredName,
    class: Class,
    rrset: &mut Rrset,
    inception: Timestamp,
    now: u32,
    validity: u32,
    max_jitter: u32,
    remain: u32,
    stats: &mut SignStats,
) -> Result<(), ZoneError> {
    let signers = keys_for(keys, rrset.rtype());
    if signatures_current(rrset, &signers, now, remain) {
        stats.reused += 1;
        return Ok(());
    }

    let mut signatures = Vec::with_capacity(signers.len());
    for key in signers {
        let expiration =
            Timestamp::from(now.wrapping_add(validity).wrapping_add(jitter(rng, max_jitter)?));
        let template = Rrsig::new(
            rrset.rtype(),
            key.algorithm,
            owner.rrsig_label_count(),
            rrset.ttl(),
            expiration,
            inception,
            key.key_tag,
            apex.clone(),
            Bytes::new(),
        )
        .map_err(|_| ZoneError::Crypto("RRSIG record data too long".into()))?;

        let input = signing_input(owner, class, rrset, &template);
        let raw = context.sign(&input, key)?;
        let rrsig = Rrsig::new(
            rrset.rtype(),
            key.algorithm,
            owner.rrsig_label_count(),
            rrset.ttl(),
            expiration,
            inception,
            key.key_tag,
            apex.clone(),
            Bytes::from(raw),
        )
        .map_err(|_| ZoneError::Crypto("signature too long".into()))?;
        signatures.push(rrsig);
        stats.created += 1;
    }
    debug!(
        "Signed {} at '{owner}' with {} keys",
        rrset.rtype(),
        signatures.len()
    );
    rrset.set_signatures(signatures);
    Ok(())
}

/// Whether the existing signatures can be kept.
fn signatures_current(
    rrset: &Rrset,
    signers: &[&SigningKey],
    now: u32,
    remain: u32,
) -> bool {
    if rrset.needs_signatures() || rrset.signatures().is_empty() {
        return false;
    }
    let horizon = Timestamp::from(now.wrapping_add(remain));
    let fresh = rrset
        .signatures()
        .iter()
        .all(|sig| sig.expiration() > horizon);
    let mut have: Vec<u16> = rrset.signatures().iter().map(SigRecord::key_tag).collect();
    let mut wanted: Vec<u16> = signers.iter().map(|key| key.key_tag).collect();
    have.sort_unstable();
    have.dedup();
    wanted.sort_unstable();
    wanted.dedup();
    fresh && have == wanted
}

/// The keys that sign an RRset of this type.
///
/// KSKs cover the DNSKEY RRset, ZSKs everything else; a lone CSK covers
/// both roles.
fn keys_for(keys: &[SigningKey], rtype: Rtype) -> Vec<&SigningKey> {
    let ksks: Vec<&SigningKey> = keys.iter().filter(|key| key.is_ksk()).collect();
    let zsks: Vec<&SigningKey> = keys.iter().filter(|key| !key.is_ksk()).collect();
    if rtype == Rtype::DNSKEY {
        if ksks.is_empty() { zsks } else { ksks }
    } else if zsks.is_empty() {
        ksks
    } else {
        zsks
    }
}

/// Random extra validity for one signature.
fn jitter(rng: &SystemRandom, max_jitter: u32) -> Result<u32, ZoneError> {
    if max_jitter == 0 {
        return Ok(0);
    }
    let mut raw = [0u8; 4];
    rng.fill(&mut raw)
        .map_err(|_| ZoneError::Crypto("randomness unavailable".into()))?;
    Ok(u32::from_be_bytes(raw) % (max_jitter + 1))
}

/// The canonical signing input for one RRset (RFC 4034 §3.1.8.1).
///
/// The RRSIG RDATA (with an empty signature field) followed by every
/// record in canonical form and order.
fn signing_input(
    owner: &StoredName,
    class: Class,
    rrset: &Rrset,
    template: &SigRecord,
) -> Vec<u8> {
    let mut input = Vec::new();
    infallible(template.compose_canonical_rdata(&mut input));

    let owner_wire = canonical_wire(owner);
    for data in rrset.records() {
        input.extend_from_slice(&owner_wire);
        input.extend_from_slice(&rrset.rtype().to_int().to_be_bytes());
        input.extend_from_slice(&class.to_int().to_be_bytes());
        input.extend_from_slice(&rrset.ttl().as_secs().to_be_bytes());
        let mut rdata = Vec::new();
        infallible(data.compose_canonical_rdata(&mut rdata));
        input.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        input.extend_from_slice(&rdata);
    }
    input
}
