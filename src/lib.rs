//! The zone data engine of a friendly DNSSEC signer.
//!
//! This crate owns the in-memory representation of a zone while it moves
//! through the signing pipeline.  It provides the following functionality:
//!
//! - An ordered store of the authoritative names of a zone.
//! - Staging of record additions and deletions with commit and rollback.
//! - Closure of the name tree under empty non-terminals.
//! - Structural validation of zone contents (CNAME, DNAME, zone cuts).
//! - Construction of the NSEC or NSEC3 denial-of-existence chain,
//!   including NSEC3 Opt-Out.
//! - SOA serial maintenance under the configured serial policy.
//! - A signing driver that produces RRSIGs through an external key store.
//! - A line-oriented backup format to avoid rebuilding state on restart.
//!
//! The engine is strictly single-threaded per zone.  Several zones may be
//! processed in parallel, but a [`ZoneData`] value is never shared.

pub use crate::error::{ErrorCode, ZoneError};
pub use crate::nodes::{DenialNode, DomainNode, DomainStatus, EntKind};
pub use crate::policy::{DenialPolicy, Nsec3Params, SigningPolicy};
pub use crate::records::{Rrset, SigRecord, StoredRecord, StoredRecordData};
pub use crate::serial::SerialPolicy;
pub use crate::sign::{Cancel, KeyStore, SignStats, SigningContext, SigningKey};
pub use crate::zone::{AdapterMode, ZoneData};

pub mod backup;
pub mod denial;
pub mod error;
pub mod name;
pub mod nodes;
pub mod policy;
pub mod records;
pub mod serial;
pub mod sign;
pub mod tree;
pub mod zone;
