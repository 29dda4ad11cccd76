//! Signing policy as handed to the engine.
//!
//! The configuration loader lives outside this crate; the engine only
//! recognises the fields below.

use serde::{Deserialize, Serialize};

use crate::serial::SerialPolicy;

//----------- SigningPolicy ----------------------------------------------------

/// Policy for signing a zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningPolicy {
    /// The serial number generation policy.
    pub serial_policy: SerialPolicy,

    /// The offset for record signature inceptions, in seconds.
    ///
    /// When DNS records are signed, the RRSIG records will record that the
    /// signature was made this far in the past.  This can help DNSSEC
    /// validation pass in case the signer and validator disagree on the
    /// current time (by a small amount).
    pub sig_inception_offset: u32,

    /// Random extra validity added per signature, in seconds.
    ///
    /// Jitter spreads expiration times so that a zone does not need all of
    /// its signatures regenerated in the same run.
    pub sig_jitter: u32,

    /// How long ordinary record signatures are valid for, in seconds.
    pub sig_validity_default: u32,

    /// How long denial-chain signatures are valid for, in seconds.
    pub sig_validity_denial: u32,

    /// How long before expiration a new signature has to be generated,
    /// in seconds.
    pub sig_remain_time: u32,

    /// How denial-of-existence records are generated.
    pub denial: DenialPolicy,
}

impl Default for SigningPolicy {
    fn default() -> Self {
        Self {
            serial_policy: SerialPolicy::UnixTime,
            sig_inception_offset: 3600,
            sig_jitter: 43200,
            sig_validity_default: 30 * 86400,
            sig_validity_denial: 30 * 86400,
            sig_remain_time: 7 * 86400,
            denial: DenialPolicy::Nsec,
        }
    }
}

//----------- DenialPolicy -----------------------------------------------------

/// Policy for generating denial-of-existence records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialPolicy {
    /// Generate NSEC records.
    Nsec,

    /// Generate NSEC3 records.
    Nsec3 {
        /// The NSEC3 hashing parameters.
        params: Nsec3Params,

        /// Whether to enable NSEC3 Opt-Out.
        opt_out: bool,
    },
}

//----------- Nsec3Params ------------------------------------------------------

/// The NSEC3 hashing parameters of a zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nsec3Params {
    /// The hash algorithm (1 = SHA-1, the only one defined).
    pub algorithm: u8,

    /// The flags field; bit 0 is Opt-Out.
    pub flags: u8,

    /// Extra hash iterations.
    pub iterations: u16,

    /// The salt appended to each hash round.
    pub salt: Vec<u8>,
}

impl Default for Nsec3Params {
    fn default() -> Self {
        Self {
            algorithm: 1,
            flags: 0,
            iterations: 0,
            salt: Vec::new(),
        }
    }
}
