//! Errors reported by the zone data engine.

use domain::base::{Name, Rtype, Serial};
use bytes::Bytes;

//----------- ZoneError --------------------------------------------------------

/// An error from a zone data operation.
#[derive(Clone, Debug)]
pub enum ZoneError {
    /// A caller passed an unusable argument.
    ///
    /// This is a programmer error; it is never retried internally.
    Arg(&'static str),

    /// A record was presented with a class other than the zone's.
    ClassMismatch,

    /// A duplicate insertion into an ordered tree.
    DuplicateName(Name<Bytes>),

    /// Two distinct owner names hash to the same NSEC3 owner.
    Nsec3Collision {
        /// The name already linked to the hashed owner.
        existing: Name<Bytes>,
        /// The name whose hash collided with it.
        conflicting: Name<Bytes>,
    },

    /// A structural rule was violated (see `ZoneData::examine`).
    Structural {
        /// The owner name at which the violation was found.
        owner: Name<Bytes>,
        /// The offending record type.
        rtype: Rtype,
        /// What went wrong.
        violation: Violation,
    },

    /// The serial policy could not produce a usable new serial.
    SerialNotIncreasing {
        /// The serial the policy would have emitted.
        inbound: Serial,
        /// The current working serial it failed to exceed.
        current: Serial,
    },

    /// The signing context could not be created, or a sign call failed.
    Crypto(String),

    /// A backup stream was malformed; recovered state must be discarded.
    BackupCorrupt {
        /// The 1-based line at which recovery gave up.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The cooperative cancel flag was raised.
    ///
    /// The caller must roll the zone back before reusing it.
    Cancelled,
}

/// A structural rule broken by zone contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
    /// A CNAME coexists with other data at the same name.
    CnameNotAlone,
    /// More than one CNAME record at a name.
    CnameNotSingleton,
    /// More than one DNAME record at a name.
    DnameNotSingleton,
    /// A record type not permitted at a delegation point.
    ForeignDataAtCut,
    /// Data below a DNAME, or non-glue below a cut.
    OccludedData,
}

impl ZoneError {
    /// The coarse status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ZoneError::Arg(_) => ErrorCode::Arg,
            ZoneError::ClassMismatch => ErrorCode::Arg,
            ZoneError::DuplicateName(_) => ErrorCode::Conflict,
            ZoneError::Nsec3Collision { .. } => ErrorCode::Conflict,
            ZoneError::Structural { .. } => ErrorCode::Err,
            ZoneError::SerialNotIncreasing { .. } => ErrorCode::Err,
            ZoneError::Crypto(_) => ErrorCode::Err,
            ZoneError::BackupCorrupt { .. } => ErrorCode::Err,
            ZoneError::Cancelled => ErrorCode::Err,
        }
    }
}

impl std::fmt::Display for ZoneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneError::Arg(what) => write!(f, "Invalid argument: {what}"),
            ZoneError::ClassMismatch => {
                f.write_str("Record class does not match the zone class")
            }
            ZoneError::DuplicateName(name) => {
                write!(f, "Name '{name}' is already present")
            }
            ZoneError::Nsec3Collision {
                existing,
                conflicting,
            } => {
                write!(
                    f,
                    "NSEC3 hash collision between '{existing}' and '{conflicting}'"
                )
            }
            ZoneError::Structural {
                owner,
                rtype,
                violation,
            } => {
                write!(f, "{violation} ({rtype} at '{owner}')")
            }
            ZoneError::SerialNotIncreasing { inbound, current } => {
                write!(
                    f,
                    "Serial {inbound} does not increase on current serial {current}"
                )
            }
            ZoneError::Crypto(err) => write!(f, "Signing failed: {err}"),
            ZoneError::BackupCorrupt { line, reason } => {
                write!(f, "Backup corrupt at line {line}: {reason}")
            }
            ZoneError::Cancelled => f.write_str("Operation cancelled"),
        }
    }
}

impl std::error::Error for ZoneError {}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::CnameNotAlone => {
                f.write_str("CNAME and other data at the same name")
            }
            Violation::CnameNotSingleton => f.write_str("More than one CNAME"),
            Violation::DnameNotSingleton => f.write_str("More than one DNAME"),
            Violation::ForeignDataAtCut => {
                f.write_str("Foreign data at a delegation point")
            }
            Violation::OccludedData => f.write_str("Occluded data"),
        }
    }
}

//----------- ErrorCode --------------------------------------------------------

/// The coarse status an operation resolves to.
///
/// Collaborators outside the engine dispatch on this rather than on the
/// detailed [`ZoneError`] variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The operation succeeded.
    Ok,
    /// A caller error; the input must be fixed.
    Arg,
    /// A conflicting insertion; the caller decides whether to rename or abort.
    Conflict,
    /// A fatal structural, serial, crypto or backup error.
    Err,
    /// An internal invariant was breached.
    Assert,
}
