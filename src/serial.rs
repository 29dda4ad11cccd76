//! SOA serial maintenance.
//!
//! Serial comparison is RFC 1982 sequence space arithmetic throughout;
//! naive unsigned comparison would misbehave across wraparound.  The
//! `Serial` type's `PartialOrd` implements exactly that, so "not greater"
//! below also covers the ambiguous case, which then falls back to a plain
//! increment.

use domain::base::Serial;
use jiff::tz::TimeZone;
use jiff::{Timestamp, Zoned};
use serde::{Deserialize, Serialize};

use crate::error::ZoneError;

/// The largest step a serial may take in one update.
const MAX_SERIAL_DELTA: u32 = 0x7FFF_FFFF;

//----------- SerialPolicy -----------------------------------------------------

/// Policy for generating serial numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialPolicy {
    /// Use the serial number of the inbound zone.
    ///
    /// The zone cannot be re-signed without a change in the inbound serial.
    Keep,

    /// Increment the serial number on every change.
    Counter,

    /// Use the current Unix time, in seconds.
    UnixTime,

    /// Set the serial number to `<YYYY><MM><DD><xx>`.
    ///
    /// The serial number, when formatted in decimal, contains the calendar
    /// date (in the UTC timezone).  The `<xx>` component is a simple
    /// counter; at most 100 versions of the zone can be used per day.
    DateCounter,
}

impl std::fmt::Display for SerialPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerialPolicy::Keep => f.write_str("keep"),
            SerialPolicy::Counter => f.write_str("counter"),
            SerialPolicy::UnixTime => f.write_str("unixtime"),
            SerialPolicy::DateCounter => f.write_str("datecounter"),
        }
    }
}

/// Compute the next working serial under a policy.
///
/// `inbound` is the last serial observed from input, `prev` the current
/// working serial (if the zone was initialized before), `now` the current
/// Unix time and `date` the current UTC date as `YYYYMMDD`.
pub fn next_serial(
    policy: SerialPolicy,
    inbound: Option<Serial>,
    prev: Option<Serial>,
    now: Serial,
    date: u32,
) -> Result<Serial, ZoneError> {
    let candidate = match policy {
        SerialPolicy::Keep => {
            let inbound = inbound.ok_or(ZoneError::Arg("no inbound serial to keep"))?;
            if let Some(prev) = prev
                && !(inbound > prev)
            {
                return Err(ZoneError::SerialNotIncreasing {
                    inbound,
                    current: prev,
                });
            }
            inbound
        }
        SerialPolicy::Counter => {
            let inbound = inbound.unwrap_or_else(|| Serial::from(0));
            match prev {
                None => return Ok(inbound.add(1)),
                Some(prev) => {
                    if inbound > prev {
                        inbound
                    } else {
                        prev.add(1)
                    }
                }
            }
        }
        SerialPolicy::UnixTime => {
            let mut serial = now;
            if let Some(inbound) = inbound
                && inbound > serial
            {
                serial = inbound;
            }
            if let Some(prev) = prev
                && !(serial > prev)
            {
                serial = prev.add(1);
            }
            serial
        }
        SerialPolicy::DateCounter => {
            let mut serial = Serial::from(date.wrapping_mul(100));
            if let Some(prev) = prev
                && !(serial > prev)
            {
                serial = prev.add(1);
            }
            serial
        }
    };

    Ok(match prev {
        Some(prev) => clamp_step(prev, candidate),
        None => candidate,
    })
}

/// Compute the next working serial using the wall clock.
pub fn next_serial_now(
    policy: SerialPolicy,
    inbound: Option<Serial>,
    prev: Option<Serial>,
) -> Result<Serial, ZoneError> {
    next_serial(policy, inbound, prev, Serial::now(), utc_date())
}

/// The current UTC date as `YYYYMMDD`.
fn utc_date() -> u32 {
    let zoned = Zoned::new(Timestamp::now(), TimeZone::UTC);
    (zoned.year() as u32 * 100 + zoned.month() as u32) * 100 + zoned.day() as u32
}

/// Clamp the update delta to `2^31 - 1`.
///
/// The new value is `(prev + delta) mod 2^32`.
fn clamp_step(prev: Serial, next: Serial) -> Serial {
    let delta = next.into_int().wrapping_sub(prev.into_int());
    Serial::from(prev.into_int().wrapping_add(delta.min(MAX_SERIAL_DELTA)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(value: u32) -> Serial {
        Serial::from(value)
    }

    const NOW: u32 = 1_700_000_000;
    const DATE: u32 = 2023_11_14;

    fn next(
        policy: SerialPolicy,
        inbound: Option<u32>,
        prev: Option<u32>,
    ) -> Result<Serial, ZoneError> {
        next_serial(
            policy,
            inbound.map(serial),
            prev.map(serial),
            serial(NOW),
            DATE,
        )
    }

    #[test]
    fn unixtime_tracks_the_clock() {
        assert_eq!(next(SerialPolicy::UnixTime, Some(5), None).unwrap(), serial(NOW));
        // Inbound ahead of the clock wins.
        assert_eq!(
            next(SerialPolicy::UnixTime, Some(NOW + 50), Some(7)).unwrap(),
            serial(NOW + 50)
        );
        // A previous serial at or past the clock forces a bump.
        assert_eq!(
            next(SerialPolicy::UnixTime, None, Some(NOW + 100)).unwrap(),
            serial(NOW + 101)
        );
    }

    #[test]
    fn counter_increments_past_the_previous() {
        assert_eq!(next(SerialPolicy::Counter, Some(5), None).unwrap(), serial(6));
        assert_eq!(next(SerialPolicy::Counter, Some(5), Some(7)).unwrap(), serial(8));
        assert_eq!(next(SerialPolicy::Counter, Some(9), Some(7)).unwrap(), serial(9));
    }

    #[test]
    fn datecounter_encodes_the_date() {
        assert_eq!(
            next(SerialPolicy::DateCounter, None, None).unwrap(),
            serial(DATE * 100)
        );
        assert_eq!(
            next(SerialPolicy::DateCounter, None, Some(DATE * 100 + 3)).unwrap(),
            serial(DATE * 100 + 4)
        );
    }

    #[test]
    fn keep_requires_an_increase() {
        assert_eq!(next(SerialPolicy::Keep, Some(5), None).unwrap(), serial(5));
        assert_eq!(next(SerialPolicy::Keep, Some(9), Some(7)).unwrap(), serial(9));
        assert!(matches!(
            next(SerialPolicy::Keep, Some(5), Some(7)).unwrap_err(),
            ZoneError::SerialNotIncreasing { .. }
        ));
        assert!(matches!(
            next(SerialPolicy::Keep, Some(7), Some(7)).unwrap_err(),
            ZoneError::SerialNotIncreasing { .. }
        ));
    }

    #[test]
    fn comparison_is_serial_arithmetic() {
        // Across the wrap, 10 is greater than 0xFFFF_FF00.
        assert_eq!(
            next(SerialPolicy::Keep, Some(10), Some(0xFFFF_FF00)).unwrap(),
            serial(10)
        );
    }

    #[test]
    fn steps_are_clamped() {
        // A serial may move at most 2^31 - 1 past the previous value.
        assert_eq!(
            clamp_step(serial(10), serial(0x8000_000A)),
            serial(0x8000_0009)
        );
        assert_eq!(clamp_step(serial(10), serial(11)), serial(11));
    }
}
