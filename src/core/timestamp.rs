//! Layer 0: the time axis.
//!
//! Every packet carries exactly one `Timestamp`; per stream, timestamps are
//! observed in strictly increasing order. The sentinel values bracket the
//! real range so that stream bounds can express "nothing yet" and "nothing
//! ever again" without a side channel.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A point on the shared time axis.
///
/// The real range is `MIN..=MAX`. Four sentinels surround it:
/// `UNSTARTED` (before everything), `PRE_STREAM` (before the first real
/// value), `POST_STREAM` (after the last real value) and `DONE` (after
/// everything, including `POST_STREAM`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Before any conceivable data. Initial stream bound.
    pub const UNSTARTED: Timestamp = Timestamp(i64::MIN);
    /// The single slot before the real range, for header-like packets.
    pub const PRE_STREAM: Timestamp = Timestamp(i64::MIN + 1);
    /// Smallest real timestamp.
    pub const MIN: Timestamp = Timestamp(i64::MIN + 2);
    /// Largest real timestamp.
    pub const MAX: Timestamp = Timestamp(i64::MAX - 2);
    /// The single slot after the real range, for trailer-like packets.
    pub const POST_STREAM: Timestamp = Timestamp(i64::MAX - 1);
    /// After everything. A stream bound of `DONE` means the stream is closed.
    pub const DONE: Timestamp = Timestamp(i64::MAX);

    /// Build a timestamp from a real value.
    ///
    /// Panics if `value` falls outside `MIN..=MAX`; constructing a sentinel
    /// through `new` is a programming error, use the constants.
    pub fn new(value: i64) -> Timestamp {
        assert!(
            value >= Self::MIN.0 && value <= Self::MAX.0,
            "timestamp value {value} outside the real range"
        );
        Timestamp(value)
    }

    /// Checked variant of [`Timestamp::new`].
    pub fn checked(value: i64) -> Option<Timestamp> {
        if value >= Self::MIN.0 && value <= Self::MAX.0 {
            Some(Timestamp(value))
        } else {
            None
        }
    }

    /// Raw value, sentinels included.
    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_special(self) -> bool {
        !self.is_range_value()
    }

    /// True for values in `MIN..=MAX`.
    pub fn is_range_value(self) -> bool {
        self >= Self::MIN && self <= Self::MAX
    }

    /// True for timestamps a packet may legally carry on a stream:
    /// the real range plus `PRE_STREAM` and `POST_STREAM`.
    pub fn is_allowed_in_stream(self) -> bool {
        self.is_range_value() || self == Self::PRE_STREAM || self == Self::POST_STREAM
    }

    /// The earliest timestamp a stream may still carry after a packet at
    /// `self` was published.
    ///
    /// `PRE_STREAM` is followed by the real range; a packet at `MAX` or
    /// `POST_STREAM` is necessarily the last one, so the successor is `DONE`.
    pub fn next_allowed_in_stream(self) -> Timestamp {
        debug_assert!(self.is_allowed_in_stream());
        if self == Self::PRE_STREAM {
            Self::MIN
        } else if self >= Self::MAX {
            Self::DONE
        } else {
            Timestamp(self.0 + 1)
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSTARTED => f.write_str("Timestamp::Unstarted"),
            Self::PRE_STREAM => f.write_str("Timestamp::PreStream"),
            Self::POST_STREAM => f.write_str("Timestamp::PostStream"),
            Self::DONE => f.write_str("Timestamp::Done"),
            Timestamp(value) => write!(f, "{value}"),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_bracket_the_real_range() {
        assert!(Timestamp::UNSTARTED < Timestamp::PRE_STREAM);
        assert!(Timestamp::PRE_STREAM < Timestamp::MIN);
        assert!(Timestamp::MIN < Timestamp::MAX);
        assert!(Timestamp::MAX < Timestamp::POST_STREAM);
        assert!(Timestamp::POST_STREAM < Timestamp::DONE);
        assert!(Timestamp::new(0) > Timestamp::PRE_STREAM);
        assert!(Timestamp::new(0) < Timestamp::POST_STREAM);
    }

    #[test]
    fn range_classification() {
        assert!(Timestamp::new(42).is_range_value());
        assert!(!Timestamp::PRE_STREAM.is_range_value());
        assert!(Timestamp::PRE_STREAM.is_allowed_in_stream());
        assert!(Timestamp::POST_STREAM.is_allowed_in_stream());
        assert!(!Timestamp::UNSTARTED.is_allowed_in_stream());
        assert!(!Timestamp::DONE.is_allowed_in_stream());
    }

    #[test]
    fn checked_rejects_sentinel_values() {
        assert!(Timestamp::checked(0).is_some());
        assert!(Timestamp::checked(i64::MAX).is_none());
        assert!(Timestamp::checked(i64::MIN).is_none());
    }

    #[test]
    fn successor_in_stream() {
        assert_eq!(
            Timestamp::new(7).next_allowed_in_stream(),
            Timestamp::new(8)
        );
        assert_eq!(
            Timestamp::PRE_STREAM.next_allowed_in_stream(),
            Timestamp::MIN
        );
        assert_eq!(Timestamp::MAX.next_allowed_in_stream(), Timestamp::DONE);
        assert_eq!(
            Timestamp::POST_STREAM.next_allowed_in_stream(),
            Timestamp::DONE
        );
    }

    #[test]
    fn display_names_sentinels() {
        assert_eq!(Timestamp::DONE.to_string(), "Timestamp::Done");
        assert_eq!(Timestamp::new(5).to_string(), "5");
    }
}
