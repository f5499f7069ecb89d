//! Fixed-width, lexicographically sortable key encodings.
//!
//! A plain byte-ordered blob store iterates [`SeqKey`]s in sequence order
//! and [`TimeKey`]s in time order, so range scans need no custom
//! comparator.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Number of decimal digits in a [`SeqKey`].
pub const SEQ_KEY_WIDTH: usize = 12;

/// Number of decimal digits in a [`TimeKey`].
pub const TIME_KEY_WIDTH: usize = 13;

/// Largest sequence number a [`SeqKey`] can hold.
pub const MAX_SEQUENCE: u64 = 999_999_999_999;

/// Largest millisecond timestamp a [`TimeKey`] can hold.
pub const MAX_TIMESTAMP: i64 = 9_999_999_999_999;

/// Twelve-digit zero-padded encoding of an event sequence number.
///
/// # Examples
///
/// ```
/// use blobfold_es::SeqKey;
///
/// let key = SeqKey::new(1).unwrap();
/// assert_eq!(key.as_str(), "000000000001");
/// assert_eq!("000000000001".parse::<SeqKey>().unwrap().sequence(), 1);
/// assert!(SeqKey::new(0).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqKey(String);

impl SeqKey {
    /// Encode a sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSequence`] for `0` or values above
    /// [`MAX_SEQUENCE`].
    pub fn new(sequence: u64) -> Result<Self, Error> {
        if sequence == 0 || sequence > MAX_SEQUENCE {
            return Err(Error::InvalidSequence(sequence));
        }
        Ok(Self(format!("{sequence:0width$}", width = SEQ_KEY_WIDTH)))
    }

    /// The sequence number this key encodes.
    pub fn sequence(&self) -> u64 {
        // Validated at construction.
        self.0.parse().unwrap_or_default()
    }

    /// The encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SeqKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sequence =
            parse_digits(s, SEQ_KEY_WIDTH).ok_or_else(|| Error::InvalidSeqKey(s.into()))?;
        if sequence == 0 {
            return Err(Error::InvalidSeqKey(s.into()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for SeqKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SeqKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Thirteen-digit zero-padded encoding of a millisecond timestamp.
///
/// Only used as the key of the time to sequence-ids index; many events may
/// share one time key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeKey(String);

impl TimeKey {
    /// Encode a timestamp in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTimeKey`] for negative timestamps or values
    /// above [`MAX_TIMESTAMP`].
    pub fn new(millis: i64) -> Result<Self, Error> {
        if !(0..=MAX_TIMESTAMP).contains(&millis) {
            return Err(Error::InvalidTimeKey(millis.to_string()));
        }
        Ok(Self(format!("{millis:0width$}", width = TIME_KEY_WIDTH)))
    }

    /// The timestamp this key encodes.
    pub fn millis(&self) -> i64 {
        self.0.parse().unwrap_or_default()
    }

    /// The encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TimeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_digits(s, TIME_KEY_WIDTH).ok_or_else(|| Error::InvalidTimeKey(s.into()))?;
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TimeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse exactly `width` ASCII digits. Signs and whitespace are rejected.
fn parse_digits(s: &str, width: usize) -> Option<u64> {
    if s.len() != width || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
