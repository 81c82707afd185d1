//! Identifiers that impose an order on protocol messages: views,
//! batch sequence numbers and the ledgers they apply to.

use std::cmp::Ordering;
use std::fmt;

use either::{Either, Left, Right};
use serde::{Deserialize, Serialize};

/// Represents the sequence number attributed to a batch of client
/// requests within a view. The first batch proposed after a view
/// installs has sequence number 1; zero is reserved for "nothing
/// ordered yet".
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct SeqNo(u64);

/// Monotonically non-decreasing view number. A view is an epoch with
/// a fixed primary per instance.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct ViewNo(u64);

/// Identifies one of the replicated ledgers.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct LedgerId(pub u8);

impl LedgerId {
    pub const POOL: LedgerId = LedgerId(0);
    pub const DOMAIN: LedgerId = LedgerId(1);
    pub const CONFIG: LedgerId = LedgerId(2);
    pub const AUDIT: LedgerId = LedgerId(3);
}

/// The stable name of a validator in the pool.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct NodeId(String);

/// Uniquely keys a batch within a replica's history.
pub type ThreePcKey = (ViewNo, SeqNo);

pub(crate) enum InvalidSeqNo {
    Small,
    Big,
}

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);
    pub const ONE: SeqNo = SeqNo(1);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// Return an appropriate value to index a watermark-bounded queue
    /// rooted at `base`.
    ///
    /// Sequence numbers below the base, or further above it than the
    /// log window allows, are invalid; the caller either drops the
    /// message or stashes it until the window moves.
    #[inline]
    pub(crate) fn index(self, base: SeqNo, window: u64) -> Either<InvalidSeqNo, usize> {
        if self.0 <= base.0 {
            Left(InvalidSeqNo::Small)
        } else if self.0 - base.0 > window {
            // messages whose seq no. is too large may be due
            // to a DoS attempt by a malicious node
            Left(InvalidSeqNo::Big)
        } else {
            Right((self.0 - base.0 - 1) as usize)
        }
    }
}

impl ViewNo {
    pub const ZERO: ViewNo = ViewNo(0);

    /// Returns the following view number.
    #[inline]
    pub fn next(self) -> ViewNo {
        ViewNo(self.0 + 1)
    }
}

impl From<u64> for SeqNo {
    #[inline]
    fn from(sequence_number: u64) -> SeqNo {
        SeqNo(sequence_number)
    }
}

impl From<SeqNo> for u64 {
    #[inline]
    fn from(sequence_number: SeqNo) -> u64 {
        sequence_number.0
    }
}

impl From<u64> for ViewNo {
    #[inline]
    fn from(view_no: u64) -> ViewNo {
        ViewNo(view_no)
    }
}

impl From<ViewNo> for u64 {
    #[inline]
    fn from(view_no: ViewNo) -> u64 {
        view_no.0
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ViewNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        NodeId(name.to_owned())
    }
}

/// Types orderable by batch sequence number.
pub trait Orderable {
    /// Returns the sequence number of this value.
    fn sequence_number(&self) -> SeqNo;
}

/// Compare two 3PC keys; views dominate sequence numbers.
pub fn compare_3pc_keys(a: &ThreePcKey, b: &ThreePcKey) -> Ordering {
    a.0.cmp(&b.0).then(a.1.cmp(&b.1))
}
