//! Views, validator membership and the quorum arithmetic every other
//! component derives its thresholds from.

use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::ordering::{NodeId, ViewNo};

/// Quorum thresholds for a pool of `n` validators tolerating
/// `f = (n - 1) / 3` Byzantine ones.
///
/// No component may hard-code quorum sizes; they all come from here.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Quorums {
    n: usize,
    f: usize,
}

impl Quorums {
    /// Derive the thresholds from the pool size. Pools smaller than 4
    /// get `f = 0` and tolerate no faults.
    pub fn new(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::new(ErrorKind::InputMalformed, "empty validator set"));
        }
        Ok(Self { n, f: (n - 1) / 3 })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Maximum tolerated faulty validators.
    pub fn f(&self) -> usize {
        self.f
    }

    /// At least one honest validator: `f + 1`.
    pub fn weak(&self) -> usize {
        self.f + 1
    }

    /// A majority of honest validators: `n - f` (equals `2f + 1` when
    /// `n = 3f + 1`).
    pub fn strong(&self) -> usize {
        self.n - self.f
    }

    /// Acks needed to witness another node's ViewChange for the new
    /// primary. The author and the primary never ack, so of the
    /// remaining `n - 2` voices `f` may stay silent.
    pub fn view_change_ack(&self) -> usize {
        self.n.saturating_sub(self.f + 2)
    }
}

/// The sorted validator membership of the pool.
///
/// Sorting is deterministic by node name so that every replica
/// resolves the same primary for a given view.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<NodeId>,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<NodeId>) -> Result<Self> {
        validators.sort();
        validators.dedup();
        if validators.is_empty() {
            return Err(Error::new(ErrorKind::InputMalformed, "empty validator set"));
        }
        Ok(Self { validators })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.validators.binary_search(id).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.validators.iter()
    }

    /// The primary of `view` for replica instance `instance`:
    /// `validators[(view + instance) mod n]`.
    pub fn primary(&self, view: ViewNo, instance: usize) -> &NodeId {
        let n = self.validators.len() as u64;
        let index = (u64::from(view) + instance as u64) % n;
        &self.validators[index as usize]
    }
}

/// Static information about the currently installed view.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ViewInfo {
    view_no: ViewNo,
    validators: ValidatorSet,
    quorums: Quorums,
}

impl ViewInfo {
    /// Creates a new instance of `ViewInfo`.
    pub fn new(view_no: ViewNo, validators: ValidatorSet) -> Result<Self> {
        let quorums = Quorums::new(validators.len())?;
        Ok(Self { view_no, validators, quorums })
    }

    /// Returns the view number of this `ViewInfo`.
    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    /// Returns the quorum parameters of this `ViewInfo`.
    pub fn quorums(&self) -> Quorums {
        self.quorums
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// The master-instance primary of this view.
    pub fn primary(&self) -> &NodeId {
        self.validators.primary(self.view_no, 0)
    }

    /// The primary a given instance follows in this view.
    pub fn primary_of(&self, instance: usize) -> &NodeId {
        self.validators.primary(self.view_no, instance)
    }

    /// The `ViewInfo` of the following view, same membership.
    pub fn next(&self) -> ViewInfo {
        ViewInfo {
            view_no: self.view_no.next(),
            validators: self.validators.clone(),
            quorums: self.quorums,
        }
    }

    /// The `ViewInfo` for an arbitrary target view, same membership.
    pub fn for_view(&self, view_no: ViewNo) -> ViewInfo {
        ViewInfo { view_no, validators: self.validators.clone(), quorums: self.quorums }
    }
}
