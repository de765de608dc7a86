//! Strongly-typed identifiers.
//!
//! Every identifier in the workspace is a ULID wrapped in [`TypedId`], a
//! newtype tagged with a zero-sized kind marker. The tag keeps a run id and
//! an artifact id apart at compile time while sharing one implementation;
//! ULIDs sort by creation time and need no coordination to mint.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Names an identifier kind for diagnostics.
pub trait IdKind {
    /// Label used in parse errors and debug output.
    const LABEL: &'static str;
}

/// Kind marker for flow runs.
#[derive(Debug)]
pub enum RunKind {}

impl IdKind for RunKind {
    const LABEL: &'static str = "run";
}

/// Kind marker for stored artifact blobs.
#[derive(Debug)]
pub enum ArtifactKind {}

impl IdKind for ArtifactKind {
    const LABEL: &'static str = "artifact";
}

/// A ULID tagged with the kind of entity it names.
///
/// Two `TypedId`s with different kind markers are different types, so an
/// artifact handle can never be passed where a run id is expected.
pub struct TypedId<K: IdKind> {
    value: Ulid,
    _kind: PhantomData<K>,
}

/// Identifier of one flow run; minted per `Flow::run` and carried by
/// events, spans, and the run context.
pub type RunId = TypedId<RunKind>;

/// Identifier of one stored blob; minted by the artifact store on `put`
/// and travelling inside `ArtifactRef` handles.
pub type ArtifactId = TypedId<ArtifactKind>;

impl<K: IdKind> TypedId<K> {
    /// Mints a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(Ulid::new())
    }

    const fn wrap(value: Ulid) -> Self {
        Self {
            value,
            _kind: PhantomData,
        }
    }
}

// Manual impls: deriving would put unwanted bounds on the kind marker.

impl<K: IdKind> Clone for TypedId<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: IdKind> Copy for TypedId<K> {}

impl<K: IdKind> PartialEq for TypedId<K> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<K: IdKind> Eq for TypedId<K> {}

impl<K: IdKind> std::hash::Hash for TypedId<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<K: IdKind> fmt::Debug for TypedId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", K::LABEL, self.value)
    }
}

impl<K: IdKind> fmt::Display for TypedId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl<K: IdKind> FromStr for TypedId<K> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match Ulid::from_string(s) {
            Ok(value) => Ok(Self::wrap(value)),
            Err(e) => Err(Error::InvalidId {
                message: format!("'{s}' is not a valid {} id: {e}", K::LABEL),
            }),
        }
    }
}

impl<K: IdKind> Serialize for TypedId<K> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.value.serialize(serializer)
    }
}

impl<'de, K: IdKind> Deserialize<'de> for TypedId<K> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ulid::deserialize(deserializer).map(Self::wrap)
    }
}
