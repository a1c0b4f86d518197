//! Strongly-typed identifiers for store records.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

record_id!(
    /// Identifies a device controller (ECC server).
    DeviceId
);
record_id!(
    /// Identifies a data router.
    RouterId
);
record_id!(
    /// Identifies a data source (topology entry).
    SourceId
);
record_id!(
    /// Identifies an experiment.
    ExperimentId
);
record_id!(
    /// Identifies a run record.
    RunId
);
