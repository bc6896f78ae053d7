//! Small newtypes over the bare integers the data model uses as keys.
//! Kept distinct so a node index and a job id can never be swapped by
//! accident at a call site, per the arena-and-index model in the
//! design notes.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident, $repr:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $repr);

        impl $name {
            pub fn get(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(v: $repr) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(NodeIndex, u32);
id_type!(JobId, u64);
id_type!(StepId, u32);
id_type!(TaskGlobalId, u32);

/// A step is only unique within its job; this pair is the key used by
/// the `steps` nested mapping in the controller and in credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub job_id: JobId,
    pub step_id: StepId,
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job_id, self.step_id)
    }
}
