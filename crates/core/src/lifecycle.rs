//! Scenario lifecycle states and the transition table between them.
//!
//! States are persisted as their SCREAMING_SNAKE_CASE text form in the
//! `scenarios.status` column and appear verbatim in progress messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

macro_rules! define_state_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the persisted text form.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(CoreError::Validation(format!(
                        "Unknown {}: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

define_state_enum! {
    /// Position of a scenario in the execution pipeline.
    LifecycleState {
        Created = "CREATED",
        Queued = "QUEUED",
        Validating = "VALIDATING",
        SimulatingBaseline = "SIMULATING_BASELINE",
        SimulatingPolicy = "SIMULATING_POLICY",
        Postprocessing = "POSTPROCESSING",
        Completed = "COMPLETED",
        Failed = "FAILED",
        Cancelled = "CANCELLED",
    }
}

impl LifecycleState {
    /// COMPLETED, FAILED and CANCELLED accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Failed | LifecycleState::Cancelled
        )
    }

    /// Whether the pipeline is allowed to move from `self` to `next`.
    ///
    /// Any non-terminal state may move to CANCELLED or FAILED (queue
    /// timeouts, admission rejection and internal faults can end a job
    /// before it reaches a stage). Forward moves follow the fixed stage
    /// order; nothing leaves a terminal state.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Cancelled | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Validating)
                | (Queued, Validating)
                | (Validating, SimulatingBaseline)
                | (SimulatingBaseline, SimulatingPolicy)
                | (SimulatingPolicy, Postprocessing)
                | (Postprocessing, Completed)
        )
    }

    /// States that mean a collaborator is (or was about to be) running.
    pub fn is_executing(self) -> bool {
        matches!(
            self,
            LifecycleState::Validating
                | LifecycleState::SimulatingBaseline
                | LifecycleState::SimulatingPolicy
                | LifecycleState::Postprocessing
        )
    }
}
