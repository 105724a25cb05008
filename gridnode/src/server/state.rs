/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use crate::registry::ServerState;

/// The server's internal state. Finer grained than [`ServerState`],
/// which is what observers and administrators see.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter
)]
pub enum InternalState {
    Loading,
    Inactive,
    Activating,
    WaitForActivation,
    ActivationTimeout,
    Active,
    Deactivating,
    DeactivatingWaitForProcess,
    Destroying,
    Destroyed,
}

impl InternalState {
    pub fn public(self) -> ServerState {
        match self {
            Self::Loading | Self::Inactive => ServerState::Inactive,
            Self::Activating | Self::WaitForActivation => ServerState::Activating,
            Self::ActivationTimeout => ServerState::ActivationTimedOut,
            Self::Active => ServerState::Active,
            Self::Deactivating | Self::DeactivatingWaitForProcess => ServerState::Deactivating,
            Self::Destroying => ServerState::Destroying,
            Self::Destroyed => ServerState::Destroyed,
        }
    }

    /// The transition table. Every state change goes through this check.
    pub fn can_transition_to(self, next: InternalState) -> bool {
        use InternalState::*;
        matches!(
            (self, next),
            (Inactive, Loading | Activating | Destroying)
                | (Loading, Inactive)
                | (Activating, WaitForActivation | Deactivating | Inactive)
                | (
                    WaitForActivation,
                    Active | ActivationTimeout | Deactivating | Inactive
                )
                | (ActivationTimeout, Active | Deactivating | Inactive)
                | (Active, Deactivating | Inactive)
                | (Deactivating, DeactivatingWaitForProcess | Inactive)
                | (DeactivatingWaitForProcess, Deactivating | Inactive)
                | (Destroying, Destroyed)
                | (Destroyed, Loading)
        )
    }

    /// A process may be alive in this state.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::Activating
                | Self::WaitForActivation
                | Self::ActivationTimeout
                | Self::Active
                | Self::Deactivating
                | Self::DeactivatingWaitForProcess
        )
    }

    pub fn is_deactivating(self) -> bool {
        matches!(self, Self::Deactivating | Self::DeactivatingWaitForProcess)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::InternalState::*;
    use super::*;

    #[test]
    fn test_transition_table() {
        let allowed = [
            (Inactive, vec![Loading, Activating, Destroying]),
            (Loading, vec![Inactive]),
            (Activating, vec![WaitForActivation, Deactivating, Inactive]),
            (
                WaitForActivation,
                vec![Active, ActivationTimeout, Deactivating, Inactive],
            ),
            (ActivationTimeout, vec![Active, Deactivating, Inactive]),
            (Active, vec![Deactivating, Inactive]),
            (Deactivating, vec![DeactivatingWaitForProcess, Inactive]),
            (DeactivatingWaitForProcess, vec![Deactivating, Inactive]),
            (Destroying, vec![Destroyed]),
            (Destroyed, vec![Loading]),
        ];
        for (from, targets) in allowed {
            for to in InternalState::iter() {
                assert_eq!(
                    from.can_transition_to(to),
                    targets.contains(&to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_public_mapping() {
        assert_eq!(Loading.public(), ServerState::Inactive);
        assert_eq!(WaitForActivation.public(), ServerState::Activating);
        assert_eq!(ActivationTimeout.public(), ServerState::ActivationTimedOut);
        assert_eq!(DeactivatingWaitForProcess.public(), ServerState::Deactivating);
        assert_eq!(Destroyed.public(), ServerState::Destroyed);
    }

    #[test]
    fn test_running_states() {
        assert!(Active.is_running());
        assert!(DeactivatingWaitForProcess.is_running());
        assert!(!Loading.is_running());
        assert!(!Destroying.is_running());
    }
}
