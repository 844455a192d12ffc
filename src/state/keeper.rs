use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::Challenge;

/// Challenge lifecycle projection, versioned alongside the account state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeezKeeper {
    challenges: BTreeMap<String, Challenge>,
}

impl BeezKeeper {
    pub fn challenge(&self, id: &str) -> Option<&Challenge> {
        self.challenges.get(id)
    }

    pub fn challenges(&self) -> impl Iterator<Item = &Challenge> {
        self.challenges.values()
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    pub(crate) fn ensure_unknown(&self, id: &str) -> ChainResult<()> {
        if self.challenges.contains_key(id) {
            return Err(ChainError::Transaction(format!(
                "challenge {id} already registered"
            )));
        }
        Ok(())
    }

    pub fn open(&mut self, challenge: Challenge) -> ChainResult<()> {
        self.ensure_unknown(&challenge.id)?;
        self.challenges.insert(challenge.id.clone(), challenge);
        Ok(())
    }

    /// Applies a state transition broadcast by a peer. Returns `false` when
    /// the challenge is unknown or the transition does not move it forward.
    pub fn apply_update(&mut self, update: &Challenge) -> bool {
        match self.challenges.get_mut(&update.id) {
            Some(current) if current.state.can_transition_to(update.state) => {
                current.state = update.state;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChallengeState;

    #[test]
    fn updates_only_advance_known_challenges() {
        let mut keeper = BeezKeeper::default();
        let challenge = Challenge::new("creator".into(), vec!["p1".into()], 3);
        keeper.open(challenge.clone()).expect("open");

        assert!(keeper.apply_update(&challenge.with_state(ChallengeState::Accepted)));
        assert!(!keeper.apply_update(&challenge.with_state(ChallengeState::Accepted)));
        assert!(!keeper.apply_update(&challenge.with_state(ChallengeState::Created)));
        assert!(keeper.apply_update(&challenge.with_state(ChallengeState::Closed)));

        let stranger = Challenge::new("other".into(), vec![], 1);
        assert!(!keeper.apply_update(&stranger.with_state(ChallengeState::Closed)));
        assert_eq!(
            keeper.challenge(&challenge.id).map(|c| c.state),
            Some(ChallengeState::Closed)
        );
    }

    #[test]
    fn duplicate_open_is_rejected() {
        let mut keeper = BeezKeeper::default();
        let challenge = Challenge::new("creator".into(), vec![], 0);
        keeper.open(challenge.clone()).expect("first open");
        assert!(keeper.open(challenge).is_err());
        assert_eq!(keeper.len(), 1);
    }
}
