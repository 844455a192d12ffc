use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Wallet;
use crate::errors::ChainResult;

use super::transaction::unix_timestamp;
use super::Address;

/// Lifecycle of a challenge. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeState {
    Created,
    Accepted,
    Closed,
}

impl ChallengeState {
    pub fn can_transition_to(self, next: ChallengeState) -> bool {
        next > self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub creator: Address,
    pub participants: Vec<Address>,
    pub reward: u128,
    pub state: ChallengeState,
}

impl Challenge {
    pub fn new(creator: Address, participants: Vec<Address>, reward: u128) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            creator,
            participants,
            reward,
            state: ChallengeState::Created,
        }
    }

    pub fn with_state(&self, state: ChallengeState) -> Self {
        let mut next = self.clone();
        next.state = state;
        next
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeTx {
    pub id: String,
    pub sender_public_key: Address,
    pub challenge: Challenge,
    pub timestamp: u64,
    pub signature: String,
}

impl ChallengeTx {
    pub fn new(sender_public_key: Address, challenge: Challenge) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_public_key,
            challenge,
            timestamp: unix_timestamp(),
            signature: String::new(),
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serde_json::to_vec(&unsigned).expect("serializing challenge payload")
    }

    pub fn sign(&mut self, wallet: &Wallet) {
        self.signature = wallet.sign(&self.payload());
    }

    pub fn verify(&self) -> ChainResult<()> {
        Wallet::verify(&self.payload(), &self.signature, &self.sender_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        assert!(ChallengeState::Created.can_transition_to(ChallengeState::Accepted));
        assert!(ChallengeState::Created.can_transition_to(ChallengeState::Closed));
        assert!(!ChallengeState::Accepted.can_transition_to(ChallengeState::Accepted));
        assert!(!ChallengeState::Closed.can_transition_to(ChallengeState::Created));
    }

    #[test]
    fn signed_challenge_verifies() {
        let wallet = Wallet::generate();
        let challenge = Challenge::new(wallet.public_key_string(), vec!["bee".into()], 5);
        let mut tx = ChallengeTx::new(wallet.public_key_string(), challenge);
        tx.sign(&wallet);
        tx.verify().expect("valid challenge signature");

        tx.challenge.reward = 50;
        assert!(tx.verify().is_err());
    }
}
