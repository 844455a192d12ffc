use malachite::Natural;

use crate::crypto::hash_bytes;
use crate::types::{Address, Stake};

/// Outcome of a forger election for one height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForgerSelection {
    pub forger: Address,
    pub randomness: Natural,
    pub total_stake: Natural,
}

pub fn aggregate_total_stake(entries: &[(Address, Stake)]) -> Natural {
    entries.iter().fold(Natural::from(0u32), |acc, (_, stake)| {
        acc + stake.as_natural().clone()
    })
}

fn natural_from_bytes(bytes: &[u8]) -> Natural {
    let mut value = Natural::from(0u32);
    for byte in bytes {
        value *= Natural::from(256u32);
        value += Natural::from(*byte);
    }
    value
}

/// Election randomness for `height`, derived only from the previous block hash.
pub fn election_seed(tip_hash: &str, height: u64) -> Natural {
    let mut data = tip_hash.as_bytes().to_vec();
    data.extend_from_slice(&height.to_le_bytes());
    natural_from_bytes(&hash_bytes(&data))
}

/// Stake-weighted lottery over `entries`, which must already be in canonical
/// (public key) order. Accounts without stake never win.
pub fn select_forger(
    entries: &[(Address, Stake)],
    tip_hash: &str,
    height: u64,
) -> Option<ForgerSelection> {
    let total = aggregate_total_stake(entries);
    if total == Natural::from(0u32) {
        return None;
    }
    let randomness = election_seed(tip_hash, height);
    let mut cursor = randomness.clone() % total.clone();
    let mut winner = None;
    for (address, stake) in entries {
        let stake_value = stake.as_natural();
        if cursor < *stake_value {
            winner = Some(address.clone());
            break;
        }
        cursor -= stake_value.clone();
    }
    let forger = winner.or_else(|| entries.last().map(|(address, _)| address.clone()))?;
    Some(ForgerSelection {
        forger,
        randomness,
        total_stake: total,
    })
}
