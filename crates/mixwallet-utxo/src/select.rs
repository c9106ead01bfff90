//! Pluggable coin-selection strategies.
//!
//! Each selector is a pure function over a caller-supplied list of
//! eligible coins — no wallet-state access, deterministic for a fixed
//! input. The original merge-algorithm dispatch (`MERGE_ALGORITHMS`) used
//! randomization inside `select_gradual`; here every strategy is made
//! reproducible for a fixed coin set, in keeping with the selector
//! soundness property this crate tests against — `gradual`'s curve is
//! approximated deterministically rather than sampled.

use std::collections::HashMap;

use crate::error::UtxoError;
use crate::store::{SelectFn, SelectableUtxo};

fn total(coins: &[SelectableUtxo]) -> u64 {
    coins.iter().map(|c| c.value).sum()
}

fn insufficient(coins: &[SelectableUtxo], target: u64) -> UtxoError {
    UtxoError::InsufficientFunds {
        target,
        available: total(coins),
    }
}

/// Stable ordering for deterministic tie-breaks: by value, then by
/// outpoint so selectors never depend on `HashMap` iteration order.
fn sorted_by_value(coins: &[SelectableUtxo], ascending: bool) -> Vec<SelectableUtxo> {
    let mut sorted = coins.to_vec();
    sorted.sort_by(|a, b| {
        let ord = a.value.cmp(&b.value).then_with(|| a.outpoint.cmp(&b.outpoint));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    sorted
}

fn accumulate_until(coins: &[SelectableUtxo], target: u64) -> Option<Vec<SelectableUtxo>> {
    let mut acc = 0u64;
    let mut out = Vec::new();
    for coin in coins {
        if acc >= target {
            break;
        }
        acc += coin.value;
        out.push(*coin);
    }
    if acc >= target {
        Some(out)
    } else {
        None
    }
}

/// Ascending fill: smallest coins first, stopping as soon as the target
/// is met. Minimizes excess by preferring the smallest sufficient set
/// drawn from ascending order.
pub fn select_default(coins: &[SelectableUtxo], target: u64) -> Result<Vec<SelectableUtxo>, UtxoError> {
    let sorted = sorted_by_value(coins, true);
    accumulate_until(&sorted, target).ok_or_else(|| insufficient(coins, target))
}

/// A curve between `default` and `greedy`: starts accumulating from a
/// point roughly a third of the way into the ascending list rather than
/// the very smallest coin, so selections use moderately large coins
/// before falling back to the smallest ones. Deterministic for a fixed
/// input list.
pub fn select_gradual(coins: &[SelectableUtxo], target: u64) -> Result<Vec<SelectableUtxo>, UtxoError> {
    let sorted = sorted_by_value(coins, true);
    if sorted.is_empty() {
        return Err(insufficient(coins, target));
    }
    let start = sorted.len() / 3;
    let reordered: Vec<SelectableUtxo> = sorted[start..]
        .iter()
        .chain(sorted[..start].iter())
        .copied()
        .collect();
    accumulate_until(&reordered, target).ok_or_else(|| insufficient(coins, target))
}

/// Descending fill, then trim: take the largest coins first until the
/// target is met, then drop any selected coins (largest to smallest)
/// that can be removed while still meeting the target, minimizing final
/// excess.
pub fn select_greedy(coins: &[SelectableUtxo], target: u64) -> Result<Vec<SelectableUtxo>, UtxoError> {
    let sorted = sorted_by_value(coins, false);
    let mut selected = accumulate_until(&sorted, target).ok_or_else(|| insufficient(coins, target))?;
    let mut i = 0;
    while i < selected.len() {
        let remaining_sum: u64 = total(&selected) - selected[i].value;
        if remaining_sum >= target {
            selected.remove(i);
        } else {
            i += 1;
        }
    }
    Ok(selected)
}

/// Descending fill with no excess-trimming pass — the largest coins are
/// taken until the target is met and kept as-is.
pub fn select_greediest(coins: &[SelectableUtxo], target: u64) -> Result<Vec<SelectableUtxo>, UtxoError> {
    let sorted = sorted_by_value(coins, false);
    accumulate_until(&sorted, target).ok_or_else(|| insufficient(coins, target))
}

/// Named-strategy registry, mirroring the original's dict-of-callables
/// dispatch so configuration can select a selector by string.
pub fn registry() -> HashMap<&'static str, SelectFn> {
    let mut map: HashMap<&'static str, SelectFn> = HashMap::new();
    map.insert("default", select_default);
    map.insert("gradual", select_gradual);
    map.insert("greedy", select_greedy);
    map.insert("greediest", select_greediest);
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Txid};

    fn coin(byte: u8, value: u64) -> SelectableUtxo {
        SelectableUtxo {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([byte; 32]),
                vout: 0,
            },
            value,
        }
    }

    fn sample() -> Vec<SelectableUtxo> {
        vec![coin(1, 10_000), coin(2, 50_000), coin(3, 100_000), coin(4, 5_000)]
    }

    #[test]
    fn registry_has_all_four_named_strategies() {
        let reg = registry();
        for name in ["default", "gradual", "greedy", "greediest"] {
            assert!(reg.contains_key(name), "missing selector {name}");
        }
    }

    #[test]
    fn all_selectors_meet_or_exceed_target_and_only_use_available_coins() {
        let coins = sample();
        for select_fn in [select_default, select_gradual, select_greedy, select_greediest] {
            let selected = select_fn(&coins, 60_000).unwrap();
            let sum: u64 = selected.iter().map(|c| c.value).sum();
            assert!(sum >= 60_000);
            for s in &selected {
                assert!(coins.contains(s));
            }
        }
    }

    #[test]
    fn all_selectors_fail_with_insufficient_funds() {
        let coins = sample();
        for select_fn in [select_default, select_gradual, select_greedy, select_greediest] {
            match select_fn(&coins, 1_000_000) {
                Err(UtxoError::InsufficientFunds { target, available }) => {
                    assert_eq!(target, 1_000_000);
                    assert_eq!(available, 165_000);
                }
                other => panic!("expected InsufficientFunds, got {other:?}"),
            }
        }
    }

    #[test]
    fn default_prefers_small_coins() {
        let coins = sample();
        let selected = select_default(&coins, 12_000).unwrap();
        assert!(selected.iter().any(|c| c.value == 5_000));
    }

    #[test]
    fn greedy_trims_unneeded_excess() {
        let coins = sample();
        let selected = select_greedy(&coins, 100_000).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].value, 100_000);
    }

    #[test]
    fn selectors_are_deterministic_for_fixed_input() {
        let coins = sample();
        let a = select_gradual(&coins, 60_000).unwrap();
        let b = select_gradual(&coins, 60_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_available_is_insufficient() {
        assert!(select_default(&[], 1).is_err());
    }
}
