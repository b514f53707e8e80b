//! Address selection.

use rand::Rng;

/// Pick one address uniformly at random.
///
/// An empty list yields `None` and a single-element list always yields its
/// only element. Liveness is not considered.
pub fn pick_random(addresses: &[String]) -> Option<String> {
    match addresses {
        [] => None,
        [only] => Some(only.clone()),
        _ => {
            let idx = rand::rng().random_range(0..addresses.len());
            addresses.get(idx).cloned()
        }
    }
}
