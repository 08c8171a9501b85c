use crate::cache::Way;

use super::Replace;

/// Least-recently-used replacement driven by the per-way `age` counters.
///
/// Every access resets the touched way to age 0 and ages the rest of the set, so
/// the oldest way is always the least recently used. Ways that were never touched
/// tie and fall back to way order.
#[derive(Debug, Default)]
pub struct Lru {}

impl Lru {
    pub fn new() -> Self {
        Lru {}
    }
}

impl Replace for Lru {
    fn victim(&self, set: &[Way]) -> usize {
        // max_by_key keeps the last maximum, so walk backwards to prefer the first.
        set.iter()
            .enumerate()
            .rev()
            .max_by_key(|(_way, w)| w.age)
            .map_or(0, |(way, _w)| way)
    }

    fn touch(&mut self, set: &mut [Way], way: usize) {
        if set.len() > 1 {
            for (other, w) in set.iter_mut().enumerate() {
                if other != way {
                    w.age = w.age.saturating_add(1);
                }
            }
        }
        set[way].age = 0;
    }
}
