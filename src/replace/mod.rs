pub mod lru;

use crate::cache::Way;

/// Victim selection and recency bookkeeping for one set at a time.
pub trait Replace {
    /// Way to evict from a set that missed.
    fn victim(&self, set: &[Way]) -> usize;
    /// Records an access to `way`, hit or fill.
    fn touch(&mut self, set: &mut [Way], way: usize);
}
