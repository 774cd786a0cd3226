use anyhow::Result;

/// Similarity score. Higher is more similar; the scale is matcher-defined.
pub type Score = i32;

/// Template comparison backend.
pub trait Matcher: Send + Sync {
    /// Score two templates. `None` when either one is malformed or the pair
    /// cannot be compared.
    fn compare(&self, a: &[u8], b: &[u8]) -> Option<Score>;

    /// Fuse three samples of the same finger into one registration template.
    fn merge(&self, t1: &[u8], t2: &[u8], t3: &[u8]) -> Result<Vec<u8>>;

    /// One-to-many search. Returns the best entry scoring strictly above
    /// `threshold`; ties keep the earlier entry.
    fn identify<'a, I>(&self, probe: &[u8], gallery: I, threshold: Score) -> Option<(&'a str, Score)>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
        Self: Sized,
    {
        gallery
            .into_iter()
            .filter_map(|(id, template)| self.compare(template, probe).map(|s| (id, s)))
            .filter(|&(_, score)| score > threshold)
            .fold(None, |acc, (id, score)| match acc {
                Some((_, best)) if best >= score => acc,
                _ => Some((id, score)),
            })
    }
}

/// Reference matcher for fixed-length binary templates.
///
/// Scores run from 0 (no better than chance) to 1000 (identical).
#[derive(Debug, Clone, Copy, Default)]
pub struct BitwiseMatcher;

pub const MAX_SCORE: Score = 1000;

impl Matcher for BitwiseMatcher {
    fn compare(&self, a: &[u8], b: &[u8]) -> Option<Score> {
        if a.is_empty() || a.len() != b.len() {
            return None;
        }
        let total_bits = (a.len() * 8) as i64;
        let differing: i64 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x ^ y).count_ones() as i64)
            .sum();
        let agreeing = total_bits - differing;
        // (2 * agree / total - 1) * MAX_SCORE, in integer arithmetic
        let score = (2 * agreeing - total_bits) * MAX_SCORE as i64 / total_bits;
        Some(score.max(0) as Score)
    }

    fn merge(&self, t1: &[u8], t2: &[u8], t3: &[u8]) -> Result<Vec<u8>> {
        if t1.is_empty() || t1.len() != t2.len() || t1.len() != t3.len() {
            anyhow::bail!(
                "cannot merge templates of lengths {}, {}, {}",
                t1.len(),
                t2.len(),
                t3.len()
            );
        }
        Ok(t1
            .iter()
            .zip(t2)
            .zip(t3)
            .map(|((a, b), c)| (a & b) | (a & c) | (b & c))
            .collect())
    }
}
