use fingate_sensor::{Matcher, Score};

/// Samples fused into one registration template.
pub const REQUIRED_SAMPLES: usize = 3;

/// Result of offering a capture to an active enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulate {
    Accepted { collected: usize },
    /// Different finger (or incomparable template). Nothing was stored.
    Mismatch { collected: usize, score: Option<Score> },
    /// Already holding every sample; merge before offering more.
    Full,
}

/// Samples gathered so far for one enrollment.
#[derive(Debug, Default)]
pub struct EnrollmentSession {
    samples: Vec<Vec<u8>>,
    active: bool,
}

impl EnrollmentSession {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() == REQUIRED_SAMPLES
    }

    /// Start accumulating after the operator consented. The first sample is
    /// taken unconditionally.
    pub fn begin(&mut self, first: Vec<u8>) {
        self.samples.clear();
        self.samples.push(first);
        self.active = true;
    }

    /// Append `template` if it matches the most recent sample strictly above `threshold`.
    pub fn offer<M: Matcher>(&mut self, matcher: &M, template: Vec<u8>, threshold: Score) -> Accumulate {
        if self.is_complete() {
            return Accumulate::Full;
        }
        let Some(last) = self.samples.last() else {
            self.begin(template);
            return Accumulate::Accepted { collected: 1 };
        };
        let score = matcher.compare(last, &template);
        match score {
            Some(s) if s > threshold => {
                self.samples.push(template);
                Accumulate::Accepted {
                    collected: self.samples.len(),
                }
            }
            _ => Accumulate::Mismatch {
                collected: self.samples.len(),
                score,
            },
        }
    }

    /// The three samples, ready for merging.
    pub fn samples(&self) -> Option<[&[u8]; REQUIRED_SAMPLES]> {
        match self.samples.as_slice() {
            [a, b, c] => Some([a.as_slice(), b.as_slice(), c.as_slice()]),
            _ => None,
        }
    }

    /// Drop every accumulated sample and leave enrollment.
    pub fn clear(&mut self) {
        if self.active {
            log::debug!("enrollment session cleared with {} sample(s)", self.samples.len());
        }
        self.samples.clear();
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingate_sensor::BitwiseMatcher;

    #[test]
    fn test_accumulates_matching_samples() {
        let mut session = EnrollmentSession::default();
        assert!(!session.is_active());
        session.begin(vec![0u8; 4]);
        assert!(session.is_active());

        let near = vec![0x01u8, 0, 0, 0];
        assert_eq!(
            session.offer(&BitwiseMatcher, near.clone(), 100),
            Accumulate::Accepted { collected: 2 }
        );
        assert_eq!(
            session.offer(&BitwiseMatcher, near, 100),
            Accumulate::Accepted { collected: 3 }
        );
        assert!(session.is_complete());
        assert!(session.samples().is_some());
        assert_eq!(session.offer(&BitwiseMatcher, vec![0u8; 4], 100), Accumulate::Full);
    }

    #[test]
    fn test_mismatch_leaves_session_untouched() {
        let mut session = EnrollmentSession::default();
        session.begin(vec![0u8; 4]);
        let other_finger = vec![0xFFu8; 4];
        assert_eq!(
            session.offer(&BitwiseMatcher, other_finger, 100),
            Accumulate::Mismatch {
                collected: 1,
                score: Some(0)
            }
        );
        let wrong_length = vec![0u8; 8];
        assert_eq!(
            session.offer(&BitwiseMatcher, wrong_length, 100),
            Accumulate::Mismatch {
                collected: 1,
                score: None
            }
        );
        assert_eq!(session.collected(), 1);
        assert!(session.samples().is_none());
    }

    #[test]
    fn test_compares_against_most_recent_sample() {
        let mut session = EnrollmentSession::default();
        session.begin(vec![0x00u8; 4]);
        // 4 bits off the first sample -> 750
        session.offer(&BitwiseMatcher, vec![0x0Fu8, 0, 0, 0], 700);
        // 8 bits off the first sample (500) but only 4 off the second (750)
        assert_eq!(
            session.offer(&BitwiseMatcher, vec![0xFFu8, 0, 0, 0], 700),
            Accumulate::Accepted { collected: 3 }
        );
    }

    #[test]
    fn test_clear_resets() {
        let mut session = EnrollmentSession::default();
        session.begin(vec![1u8]);
        session.clear();
        assert!(!session.is_active());
        assert_eq!(session.collected(), 0);
    }
}
