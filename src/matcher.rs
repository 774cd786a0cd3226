use fingate_sensor::{Matcher, Score};
use serde::{Deserialize, Serialize};

use crate::storage::Identity;

/// How a verification scan picks among candidates above the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Stop at the first identity above the threshold, in gallery order.
    #[default]
    FirstMatch,
    /// Examine the whole gallery and keep the highest score.
    BestMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Verified { identity: Identity, score: Score },
    Identified { id: String, score: Score },
    NoMatch,
}

/// Score a probe against one stored identity. `None` for records that must be skipped.
pub fn score_identity<M: Matcher>(matcher: &M, identity: &Identity, probe: &[u8]) -> Option<Score> {
    if identity.template.is_empty() {
        log::warn!("skipping {}: empty template", identity.id);
        return None;
    }
    let score = matcher.compare(&identity.template, probe);
    if score.is_none() {
        log::warn!("skipping {}: malformed template", identity.id);
    }
    score
}

/// One-to-many verification of `probe` against `gallery`.
pub fn verify<M: Matcher>(
    matcher: &M,
    gallery: Vec<Identity>,
    probe: &[u8],
    threshold: Score,
    policy: MatchPolicy,
) -> MatchResult {
    let mut best: Option<(Identity, Score)> = None;
    for identity in gallery {
        let Some(score) = score_identity(matcher, &identity, probe) else {
            continue;
        };
        log::debug!("checking {} with score {}", identity.label(), score);
        if score <= threshold {
            continue;
        }
        match policy {
            MatchPolicy::FirstMatch => return MatchResult::Verified { identity, score },
            MatchPolicy::BestMatch => {
                if best.as_ref().map_or(true, |(_, current)| score > *current) {
                    best = Some((identity, score));
                }
            }
        }
    }
    match best {
        Some((identity, score)) => MatchResult::Verified { identity, score },
        None => MatchResult::NoMatch,
    }
}

/// Look for an existing enrollment of `probe`.
pub fn identify<M: Matcher>(
    matcher: &M,
    gallery: &[Identity],
    probe: &[u8],
    threshold: Score,
) -> MatchResult {
    let candidates = gallery
        .iter()
        .filter(|identity| !identity.template.is_empty())
        .map(|identity| (identity.id.as_str(), identity.template.as_slice()));
    match matcher.identify(probe, candidates, threshold) {
        Some((id, score)) => MatchResult::Identified {
            id: id.to_string(),
            score,
        },
        None => MatchResult::NoMatch,
    }
}
