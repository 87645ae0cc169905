//! Pluggable sentiment stage
//!
//! Providers look at the headlines supplied with an engine step and may lock
//! out new setups for that step. The engine only records the score.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentVerdict {
    /// -1 (bearish) to 1 (bullish)
    pub score: f64,
    /// Block new setups this step
    pub locked: bool,
}

impl SentimentVerdict {
    pub const NEUTRAL: SentimentVerdict = SentimentVerdict {
        score: 0.0,
        locked: false,
    };
}

pub trait SentimentProvider: Send + Sync {
    fn evaluate(&self, symbol: &str, headlines: &[String]) -> SentimentVerdict;
}

/// Keyword matcher: lock words halt new entries, positive and negative
/// words move the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordSentiment {
    pub lock_keywords: Vec<String>,
    pub positive_keywords: Vec<String>,
    pub negative_keywords: Vec<String>,
}

impl Default for KeywordSentiment {
    fn default() -> Self {
        let words = |list: &[&str]| -> Vec<String> { list.iter().map(|w| w.to_string()).collect() };
        Self {
            lock_keywords: words(&["trading halt", "halted", "circuit breaker", "fomc", "rate decision"]),
            positive_keywords: words(&["beat", "upgrade", "surge", "rally", "record high"]),
            negative_keywords: words(&["miss", "downgrade", "plunge", "selloff", "default"]),
        }
    }
}

impl KeywordSentiment {
    /// Defaults with a custom lock list
    pub fn with_lock_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lock_keywords: keywords.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn hits(keywords: &[String], headline: &str) -> usize {
        keywords
            .iter()
            .filter(|k| !k.is_empty() && headline.contains(&k.to_lowercase()))
            .count()
    }
}

impl SentimentProvider for KeywordSentiment {
    fn evaluate(&self, _symbol: &str, headlines: &[String]) -> SentimentVerdict {
        let (mut positive, mut negative, mut locked) = (0usize, 0usize, false);

        for headline in headlines {
            let headline = headline.to_lowercase();
            positive += Self::hits(&self.positive_keywords, &headline);
            negative += Self::hits(&self.negative_keywords, &headline);
            locked |= Self::hits(&self.lock_keywords, &headline) > 0;
        }

        let total = positive + negative;
        let score = if total == 0 {
            0.0
        } else {
            (positive as f64 - negative as f64) / total as f64
        };

        SentimentVerdict { score, locked }
    }
}
