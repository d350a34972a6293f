//! Complexity Classifier
//!
//! Maps free-text prompts to a resource tier. Pure and total: the same prompt
//! always yields the same [`Classification`], with no state and no I/O.
//!
//! # Scoring
//!
//! The prompt is lowercased and split into alphanumeric tokens. Each keyword
//! category contributes its weight once per distinct matching keyword, up to
//! [`MAX_HITS_PER_CATEGORY`] hits. Keywords may be multi-token phrases.
//!
//! ```text
//! score <  3        -> Basic
//! 3 <= score < 6    -> Medium
//! score >= 6        -> Ultra
//! ```

use serde::{Deserialize, Serialize};

/// Coarse resource sizing bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Small GPU, single checkpoint
    Basic,
    /// Mid-range GPU
    Medium,
    /// Large GPU, video capable
    Ultra,
}

impl Tier {
    /// All tiers, lightest first
    pub const ALL: [Tier; 3] = [Tier::Basic, Tier::Medium, Tier::Ultra];

    /// Lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Medium => "medium",
            Self::Ultra => "ultra",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "low" => Ok(Self::Basic),
            "medium" => Ok(Self::Medium),
            "ultra" | "high" => Ok(Self::Ultra),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Output medium the request asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still image
    Image,
    /// Animated output
    Video,
}

/// Keyword categories and their weights
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Output size descriptors
    Resolution,
    /// Animation and video
    Motion,
    /// Fidelity descriptors
    Quality,
    /// Scene complexity
    Composition,
    /// Explicit stylistic intensity
    Intensity,
    /// Requests for something quick and cheap
    Simplicity,
}

impl Category {
    /// Score contribution per hit
    #[must_use]
    pub fn weight(self) -> i32 {
        match self {
            Self::Resolution => 4,
            Self::Motion => 6,
            Self::Quality => 2,
            Self::Composition => 2,
            Self::Intensity => 2,
            Self::Simplicity => -3,
        }
    }
}

/// Distinct keyword hits counted per category
pub const MAX_HITS_PER_CATEGORY: usize = 2;

/// Lower bound (inclusive) of the Medium band
pub const MEDIUM_THRESHOLD: i32 = 3;
/// Lower bound (inclusive) of the Ultra band
pub const ULTRA_THRESHOLD: i32 = 6;

const KEYWORDS: &[(Category, &[&str])] = &[
    (
        Category::Resolution,
        &["4k", "8k", "uhd", "high resolution", "highres", "hi res"],
    ),
    (
        Category::Motion,
        &["video", "animation", "animated", "animate", "wan", "motion", "gif"],
    ),
    (
        Category::Quality,
        &[
            "hd",
            "high quality",
            "detailed",
            "intricate",
            "photorealistic",
            "realistic",
            "professional",
            "masterpiece",
        ],
    ),
    (
        Category::Composition,
        &["complex scene", "multiple subjects", "complex", "crowd", "panorama"],
    ),
    (
        Category::Intensity,
        &["pony", "dramatic", "cinematic", "epic", "hyper detailed"],
    ),
    (
        Category::Simplicity,
        &["simple", "basic", "quick", "sketch", "draft", "low quality"],
    ),
];

const NSFW_KEYWORDS: &[&str] = &[
    "nsfw", "nude", "naked", "adult", "erotic", "porn", "sex", "hentai", "anime girl", "waifu",
];

/// Result of classifying one prompt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Resource tier
    pub tier: Tier,
    /// Whether NSFW models are needed
    pub nsfw: bool,
    /// Image or video
    pub media: MediaKind,
    /// Cumulative score
    pub score: i32,
    /// Categories that contributed
    pub matched: Vec<Category>,
}

/// Map a score to its tier band
#[must_use]
pub fn tier_for_score(score: i32) -> Tier {
    if score >= ULTRA_THRESHOLD {
        Tier::Ultra
    } else if score >= MEDIUM_THRESHOLD {
        Tier::Medium
    } else {
        Tier::Basic
    }
}

fn tokenize(prompt: &str) -> Vec<String> {
    prompt
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    if words.is_empty() || words.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(words.len())
        .any(|window| window.iter().zip(&words).all(|(t, w)| t == w))
}

/// Stateless prompt classifier
#[derive(Clone, Copy, Debug, Default)]
pub struct ComplexityClassifier;

impl ComplexityClassifier {
    /// Classify a prompt
    #[must_use]
    pub fn classify(&self, prompt: &str) -> Classification {
        let tokens = tokenize(prompt);

        let mut score = 0;
        let mut matched = Vec::new();
        for (category, keywords) in KEYWORDS {
            let hits = keywords
                .iter()
                .filter(|k| contains_phrase(&tokens, k))
                .count()
                .min(MAX_HITS_PER_CATEGORY);
            if hits > 0 {
                score += category.weight() * hits as i32;
                matched.push(*category);
            }
        }

        let nsfw = NSFW_KEYWORDS.iter().any(|k| contains_phrase(&tokens, k));
        let media = if matched.contains(&Category::Motion) {
            MediaKind::Video
        } else {
            MediaKind::Image
        };

        Classification {
            tier: tier_for_score(score),
            nsfw,
            media,
            score,
            matched,
        }
    }
}
