use crate::types::{Candidate, KeywordTarget, ScoredCandidate};

/// Run-level acceptance threshold used when none is configured.
pub const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.85;

/// Phrases indicating the image shows an object or garment rather than a character.
const NON_SUBJECT_LEXICON: &[&str] = &[
    "mannequin",
    "outfit only",
    "clothing only",
    "garment only",
    "flat lay",
    "flatlay",
    "fabric",
    "textile",
    "sewing pattern",
    "seamless pattern",
    "pattern design",
    "wallpaper pattern",
    "logo design",
    "template",
    "mockup",
    "mock-up",
    "hanger",
    "product shot",
];

const CHARACTER_LEXICON: &[&str] = &[
    "character",
    "person",
    "girl",
    "boy",
    "woman",
    "man",
    "portrait",
    "face",
    "body",
    "full body",
    "pose",
    "posing",
    "standing",
    "sitting",
    "expression",
    "smile",
    "smiling",
    "illustration",
    "fanart",
];

const NEAR_SQUARE_MIN: f32 = 0.75;
const NEAR_SQUARE_MAX: f32 = 1.33;
const MODERATE_MIN_SIDE: u32 = 300;
const MODERATE_MAX_SIDE: u32 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    Veto,
    Bonus,
}

#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    /// Any phrase of the lexicon occurs as whole words in the searchable text.
    Lexicon(&'static [&'static str]),
    /// The keyword occurs as whole words.
    Keyword,
    Category,
    Subcategory,
    /// Width and height metadata describe a near-square image.
    NearSquare,
    /// Width and height metadata fall into a moderate size bracket.
    ModerateSize,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub matcher: Matcher,
    pub weight: f32,
    pub mode: RuleMode,
}

/// Evaluated top to bottom. Veto rules come first.
pub const RULES: &[Rule] = &[
    Rule {
        name: "non_subject",
        matcher: Matcher::Lexicon(NON_SUBJECT_LEXICON),
        weight: 0.0,
        mode: RuleMode::Veto,
    },
    Rule {
        name: "character_terms",
        matcher: Matcher::Lexicon(CHARACTER_LEXICON),
        weight: 0.05,
        mode: RuleMode::Bonus,
    },
    Rule {
        name: "exact_keyword",
        matcher: Matcher::Keyword,
        weight: 0.05,
        mode: RuleMode::Bonus,
    },
    Rule {
        name: "category",
        matcher: Matcher::Category,
        weight: 0.03,
        mode: RuleMode::Bonus,
    },
    Rule {
        name: "subcategory",
        matcher: Matcher::Subcategory,
        weight: 0.03,
        mode: RuleMode::Bonus,
    },
    Rule {
        name: "near_square",
        matcher: Matcher::NearSquare,
        weight: 0.02,
        mode: RuleMode::Bonus,
    },
    Rule {
        name: "moderate_size",
        matcher: Matcher::ModerateSize,
        weight: 0.02,
        mode: RuleMode::Bonus,
    },
];

/// Scores candidates against a keyword with a fixed rule table.
#[derive(Debug, Clone, Copy)]
pub struct RelevanceScorer {
    threshold: f32,
    rules: &'static [Rule],
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        Self::new(DEFAULT_RELEVANCE_THRESHOLD)
    }
}

impl RelevanceScorer {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            rules: RULES,
        }
    }

    pub fn score(&self, candidate: &Candidate, target: &KeywordTarget) -> ScoredCandidate {
        let haystack = searchable_text(candidate);

        let mut score = target.relevance_threshold;

        for rule in self.rules {
            if !matches(rule.matcher, &haystack, candidate, target) {
                continue;
            }
            match rule.mode {
                RuleMode::Veto => {
                    return ScoredCandidate {
                        candidate: candidate.clone(),
                        relevance_score: 0.0,
                        accepted: false,
                        vetoed_by: Some(rule.name),
                    };
                }
                RuleMode::Bonus => score += rule.weight,
            }
        }

        let score = score.clamp(0.0, 1.0);
        ScoredCandidate {
            candidate: candidate.clone(),
            relevance_score: score,
            accepted: score >= self.threshold,
            vetoed_by: None,
        }
    }
}

/// Lowercased words of `text`, space-joined and space-padded so that a phrase
/// only matches whole words.
fn word_text(text: &str) -> String {
    let mut out = String::from(" ");
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        out.push_str(&word.to_lowercase());
        out.push(' ');
    }
    out
}

/// File name, alt text and URL of a candidate. Inline `data:` payloads are
/// base64 noise and are left out.
fn searchable_text(candidate: &Candidate) -> String {
    if candidate.source_url.starts_with("data:") {
        return word_text(&candidate.alt_text);
    }
    word_text(&format!(
        "{} {} {}",
        candidate.file_name(),
        candidate.alt_text,
        candidate.source_url
    ))
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let phrase = word_text(phrase);
    phrase.len() > 1 && haystack.contains(&phrase)
}

fn matches(matcher: Matcher, haystack: &str, candidate: &Candidate, target: &KeywordTarget) -> bool {
    match matcher {
        Matcher::Lexicon(terms) => terms.iter().any(|t| contains_phrase(haystack, t)),
        Matcher::Keyword => contains_phrase(haystack, &target.keyword),
        Matcher::Category => contains_phrase(haystack, &target.category),
        Matcher::Subcategory => contains_phrase(haystack, &target.subcategory),
        Matcher::NearSquare => match (candidate.width, candidate.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let ratio = w as f32 / h as f32;
                (NEAR_SQUARE_MIN..=NEAR_SQUARE_MAX).contains(&ratio)
            }
            _ => false,
        },
        Matcher::ModerateSize => match (candidate.width, candidate.height) {
            (Some(w), Some(h)) => w.min(h) >= MODERATE_MIN_SIDE && w.max(h) <= MODERATE_MAX_SIDE,
            _ => false,
        },
    }
}
