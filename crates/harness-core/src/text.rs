//! Query normalisation and term analysis.
//!
//! The same analyser runs when chunks are imported and when queries are
//! parsed, so sparse scoring compares like with like.

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "before", "being", "between", "both", "but", "by", "can", "could", "did", "do",
    "does", "doing", "during", "each", "for", "from", "had", "has", "have", "having", "he",
    "her", "here", "hers", "him", "his", "how", "if", "in", "into", "is", "it", "its", "itself",
    "may", "me", "might", "more", "most", "my", "no", "nor", "not", "of", "off", "on", "once",
    "only", "or", "other", "our", "out", "over", "own", "same", "she", "should", "so", "some",
    "such", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "through", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what",
    "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you",
    "your",
];

/// Species synonyms mapped to their canonical tag.
const SPECIES_SYNONYMS: &[(&str, &str)] = &[
    ("dog", "dog"),
    ("canine", "dog"),
    ("puppy", "dog"),
    ("cat", "cat"),
    ("feline", "cat"),
    ("kitten", "cat"),
    ("horse", "horse"),
    ("equine", "horse"),
    ("foal", "horse"),
    ("cattle", "cattle"),
    ("bovine", "cattle"),
    ("cow", "cattle"),
    ("calf", "cattle"),
    ("sheep", "sheep"),
    ("ovine", "sheep"),
    ("pig", "pig"),
    ("porcine", "pig"),
    ("swine", "pig"),
    ("rabbit", "rabbit"),
    ("ferret", "ferret"),
    ("bird", "bird"),
    ("avian", "bird"),
];

/// Lowercase, collapse whitespace, and trim trailing sentence punctuation.
pub fn normalize(raw: &str) -> String {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| matches!(c, '?' | '!' | '.') || c.is_whitespace())
        .to_string()
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// Strip common English plural endings.
pub fn stem(token: &str) -> String {
    let len = token.chars().count();
    if len > 4 && token.ends_with("ies") {
        return format!("{}y", &token[..token.len() - 3]);
    }
    if len > 3
        && token.ends_with('s')
        && !token.ends_with("ss")
        && !token.ends_with("us")
        && !token.ends_with("is")
    {
        return token[..token.len() - 1].to_string();
    }
    token.to_string()
}

/// Tokenise into lowercase, stemmed, non-stop-word terms (with repeats).
pub fn analyze(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() >= 2 && !is_stop_word(t))
        .map(|t| stem(&t))
        .collect()
}

/// Canonical species mentioned in `text`, in first-seen order.
pub fn detect_species(text: &str) -> Vec<&'static str> {
    let mut found: Vec<&'static str> = Vec::new();
    for term in analyze(text) {
        if let Some((_, canonical)) = SPECIES_SYNONYMS.iter().find(|(syn, _)| *syn == term) {
            if !found.contains(canonical) {
                found.push(canonical);
            }
        }
    }
    found
}

/// Canonical tag for a species name, if known.
pub fn canonical_species(name: &str) -> Option<&'static str> {
    let term = stem(&name.trim().to_lowercase());
    SPECIES_SYNONYMS
        .iter()
        .find(|(syn, _)| *syn == term)
        .map(|(_, canonical)| *canonical)
}
