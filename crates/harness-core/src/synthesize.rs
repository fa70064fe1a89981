//! Answer synthesis with cite-while-generate discipline.
//!
//! The [`PromptBuilder`] labels every evidence chunk with a stable citation
//! token `[n]` (its rank position). The generated text is split into
//! sentence claims; tokens that do not resolve to supplied evidence are
//! dropped, and claims left without any resolvable token are stripped
//! before the factuality gate ever sees them.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use crate::error::{AskError, BackendError};
use crate::models::{Answer, Citation, Claim, Query, RankedEvidence, Span};

static CITATION_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*\d+(?:\s*[-–]\s*\d+)?(?:\s*,\s*\d+(?:\s*[-–]\s*\d+)?)*\s*\]")
        .expect("citation token pattern is valid")
});

static LEADING_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\s*\[\s*\d+(?:\s*[-–]\s*\d+)?(?:\s*,\s*\d+(?:\s*[-–]\s*\d+)?)*\s*\])+")
        .expect("leading token pattern is valid")
});

static REFERENCE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*(?:#+\s*)?(?:\*\*|__)?\s*(?:references|sources|citations?|bibliography)\s*(?::|(?:\*\*|__)?\s*:?\s*$)",
    )
    .expect("reference header pattern is valid")
});

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]\s+|\d+[.)]\s+)").expect("bullet pattern is valid"));

const ABBREVIATIONS: &[&str] = &["e.g", "i.e", "al", "approx", "vs", "spp", "sp", "dr", "fig", "ca"];

/// Upper bound on numbers expanded from one `[a-b]` range.
const MAX_RANGE: usize = 20;

/// A generation prompt split into system and user parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Builds model-specific prompts from ranked evidence.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, query: &Query, evidence: &[RankedEvidence]) -> Prompt;
}

/// Generation model endpoint.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(
        &self,
        prompt: &Prompt,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, BackendError>;
}

/// Default prompt layout: numbered evidence blocks with bibliographic headers.
#[derive(Debug, Clone)]
pub struct NumberedEvidencePromptBuilder {
    pub max_chars_per_chunk: usize,
}

impl Default for NumberedEvidencePromptBuilder {
    fn default() -> Self {
        Self {
            max_chars_per_chunk: 1500,
        }
    }
}

impl PromptBuilder for NumberedEvidencePromptBuilder {
    fn build(&self, query: &Query, evidence: &[RankedEvidence]) -> Prompt {
        let system = "You are a veterinary clinical evidence assistant. Answer only from the \
numbered evidence provided. End every factual sentence with the bracketed number of each \
evidence passage that supports it, for example [1] or [2, 3]. Do not cite numbers that are not \
listed. If the evidence does not answer the question, say so in one sentence without citations."
            .to_string();

        let mut user = format!("Question: {}\n\nEvidence:\n", query.raw_text.trim());
        for ev in evidence {
            let meta = &ev.chunk.source_metadata;
            let mut header = format!("[{}] {}", ev.rank_position, meta.title);
            if let Some(year) = meta.year {
                header.push_str(&format!(" ({year})"));
            }
            if let Some(doi) = &meta.doi {
                header.push_str(&format!(" doi:{doi}"));
            }
            let body: String = ev.chunk.text.chars().take(self.max_chars_per_chunk).collect();
            user.push_str(&header);
            user.push('\n');
            user.push_str(body.trim());
            user.push_str("\n\n");
        }
        user.push_str("Answer:");

        Prompt { system, user }
    }
}

/// Sampling parameters passed to the generator.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.2,
        }
    }
}

pub struct Synthesizer {
    prompt_builder: Arc<dyn PromptBuilder>,
    params: GenerationParams,
}

impl Synthesizer {
    pub fn new(prompt_builder: Arc<dyn PromptBuilder>, params: GenerationParams) -> Self {
        Self {
            prompt_builder,
            params,
        }
    }

    /// Generate an answer grounded in `evidence`.
    pub async fn synthesize(
        &self,
        generator: &dyn Generator,
        query: &Query,
        evidence: &[RankedEvidence],
    ) -> Result<Answer, AskError> {
        let prompt = self.prompt_builder.build(query, evidence);
        let raw = generator
            .generate(&prompt, self.params.max_tokens, self.params.temperature)
            .await
            .map_err(|e| match e {
                BackendError::Timeout => AskError::GenerationTimeout,
                other => AskError::GenerationUnavailable(other.to_string()),
            })?;

        let answer = build_answer(&raw, evidence, &query.trace_id);
        if answer.stripped_claims > 0 {
            tracing::warn!(
                trace_id = %query.trace_id,
                stripped = answer.stripped_claims,
                kept = answer.claims.len(),
                "stripped uncited claims from generated answer"
            );
        }
        Ok(answer)
    }
}

/// A sentence of generated text with the raw citation numbers it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSentence {
    pub text: String,
    pub cited: Vec<usize>,
}

/// Parse generated text into an [`Answer`] whose citations all resolve
/// into `evidence`.
pub fn build_answer(raw: &str, evidence: &[RankedEvidence], trace_id: &str) -> Answer {
    let body = strip_reference_section(raw);

    let mut claims: Vec<Claim> = Vec::new();
    let mut citations: Vec<Citation> = Vec::new();
    let mut stripped = 0usize;
    let mut text = String::new();

    for sentence in split_sentences(body) {
        if !is_claim(&sentence.text) {
            continue;
        }

        let resolved: Vec<usize> = sentence
            .cited
            .iter()
            .copied()
            .filter(|n| evidence.iter().any(|ev| ev.rank_position == *n))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if resolved.is_empty() {
            stripped += 1;
            continue;
        }

        let display = with_citation_marker(&sentence.text, &resolved);
        if !text.is_empty() {
            text.push(' ');
        }
        let span = Span {
            start: text.len(),
            end: text.len() + display.len(),
        };
        text.push_str(&display);

        for n in &resolved {
            if let Some(ev) = evidence.iter().find(|ev| ev.rank_position == *n) {
                let meta = &ev.chunk.source_metadata;
                citations.push(Citation {
                    chunk_id: ev.chunk.id.clone(),
                    document_id: ev.chunk.document_id.clone(),
                    rank_position: *n,
                    claim_span: span,
                    title: meta.title.clone(),
                    year: meta.year,
                    doi: meta.doi.clone(),
                });
            }
        }

        claims.push(Claim {
            text: sentence.text,
            span,
            citations: resolved,
        });
    }

    Answer {
        text,
        claims,
        citations,
        confidence: 0.0,
        trace_id: trace_id.to_string(),
        stripped_claims: stripped,
    }
}

/// Cut a trailing reference section. The header may be a Markdown
/// heading, bold, or plain text, with or without a colon.
pub fn strip_reference_section(raw: &str) -> &str {
    match REFERENCE_HEADER.find(raw) {
        Some(m) => &raw[..m.start()],
        None => raw,
    }
}

/// Split generated text into sentences, attaching citation tokens that
/// directly follow terminal punctuation to the preceding sentence.
pub fn split_sentences(text: &str) -> Vec<RawSentence> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = BULLET.replace(line.trim(), "");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for segment in split_line(line) {
            let cited = parse_tokens(segment);
            let cleaned = clean_sentence(segment);
            if !cleaned.is_empty() {
                out.push(RawSentence {
                    text: cleaned,
                    cited,
                });
            }
        }
    }
    out
}

fn split_line(line: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0usize;
    let bytes = line.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];
        if matches!(c, b'.' | b'!' | b'?') && !is_abbreviation(&line[start..i]) {
            let mut end = i + 1;
            if let Some(m) = LEADING_TOKENS.find(&line[end..]) {
                end += m.end();
            }
            let at_boundary = end >= bytes.len() || bytes[end].is_ascii_whitespace();
            let decimal = c == b'.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit());
            if at_boundary && !decimal {
                segments.push(line[start..end].trim());
                start = end;
                i = end;
                continue;
            }
        }
        i += 1;
    }
    if start < line.len() {
        let rest = line[start..].trim();
        if !rest.is_empty() {
            segments.push(rest);
        }
    }
    segments
}

fn is_abbreviation(before: &str) -> bool {
    let word = before
        .rsplit(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    if word.len() == 1 && word.chars().all(|c| c.is_ascii_uppercase()) {
        return true;
    }
    let lower = word.to_lowercase();
    ABBREVIATIONS.contains(&lower.as_str())
}

/// All citation numbers inside bracketed tokens, in order.
pub fn parse_tokens(text: &str) -> Vec<usize> {
    let mut out = Vec::new();
    for m in CITATION_TOKEN.find_iter(text) {
        let inner = m.as_str().trim_start_matches('[').trim_end_matches(']');
        for part in inner.split(',') {
            let part = part.trim();
            let bounds: Vec<&str> = part.split(['-', '–']).map(str::trim).collect();
            match bounds.as_slice() {
                [single] => {
                    if let Ok(n) = single.parse::<usize>() {
                        out.push(n);
                    }
                }
                [lo, hi] => {
                    if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                        if lo <= hi && hi - lo < MAX_RANGE {
                            out.extend(lo..=hi);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    out
}

fn clean_sentence(segment: &str) -> String {
    let without = CITATION_TOKEN.replace_all(segment, "");
    let collapsed = without.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .replace(" .", ".")
        .replace(" ,", ",")
        .replace(" ;", ";")
        .replace(" !", "!")
        .trim()
        .to_string()
}

/// Declarative sentences of at least three words; questions and headings
/// are not claims.
fn is_claim(sentence: &str) -> bool {
    let trimmed = sentence.trim();
    if trimmed.ends_with('?') || trimmed.ends_with(':') {
        return false;
    }
    trimmed.split_whitespace().count() >= 3
}

fn with_citation_marker(sentence: &str, cited: &[usize]) -> String {
    let marker = format!(
        "[{}]",
        cited
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    match sentence.char_indices().last() {
        Some((idx, c)) if matches!(c, '.' | '!') => {
            format!("{} {}{}", &sentence[..idx], marker, c)
        }
        _ => format!("{sentence} {marker}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, SourceMetadata};

    fn evidence(n: usize) -> Vec<RankedEvidence> {
        (1..=n)
            .map(|i| RankedEvidence {
                chunk: Arc::new(Chunk::new(
                    format!("chunk-{i}"),
                    format!("doc-{i}"),
                    format!("evidence text {i}"),
                    SourceMetadata {
                        title: format!("Paper {i}"),
                        year: Some(2020 + i as i32),
                        doi: Some(format!("10.1000/{i}")),
                        ..Default::default()
                    },
                )),
                rerank_score: 1.0 / i as f64,
                fused_score: 0.5,
                rank_position: i,
            })
            .collect()
    }

    #[test]
    fn test_parse_tokens_variants() {
        assert_eq!(parse_tokens("a [1] b [2, 3] c [4-6] d [7][8]"), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(parse_tokens("no tokens [a] here").is_empty());
        assert!(parse_tokens("[1-500]").is_empty());
    }

    #[test]
    fn test_split_handles_trailing_tokens_and_decimals() {
        let sentences = split_sentences(
            "The dose is 2.5 mg/kg [1]. B. bronchiseptica is common. [2] Isolation helps [3].",
        );
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].text, "The dose is 2.5 mg/kg.");
        assert_eq!(sentences[0].cited, vec![1]);
        assert_eq!(sentences[1].text, "B. bronchiseptica is common.");
        assert_eq!(sentences[1].cited, vec![2]);
        assert_eq!(sentences[2].cited, vec![3]);
    }

    #[test]
    fn test_split_handles_bullets_and_abbreviations() {
        let sentences =
            split_sentences("- Signs include cough, e.g. honking cough [1].\n- Fever may occur [2].");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].text, "Signs include cough, e.g. honking cough.");
    }

    #[test]
    fn test_build_answer_strips_uncited_and_unresolvable_claims() {
        let raw = "Kennel cough is caused by Bordetella bronchiseptica [1]. \
                   It is always fatal in puppies. \
                   Parainfluenza virus is also involved [9]. \
                   Vaccination reduces disease severity [2, 9].";
        let answer = build_answer(raw, &evidence(2), "t-1");
        assert_eq!(answer.claims.len(), 2);
        assert_eq!(answer.stripped_claims, 2);
        assert_eq!(answer.claims[1].citations, vec![2]);
        assert!(answer.citations.iter().all(|c| c.rank_position <= 2));
        assert_eq!(
            answer.text,
            "Kennel cough is caused by Bordetella bronchiseptica [1]. \
             Vaccination reduces disease severity [2]."
        );
    }

    #[test]
    fn test_claim_spans_index_answer_text() {
        let answer = build_answer("First cited claim here [1]. Second cited claim here [2].", &evidence(2), "t");
        for claim in &answer.claims {
            let slice = &answer.text[claim.span.start..claim.span.end];
            assert!(slice.starts_with(&claim.text[..5]));
        }
        assert_eq!(answer.citations[1].claim_span, answer.claims[1].span);
        assert_eq!(answer.citations[1].chunk_id, "chunk-2");
    }

    #[test]
    fn test_reference_section_is_ignored() {
        let raw = "Bordetella is the primary agent of kennel cough [1].\n\nReferences:\n[1] Paper 1 (2021).";
        let answer = build_answer(raw, &evidence(1), "t");
        assert_eq!(answer.claims.len(), 1);
        assert_eq!(answer.stripped_claims, 0);
    }

    #[test]
    fn test_reference_header_variants_are_stripped() {
        let headers = [
            "References:",
            "## References",
            "**References:**",
            "**References**:",
            "__Sources__",
            "Sources",
            "### Citations",
            "Bibliography",
        ];
        for header in headers {
            let raw = format!(
                "Bordetella is the primary agent of kennel cough [1].\n\n{header}\n\
                 Canine respiratory disease update (2023).\n"
            );
            let answer = build_answer(&raw, &evidence(1), "t");
            assert_eq!(answer.claims.len(), 1, "header {header:?}");
            assert_eq!(answer.stripped_claims, 0, "header {header:?}");
        }
    }

    #[test]
    fn test_sentence_starting_with_sources_is_a_claim() {
        let raw = "Sources of infection include shelters and kennels [1].";
        let answer = build_answer(raw, &evidence(1), "t");
        assert_eq!(answer.claims.len(), 1);
    }

    #[test]
    fn test_prompt_labels_evidence_by_rank() {
        let query = Query::new("What causes kennel cough?", "t").unwrap();
        let prompt = NumberedEvidencePromptBuilder::default().build(&query, &evidence(2));
        assert!(prompt.user.contains("[1] Paper 1 (2021) doi:10.1000/1"));
        assert!(prompt.user.contains("[2] Paper 2 (2022)"));
        assert!(prompt.user.starts_with("Question: What causes kennel cough?"));
    }

    struct FixedGenerator(Result<String, BackendError>);

    #[async_trait]
    impl Generator for FixedGenerator {
        fn model_name(&self) -> &str {
            "fixed"
        }
        async fn generate(&self, _: &Prompt, _: u32, _: f32) -> Result<String, BackendError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_generator_errors_map_to_stage_errors() {
        let synth = Synthesizer::new(
            Arc::new(NumberedEvidencePromptBuilder::default()),
            GenerationParams::default(),
        );
        let query = Query::new("q text here", "t").unwrap();

        let err = synth
            .synthesize(&FixedGenerator(Err(BackendError::Timeout)), &query, &evidence(1))
            .await
            .unwrap_err();
        assert_eq!(err, AskError::GenerationTimeout);

        let err = synth
            .synthesize(
                &FixedGenerator(Err(BackendError::unavailable("503"))),
                &query,
                &evidence(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "generation_unavailable");
    }
}
