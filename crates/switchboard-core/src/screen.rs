//! Abuse filter: staged screening of inbound queries and outbound model
//! text.
//!
//! Stages 1–3 (structural, lexical, containment) run before any model
//! call and abort on failure. Stage 4 (output screening) runs over the
//! accumulating model output and degrades the stream instead of aborting
//! it: the first marker hit substitutes a generic refusal for the rest of
//! the segment and writes an audit record. False positives are tolerated
//! over false negatives throughout.

use regex::RegexSet;

use crate::errors::GatewayError;

/// Phrasings that try to override instructions. Case-insensitive; matched
/// against the raw query before containment.
const BUILTIN_BLOCKLIST: &[&str] = &[
    r"(?i)ignore\s+(all\s+|any\s+)?(previous|prior|above|earlier)\s+(instructions|prompts|rules)",
    r"(?i)disregard\s+(all\s+|any\s+)?(previous|prior|above|earlier|your)\s+(instructions|prompts|rules)",
    r"(?i)forget\s+(everything|all|your)\s+(instructions|rules|training)",
    r"(?i)you\s+are\s+now\s+(a|an|the|in)\b",
    r"(?i)pretend\s+(to\s+be|you\s+are)",
    r"(?i)act\s+as\s+(if\s+you|a\s+system|an?\s+admin|the\s+system)",
    r"(?i)(reveal|print|show|output|repeat)\s+(your|the)\s+(system\s+prompt|instructions|hidden|internal)",
    r"(?i)(reveal|dump|leak)\s+.{0,40}(secret|password|credential|api.?key)",
    r"(?i)developer\s+mode",
    r"(?i)jailbreak",
];

/// Markers whose appearance in model output indicates leaked internals or
/// unauthorized-data assertions.
const OUTPUT_MARKERS: &[&str] = &[
    r"(?i)</?\s*user-query",
    r"(?i)my\s+(system\s+prompt|instructions)\s+(is|are|say)",
    r"(?i)begin\s+internal\s+instructions",
    r"(?i)here\s+(is|are)\s+(my|the)\s+(system\s+prompt|hidden\s+instructions)",
    r"(?i)i\s+have\s+(admin|root|unrestricted)\s+access",
];

/// Substituted for the remainder of a tainted output segment.
const REFUSAL_NOTICE: &str =
    "\n[The remainder of this response was withheld by the content screen.]";

/// Delimiters the model is told bound untrusted user input.
const CONTAIN_OPEN: &str = "<user-query>";
const CONTAIN_CLOSE: &str = "</user-query>";

/// A query that passed stages 1–3 and is wrapped in the containment
/// boundary. Only this type reaches the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainedQuery(String);

impl ContainedQuery {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Compiled input/output screens. Built once at startup and shared.
pub struct AbuseFilter {
    blocklist: RegexSet,
    markers: RegexSet,
    escape: regex::Regex,
    max_chars: usize,
}

impl AbuseFilter {
    /// Compile the built-in patterns plus deployment-specific extras.
    pub fn new(extra_blocklist: &[String], max_chars: usize) -> Result<Self, regex::Error> {
        let patterns: Vec<&str> = BUILTIN_BLOCKLIST
            .iter()
            .copied()
            .chain(extra_blocklist.iter().map(String::as_str))
            .collect();
        Ok(Self {
            blocklist: RegexSet::new(patterns)?,
            markers: RegexSet::new(OUTPUT_MARKERS)?,
            escape: regex::Regex::new(r"(?i)<(/?)\s*user-query")?,
            max_chars,
        })
    }

    /// Stages 1–3. Failures abort before any model call.
    pub fn screen_input(&self, raw: &str) -> Result<ContainedQuery, GatewayError> {
        // Stage 1: structural.
        if raw.trim().is_empty() {
            return Err(GatewayError::abuse(
                "structural",
                "query must not be empty",
                "empty input",
            ));
        }
        let char_count = raw.chars().count();
        if char_count > self.max_chars {
            return Err(GatewayError::abuse(
                "structural",
                "query exceeds the maximum length",
                format!("{} chars > ceiling {}", char_count, self.max_chars),
            ));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            return Err(GatewayError::abuse(
                "structural",
                "query contains disallowed control characters",
                format!("control character U+{:04X}", bad as u32),
            ));
        }

        // Stage 2: lexical. The public message stays generic; the matched
        // pattern index goes to the audit log only.
        let hits = self.blocklist.matches(raw);
        if hits.matched_any() {
            let indexes: Vec<usize> = hits.iter().collect();
            return Err(GatewayError::abuse(
                "lexical",
                "blocked by content policy",
                format!("blocklist patterns {:?}", indexes),
            ));
        }

        // Stage 3: containment. Delimiter-like sequences already present
        // are escaped so the model cannot be handed a forged boundary.
        let escaped = self.escape.replace_all(raw, "&lt;${1}user-query");
        Ok(ContainedQuery(format!(
            "{}\n{}\n{}",
            CONTAIN_OPEN, escaped, CONTAIN_CLOSE
        )))
    }

    /// Fresh stage-4 screen for one output segment (text between tool
    /// boundaries, or the final answer).
    pub fn output_screen(&self) -> OutputScreen {
        OutputScreen {
            markers: self.markers.clone(),
            accumulated: String::new(),
            tainted: false,
        }
    }
}

/// What the stream driver should do with one observed delta.
#[derive(Debug, PartialEq, Eq)]
pub enum OutputAction {
    /// Forward the delta unchanged.
    Forward,
    /// First marker hit: drop the delta, emit the refusal notice instead.
    Substitute(&'static str),
    /// Segment already tainted: drop silently.
    Suppress,
}

/// Accumulating screen over one output segment.
pub struct OutputScreen {
    markers: RegexSet,
    accumulated: String,
    tainted: bool,
}

impl OutputScreen {
    /// Observe one model delta and decide its fate. Matching runs over
    /// the accumulated segment so markers split across deltas still hit.
    pub fn observe(&mut self, delta: &str) -> OutputAction {
        if self.tainted {
            return OutputAction::Suppress;
        }
        self.accumulated.push_str(delta);
        if self.markers.is_match(&self.accumulated) {
            self.tainted = true;
            return OutputAction::Substitute(REFUSAL_NOTICE);
        }
        OutputAction::Forward
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }
}
