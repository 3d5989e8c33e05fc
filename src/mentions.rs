//! `@token` extraction and resolution against a participant directory.
//!
//! Grounded in `original_source/coordinator.py`'s `_extract_mentions`,
//! `_build_participant_index`, `_resolve_mentions`, and
//! `_participant_display` — re-expressed as typed Rust rather than
//! translated line-for-line.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Reserved mention tokens that address "everyone" and are therefore
/// rejected rather than resolved.
const RESERVED_WORDS: &[&str] = &["all", "everyone", "here"];

/// Trailing punctuation stripped from a raw `@token` before matching.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ':', ';', '!', '?', ')', ']', '}', '"', '\''];

/// One entry in the participant directory: a configured agent or the
/// coordinator itself, enriched with whatever profile fields are known.
#[derive(Debug, Clone, Default)]
pub struct Participant {
    pub id: String,
    pub nickname: Option<String>,
    pub roles: Vec<String>,
    pub client: Option<String>,
    pub model: Option<String>,
}

impl Participant {
    /// Human-readable label used in ambiguity notices: `nickname
    /// (client/model)`, falling back to whichever of client/model is
    /// present, or just the nickname, or the bare id.
    pub fn display(&self) -> String {
        let name = self.nickname.clone().unwrap_or_else(|| self.id.clone());
        match (&self.client, &self.model) {
            (Some(client), Some(model)) => format!("{name} ({client}/{model})"),
            (Some(client), None) => format!("{name} ({client})"),
            (None, Some(model)) => format!("{name} ({model})"),
            (None, None) => name,
        }
    }
}

/// The known participants of a thread at dispatch time: configured agents
/// unioned with whoever currently has presence in the thread.
#[derive(Debug, Clone, Default)]
pub struct ParticipantDirectory {
    participants: Vec<Participant>,
}

impl ParticipantDirectory {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self { participants }
    }

    fn by_exact_id(&self, token: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.id.to_lowercase() == token)
    }

    fn by_nickname(&self, token: &str) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| {
                p.nickname
                    .as_deref()
                    .map(|n| n.to_lowercase() == token)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn by_category(&self, token: &str) -> Vec<&Participant> {
        self.participants
            .iter()
            .filter(|p| {
                p.roles.iter().any(|r| r.to_lowercase() == token)
                    || p.client.as_deref().map(|c| c.to_lowercase() == token).unwrap_or(false)
                    || p.model.as_deref().map(|m| m.to_lowercase() == token).unwrap_or(false)
            })
            .collect()
    }
}

/// Extract the mention set from `content`: every token beginning with
/// `prefix`, trailing punctuation stripped, lowercased. Returned in sorted
/// order for deterministic downstream processing.
pub fn extract_mentions(content: &str, prefix: &str) -> BTreeSet<String> {
    if prefix.is_empty() {
        return BTreeSet::new();
    }
    let mut mentions = BTreeSet::new();
    for word in content.split_whitespace() {
        if let Some(rest) = word.strip_prefix(prefix) {
            let trimmed = rest.trim_end_matches(TRAILING_PUNCTUATION);
            if !trimmed.is_empty() {
                mentions.insert(trimmed.to_lowercase());
            }
        }
    }
    mentions
}

/// Outcome of resolving a mention set against a [`ParticipantDirectory`].
#[derive(Debug, Default)]
pub struct ResolvedMentions {
    /// Participant ids to actually dispatch to.
    pub target_ids: HashSet<String>,
    /// Ambiguous nickname -> candidate participants, for the notice message.
    pub ambiguous: HashMap<String, Vec<Participant>>,
    /// Reserved words that were used (e.g. `@all`), for the notice message.
    pub reserved_hits: BTreeSet<String>,
}

/// Resolve every token in `mentions` against `directory`.
///
/// Precedence per token: reserved word, then exact id, then unique
/// nickname (ambiguous if multiple), then role/client/model category
/// union. `self_id` is filtered out of the final target set to prevent
/// self-wake loops.
pub fn resolve_mentions(
    mentions: &BTreeSet<String>,
    directory: &ParticipantDirectory,
    self_id: &str,
) -> ResolvedMentions {
    let mut resolved = ResolvedMentions::default();

    for token in mentions {
        if RESERVED_WORDS.contains(&token.as_str()) {
            resolved.reserved_hits.insert(token.clone());
            continue;
        }
        if let Some(participant) = directory.by_exact_id(token) {
            resolved.target_ids.insert(participant.id.clone());
            continue;
        }
        let nickname_matches = directory.by_nickname(token);
        if nickname_matches.len() == 1 {
            resolved.target_ids.insert(nickname_matches[0].id.clone());
            continue;
        }
        if nickname_matches.len() > 1 {
            resolved.ambiguous.insert(
                token.clone(),
                nickname_matches.into_iter().cloned().collect(),
            );
            continue;
        }
        for participant in directory.by_category(token) {
            resolved.target_ids.insert(participant.id.clone());
        }
    }

    resolved
        .target_ids
        .retain(|id| !id.eq_ignore_ascii_case(self_id));

    resolved
}

/// Render the `id — display` lines used in an ambiguity notice.
pub fn format_ambiguity_candidates(candidates: &[Participant]) -> String {
    candidates
        .iter()
        .map(|p| format!("{} — {}", p.id, p.display()))
        .collect::<Vec<_>>()
        .join(", ")
}
