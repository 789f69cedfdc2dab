//! Trigger-word detection over a live transcript stream.
//!
//! The listener is a plain synchronous struct owned by the engine task. It
//! decides whether a transcript segment opens a session; it never touches
//! session state itself.
//!
//! Matching is substring-based, case-insensitive and language-agnostic: the
//! segment is tested against the union of every configured language. After a
//! match the listener disarms until the engine reports that the session has
//! settled, so one utterance produces one `TriggerDetected`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::{CapabilityError, TranscriptEvent};
use crate::ipc::events::ErrorKind;

const BUILTIN_EN: &[&str] = &[
    "help",
    "emergency",
    "no",
    "stop",
    "danger",
    "please",
    "assist",
    "rescue",
    "urgent",
    "alert",
    "panic",
];

const BUILTIN_SW: &[&str] = &[
    "nisaidieni",
    "msaada",
    "hapana",
    "woooi",
    "hatari",
    "tusaidie",
    "okoa",
    "haraka",
    "tahadhari",
    "hofu",
];

// ---------------------------------------------------------------------------
// Word set
// ---------------------------------------------------------------------------

/// Language tag → ordered trigger words.
///
/// Serialises as a plain JSON object (`{"en": ["help"], "sw": ["msaada"]}`).
/// Tags and words are trimmed and lowercased on construction; empty entries
/// and per-language duplicates are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Vec<String>>",
    into = "BTreeMap<String, Vec<String>>"
)]
pub struct TriggerWordSet {
    languages: BTreeMap<String, Vec<String>>,
}

impl TriggerWordSet {
    pub fn new<L, W, S>(languages: L) -> Self
    where
        L: IntoIterator<Item = (S, W)>,
        W: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (tag, words) in languages {
            let tag = tag.as_ref().trim().to_lowercase();
            if tag.is_empty() {
                continue;
            }
            let list = out.entry(tag).or_default();
            for word in words {
                let word = word.as_ref().trim().to_lowercase();
                if !word.is_empty() && !list.contains(&word) {
                    list.push(word);
                }
            }
        }
        out.retain(|_, words| !words.is_empty());
        Self { languages: out }
    }

    /// English and Swahili defaults.
    pub fn builtin() -> Self {
        Self::new([("en", BUILTIN_EN.to_vec()), ("sw", BUILTIN_SW.to_vec())])
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.languages.keys().map(String::as_str)
    }

    pub fn words(&self, language: &str) -> &[String] {
        self.languages
            .get(language)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Total number of words across languages.
    pub fn len(&self) -> usize {
        self.languages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }

    /// First `(language, word)` contained in `text`.
    ///
    /// `text` must already be lowercased. Languages are tried in tag order,
    /// words in configured order.
    pub fn find_match(&self, text: &str) -> Option<(&str, &str)> {
        self.languages.iter().find_map(|(language, words)| {
            words
                .iter()
                .find(|w| text.contains(w.as_str()))
                .map(|w| (language.as_str(), w.as_str()))
        })
    }
}

impl Default for TriggerWordSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl From<BTreeMap<String, Vec<String>>> for TriggerWordSet {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        Self::new(map)
    }
}

impl From<TriggerWordSet> for BTreeMap<String, Vec<String>> {
    fn from(set: TriggerWordSet) -> Self {
        set.languages
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// A match produced by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDetected {
    /// Normalised segment text.
    pub matched_text: String,
    pub word: String,
    pub language: String,
}

#[derive(Debug)]
pub struct TriggerListener {
    words: TriggerWordSet,
    listening: bool,
    armed: bool,
    failure_reported: bool,
}

impl TriggerListener {
    pub fn new(words: TriggerWordSet) -> Self {
        Self {
            words,
            listening: false,
            armed: true,
            failure_reported: false,
        }
    }

    /// Begin accepting transcript segments with `words`.
    pub fn start(&mut self, words: TriggerWordSet) {
        info!(
            languages = words.languages.len(),
            words = words.len(),
            "trigger listener started"
        );
        self.words = words;
        self.listening = true;
        self.failure_reported = false;
    }

    pub fn stop(&mut self) {
        if self.listening {
            info!("trigger listener stopped");
        }
        self.listening = false;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn words(&self) -> &TriggerWordSet {
        &self.words
    }

    /// Feed one transcript segment. Interim and final segments are treated
    /// alike. A stopped listener ignores everything.
    pub fn on_event(&mut self, event: &TranscriptEvent) -> Option<TriggerDetected> {
        if !self.listening {
            return None;
        }
        self.detect(&event.text)
    }

    /// Same matching path as `on_event`, without requiring a live source.
    pub fn on_simulated(&mut self, text: &str) -> Option<TriggerDetected> {
        self.detect(text)
    }

    /// The current session finished (or was cancelled); accept the next match.
    pub fn session_settled(&mut self) {
        if !self.armed {
            debug!("trigger listener re-armed");
        }
        self.armed = true;
    }

    /// The transcript source failed. Returns the kind to publish the first
    /// time, `None` afterwards. The listener stays stopped either way.
    pub fn on_failure(&mut self, err: CapabilityError) -> Option<ErrorKind> {
        self.listening = false;
        if self.failure_reported {
            return None;
        }
        self.failure_reported = true;
        warn!("transcript source failed: {err}");
        Some(err.kind())
    }

    fn detect(&mut self, text: &str) -> Option<TriggerDetected> {
        let normalised = text.trim().to_lowercase();
        if normalised.is_empty() {
            return None;
        }
        let (language, word) = self.words.find_match(&normalised)?;
        if !self.armed {
            debug!(word, "trigger suppressed until session settles");
            return None;
        }
        let detected = TriggerDetected {
            word: word.to_string(),
            language: language.to_string(),
            matched_text: normalised,
        };
        self.armed = false;
        info!(
            word = %detected.word,
            language = %detected.language,
            "trigger word detected"
        );
        Some(detected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn en_sw() -> TriggerWordSet {
        TriggerWordSet::new([("en", vec!["help"]), ("sw", vec!["msaada"])])
    }

    fn listening(words: TriggerWordSet) -> TriggerListener {
        let mut listener = TriggerListener::new(words.clone());
        listener.start(words);
        listener
    }

    fn segment(text: &str) -> TranscriptEvent {
        TranscriptEvent::new(text, true)
    }

    #[test]
    fn matches_case_insensitively_across_languages() {
        let mut listener = listening(en_sw());
        let hit = listener.on_event(&segment("HELP ME")).expect("english match");
        assert_eq!(hit.word, "help");
        assert_eq!(hit.language, "en");
        assert_eq!(hit.matched_text, "help me");

        listener.session_settled();
        let hit = listener
            .on_event(&segment("  Tuma Msaada  "))
            .expect("swahili match");
        assert_eq!(hit.word, "msaada");
        assert_eq!(hit.language, "sw");
    }

    #[test]
    fn one_detection_until_session_settles() {
        let mut listener = listening(en_sw());
        assert!(listener.on_event(&segment("help")).is_some());
        assert!(listener.on_event(&segment("help help")).is_none());
        assert!(listener.on_event(&segment("msaada")).is_none());
        assert!(!listener.is_armed());

        listener.session_settled();
        assert!(listener.on_event(&segment("help")).is_some());
    }

    #[test]
    fn interim_segments_also_match() {
        let mut listener = listening(en_sw());
        let interim = TranscriptEvent::new("please help", false);
        assert!(listener.on_event(&interim).is_some());
    }

    #[test]
    fn stopped_listener_ignores_segments_but_simulation_still_matches() {
        let mut listener = TriggerListener::new(en_sw());
        assert!(listener.on_event(&segment("help")).is_none());
        assert!(listener.on_simulated("help").is_some());
    }

    #[test]
    fn non_matching_text_keeps_listener_armed() {
        let mut listener = listening(en_sw());
        assert!(listener.on_event(&segment("good morning")).is_none());
        assert!(listener.on_event(&segment("")).is_none());
        assert!(listener.is_armed());
    }

    #[test]
    fn failure_is_reported_once_and_stops_listening() {
        let mut listener = listening(en_sw());
        assert_eq!(
            listener.on_failure(CapabilityError::PermissionDenied),
            Some(ErrorKind::PermissionDenied)
        );
        assert!(!listener.is_listening());
        assert_eq!(listener.on_failure(CapabilityError::PermissionDenied), None);
        assert!(listener.on_event(&segment("help")).is_none());

        // An explicit restart clears the report.
        listener.start(en_sw());
        assert_eq!(
            listener.on_failure(CapabilityError::Unsupported),
            Some(ErrorKind::Unsupported)
        );
    }

    #[test]
    fn word_set_normalises_and_dedupes() {
        let set = TriggerWordSet::new([
            (" EN ", vec!["Help", "help ", "", "STOP"]),
            ("xx", vec!["  "]),
        ]);
        assert_eq!(set.languages().collect::<Vec<_>>(), vec!["en"]);
        assert_eq!(set.words("en"), ["help", "stop"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn builtin_set_covers_english_and_swahili() {
        let set = TriggerWordSet::builtin();
        assert_eq!(set.words("en").len(), 11);
        assert_eq!(set.words("sw").len(), 10);
        assert_eq!(set.find_match("nisaidieni tafadhali"), Some(("sw", "nisaidieni")));
    }

    #[test]
    fn word_set_round_trips_through_plain_json_object() {
        let json = serde_json::json!({ "en": ["Help"], "sw": ["msaada"] });
        let set: TriggerWordSet = serde_json::from_value(json).expect("deserialize");
        assert_eq!(set, en_sw());
        assert_eq!(
            serde_json::to_value(&set).expect("serialize"),
            serde_json::json!({ "en": ["help"], "sw": ["msaada"] })
        );
    }
}
