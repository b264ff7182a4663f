//! Line patterns and the per-stream transition table.
//!
//! A [`Pattern`] accepts or rejects a single line. An [`Automaton`] maps the
//! last pattern that matched on a stream (or the [`State::Start`] sentinel)
//! to the ordered list of patterns allowed on the next line.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;

static NEXT_PATTERN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Pattern`], shared by all of its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternId(u64);

impl PatternId {
    fn next() -> Self {
        Self(NEXT_PATTERN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum Test {
    Exact(String),
    Regex(Regex),
}

#[derive(Debug)]
struct Inner {
    id: PatternId,
    label: String,
    test: Test,
}

/// An immutable line acceptance test.
///
/// Cloning is cheap and keeps the identity: the automaton and the handler
/// table both key on [`Pattern::id`].
#[derive(Debug, Clone)]
pub struct Pattern(Arc<Inner>);

/// What a successful match hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutput {
    /// The pattern has no capture groups.
    Matched,
    /// Index 0 is the whole match; unmatched optional groups are empty.
    Captures(Vec<String>),
}

impl MatchOutput {
    pub fn captures(&self) -> Option<&[String]> {
        match self {
            Self::Matched => None,
            Self::Captures(groups) => Some(groups),
        }
    }
}

impl Pattern {
    /// A pattern accepting only the exact line `text`.
    pub fn exact(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_test(label.into(), Test::Exact(text.into()))
    }

    /// A pattern accepting lines matched by the regular expression `re`.
    pub fn regex(label: impl Into<String>, re: &str) -> Result<Self, regex::Error> {
        Ok(Self::with_test(label.into(), Test::Regex(Regex::new(re)?)))
    }

    fn with_test(label: String, test: Test) -> Self {
        Self(Arc::new(Inner {
            id: PatternId::next(),
            label,
            test,
        }))
    }

    pub fn id(&self) -> PatternId {
        self.0.id
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    /// The literal text or regex source, for diagnostics.
    pub fn source(&self) -> &str {
        match &self.0.test {
            Test::Exact(text) => text,
            Test::Regex(re) => re.as_str(),
        }
    }

    /// Whether a successful match yields captured groups.
    pub fn captures_groups(&self) -> bool {
        match &self.0.test {
            Test::Exact(_) => false,
            Test::Regex(re) => re.captures_len() > 1,
        }
    }

    /// Test a single line.
    pub fn test(&self, line: &str) -> Option<MatchOutput> {
        match &self.0.test {
            Test::Exact(text) => (text == line).then_some(MatchOutput::Matched),
            Test::Regex(re) if re.captures_len() > 1 => re.captures(line).map(|caps| {
                MatchOutput::Captures(
                    caps.iter()
                        .map(|group| group.map_or_else(String::new, |m| m.as_str().to_owned()))
                        .collect(),
                )
            }),
            Test::Regex(re) => re.is_match(line).then_some(MatchOutput::Matched),
        }
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.test {
            Test::Exact(text) => write!(f, "{} {:?}", self.label(), text),
            Test::Regex(re) => write!(f, "{} /{}/", self.label(), re.as_str()),
        }
    }
}

/// Position of a stream matcher in its automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Nothing has matched yet.
    Start,
    /// The last accepted line matched this pattern.
    After(PatternId),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::After(id) => write!(f, "after {id}"),
        }
    }
}

/// Transition table: state -> candidate patterns, tested in order.
#[derive(Debug, Clone, Default)]
pub struct Automaton {
    transitions: HashMap<State, Vec<Pattern>>,
}

impl Automaton {
    /// An automaton that accepts nothing; the stream must stay silent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates for the first line.
    pub fn start(self, candidates: impl IntoIterator<Item = Pattern>) -> Self {
        self.on(State::Start, candidates)
    }

    /// Candidates for the line following a match of `previous`.
    pub fn after(self, previous: &Pattern, candidates: impl IntoIterator<Item = Pattern>) -> Self {
        self.on(State::After(previous.id()), candidates)
    }

    fn on(mut self, state: State, candidates: impl IntoIterator<Item = Pattern>) -> Self {
        self.transitions
            .entry(state)
            .or_default()
            .extend(candidates);
        self
    }

    /// Candidates for `state`; unknown states accept nothing.
    pub fn candidates(&self, state: State) -> &[Pattern] {
        self.transitions.get(&state).map_or(&[], Vec::as_slice)
    }

    pub fn is_silent(&self) -> bool {
        self.transitions.is_empty()
    }

    /// First candidate of `state` that accepts `line`, in declared order.
    pub fn step(&self, state: State, line: &str) -> Option<(&Pattern, MatchOutput)> {
        self.candidates(state)
            .iter()
            .find_map(|pattern| pattern.test(line).map(|output| (pattern, output)))
    }

    /// Whether `path` is a legal sequence of matches starting from `Start`.
    pub fn accepts_path<'a>(&self, path: impl IntoIterator<Item = &'a Pattern>) -> bool {
        let mut state = State::Start;
        for pattern in path {
            if !self.candidates(state).contains(pattern) {
                return false;
            }
            state = State::After(pattern.id());
        }
        true
    }
}
