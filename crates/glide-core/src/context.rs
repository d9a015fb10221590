//! Left context for a guess: up to two preceding words of the current
//! sentence, most recent first.

use crate::token::ReservedToken;

/// Context words are stored nearest-first, so `words()[0]` is the word right
/// before the one being guessed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Context {
    words: Vec<String>,
}

pub const CONTEXT_LEN: usize = 2;

const SENTENCE_END: [char; 3] = ['.', '!', '?'];

enum Token {
    Word(String),
    Break,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '\u{2019}' || c == '-'
}

impl Context {
    /// Build from explicit words (nearest first). Extra words are dropped.
    pub fn new<S: Into<String>>(words: impl IntoIterator<Item = S>) -> Self {
        let mut words: Vec<String> = words.into_iter().map(Into::into).collect();
        words.truncate(CONTEXT_LEN);
        Self { words }
    }

    /// Context at the beginning of a sentence.
    pub fn start() -> Self {
        Self::new([ReservedToken::Start.name()])
    }

    /// Tokenize the text left of `cursor` (a char offset).
    ///
    /// `.`, `!` and `?` end a sentence; tokens that are not words (numbers,
    /// symbols) make the context beyond them unusable (`#NA`).
    pub fn from_text(text: &str, cursor: usize) -> Self {
        let before: String = text.chars().take(cursor).collect();
        let mut sentence: Vec<Token> = Vec::new();

        for raw in before.split_whitespace() {
            let core = raw.trim_matches(|c: char| !c.is_alphanumeric());
            if !core.is_empty() {
                if core.chars().all(is_word_char) && !core.chars().any(|c| c.is_ascii_digit()) {
                    sentence.push(Token::Word(core.to_string()));
                } else {
                    sentence.push(Token::Break);
                }
            }
            let tail = match raw.rfind(char::is_alphanumeric) {
                Some(pos) => &raw[pos..],
                None => raw,
            };
            if tail.contains(SENTENCE_END) {
                sentence.clear();
            }
        }

        let mut words = Vec::with_capacity(CONTEXT_LEN);
        let mut reached_start = true;
        for token in sentence.iter().rev() {
            if words.len() == CONTEXT_LEN {
                reached_start = false;
                break;
            }
            match token {
                Token::Word(w) => words.push(w.clone()),
                Token::Break => {
                    words.push(ReservedToken::NotAvailable.name().to_string());
                    reached_start = false;
                    break;
                }
            }
        }
        if reached_start && words.len() < CONTEXT_LEN {
            words.push(ReservedToken::Start.name().to_string());
        }
        Self::new(words)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Leading context words that carry information (up to the first `#NA`).
    pub fn usable_len(&self) -> usize {
        self.words
            .iter()
            .take_while(|w| ReservedToken::from_name(w) != Some(ReservedToken::NotAvailable))
            .count()
    }

    /// True when the guessed word opens a sentence.
    pub fn is_sentence_start(&self) -> bool {
        self.words
            .first()
            .is_some_and(|w| ReservedToken::from_name(w) == Some(ReservedToken::Start))
    }

    /// Context for the word after `word`, given that `self` preceded `word`.
    pub fn push_front(&self, word: &str) -> Self {
        let mut words = Vec::with_capacity(CONTEXT_LEN);
        words.push(word.to_string());
        words.extend(self.words.iter().cloned());
        Self::new(words)
    }

    /// Case-insensitive equality, used to check that guesses chain.
    pub fn matches(&self, other: &Context) -> bool {
        self.words.len() == other.words.len()
            && self
                .words
                .iter()
                .zip(&other.words)
                .all(|(a, b)| a.to_lowercase() == b.to_lowercase())
    }
}
