//! Turn model output into a fill-in-the-blank question.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::similarity::ratio;
use super::{ApiKeyManager, CompletionProvider, GenerationError, RetryPolicy};

/// Words always fully hidden.
pub const PREPOSITIONS: &[&str] = &[
    "the", "about", "above", "across", "after", "against", "along", "among",
    "around", "at", "before", "behind", "below", "beneath", "beside",
    "between", "beyond", "but", "by", "concerning", "despite", "down",
    "during", "except", "for", "from", "in", "inside", "into", "like", "near",
    "of", "off", "on", "onto", "out", "outside", "over", "past", "regarding",
    "round", "since", "through", "throughout", "to", "toward", "under",
    "underneath", "until", "up", "upon", "with", "within", "without",
];

/// Punctuation ignored around single-word matches.
pub const PUNCTUATION: &[char] = &[
    '.', ',', '!', '?', ';', ':', '。', '，', '！', '？', '；', '：',
];

/// Lowest similarity for the target to count as present.
pub const SIMILARITY_THRESHOLD: f64 = 0.5;

/// Separator between the English sentence and its translation.
pub const DELIMITER: char = '|';

/// Accepted question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// `english|chinese`, with the target blanked in the English part.
    pub sentence: String,
    /// Lowercased target phrase.
    pub appear: String,
}

/// Anything able to produce a question for a word.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    async fn question(&self, phrase: &str) -> Option<Question>;
}

/// Mask a word, keeping a hint of its shape.
pub fn blankify(word: &str) -> String {
    let length = word.chars().count();

    if PREPOSITIONS.contains(&word.to_lowercase().as_str()) {
        return "___".into();
    }
    if length == 0 {
        return String::new();
    }
    if length <= 3 {
        return "___".into();
    }

    let mut chars = word.chars();
    let (first, last) = match (chars.next(), chars.next_back()) {
        (Some(first), Some(last)) => (first, last),
        _ => return "___".into(),
    };

    if word.ends_with("ed") || word.ends_with("ing") {
        format!("{first}___")
    } else {
        format!("{first}____{last}")
    }
}

/// [`blankify`] the core of a token, keeping surrounding punctuation.
pub fn blank_token(token: &str) -> String {
    let core = token.trim_matches(PUNCTUATION);
    if core.is_empty() {
        return blankify(token);
    }

    let start = token.len() - token.trim_start_matches(PUNCTUATION).len();
    let end = start + core.len();

    format!("{}{}{}", &token[..start], blankify(core), &token[end..])
}

/// Drop blank lines.
pub fn trim_empty_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Where a target phrase best appears in a text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Match {
    pub text: String,
    pub similarity: f64,
    /// Token indexes covered.
    pub positions: Vec<usize>,
}

/// Find the whitespace-separated window most similar to `target`. The first
/// window wins ties.
pub fn best_match(text: &str, target: &str) -> Match {
    let words: Vec<&str> = text.split_whitespace().collect();
    let size = target.split_whitespace().count();
    let mut best = Match::default();

    if size == 1 {
        for (index, word) in words.iter().enumerate() {
            let clean = word.trim_matches(PUNCTUATION);
            let similarity = ratio(clean, target);

            if similarity > best.similarity {
                best = Match {
                    text: clean.to_owned(),
                    similarity,
                    positions: vec![index],
                };
            }
        }
    } else if size > 1 && size <= words.len() {
        for (index, window) in words.windows(size).enumerate() {
            let chunk = window.join(" ");
            let similarity = ratio(&chunk, target);

            if similarity > best.similarity {
                best = Match {
                    text: chunk,
                    similarity,
                    positions: (index..index + size).collect(),
                };
            }
        }
    }

    best
}

/// Blank the best match of `phrase` in `text` and validate the result.
pub fn build_question(text: &str, phrase: &str) -> Result<Question, GenerationError> {
    let mut words: Vec<String> = text.split_whitespace().map(str::to_owned).collect();
    let found = best_match(text, phrase);

    for index in &found.positions {
        let word = words.get_mut(*index).ok_or_else(|| {
            GenerationError::Generation(format!(
                "Index {index} out of range for sentence: '{text}'"
            ))
        })?;
        *word = blank_token(word);
    }

    check(words.join(" ").trim(), phrase, found.similarity)
}

fn check(sentence: &str, phrase: &str, similarity: f64) -> Result<Question, GenerationError> {
    if similarity < SIMILARITY_THRESHOLD {
        return Err(GenerationError::Generation(format!(
            "Sentence: '{sentence}' - Similarity too low: {similarity:.2}"
        )));
    }

    let Some((english, chinese)) = sentence.split_once(DELIMITER) else {
        return Err(GenerationError::Generation(format!(
            "Sentence: '{sentence}' - No '{DELIMITER}' found in response"
        )));
    };
    let (english, chinese) = (english.trim(), chinese.trim());

    if !english.is_ascii() {
        return Err(GenerationError::Generation(format!(
            "Sentence: '{sentence}' - English part contains non-ASCII characters: '{english}'"
        )));
    }
    if chinese.contains('_') {
        return Err(GenerationError::Generation(format!(
            "Sentence: '{sentence}' - Chinese part contains underscores: '{chinese}'"
        )));
    }

    Ok(Question {
        sentence: format!("{english}{DELIMITER}{chinese}"),
        appear: phrase.to_lowercase(),
    })
}

fn prompt(phrase: &str) -> String {
    format!(
        "You are a sentence-making tool. Make *1* short sentence. The sentence must use `{phrase}`. \
         Do not use other hard words and do not use Markdown. The sentence should look like a vocabulary test sentence. \
         After the sentence, give a **whole** sentence **Traditional Chinese** translation. \
         You MUST use Traditional Chinese characters for the translation, not Simplified Chinese. \
         Use `|` to separate the English sentence and the Chinese translation."
    )
}

/// [`QuestionSource`] asking a completion API, rotating keys and retrying.
pub struct SentenceMaker {
    provider: Box<dyn CompletionProvider>,
    keys: Arc<ApiKeyManager>,
    retry: RetryPolicy,
}

impl SentenceMaker {
    /// Create a new [`SentenceMaker`].
    pub fn new(
        provider: Box<dyn CompletionProvider>,
        keys: Arc<ApiKeyManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            keys,
            retry,
        }
    }

    async fn attempt(&self, phrase: &str) -> Result<Question, GenerationError> {
        let key = self.keys.get_available_api_key().await;
        let text = self.provider.complete(&prompt(phrase), &key).await?;

        build_question(&trim_empty_lines(&text), phrase)
    }
}

#[async_trait]
impl QuestionSource for SentenceMaker {
    async fn question(&self, phrase: &str) -> Option<Question> {
        self.retry.run(&self.keys, || self.attempt(phrase)).await
    }
}
