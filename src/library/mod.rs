//! Vocabulary libraries and their words.

mod repository;

pub use repository::*;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::user::User;

/// Longest library name.
pub const NAME_LENGTH: u64 = 50;
/// Longest library description.
pub const DESCRIPTION_LENGTH: u64 = 200;
/// Longest word, in either language.
pub const WORD_LENGTH: usize = 32;

/// Library as saved on database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Library {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub public: bool,
    pub author_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Library {
    /// Owners and admins may edit or delete.
    pub fn is_managed_by(&self, user: &User) -> bool {
        user.is_admin || self.author_id == Some(user.id)
    }

    /// Public libraries are visible to everyone, private ones to their
    /// owner and admins.
    pub fn is_visible_to(&self, viewer: Option<&User>) -> bool {
        self.public || viewer.is_some_and(|user| self.is_managed_by(user))
    }
}

/// Word as saved on database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Word {
    pub id: i64,
    pub library_id: i64,
    pub chinese: String,
    pub english: String,
}

/// Word pair as exchanged with clients and library files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordEntry {
    #[serde(rename = "Chinese")]
    pub chinese: String,
    #[serde(rename = "English")]
    pub english: String,
}

impl From<Word> for WordEntry {
    fn from(word: Word) -> Self {
        Self {
            chinese: word.chinese,
            english: word.english,
        }
    }
}

/// Word pair as received, before the keys are checked.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawWord {
    #[serde(rename = "Chinese")]
    pub chinese: Option<String>,
    #[serde(rename = "English")]
    pub english: Option<String>,
}

/// Invalid word list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WordsError {
    #[error("Each word must have 'Chinese' and 'English' keys.")]
    MissingKey,
    #[error("Words must be 1 to {WORD_LENGTH} characters long: '{0}'.")]
    Length(String),
}

/// Check every pair has both keys with a sensible length, trimming them.
pub fn parse_words(words: Vec<RawWord>) -> Result<Vec<WordEntry>, WordsError> {
    words
        .into_iter()
        .map(|word| {
            let (Some(chinese), Some(english)) = (word.chinese, word.english)
            else {
                return Err(WordsError::MissingKey);
            };
            let (chinese, english) =
                (chinese.trim().to_owned(), english.trim().to_owned());

            for text in [&chinese, &english] {
                let length = text.chars().count();
                if length == 0 || length > WORD_LENGTH {
                    return Err(WordsError::Length(text.clone()));
                }
            }

            Ok(WordEntry { chinese, english })
        })
        .collect()
}

/// Library as listed to a viewer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LibrarySummary {
    pub name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    #[sqlx(rename = "public")]
    pub is_public: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    /// Number of words.
    pub count: i64,
    pub favorite_count: i64,
    pub is_favorited: bool,
    pub is_owner: bool,
}

/// Listing order: favorited first, then most favorited, then most recent.
pub fn sort_summaries(libraries: &mut [LibrarySummary]) {
    libraries.sort_by(|a, b| {
        b.is_favorited
            .cmp(&a.is_favorited)
            .then(b.favorite_count.cmp(&a.favorite_count))
            .then(b.updated_at.cmp(&a.updated_at))
    });
}
