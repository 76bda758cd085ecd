//! Generated quiz sentences.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::Result;

/// Sentence as saved on database.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sentence {
    pub id: i64,
    /// Chinese translation.
    pub chinese: String,
    /// English sentence with the target word blanked.
    pub english: String,
    pub word_chinese: String,
    pub word_english: String,
    pub created_at: NaiveDateTime,
}

/// Fields of a sentence about to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewSentence {
    pub chinese: String,
    pub english: String,
    pub word_chinese: String,
    pub word_english: String,
}

#[derive(Clone, Debug)]
pub struct SentenceRepository {
    pool: SqlitePool,
}

impl SentenceRepository {
    /// Create a new [`SentenceRepository`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert [`Sentence`] into database.
    pub async fn insert(&self, sentence: &NewSentence) -> Result<Sentence> {
        Ok(sqlx::query_as::<_, Sentence>(
            r#"INSERT INTO sentences (chinese, english, word_chinese, word_english)
                VALUES (?, ?, ?, ?)
                RETURNING *"#,
        )
        .bind(&sentence.chinese)
        .bind(&sentence.english)
        .bind(&sentence.word_chinese)
        .bind(&sentence.word_english)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Number of sentences stored for an English word.
    pub async fn count_for_word(&self, word_english: &str) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM sentences WHERE word_english = ?")
            .bind(word_english)
            .fetch_one(&self.pool)
            .await?)
    }

    /// A random sentence for an English word.
    pub async fn random_for_word(&self, word_english: &str) -> Result<Option<Sentence>> {
        Ok(sqlx::query_as::<_, Sentence>(
            "SELECT * FROM sentences WHERE word_english = ? ORDER BY RANDOM() LIMIT 1",
        )
        .bind(word_english)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Number of sentences.
    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM sentences")
            .fetch_one(&self.pool)
            .await?)
    }
}
