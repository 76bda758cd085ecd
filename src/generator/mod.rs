//! Background generation of example sentences for library words.

mod keys;
mod provider;
mod question;
mod retry;
pub mod similarity;

pub use keys::*;
pub use provider::*;
pub use question::*;
pub use retry::*;

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config;
use crate::error::ServerError;
use crate::library::LibraryRepository;
use crate::sentence::{NewSentence, SentenceRepository};

/// Failure of one completion request.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{0}")]
    Generation(String),

    #[error("unauthorized: invalid API key")]
    Unauthorized,

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Generation(err.to_string())
    }
}

/// Generator setup or persistence failure.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("no usable API key for {0}, set APIKEYS")]
    NoApiKeys(Provider),

    #[error("cannot build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Database(#[from] ServerError),
}

/// Outcome of one pass over every library.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub generated: usize,
    /// Words without a usable question this cycle.
    pub skipped: usize,
    /// Words already holding enough sentences.
    pub saturated: usize,
}

/// Fills the sentence table, one question per word and cycle.
#[derive(Clone)]
pub struct Generator {
    libraries: LibraryRepository,
    sentences: SentenceRepository,
    source: Arc<dyn QuestionSource>,
    interval: Duration,
    max_sentences_per_word: i64,
}

impl Generator {
    /// Create a new [`Generator`] with a one hour interval.
    pub fn new(pool: SqlitePool, source: Arc<dyn QuestionSource>) -> Self {
        Self {
            libraries: LibraryRepository::new(pool.clone()),
            sentences: SentenceRepository::new(pool),
            source,
            interval: Duration::from_secs(3600),
            max_sentences_per_word: 5,
        }
    }

    /// Build a generator backed by the configured HTTP provider.
    /// `api_keys` is a comma-separated list.
    pub fn from_config(
        pool: SqlitePool,
        config: &config::Generator,
        api_keys: &str,
    ) -> Result<Self, GeneratorError> {
        let keys = ApiKeyManager::new(
            config.provider,
            api_keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty()),
        )?;
        let provider = HttpProvider::new(
            config.provider,
            config.model.clone(),
            config.endpoint.clone(),
        )?;

        tracing::info!(
            provider = %config.provider,
            model = provider.model(),
            keys = keys.len(),
            "sentence generator configured"
        );

        let maker = SentenceMaker::new(
            Box::new(provider),
            Arc::new(keys),
            RetryPolicy::new(config.retry_attempts, Duration::from_secs(config.retry_delay)),
        );

        Ok(Self::new(pool, Arc::new(maker))
            .interval(Duration::from_secs(config.interval))
            .max_sentences_per_word(config.max_sentences_per_word))
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn max_sentences_per_word(mut self, max: i64) -> Self {
        self.max_sentences_per_word = max;
        self
    }

    /// Ask one question per word of every library, in random order, and
    /// store each accepted sentence as soon as it arrives.
    pub async fn run_cycle(&self) -> Result<CycleReport, GeneratorError> {
        let mut report = CycleReport::default();

        for library in self.libraries.all().await? {
            let mut words = self.libraries.words(library.id).await?;
            words.shuffle(&mut rand::thread_rng());

            for word in words {
                if self.sentences.count_for_word(&word.english).await?
                    >= self.max_sentences_per_word
                {
                    report.saturated += 1;
                    continue;
                }

                let Some((english, chinese)) = self
                    .source
                    .question(&word.english)
                    .await
                    .and_then(|question| {
                        question
                            .sentence
                            .split_once(DELIMITER)
                            .map(|(english, chinese)| {
                                (english.trim().to_owned(), chinese.trim().to_owned())
                            })
                    })
                else {
                    tracing::error!(
                        word = %word.english,
                        library = %library.name,
                        "failed to generate question, skipping"
                    );
                    metrics::counter!("sentences_skipped_total").increment(1);
                    report.skipped += 1;
                    continue;
                };

                self.sentences
                    .insert(&NewSentence {
                        chinese,
                        english,
                        word_chinese: word.chinese,
                        word_english: word.english,
                    })
                    .await?;

                metrics::counter!("sentences_generated_total").increment(1);
                report.generated += 1;
            }
        }

        Ok(report)
    }

    /// Run cycles forever on a fixed interval.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.run_cycle().await {
                    Ok(report) => tracing::info!(
                        generated = report.generated,
                        skipped = report.skipped,
                        saturated = report.saturated,
                        next_in_secs = self.interval.as_secs(),
                        "questions generated, waiting for the next interval"
                    ),
                    Err(err) => tracing::error!(error = %err, "generation cycle failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::library::{NewLibrary, WordEntry};

    /// Answers every word with the same line and records what it was asked.
    struct Fixed {
        reply: Option<&'static str>,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QuestionSource for Fixed {
        async fn question(&self, phrase: &str) -> Option<Question> {
            self.asked.lock().unwrap().push(phrase.to_owned());
            self.reply.map(|sentence| Question {
                sentence: sentence.to_owned(),
                appear: phrase.to_lowercase(),
            })
        }
    }

    fn fixed(reply: Option<&'static str>) -> Arc<Fixed> {
        Arc::new(Fixed {
            reply,
            asked: Mutex::new(Vec::new()),
        })
    }

    async fn library(pool: &SqlitePool, words: &[(&str, &str)]) {
        LibraryRepository::new(pool.clone())
            .insert(&NewLibrary {
                name: "basics".into(),
                public: true,
                words: words
                    .iter()
                    .map(|(chinese, english)| WordEntry {
                        chinese: (*chinese).into(),
                        english: (*english).into(),
                    })
                    .collect(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[sqlx::test]
    async fn test_cycle_stores_sentences(pool: SqlitePool) {
        library(&pool, &[("你好", "hello"), ("蘋果", "apple")]).await;
        let source = fixed(Some(" Hello | 你好 "));

        let report = Generator::new(pool.clone(), source.clone())
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(
            report,
            CycleReport {
                generated: 2,
                ..Default::default()
            }
        );

        let mut asked = source.asked.lock().unwrap().clone();
        asked.sort();
        assert_eq!(asked, ["apple", "hello"]);

        let stored = SentenceRepository::new(pool)
            .random_for_word("hello")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.english, "Hello");
        assert_eq!(stored.chinese, "你好");
        assert_eq!(stored.word_chinese, "你好");
    }

    #[sqlx::test]
    async fn test_cycle_skips(pool: SqlitePool) {
        library(&pool, &[("你好", "hello")]).await;

        let report = Generator::new(pool.clone(), fixed(None))
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);

        let generator = Generator::new(pool.clone(), fixed(Some("Hello|你好")))
            .max_sentences_per_word(1);
        assert_eq!(generator.run_cycle().await.unwrap().generated, 1);
        assert_eq!(generator.run_cycle().await.unwrap().saturated, 1);
        assert_eq!(SentenceRepository::new(pool).count().await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn test_from_config_needs_keys(pool: SqlitePool) {
        let config = config::Generator::default();

        assert!(matches!(
            Generator::from_config(pool.clone(), &config, "AIzaSy_wrong, "),
            Err(GeneratorError::NoApiKeys(Provider::Groq))
        ));
        assert!(Generator::from_config(pool, &config, "gsk_one,gsk_two").is_ok());
    }
}
