//! Library listing, authoring and study material.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::library::{
    DESCRIPTION_LENGTH, Library, LibraryRepository, LibrarySummary, NAME_LENGTH,
    NewLibrary, RawWord, WordEntry, parse_words, sort_summaries,
};
use crate::router::{CurrentUser, Valid, Viewer};
use crate::sentence::{Sentence, SentenceRepository};
use crate::user::{User, UserRepository};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/libraries", get(list).post(create))
        .route("/libraries/{name}", put(update))
        .route("/libraries/{name}/words", get(words))
        .route("/libraries/{name}/sentences", get(sentences))
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct LibraryBody {
    #[validate(length(
        max = NAME_LENGTH,
        message = "Library name must be at most 50 characters long."
    ))]
    pub name: String,
    #[validate(length(
        max = DESCRIPTION_LENGTH,
        message = "Description must be at most 200 characters long."
    ))]
    pub description: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub words: Vec<RawWord>,
}

impl LibraryBody {
    /// Check the body against the quotas of `author`.
    fn into_library(
        self,
        state: &AppState,
        author: &User,
    ) -> Result<NewLibrary> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(ServerError::BadRequest(
                "Library name is required.".into(),
            ));
        }

        let words = parse_words(self.words)
            .map_err(|err| ServerError::BadRequest(err.to_string()))?;

        let max_words = state.config.defaults.max_words;
        if !author.has_unlimited_access() && words.len() > max_words {
            return Err(ServerError::LimitReached(format!(
                "A library may hold at most {max_words} words."
            )));
        }

        Ok(NewLibrary {
            name,
            description: self
                .description
                .map(|description| description.trim().to_owned())
                .filter(|description| !description.is_empty()),
            public: self.public,
            author_id: Some(author.id),
            words,
        })
    }
}

/// Handler of `GET /libraries`.
async fn list(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
) -> Result<Json<Vec<LibrarySummary>>> {
    let mut libraries = LibraryRepository::new(state.db.pool.clone())
        .list_visible(viewer.as_ref())
        .await?;
    sort_summaries(&mut libraries);

    Ok(Json(libraries))
}

/// Handler of `POST /libraries`.
async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Valid(body): Valid<LibraryBody>,
) -> Result<(StatusCode, Json<Library>)> {
    if !user.email_verified {
        return Err(ServerError::Forbidden(
            "Please verify your email before creating libraries.".into(),
        ));
    }

    let libraries = LibraryRepository::new(state.db.pool.clone());

    let max_libraries = state.config.defaults.max_libraries;
    if !user.has_unlimited_access()
        && libraries.count_by_author(user.id).await? >= max_libraries
    {
        return Err(ServerError::LimitReached(format!(
            "You may own at most {max_libraries} libraries."
        )));
    }

    let library = body.into_library(&state, &user)?;
    if libraries.find_by_name(&library.name).await?.is_some() {
        return Err(ServerError::Conflict(
            "Library name already exists.".into(),
        ));
    }

    let created = libraries.insert(&library).await?;
    UserRepository::new(state.db.pool.clone())
        .set_current_library(user.id, Some(created.name.as_str()))
        .await?;

    tracing::info!(user_id = user.id, library = %created.name, words = library.words.len(), "library created");

    Ok((StatusCode::CREATED, Json(created)))
}

/// Handler of `PUT /libraries/{name}`.
async fn update(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
    Valid(body): Valid<LibraryBody>,
) -> Result<Json<Library>> {
    let libraries = LibraryRepository::new(state.db.pool.clone());
    let library = libraries
        .find_by_name(&name)
        .await?
        .ok_or(ServerError::NotFound("Library"))?;

    if !library.is_managed_by(&user) {
        return Err(ServerError::Forbidden("Permission denied.".into()));
    }

    let changes = body.into_library(&state, &user)?;
    let changes = NewLibrary {
        author_id: library.author_id,
        ..changes
    };

    if changes.name != library.name
        && libraries.find_by_name(&changes.name).await?.is_some()
    {
        return Err(ServerError::Conflict(
            "Library name already exists.".into(),
        ));
    }

    let updated = libraries.update(library.id, &changes).await?;
    if updated.name != library.name {
        UserRepository::new(state.db.pool.clone())
            .rename_current_library(&library.name, Some(updated.name.as_str()))
            .await?;
    }

    tracing::debug!(user_id = user.id, library = %updated.name, "library updated");

    Ok(Json(updated))
}

/// Find a library the viewer may read.
async fn visible(
    state: &AppState,
    name: &str,
    viewer: Option<&User>,
) -> Result<Library> {
    LibraryRepository::new(state.db.pool.clone())
        .find_by_name(name)
        .await?
        .filter(|library| library.is_visible_to(viewer))
        .ok_or(ServerError::NotFound("Library"))
}

/// Handler of `GET /libraries/{name}/words`, shuffled.
async fn words(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(name): Path<String>,
) -> Result<Json<Vec<WordEntry>>> {
    let library = visible(&state, &name, viewer.as_ref()).await?;

    let mut words: Vec<WordEntry> = LibraryRepository::new(state.db.pool.clone())
        .words(library.id)
        .await?
        .into_iter()
        .map(WordEntry::from)
        .collect();
    words.shuffle(&mut rand::thread_rng());

    Ok(Json(words))
}

/// Handler of `GET /libraries/{name}/sentences`: one random sentence per
/// word, `null` for words without any.
async fn sentences(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    Path(name): Path<String>,
) -> Result<Json<Vec<Option<Sentence>>>> {
    let library = visible(&state, &name, viewer.as_ref()).await?;
    let repo = SentenceRepository::new(state.db.pool.clone());

    let mut sentences = Vec::new();
    for word in LibraryRepository::new(state.db.pool.clone())
        .words(library.id)
        .await?
    {
        sentences.push(repo.random_for_word(&word.english).await?);
    }

    if sentences.iter().all(Option::is_none) {
        return Err(ServerError::NotFound("Sentence"));
    }

    Ok(Json(sentences))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::http::Method;
    use axum::response::Response;
    use http_body_util::BodyExt;
    use serde_json::json;
    use sqlx::SqlitePool;

    use super::*;
    use crate::generator::{Generator, Question, QuestionSource};
    use crate::router::account::TokenResponse;
    use crate::router::{signed_up, state};
    use crate::sentence::NewSentence;
    use crate::token::Purpose;
    use crate::{app, make_request};

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn library(name: &str, public: bool, words: &[(&str, &str)]) -> String {
        json!({
            "name": name,
            "description": "Test library",
            "public": public,
            "words": words
                .iter()
                .map(|(chinese, english)| json!({ "Chinese": chinese, "English": english }))
                .collect::<Vec<_>>(),
        })
        .to_string()
    }

    #[sqlx::test]
    async fn test_create(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        let (user, token) = signed_up(&state, "author", true, false).await;

        let response = make_request(
            app.clone(),
            Method::POST,
            "/libraries",
            library("basics", true, &[("你好", "hello")]),
            Some(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: Library = json_body(response).await;
        assert_eq!(created.author_id, Some(user.id));

        let user = UserRepository::new(state.db.pool.clone())
            .find_by_id(user.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.current_library.as_deref(), Some("basics"));

        let response = make_request(
            app.clone(),
            Method::POST,
            "/libraries",
            library("basics", true, &[]),
            Some(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = make_request(
            app,
            Method::POST,
            "/libraries",
            json!({ "name": "broken", "words": [{ "Chinese": "你好" }] }).to_string(),
            Some(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    async fn test_create_requirements(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        let (_, unverified) = signed_up(&state, "newcomer", false, false).await;
        let (_, token) = signed_up(&state, "author", true, false).await;
        let (_, admin) = signed_up(&state, "keeper", true, true).await;

        let response = make_request(
            app.clone(),
            Method::POST,
            "/libraries",
            library("basics", true, &[]),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/libraries",
            library("basics", true, &[]),
            Some(&unverified),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        for index in 0..state.config.defaults.max_libraries {
            let response = make_request(
                app.clone(),
                Method::POST,
                "/libraries",
                library(&format!("library {index}"), false, &[]),
                Some(&token),
            )
            .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = make_request(
            app.clone(),
            Method::POST,
            "/libraries",
            library("one too many", false, &[]),
            Some(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let too_many: Vec<(String, String)> = (0..=state.config.defaults.max_words)
            .map(|index| (format!("字{index}"), format!("word{index}")))
            .collect();
        let too_many: Vec<(&str, &str)> = too_many
            .iter()
            .map(|(chinese, english)| (chinese.as_str(), english.as_str()))
            .collect();

        // Admins skip both quotas.
        let response = make_request(
            app,
            Method::POST,
            "/libraries",
            library("huge", true, &too_many),
            Some(&admin),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[sqlx::test]
    async fn test_list_visibility(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        let (_, owner) = signed_up(&state, "owner", true, false).await;
        let (_, stranger) = signed_up(&state, "stranger", true, false).await;
        let (_, admin) = signed_up(&state, "keeper", true, true).await;

        for (name, public) in [("shared", true), ("secret", false)] {
            let response = make_request(
                app.clone(),
                Method::POST,
                "/libraries",
                library(name, public, &[("你好", "hello")]),
                Some(&owner),
            )
            .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let viewers = [
            (None, 1),
            (Some(&stranger), 1),
            (Some(&owner), 2),
            (Some(&admin), 2),
        ];
        for (token, expected) in viewers {
            let response = make_request(
                app.clone(),
                Method::GET,
                "/libraries",
                String::new(),
                token.map(String::as_str),
            )
            .await;
            let libraries: Vec<LibrarySummary> = json_body(response).await;
            assert_eq!(libraries.len(), expected);
        }

        let response = make_request(
            app.clone(),
            Method::GET,
            "/libraries/secret/words",
            String::new(),
            Some(&stranger),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = make_request(
            app,
            Method::GET,
            "/libraries/secret/words",
            String::new(),
            Some(&owner),
        )
        .await;
        let words: Vec<WordEntry> = json_body(response).await;
        assert_eq!(
            words,
            vec![WordEntry {
                chinese: "你好".into(),
                english: "hello".into()
            }]
        );
    }

    #[sqlx::test]
    async fn test_update(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        let (owner, token) = signed_up(&state, "owner", true, false).await;
        let (_, stranger) = signed_up(&state, "stranger", true, false).await;

        make_request(
            app.clone(),
            Method::POST,
            "/libraries",
            library("draft", true, &[("你好", "hello")]),
            Some(&token),
        )
        .await;

        let response = make_request(
            app.clone(),
            Method::PUT,
            "/libraries/draft",
            library("final", true, &[]),
            Some(&stranger),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = make_request(
            app,
            Method::PUT,
            "/libraries/draft",
            library("final", false, &[("蘋果", "apple"), ("香蕉", "banana")]),
            Some(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let libraries = LibraryRepository::new(state.db.pool.clone());
        assert!(libraries.find_by_name("draft").await.unwrap().is_none());
        let updated = libraries.find_by_name("final").await.unwrap().unwrap();
        assert!(!updated.public);
        assert_eq!(updated.author_id, Some(owner.id));
        assert_eq!(libraries.words(updated.id).await.unwrap().len(), 2);

        let owner = UserRepository::new(state.db.pool.clone())
            .find_by_id(owner.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owner.current_library.as_deref(), Some("final"));
    }

    #[sqlx::test]
    async fn test_sentences(pool: SqlitePool) {
        let state = state(pool);
        let app = app(state.clone());
        let (_, token) = signed_up(&state, "owner", true, false).await;

        make_request(
            app.clone(),
            Method::POST,
            "/libraries",
            library("basics", true, &[("你好", "hello"), ("蘋果", "apple")]),
            Some(&token),
        )
        .await;

        let response = make_request(
            app.clone(),
            Method::GET,
            "/libraries/basics/sentences",
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        SentenceRepository::new(state.db.pool.clone())
            .insert(&NewSentence {
                chinese: "我喜歡蘋果。".into(),
                english: "I like a____s.".into(),
                word_chinese: "蘋果".into(),
                word_english: "apple".into(),
            })
            .await
            .unwrap();

        let response = make_request(
            app,
            Method::GET,
            "/libraries/basics/sentences",
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let sentences: Vec<Option<Sentence>> = json_body(response).await;
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences.iter().flatten().count(), 1);
    }

    struct Canned;

    #[async_trait]
    impl QuestionSource for Canned {
        async fn question(&self, phrase: &str) -> Option<Question> {
            Some(Question {
                sentence: "Hello|你好".into(),
                appear: phrase.to_lowercase(),
            })
        }
    }

    #[sqlx::test]
    async fn test_register_create_generate(pool: SqlitePool) {
        let state = state(pool.clone());
        let app = app(state.clone());

        let response = make_request(
            app.clone(),
            Method::POST,
            "/register",
            json!({
                "username": "learner",
                "email": "learner@example.com",
                "password": "secret1",
                "confirm": "secret1",
            })
            .to_string(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: TokenResponse = json_body(response).await;
        let token = body.token;

        let verification = state
            .token
            .create(
                "learner@example.com",
                Purpose::VerifyEmail,
                std::time::Duration::from_secs(60),
            )
            .unwrap();
        let response = make_request(
            app.clone(),
            Method::GET,
            &format!("/verify_email/{verification}"),
            String::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = make_request(
            app,
            Method::POST,
            "/libraries",
            library("greetings", true, &[("你好", "hello")]),
            Some(&token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let report = Generator::new(pool.clone(), Arc::new(Canned))
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.generated, 1);

        let sentences: Vec<Sentence> = sqlx::query_as("SELECT * FROM sentences")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].english, "Hello");
        assert_eq!(sentences[0].chinese, "你好");
        assert_eq!(sentences[0].word_english, "hello");
    }
}
