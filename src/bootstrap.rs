//! First start seeding: system account and bundled libraries.

use std::path::Path;

use serde::Deserialize;

use crate::config::SystemUser;
use crate::crypto::PasswordManager;
use crate::error::Result;
use crate::library::{LibraryRepository, NewLibrary, RawWord, WordEntry};
use crate::user::{User, UserBuilder, UserRepository};

/// Owner of libraries whose author is unknown.
pub const SYSTEM_USER_ID: i64 = 1;

/// Library file as bundled in the library directory.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LibraryFile {
    name: String,
    description: Option<String>,
    #[serde(rename = "created_at")]
    _created_at: serde_json::Value,
    #[serde(rename = "updated_at")]
    _updated_at: serde_json::Value,
    author: Option<String>,
    words: Vec<RawWord>,
}

/// Create the system user when the database holds no user yet.
pub async fn init_system_user(
    repo: &UserRepository,
    pwd: &PasswordManager,
    system: &SystemUser,
    password: Option<String>,
) -> Result<Option<User>> {
    if repo.count().await? > 0 {
        return Ok(None);
    }

    let user = UserBuilder::new()
        .username(&system.username)
        .email(&system.email)
        .password(password)
        .verified(true)
        .create(pwd, repo)
        .await?;

    tracing::info!(
        username = %user.username,
        email = %user.email,
        "system user initialized"
    );

    Ok(Some(user))
}

/// Load every `*.json` library of `dir`. Malformed files and names already
/// taken are skipped. Returns how many libraries were added.
pub async fn load_libraries(
    dir: &Path,
    libraries: &LibraryRepository,
    users: &UserRepository,
) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "library directory unreadable");
            return Ok(0);
        },
    };

    let mut paths = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|extension| extension == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let system = users.find_by_id(SYSTEM_USER_ID).await?.map(|user| user.id);
    let mut loaded = 0;

    for path in paths {
        let file = match tokio::fs::read(&path)
            .await
            .map_err(|err| err.to_string())
            .and_then(|content| {
                serde_json::from_slice::<LibraryFile>(&content).map_err(|err| err.to_string())
            }) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = err, "invalid library file, skipping");
                continue;
            },
        };

        if libraries.find_by_name(&file.name).await?.is_some() {
            tracing::debug!(name = %file.name, "library already exists, skipping");
            continue;
        }

        let author_id = match file.author.as_deref() {
            Some(author) => users.find_by_username(author).await?.map(|user| user.id),
            None => None,
        }
        .or(system);

        let words: Vec<WordEntry> = file
            .words
            .into_iter()
            .filter_map(|word| match (word.chinese, word.english) {
                (Some(chinese), Some(english))
                    if !chinese.trim().is_empty() && !english.trim().is_empty() =>
                {
                    Some(WordEntry {
                        chinese: chinese.trim().to_owned(),
                        english: english.trim().to_owned(),
                    })
                },
                _ => {
                    tracing::warn!(library = %file.name, "word without 'Chinese' or 'English', skipping");
                    None
                },
            })
            .collect();

        libraries
            .insert(&NewLibrary {
                name: file.name,
                description: file.description,
                public: true,
                author_id,
                words,
            })
            .await?;
        loaded += 1;
    }

    tracing::info!(loaded, "libraries loaded from the library directory");

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use sqlx::SqlitePool;

    use super::*;
    use crate::crypto::light_argon2;

    fn pwd() -> PasswordManager {
        PasswordManager::new(Some(light_argon2())).unwrap()
    }

    #[sqlx::test]
    async fn test_system_user_once(pool: SqlitePool) {
        let repo = UserRepository::new(pool);
        let system = SystemUser::default();

        let user = init_system_user(&repo, &pwd(), &system, Some("secret".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.id, SYSTEM_USER_ID);
        assert_eq!(user.username, "system");
        assert!(user.has_password());

        assert!(
            init_system_user(&repo, &pwd(), &system, None)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn test_load_libraries(pool: SqlitePool) {
        let users = UserRepository::new(pool.clone());
        let libraries = LibraryRepository::new(pool);
        init_system_user(&users, &pwd(), &SystemUser::default(), None)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("basics.json"),
            r#"{
                "name": "basics",
                "description": "First words",
                "created_at": "2024-01-01",
                "updated_at": "2024-01-01",
                "author": "nobody",
                "words": [
                    {"Chinese": "你好", "English": "hello"},
                    {"Chinese": "蘋果"}
                ]
            }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("extra.json"),
            r#"{"name": "extra", "words": [], "unexpected": true}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(load_libraries(dir.path(), &libraries, &users).await.unwrap(), 1);
        // Loading twice keeps the existing library.
        assert_eq!(load_libraries(dir.path(), &libraries, &users).await.unwrap(), 0);

        let library = libraries.find_by_name("basics").await.unwrap().unwrap();
        assert!(library.public);
        assert_eq!(library.author_id, Some(SYSTEM_USER_ID));
        assert_eq!(libraries.words(library.id).await.unwrap().len(), 1);

        assert_eq!(
            load_libraries(&dir.path().join("missing"), &libraries, &users)
                .await
                .unwrap(),
            0
        );
    }
}
