//! Handle library database requests.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::library::{Library, LibrarySummary, Word, WordEntry};
use crate::user::User;

const SUMMARY_QUERY: &str = r#"SELECT
        l.name,
        l.description,
        u.username AS author,
        l.public,
        l.created_at,
        l.updated_at,
        (SELECT COUNT(*) FROM words w WHERE w.library_id = l.id) AS count,
        (SELECT COUNT(*) FROM favorites f WHERE f.library_id = l.id) AS favorite_count,
        EXISTS (SELECT 1 FROM favorites f WHERE f.library_id = l.id AND f.user_id = ?) AS is_favorited,
        (l.author_id IS NOT NULL AND l.author_id = ?) AS is_owner
    FROM libraries l
    LEFT JOIN users u ON u.id = l.author_id"#;

/// Fields of a library about to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewLibrary {
    pub name: String,
    pub description: Option<String>,
    pub public: bool,
    pub author_id: Option<i64>,
    pub words: Vec<WordEntry>,
}

#[derive(Clone, Debug)]
pub struct LibraryRepository {
    pool: SqlitePool,
}

impl LibraryRepository {
    /// Create a new [`LibraryRepository`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a library and its words in one transaction.
    pub async fn insert(&self, library: &NewLibrary) -> Result<Library> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Library>(
            r#"INSERT INTO libraries (name, description, public, author_id)
                VALUES (?, ?, ?, ?)
                RETURNING *"#,
        )
        .bind(&library.name)
        .bind(&library.description)
        .bind(library.public)
        .bind(library.author_id)
        .fetch_one(&mut *tx)
        .await?;

        for word in &library.words {
            sqlx::query(
                "INSERT INTO words (library_id, chinese, english) VALUES (?, ?, ?)",
            )
            .bind(created.id)
            .bind(&word.chinese)
            .bind(&word.english)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(name = %created.name, words = library.words.len(), "library created");

        Ok(created)
    }

    /// Replace name, metadata and words of a library.
    pub async fn update(&self, id: i64, library: &NewLibrary) -> Result<Library> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Library>(
            r#"UPDATE libraries
                SET name = ?, description = ?, public = ?, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                RETURNING *"#,
        )
        .bind(&library.name)
        .bind(&library.description)
        .bind(library.public)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM words WHERE library_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for word in &library.words {
            sqlx::query(
                "INSERT INTO words (library_id, chinese, english) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(&word.chinese)
            .bind(&word.english)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(updated)
    }

    /// Find a library using `name` field.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Library>> {
        Ok(sqlx::query_as::<_, Library>("SELECT * FROM libraries WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Every library, oldest first.
    pub async fn all(&self) -> Result<Vec<Library>> {
        Ok(sqlx::query_as::<_, Library>("SELECT * FROM libraries ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Libraries visible to a viewer: public ones, their own, or all of them
    /// for admins. Not sorted.
    pub async fn list_visible(&self, viewer: Option<&User>) -> Result<Vec<LibrarySummary>> {
        let viewer_id = viewer.map(|user| user.id).unwrap_or(-1);
        let show_all = viewer.is_some_and(|user| user.is_admin);

        let query = format!("{SUMMARY_QUERY} WHERE l.public = TRUE OR l.author_id = ? OR ?");

        Ok(sqlx::query_as::<_, LibrarySummary>(&query)
            .bind(viewer_id)
            .bind(viewer_id)
            .bind(viewer_id)
            .bind(show_all)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Public libraries authored by a user.
    pub async fn list_public_by_author(&self, author_id: i64) -> Result<Vec<LibrarySummary>> {
        let query = format!(
            "{SUMMARY_QUERY} WHERE l.public = TRUE AND l.author_id = ? ORDER BY l.updated_at DESC"
        );

        Ok(sqlx::query_as::<_, LibrarySummary>(&query)
            .bind(-1_i64)
            .bind(-1_i64)
            .bind(author_id)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Number of libraries authored by a user.
    pub async fn count_by_author(&self, author_id: i64) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM libraries WHERE author_id = ?")
            .bind(author_id)
            .fetch_one(&self.pool)
            .await?)
    }

    /// Words of a library.
    pub async fn words(&self, library_id: i64) -> Result<Vec<Word>> {
        Ok(sqlx::query_as::<_, Word>("SELECT * FROM words WHERE library_id = ? ORDER BY id")
            .bind(library_id)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Delete a library. Words and favorites cascade.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM words WHERE library_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM favorites WHERE library_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM libraries WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Add or remove a favorite. Returns whether it is now favorited.
    pub async fn toggle_favorite(&self, user_id: i64, library_id: i64) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM favorites WHERE user_id = ? AND library_id = ?")
            .bind(user_id)
            .bind(library_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed > 0 {
            return Ok(false);
        }

        sqlx::query("INSERT INTO favorites (user_id, library_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(library_id)
            .execute(&self.pool)
            .await?;

        Ok(true)
    }

    /// IDs of the libraries a user favorited.
    pub async fn favorite_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT library_id FROM favorites WHERE user_id = ? ORDER BY library_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Number of libraries.
    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM libraries")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Number of words across libraries.
    pub async fn count_words(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM words")
            .fetch_one(&self.pool)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{NewUser, UserRepository};

    fn words() -> Vec<WordEntry> {
        vec![
            WordEntry {
                chinese: "你好".into(),
                english: "hello".into(),
            },
            WordEntry {
                chinese: "蘋果".into(),
                english: "apple".into(),
            },
        ]
    }

    async fn user(pool: &SqlitePool, email: &str, is_admin: bool) -> User {
        UserRepository::new(pool.clone())
            .insert(&NewUser {
                username: email.into(),
                email: email.into(),
                locale: "en".into(),
                is_admin,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn test_insert_and_words(pool: SqlitePool) {
        let owner = user(&pool, "owner@example.com", false).await;
        let repo = LibraryRepository::new(pool);

        let library = repo
            .insert(&NewLibrary {
                name: "basics".into(),
                public: true,
                author_id: Some(owner.id),
                words: words(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(repo.words(library.id).await.unwrap().len(), 2);
        assert_eq!(repo.count_by_author(owner.id).await.unwrap(), 1);
        assert_eq!(repo.count_words().await.unwrap(), 2);

        // Names are unique.
        assert!(
            repo.insert(&NewLibrary {
                name: "basics".into(),
                ..Default::default()
            })
            .await
            .is_err()
        );

        let updated = repo
            .update(
                library.id,
                &NewLibrary {
                    name: "renamed".into(),
                    public: false,
                    words: words()[..1].to_vec(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(repo.words(library.id).await.unwrap().len(), 1);

        repo.delete(library.id).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 0);
        assert_eq!(repo.count_words().await.unwrap(), 0);
    }

    #[sqlx::test]
    async fn test_visibility_and_favorites(pool: SqlitePool) {
        let owner = user(&pool, "owner@example.com", false).await;
        let other = user(&pool, "other@example.com", false).await;
        let admin = user(&pool, "admin@example.com", true).await;
        let repo = LibraryRepository::new(pool);

        let public = repo
            .insert(&NewLibrary {
                name: "public".into(),
                public: true,
                author_id: Some(owner.id),
                words: words(),
                ..Default::default()
            })
            .await
            .unwrap();
        repo.insert(&NewLibrary {
            name: "private".into(),
            author_id: Some(owner.id),
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(repo.list_visible(None).await.unwrap().len(), 1);
        assert_eq!(repo.list_visible(Some(&other)).await.unwrap().len(), 1);
        assert_eq!(repo.list_visible(Some(&owner)).await.unwrap().len(), 2);
        assert_eq!(repo.list_visible(Some(&admin)).await.unwrap().len(), 2);

        assert!(repo.toggle_favorite(other.id, public.id).await.unwrap());
        let listed = repo.list_visible(Some(&other)).await.unwrap();
        assert_eq!(listed[0].count, 2);
        assert_eq!(listed[0].favorite_count, 1);
        assert!(listed[0].is_favorited);
        assert!(!listed[0].is_owner);
        assert_eq!(listed[0].author.as_deref(), Some("owner@example.com"));
        assert_eq!(repo.favorite_ids(other.id).await.unwrap(), vec![public.id]);

        assert!(!repo.toggle_favorite(other.id, public.id).await.unwrap());
        assert!(repo.favorite_ids(other.id).await.unwrap().is_empty());

        let profile = repo.list_public_by_author(owner.id).await.unwrap();
        assert_eq!(profile.len(), 1);
        assert_eq!(profile[0].name, "public");
    }
}
