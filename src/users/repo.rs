use async_trait::async_trait;
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::users::repo_types::{NewUser, Role, User, UserFilter, UserRow};

const USER_COLUMNS: &str = "id, external_id, email, first_name, last_name, avatar_url, role, \
                            is_active, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index (`external_id` or `email`) rejected the write.
    #[error("unique constraint violated: {}", constraint.as_deref().unwrap_or("unknown"))]
    UniqueViolation { constraint: Option<String> },
    #[error("user store query failed: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db.constraint().map(str::to_string),
            },
            _ => StoreError::Database(err),
        }
    }
}

/// Persistence for local users.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Opens a transaction scope for a reconciliation.
    async fn begin(&self) -> Result<Box<dyn UserTx>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn list(&self, filter: &UserFilter) -> Result<Vec<User>, StoreError>;

    async fn update_names(
        &self,
        id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn update_role(&self, id: Uuid, role: Role) -> Result<Option<User>, StoreError>;

    /// Out-of-band deprovisioning. Returns the number of rows removed.
    async fn delete_by_external_id(&self, external_id: &str) -> Result<u64, StoreError>;
}

/// Reads and writes isolated in one transaction.
///
/// Writes must leave the transaction usable when they fail on a uniqueness
/// violation, so callers can look the row up again.
#[async_trait]
pub trait UserTx: Send {
    async fn find_by_external_id(&mut self, external_id: &str)
        -> Result<Option<User>, StoreError>;

    async fn find_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError>;

    async fn insert(&mut self, new: &NewUser) -> Result<User, StoreError>;

    /// Persists the profile columns of `user` (external id, email, names, avatar).
    async fn update_profile(&mut self, user: &User) -> Result<User, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn begin(&self) -> Result<Box<dyn UserTx>, StoreError> {
        let tx = self.db.begin().await?;
        Ok(Box::new(PgUserTx { tx }))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(User::from))
    }

    async fn list(&self, filter: &UserFilter) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            SELECT {USER_COLUMNS}
              FROM users
             WHERE ($1::text IS NULL OR role = $1)
               AND ($2::bool IS NULL OR is_active = $2)
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.role.map(|r| r.as_str()))
        .bind(filter.is_active)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn update_names(
        &self,
        id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
               SET first_name = $2, last_name = $3, updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(first_name)
        .bind(last_name)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(User::from))
    }

    async fn update_role(&self, id: Uuid, role: Role) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
               SET role = $2, updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(role.as_str())
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(User::from))
    }

    async fn delete_by_external_id(&self, external_id: &str) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM users WHERE external_id = $1")
            .bind(external_id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}

pub struct PgUserTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UserTx for PgUserTx {
    async fn find_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(User::from))
    }

    async fn find_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(User::from))
    }

    async fn insert(&mut self, new: &NewUser) -> Result<User, StoreError> {
        // Savepoint: a unique violation must not poison the outer transaction.
        let mut sp = self.tx.begin().await?;
        let res = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (external_id, email, first_name, last_name, avatar_url, role)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(new.external_id.as_deref())
        .bind(&new.email)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(new.avatar_url.as_deref())
        .bind(new.role.as_str())
        .fetch_one(&mut *sp)
        .await;

        match res {
            Ok(row) => {
                sp.commit().await?;
                debug!(user_id = %row.id, "user row inserted");
                Ok(row.into())
            }
            Err(e) => {
                sp.rollback().await?;
                Err(e.into())
            }
        }
    }

    async fn update_profile(&mut self, user: &User) -> Result<User, StoreError> {
        let mut sp = self.tx.begin().await?;
        let res = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
               SET external_id = $2,
                   email = $3,
                   first_name = $4,
                   last_name = $5,
                   avatar_url = $6,
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user.id)
        .bind(user.external_id.as_deref())
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.avatar_url.as_deref())
        .fetch_one(&mut *sp)
        .await;

        match res {
            Ok(row) => {
                sp.commit().await?;
                debug!(user_id = %row.id, "user row updated");
                Ok(row.into())
            }
            Err(e) => {
                sp.rollback().await?;
                Err(e.into())
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
