//! In-process `UserStore` used by tests and `AppState::fake`.
//!
//! Writes apply immediately so concurrent transactions observe each other the
//! way Postgres does after a blocking unique-index check; an undo log restores
//! the previous state when a transaction is rolled back or dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo::{StoreError, UserStore, UserTx};
use super::repo_types::{NewUser, Role, User, UserFilter};

#[derive(Clone, Default)]
pub struct MemoryUserStore {
    rows: Arc<Mutex<Vec<User>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row directly, bypassing any transaction.
    pub fn seed(&self, new: NewUser) -> User {
        let mut rows = lock(&self.rows);
        let user = materialize(new);
        rows.push(user.clone());
        user
    }

    pub fn all(&self) -> Vec<User> {
        lock(&self.rows).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn set_active(&self, id: Uuid, active: bool) {
        if let Some(row) = lock(&self.rows).iter_mut().find(|u| u.id == id) {
            row.is_active = active;
        }
    }
}

fn lock(rows: &Mutex<Vec<User>>) -> MutexGuard<'_, Vec<User>> {
    rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn materialize(new: NewUser) -> User {
    let now = OffsetDateTime::now_utc();
    User {
        id: Uuid::new_v4(),
        external_id: new.external_id,
        email: new.email,
        first_name: new.first_name,
        last_name: new.last_name,
        avatar_url: new.avatar_url,
        role: new.role,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

fn check_unique(rows: &[User], candidate: &User) -> Result<(), StoreError> {
    for row in rows.iter().filter(|r| r.id != candidate.id) {
        if row.email == candidate.email {
            return Err(StoreError::UniqueViolation {
                constraint: Some("users_email_key".into()),
            });
        }
        if row.external_id.is_some() && row.external_id == candidate.external_id {
            return Err(StoreError::UniqueViolation {
                constraint: Some("users_external_id_key".into()),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn begin(&self) -> Result<Box<dyn UserTx>, StoreError> {
        Ok(Box::new(MemoryUserTx {
            rows: self.rows.clone(),
            undo: Vec::new(),
        }))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(lock(&self.rows).iter().find(|u| u.id == id).cloned())
    }

    async fn list(&self, filter: &UserFilter) -> Result<Vec<User>, StoreError> {
        let mut rows: Vec<User> = lock(&self.rows)
            .iter()
            .filter(|u| filter.role.map_or(true, |r| u.role == r))
            .filter(|u| filter.is_active.map_or(true, |a| u.is_active == a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn update_names(
        &self,
        id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> Result<Option<User>, StoreError> {
        let mut rows = lock(&self.rows);
        Ok(rows.iter_mut().find(|u| u.id == id).map(|u| {
            u.first_name = first_name.to_string();
            u.last_name = last_name.to_string();
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }

    async fn update_role(&self, id: Uuid, role: Role) -> Result<Option<User>, StoreError> {
        let mut rows = lock(&self.rows);
        Ok(rows.iter_mut().find(|u| u.id == id).map(|u| {
            u.role = role;
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }

    async fn delete_by_external_id(&self, external_id: &str) -> Result<u64, StoreError> {
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|u| u.external_id.as_deref() != Some(external_id));
        Ok((before - rows.len()) as u64)
    }
}

enum Undo {
    Inserted(Uuid),
    Updated(User),
}

pub struct MemoryUserTx {
    rows: Arc<Mutex<Vec<User>>>,
    undo: Vec<Undo>,
}

impl MemoryUserTx {
    fn revert(&mut self) {
        let mut rows = lock(&self.rows);
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Inserted(id) => rows.retain(|u| u.id != id),
                Undo::Updated(previous) => {
                    if let Some(row) = rows.iter_mut().find(|u| u.id == previous.id) {
                        *row = previous;
                    }
                }
            }
        }
    }
}

impl Drop for MemoryUserTx {
    fn drop(&mut self) {
        self.revert();
    }
}

#[async_trait]
impl UserTx for MemoryUserTx {
    async fn find_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<User>, StoreError> {
        Ok(lock(&self.rows)
            .iter()
            .find(|u| u.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(lock(&self.rows).iter().find(|u| u.email == email).cloned())
    }

    async fn insert(&mut self, new: &NewUser) -> Result<User, StoreError> {
        let user = materialize(new.clone());
        let mut rows = lock(&self.rows);
        check_unique(&rows, &user)?;
        rows.push(user.clone());
        self.undo.push(Undo::Inserted(user.id));
        Ok(user)
    }

    async fn update_profile(&mut self, user: &User) -> Result<User, StoreError> {
        let mut rows = lock(&self.rows);
        check_unique(&rows, user)?;
        let Some(row) = rows.iter_mut().find(|u| u.id == user.id) else {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        };
        self.undo.push(Undo::Updated(row.clone()));
        row.external_id = user.external_id.clone();
        row.email = user.email.clone();
        row.first_name = user.first_name.clone();
        row.last_name = user.last_name.clone();
        row.avatar_url = user.avatar_url.clone();
        row.updated_at = OffsetDateTime::now_utc();
        Ok(row.clone())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.undo.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.revert();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(external_id: Option<&str>, email: &str) -> NewUser {
        NewUser {
            external_id: external_id.map(str::to_string),
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            avatar_url: None,
            role: Role::Unassigned,
        }
    }

    #[tokio::test]
    async fn dropped_transaction_reverts_its_writes() {
        let store = MemoryUserStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(&new_user(Some("user_1"), "a@x.com")).await.unwrap();
            assert_eq!(store.count(), 1);
        }
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn committed_transaction_keeps_its_writes() {
        let store = MemoryUserStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&new_user(Some("user_1"), "a@x.com")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn insert_enforces_unique_email_and_external_id() {
        let store = MemoryUserStore::new();
        store.seed(new_user(Some("user_1"), "a@x.com"));

        let mut tx = store.begin().await.unwrap();
        let dup_email = tx.insert(&new_user(Some("user_2"), "a@x.com")).await;
        assert!(matches!(dup_email, Err(StoreError::UniqueViolation { .. })));
        let dup_ext = tx.insert(&new_user(Some("user_1"), "b@x.com")).await;
        assert!(matches!(dup_ext, Err(StoreError::UniqueViolation { .. })));
    }

    #[tokio::test]
    async fn unlinked_rows_do_not_collide_on_external_id() {
        let store = MemoryUserStore::new();
        store.seed(new_user(None, "a@x.com"));
        let mut tx = store.begin().await.unwrap();
        tx.insert(&new_user(None, "b@x.com")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.count(), 2);
    }

    #[tokio::test]
    async fn rollback_restores_updated_row() {
        let store = MemoryUserStore::new();
        let seeded = store.seed(new_user(None, "a@x.com"));

        let mut tx = store.begin().await.unwrap();
        let mut changed = seeded.clone();
        changed.first_name = "Changed".into();
        tx.update_profile(&changed).await.unwrap();
        tx.rollback().await.unwrap();

        let row = store.find_by_id(seeded.id).await.unwrap().unwrap();
        assert_eq!(row.first_name, "");
    }
}
