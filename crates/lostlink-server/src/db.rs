//! Async access to the synchronous store.
//!
//! Every call takes the connection lock on a blocking thread, so a slow
//! query never stalls a connection task.

use std::sync::{Arc, Mutex};

use lostlink_store::{Database, StoreError};

use crate::error::ServerError;

#[derive(Clone)]
pub struct Db {
    inner: Arc<Mutex<Database>>,
}

impl Db {
    pub fn new(database: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(database)),
        }
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn call<F, R>(&self, f: F) -> Result<R, ServerError>
    where
        F: FnOnce(&mut Database) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = inner
                .lock()
                .map_err(|_| ServerError::Internal("database lock poisoned".into()))?;
            f(&mut *db).map_err(ServerError::from)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use lostlink_shared::Identity;

    use super::*;

    #[tokio::test]
    async fn test_call_runs_store_operation() {
        let db = Db::new(Database::open_in_memory().unwrap());
        let a = Identity::new("a@x.org").unwrap();
        let b = Identity::new("b@x.org").unwrap();

        let (from, to) = (a.clone(), b.clone());
        let msg = db
            .call(move |db| db.insert_message(&from, &to, "hello"))
            .await
            .unwrap();
        assert_eq!(msg.text, "hello");

        let err = db.call(|db| db.get_message(404)).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }
}
