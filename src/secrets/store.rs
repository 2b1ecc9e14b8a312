use super::errors::SecretStoreError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Boxed future returned by [`SecretStore`] calls.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SecretStoreError>> + Send + 'a>>;

/// Identifies the object that owns a secret.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerReference {
    /// Kind of the owning object.
    pub kind: String,
    /// Name of the owning object.
    pub name: String,
    /// Unique id of the owning object.
    pub uid: String,
}

impl OwnerReference {
    /// Creates an owner reference.
    pub fn new(kind: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

/// A named secret object: owner plus a map of binary data entries.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    /// Secret name, unique within the store.
    pub name: String,
    /// Owning object, if any.
    pub owner: Option<OwnerReference>,
    /// Data entries.
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Creates an empty, unowned secret.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            data: BTreeMap::new(),
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Returns the data entry under `key`, treating an empty value as absent.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data
            .get(key)
            .map(Vec::as_slice)
            .filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values hold private keys.
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Persistent storage of named secrets.
///
/// `get` must report a missing secret as [`SecretStoreError::NotFound`]; callers rely on it
/// to tell "nothing stored yet" apart from an API failure. `put` creates or replaces.
pub trait SecretStore: Send + Sync + 'static {
    /// Fetches the secret called `name`.
    fn get<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Secret>;

    /// Creates or replaces `secret`.
    fn put(&self, secret: Secret) -> StoreFuture<'_, ()>;

    /// Deletes the secret called `name`.
    fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()>;
}

/// [`SecretStore`] kept in process memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<String, Secret>>,
    failing_calls: AtomicU32,
    calls: AtomicU32,
}

impl InMemorySecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `secret` directly, bypassing failure injection.
    pub fn insert(&self, secret: Secret) {
        self.lock().insert(secret.name.clone(), secret);
    }

    /// Returns a copy of the secret called `name`, bypassing failure injection.
    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.lock().get(name).cloned()
    }

    /// Names of all stored secrets, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Makes the next `calls` store calls fail with [`SecretStoreError::Api`].
    pub fn fail_next(&self, calls: u32) {
        self.failing_calls.store(calls, Ordering::SeqCst);
    }

    /// Number of `get`/`put`/`delete` calls served so far, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Secret>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.secrets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn begin_call(&self) -> Result<(), SecretStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SecretStoreError::Api("injected failure".to_string()));
        }
        Ok(())
    }
}

impl SecretStore for InMemorySecretStore {
    fn get<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Secret> {
        Box::pin(async move {
            self.begin_call()?;
            self.lock()
                .get(name)
                .cloned()
                .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
        })
    }

    fn put(&self, secret: Secret) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.begin_call()?;
            self.lock().insert(secret.name.clone(), secret);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.begin_call()?;
            self.lock()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_put_delete() {
        let store = InMemorySecretStore::new();
        assert_eq!(
            store.get("a").await.unwrap_err(),
            SecretStoreError::NotFound("a".to_string())
        );

        store
            .put(Secret::new("a").with_data("k", b"v".to_vec()))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().get("k"), Some(&b"v"[..]));

        store.delete("a").await.unwrap();
        assert!(store.delete("a").await.unwrap_err().is_not_found());
        assert_eq!(store.calls(), 5);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_per_call() {
        let store = InMemorySecretStore::new();
        store.insert(Secret::new("a"));
        store.fail_next(2);

        assert!(matches!(store.get("a").await, Err(SecretStoreError::Api(_))));
        assert!(matches!(store.get("a").await, Err(SecretStoreError::Api(_))));
        assert!(store.get("a").await.is_ok());
    }

    #[test]
    fn empty_values_count_as_absent_and_debug_hides_values() {
        let secret = Secret::new("s")
            .with_data("key.pem", b"PRIVATE".to_vec())
            .with_data("empty", Vec::new());
        assert_eq!(secret.get("empty"), None);

        let debug = format!("{secret:?}");
        assert!(debug.contains("key.pem"));
        assert!(!debug.contains("PRIVATE"));
    }
}
