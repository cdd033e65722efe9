//! Document store over Sled.
//!
//! Every document lives in one tree under a `collection/id` key, the same
//! addressing the web client uses for its collections. Keeping a single tree
//! means any read-check-write sequence can run in one Sled transaction, and
//! optimistic version keys (`_versions/...`) live next to the documents they
//! guard.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Db;

use crate::error::{AppError, AppResult};

/// Firestore-style collection names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Bookings,
    AccessCodes,
    Users,
    Amenities,
    Communities,
    CommunityNotifications,
    Invites,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Collection::Bookings => "bookings",
            Collection::AccessCodes => "accessCodes",
            Collection::Users => "users",
            Collection::Amenities => "amenities",
            Collection::Communities => "communities",
            Collection::CommunityNotifications => "communityNotifications",
            Collection::Invites => "invites",
        }
    }
}

fn doc_key(collection: Collection, id: &str) -> Vec<u8> {
    format!("{}/{}", collection.name(), id).into_bytes()
}

fn prefix(collection: Collection) -> Vec<u8> {
    format!("{}/", collection.name()).into_bytes()
}

fn version_key(key: &str) -> Vec<u8> {
    format!("_versions/{key}").into_bytes()
}

fn decode_version(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if bytes.len() == 8 {
        buf.copy_from_slice(bytes);
    }
    u64::from_be_bytes(buf)
}

/// Result type inside a store transaction. Returning `Abort` rolls back and
/// surfaces the wrapped error from [`Storage::transaction`].
pub type TxResult<T> = Result<T, ConflictableTransactionError<AppError>>;

pub fn abort<T>(err: AppError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDeleteReport {
    pub deleted: usize,
    pub batches: usize,
}

#[derive(Clone)] // Sled handles are cheap to clone
pub struct Storage {
    db: Db,
    docs: sled::Tree,
}

impl Storage {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Store that disappears when dropped.
    pub fn temporary() -> AppResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> AppResult<Self> {
        let docs = db.open_tree("docs")?;
        Ok(Self { db, docs })
    }

    pub fn get<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> AppResult<Option<T>> {
        match self.docs.get(doc_key(collection, id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, collection: Collection, id: &str) -> AppResult<bool> {
        Ok(self.docs.contains_key(doc_key(collection, id))?)
    }

    /// Upsert.
    pub fn put<T: Serialize>(&self, collection: Collection, id: &str, doc: &T) -> AppResult<()> {
        let bytes = serde_json::to_vec(doc)?;
        self.docs.insert(doc_key(collection, id), bytes)?;
        Ok(())
    }

    /// Insert only if no document with this id exists. Returns `false` when
    /// the id is taken.
    pub fn create<T: Serialize>(&self, collection: Collection, id: &str, doc: &T) -> AppResult<bool> {
        let bytes = serde_json::to_vec(doc)?;
        let swapped = self
            .docs
            .compare_and_swap(doc_key(collection, id), None as Option<&[u8]>, Some(bytes))?;
        Ok(swapped.is_ok())
    }

    pub fn delete(&self, collection: Collection, id: &str) -> AppResult<bool> {
        Ok(self.docs.remove(doc_key(collection, id))?.is_some())
    }

    /// Every document of a collection, in key order.
    pub fn list<T: DeserializeOwned>(&self, collection: Collection) -> AppResult<Vec<T>> {
        let mut docs = vec![];
        for item in self.docs.scan_prefix(prefix(collection)) {
            let (_, value) = item?;
            docs.push(serde_json::from_slice(&value)?);
        }
        Ok(docs)
    }

    /// Full scan with a filter, the equivalent of a `where` query.
    pub fn find<T, F>(&self, collection: Collection, predicate: F) -> AppResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let mut docs = vec![];
        for item in self.docs.scan_prefix(prefix(collection)) {
            let (_, value) = item?;
            let doc: T = serde_json::from_slice(&value)?;
            if predicate(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Delete documents in sequential batches of at most `batch_size`; each
    /// batch is applied before the next one is built.
    pub fn delete_in_batches(
        &self,
        collection: Collection,
        ids: &[String],
        batch_size: usize,
    ) -> AppResult<BatchDeleteReport> {
        let mut report = BatchDeleteReport {
            deleted: 0,
            batches: 0,
        };
        for chunk in ids.chunks(batch_size.max(1)) {
            let mut batch = sled::Batch::default();
            let mut in_batch = 0;
            for id in chunk {
                let key = doc_key(collection, id);
                if self.docs.contains_key(&key)? {
                    batch.remove(key);
                    in_batch += 1;
                }
            }
            self.docs.apply_batch(batch)?;
            report.deleted += in_batch;
            report.batches += 1;
            tracing::debug!(
                collection = collection.name(),
                batch = report.batches,
                deleted = in_batch,
                "batch committed"
            );
        }
        Ok(report)
    }

    /// Current value of an optimistic version key (0 when never written).
    pub fn version(&self, key: &str) -> AppResult<u64> {
        Ok(self
            .docs
            .get(version_key(key))?
            .map(|v| decode_version(&v))
            .unwrap_or(0))
    }

    pub fn bump_version(&self, key: &str) -> AppResult<u64> {
        self.transaction(|tx| tx.bump_version(key))
    }

    /// Run `f` atomically. Sled may call `f` more than once on conflict, so it
    /// must not have side effects outside the transaction.
    pub fn transaction<R, F>(&self, f: F) -> AppResult<R>
    where
        F: Fn(&Txn<'_>) -> TxResult<R>,
    {
        match self.docs.transaction(|tree| f(&Txn { tree })) {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    pub async fn flush(&self) -> AppResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// Typed view over a Sled transactional tree.
pub struct Txn<'a> {
    tree: &'a TransactionalTree,
}

impl Txn<'_> {
    pub fn get<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> TxResult<Option<T>> {
        match self.tree.get(doc_key(collection, id))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ConflictableTransactionError::Abort(e.into())),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, collection: Collection, id: &str, doc: &T) -> TxResult<()> {
        let bytes =
            serde_json::to_vec(doc).map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
        self.tree.insert(doc_key(collection, id), bytes)?;
        Ok(())
    }

    pub fn delete(&self, collection: Collection, id: &str) -> TxResult<()> {
        self.tree.remove(doc_key(collection, id))?;
        Ok(())
    }

    /// Abort with a conflict if someone else bumped `key` since `expected`
    /// was read.
    pub fn expect_version(&self, key: &str, expected: u64) -> TxResult<()> {
        let current = self
            .tree
            .get(version_key(key))?
            .map(|v| decode_version(&v))
            .unwrap_or(0);
        if current != expected {
            return abort(AppError::Conflict(format!(
                "{key} changed concurrently (expected version {expected}, found {current})"
            )));
        }
        Ok(())
    }

    pub fn bump_version(&self, key: &str) -> TxResult<u64> {
        let next = self
            .tree
            .get(version_key(key))?
            .map(|v| decode_version(&v))
            .unwrap_or(0)
            + 1;
        self.tree
            .insert(version_key(key), next.to_be_bytes().to_vec())?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Doc {
        id: String,
        value: u32,
    }

    fn doc(id: &str, value: u32) -> Doc {
        Doc {
            id: id.to_string(),
            value,
        }
    }

    #[test]
    fn put_get_and_scan_stay_inside_collection() {
        let storage = Storage::temporary().expect("temporary store");
        storage.put(Collection::Bookings, "a", &doc("a", 1)).unwrap();
        storage.put(Collection::Bookings, "b", &doc("b", 2)).unwrap();
        storage.put(Collection::Amenities, "a", &doc("a", 9)).unwrap();

        let fetched: Option<Doc> = storage.get(Collection::Bookings, "a").unwrap();
        assert_eq!(fetched, Some(doc("a", 1)));

        let bookings: Vec<Doc> = storage.list(Collection::Bookings).unwrap();
        assert_eq!(bookings.len(), 2);

        let big: Vec<Doc> = storage.find(Collection::Bookings, |d: &Doc| d.value > 1).unwrap();
        assert_eq!(big, vec![doc("b", 2)]);
    }

    #[test]
    fn create_refuses_existing_ids() {
        let storage = Storage::temporary().unwrap();
        assert!(storage.create(Collection::Users, "x", &doc("x", 1)).unwrap());
        assert!(!storage.create(Collection::Users, "x", &doc("x", 2)).unwrap());
        let kept: Doc = storage.get(Collection::Users, "x").unwrap().unwrap();
        assert_eq!(kept.value, 1);
    }

    #[test]
    fn batched_delete_reports_true_count() {
        let storage = Storage::temporary().unwrap();
        let mut ids = vec![];
        for i in 0..1203 {
            let id = format!("b{i}");
            storage.put(Collection::Bookings, &id, &doc(&id, i)).unwrap();
            ids.push(id);
        }
        ids.push("missing".to_string());

        let report = storage
            .delete_in_batches(Collection::Bookings, &ids, 500)
            .unwrap();
        assert_eq!(report.deleted, 1203);
        assert_eq!(report.batches, 3);
        assert!(storage.list::<Doc>(Collection::Bookings).unwrap().is_empty());
    }

    #[test]
    fn stale_version_aborts_transaction() {
        let storage = Storage::temporary().unwrap();
        let seen = storage.version("amenity/pool").unwrap();
        storage.bump_version("amenity/pool").unwrap();

        let result = storage.transaction(|tx| {
            tx.expect_version("amenity/pool", seen)?;
            tx.put(Collection::Bookings, "late", &doc("late", 1))
        });
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert!(!storage.exists(Collection::Bookings, "late").unwrap());
        assert_eq!(storage.version("amenity/pool").unwrap(), 1);
    }
}
