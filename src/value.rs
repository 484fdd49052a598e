use std::borrow::Cow;
use std::marker::PhantomData;

use crate::config::TableOptions;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Conversion between a Rust type and stored bytes
pub trait Value: Sized {
    fn to_bytes(&self) -> Cow<'_, [u8]>;

    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

/// Types usable as keys. Integers encode in native byte order, matching
/// tables opened with integer keys.
pub trait Key: Value {}

impl Value for Vec<u8> {
    fn to_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Value for String {
    fn to_bytes(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::BadValSize)
    }
}

macro_rules! int_value {
    ($($t:ty),*) => {
        $(
            impl Value for $t {
                fn to_bytes(&self) -> Cow<'_, [u8]> {
                    Cow::Owned(self.to_ne_bytes().to_vec())
                }

                fn from_bytes(bytes: &[u8]) -> Result<Self> {
                    let raw = bytes.try_into().map_err(|_| Error::BadValSize)?;
                    Ok(<$t>::from_ne_bytes(raw))
                }
            }

            impl Key for $t {}
        )*
    };
}

int_value!(u32, u64);

impl Key for Vec<u8> {}
impl Key for String {}

/// A table whose keys and values are converted through [`Key`] and [`Value`]
#[derive(Debug)]
pub struct TypedDatabase<K, V> {
    db: Database,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedDatabase<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for TypedDatabase<K, V> {}

impl<K: Key, V: Value> TypedDatabase<K, V> {
    pub fn new(db: Database) -> Self {
        TypedDatabase {
            db,
            _types: PhantomData,
        }
    }

    /// Open an existing table
    pub fn open(txn: &Transaction, name: Option<&str>, options: TableOptions) -> Result<Self> {
        Database::open(txn, name, options).map(Self::new)
    }

    /// Open a table, creating it if absent
    pub fn create(txn: &mut Transaction, name: Option<&str>, options: TableOptions) -> Result<Self> {
        Database::create(txn, name, options).map(Self::new)
    }

    /// Untyped handle
    pub fn database(&self) -> Database {
        self.db
    }

    pub fn get(&self, txn: &Transaction, key: &K) -> Result<Option<V>> {
        self.db
            .get(txn, &key.to_bytes())?
            .map(|bytes| V::from_bytes(&bytes))
            .transpose()
    }

    pub fn insert(&self, txn: &mut Transaction, key: &K, value: &V) -> Result<()> {
        self.db.insert(txn, &key.to_bytes(), &value.to_bytes())
    }

    pub fn upsert(&self, txn: &mut Transaction, key: &K, value: &V) -> Result<()> {
        self.db.upsert(txn, &key.to_bytes(), &value.to_bytes())
    }

    pub fn update(&self, txn: &mut Transaction, key: &K, value: &V) -> Result<()> {
        self.db.update(txn, &key.to_bytes(), &value.to_bytes())
    }

    pub fn erase(&self, txn: &mut Transaction, key: &K) -> Result<bool> {
        self.db.erase(txn, &key.to_bytes())
    }

    /// All pairs in key order
    pub fn entries(&self, txn: &Transaction) -> Result<Vec<(K, V)>> {
        let mut cursor = self.db.cursor(txn)?;
        cursor
            .iter(txn)
            .map(|pair| {
                let (k, v) = pair?;
                Ok((K::from_bytes(&k)?, V::from_bytes(&v)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_codec() {
        let bytes = 7u32.to_bytes();
        assert_eq!(bytes.len(), 4);
        assert_eq!(u32::from_bytes(&bytes).unwrap(), 7);
        assert!(matches!(u64::from_bytes(&bytes), Err(Error::BadValSize)));
    }

    #[test]
    fn test_string_codec() {
        let s = String::from("value");
        assert_eq!(s.to_bytes().as_ref(), b"value");
        assert_eq!(String::from_bytes(b"value").unwrap(), "value");
        assert!(String::from_bytes(&[0xff, 0xfe]).is_err());
    }
}
