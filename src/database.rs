use log::debug;

use crate::btree::PutMode;
use crate::config::TableOptions;
use crate::constants::{DbFlags, WriteFlags};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::page;
use crate::transaction::Transaction;
use crate::types::Stat;

/// Handle of the unnamed main table
pub(crate) const MAIN_DBI: u32 = 0;

/// Catalog key of the main table; named tables never use the empty name
const MAIN_NAME: &[u8] = b"";

/// A registered table handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableSlot {
    pub(crate) name: Vec<u8>,
    pub(crate) flags: DbFlags,
}

/// Table handles of an environment, indexed by dbi
#[derive(Debug)]
pub(crate) struct TableRegistry {
    slots: Vec<Option<TableSlot>>,
    /// Named tables allowed besides the main one
    max: usize,
}

impl TableRegistry {
    pub(crate) fn new(max_tables: u32) -> Self {
        TableRegistry {
            slots: vec![Some(TableSlot {
                name: MAIN_NAME.to_vec(),
                flags: DbFlags::empty(),
            })],
            max: max_tables as usize,
        }
    }

    fn find(&self, name: &[u8]) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.name == name))
            .map(|i| i as u32)
    }

    /// Handle for `name`, and whether it was newly registered
    pub(crate) fn register(&mut self, name: &[u8], flags: DbFlags) -> Result<(u32, bool)> {
        if let Some(dbi) = self.find(name) {
            self.set_flags(dbi, flags);
            return Ok((dbi, false));
        }
        let slot = Some(TableSlot {
            name: name.to_vec(),
            flags,
        });
        if let Some(free) = self.slots.iter().skip(1).position(Option::is_none) {
            let dbi = free + 1;
            self.slots[dbi] = slot;
            return Ok((dbi as u32, true));
        }
        if self.slots.len() > self.max {
            return Err(Error::TablesFull);
        }
        self.slots.push(slot);
        Ok(((self.slots.len() - 1) as u32, true))
    }

    pub(crate) fn get(&self, dbi: u32) -> Option<TableSlot> {
        self.slots.get(dbi as usize).cloned().flatten()
    }

    pub(crate) fn release(&mut self, dbi: u32) {
        if dbi != MAIN_DBI {
            if let Some(slot) = self.slots.get_mut(dbi as usize) {
                *slot = None;
            }
        }
    }

    pub(crate) fn set_flags(&mut self, dbi: u32, flags: DbFlags) {
        if let Some(Some(slot)) = self.slots.get_mut(dbi as usize) {
            slot.flags = flags;
        }
    }
}

/// Handle of a table, valid in every transaction of its environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Database {
    /// Table identifier
    dbi: u32,
    /// Environment the handle was opened in
    env_id: u64,
}

impl Database {
    pub(crate) fn dbi(&self) -> u32 {
        self.dbi
    }

    pub(crate) fn env_id(&self) -> u64 {
        self.env_id
    }

    /// Open an existing table, or the main table when `name` is `None`.
    ///
    /// Empty options adopt the stored layout; anything else must match it
    /// unless `accede` is set. A missing named table gives `NotFound`.
    pub fn open(txn: &Transaction, name: Option<&str>, options: TableOptions) -> Result<Database> {
        let key = table_key(name, txn.meta()?.page_size())?;
        let requested = options.flags();
        match txn.record(key)? {
            Some(record) => Self::adopt(txn, key, record.flags, requested, options, false),
            None if name.is_none() => Self::register(txn, key, requested).map(|(db, _)| db),
            None => Err(Error::NotFound),
        }
    }

    /// Open a table, creating it if absent
    pub fn create(txn: &mut Transaction, name: Option<&str>, options: TableOptions) -> Result<Database> {
        let key = table_key(name, txn.meta()?.page_size())?;
        let requested = options.flags();
        if let Some(record) = txn.record(key)? {
            return Self::adopt(txn, key, record.flags, requested, options, true);
        }
        txn.write_state()?;
        let (db, registered) = Self::register(txn, key, requested)?;
        let w = txn.write_state()?;
        w.create_table(db.dbi, key.to_vec(), requested, registered);
        debug!("created table {:?} as dbi {}", name, db.dbi);
        Ok(db)
    }

    /// Open with the packed flag word; `CREATE` selects [`Database::create`]
    pub fn open_with_flags(txn: &mut Transaction, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        let options = TableOptions::from_flags(flags)?;
        if options.create {
            Self::create(txn, name, options)
        } else {
            Self::open(txn, name, options)
        }
    }

    fn adopt(
        txn: &Transaction,
        key: &[u8],
        stored: DbFlags,
        requested: DbFlags,
        options: TableOptions,
        create: bool,
    ) -> Result<Database> {
        let relaxed = requested.is_empty() && !create;
        if !relaxed && requested != stored {
            let accede = options.accede || txn.env_inner()?.config.read().accede;
            if !accede {
                return Err(Error::Incompatible);
            }
        }
        Self::register(txn, key, stored).map(|(db, _)| db)
    }

    fn register(txn: &Transaction, key: &[u8], flags: DbFlags) -> Result<(Database, bool)> {
        let env = txn.env_inner()?;
        let (dbi, registered) = env.tables.write().register(key, flags)?;
        Ok((
            Database {
                dbi,
                env_id: env.id,
            },
            registered,
        ))
    }

    /// Persistent flags of the table
    pub fn flags(&self, txn: &Transaction) -> Result<DbFlags> {
        Ok(txn.table(self)?.flags)
    }

    /// Statistics of the table
    pub fn stat(&self, txn: &Transaction) -> Result<Stat> {
        let tree = txn.table(self)?;
        Ok(tree.info.stat(txn.meta()?.page_size()))
    }

    /// Delete the table and invalidate the handle once committed. The main
    /// table is emptied instead.
    pub fn drop_table(self, txn: &mut Transaction) -> Result<()> {
        self.drop_inner(txn, true)
    }

    /// Remove every entry, keeping the table
    pub fn clear(&self, txn: &mut Transaction) -> Result<()> {
        self.drop_inner(txn, false)
    }

    fn drop_inner(&self, txn: &mut Transaction, delete: bool) -> Result<()> {
        let slot = txn.env_inner()?.check_handle(self)?;
        let result = txn
            .write_state()
            .and_then(|w| w.drop_table(self.dbi, &slot, delete));
        txn.note(result)
    }

    /// First value stored under `key`
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_with_count(txn, key)?.map(|(value, _)| value))
    }

    /// Like [`Database::get`], with a missing key reported as `NotFound`
    pub fn get_or_err(&self, txn: &Transaction, key: &[u8]) -> Result<Vec<u8>> {
        self.get(txn, key)?.ok_or(Error::NotFound)
    }

    /// First value under `key` and the number of values it holds
    pub fn get_with_count(&self, txn: &Transaction, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>> {
        let tree = txn.table(self)?;
        tree.get(&txn.view()?, key)
    }

    /// Insert a new pair; `KeyExist` if the key (or, with duplicates, the
    /// pair) is already stored
    pub fn insert(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_mode(txn, key, value, PutMode::Insert)
    }

    /// Insert, or overwrite the value of a single-value key
    pub fn upsert(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_mode(txn, key, value, PutMode::Upsert)
    }

    /// Overwrite the only value of an existing key
    pub fn update(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_mode(txn, key, value, PutMode::Update)
    }

    /// Store a pair as directed by write flags
    pub fn put(&self, txn: &mut Transaction, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.put_mode(txn, key, value, put_mode(flags)?)
    }

    pub(crate) fn put_mode(&self, txn: &mut Transaction, key: &[u8], value: &[u8], mode: PutMode) -> Result<()> {
        txn.write_table(self, |w, tree| tree.put(w, key, value, mode))
    }

    /// Remove `key` with all its values; `false` if it was absent
    pub fn erase(&self, txn: &mut Transaction, key: &[u8]) -> Result<bool> {
        txn.write_table(self, |w, tree| tree.erase_key(w, key))
    }

    /// Remove one pair; `false` if it was absent
    pub fn erase_pair(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<bool> {
        txn.write_table(self, |w, tree| tree.erase_pair(w, key, value))
    }

    /// Remove `key`, or only the pair when `value` is given, failing with
    /// `NotFound` when nothing matches
    pub fn del(&self, txn: &mut Transaction, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let erased = match value {
            Some(value) => self.erase_pair(txn, key, value)?,
            None => self.erase(txn, key)?,
        };
        if erased {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Set the single value of `key` to `new`, or remove it when `new` is
    /// `None`. Returns the previous value.
    pub fn replace(&self, txn: &mut Transaction, key: &[u8], new: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        txn.write_table(self, |w, tree| {
            let old = match tree.get(w, key)? {
                Some((_, count)) if count > 1 => return Err(Error::MultipleValues),
                Some((value, _)) => Some(value),
                None => None,
            };
            match new {
                Some(value) if old.is_some() => tree.put(w, key, value, PutMode::Update)?,
                Some(value) => tree.put(w, key, value, PutMode::Insert)?,
                None => {
                    tree.erase_key(w, key)?;
                }
            }
            Ok(old)
        })
    }

    /// Swap one specific pair for another value under the same key, or
    /// remove it when `new` is `None`. `NotFound` if the pair is absent.
    pub fn replace_duplicate(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        old: &[u8],
        new: Option<&[u8]>,
    ) -> Result<()> {
        txn.write_table(self, |w, tree| {
            if !tree.erase_pair(w, key, old)? {
                return Err(Error::NotFound);
            }
            if let Some(value) = new {
                tree.put(w, key, value, PutMode::Upsert)?;
            }
            Ok(())
        })
    }

    /// Open a cursor over this table in `txn`
    pub fn cursor(&self, txn: &Transaction) -> Result<Cursor> {
        Cursor::open(txn, *self)
    }
}

/// Catalog key of a table name
fn table_key(name: Option<&str>, psize: usize) -> Result<&[u8]> {
    match name {
        Some("") => Err(Error::Invalid),
        Some(name) if name.len() > page::max_table_name(psize) => Err(Error::BadValSize),
        Some(name) => Ok(name.as_bytes()),
        None => Ok(MAIN_NAME),
    }
}

/// Map write flags onto a put mode
pub(crate) fn put_mode(flags: WriteFlags) -> Result<PutMode> {
    if flags.contains(WriteFlags::CURRENT | WriteFlags::NOOVERWRITE) {
        return Err(Error::Invalid);
    }
    Ok(if flags.contains(WriteFlags::CURRENT) {
        PutMode::Update
    } else if flags.contains(WriteFlags::NOOVERWRITE) {
        PutMode::InsertKey
    } else if flags.contains(WriteFlags::NODUPDATA) {
        PutMode::Insert
    } else {
        PutMode::Upsert
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_reuses_released_slots() {
        let mut registry = TableRegistry::new(2);
        let (a, new_a) = registry.register(b"a", DbFlags::empty()).unwrap();
        let (b, _) = registry.register(b"b", DbFlags::DUPSORT).unwrap();
        assert!(new_a);
        assert_eq!((a, b), (1, 2));
        assert!(matches!(
            registry.register(b"c", DbFlags::empty()),
            Err(Error::TablesFull)
        ));

        assert_eq!(registry.register(b"a", DbFlags::empty()).unwrap(), (1, false));
        registry.release(a);
        assert!(registry.get(a).is_none());
        assert_eq!(registry.register(b"c", DbFlags::empty()).unwrap(), (1, true));
        assert_eq!(registry.get(b).unwrap().flags, DbFlags::DUPSORT);
        assert_eq!(registry.get(1).unwrap().name, b"c".to_vec());
    }

    #[test]
    fn test_main_slot_is_permanent() {
        let mut registry = TableRegistry::new(0);
        registry.release(MAIN_DBI);
        assert_eq!(registry.get(MAIN_DBI).unwrap().name, MAIN_NAME);
        assert!(matches!(
            registry.register(b"x", DbFlags::empty()),
            Err(Error::TablesFull)
        ));
    }

    #[test]
    fn test_write_flags_mapping() {
        assert_eq!(put_mode(WriteFlags::empty()).unwrap(), PutMode::Upsert);
        assert_eq!(put_mode(WriteFlags::NOOVERWRITE).unwrap(), PutMode::InsertKey);
        assert_eq!(put_mode(WriteFlags::NODUPDATA).unwrap(), PutMode::Insert);
        assert_eq!(put_mode(WriteFlags::CURRENT).unwrap(), PutMode::Update);
        assert!(matches!(
            put_mode(WriteFlags::CURRENT | WriteFlags::NOOVERWRITE),
            Err(Error::Invalid)
        ));
    }

    #[test]
    fn test_table_key() {
        assert_eq!(table_key(None, 4096).unwrap(), b"");
        assert_eq!(table_key(Some("t"), 4096).unwrap(), b"t");
        assert!(matches!(table_key(Some(""), 4096), Err(Error::Invalid)));
        let longest = "n".repeat(page::max_table_name(4096));
        assert!(table_key(Some(&longest), 4096).is_ok());
        let long = "n".repeat(page::max_table_name(4096) + 1);
        assert!(matches!(table_key(Some(&long), 4096), Err(Error::BadValSize)));
    }
}
