use lumokv::{
    Database, DbFlags, DupOptions, EnvConfig, Environment, Error, KeyOrder, TableOptions,
    WriteFlags,
};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), EnvConfig::default().max_tables(4)).unwrap();
    (temp_dir, env)
}

fn dup_options() -> TableOptions {
    TableOptions::create().dup_sort(DupOptions::default())
}

#[test]
fn test_database_open_close() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();

    // Test opening default database
    let db = Database::open(&txn, None, Default::default()).unwrap();
    assert!(db.flags(&txn).unwrap().is_empty());

    // A named table must exist unless created
    assert!(matches!(
        Database::open(&txn, Some("testdb"), Default::default()),
        Err(Error::NotFound)
    ));
    let named = Database::create(&mut txn, Some("testdb"), TableOptions::create()).unwrap();
    assert_ne!(named, db);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let again = Database::open(&txn, Some("testdb"), Default::default()).unwrap();
    assert_eq!(again, named);
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    db.put(&mut txn, key, value, Default::default()).unwrap();
    let result = db.get(&txn, key).unwrap();
    assert_eq!(result.unwrap(), value);

    txn.commit().unwrap();
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get_or_err(&txn, key).unwrap(), value);
    assert!(matches!(db.get_or_err(&txn, b"missing"), Err(Error::NotFound)));
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    db.put(&mut txn, key, value, Default::default()).unwrap();
    db.put(&mut txn, b"other", b"kept", Default::default()).unwrap();
    assert!(db.get(&txn, key).unwrap().is_some());

    db.del(&mut txn, key, None).unwrap();
    assert!(db.get(&txn, key).unwrap().is_none());

    // Erasing again reports not-found and leaves other keys alone
    assert!(!db.erase(&mut txn, key).unwrap());
    assert!(matches!(db.del(&mut txn, key, None), Err(Error::NotFound)));
    assert_eq!(db.get(&txn, b"other").unwrap().unwrap(), b"kept");
    assert!(!txn.is_broken());
}

#[test]
fn test_insert_twice_fails() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();

    db.put(&mut txn, b"k", b"v", WriteFlags::NOOVERWRITE).unwrap();
    let result = db.put(&mut txn, b"k", b"v", WriteFlags::NOOVERWRITE);
    assert!(matches!(result, Err(Error::KeyExist)));
    assert!(matches!(db.insert(&mut txn, b"k", b"w"), Err(Error::KeyExist)));

    db.upsert(&mut txn, b"k", b"v").unwrap();
    db.upsert(&mut txn, b"k", b"w").unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap(), b"w");
    txn.commit().unwrap();
}

#[test]
fn test_update_semantics() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::create(&mut txn, Some("dups"), dup_options()).unwrap();

    assert!(matches!(db.update(&mut txn, b"k", b"x"), Err(Error::NotFound)));

    db.insert(&mut txn, b"single", b"one").unwrap();
    db.update(&mut txn, b"single", b"uno").unwrap();
    assert_eq!(db.get(&txn, b"single").unwrap().unwrap(), b"uno");

    db.insert(&mut txn, b"multi", b"a").unwrap();
    db.insert(&mut txn, b"multi", b"b").unwrap();
    let result = db.update(&mut txn, b"multi", b"c");
    assert!(matches!(result, Err(Error::MultipleValues)));
    assert_eq!(db.get_with_count(&txn, b"multi").unwrap().unwrap(), (b"a".to_vec(), 2));
}

#[test]
fn test_duplicate_pairs() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::create(&mut txn, Some("dups"), dup_options()).unwrap();

    db.insert(&mut txn, b"k", b"b").unwrap();
    db.insert(&mut txn, b"k", b"a").unwrap();
    assert!(matches!(db.insert(&mut txn, b"k", b"a"), Err(Error::KeyExist)));
    assert!(matches!(
        db.put(&mut txn, b"k", b"c", WriteFlags::NOOVERWRITE),
        Err(Error::KeyExist)
    ));
    assert!(matches!(
        db.put(&mut txn, b"k", b"a", WriteFlags::NODUPDATA),
        Err(Error::KeyExist)
    ));
    db.upsert(&mut txn, b"k", b"a").unwrap();
    db.upsert(&mut txn, b"k", b"c").unwrap();
    assert_eq!(db.get_with_count(&txn, b"k").unwrap().unwrap().1, 3);

    assert!(db.erase_pair(&mut txn, b"k", b"b").unwrap());
    assert!(!db.erase_pair(&mut txn, b"k", b"b").unwrap());
    db.del(&mut txn, b"k", Some(b"a")).unwrap();
    assert_eq!(db.get_with_count(&txn, b"k").unwrap().unwrap(), (b"c".to_vec(), 1));

    assert!(db.erase(&mut txn, b"k").unwrap());
    assert!(db.get(&txn, b"k").unwrap().is_none());
    assert_eq!(db.stat(&txn).unwrap().entries, 0);
}

#[test]
fn test_replace_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::create(&mut txn, Some("dups"), dup_options()).unwrap();

    assert_eq!(db.replace(&mut txn, b"k", Some(b"1")).unwrap(), None);
    assert_eq!(db.replace(&mut txn, b"k", Some(b"2")).unwrap(), Some(b"1".to_vec()));
    db.insert(&mut txn, b"k", b"3").unwrap();
    assert!(matches!(
        db.replace(&mut txn, b"k", Some(b"4")),
        Err(Error::MultipleValues)
    ));

    db.replace_duplicate(&mut txn, b"k", b"3", Some(b"0")).unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    let values: Vec<Vec<u8>> = cursor
        .iter_dup(&txn, b"k")
        .map(|pair| pair.unwrap().1)
        .collect();
    assert_eq!(values, vec![b"0".to_vec(), b"2".to_vec()]);

    assert!(matches!(
        db.replace_duplicate(&mut txn, b"k", b"9", None),
        Err(Error::NotFound)
    ));
    db.replace_duplicate(&mut txn, b"k", b"0", None).unwrap();
    assert_eq!(db.replace(&mut txn, b"k", None).unwrap(), Some(b"2".to_vec()));
    assert!(db.get(&txn, b"k").unwrap().is_none());

    assert!(matches!(
        db.put(&mut txn, b"k", b"v", WriteFlags::CURRENT | WriteFlags::NOOVERWRITE),
        Err(Error::Invalid)
    ));
}

#[test]
fn test_overflow_values() {
    let (_dir, env) = setup_test_env();
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();
    db.insert(&mut txn, b"big", &big).unwrap();
    db.insert(&mut txn, b"small", b"s").unwrap();
    assert!(db.stat(&txn).unwrap().overflow_pages > 0);
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), big);
    let bigger = [big.as_slice(), big.as_slice()].concat();
    db.upsert(&mut txn, b"big", &bigger).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), bigger);
    assert_eq!(db.get(&txn, b"small").unwrap().unwrap(), b"s");
}

#[test]
fn test_key_size_limits() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();

    let max = env.max_key_size();
    db.insert(&mut txn, &vec![7u8; max], b"ok").unwrap();
    let result = db.insert(&mut txn, &vec![7u8; max + 1], b"too long");
    assert!(matches!(result, Err(Error::BadValSize)));
    assert!(!txn.is_broken());
}

#[test]
fn test_table_name_too_long() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let long = "n".repeat(5000);
    let result = Database::create(&mut txn, Some(&long), TableOptions::create());
    assert!(matches!(result, Err(Error::BadValSize)));
    assert!(matches!(
        Database::open(&txn, Some(&long), Default::default()),
        Err(Error::BadValSize)
    ));
    assert!(!txn.is_broken());

    // The transaction still commits its other work
    let name = "n".repeat(env.max_key_size() - 8);
    let db = Database::create(&mut txn, Some(&name), TableOptions::create()).unwrap();
    db.insert(&mut txn, b"k", b"v").unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, Some(&name), Default::default()).unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap(), b"v");
}

#[test]
fn test_many_keys_persist() {
    let (dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();
    for i in 0..5000u32 {
        let key = format!("key{:06}", i);
        db.insert(&mut txn, key.as_bytes(), &i.to_be_bytes()).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    for i in (0..5000u32).filter(|i| i % 3 == 0) {
        let key = format!("key{:06}", i);
        assert!(db.erase(&mut txn, key.as_bytes()).unwrap());
    }
    txn.commit().unwrap();
    drop(env);

    let env = Environment::open(dir.path(), EnvConfig::default()).unwrap();
    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();
    let stat = db.stat(&txn).unwrap();
    assert_eq!(stat.entries, 5000 - 1667);
    assert!(stat.depth >= 2);
    for i in [1u32, 2, 3, 4998, 4999] {
        let key = format!("key{:06}", i);
        let value = db.get(&txn, key.as_bytes()).unwrap();
        if i % 3 == 0 {
            assert!(value.is_none());
        } else {
            assert_eq!(value.unwrap(), i.to_be_bytes());
        }
    }
}

#[test]
fn test_table_flags_persist() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let options = TableOptions::create().key_order(KeyOrder::Reverse);
    Database::create(&mut txn, Some("rev"), options).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    // Empty options adopt the stored layout
    let db = Database::open(&txn, Some("rev"), Default::default()).unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::REVERSEKEY);

    let conflicting = TableOptions::create().dup_sort(DupOptions::default());
    assert!(matches!(
        Database::create(&mut txn, Some("rev"), conflicting),
        Err(Error::Incompatible)
    ));
    let db = Database::create(&mut txn, Some("rev"), conflicting.accede(true)).unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::REVERSEKEY);

    let raw = Database::open_with_flags(&mut txn, Some("raw"), DbFlags::CREATE | DbFlags::INTEGERKEY)
        .unwrap();
    assert_eq!(raw.flags(&txn).unwrap(), DbFlags::INTEGERKEY);
}

#[test]
fn test_create_in_read_txn_fails() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        Database::create(&mut txn, Some("t"), TableOptions::create()),
        Err(Error::TxnReadOnly)
    ));
    let db = Database::open(&txn, None, Default::default()).unwrap();
    assert!(matches!(db.insert(&mut txn, b"k", b"v"), Err(Error::TxnReadOnly)));
}

#[test]
fn test_drop_and_clear() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let a = Database::create(&mut txn, Some("a"), TableOptions::create()).unwrap();
    let b = Database::create(&mut txn, Some("b"), TableOptions::create()).unwrap();
    for i in 0..100u32 {
        a.insert(&mut txn, &i.to_be_bytes(), b"value").unwrap();
        b.insert(&mut txn, &i.to_be_bytes(), b"value").unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    a.clear(&mut txn).unwrap();
    assert_eq!(a.stat(&txn).unwrap().entries, 0);
    b.drop_table(&mut txn).unwrap();
    assert!(matches!(b.get(&txn, b"x"), Err(Error::BadDbi)));
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    assert!(matches!(b.get(&txn, b"x"), Err(Error::BadDbi)));
    assert!(matches!(
        Database::open(&txn, Some("b"), Default::default()),
        Err(Error::NotFound)
    ));
    assert!(a.get(&txn, &1u32.to_be_bytes()).unwrap().is_none());
    a.insert(&mut txn, b"again", b"1").unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_tables_full() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    for name in ["t1", "t2", "t3", "t4"] {
        Database::create(&mut txn, Some(name), TableOptions::create()).unwrap();
    }
    assert!(matches!(
        Database::create(&mut txn, Some("t5"), TableOptions::create()),
        Err(Error::TablesFull)
    ));
}

#[test]
fn test_created_table_vanishes_on_abort() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::create(&mut txn, Some("temp"), TableOptions::create()).unwrap();
    db.insert(&mut txn, b"k", b"v").unwrap();
    txn.abort().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        Database::open(&txn, Some("temp"), Default::default()),
        Err(Error::NotFound)
    ));
    assert!(matches!(db.get(&txn, b"k"), Err(Error::BadDbi)));
}

#[test]
fn test_handle_from_other_env() {
    let (_dir_a, env_a) = setup_test_env();
    let (_dir_b, env_b) = setup_test_env();
    let txn_a = env_a.begin_ro_txn().unwrap();
    let db_a = Database::open(&txn_a, None, Default::default()).unwrap();

    let txn_b = env_b.begin_ro_txn().unwrap();
    assert!(matches!(db_a.get(&txn_b, b"k"), Err(Error::BadSignature)));
}

#[test]
fn test_environment_stat() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let main = Database::open(&txn, None, Default::default()).unwrap();
    let named = Database::create(&mut txn, Some("named"), TableOptions::create()).unwrap();
    for i in 0..10u32 {
        main.insert(&mut txn, &i.to_be_bytes(), b"m").unwrap();
        named.insert(&mut txn, &i.to_be_bytes(), b"n").unwrap();
    }
    assert_eq!(env.stat(Some(&txn)).unwrap().entries, 20);
    txn.commit().unwrap();

    let stat = env.stat(None).unwrap();
    assert_eq!(stat.entries, 20);
    assert_eq!(stat.psize as usize, env.page_size());
    assert!(stat.leaf_pages >= 2);
}
