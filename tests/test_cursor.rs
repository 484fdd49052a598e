use lumokv::{
    CursorOp, Database, DupOptions, EnvConfig, Environment, Error, KeyOrder, TableOptions,
    Transaction, WriteFlags,
};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), EnvConfig::default()).unwrap();
    (temp_dir, env)
}

fn int_key(k: u32) -> [u8; 4] {
    k.to_ne_bytes()
}

fn int_table(txn: &mut Transaction, name: &str) -> Database {
    let options = TableOptions::create().key_order(KeyOrder::Integer);
    Database::create(txn, Some(name), options).unwrap()
}

fn dup_table(txn: &mut Transaction, name: &str) -> Database {
    let options = TableOptions::create()
        .key_order(KeyOrder::Integer)
        .dup_sort(DupOptions::default());
    Database::create(txn, Some(name), options).unwrap()
}

fn collect_forward(db: &Database, txn: &Transaction) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = db.cursor(txn).unwrap();
    cursor.iter(txn).map(|pair| pair.unwrap()).collect()
}

fn collect_backward(db: &Database, txn: &Transaction) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = db.cursor(txn).unwrap();
    let mut pairs = Vec::new();
    let mut next = cursor.last(txn).unwrap();
    while let Some(pair) = next {
        pairs.push(pair);
        next = cursor.prev(txn).unwrap();
    }
    pairs
}

#[test]
fn test_forward_traversal() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = int_table(&mut txn, "ints");

    let keys = [0u32, 2, 3, 4, 5, 6, 7, 8];
    let values = ["", "", "3", "4", "5", "6", "7", "8"];
    for (k, v) in keys.iter().zip(values) {
        db.insert(&mut txn, &int_key(*k), v.as_bytes()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let pairs = collect_forward(&db, &txn);
    let expected: Vec<(Vec<u8>, Vec<u8>)> = keys
        .iter()
        .zip(values)
        .map(|(k, v)| (int_key(*k).to_vec(), v.as_bytes().to_vec()))
        .collect();
    assert_eq!(pairs, expected);

    let mut backward = collect_backward(&db, &txn);
    backward.reverse();
    assert_eq!(backward, expected);
}

#[test]
fn test_lower_bound() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = int_table(&mut txn, "ints");
    for k in [0u32, 2, 3, 4, 5, 9, 13, 15] {
        db.insert(&mut txn, &int_key(k), &k.to_string().into_bytes()).unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    let (key, value) = cursor.lower_bound(&txn, &int_key(6)).unwrap().unwrap();
    assert_eq!(key, int_key(9));
    assert_eq!(value, b"9");

    let hit = cursor.move_to(&txn, CursorOp::LOWER_BOUND, Some(&int_key(13)), None, true);
    assert_eq!(hit.unwrap().unwrap().0, int_key(13));

    assert!(cursor.lower_bound(&txn, &int_key(16)).unwrap().is_none());
    assert!(cursor.eof());
    let result = cursor.move_to(&txn, CursorOp::SetRange, Some(&int_key(16)), None, true);
    assert!(matches!(result, Err(Error::NotFound)));

    assert!(cursor.set(&txn, &int_key(6)).unwrap().is_none());
    assert_eq!(cursor.set(&txn, &int_key(5)).unwrap().unwrap().1, b"5");
}

#[test]
fn test_duplicate_traversal() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = dup_table(&mut txn, "dups");

    let values = ["", "11", "111", "1111", "11111"];
    for v in values.iter().rev() {
        db.insert(&mut txn, &int_key(0), v.as_bytes()).unwrap();
    }
    db.insert(&mut txn, &int_key(1), b"next").unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    cursor.set(&txn, &int_key(0)).unwrap().unwrap();
    assert_eq!(cursor.count(&txn).unwrap(), 5);

    let (_, first) = cursor.get(&txn, CursorOp::FirstDup).unwrap().unwrap();
    assert_eq!(first, b"");
    for expected in &values[1..] {
        let (key, value) = cursor.get(&txn, CursorOp::NextDup).unwrap().unwrap();
        assert_eq!(key, int_key(0));
        assert_eq!(value, expected.as_bytes());
    }
    assert!(cursor.get(&txn, CursorOp::NextDup).unwrap().is_none());
    // a failed dup move keeps the position
    assert_eq!(cursor.get(&txn, CursorOp::GetCurrent).unwrap().unwrap().1, b"11111");

    let (_, last) = cursor.get(&txn, CursorOp::LastDup).unwrap().unwrap();
    assert_eq!(last, b"11111");
    for expected in values[..4].iter().rev() {
        let (_, value) = cursor.get(&txn, CursorOp::PrevDup).unwrap().unwrap();
        assert_eq!(value, expected.as_bytes());
    }
    assert!(cursor.get(&txn, CursorOp::PrevDup).unwrap().is_none());

    let (key, value) = cursor.get(&txn, CursorOp::NextNoDup).unwrap().unwrap();
    assert_eq!((key, value), (int_key(1).to_vec(), b"next".to_vec()));
    let (key, value) = cursor.get(&txn, CursorOp::PrevNoDup).unwrap().unwrap();
    assert_eq!((key, value), (int_key(0).to_vec(), b"11111".to_vec()));

    let all = collect_forward(&db, &txn);
    assert_eq!(all.len(), 6);
    let mut backward = collect_backward(&db, &txn);
    backward.reverse();
    assert_eq!(backward, all);
}

#[test]
fn test_pair_seeks() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = dup_table(&mut txn, "dups");
    for v in ["b", "d", "f"] {
        db.insert(&mut txn, &int_key(7), v.as_bytes()).unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    let key = int_key(7);
    let found = cursor
        .move_to(&txn, CursorOp::FIND_PAIR, Some(&key), Some(b"d"), false)
        .unwrap();
    assert_eq!(found.unwrap().1, b"d");
    assert!(cursor
        .move_to(&txn, CursorOp::GetBoth, Some(&key), Some(b"c"), false)
        .unwrap()
        .is_none());
    let range = cursor
        .move_to(&txn, CursorOp::LOWER_BOUND_PAIR, Some(&key), Some(b"c"), false)
        .unwrap();
    assert_eq!(range.unwrap().1, b"d");
    assert!(cursor
        .move_to(&txn, CursorOp::GetBothRange, Some(&key), Some(b"g"), false)
        .unwrap()
        .is_none());

    let result = cursor.move_to(&txn, CursorOp::GetBoth, Some(&key), None, false);
    assert!(matches!(result, Err(Error::Invalid)));
}

#[test]
fn test_reverse_and_lexical_order() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let lexical = Database::create(&mut txn, Some("lex"), TableOptions::create()).unwrap();
    let reverse = Database::create(
        &mut txn,
        Some("rev"),
        TableOptions::create().key_order(KeyOrder::Reverse),
    )
    .unwrap();
    for key in ["ab", "ba", "aa", "b", "ca"] {
        lexical.insert(&mut txn, key.as_bytes(), b"").unwrap();
        reverse.insert(&mut txn, key.as_bytes(), b"").unwrap();
    }

    let keys = |db: &Database| -> Vec<String> {
        collect_forward(db, &txn)
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect()
    };
    assert_eq!(keys(&lexical), ["aa", "ab", "b", "ba", "ca"]);
    assert_eq!(keys(&reverse), ["aa", "ba", "ca", "b", "ab"]);
}

#[test]
fn test_integer_keys_order_numerically() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = int_table(&mut txn, "ints");
    for k in [300u32, 1, 70_000, 256, 2] {
        db.insert(&mut txn, &int_key(k), b"").unwrap();
    }
    let keys: Vec<u32> = collect_forward(&db, &txn)
        .into_iter()
        .map(|(k, _)| u32::from_ne_bytes(k.try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![1, 2, 256, 300, 70_000]);

    assert!(matches!(
        db.insert(&mut txn, &9u64.to_ne_bytes(), b""),
        Err(Error::BadValSize)
    ));
    assert!(matches!(db.insert(&mut txn, b"abc", b""), Err(Error::BadValSize)));
}

#[test]
fn test_position_queries() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = int_table(&mut txn, "ints");
    for k in 1..=3u32 {
        db.insert(&mut txn, &int_key(k), b"v").unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    assert!(cursor.eof());
    assert!(!cursor.on_first(&txn).unwrap());

    cursor.first(&txn).unwrap().unwrap();
    assert!(cursor.on_first(&txn).unwrap());
    assert!(!cursor.on_last(&txn).unwrap());

    cursor.next(&txn).unwrap().unwrap();
    cursor.next(&txn).unwrap().unwrap();
    assert!(cursor.on_last(&txn).unwrap());
    assert!(cursor.next(&txn).unwrap().is_none());
    assert!(cursor.eof());
    // past the end, Next stays there and Prev comes back to the last pair
    assert!(cursor.next(&txn).unwrap().is_none());
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0, int_key(3));

    let result = cursor.move_to(&txn, CursorOp::Set, None, None, false);
    assert!(matches!(result, Err(Error::Invalid)));
}

#[test]
fn test_cursor_writes() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = dup_table(&mut txn, "dups");
    let mut cursor = db.cursor(&txn).unwrap();

    cursor.insert(&mut txn, &int_key(1), b"a").unwrap();
    cursor.insert(&mut txn, &int_key(1), b"c").unwrap();
    cursor.upsert(&mut txn, &int_key(2), b"x").unwrap();
    assert!(matches!(
        cursor.insert(&mut txn, &int_key(1), b"a"),
        Err(Error::KeyExist)
    ));
    assert_eq!(cursor.get(&txn, CursorOp::GetCurrent).unwrap().unwrap().1, b"x");

    cursor.put_current(&mut txn, b"y").unwrap();
    assert_eq!(db.get(&txn, &int_key(2)).unwrap().unwrap(), b"y");
    assert!(matches!(
        cursor.put(&mut txn, &int_key(9), b"z", WriteFlags::CURRENT),
        Err(Error::KeyMismatch)
    ));

    cursor.set(&txn, &int_key(1)).unwrap().unwrap();
    assert!(cursor.erase(&mut txn, false).unwrap());
    // the erased pair is gone, the next move lands on its successor
    assert!(cursor.get(&txn, CursorOp::GetCurrent).unwrap().is_none());
    assert_eq!(cursor.next(&txn).unwrap().unwrap().1, b"c");
    assert_eq!(cursor.count(&txn).unwrap(), 1);

    cursor.upsert(&mut txn, &int_key(1), b"d").unwrap();
    assert!(cursor.erase(&mut txn, true).unwrap());
    assert!(db.get(&txn, &int_key(1)).unwrap().is_none());
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0, int_key(2));
}

#[test]
fn test_scan_across_many_leaves() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = int_table(&mut txn, "big");
    for i in 0..3000u32 {
        db.insert(&mut txn, &int_key(i), &[b'v'; 64]).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert!(db.stat(&txn).unwrap().depth >= 2);
    let forward: Vec<Vec<u8>> = collect_forward(&db, &txn).into_iter().map(|(k, _)| k).collect();
    let expected: Vec<Vec<u8>> = (0..3000u32).map(|i| int_key(i).to_vec()).collect();
    assert_eq!(forward, expected);

    let mut backward: Vec<Vec<u8>> = collect_backward(&db, &txn).into_iter().map(|(k, _)| k).collect();
    backward.reverse();
    assert_eq!(backward, expected);

    // Direction changes mid-leaf
    let mut cursor = db.cursor(&txn).unwrap();
    cursor.lower_bound(&txn, &int_key(1500)).unwrap().unwrap();
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0, int_key(1501));
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0, int_key(1500));
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0, int_key(1499));
}

#[test]
fn test_scan_sees_writes_of_its_transaction() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = int_table(&mut txn, "live");
    for i in (0..100u32).step_by(2) {
        db.insert(&mut txn, &int_key(i), b"even").unwrap();
    }

    let mut cursor = db.cursor(&txn).unwrap();
    assert_eq!(cursor.lower_bound(&txn, &int_key(10)).unwrap().unwrap().0, int_key(10));

    // Changes right after the cursor show up on the next step
    db.insert(&mut txn, &int_key(11), b"odd").unwrap();
    assert!(db.erase(&mut txn, &int_key(12)).unwrap());
    assert_eq!(cursor.next(&txn).unwrap().unwrap(), (int_key(11).to_vec(), b"odd".to_vec()));
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0, int_key(14));

    db.upsert(&mut txn, &int_key(16), b"changed").unwrap();
    assert_eq!(cursor.next(&txn).unwrap().unwrap().1, b"changed");

    // A nested commit counts as a change too
    {
        let mut child = txn.begin_nested_txn().unwrap();
        db.insert(&mut child, &int_key(17), b"odd").unwrap();
        child.commit().unwrap();
    }
    assert_eq!(cursor.next(&txn).unwrap().unwrap().0, int_key(17));
    assert_eq!(cursor.prev(&txn).unwrap().unwrap().0, int_key(16));
}

#[test]
fn test_cursor_bound_to_transaction() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();
    db.insert(&mut txn, b"k", b"v").unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert!(matches!(cursor.first(&txn), Err(Error::BadTxn)));
    cursor.renew(&txn).unwrap();
    assert_eq!(cursor.first(&txn).unwrap().unwrap(), (b"k".to_vec(), b"v".to_vec()));
    cursor.close();
}

#[test]
fn test_iter_from() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = int_table(&mut txn, "ints");
    for k in 0..50u32 {
        db.insert(&mut txn, &int_key(k * 2), b"").unwrap();
    }
    let mut cursor = db.cursor(&txn).unwrap();
    let keys: Vec<u32> = cursor
        .iter_from(&txn, &int_key(91))
        .map(|pair| u32::from_ne_bytes(pair.unwrap().0.try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![92, 94, 96, 98]);
}

#[test]
fn test_empty_table_moves() {
    let (_dir, env) = setup_test_env();
    let txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&txn, None, Default::default()).unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    assert!(cursor.first(&txn).unwrap().is_none());
    assert!(cursor.last(&txn).unwrap().is_none());
    assert!(cursor.eof());
    assert!(matches!(
        cursor.move_to(&txn, CursorOp::First, None, None, true),
        Err(Error::NotFound)
    ));
}
