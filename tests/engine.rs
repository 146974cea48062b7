use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use cowdb::{Db, Error, Options};

const RAND_SEED: u64 = 2023;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_db(dir: &TempDir) -> Db {
    init_logs();
    Db::open(dir.path().join("test.db"), Options::default()).unwrap()
}

fn be_key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

#[test]
fn put_then_get() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let mut tx = db.begin(true).unwrap();
    {
        let mut bucket = tx.create_bucket(b"widgets").unwrap();
        bucket.put(b"foo", b"bar").unwrap();
        assert_eq!(bucket.get(b"foo").unwrap().unwrap(), b"bar");
    }
    tx.commit().unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo")?.unwrap(), b"bar");
        assert_eq!(bucket.get(b"missing")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn repeat_put_keeps_one_key() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        bucket.put(b"foo", b"baz")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo")?.unwrap(), b"baz");
        let mut count = 0;
        bucket.for_each(|_, _| {
            count += 1;
            Ok(())
        })?;
        assert_eq!(count, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn iteration_is_key_ordered() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"0000")?;
        bucket.put(b"baz", b"0001")?;
        bucket.put(b"bar", b"0002")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        let mut seen = Vec::new();
        bucket.for_each(|key, value| {
            seen.push((key.to_vec(), value.unwrap().to_vec()));
            Ok(())
        })?;
        assert_eq!(
            seen,
            vec![
                (b"bar".to_vec(), b"0002".to_vec()),
                (b"baz".to_vec(), b"0001".to_vec()),
                (b"foo".to_vec(), b"0000".to_vec()),
            ]
        );
        Ok(())
    })
    .unwrap();
}

fn append_in_batches(db: &Db, batches: u64, batch_size: u64, value_len: usize) {
    let mut value = vec![0u8; value_len];
    let mut rng = StdRng::seed_from_u64(RAND_SEED);
    rng.fill(&mut value[..]);
    for batch in 0..batches {
        db.update(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(b"widgets")?;
            for i in 0..batch_size {
                bucket.put(&be_key(batch * batch_size + i), &value)?;
            }
            Ok(())
        })
        .unwrap();
    }
}

fn verify_appended(db: &Db, total: u64, value_len: usize) {
    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in 0..total {
            let value = bucket.get(&be_key(i))?.unwrap();
            assert_eq!(value.len(), value_len, "key {}", i);
        }
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn batched_append_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    {
        let db = Db::open(&path, Options::default()).unwrap();
        append_in_batches(&db, 8, 500, 500);
        verify_appended(&db, 8 * 500, 500);
    }
    let db = Db::open(&path, Options::default()).unwrap();
    verify_appended(&db, 8 * 500, 500);

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len % db.page_size() as u64, 0);
}

// Full-scale version of the append scenario; takes minutes, run explicitly.
#[test]
#[ignore]
fn batched_append_full_scale() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    {
        let db = Db::open(&path, Options::default()).unwrap();
        append_in_batches(&db, 80, 5000, 500);
    }
    let db = Db::open(&path, Options::default()).unwrap();
    verify_appended(&db, 400_000, 500);
}

#[test]
fn delete_everything_then_read() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let value = vec![0xaau8; 1024];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for i in 0..100u32 {
            bucket.put(format!("{}", i).as_bytes(), &value)?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut bucket = tx.bucket_mut(b"widgets")?;
        for i in 0..100u32 {
            bucket.delete(format!("{}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in 0..100u32 {
            assert_eq!(bucket.get(format!("{}", i).as_bytes())?, None);
        }
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_buckets_across_transactions() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut widgets = tx.create_bucket(b"widgets")?;
        widgets.create_bucket(b"foo")?;
        widgets.put(b"bar", b"000")?;
        Ok(())
    })
    .unwrap();
    db.view(|tx| tx.check()).unwrap();

    db.update(|tx| {
        let mut widgets = tx.bucket_mut(b"widgets")?;
        widgets.put(b"bar", b"xxxx")?;
        for i in 0..10_000u32 {
            widgets.put(format!("{}", i).as_bytes(), format!("{}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();
    db.view(|tx| tx.check()).unwrap();

    db.update(|tx| {
        let mut widgets = tx.bucket_mut(b"widgets")?;
        let mut foo = widgets.bucket_mut(b"foo")?;
        foo.put(b"baz", b"yyyy")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let widgets = tx.bucket(b"widgets")?;
        assert_eq!(widgets.get(b"bar")?.unwrap(), b"xxxx");
        for i in (0..10_000u32).step_by(997) {
            assert_eq!(
                widgets.get(format!("{}", i).as_bytes())?.unwrap(),
                format!("{}", i).as_bytes()
            );
        }
        let foo = widgets.bucket(b"foo")?;
        assert_eq!(foo.get(b"baz")?.unwrap(), b"yyyy");
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_on_empty_bucket() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        tx.create_bucket(b"empty")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"empty")?;
        let mut cursor = bucket.cursor();
        assert_eq!(cursor.first()?, None);
        assert_eq!(cursor.last()?, None);
        assert_eq!(cursor.next()?, None);
        assert_eq!(cursor.prev()?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_seek_boundaries() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"bar", b"2")?;
        bucket.put(b"baz", b"3")?;
        bucket.put(b"foo", b"1")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        let mut cursor = bucket.cursor();
        // empty key seeks to the first entry
        let (key, _) = cursor.seek(b"")?.unwrap();
        assert_eq!(key, b"bar");
        // seeking between keys lands on the next one
        let (key, _) = cursor.seek(b"bb")?.unwrap();
        assert_eq!(key, b"baz");
        // past the last key
        assert_eq!(cursor.seek(b"zzz")?, None);
        // walking backwards from a seek
        cursor.seek(b"baz")?;
        let (key, _) = cursor.prev()?.unwrap();
        assert_eq!(key, b"bar");
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_delete_shifts_next() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for key in [b"a", b"b", b"c"] {
            bucket.put(key, b"v")?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut bucket = tx.bucket_mut(b"widgets")?;
        let mut cursor = bucket.cursor_mut();
        let (key, _) = cursor.first()?.unwrap();
        assert_eq!(key, b"a");
        cursor.delete()?;
        // the entry that slid into the current slot comes out of next()
        let (key, _) = cursor.next()?.unwrap();
        assert_eq!(key, b"b");
        cursor.delete()?;
        let (key, _) = cursor.next()?.unwrap();
        assert_eq!(key, b"c");
        cursor.delete()?;
        assert_eq!(cursor.next()?, None);
        // nothing left under the cursor
        assert!(matches!(
            cursor.delete(),
            Err(Error::CursorNotPositioned)
        ));
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        let mut count = 0;
        bucket.for_each(|_, _| {
            count += 1;
            Ok(())
        })?;
        assert_eq!(count, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn error_taxonomy() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        assert!(matches!(bucket.put(b"", b"x"), Err(Error::KeyRequired)));
        assert!(matches!(
            bucket.put(&vec![0u8; 32769], b"x"),
            Err(Error::KeyTooLarge)
        ));
        bucket.create_bucket(b"sub")?;
        // a bucket header cannot be overwritten by a plain value
        assert!(matches!(
            bucket.put(b"sub", b"x"),
            Err(Error::IncompatibleValue)
        ));
        // nor deleted as a key
        assert!(matches!(
            bucket.delete(b"sub"),
            Err(Error::IncompatibleValue)
        ));
        bucket.put(b"plain", b"x")?;
        assert!(matches!(
            bucket.create_bucket(b"plain"),
            Err(Error::IncompatibleValue)
        ));
        assert!(matches!(
            bucket.create_bucket(b"sub"),
            Err(Error::BucketExists)
        ));
        assert!(matches!(
            bucket.create_bucket(b""),
            Err(Error::BucketNameRequired)
        ));
        Ok(())
    })
    .unwrap();

    assert!(matches!(db.view(|tx| { tx.bucket(b"nope").map(|_| ()) }), Err(Error::BucketNotFound)));

    // write operations demand a writable transaction
    let mut tx = db.begin(false).unwrap();
    assert!(matches!(tx.bucket_mut(b"widgets"), Err(Error::TxNotWritable)));
    assert!(matches!(tx.commit(), Err(Error::TxNotWritable)));
    tx.rollback().unwrap();

    // manual commit inside a managed transaction is rejected
    db.update(|tx| {
        assert!(matches!(tx.commit(), Err(Error::TxManaged)));
        assert!(matches!(tx.rollback(), Err(Error::TxManaged)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_recursively_frees() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut widgets = tx.create_bucket(b"widgets")?;
        let mut inner = widgets.create_bucket(b"inner")?;
        let mut deep = inner.create_bucket(b"deep")?;
        for i in 0..500u32 {
            deep.put(&i.to_be_bytes(), &[0u8; 64])?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        tx.delete_bucket(b"widgets")?;
        assert!(matches!(tx.bucket(b"widgets").map(|_| ()), Err(Error::BucketNotFound)));
        Ok(())
    })
    .unwrap();

    db.view(|tx| tx.check()).unwrap();
}

#[test]
fn rollback_discards_changes() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"keep", b"1")?;
        Ok(())
    })
    .unwrap();

    let mut tx = db.begin(true).unwrap();
    {
        let mut bucket = tx.bucket_mut(b"widgets").unwrap();
        bucket.put(b"discard", b"2").unwrap();
    }
    tx.rollback().unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"keep")?.unwrap(), b"1");
        assert_eq!(bucket.get(b"discard")?, None);
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn large_values_use_overflow_pages() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let big = vec![0x5au8; 100 * 1024];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"blobs")?;
        bucket.put(b"big", &big)?;
        bucket.put(b"small", b"s")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"blobs")?;
        assert_eq!(bucket.get(b"big")?.unwrap(), big);
        assert_eq!(bucket.get(b"small")?.unwrap(), b"s");
        let stats = bucket.stats()?;
        assert!(stats.leaf_overflow_n > 0, "expected overflow pages: {:?}", stats);
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn bucket_stats_counts() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut widgets = tx.create_bucket(b"widgets")?;
        for i in 0..50u32 {
            widgets.put(&i.to_be_bytes(), b"value")?;
        }
        let mut small = widgets.create_bucket(b"small")?;
        small.put(b"k", b"v")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let widgets = tx.bucket(b"widgets")?;
        let stats = widgets.stats()?;
        assert_eq!(stats.key_n, 52); // 50 keys + 1 bucket header + 1 nested key
        assert_eq!(stats.bucket_n, 2);
        assert_eq!(stats.inline_bucket_n, 1);
        assert!(stats.leaf_page_n >= 1);
        assert!(stats.depth >= 1);
        Ok(())
    })
    .unwrap();
}

fn meta_txids(path: &std::path::Path, page_size: usize) -> (u64, u64) {
    let file = std::fs::File::open(path).unwrap();
    let mut buf = vec![0u8; page_size * 2];
    file.read_exact_at(&mut buf, 0).unwrap();
    // page header is 16 bytes; txid sits 36 bytes into the meta body
    let txid0 = u64::from_le_bytes(buf[52..60].try_into().unwrap());
    let txid1 = u64::from_le_bytes(buf[page_size + 52..page_size + 60].try_into().unwrap());
    (txid0, txid1)
}

#[test]
fn meta_pages_alternate_across_commits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    let db = Db::open(&path, Options::default()).unwrap();
    let page_size = db.page_size();

    let mut last_winner = None;
    for round in 0..4u32 {
        db.update(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(b"widgets")?;
            bucket.put(b"round", &round.to_be_bytes())?;
            Ok(())
        })
        .unwrap();
        let (txid0, txid1) = meta_txids(&path, page_size);
        let winner = if txid0 > txid1 { 0 } else { 1 };
        // the freshly written copy lives at txid % 2
        let newest = txid0.max(txid1);
        assert_eq!(newest % 2, winner as u64);
        if let Some(prev) = last_winner {
            assert_ne!(prev, winner, "meta page did not alternate");
        }
        last_winner = Some(winner);
    }
}

#[test]
fn torn_meta_write_recovers_previous_commit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    let page_size;
    {
        let db = Db::open(&path, Options::default()).unwrap();
        page_size = db.page_size();
        db.update(|tx| {
            let mut bucket = tx.create_bucket(b"widgets")?;
            bucket.put(b"a", b"first")?;
            Ok(())
        })
        .unwrap();
        db.update(|tx| {
            let mut bucket = tx.bucket_mut(b"widgets")?;
            bucket.put(b"a", b"second")?;
            Ok(())
        })
        .unwrap();
    }

    // corrupt the newest meta copy, as if the crash hit mid meta write
    {
        let (txid0, txid1) = meta_txids(&path, page_size);
        let newest_page = if txid0 > txid1 { 0u64 } else { 1u64 };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let garbage = [0xffu8; 8];
        // stomp the checksum field
        file.write_all_at(&garbage, newest_page * page_size as u64 + 60)
            .unwrap();
        file.sync_all().unwrap();
    }

    let db = Db::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"a")?.unwrap(), b"first");
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn read_only_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    {
        let db = Db::open(&path, Options::default()).unwrap();
        db.update(|tx| {
            let mut bucket = tx.create_bucket(b"widgets")?;
            bucket.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();
    }

    let db = Db::open(
        &path,
        Options {
            read_only: true,
            ..Options::default()
        },
    )
    .unwrap();
    assert!(db.is_read_only());
    assert!(matches!(db.begin(true), Err(Error::DatabaseReadOnly)));
    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"k")?.unwrap(), b"v");
        Ok(())
    })
    .unwrap();
}

#[test]
fn second_writable_open_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    let _db = Db::open(&path, Options::default()).unwrap();
    assert!(Db::open(&path, Options::default()).is_err());
}

#[test]
fn commit_handlers_run_after_commit() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let fired = Arc::new(AtomicBool::new(false));

    let mut tx = db.begin(true).unwrap();
    {
        let mut bucket = tx.create_bucket(b"widgets").unwrap();
        bucket.put(b"k", b"v").unwrap();
    }
    let flag = fired.clone();
    tx.add_commit_handler(move || flag.store(true, Ordering::SeqCst));
    tx.commit().unwrap();
    assert!(fired.load(Ordering::SeqCst));

    // handlers of a rolled-back transaction never fire
    let fired = Arc::new(AtomicBool::new(false));
    let mut tx = db.begin(true).unwrap();
    let flag = fired.clone();
    tx.add_commit_handler(move || flag.store(true, Ordering::SeqCst));
    tx.rollback().unwrap();
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn concurrent_readers_during_writes() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for i in 0..200u64 {
            bucket.put(&be_key(i), &be_key(i))?;
        }
        Ok(())
    })
    .unwrap();

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let done = &done;
        let db = &db;
        for _ in 0..3 {
            scope.spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    db.view(|tx| {
                        let bucket = tx.bucket(b"widgets")?;
                        // a snapshot is internally consistent: key 0 always
                        // present, iteration ordered
                        assert!(bucket.get(&be_key(0))?.is_some());
                        let mut last: Option<Vec<u8>> = None;
                        bucket.for_each(|key, _| {
                            if let Some(prev) = &last {
                                assert!(prev.as_slice() < key);
                            }
                            last = Some(key.to_vec());
                            Ok(())
                        })?;
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
        for round in 1..20u64 {
            db.update(|tx| {
                let mut bucket = tx.bucket_mut(b"widgets")?;
                for i in 0..50 {
                    bucket.put(&be_key(round * 1000 + i), b"more")?;
                }
                Ok(())
            })
            .unwrap();
        }
        done.store(true, Ordering::SeqCst);
    });

    db.view(|tx| tx.check()).unwrap();
}

#[test]
fn fill_percent_is_clamped_and_applied() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.set_fill_percent(0.0)?; // clamps to 0.1
        for i in 0..2000u64 {
            bucket.put(&be_key(i), &[0u8; 32])?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in (0..2000u64).step_by(191) {
            assert!(bucket.get(&be_key(i))?.is_some());
        }
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn freed_pages_are_reused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    let db = Db::open(&path, Options::default()).unwrap();

    // churn the same keys across many commits; the file must stop growing
    // once the working set stabilizes
    for _ in 0..8 {
        db.update(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(b"widgets")?;
            for i in 0..500u64 {
                bucket.put(&be_key(i), &[0u8; 100])?;
            }
            Ok(())
        })
        .unwrap();
    }
    let len_before = std::fs::metadata(&path).unwrap().len();
    for _ in 0..20 {
        db.update(|tx| {
            let mut bucket = tx.bucket_mut(b"widgets")?;
            for i in 0..500u64 {
                bucket.put(&be_key(i), &[1u8; 100])?;
            }
            Ok(())
        })
        .unwrap();
    }
    let len_after = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len_before, len_after, "file kept growing despite free pages");
    db.view(|tx| tx.check()).unwrap();
}

#[test]
fn uncommitted_changes_visible_inside_tx_only() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"committed", b"1")?;
        Ok(())
    })
    .unwrap();

    let mut tx = db.begin(true).unwrap();
    {
        let mut bucket = tx.bucket_mut(b"widgets").unwrap();
        bucket.put(b"pending", b"2").unwrap();
    }
    // the writing transaction observes its own changes
    {
        let bucket = tx.bucket(b"widgets").unwrap();
        assert_eq!(bucket.get(b"pending").unwrap().unwrap(), b"2");
        let mut cursor = bucket.cursor();
        let (key, _) = cursor.first().unwrap().unwrap();
        assert_eq!(key, b"committed");
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key, b"pending");
    }
    tx.rollback().unwrap();

    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"pending")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn dropping_a_tx_rolls_it_back() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        tx.create_bucket(b"widgets")?;
        Ok(())
    })
    .unwrap();

    {
        let mut tx = db.begin(true).unwrap();
        let mut bucket = tx.bucket_mut(b"widgets").unwrap();
        bucket.put(b"ghost", b"boo").unwrap();
        // tx dropped here without commit
    }

    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"ghost")?, None);
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn empty_values_are_stored() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"empty", b"")?;
        Ok(())
    })
    .unwrap();
    db.view(|tx| {
        let value = tx.bucket(b"widgets")?.get(b"empty")?;
        assert_eq!(value, Some(Vec::new()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn max_sized_key_round_trips() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let key = vec![0x42u8; 32768];
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(&key, b"big-key")?;
        Ok(())
    })
    .unwrap();
    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(&key)?.unwrap(), b"big-key");
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn bucket_name_listing() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        tx.create_bucket(b"gamma")?;
        tx.create_bucket(b"alpha")?;
        tx.create_bucket(b"beta")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut names = Vec::new();
        tx.for_each_bucket(|name| {
            names.push(name.to_vec());
            Ok(())
        })?;
        assert_eq!(names, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn deeply_nested_buckets() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut level0 = tx.create_bucket(b"l0")?;
        let mut level1 = level0.create_bucket(b"l1")?;
        let mut level2 = level1.create_bucket(b"l2")?;
        let mut level3 = level2.create_bucket(b"l3")?;
        level3.put(b"leaf", b"deep")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx
            .bucket(b"l0")?
            .bucket(b"l1")?
            .bucket(b"l2")?
            .bucket(b"l3")?;
        assert_eq!(bucket.get(b"leaf")?.unwrap(), b"deep");
        tx.check()?;
        Ok(())
    })
    .unwrap();

    // still intact after reopen
    let path = db.path().to_path_buf();
    drop(db);
    let db = Db::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        let value = tx.bucket(b"l0")?.bucket(b"l1")?.bucket(b"l2")?.bucket(b"l3")?.get(b"leaf")?;
        assert_eq!(value.unwrap(), b"deep");
        Ok(())
    })
    .unwrap();
}

#[test]
fn forward_and_backward_traversal_agree() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for i in 0..1000u64 {
            bucket.put(&be_key(i * 7), &be_key(i))?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        let mut forward = Vec::new();
        let mut cursor = bucket.cursor();
        let mut item = cursor.first()?;
        while let Some((key, _)) = item {
            forward.push(key);
            item = cursor.next()?;
        }
        assert_eq!(forward.len(), 1000);

        let mut backward = Vec::new();
        let mut cursor = bucket.cursor();
        let mut item = cursor.last()?;
        while let Some((key, _)) = item {
            backward.push(key);
            item = cursor.prev()?;
        }
        backward.reverse();
        assert_eq!(forward, backward);
        Ok(())
    })
    .unwrap();
}

#[test]
fn seek_exact_match_and_cursor_delete_by_seek() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for i in 0..100u64 {
            bucket.put(&be_key(i), &be_key(i))?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut bucket = tx.bucket_mut(b"widgets")?;
        let mut cursor = bucket.cursor_mut();
        let (key, value) = cursor.seek(&be_key(42))?.unwrap();
        assert_eq!(key, be_key(42));
        assert_eq!(value.unwrap(), be_key(42));
        cursor.delete()?;
        let (key, _) = cursor.next()?.unwrap();
        assert_eq!(key, be_key(43));
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(&be_key(42))?, None);
        assert!(bucket.get(&be_key(41))?.is_some());
        assert!(bucket.get(&be_key(43))?.is_some());
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn no_sync_database_survives_clean_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    {
        let db = Db::open(
            &path,
            Options {
                no_sync: true,
                ..Options::default()
            },
        )
        .unwrap();
        db.update(|tx| {
            let mut bucket = tx.create_bucket(b"widgets")?;
            bucket.put(b"k", b"v")?;
            Ok(())
        })
        .unwrap();
        db.sync().unwrap();
    }
    let db = Db::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"k")?.unwrap(), b"v");
        Ok(())
    })
    .unwrap();
}

#[test]
fn strict_mode_checks_every_commit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    let db = Db::open(
        &path,
        Options {
            strict_mode: true,
            ..Options::default()
        },
    )
    .unwrap();
    for round in 0..5u32 {
        db.update(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(b"widgets")?;
            for i in 0..200u32 {
                bucket.put(&i.to_be_bytes(), &round.to_be_bytes())?;
            }
            if round > 2 {
                for i in (0..200u32).step_by(2) {
                    bucket.delete(&i.to_be_bytes())?;
                }
            }
            Ok(())
        })
        .unwrap();
    }
}

#[test]
fn initial_mmap_size_presizes_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    init_logs();
    let db = Db::open(
        &path,
        Options {
            initial_mmap_size: 1 << 20,
            ..Options::default()
        },
    )
    .unwrap();
    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 1 << 20);
    drop(db);
}

#[test]
fn db_stats_track_transactions() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        tx.create_bucket(b"widgets")?;
        Ok(())
    })
    .unwrap();
    db.view(|_tx| Ok(())).unwrap();
    db.view(|_tx| Ok(())).unwrap();

    let stats = db.stats();
    assert_eq!(stats.write_tx_n, 1);
    assert_eq!(stats.tx_n, 2);
    assert_eq!(stats.open_tx_n, 0);
    assert!(stats.page_write_n > 0);
}

#[test]
fn delete_missing_key_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"present", b"1")?;
        bucket.delete(b"absent")?;
        assert_eq!(bucket.get(b"present")?.unwrap(), b"1");
        Ok(())
    })
    .unwrap();
}

#[test]
fn update_propagates_callback_errors_and_rolls_back() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        tx.create_bucket(b"widgets")?;
        Ok(())
    })
    .unwrap();

    let result: cowdb::Result<()> = db.update(|tx| {
        let mut bucket = tx.bucket_mut(b"widgets")?;
        bucket.put(b"doomed", b"x")?;
        Err(Error::KeyRequired) // any error aborts the transaction
    });
    assert!(matches!(result, Err(Error::KeyRequired)));

    db.view(|tx| {
        assert_eq!(tx.bucket(b"widgets")?.get(b"doomed")?, None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn shrinking_bucket_becomes_inline_again() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    // grow a nested bucket past the inline threshold, then shrink it back
    db.update(|tx| {
        let mut outer = tx.create_bucket(b"outer")?;
        let mut inner = outer.create_bucket(b"inner")?;
        for i in 0..200u64 {
            inner.put(&be_key(i), &[0u8; 64])?;
        }
        Ok(())
    })
    .unwrap();
    db.update(|tx| {
        let mut outer = tx.bucket_mut(b"outer")?;
        let mut inner = outer.bucket_mut(b"inner")?;
        for i in 1..200u64 {
            inner.delete(&be_key(i))?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let outer = tx.bucket(b"outer")?;
        let inner = outer.bucket(b"inner")?;
        assert_eq!(inner.get(&be_key(0))?.unwrap(), [0u8; 64]);
        let stats = outer.stats()?;
        assert_eq!(stats.inline_bucket_n, 1, "bucket did not shrink inline: {:?}", stats);
        tx.check()?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn copy_to_produces_a_working_snapshot() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for i in 0..2000u64 {
            bucket.put(&be_key(i), &be_key(i * 2))?;
        }
        let mut sub = bucket.create_bucket(b"sub")?;
        sub.put(b"nested", b"kept")?;
        Ok(())
    })
    .unwrap();

    let copy_path = dir.path().join("copy.db");
    db.view(|tx| tx.copy_to(&copy_path)).unwrap();

    // the source keeps working and the copy opens as its own database
    db.update(|tx| {
        tx.bucket_mut(b"widgets")?.put(b"after", b"copy")?;
        Ok(())
    })
    .unwrap();

    let copy = Db::open(&copy_path, Options::default()).unwrap();
    copy.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in (0..2000u64).step_by(397) {
            assert_eq!(bucket.get(&be_key(i))?.unwrap(), be_key(i * 2));
        }
        assert_eq!(bucket.bucket(b"sub")?.get(b"nested")?.unwrap(), b"kept");
        // the write that happened after the snapshot is not in the copy
        assert_eq!(bucket.get(b"after")?, None);
        tx.check()?;
        Ok(())
    })
    .unwrap();

    // refusing to clobber an existing file
    assert!(db.view(|tx| tx.copy_to(&copy_path)).is_err());
}

#[test]
fn for_each_error_stops_iteration() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for i in 0..10u64 {
            bucket.put(&be_key(i), b"v")?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        let mut visited = 0;
        let result = bucket.for_each(|_, _| {
            visited += 1;
            if visited == 3 {
                return Err(Error::KeyRequired);
            }
            Ok(())
        });
        assert!(matches!(result, Err(Error::KeyRequired)));
        assert_eq!(visited, 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn pending_pages_reported_until_released() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"widgets")?;
        for i in 0..500u64 {
            bucket.put(&be_key(i), &[0u8; 64])?;
        }
        Ok(())
    })
    .unwrap();
    db.update(|tx| {
        let mut bucket = tx.bucket_mut(b"widgets")?;
        for i in 0..500u64 {
            bucket.delete(&be_key(i))?;
        }
        Ok(())
    })
    .unwrap();

    // the pages of the dropped tree are pending until the next write tx
    // releases them
    let stats = db.stats();
    assert!(stats.pending_page_n > 0, "expected pending pages: {:?}", stats);

    db.update(|tx| {
        tx.create_bucket_if_not_exists(b"other").map(|_| ())?;
        Ok(())
    })
    .unwrap();
    let stats = db.stats();
    assert!(stats.free_page_n > 0, "expected reusable pages: {:?}", stats);
}
