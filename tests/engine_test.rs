//! Engine-level tests: allocator growth, concurrent allocation, bitmap
//! accounting, persistence across close/open, metadata corruption, and
//! flush atomicity.

use simdb::common::{FIRST_GROUP_PAGE, PAGES_PER_GROUP, PAGE_SIZE};
use simdb::sync::LatchMode;
use simdb::{Config, Db, DbError, Key};

use std::sync::Arc;
use tempfile::tempdir;

fn setup_file(path: &std::path::Path) -> Db {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Db::create(path, &Config::default()).unwrap()
}

#[test]
fn allocator_grows_a_second_group() {
    let dir = tempdir().unwrap();
    let db = setup_file(&dir.path().join("grow.simdb"));
    let alloc = db.allocator();
    assert_eq!(alloc.total_groups(), 1);

    // Drain group 0 completely.
    while alloc.group_free_pages(0) > 0 {
        alloc.alloc(0).unwrap();
    }

    // The next request triggers growth and lands in group 1.
    let page = alloc.alloc(0).unwrap();
    assert!(page >= FIRST_GROUP_PAGE + PAGES_PER_GROUP);
    assert_eq!(alloc.total_groups(), 2);
    assert_eq!(
        alloc.total_pages(),
        FIRST_GROUP_PAGE + 2 * PAGES_PER_GROUP
    );
    db.close().unwrap();
}

#[test]
fn concurrent_allocation_hands_out_distinct_pages() {
    let dir = tempdir().unwrap();
    let db = Arc::new(setup_file(&dir.path().join("conc.simdb")));
    let free_before = db.allocator().group_free_pages(0);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            let mut pages = Vec::with_capacity(100);
            for _ in 0..100 {
                pages.push(db.allocator().alloc(0).unwrap());
            }
            pages
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    assert_eq!(all.len(), 800);
    let distinct: std::collections::HashSet<_> = all.iter().copied().collect();
    assert_eq!(distinct.len(), 800, "duplicate pages handed out");
    assert_eq!(db.allocator().group_free_pages(0), free_before - 800);

    // Every handed-out page is marked in the bitmaps.
    assert_eq!(count_group0_bits(&db), 2 + 800);
}

/// Set bits across group 0's two bitmap pages.
fn count_group0_bits(db: &Db) -> u64 {
    let mut ones = 0;
    for bm_page in [FIRST_GROUP_PAGE, FIRST_GROUP_PAGE + 1] {
        let guard = db.pool().fetch(bm_page, LatchMode::Shared).unwrap();
        for word in guard.atomic_words() {
            ones += word.load(std::sync::atomic::Ordering::Acquire).count_ones() as u64;
        }
    }
    ones
}

#[test]
fn bitmap_bits_match_live_pages() {
    let dir = tempdir().unwrap();
    let db = setup_file(&dir.path().join("bits.simdb"));
    let alloc = db.allocator();

    // Only the two bitmap pages are taken on a fresh database.
    assert_eq!(count_group0_bits(&db), 2);

    let mut pages = Vec::new();
    for _ in 0..50 {
        pages.push(alloc.alloc(0).unwrap());
    }
    assert_eq!(count_group0_bits(&db), 2 + 50);

    for page in pages.drain(..).take(20).collect::<Vec<_>>() {
        alloc.free(page).unwrap();
    }
    assert_eq!(count_group0_bits(&db), 2 + 30);
    db.close().unwrap();
}

#[test]
fn close_open_round_trip_preserves_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.simdb");
    let config = Config::default();

    let root;
    let freed_page;
    {
        let db = Db::create(&path, &config).unwrap();
        let tree = db.create_tree().unwrap();
        root = tree.root_page();

        for i in 0..100i64 {
            let value = vec![(i % 250) as u8; (i as usize % 5000) + 1];
            tree.insert(&Key::from_i64(i), &value).unwrap();
        }
        freed_page = db.allocator().alloc(0).unwrap();
        db.allocator().free(freed_page).unwrap();
        db.close().unwrap();
    }

    let db = Db::open(&path, &config).unwrap();
    let tree = db.open_tree(root).unwrap();
    for i in 0..100i64 {
        let expected = vec![(i % 250) as u8; (i as usize % 5000) + 1];
        assert_eq!(
            tree.search(&Key::from_i64(i)).unwrap(),
            Some(expected),
            "value {} lost across restart",
            i
        );
    }
    tree.check_consistency().unwrap();

    // The freed page is still free: its group accounting survived.
    let again = db.allocator().alloc(freed_page).unwrap();
    assert_eq!(again, freed_page);
    db.close().unwrap();
}

#[test]
fn corrupted_superblock_refuses_to_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt_sb.simdb");
    {
        let db = Db::create(&path, &Config::default()).unwrap();
        db.close().unwrap();
    }

    flip_byte(&path, 12); // total_pages field
    assert!(matches!(
        Db::open(&path, &Config::default()),
        Err(DbError::CorruptedMetadata(_))
    ));
}

#[test]
fn corrupted_gdt_refuses_to_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt_gdt.simdb");
    {
        let db = Db::create(&path, &Config::default()).unwrap();
        db.close().unwrap();
    }

    // A byte in the middle of GDT page 30.
    flip_byte(&path, (1 + 30) * PAGE_SIZE as u64 + 2048);
    assert!(matches!(
        Db::open(&path, &Config::default()),
        Err(DbError::CorruptedMetadata(_))
    ));
}

fn flip_byte(path: &std::path::Path, offset: u64) {
    use std::io::{Read, Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}

#[test]
fn flush_never_sees_a_torn_page() {
    let dir = tempdir().unwrap();
    let db = Arc::new(setup_file(&dir.path().join("torn.simdb")));
    let page = db.allocator().alloc(0).unwrap();

    let writer = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || {
            for round in 1..=100u8 {
                let mut guard = db.pool().fetch(page, LatchMode::Exclusive).unwrap();
                guard.data_mut().fill(round);
                guard.mark_dirty();
            }
        })
    };
    let flusher = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || {
            for _ in 0..100 {
                db.pool().flush(page).unwrap();
            }
        })
    };
    writer.join().unwrap();
    flusher.join().unwrap();
    db.pool().flush(page).unwrap();

    // Whatever landed on disk is one whole write, never a mix.
    let mut buf = [0u8; PAGE_SIZE];
    db.store().read_page(page, &mut buf).unwrap();
    let first = buf[0];
    assert!(first >= 1);
    assert!(buf.iter().all(|b| *b == first), "torn page on disk");
}

#[test]
fn trees_share_one_database() {
    let db = Db::create_in_memory(&Config::default()).unwrap();
    let t1 = db.create_tree().unwrap();
    let t2 = db.create_tree().unwrap();

    for i in 0..60i64 {
        t1.insert(&Key::from_i64(i), b"tree-one").unwrap();
        t2.insert(&Key::from_i64(i), b"tree-two").unwrap();
    }
    for i in 0..60i64 {
        assert_eq!(t1.search(&Key::from_i64(i)).unwrap(), Some(b"tree-one".to_vec()));
        assert_eq!(t2.search(&Key::from_i64(i)).unwrap(), Some(b"tree-two".to_vec()));
    }
    t1.check_consistency().unwrap();
    t2.check_consistency().unwrap();
}
