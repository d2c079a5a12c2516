//! # Masstree End-to-End Scenarios
//!
//! Engine-level tests driving the masstree storage through full
//! transactions: create, miss, insert, read-back, overwrite, concurrent
//! same-range writers, and multi-layer keys sharing an 8-byte prefix.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use masskv::config::EngineOptions;
use masskv::{Engine, ErrorCode};

fn tiny_engine() -> Engine {
    let engine = Engine::new(EngineOptions::tiny()).unwrap();
    engine.initialize().unwrap();
    engine
}

#[test]
fn create() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "test")
        .unwrap();
    assert_eq!(tree.name(), "test");
    assert!(engine.storage_manager().get_storage("test").is_some());
    engine.uninitialize().unwrap();
}

#[test]
fn create_rejects_duplicate_names() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    engine
        .storage_manager()
        .create_masstree(&mut ctx, "dup")
        .unwrap();
    let result = engine.storage_manager().create_masstree(&mut ctx, "dup");
    assert!(matches!(result, Err(ErrorCode::AlreadyExists)));
    engine.uninitialize().unwrap();
}

#[test]
fn create_and_query() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "test2")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let key = [0u8; 100];
    let mut buf = [0u8; 16];
    let result = tree.get_record(&mut ctx, &key, &mut buf);
    assert_eq!(result, Err(ErrorCode::KeyNotFound));
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn create_and_insert() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "ggg")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let data: u64 = 897565433333126;
    tree.insert_record_normalized(&mut ctx, 12345, &data.to_ne_bytes())
        .unwrap();
    let epoch = engine.precommit_xct(&mut ctx).unwrap();
    engine.xct_manager().wait_for_commit(epoch).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn create_and_insert_and_read() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "ggg")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let data: u64 = 897565433333126;
    tree.insert_record_normalized(&mut ctx, 12345, &data.to_ne_bytes())
        .unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let read: u64 = tree
        .get_record_primitive_normalized(&mut ctx, 12345, 0)
        .unwrap();
    assert_eq!(read, data);
    let epoch = engine.precommit_xct(&mut ctx).unwrap();
    engine.xct_manager().wait_for_commit(epoch).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn overwrite() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "ggg")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let data: u64 = 897565433333126;
    tree.insert_record_normalized(&mut ctx, 12345, &data.to_ne_bytes())
        .unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let data2: u64 = 321654987;
    tree.overwrite_record_normalized(&mut ctx, 12345, &data2.to_ne_bytes(), 0)
        .unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let read: u64 = tree
        .get_record_primitive_normalized(&mut ctx, 12345, 0)
        .unwrap();
    assert_eq!(read, data2);
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn overwrite_is_idempotent() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "idem")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record_normalized(&mut ctx, 7, &77u64.to_ne_bytes())
        .unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    for _ in 0..2 {
        engine.begin_xct(&mut ctx).unwrap();
        tree.overwrite_record_normalized(&mut ctx, 7, &99u64.to_ne_bytes(), 0)
            .unwrap();
        engine.precommit_xct(&mut ctx).unwrap();
    }

    engine.begin_xct(&mut ctx).unwrap();
    let read: u64 = tree.get_record_primitive_normalized(&mut ctx, 7, 0).unwrap();
    assert_eq!(read, 99);
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

/// 4 threads race ascending and descending inserts over the same 1,000
/// slices. Every key must end up present exactly once with the agreed
/// value; same-key losers abort and observe `AlreadyExists`.
#[test]
fn concurrent_inserts_from_four_threads() {
    const KEYS: u64 = 1000;
    let engine = Arc::new(
        Engine::new(EngineOptions {
            numa_nodes: 1,
            pages_per_node: 8 * 1024,
        })
        .unwrap(),
    );
    engine.initialize().unwrap();
    {
        let mut ctx = engine.attach_thread(0).unwrap();
        engine
            .storage_manager()
            .create_masstree(&mut ctx, "race")
            .unwrap();
    }

    let barrier = Arc::new(Barrier::new(4));
    let committed = Arc::new(AtomicUsize::new(0));
    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let committed = Arc::clone(&committed);
            scope.spawn(move || {
                let tree = engine
                    .storage_manager()
                    .get_storage("race")
                    .unwrap()
                    .as_masstree()
                    .cloned()
                    .unwrap();
                let mut ctx = engine.attach_thread(0).unwrap();
                barrier.wait();
                let ascending = worker % 2 == 0;
                for step in 0..KEYS {
                    let key = if ascending { step } else { KEYS - 1 - step };
                    let value = key * 7 + 1;
                    loop {
                        engine.begin_xct(&mut ctx).unwrap();
                        match tree.insert_record_normalized(&mut ctx, key, &value.to_ne_bytes())
                        {
                            Ok(()) => match engine.precommit_xct(&mut ctx) {
                                Ok(_) => {
                                    committed.fetch_add(1, Ordering::Relaxed);
                                    break;
                                }
                                Err(ErrorCode::XctRaceAbort) => continue,
                                Err(e) => panic!("unexpected commit error: {e}"),
                            },
                            Err(ErrorCode::AlreadyExists) => {
                                engine.abort_xct(&mut ctx);
                                break;
                            }
                            Err(e) => panic!("unexpected insert error: {e}"),
                        }
                    }
                }
            });
        }
    });

    // Exactly one insert per key committed.
    assert_eq!(committed.load(Ordering::Relaxed), KEYS as usize);

    let tree = engine
        .storage_manager()
        .get_storage("race")
        .unwrap()
        .as_masstree()
        .cloned()
        .unwrap();
    let mut ctx = engine.attach_thread(0).unwrap();
    engine.begin_xct(&mut ctx).unwrap();
    for key in 0..KEYS {
        let read: u64 = tree
            .get_record_primitive_normalized(&mut ctx, key, 0)
            .unwrap_or_else(|e| panic!("key {key} missing: {e}"));
        assert_eq!(read, key * 7 + 1, "key {key} has a stranger's value");
    }
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

/// Two keys sharing their first 8 bytes land in different trie layers and
/// both stay readable; a third key that is exactly the shared prefix
/// coexists in the first layer.
#[test]
fn shared_prefix_keys_split_into_layers() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "layers")
        .unwrap();

    let key_a = b"PREFIX00tail-one";
    let key_b = b"PREFIX00tail-two";
    let key_c = b"PREFIX00";

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, key_a, b"payload-a").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, key_b, b"payload-b").unwrap();
    tree.insert_record(&mut ctx, key_c, b"payload-c").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let mut buf = [0u8; 32];
    let len = tree.get_record(&mut ctx, key_a, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"payload-a");
    let len = tree.get_record(&mut ctx, key_b, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"payload-b");
    let len = tree.get_record(&mut ctx, key_c, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"payload-c");
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn deeper_layers_from_longer_shared_prefixes() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "deep")
        .unwrap();

    // 16 shared bytes force two layer descents.
    let key_a = b"AAAAAAAABBBBBBBBone!";
    let key_b = b"AAAAAAAABBBBBBBBtwo!";

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, key_a, b"1").unwrap();
    tree.insert_record(&mut ctx, key_b, b"2").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let mut buf = [0u8; 8];
    let len = tree.get_record(&mut ctx, key_a, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"1");
    let len = tree.get_record(&mut ctx, key_b, &mut buf).unwrap();
    assert_eq!(&buf[..len], b"2");
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn create_and_drop() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "dd")
        .unwrap();
    let free_before = engine.resolver().pool(0).free_count();
    engine.storage_manager().drop_storage(tree.id()).unwrap();
    assert!(engine.storage_manager().get_storage("dd").is_none());
    assert!(engine.resolver().pool(0).free_count() > free_before);
    engine.uninitialize().unwrap();
}

#[test]
fn insert_then_delete_then_miss() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "del")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"victim", b"data").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.delete_record(&mut ctx, b"victim").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(
        tree.get_record(&mut ctx, b"victim", &mut buf),
        Err(ErrorCode::KeyNotFound)
    );
    // Deleting again misses too.
    assert_eq!(
        tree.delete_record(&mut ctx, b"victim"),
        Err(ErrorCode::KeyNotFound)
    );
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn buffer_and_range_errors() {
    let engine = tiny_engine();
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "errs")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"k", &[0xAB; 12]).unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let mut small = [0u8; 4];
    assert_eq!(
        tree.get_record(&mut ctx, b"k", &mut small),
        Err(ErrorCode::TooSmallPayloadBuffer)
    );
    assert_eq!(
        tree.overwrite_record(&mut ctx, b"k", &[0u8; 8], 8),
        Err(ErrorCode::TooShortPayload)
    );
    let mut part = [0u8; 4];
    tree.get_record_part(&mut ctx, b"k", &mut part, 8).unwrap();
    assert_eq!(part, [0xAB; 4]);
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}
