//! # Split, Growth, and Layer Property Scenarios
//!
//! Exercises the structural machinery end to end: foster splits and root
//! growth under sequential and random loads (the pre-split key set must
//! survive verbatim), deleted-slot reuse, increments, the same-key insert
//! race, and the array storage's shared OCC contract.

use std::sync::{Arc, Barrier, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use masskv::config::EngineOptions;
use masskv::{Engine, ErrorCode};

fn engine_with_pages(pages: usize) -> Engine {
    let engine = Engine::new(EngineOptions {
        numa_nodes: 1,
        pages_per_node: pages,
    })
    .unwrap();
    engine.initialize().unwrap();
    engine
}

#[test]
fn sequential_inserts_survive_splits_and_growth() {
    const KEYS: u64 = 500;
    let engine = engine_with_pages(2048);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "seq")
        .unwrap();

    // Far more keys than one border page holds: foster splits, adoption
    // and root growth all fire.
    for key in 0..KEYS {
        engine.begin_xct(&mut ctx).unwrap();
        tree.insert_record_normalized(&mut ctx, key, &(key ^ 0xDEAD).to_ne_bytes())
            .unwrap();
        engine.precommit_xct(&mut ctx).unwrap();
    }

    engine.begin_xct(&mut ctx).unwrap();
    for key in 0..KEYS {
        let read: u64 = tree
            .get_record_primitive_normalized(&mut ctx, key, 0)
            .unwrap_or_else(|e| panic!("key {key} lost after splits: {e}"));
        assert_eq!(read, key ^ 0xDEAD);
    }
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn descending_inserts_survive_splits() {
    const KEYS: u64 = 300;
    let engine = engine_with_pages(4096);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "desc")
        .unwrap();

    for key in (0..KEYS).rev() {
        engine.begin_xct(&mut ctx).unwrap();
        tree.insert_record_normalized(&mut ctx, key, &(key + 13).to_ne_bytes())
            .unwrap();
        engine.precommit_xct(&mut ctx).unwrap();
    }

    engine.begin_xct(&mut ctx).unwrap();
    for key in 0..KEYS {
        let read: u64 = tree
            .get_record_primitive_normalized(&mut ctx, key, 0)
            .unwrap_or_else(|e| panic!("key {key} lost: {e}"));
        assert_eq!(read, key + 13);
    }
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn shuffled_inserts_survive_splits() {
    const KEYS: u64 = 400;
    let engine = engine_with_pages(2048);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "shuffled")
        .unwrap();

    let mut order: Vec<u64> = (0..KEYS).collect();
    order.shuffle(&mut StdRng::seed_from_u64(42));
    for &key in &order {
        engine.begin_xct(&mut ctx).unwrap();
        tree.insert_record_normalized(&mut ctx, key * 1_000_003, &key.to_ne_bytes())
            .unwrap();
        engine.precommit_xct(&mut ctx).unwrap();
    }

    engine.begin_xct(&mut ctx).unwrap();
    for key in 0..KEYS {
        let read: u64 = tree
            .get_record_primitive_normalized(&mut ctx, key * 1_000_003, 0)
            .unwrap_or_else(|e| panic!("key {key} lost: {e}"));
        assert_eq!(read, key);
    }
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn variable_length_keys_with_suffixes_survive_splits() {
    let engine = engine_with_pages(2048);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "var")
        .unwrap();

    let make_key = |i: u32| format!("user:{i:06}:profile-settings");
    for i in 0..300u32 {
        engine.begin_xct(&mut ctx).unwrap();
        tree.insert_record(&mut ctx, make_key(i).as_bytes(), &i.to_ne_bytes())
            .unwrap();
        engine.precommit_xct(&mut ctx).unwrap();
    }

    engine.begin_xct(&mut ctx).unwrap();
    for i in 0..300u32 {
        let read: u32 = tree
            .get_record_primitive(&mut ctx, make_key(i).as_bytes(), 0)
            .unwrap_or_else(|e| panic!("key {i} lost: {e}"));
        assert_eq!(read, i);
    }
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn deleted_slot_is_reused_by_a_later_insert() {
    let engine = engine_with_pages(256);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "reuse")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"phoenix", b"first-life").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.delete_record(&mut ctx, b"phoenix").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    // Shorter payload into the same physical slot.
    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"phoenix", b"second").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let mut buf = [0u8; 16];
    let len = tree.get_record(&mut ctx, b"phoenix", &mut buf).unwrap();
    assert_eq!(&buf[..len], b"second");
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

/// Reinserting a deleted key with a payload larger than the original
/// reservation must succeed: the undersized leftover slot is retired and
/// the key gets fresh cell space.
#[test]
fn reinserting_a_deleted_key_with_a_larger_payload_allocates_fresh_space() {
    let engine = engine_with_pages(256);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "regrow")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"k", &[0xAA; 16]).unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.delete_record(&mut ctx, b"k").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    // Four times the original cell; the page itself has plenty of room.
    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"k", &[0xBB; 64]).unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let mut buf = [0u8; 128];
    let len = tree.get_record(&mut ctx, b"k", &mut buf).unwrap();
    assert_eq!(&buf[..len], &[0xBB; 64]);
    engine.precommit_xct(&mut ctx).unwrap();

    // Shrinking again reuses the larger slot in place.
    engine.begin_xct(&mut ctx).unwrap();
    tree.delete_record(&mut ctx, b"k").unwrap();
    engine.precommit_xct(&mut ctx).unwrap();
    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"k", &[0xCC; 8]).unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let len = tree.get_record(&mut ctx, b"k", &mut buf).unwrap();
    assert_eq!(&buf[..len], &[0xCC; 8]);
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn normalized_reinsert_with_a_larger_payload() {
    let engine = engine_with_pages(256);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "regrow-norm")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record_normalized(&mut ctx, 9, &7u64.to_ne_bytes())
        .unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.delete_record_normalized(&mut ctx, 9).unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record_normalized(&mut ctx, 9, &[0x5A; 32]).unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let mut buf = [0u8; 64];
    let len = tree.get_record_normalized(&mut ctx, 9, &mut buf).unwrap();
    assert_eq!(&buf[..len], &[0x5A; 32]);
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn increment_accumulates_across_transactions() {
    let engine = engine_with_pages(256);
    let mut ctx = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut ctx, "counter")
        .unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    tree.insert_record(&mut ctx, b"hits", &100u64.to_ne_bytes())
        .unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    for expected in [105u64, 110] {
        engine.begin_xct(&mut ctx).unwrap();
        let mut delta = 5u64;
        tree.increment_record(&mut ctx, b"hits", &mut delta, 0)
            .unwrap();
        assert_eq!(delta, expected);
        engine.precommit_xct(&mut ctx).unwrap();
    }

    engine.begin_xct(&mut ctx).unwrap();
    let read: u64 = tree.get_record_primitive(&mut ctx, b"hits", 0).unwrap();
    assert_eq!(read, 110);
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

/// Two racing inserters of one key: exactly one logical insertion commits,
/// the loser sees `AlreadyExists` or aborts at commit, and the surviving
/// value belongs to the winner.
#[test]
fn same_key_insert_race_commits_once() {
    let engine = Arc::new(
        Engine::new(EngineOptions {
            numa_nodes: 1,
            pages_per_node: 512,
        })
        .unwrap(),
    );
    engine.initialize().unwrap();
    {
        let mut ctx = engine.attach_thread(0).unwrap();
        engine
            .storage_manager()
            .create_masstree(&mut ctx, "duel")
            .unwrap();
    }

    let barrier = Arc::new(Barrier::new(2));
    let winners = Arc::new(Mutex::new(Vec::new()));
    std::thread::scope(|scope| {
        for tag in [0x11u8, 0x22] {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            scope.spawn(move || {
                let tree = engine
                    .storage_manager()
                    .get_storage("duel")
                    .unwrap()
                    .as_masstree()
                    .cloned()
                    .unwrap();
                let mut ctx = engine.attach_thread(0).unwrap();
                barrier.wait();
                loop {
                    engine.begin_xct(&mut ctx).unwrap();
                    match tree.insert_record(&mut ctx, b"contested", &[tag; 8]) {
                        Ok(()) => match engine.precommit_xct(&mut ctx) {
                            Ok(_) => {
                                winners.lock().unwrap().push(tag);
                                return;
                            }
                            Err(ErrorCode::XctRaceAbort) => continue,
                            Err(e) => panic!("unexpected commit error: {e}"),
                        },
                        Err(ErrorCode::AlreadyExists) => {
                            engine.abort_xct(&mut ctx);
                            return;
                        }
                        Err(e) => panic!("unexpected insert error: {e}"),
                    }
                }
            });
        }
    });

    let winners = winners.lock().unwrap();
    assert_eq!(winners.len(), 1, "exactly one insert may commit");

    let tree = engine
        .storage_manager()
        .get_storage("duel")
        .unwrap()
        .as_masstree()
        .cloned()
        .unwrap();
    let mut ctx = engine.attach_thread(0).unwrap();
    engine.begin_xct(&mut ctx).unwrap();
    let mut buf = [0u8; 8];
    tree.get_record(&mut ctx, b"contested", &mut buf).unwrap();
    assert_eq!(buf, [winners[0]; 8]);
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}

#[test]
fn read_write_conflict_aborts_the_reader() {
    let engine = engine_with_pages(256);
    let mut writer = engine.attach_thread(0).unwrap();
    let mut reader = engine.attach_thread(0).unwrap();
    let tree = engine
        .storage_manager()
        .create_masstree(&mut writer, "conflict")
        .unwrap();

    engine.begin_xct(&mut writer).unwrap();
    tree.insert_record_normalized(&mut writer, 1, &1u64.to_ne_bytes())
        .unwrap();
    engine.precommit_xct(&mut writer).unwrap();

    // Reader observes, writer commits an overwrite, reader must abort.
    engine.begin_xct(&mut reader).unwrap();
    let _: u64 = tree
        .get_record_primitive_normalized(&mut reader, 1, 0)
        .unwrap();

    engine.begin_xct(&mut writer).unwrap();
    tree.overwrite_record_normalized(&mut writer, 1, &2u64.to_ne_bytes(), 0)
        .unwrap();
    engine.precommit_xct(&mut writer).unwrap();

    assert_eq!(
        engine.precommit_xct(&mut reader),
        Err(ErrorCode::XctRaceAbort)
    );
    engine.uninitialize().unwrap();
}

#[test]
fn array_storage_shares_the_occ_contract() {
    let engine = engine_with_pages(1024);
    let mut ctx = engine.attach_thread(0).unwrap();
    let array = engine
        .storage_manager()
        .create_array(&mut ctx, "slots", 16, 5000)
        .unwrap();
    assert!(array.levels() >= 2);

    engine.begin_xct(&mut ctx).unwrap();
    array
        .overwrite_record_primitive(&mut ctx, 4321, 0xFEEDu64, 0)
        .unwrap();
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let read: u64 = array.get_record_primitive(&mut ctx, 4321, 0).unwrap();
    assert_eq!(read, 0xFEED);
    // Untouched records read back their zero-filled payloads.
    let zero: u64 = array.get_record_primitive(&mut ctx, 17, 0).unwrap();
    assert_eq!(zero, 0);

    let mut delta = 2u64;
    array.increment_record(&mut ctx, 4321, &mut delta, 0).unwrap();
    assert_eq!(delta, 0xFEED + 2);
    engine.precommit_xct(&mut ctx).unwrap();

    engine.begin_xct(&mut ctx).unwrap();
    let read: u64 = array.get_record_primitive(&mut ctx, 4321, 0).unwrap();
    assert_eq!(read, 0xFEED + 2);
    assert_eq!(
        array.get_record_primitive::<u64>(&mut ctx, 5000, 0),
        Err(ErrorCode::KeyNotFound)
    );
    engine.precommit_xct(&mut ctx).unwrap();
    engine.uninitialize().unwrap();
}
