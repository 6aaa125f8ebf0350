//! End-to-end apply scenarios against the in-process publisher.

mod common;

use common::{
    insert_xact, items_body, items_table, prepare_data, prepare_xact, row, stream_chunk, stream_commit,
    subscription, wait_for, Harness, LOCAL_RELID, REMOTE_RELID, SUBID, SYSID,
};
use logrep_apply::config::StreamingDebugMode;
use logrep_apply::conflict::ConflictType;
use logrep_apply::locks::LockTag;
use logrep_apply::proto::{LogicalMessage, TupleData};
use logrep_apply::slots::WorkerKind;
use logrep_apply::storage::{type_oid, Datum, RelationDesc, SequenceData, SequenceParams};
use logrep_apply::types::{
    sequencesync_application_name, tablesync_slot_name, two_phase_gid, StreamingMode, TwoPhaseState,
};
use logrep_apply::upstream::RemoteSequence;
use logrep_apply::{Catalog, Lsn, RelState, StorageEngine};

#[tokio::test]
async fn test_insert_is_applied_and_confirmed() {
    let mut h = Harness::new(subscription(StreamingMode::Off), RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    h.publisher
        .publish(Lsn(0x1100), insert_xact(740, Lsn(0x1000), Lsn(0x1100), &[(1, "a"), (2, "b")]));
    h.wait_rows(&[(1, "a"), (2, "b")]).await;

    // The commit end is reported back as flushed.
    h.wait_confirmed(Lsn(0x1100)).await;
    assert!(h.publisher.replies().iter().any(|(slot, _)| slot == "sub1"));
    assert_eq!(h.catalog.stats(SUBID).apply_error_count, 0);
    h.stop().await;
}

#[tokio::test]
async fn test_update_of_missing_row_is_reported_and_skipped() {
    let mut h = Harness::new(subscription(StreamingMode::Off), RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    h.publisher.publish(
        Lsn(0x2100),
        vec![
            LogicalMessage::Begin {
                final_lsn: Lsn(0x2000),
                commit_time: 0,
                xid: 741,
            },
            LogicalMessage::Relation {
                xid: None,
                body: items_body(),
            },
            LogicalMessage::Update {
                xid: None,
                relid: REMOTE_RELID,
                old_tuple: None,
                new_tuple: row(9, "z"),
            },
            LogicalMessage::Commit {
                commit_lsn: Lsn(0x2000),
                end_lsn: Lsn(0x2100),
                commit_time: 0,
            },
        ],
    );
    h.wait_confirmed(Lsn(0x2100)).await;
    assert_eq!(h.env.conflicts.count(ConflictType::UpdateMissing), 1);
    let record = &h.env.conflicts.records()[0];
    assert_eq!(record.relation, "public.items");
    assert_eq!(record.remote_xid, 741);
    assert!(h.local_rows().is_empty());

    // The worker keeps going.
    h.publisher
        .publish(Lsn(0x2300), insert_xact(742, Lsn(0x2200), Lsn(0x2300), &[(3, "c")]));
    h.wait_rows(&[(3, "c")]).await;
    h.stop().await;
}

#[tokio::test]
async fn test_streamed_transaction_is_spooled_and_applied_at_commit() {
    let mut h = Harness::new(subscription(StreamingMode::On), RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    h.publisher
        .publish(Lsn(0x3000), stream_chunk(750, true, &[(750, 1, "a"), (750, 2, "b")]));
    h.publisher
        .publish(Lsn(0x3100), stream_chunk(750, false, &[(750, 3, "c")]));

    // Nothing is visible before the commit arrives.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(h.local_rows().is_empty());

    h.publisher
        .publish(Lsn(0x3300), vec![stream_commit(750, Lsn(0x3200), Lsn(0x3300))]);
    h.wait_rows(&[(1, "a"), (2, "b"), (3, "c")]).await;
    h.wait_confirmed(Lsn(0x3300)).await;
    h.stop().await;
}

#[tokio::test]
async fn test_subtransaction_abort_discards_its_changes() {
    let mut h = Harness::new(subscription(StreamingMode::On), RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    // Row 2 belongs to subtransaction 761, which is rolled back between
    // chunks.
    h.publisher
        .publish(Lsn(0x4000), stream_chunk(760, true, &[(760, 1, "a"), (761, 2, "b")]));
    h.publisher.publish(
        Lsn(0x4100),
        vec![LogicalMessage::StreamAbort {
            xid: 760,
            subxid: 761,
            abort_lsn: Lsn(0x4100),
            abort_time: 0,
        }],
    );
    h.publisher
        .publish(Lsn(0x4200), stream_chunk(760, false, &[(760, 3, "c")]));
    h.publisher
        .publish(Lsn(0x4400), vec![stream_commit(760, Lsn(0x4300), Lsn(0x4400))]);

    h.wait_rows(&[(1, "a"), (3, "c")]).await;
    h.wait_confirmed(Lsn(0x4400)).await;
    h.stop().await;
}

#[tokio::test]
async fn test_parallel_apply_keeps_an_idle_applier() {
    let mut h = Harness::new(subscription(StreamingMode::Parallel), RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    h.publisher
        .publish(Lsn(0x5000), stream_chunk(770, true, &[(770, 1, "a"), (770, 2, "b")]));
    h.publisher
        .publish(Lsn(0x5200), vec![stream_commit(770, Lsn(0x5100), Lsn(0x5200))]);
    h.wait_rows(&[(1, "a"), (2, "b")]).await;
    h.wait_confirmed(Lsn(0x5200)).await;

    // Half the pool cap stays around for the next streamed transaction.
    let appliers = h
        .env
        .slots
        .snapshot()
        .into_iter()
        .filter(|w| w.kind == WorkerKind::ParallelApply && w.subid == SUBID)
        .count();
    assert_eq!(appliers, 1);
    h.stop().await;
}

#[tokio::test]
async fn test_forced_partial_serialize_still_commits() {
    let mut h = Harness::new(subscription(StreamingMode::Parallel), RelState::Ready, |config| {
        config.debug_logical_replication_streaming = StreamingDebugMode::Immediate;
    });
    h.start();
    h.wait_streaming().await;

    h.publisher
        .publish(Lsn(0x6000), stream_chunk(780, true, &[(780, 1, "a")]));
    h.publisher
        .publish(Lsn(0x6100), stream_chunk(780, false, &[(780, 2, "b")]));
    h.publisher
        .publish(Lsn(0x6300), vec![stream_commit(780, Lsn(0x6200), Lsn(0x6300))]);

    h.wait_rows(&[(1, "a"), (2, "b")]).await;
    h.wait_confirmed(Lsn(0x6300)).await;

    // An applier that went through partial serialize is not reused.
    wait_for("applier exit", || {
        !h.env
            .slots
            .snapshot()
            .iter()
            .any(|w| w.kind == WorkerKind::ParallelApply)
    })
    .await;
    h.stop().await;
}

#[tokio::test]
async fn test_initial_sync_hands_table_to_leader() {
    let mut h = Harness::new(subscription(StreamingMode::Off), RelState::Init, |_| {});
    h.publisher
        .add_table(items_body(), &["pub1"], vec![row(1, "a"), row(2, "b")]);
    h.start();

    h.wait_relation_state(RelState::Ready).await;
    h.wait_rows(&[(1, "a"), (2, "b")]).await;

    let sync_slot = tablesync_slot_name(SUBID, LOCAL_RELID, SYSID);
    wait_for("tablesync slot drop", || !h.publisher.slot_exists(&sync_slot)).await;
    wait_for("tablesync exit", || h.env.slots.find(SUBID, Some(LOCAL_RELID), false).is_none()).await;

    // Changes after the handoff come through the leader.
    let end = h.publisher.wal_end().0 + 0x200;
    h.publisher
        .publish(Lsn(end), insert_xact(790, Lsn(end - 0x100), Lsn(end), &[(3, "c")]));
    h.wait_rows(&[(1, "a"), (2, "b"), (3, "c")]).await;
    h.stop().await;
}

#[tokio::test]
async fn test_prepared_transaction_commits_and_rolls_back() {
    let mut sub = subscription(StreamingMode::Off);
    sub.two_phase = TwoPhaseState::Enabled;
    let mut h = Harness::new(sub, RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;
    assert!(h.publisher.stream_options("sub1").is_some_and(|o| o.two_phase));

    let gid = two_phase_gid(SUBID, 820);
    h.publisher.publish(
        Lsn(0x8100),
        prepare_xact(820, "pub_820", Lsn(0x8000), Lsn(0x8100), &[(1, "a")]),
    );
    h.wait_confirmed(Lsn(0x8100)).await;
    assert!(h.storage.is_prepared(&gid));

    h.publisher.publish(
        Lsn(0x8300),
        vec![LogicalMessage::CommitPrepared {
            commit_lsn: Lsn(0x8200),
            end_lsn: Lsn(0x8300),
            commit_time: 0,
            xid: 820,
            gid: "pub_820".into(),
        }],
    );
    h.wait_confirmed(Lsn(0x8300)).await;
    assert!(!h.storage.is_prepared(&gid));
    h.wait_rows(&[(1, "a")]).await;

    // A rolled back PREPARE leaves nothing behind.
    let gid = two_phase_gid(SUBID, 821);
    h.publisher.publish(
        Lsn(0x8500),
        prepare_xact(821, "pub_821", Lsn(0x8400), Lsn(0x8500), &[(2, "b")]),
    );
    h.wait_confirmed(Lsn(0x8500)).await;
    assert!(h.storage.is_prepared(&gid));
    h.publisher.publish(
        Lsn(0x8700),
        vec![LogicalMessage::RollbackPrepared {
            prepare_end_lsn: Lsn(0x8500),
            rollback_end_lsn: Lsn(0x8700),
            prepare_time: 0,
            rollback_time: 0,
            xid: 821,
            gid: "pub_821".into(),
        }],
    );
    h.wait_confirmed(Lsn(0x8700)).await;
    assert!(!h.storage.is_prepared(&gid));
    h.wait_rows(&[(1, "a")]).await;
    h.stop().await;
}

#[tokio::test]
async fn test_stream_prepare_then_commit_prepared() {
    let mut sub = subscription(StreamingMode::On);
    sub.two_phase = TwoPhaseState::Enabled;
    let mut h = Harness::new(sub, RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    let gid = two_phase_gid(SUBID, 830);
    h.publisher
        .publish(Lsn(0x9000), stream_chunk(830, true, &[(830, 3, "c")]));
    h.publisher.publish(
        Lsn(0x9200),
        vec![LogicalMessage::StreamPrepare(prepare_data(
            830,
            "pub_830",
            Lsn(0x9100),
            Lsn(0x9200),
        ))],
    );
    h.wait_confirmed(Lsn(0x9200)).await;
    assert!(h.storage.is_prepared(&gid));
    assert!(h.spool_files().is_empty());

    h.publisher.publish(
        Lsn(0x9400),
        vec![LogicalMessage::CommitPrepared {
            commit_lsn: Lsn(0x9300),
            end_lsn: Lsn(0x9400),
            commit_time: 0,
            xid: 830,
            gid: "pub_830".into(),
        }],
    );
    h.wait_confirmed(Lsn(0x9400)).await;
    assert!(!h.storage.is_prepared(&gid));
    h.wait_rows(&[(3, "c")]).await;
    h.stop().await;
}

#[tokio::test]
async fn test_pending_two_phase_is_enabled_once_tables_are_ready() {
    let mut sub = subscription(StreamingMode::Off);
    sub.two_phase = TwoPhaseState::Pending;
    let mut h = Harness::new(sub, RelState::Init, |_| {});
    h.publisher
        .add_table(items_body(), &["pub1"], vec![row(1, "a")]);
    h.start();

    h.wait_relation_state(RelState::Ready).await;
    wait_for("two_phase enabled", || {
        h.catalog
            .subscription(SUBID)
            .is_some_and(|sub| sub.two_phase == TwoPhaseState::Enabled)
    })
    .await;
    // The leader restarts and asks the publisher for prepared transactions.
    wait_for("two_phase stream", || {
        h.publisher.live_streams() > 0
            && h.publisher.stream_options("sub1").is_some_and(|o| o.two_phase)
    })
    .await;
    h.wait_rows(&[(1, "a")]).await;
    h.stop().await;
}

#[tokio::test]
async fn test_skip_lsn_skips_one_transaction_and_is_cleared() {
    let mut sub = subscription(StreamingMode::Off);
    sub.skip_lsn = Lsn(0x7000);
    let mut h = Harness::new(sub, RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    // The skipped transaction would fail to apply.
    let mut bad = insert_xact(800, Lsn(0x7000), Lsn(0x7100), &[(5, "e")]);
    bad.insert(
        2,
        LogicalMessage::Insert {
            xid: None,
            relid: REMOTE_RELID,
            new_tuple: TupleData::from_text(&["not a number", "x"]),
        },
    );
    h.publisher.publish(Lsn(0x7100), bad);
    h.wait_confirmed(Lsn(0x7100)).await;
    assert!(h.local_rows().is_empty());
    wait_for("skip lsn cleared", || {
        h.catalog
            .subscription(SUBID)
            .is_some_and(|sub| !sub.skip_lsn.is_valid())
    })
    .await;
    assert_eq!(h.catalog.stats(SUBID).apply_error_count, 0);

    h.publisher
        .publish(Lsn(0x7300), insert_xact(801, Lsn(0x7200), Lsn(0x7300), &[(6, "f")]));
    h.wait_rows(&[(6, "f")]).await;
    h.stop().await;
}

#[tokio::test]
async fn test_disable_on_error_stops_the_subscription() {
    let mut sub = subscription(StreamingMode::Off);
    sub.disable_on_error = true;
    let mut h = Harness::new(sub, RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    let mut bad = insert_xact(802, Lsn(0x7800), Lsn(0x7900), &[]);
    bad.insert(
        2,
        LogicalMessage::Insert {
            xid: None,
            relid: REMOTE_RELID,
            new_tuple: TupleData::from_text(&["not a number", "x"]),
        },
    );
    h.publisher.publish(Lsn(0x7900), bad);

    wait_for("subscription disabled", || {
        h.catalog.subscription(SUBID).is_some_and(|sub| !sub.enabled)
    })
    .await;
    wait_for("leader exit", || h.env.slots.find(SUBID, None, false).is_none()).await;
    assert_eq!(h.catalog.stats(SUBID).apply_error_count, 1);
    assert!(h.local_rows().is_empty());

    // Not relaunched while disabled.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert!(h.env.slots.find(SUBID, None, false).is_none());
    h.stop().await;
}

#[tokio::test]
async fn test_subtransaction_abort_reaches_parallel_applier() {
    let mut h = Harness::new(subscription(StreamingMode::Parallel), RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    h.publisher
        .publish(Lsn(0xB000), stream_chunk(850, true, &[(850, 1, "a"), (851, 2, "b")]));
    wait_for("parallel applier", || {
        h.env
            .slots
            .snapshot()
            .iter()
            .any(|w| w.kind == WorkerKind::ParallelApply && w.subid == SUBID)
    })
    .await;
    h.publisher.publish(
        Lsn(0xB100),
        vec![LogicalMessage::StreamAbort {
            xid: 850,
            subxid: 851,
            abort_lsn: Lsn(0xB100),
            abort_time: 0,
        }],
    );
    h.publisher
        .publish(Lsn(0xB200), stream_chunk(850, false, &[(850, 3, "c")]));
    h.publisher
        .publish(Lsn(0xB400), vec![stream_commit(850, Lsn(0xB300), Lsn(0xB400))]);

    h.wait_rows(&[(1, "a"), (3, "c")]).await;
    h.wait_confirmed(Lsn(0xB400)).await;
    // Applied without falling back to the spool.
    assert!(h.spool_files().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn test_leader_and_applier_deadlock_is_an_error() {
    let mut h = Harness::new(subscription(StreamingMode::Parallel), RelState::Ready, |_| {});
    h.storage
        .insert_local(LOCAL_RELID, vec![vec![Datum::Int4(1), Datum::Text("a".into())]])
        .expect("seed row");
    let tid = h.storage.seq_scan(LOCAL_RELID).expect("scan")[0].tid;
    h.start();
    h.wait_streaming().await;

    // The applier updates row 1 and keeps it locked until its transaction
    // ends, then waits for the leader's next chunk.
    h.publisher.publish(
        Lsn(0xC000),
        vec![
            LogicalMessage::StreamStart {
                xid: 860,
                first_segment: true,
            },
            LogicalMessage::Relation {
                xid: Some(860),
                body: items_body(),
            },
            LogicalMessage::Update {
                xid: Some(860),
                relid: REMOTE_RELID,
                old_tuple: None,
                new_tuple: row(1, "streamed"),
            },
            LogicalMessage::StreamStop,
        ],
    );
    let row_lock = LockTag::Tuple {
        relid: LOCAL_RELID,
        tid,
    };
    wait_for("applier row lock", || !h.env.locks.holders(&row_lock).is_empty()).await;

    // The leader now needs the same row for a regular transaction.
    h.publisher.publish(
        Lsn(0xC200),
        vec![
            LogicalMessage::Begin {
                final_lsn: Lsn(0xC100),
                commit_time: 0,
                xid: 861,
            },
            LogicalMessage::Relation {
                xid: None,
                body: items_body(),
            },
            LogicalMessage::Update {
                xid: None,
                relid: REMOTE_RELID,
                old_tuple: None,
                new_tuple: row(1, "direct"),
            },
            LogicalMessage::Commit {
                commit_lsn: Lsn(0xC100),
                end_lsn: Lsn(0xC200),
                commit_time: 0,
            },
        ],
    );

    wait_for("deadlock error", || h.catalog.stats(SUBID).apply_error_count >= 1).await;
    h.stop().await;
}

#[tokio::test]
async fn test_truncate_cascades_to_referencing_tables() {
    const NOTES_RELID: u32 = 16500;
    let mut h = Harness::new(subscription(StreamingMode::Off), RelState::Ready, |_| {});
    let mut items = items_table();
    items.referenced_by.push(NOTES_RELID);
    h.storage.alter_table(items).expect("alter items");
    h.storage
        .create_table(RelationDesc::table(NOTES_RELID, "public", "notes").column("item_id", type_oid::INT4))
        .expect("create notes");
    h.storage
        .insert_local(LOCAL_RELID, vec![vec![Datum::Int4(1), Datum::Text("a".into())]])
        .expect("seed items");
    h.storage
        .insert_local(NOTES_RELID, vec![vec![Datum::Int4(1)]])
        .expect("seed notes");
    h.start();
    h.wait_streaming().await;

    h.publisher.publish(
        Lsn(0xD100),
        vec![
            LogicalMessage::Begin {
                final_lsn: Lsn(0xD000),
                commit_time: 0,
                xid: 870,
            },
            LogicalMessage::Relation {
                xid: None,
                body: items_body(),
            },
            LogicalMessage::Truncate {
                xid: None,
                relids: vec![REMOTE_RELID],
                cascade: true,
                restart_seqs: false,
            },
            LogicalMessage::Commit {
                commit_lsn: Lsn(0xD000),
                end_lsn: Lsn(0xD100),
                commit_time: 0,
            },
        ],
    );
    h.wait_confirmed(Lsn(0xD100)).await;
    assert!(h.local_rows().is_empty());
    assert!(h.storage.rows(NOTES_RELID).is_empty());
    h.stop().await;
}

#[tokio::test]
async fn test_empty_streamed_transaction_leaves_no_spool_files() {
    let mut h = Harness::new(subscription(StreamingMode::On), RelState::Ready, |_| {});
    h.start();
    h.wait_streaming().await;

    h.publisher.publish(
        Lsn(0xE000),
        vec![
            LogicalMessage::StreamStart {
                xid: 880,
                first_segment: true,
            },
            LogicalMessage::StreamStop,
        ],
    );
    h.publisher
        .publish(Lsn(0xE200), vec![stream_commit(880, Lsn(0xE100), Lsn(0xE200))]);
    h.wait_confirmed(Lsn(0xE200)).await;
    wait_for("spool cleanup", || h.spool_files().is_empty()).await;
    assert!(h.local_rows().is_empty());
    h.stop().await;
}

fn order_seq(last_value: i64, increment: i64) -> RemoteSequence {
    RemoteSequence {
        data: SequenceData {
            last_value,
            is_called: true,
        },
        page_lsn: Lsn(0xF000),
        params: SequenceParams {
            increment,
            ..SequenceParams::default()
        },
    }
}

#[tokio::test]
async fn test_sequences_are_synchronized_by_their_own_worker() {
    const SEQ_RELID: u32 = 16600;
    let mut h = Harness::new(subscription(StreamingMode::Off), RelState::Ready, |_| {});
    h.storage
        .create_table(RelationDesc::sequence(SEQ_RELID, "public", "order_seq", SequenceParams::default()))
        .expect("create sequence");
    h.catalog
        .set_sequence_state(SUBID, SEQ_RELID, RelState::Init, Lsn::INVALID)
        .expect("sequence state");
    h.publisher.set_sequence("public", "order_seq", order_seq(420, 1));
    h.start();

    wait_for("sequence ready", || h.catalog.sequence_states(SUBID, true).is_empty()).await;
    let state = h.catalog.sequence_states(SUBID, false)[0];
    assert_eq!(state.state, RelState::Ready);
    assert_eq!(state.lsn, Lsn(0xF000));
    assert_eq!(
        h.storage.sequence_data(SEQ_RELID),
        Some(SequenceData {
            last_value: 420,
            is_called: true
        })
    );
    let app_name = sequencesync_application_name(SUBID, SYSID);
    assert!(h.publisher.connections().contains(&app_name));
    wait_for("sequencesync exit", || h.env.slots.find_sequencesync(SUBID).is_none()).await;
    // The relation itself was never handed to a tablesync worker.
    assert_eq!(
        h.catalog.relation_state(SUBID, LOCAL_RELID).map(|s| s.state),
        Some(RelState::Ready)
    );
    h.stop().await;
}

#[tokio::test]
async fn test_mismatched_sequence_disables_on_error() {
    const SEQ_RELID: u32 = 16600;
    let mut sub = subscription(StreamingMode::Off);
    sub.disable_on_error = true;
    let mut h = Harness::new(sub, RelState::Ready, |_| {});
    h.storage
        .create_table(RelationDesc::sequence(SEQ_RELID, "public", "order_seq", SequenceParams::default()))
        .expect("create sequence");
    h.catalog
        .set_sequence_state(SUBID, SEQ_RELID, RelState::Init, Lsn::INVALID)
        .expect("sequence state");
    h.publisher.set_sequence("public", "order_seq", order_seq(420, 5));
    h.start();

    wait_for("subscription disabled", || {
        h.catalog.subscription(SUBID).is_some_and(|sub| !sub.enabled)
    })
    .await;
    assert_eq!(h.catalog.stats(SUBID).sync_error_count, 1);
    assert_eq!(h.catalog.sequence_states(SUBID, true).len(), 1);
    assert_eq!(h.storage.sequence_data(SEQ_RELID).map(|d| d.last_value), Some(1));
    h.stop().await;
}
