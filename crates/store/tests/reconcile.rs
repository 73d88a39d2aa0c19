#![forbid(unsafe_code)]

use shelf_core::{CorrelationToken, Draft, Entry, ImageUpload, LiveEvent, Provisional, Record, RecordId, SyncError};
use shelf_store::{PendingKind, Status, ViewState};

fn rec(id: &str) -> Record {
    Record {
        id: RecordId::new(id),
        title: format!("title {}", id),
        description: format!("desc {}", id),
        image_url: format!("http://img/{}.jpg", id),
        created_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        correlation: None,
    }
}

fn rec_with_token(id: &str, token: &CorrelationToken) -> Record {
    Record { correlation: Some(token.clone()), ..rec(id) }
}

fn seeded(ids: &[&str]) -> ViewState {
    let mut st = ViewState::new();
    assert!(st.begin_load());
    st.finish_load(ids.iter().map(|id| rec(id)).collect());
    st
}

/// Confirmed ids as-is, provisional entries as `~title`.
fn view(st: &ViewState) -> Vec<String> {
    st.entries()
        .iter()
        .map(|e| match e {
            Entry::Confirmed(r) => r.id.to_string(),
            Entry::Provisional(p) => format!("~{}", p.title),
        })
        .collect()
}

fn provisional(token: &str, title: &str) -> Provisional {
    let draft = Draft::new(title, "d", Some(ImageUpload::new("p.jpg", vec![1])));
    Provisional::from_draft(CorrelationToken::from(token), &draft)
}

fn assert_unique(st: &ViewState) {
    let mut ids: Vec<&RecordId> = st.entries().iter().filter_map(Entry::id).collect();
    let n = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), n, "duplicate id in view: {:?}", view(st));
}

#[test]
fn insert_prepends_ahead_of_snapshot() {
    let mut st = seeded(&["a", "b", "c"]);
    assert!(st.apply_insert(rec("d")));
    assert_eq!(view(&st), ["d", "a", "b", "c"]);
}

#[test]
fn remove_excises_record() {
    let mut st = seeded(&["d", "a", "b", "c"]);
    assert!(st.apply_remove(&RecordId::new("b")));
    assert_eq!(view(&st), ["d", "a", "c"]);
}

#[test]
fn removing_unknown_id_is_a_noop() {
    let mut st = seeded(&["a", "b"]);
    assert!(!st.apply_remove(&RecordId::new("z")));
    assert_eq!(view(&st), ["a", "b"]);
    assert!(st.last_error().is_none());
}

#[test]
fn refresh_reapplies_pending_delete_over_fresh_snapshot() {
    let mut st = seeded(&["a", "b", "c"]);
    assert!(st.begin_delete(&RecordId::new("c")));
    assert!(st.begin_load());
    assert_eq!(st.status(), &Status::Refreshing);
    st.finish_load(vec![rec("a"), rec("c"), rec("e")]);
    assert_eq!(view(&st), ["a", "e"]);
    assert_eq!(st.status(), &Status::Ready);
    match &st.pending()[0].kind {
        PendingKind::Delete { id, restore: Some(restore) } => {
            assert_eq!(id.as_str(), "c");
            assert_eq!(restore.index, 1);
            assert_eq!(restore.record.id.as_str(), "c");
            assert_eq!(restore.after, Some(RecordId::new("a")));
            assert_eq!(restore.before, Some(RecordId::new("e")));
        }
        other => panic!("unexpected pending op {:?}", other),
    }
}

#[test]
fn pending_delete_absent_from_snapshot_is_dropped() {
    let mut st = seeded(&["a", "b"]);
    st.begin_delete(&RecordId::new("b"));
    st.begin_load();
    st.finish_load(vec![rec("a")]);
    assert!(st.pending().is_empty());
    // A late rejection cannot bring it back.
    st.fail_delete(&RecordId::new("b"), SyncError::Conflict("gone".into()));
    assert_eq!(view(&st), ["a"]);
}

#[test]
fn duplicate_insert_of_snapshot_record_is_ignored() {
    let mut st = seeded(&["a", "b"]);
    assert!(!st.apply_insert(rec("a")));
    assert_eq!(view(&st), ["a", "b"]);
}

#[test]
fn insert_is_idempotent() {
    let mut once = seeded(&["a"]);
    once.apply_insert(rec("x"));
    let mut twice = seeded(&["a"]);
    twice.apply_insert(rec("x"));
    twice.apply_insert(rec("x"));
    assert_eq!(once.entries(), twice.entries());
}

#[test]
fn removed_ids_do_not_come_back() {
    let mut st = seeded(&["a", "b"]);
    st.apply_remove(&RecordId::new("b"));
    assert!(!st.apply_insert(rec("b")));
    assert_eq!(view(&st), ["a"]);
}

#[test]
fn snapshot_order_survives_unrelated_edits() {
    let mut st = seeded(&["a", "b", "c", "d", "e"]);
    st.apply_insert(rec("x"));
    st.apply_insert(rec("y"));
    st.apply_remove(&RecordId::new("x"));
    st.begin_delete(&RecordId::new("y"));
    st.apply_insert(rec("z"));
    let snapshot_only: Vec<String> = view(&st).into_iter().filter(|id| "abcde".contains(id.as_str())).collect();
    assert_eq!(snapshot_only, ["a", "b", "c", "d", "e"]);
}

#[test]
fn ids_stay_unique_under_mixed_traffic() {
    let mut st = seeded(&["0", "1", "2", "3"]);
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for step in 0..500 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let id = RecordId::new((seed % 12).to_string());
        match (seed >> 8) % 7 {
            0 | 1 => {
                st.apply_event(LiveEvent::Insert(rec(id.as_str())));
            }
            2 => {
                st.apply_event(LiveEvent::Remove(id));
            }
            3 => {
                st.begin_delete(&id);
            }
            4 => st.fail_delete(&id, SyncError::Conflict("no".into())),
            5 => {
                let token = CorrelationToken::from(format!("t{}", step % 5).as_str());
                st.begin_create(provisional(token.as_str(), "p"));
                st.confirm_create(&token, rec_with_token(id.as_str(), &token));
            }
            _ => {
                if st.begin_load() {
                    st.apply_event(LiveEvent::Insert(rec(id.as_str())));
                    let snapshot = st.entries().iter().filter_map(Entry::record).cloned().collect();
                    st.finish_load(snapshot);
                }
            }
        }
        assert_unique(&st);
    }
}

#[test]
fn rejected_delete_restores_exact_index() {
    let mut st = seeded(&["a", "b", "c", "d"]);
    assert!(st.begin_delete(&RecordId::new("c")));
    assert_eq!(view(&st), ["a", "b", "d"]);
    st.fail_delete(&RecordId::new("c"), SyncError::Conflict("locked".into()));
    assert_eq!(view(&st), ["a", "b", "c", "d"]);
    assert!(matches!(st.last_error(), Some(SyncError::Conflict(_))));
    assert!(st.pending().is_empty());
}

#[test]
fn rollback_after_prepends_returns_between_old_neighbours() {
    let mut st = seeded(&["a", "b", "c"]);
    st.begin_delete(&RecordId::new("b"));
    st.apply_insert(rec("d"));
    st.apply_insert(rec("e"));
    st.fail_delete(&RecordId::new("b"), SyncError::Conflict("locked".into()));
    assert_eq!(view(&st), ["e", "d", "a", "b", "c"]);
}

#[test]
fn rollback_after_earlier_remove_keeps_following_record_behind() {
    let mut st = seeded(&["a", "b", "c", "d"]);
    st.begin_delete(&RecordId::new("c"));
    st.apply_remove(&RecordId::new("a"));
    st.fail_delete(&RecordId::new("c"), SyncError::Conflict("locked".into()));
    assert_eq!(view(&st), ["b", "c", "d"]);
}

#[test]
fn rollback_falls_back_to_next_neighbour_then_index() {
    let mut st = seeded(&["a", "b", "c", "d"]);
    st.begin_delete(&RecordId::new("c"));
    st.apply_remove(&RecordId::new("b"));
    st.apply_insert(rec("x"));
    st.fail_delete(&RecordId::new("c"), SyncError::Conflict("locked".into()));
    assert_eq!(view(&st), ["x", "a", "c", "d"]);

    let mut st = seeded(&["a", "b", "c"]);
    st.begin_delete(&RecordId::new("b"));
    st.apply_remove(&RecordId::new("a"));
    st.apply_remove(&RecordId::new("c"));
    st.apply_insert(rec("x"));
    st.fail_delete(&RecordId::new("b"), SyncError::Conflict("locked".into()));
    assert_eq!(view(&st), ["x", "b"]);
}

#[test]
fn second_delete_of_same_id_is_refused() {
    let mut st = seeded(&["a"]);
    assert!(st.begin_delete(&RecordId::new("a")));
    assert!(!st.begin_delete(&RecordId::new("a")));
}

#[test]
fn remove_event_settles_pending_delete() {
    let mut st = seeded(&["a", "b"]);
    st.begin_delete(&RecordId::new("b"));
    assert!(!st.apply_remove(&RecordId::new("b")));
    assert!(st.pending().is_empty());
    st.fail_delete(&RecordId::new("b"), SyncError::Conflict("already deleted".into()));
    assert_eq!(view(&st), ["a"]);
}

#[test]
fn events_before_first_snapshot_replay_in_order() {
    let mut st = ViewState::new();
    assert!(!st.apply_event(LiveEvent::Insert(rec("x"))));
    assert!(!st.apply_event(LiveEvent::Remove(RecordId::new("a"))));
    assert!(!st.apply_event(LiveEvent::Insert(rec("y"))));
    assert_eq!(st.buffered(), 3);
    assert!(st.entries().is_empty());
    assert!(st.begin_load());
    assert_eq!(st.status(), &Status::Loading);
    let replayed = st.finish_load(vec![rec("a"), rec("b")]);
    assert_eq!(replayed, 3);
    assert_eq!(view(&st), ["y", "x", "b"]);
    assert_eq!(st.buffered(), 0);
}

#[test]
fn buffered_events_survive_failed_first_load() {
    let mut st = ViewState::new();
    st.apply_event(LiveEvent::Insert(rec("x")));
    st.begin_load();
    st.fail_load(SyncError::Transport("offline".into()));
    assert!(matches!(st.status(), Status::Failed(_)));
    assert!(st.entries().is_empty());
    assert!(st.begin_load());
    assert_eq!(st.status(), &Status::Loading);
    st.finish_load(vec![rec("a")]);
    assert_eq!(view(&st), ["x", "a"]);
}

#[test]
fn events_during_refresh_outlive_stale_snapshot() {
    let mut st = seeded(&["a", "b"]);
    st.begin_load();
    assert!(st.apply_event(LiveEvent::Insert(rec("c"))));
    assert_eq!(view(&st), ["c", "a", "b"]);
    st.apply_event(LiveEvent::Remove(RecordId::new("a")));
    // Snapshot taken before either event reached the server's listing.
    st.finish_load(vec![rec("a"), rec("b")]);
    assert_eq!(view(&st), ["c", "b"]);
}

#[test]
fn failed_refresh_keeps_last_good_view() {
    let mut st = seeded(&["a", "b"]);
    st.begin_load();
    st.fail_load(SyncError::Decode("bad json".into()));
    assert_eq!(view(&st), ["a", "b"]);
    assert_eq!(st.status(), &Status::Failed("decode: bad json".into()));
    // Still seeded: live events keep applying and the next load is a refresh.
    assert!(st.apply_event(LiveEvent::Insert(rec("c"))));
    assert!(st.begin_load());
    assert_eq!(st.status(), &Status::Refreshing);
    st.finish_load(vec![rec("a"), rec("b")]);
    assert!(st.last_error().is_none());
}

#[test]
fn confirmed_create_keeps_provisional_position() {
    let mut st = seeded(&["a"]);
    let token = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "lamp"));
    assert_eq!(view(&st), ["~lamp", "a"]);
    st.apply_insert(rec("b"));
    assert_eq!(view(&st), ["b", "~lamp", "a"]);
    assert!(st.confirm_create(&token, rec_with_token("r1", &token)));
    assert_eq!(view(&st), ["b", "r1", "a"]);
    assert!(st.pending().is_empty());
}

#[test]
fn create_event_before_response_wins_without_duplicate() {
    let mut st = seeded(&["a"]);
    let token = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "lamp"));
    st.apply_insert(rec("b"));
    assert!(st.apply_insert(rec_with_token("r1", &token)));
    assert_eq!(view(&st), ["b", "r1", "a"]);
    assert!(!st.confirm_create(&token, rec_with_token("r1", &token)));
    assert_eq!(view(&st), ["b", "r1", "a"]);
}

#[test]
fn untagged_event_then_response_drops_provisional() {
    let mut st = seeded(&["a"]);
    let token = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "lamp"));
    st.apply_insert(rec("r1"));
    assert_eq!(view(&st), ["r1", "~lamp", "a"]);
    st.confirm_create(&token, rec_with_token("r1", &token));
    assert_eq!(view(&st), ["r1", "a"]);
}

#[test]
fn late_confirmation_of_removed_record_stays_removed() {
    let mut st = seeded(&["a"]);
    let token = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "lamp"));
    st.apply_insert(rec("r1"));
    st.apply_remove(&RecordId::new("r1"));
    st.confirm_create(&token, rec_with_token("r1", &token));
    assert_eq!(view(&st), ["a"]);
}

#[test]
fn rejected_create_rolls_back() {
    let mut st = seeded(&["a"]);
    let token = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "lamp"));
    st.fail_create(&token, SyncError::Conflict("duplicate title".into()));
    assert_eq!(view(&st), ["a"]);
    assert!(st.pending().is_empty());
    assert!(st.last_error().is_some());
    // Next successful action dismisses the error.
    st.begin_delete(&RecordId::new("a"));
    st.confirm_delete(&RecordId::new("a"));
    assert!(st.last_error().is_none());
}

#[test]
fn refresh_keeps_unreflected_create_and_settles_reflected_one() {
    let mut st = seeded(&["a"]);
    let t1 = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "one"));
    st.begin_create(provisional("t2", "two"));
    assert_eq!(view(&st), ["~two", "~one", "a"]);
    st.begin_load();
    st.finish_load(vec![rec_with_token("r1", &t1), rec("a")]);
    assert_eq!(view(&st), ["~two", "r1", "a"]);
    assert_eq!(st.pending().len(), 1);
}

#[test]
fn create_confirmed_during_refresh_survives_stale_snapshot() {
    let mut st = seeded(&["a"]);
    let token = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "lamp"));
    assert!(st.begin_load());
    assert!(st.confirm_create(&token, rec_with_token("r1", &token)));
    assert_eq!(view(&st), ["r1", "a"]);
    st.finish_load(vec![rec("a")]);
    assert_eq!(view(&st), ["r1", "a"]);
    assert!(st.pending().is_empty());
    assert_unique(&st);
}

#[test]
fn create_confirmed_during_refresh_is_not_doubled_by_fresh_snapshot() {
    let mut st = seeded(&["a"]);
    let token = CorrelationToken::from("t1");
    st.begin_create(provisional("t1", "lamp"));
    st.begin_load();
    st.confirm_create(&token, rec_with_token("r1", &token));
    st.finish_load(vec![rec_with_token("r1", &token), rec("a")]);
    assert_eq!(view(&st), ["r1", "a"]);
}

#[test]
fn delete_confirmed_during_refresh_is_not_resurrected() {
    let mut st = seeded(&["a", "b"]);
    st.begin_delete(&RecordId::new("b"));
    assert!(st.begin_load());
    st.confirm_delete(&RecordId::new("b"));
    st.finish_load(vec![rec("a"), rec("b")]);
    assert_eq!(view(&st), ["a"]);
    assert!(st.pending().is_empty());
}

#[test]
fn create_before_first_snapshot_lands_on_top() {
    let mut st = ViewState::new();
    st.begin_create(provisional("t1", "early"));
    st.begin_load();
    st.finish_load(vec![rec("a")]);
    assert_eq!(view(&st), ["~early", "a"]);
}

#[test]
fn epoch_moves_only_on_change() {
    let mut st = seeded(&["a"]);
    let e = st.epoch();
    st.apply_insert(rec("a"));
    st.apply_remove(&RecordId::new("zz"));
    assert_eq!(st.epoch(), e);
    st.apply_insert(rec("b"));
    assert!(st.epoch() > e);
    assert_eq!(st.freeze().ids(), ["b", "a"]);
}
