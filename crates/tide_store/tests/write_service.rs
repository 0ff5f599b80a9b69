mod common;

use std::sync::Arc;

use common::{harness, key, put, stored, stored_value, ts, FailingSink};
use tide_proto::value_schema::encode_value;
use tide_proto::{
    CheckAndMutateRequest, CheckAndSetRequest, CheckType, IncrRequest, KeyValue, MultiPutRequest,
    MultiRemoveRequest, Mutate, RemoveRequest, Status, Timetag,
};
use tide_store::{MemEngine, StorageEngine, WriteContext, WriteService};

fn ctx(decree: i64) -> WriteContext {
    WriteContext::create(decree, ts(1_000))
}

fn incr(hash_key: &str, sort_key: &str, increment: i64) -> IncrRequest {
    IncrRequest {
        key: key(hash_key, sort_key),
        increment,
        ttl_seconds: 0,
    }
}

fn cas(check_type: CheckType, operand: &str, value: &str) -> CheckAndSetRequest {
    CheckAndSetRequest {
        hash_key: b"h".to_vec(),
        check_sort_key: b"c".to_vec(),
        check_type: check_type.code(),
        check_operand: operand.as_bytes().to_vec(),
        set_diff_sort_key: false,
        set_sort_key: Vec::new(),
        set_value: value.as_bytes().to_vec(),
        set_ttl_seconds: 0,
        return_check_value: true,
    }
}

#[test]
fn put_and_remove_round_trip_through_the_engine() {
    let mut h = harness();
    let resp = h.service.put(&ctx(1), &put("user", "name", "ada")).expect("put");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.decree, 1);
    assert_eq!(
        h.service.get(b"user", b"name").expect("get"),
        Some(b"ada".to_vec())
    );

    let resp = h
        .service
        .remove(
            &ctx(2),
            &RemoveRequest {
                key: key("user", "name"),
            },
        )
        .expect("remove");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(h.service.get(b"user", b"name").expect("get"), None);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 2);
}

#[test]
fn empty_put_only_advances_the_decree() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "s", "v")).expect("put");
    let before: Vec<_> = h
        .engine
        .snapshot()
        .into_iter()
        .filter(|(k, _)| k.as_slice() != [0, 0])
        .collect();

    h.service.empty_put(5).expect("empty put");

    let after: Vec<_> = h
        .engine
        .snapshot()
        .into_iter()
        .filter(|(k, _)| k.as_slice() != [0, 0])
        .collect();
    assert_eq!(before, after);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 5);
    assert_eq!(h.service.last_applied_decree(), 5);
    assert_eq!(h.service.get(b"", b"").expect("get"), None);
}

#[test]
fn multi_put_writes_every_sort_key_under_one_decree() {
    let mut h = harness();
    let req = MultiPutRequest {
        hash_key: b"h".to_vec(),
        kvs: vec![KeyValue::new("a", "1"), KeyValue::new("b", "2")],
        ttl_seconds: 30,
    };
    let resp = h.service.multi_put(&ctx(3), &req).expect("multi_put");
    assert_eq!(resp.status, Status::Ok);
    for (sort_key, value) in [("a", "1"), ("b", "2")] {
        let envelope = stored(&h.engine, "h", sort_key).expect("stored");
        assert_eq!(envelope.user_value, value.as_bytes());
        assert_eq!(envelope.expire_ts, 1_030);
        assert_eq!(envelope.timetag, Timetag::make(ts(1_000), 1, false).unwrap());
    }
}

#[test]
fn invalid_multi_requests_still_consume_their_decree() {
    let mut h = harness();
    let resp = h
        .service
        .multi_put(
            &ctx(7),
            &MultiPutRequest {
                hash_key: b"h".to_vec(),
                kvs: Vec::new(),
                ttl_seconds: 0,
            },
        )
        .expect("multi_put");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 7);

    let resp = h
        .service
        .multi_remove(
            &ctx(8),
            &MultiRemoveRequest {
                hash_key: b"h".to_vec(),
                sort_keys: Vec::new(),
            },
        )
        .expect("multi_remove");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(resp.count, 0);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 8);

    let resp = h
        .service
        .multi_put(
            &ctx(9),
            &MultiPutRequest {
                hash_key: Vec::new(),
                kvs: vec![KeyValue::new("a", "1")],
                ttl_seconds: 0,
            },
        )
        .expect("multi_put");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 9);
}

#[test]
fn multi_remove_reports_the_sort_key_count() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "a", "1")).expect("put");
    h.service.put(&ctx(2), &put("h", "b", "2")).expect("put");
    let resp = h
        .service
        .multi_remove(
            &ctx(3),
            &MultiRemoveRequest {
                hash_key: b"h".to_vec(),
                sort_keys: vec![b"a".to_vec(), b"b".to_vec(), b"missing".to_vec()],
            },
        )
        .expect("multi_remove");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.count, 3);
    assert_eq!(stored(&h.engine, "h", "a"), None);
    assert_eq!(stored(&h.engine, "h", "b"), None);
}

#[test]
fn incr_treats_missing_and_empty_values_as_zero() {
    let mut h = harness();
    let resp = h.service.incr(&ctx(1), &incr("h", "n", 5)).expect("incr");
    assert_eq!((resp.status, resp.new_value), (Status::Ok, 5));
    let resp = h.service.incr(&ctx(2), &incr("h", "n", -7)).expect("incr");
    assert_eq!((resp.status, resp.new_value), (Status::Ok, -2));
    assert_eq!(stored_value(&h.engine, "h", "n").as_deref(), Some("-2"));

    h.service.put(&ctx(3), &put("h", "e", "")).expect("put");
    let resp = h.service.incr(&ctx(4), &incr("h", "e", 3)).expect("incr");
    assert_eq!((resp.status, resp.new_value), (Status::Ok, 3));
}

#[test]
fn incr_treats_non_numeric_values_as_zero() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "n", "abc")).expect("put");
    let resp = h.service.incr(&ctx(2), &incr("h", "n", 5)).expect("incr");
    assert_eq!((resp.status, resp.new_value), (Status::Ok, 5));
    assert_eq!(stored_value(&h.engine, "h", "n").as_deref(), Some("5"));
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 2);
}

#[test]
fn unrepresentable_timestamps_are_rejected_but_consume_the_decree() {
    let mut h = harness();
    let far_future = WriteContext::create(3, u64::MAX);

    let resp = h.service.put(&far_future, &put("h", "s", "v")).expect("put");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(stored(&h.engine, "h", "s"), None);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 3);

    let far_future = WriteContext::create(4, u64::MAX);
    let resp = h.service.incr(&far_future, &incr("h", "n", 1)).expect("incr");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(stored(&h.engine, "h", "n"), None);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 4);

    let far_future = WriteContext::create(5, u64::MAX);
    let resp = h
        .service
        .check_and_set(&far_future, &cas(CheckType::NoCheck, "", "v"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(stored(&h.engine, "h", "c"), None);
    assert_eq!(h.service.last_applied_decree(), 5);
}

#[test]
fn incr_overflow_leaves_the_value_unchanged() {
    let mut h = harness();
    let near_max = (i64::MAX - 1).to_string();
    h.service.put(&ctx(1), &put("h", "n", &near_max)).expect("put");

    let resp = h.service.incr(&ctx(2), &incr("h", "n", 1)).expect("incr");
    assert_eq!((resp.status, resp.new_value), (Status::Ok, i64::MAX));

    let resp = h.service.incr(&ctx(3), &incr("h", "n", 1)).expect("incr");
    assert_eq!(resp.status, Status::Overflow);
    assert_eq!(resp.new_value, i64::MAX);
    assert_eq!(
        stored_value(&h.engine, "h", "n"),
        Some(i64::MAX.to_string())
    );

    h.service
        .put(&ctx(4), &put("h", "m", &i64::MIN.to_string()))
        .expect("put");
    let resp = h.service.incr(&ctx(5), &incr("h", "m", -1)).expect("incr");
    assert_eq!(resp.status, Status::Overflow);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 5);
}

#[test]
fn incr_ttl_resets_clears_or_keeps_the_expiry() {
    let mut h = harness();
    let mut req = put("h", "n", "1");
    req.ttl_seconds = 100;
    h.service.put(&ctx(1), &req).expect("put");
    assert_eq!(stored(&h.engine, "h", "n").unwrap().expire_ts, 1_100);

    let keep = WriteContext::create(2, ts(1_010));
    h.service.incr(&keep, &incr("h", "n", 1)).expect("incr");
    assert_eq!(stored(&h.engine, "h", "n").unwrap().expire_ts, 1_100);

    let reset = WriteContext::create(3, ts(1_020));
    let mut req = incr("h", "n", 1);
    req.ttl_seconds = 50;
    h.service.incr(&reset, &req).expect("incr");
    assert_eq!(stored(&h.engine, "h", "n").unwrap().expire_ts, 1_070);

    let mut req = incr("h", "n", 1);
    req.ttl_seconds = -1;
    let resp = h.service.incr(&ctx(4), &req).expect("incr");
    assert_eq!(resp.new_value, 4);
    assert_eq!(stored(&h.engine, "h", "n").unwrap().expire_ts, 0);
}

#[test]
fn expired_records_read_as_absent() {
    let mut h = harness();
    let stale = encode_value(10, Timetag::make(1, 1, false).unwrap(), b"41");
    h.engine.insert_raw(key("h", "n"), stale.clone());
    h.engine.insert_raw(key("h", "c"), stale);

    let resp = h.service.incr(&ctx(1), &incr("h", "n", 1)).expect("incr");
    assert_eq!(resp.new_value, 1);

    let resp = h
        .service
        .check_and_set(&ctx(2), &cas(CheckType::ValueNotExist, "", "fresh"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::Ok);
    assert!(resp.check_value_returned);
    assert!(!resp.check_value_exist);
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("fresh"));
}

#[test]
fn check_and_set_applies_only_when_the_check_passes() {
    let mut h = harness();
    let resp = h
        .service
        .check_and_set(&ctx(1), &cas(CheckType::ValueNotExist, "", "first"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("first"));

    let resp = h
        .service
        .check_and_set(&ctx(2), &cas(CheckType::ValueNotExist, "", "second"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::TryAgain);
    assert!(resp.check_value_exist);
    assert_eq!(resp.check_value, b"first");
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("first"));
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 2);

    let resp = h
        .service
        .check_and_set(&ctx(3), &cas(CheckType::ValueMatchPrefix, "fi", "third"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("third"));
}

#[test]
fn check_and_set_swaps_only_the_expected_value() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "c", "1")).expect("put");

    let resp = h
        .service
        .check_and_set(&ctx(2), &cas(CheckType::ValueBytesEqual, "1", "2"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("2"));

    let resp = h
        .service
        .check_and_set(&ctx(3), &cas(CheckType::ValueBytesEqual, "1", "2"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::TryAgain);
    assert_eq!(resp.check_value, b"2");
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("2"));
}

#[test]
fn check_and_set_can_target_a_different_sort_key() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "c", "10")).expect("put");
    let mut req = cas(CheckType::ValueIntGreater, "9", "set");
    req.set_diff_sort_key = true;
    req.set_sort_key = b"other".to_vec();
    req.return_check_value = false;
    let resp = h.service.check_and_set(&ctx(2), &req).expect("check_and_set");
    assert_eq!(resp.status, Status::Ok);
    assert!(!resp.check_value_returned);
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("10"));
    assert_eq!(stored_value(&h.engine, "h", "other").as_deref(), Some("set"));
}

#[test]
fn check_and_set_validates_check_types_and_integers() {
    let mut h = harness();
    let mut req = cas(CheckType::NoCheck, "", "v");
    req.check_type = 99;
    let resp = h.service.check_and_set(&ctx(1), &req).expect("check_and_set");
    assert_eq!(resp.status, Status::InvalidArgument);

    let resp = h
        .service
        .check_and_set(&ctx(2), &cas(CheckType::ValueIntLess, "ten", "v"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::InvalidArgument);

    h.service.put(&ctx(3), &put("h", "c", "abc")).expect("put");
    let resp = h
        .service
        .check_and_set(&ctx(4), &cas(CheckType::ValueIntLess, "10", "v"))
        .expect("check_and_set");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("abc"));

    let resp = h
        .service
        .check_and_set(&ctx(5), &cas(CheckType::ValueIntEqual, "10", "v"))
        .map(|resp| resp.status);
    assert_eq!(resp.expect("check_and_set"), Status::InvalidArgument);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 5);
}

#[test]
fn check_and_mutate_applies_every_clause_atomically() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "c", "ready")).expect("put");
    h.service.put(&ctx(2), &put("h", "old", "x")).expect("put");

    let req = CheckAndMutateRequest {
        hash_key: b"h".to_vec(),
        check_sort_key: b"c".to_vec(),
        check_type: CheckType::ValueBytesEqual.code(),
        check_operand: b"ready".to_vec(),
        mutate_list: vec![
            Mutate::put("new", "y"),
            Mutate::delete("old"),
            Mutate::put("c", "done"),
        ],
        return_check_value: true,
    };
    let resp = h.service.check_and_mutate(&ctx(3), &req).expect("check_and_mutate");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.check_value, b"ready");
    assert_eq!(stored_value(&h.engine, "h", "new").as_deref(), Some("y"));
    assert_eq!(stored(&h.engine, "h", "old"), None);
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("done"));

    let resp = h.service.check_and_mutate(&ctx(4), &req).expect("check_and_mutate");
    assert_eq!(resp.status, Status::TryAgain);
    assert_eq!(stored_value(&h.engine, "h", "new").as_deref(), Some("y"));
    assert_eq!(stored_value(&h.engine, "h", "c").as_deref(), Some("done"));
}

#[test]
fn check_and_mutate_requires_mutations() {
    let mut h = harness();
    let req = CheckAndMutateRequest {
        hash_key: b"h".to_vec(),
        check_sort_key: b"c".to_vec(),
        check_type: CheckType::NoCheck.code(),
        ..CheckAndMutateRequest::default()
    };
    let resp = h.service.check_and_mutate(&ctx(6), &req).expect("check_and_mutate");
    assert_eq!(resp.status, Status::InvalidArgument);
    assert_eq!(h.engine.last_committed_decree().expect("decree"), 6);
}

#[test]
fn capacity_units_follow_the_write_outcome() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "s", "v")).expect("put");
    h.service
        .check_and_set(&ctx(2), &cas(CheckType::ValueExist, "", "v"))
        .expect("check_and_set");
    let snap = h.counters.snapshot();
    assert_eq!(snap.write_units, 1);
    assert_eq!(snap.read_units, 1);
}

#[test]
fn capacity_sink_failures_do_not_change_results() {
    let engine = Arc::new(MemEngine::new());
    let mut service = WriteService::new(
        engine.clone(),
        common::config_for("a"),
        Arc::new(FailingSink),
    )
    .expect("open write service");

    let resp = service.put(&ctx(1), &put("h", "s", "v")).expect("put");
    assert_eq!(resp.status, Status::Ok);
    let resp = service.incr(&ctx(2), &incr("h", "n", 2)).expect("incr");
    assert_eq!((resp.status, resp.new_value), (Status::Ok, 2));
    assert_eq!(stored_value(&engine, "h", "s").as_deref(), Some("v"));
}

#[test]
fn default_ttl_changes_apply_to_later_writes() {
    let mut h = harness();
    h.service.put(&ctx(1), &put("h", "a", "1")).expect("put");
    h.service.set_default_ttl(300);
    h.service.put(&ctx(2), &put("h", "b", "1")).expect("put");
    let mut explicit = put("h", "c", "1");
    explicit.ttl_seconds = 5;
    h.service.put(&ctx(3), &explicit).expect("put");

    assert_eq!(stored(&h.engine, "h", "a").unwrap().expire_ts, 0);
    assert_eq!(stored(&h.engine, "h", "b").unwrap().expire_ts, 1_300);
    assert_eq!(stored(&h.engine, "h", "c").unwrap().expire_ts, 1_005);
}
