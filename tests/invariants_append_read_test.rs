mod common;

use serde_json::json;
use spiteflow::reader;
use spiteflow::{AggregateId, Error, EventId, EventTypes, NewEvent, Version};

#[test]
fn versions_follow_expected_version_scenario() {
    let (_dir, path) = common::create_temp_db_file("versions.db");
    let store = common::open_store(&path);
    let order = AggregateId::new("order-1");

    let first = store
        .append(
            (1..=3)
                .map(|n| NewEvent::new("order-1", "line_added", json!({ "line": n })))
                .collect(),
            None,
        )
        .unwrap();
    let versions: Vec<u64> = store
        .read_for_aggregate(&order)
        .unwrap()
        .iter()
        .map(|e| e.version.as_raw())
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(first.event_ids, vec![EventId::from_raw(1), EventId::from_raw(2), EventId::from_raw(3)]);

    let second = store
        .append(
            vec![
                NewEvent::new("order-1", "line_added", json!({ "line": 4 })),
                NewEvent::new("order-1", "order_closed", json!({})),
            ],
            Some(Version::from_raw(3)),
        )
        .unwrap();
    assert_eq!(second.first_version, Version::from_raw(4));
    assert_eq!(second.last_version, Version::from_raw(5));

    let err = store
        .append(
            vec![NewEvent::new("order-1", "line_added", json!({ "line": 6 }))],
            Some(Version::from_raw(3)),
        )
        .unwrap_err();
    match err {
        Error::Concurrency { expected, actual, .. } => {
            assert_eq!(expected, Version::from_raw(3));
            assert_eq!(actual, Version::from_raw(5));
        }
        other => panic!("expected Concurrency, got {other:?}"),
    }

    assert_eq!(store.current_version(&order).unwrap(), Version::from_raw(5));
    assert_eq!(store.read_for_aggregate(&order).unwrap().len(), 5);
}

#[test]
fn versions_are_per_aggregate() {
    let (_dir, path) = common::create_temp_db_file("per_aggregate.db");
    let store = common::open_store(&path);

    common::append_n(&store, "a", "x", 2);
    common::append_n(&store, "b", "x", 1);
    common::append_n(&store, "a", "x", 1);

    let a: Vec<(u64, u64)> = store
        .read_for_aggregate(&AggregateId::new("a"))
        .unwrap()
        .iter()
        .map(|e| (e.id.as_raw(), e.version.as_raw()))
        .collect();
    assert_eq!(a, vec![(1, 1), (2, 2), (4, 3)]);
    assert_eq!(store.current_version(&AggregateId::new("b")).unwrap(), Version::FIRST);
    assert_eq!(store.current_version(&AggregateId::new("nobody")).unwrap(), Version::NONE);
}

#[test]
fn read_from_pages_cover_log_exactly_once() {
    let (_dir, path) = common::create_temp_db_file("paging.db");
    let store = common::open_store(&path);
    for aggregate in ["a", "b", "c", "d", "e"] {
        common::append_n(&store, aggregate, "tick", 1);
    }

    let all = EventTypes::all();
    let page1 = store.read_from(EventId::FIRST, &all, 2).unwrap();
    let page2 = store.read_from(EventId::from_raw(3), &all, 2).unwrap();
    let ids: Vec<u64> = page1.iter().chain(&page2).map(|e| e.id.as_raw()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    // Walk the whole log by cursor with an awkward page size.
    let latest = store.latest_id(&all).unwrap();
    let mut cursor = EventId::ZERO;
    let mut seen = Vec::new();
    loop {
        let page = store.read_from(cursor.next(), &all, 3).unwrap();
        let Some(last) = page.last() else { break };
        cursor = last.id;
        seen.extend(page.iter().map(|e| e.id.as_raw()));
    }
    assert_eq!(seen, (1..=latest.as_raw()).collect::<Vec<_>>());
}

#[test]
fn type_filters_apply_to_reads_and_latest_id() {
    let (_dir, path) = common::create_temp_db_file("filters.db");
    let store = common::open_store(&path);
    common::append_n(&store, "a", "opened", 1);
    common::append_n(&store, "a", "closed", 1);
    common::append_n(&store, "b", "opened", 1);
    common::append_n(&store, "b", "renamed", 1);

    let opened = EventTypes::only(["opened"]);
    let ids: Vec<u64> = store
        .read_from(EventId::FIRST, &opened, 10)
        .unwrap()
        .iter()
        .map(|e| e.id.as_raw())
        .collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(store.latest_id(&opened).unwrap(), EventId::from_raw(3));
    assert_eq!(store.latest_id(&EventTypes::only(["missing"])).unwrap(), EventId::ZERO);
    assert_eq!(store.latest_id(&EventTypes::all()).unwrap(), EventId::from_raw(4));
}

#[test]
fn scan_range_visits_inclusive_range_in_order() {
    let (_dir, path) = common::create_temp_db_file("scan.db");
    let store = common::open_store(&path);
    common::append_n(&store, "a", "tick", 10);

    let mut seen = Vec::new();
    let visited = store
        .scan_range(EventId::from_raw(3), EventId::from_raw(8), &EventTypes::all(), 4, |e| {
            seen.push(e.id.as_raw());
            Ok(())
        })
        .unwrap();
    assert_eq!(visited, 6);
    assert_eq!(seen, vec![3, 4, 5, 6, 7, 8]);
}

#[test]
fn stored_events_keep_metadata_and_are_readable_by_other_connections() {
    let (_dir, path) = common::create_temp_db_file("metadata.db");
    let store = common::open_store(&path);
    let correlation = uuid::Uuid::new_v4();
    let event = NewEvent::new("user-1", "registered", json!({ "email": "a@example.com" }))
        .with_correlation_id(correlation);
    let uuid = event.uuid;
    store.append(vec![event], Some(Version::NONE)).unwrap();

    let conn = common::open_read_only(&path);
    let events = reader::read_from(&conn, store.tables(), EventId::FIRST, &EventTypes::all(), 10).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].uuid, uuid);
    assert_eq!(events[0].correlation_id, Some(correlation));
    assert_eq!(events[0].causation_id, None);
    assert_eq!(events[0].body["email"], "a@example.com");
    assert!(events[0].created_at_ms > 0);
}

#[test]
fn data_survives_reopen() {
    let (_dir, path) = common::create_temp_db_file("reopen.db");
    {
        let store = common::open_store(&path);
        common::append_n(&store, "a", "tick", 3);
    }
    let store = common::open_store(&path);
    assert_eq!(store.latest_id(&EventTypes::all()).unwrap(), EventId::from_raw(3));
    let next = store
        .append(vec![NewEvent::new("a", "tick", json!({}))], Some(Version::from_raw(3)))
        .unwrap();
    assert_eq!(next.last_id(), EventId::from_raw(4));
}
