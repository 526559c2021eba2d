mod common;

use common::{id_of, ids, last_modified, object, storages, PARENT, RESOURCE};
use objstore_core::{
    CoreError, Filter, FilterOp, ListOptions, Sort, SqliteStorage, StorageBackend,
    Uuid4Generator,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

fn no_unique() -> Vec<String> {
    Vec::new()
}

#[test]
fn create_assigns_id_and_timestamp_and_get_returns_it() {
    for (name, storage) in storages() {
        let created = storage
            .create(
                RESOURCE,
                PARENT,
                object(json!({"title": "hello"})),
                &Uuid4Generator::default(),
                &no_unique(),
            )
            .unwrap();

        assert!(!id_of(&created).is_empty(), "{name}");
        assert!(last_modified(&created) > 0, "{name}");
        let fetched = storage.get(RESOURCE, PARENT, id_of(&created)).unwrap();
        assert_eq!(fetched, created, "{name}");
    }
}

#[test]
fn timestamps_strictly_increase_across_writes() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        let first = storage
            .create(RESOURCE, PARENT, object(json!({"n": 1})), &generator, &no_unique())
            .unwrap();
        let second = storage
            .create(RESOURCE, PARENT, object(json!({"n": 2})), &generator, &no_unique())
            .unwrap();
        let updated = storage
            .update(RESOURCE, PARENT, id_of(&first), object(json!({"n": 3})), &no_unique())
            .unwrap();
        let deleted = storage
            .delete(RESOURCE, PARENT, id_of(&second), None)
            .unwrap();

        let stamps = [
            last_modified(&first),
            last_modified(&second),
            last_modified(&updated),
            last_modified(&deleted),
        ];
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]), "{name}: {stamps:?}");
        assert_eq!(
            storage.resource_timestamp(RESOURCE, PARENT).unwrap(),
            last_modified(&deleted),
            "{name}"
        );
    }
}

#[test]
fn empty_scope_timestamp_is_initialized_once() {
    for (name, storage) in storages() {
        let first = storage.resource_timestamp(RESOURCE, "/empty").unwrap();
        let second = storage.resource_timestamp(RESOURCE, "/empty").unwrap();
        assert!(first > 0, "{name}");
        assert_eq!(first, second, "{name}");
    }
}

#[test]
fn duplicate_id_is_a_unicity_error_but_tombstone_is_resurrected() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        storage
            .create(RESOURCE, PARENT, object(json!({"id": "a", "v": 1})), &generator, &no_unique())
            .unwrap();

        let err = storage
            .create(RESOURCE, PARENT, object(json!({"id": "a", "v": 2})), &generator, &no_unique())
            .unwrap_err();
        match err {
            CoreError::Unicity {
                field, existing, ..
            } => {
                assert_eq!(field, "id", "{name}");
                assert_eq!(existing.get("v"), Some(&json!(1)), "{name}");
            }
            other => panic!("{name}: unexpected error: {other}"),
        }

        storage.delete(RESOURCE, PARENT, "a", None).unwrap();
        let again = storage
            .create(RESOURCE, PARENT, object(json!({"id": "a", "v": 3})), &generator, &no_unique())
            .unwrap();
        assert_eq!(again.get("v"), Some(&json!(3)), "{name}");
        assert!(again.get("deleted").is_none(), "{name}");
    }
}

#[test]
fn unique_fields_reject_collisions_among_live_objects() {
    let unique = vec!["email".to_string()];
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        let alice = storage
            .create(RESOURCE, PARENT, object(json!({"email": "a@x"})), &generator, &unique)
            .unwrap();
        let bob = storage
            .create(RESOURCE, PARENT, object(json!({"email": "b@x"})), &generator, &unique)
            .unwrap();

        let err = storage
            .update(RESOURCE, PARENT, id_of(&bob), object(json!({"email": "a@x"})), &unique)
            .unwrap_err();
        assert!(matches!(err, CoreError::Unicity { .. }), "{name}");

        storage
            .update(RESOURCE, PARENT, id_of(&alice), object(json!({"email": "a@x", "x": 1})), &unique)
            .unwrap();

        storage.delete(RESOURCE, PARENT, id_of(&alice), None).unwrap();
        storage
            .create(RESOURCE, PARENT, object(json!({"email": "a@x"})), &generator, &unique)
            .unwrap();
    }
}

#[test]
fn delete_leaves_a_newer_tombstone_visible_with_include_deleted() {
    for (name, storage) in storages() {
        let created = storage
            .create(RESOURCE, PARENT, object(json!({"title": "x"})), &Uuid4Generator::default(), &no_unique())
            .unwrap();
        let id = id_of(&created).to_string();
        storage.delete(RESOURCE, PARENT, &id, None).unwrap();

        assert!(matches!(
            storage.get(RESOURCE, PARENT, &id),
            Err(CoreError::ObjectNotFound { .. })
        ));
        assert!(matches!(
            storage.delete(RESOURCE, PARENT, &id, None),
            Err(CoreError::ObjectNotFound { .. })
        ));

        let live = storage
            .list_all(RESOURCE, PARENT, &ListOptions::default())
            .unwrap();
        assert!(live.objects.is_empty(), "{name}");

        let with_deleted = storage
            .list_all(
                RESOURCE,
                PARENT,
                &ListOptions {
                    include_deleted: true,
                    ..ListOptions::default()
                },
            )
            .unwrap();
        assert_eq!(with_deleted.objects.len(), 1, "{name}");
        let tombstone = &with_deleted.objects[0];
        assert_eq!(tombstone.get("deleted"), Some(&Value::Bool(true)), "{name}");
        assert_eq!(id_of(tombstone), id);
        assert!(last_modified(tombstone) > last_modified(&created), "{name}");
        assert!(tombstone.get("title").is_none(), "{name}");
    }
}

#[test]
fn list_applies_filters_sorting_limit_and_counts_before_limit() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        for (title, rank, color) in [("a", 3, "red"), ("b", 1, "red"), ("c", 2, "blue"), ("d", 5, "red")] {
            storage
                .create(
                    RESOURCE,
                    PARENT,
                    object(json!({"title": title, "meta": {"rank": rank}, "color": color})),
                    &generator,
                    &no_unique(),
                )
                .unwrap();
        }

        let page = storage
            .list_all(
                RESOURCE,
                PARENT,
                &ListOptions {
                    filters: vec![Filter::new("color", FilterOp::Eq, "red")],
                    sorting: vec![Sort::desc("meta.rank")],
                    limit: Some(2),
                    ..ListOptions::default()
                },
            )
            .unwrap();
        let titles: Vec<&str> = page
            .objects
            .iter()
            .filter_map(|o| o.get("title").and_then(Value::as_str))
            .collect();
        assert_eq!(titles, vec!["d", "a"], "{name}");
        assert_eq!(page.count, 3, "{name}");
    }
}

#[test]
fn last_modified_range_filters_are_exact() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        let created: Vec<_> = (0..4)
            .map(|n| {
                storage
                    .create(RESOURCE, PARENT, object(json!({"n": n})), &generator, &no_unique())
                    .unwrap()
            })
            .collect();
        let pivot = last_modified(&created[1]);

        let newer = storage
            .list_all(
                RESOURCE,
                PARENT,
                &ListOptions {
                    filters: vec![Filter::new("last_modified", FilterOp::Gt, pivot)],
                    ..ListOptions::default()
                },
            )
            .unwrap();
        assert_eq!(ids(&newer.objects), ids(&created[2..]), "{name}");

        let up_to = storage
            .list_all(
                RESOURCE,
                PARENT,
                &ListOptions {
                    filters: vec![Filter::new("last_modified", FilterOp::Le, pivot)],
                    ..ListOptions::default()
                },
            )
            .unwrap();
        assert_eq!(ids(&up_to.objects), ids(&created[..2]), "{name}");
    }
}

#[test]
fn parent_wildcard_lists_every_matching_scope() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        for parent in ["/buckets/a", "/buckets/b", "/groups/a"] {
            storage
                .create(RESOURCE, parent, object(json!({"parent": parent})), &generator, &no_unique())
                .unwrap();
        }

        let buckets = storage
            .list_all(RESOURCE, "/buckets/*", &ListOptions::default())
            .unwrap();
        assert_eq!(buckets.count, 2, "{name}");

        let everything = storage
            .list_all(RESOURCE, "*", &ListOptions::default())
            .unwrap();
        assert_eq!(everything.count, 3, "{name}");
    }
}

#[test]
fn delete_all_tombstones_matches_and_is_idempotent() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        for color in ["red", "red", "blue"] {
            storage
                .create(RESOURCE, PARENT, object(json!({"color": color})), &generator, &no_unique())
                .unwrap();
        }
        let options = ListOptions {
            filters: vec![Filter::new("color", FilterOp::Eq, "red")],
            ..ListOptions::default()
        };

        let deleted = storage.delete_all(RESOURCE, PARENT, &options).unwrap();
        assert_eq!(deleted.len(), 2, "{name}");
        assert!(deleted.iter().all(|o| o.get("deleted") == Some(&Value::Bool(true))));

        let again = storage.delete_all(RESOURCE, PARENT, &options).unwrap();
        assert!(again.is_empty(), "{name}");

        let remaining = storage
            .list_all(RESOURCE, PARENT, &ListOptions::default())
            .unwrap();
        assert_eq!(remaining.count, 1, "{name}");
    }
}

#[test]
fn purge_keeps_the_most_recent_tombstones_per_scope() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        for parent in ["/p1", "/p2"] {
            for n in 0..8 {
                storage
                    .create(RESOURCE, parent, object(json!({"n": n})), &generator, &no_unique())
                    .unwrap();
            }
            storage
                .delete_all(RESOURCE, parent, &ListOptions::default())
                .unwrap();
        }
        let all_deleted = ListOptions {
            include_deleted: true,
            ..ListOptions::default()
        };
        let before = storage.list_all(RESOURCE, "/p1", &all_deleted).unwrap();
        let mut expected: Vec<i64> = before.objects.iter().map(last_modified).collect();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        expected.truncate(5);

        let removed = storage.purge_deleted(RESOURCE, "*", Some(5), None).unwrap();
        assert_eq!(removed, 6, "{name}");

        let after = storage.list_all(RESOURCE, "/p1", &all_deleted).unwrap();
        let mut kept: Vec<i64> = after.objects.iter().map(last_modified).collect();
        kept.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(kept, expected, "{name}");

        assert_eq!(storage.purge_deleted(RESOURCE, "*", Some(5), None).unwrap(), 0);
        assert_eq!(storage.purge_deleted(RESOURCE, "/p2", None, None).unwrap(), 5);
    }
}

#[test]
fn purge_before_only_removes_older_tombstones() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        let mut stamps = Vec::new();
        for n in 0..3 {
            let created = storage
                .create(RESOURCE, PARENT, object(json!({"n": n})), &generator, &no_unique())
                .unwrap();
            let tombstone = storage.delete(RESOURCE, PARENT, id_of(&created), None).unwrap();
            stamps.push(last_modified(&tombstone));
        }

        let removed = storage
            .purge_deleted(RESOURCE, PARENT, None, Some(stamps[2]))
            .unwrap();
        assert_eq!(removed, 2, "{name}");
    }
}

#[test]
fn explicit_timestamps_are_kept_only_when_monotonic() {
    for (name, storage) in storages() {
        let current = storage.resource_timestamp(RESOURCE, PARENT).unwrap();
        let future = current + 10_000;
        let imported = storage
            .update(RESOURCE, PARENT, "imported", object(json!({"last_modified": future})), &no_unique())
            .unwrap();
        assert_eq!(last_modified(&imported), future, "{name}");

        let stale = storage
            .update(RESOURCE, PARENT, "stale", object(json!({"last_modified": 1})), &no_unique())
            .unwrap();
        assert_eq!(last_modified(&stale), future + 1, "{name}");
    }
}

#[test]
fn flush_removes_everything() {
    for (name, storage) in storages() {
        storage
            .create(RESOURCE, PARENT, object(json!({})), &Uuid4Generator::default(), &no_unique())
            .unwrap();
        storage.flush().unwrap();
        let page = storage
            .list_all(RESOURCE, "*", &ListOptions { include_deleted: true, ..ListOptions::default() })
            .unwrap();
        assert_eq!(page.count, 0, "{name}");
    }
}

#[test]
fn concurrent_creates_get_distinct_timestamps() {
    for (name, storage) in storages() {
        let generator = Uuid4Generator::default();
        let stamps: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let storage = Arc::clone(&storage);
                    let generator = &generator;
                    scope.spawn(move || {
                        (0..25)
                            .map(|_| {
                                let created = storage
                                    .create(RESOURCE, PARENT, object(json!({})), generator, &[])
                                    .unwrap();
                                last_modified(&created)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let distinct: HashSet<i64> = stamps.iter().copied().collect();
        assert_eq!(distinct.len(), 200, "{name}");
        for per_thread in stamps.chunks(25) {
            assert!(per_thread.windows(2).all(|pair| pair[0] < pair[1]), "{name}");
        }
    }
}

#[test]
fn two_sqlite_handles_on_one_file_share_the_scope_counter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objstore.db");
    let first = SqliteStorage::open(&path).unwrap();
    first.initialize_schema(false).unwrap();
    let second = SqliteStorage::open(&path).unwrap();
    second.initialize_schema(false).unwrap();

    let generator = Uuid4Generator::default();
    let stamps: Vec<i64> = std::thread::scope(|scope| {
        let handles: Vec<_> = [&first, &second]
            .into_iter()
            .map(|storage| {
                let generator = &generator;
                scope.spawn(move || {
                    (0..20)
                        .map(|_| {
                            let created = storage
                                .create(RESOURCE, PARENT, object(json!({})), generator, &[])
                                .unwrap();
                            last_modified(&created)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let distinct: HashSet<i64> = stamps.iter().copied().collect();
    assert_eq!(distinct.len(), 40);
    assert_eq!(
        first.list_all(RESOURCE, PARENT, &ListOptions::default()).unwrap().count,
        40
    );
}
