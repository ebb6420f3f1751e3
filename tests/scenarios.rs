use opossum_core::{
    AppendCondition, Event, EventStore, Projection, ProjectionManager, ProjectionManagerConfig,
    Query, QueryItem, ReadOptions, SequencedEvent, StoreConfig, Tag,
};
use std::collections::HashSet;
use std::sync::Arc;

fn course_created(capacity: i64) -> Event {
    Event::new(
        "CourseCreated",
        serde_json::json!({"courseId": "C1", "capacity": capacity}),
        vec![Tag::new("courseId", "C1")],
    )
}

fn student_enrolled(student_id: &str) -> Event {
    Event::new(
        "StudentEnrolled",
        serde_json::json!({"courseId": "C1", "studentId": student_id}),
        vec![Tag::new("courseId", "C1")],
    )
}

fn student_registered(email: &str) -> Event {
    Event::new(
        "StudentRegistered",
        serde_json::json!({"email": email}),
        vec![Tag::new("email", email)],
    )
}

fn course_enrollment_query() -> Query {
    Query::from_items(vec![QueryItem::new()
        .with_event_types(["CourseCreated", "StudentEnrolled"])
        .with_tags([("courseId", "C1")])])
}

/// (S1) Enroll within capacity.
#[tokio::test]
async fn s1_enroll_within_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(dir.path(), "CourseManagement", StoreConfig::default())
        .await
        .unwrap();

    store.append(vec![course_created(2)], None).await.unwrap();

    let condition = AppendCondition::new(course_enrollment_query(), Some(1));
    let appended = store
        .append(vec![student_enrolled("S1")], Some(condition))
        .await
        .unwrap();
    assert_eq!(appended[0].position, 2);

    let events = store.read(&course_enrollment_query(), None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].position, 1);
    assert_eq!(events[0].event_type(), "CourseCreated");
    assert_eq!(events[1].position, 2);
    assert_eq!(events[1].event_type(), "StudentEnrolled");
}

/// (S2) Concurrent enrollment race: exactly one of two racing
/// DCB-guarded appends succeeds.
#[tokio::test]
async fn s2_concurrent_enrollment_race() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        EventStore::open(dir.path(), "CourseManagement", StoreConfig::default())
            .await
            .unwrap(),
    );
    store.append(vec![course_created(2)], None).await.unwrap();
    store
        .append(
            vec![student_enrolled("S1")],
            Some(AppendCondition::new(course_enrollment_query(), Some(1))),
        )
        .await
        .unwrap();

    let handlers = ["S2", "S3"].map(|student| {
        let store = store.clone();
        let student = student.to_string();
        tokio::spawn(async move {
            store
                .append(
                    vec![student_enrolled(&student)],
                    Some(AppendCondition::new(course_enrollment_query(), Some(2))),
                )
                .await
        })
    });

    let results: Vec<_> = futures_join_all(handlers).await;
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one concurrent append must succeed");
    assert!(dir.path().join("CourseManagement/events/0000000003.json").exists());
    assert!(!dir.path().join("CourseManagement/events/0000000004.json").exists());
}

/// (S3) Uniqueness via DCB: two concurrent registrations for the same
/// email race; exactly one succeeds.
#[tokio::test]
async fn s3_uniqueness_via_dcb() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        EventStore::open(dir.path(), "CourseManagement", StoreConfig::default())
            .await
            .unwrap(),
    );

    let registration_query = Query::from_items(vec![QueryItem::new()
        .with_event_types(["StudentRegistered"])
        .with_tags([("email", "a@b.c")])]);

    let handlers = [0, 1].map(|_| {
        let store = store.clone();
        let query = registration_query.clone();
        tokio::spawn(async move {
            store
                .append(
                    vec![student_registered("a@b.c")],
                    Some(AppendCondition::new(query, None)),
                )
                .await
        })
    });

    let results: Vec<_> = futures_join_all(handlers).await;
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
}

/// (S6) Descending read.
#[tokio::test]
async fn s6_descending_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(dir.path(), "CourseManagement", StoreConfig::default())
        .await
        .unwrap();
    store
        .append(
            vec![course_created(10), student_enrolled("S1"), student_enrolled("S2")],
            None,
        )
        .await
        .unwrap();

    let descending = store
        .read(
            &Query::all(),
            Some(ReadOptions { descending: true, after_position: None }),
        )
        .await
        .unwrap();
    let positions: Vec<i64> = descending.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![3, 2, 1]);
}

struct CourseShortInfo;

impl Projection for CourseShortInfo {
    fn name(&self) -> &str {
        "CourseShortInfo"
    }

    fn event_types(&self) -> HashSet<String> {
        ["CourseCreated", "StudentEnrolled"].iter().map(|s| s.to_string()).collect()
    }

    fn key_for(&self, event: &SequencedEvent) -> Option<String> {
        event.event.payload.get("courseId")?.as_str().map(|s| s.to_string())
    }

    fn apply(&self, state: Option<serde_json::Value>, event: &SequencedEvent) -> Option<serde_json::Value> {
        match event.event_type() {
            "CourseCreated" => Some(serde_json::json!({
                "courseId": event.event.payload["courseId"],
                "maxStudentCount": event.event.payload["capacity"],
                "currentEnrollmentCount": 0,
            })),
            "StudentEnrolled" => {
                let mut state = state?;
                let count = state["currentEnrollmentCount"].as_i64().unwrap_or(0);
                state["currentEnrollmentCount"] = serde_json::json!(count + 1);
                Some(state)
            }
            _ => state,
        }
    }

    fn tags_for(&self, state: &serde_json::Value) -> Vec<Tag> {
        vec![Tag::new("status", if state["currentEnrollmentCount"] == state["maxStudentCount"] {
            "full"
        } else {
            "active"
        })]
    }
}

/// (S4) Projection catch-up via a single incremental update cycle.
#[tokio::test]
async fn s4_projection_catch_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        EventStore::open(dir.path(), "CourseManagement", StoreConfig::default())
            .await
            .unwrap(),
    );
    store
        .append(
            vec![
                course_created(10),
                student_enrolled("S1"),
                student_enrolled("S2"),
                student_enrolled("S3"),
            ],
            None,
        )
        .await
        .unwrap();

    let context_dir = dir.path().join("CourseManagement");
    let mut manager = ProjectionManager::new(
        store,
        context_dir,
        ProjectionManagerConfig { enable_auto_rebuild: false, ..Default::default() },
    );
    manager.register(Arc::new(CourseShortInfo)).await.unwrap();
    manager.update("CourseShortInfo").await.unwrap();

    let checkpoint = manager.get_checkpoint("CourseShortInfo").await.unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_position, 4);
}

/// Event whose `apply` returns `null`, simulating (S5) deletion.
struct DeletableProjection;

impl Projection for DeletableProjection {
    fn name(&self) -> &str {
        "Deletable"
    }

    fn event_types(&self) -> HashSet<String> {
        ["Activated", "Deactivated"].iter().map(|s| s.to_string()).collect()
    }

    fn key_for(&self, event: &SequencedEvent) -> Option<String> {
        event.event.payload.get("id")?.as_str().map(|s| s.to_string())
    }

    fn apply(&self, state: Option<serde_json::Value>, event: &SequencedEvent) -> Option<serde_json::Value> {
        match event.event_type() {
            "Activated" => Some(serde_json::json!({"active": true})),
            "Deactivated" => {
                let _ = state;
                None
            }
            _ => state,
        }
    }

    fn tags_for(&self, _state: &serde_json::Value) -> Vec<Tag> {
        vec![Tag::new("status", "active")]
    }
}

/// (S5) Projection delete via a `null` apply return.
#[tokio::test]
async fn s5_projection_delete_via_null() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        EventStore::open(dir.path(), "CourseManagement", StoreConfig::default())
            .await
            .unwrap(),
    );
    store
        .append(
            vec![Event::new("Activated", serde_json::json!({"id": "X1"}), vec![Tag::new("id", "X1")])],
            None,
        )
        .await
        .unwrap();

    let context_dir = dir.path().join("CourseManagement");
    let mut manager = ProjectionManager::new(
        store.clone(),
        context_dir,
        ProjectionManagerConfig { enable_auto_rebuild: false, ..Default::default() },
    );
    manager.register(Arc::new(DeletableProjection)).await.unwrap();
    manager.update("Deletable").await.unwrap();

    store
        .append(
            vec![Event::new("Deactivated", serde_json::json!({"id": "X1"}), vec![Tag::new("id", "X1")])],
            None,
        )
        .await
        .unwrap();
    manager.update("Deletable").await.unwrap();

    let checkpoint = manager.get_checkpoint("Deletable").await.unwrap().unwrap();
    assert_eq!(checkpoint.last_processed_position, 2);
}

async fn futures_join_all<T>(handles: [tokio::task::JoinHandle<T>; 2]) -> Vec<T> {
    let [a, b] = handles;
    vec![a.await.unwrap(), b.await.unwrap()]
}
