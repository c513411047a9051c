use std::sync::Arc;

use common::shutdown::ShutdownFlag;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use crate::{
    message::{
        SyncMessage,
        SyncResponse,
    },
    sync::{
        IntegritySynchronizer,
        SyncBus,
    },
    table::{
        EntityRecord,
        EntityTable,
    },
};

#[derive(Default)]
struct RecordingBus {
    messages: Mutex<Vec<SyncMessage>>,
}

impl RecordingBus {
    fn take(&self) -> Vec<SyncMessage> {
        std::mem::take(&mut *self.messages.lock())
    }
}

impl SyncBus for RecordingBus {
    fn publish(&self, msg: &SyncMessage) -> anyhow::Result<()> {
        self.messages.lock().push(msg.clone());
        Ok(())
    }
}

fn entity(key: &str, checksum: &str) -> EntityRecord {
    EntityRecord {
        key: key.to_owned(),
        checksum: checksum.to_owned(),
        size: 64,
        modified: 1_700_000_000,
    }
}

fn synchronizer(records: Vec<EntityRecord>) -> (IntegritySynchronizer, Arc<RecordingBus>) {
    let bus = Arc::new(RecordingBus::default());
    let table = Arc::new(Mutex::new(EntityTable::from_records(records)));
    let sync = IntegritySynchronizer::new(table, bus.clone(), ShutdownFlag::new());
    (sync, bus)
}

#[test]
fn test_table_bounds_and_ranges() {
    let table = EntityTable::from_records(vec![
        entity("b", "2"),
        entity("a", "1"),
        entity("c", "3"),
    ]);
    assert_eq!(table.bounds(), Some(("a".to_owned(), "c".to_owned())));
    assert_eq!(table.count_range("a", "c"), 3);
    assert_eq!(table.count_range("a", "b"), 2);
    assert_eq!(table.count_range("d", "z"), 0);
    assert_eq!(table.keys_in_range("b", "z"), vec!["b", "c"]);
}

#[test]
fn test_checksums_are_content_addressed() {
    let one = EntityTable::from_records(vec![entity("a", "1"), entity("b", "2")]);
    let two = EntityTable::from_records(vec![entity("b", "2"), entity("a", "1")]);
    assert_eq!(one.global_checksum(), two.global_checksum());

    let three = EntityTable::from_records(vec![entity("a", "1"), entity("b", "changed")]);
    assert_ne!(one.global_checksum(), three.global_checksum());
    assert!(EntityTable::new().global_checksum().is_none());
}

#[test]
fn test_message_op_tags() {
    let msg = SyncMessage::IntegrityCheckGlobal {
        id: 42,
        begin: "a".to_owned(),
        end: "z".to_owned(),
        checksum: "deadbeef".to_owned(),
    };
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["op"], "integrity_check_global");
    assert_eq!(value["id"], 42);

    let clear = serde_json::to_value(SyncMessage::IntegrityClear { id: 1 }).unwrap();
    assert_eq!(clear["op"], "integrity_clear");

    let state = serde_json::to_value(SyncMessage::State {
        item: entity("a", "1"),
    })
    .unwrap();
    assert_eq!(state["op"], "state");
    assert_eq!(state["item"]["key"], "a");
}

#[test]
fn test_response_parsing() {
    let response =
        SyncResponse::parse("checksum_fail {\"id\": 17, \"begin\": \"a\", \"end\": \"z\"}")
            .unwrap();
    assert_eq!(response.command, "checksum_fail");
    assert_eq!(response.id, 17);
    assert_eq!(response.begin.as_deref(), Some("a"));
    assert_eq!(response.end.as_deref(), Some("z"));

    assert!(SyncResponse::parse("no_argument_here").is_none());
    assert!(SyncResponse::parse("checksum_fail not-json").is_none());
    assert!(SyncResponse::parse("checksum_fail {\"begin\": \"a\"}").is_none());
}

#[test]
fn test_digest_of_empty_table_is_clear() {
    let (sync, bus) = synchronizer(Vec::new());
    sync.publish_digest(5).unwrap();
    assert_eq!(bus.take(), vec![SyncMessage::IntegrityClear { id: 5 }]);
}

#[test]
fn test_digest_covers_whole_table() {
    let (sync, bus) = synchronizer(vec![entity("a", "1"), entity("b", "2"), entity("c", "3")]);
    sync.publish_digest(9).unwrap();
    let messages = bus.take();
    let SyncMessage::IntegrityCheckGlobal {
        id,
        begin,
        end,
        checksum,
    } = &messages[0]
    else {
        panic!("expected a global check, got {messages:?}");
    };
    assert_eq!(*id, 9);
    assert_eq!(begin, "a");
    assert_eq!(end, "c");
    // SHA-1, hex encoded.
    assert_eq!(checksum.len(), 40);
}

#[test]
fn test_dispatch_drops_future_ids_and_adopts_older_ones() {
    let (sync, bus) = synchronizer(vec![entity("a", "1")]);
    let mut current_id = 100;

    sync.dispatch(
        "checksum_fail {\"id\": 101, \"begin\": \"a\", \"end\": \"z\"}",
        &mut current_id,
    );
    assert_eq!(current_id, 100);
    assert_eq!(bus.take(), Vec::new());

    sync.dispatch(
        "checksum_fail {\"id\": 99, \"begin\": \"a\", \"end\": \"z\"}",
        &mut current_id,
    );
    assert_eq!(current_id, 99);
    // The single record in range is sent outright.
    assert_eq!(
        bus.take(),
        vec![SyncMessage::State {
            item: entity("a", "1")
        }]
    );
}

#[test]
fn test_checksum_fail_bisects_and_converges() {
    let (sync, bus) = synchronizer(vec![entity("a", "1"), entity("b", "2"), entity("c", "3")]);
    let mut current_id = 50;

    // Round 1: the left half is a single record and is sent as state, the
    // right half is re-announced with its own digest.
    sync.dispatch(
        "checksum_fail {\"id\": 50, \"begin\": \"a\", \"end\": \"z\"}",
        &mut current_id,
    );
    let first = bus.take();
    assert_eq!(first.len(), 2);
    assert_eq!(
        first[0],
        SyncMessage::State {
            item: entity("a", "1")
        }
    );
    let SyncMessage::IntegrityCheckRight { id, begin, end, .. } = &first[1] else {
        panic!("expected a right-half check, got {first:?}");
    };
    assert_eq!((*id, begin.as_str(), end.as_str()), (50, "b", "c"));

    // Round 2: the peer still disagrees about the right half; both its
    // single-record halves are sent as state. Three state messages in
    // total for a three-record store.
    sync.dispatch(
        "checksum_fail {\"id\": 50, \"begin\": \"b\", \"end\": \"c\"}",
        &mut current_id,
    );
    let second = bus.take();
    assert_eq!(
        second,
        vec![
            SyncMessage::State {
                item: entity("b", "2")
            },
            SyncMessage::State {
                item: entity("c", "3")
            },
        ]
    );
}

#[test]
fn test_no_data_dumps_the_range() {
    let (sync, bus) = synchronizer(vec![entity("a", "1"), entity("b", "2"), entity("c", "3")]);
    let mut current_id = 8;
    sync.dispatch(
        "no_data {\"id\": 8, \"begin\": \"b\", \"end\": \"z\"}",
        &mut current_id,
    );
    assert_eq!(
        bus.take(),
        vec![
            SyncMessage::State {
                item: entity("b", "2")
            },
            SyncMessage::State {
                item: entity("c", "3")
            },
        ]
    );
}

#[test]
fn test_empty_range_is_a_no_op() {
    let (sync, bus) = synchronizer(vec![entity("a", "1")]);
    let mut current_id = 3;
    sync.dispatch(
        "checksum_fail {\"id\": 3, \"begin\": \"x\", \"end\": \"z\"}",
        &mut current_id,
    );
    sync.dispatch(
        "unknown_command {\"id\": 3, \"begin\": \"a\", \"end\": \"z\"}",
        &mut current_id,
    );
    assert_eq!(bus.take(), Vec::new());
}
