use super::*;

#[test]
fn workunit_span_id_has_16_digit_hex_format() {
    let hex_string = SpanId(1).to_string();
    assert_eq!(16, hex_string.len());
    for ch in hex_string.chars() {
        assert!(ch.is_ascii_hexdigit())
    }
}

#[test]
fn hex_16_digit_string_actually_uses_input_number() {
    assert_eq!(SpanId(0x_ffff_ffff_ffff_ffff).to_string(), "ffffffffffffffff");
    assert_eq!(SpanId(0x_1).to_string(), "0000000000000001");
    assert_eq!(SpanId(0x_0123_4567_89ab_cdef).to_string(), "0123456789abcdef");
}

#[test]
fn completed_workunits_carry_a_duration() {
    let store = WorkunitStore::new(RunId(1), 16);
    let running = store.start_workunit("build_action", Level::Debug, None);
    let span_id = running.span_id();
    running.complete(WorkunitOutcome::Success, HashMap::new());

    let completed = store.completed_workunits();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].span_id, span_id);
    assert!(completed[0].duration.is_some());
    assert_eq!(
        completed[0].state,
        WorkunitState::Completed { result: WorkunitOutcome::Success }
    );
}

#[test]
fn dropping_a_running_workunit_without_completing_marks_it_failed() {
    let store = WorkunitStore::new(RunId(1), 16);
    {
        let _running = store.start_workunit("leaked", Level::Debug, None);
    }
    let completed = store.completed_workunits();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].state,
        WorkunitState::Completed { result: WorkunitOutcome::Failure }
    );
}

#[test]
fn the_ring_buffer_evicts_the_oldest_entry_once_full() {
    let store = WorkunitStore::new(RunId(1), 2);
    for name in ["a", "b", "c"] {
        let running = store.start_workunit(name, Level::Debug, None);
        running.complete(WorkunitOutcome::Success, HashMap::new());
    }
    let completed = store.completed_workunits();
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].name, "b");
    assert_eq!(completed[1].name, "c");
}

#[test]
fn nested_workunits_record_their_parent_span() {
    let store = WorkunitStore::new(RunId(1), 16);
    let parent = store.start_workunit("parent", Level::Debug, None);
    let parent_id = parent.span_id();
    let child = store.start_workunit("child", Level::Debug, Some(parent_id));
    child.complete(WorkunitOutcome::Success, HashMap::new());
    parent.complete(WorkunitOutcome::Success, HashMap::new());

    let completed = store.completed_workunits();
    let child = completed.iter().find(|w| w.name == "child").unwrap();
    assert_eq!(child.parent_id, Some(parent_id));
}
