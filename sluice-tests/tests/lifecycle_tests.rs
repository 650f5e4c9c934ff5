//! Publication lifecycle tests
//!
//! Reference counting, drain, linger, end of life, log cleaning and
//! unblocking as the conductor drives them.

use sluice_protocol::frame::FrameType;
use sluice_protocol::log_buffer::{CLEAN, NEEDS_CLEANING};
use sluice_tests::{data_headers, Harness, RecordingHost, MS, SESSION_ID, STREAM_ID, TERM_LENGTH};

const LINGER: i64 = 5_000 * MS;

fn connected() -> Harness {
    let harness = Harness::new(0);
    harness.acknowledge(TERM_LENGTH as i32);
    harness.conduct();
    harness
}

#[test]
fn test_drain_linger_end_of_life() {
    let mut harness = connected();
    let mut host = RecordingHost::default();
    let handle = harness.handle.clone();

    assert_eq!(handle.inc_ref(), 1);
    handle.publisher().offer(&[9u8; 500]).unwrap();

    assert_eq!(handle.dec_ref(), 0);
    assert_eq!(harness.endpoint.removed(), vec![(SESSION_ID, STREAM_ID)]);

    // Unsent data keeps it active
    handle.on_time_event(1_000 * MS, &mut host);
    assert!(handle.is_active());

    harness.drain(1_500 * MS);
    handle.on_time_event(2_000 * MS, &mut host);
    assert!(!handle.is_active());
    assert_eq!(handle.time_of_last_state_change(), 2_000 * MS);

    handle.on_time_event(2_000 * MS + LINGER, &mut host);
    assert!(!handle.has_reached_end_of_life());
    assert!(host.cleaned.is_empty());

    handle.on_time_event(2_000 * MS + LINGER + 1, &mut host);
    assert!(handle.has_reached_end_of_life());
    assert_eq!(host.cleaned, vec![(SESSION_ID, STREAM_ID)]);

    handle.on_time_event(20_000 * MS, &mut host);
    assert_eq!(host.cleaned.len(), 1);
    assert_eq!(handle.time_of_last_state_change(), 2_000 * MS);
}

#[test]
fn test_flush_after_exactly_filled_terms() {
    let mut harness = connected();
    let mut host = RecordingHost::default();
    harness.handle.inc_ref();

    // 1024 byte frames, 64 to a term, so no padding and no trip at the end
    for _ in 0..3 * 64 {
        harness.offer_until_accepted(&[7u8; 992], 0);
    }
    for _ in 0..3 {
        harness.drain(0);
        harness.acknowledge(TERM_LENGTH as i32);
    }
    let end = 3 * TERM_LENGTH as i64;
    assert_eq!(harness.handle.producer_position(), end);
    assert_eq!(harness.handle.consumer_position(), end);

    harness.handle.dec_ref();
    harness.handle.on_time_event(1_000 * MS, &mut host);
    assert!(!harness.handle.is_active());
    assert_eq!(harness.handle.time_of_last_state_change(), 1_000 * MS);

    harness.handle.on_time_event(1_000 * MS + LINGER + 1, &mut host);
    assert!(harness.handle.has_reached_end_of_life());
    assert_eq!(host.cleaned, vec![(SESSION_ID, STREAM_ID)]);
}

#[test]
fn test_referenced_publication_stays_alive() {
    let harness = connected();
    let mut host = RecordingHost::default();
    harness.handle.inc_ref();

    for second in 1..30 {
        harness.handle.on_time_event(second * 1_000 * MS, &mut host);
    }
    assert!(harness.handle.is_active());
    assert!(!harness.handle.has_reached_end_of_life());
    assert!(host.cleaned.is_empty());
}

#[test]
fn test_cleanup_failure_is_not_retried() {
    let harness = connected();
    let mut host = RecordingHost {
        fail: true,
        ..Default::default()
    };

    harness.handle.on_time_event(0, &mut host);
    assert!(!harness.handle.is_active());

    harness.handle.on_time_event(LINGER + 1, &mut host);
    assert!(harness.handle.has_reached_end_of_life());
    harness.handle.on_time_event(LINGER + 2, &mut host);
    assert_eq!(host.cleaned.len(), 1);
}

#[test]
fn test_release_without_reference_is_harmless() {
    let harness = connected();
    assert_eq!(harness.handle.dec_ref(), 0);
    assert_eq!(harness.handle.ref_count(), 0);
    assert!(harness.endpoint.removed().is_empty());

    assert_eq!(harness.handle.inc_ref(), 1);
    assert_eq!(harness.handle.dec_ref(), 0);
    assert_eq!(harness.endpoint.removed().len(), 1);
}

#[test]
fn test_clean_log_buffer_after_rotation() {
    let harness = connected();
    let log = harness.handle.log();
    let stale = log.partition(2).term_buffer();
    stale.put_i32_ordered(0, 1234);

    assert_eq!(harness.handle.clean_log_buffer(), 0);
    assert!(log.rotate_log(0));
    assert_eq!(log.partition(2).status(), NEEDS_CLEANING);

    assert_eq!(harness.handle.clean_log_buffer(), 1);
    assert_eq!(log.partition(2).status(), CLEAN);
    assert_eq!(stale.get_i32_volatile(0), 0);
    assert_eq!(harness.handle.clean_log_buffer(), 0);
}

#[test]
fn test_unblock_abandoned_claim() {
    let mut harness = connected();
    let log = harness.handle.log().clone();

    // A publisher that claimed space and died before writing
    log.partition(0).get_and_add_raw_tail(128);
    harness.handle.publisher().offer(b"survivor").unwrap();
    assert_eq!(harness.handle.producer_position(), 192);

    assert_eq!(harness.publication.send(0), 0);
    assert_eq!(harness.handle.consumer_position(), 0);

    assert!(harness.handle.unblock_at_consumer_position());
    harness.drain(MS);
    assert_eq!(harness.handle.consumer_position(), 192);

    let headers: Vec<_> = harness
        .endpoint
        .take_frames()
        .iter()
        .flat_map(|d| data_headers(d))
        .filter(|h| h.frame_length > 0)
        .collect();
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[0].frame_type, FrameType::Padding);
    assert_eq!(headers[0].frame_length, 128);
    assert_eq!(headers[1].frame_type, FrameType::Data);
    assert_eq!(headers[1].term_offset, 128);

    // Nothing left to unblock
    assert!(!harness.handle.unblock_at_consumer_position());
}
