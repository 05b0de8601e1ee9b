use prometheus::{register_int_counter, IntCounter};
use std::sync::LazyLock;

pub static MSGS_DELIVERED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relayd_messages_delivered",
        "how many messages have been delivered"
    )
    .unwrap()
});

pub static MSGS_DEFERRED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relayd_messages_deferred",
        "how many delivery attempts ended in a transient failure"
    )
    .unwrap()
});

pub static MSGS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relayd_messages_failed",
        "how many messages have permanently failed"
    )
    .unwrap()
});

pub static MSGS_TIMED_OUT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relayd_messages_timed_out",
        "how many messages expired in the queue without being delivered"
    )
    .unwrap()
});

pub static EVENTS_FORWARDED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relayd_events_forwarded",
        "how many events the operator endpoint has acknowledged"
    )
    .unwrap()
});

pub static EVENT_FORWARD_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "relayd_event_forward_errors",
        "how many event forwarding attempts failed and will be retried"
    )
    .unwrap()
});
