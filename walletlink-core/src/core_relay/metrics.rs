/*
    Relay metrics

    Counters and gauges for the relay transport. Recorded through the
    `metrics` facade; nothing is exported unless the host installs a recorder.
*/

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "walletlink_relay_publish_total",
        "Publish attempts, labeled by result (acked, failed, timeout)"
    );
    describe_counter!(
        "walletlink_relay_redeliveries_total",
        "Queued publishes retried on a heartbeat pulse"
    );
    describe_counter!(
        "walletlink_relay_connections_total",
        "Socket connection attempts, labeled by result (connected, failed)"
    );
    describe_counter!(
        "walletlink_relay_disconnects_total",
        "Socket disconnects, labeled by reason"
    );
    describe_counter!(
        "walletlink_relay_inbound_messages_total",
        "Subscription messages received, labeled by outcome (delivered, unsubscribed)"
    );
    describe_counter!(
        "walletlink_decode_failures_total",
        "Inbound envelopes or payloads that failed to decode"
    );
    describe_gauge!("walletlink_relay_subscriptions", "Topics currently subscribed");
    describe_histogram!(
        "walletlink_relay_request_duration_seconds",
        "Time from relay request to relay response"
    );
}

pub fn record_publish(result: &'static str) {
    counter!("walletlink_relay_publish_total", "result" => result).increment(1);
}

pub fn record_redelivery() {
    counter!("walletlink_relay_redeliveries_total").increment(1);
}

pub fn record_connection(result: &'static str) {
    counter!("walletlink_relay_connections_total", "result" => result).increment(1);
}

pub fn record_disconnect(reason: &'static str) {
    counter!("walletlink_relay_disconnects_total", "reason" => reason).increment(1);
}

pub fn record_inbound_message(outcome: &'static str) {
    counter!("walletlink_relay_inbound_messages_total", "outcome" => outcome).increment(1);
}

pub fn record_decode_failure() {
    counter!("walletlink_decode_failures_total").increment(1);
}

pub fn set_subscriptions(count: usize) {
    gauge!("walletlink_relay_subscriptions").set(count as f64);
}

pub fn record_request_duration(method: &str, seconds: f64) {
    histogram!("walletlink_relay_request_duration_seconds", "method" => method.to_string())
        .record(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        record_publish("acked");
        record_redelivery();
        record_connection("connected");
        record_disconnect("closed");
        record_inbound_message("delivered");
        record_decode_failure();
        set_subscriptions(3);
        record_request_duration("irn_publish", 0.01);
    }
}
