use anyhow::Result;
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "pipeline_events_dispatched_total",
        "Canonical events delivered to the adapter fan-out."
    );
    describe_counter!(
        "pipeline_events_dropped_total",
        "Canonical events dropped by the global transform."
    );
    describe_counter!(
        "pipeline_adapter_errors_total",
        "Adapter delivery failures, labelled by adapter."
    );
    describe_counter!(
        "pipeline_handler_errors_total",
        "Bus handler invocations that returned an error."
    );
    describe_counter!(
        "pipeline_debounced_total",
        "Domain events dropped inside their debounce window."
    );
    describe_counter!(
        "pipeline_pending_queued_total",
        "Events parked in the pending queue before a redirect."
    );
    describe_counter!(
        "pipeline_pending_replayed_total",
        "Pending events replayed on the next page load."
    );
    describe_counter!(
        "pipeline_pending_expired_total",
        "Pending events dropped as stale, never delivered."
    );
    describe_counter!(
        "pipeline_batches_flushed_total",
        "HTTP sink batches sent successfully."
    );
    describe_counter!(
        "pipeline_retries_scheduled_total",
        "HTTP sink per-event retries scheduled after a failed batch."
    );
    describe_counter!(
        "pipeline_terminal_failures_total",
        "Events dropped after exhausting HTTP sink retries."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        describe();

        metrics::with_local_recorder(&recorder, || {
            let c = metrics::counter!("pipeline_events_dispatched_total");
            c.increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("pipeline_events_dispatched_total"));
    }
}
