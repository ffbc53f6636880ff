//! Service counters. Each helper records through the `metrics` facade, which
//! the Prometheus recorder installed in `serve` renders at `/metrics`, and
//! mirrors the event at trace level.

use tracing::trace;

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("listing_requests_total", "route" => route).increment(1);
    trace!(target = "listing.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &str, elapsed_ms: u128) {
    ::metrics::histogram!("listing_stage_elapsed_ms", "stage" => stage.to_string())
        .record(elapsed_ms as f64);
    trace!(
        target = "listing.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn retry_scheduled(operation: &'static str, attempt: u32) {
    ::metrics::counter!("listing_retries_total", "operation" => operation).increment(1);
    trace!(
        target = "listing.metrics",
        operation = operation,
        attempt = attempt,
        "retries_total_inc"
    );
}

pub fn fallback_output(route: &'static str) {
    ::metrics::counter!("listing_unstructured_output_total", "route" => route).increment(1);
    trace!(
        target = "listing.metrics",
        route = route,
        "unstructured_output_total_inc"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn helpers_record_into_the_prometheus_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            inc_requests("/listings");
            inc_requests("/listings");
            retry_scheduled("crew_run", 1);
            fallback_output("/api/v1/generate_text");
            stage_elapsed("scrape", 42);
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"listing_requests_total{route="/listings"} 2"#));
        assert!(rendered.contains(r#"listing_retries_total{operation="crew_run"} 1"#));
        assert!(rendered.contains("listing_unstructured_output_total"));
        assert!(rendered.contains("listing_stage_elapsed_ms"));
    }
}
