//! Counters and timings, recorded through the `metrics` facade for the
//! Prometheus exporter and mirrored as trace events.

use tracing::trace;

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("auction_requests_total", "route" => route).increment(1);
    trace!(
        target = "auction.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    ::metrics::histogram!("auction_stage_duration_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "auction.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn external_call(service: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    ::metrics::counter!("auction_external_calls_total", "service" => service, "outcome" => outcome)
        .increment(1);
    trace!(
        target = "auction.metrics",
        service = service,
        ok = ok,
        "external_call"
    );
}

pub fn images_uploaded(count: usize) {
    ::metrics::counter!("auction_uploads_total").increment(1);
    ::metrics::counter!("auction_uploaded_images_total").increment(count as u64);
    trace!(target = "auction.metrics", images = count, "upload_recorded");
}

pub fn bid_placed() {
    ::metrics::counter!("auction_bids_total").increment(1);
    trace!(target = "auction.metrics", "bid_recorded");
}
