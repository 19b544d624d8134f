//! Link quality scoring.

use mesh_storage::QualityMetrics;

const HIGH_BANDWIDTH_BPS: u64 = 10_000_000;
const LOW_BANDWIDTH_BPS: u64 = 1_000_000;

/// Score a link in [0, 1] from its latest measurements.
///
/// Latency is penalized in steps above 100, 200 and 500 ms, loss scales the
/// score linearly, and upstream bandwidth above 10 Mbps or below 1 Mbps
/// nudges it up or down.
pub fn quality_score(metrics: &QualityMetrics) -> f64 {
    let mut score = 1.0;

    if metrics.latency_ms > 500.0 {
        score *= 0.3;
    } else if metrics.latency_ms > 200.0 {
        score *= 0.6;
    } else if metrics.latency_ms > 100.0 {
        score *= 0.8;
    }

    score *= 1.0 - metrics.packet_loss.clamp(0.0, 1.0);

    if metrics.bandwidth_up > HIGH_BANDWIDTH_BPS {
        score *= 1.2;
    } else if metrics.bandwidth_up < LOW_BANDWIDTH_BPS {
        score *= 0.7;
    }

    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
