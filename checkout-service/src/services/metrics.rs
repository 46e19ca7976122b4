use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("metrics handle already initialized"))?;

    metrics::describe_counter!(
        "payments_initiated_total",
        "Payment transactions created and sent to the gateway"
    );
    metrics::describe_counter!(
        "payments_finalized_total",
        "Transactions moved out of PENDING, by terminal status"
    );
    metrics::describe_counter!(
        "entitlements_granted_total",
        "Enrollments inserted after a verified payment"
    );
    metrics::describe_counter!(
        "gateway_errors_total",
        "Failed gateway calls, by operation"
    );

    Ok(())
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}
