use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Global label attached to every metric emitted by this process.
const SERVICE_LABEL: &str = "service";

/// Installs the global Prometheus recorder and serves `[::]:{port}/metrics`.
///
/// `service` distinguishes scheduler-only and worker-only deployments of the same binary.
pub fn init_metrics(port: u16, service: &str) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
        .add_global_label(SERVICE_LABEL, service)
        .install()
}
