pub mod logging;
pub mod types;

use std::path::PathBuf;

/// Manifest of the Machine CRD.
pub fn machine_crd_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test/envtest/fixtures/machine.crd.yaml")
}

/// Port of an `https://127.0.0.1:<port>` server url.
pub fn server_port(server: &str) -> u16 {
    server
        .rsplit(':')
        .next()
        .and_then(|port| port.trim_end_matches('/').parse().ok())
        .unwrap_or_else(|| panic!("no port in `{server}`"))
}

/// True when something accepts connections on the loopback port.
pub async fn is_listening(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}
