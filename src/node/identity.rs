use std::fmt;
use std::net::UdpSocket;
use std::sync::Arc;
use tracing::warn;

/// This process's id in the cluster. Resolved once at startup and then
/// handed to everything that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(Arc<str>);

impl NodeIdentity {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Uses `configured` when given, else the host's outbound address.
    pub fn resolve(configured: Option<&str>) -> Self {
        if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
            return Self::new(id);
        }
        match outbound_address() {
            Some(addr) => Self::new(addr),
            None => {
                warn!("Could not determine host address, falling back to loopback");
                Self::new("127.0.0.1")
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Connecting a UDP socket sends nothing; it only makes the kernel pick the
// interface it would route through.
fn outbound_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        return None;
    }
    Some(ip.to_string())
}
