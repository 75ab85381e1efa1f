use goconnect_shared::signal::{SignalHub, SignalPayload};

/// The transfer engine's seam to whatever carries signaling: the in-process
/// hub in tests and single-host setups, or a server connection at the edge.
pub trait Signaler: Send + Sync {
    /// Best-effort delivery. Returns whether the payload reached the peer's
    /// buffer; callers must not rely on delivery for correctness.
    fn send(&self, to: &str, payload: SignalPayload) -> bool;
}

pub struct HubSignaler {
    hub: SignalHub,
    device_id: String,
}

impl HubSignaler {
    pub fn new(hub: SignalHub, device_id: impl Into<String>) -> Self {
        Self {
            hub,
            device_id: device_id.into(),
        }
    }
}

impl Signaler for HubSignaler {
    fn send(&self, to: &str, payload: SignalPayload) -> bool {
        self.hub.send(&self.device_id, to, payload)
    }
}
