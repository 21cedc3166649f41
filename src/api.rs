// Abstract monitor-mode capture/inject collaborator.

use std::time::SystemTime;

use bytes::Bytes;

/// One frame pulled out of a capture handle.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Kernel-side capture timestamp, used for host latency measurement.
    pub timestamp: SystemTime,
    /// Raw frame bytes starting at the radiotap header.
    pub data: Bytes,
}

/// A monitor-mode card as the link core sees it.
///
/// Concrete implementations (pcap, netlink, an in-memory medium for tests)
/// live outside the core. The opener is expected to apply the
/// receive-direction filter where the driver supports it; the link tolerates
/// loopback through the role field either way.
///
/// Implementations expose their readable file descriptor through
/// [`MonitorIo::poll_fd`] so one receive thread can multiplex every card in
/// a single `poll(2)`; handles without a descriptor are drained
/// opportunistically each poll period instead.
pub trait MonitorIo: Send {
    /// Error type produced by the capture layer.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Interface name, for logging and stats display.
    fn name(&self) -> &str;

    /// Readable descriptor for poll multiplexing, when the backend has one.
    fn poll_fd(&self) -> Option<std::os::raw::c_int>;

    /// Pulls the next frame. `Ok(None)` means no frame is currently
    /// available; the call must not block.
    fn read_frame(&mut self) -> Result<Option<CapturedFrame>, Self::Error>;

    /// Hands one fully assembled frame (radiotap included) to the driver.
    fn inject(&mut self, frame: &[u8]) -> Result<(), Self::Error>;
}
