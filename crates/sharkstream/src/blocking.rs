//! Synchronous access to a [`CaptureSession`] for callers without an async runtime.
//!
//! Each [`BlockingCapture`] owns a current-thread tokio runtime. Do not use it from inside
//! another runtime; `block_on` panics there.

use std::{io, ops::ControlFlow, time::Duration};

use tokio::runtime::{Builder, Runtime};
use tracing::warn;

use crate::{
    session::{CaptureSession, RunLimits, RunSummary},
    CaptureError, RecordDecoder,
};

/// Runtime suitable for driving tshark child processes from synchronous code.
pub fn capture_runtime() -> io::Result<Runtime> {
    Builder::new_current_thread().enable_all().build()
}

/// Iterator over a capture. Dropping it kills any tshark process still running.
pub struct BlockingCapture<D: RecordDecoder> {
    session: CaptureSession<D>,
    runtime: Runtime,
}

impl<D: RecordDecoder> BlockingCapture<D> {
    pub fn new(session: CaptureSession<D>) -> io::Result<Self> {
        Ok(Self::with_runtime(session, capture_runtime()?))
    }

    pub fn with_runtime(session: CaptureSession<D>, runtime: Runtime) -> Self {
        Self { session, runtime }
    }

    pub fn session(&self) -> &CaptureSession<D> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut CaptureSession<D> {
        &mut self.session
    }

    pub fn get(&mut self, index: usize) -> Result<D::Packet, CaptureError> {
        self.runtime.block_on(self.session.get(index))
    }

    pub fn apply_on_packets<F>(
        &mut self,
        callback: F,
        limits: RunLimits,
    ) -> Result<RunSummary, CaptureError>
    where
        F: FnMut(D::Packet) -> ControlFlow<()>,
    {
        self.runtime
            .block_on(self.session.apply_on_packets(callback, limits))
    }

    pub fn load_packets(
        &mut self,
        packet_count: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, CaptureError> {
        self.runtime
            .block_on(self.session.load_packets(packet_count, timeout))
    }

    pub fn close(&mut self) -> Result<(), CaptureError> {
        self.runtime.block_on(self.session.close())
    }
}

impl<D: RecordDecoder> Iterator for BlockingCapture<D> {
    type Item = Result<D::Packet, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.session.next()).transpose()
    }
}

impl<D: RecordDecoder> Drop for BlockingCapture<D> {
    fn drop(&mut self) {
        if self.session.live_process_count() == 0 {
            return;
        }
        if let Err(err) = self.runtime.block_on(self.session.close()) {
            warn!(error = %err, "failed to close capture on drop");
        }
    }
}
