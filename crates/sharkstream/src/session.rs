use std::{
    fmt,
    ops::ControlFlow,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use semver::Version;
use tokio::{sync::OnceCell, time};
use tracing::{debug, warn};

use crate::{
    history::{self, PacketHistory},
    params::{CaptureParameters, CaptureSource},
    process::{Invocation, ProcessHandle, ProcessSupervisor},
    scanner::{
        BoundaryScanner, JsonSeparators, StreamBuffer, DEFAULT_BATCH_SIZE, PACKET_TAG,
        STRUCTURE_TAG, SUMMARIES_BATCH_SIZE,
    },
    version, CaptureError, RecordDecoder,
};

/// Optional bounds for [`CaptureSession::apply_on_packets`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    /// Stop after this many packets. `None` or `Some(0)` reads until the stream ends.
    pub packet_count: Option<usize>,
    /// Abandon the run (and kill tshark) once this much time has passed.
    pub timeout: Option<Duration>,
}

impl RunLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn packet_count(mut self, count: usize) -> Self {
        self.packet_count = Some(count);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a push-all run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// tshark closed its stdout.
    Drained,
    /// The callback returned [`ControlFlow::Break`].
    Stopped,
    /// [`RunLimits::packet_count`] packets were delivered.
    LimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub delivered: usize,
    pub outcome: RunOutcome,
}

enum StructureState<S> {
    Pending,
    Captured(S),
    Absent,
}

impl<S> StructureState<S> {
    fn get(&self) -> Option<&S> {
        match self {
            StructureState::Captured(structure) => Some(structure),
            StructureState::Pending | StructureState::Absent => None,
        }
    }
}

/// One tshark process and the bytes read from it so far.
struct CaptureRound<S> {
    handle: ProcessHandle,
    buffer: StreamBuffer,
    scanner: BoundaryScanner,
    structure: StructureState<S>,
    emitted: usize,
}

impl<S> CaptureRound<S> {
    /// Reads one more chunk. Returns `true` once tshark's stdout is exhausted.
    async fn fill(&mut self, batch: usize) -> Result<bool, CaptureError> {
        let read = self
            .handle
            .read_chunk(batch, self.buffer.tail())
            .await
            .map_err(CaptureError::StdoutRead)?;
        Ok(read == 0)
    }
}

enum PullState<S> {
    Idle,
    Running(CaptureRound<S>),
    Finished,
}

/// A capture driven by one or more tshark processes.
///
/// Packets can be pulled one at a time ([`CaptureSession::next`]), pushed through a callback
/// ([`CaptureSession::apply_on_packets`]) or, when packets are kept, addressed by index
/// ([`CaptureSession::get`]). Every tshark process the session starts is killed and reaped
/// on drain, stop, timeout, error and [`CaptureSession::close`]. Dropping the session kills
/// any process still running.
pub struct CaptureSession<D: RecordDecoder> {
    binary: PathBuf,
    parameters: CaptureParameters,
    decoder: D,
    history: Box<dyn PacketHistory<D::Packet>>,
    supervisor: ProcessSupervisor,
    version: OnceCell<Version>,
    pull: PullState<D::Structure>,
    closed: bool,
}

impl<D: RecordDecoder> CaptureSession<D> {
    pub(crate) fn new(
        binary: PathBuf,
        parameters: CaptureParameters,
        decoder: D,
        keep_packets: bool,
        debug: bool,
        tshark_version: Option<Version>,
    ) -> Self
    where
        D::Packet: 'static,
    {
        Self {
            binary,
            parameters,
            decoder,
            history: history::for_mode(keep_packets),
            supervisor: ProcessSupervisor::new(debug),
            version: OnceCell::new_with(tshark_version),
            pull: PullState::Idle,
            closed: false,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn source(&self) -> &CaptureSource {
        self.parameters.source()
    }

    pub fn parameters(&self) -> &CaptureParameters {
        &self.parameters
    }

    /// Number of retained packets (always 0 without `keep_packets`).
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keeps_packets(&self) -> bool {
        self.history.supports_index()
    }

    /// Number of tshark processes currently running for this session.
    pub fn live_process_count(&self) -> usize {
        self.supervisor.live_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// tshark version, probed with `-v` on first use and cached afterwards.
    pub async fn tshark_version(&self) -> Result<&Version, CaptureError> {
        self.version
            .get_or_try_init(|| version::probe_version(&self.binary))
            .await
    }

    /// The exact command a capture round would run.
    pub async fn invocation(&self, packet_count: Option<usize>) -> Result<Invocation, CaptureError> {
        let detected = if self.parameters.needs_version() {
            Some(self.tshark_version().await?.clone())
        } else {
            None
        };
        if self.parameters.use_json {
            if let Some(old) = detected.as_ref().filter(|v| !version::supports_json(v)) {
                return Err(CaptureError::JsonUnsupported {
                    version: old.clone(),
                });
            }
        }
        let args = self.parameters.argv(detected.as_ref(), packet_count);
        Ok(Invocation::new(&self.binary, args))
    }

    /// Returns the next packet, or `None` once the stream is exhausted.
    ///
    /// With `keep_packets`, packets behind the read cursor are replayed from memory before
    /// any new data is read from tshark.
    pub async fn next(&mut self) -> Result<Option<D::Packet>, CaptureError> {
        if let Some(packet) = self.history.replay() {
            return Ok(Some(packet));
        }
        let Some(packet) = self.pull_fresh().await? else {
            return Ok(None);
        };
        self.history.retain(&packet, true);
        Ok(Some(packet))
    }

    /// Packet at `index`, pulling forward with [`CaptureSession::next`] as far as needed.
    ///
    /// Pulling moves the read cursor, so after `get(0)` on a fresh session `next()` yields
    /// the packet at index 1.
    pub async fn get(&mut self, index: usize) -> Result<D::Packet, CaptureError> {
        if !self.history.supports_index() {
            return Err(CaptureError::HistoryDisabled);
        }
        while index >= self.history.len() {
            if self.next().await?.is_none() {
                return Err(CaptureError::IndexNotFound { index });
            }
        }
        self.history
            .get(index)
            .ok_or(CaptureError::IndexNotFound { index })
    }

    /// Rewinds [`CaptureSession::next`] to the first retained packet.
    pub fn reset(&mut self) {
        self.history.reset();
    }

    /// Forgets all retained packets. A running pull round keeps its position.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Starts a fresh tshark process and feeds every packet to `callback`.
    ///
    /// The callback returns [`ControlFlow::Break`] to stop early. When `limits.timeout`
    /// elapses first, all processes are killed and [`CaptureError::TimedOut`] is returned;
    /// callbacks that already ran stand. All processes of the session, including an
    /// in-flight [`CaptureSession::next`] round, are terminated when the run ends.
    pub async fn apply_on_packets<F>(
        &mut self,
        callback: F,
        limits: RunLimits,
    ) -> Result<RunSummary, CaptureError>
    where
        F: FnMut(D::Packet) -> ControlFlow<()>,
    {
        self.run(callback, limits, false).await
    }

    /// Reads up to `packet_count` packets (0 = until the stream ends) into the retained
    /// history. A timeout is not an error here; returns how many packets were added.
    pub async fn load_packets(
        &mut self,
        packet_count: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, CaptureError> {
        let limits = RunLimits {
            packet_count: Some(packet_count),
            timeout,
        };
        match self.run(|_| ControlFlow::Continue(()), limits, true).await {
            Ok(summary) => Ok(summary.delivered),
            Err(CaptureError::TimedOut { delivered, .. }) => Ok(delivered),
            Err(err) => Err(err),
        }
    }

    /// Kills and reaps every tshark process of this session. Idempotent.
    ///
    /// A pull round in flight is abandoned and no new one is started; later
    /// [`CaptureSession::next`] and [`CaptureSession::get`] calls only see retained packets.
    pub async fn close(&mut self) -> Result<(), CaptureError> {
        self.pull = PullState::Finished;
        self.closed = true;
        self.supervisor.terminate_all().await
    }

    async fn run<F>(
        &mut self,
        callback: F,
        limits: RunLimits,
        retain: bool,
    ) -> Result<RunSummary, CaptureError>
    where
        F: FnMut(D::Packet) -> ControlFlow<()>,
    {
        let mut delivered = 0;
        let result = match limits.timeout {
            Some(timeout) => {
                let drive = self.drive(callback, limits.packet_count, retain, &mut delivered);
                let timed = time::timeout(timeout, drive).await;
                match timed {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(?timeout, delivered, "capture timed out");
                        Err(CaptureError::TimedOut { timeout, delivered })
                    }
                }
            }
            None => {
                self.drive(callback, limits.packet_count, retain, &mut delivered)
                    .await
            }
        };

        let cleanup = self.close().await;
        let outcome = result?;
        cleanup?;
        Ok(RunSummary {
            delivered,
            outcome,
        })
    }

    async fn drive<F>(
        &mut self,
        mut callback: F,
        packet_count: Option<usize>,
        retain: bool,
        delivered: &mut usize,
    ) -> Result<RunOutcome, CaptureError>
    where
        F: FnMut(D::Packet) -> ControlFlow<()>,
    {
        let limit = packet_count.filter(|count| *count > 0);
        let mut round = self.start_round(limit).await?;
        debug!("starting to go through packets");

        loop {
            let packet = match read_packet(&self.decoder, &mut round).await? {
                Some(packet) => packet,
                None => {
                    debug!(delivered = *delivered, "EOF reached");
                    self.supervisor.finish(round.handle.id()).await?;
                    return Ok(RunOutcome::Drained);
                }
            };

            if retain {
                self.history.retain(&packet, false);
            }
            *delivered += 1;
            if callback(packet).is_break() {
                debug!(delivered = *delivered, "user-initiated capture stop in callback");
                return Ok(RunOutcome::Stopped);
            }
            if limit.is_some_and(|limit| *delivered >= limit) {
                return Ok(RunOutcome::LimitReached);
            }
        }
    }

    async fn pull_fresh(&mut self) -> Result<Option<D::Packet>, CaptureError> {
        if self.closed {
            return Ok(None);
        }
        if let PullState::Idle = self.pull {
            match self.start_round(None).await {
                Ok(round) => self.pull = PullState::Running(round),
                Err(err) => {
                    self.pull = PullState::Finished;
                    return Err(err);
                }
            }
        }
        let PullState::Running(round) = &mut self.pull else {
            return Ok(None);
        };

        let outcome = read_packet(&self.decoder, round).await;
        let id = round.handle.id();
        match outcome {
            Ok(Some(packet)) => Ok(Some(packet)),
            Ok(None) => {
                debug!("EOF reached (pull)");
                self.pull = PullState::Finished;
                self.supervisor.finish(id).await?;
                Ok(None)
            }
            Err(err) => {
                self.pull = PullState::Finished;
                if let Err(cleanup) = self.supervisor.terminate(id).await {
                    warn!(error = %cleanup, "failed to clean up tshark after error");
                }
                Err(err)
            }
        }
    }

    async fn start_round(
        &self,
        packet_count: Option<usize>,
    ) -> Result<CaptureRound<D::Structure>, CaptureError> {
        let invocation = self.invocation(packet_count).await?;
        let scanner = if self.parameters.use_json {
            BoundaryScanner::json(JsonSeparators::for_version(self.tshark_version().await?))
        } else {
            BoundaryScanner::tagged(PACKET_TAG)
        };
        let structure = if self.parameters.only_summaries && !self.parameters.use_json {
            StructureState::Pending
        } else {
            StructureState::Absent
        };
        let handle = self.supervisor.spawn(invocation, Stdio::null()).await?;

        Ok(CaptureRound {
            handle,
            buffer: StreamBuffer::new(),
            scanner,
            structure,
            emitted: 0,
        })
    }
}

/// Carves and decodes the next packet of `round`. `None` means tshark's stdout hit EOF.
async fn read_packet<D: RecordDecoder>(
    decoder: &D,
    round: &mut CaptureRound<D::Structure>,
) -> Result<Option<D::Packet>, CaptureError> {
    if let StructureState::Pending = round.structure {
        let structure_scanner = BoundaryScanner::tagged(STRUCTURE_TAG);
        loop {
            if let Some(record) = structure_scanner.extract(&mut round.buffer, true) {
                let structure = decoder
                    .decode_summary_structure(&record)
                    .map_err(CaptureError::Decode)?;
                round.structure = StructureState::Captured(structure);
                break;
            }
            if round.fill(SUMMARIES_BATCH_SIZE).await? {
                debug!("stream ended without a summary structure");
                round.structure = StructureState::Absent;
                break;
            }
        }
    }

    loop {
        let first_record = round.emitted == 0;
        if let Some(record) = round.scanner.extract(&mut round.buffer, first_record) {
            round.emitted += 1;
            debug!(bytes = record.len(), index = round.emitted, "carved packet record");
            let packet = decoder
                .decode(&record, round.structure.get())
                .map_err(CaptureError::Decode)?;
            return Ok(Some(packet));
        }
        if round.fill(DEFAULT_BATCH_SIZE).await? {
            return Ok(None);
        }
    }
}

impl<D: RecordDecoder> fmt::Display for CaptureSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keeps_packets() {
            write!(f, "<CaptureSession {} ({} packets)>", self.source(), self.len())
        } else {
            write!(f, "<CaptureSession {}>", self.source())
        }
    }
}

impl<D: RecordDecoder> fmt::Debug for CaptureSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("binary", &self.binary)
            .field("parameters", &self.parameters)
            .field("retained", &self.history.len())
            .field("live_processes", &self.supervisor.live_count())
            .field("closed", &self.closed)
            .finish()
    }
}
