//! Diagnostic session engine.
//!
//! One dispatcher task per session owns the adapter session, the poll
//! scheduler and the recorder, so exactly one request is ever on the wire.
//! Callers talk to it through a cloneable [`SessionHandle`]: ad-hoc reads
//! and trouble code requests go through a bounded queue, samples come back
//! through watch channels.

use obd_protocol::dtc::decode_dtc_response;
use obd_protocol::supported::{decode_bitmap_response, BITMAP_BASES};
use obd_protocol::vin::{
    decode_calibration_id, decode_ecu_name, decode_vin, CALIBRATION_ID_PID, ECU_NAME_PID, VIN_PID,
};
use obd_protocol::{
    decode_freeze_frame, decode_freeze_frame_dtc, decode_sample, lookup, lookup_name,
    AdapterConfig, AdapterRequest, AdapterResponse, AdapterSession, ConnectionState, DtcKind,
    ObdError, ObdResult, ParameterId, Sample, SupportedPids, Transport, TroubleCode,
    VehicleSnapshot,
};
use serde::{Deserialize, Serialize};
use session_recorder::{Session, SessionEvent, SessionRecorder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::queue::{Priority, PushError, RequestQueue, DEFAULT_CAPACITY};
use crate::scheduler::{PollScheduler, SchedulerConfig};

/// How long an idle dispatcher sleeps before looking again
const IDLE_WAIT: Duration = Duration::from_secs(3600);

fn default_interval_ms() -> u64 {
    1000
}

/// A parameter to poll, by registry short name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTarget {
    pub parameter: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl PollTarget {
    pub fn new(parameter: &str, interval_ms: u64) -> Self {
        Self {
            parameter: parameter.to_string(),
            interval_ms,
        }
    }
}

/// What to read from the vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub parameters: Vec<PollTarget>,
    /// Read VIN, calibration ID and ECU name at session start
    pub read_vehicle_info: bool,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            parameters: vec![
                PollTarget::new("RPM", 200),
                PollTarget::new("SPEED", 200),
                PollTarget::new("ENGINE_LOAD", 500),
                PollTarget::new("COOLANT_TEMP", 2000),
            ],
            read_vehicle_info: true,
        }
    }
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub adapter: AdapterConfig,
    pub scheduler: SchedulerConfig,
    pub queue_capacity: usize,
    /// Attempts at reading a VIN that comes back with missing segments
    pub vin_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            scheduler: SchedulerConfig::default(),
            queue_capacity: DEFAULT_CAPACITY,
            vin_attempts: 3,
        }
    }
}

/// Monotonic millisecond timestamps anchored to wall-clock time at start
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    epoch_ms: u64,
    epoch: Instant,
}

impl SessionClock {
    fn start() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            epoch_ms,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.epoch.elapsed().as_millis() as u64
    }
}

/// Work submitted by a handle
enum Request {
    Read {
        id: ParameterId,
        reply: oneshot::Sender<ObdResult<Sample>>,
    },
    ReadDtcs {
        kind: DtcKind,
        reply: oneshot::Sender<ObdResult<Vec<TroubleCode>>>,
    },
    ClearDtcs {
        reply: oneshot::Sender<ObdResult<()>>,
    },
    FreezeFrame {
        id: ParameterId,
        frame: u8,
        reply: oneshot::Sender<ObdResult<Sample>>,
    },
    FreezeFrameDtc {
        frame: u8,
        reply: oneshot::Sender<ObdResult<Option<TroubleCode>>>,
    },
}

impl Request {
    fn priority(&self) -> Priority {
        match self {
            Request::ReadDtcs { .. } | Request::ClearDtcs { .. } => Priority::Urgent,
            _ => Priority::Normal,
        }
    }

    fn fail(self, err: ObdError) {
        // The caller may have given up waiting
        match self {
            Request::Read { reply, .. } | Request::FreezeFrame { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::ReadDtcs { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::ClearDtcs { reply } => {
                let _ = reply.send(Err(err));
            }
            Request::FreezeFrameDtc { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

enum Job {
    Poll(ParameterId),
    Request(Request),
}

fn first_message(response: &AdapterResponse) -> ObdResult<&[u8]> {
    response
        .messages
        .first()
        .map(Vec::as_slice)
        .ok_or_else(|| ObdError::MalformedResponse(format!("empty answer to {}", response.request)))
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a request to stop
    let _ = shutdown.wait_for(|stop| *stop).await;
}

struct Dispatcher<T: Transport> {
    session: AdapterSession<T>,
    scheduler: PollScheduler,
    recorder: SessionRecorder,
    queue: Arc<RequestQueue<Request>>,
    latest_tx: watch::Sender<HashMap<ParameterId, Sample>>,
    newest_tx: watch::Sender<Option<Sample>>,
    clock: SessionClock,
    served_queue_last: bool,
    recorded_state: ConnectionState,
}

impl<T: Transport> Dispatcher<T> {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Session {
        info!("Dispatcher started with {} polled parameters", self.scheduler.len());
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                job = self.next_job() => job,
            };
            let Some(job) = job else { break };

            let cancelled = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => true,
                _ = self.execute(job) => false,
            };
            if cancelled {
                debug!("In-flight request abandoned");
                break;
            }
            self.record_state();
        }
        self.teardown().await
    }

    /// Queued requests go first, but after serving one a due routine poll
    /// gets the next turn so a busy queue cannot starve polling.
    async fn next_job(&mut self) -> Option<Job> {
        loop {
            let connected = self.session.state().is_connected();
            let now = Instant::now();
            let routine = if connected {
                self.scheduler.select(now)
            } else {
                None
            };

            if routine.is_none() || !self.served_queue_last {
                if let Some(request) = self.queue.try_pop() {
                    self.served_queue_last = true;
                    return Some(Job::Request(request));
                }
            }
            if let Some(id) = routine {
                self.served_queue_last = false;
                return Some(Job::Poll(id));
            }

            let wake_at = match self.scheduler.next_due() {
                Some(due) if connected => due,
                _ => now + IDLE_WAIT,
            };
            tokio::select! {
                request = self.queue.pop() => {
                    self.served_queue_last = true;
                    return request.map(Job::Request);
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn execute(&mut self, job: Job) {
        match job {
            Job::Poll(id) => self.poll(id).await,
            Job::Request(request) => self.serve(request).await,
        }
    }

    async fn poll(&mut self, id: ParameterId) {
        let result = self.read_current(id).await;
        let now = Instant::now();
        match result {
            Ok(sample) => {
                self.scheduler.on_success(id, now);
                self.publish(sample);
            }
            Err(e) => {
                let delay = self.scheduler.on_failure(id, now);
                warn!(pid = %id, "Poll failed, next attempt in {}ms: {}", delay.as_millis(), e);
                self.record_missing(id, &e);
            }
        }
    }

    async fn serve(&mut self, request: Request) {
        match request {
            Request::Read { id, reply } => {
                let result = self.read_current(id).await;
                match &result {
                    Ok(sample) => self.publish(sample.clone()),
                    Err(e) => self.record_missing(id, e),
                }
                let _ = reply.send(result);
            }
            Request::ReadDtcs { kind, reply } => {
                let result = self.read_dtcs(kind).await;
                let _ = reply.send(result);
            }
            Request::ClearDtcs { reply } => {
                let result = self.session.send(&AdapterRequest::ClearDtcs).await.map(|_| ());
                match &result {
                    Ok(()) => {
                        info!("Trouble codes cleared");
                        self.recorder
                            .append_event(self.clock.now_ms(), SessionEvent::DtcsCleared);
                    }
                    Err(e) => warn!("Clearing trouble codes failed: {}", e),
                }
                let _ = reply.send(result);
            }
            Request::FreezeFrame { id, frame, reply } => {
                let result = self.read_freeze_frame(id, frame).await;
                let _ = reply.send(result);
            }
            Request::FreezeFrameDtc { frame, reply } => {
                let request = AdapterRequest::FreezeFrame { pid: 0x02, frame };
                let result = match self.session.send(&request).await {
                    Ok(response) => first_message(&response)
                        .and_then(|message| decode_freeze_frame_dtc(frame, message)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn read_current(&mut self, id: ParameterId) -> ObdResult<Sample> {
        let definition = lookup(id)?;
        let response = self
            .session
            .send(&AdapterRequest::CurrentData { pid: id.pid })
            .await?;
        decode_sample(definition, first_message(&response)?, self.clock.now_ms())
    }

    async fn read_dtcs(&mut self, kind: DtcKind) -> ObdResult<Vec<TroubleCode>> {
        let codes = match self.session.send(&AdapterRequest::ReadDtcs(kind)).await {
            Ok(response) => decode_dtc_response(kind, &response)?,
            // Some ECUs stay silent instead of answering with a zero count
            Err(ObdError::NoData(_)) => Vec::new(),
            Err(e) => {
                warn!("Reading {:?} trouble codes failed: {}", kind, e);
                return Err(e);
            }
        };
        info!("Read {} {:?} trouble codes", codes.len(), kind);
        self.recorder.append_event(
            self.clock.now_ms(),
            SessionEvent::DtcsRead {
                kind,
                codes: codes.clone(),
            },
        );
        Ok(codes)
    }

    async fn read_freeze_frame(&mut self, id: ParameterId, frame: u8) -> ObdResult<Sample> {
        let definition = lookup(ParameterId::current(id.pid))?;
        let response = self
            .session
            .send(&AdapterRequest::FreezeFrame { pid: id.pid, frame })
            .await?;
        decode_freeze_frame(definition, frame, first_message(&response)?, self.clock.now_ms())
    }

    fn publish(&mut self, sample: Sample) {
        self.latest_tx.send_modify(|latest| {
            latest.insert(sample.id, sample.clone());
        });
        self.newest_tx.send_replace(Some(sample.clone()));
        self.recorder.append_sample(sample);
    }

    fn record_missing(&mut self, id: ParameterId, err: &ObdError) {
        let name = lookup(id)
            .map(|d| d.short_name.to_string())
            .unwrap_or_else(|_| id.to_string());
        self.recorder.append_event(
            self.clock.now_ms(),
            SessionEvent::SampleMissing {
                id,
                name,
                reason: err.to_string(),
            },
        );
    }

    /// Log connection-level changes. `Busy` is a request in flight, not a
    /// change of connection.
    fn record_state(&mut self) {
        let state = match self.session.state() {
            ConnectionState::Busy => ConnectionState::Ready,
            state => state,
        };
        if state != self.recorded_state {
            self.recorded_state = state;
            self.recorder.append_event(
                self.clock.now_ms(),
                SessionEvent::ConnectionStateChanged { state },
            );
        }
    }

    async fn teardown(mut self) -> Session {
        self.session.abort().await;
        let pending = self.queue.close();
        if !pending.is_empty() {
            info!("Cancelling {} queued requests", pending.len());
        }
        for request in pending {
            request.fail(ObdError::Cancelled);
        }
        self.record_state();
        info!("Dispatcher stopped");
        self.recorder.finalize()
    }
}

struct Shared {
    id: Uuid,
    queue: Arc<RequestQueue<Request>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Session>>>,
    vehicle: VehicleSnapshot,
    supported: SupportedPids,
    stale_after_ms: HashMap<ParameterId, u64>,
    clock: SessionClock,
}

/// Caller-side view of a running session. Cheap to clone; every clone
/// submits to the same dispatcher.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    state: watch::Receiver<ConnectionState>,
    latest: watch::Receiver<HashMap<ParameterId, Sample>>,
    newest: watch::Receiver<Option<Sample>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    /// Identification read at session start
    pub fn vehicle(&self) -> &VehicleSnapshot {
        &self.shared.vehicle
    }

    /// Mode 01 PIDs the vehicle advertised
    pub fn supported(&self) -> &SupportedPids {
        &self.shared.supported
    }

    pub fn current_connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every adapter state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Newest sample this handle has not returned yet, without waiting
    pub fn poll_once(&mut self) -> Option<Sample> {
        match self.newest.has_changed() {
            Ok(true) => self.newest.borrow_and_update().clone(),
            _ => None,
        }
    }

    /// Last sample of `id`, flagged stale once older than its poll interval
    /// allows
    pub fn latest(&self, id: ParameterId) -> Option<Sample> {
        let sample = self.latest.borrow().get(&id).cloned()?;
        Some(self.age(sample))
    }

    /// Last sample of every parameter, ordered by PID
    pub fn latest_all(&self) -> Vec<Sample> {
        let mut samples: Vec<Sample> = self.latest.borrow().values().cloned().collect();
        samples.sort_by_key(|s| s.id);
        samples.into_iter().map(|s| self.age(s)).collect()
    }

    fn age(&self, sample: Sample) -> Sample {
        match self.shared.stale_after_ms.get(&sample.id) {
            Some(max_age) => sample.aged(self.shared.clock.now_ms(), *max_age),
            None => sample,
        }
    }

    /// Read `id` now, between routine polls
    pub async fn read_now(&self, id: ParameterId) -> ObdResult<Sample> {
        lookup(id)?;
        if !self.shared.supported.contains(id) {
            return Err(ObdError::NotSupported {
                mode: id.mode,
                pid: id.pid,
            });
        }
        self.submit(|reply| Request::Read { id, reply }).await
    }

    /// Stored trouble codes
    pub async fn request_dtcs(&self) -> ObdResult<Vec<TroubleCode>> {
        self.request_dtcs_of(DtcKind::Stored).await
    }

    pub async fn request_dtcs_of(&self, kind: DtcKind) -> ObdResult<Vec<TroubleCode>> {
        self.submit(|reply| Request::ReadDtcs { kind, reply }).await
    }

    /// Clear trouble codes and freeze frames. Waits for any in-flight
    /// request to finish first.
    pub async fn clear_dtcs(&self) -> ObdResult<()> {
        self.submit(|reply| Request::ClearDtcs { reply }).await
    }

    /// Value of `id` captured in freeze frame 0
    pub async fn read_freeze_frame(&self, id: ParameterId) -> ObdResult<Sample> {
        lookup(ParameterId::current(id.pid))?;
        self.submit(|reply| Request::FreezeFrame { id, frame: 0, reply })
            .await
    }

    /// Trouble code that stored freeze frame 0, if any
    pub async fn read_freeze_frame_dtc(&self) -> ObdResult<Option<TroubleCode>> {
        self.submit(|reply| Request::FreezeFrameDtc { frame: 0, reply })
            .await
    }

    async fn submit<R>(
        &self,
        request: impl FnOnce(oneshot::Sender<ObdResult<R>>) -> Request,
    ) -> ObdResult<R> {
        let (tx, rx) = oneshot::channel();
        let request = request(tx);
        let priority = request.priority();
        match self.shared.queue.push(request, priority) {
            Ok(Some(evicted)) => evicted.fail(ObdError::Dropped),
            Ok(None) => {}
            Err(PushError::Full(_)) => return Err(ObdError::QueueFull),
            Err(PushError::Closed(_)) => return Err(ObdError::Cancelled),
        }
        // A dropped sender means the request was abandoned mid-flight
        rx.await.unwrap_or(Err(ObdError::Cancelled))
    }

    /// Stop polling, cancel outstanding work and seal the session.
    pub async fn stop(&self) -> Result<Session, EngineError> {
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(EngineError::Stopped)?;
        info!("Stopping session {}", self.shared.id);
        self.shared.shutdown.send_replace(true);
        task.await
            .map_err(|e| EngineError::Dispatcher(e.to_string()))
    }
}

fn resolve_targets(vehicle: &VehicleConfig) -> Result<Vec<(ParameterId, Duration)>, EngineError> {
    vehicle
        .parameters
        .iter()
        .map(|target| {
            let definition = lookup_name(&target.parameter)
                .ok_or_else(|| EngineError::UnknownParameter(target.parameter.clone()))?;
            if target.interval_ms == 0 {
                return Err(EngineError::InvalidInterval(target.parameter.clone()));
            }
            Ok((definition.id, Duration::from_millis(target.interval_ms)))
        })
        .collect()
}

/// Follow the chain of supported-PID bitmaps (`0100`, `0120`, ...).
async fn discover_supported<T: Transport>(
    session: &mut AdapterSession<T>,
) -> ObdResult<SupportedPids> {
    let mut snapshot = SupportedPids::default();
    for base in BITMAP_BASES {
        let found = match session.send(&AdapterRequest::CurrentData { pid: base }).await {
            Ok(response) => decode_bitmap_response(base, &response)?,
            Err(ObdError::NoData(_)) if base > 0 => break,
            Err(e) => return Err(e),
        };
        snapshot = SupportedPids::from_pids(snapshot.iter().map(|id| id.pid).chain(found));
        if !snapshot.next_range_supported(base) {
            break;
        }
    }
    info!("Vehicle supports {} mode 01 PIDs", snapshot.len());
    Ok(snapshot)
}

async fn read_text<T: Transport>(
    session: &mut AdapterSession<T>,
    pid: u8,
    attempts: u32,
    decode: fn(&AdapterResponse) -> ObdResult<String>,
) -> Option<String> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if !session.state().is_connected() {
            return None;
        }
        let result = match session.send(&AdapterRequest::VehicleInfo { pid }).await {
            Ok(response) => decode(&response),
            Err(e) => Err(e),
        };
        match result {
            Ok(text) => return Some(text),
            Err(ObdError::IncompleteData(reason)) if attempt < attempts => {
                debug!(attempt, "Vehicle info 09{:02X} incomplete, retrying: {}", pid, reason);
            }
            Err(e) => {
                warn!("Vehicle info 09{:02X} unavailable: {}", pid, e);
                return None;
            }
        }
    }
    None
}

/// Connect to the adapter, learn what the vehicle supports and start
/// polling `vehicle.parameters` in the background.
///
/// Unknown parameter names fail before the adapter is touched. Parameters
/// the vehicle does not support are skipped with a warning.
pub async fn start_session<T>(
    transport: T,
    vehicle: &VehicleConfig,
    config: EngineConfig,
) -> Result<SessionHandle, EngineError>
where
    T: Transport + 'static,
{
    let targets = resolve_targets(vehicle)?;
    let clock = SessionClock::start();

    let mut session = AdapterSession::new(transport, config.adapter.clone());
    let state = session.subscribe_state();
    let connect_started_ms = clock.now_ms();
    let banner = session.initialize().await?;
    let ready_ms = clock.now_ms();

    let protocol = match session.describe_protocol().await {
        Ok(protocol) => Some(protocol),
        Err(e) => {
            warn!("Could not determine vehicle protocol: {}", e);
            None
        }
    };

    let supported = match discover_supported(&mut session).await {
        Ok(supported) => supported,
        Err(e) => {
            warn!("Supported PID discovery failed: {}", e);
            session.abort().await;
            return Err(e.into());
        }
    };

    let mut snapshot = VehicleSnapshot {
        protocol,
        adapter_version: Some(banner),
        ..Default::default()
    };
    if vehicle.read_vehicle_info {
        snapshot.vin = read_text(&mut session, VIN_PID, config.vin_attempts, decode_vin).await;
        snapshot.calibration_id =
            read_text(&mut session, CALIBRATION_ID_PID, 1, decode_calibration_id).await;
        snapshot.ecu_name = read_text(&mut session, ECU_NAME_PID, 1, decode_ecu_name).await;
    }
    if !session.state().is_connected() {
        session.abort().await;
        return Err(ObdError::Connection("adapter lost during session start".to_string()).into());
    }

    let scheduler = PollScheduler::new(config.scheduler, &targets, &supported, Instant::now());
    let stale_after_ms = scheduler
        .ids()
        .filter_map(|id| {
            scheduler
                .stale_after(id)
                .map(|max_age| (id, max_age.as_millis() as u64))
        })
        .collect();

    let mut recorder = SessionRecorder::new(snapshot.clone());
    for (timestamp_ms, state) in [
        (connect_started_ms, ConnectionState::Disconnected),
        (connect_started_ms, ConnectionState::Initializing),
        (ready_ms, ConnectionState::Ready),
    ] {
        recorder.append_event(timestamp_ms, SessionEvent::ConnectionStateChanged { state });
    }
    let id = recorder.id();

    let queue = Arc::new(RequestQueue::new(config.queue_capacity));
    let (latest_tx, latest) = watch::channel(HashMap::new());
    let (newest_tx, newest) = watch::channel(None);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher {
        session,
        scheduler,
        recorder,
        queue: queue.clone(),
        latest_tx,
        newest_tx,
        clock,
        served_queue_last: false,
        recorded_state: ConnectionState::Ready,
    };
    let task = tokio::spawn(dispatcher.run(shutdown_rx));

    info!(
        session = %id,
        vin = snapshot.vin.as_deref().unwrap_or("unknown"),
        "Session started"
    );
    Ok(SessionHandle {
        shared: Arc::new(Shared {
            id,
            queue,
            shutdown,
            task: Mutex::new(Some(task)),
            vehicle: snapshot,
            supported,
            stale_after_ms,
            clock,
        }),
        state,
        latest,
        newest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{DtcStatus, MockReply, MockTransport, ObdProtocol};
    use session_recorder::export_session;

    const RPM: ParameterId = ParameterId::current(0x0C);
    const SPEED: ParameterId = ParameterId::current(0x0D);
    const COOLANT: ParameterId = ParameterId::current(0x05);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn vehicle(parameters: &[(&str, u64)]) -> VehicleConfig {
        VehicleConfig {
            parameters: parameters
                .iter()
                .map(|(name, interval)| PollTarget::new(name, *interval))
                .collect(),
            read_vehicle_info: true,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            adapter: AdapterConfig {
                command_timeout_ms: 100,
                max_retries: 0,
                dead_channel_threshold: 100,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn count(mock: &MockTransport, command: &str) -> usize {
        mock.written().iter().filter(|c| *c == command).count()
    }

    fn connection_states(session: &Session) -> Vec<ConnectionState> {
        session
            .events()
            .filter_map(|(_, e)| match e {
                SessionEvent::ConnectionStateChanged { state } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_identifies_vehicle() {
        let mock = MockTransport::demo_vehicle();
        let handle = start_session(mock.clone(), &vehicle(&[]), EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(handle.current_connection_state(), ConnectionState::Ready);
        let snapshot = handle.vehicle();
        assert_eq!(snapshot.vin.as_deref(), Some("1D4GP00R55B123456"));
        assert_eq!(snapshot.calibration_id.as_deref(), Some("SW-ECM-0042"));
        assert_eq!(snapshot.ecu_name.as_deref(), Some("ECM-EngineControl"));
        assert_eq!(snapshot.protocol, Some(ObdProtocol::Iso15765_4Can11bit500));
        assert_eq!(snapshot.adapter_version.as_deref(), Some("ELM327 V1.5"));

        assert!(handle.supported().contains(RPM));
        assert!(handle.supported().contains(ParameterId::current(0x21)));
        assert!(!handle.supported().contains(ParameterId::current(0x22)));
        assert_eq!(
            &mock.written()[..9],
            ["ATZ", "ATE0", "ATSP0", "ATDPN", "0100", "0120", "0902", "0904", "090A"]
        );

        let session = handle.stop().await.unwrap();
        assert_eq!(session.vehicle().vin.as_deref(), Some("1D4GP00R55B123456"));
        assert_eq!(
            connection_states(&session),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Initializing,
                ConnectionState::Ready,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_rpm() {
        let mock = MockTransport::demo_vehicle();
        let handle = start_session(mock.clone(), &vehicle(&[("RPM", 200)]), EngineConfig::default())
            .await
            .unwrap();

        let sample = handle.read_now(RPM).await.unwrap();
        assert_eq!(sample.value, 1726.0);
        assert_eq!(sample.name, "RPM");
        assert_eq!(sample.unit, "rpm");

        tokio::time::sleep(ms(50)).await;
        let latest = handle.latest(RPM).unwrap();
        assert_eq!(latest.value, 1726.0);
        assert!(!latest.stale);

        let session = handle.stop().await.unwrap();
        let rows = export_session(&session);
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.parameter == "RPM" && r.value == 1726.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_at_configured_interval() {
        let mock = MockTransport::demo_vehicle();
        let handle = start_session(
            mock.clone(),
            &vehicle(&[("RPM", 200), ("COOLANT_TEMP", 1000)]),
            EngineConfig::default(),
        )
        .await
        .unwrap();

        tokio::time::sleep(ms(1050)).await;
        let rpm = count(&mock, "010C");
        let coolant = count(&mock, "0105");
        assert!((5..=7).contains(&rpm), "{rpm} RPM polls");
        assert!((1..=2).contains(&coolant), "{coolant} coolant polls");

        let latest = handle.latest_all();
        assert_eq!(latest.iter().map(|s| s.id).collect::<Vec<_>>(), vec![COOLANT, RPM]);
        assert_eq!(mock.overlaps(), 0);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_returns_each_sample_once() {
        let mock = MockTransport::demo_vehicle();
        let mut handle =
            start_session(mock, &vehicle(&[("SPEED", 500)]), EngineConfig::default())
                .await
                .unwrap();

        tokio::time::sleep(ms(10)).await;
        let sample = handle.poll_once().unwrap();
        assert_eq!(sample.id, SPEED);
        assert_eq!(sample.value, 50.0);
        assert!(handle.poll_once().is_none());

        tokio::time::sleep(ms(500)).await;
        assert!(handle.poll_once().is_some());
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_goes_stale_when_polls_stop_answering() {
        let mock = MockTransport::demo_vehicle();
        let handle = start_session(mock.clone(), &vehicle(&[("RPM", 200)]), fast_config())
            .await
            .unwrap();

        tokio::time::sleep(ms(10)).await;
        assert!(!handle.latest(RPM).unwrap().stale);

        mock.set("010C", MockReply::Silence);
        tokio::time::sleep(ms(1000)).await;
        let latest = handle.latest(RPM).unwrap();
        assert!(latest.stale);
        assert_eq!(latest.value, 1726.0);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_stored_trouble_codes() {
        let mock = MockTransport::demo_vehicle();
        let handle = start_session(mock, &vehicle(&[]), EngineConfig::default())
            .await
            .unwrap();

        let codes = handle.request_dtcs().await.unwrap();
        let names: Vec<_> = codes.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(names, vec!["P0133", "P0401"]);
        assert!(codes.iter().all(|c| c.status == DtcStatus::Confirmed));

        assert!(handle.request_dtcs_of(DtcKind::Pending).await.unwrap().is_empty());

        let session = handle.stop().await.unwrap();
        let reads = session
            .events()
            .filter(|(_, e)| matches!(e, SessionEvent::DtcsRead { .. }))
            .count();
        assert_eq!(reads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_waits_for_in_flight_poll() {
        let mock = MockTransport::demo_vehicle();
        mock.set(
            "010C",
            MockReply::Delayed(ms(300), "41 0C 1A F8".to_string()),
        );
        let handle = start_session(mock.clone(), &vehicle(&[("RPM", 1000)]), EngineConfig::default())
            .await
            .unwrap();

        let started = Instant::now();
        tokio::time::sleep(ms(10)).await;
        handle.clear_dtcs().await.unwrap();
        assert!(started.elapsed() >= ms(290));

        let written = mock.written();
        let poll = written.iter().position(|c| c == "010C").unwrap();
        let clear = written.iter().position(|c| c == "04").unwrap();
        assert!(poll < clear);
        assert_eq!(mock.overlaps(), 0);

        let session = handle.stop().await.unwrap();
        assert!(session
            .events()
            .any(|(_, e)| matches!(e, SessionEvent::DtcsCleared)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_producers_are_serialized() {
        let mock = MockTransport::demo_vehicle();
        mock.set("010D", MockReply::Delayed(ms(5), "41 0D 32".to_string()));
        mock.set("03", MockReply::Delayed(ms(5), "43 02 01 33 04 01".to_string()));
        let handle = start_session(
            mock.clone(),
            &vehicle(&[("RPM", 50), ("SPEED", 50)]),
            EngineConfig::default(),
        )
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    handle.read_now(SPEED).await.map(|_| ())
                } else {
                    handle.request_dtcs().await.map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(mock.overlaps(), 0);
        assert!(count(&mock, "03") >= 4);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_parameter_backs_off_without_starving_others() {
        let mock = MockTransport::demo_vehicle();
        mock.set("010C", MockReply::Silence);
        let handle = start_session(
            mock.clone(),
            &vehicle(&[("RPM", 200), ("SPEED", 200)]),
            fast_config(),
        )
        .await
        .unwrap();

        tokio::time::sleep(ms(3000)).await;
        // attempts at 0, ~500 and ~1400ms; the next waits 1600ms more
        let rpm = count(&mock, "010C");
        let speed = count(&mock, "010D");
        assert!((3..=4).contains(&rpm), "{rpm} RPM polls");
        assert!(speed >= 10, "{speed} speed polls");
        assert_eq!(handle.current_connection_state(), ConnectionState::Ready);
        assert!(handle.latest(RPM).is_none());

        let session = handle.stop().await.unwrap();
        let missing = session
            .events()
            .filter(|(_, e)| matches!(e, SessionEvent::SampleMissing { name, .. } if name == "RPM"))
            .count();
        assert_eq!(missing, rpm);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_channel_disconnects_and_stops_polling() {
        let mock = MockTransport::demo_vehicle();
        let mut config = fast_config();
        config.adapter.dead_channel_threshold = 3;
        let handle = start_session(mock.clone(), &vehicle(&[("RPM", 100)]), config)
            .await
            .unwrap();

        mock.set("010C", MockReply::Silence);
        tokio::time::sleep(ms(3000)).await;
        assert_eq!(handle.current_connection_state(), ConnectionState::Disconnected);
        assert!(mock.is_closed());

        let polls = count(&mock, "010C");
        tokio::time::sleep(ms(3000)).await;
        assert_eq!(count(&mock, "010C"), polls);
        assert!(matches!(
            handle.read_now(RPM).await,
            Err(ObdError::InvalidState { .. })
        ));

        let session = handle.stop().await.unwrap();
        assert_eq!(
            connection_states(&session),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Initializing,
                ConnectionState::Ready,
                ConnectionState::Disconnected,
            ]
        );
        let dead_at = session
            .events()
            .filter(|(_, e)| matches!(e, SessionEvent::ConnectionStateChanged { .. }))
            .map(|(t, _)| t)
            .last()
            .unwrap();
        assert!(session
            .events()
            .any(|(t, e)| t < dead_at && matches!(e, SessionEvent::SampleMissing { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_oldest_ordinary_request() {
        let mock = MockTransport::demo_vehicle();
        mock.set(
            "010C",
            MockReply::Delayed(ms(300), "41 0C 1A F8".to_string()),
        );
        let config = EngineConfig {
            queue_capacity: 2,
            ..Default::default()
        };
        let handle = start_session(mock.clone(), &vehicle(&[("RPM", 1000)]), config)
            .await
            .unwrap();

        // The routine RPM poll holds the channel for 300ms
        tokio::time::sleep(ms(10)).await;
        let oldest = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.read_now(SPEED).await })
        };
        tokio::time::sleep(ms(1)).await;
        let newer = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.read_now(SPEED).await })
        };
        tokio::time::sleep(ms(1)).await;
        let codes = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request_dtcs().await })
        };

        assert_eq!(oldest.await.unwrap(), Err(ObdError::Dropped));
        assert_eq!(codes.await.unwrap().unwrap().len(), 2);
        assert_eq!(newer.await.unwrap().unwrap().value, 50.0);
        assert_eq!(count(&mock, "010D"), 1);
        assert_eq!(mock.overlaps(), 0);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_and_queued_requests() {
        let mock = MockTransport::demo_vehicle();
        mock.set("010C", MockReply::Silence);
        let mut config = EngineConfig::default();
        config.adapter.command_timeout_ms = 10_000;
        config.adapter.max_retries = 0;
        let handle = start_session(mock.clone(), &vehicle(&[("RPM", 1000)]), config)
            .await
            .unwrap();

        tokio::time::sleep(ms(10)).await;
        let reader = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.read_now(SPEED).await })
        };
        tokio::time::sleep(ms(10)).await;

        let started = Instant::now();
        let session = handle.stop().await.unwrap();
        assert!(started.elapsed() < ms(100));
        assert_eq!(reader.await.unwrap(), Err(ObdError::Cancelled));
        assert!(mock.is_closed());
        assert_eq!(handle.current_connection_state(), ConnectionState::Disconnected);
        assert_eq!(session.samples().count(), 0);

        assert_eq!(handle.read_now(SPEED).await, Err(ObdError::Cancelled));
        assert!(matches!(handle.stop().await, Err(EngineError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_parameters_are_not_polled() {
        let mock = MockTransport::demo_vehicle();
        let handle = start_session(
            mock.clone(),
            &vehicle(&[("RPM", 200), ("FUEL_PRESSURE", 200)]),
            EngineConfig::default(),
        )
        .await
        .unwrap();

        tokio::time::sleep(ms(500)).await;
        assert_eq!(count(&mock, "010A"), 0);
        assert_eq!(
            handle.read_now(ParameterId::current(0x0A)).await,
            Err(ObdError::NotSupported { mode: 0x01, pid: 0x0A })
        );
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_parameter_fails_before_connecting() {
        let mock = MockTransport::demo_vehicle();
        let result = start_session(
            mock.clone(),
            &vehicle(&[("WARP_FACTOR", 100)]),
            EngineConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::UnknownParameter(name)) if name == "WARP_FACTOR"));
        assert!(mock.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure() {
        let result = start_session(MockTransport::new(), &vehicle(&[]), EngineConfig::default()).await;
        assert!(matches!(
            result,
            Err(EngineError::Obd(ObdError::Connection(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_frame() {
        let mock = MockTransport::demo_vehicle();
        let handle = start_session(mock, &vehicle(&[]), EngineConfig::default())
            .await
            .unwrap();

        let sample = handle.read_freeze_frame(COOLANT).await.unwrap();
        assert_eq!(sample.value, 83.0);
        assert_eq!(sample.id, ParameterId::new(0x02, 0x05));

        let code = handle.read_freeze_frame_dtc().await.unwrap().unwrap();
        assert_eq!(code.code, "P0133");
        handle.stop().await.unwrap();
    }

    #[test]
    fn test_config_from_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"adapter": {"command_timeout_ms": 250}, "queue_capacity": 8}"#)
                .unwrap();
        assert_eq!(config.adapter.command_timeout_ms, 250);
        assert_eq!(config.adapter.max_retries, 2);
        assert_eq!(config.queue_capacity, 8);

        let vehicle: VehicleConfig =
            serde_json::from_str(r#"{"parameters": [{"parameter": "RPM"}]}"#).unwrap();
        assert_eq!(vehicle.parameters[0].interval_ms, 1000);
        assert!(vehicle.read_vehicle_info);
    }
}
