use super::error::ControllerError;
use super::item::{Item, ItemBatch};
use super::memory::{MemGauge, MemoryProbe, ProcMemoryProbe};
use super::metrics::DROP_REASON_HEAP;
use super::priority::PriorityBuffer;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Downstream publisher capability. Invoked synchronously once per tick with
/// the drained batch; must not block longer than the drain interval budget
/// allows. An `Err` requeues the batch plus one synthetic failure item.
pub type DrainFn = Arc<dyn Fn(ItemBatch) -> Result<(), BoxError> + Send + Sync>;

/// How long a cached heap reading stays valid before the next admission
/// check refreshes it. Kept internal; staleness within this window is an
/// accepted trade for a cheap insert path.
const MEM_SNAPSHOT_TTL: Duration = Duration::from_secs(10);

/// Immutable configuration snapshot supplied once at construction.
#[derive(Clone)]
pub struct ControllerConf {
    /// Tick period of the drain loop.
    pub drain_interval: Duration,
    /// Upper bound on items drained per tick.
    pub max_batch_len: usize,
    /// Heap-pressure ceiling for `buf_insert`, in bytes. Zero disables the
    /// admission check.
    pub max_heap_alloc_bytes: u64,
    /// Publisher invoked with each drained batch.
    pub on_drain: DrainFn,
}

impl fmt::Debug for ControllerConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConf")
            .field("drain_interval", &self.drain_interval)
            .field("max_batch_len", &self.max_batch_len)
            .field("max_heap_alloc_bytes", &self.max_heap_alloc_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopped,
}

/// Owns one [`PriorityBuffer`] and runs its periodic drain loop.
///
/// Lifecycle: `Created → Running → Stopped`. [`Controller::start`] is valid
/// only on a freshly constructed controller and a stopped controller must
/// not be restarted; both are documented preconditions, not runtime errors.
pub struct Controller {
    conf: ControllerConf,
    buf: Arc<PriorityBuffer>,
    mem: MemGauge,
    state: State,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(conf: ControllerConf, buf: Arc<PriorityBuffer>) -> Self {
        Self::with_probe(conf, buf, Arc::new(ProcMemoryProbe))
    }

    /// Like [`Controller::new`] with an explicit memory probe. Tests inject
    /// fixed probes to simulate pressure.
    pub fn with_probe(
        conf: ControllerConf,
        buf: Arc<PriorityBuffer>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            conf,
            buf,
            mem: MemGauge::new(probe, MEM_SNAPSHOT_TTL),
            state: State::Created,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn buffer(&self) -> &Arc<PriorityBuffer> {
        &self.buf
    }

    /// Spawns the drain loop and returns without blocking. Precondition:
    /// the controller has never been started.
    pub fn start(&mut self) {
        if self.state != State::Created {
            debug_assert!(false, "start() on a {:?} controller", self.state);
            error!(state = ?self.state, "ignoring start() on an already used controller");
            return;
        }

        let buf = self.buf.clone();
        let conf = self.conf.clone();
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            drain_loop(buf, conf, cancel).await;
        }));
        self.state = State::Running;
    }

    /// Signals the drain loop to exit and waits for it. Any in-flight tick
    /// (including its callback) completes first; once `stop` returns no
    /// further drain can occur. No-op if already stopped.
    pub async fn stop(&mut self) {
        if self.state != State::Running {
            self.state = State::Stopped;
            return;
        }

        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "drain loop task panicked");
            }
        }
        self.state = State::Stopped;
    }

    /// Pressure-checked insert path for producers. Rejected items are
    /// counted as drops and never enter the buffer.
    pub fn buf_insert<I>(&self, items: I) -> Result<(), ControllerError>
    where
        I: IntoIterator<Item = Item>,
    {
        let items: Vec<Item> = items.into_iter().collect();
        self.admit(items.len())?;
        self.buf.insert(items)?;
        Ok(())
    }

    fn admit(&self, count: usize) -> Result<(), ControllerError> {
        let limit = self.conf.max_heap_alloc_bytes;
        if limit == 0 {
            return Ok(());
        }

        match self.mem.heap_alloc_bytes() {
            Some(usage) if usage > limit => {
                self.buf.metrics().inc_drops(DROP_REASON_HEAP, count as u64);
                Err(ControllerError::HeapAllocLimit {
                    usage_bytes: usage,
                    limit_bytes: limit,
                })
            }
            Some(_) => Ok(()),
            None => {
                // Backpressure is best effort: no reading means no rejection.
                debug!("memory probe returned no reading, admitting insert");
                Ok(())
            }
        }
    }
}

async fn drain_loop(buf: Arc<PriorityBuffer>, conf: ControllerConf, cancel: CancellationToken) {
    let start = tokio::time::Instant::now() + conf.drain_interval;
    let mut ticker = tokio::time::interval_at(start, conf.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => drain_once(&buf, &conf),
        }
    }
    debug!("drain loop exited");
}

fn drain_once(buf: &PriorityBuffer, conf: &ControllerConf) {
    let len = buf.len();
    if len == 0 {
        return;
    }

    let batch = buf.drain(len.min(conf.max_batch_len));
    if batch.is_empty() {
        // The whole drained prefix had aged out.
        return;
    }

    let size = batch.len();
    match (conf.on_drain)(batch.clone()) {
        Ok(()) => debug!(items = size, "batch delivered"),
        Err(err) => {
            warn!(error = %err, items = size, "drain callback failed, requeueing batch");
            let mut requeue = batch;
            requeue.push(Item::delivery_failure(err.as_ref()));
            if let Err(insert_err) = buf.insert(requeue) {
                error!(error = %insert_err, "failed to requeue undelivered batch");
            }
        }
    }
}
