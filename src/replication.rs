use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::checkpoint::AppliedCheckpoint;
use crate::config::{NodeConfig, Role};
use crate::error::{Error, Result};
use crate::log::{LogDebug, LogInfo, LogWarn};
use crate::log_file::{LogReader, LogWriter, MAX_PAYLOAD};
use crate::task_pool::TaskPool;
use crate::transport::{AppendLogRequest, AppendLogResponse, ReplicaClient};

pub const LOG_FILE_NAME: &str = "repl.log";
pub const APPLIED_FILE_NAME: &str = "applied.idx";

/// State machine apply function. Receives every entry exactly once, in
/// log order: on the follower as entries arrive, on either role during
/// crash-recovery replay. On the leader the caller has already performed
/// the operation before logging it, so live leader writes are not fed
/// back through this.
pub type ApplyFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Completion for the async write path. Fires exactly once.
pub type LogCallback = Box<dyn FnOnce(bool) + Send>;

/// Everything guarded by the one coarse mutex: the three offsets, the
/// degraded-mode flag, the append writer, and the pending-callback map.
///
/// Invariants while the lock is held:
///   0 <= synced <= current on the leader
///   0 <= applied <= current on both roles
///   current == applied == synced on the follower
///   the log file's on-disk length equals current
pub(crate) struct SharedState {
    pub(crate) role: Role,
    pub(crate) current: u32,
    pub(crate) synced: u32,
    pub(crate) applied: u32,
    /// The replicator has given up waiting on the follower; synchronous
    /// waits are no-ops until it catches back up.
    pub(crate) master_only: bool,
    pub(crate) exiting: bool,
    /// None until init opens the log.
    pub(crate) writer: Option<LogWriter>,
    /// Keyed by the next offset after the pending entry. Each callback is
    /// inserted once and removed once, by whichever of the replicator and
    /// the timeout fallback gets there first.
    pub(crate) pending: HashMap<u32, LogCallback>,
}

/// Snapshot of the replication offsets for logging, tests, and operators.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct SyncStatus {
    pub current: u32,
    pub synced: u32,
    pub applied: u32,
    pub master_only: bool,
    pub pending_callbacks: usize,
    pub is_leader: bool,
}

/// The replication core: a durable append-only log on the leader,
/// streamed to a single follower, with synchronous-with-timeout and
/// asynchronous-callback write paths and a degraded leader-only mode.
///
/// Construction is in three steps: `new`, `register_callback`, `init`.
/// `init` performs crash recovery and starts the background machinery, so
/// the callback must already be installed. Call `shutdown` before
/// dropping the last external handle; the replicator thread keeps the
/// core alive until it observes the exit flag.
pub struct ReplicatedLog {
    pub(crate) config: NodeConfig,
    peer: String,
    pub(crate) state: Mutex<SharedState>,
    /// Signalled when `current` advances (producer -> replicator).
    pub(crate) work_available: Condvar,
    /// Signalled when `synced` reaches `current` (replicator -> producer).
    pub(crate) log_done: Condvar,
    /// The random-access reader, used by recovery and then the
    /// replicator, strictly in that order.
    pub(crate) reader: Mutex<Option<LogReader>>,
    applier: Mutex<Option<ApplyFn>>,
    checkpoint: AppliedCheckpoint,
    tasks: TaskPool,
    pub(crate) client: Box<dyn ReplicaClient>,
    pub(crate) replicator: Mutex<Option<JoinHandle<()>>>,
    /// Back-pointer to our own Arc, for handing weak references to the
    /// replicator thread and the delayed tasks. Set once by `new`.
    weak_self: Mutex<Weak<ReplicatedLog>>,
}

impl ReplicatedLog {
    pub fn new(config: NodeConfig, client: Box<dyn ReplicaClient>) -> Result<Arc<ReplicatedLog>> {
        config.validate()?;
        let peer = config.peer()?.to_owned();
        let checkpoint = AppliedCheckpoint::new(config.data_dir.join(APPLIED_FILE_NAME));
        let role = config.role;
        let core = Arc::new(ReplicatedLog {
            config,
            peer,
            state: Mutex::new(SharedState {
                role,
                current: 0,
                synced: 0,
                applied: 0,
                master_only: false,
                exiting: false,
                writer: None,
                pending: HashMap::new(),
            }),
            work_available: Condvar::new(),
            log_done: Condvar::new(),
            reader: Mutex::new(None),
            applier: Mutex::new(None),
            checkpoint,
            tasks: TaskPool::new(2),
            client,
            replicator: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *core.weak_self.lock().unwrap() = Arc::downgrade(&core);
        Ok(core)
    }

    pub(crate) fn self_ptr(&self) -> Weak<ReplicatedLog> {
        self.weak_self.lock().unwrap().clone()
    }

    /// Installs the state machine apply function. Must precede `init`.
    pub fn register_callback(&self, apply: ApplyFn) {
        if self.state.lock().unwrap().writer.is_some() {
            fatal!("register_callback must be called before init");
        }
        *self.applier.lock().unwrap() = Some(apply);
    }

    /// Opens the log files, replays `[applied, synced)` into the state
    /// machine, and starts the replicator (leader) and the periodic
    /// status/checkpoint task. Recovery completes before this returns.
    pub fn init(&self) -> Result<()> {
        if self.applier.lock().unwrap().is_none() {
            return Err(Error::CallbackNotRegistered);
        }
        fs::create_dir_all(&self.config.data_dir)?;
        let log_path = self.config.data_dir.join(LOG_FILE_NAME);
        let (writer, disk_len) = LogWriter::open(&log_path, self.config.fsync_on_append)?;
        if disk_len > u32::max_value() as u64 {
            return Err(Error::CorruptLog(format!(
                "log length {} exceeds 32-bit offset space",
                disk_len
            )));
        }
        let current = disk_len as u32;
        let mut reader = LogReader::open(&log_path)?;
        let applied = self.checkpoint.load()?.unwrap_or(0);
        if applied > current {
            return Err(Error::CorruptLog(format!(
                "applied checkpoint {} is beyond the log end {}",
                applied, current
            )));
        }

        let role = {
            let mut st = self.state.lock().unwrap();
            if st.writer.is_some() {
                return Err(Error::AlreadyInitialized);
            }
            st.writer = Some(writer);
            st.current = current;
            st.synced = current;
            st.applied = applied;
            st.role
        };

        let replayed = self.replay(&mut reader, applied, current)?;
        self.state.lock().unwrap().applied = current;
        *self.reader.lock().unwrap() = Some(reader);
        log!(
            LogInfo,
            "init as {:?}: current={} ({} entries replayed from {})",
            role,
            current,
            replayed,
            applied
        );

        if role == Role::Leader {
            self.start_replicator();
        }
        self.schedule_status();
        Ok(())
    }

    /// Recovery replay: feed entries in `[from, to)` to the state
    /// machine. Any failed or misaligned read means the log is corrupt.
    fn replay(&self, reader: &mut LogReader, from: u32, to: u32) -> Result<usize> {
        let applier = self.applier.lock().unwrap();
        let apply = applier.as_ref().expect("checked in init");
        reader.seek(from);
        let mut count = 0;
        while reader.pos() < to {
            let at = reader.pos();
            let payload = reader
                .read_entry()
                .map_err(|e| Error::CorruptLog(format!("recovery read at {}: {}", at, e)))?;
            if reader.pos() > to {
                return Err(Error::CorruptLog(format!(
                    "entry at {} runs past the log end {}",
                    at, to
                )));
            }
            apply(&payload);
            count += 1;
        }
        Ok(count)
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().role == Role::Leader
    }

    pub fn status(&self) -> SyncStatus {
        let st = self.state.lock().unwrap();
        SyncStatus {
            current: st.current,
            synced: st.synced,
            applied: st.applied,
            master_only: st.master_only,
            pending_callbacks: st.pending.len(),
            is_leader: st.role == Role::Leader,
        }
    }

    /// Appends under the lock and returns the framed length. Log file
    /// write failures are fatal: a partial append would break the
    /// on-disk-length-equals-current invariant.
    fn append_entry_locked(&self, st: &mut SharedState, payload: &[u8]) -> u32 {
        if payload.len() as u64 > MAX_PAYLOAD as u64 {
            fatal!(
                "entry payload of {} bytes does not fit a 32-bit length prefix",
                payload.len()
            );
        }
        let writer = match st.writer.as_mut() {
            Some(w) => w,
            None => fatal!("log write before init"),
        };
        match writer.append(payload) {
            Ok(framed) => framed,
            Err(e) => fatal!("log file append failed: {}", e),
        }
    }

    pub(crate) fn advance(offset: u32, framed: u32) -> u32 {
        match offset.checked_add(framed) {
            Some(next) => next,
            None => fatal!("log grew past 32-bit offset space"),
        }
    }

    /// Synchronous write path. Appends locally, wakes the replicator and
    /// waits up to `timeout` for the follower to acknowledge everything
    /// up to and including this entry. Always returns true: a timeout is
    /// reported by entering leader-only mode, not by failing the caller;
    /// the local write is durable either way.
    pub fn log_sync(&self, entry: &[u8], timeout: Duration) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.role != Role::Leader {
            fatal!("log_sync called on a follower");
        }
        let last = st.current;
        let framed = self.append_entry_locked(&mut st, entry);
        st.current = Self::advance(last, framed);
        self.work_available.notify_all();

        // The follower was already behind when this entry was written;
        // acknowledge immediately and let the replicator catch it up.
        if st.master_only && st.synced < last {
            st.applied = st.current;
            return true;
        }

        let deadline = Instant::now() + timeout;
        while st.synced != st.current {
            if st.exiting {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                st.master_only = true;
                st.applied = st.current;
                log!(
                    LogWarn,
                    "follower did not acknowledge {} within {:?}; entering leader-only mode",
                    st.current,
                    timeout
                );
                return true;
            }
            let (guard, _) = self
                .log_done
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
        }
        if st.master_only {
            st.master_only = false;
            log!(LogInfo, "follower caught up; leaving leader-only mode");
        }
        true
    }

    /// Asynchronous write path. Appends locally and registers `callback`
    /// under the next offset after the entry; the replicator fires it
    /// once it has advanced past the entry, and a delayed fallback fires
    /// it (and enters leader-only mode) if the replicator takes longer
    /// than the configured async timeout. The callback fires exactly
    /// once, always with `true`.
    pub fn log_async(&self, entry: &[u8], callback: LogCallback) {
        let mut st = self.state.lock().unwrap();
        if st.role != Role::Leader {
            fatal!("log_async called on a follower");
        }
        let framed = self.append_entry_locked(&mut st, entry);
        let next = Self::advance(st.current, framed);
        st.current = next;

        if st.master_only && st.synced < st.current {
            st.applied = st.current;
            drop(st);
            callback(true);
            return;
        }

        st.pending.insert(next, callback);
        drop(st);
        self.work_available.notify_all();

        let weak = self.self_ptr();
        self.tasks
            .delay_task(self.config.async_timeout(), move || {
                if let Some(core) = weak.upgrade() {
                    core.process_callback(next, true);
                }
            });
    }

    /// Fires the callback registered under `next_offset`, if it is still
    /// pending; whichever of the replicator (`timeout_check = false`) and
    /// the timeout fallback (`timeout_check = true`) arrives first wins.
    /// The timeout winning means the replicator is lagging, so that path
    /// also enters leader-only mode.
    pub(crate) fn process_callback(&self, next_offset: u32, timeout_check: bool) {
        let mut st = self.state.lock().unwrap();
        let callback = match st.pending.remove(&next_offset) {
            Some(cb) => cb,
            None => return,
        };
        drop(st);
        callback(true);
        let mut st = self.state.lock().unwrap();
        if next_offset > st.applied {
            st.applied = next_offset;
        }
        if timeout_check {
            st.master_only = true;
            log!(
                LogWarn,
                "no acknowledgement for {} within {:?}; entering leader-only mode",
                next_offset,
                self.config.async_timeout()
            );
        }
    }

    /// Follower half of the AppendLog RPC. Accepts only the entry whose
    /// offset equals the local append position; anything else asks the
    /// leader to rewind (we are behind) or reports the request stale (we
    /// already have those bytes). Accepted entries are applied in-line,
    /// so `current == applied == synced` always holds here.
    pub fn append_log(&self, request: &AppendLogRequest) -> AppendLogResponse {
        let mut st = self.state.lock().unwrap();
        if st.role != Role::Follower {
            log!(LogWarn, "append_log received while leader; rejecting");
            return AppendLogResponse {
                success: false,
                offset: None,
                current: st.current,
            };
        }
        if request.offset > st.current {
            log!(
                LogInfo,
                "append at {} is ahead of local end {}; asking the leader to rewind",
                request.offset,
                st.current
            );
            return AppendLogResponse {
                success: false,
                offset: Some(st.current),
                current: st.current,
            };
        }
        if request.offset < st.current {
            log!(
                LogDebug,
                "stale append at {} (local end {})",
                request.offset,
                st.current
            );
            return AppendLogResponse {
                success: false,
                offset: None,
                current: st.current,
            };
        }

        let framed = self.append_entry_locked(&mut st, &request.log_data);
        {
            let applier = self.applier.lock().unwrap();
            match applier.as_ref() {
                Some(apply) => apply(&request.log_data),
                None => fatal!("append_log before init"),
            }
        }
        let next = Self::advance(st.current, framed);
        st.current = next;
        st.applied = next;
        st.synced = next;
        AppendLogResponse {
            success: true,
            offset: Some(next),
            current: next,
        }
    }

    /// Promotes this follower to leader after the old leader is presumed
    /// gone. `synced` drops to zero because the new leader does not know
    /// how much of its log the new follower holds; the replicator
    /// re-sends from the start and relies on the follower's rejections to
    /// fast-forward to the first offset it is missing.
    pub fn switch_to_leader(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.role == Role::Leader {
                log!(LogWarn, "switch_to_leader: already leader");
                return;
            }
            if st.writer.is_none() {
                fatal!("switch_to_leader before init");
            }
            st.role = Role::Leader;
            st.synced = 0;
        }
        {
            let mut reader = self.reader.lock().unwrap();
            if let Some(r) = reader.as_mut() {
                r.seek(0);
            }
        }
        // The stub keeps pointing at the other node of the pair, which is
        // the former leader if it comes back; drop any dead connection.
        self.client.rebind(&self.peer);
        log!(
            LogInfo,
            "taking over as leader; replicating from offset 0 to {}",
            self.peer
        );
        self.start_replicator();
    }

    fn schedule_status(&self) {
        let weak = self.self_ptr();
        self.tasks
            .delay_task(self.config.status_interval(), move || {
                if let Some(core) = weak.upgrade() {
                    if core.log_status() {
                        core.schedule_status();
                    }
                }
            });
    }

    /// One tick of the periodic task: a status line plus the applied
    /// checkpoint. Returns false once the core is exiting.
    fn log_status(&self) -> bool {
        let status = {
            let st = self.state.lock().unwrap();
            if st.exiting {
                return false;
            }
            SyncStatus {
                current: st.current,
                synced: st.synced,
                applied: st.applied,
                master_only: st.master_only,
                pending_callbacks: st.pending.len(),
                is_leader: st.role == Role::Leader,
            }
        };
        log!(
            LogInfo,
            "offsets: current={} synced={} applied={} pending_callbacks={}{}",
            status.current,
            status.synced,
            status.applied,
            status.pending_callbacks,
            if status.master_only { " [leader-only]" } else { "" }
        );
        if let Err(e) = self.checkpoint.store(status.applied) {
            log!(LogWarn, "applied checkpoint write failed: {}", e);
        }
        true
    }

    /// Graceful exit: wakes every waiter, joins the replicator, stops the
    /// timer pool and writes a final applied checkpoint. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.exiting {
                return;
            }
            st.exiting = true;
        }
        self.work_available.notify_all();
        self.log_done.notify_all();
        let handle = self.replicator.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.join();
        }
        self.tasks.shutdown();
        let (applied, initialized) = {
            let st = self.state.lock().unwrap();
            (st.applied, st.writer.is_some())
        };
        if initialized {
            if let Err(e) = self.checkpoint.store(applied) {
                log!(LogWarn, "final applied checkpoint write failed: {}", e);
            }
        }
        log!(LogInfo, "shutdown complete");
    }
}
