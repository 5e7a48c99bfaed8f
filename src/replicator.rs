use std::thread;
use std::time::Instant;

use crate::log::{LogDebug, LogError, LogInfo, LogWarn};
use crate::log_file::framed_len;
use crate::replication::ReplicatedLog;
use crate::transport::AppendLogRequest;

/// What the send of one entry decided about the loop.
enum SendOutcome {
    /// `synced` moved (forward on ack or fast-forward, backward on
    /// rewind); go look at the offsets again.
    Continue,
    /// The exit flag was raised while backing off.
    Exit,
}

impl ReplicatedLog {
    pub(crate) fn start_replicator(&self) {
        let core = match self.self_ptr().upgrade() {
            Some(c) => c,
            None => fatal!("start_replicator on a dropped core"),
        };
        let handle = thread::Builder::new()
            .name("replog-replicator".to_owned())
            .spawn(move || core.replicate_loop());
        let handle = match handle {
            Ok(h) => h,
            Err(e) => fatal!("could not spawn the replicator: {}", e),
        };
        let mut slot = self.replicator.lock().unwrap();
        if slot.is_some() {
            fatal!("replicator already running");
        }
        *slot = Some(handle);
    }

    /// Leader background task: wait for `current` to move past `synced`,
    /// stream the missing entries to the follower, reconcile on
    /// rejection, and signal `log_done` whenever the follower has
    /// everything.
    pub(crate) fn replicate_loop(&self) {
        log!(LogInfo, "replicator running against {:?}", self.config.peer().ok());
        loop {
            let send_offset = {
                let mut st = self.state.lock().unwrap();
                while st.synced == st.current && !st.exiting {
                    st = self.work_available.wait(st).unwrap();
                }
                if st.exiting {
                    log!(LogInfo, "replicator exiting");
                    return;
                }
                st.synced
            };
            match self.send_entry_at(send_offset) {
                SendOutcome::Continue => (),
                SendOutcome::Exit => {
                    log!(LogInfo, "replicator exiting");
                    return;
                }
            }
        }
    }

    /// Reads the entry at `send_offset` and pushes it to the follower,
    /// retrying forever across transport failures. Offsets change only
    /// under the state lock, which is not held across the I/O.
    fn send_entry_at(&self, send_offset: u32) -> SendOutcome {
        let payload = {
            let mut guard = self.reader.lock().unwrap();
            let reader = match guard.as_mut() {
                Some(r) => r,
                None => fatal!("replicator started before init"),
            };
            // The reader trails `synced`; a rewind or takeover shows up
            // here as a position mismatch.
            if reader.pos() != send_offset {
                reader.seek(send_offset);
            }
            match reader.read_entry() {
                Ok(p) => p,
                Err(e) => fatal!("replicator read at offset {} failed: {}", send_offset, e),
            }
        };
        let framed = framed_len(&payload);
        let request = AppendLogRequest {
            offset: send_offset,
            log_data: payload,
        };

        let response = loop {
            match self.client.append_log(&request) {
                Ok(r) => break r,
                Err(e) => {
                    log!(
                        LogWarn,
                        "append to follower failed: {}; retrying in {:?}",
                        e,
                        self.config.retry_backoff()
                    );
                    if !self.backoff() {
                        return SendOutcome::Exit;
                    }
                }
            }
        };

        if response.success {
            // Fire the pending callback for this entry first, then
            // advance under the lock.
            let acked = Self::advance(send_offset, framed);
            self.process_callback(acked, false);
            let mut st = self.state.lock().unwrap();
            st.synced = acked;
            if st.synced > st.applied {
                st.applied = st.synced;
            }
            if st.synced == st.current {
                if st.master_only {
                    st.master_only = false;
                    log!(LogInfo, "follower caught up; leaving leader-only mode");
                }
                self.log_done.notify_all();
            }
            return SendOutcome::Continue;
        }

        match response.offset {
            Some(rewind_to) => {
                // The follower is missing entries before this one; back
                // up and re-send from its end of log.
                let mut st = self.state.lock().unwrap();
                log!(
                    LogInfo,
                    "follower is at {}; rewinding synced from {}",
                    rewind_to,
                    st.synced
                );
                st.synced = rewind_to;
            }
            None => self.reconcile_stale(send_offset, response.current),
        }
        SendOutcome::Continue
    }

    /// The follower rejected the request as stale: it already holds bytes
    /// past `send_offset`. Its `current` tells us how far. Skipping what
    /// it has is safe while that is a prefix of our log; a follower ahead
    /// of everything we have means the logs diverged at the old leader's
    /// un-replicated tail, which cannot be repaired without truncation.
    fn reconcile_stale(&self, send_offset: u32, follower_current: u32) {
        let mut st = self.state.lock().unwrap();
        if follower_current <= st.current {
            log!(
                LogDebug,
                "follower already holds [{}..{}); fast-forwarding",
                send_offset,
                follower_current
            );
            st.synced = follower_current;
        } else {
            log!(
                LogError,
                "follower log end {} is ahead of ours ({}); the logs have diverged \
                 and cannot be reconciled without truncation",
                follower_current,
                st.current
            );
            st.synced = st.current;
        }
        if st.synced == st.current {
            if st.master_only {
                st.master_only = false;
                log!(LogInfo, "follower caught up; leaving leader-only mode");
            }
            self.log_done.notify_all();
        }
    }

    /// Transport-failure backoff, cancellable by shutdown so a graceful
    /// exit is bounded by at most one RPC timeout.
    fn backoff(&self) -> bool {
        let deadline = Instant::now() + self.config.retry_backoff();
        let mut st = self.state.lock().unwrap();
        loop {
            if st.exiting {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self
                .work_available
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
        }
    }
}
