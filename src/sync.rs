//! Snap-style contract bytecode syncer.
//!
//! The syncer downloads the bytecodes referenced by the already-synced
//! account space from a pool of remote peers, then heals the gaps the
//! chunked retrieval model left behind by feeding an external trie
//! reconstruction scheduler. Both phases share the same machinery: a single
//! event loop matches idle peers to pending work, issues capped batch
//! requests, validates replies against the request manifest and persists
//! the results, while per-request timers, peer drops and the cycle-wide
//! cancel signal race the deliveries.

use bytes::Bytes;
use ethereum_types::{BigEndianHash, H256, U256};
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::account::{slim_account_rlp, AccountTask, LeafSource, StateAccount};
use crate::constants::{
    IDEAL_BATCH_SIZE, MAX_CODE_REQUEST_COUNT, MAX_REQUEST_SIZE, MAX_TRIE_REQUEST_COUNT,
    PROGRESS_LOG_INTERVAL,
};
use crate::error::SyncError;
use crate::peer::SyncPeer;
use crate::progress::{fresh_account_tasks, SyncPending, SyncProgress};
use crate::rates::{MessageKind, RateTrackers, Tracker};
use crate::scheduler::{SchedulerError, SyncPath, TrieScheduler};
use crate::store::{
    read_sync_status, write_account_snapshot, write_code, write_storage_snapshot,
    write_sync_status, KeyValueStore, StoreError, WriteBatch,
};
use crate::utils::keccak256;

/// Capacity of the peer join/drop broadcast channels. Slow consumers may
/// miss notifications; the loop polls on wake-ups anyway.
const PEER_EVENT_BUFFER: usize = 16;

/// Events multiplexed by the sync event loop.
enum SyncEvent {
    /// A sync-phase request failed and needs reverting.
    Failed(Arc<CodeRequest>),
    /// A heal-phase request failed and needs reverting.
    HealFailed(Arc<CodeRequest>),
    /// A validated sync-phase response, ready for persistence.
    Delivered(CodeResponse),
    /// A validated heal-phase response, ready for the trie scheduler.
    HealDelivered(CodeResponse),
}

/// Work source a request drew its hashes from. Requests reference account
/// tasks by id; the loop resolves the id under its own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Task(u64),
    Healer,
}

/// One-shot timer racing a request's delivery. The flag arbitrates between
/// the timer task and a stopper; whoever flips it first wins.
struct RequestTimeout {
    fired: Arc<AtomicBool>,
    handle: AbortHandle,
}

impl RequestTimeout {
    /// Stops the timer, reporting whether it was stopped before firing. A
    /// false return means a timeout revert is already on its way.
    fn stop(&self) -> bool {
        let won = !self.fired.swap(true, Ordering::SeqCst);
        self.handle.abort();
        won
    }
}

/// An in-flight assignment of a batch of code hashes to one peer.
///
/// Requests and responses are handled concurrently with the main loop so
/// hash verification runs on the peer's task. Everything the off-loop
/// handlers need travels inside the request itself; the owning task is only
/// referenced by id and resolved on the loop.
struct CodeRequest {
    /// Peer to which this request is assigned.
    peer: String,
    /// Request id, unique within its ledger.
    id: u64,
    /// Timestamp when the request was sent.
    sent_at: Instant,
    /// Requested hashes in pending-set order; the canonical manifest that
    /// replies must follow.
    hashes: Vec<H256>,
    /// Work source the hashes were drawn from.
    source: Source,
    /// Queue delivering failures and validated responses to the loop.
    events: mpsc::Sender<SyncEvent>,
    /// Cycle-wide cancellation signal.
    cancel: CancellationToken,
    /// Set exactly once when the request reaches a terminal state.
    stale: CancellationToken,
    /// Delivery timeout, armed at issue.
    timeout: OnceLock<RequestTimeout>,
}

/// An already verified remote response, aligned with its request manifest.
struct CodeResponse {
    req: Arc<CodeRequest>,
    /// Parallel to the manifest; `None` marks a hash the peer didn't serve.
    codes: Vec<Option<Bytes>>,
}

/// Heal-phase work source, replenished on demand from the trie scheduler.
struct HealTask {
    scheduler: Arc<dyn TrieScheduler>,
    /// Trie node tasks currently queued for retrieval alongside the codes;
    /// the scheduler hands both kinds out together.
    trie_tasks: HashMap<H256, SyncPath>,
    /// Code hash tasks currently queued for retrieval.
    code_tasks: IndexSet<H256>,
}

/// Registry and ledger state guarded by the syncer's read-write lock.
#[derive(Default)]
struct SyncState {
    /// State root of the cycle being synced.
    root: H256,
    /// Flags that the sync phase is done and deliveries route to healing.
    snapped: bool,

    /// Currently active peers to download from.
    peers: HashMap<String, Arc<dyn SyncPeer>>,
    /// Peers that refused to serve state data during this cycle.
    stateless_peers: HashSet<String>,
    /// Peers without an in-flight sync-phase request.
    bytecode_idlers: HashSet<String>,
    /// Peers without an in-flight heal-phase request.
    bytecode_heal_idlers: HashSet<String>,

    /// Sync-phase requests currently running.
    bytecode_reqs: HashMap<u64, Arc<CodeRequest>>,
    /// Heal-phase requests currently running.
    bytecode_heal_reqs: HashMap<u64, Arc<CodeRequest>>,

    /// Account chunks still owing bytecodes.
    tasks: Vec<AccountTask>,
    /// Current heal task, rebuilt at every cycle start.
    healer: Option<HealTask>,

    bytecode_synced: u64,
    bytecode_bytes: u64,
    bytecode_heal_synced: u64,
    bytecode_heal_bytes: u64,
    /// Healed bytecodes the scheduler had already processed.
    bytecode_heal_dups: u64,
    /// Healed bytecodes the scheduler never requested.
    bytecode_heal_nops: u64,
}

/// Contract bytecode syncer over a snap-style request/response protocol.
///
/// Every network request has a variety of failure events:
///   - the peer disconnects after task assignment, failing the send,
///   - the peer disconnects after sending the request, before delivering,
///   - the peer stays connected but does not deliver a response in time,
///   - the peer delivers a stale response after a previous timeout,
///   - the peer delivers a refusal to serve the requested state.
///
/// All of those revert the request locally and reschedule its hashes onto
/// other peers; only cancellation and fatal store errors surface to the
/// caller of [`Syncer::sync`].
pub struct Syncer {
    db: Arc<dyn KeyValueStore>,
    /// Upstream source of the account leaves referencing the bytecodes.
    leaf_source: Arc<dyn LeafSource>,
    /// Message throughput rates for peers.
    rates: RateTrackers,
    /// Fields that can change outside of the loop task; never held across
    /// an await point.
    state: RwLock<SyncState>,

    peer_join: broadcast::Sender<String>,
    peer_drop: broadcast::Sender<String>,
    /// Lossy notification channel for possible sync progression.
    update_tx: mpsc::Sender<()>,
    update_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,

    /// Shared batch for persisting raw flat states during healing, flushed
    /// whenever it outgrows the ideal batch size.
    state_writer: Mutex<WriteBatch>,

    /// When the first cycle started.
    start_time: Mutex<Option<Instant>>,
    /// When the status was last reported.
    log_time: Mutex<Option<Instant>>,
}

impl Syncer {
    pub fn new(db: Arc<dyn KeyValueStore>, leaf_source: Arc<dyn LeafSource>) -> Self {
        let (update_tx, update_rx) = mpsc::channel(1);
        let (peer_join, _) = broadcast::channel(PEER_EVENT_BUFFER);
        let (peer_drop, _) = broadcast::channel(PEER_EVENT_BUFFER);
        Self {
            db,
            leaf_source,
            rates: RateTrackers::new(),
            state: RwLock::new(SyncState::default()),
            peer_join,
            peer_drop,
            update_tx,
            update_rx: tokio::sync::Mutex::new(update_rx),
            state_writer: Mutex::new(WriteBatch::new()),
            start_time: Mutex::new(None),
            log_time: Mutex::new(None),
        }
    }

    /// Injects a new data source into the syncer's peerset. The peer starts
    /// out idle in every phase, with its throughput estimate seeded from
    /// the median of the existing peers.
    pub fn register(&self, peer: Arc<dyn SyncPeer>) -> Result<(), SyncError> {
        let id = peer.id();
        {
            let mut state = self.state.write();
            if state.peers.contains_key(&id) {
                error!(peer = %id, "Peer already registered");
                return Err(SyncError::AlreadyRegistered);
            }
            state.peers.insert(id.clone(), peer);
            state.bytecode_idlers.insert(id.clone());
            state.bytecode_heal_idlers.insert(id.clone());
        }
        self.rates.track(
            &id,
            Tracker::new(self.rates.mean_capacities(), self.rates.median_round_trip()),
        );
        // Notify any active sync that a new peer can be assigned data.
        let _ = self.peer_join.send(id);
        Ok(())
    }

    /// Removes a peer from the syncer's peerset. Any requests in flight to
    /// it are reverted by the event loop through the drop notification.
    pub fn unregister(&self, id: &str) -> Result<(), SyncError> {
        {
            let mut state = self.state.write();
            if !state.peers.contains_key(id) {
                error!(peer = %id, "Peer not registered");
                return Err(SyncError::NotRegistered);
            }
            state.peers.remove(id);
            state.stateless_peers.remove(id);
            state.bytecode_idlers.remove(id);
            state.bytecode_heal_idlers.remove(id);
        }
        self.rates.untrack(id);
        let _ = self.peer_drop.send(id.to_string());
        Ok(())
    }

    /// Returns the persisted sync statistics plus the ephemeral heal
    /// backlog that never hits the database.
    pub fn progress(&self) -> (SyncProgress, SyncPending) {
        let state = self.state.read();
        (
            SyncProgress {
                tasks: Vec::new(),
                bytecode_synced: state.bytecode_synced,
                bytecode_bytes: state.bytecode_bytes,
                bytecode_heal_synced: state.bytecode_heal_synced,
                bytecode_heal_bytes: state.bytecode_heal_bytes,
            },
            SyncPending {
                bytecode_heal_pending: state
                    .healer
                    .as_ref()
                    .map_or(0, |healer| healer.code_tasks.len() as u64),
            },
        )
    }

    /// Starts (or resumes) a sync cycle for the given state root: downloads
    /// every bytecode the account space references, then drives the heal
    /// scheduler until nothing is pending. Progress is checkpointed on the
    /// way out whatever the outcome.
    pub async fn sync(
        &self,
        root: H256,
        scheduler: Arc<dyn TrieScheduler>,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        {
            let mut state = self.state.write();
            state.root = root;
            state.healer = Some(HealTask {
                scheduler,
                trie_tasks: HashMap::new(),
                code_tasks: IndexSet::new(),
            });
            // Stateless markers only last one cycle; the peers may have
            // caught up with the chain since.
            state.stateless_peers.clear();
        }
        self.start_time.lock().get_or_insert_with(Instant::now);

        self.load_sync_status()?;
        {
            let state = self.state.read();
            let heal_pending = state
                .healer
                .as_ref()
                .map_or(0, |healer| healer.scheduler.pending());
            if state.tasks.is_empty() && heal_pending == 0 {
                debug!("Bytecode sync already completed");
                return Ok(());
            }
        }
        debug!(%root, "Starting bytecode sync cycle");
        let result = self.run_cycle(&cancel).await;

        // Persist progress and pending flat states independent of failure,
        // then clear the ledgers so future packets for this cycle get
        // disregarded.
        self.save_sync_status();
        self.flush_state_writer();
        self.report(true);
        {
            let mut state = self.state.write();
            state.bytecode_reqs.clear();
            state.bytecode_heal_reqs.clear();
            debug!(
                %root,
                heal_dups = state.bytecode_heal_dups,
                heal_nops = state.bytecode_heal_nops,
                "Terminating bytecode sync cycle"
            );
        }
        result
    }

    /// The event loop: assign work, then block until something changes.
    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let mut peer_join = self.peer_join.subscribe();
        let mut peer_drop = self.peer_drop.subscribe();

        // Per-cycle event queue. The sender rides along inside each issued
        // request, so a request surviving from an older cycle cannot
        // deliver into this one.
        let (events_tx, mut events_rx) = mpsc::channel::<SyncEvent>(1);

        let mut update_rx = self.update_rx.lock().await;
        while update_rx.try_recv().is_ok() {}

        loop {
            // Remove all completed tasks and terminate if everything's done.
            self.clean_account_tasks();
            {
                let state = self.state.read();
                let heal_pending = state
                    .healer
                    .as_ref()
                    .map_or(0, |healer| healer.scheduler.pending());
                if state.tasks.is_empty() && heal_pending == 0 {
                    return Ok(());
                }
            }
            // Assign all the data retrieval tasks to any free peers.
            self.assign_bytecode_tasks(&events_tx, cancel);
            if self.state.read().tasks.is_empty() {
                // Sync phase done, run the heal phase.
                self.assign_bytecode_heal_tasks(&events_tx, cancel);
            }
            // Wait for something to happen and handle exactly one event.
            tokio::select! {
                _ = update_rx.recv() => {
                    // Something happened (delivery, timeout, revert);
                    // recheck the tasks.
                }
                _ = peer_join.recv() => {
                    // A new peer joined, try to schedule it new tasks.
                }
                dropped = peer_drop.recv() => {
                    if let Ok(peer_id) = dropped {
                        self.revert_peer_requests(&peer_id);
                    }
                }
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                event = events_rx.recv() => match event {
                    Some(SyncEvent::Failed(req)) | Some(SyncEvent::HealFailed(req)) => {
                        self.revert_code_request(&req);
                    }
                    Some(SyncEvent::Delivered(res)) => self.process_bytecode_response(res)?,
                    Some(SyncEvent::HealDelivered(res)) => {
                        self.process_bytecode_heal_response(res)?
                    }
                    None => {}
                },
            }
            self.report(false);
        }
    }

    /// Attempts to match idle peers to pending sync-phase code retrievals.
    /// A single pass: one request per task, fastest idle peers first.
    fn assign_bytecode_tasks(
        &self,
        events: &mpsc::Sender<SyncEvent>,
        cancel: &CancellationToken,
    ) {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let target_ttl = self.rates.target_timeout();
        let mut idlers: Vec<(String, u64)> = state
            .bytecode_idlers
            .iter()
            .filter(|id| !state.stateless_peers.contains(*id))
            .map(|id| {
                (
                    id.clone(),
                    self.rates.capacity(id, MessageKind::ByteCodes, target_ttl),
                )
            })
            .collect();
        if idlers.is_empty() {
            return;
        }
        // Highest capacity first, peer id as the deterministic tie-break.
        idlers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut idlers = idlers.into_iter();

        let SyncState {
            tasks,
            peers,
            bytecode_reqs,
            bytecode_idlers,
            ..
        } = state;
        for task in tasks.iter_mut() {
            // Skip tasks that are already retrieving (or done with) all
            // their codes.
            if task.code_tasks.is_empty() {
                continue;
            }
            // No idle peer left; all were assigned (or are stateless).
            let Some((idle, cap)) = idlers.next() else {
                return;
            };
            let Some(peer) = peers.get(&idle).cloned() else {
                continue;
            };
            let cap = (cap as usize).min(MAX_CODE_REQUEST_COUNT);
            let count = cap.min(task.code_tasks.len());
            let hashes: Vec<H256> = task.code_tasks.drain(..count).collect();
            bytecode_idlers.remove(&idle);
            self.launch_request(
                bytecode_reqs,
                peer,
                idle,
                hashes,
                Source::Task(task.id),
                events,
                cancel,
            );
        }
    }

    /// Attempts to match idle peers to bytecode requests needed to heal the
    /// trie gaps caused by the chunked retrieval model, topping the queue
    /// up from the external scheduler first.
    fn assign_bytecode_heal_tasks(
        &self,
        events: &mpsc::Sender<SyncEvent>,
        cancel: &CancellationToken,
    ) {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let target_ttl = self.rates.target_timeout();
        let mut idlers: Vec<(String, u64)> = state
            .bytecode_heal_idlers
            .iter()
            .filter(|id| !state.stateless_peers.contains(*id))
            .map(|id| {
                (
                    id.clone(),
                    self.rates.capacity(id, MessageKind::ByteCodes, target_ttl),
                )
            })
            .collect();
        if idlers.is_empty() {
            return;
        }
        idlers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut idlers = idlers.into_iter();

        let SyncState {
            healer,
            peers,
            bytecode_heal_reqs,
            bytecode_heal_idlers,
            ..
        } = state;
        let Some(healer) = healer.as_mut() else {
            return;
        };
        while !healer.code_tasks.is_empty() || healer.scheduler.pending() > 0 {
            // The scheduler hands trie nodes and codes out together, so the
            // queues are refilled combined.
            let have = healer.trie_tasks.len() + healer.code_tasks.len();
            let want = MAX_TRIE_REQUEST_COUNT + MAX_CODE_REQUEST_COUNT;
            if have < want {
                let missing = healer.scheduler.missing(want - have);
                for (hash, path) in missing.nodes {
                    healer.trie_tasks.insert(hash, path);
                }
                for hash in missing.codes {
                    healer.code_tasks.insert(hash);
                }
            }
            // All remaining heal tasks are trienodes or already in flight.
            if healer.code_tasks.is_empty() {
                return;
            }
            let Some((idle, cap)) = idlers.next() else {
                return;
            };
            let Some(peer) = peers.get(&idle).cloned() else {
                continue;
            };
            let cap = (cap as usize).min(MAX_CODE_REQUEST_COUNT);
            let count = cap.min(healer.code_tasks.len());
            let hashes: Vec<H256> = healer.code_tasks.drain(..count).collect();
            bytecode_heal_idlers.remove(&idle);
            self.launch_request(
                bytecode_heal_reqs,
                peer,
                idle,
                hashes,
                Source::Healer,
                events,
                cancel,
            );
        }
    }

    /// Allocates a unique request id, arms the delivery timeout and fires
    /// the wire request from its own task; the dispatcher never blocks on
    /// peer IO.
    #[allow(clippy::too_many_arguments)]
    fn launch_request(
        &self,
        ledger: &mut HashMap<u64, Arc<CodeRequest>>,
        peer: Arc<dyn SyncPeer>,
        peer_id: String,
        hashes: Vec<H256>,
        source: Source,
        events: &mpsc::Sender<SyncEvent>,
        cancel: &CancellationToken,
    ) {
        // Unique non-zero 63-bit request id within this ledger.
        let mut reqid = rand::random::<u64>() >> 1;
        while reqid == 0 || ledger.contains_key(&reqid) {
            reqid = rand::random::<u64>() >> 1;
        }
        let req = Arc::new(CodeRequest {
            peer: peer_id,
            id: reqid,
            sent_at: Instant::now(),
            hashes,
            source,
            events: events.clone(),
            cancel: cancel.clone(),
            stale: CancellationToken::new(),
            timeout: OnceLock::new(),
        });

        // Arm the timeout before the request becomes visible. The timer only
        // schedules the revert; the loop executes it.
        let ttl = self.rates.target_timeout();
        let fired = Arc::new(AtomicBool::new(false));
        let timer = tokio::spawn({
            let req = req.clone();
            let fired = fired.clone();
            let rates = self.rates.clone();
            async move {
                tokio::time::sleep(ttl).await;
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                debug!(peer = %req.peer, reqid = req.id, "Bytecode request timed out");
                rates.update(&req.peer, MessageKind::ByteCodes, ttl, 0);
                schedule_revert(failed_event(req.clone()), &req).await;
            }
        });
        let _ = req.timeout.set(RequestTimeout {
            fired,
            handle: timer.abort_handle(),
        });

        ledger.insert(reqid, req.clone());

        tokio::spawn(async move {
            if let Err(err) = peer
                .request_byte_codes(reqid, req.hashes.clone(), MAX_REQUEST_SIZE)
                .await
            {
                debug!(peer = %req.peer, reqid = req.id, %err, "Failed to request bytecodes");
                schedule_revert(failed_event(req.clone()), &req).await;
            }
        });
    }

    /// Callback to invoke when a batch of contract bytecodes is received
    /// from a remote peer. Routed to the sync or heal handler depending on
    /// whether the sync phase is still running.
    pub async fn on_byte_codes(
        &self,
        peer_id: &str,
        request_id: u64,
        bytecodes: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        let snapped = self.state.read().snapped;
        self.on_byte_codes_for(peer_id, request_id, bytecodes, snapped)
            .await
    }

    async fn on_byte_codes_for(
        &self,
        peer_id: &str,
        request_id: u64,
        bytecodes: Vec<Bytes>,
        heal: bool,
    ) -> Result<(), SyncError> {
        let size: usize = bytecodes.iter().map(|code| code.len()).sum();
        trace!(
            peer = %peer_id,
            reqid = request_id,
            count = bytecodes.len(),
            bytes = size,
            heal,
            "Delivering set of bytecodes"
        );

        // Whatever the reply turns out to be, the peer is idle again and the
        // loop should recheck its assignments.
        let req = {
            let mut state = self.state.write();
            if state.peers.contains_key(peer_id) {
                let idlers = if heal {
                    &mut state.bytecode_heal_idlers
                } else {
                    &mut state.bytecode_idlers
                };
                idlers.insert(peer_id.to_string());
            }
            self.notify_update();
            let ledger = if heal {
                &mut state.bytecode_heal_reqs
            } else {
                &mut state.bytecode_reqs
            };
            match ledger.remove(&request_id) {
                Some(req) => req,
                None => {
                    // Request stale, perhaps the peer timed out but came
                    // through in the end.
                    warn!(peer = %peer_id, reqid = request_id, "Unexpected bytecode packet");
                    return Ok(());
                }
            }
        };
        self.rates.update(
            peer_id,
            MessageKind::ByteCodes,
            req.sent_at.elapsed(),
            bytecodes.len(),
        );

        // If the timer beat the delivery, the scheduled revert owns the
        // request from here on.
        match req.timeout.get() {
            Some(timeout) if timeout.stop() => {}
            _ => return Ok(()),
        }

        // An empty reply signals the peer does not have the requested state.
        if bytecodes.is_empty() {
            debug!(peer = %peer_id, reqid = request_id, "Peer rejected bytecode request");
            self.state
                .write()
                .stateless_peers
                .insert(peer_id.to_string());
            schedule_revert(failed_event(req.clone()), &req).await;
            return Ok(());
        }

        let codes = match cross_reference_bytecodes(&req.hashes, &bytecodes) {
            Ok(codes) => codes,
            Err(err) => {
                warn!(peer = %peer_id, reqid = request_id, "Unexpected bytecodes in reply");
                schedule_revert(failed_event(req.clone()), &req).await;
                return Err(err);
            }
        };

        // Response validated, hand it to the loop for filling.
        let response = CodeResponse {
            req: req.clone(),
            codes,
        };
        let event = match req.source {
            Source::Healer => SyncEvent::HealDelivered(response),
            Source::Task(_) => SyncEvent::Delivered(response),
        };
        tokio::select! {
            _ = req.events.send(event) => {}
            _ = req.cancel.cancelled() => {}
            _ = req.stale.cancelled() => {}
        }
        Ok(())
    }

    /// Locates all requests currently assigned to a particular peer and
    /// reverts them, rescheduling the hashes for others to fulfill.
    fn revert_peer_requests(&self, peer_id: &str) {
        // Gather the requests under the lock, revert outside it.
        let reqs: Vec<Arc<CodeRequest>> = {
            let state = self.state.read();
            state
                .bytecode_reqs
                .values()
                .chain(state.bytecode_heal_reqs.values())
                .filter(|req| req.peer == peer_id)
                .cloned()
                .collect()
        };
        for req in reqs {
            self.revert_code_request(&req);
        }
    }

    /// Cleans up a failed request and returns its whole manifest to the
    /// owning work source for reassignment.
    ///
    /// This runs on the event loop task; off-loop threads must post a
    /// failure event through [`schedule_revert`] instead.
    fn revert_code_request(&self, req: &Arc<CodeRequest>) {
        if req.stale.is_cancelled() {
            trace!(peer = %req.peer, reqid = req.id, "Bytecode request already settled");
            return;
        }
        req.stale.cancel();
        debug!(peer = %req.peer, reqid = req.id, "Reverting bytecode request");

        if let Some(timeout) = req.timeout.get() {
            timeout.stop();
        }
        {
            let mut state = self.state.write();
            match req.source {
                Source::Task(task_id) => {
                    state.bytecode_reqs.remove(&req.id);
                    if let Some(task) = state.tasks.iter_mut().find(|task| task.id == task_id) {
                        for hash in &req.hashes {
                            task.code_tasks.insert(*hash);
                        }
                    }
                }
                Source::Healer => {
                    state.bytecode_heal_reqs.remove(&req.id);
                    if let Some(healer) = state.healer.as_mut() {
                        for hash in &req.hashes {
                            healer.code_tasks.insert(*hash);
                        }
                    }
                }
            }
        }
        self.notify_update();
    }

    /// Integrates an already validated bytecode response into its account
    /// task and persists the delivered blobs.
    fn process_bytecode_response(&self, res: CodeResponse) -> Result<(), SyncError> {
        // Lost the race against a concurrent revert; the hashes are already
        // back in the pending set.
        if res.req.stale.is_cancelled() {
            return Ok(());
        }
        res.req.stale.cancel();

        let Source::Task(task_id) = res.req.source else {
            return Ok(());
        };
        let mut batch = WriteBatch::new();
        let mut codes = 0u64;
        let mut bytes = 0u64;
        {
            let mut state = self.state.write();
            let Some(task) = state.tasks.iter_mut().find(|task| task.id == task_id) else {
                warn!(reqid = res.req.id, "Bytecode response for unknown task");
                return Ok(());
            };
            for (i, hash) in res.req.hashes.iter().enumerate() {
                match &res.codes[i] {
                    // Undelivered code, reschedule it for another peer.
                    None => {
                        task.code_tasks.insert(*hash);
                    }
                    Some(code) => {
                        codes += 1;
                        bytes += code.len() as u64;
                        write_code(&mut batch, *hash, code);
                    }
                }
            }
        }
        self.db.write(batch)?;

        // Only count the codes and unmark the accounts once the batch is
        // safely in the store.
        let mut state = self.state.write();
        state.bytecode_synced += codes;
        state.bytecode_bytes += bytes;
        if let Some(task) = state.tasks.iter_mut().find(|task| task.id == task_id) {
            for (i, hash) in res.req.hashes.iter().enumerate() {
                if res.codes[i].is_none() {
                    continue;
                }
                // Several accounts may declare the same code; unmark each.
                for (j, leaf) in task.leaves.iter().enumerate() {
                    if task.need_code[j] && leaf.code_hash == *hash {
                        task.need_code[j] = false;
                        task.pend -= 1;
                    }
                }
            }
            if task.pend == 0 && task.code_tasks.is_empty() {
                debug!(task = task.id, "Account task fully synced");
                task.done = true;
            }
        }
        drop(state);
        debug!(count = codes, bytes, "Persisted set of bytecodes");
        Ok(())
    }

    /// Integrates an already validated bytecode response into the healer
    /// task and commits the scheduler's staged writes.
    fn process_bytecode_heal_response(&self, res: CodeResponse) -> Result<(), SyncError> {
        if res.req.stale.is_cancelled() {
            return Ok(());
        }
        res.req.stale.cancel();

        let mut batch = WriteBatch::new();
        let mut synced = 0u64;
        let mut bytes = 0u64;
        let mut dups = 0u64;
        let mut nops = 0u64;
        {
            let mut state = self.state.write();
            let Some(healer) = state.healer.as_mut() else {
                return Ok(());
            };
            for (i, hash) in res.req.hashes.iter().enumerate() {
                match &res.codes[i] {
                    // Undelivered code, reschedule it for another peer.
                    None => {
                        healer.code_tasks.insert(*hash);
                    }
                    Some(code) => {
                        synced += 1;
                        bytes += code.len() as u64;
                        match healer.scheduler.process(*hash, code.clone()) {
                            Ok(()) => {}
                            Err(SchedulerError::AlreadyProcessed) => dups += 1,
                            Err(SchedulerError::NotRequested) => nops += 1,
                            Err(err) => {
                                // The blob already passed the hash check;
                                // this is a scheduler-internal race, not
                                // peer misbehaviour.
                                error!(%hash, %err, "Invalid bytecode processed");
                            }
                        }
                    }
                }
            }
            if let Err(err) = healer.scheduler.commit(&mut batch) {
                error!(%err, "Failed to commit healing data");
            }
        }
        let flushed = batch.value_size();
        self.db.write(batch)?;

        let mut state = self.state.write();
        state.bytecode_heal_synced += synced;
        state.bytecode_heal_bytes += bytes;
        state.bytecode_heal_dups += dups;
        state.bytecode_heal_nops += nops;
        drop(state);
        debug!(bytes = flushed, "Persisted set of healing data");
        Ok(())
    }

    /// Callback to invoke when a flat state (account or storage slot row)
    /// is downloaded during healing. The rows are persisted blindly and get
    /// fixed up by the later generation stage.
    pub fn on_heal_state(&self, paths: &[Vec<u8>], value: &[u8]) -> Result<(), StoreError> {
        if paths.len() == 1 && paths[0].len() == 32 {
            // Account row; entries that don't decode as accounts are skipped.
            if let Ok(account) = rlp::decode::<StateAccount>(value) {
                let blob = slim_account_rlp(&account);
                let mut writer = self.state_writer.lock();
                write_account_snapshot(&mut writer, H256::from_slice(&paths[0]), &blob);
            }
        }
        if paths.len() == 2 && paths[0].len() == 32 && paths[1].len() == 32 {
            let mut writer = self.state_writer.lock();
            write_storage_snapshot(
                &mut writer,
                H256::from_slice(&paths[0]),
                H256::from_slice(&paths[1]),
                value,
            );
        }
        let flushable = {
            let mut writer = self.state_writer.lock();
            if writer.value_size() > IDEAL_BATCH_SIZE {
                Some(std::mem::take(&mut *writer))
            } else {
                None
            }
        };
        if let Some(batch) = flushable {
            self.db.write(batch)?;
        }
        Ok(())
    }

    /// Removes account tasks that have completed all their bytecode work
    /// and flips the syncer into the heal phase when none remain.
    fn clean_account_tasks(&self) {
        let mut state = self.state.write();
        if state.tasks.is_empty() {
            return;
        }
        state.tasks.retain(|task| !task.done);
        if state.tasks.is_empty() {
            state.snapped = true;
        }
    }

    /// Retrieves a previously aborted sync status from the store, or
    /// generates a fresh retrieval plan if none is available, then rebuilds
    /// the bytecode work queues from the leaf source.
    fn load_sync_status(&self) -> Result<(), SyncError> {
        let mut tasks = Vec::new();
        let mut loaded = false;
        if let Some(status) = read_sync_status(self.db.as_ref())? {
            match serde_json::from_slice::<SyncProgress>(&status) {
                Ok(progress) => {
                    {
                        let mut state = self.state.write();
                        state.bytecode_synced = progress.bytecode_synced;
                        state.bytecode_bytes = progress.bytecode_bytes;
                        state.bytecode_heal_synced = progress.bytecode_heal_synced;
                        state.bytecode_heal_bytes = progress.bytecode_heal_bytes;
                    }
                    tasks = progress.tasks;
                    for task in &tasks {
                        debug!(from = ?task.next, last = ?task.last, "Scheduled account sync task");
                    }
                    loaded = true;
                }
                Err(err) => error!(%err, "Failed to decode bytecode sync status"),
            }
        }
        if !loaded {
            // Either there was no previous state or it didn't decode; start
            // a fresh sync over the chunked account space.
            {
                let mut state = self.state.write();
                state.bytecode_synced = 0;
                state.bytecode_bytes = 0;
                state.bytecode_heal_synced = 0;
                state.bytecode_heal_bytes = 0;
            }
            tasks = fresh_account_tasks();
            for task in &tasks {
                debug!(from = ?task.next, last = ?task.last, "Created account sync task");
            }
        }
        let mut next_id = 1u64;
        for task in &mut tasks {
            task.hydrate(next_id, self.leaf_source.as_ref(), self.db.as_ref())?;
            next_id += 1;
        }
        // Chunks with nothing left to fetch are finished on arrival.
        tasks.retain(|task| !task.done);

        let mut state = self.state.write();
        state.snapped = tasks.is_empty();
        state.tasks = tasks;
        Ok(())
    }

    /// Serializes the remaining sync tasks and counters into the store.
    fn save_sync_status(&self) {
        let progress = {
            let state = self.state.read();
            SyncProgress {
                tasks: state
                    .tasks
                    .iter()
                    .filter(|task| !task.done)
                    .map(|task| task.snapshot())
                    .collect(),
                bytecode_synced: state.bytecode_synced,
                bytecode_bytes: state.bytecode_bytes,
                bytecode_heal_synced: state.bytecode_heal_synced,
                bytecode_heal_bytes: state.bytecode_heal_bytes,
            }
        };
        let status = match serde_json::to_vec(&progress) {
            Ok(status) => status,
            Err(err) => {
                error!(%err, "Failed to encode bytecode sync status");
                return;
            }
        };
        if let Err(err) = write_sync_status(self.db.as_ref(), &status) {
            error!(%err, "Failed to persist bytecode sync status");
        }
    }

    /// Writes out whatever flat states are still buffered.
    fn flush_state_writer(&self) {
        let batch = std::mem::take(&mut *self.state_writer.lock());
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.db.write(batch) {
            error!(%err, "Failed to flush state snapshot batch");
        }
    }

    /// Lossy wake-up for the event loop. Dropping the signal is fine: a
    /// full buffer means a wake-up is already queued.
    fn notify_update(&self) {
        let _ = self.update_tx.try_send(());
    }

    /// Emits a progress report if something meaningful happened since the
    /// last one, or unconditionally when forced.
    fn report(&self, force: bool) {
        let state = self.state.read();
        if !state.tasks.is_empty() {
            self.report_sync_progress(&state, force);
        } else {
            self.report_heal_progress(&state, force);
        }
    }

    fn report_sync_progress(&self, state: &SyncState, force: bool) {
        if !force
            && self
                .log_time
                .lock()
                .is_some_and(|at| at.elapsed() < PROGRESS_LOG_INTERVAL)
        {
            return;
        }
        // Nothing meaningful to report yet.
        if state.bytecode_bytes == 0 {
            return;
        }
        // Estimate the total from the share of the hash space the remaining
        // tasks still cover.
        let mut gaps = U256::zero();
        for task in &state.tasks {
            gaps += task.last.into_uint() - task.next.into_uint();
        }
        let fills = U256::MAX - gaps;
        if fills.is_zero() {
            return;
        }
        *self.log_time.lock() = Some(Instant::now());

        let filled_ratio =
            ((fills >> 128).as_u128() as f64 / 2f64.powi(128)).max(f64::MIN_POSITIVE);
        let est_bytes = state.bytecode_bytes as f64 / filled_ratio;
        let percent = format!("{:.2}%", state.bytecode_bytes as f64 * 100.0 / est_bytes);
        let eta = self.start_time.lock().map(|started| {
            let remaining = (est_bytes / state.bytecode_bytes as f64 - 1.0).clamp(0.0, 1e6);
            started.elapsed().mul_f64(remaining)
        });
        info!(
            root = %state.root,
            synced = %percent,
            codes = state.bytecode_synced,
            bytes = state.bytecode_bytes,
            eta = ?eta,
            "Bytecode sync in progress"
        );
    }

    fn report_heal_progress(&self, state: &SyncState, force: bool) {
        if !force
            && self
                .log_time
                .lock()
                .is_some_and(|at| at.elapsed() < PROGRESS_LOG_INTERVAL)
        {
            return;
        }
        *self.log_time.lock() = Some(Instant::now());

        let pending = state
            .healer
            .as_ref()
            .map_or(0, |healer| healer.scheduler.pending());
        info!(
            codes = state.bytecode_heal_synced,
            bytes = state.bytecode_heal_bytes,
            pending,
            "Bytecode heal in progress"
        );
    }
}

/// Wraps a request into the failure event matching its phase.
fn failed_event(req: Arc<CodeRequest>) -> SyncEvent {
    match req.source {
        Source::Healer => SyncEvent::HealFailed(req),
        Source::Task(_) => SyncEvent::Failed(req),
    }
}

/// Asks the event loop to revert a request. The publisher races three
/// outcomes: the loop accepted the failure, the cycle got cancelled, or the
/// request was already settled by someone else.
async fn schedule_revert(event: SyncEvent, req: &CodeRequest) {
    tokio::select! {
        _ = req.events.send(event) => {}
        _ = req.cancel.cancelled() => {}
        _ = req.stale.cancelled() => {}
    }
}

/// Cross-references a reply's blobs against the request manifest, leaving
/// gaps as explicit misses.
///
/// The wire contract requires the serving peer to return blobs in the same
/// relative order as the manifest, allowing omissions but never reorderings
/// or extras; any violation is proof of peer misbehaviour and fails the
/// whole reply.
pub fn cross_reference_bytecodes(
    hashes: &[H256],
    bytecodes: &[Bytes],
) -> Result<Vec<Option<Bytes>>, SyncError> {
    let mut codes: Vec<Option<Bytes>> = vec![None; hashes.len()];
    let mut cursor = 0;
    for code in bytecodes {
        // Find the next hash that was served, leaving misses as None.
        let hash = keccak256(code);
        while cursor < hashes.len() && hash != hashes[cursor] {
            cursor += 1;
        }
        if cursor == hashes.len() {
            // Either we ran out of requested hashes, or the peer delivered
            // something we never asked for.
            return Err(SyncError::UnexpectedBytecode);
        }
        codes[cursor] = Some(code.clone());
        cursor += 1;
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn blobs(count: usize) -> Vec<Bytes> {
        (0..count)
            .map(|i| Bytes::from(vec![i as u8 + 1; (i + 1) * 3]))
            .collect()
    }

    fn hashes_of(blobs: &[Bytes]) -> Vec<H256> {
        blobs.iter().map(|blob| keccak256(blob)).collect()
    }

    #[test]
    fn full_reply_aligns_one_to_one() {
        let blobs = blobs(3);
        let hashes = hashes_of(&blobs);
        let codes = cross_reference_bytecodes(&hashes, &blobs).unwrap();
        for (i, code) in codes.iter().enumerate() {
            assert_eq!(code.as_ref().unwrap(), &blobs[i]);
        }
    }

    #[test]
    fn partial_reply_leaves_explicit_misses() {
        let blobs = blobs(3);
        let hashes = hashes_of(&blobs);
        let reply = vec![blobs[0].clone(), blobs[2].clone()];
        let codes = cross_reference_bytecodes(&hashes, &reply).unwrap();
        assert_eq!(codes[0].as_ref().unwrap(), &blobs[0]);
        assert!(codes[1].is_none());
        assert_eq!(codes[2].as_ref().unwrap(), &blobs[2]);
    }

    #[test]
    fn reordered_reply_is_rejected() {
        let blobs = blobs(3);
        let hashes = hashes_of(&blobs);
        let reply = vec![blobs[2].clone(), blobs[0].clone()];
        assert!(matches!(
            cross_reference_bytecodes(&hashes, &reply),
            Err(SyncError::UnexpectedBytecode)
        ));
    }

    #[test]
    fn unrequested_data_is_rejected() {
        let blobs = blobs(2);
        let hashes = hashes_of(&blobs[..1]);
        let reply = vec![blobs[0].clone(), blobs[1].clone()];
        assert!(matches!(
            cross_reference_bytecodes(&hashes, &reply),
            Err(SyncError::UnexpectedBytecode)
        ));
    }

    #[test]
    fn empty_manifest_rejects_any_data() {
        let blobs = blobs(1);
        assert!(matches!(
            cross_reference_bytecodes(&[], &blobs),
            Err(SyncError::UnexpectedBytecode)
        ));
    }

    proptest! {
        /// Any subset of the manifest blobs, served in any order, either
        /// aligns exactly (when the order was monotone) or gets rejected;
        /// no input panics the validator.
        #[test]
        fn validator_aligns_or_rejects(
            mask in prop::collection::vec(any::<bool>(), 8),
            order in Just((0usize..8).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let blobs = blobs(8);
            let hashes = hashes_of(&blobs);
            let served: Vec<usize> = order.iter().copied().filter(|&i| mask[i]).collect();
            let reply: Vec<Bytes> = served.iter().map(|&i| blobs[i].clone()).collect();

            match cross_reference_bytecodes(&hashes, &reply) {
                Ok(codes) => {
                    prop_assert!(served.windows(2).all(|w| w[0] < w[1]));
                    for (i, code) in codes.iter().enumerate() {
                        if served.contains(&i) {
                            prop_assert_eq!(code.as_ref().unwrap(), &blobs[i]);
                        } else {
                            prop_assert!(code.is_none());
                        }
                    }
                }
                Err(SyncError::UnexpectedBytecode) => {
                    prop_assert!(
                        served.windows(2).any(|w| w[0] >= w[1]),
                        "an in-order reply must never be rejected"
                    );
                }
                Err(err) => prop_assert!(false, "unexpected error kind: {err}"),
            }
        }
    }
}
