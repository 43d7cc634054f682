//! Per-runtime warm pool of pre-started containers.
//!
//! Each runtime owns a bounded shard of slots. Renting moves an idle slot to
//! `Rented` and bumps its generation; returning either recycles the slot
//! (workspace wipe + liveness probe) or destroys it. A background refill
//! task per runtime keeps `idle + provisioning` at the target size so rent
//! on a hot path rarely waits behind container creation.
//!
//! The shard mutex is only ever held across state-field updates, never
//! across daemon I/O.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use nimbus_common::{ContainerDaemon, DaemonError, ExecRequest, PoolError, Runtime, RuntimeTable};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RECYCLE_TIMEOUT: Duration = Duration::from_secs(5);
const REFILL_SWEEP: Duration = Duration::from_secs(30);
const REFILL_BACKOFF: Duration = Duration::from_secs(5);

/// Lifecycle state of a pooled container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Provisioning,
    Idle,
    Rented,
    Dirty,
    Draining,
    Destroyed,
}

#[derive(Debug, Clone)]
struct ContainerSlot {
    container_id: String,
    runtime: Runtime,
    state: SlotState,
    created_at: Instant,
    last_health_check: Option<Instant>,
    /// Bumped on every rent; a return carrying a stale generation is
    /// rejected and the slot destroyed.
    generation: u64,
}

/// Exclusive handle to a rented slot. Exactly one lease exists per rented
/// container; the dispatcher must hand it back through
/// [`WarmPool::put_back`] on every exit path.
#[derive(Debug)]
pub struct SlotLease {
    pub container_id: String,
    pub runtime: Runtime,
    pub generation: u64,
    /// The in-container workspace path, once staging has injected one.
    /// Wiped when the slot is recycled.
    pub workspace: Option<String>,
}

/// How a job hands its slot back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Clean,
    Dirty,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub enabled: bool,
    /// Per-runtime capacity; also the refill target when the pool is
    /// enabled.
    pub sizes: HashMap<Runtime, usize>,
}

impl PoolSettings {
    pub fn max_in_flight(&self) -> usize {
        Runtime::ALL
            .iter()
            .map(|rt| self.sizes.get(rt).copied().unwrap_or(1).max(1))
            .sum()
    }
}

/// Point-in-time shard counters, used for logging and tests.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub runtime: Runtime,
    pub idle: usize,
    pub rented: usize,
    pub provisioning: usize,
    pub capacity: usize,
}

struct ShardState {
    idle: VecDeque<ContainerSlot>,
    rented: HashMap<String, ContainerSlot>,
    provisioning: usize,
}

impl ShardState {
    fn population(&self) -> usize {
        self.idle.len() + self.rented.len() + self.provisioning
    }
}

struct PoolShard {
    runtime: Runtime,
    image: String,
    capacity: usize,
    target: usize,
    state: Mutex<ShardState>,
    /// Signalled whenever a slot frees up (returned or destroyed), waking
    /// one waiter in `rent`.
    returned: Notify,
    /// Kicks the refill task after a slot is destroyed.
    refill: Notify,
    draining: AtomicBool,
}

impl PoolShard {
    async fn provision(&self, daemon: &dyn ContainerDaemon) -> Result<ContainerSlot, DaemonError> {
        let name = format!("nimbus-warm-{}-{}", self.runtime, Uuid::new_v4());
        let container_id = daemon.create(&self.image, &name).await?;
        if let Err(e) = daemon.start(&container_id).await {
            let _ = daemon.remove(&container_id).await;
            return Err(e);
        }
        let slot = ContainerSlot {
            container_id,
            runtime: self.runtime,
            state: SlotState::Idle,
            created_at: Instant::now(),
            last_health_check: None,
            generation: 0,
        };
        debug!(slot = ?slot, "provisioned warm container");
        Ok(slot)
    }

    async fn destroy(&self, daemon: &dyn ContainerDaemon, container_id: &str) {
        if let Err(e) = daemon.remove(container_id).await {
            warn!(%container_id, error = %e, "failed to remove container");
        }
        // A slot left the population: wake a waiter (it may now provision)
        // and nudge the refill task.
        self.returned.notify_one();
        self.refill.notify_one();
    }

    /// One background actor per runtime keeping
    /// `idle + provisioning >= target` while not draining.
    async fn refill_loop(self: Arc<Self>, daemon: Arc<dyn ContainerDaemon>) {
        loop {
            if self.draining.load(Ordering::SeqCst) {
                return;
            }

            loop {
                let should_provision = {
                    let mut st = self.state.lock().await;
                    if !self.draining.load(Ordering::SeqCst)
                        && st.idle.len() + st.provisioning < self.target
                        && st.population() < self.capacity
                    {
                        st.provisioning += 1;
                        true
                    } else {
                        false
                    }
                };
                if !should_provision {
                    break;
                }

                match self.provision(daemon.as_ref()).await {
                    Ok(slot) => {
                        {
                            let mut st = self.state.lock().await;
                            st.provisioning -= 1;
                            st.idle.push_back(slot);
                        }
                        self.returned.notify_one();
                    }
                    Err(e) => {
                        {
                            let mut st = self.state.lock().await;
                            st.provisioning -= 1;
                        }
                        error!(runtime = %self.runtime, error = %e, "warm pool refill failed");
                        time::sleep(REFILL_BACKOFF).await;
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.refill.notified() => {}
                _ = time::sleep(REFILL_SWEEP) => {}
            }
        }
    }
}

pub struct WarmPool {
    daemon: Arc<dyn ContainerDaemon>,
    shards: HashMap<Runtime, Arc<PoolShard>>,
    refill_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WarmPool {
    pub fn new(
        daemon: Arc<dyn ContainerDaemon>,
        table: &RuntimeTable,
        settings: &PoolSettings,
    ) -> Self {
        let mut shards = HashMap::new();
        for desc in table.iter() {
            let size = settings.sizes.get(&desc.runtime).copied().unwrap_or(1);
            shards.insert(
                desc.runtime,
                Arc::new(PoolShard {
                    runtime: desc.runtime,
                    image: desc.image.clone(),
                    capacity: size.max(1),
                    target: if settings.enabled { size } else { 0 },
                    state: Mutex::new(ShardState {
                        idle: VecDeque::new(),
                        rented: HashMap::new(),
                        provisioning: 0,
                    }),
                    returned: Notify::new(),
                    refill: Notify::new(),
                    draining: AtomicBool::new(false),
                }),
            );
        }
        Self {
            daemon,
            shards,
            refill_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the per-runtime refill tasks. The initial warm fill happens
    /// through them, off the caller's path.
    pub async fn start(&self) {
        let mut tasks = self.refill_tasks.lock().await;
        for shard in self.shards.values() {
            let shard = Arc::clone(shard);
            let daemon = Arc::clone(&self.daemon);
            tasks.push(tokio::spawn(shard.refill_loop(daemon)));
        }
    }

    fn shard(&self, runtime: Runtime) -> &Arc<PoolShard> {
        // Shards are total over Runtime by construction.
        &self.shards[&runtime]
    }

    /// Rent a slot, waiting until `deadline` when the shard is saturated.
    pub async fn rent(
        &self,
        runtime: Runtime,
        deadline: time::Instant,
    ) -> Result<SlotLease, PoolError> {
        let shard = self.shard(runtime);
        loop {
            if shard.draining.load(Ordering::SeqCst) {
                return Err(PoolError::Draining);
            }

            // Register interest before inspecting state so a return racing
            // this check is not missed.
            let returned = shard.returned.notified();

            enum Action {
                Lease(SlotLease),
                Provision,
                Wait,
            }

            let action = {
                let mut st = shard.state.lock().await;
                if let Some(mut slot) = st.idle.pop_front() {
                    slot.generation += 1;
                    slot.state = SlotState::Rented;
                    let lease = SlotLease {
                        container_id: slot.container_id.clone(),
                        runtime,
                        generation: slot.generation,
                        workspace: None,
                    };
                    st.rented.insert(slot.container_id.clone(), slot);
                    Action::Lease(lease)
                } else if st.population() < shard.capacity {
                    st.provisioning += 1;
                    Action::Provision
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Lease(lease) => {
                    debug!(container_id = %lease.container_id, %runtime, "rented warm slot");
                    return Ok(lease);
                }
                Action::Provision => {
                    // Cold-path synchronous provision, lock released.
                    match shard.provision(self.daemon.as_ref()).await {
                        Ok(mut slot) => {
                            slot.generation = 1;
                            slot.state = SlotState::Rented;
                            let lease = SlotLease {
                                container_id: slot.container_id.clone(),
                                runtime,
                                generation: slot.generation,
                                workspace: None,
                            };
                            let mut st = shard.state.lock().await;
                            st.provisioning -= 1;
                            st.rented.insert(slot.container_id.clone(), slot);
                            info!(container_id = %lease.container_id, %runtime, "rented freshly provisioned slot");
                            return Ok(lease);
                        }
                        Err(e) => {
                            {
                                let mut st = shard.state.lock().await;
                                st.provisioning -= 1;
                            }
                            shard.returned.notify_one();
                            return Err(PoolError::Daemon(e));
                        }
                    }
                }
                Action::Wait => {
                    tokio::select! {
                        _ = returned => continue,
                        _ = time::sleep_until(deadline) => {
                            return Err(PoolError::Exhausted(runtime));
                        }
                    }
                }
            }
        }
    }

    /// Hand a slot back. Dirty slots and slots failing recycling are
    /// destroyed; the refill task replaces them.
    pub async fn put_back(&self, lease: SlotLease, disposition: Disposition) {
        let shard = self.shard(lease.runtime);
        let slot = {
            let mut st = shard.state.lock().await;
            st.rented.remove(&lease.container_id)
        };

        let Some(mut slot) = slot else {
            warn!(
                container_id = %lease.container_id,
                "return for a slot the pool does not hold; destroying"
            );
            shard.destroy(self.daemon.as_ref(), &lease.container_id).await;
            return;
        };

        if slot.generation != lease.generation {
            warn!(
                container_id = %slot.container_id,
                slot_generation = slot.generation,
                lease_generation = lease.generation,
                "stale generation on return; destroying slot"
            );
            shard.destroy(self.daemon.as_ref(), &slot.container_id).await;
            return;
        }

        if disposition == Disposition::Dirty || shard.draining.load(Ordering::SeqCst) {
            slot.state = SlotState::Draining;
            debug!(container_id = %slot.container_id, "destroying dirty slot");
            shard.destroy(self.daemon.as_ref(), &slot.container_id).await;
            return;
        }

        match self.recycle(&lease).await {
            Ok(()) => {
                slot.state = SlotState::Idle;
                slot.last_health_check = Some(Instant::now());
                let idle_count = {
                    let mut st = shard.state.lock().await;
                    st.idle.push_back(slot);
                    st.idle.len()
                };
                shard.returned.notify_one();
                debug!(runtime = %lease.runtime, idle = idle_count, "slot recycled into pool");
            }
            Err(reason) => {
                warn!(
                    container_id = %lease.container_id,
                    %reason,
                    "slot failed recycling; destroying"
                );
                shard.destroy(self.daemon.as_ref(), &lease.container_id).await;
            }
        }
    }

    /// Wipe the job workspace and probe liveness. Any failure means the
    /// slot must not be reused.
    async fn recycle(&self, lease: &SlotLease) -> Result<(), String> {
        if let Some(workspace) = &lease.workspace {
            let wipe = ExecRequest::new(vec![
                "rm".to_string(),
                "-rf".to_string(),
                workspace.clone(),
            ]);
            let out = time::timeout(RECYCLE_TIMEOUT, self.daemon.exec(&lease.container_id, wipe))
                .await
                .map_err(|_| "workspace wipe timed out".to_string())?
                .map_err(|e| format!("workspace wipe failed: {e}"))?;
            if out.exit_code != 0 {
                return Err(format!("workspace wipe exited {}", out.exit_code));
            }
        }

        let probe = ExecRequest::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "true".to_string(),
        ]);
        let out = time::timeout(RECYCLE_TIMEOUT, self.daemon.exec(&lease.container_id, probe))
            .await
            .map_err(|_| "liveness probe timed out".to_string())?
            .map_err(|e| format!("liveness probe failed: {e}"))?;
        if out.exit_code != 0 {
            return Err(format!("liveness probe exited {}", out.exit_code));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<PoolStats> {
        let mut stats = Vec::new();
        for shard in self.shards.values() {
            // try_lock: snapshot is advisory, never worth blocking for.
            if let Ok(st) = shard.state.try_lock() {
                stats.push(PoolStats {
                    runtime: shard.runtime,
                    idle: st.idle.len(),
                    rented: st.rented.len(),
                    provisioning: st.provisioning,
                    capacity: shard.capacity,
                });
            }
        }
        stats
    }

    /// Move to draining: rents fail fast, idle slots are destroyed, rented
    /// slots are destroyed as they come back.
    pub async fn shutdown(&self) {
        info!("draining warm pool");
        for shard in self.shards.values() {
            shard.draining.store(true, Ordering::SeqCst);
            shard.returned.notify_waiters();
            shard.refill.notify_waiters();
        }

        {
            let mut tasks = self.refill_tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        for shard in self.shards.values() {
            let idle: Vec<ContainerSlot> = {
                let mut st = shard.state.lock().await;
                st.idle.drain(..).collect()
            };
            for slot in idle {
                if let Err(e) = self.daemon.remove(&slot.container_id).await {
                    warn!(container_id = %slot.container_id, error = %e, "failed removing idle slot");
                }
            }
            let rented = shard.state.lock().await.rented.len();
            if rented > 0 {
                info!(
                    runtime = %shard.runtime,
                    rented,
                    "slots still rented at drain; destroyed on return"
                );
            }
        }
    }
}
