use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::{self, ActorState, Context};
use crate::types::{CycleOutcome, Event, MrId};

/// Default bound on MR cycles running in parallel.
pub const DEFAULT_PARALLELISM: usize = 2;

/// How long an actor may sit idle before the sweep evicts it.
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(1800);

struct ActorHandle {
    tx: mpsc::UnboundedSender<Event>,
    last_event: Instant,
}

/// One logical actor per MR: events for the same MR run strictly
/// sequentially in receipt order, distinct MRs run in parallel up to the
/// configured bound.
pub struct ActorRegistry {
    ctx: Arc<Context>,
    actors: Mutex<HashMap<MrId, ActorHandle>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl ActorRegistry {
    pub fn new(ctx: Arc<Context>, parallelism: usize, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            actors: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            shutdown,
        })
    }

    /// Hand an event to its MR's actor, spawning the actor on first
    /// contact. Called serially by the feed, which preserves receipt order.
    pub async fn route(self: &Arc<Self>, event: Event) {
        let mr_id = event.mr_id;
        let mut actors = self.actors.lock().await;
        let handle = actors.entry(mr_id).or_insert_with(|| self.spawn_actor(mr_id));
        handle.last_event = Instant::now();
        if let Err(returned) = handle.tx.send(event) {
            // The actor exited (shutdown or eviction race); restart it and
            // re-deliver the event.
            let handle = self.spawn_actor(mr_id);
            let _ = handle.tx.send(returned.0);
            actors.insert(mr_id, handle);
        }
    }

    fn spawn_actor(self: &Arc<Self>, mr_id: MrId) -> ActorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::clone(&self.ctx);
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            actor_loop(ctx, mr_id, rx, permits, shutdown).await;
        });
        info!("spawned actor for MR !{mr_id}");
        ActorHandle { tx, last_event: Instant::now() }
    }

    /// Send a reconciliation tick to every live actor.
    pub async fn tick_all(&self) {
        let actors = self.actors.lock().await;
        for (mr_id, handle) in actors.iter() {
            let _ = handle.tx.send(Event::new(
                *mr_id,
                crate::types::EventKind::TimerTick,
                serde_json::Value::Null,
            ));
        }
    }

    /// Drop actors that have not seen an event for `idle`. Their state is
    /// reconstructible, so eviction is always safe.
    pub async fn sweep_idle(&self, idle: Duration) {
        let mut actors = self.actors.lock().await;
        let before = actors.len();
        actors.retain(|_, handle| handle.last_event.elapsed() < idle);
        let evicted = before - actors.len();
        if evicted > 0 {
            info!("evicted {evicted} idle MR actor(s)");
        }
    }

    /// Explicit forget signal: drop the actor immediately.
    pub async fn forget(&self, mr_id: MrId) {
        if self.actors.lock().await.remove(&mr_id).is_some() {
            info!("forgot actor for MR !{mr_id}");
        }
    }

    pub async fn live_mrs(&self) -> Vec<MrId> {
        self.actors.lock().await.keys().copied().collect()
    }
}

/// Per-MR loop: receive, coalesce, run one cycle. Queued events collapse
/// into a single re-evaluate pass because the rebuilt snapshot subsumes
/// their payloads; their command intents are folded in first, in order.
async fn actor_loop(
    ctx: Arc<Context>,
    mr_id: MrId,
    mut rx: mpsc::UnboundedReceiver<Event>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let mut state = ActorState::default();
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(e) => e,
                None => break,
            },
        };

        engine::apply_event(&mut state, &first);
        let mut coalesced = 0usize;
        while let Ok(more) = rx.try_recv() {
            engine::apply_event(&mut state, &more);
            coalesced += 1;
        }
        if coalesced > 0 {
            info!("MR !{mr_id}: coalesced {coalesced} queued event(s) into one pass");
        }

        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let outcome = engine::run_cycle(&ctx, &mut state, mr_id).await;
        drop(permit);

        match outcome {
            CycleOutcome::Completed => {}
            CycleOutcome::Deferred(reason) => {
                info!("MR !{mr_id}: cycle deferred ({reason}); a timer tick will retry")
            }
            CycleOutcome::Failed(reason) => {
                // The actor stays available; a future event re-attempts.
                error!("MR !{mr_id}: cycle failed: {reason}")
            }
        }

        if shutdown.is_cancelled() {
            warn!("MR !{mr_id}: shutting down after finishing the current cycle");
            break;
        }
    }
}
