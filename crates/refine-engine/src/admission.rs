use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use refine_core::ids::SessionId;

use crate::error::EngineError;

/// Window of completed-session durations feeding the wait estimate.
const DURATION_WINDOW: usize = 20;
/// Assumed session duration before any completion has been observed.
const FALLBACK_DURATION: Duration = Duration::from_secs(300);

/// Admission outcome for one submitted session. `position` is 0 when the
/// session was granted a slot immediately, otherwise its 1-based place in
/// the queue.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub session_id: SessionId,
    pub position: usize,
    pub estimated_wait: Duration,
}

impl Ticket {
    pub fn granted(&self) -> bool {
        self.position == 0
    }
}

/// One queued session in a status snapshot.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub session_id: SessionId,
    pub position: usize,
    pub estimated_wait: Duration,
}

#[derive(Clone, Debug)]
pub struct QueueStatus {
    pub active: usize,
    pub ceiling: usize,
    pub queued: Vec<QueueEntry>,
}

struct State {
    ceiling: usize,
    active: HashSet<SessionId>,
    queue: VecDeque<SessionId>,
    durations: VecDeque<Duration>,
}

impl State {
    fn avg_duration(&self) -> Duration {
        if self.durations.is_empty() {
            FALLBACK_DURATION
        } else {
            let total: Duration = self.durations.iter().sum();
            total / self.durations.len() as u32
        }
    }

    /// Move queue heads into active slots while capacity remains.
    fn promote(&mut self) -> usize {
        let mut promoted = 0;
        while self.active.len() < self.ceiling {
            match self.queue.pop_front() {
                Some(id) => {
                    self.active.insert(id);
                    promoted += 1;
                }
                None => break,
            }
        }
        promoted
    }
}

/// Bounds how many sessions process concurrently. All counters live behind
/// one mutex; workers park on `await_slot` until promoted.
pub struct AdmissionController {
    state: Mutex<State>,
    notify: Notify,
}

impl AdmissionController {
    pub fn new(ceiling: usize) -> Self {
        Self {
            state: Mutex::new(State {
                ceiling,
                active: HashSet::new(),
                queue: VecDeque::new(),
                durations: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Register a session. Grants a slot immediately when under the ceiling
    /// with an empty queue, otherwise appends to the FIFO queue.
    pub fn submit(&self, session_id: SessionId) -> Ticket {
        let mut state = self.state.lock();

        if state.active.len() < state.ceiling && state.queue.is_empty() {
            state.active.insert(session_id.clone());
            debug!(%session_id, active = state.active.len(), "admission granted");
            return Ticket {
                session_id,
                position: 0,
                estimated_wait: Duration::ZERO,
            };
        }

        state.queue.push_back(session_id.clone());
        let position = state.queue.len();
        let estimated_wait = state.avg_duration() * position as u32;
        debug!(%session_id, position, "admission queued");
        Ticket {
            session_id,
            position,
            estimated_wait,
        }
    }

    /// Park until the session holds a slot. Returns `Stopped` if cancelled
    /// or withdrawn while waiting.
    pub async fn await_slot(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if state.active.contains(session_id) {
                    return Ok(());
                }
                if !state.queue.contains(session_id) {
                    return Err(EngineError::Stopped);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    // A release may promote this session into a slot in the
                    // same instant the cancel fires. The departing waiter
                    // must hand that slot back or it is held forever.
                    let mut state = self.state.lock();
                    state.queue.retain(|id| id != session_id);
                    if state.active.remove(session_id) {
                        state.promote();
                    }
                    drop(state);
                    self.notify.notify_waiters();
                    return Err(EngineError::Stopped);
                }
                _ = notified => {}
            }
        }
    }

    /// Free a slot, record the observed duration, and promote the queue head.
    pub fn release(&self, session_id: &SessionId, observed_duration: Duration) {
        let mut state = self.state.lock();
        if !state.active.remove(session_id) {
            return;
        }

        state.durations.push_back(observed_duration);
        while state.durations.len() > DURATION_WINDOW {
            state.durations.pop_front();
        }

        let promoted = state.promote();
        drop(state);
        if promoted > 0 {
            self.notify.notify_waiters();
        }
        debug!(%session_id, ?observed_duration, promoted, "admission released");
    }

    /// Remove a queued session. A no-op for sessions that are active or
    /// unknown.
    pub fn withdraw(&self, session_id: &SessionId) {
        let mut state = self.state.lock();
        state.queue.retain(|id| id != session_id);
        self.notify.notify_waiters();
    }

    /// Change the concurrency ceiling. Takes effect on the next promotion
    /// scan; active sessions are never preempted.
    pub fn set_ceiling(&self, ceiling: usize) {
        let mut state = self.state.lock();
        state.ceiling = ceiling;
        let promoted = state.promote();
        drop(state);
        if promoted > 0 {
            self.notify.notify_waiters();
        }
        info!(ceiling, "admission ceiling changed");
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        let avg = state.avg_duration();
        QueueStatus {
            active: state.active.len(),
            ceiling: state.ceiling,
            queued: state
                .queue
                .iter()
                .enumerate()
                .map(|(i, id)| QueueEntry {
                    session_id: id.clone(),
                    position: i + 1,
                    estimated_wait: avg * (i + 1) as u32,
                })
                .collect(),
        }
    }

    /// 1-based queue position, or None when not queued.
    pub fn position_of(&self, session_id: &SessionId) -> Option<usize> {
        let state = self.state.lock();
        state.queue.iter().position(|id| id == session_id).map(|p| p + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_immediately_under_ceiling() {
        let controller = AdmissionController::new(2);
        let t1 = controller.submit(SessionId::new());
        let t2 = controller.submit(SessionId::new());
        assert!(t1.granted());
        assert!(t2.granted());
        assert_eq!(controller.status().active, 2);
    }

    #[test]
    fn queues_at_ceiling() {
        let controller = AdmissionController::new(1);
        let t1 = controller.submit(SessionId::new());
        let t2 = controller.submit(SessionId::new());
        let t3 = controller.submit(SessionId::new());

        assert!(t1.granted());
        assert_eq!(t2.position, 1);
        assert_eq!(t3.position, 2);

        let status = controller.status();
        assert_eq!(status.active, 1);
        assert_eq!(status.queued.len(), 2);
    }

    #[test]
    fn fallback_wait_estimate() {
        let controller = AdmissionController::new(1);
        controller.submit(SessionId::new());
        let ticket = controller.submit(SessionId::new());
        assert_eq!(ticket.estimated_wait, FALLBACK_DURATION);
    }

    #[test]
    fn wait_estimate_uses_moving_average() {
        let controller = AdmissionController::new(1);
        let first = controller.submit(SessionId::new());
        controller.release(&first.session_id, Duration::from_secs(10));

        let active = controller.submit(SessionId::new());
        assert!(active.granted());
        let queued = controller.submit(SessionId::new());
        assert_eq!(queued.estimated_wait, Duration::from_secs(10));

        let queued2 = controller.submit(SessionId::new());
        assert_eq!(queued2.estimated_wait, Duration::from_secs(20));
    }

    #[test]
    fn duration_window_bounded() {
        let controller = AdmissionController::new(1);
        for i in 0..30 {
            let t = controller.submit(SessionId::new());
            controller.release(&t.session_id, Duration::from_secs(i));
        }
        let state = controller.state.lock();
        assert_eq!(state.durations.len(), DURATION_WINDOW);
        // Oldest entries rolled off
        assert_eq!(state.durations.front(), Some(&Duration::from_secs(10)));
    }

    #[test]
    fn release_promotes_queue_head() {
        let controller = AdmissionController::new(1);
        let t1 = controller.submit(SessionId::new());
        let t2 = controller.submit(SessionId::new());
        assert!(!t2.granted());

        controller.release(&t1.session_id, Duration::from_secs(5));

        let status = controller.status();
        assert_eq!(status.active, 1);
        assert!(status.queued.is_empty());
        assert_eq!(controller.position_of(&t2.session_id), None);
    }

    #[test]
    fn withdraw_removes_queued() {
        let controller = AdmissionController::new(1);
        controller.submit(SessionId::new());
        let queued = controller.submit(SessionId::new());
        assert_eq!(controller.position_of(&queued.session_id), Some(1));

        controller.withdraw(&queued.session_id);
        assert_eq!(controller.position_of(&queued.session_id), None);

        // Withdrawing again is not an error
        controller.withdraw(&queued.session_id);
    }

    #[test]
    fn raising_ceiling_promotes() {
        let controller = AdmissionController::new(1);
        controller.submit(SessionId::new());
        controller.submit(SessionId::new());
        controller.submit(SessionId::new());
        assert_eq!(controller.status().queued.len(), 2);

        controller.set_ceiling(3);
        let status = controller.status();
        assert_eq!(status.active, 3);
        assert!(status.queued.is_empty());
    }

    #[test]
    fn lowering_ceiling_never_preempts() {
        let controller = AdmissionController::new(3);
        for _ in 0..3 {
            controller.submit(SessionId::new());
        }
        controller.set_ceiling(1);

        let status = controller.status();
        assert_eq!(status.active, 3);

        // New submissions queue until active drops below the new ceiling
        let queued = controller.submit(SessionId::new());
        assert!(!queued.granted());
    }

    #[tokio::test]
    async fn await_slot_returns_for_granted() {
        let controller = AdmissionController::new(1);
        let ticket = controller.submit(SessionId::new());
        let cancel = CancellationToken::new();
        controller
            .await_slot(&ticket.session_id, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn await_slot_wakes_on_release() {
        let controller = std::sync::Arc::new(AdmissionController::new(1));
        let t1 = controller.submit(SessionId::new());
        let t2 = controller.submit(SessionId::new());

        let waiter = {
            let controller = controller.clone();
            let sid = t2.session_id.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                controller.await_slot(&sid, &cancel).await
            })
        };

        tokio::task::yield_now().await;
        controller.release(&t1.session_id, Duration::from_secs(1));

        waiter.await.unwrap().unwrap();
        assert_eq!(controller.status().active, 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_never_leaks_a_promoted_slot() {
        // A release can promote a queued session in the same instant its
        // token is cancelled; whichever select branch wins, the slot must
        // come back. Repeat to let both interleavings occur.
        for _ in 0..50 {
            let controller = std::sync::Arc::new(AdmissionController::new(1));
            let t1 = controller.submit(SessionId::new());
            let t2 = controller.submit(SessionId::new());

            let cancel = CancellationToken::new();
            let waiter = {
                let controller = controller.clone();
                let sid = t2.session_id.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { controller.await_slot(&sid, &cancel).await })
            };
            tokio::task::yield_now().await;

            controller.release(&t1.session_id, Duration::from_millis(1));
            cancel.cancel();

            if waiter.await.unwrap().is_ok() {
                controller.release(&t2.session_id, Duration::ZERO);
            }
            let status = controller.status();
            assert_eq!(status.active, 0, "promoted slot was never handed back");
            assert!(status.queued.is_empty());
        }
    }

    #[tokio::test]
    async fn await_slot_cancellation_withdraws() {
        let controller = AdmissionController::new(1);
        controller.submit(SessionId::new());
        let queued = controller.submit(SessionId::new());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = controller.await_slot(&queued.session_id, &cancel).await;
        assert!(matches!(result, Err(EngineError::Stopped)));
        assert_eq!(controller.position_of(&queued.session_id), None);
    }
}
