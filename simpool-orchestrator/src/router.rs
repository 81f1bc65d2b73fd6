//! Correlation-id router pairing requests with asynchronous replies.
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use simpool_core::{CorrelationId, Envelope, Reply, ReplyKind, SimPoolError};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// How often the sweeper checks for expired pending requests.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// The caller-side result of a routed request.
pub type ReplyResult = Result<Reply, SimPoolError>;

struct Pending {
    tx: Sender<ReplyResult>,
    deadline: Instant,
    timeout_ms: u64,
}

/// Routes unit replies to whoever is waiting for them.
///
/// Requests expecting a reply call [`register`](MessageRouter::register) to
/// obtain a correlation id and a one-shot receiver, then send the id with the
/// command. [`dispatch`](MessageRouter::dispatch) resolves the matching
/// pending record, a background sweeper rejects records whose deadline
/// passed, and replies that match no record go to a type-keyed general
/// handler instead of being discarded.
pub struct MessageRouter {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<CorrelationId, Pending>>>,
    handlers: Arc<Mutex<HashMap<ReplyKind, Sender<Envelope<Reply>>>>>,
    default_timeout: Duration,
    stop: Arc<Mutex<bool>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    /// Creates a router and starts its deadline sweeper.
    pub fn new(default_timeout: Duration) -> Self {
        let pending: Arc<Mutex<HashMap<CorrelationId, Pending>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(Mutex::new(false));

        let sweeper = {
            let pending = pending.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                Self::run_sweeper(pending, stop);
            })
        };

        Self {
            next_id: AtomicU64::new(0),
            pending,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
            stop,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Registers a pending request with the default deadline.
    pub fn register(&self) -> (CorrelationId, Receiver<ReplyResult>) {
        self.register_with_timeout(self.default_timeout)
    }

    /// Registers a pending request with an explicit deadline.
    ///
    /// Returns the issued correlation id and the one-shot receiver the caller
    /// blocks on. The record is removed on reply or expiry, whichever comes
    /// first.
    pub fn register_with_timeout(
        &self,
        timeout: Duration,
    ) -> (CorrelationId, Receiver<ReplyResult>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = bounded(1);
        let record = Pending {
            tx,
            deadline: Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
        };
        let prev = self.pending.lock().unwrap().insert(id, record);
        debug_assert!(prev.is_none(), "correlation id reused");
        (id, rx)
    }

    /// Registers a general handler for replies of `kind` that match no
    /// pending record.
    pub fn route_unmatched(&self, kind: ReplyKind, tx: Sender<Envelope<Reply>>) {
        self.handlers.lock().unwrap().insert(kind, tx);
    }

    /// Routes one incoming reply.
    ///
    /// A tagged reply resolves (or, for `Error`, rejects) its pending record.
    /// Anything else goes to the type-keyed handler for its kind; replies
    /// with neither a record nor a handler are logged and dropped.
    pub fn dispatch(&self, envelope: Envelope<Reply>) {
        if let Some(id) = envelope.id {
            if let Some(record) = self.pending.lock().unwrap().remove(&id) {
                let result = match &envelope.msg {
                    Reply::Error {
                        env_id,
                        error,
                        stack,
                    } => Err(SimPoolError::SimulationFault {
                        env_id: *env_id,
                        message: error.clone(),
                        stack: stack.clone(),
                    }),
                    _ => Ok(envelope.msg),
                };
                // The caller may have given up; a closed receiver is fine.
                let _ = record.tx.send(result);
                return;
            }
            debug!("reply {} arrived after its record was removed", id);
        }

        let kind = envelope.msg.kind();
        let handler = self.handlers.lock().unwrap().get(&kind).cloned();
        match handler {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    warn!("general handler for {:?} is gone", kind);
                }
            }
            None => warn!("unroutable reply of kind {:?} dropped", kind),
        }
    }

    /// Number of live pending records.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn run_sweeper(pending: Arc<Mutex<HashMap<CorrelationId, Pending>>>, stop: Arc<Mutex<bool>>) {
        loop {
            std::thread::sleep(SWEEP_INTERVAL);
            if *stop.lock().unwrap() {
                break;
            }

            let now = Instant::now();
            let expired: Vec<(CorrelationId, Pending)> = {
                let mut pending = pending.lock().unwrap();
                let ids: Vec<CorrelationId> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .map(|id| (id, pending.remove(&id).unwrap()))
                    .collect()
            };

            for (id, record) in expired {
                warn!("request {} timed out after {} ms", id, record.timeout_ms);
                let _ = record.tx.send(Err(SimPoolError::CommandTimeout {
                    id,
                    timeout_ms: record.timeout_ms,
                }));
            }
        }
        info!("router sweeper stopped");
    }

    /// Stops the sweeper thread. Called on drop.
    pub fn shutdown(&self) {
        *self.stop.lock().unwrap() = true;
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use simpool_core::Observation;

    #[test]
    fn matched_reply_resolves_and_removes_the_record() {
        let router = MessageRouter::new(Duration::from_secs(5));
        let (id, rx) = router.register();
        assert_eq!(router.pending_len(), 1);

        router.dispatch(Envelope::tagged(id, Reply::Initialized { env_id: 2 }));
        match rx.recv().unwrap() {
            Ok(Reply::Initialized { env_id }) => assert_eq!(env_id, 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn tagged_error_rejects_the_caller() {
        let router = MessageRouter::new(Duration::from_secs(5));
        let (id, rx) = router.register();
        router.dispatch(Envelope::tagged(
            id,
            Reply::Error {
                env_id: 3,
                error: "engine blew up".into(),
                stack: None,
            },
        ));
        match rx.recv().unwrap() {
            Err(SimPoolError::SimulationFault { env_id, .. }) => assert_eq!(env_id, 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn expired_record_rejects_with_timeout_and_is_removed() {
        let router = MessageRouter::new(Duration::from_secs(5));
        let (_id, rx) = router.register_with_timeout(Duration::from_millis(10));

        // One sweep interval plus slack.
        let result = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        match result {
            Err(SimPoolError::CommandTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 10),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn unmatched_reply_goes_to_the_type_keyed_handler() {
        let router = MessageRouter::new(Duration::from_secs(5));
        let (tx, rx) = unbounded();
        router.route_unmatched(ReplyKind::StepResult, tx);

        router.dispatch(Envelope::untagged(Reply::StepResult {
            env_id: 1,
            observation: Observation::default(),
            reward: 0.5,
            done: false,
            info: Default::default(),
        }));
        let envelope = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(envelope.msg.env_id(), Some(1));
    }

    #[test]
    fn correlation_ids_are_unique_and_increasing() {
        let router = MessageRouter::new(Duration::from_secs(5));
        let (a, _rx_a) = router.register();
        let (b, _rx_b) = router.register();
        assert!(b > a);
    }
}
