//! Collects the answers to an outgoing message.
//!
//! A listener expects one answer by default. Broadcast sends raise the
//! expected count as further holders of the recipient are discovered. While a
//! send is still dispatching, answers are kept but the listener cannot
//! complete. Answers arriving after the deadline are dropped.

use crate::error::NodeError;
use crate::message::Message;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Waiting,
    Success,
    TimedOut,
    Failed,
}

type SuccessCallback = Box<dyn FnOnce(&[Message]) + Send>;
type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct ListenerState {
    expected: usize,
    results: Vec<Message>,
    exception: Option<NodeError>,
    failed: bool,
    dispatching: bool,
    on_success: Option<SuccessCallback>,
    on_timeout: Option<TimeoutCallback>,
}

impl ListenerState {
    fn is_complete(&self) -> bool {
        !self.dispatching && self.results.len() >= self.expected
    }

    fn take_success(&mut self) -> Option<(SuccessCallback, Vec<Message>)> {
        if !self.is_complete() {
            return None;
        }
        let callback = self.on_success.take()?;
        Some((callback, self.results.clone()))
    }
}

pub struct ResultListener {
    state: Mutex<ListenerState>,
    notify: Notify,
    deadline: Instant,
}

impl std::fmt::Debug for ResultListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResultListener")
            .field("expected", &state.expected)
            .field("received", &state.results.len())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl ResultListener {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ListenerState {
                expected: 1,
                results: Vec::new(),
                exception: None,
                failed: false,
                dispatching: false,
                on_success: None,
                on_timeout: None,
            }),
            notify: Notify::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn on_success(self, callback: impl FnOnce(&[Message]) + Send + 'static) -> Self {
        self.state.lock().on_success = Some(Box::new(callback));
        self
    }

    pub fn on_timeout(self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.state.lock().on_timeout = Some(Box::new(callback));
        self
    }

    /// Expect `count` more answers.
    pub fn add_recipients(&self, count: usize) {
        let fire = {
            let mut state = self.state.lock();
            state.expected += count;
            state.take_success()
        };
        self.finish_update(fire);
    }

    /// Hold completion until [`finish_dispatch`](Self::finish_dispatch).
    pub fn begin_dispatch(&self) {
        self.state.lock().dispatching = true;
    }

    /// Expect one answer per reached receiver and allow completion.
    pub fn finish_dispatch(&self, reached: usize) {
        let fire = {
            let mut state = self.state.lock();
            state.dispatching = false;
            state.expected += reached.saturating_sub(1);
            state.take_success()
        };
        self.finish_update(fire);
    }

    fn finish_update(&self, fire: Option<(SuccessCallback, Vec<Message>)>) {
        if let Some((callback, results)) = fire {
            callback(&results);
        }
        self.notify.notify_waiters();
    }

    pub fn expected(&self) -> usize {
        self.state.lock().expected
    }

    pub fn num_results(&self) -> usize {
        self.state.lock().results.len()
    }

    pub fn results(&self) -> Vec<Message> {
        self.state.lock().results.clone()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn status(&self) -> ListenerStatus {
        let state = self.state.lock();
        if state.failed {
            ListenerStatus::Failed
        } else if state.is_complete() {
            ListenerStatus::Success
        } else if Instant::now() >= self.deadline {
            ListenerStatus::TimedOut
        } else {
            ListenerStatus::Waiting
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status() != ListenerStatus::Waiting
    }

    /// Record an answer. Returns false when it arrived too late.
    pub fn collect_answer(&self, answer: Message) -> bool {
        if Instant::now() >= self.deadline {
            debug!(message_id = answer.id(), "Dropping answer received after deadline");
            return false;
        }
        let fire = {
            let mut state = self.state.lock();
            state.results.push(answer);
            state.take_success()
        };
        self.finish_update(fire);
        true
    }

    /// Record a delivery failure; waiters return it instead of waiting further.
    pub fn collect_exception(&self, err: NodeError) {
        {
            let mut state = self.state.lock();
            state.exception = Some(err);
            state.failed = true;
        }
        self.notify.notify_waiters();
    }

    /// Fire the timeout callback if the deadline passed without enough answers.
    pub fn check_timeout(&self) -> bool {
        if self.status() != ListenerStatus::TimedOut {
            return false;
        }
        let callback = self.state.lock().on_timeout.take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    pub async fn wait_for_one_answer(&self) -> Result<Message, NodeError> {
        self.wait_until(|state| state.results.first().cloned()).await
    }

    pub async fn wait_for_all_answers(&self) -> Result<Vec<Message>, NodeError> {
        self.wait_until(|state| state.is_complete().then(|| state.results.clone()))
        .await
    }

    async fn wait_until<T>(
        &self,
        ready: impl Fn(&ListenerState) -> Option<T>,
    ) -> Result<T, NodeError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(err) = state.exception.take() {
                    return Err(err);
                }
                if let Some(value) = ready(&state) {
                    return Ok(value);
                }
            }

            if tokio::time::timeout_at(self.deadline, notified).await.is_err() {
                self.check_timeout();
                let state = self.state.lock();
                return Err(NodeError::Timeout(format!(
                    "received {} of {} expected answers",
                    state.results.len(),
                    state.expected
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, UserAgent};
    use crate::crypto::KdfParams;
    use crate::message::MessageContent;
    use crate::types::AgentId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn answer() -> Message {
        let agent: Agent = UserAgent::create_with_kdf("p", KdfParams::new(256, 1, 1))
            .unwrap()
            .into();
        Message::new(&agent, AgentId(1), MessageContent::Pong(0), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_single_answer_succeeds() {
        let listener = Arc::new(ResultListener::new(Duration::from_secs(5)));
        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.wait_for_one_answer().await })
        };
        tokio::task::yield_now().await;
        assert!(listener.collect_answer(answer()));
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(listener.status(), ListenerStatus::Success);
    }

    #[tokio::test]
    async fn test_broadcast_waits_for_all() {
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();
        let listener = ResultListener::new(Duration::from_secs(5)).on_success(move |results| {
            counter.fetch_add(results.len(), Ordering::SeqCst);
        });
        listener.add_recipients(2);
        assert_eq!(listener.expected(), 3);

        listener.collect_answer(answer());
        listener.collect_answer(answer());
        assert_eq!(listener.status(), ListenerStatus::Waiting);
        listener.collect_answer(answer());
        assert_eq!(listener.status(), ListenerStatus::Success);
        assert_eq!(listener.wait_for_all_answers().await.unwrap().len(), 3);
        assert_eq!(successes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_answers_during_dispatch_wait_for_the_receiver_count() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let listener = {
            let calls = calls.clone();
            let seen = seen.clone();
            ResultListener::new(Duration::from_secs(5)).on_success(move |results| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.store(results.len(), Ordering::SeqCst);
            })
        };

        listener.begin_dispatch();
        listener.collect_answer(answer());
        assert_eq!(listener.status(), ListenerStatus::Waiting);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        listener.finish_dispatch(3);
        assert_eq!(listener.expected(), 3);
        assert_eq!(listener.status(), ListenerStatus::Waiting);
        listener.collect_answer(answer());
        listener.collect_answer(answer());
        assert_eq!(listener.status(), ListenerStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_all_answers_before_dispatch_ends() {
        let calls = Arc::new(AtomicUsize::new(0));
        let listener = {
            let calls = calls.clone();
            ResultListener::new(Duration::from_secs(5)).on_success(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        listener.begin_dispatch();
        listener.collect_answer(answer());
        listener.collect_answer(answer());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        listener.finish_dispatch(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(listener.wait_for_all_answers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_times_out_with_partial_results() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let listener = ResultListener::new(Duration::from_millis(50)).on_timeout(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        listener.add_recipients(1);
        listener.collect_answer(answer());

        let err = listener.wait_for_all_answers().await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout(_)));
        assert_eq!(listener.status(), ListenerStatus::TimedOut);
        assert!(!listener.collect_answer(answer()));
        assert_eq!(listener.num_results(), 1);

        listener.check_timeout();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exception_wakes_waiter() {
        let listener = Arc::new(ResultListener::new(Duration::from_secs(5)));
        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.wait_for_one_answer().await })
        };
        tokio::task::yield_now().await;
        listener.collect_exception(NodeError::NoReceiver(4));
        assert!(matches!(waiter.await.unwrap(), Err(NodeError::NoReceiver(4))));
    }
}
