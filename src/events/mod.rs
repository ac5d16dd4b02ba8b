//! Thread-safe event bus with blocking dequeue and a streaming drain.
//!
//! Producers use the typed helpers to record progress; a single consumer
//! drains the queue, typically into a network stream. FIFO order is kept
//! per producer; interleaving across producers is unspecified.

mod event;

pub use event::{EvaluationResult, Event, EventStatus};

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    queue: VecDeque<Event>,
    stopped: bool,
}

#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(event);
        self.ready.notify_one();
    }

    /// Blocks until an event is available or the queue is stopped; drains
    /// pre-stop events before reporting `None`.
    pub fn dequeue(&self) -> Option<Event> {
        let mut inner = self.inner.lock().unwrap();
        while !inner.stopped && inner.queue.is_empty() {
            inner = self.ready.wait(inner).unwrap();
        }
        inner.queue.pop_front()
    }

    /// Non-blocking variant of [`EventQueue::dequeue`].
    pub fn try_dequeue(&self) -> Option<Event> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Unblocks all waiters. Idempotent; later enqueues stay legal but are
    /// not guaranteed a consumer.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        self.ready.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// Drains the queue into `sink` until `stop` takes effect. With an
    /// external mutex the sink runs under it, for the case where several
    /// queues feed one stream. The queue's own lock is never held across
    /// the sink call.
    pub fn bind_writer<F: FnMut(Event)>(&self, mutex: Option<&Mutex<()>>, mut sink: F) {
        while let Some(event) = self.dequeue() {
            match mutex {
                Some(mutex) => {
                    let _guard = mutex.lock().unwrap();
                    sink(event);
                }
                None => sink(event),
            }
        }
    }

    // Typed producer helpers. Each builds one tagged event and enqueues it.

    pub fn compilation_waiting(&self, filename: &str) {
        self.compilation(filename, EventStatus::Waiting, None, false);
    }

    pub fn compilation_running(&self, filename: &str) {
        self.compilation(filename, EventStatus::Running, None, false);
    }

    pub fn compilation_done(&self, filename: &str, errors: &str, from_cache: bool) {
        self.compilation(filename, EventStatus::Done, optional(errors), from_cache);
    }

    pub fn compilation_failure(&self, filename: &str, errors: &str, from_cache: bool) {
        self.compilation(filename, EventStatus::Failure, optional(errors), from_cache);
    }

    pub fn generation_waiting(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Waiting, None, false);
    }

    pub fn generating(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Generating, None, false);
    }

    pub fn generated(&self, testcase: i64, from_cache: bool) {
        self.generation(testcase, EventStatus::Generated, None, from_cache);
    }

    pub fn validating(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Validating, None, false);
    }

    pub fn validated(&self, testcase: i64, from_cache: bool) {
        self.generation(testcase, EventStatus::Validated, None, from_cache);
    }

    pub fn solving(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Solving, None, false);
    }

    pub fn generation_done(&self, testcase: i64, from_cache: bool) {
        self.generation(testcase, EventStatus::Done, None, from_cache);
    }

    pub fn generation_failure(&self, testcase: i64, errors: &str, from_cache: bool) {
        self.generation(testcase, EventStatus::Failure, optional(errors), from_cache);
    }

    pub fn evaluation_waiting(&self, solution: &str, testcase: i64) {
        self.evaluation(solution, testcase, EventStatus::Waiting, None, false);
    }

    pub fn executing(&self, solution: &str, testcase: i64) {
        self.evaluation(solution, testcase, EventStatus::Executing, None, false);
    }

    pub fn executed(&self, solution: &str, testcase: i64, from_cache: bool) {
        self.evaluation(solution, testcase, EventStatus::Executed, None, from_cache);
    }

    pub fn checking(&self, solution: &str, testcase: i64) {
        let event = Event::Checking {
            solution: solution.to_string(),
            testcase,
            status: EventStatus::Checking,
            message: None,
            from_cache: false,
        };
        self.enqueue(event);
    }

    pub fn evaluation_done(
        &self,
        solution: &str,
        testcase: i64,
        result: EvaluationResult,
        from_cache: bool,
    ) {
        self.evaluation(
            solution,
            testcase,
            EventStatus::Done,
            Some(result),
            from_cache,
        );
    }

    pub fn evaluation_failure(
        &self,
        solution: &str,
        testcase: i64,
        result: EvaluationResult,
        from_cache: bool,
    ) {
        self.evaluation(
            solution,
            testcase,
            EventStatus::Failure,
            Some(result),
            from_cache,
        );
    }

    pub fn task_score(&self, solution: &str, score: f32) {
        self.enqueue(Event::TaskScore {
            solution: solution.to_string(),
            score,
        });
    }

    pub fn subtask_score(&self, solution: &str, subtask: i64, score: f32) {
        self.enqueue(Event::SubtaskScore {
            solution: solution.to_string(),
            subtask,
            score,
        });
    }

    pub fn fatal_error(&self, message: &str) {
        self.enqueue(Event::FatalError {
            message: message.to_string(),
        });
    }

    fn compilation(
        &self,
        filename: &str,
        status: EventStatus,
        stderr: Option<String>,
        from_cache: bool,
    ) {
        self.enqueue(Event::Compilation {
            filename: filename.to_string(),
            status,
            stderr,
            from_cache,
        });
    }

    fn generation(
        &self,
        testcase: i64,
        status: EventStatus,
        error: Option<String>,
        from_cache: bool,
    ) {
        self.enqueue(Event::Generation {
            testcase,
            status,
            error,
            from_cache,
        });
    }

    fn evaluation(
        &self,
        solution: &str,
        testcase: i64,
        status: EventStatus,
        result: Option<EvaluationResult>,
        from_cache: bool,
    ) {
        self.enqueue(Event::Evaluation {
            solution: solution.to_string(),
            testcase,
            status,
            result,
            from_cache,
        });
    }
}

fn optional(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fifo_then_stop_returns_none() {
        let queue = EventQueue::new();
        queue.compilation_running("a");
        queue.compilation_done("a", "", false);
        queue.stop();

        assert_eq!(
            queue.dequeue(),
            Some(Event::Compilation {
                filename: "a".into(),
                status: EventStatus::Running,
                stderr: None,
                from_cache: false,
            })
        );
        assert_eq!(
            queue.dequeue(),
            Some(Event::Compilation {
                filename: "a".into(),
                status: EventStatus::Done,
                stderr: None,
                from_cache: false,
            })
        );
        assert_eq!(queue.dequeue(), None);
        // stop is idempotent
        queue.stop();
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_stop_unblocks_waiter() {
        let queue = Arc::new(EventQueue::new());
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.dequeue())
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_enqueue_after_stop_is_legal() {
        let queue = EventQueue::new();
        queue.stop();
        queue.fatal_error("late");
        assert!(matches!(queue.dequeue(), Some(Event::FatalError { .. })));
    }

    #[test]
    fn test_bind_writer_drains_everything() {
        let queue = Arc::new(EventQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for testcase in 0..100 {
                    queue.generating(testcase);
                    queue.generated(testcase, false);
                }
                queue.stop();
            })
        };
        let mutex = Mutex::new(());
        let mut seen = Vec::new();
        queue.bind_writer(Some(&mutex), |event| seen.push(event));
        producer.join().unwrap();
        assert_eq!(seen.len(), 200);
        // Per-producer FIFO: generating(n) precedes generated(n).
        for testcase in 0..100i64 {
            let running = seen
                .iter()
                .position(|e| {
                    matches!(e, Event::Generation { testcase: t, status: EventStatus::Generating, .. } if *t == testcase)
                })
                .unwrap();
            let done = seen
                .iter()
                .position(|e| {
                    matches!(e, Event::Generation { testcase: t, status: EventStatus::Generated, .. } if *t == testcase)
                })
                .unwrap();
            assert!(running < done);
        }
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = Event::Evaluation {
            solution: "sol.cpp".into(),
            testcase: 7,
            status: EventStatus::Done,
            result: Some(EvaluationResult {
                score: 1.0,
                message: "Output is correct".into(),
                cpu_time: 0.5,
                wall_time: 0.6,
                memory_kb: 1024,
            }),
            from_cache: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(serde_json::from_str::<Event>(&json).unwrap(), event);
    }
}
