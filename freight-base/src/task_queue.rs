use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender};

#[derive(Debug)]
enum QueueSignal {
    // A dispatch cycle was requested (push on an idle queue, resume, etc.)
    Pump,
    // A dispatched worker signalled completion via its token
    TaskDone,
    // A dispatched worker dropped its token without completing it
    TaskAbandoned,
}

/// Type that allows a worker to signal that its dispatched item has finished.
/// Completing the token frees the worker slot and re-triggers dispatch so the
/// slot is reused immediately.
///
/// Completion consumes the token, so a worker cannot signal twice. Dropping a
/// token without completing it is reported as an abandonment and still frees
/// the slot, so a buggy worker cannot wedge the queue.
pub struct TaskToken {
    signal_tx: Option<Sender<QueueSignal>>,
}

impl TaskToken {
    fn new(signal_tx: Sender<QueueSignal>) -> Self {
        Self {
            signal_tx: Some(signal_tx),
        }
    }

    /// Signals that the dispatched item has finished, successfully or not.
    pub fn complete(mut self) {
        if let Some(signal_tx) = self.signal_tx.take() {
            let _ = signal_tx.send(QueueSignal::TaskDone);
        }
    }
}

impl Drop for TaskToken {
    fn drop(&mut self) {
        if let Some(signal_tx) = self.signal_tx.take() {
            let _ = signal_tx.send(QueueSignal::TaskAbandoned);
        }
    }
}

impl std::fmt::Debug for TaskToken {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TaskToken")
            .field("completed", &self.signal_tx.is_none())
            .finish()
    }
}

type QueueHook = Box<dyn FnMut()>;

#[derive(Default)]
struct QueueHooks {
    saturated: Option<QueueHook>,
    unsaturated: Option<QueueHook>,
    drain: Option<QueueHook>,
}

/// Concurrency-limited FIFO scheduler over opaque work items.
///
/// The queue has no knowledge of what it schedules: dispatch hands each item
/// to the worker callback passed to [`TaskQueue::pump`] together with a
/// [`TaskToken`]. At most `concurrency` tokens are outstanding at any instant.
///
/// Dispatch is always deferred through an internal channel. `push` never runs
/// the worker on the caller's stack, so pushing many items in a tight loop
/// cannot recurse; the owner drives the queue by calling `pump` from its own
/// update loop.
///
/// Queues are created paused. Call [`TaskQueue::resume`] to begin dispatching.
pub struct TaskQueue<T> {
    tasks: VecDeque<T>,
    concurrency: usize,
    running: usize,
    paused: bool,
    // Edge-trigger state for the saturated hook
    saturated_fired: bool,
    pump_scheduled: bool,
    hooks: QueueHooks,
    signal_tx: Sender<QueueSignal>,
    signal_rx: Receiver<QueueSignal>,
}

impl<T> TaskQueue<T> {
    pub fn new(concurrency: usize) -> Self {
        assert!(concurrency > 0, "task queue concurrency must be positive");
        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        Self {
            tasks: VecDeque::new(),
            concurrency,
            running: 0,
            paused: true,
            saturated_fired: false,
            pump_scheduled: false,
            hooks: QueueHooks::default(),
            signal_tx,
            signal_rx,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True iff no pending items and zero running workers.
    pub fn idle(&self) -> bool {
        self.tasks.is_empty() && self.running == 0
    }

    /// Appends an item at the back of the queue and schedules a dispatch
    /// cycle if none is pending.
    pub fn push(
        &mut self,
        item: T,
    ) {
        self.tasks.push_back(item);
        self.schedule_pump();
    }

    /// Priority insertion at the front of the queue.
    pub fn unshift(
        &mut self,
        item: T,
    ) {
        self.tasks.push_front(item);
        self.schedule_pump();
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Clears the paused flag and re-triggers dispatch once per unit of
    /// concurrency, restoring full parallelism rather than a single tick.
    pub fn resume(&mut self) {
        self.paused = false;
        self.pump_scheduled = true;
        for _ in 0..self.concurrency {
            let _ = self.signal_tx.send(QueueSignal::Pump);
        }
    }

    /// Hard reset: pending items are dropped without their workers ever
    /// running, the running counter is zeroed, and the drain hook is disabled
    /// until reconfigured.
    pub fn kill(&mut self) {
        let dropped = self.tasks.len();
        if dropped > 0 || self.running > 0 {
            log::debug!(
                "task queue killed, dropping {} pending and {} running",
                dropped,
                self.running
            );
        }
        self.tasks.clear();
        self.running = 0;
        self.saturated_fired = false;
        self.hooks.drain = None;
        // Stale signals from outstanding tokens must not be misread as
        // completions of the next generation of work
        while self.signal_rx.try_recv().is_ok() {}
    }

    /// Fires once when dispatch reaches the concurrency cap.
    pub fn on_saturated(
        &mut self,
        hook: impl FnMut() + 'static,
    ) {
        self.hooks.saturated = Some(Box::new(hook));
    }

    /// Fires when running workers drop back into the buffer band
    /// (`concurrency / 4`).
    pub fn on_unsaturated(
        &mut self,
        hook: impl FnMut() + 'static,
    ) {
        self.hooks.unsaturated = Some(Box::new(hook));
    }

    /// Fires when a dispatch round leaves the queue idle.
    pub fn on_drain(
        &mut self,
        hook: impl FnMut() + 'static,
    ) {
        self.hooks.drain = Some(Box::new(hook));
    }

    fn schedule_pump(&mut self) {
        if !self.pump_scheduled {
            self.pump_scheduled = true;
            let _ = self.signal_tx.send(QueueSignal::Pump);
        }
    }

    fn buffer(&self) -> usize {
        self.concurrency / 4
    }

    /// Processes deferred signals and dispatches while capacity allows.
    /// Returns true if any signal was handled or any item dispatched.
    pub fn pump<F: FnMut(T, TaskToken)>(
        &mut self,
        mut worker: F,
    ) -> bool {
        self.pump_scheduled = false;

        let mut worked = false;
        let mut completed = false;
        while let Ok(signal) = self.signal_rx.try_recv() {
            worked = true;
            match signal {
                QueueSignal::Pump => {}
                QueueSignal::TaskDone => {
                    completed = true;
                    self.finish_one();
                }
                QueueSignal::TaskAbandoned => {
                    log::error!("a task token was dropped without being completed");
                    completed = true;
                    self.finish_one();
                }
            }
        }

        if !worked {
            return false;
        }

        let mut dispatched = false;
        while !self.paused && self.running < self.concurrency {
            let Some(item) = self.tasks.pop_front() else {
                break;
            };
            self.running += 1;
            dispatched = true;
            if self.running == self.concurrency && !self.saturated_fired {
                self.saturated_fired = true;
                if let Some(hook) = self.hooks.saturated.as_mut() {
                    hook();
                }
            }
            worker(item, TaskToken::new(self.signal_tx.clone()));
        }

        if (dispatched || completed) && self.idle() {
            if let Some(hook) = self.hooks.drain.as_mut() {
                hook();
            }
        }

        true
    }

    fn finish_one(&mut self) {
        if self.running == 0 {
            // Straggler token from before a kill()
            log::trace!("task completion after queue reset, ignoring");
            return;
        }
        self.running -= 1;
        if self.running < self.concurrency {
            self.saturated_fired = false;
        }
        if self.running == self.buffer() {
            if let Some(hook) = self.hooks.unsaturated.as_mut() {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    // Pumps until no signals remain, collecting dispatched items and their
    // tokens for the test to complete by hand.
    fn pump_collect(queue: &mut TaskQueue<&'static str>) -> Vec<(&'static str, TaskToken)> {
        let mut collected = Vec::new();
        while queue.pump(|item, token| collected.push((item, token))) {}
        collected
    }

    #[test]
    fn dispatch_is_deferred_until_pumped() {
        let mut queue = TaskQueue::new(2);
        queue.resume();
        queue.push("a");

        // Nothing ran yet, only a deferred signal exists
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 1);

        let dispatched = pump_collect(&mut queue);
        assert_eq!(dispatched.len(), 1);
        assert_eq!(queue.running(), 1);
    }

    #[test]
    fn running_never_exceeds_concurrency() {
        let mut queue = TaskQueue::new(2);
        queue.resume();
        for item in ["a", "b", "c", "d"] {
            queue.push(item);
        }

        let mut in_flight = pump_collect(&mut queue);
        assert_eq!(queue.running(), 2);
        assert_eq!(queue.pending(), 2);
        assert_eq!(
            in_flight.iter().map(|(item, _)| *item).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        // Completing one frees a slot and the next item dispatches
        let (_, token) = in_flight.remove(0);
        token.complete();
        let next = pump_collect(&mut queue);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].0, "c");
        assert_eq!(queue.running(), 2);
    }

    #[test]
    fn unshift_dispatches_first() {
        let mut queue = TaskQueue::new(1);
        queue.resume();
        queue.push("second");
        queue.unshift("first");

        let dispatched = pump_collect(&mut queue);
        assert_eq!(dispatched[0].0, "first");
    }

    #[test]
    fn queue_starts_paused() {
        let mut queue = TaskQueue::new(2);
        queue.push("a");
        assert!(pump_collect(&mut queue).is_empty());
        assert_eq!(queue.running(), 0);

        queue.resume();
        assert_eq!(pump_collect(&mut queue).len(), 1);
    }

    #[test]
    fn resume_restores_full_parallelism() {
        let mut queue = TaskQueue::new(3);
        queue.resume();
        for item in ["a", "b", "c"] {
            queue.push(item);
        }
        let in_flight = pump_collect(&mut queue);
        assert_eq!(in_flight.len(), 3);

        queue.pause();
        for item in ["d", "e", "f"] {
            queue.push(item);
        }
        for (_, token) in in_flight {
            token.complete();
        }
        // Paused: completions are absorbed but nothing dispatches
        assert!(pump_collect(&mut queue).is_empty());
        assert_eq!(queue.running(), 0);

        queue.resume();
        // All three slots refill, not just one
        assert_eq!(pump_collect(&mut queue).len(), 3);
    }

    #[test]
    fn kill_drops_pending_without_running_workers() {
        let mut queue = TaskQueue::new(1);
        queue.resume();
        queue.push("a");
        let in_flight = pump_collect(&mut queue);
        queue.push("never-runs");

        queue.kill();
        assert!(queue.idle());

        // The straggler token from before the kill must not corrupt counts
        for (_, token) in in_flight {
            token.complete();
        }
        assert!(pump_collect(&mut queue).is_empty() || queue.running() == 0);
        assert_eq!(queue.running(), 0);
    }

    #[test]
    fn abandoned_token_frees_the_slot() {
        let mut queue = TaskQueue::new(1);
        queue.resume();
        queue.push("a");
        queue.push("b");

        let in_flight = pump_collect(&mut queue);
        assert_eq!(in_flight.len(), 1);
        drop(in_flight);

        // Dropping the token without complete() still releases the slot
        let next = pump_collect(&mut queue);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].0, "b");
    }

    #[test]
    fn saturated_unsaturated_and_drain_hooks() {
        let saturated = Rc::new(RefCell::new(0));
        let unsaturated = Rc::new(RefCell::new(0));
        let drained = Rc::new(RefCell::new(0));

        let mut queue = TaskQueue::new(2);
        {
            let saturated = saturated.clone();
            queue.on_saturated(move || *saturated.borrow_mut() += 1);
        }
        {
            let unsaturated = unsaturated.clone();
            queue.on_unsaturated(move || *unsaturated.borrow_mut() += 1);
        }
        {
            let drained = drained.clone();
            queue.on_drain(move || *drained.borrow_mut() += 1);
        }

        queue.resume();
        queue.push("a");
        queue.push("b");
        let in_flight = pump_collect(&mut queue);
        assert_eq!(*saturated.borrow(), 1);

        for (_, token) in in_flight {
            token.complete();
        }
        let _ = pump_collect(&mut queue);
        // concurrency 2 has a zero-width buffer band, so unsaturated fires
        // when the last worker finishes
        assert_eq!(*unsaturated.borrow(), 1);
        assert!(queue.idle());

        // Drain fires when a dispatch round leaves the queue idle
        queue.push("c");
        let round = pump_collect(&mut queue);
        for (_, token) in round {
            token.complete();
        }
        queue.push("d");
        let round = pump_collect(&mut queue);
        assert_eq!(round.len(), 1);
        round.into_iter().for_each(|(_, token)| token.complete());
        let _ = pump_collect(&mut queue);
        assert!(queue.idle());
        assert!(*drained.borrow() >= 1);
    }

    #[test]
    fn double_completion_is_impossible_by_construction() {
        let mut queue = TaskQueue::new(1);
        queue.resume();
        queue.push("a");
        let mut in_flight = pump_collect(&mut queue);
        let (_, token) = in_flight.remove(0);

        // complete() consumes the token; this is the whole guard
        token.complete();
        let _ = pump_collect(&mut queue);
        assert_eq!(queue.running(), 0);
    }
}
