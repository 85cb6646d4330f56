//! The pool-of-state-machines pipeline runtime.
//!
//! Each pipeline stage is a pool of identical state machines sharing a
//! weighted bounded pending-input queue and a bound on concurrently
//! active machines. All pool bookkeeping for every stage runs on one
//! shared strand, so pools need no internal locking discipline beyond
//! their own state mutex (which is never contended across stages).
//!
//! Backpressure: a pool will not dispatch an input unless the next
//! pool's remaining input weight covers the outputs its active machines
//! may still produce plus the weight this input would add. Whenever a
//! pool pops an input off its queue — the moment the preceding pool
//! might be able to make progress again — it kicks the preceding pool
//! with a single `try_run_next` post.
//!
//! Termination: a pool whose queue is empty, with no active machines,
//! whose preceding pool is also idle and out of input, drives its idle
//! machines through `finish_and_exit` (flushing any partial state) and
//! then notifies the next pool so the shutdown cascades downstream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures::future::BoxFuture;

use crate::executor::{ResourceClass, Scheduler, Strand};

/// Cross-pool view used for chaining pools together.
pub trait PoolLink: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn input_weight_remaining(&self) -> u64;
    fn max_simultaneous(&self) -> usize;
    fn is_completely_idle(&self) -> bool;
    fn is_idle_and_not_expecting_input(&self) -> bool;
    fn post_try_run(&self);
}

/// Result of driving a persistent state machine one step.
pub enum MachineStep<M, O> {
    /// Input consumed; the machine is idle again.
    Idle(M),
    /// The machine produced an output. `continuable` means it still
    /// holds buffered input that should be drained before it accepts a
    /// new input.
    Output {
        machine: M,
        output: O,
        continuable: bool,
    },
}

/// What to do with a machine that just went idle.
pub enum InputDoneAction {
    Deactivate,
    ForceFlush,
}

/// Stage behavior for a pool of one-shot machines: each input is
/// processed by a fresh machine which is then discarded.
pub trait OneShotStage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// Weight the eventual output of this input may occupy downstream.
    fn projected_output_weight(&self, input: &Self::Input) -> u64;

    /// Process one input to completion. `None` means no output.
    fn run(self: Arc<Self>, input: Self::Input) -> BoxFuture<'static, Option<Self::Output>>;

    /// Deliver a produced output downstream.
    fn handle_result(&self, output: Self::Output);

    /// The pending queue has drained below half; more input is welcome.
    fn need_more_input(&self) {}
}

/// Stage behavior for a pool of persistent machines: machines are
/// started once and fed inputs until told to finish.
pub trait PersistentStage: Send + Sync + 'static {
    type Machine: Send + 'static;
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn create_machine(&self) -> Self::Machine;

    /// Weight one output of this stage occupies in the next pool.
    fn downstream_weight(&self) -> u64 {
        1
    }

    fn run_input(
        self: Arc<Self>,
        machine: Self::Machine,
        input: Self::Input,
    ) -> BoxFuture<'static, MachineStep<Self::Machine, Self::Output>>;

    /// Drain buffered machine state left over from a previous input.
    fn try_continue(
        self: Arc<Self>,
        machine: Self::Machine,
    ) -> BoxFuture<'static, MachineStep<Self::Machine, Self::Output>>;

    /// Flush partial state without terminating the machine.
    fn force_flush(
        self: Arc<Self>,
        machine: Self::Machine,
    ) -> BoxFuture<'static, MachineStep<Self::Machine, Self::Output>>;

    /// Drive the machine toward its terminal state. Called repeatedly
    /// until it reports `Idle`, at which point it is dropped.
    fn finish_and_exit(
        self: Arc<Self>,
        machine: Self::Machine,
    ) -> BoxFuture<'static, MachineStep<Self::Machine, Self::Output>>;

    /// Deliver a produced output downstream.
    fn handle_output(&self, output: Self::Output);

    /// Decide what happens to a machine that just consumed an input.
    fn input_done_action(&self, _machine: &Self::Machine) -> InputDoneAction {
        InputDoneAction::Deactivate
    }
}

struct OneShotCore<I> {
    pending: VecDeque<(I, u64)>,
    pending_weight: u64,
    running: usize,
    running_output_weight: u64,
    input_finished: bool,
    cascade_notified: bool,
}

/// Pool of one-shot state machines.
pub struct OneShotPool<S: OneShotStage> {
    stage: Arc<S>,
    strand: Strand,
    scheduler: Arc<Scheduler>,
    run_class: ResourceClass,
    max_pending_weight: u64,
    max_simultaneous: usize,
    core: Mutex<OneShotCore<S::Input>>,
    next: OnceLock<Arc<dyn PoolLink>>,
    self_weak: OnceLock<Weak<Self>>,
}

impl<S: OneShotStage> OneShotPool<S> {
    pub fn new(
        stage: Arc<S>,
        strand: Strand,
        scheduler: Arc<Scheduler>,
        run_class: ResourceClass,
        max_pending_weight: u64,
        max_simultaneous: usize,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            stage,
            strand,
            scheduler,
            run_class,
            max_pending_weight,
            max_simultaneous,
            core: Mutex::new(OneShotCore {
                pending: VecDeque::new(),
                pending_weight: 0,
                running: 0,
                running_output_weight: 0,
                input_finished: false,
                cascade_notified: false,
            }),
            next: OnceLock::new(),
            self_weak: OnceLock::new(),
        });
        let _ = pool.self_weak.set(Arc::downgrade(&pool));
        pool
    }

    pub fn set_next_pool(&self, next: Arc<dyn PoolLink>) {
        let _ = self.next.set(next);
    }

    pub fn add_new_input(&self, input: S::Input, weight: u64) {
        {
            let mut core = self.core.lock().unwrap();
            if core.pending_weight + weight > self.max_pending_weight {
                log::debug!(
                    "{} accepting input beyond weight bound ({} + {} > {})",
                    self.stage.name(),
                    core.pending_weight,
                    weight,
                    self.max_pending_weight
                );
            }
            core.pending.push_back((input, weight));
            core.pending_weight += weight;
        }
        self.post_try_run();
    }

    /// No further inputs will arrive; once drained the pool notifies the
    /// next pool so it can begin terminating.
    pub fn notify_input_finished(&self) {
        self.core.lock().unwrap().input_finished = true;
        self.post_try_run();
    }

    fn try_run_next(&self) {
        let mut core = self.core.lock().unwrap();

        if core.running < self.max_simultaneous {
            if let Some((input, _)) = core.pending.front() {
                let projected = self.stage.projected_output_weight(input);
                let fits = match self.next.get() {
                    Some(next) => {
                        next.input_weight_remaining()
                            >= core.running_output_weight + projected
                    }
                    None => true,
                };
                if !fits {
                    log::debug!(
                        "{} will not run another state machine; next pool is too full",
                        self.stage.name()
                    );
                    return;
                }

                let (input, weight) = core.pending.pop_front().unwrap();
                core.pending_weight -= weight;
                core.running += 1;
                core.running_output_weight += projected;
                let need_more =
                    !core.input_finished && core.pending_weight < self.max_pending_weight / 2;
                drop(core);

                if need_more {
                    self.stage.need_more_input();
                }

                let stage = Arc::clone(&self.stage);
                let pool = self.self_weak.get().and_then(Weak::upgrade);
                let strand = self.strand.clone();
                self.scheduler.post(self.run_class, async move {
                    let output = stage.run(input).await;
                    strand.post(async move {
                        if let Some(pool) = pool {
                            pool.handle_done(output, projected);
                        }
                    });
                });
                return;
            }
        }

        // Out of input (or at the machine bound): if the scan is over and
        // nothing is running, tell the next pool so termination cascades.
        if core.input_finished
            && core.pending.is_empty()
            && core.running == 0
            && !core.cascade_notified
        {
            core.cascade_notified = true;
            drop(core);
            if let Some(next) = self.next.get() {
                next.post_try_run();
            }
        }
    }

    fn handle_done(&self, output: Option<S::Output>, projected: u64) {
        {
            let mut core = self.core.lock().unwrap();
            core.running -= 1;
            core.running_output_weight -= projected;
        }
        if let Some(output) = output {
            self.stage.handle_result(output);
        }
        self.try_run_next();
    }

    fn post_try_run(&self) {
        if let Some(pool) = self.self_weak.get().and_then(Weak::upgrade) {
            self.strand.post(async move { pool.try_run_next() });
        }
    }
}

impl<S: OneShotStage> PoolLink for OneShotPool<S> {
    fn name(&self) -> &'static str {
        self.stage.name()
    }

    fn input_weight_remaining(&self) -> u64 {
        let core = self.core.lock().unwrap();
        self.max_pending_weight.saturating_sub(core.pending_weight)
    }

    fn max_simultaneous(&self) -> usize {
        self.max_simultaneous
    }

    fn is_completely_idle(&self) -> bool {
        let core = self.core.lock().unwrap();
        core.pending.is_empty() && core.running == 0
    }

    fn is_idle_and_not_expecting_input(&self) -> bool {
        let core = self.core.lock().unwrap();
        core.pending.is_empty() && core.running == 0 && core.input_finished
    }

    fn post_try_run(&self) {
        OneShotPool::post_try_run(self);
    }
}

struct PersistentCore<I, M> {
    pending: VecDeque<(I, u64)>,
    pending_weight: u64,
    active: usize,
    idle_machines: Vec<M>,
    continuable_machines: Vec<M>,
    input_finished: bool,
    terminating: bool,
    cascade_notified: bool,
}

impl<I, M> PersistentCore<I, M> {
    fn machine_count(&self) -> usize {
        self.active + self.idle_machines.len() + self.continuable_machines.len()
    }
}

/// Pool of persistent state machines.
pub struct PersistentPool<S: PersistentStage> {
    stage: Arc<S>,
    strand: Strand,
    scheduler: Arc<Scheduler>,
    run_class: ResourceClass,
    max_pending_weight: u64,
    max_simultaneous: usize,
    core: Mutex<PersistentCore<S::Input, S::Machine>>,
    preceding: OnceLock<Weak<dyn PoolLink>>,
    next: OnceLock<Arc<dyn PoolLink>>,
    self_weak: OnceLock<Weak<Self>>,
}

impl<S: PersistentStage> PersistentPool<S> {
    pub fn new(
        stage: Arc<S>,
        strand: Strand,
        scheduler: Arc<Scheduler>,
        run_class: ResourceClass,
        max_pending_weight: u64,
        max_simultaneous: usize,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            stage,
            strand,
            scheduler,
            run_class,
            max_pending_weight,
            max_simultaneous,
            core: Mutex::new(PersistentCore {
                pending: VecDeque::new(),
                pending_weight: 0,
                active: 0,
                idle_machines: Vec::new(),
                continuable_machines: Vec::new(),
                input_finished: false,
                terminating: false,
                cascade_notified: false,
            }),
            preceding: OnceLock::new(),
            next: OnceLock::new(),
            self_weak: OnceLock::new(),
        });
        let _ = pool.self_weak.set(Arc::downgrade(&pool));
        pool
    }

    pub fn set_preceding_pool(&self, preceding: &Arc<dyn PoolLink>) {
        let _ = self.preceding.set(Arc::downgrade(preceding));
    }

    pub fn set_next_pool(&self, next: Arc<dyn PoolLink>) {
        let _ = self.next.set(next);
    }

    /// For pools without a preceding pool (tests, standalone use).
    pub fn notify_input_finished(&self) {
        self.core.lock().unwrap().input_finished = true;
        self.post_try_run();
    }

    pub fn add_new_input(&self, input: S::Input, weight: u64) {
        {
            let mut core = self.core.lock().unwrap();
            if core.pending_weight + weight > self.max_pending_weight {
                log::debug!(
                    "{} accepting input beyond weight bound ({} + {} > {})",
                    self.stage.name(),
                    core.pending_weight,
                    weight,
                    self.max_pending_weight
                );
            }
            core.pending.push_back((input, weight));
            core.pending_weight += weight;
        }
        self.post_try_run();
    }

    fn preceding_idle_done(&self) -> bool {
        let input_finished = self.core.lock().unwrap().input_finished;
        self.preceding_idle_done_unlocked(input_finished)
    }

    // Variant safe to call with the core lock held; `input_finished`
    // comes from the already-locked core.
    fn preceding_idle_done_unlocked(&self, input_finished: bool) -> bool {
        match self.preceding.get() {
            Some(weak) => weak
                .upgrade()
                .map(|pool| pool.is_idle_and_not_expecting_input())
                .unwrap_or(true),
            None => input_finished,
        }
    }

    fn next_pool_fits(&self, core: &PersistentCore<S::Input, S::Machine>) -> bool {
        match self.next.get() {
            Some(next) => {
                next.input_weight_remaining()
                    >= (core.active as u64 + 1) * self.stage.downstream_weight()
            }
            None => true,
        }
    }

    fn try_run_next(&self) {
        let mut core = self.core.lock().unwrap();
        if core.terminating {
            drop(core);
            self.notify_next_if_done();
            return;
        }

        // Machines holding leftover buffered input are drained before
        // any new input is dispatched.
        if let Some(machine) = {
            if !core.continuable_machines.is_empty() && self.next_pool_fits(&core) {
                core.continuable_machines.pop()
            } else {
                None
            }
        } {
            core.active += 1;
            drop(core);
            self.spawn_machine_task(self.stage.clone().try_continue(machine));
            return;
        }

        if !core.pending.is_empty() && self.next_pool_fits(&core) {
            let machine = if let Some(machine) = core.idle_machines.pop() {
                Some(machine)
            } else if core.machine_count() < self.max_simultaneous {
                Some(self.stage.create_machine())
            } else {
                None
            };

            if let Some(machine) = machine {
                let (input, weight) = core.pending.pop_front().unwrap();
                core.pending_weight -= weight;
                core.active += 1;
                drop(core);

                // The queue just drained; the preceding pool may have
                // stopped on our backpressure, so kick it once. Input
                // weights vary wildly (bytes for snapshots, slots for
                // bundles), so there is no cheaper local test for
                // whether it can actually make progress.
                if let Some(preceding) = self.preceding.get().and_then(Weak::upgrade) {
                    log::trace!("{} is kicking preceding pool", self.stage.name());
                    preceding.post_try_run();
                }
                self.spawn_machine_task(self.stage.clone().run_input(machine, input));
                return;
            }
            return;
        }

        // Termination: nothing pending, nothing active, and the
        // preceding pool can produce nothing more.
        if core.pending.is_empty()
            && core.active == 0
            && self.preceding_idle_done_unlocked(core.input_finished)
        {
            core.terminating = true;
            let mut machines: Vec<S::Machine> = core.idle_machines.drain(..).collect();
            machines.extend(core.continuable_machines.drain(..));
            core.active += machines.len();
            drop(core);

            if machines.is_empty() {
                self.notify_next_if_done();
            } else {
                log::debug!(
                    "{} terminating {} idle state machines",
                    self.stage.name(),
                    machines.len()
                );
                for machine in machines {
                    self.spawn_terminate_task(machine);
                }
            }
        }
    }

    fn spawn_machine_task(
        &self,
        task: BoxFuture<'static, MachineStep<S::Machine, S::Output>>,
    ) {
        let pool = self.self_weak.get().and_then(Weak::upgrade);
        let strand = self.strand.clone();
        self.scheduler.post(self.run_class, async move {
            let step = task.await;
            strand.post(async move {
                if let Some(pool) = pool {
                    pool.handle_step(step);
                }
            });
        });
    }

    fn spawn_terminate_task(&self, machine: S::Machine) {
        let pool = self.self_weak.get().and_then(Weak::upgrade);
        let stage = Arc::clone(&self.stage);
        let strand = self.strand.clone();
        self.scheduler.post(self.run_class, async move {
            let mut machine = machine;
            loop {
                match stage.clone().finish_and_exit(machine).await {
                    MachineStep::Idle(_) => break,
                    MachineStep::Output {
                        machine: drained,
                        output,
                        ..
                    } => {
                        stage.handle_output(output);
                        machine = drained;
                    }
                }
            }
            strand.post(async move {
                if let Some(pool) = pool {
                    pool.handle_terminated();
                }
            });
        });
    }

    fn handle_step(&self, step: MachineStep<S::Machine, S::Output>) {
        let mut output_to_deliver = None;
        {
            let mut core = self.core.lock().unwrap();
            core.active -= 1;
            match step {
                MachineStep::Idle(machine) => {
                    if core.terminating {
                        core.idle_machines.push(machine);
                    } else {
                        match self.stage.input_done_action(&machine) {
                            InputDoneAction::Deactivate => core.idle_machines.push(machine),
                            InputDoneAction::ForceFlush => {
                                core.active += 1;
                                drop(core);
                                self.spawn_machine_task(self.stage.clone().force_flush(machine));
                                return;
                            }
                        }
                    }
                }
                MachineStep::Output {
                    machine,
                    output,
                    continuable,
                } => {
                    output_to_deliver = Some(output);
                    if continuable {
                        core.continuable_machines.push(machine);
                    } else {
                        core.idle_machines.push(machine);
                    }
                }
            }
        }
        if let Some(output) = output_to_deliver {
            self.stage.handle_output(output);
        }
        self.try_run_next();
    }

    fn handle_terminated(&self) {
        self.core.lock().unwrap().active -= 1;
        self.notify_next_if_done();
    }

    fn notify_next_if_done(&self) {
        let mut core = self.core.lock().unwrap();
        if core.terminating
            && core.pending.is_empty()
            && core.active == 0
            && !core.cascade_notified
        {
            core.cascade_notified = true;
            drop(core);
            if let Some(next) = self.next.get() {
                next.post_try_run();
            }
        }
    }

    fn post_try_run(&self) {
        if let Some(pool) = self.self_weak.get().and_then(Weak::upgrade) {
            self.strand.post(async move { pool.try_run_next() });
        }
    }
}

impl<S: PersistentStage> PoolLink for PersistentPool<S> {
    fn name(&self) -> &'static str {
        self.stage.name()
    }

    fn input_weight_remaining(&self) -> u64 {
        let core = self.core.lock().unwrap();
        self.max_pending_weight.saturating_sub(core.pending_weight)
    }

    fn max_simultaneous(&self) -> usize {
        self.max_simultaneous
    }

    fn is_completely_idle(&self) -> bool {
        let core = self.core.lock().unwrap();
        core.pending.is_empty() && core.active == 0
    }

    fn is_idle_and_not_expecting_input(&self) -> bool {
        if !self.is_completely_idle() {
            return false;
        }
        self.preceding_idle_done()
    }

    fn post_try_run(&self) {
        PersistentPool::post_try_run(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // Head stage: doubles its input, feeds the collector pool.
    struct DoublerStage {
        next: OnceLock<Arc<PersistentPool<CollectorStage>>>,
    }

    impl OneShotStage for DoublerStage {
        type Input = u64;
        type Output = u64;

        fn name(&self) -> &'static str {
            "doubler"
        }

        fn projected_output_weight(&self, _input: &u64) -> u64 {
            1
        }

        fn run(self: Arc<Self>, input: u64) -> BoxFuture<'static, Option<u64>> {
            Box::pin(async move { Some(input * 2) })
        }

        fn handle_result(&self, output: u64) {
            self.next.get().unwrap().add_new_input(output, 1);
        }
    }

    // Persistent stage: sums inputs, emits the running sum every two
    // inputs, flushes the remainder on exit.
    struct CollectorMachine {
        sum: u64,
        count: usize,
    }

    struct CollectorStage {
        outputs: StdMutex<Vec<u64>>,
        machines_created: AtomicUsize,
        flushes: AtomicU64,
    }

    impl PersistentStage for CollectorStage {
        type Machine = CollectorMachine;
        type Input = u64;
        type Output = u64;

        fn name(&self) -> &'static str {
            "collector"
        }

        fn create_machine(&self) -> CollectorMachine {
            self.machines_created.fetch_add(1, Ordering::SeqCst);
            CollectorMachine { sum: 0, count: 0 }
        }

        fn run_input(
            self: Arc<Self>,
            mut machine: CollectorMachine,
            input: u64,
        ) -> BoxFuture<'static, MachineStep<CollectorMachine, u64>> {
            Box::pin(async move {
                machine.sum += input;
                machine.count += 1;
                if machine.count >= 2 {
                    let output = machine.sum;
                    machine.sum = 0;
                    machine.count = 0;
                    MachineStep::Output {
                        machine,
                        output,
                        continuable: false,
                    }
                } else {
                    MachineStep::Idle(machine)
                }
            })
        }

        fn try_continue(
            self: Arc<Self>,
            machine: CollectorMachine,
        ) -> BoxFuture<'static, MachineStep<CollectorMachine, u64>> {
            Box::pin(async move { MachineStep::Idle(machine) })
        }

        fn force_flush(
            self: Arc<Self>,
            machine: CollectorMachine,
        ) -> BoxFuture<'static, MachineStep<CollectorMachine, u64>> {
            self.finish_and_exit(machine)
        }

        fn finish_and_exit(
            self: Arc<Self>,
            mut machine: CollectorMachine,
        ) -> BoxFuture<'static, MachineStep<CollectorMachine, u64>> {
            Box::pin(async move {
                if machine.count > 0 {
                    let output = machine.sum;
                    machine.sum = 0;
                    machine.count = 0;
                    self.flushes.fetch_add(1, Ordering::SeqCst);
                    MachineStep::Output {
                        machine,
                        output,
                        continuable: false,
                    }
                } else {
                    MachineStep::Idle(machine)
                }
            })
        }

        fn handle_output(&self, output: u64) {
            self.outputs.lock().unwrap().push(output);
        }
    }

    fn build_pipeline(
        scheduler: &Arc<Scheduler>,
    ) -> (
        Arc<OneShotPool<DoublerStage>>,
        Arc<PersistentPool<CollectorStage>>,
        Arc<CollectorStage>,
    ) {
        let strand = scheduler.new_strand(ResourceClass::StateMachine);

        let collector_stage = Arc::new(CollectorStage {
            outputs: StdMutex::new(Vec::new()),
            machines_created: AtomicUsize::new(0),
            flushes: AtomicU64::new(0),
        });
        let collector_pool = PersistentPool::new(
            Arc::clone(&collector_stage),
            strand.clone(),
            Arc::clone(scheduler),
            ResourceClass::StateMachine,
            8,
            1,
        );

        let doubler_stage = Arc::new(DoublerStage {
            next: OnceLock::new(),
        });
        let _ = doubler_stage.next.set(Arc::clone(&collector_pool));
        let doubler_pool = OneShotPool::new(
            doubler_stage,
            strand,
            Arc::clone(scheduler),
            ResourceClass::StateMachine,
            100,
            4,
        );

        doubler_pool.set_next_pool(Arc::clone(&collector_pool) as Arc<dyn PoolLink>);
        collector_pool
            .set_preceding_pool(&(Arc::clone(&doubler_pool) as Arc<dyn PoolLink>));

        (doubler_pool, collector_pool, collector_stage)
    }

    #[test]
    fn pipeline_processes_and_flushes_on_termination() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let (doubler_pool, _collector_pool, collector_stage) = build_pipeline(&scheduler);

        for value in 1..=5u64 {
            doubler_pool.add_new_input(value, 1);
        }
        doubler_pool.notify_input_finished();

        scheduler.wait_for_finish();

        // 5 inputs doubled: 2,4,6,8,10; sums of pairs plus one flushed
        // leftover, all through a single collector machine.
        let outputs = collector_stage.outputs.lock().unwrap().clone();
        let total: u64 = outputs.iter().sum();
        assert_eq!(total, 2 + 4 + 6 + 8 + 10);
        assert_eq!(collector_stage.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(collector_stage.machines_created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_run_terminates_cleanly() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let (doubler_pool, collector_pool, collector_stage) = build_pipeline(&scheduler);

        doubler_pool.notify_input_finished();
        scheduler.wait_for_finish();

        assert!(collector_stage.outputs.lock().unwrap().is_empty());
        assert!(collector_pool.is_idle_and_not_expecting_input());
        assert_eq!(collector_stage.machines_created.load(Ordering::SeqCst), 0);
    }

    // Tiny downstream queue: the doubler must stall on backpressure and
    // resume from the collector's kick, with nothing lost.
    #[test]
    fn backpressure_throttles_and_recovers() {
        let scheduler = Scheduler::with_workers(2).unwrap();
        let (doubler_pool, _collector_pool, collector_stage) = build_pipeline(&scheduler);

        for value in 1..=40u64 {
            doubler_pool.add_new_input(value, 1);
        }
        doubler_pool.notify_input_finished();
        scheduler.wait_for_finish();

        let outputs = collector_stage.outputs.lock().unwrap().clone();
        let total: u64 = outputs.iter().sum();
        assert_eq!(total, (1..=40u64).map(|v| v * 2).sum::<u64>());
    }
}
