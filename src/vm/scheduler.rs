//! Cooperative task scheduler.
//!
//! Each task runs on its own host stack (a corosensei coroutine) so guest
//! code can suspend from inside a service call and resume later exactly
//! where it left off. Tasks are resumed in FIFO order from a single ready
//! queue; control returns to the caller of [`Scheduler::run`] once the
//! queue drains.
//!
//! The scheduler state lives in a `RefCell` and is never borrowed across a
//! switch.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::rc::Rc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use thiserror::Error;
use tracing::{debug, error, trace};

use super::context::VmContext;
use crate::config::StackCallbacks;
use crate::isa::Register;

/// 1-based task identifier; `slot + 1`.
pub type TaskId = u32;

/// Runs a task's guest entry routine against its context.
pub type TaskRunner = dyn Fn(&Scheduler, TaskId, u32, *mut VmContext);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task {0} does not exist")]
    InvalidTask(TaskId),
    #[error("no task runner is installed")]
    NoRunner,
    #[error("failed to allocate a {size}-byte host stack: {reason}")]
    HostStack { size: usize, reason: String },
}

/// Why a task handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Yield,
    Kill,
}

type TaskCoroutine = Coroutine<(), Signal, (), DefaultStack>;

struct TaskRecord {
    id: TaskId,
    entry: u32,
    /// Guest stack top handed out by the host, 0 when none.
    stack: u32,
    mailbox: u32,
    context: Box<VmContext>,
    /// Taken out while the task is running.
    coroutine: Option<TaskCoroutine>,
    yielder: *const Yielder<(), Signal>,
    is_entry: bool,
}

impl Drop for TaskRecord {
    fn drop(&mut self) {
        if let Some(coroutine) = self.coroutine.as_mut() {
            if coroutine.started() && !coroutine.done() {
                // SAFETY: guest frames own nothing that needs dropping.
                unsafe { coroutine.force_reset() };
            }
        }
    }
}

struct State {
    tasks: Vec<Option<TaskRecord>>,
    ready: VecDeque<TaskId>,
    current: Option<TaskId>,
    /// Guest stack size requested from the host; negative = host default.
    guest_stack_size: i64,
    host_stack_size: usize,
    callbacks: StackCallbacks,
    userdata: *mut c_void,
    main_context: *mut VmContext,
    entry_result: Option<VmContext>,
    fault: Option<TaskError>,
    runner: Option<Rc<TaskRunner>>,
}

impl State {
    fn task(&self, id: TaskId) -> Option<&TaskRecord> {
        let slot = (id as usize).checked_sub(1)?;
        self.tasks.get(slot)?.as_ref()
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        let slot = (id as usize).checked_sub(1)?;
        self.tasks.get_mut(slot)?.as_mut()
    }

    fn free_slot(&mut self) -> usize {
        match self.tasks.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.tasks.push(None);
                self.tasks.len() - 1
            }
        }
    }
}

pub struct Scheduler {
    state: RefCell<State>,
}

impl Scheduler {
    /// `host_stack_size` is the native stack each task coroutine gets.
    pub fn new(host_stack_size: usize) -> Self {
        Self {
            state: RefCell::new(State {
                tasks: Vec::new(),
                ready: VecDeque::new(),
                current: None,
                guest_stack_size: -1,
                host_stack_size,
                callbacks: StackCallbacks::default(),
                userdata: std::ptr::null_mut(),
                main_context: std::ptr::null_mut(),
                entry_result: None,
                fault: None,
                runner: None,
            }),
        }
    }

    pub fn set_stack_callbacks(&self, callbacks: StackCallbacks) {
        self.state.borrow_mut().callbacks = callbacks;
    }

    /// Userdata handed to the stack callbacks.
    pub fn set_userdata(&self, userdata: *mut c_void) {
        self.state.borrow_mut().userdata = userdata;
    }

    /// Context seen by services when no task is running.
    pub fn set_main_context(&self, context: *mut VmContext) {
        self.state.borrow_mut().main_context = context;
    }

    /// Ignored while a task is running.
    pub fn set_runner(&self, runner: Rc<TaskRunner>) {
        let mut state = self.state.borrow_mut();
        if state.current.is_none() {
            state.runner = Some(runner);
        }
    }

    /// Create a task that starts at `entry` with P0..P2 seeded.
    ///
    /// The scheduler must not move while the task exists.
    pub fn create_task(&self, entry: u32, p0: u32, p1: u32, p2: u32) -> Result<TaskId, TaskError> {
        let (create, userdata, size) = {
            let state = self.state.borrow();
            (state.callbacks.create, state.userdata, state.guest_stack_size)
        };
        // SAFETY: the host installed the callback for this userdata.
        let stack = create.map_or(0, |create| unsafe { create(userdata, size) });

        let mut context = VmContext::new();
        context.set(Register::P0, p0);
        context.set(Register::P1, p1);
        context.set(Register::P2, p2);
        context.set(Register::Sp, stack);
        context.set(Register::Pc, entry);

        let id = self.spawn(entry, stack, context, false)?;
        debug!(id, entry = format_args!("{entry:#x}"), stack, "task created");
        Ok(id)
    }

    /// Create the task that runs the module entry point with a copy of the
    /// main context.
    ///
    /// The stack callbacks are not called: the entry task keeps the SP the
    /// host set up in the main context, and its stack address stays 0 so
    /// release never frees it.
    pub fn create_entry_task(&self, entry: u32) -> Result<TaskId, TaskError> {
        let main = self.state.borrow().main_context;
        let context = if main.is_null() {
            VmContext::new()
        } else {
            // SAFETY: the main context outlives the scheduler run.
            unsafe { *main }
        };
        self.spawn(entry, 0, context, true)
    }

    fn spawn(&self, entry: u32, stack: u32, context: VmContext, is_entry: bool) -> Result<TaskId, TaskError> {
        let mut state = self.state.borrow_mut();
        let host_stack_size = state.host_stack_size;
        let host_stack = DefaultStack::new(host_stack_size).map_err(|err| TaskError::HostStack {
            size: host_stack_size,
            reason: err.to_string(),
        })?;

        let slot = state.free_slot();
        let id = slot as TaskId + 1;
        let sched = self as *const Scheduler;
        let coroutine = Coroutine::with_stack(host_stack, move |yielder: &Yielder<(), Signal>, ()| {
            // SAFETY: tasks never outlive the scheduler that created them.
            unsafe { (*sched).start_task(id, yielder) }
        });

        state.tasks[slot] = Some(TaskRecord {
            id,
            entry,
            stack,
            mailbox: 0,
            context: Box::new(context),
            coroutine: Some(coroutine),
            yielder: std::ptr::null(),
            is_entry,
        });
        state.ready.push_back(id);
        Ok(id)
    }

    /// Body of every task coroutine.
    fn start_task(&self, id: TaskId, yielder: &Yielder<(), Signal>) {
        let started = {
            let mut state = self.state.borrow_mut();
            let runner = state.runner.as_ref().map(Rc::as_ptr);
            match (runner, state.task_mut(id)) {
                (Some(runner), Some(task)) => {
                    task.yielder = yielder;
                    Some((runner, task.entry, &mut *task.context as *mut VmContext))
                }
                (None, Some(_)) => {
                    state.fault.get_or_insert(TaskError::NoRunner);
                    None
                }
                _ => None,
            }
        };
        if let Some((runner, entry, context)) = started {
            trace!(id, entry = format_args!("{entry:#x}"), "task started");
            // SAFETY: the runner stays installed while tasks run, and the
            // boxed context lives as long as the task record.
            unsafe { (*runner)(self, id, entry, context) };
        }
    }

    /// Drive the ready queue until it is empty.
    ///
    /// Returns the first fault a service recorded during the run.
    pub fn run(&self) -> Result<(), TaskError> {
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let Some(id) = state.ready.pop_front() else {
                    break;
                };
                let coroutine = state.task_mut(id).and_then(|task| task.coroutine.take());
                coroutine.map(|coroutine| {
                    state.current = Some(id);
                    (id, coroutine)
                })
            };
            let Some((id, mut coroutine)) = next else {
                continue;
            };

            let result = coroutine.resume(());
            self.state.borrow_mut().current = None;

            match result {
                CoroutineResult::Yield(Signal::Yield) => {
                    let mut state = self.state.borrow_mut();
                    if let Some(task) = state.task_mut(id) {
                        task.coroutine = Some(coroutine);
                        state.ready.push_back(id);
                    }
                }
                CoroutineResult::Yield(Signal::Kill) => {
                    // SAFETY: the killed task is never resumed again.
                    unsafe { coroutine.force_reset() };
                    trace!(id, "task killed");
                    self.release(id);
                }
                CoroutineResult::Return(()) => {
                    trace!(id, "task finished");
                    self.release(id);
                }
            }
        }

        match self.state.borrow_mut().fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Re-enqueue the running task and switch away. No-op outside a task.
    pub fn yield_current(&self) {
        if let Some(yielder) = self.current_yielder() {
            // SAFETY: the yielder belongs to the coroutine we are running on.
            unsafe { (*yielder).suspend(Signal::Yield) };
        }
    }

    /// Terminate the running task. No-op outside a task.
    pub fn kill_current(&self) {
        if let Some(yielder) = self.current_yielder() {
            // SAFETY: as in `yield_current`; the run loop never resumes us.
            unsafe { (*yielder).suspend(Signal::Kill) };
        }
    }

    fn current_yielder(&self) -> Option<*const Yielder<(), Signal>> {
        let state = self.state.borrow();
        let id = state.current?;
        let yielder = state.task(id)?.yielder;
        (!yielder.is_null()).then_some(yielder)
    }

    /// Free a task: release its guest stack, drop its slot and take it off
    /// the ready queue. Disposing the running task kills it.
    pub fn dispose(&self, id: TaskId) -> Result<(), TaskError> {
        if !self.is_alive(id) {
            return Err(TaskError::InvalidTask(id));
        }
        if self.current() == Some(id) {
            self.kill_current();
            return Ok(());
        }
        self.release(id);
        Ok(())
    }

    fn release(&self, id: TaskId) {
        let (record, free, userdata) = {
            let mut state = self.state.borrow_mut();
            let Some(record) = (id as usize)
                .checked_sub(1)
                .and_then(|slot| state.tasks.get_mut(slot))
                .and_then(Option::take)
            else {
                return;
            };
            state.ready.retain(|&ready| ready != id);
            if record.is_entry {
                state.entry_result = Some(*record.context);
            }
            (record, state.callbacks.free, state.userdata)
        };
        if record.stack != 0 {
            if let Some(free) = free {
                // SAFETY: the stack came from the matching create callback.
                unsafe { free(userdata, record.stack) };
            }
        }
        trace!(id = record.id, "task disposed");
    }

    /// Overwrite a task's mailbox.
    pub fn send(&self, to: TaskId, value: u32) -> Result<(), TaskError> {
        let mut state = self.state.borrow_mut();
        let task = state.task_mut(to).ok_or(TaskError::InvalidTask(to))?;
        task.mailbox = value;
        Ok(())
    }

    /// Read a mailbox: the running task's own by default, otherwise the
    /// given task's. Unknown tasks read as 0.
    pub fn receive(&self, from: Option<TaskId>) -> u32 {
        let state = self.state.borrow();
        from.or(state.current)
            .and_then(|id| state.task(id))
            .map_or(0, |task| task.mailbox)
    }

    /// Guest stack size for tasks created from now on, rounded up to a
    /// word. Negative selects the host default.
    pub fn set_stack_size(&self, size: i64) {
        let size = if size < 0 { -1 } else { (size + 3) & !3 };
        self.state.borrow_mut().guest_stack_size = size;
    }

    pub fn stack_size(&self) -> i64 {
        self.state.borrow().guest_stack_size
    }

    pub fn is_alive(&self, id: TaskId) -> bool {
        self.state.borrow().task(id).is_some()
    }

    pub fn current(&self) -> Option<TaskId> {
        self.state.borrow().current
    }

    pub fn task_count(&self) -> usize {
        self.state.borrow().tasks.iter().flatten().count()
    }

    /// Context of the running task, or the main context outside any task.
    pub fn active_context(&self) -> *mut VmContext {
        let mut state = self.state.borrow_mut();
        let main = state.main_context;
        match state.current {
            Some(id) => state
                .task_mut(id)
                .map_or(main, |task| &mut *task.context as *mut VmContext),
            None => main,
        }
    }

    /// Registers the entry task finished with, once it is gone.
    pub fn take_entry_result(&self) -> Option<VmContext> {
        self.state.borrow_mut().entry_result.take()
    }

    /// Record a service failure and kill the calling task.
    pub fn fault(&self, err: TaskError) {
        error!(error = %err, task = ?self.current(), "task service failed");
        self.state.borrow_mut().fault.get_or_insert(err);
        self.kill_current();
    }

    /// Drop every task without running it further.
    pub fn clear(&self) {
        let ids: Vec<TaskId> = self
            .state
            .borrow()
            .tasks
            .iter()
            .flatten()
            .map(|task| task.id)
            .collect();
        for id in ids {
            self.release(id);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn install(sched: &Scheduler, runner: impl Fn(&Scheduler, TaskId, u32, *mut VmContext) + 'static) {
        sched.set_runner(Rc::new(runner));
    }

    #[test]
    fn test_tasks_resume_in_fifo_order() {
        let sched = Scheduler::new(64 * 1024);
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        install(&sched, move |sched, id, _, _| {
            for _ in 0..2 {
                seen.borrow_mut().push(id);
                sched.yield_current();
            }
        });
        for _ in 0..3 {
            sched.create_task(0, 0, 0, 0).unwrap();
        }
        sched.run().unwrap();
        assert_eq!(*log.borrow(), vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn test_parameters_seed_context() {
        let sched = Scheduler::new(64 * 1024);
        let seen = Rc::new(RefCell::new(None));
        let out = seen.clone();
        install(&sched, move |_, _, entry, ctx| {
            let ctx = unsafe { &*ctx };
            *out.borrow_mut() = Some((entry, ctx.get(Register::P0), ctx.get(Register::P2), ctx.get(Register::Pc)));
        });
        sched.create_task(0x40, 7, 8, 9).unwrap();
        sched.run().unwrap();
        assert_eq!(*seen.borrow(), Some((0x40, 7, 9, 0x40)));
    }

    #[test]
    fn test_mailbox() {
        let sched = Scheduler::new(64 * 1024);
        let got = Rc::new(RefCell::new(0));
        let out = got.clone();
        install(&sched, move |sched, id, _, _| {
            if id == 1 {
                sched.send(2, 0xBEEF).unwrap();
            } else {
                *out.borrow_mut() = sched.receive(None);
            }
        });
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.run().unwrap();
        assert_eq!(*got.borrow(), 0xBEEF);
    }

    #[test]
    fn test_receive_from_unknown_task_is_zero() {
        let sched = Scheduler::new(64 * 1024);
        assert_eq!(sched.receive(Some(42)), 0);
        assert_eq!(sched.receive(None), 0);
        assert_eq!(sched.send(42, 1), Err(TaskError::InvalidTask(42)));
    }

    #[test]
    fn test_kill_stops_task() {
        let sched = Scheduler::new(64 * 1024);
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        install(&sched, move |sched, id, _, _| {
            seen.borrow_mut().push(id);
            sched.kill_current();
            seen.borrow_mut().push(100 + id);
        });
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.run().unwrap();
        assert_eq!(*log.borrow(), vec![1]);
        assert!(!sched.is_alive(1));
    }

    #[test]
    fn test_dispose_other_task_and_reuse_slot() {
        let sched = Scheduler::new(64 * 1024);
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        install(&sched, move |sched, id, _, _| {
            seen.borrow_mut().push(id);
            if id == 1 {
                sched.dispose(2).unwrap();
                assert_eq!(sched.dispose(2), Err(TaskError::InvalidTask(2)));
            }
        });
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.run().unwrap();
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(sched.create_task(0, 0, 0, 0).unwrap(), 1);
    }

    #[test]
    fn test_dispose_running_task_kills_it() {
        let sched = Scheduler::new(64 * 1024);
        let reached = Rc::new(RefCell::new(false));
        let flag = reached.clone();
        install(&sched, move |sched, id, _, _| {
            sched.dispose(id).unwrap();
            *flag.borrow_mut() = true;
        });
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.run().unwrap();
        assert!(!*reached.borrow());
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn test_current_and_active_context() {
        let sched = Scheduler::new(64 * 1024);
        let mut main = VmContext::new();
        sched.set_main_context(&mut main);
        assert_eq!(sched.current(), None);
        assert_eq!(sched.active_context(), &mut main as *mut VmContext);

        let seen = Rc::new(RefCell::new(None));
        let out = seen.clone();
        install(&sched, move |sched, id, _, ctx| {
            *out.borrow_mut() = Some((sched.current(), sched.active_context() == ctx, id));
        });
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.run().unwrap();
        assert_eq!(*seen.borrow(), Some((Some(1), true, 1)));
    }

    #[test]
    fn test_entry_task_result_is_kept() {
        let sched = Scheduler::new(64 * 1024);
        let mut main = VmContext::new();
        main.set(Register::P1, 5);
        sched.set_main_context(&mut main);
        install(&sched, |_, _, _, ctx| {
            let ctx = unsafe { &mut *ctx };
            ctx.set(Register::P0, ctx.get(Register::P1) * 3);
        });
        sched.create_entry_task(0).unwrap();
        sched.run().unwrap();
        let result = sched.take_entry_result().unwrap();
        assert_eq!(result.get(Register::P0), 15);
    }

    #[test]
    fn test_fault_is_reported_by_run() {
        let sched = Scheduler::new(64 * 1024);
        install(&sched, |sched, _, _, _| {
            sched.fault(TaskError::InvalidTask(9));
        });
        sched.create_task(0, 0, 0, 0).unwrap();
        assert_eq!(sched.run(), Err(TaskError::InvalidTask(9)));
        assert_eq!(sched.run(), Ok(()));
    }

    #[test]
    fn test_run_without_runner_faults() {
        let sched = Scheduler::new(64 * 1024);
        sched.create_task(0, 0, 0, 0).unwrap();
        assert_eq!(sched.run(), Err(TaskError::NoRunner));
    }

    #[test]
    fn test_stack_callbacks() {
        unsafe extern "C" fn create(userdata: *mut c_void, size: i64) -> u32 {
            let log = unsafe { &mut *(userdata as *mut Vec<i64>) };
            log.push(size);
            0x8000
        }
        unsafe extern "C" fn free(userdata: *mut c_void, stack: u32) {
            let log = unsafe { &mut *(userdata as *mut Vec<i64>) };
            log.push(-(stack as i64));
        }

        let mut log: Vec<i64> = Vec::new();
        let sched = Scheduler::new(64 * 1024);
        sched.set_stack_callbacks(StackCallbacks {
            create: Some(create),
            free: Some(free),
        });
        sched.set_userdata(&mut log as *mut Vec<i64> as *mut c_void);
        sched.set_stack_size(10);
        assert_eq!(sched.stack_size(), 12);
        install(&sched, |_, _, _, ctx| {
            assert_eq!(unsafe { &*ctx }.get(Register::Sp), 0x8000);
        });
        sched.create_task(0, 0, 0, 0).unwrap();
        sched.run().unwrap();
        drop(sched);
        assert_eq!(log, vec![12, -0x8000]);
    }

    #[test]
    fn test_entry_task_keeps_the_main_stack() {
        unsafe extern "C" fn create(userdata: *mut c_void, _size: i64) -> u32 {
            unsafe { *(userdata as *mut u32) += 1 };
            0x8000
        }
        unsafe extern "C" fn free(userdata: *mut c_void, _stack: u32) {
            unsafe { *(userdata as *mut u32) += 100 };
        }

        let mut calls = 0u32;
        let mut main = VmContext::new();
        main.set(Register::Sp, 0x4000);
        let sched = Scheduler::new(64 * 1024);
        sched.set_stack_callbacks(StackCallbacks {
            create: Some(create),
            free: Some(free),
        });
        sched.set_userdata(&mut calls as *mut u32 as *mut c_void);
        sched.set_main_context(&mut main);
        install(&sched, |_, _, _, ctx| {
            assert_eq!(unsafe { &*ctx }.get(Register::Sp), 0x4000);
        });
        sched.create_entry_task(0).unwrap();
        sched.run().unwrap();
        assert_eq!(sched.take_entry_result().map(|ctx| ctx.get(Register::Sp)), Some(0x4000));
        drop(sched);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_yield_outside_task_is_noop() {
        let sched = Scheduler::new(64 * 1024);
        sched.yield_current();
        sched.kill_current();
        assert_eq!(sched.current(), None);
    }
}
