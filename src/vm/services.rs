//! VM services reachable from generated code.
//!
//! Every service has the same native signature so one trampoline shape
//! serves them all: the scheduler pointer followed by P0..P3.

use serde::{Deserialize, Serialize};

use super::scheduler::{Scheduler, TaskId};

/// Native entry of a service.
pub type ServiceFn = unsafe extern "C" fn(*const Scheduler, u32, u32, u32, u32) -> u32;

/// Task services a module can import through its constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Yield,
    Kill,
    Create,
    Dispose,
    Send,
    Receive,
    ReceiveAny,
    SetStackSize,
    Alive,
    This,
}

impl Service {
    pub const COUNT: usize = 10;

    pub const ALL: [Service; Self::COUNT] = [
        Service::Yield,
        Service::Kill,
        Service::Create,
        Service::Dispose,
        Service::Send,
        Service::Receive,
        Service::ReceiveAny,
        Service::SetStackSize,
        Service::Alive,
        Service::This,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Service::Yield => "task_yield",
            Service::Kill => "task_kill_current",
            Service::Create => "task_create",
            Service::Dispose => "task_dispose",
            Service::Send => "task_send",
            Service::Receive => "task_receive",
            Service::ReceiveAny => "task_receive_any",
            Service::SetStackSize => "task_set_stack_size",
            Service::Alive => "task_alive",
            Service::This => "task_this",
        }
    }

    /// Number of parameter registers (P0 onward) the service reads.
    pub fn arg_count(self) -> usize {
        match self {
            Service::Yield | Service::Kill | Service::Receive | Service::This => 0,
            Service::Dispose | Service::ReceiveAny | Service::SetStackSize | Service::Alive => 1,
            Service::Send => 2,
            Service::Create => 4,
        }
    }

    /// Whether the result is written back to R0.
    pub fn returns_value(self) -> bool {
        matches!(
            self,
            Service::Create | Service::Receive | Service::ReceiveAny | Service::Alive | Service::This
        )
    }

    pub fn entry(self) -> ServiceFn {
        match self {
            Service::Yield => service_yield,
            Service::Kill => service_kill,
            Service::Create => service_create,
            Service::Dispose => service_dispose,
            Service::Send => service_send,
            Service::Receive => service_receive,
            Service::ReceiveAny => service_receive_any,
            Service::SetStackSize => service_set_stack_size,
            Service::Alive => service_alive,
            Service::This => service_this,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// # Safety
/// `sched` must point at a live scheduler.
unsafe fn scheduler<'a>(sched: *const Scheduler) -> &'a Scheduler {
    unsafe { &*sched }
}

unsafe extern "C" fn service_yield(sched: *const Scheduler, _: u32, _: u32, _: u32, _: u32) -> u32 {
    unsafe { scheduler(sched) }.yield_current();
    0
}

unsafe extern "C" fn service_kill(sched: *const Scheduler, _: u32, _: u32, _: u32, _: u32) -> u32 {
    unsafe { scheduler(sched) }.kill_current();
    0
}

unsafe extern "C" fn service_create(sched: *const Scheduler, entry: u32, p0: u32, p1: u32, p2: u32) -> u32 {
    let sched = unsafe { scheduler(sched) };
    match sched.create_task(entry, p0, p1, p2) {
        Ok(id) => id,
        Err(err) => {
            sched.fault(err);
            0
        }
    }
}

unsafe extern "C" fn service_dispose(sched: *const Scheduler, id: u32, _: u32, _: u32, _: u32) -> u32 {
    let sched = unsafe { scheduler(sched) };
    if let Err(err) = sched.dispose(id as TaskId) {
        sched.fault(err);
    }
    0
}

unsafe extern "C" fn service_send(sched: *const Scheduler, to: u32, value: u32, _: u32, _: u32) -> u32 {
    let sched = unsafe { scheduler(sched) };
    if let Err(err) = sched.send(to as TaskId, value) {
        sched.fault(err);
    }
    0
}

unsafe extern "C" fn service_receive(sched: *const Scheduler, _: u32, _: u32, _: u32, _: u32) -> u32 {
    unsafe { scheduler(sched) }.receive(None)
}

unsafe extern "C" fn service_receive_any(sched: *const Scheduler, from: u32, _: u32, _: u32, _: u32) -> u32 {
    unsafe { scheduler(sched) }.receive(Some(from as TaskId))
}

unsafe extern "C" fn service_set_stack_size(sched: *const Scheduler, size: u32, _: u32, _: u32, _: u32) -> u32 {
    unsafe { scheduler(sched) }.set_stack_size(i64::from(size as i32));
    0
}

unsafe extern "C" fn service_alive(sched: *const Scheduler, id: u32, _: u32, _: u32, _: u32) -> u32 {
    u32::from(unsafe { scheduler(sched) }.is_alive(id as TaskId))
}

unsafe extern "C" fn service_this(sched: *const Scheduler, _: u32, _: u32, _: u32, _: u32) -> u32 {
    unsafe { scheduler(sched) }.current().unwrap_or(u32::MAX)
}
