//! Task arena and round-robin scheduling.
//!
//! Tasks live in a fixed arena keyed by a stable `u32` id; per-CPU state
//! stores only the id of its running task, which keeps the PerCpu/Task
//! relationship acyclic. Each CPU schedules independently with the context
//! switch primitive; cross-CPU coordination happens through the reschedule
//! IPI and the `need_resched` flag consumed at every interrupt tail.

use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::arch::{cpu, percpu};
use crate::error::KernelError;
use crate::task::{context, usermode};

/// Capacity of the task arena.
pub const MAX_TASKS: usize = 32;

/// Size of each task's kernel stack (32 KiB, 16-byte aligned).
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Scheduling state of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// Slot unused; stack reusable.
    Free,
    /// Runnable, waiting for a CPU.
    Ready,
    /// Executing on some CPU.
    Running,
    /// Finished; reclaimed once its CPU has switched away.
    Dead,
}

/// What a fresh task runs when first scheduled.
#[derive(Clone, Copy)]
pub enum TaskEntry {
    /// A kernel function; the task dies when it returns.
    Kernel(fn()),
    /// Drop to ring 3 at `rip` with the given stack and arguments.
    User { rip: u64, rsp: u64, args: [u64; 3] },
}

/// One arena slot.
#[derive(Clone, Copy)]
struct Task {
    state: TaskState,
    /// Saved kernel stack pointer while not running (see `task::context`
    /// for the layout it addresses).
    sp: u64,
    /// Pending first-run entry; taken by the trampoline.
    entry: Option<TaskEntry>,
}

impl Task {
    const FREE: Task = Task {
        state: TaskState::Free,
        sp: 0,
        entry: None,
    };
}

/// An aligned kernel stack.
#[repr(C, align(16))]
struct TaskStack {
    data: [u8; KERNEL_STACK_SIZE],
}

/// Arena stacks. Static so saved stack pointers stay valid for the
/// kernel's lifetime regardless of slot churn.
static mut TASK_STACKS: [TaskStack; MAX_TASKS] = {
    const ZERO: TaskStack = TaskStack {
        data: [0; KERNEL_STACK_SIZE],
    };
    [ZERO; MAX_TASKS]
};

/// The task table. The lock is never held across a context switch: the
/// switch happens on raw pointers extracted under the lock, and the
/// incoming task publishes the outgoing one's state afterwards.
struct TaskTable {
    tasks: [Task; MAX_TASKS],
    /// Round-robin scan position.
    cursor: usize,
}

impl TaskTable {
    const fn new() -> Self {
        Self {
            tasks: [Task::FREE; MAX_TASKS],
            cursor: 0,
        }
    }

    /// Next ready slot in round-robin order, if any.
    fn pick_next(&mut self) -> Option<usize> {
        for i in 0..MAX_TASKS {
            let slot = (self.cursor + i) % MAX_TASKS;
            if self.tasks[slot].state == TaskState::Ready {
                self.cursor = (slot + 1) % MAX_TASKS;
                return Some(slot);
            }
        }
        None
    }
}

static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable::new());

/// Top of the arena stack for `slot` (stacks grow down).
fn stack_top(slot: usize) -> u64 {
    let base = unsafe { core::ptr::addr_of!(TASK_STACKS[slot]) as u64 };
    base + KERNEL_STACK_SIZE as u64
}

// ── Spawning ────────────────────────────────────────────────────

/// Create a kernel task running `f`.
pub fn spawn_kernel(f: fn()) -> Result<u32, KernelError> {
    spawn(TaskEntry::Kernel(f))
}

/// Create a task that enters ring 3 at `rip` on its first run.
///
/// The caller (normally whatever loads user images) must have mapped the
/// code and stack it names.
#[allow(dead_code)]
pub fn spawn_user(rip: u64, rsp: u64, args: [u64; 3]) -> Result<u32, KernelError> {
    spawn(TaskEntry::User { rip, rsp, args })
}

fn spawn(entry: TaskEntry) -> Result<u32, KernelError> {
    // The table lock must never be held with interrupts enabled: the
    // preemption hook at an interrupt tail takes it on the same CPU.
    interrupts::without_interrupts(|| spawn_locked(&mut TASKS.lock(), entry))
}

fn spawn_locked(table: &mut TaskTable, entry: TaskEntry) -> Result<u32, KernelError> {
    let slot = table
        .tasks
        .iter()
        .position(|t| t.state == TaskState::Free)
        .ok_or(KernelError::OutOfMemory)?;

    let sp = unsafe {
        context::seed_kernel_stack(stack_top(slot), task_entry_trampoline as usize as u64)
    };
    table.tasks[slot] = Task {
        state: TaskState::Ready,
        sp,
        entry: Some(entry),
    };
    Ok(slot as u32)
}

// ── First-run trampoline ────────────────────────────────────────

/// Return target of a seeded first-run stack.
///
/// Runs with interrupts disabled (the seeded RFLAGS image clears IF) on
/// the fresh task's own stack.
extern "C" fn task_entry_trampoline() -> ! {
    finish_switch();

    let entry = {
        let mut table = TASKS.lock();
        let id = percpu::current().current_task() as usize;
        table.tasks[id]
            .entry
            .take()
            .expect("first-run task without an entry")
    };

    match entry {
        TaskEntry::Kernel(f) => {
            interrupts::enable();
            f();
            exit_current()
        }
        TaskEntry::User { rip, rsp, args } => unsafe {
            // Hygiene contract: the user GS (none yet, so zero) goes into
            // the shadow MSR; the trampoline's swapgs activates it while
            // parking our PerCpu pointer.
            percpu::stage_user_gs(0);
            usermode::enter_user(rip, rsp, args[0], args[1], args[2])
        },
    }
}

/// Publish the task this CPU just switched away from.
///
/// Runs as the first thing in the incoming context. At this point the
/// outgoing task's `sp` is on record, so making it `Ready` (or reclaiming
/// a dead slot) cannot race another CPU resuming half-saved state.
fn finish_switch() {
    let cpu = percpu::current();
    let prev = cpu.take_prev_task();
    if prev == percpu::NO_TASK {
        return;
    }
    let mut table = TASKS.lock();
    let task = &mut table.tasks[prev as usize];
    match task.state {
        TaskState::Running => task.state = TaskState::Ready,
        TaskState::Dead => *task = Task::FREE,
        _ => {}
    }
}

// ── Scheduling ──────────────────────────────────────────────────

/// Switch to the next ready task, if there is one.
///
/// # Safety
/// Interrupts must be disabled. The caller must be running on a task
/// stack (`current_task != NO_TASK`); CPUs without a task pick work up in
/// [`start_cpu`].
pub unsafe fn do_schedule() {
    let cpu = percpu::current();
    let current = cpu.current_task();
    if current == percpu::NO_TASK {
        return;
    }

    let (old_sp_ptr, new_sp) = {
        let mut table = TASKS.lock();
        let Some(next) = table.pick_next() else {
            return;
        };

        table.tasks[next].state = TaskState::Running;
        cpu.set_prev_task(current);
        cpu.set_current_task(next as u32);
        cpu.set_kernel_stack(stack_top(next));
        cpu.switch_count
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);

        (
            core::ptr::addr_of_mut!(table.tasks[current as usize].sp),
            table.tasks[next].sp,
        )
        // Lock released here, before the switch: the incoming task may
        // need it immediately (trampoline, finish_switch).
    };

    context::context_switch(old_sp_ptr, new_sp);

    // Someone switched back into us; publish whoever they suspended.
    finish_switch();
}

/// Enter the per-CPU scheduling loop; never returns.
///
/// The first task is entered with `context_load`: there is no prior
/// context worth saving, and this CPU's boot stack is simply abandoned.
/// With nothing runnable the CPU naps until an interrupt (timer tick or
/// reschedule IPI) makes work available.
pub fn start_cpu() -> ! {
    let cpu = percpu::current();
    loop {
        interrupts::disable();

        let next = {
            let mut table = TASKS.lock();
            table.pick_next().map(|slot| {
                table.tasks[slot].state = TaskState::Running;
                cpu.set_prev_task(percpu::NO_TASK);
                cpu.set_current_task(slot as u32);
                cpu.set_kernel_stack(stack_top(slot));
                table.tasks[slot].sp
            })
        };

        if let Some(new_sp) = next {
            unsafe {
                context::context_load(new_sp);
            }
        }

        cpu::wait_for_interrupt();
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    let reenable = interrupts::are_enabled();
    interrupts::disable();
    unsafe {
        do_schedule();
    }
    if reenable {
        interrupts::enable();
    }
}

/// Terminate the calling task; never returns.
///
/// The slot is reclaimed by the next task this CPU runs (the stack stays
/// live until the switch away). With nothing else runnable the CPU idles
/// on the dead task's stack until work arrives.
pub fn exit_current() -> ! {
    interrupts::disable();
    {
        let table = &mut *TASKS.lock();
        let id = percpu::current().current_task() as usize;
        table.tasks[id].state = TaskState::Dead;
    }
    loop {
        interrupts::disable();
        unsafe {
            do_schedule();
        }
        cpu::wait_for_interrupt();
    }
}

/// Preemption hook called at the tail of every interrupt.
///
/// Consumes a pending `need_resched`; an idle CPU (no current task) skips
/// the switch; its `start_cpu` loop picks the work up on return from the
/// interrupt.
#[no_mangle]
pub extern "C" fn sched_check_preempt() {
    let Some(cpu) = percpu::try_current() else {
        return;
    };
    if !cpu.take_need_resched() {
        return;
    }
    if cpu.current_task() == percpu::NO_TASK {
        return;
    }
    unsafe {
        do_schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_skips_everything_but_ready() {
        let mut table = TaskTable::new();
        table.tasks[1].state = TaskState::Ready;
        table.tasks[3].state = TaskState::Running;
        table.tasks[4].state = TaskState::Dead;
        table.tasks[5].state = TaskState::Ready;

        assert_eq!(table.pick_next(), Some(1));
        // Cursor advanced past slot 1: next pick wraps to the later slot.
        assert_eq!(table.pick_next(), Some(5));
        table.tasks[1].state = TaskState::Running;
        table.tasks[5].state = TaskState::Running;
        assert_eq!(table.pick_next(), None);
    }

    #[test]
    fn spawn_fills_the_arena_then_reports_exhaustion() {
        fn noop() {}

        // Drive the slot allocator directly on the (static) table; the
        // public wrapper only adds the interrupt guard around the lock.
        let table = &mut *TASKS.lock();
        let mut spawned = 0;
        loop {
            match spawn_locked(table, TaskEntry::Kernel(noop)) {
                Ok(id) => {
                    assert!((id as usize) < MAX_TASKS);
                    spawned += 1;
                }
                Err(e) => {
                    assert_eq!(e, KernelError::OutOfMemory);
                    break;
                }
            }
        }
        assert_eq!(spawned, MAX_TASKS);

        // Every seeded slot must resume into the trampoline with the
        // documented image shape.
        for (slot, task) in table.tasks.iter().enumerate() {
            assert_eq!(task.state, TaskState::Ready);
            assert_eq!(task.sp % 16, 8);
            assert!(task.sp < stack_top(slot));
            let ret = unsafe {
                ((task.sp + (context::SEEDED_STACK_WORDS as u64 - 1) * 8) as *const u64).read()
            };
            assert_eq!(ret, task_entry_trampoline as usize as u64);
        }
    }
}
