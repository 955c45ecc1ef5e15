use crate::context::TrapFrame;
use crate::manager::ProcessManager;
use crate::process::Pid;
use kernel_memory_addresses::PhysicalFrame;
use kernel_vmem::PhysMapper;
use log::trace;

/// The privileged operations a context switch needs from the CPU.
pub trait Cpu {
    /// Load `root` as the active page-table root (`CR3`).
    fn switch_address_space(&mut self, root: PhysicalFrame);

    /// The context resumed when no process is ready: a ring-0 `sti; hlt`
    /// loop on its own stack.
    fn idle_context(&self) -> TrapFrame;
}

/// Round-robin scheduler with a fixed quantum in timer ticks.
#[derive(Debug)]
pub struct Scheduler {
    quantum: u32,
    remaining: u32,
    ticks: u64,
    active_root: Option<PhysicalFrame>,
}

impl Scheduler {
    #[must_use]
    pub const fn new(quantum: u32) -> Self {
        let quantum = if quantum == 0 { 1 } else { quantum };
        Self {
            quantum,
            remaining: quantum,
            ticks: 0,
            active_root: None,
        }
    }

    /// Timer ticks seen so far.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The page-table root last loaded through [`Cpu::switch_address_space`].
    #[must_use]
    pub const fn active_root(&self) -> Option<PhysicalFrame> {
        self.active_root
    }

    /// Initial dispatch. Nothing is saved; the returned frame is what the
    /// CPU should enter.
    pub fn start<M: PhysMapper, C: Cpu>(&mut self, pm: &mut ProcessManager<'_, M>, cpu: &mut C) -> TrapFrame {
        let mut frame = cpu.idle_context();
        self.reschedule(pm, cpu, &mut frame);
        frame
    }

    /// Handle one timer tick with `frame` being the interrupted state.
    ///
    /// When the quantum of the current process is used up, its state is
    /// saved, it goes to the back of the ready queue, and `frame` is
    /// overwritten with the next process's context. Returns the PID now
    /// running, or `None` when idle.
    pub fn on_tick<M: PhysMapper, C: Cpu>(
        &mut self,
        pm: &mut ProcessManager<'_, M>,
        cpu: &mut C,
        frame: &mut TrapFrame,
    ) -> Option<Pid> {
        self.ticks += 1;
        if pm.current().is_some() {
            if self.remaining > 1 {
                self.remaining -= 1;
                return pm.current();
            }
            pm.save_current(frame);
            pm.preempt_current();
        } else if pm.ready_pids().next().is_none() {
            return None;
        }
        self.reschedule(pm, cpu, frame)
    }

    /// Dispatch the next ready process into `frame`, or the idle context if
    /// none is ready. The caller has already dealt with the previous
    /// process (saved and requeued it, or made it a zombie).
    pub fn reschedule<M: PhysMapper, C: Cpu>(
        &mut self,
        pm: &mut ProcessManager<'_, M>,
        cpu: &mut C,
        frame: &mut TrapFrame,
    ) -> Option<Pid> {
        self.remaining = self.quantum;
        let next = pm
            .dequeue()
            .and_then(|pid| pm.set_running(pid).map(|context| (pid, context)));
        if let Some((pid, context)) = next {
            self.activate(cpu, context.root);
            *frame = context.frame;
            trace!("dispatch {pid} at {:#x}", frame.rip);
            Some(pid)
        } else {
            self.activate(cpu, pm.kernel_root());
            *frame = cpu.idle_context();
            trace!("idle");
            None
        }
    }

    fn activate<C: Cpu>(&mut self, cpu: &mut C, root: PhysicalFrame) {
        if self.active_root != Some(root) {
            cpu.switch_address_space(root);
            self.active_root = Some(root);
        }
    }
}
