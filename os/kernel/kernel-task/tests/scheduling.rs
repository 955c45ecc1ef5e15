//! Process lifecycle and scheduling over simulated physical memory.

use kernel_elf::SegmentFlags;
use kernel_elf::builder::ElfBuilder;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame, VirtualAddress};
use kernel_syscall::{Errno, Sysno};
use kernel_task::{Console, Cpu, Kernel, Pid, ProcessError, ProcessManager, ProcessState, TrapFrame};
use kernel_vmem::test_support::{TestFrames, TestPhys, kernel_root};
use kernel_vmem::{FrameAlloc, VmemError};

const TEXT: u64 = 0x40_0000;
const DATA: u64 = 0x40_1000;
const GREETING: &[u8] = b"hello, world\n";
const IDLE_RIP: u64 = 0xffff_ffff_8000_1000;
const IDLE_STACK: u64 = 0xffff_ffff_8010_0000;

#[derive(Default)]
struct MockCpu {
    roots: Vec<PhysicalFrame>,
}

impl Cpu for MockCpu {
    fn switch_address_space(&mut self, root: PhysicalFrame) {
        self.roots.push(root);
    }

    fn idle_context(&self) -> TrapFrame {
        TrapFrame::kernel(VirtualAddress::new(IDLE_RIP), VirtualAddress::new(IDLE_STACK))
    }
}

#[derive(Default)]
struct Captured(Vec<u8>);

impl Console for Captured {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

type TestKernel<'m> = Kernel<'m, TestPhys, TestFrames, MockCpu, Captured>;

/// Text page of `nop`s, then a data page starting with [`GREETING`] followed
/// by zeroed bss.
fn image() -> Vec<u8> {
    ElfBuilder::new(TEXT)
        .segment(TEXT, &[0x90; 32], 32, SegmentFlags::new().with_read(true).with_execute(true))
        .segment(DATA, GREETING, PAGE_SIZE, SegmentFlags::new().with_read(true).with_write(true))
        .build()
}

fn boot(phys: &TestPhys) -> (TestKernel<'_>, PhysicalFrame) {
    let mut frames = TestFrames::new(phys);
    let (kroot, _) = kernel_root(phys, &mut frames);
    let kernel = Kernel::new(phys, kroot, frames, MockCpu::default(), Captured::default());
    (kernel, kroot)
}

fn syscall(kernel: &mut TestKernel<'_>, frame: &mut TrapFrame, nr: Sysno, args: [u64; 3]) -> i64 {
    frame.rax = nr as u64;
    frame.rdi = args[0];
    frame.rsi = args[1];
    frame.rdx = args[2];
    kernel.handle_syscall(frame);
    frame.rax as i64
}

fn root_of(kernel: &TestKernel<'_>, pid: Pid) -> PhysicalFrame {
    kernel.processes().find_by_pid(pid).unwrap().context().root
}

fn state_of(kernel: &TestKernel<'_>, pid: Pid) -> ProcessState {
    kernel.processes().find_by_pid(pid).unwrap().state()
}

#[test]
fn first_process_starts_at_entry_in_ring_3() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    let init = k.spawn(&image(), None).unwrap();
    assert_eq!(init, Pid::INIT);

    let frame = k.start();
    assert_eq!(frame.rip, TEXT);
    assert_eq!(frame.rsp, 0x0000_7fff_ffff_f000);
    assert_eq!((frame.cs, frame.ss, frame.rflags), (0x23, 0x1b, 0x202));
    assert_eq!(k.processes().current(), Some(init));
    assert_eq!(state_of(&k, init), ProcessState::Running);
    assert_eq!(k.cpu().roots, vec![root_of(&k, init)]);

    let space = k.processes().address_space(init).unwrap();
    let mut data = [0u8; 13];
    space.read_bytes(VirtualAddress::new(DATA), &mut data).unwrap();
    assert_eq!(&data, GREETING);
    let mut bss = vec![0xffu8; 64];
    space.read_bytes(VirtualAddress::new(DATA + 1024), &mut bss).unwrap();
    assert!(bss.iter().all(|b| *b == 0));
}

#[test]
fn timer_rotates_processes_round_robin() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    let a = k.spawn(&image(), None).unwrap();
    let b = k.spawn(&image(), Some(a)).unwrap();
    let c = k.spawn(&image(), Some(a)).unwrap();

    let mut frame = k.start();
    frame.rbx = 0xa;
    assert_eq!(k.handle_timer(&mut frame), Some(b));
    assert_eq!(frame.rbx, 0, "b starts from a fresh context");
    frame.rbx = 0xb;
    assert_eq!(k.handle_timer(&mut frame), Some(c));
    assert_eq!(k.handle_timer(&mut frame), Some(a));
    assert_eq!(frame.rbx, 0xa);
    assert_eq!(k.handle_timer(&mut frame), Some(b));
    assert_eq!(frame.rbx, 0xb);

    assert_eq!(state_of(&k, a), ProcessState::Ready);
    assert_eq!(state_of(&k, b), ProcessState::Running);
    assert_eq!(k.processes().ready_pids().collect::<Vec<_>>(), vec![c, a]);

    let expected: Vec<_> = [a, b, c, a, b].iter().map(|&p| root_of(&k, p)).collect();
    assert_eq!(k.cpu().roots, expected);
    assert_eq!(k.scheduler().ticks(), 4);
}

#[test]
fn longer_quantum_delays_preemption() {
    let phys = TestPhys::new(256);
    let (k, _) = boot(&phys);
    let mut k = k.with_quantum(2);
    let a = k.spawn(&image(), None).unwrap();
    let b = k.spawn(&image(), Some(a)).unwrap();

    let mut frame = k.start();
    assert_eq!(k.handle_timer(&mut frame), Some(a));
    assert_eq!(k.handle_timer(&mut frame), Some(b));
    assert_eq!(k.handle_timer(&mut frame), Some(b));
    assert_eq!(k.handle_timer(&mut frame), Some(a));
}

#[test]
fn lone_process_keeps_running_without_reloading_cr3() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    let a = k.spawn(&image(), None).unwrap();
    let mut frame = k.start();
    frame.r12 = 42;
    for _ in 0..3 {
        assert_eq!(k.handle_timer(&mut frame), Some(a));
    }
    assert_eq!(frame.r12, 42);
    assert_eq!(k.cpu().roots.len(), 1);
}

#[test]
fn idles_on_the_kernel_root_until_work_arrives() {
    let phys = TestPhys::new(256);
    let (mut k, kroot) = boot(&phys);

    let mut frame = k.start();
    assert_eq!(frame.rip, IDLE_RIP);
    assert!(!frame.is_user());
    assert_eq!(k.handle_timer(&mut frame), None);
    assert_eq!(frame.rip, IDLE_RIP);

    let a = k.spawn(&image(), None).unwrap();
    assert_eq!(k.handle_timer(&mut frame), Some(a));
    assert_eq!(frame.rip, TEXT);
    assert_eq!(k.cpu().roots, vec![kroot, root_of(&k, a)]);
}

#[test]
fn console_syscalls() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    k.spawn(&image(), None).unwrap();
    let mut f = k.start();

    assert_eq!(syscall(&mut k, &mut f, Sysno::Write, [1, DATA, 13]), 13);
    assert_eq!(syscall(&mut k, &mut f, Sysno::Write, [2, DATA, 5]), 5);
    assert_eq!(k.console().0, b"hello, world\nhello".to_vec());

    assert_eq!(syscall(&mut k, &mut f, Sysno::Write, [3, DATA, 5]), Errno::EBADF.as_return());
    assert_eq!(syscall(&mut k, &mut f, Sysno::Write, [1, 0x9000_0000, 4]), Errno::EFAULT.as_return());
    assert_eq!(syscall(&mut k, &mut f, Sysno::Read, [0, DATA, 4]), 0);
    assert_eq!(syscall(&mut k, &mut f, Sysno::Isatty, [1, 0, 0]), 1);
    assert_eq!(syscall(&mut k, &mut f, Sysno::Isatty, [5, 0, 0]), Errno::EBADF.as_return());
    assert_eq!(syscall(&mut k, &mut f, Sysno::Lseek, [1, 0, 0]), Errno::ESPIPE.as_return());
    assert_eq!(syscall(&mut k, &mut f, Sysno::Close, [0, 0, 0]), 0);
    assert_eq!(syscall(&mut k, &mut f, Sysno::Fstat, [1, DATA, 0]), Errno::ENOSYS.as_return());
    assert_eq!(syscall(&mut k, &mut f, Sysno::Getpid, [0; 3]), 1);

    f.rax = 99;
    k.handle_syscall(&mut f);
    assert_eq!(f.rax as i64, Errno::ENOSYS.as_return());
}

#[test]
fn write_stops_short_at_an_unmapped_page() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    k.spawn(&image(), None).unwrap();
    let mut f = k.start();

    // the last 16 bytes of the data page, then the unmapped page after it
    let tail = DATA + PAGE_SIZE - 16;
    assert_eq!(syscall(&mut k, &mut f, Sysno::Write, [1, tail, 600]), 16);
    assert_eq!(k.console().0.len(), 16);
}

#[test]
fn fork_copies_registers_and_memory() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    let parent = k.spawn(&image(), None).unwrap();
    let mut frame = k.start();
    frame.rbx = 0x1234;
    frame.rip = TEXT + 8;

    let raw = syscall(&mut k, &mut frame, Sysno::Fork, [0; 3]);
    assert_eq!(raw, 2);
    let child = Pid::new(2);

    let c = k.processes().find_by_pid(child).unwrap();
    assert_eq!(c.parent(), Some(parent));
    assert_eq!(c.state(), ProcessState::Ready);
    assert_eq!(c.context().frame.rax, 0);
    assert_eq!(c.context().frame.rbx, 0x1234);
    assert_eq!(c.context().frame.rip, TEXT + 8);
    assert_ne!(c.context().root, root_of(&k, parent));
    assert_eq!(k.processes().children(parent).collect::<Vec<_>>(), vec![child]);

    let pspace = k.processes().address_space(parent).unwrap();
    let cspace = k.processes().address_space(child).unwrap();
    cspace.write_bytes(VirtualAddress::new(DATA), b"child").unwrap();
    let mut seen = [0u8; 5];
    pspace.read_bytes(VirtualAddress::new(DATA), &mut seen).unwrap();
    assert_eq!(&seen, b"hello");
    assert_eq!(pspace.user_page_count(), cspace.user_page_count());

    assert_eq!(k.handle_timer(&mut frame), Some(child));
    assert_eq!(frame.rax, 0);
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Getpid, [0; 3]), 2);
}

#[test]
fn exit_then_waitpid_reaps_and_frees_everything() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    let parent = k.spawn(&image(), None).unwrap();
    let mut frame = k.start();
    let before_fork = k.allocator().free_count();

    let child = Pid::new(u32::try_from(syscall(&mut k, &mut frame, Sysno::Fork, [0; 3])).unwrap());
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Waitpid, [u64::MAX, 0, 0]), 0, "child still alive");

    assert_eq!(k.handle_timer(&mut frame), Some(child));
    syscall(&mut k, &mut frame, Sysno::Exit, [7, 0, 0]);

    assert_eq!(k.processes().current(), Some(parent));
    let zombie = k.processes().find_by_pid(child).unwrap();
    assert_eq!(zombie.state(), ProcessState::Zombie);
    assert_eq!(zombie.exit_code(), 7);
    assert!(!zombie.is_queued());

    let status_at = DATA + 64;
    assert_eq!(
        syscall(&mut k, &mut frame, Sysno::Waitpid, [u64::MAX, status_at, 0]),
        i64::from(child.as_u32())
    );
    let mut status = [0u8; 4];
    k.processes()
        .address_space(parent)
        .unwrap()
        .read_bytes(VirtualAddress::new(status_at), &mut status)
        .unwrap();
    assert_eq!(u32::from_le_bytes(status), 0x700);

    assert!(k.processes().find_by_pid(child).is_none());
    assert_eq!(k.allocator().free_count(), before_fork);
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Waitpid, [u64::MAX, 0, 0]), Errno::ECHILD.as_return());
}

#[test]
fn waitpid_only_matches_own_children() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    k.spawn(&image(), None).unwrap();
    let mut frame = k.start();
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Waitpid, [u64::MAX, 0, 0]), Errno::ECHILD.as_return());

    syscall(&mut k, &mut frame, Sysno::Fork, [0; 3]);
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Waitpid, [9, 0, 0]), Errno::ECHILD.as_return());
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Waitpid, [2, 0, 0]), 0);
}

#[test]
fn exit_reparents_children_to_init() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    k.spawn(&image(), None).unwrap();
    let mut frame = k.start();

    syscall(&mut k, &mut frame, Sysno::Fork, [0; 3]);
    let middle = Pid::new(2);
    assert_eq!(k.handle_timer(&mut frame), Some(middle));
    syscall(&mut k, &mut frame, Sysno::Fork, [0; 3]);
    let grandchild = Pid::new(3);
    assert_eq!(k.processes().find_by_pid(grandchild).unwrap().parent(), Some(middle));

    syscall(&mut k, &mut frame, Sysno::Exit, [0, 0, 0]);
    assert_eq!(k.processes().current(), Some(Pid::INIT));
    assert_eq!(k.processes().find_by_pid(grandchild).unwrap().parent(), Some(Pid::INIT));
    assert_eq!(k.processes().children(middle).count(), 0);

    let mut adopted: Vec<_> = k.processes().children(Pid::INIT).collect();
    adopted.sort();
    assert_eq!(adopted, vec![middle, grandchild]);
}

#[test]
fn kill_makes_a_zombie_with_signal_exit_code() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    k.spawn(&image(), None).unwrap();
    let mut frame = k.start();
    syscall(&mut k, &mut frame, Sysno::Fork, [0; 3]);
    let child = Pid::new(2);

    assert_eq!(syscall(&mut k, &mut frame, Sysno::Kill, [2, 0, 0]), 0);
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Kill, [2, 65, 0]), Errno::EINVAL.as_return());
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Kill, [2, 9, 0]), 0);
    let c = k.processes().find_by_pid(child).unwrap();
    assert_eq!((c.state(), c.exit_code()), (ProcessState::Zombie, 137));
    assert_eq!(k.processes().ready_pids().count(), 0);

    assert_eq!(syscall(&mut k, &mut frame, Sysno::Kill, [1, 9, 0]), Errno::EINVAL.as_return());
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Kill, [42, 9, 0]), Errno::ESRCH.as_return());
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Kill, [0, 9, 0]), Errno::ESRCH.as_return());
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Waitpid, [2, 0, 0]), 2);
}

#[test]
fn killing_yourself_switches_away() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    let init = k.spawn(&image(), None).unwrap();
    let victim = k.spawn(&image(), Some(init)).unwrap();
    let mut frame = k.start();
    assert_eq!(k.handle_timer(&mut frame), Some(victim));

    syscall(&mut k, &mut frame, Sysno::Kill, [u64::from(victim.as_u32()), 15, 0]);
    assert_eq!(k.processes().current(), Some(init));
    assert_eq!(frame.rip, TEXT);
    assert_eq!(k.processes().find_by_pid(victim).unwrap().exit_code(), 143);
}

#[test]
fn last_exit_falls_back_to_idle() {
    let phys = TestPhys::new(256);
    let (mut k, kroot) = boot(&phys);
    k.spawn(&image(), None).unwrap();
    let mut frame = k.start();
    syscall(&mut k, &mut frame, Sysno::Exit, [0, 0, 0]);
    assert_eq!(frame.rip, IDLE_RIP);
    assert_eq!(k.processes().current(), None);
    assert_eq!(k.cpu().roots.last(), Some(&kroot));
    assert_eq!(k.handle_timer(&mut frame), None);
}

#[test]
fn sbrk_grows_and_shrinks_the_heap() {
    let phys = TestPhys::new(256);
    let (mut k, _) = boot(&phys);
    let pid = k.spawn(&image(), None).unwrap();
    let mut frame = k.start();
    let heap = k.processes().find_by_pid(pid).unwrap().heap_start().as_u64();
    assert_eq!(heap, DATA + PAGE_SIZE);

    assert_eq!(syscall(&mut k, &mut frame, Sysno::Sbrk, [0; 3]), heap as i64);
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Sbrk, [2 * PAGE_SIZE, 0, 0]), heap as i64);
    let space = k.processes().address_space(pid).unwrap();
    assert!(space.is_mapped(VirtualAddress::new(heap)));
    assert!(space.is_mapped(VirtualAddress::new(heap + PAGE_SIZE)));
    space.write_bytes(VirtualAddress::new(heap + 100), b"heap").unwrap();

    let back = 0u64.wrapping_sub(PAGE_SIZE);
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Sbrk, [back, 0, 0]), (heap + 2 * PAGE_SIZE) as i64);
    assert!(space.is_mapped(VirtualAddress::new(heap)));
    assert!(!space.is_mapped(VirtualAddress::new(heap + PAGE_SIZE)));

    let too_far = 0u64.wrapping_sub(2 * PAGE_SIZE);
    assert_eq!(syscall(&mut k, &mut frame, Sysno::Sbrk, [too_far, 0, 0]), Errno::EINVAL.as_return());
    assert_eq!(
        syscall(&mut k, &mut frame, Sysno::Sbrk, [0x7fff_ffff_0000, 0, 0]),
        Errno::ENOMEM.as_return()
    );
    assert_eq!(
        k.processes().find_by_pid(pid).unwrap().brk().as_u64(),
        heap + PAGE_SIZE
    );
}

fn manager(phys: &TestPhys) -> (ProcessManager<'_, TestPhys>, TestFrames) {
    let mut frames = TestFrames::new(phys);
    let (kroot, _) = kernel_root(phys, &mut frames);
    (ProcessManager::new(phys, kroot), frames)
}

#[test]
fn failed_create_leaves_no_trace() {
    let phys = TestPhys::new(64);
    let (mut pm, mut frames) = manager(&phys);
    let before = frames.free_count();

    let err = pm.create(&mut frames, b"definitely not elf", None).unwrap_err();
    assert_eq!(Errno::from(err), Errno::EINVAL);
    assert_eq!(frames.free_count(), before);

    let hoard: Vec<_> = core::iter::from_fn(|| (frames.free_count() > 5).then(|| frames.allocate_frame()).flatten()).collect();
    let err = pm.create(&mut frames, &image(), None).unwrap_err();
    assert_eq!(Errno::from(err), Errno::ENOMEM);
    assert_eq!(frames.free_count(), 5);
    assert_eq!(pm.process_count(), 0);
    assert_eq!(pm.ready_pids().count(), 0);

    for f in hoard {
        frames.free_frame(f);
    }
    assert_eq!(pm.create(&mut frames, &image(), None), Ok(Pid::new(1)));
}

#[test]
fn create_rejects_an_unknown_parent() {
    let phys = TestPhys::new(64);
    let (mut pm, mut frames) = manager(&phys);
    assert_eq!(
        pm.create(&mut frames, &image(), Some(Pid::new(7))),
        Err(ProcessError::NoSuchProcess(Pid::new(7)))
    );
}

#[test]
fn failed_fork_frees_the_partial_copy() {
    let phys = TestPhys::new(64);
    let (mut pm, mut frames) = manager(&phys);
    let parent = pm.create(&mut frames, &image(), None).unwrap();
    let frame = pm.find_by_pid(parent).unwrap().context().frame;

    let _hoard: Vec<_> = core::iter::from_fn(|| (frames.free_count() > 6).then(|| frames.allocate_frame()).flatten()).collect();
    let err = pm.fork(&mut frames, parent, &frame).unwrap_err();
    assert_eq!(err, ProcessError::Memory(VmemError::OutOfMemory));
    assert_eq!(frames.free_count(), 6);
    assert_eq!(pm.process_count(), 1);
    assert_eq!(pm.children(parent).count(), 0);
}

#[test]
fn table_full_and_pids_are_not_reused() {
    let phys = TestPhys::new(1024);
    let (mut pm, mut frames) = manager(&phys);
    let init = pm.create(&mut frames, &image(), None).unwrap();
    while let Ok(_) = pm.create(&mut frames, &image(), Some(init)) {}
    assert_eq!(pm.process_count(), kernel_info::config::MAX_PROCESSES);
    assert_eq!(pm.create(&mut frames, &image(), Some(init)), Err(ProcessError::TableFull));

    let last = Pid::new(u32::try_from(kernel_info::config::MAX_PROCESSES).unwrap());
    pm.exit(last, 0).unwrap();
    assert_eq!(pm.wait(&mut frames, init, Some(last)).unwrap(), Some((last, 0)));
    let next = pm.create(&mut frames, &image(), Some(init)).unwrap();
    assert!(next > last);
}

#[test]
fn blocked_processes_leave_the_ready_queue() {
    let phys = TestPhys::new(128);
    let (mut pm, mut frames) = manager(&phys);
    let a = pm.create(&mut frames, &image(), None).unwrap();
    let b = pm.create(&mut frames, &image(), Some(a)).unwrap();

    pm.block(a).unwrap();
    assert_eq!(pm.find_by_pid(a).unwrap().state(), ProcessState::Blocked);
    assert_eq!(pm.ready_pids().collect::<Vec<_>>(), vec![b]);
    assert!(!pm.enqueue(a));

    assert!(pm.wake(a));
    assert_eq!(pm.ready_pids().collect::<Vec<_>>(), vec![b, a]);
    assert_eq!(pm.dequeue(), Some(b));
    assert_eq!(pm.dequeue(), Some(a));
    assert_eq!(pm.dequeue(), None);
}
