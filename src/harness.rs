use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::error;

use crate::disasm::disassemble;
use crate::host::{self, HostInterface};
use crate::jit::builder::HALT_SLOT;
use crate::jit::{self, ExecutableCode, TranslateOptions};
use crate::sandbox::{self, SandboxMemory};
use crate::thread::{GuestTask, Worker};
use crate::wire::ProgramImage;

// 16 guest registers plus the halt-request slot the emitted code checks.
const REG_SLOTS: usize = HALT_SLOT as usize + 1;

/// Per-worker guest state: the shared code page and memory window, a private
/// register file, and the native index execution starts at. Children created
/// by the thread-create shim snapshot the parent's registers and re-enter
/// the same code page at their own entry.
pub struct JitThread {
    code: Arc<ExecutableCode>,
    memory: *mut u8,
    window: usize,
    entry: usize,
    regs: UnsafeCell<[u64; REG_SLOTS]>,
}

unsafe impl Send for JitThread {}
unsafe impl Sync for JitThread {}

impl JitThread {
    pub fn new(code: Arc<ExecutableCode>, memory: *mut u8, window: usize, entry: usize) -> Self {
        Self {
            code,
            memory,
            window,
            entry,
            regs: UnsafeCell::new([0; REG_SLOTS]),
        }
    }
}

impl GuestTask for JitThread {
    fn run(&self, _tid: u64) -> i32 {
        let entry = self.code.entry();
        unsafe {
            entry(self.memory, self.regs.get() as *mut u64, self.entry);
            if (*self.regs.get())[HALT_SLOT as usize] != 0 {
                1
            } else {
                0
            }
        }
    }

    fn request_halt(&self) {
        // written only from the worker's own thread, inside a host shim
        unsafe {
            (*self.regs.get())[HALT_SLOT as usize] = 1;
        }
    }

    fn fork_at(&self, entry: usize) -> Option<Arc<dyn GuestTask>> {
        // the parent sits inside the thread-create shim, its registers are
        // quiescent
        let mut regs = unsafe { *self.regs.get() };
        regs[HALT_SLOT as usize] = 0;
        Some(Arc::new(JitThread {
            code: self.code.clone(),
            memory: self.memory,
            window: self.window,
            entry,
            regs: UnsafeCell::new(regs),
        }))
    }

    fn memory_window(&self) -> Option<(*mut u8, usize)> {
        Some((self.memory, self.window))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    HardTimeout,
    SetupFailure,
    SandboxFault,
    Signaled(i32),
    Unknown(i32),
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::HardTimeout => 1,
            RunOutcome::SetupFailure => 2,
            RunOutcome::SandboxFault => 3,
            RunOutcome::Signaled(signal) => 128 + signal,
            RunOutcome::Unknown(code) => code,
        }
    }
}

/// Runs the program in a forked child so guest-induced signals never reach
/// the invoking process, then maps the child's exit status.
pub fn run_image(image: &ProgramImage, payload: Option<&Path>) -> io::Result<RunOutcome> {
    let _ = io::stdout().flush();

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            let code = child_main(image, payload);
            unsafe { libc::_exit(code) }
        }
        pid => {
            let mut status: libc::c_int = 0;
            loop {
                let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
                if rc != -1 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(err);
                }
            }
            Ok(decode_status(status))
        }
    }
}

fn decode_status(status: libc::c_int) -> RunOutcome {
    if libc::WIFEXITED(status) {
        match libc::WEXITSTATUS(status) {
            0 => RunOutcome::Completed,
            1 => RunOutcome::HardTimeout,
            2 => RunOutcome::SetupFailure,
            3 => RunOutcome::SandboxFault,
            other => RunOutcome::Unknown(other),
        }
    } else if libc::WIFSIGNALED(status) {
        RunOutcome::Signaled(libc::WTERMSIG(status))
    } else {
        RunOutcome::Unknown(-1)
    }
}

fn child_main(image: &ProgramImage, payload: Option<&Path>) -> i32 {
    if let Err(err) = sandbox::install_fault_handler() {
        error!("installing fault handler: {err}");
        return 2;
    }
    if let Some(path) = payload {
        host::set_payload_path(path);
    }
    match run_guest(image, payload.is_some()) {
        Ok(()) => 0,
        Err(err) => {
            let _ = writeln!(io::stderr(), "error: {err}");
            2
        }
    }
}

fn run_guest(image: &ProgramImage, payload_available: bool) -> Result<(), Box<dyn std::error::Error>> {
    let sandbox = SandboxMemory::reserve(image.header.data_size, &image.initial_data)?;
    let instructions = disassemble(&image.code);
    let translated = jit::translate(
        &instructions,
        &HostInterface::native(),
        &TranslateOptions { payload_available },
    )?;
    let code = Arc::new(translated.publish()?);

    let main_task = Arc::new(JitThread::new(
        code,
        sandbox.base_ptr(),
        sandbox.accessible_len(),
        translated.entry_index(),
    ));
    let worker = Worker::spawn(main_task)?;
    worker.join();

    let _ = io::stdout().flush();
    Ok(())
}
