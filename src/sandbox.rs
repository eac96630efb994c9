use std::fmt;
use std::io;

/// The guest address space is exactly 2^32 bytes. Together with the
/// zero-extended index addressing in the emitted code this is what confines
/// the guest: no register value can form an address outside the reservation,
/// and anything past the data window is PROT_NONE.
pub const GUEST_SPACE_BYTES: usize = 1 << 32;

#[derive(Debug)]
pub enum SandboxError {
    Reserve(String),
    Protect(String),
    InitialDataTooLarge { initial: usize, window: usize },
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Reserve(message) => write!(f, "reserving guest memory: {message}"),
            SandboxError::Protect(message) => write!(f, "enabling data window: {message}"),
            SandboxError::InitialDataTooLarge { initial, window } => write!(
                f,
                "initial data of {initial} bytes does not fit the {window}-byte window"
            ),
        }
    }
}

impl std::error::Error for SandboxError {}

#[derive(Debug)]
pub struct SandboxMemory {
    base: *mut u8,
    accessible: usize,
}

unsafe impl Send for SandboxMemory {}
unsafe impl Sync for SandboxMemory {}

impl SandboxMemory {
    /// Reserves the full guest space with no access, then enables read+write
    /// on the page-rounded prefix covering `data_size` and copies the
    /// initial data into it.
    pub fn reserve(data_size: u32, initial_data: &[u8]) -> Result<Self, SandboxError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let accessible = (data_size as usize).div_ceil(page) * page;
        let accessible = accessible.min(GUEST_SPACE_BYTES);
        if initial_data.len() > accessible {
            return Err(SandboxError::InitialDataTooLarge {
                initial: initial_data.len(),
                window: accessible,
            });
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                GUEST_SPACE_BYTES,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SandboxError::Reserve(
                io::Error::last_os_error().to_string(),
            ));
        }
        let base = base as *mut u8;

        if accessible > 0 {
            let rc = unsafe {
                libc::mprotect(
                    base as *mut _,
                    accessible,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc != 0 {
                let message = io::Error::last_os_error().to_string();
                unsafe { libc::munmap(base as *mut _, GUEST_SPACE_BYTES) };
                return Err(SandboxError::Protect(message));
            }
        }

        if !initial_data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(initial_data.as_ptr(), base, initial_data.len());
            }
        }

        Ok(Self { base, accessible })
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn accessible_len(&self) -> usize {
        self.accessible
    }
}

impl Drop for SandboxMemory {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut _, GUEST_SPACE_BYTES) };
    }
}

extern "C" fn fault_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // async-signal-safe: write and exit, nothing else
    const MESSAGE: &[u8] = b"sandbox memory violation\n";
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            MESSAGE.as_ptr() as *const libc::c_void,
            MESSAGE.len(),
        );
        libc::_exit(3);
    }
}

/// Converts segmentation and bus faults (guard-page hits, guest stack
/// overflow) into the fixed exit code 3. Installed once in the child
/// process.
pub fn install_fault_handler() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGSEGV, libc::SIGBUS] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Gives the calling thread an alternate signal stack so the fault handler
/// can run after the worker's own stack has overflowed. The buffer is
/// intentionally leaked; worker threads live until process exit.
pub fn install_signal_stack() {
    const STACK_LEN: usize = 64 * 1024;
    let buffer = Box::leak(vec![0u8; STACK_LEN].into_boxed_slice());
    let stack = libc::stack_t {
        ss_sp: buffer.as_mut_ptr() as *mut libc::c_void,
        ss_flags: 0,
        ss_size: STACK_LEN,
    };
    unsafe {
        libc::sigaltstack(&stack, std::ptr::null_mut());
    }
}
