use super::{JitError, JitResult};

/// Calling convention of the generated function, re-entered by the
/// thread-create shim with a nonzero entry index.
pub type JitEntry = unsafe extern "C" fn(*mut u8, *mut u64, usize);

/// A page-rounded read+execute mapping holding the emitted code words.
pub struct ExecutableCode {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for ExecutableCode {}
unsafe impl Sync for ExecutableCode {}

impl ExecutableCode {
    pub fn from_words(words: &[u32]) -> JitResult<Self> {
        if words.is_empty() {
            return Err(JitError::Native(
                "cannot create executable region for empty code".to_string(),
            ));
        }
        let code_bytes = words.len() * 4;
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = code_bytes.div_ceil(page) * page;

        let ptr = alloc_region(len)?;
        let result = write_machine_code(ptr, words).and_then(|()| seal_region(ptr, len));
        if let Err(err) = result {
            unsafe { libc::munmap(ptr as *mut _, len) };
            return Err(err);
        }
        Ok(Self { ptr, len })
    }

    pub fn entry(&self) -> JitEntry {
        unsafe { std::mem::transmute::<*mut u8, JitEntry>(self.ptr) }
    }
}

impl Drop for ExecutableCode {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { libc::munmap(self.ptr as *mut _, self.len) };
        }
    }
}

#[cfg(target_os = "linux")]
fn alloc_region(len: usize) -> JitResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(JitError::Native(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_region(len: usize) -> JitResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(JitError::Native(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

fn write_machine_code(ptr: *mut u8, words: &[u32]) -> JitResult<()> {
    let len = words.len() * 4;

    #[cfg(target_os = "macos")]
    unsafe {
        let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
        if use_write_protect {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(words.as_ptr() as *const u8, ptr, len);
        sys_icache_invalidate(ptr as *mut libc::c_void, len);
        if use_write_protect {
            pthread_jit_write_protect_np(1);
        }
    }

    #[cfg(target_os = "linux")]
    unsafe {
        std::ptr::copy_nonoverlapping(words.as_ptr() as *const u8, ptr, len);
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn seal_region(ptr: *mut u8, len: usize) -> JitResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(JitError::Native(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn seal_region(_ptr: *mut u8, _len: usize) -> JitResult<()> {
    Ok(())
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}
