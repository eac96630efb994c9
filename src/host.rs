use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::thread::Worker;

/// The services the generated code may call, as C-callable function
/// pointers taking and returning 64-bit quantities. The translator
/// materializes these addresses into the emitted host-call sequences.
pub struct HostInterface {
    pub print_value: extern "C" fn(u64),
    pub read_value: extern "C" fn() -> u64,
    pub terminate: extern "C" fn(),
    pub thread_create: extern "C" fn(u64) -> u64,
    pub thread_join: extern "C" fn(u64),
    pub thread_sleep: extern "C" fn(u64),
    pub thread_lock: extern "C" fn(u64),
    pub thread_unlock: extern "C" fn(u64),
    pub file_read: extern "C" fn(u64, u64, u64) -> u64,
    pub file_write: extern "C" fn(u64, u64, u64),
}

impl HostInterface {
    pub fn native() -> Self {
        Self {
            print_value,
            read_value,
            terminate,
            thread_create,
            thread_join,
            thread_sleep,
            thread_lock,
            thread_unlock,
            file_read,
            file_write,
        }
    }
}

static PAYLOAD_PATH: OnceLock<PathBuf> = OnceLock::new();

pub fn set_payload_path(path: &Path) {
    let _ = PAYLOAD_PATH.set(path.to_path_buf());
}

fn stdout_guard() -> &'static Mutex<()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(()))
}

// The shims below are called from generated code with live guest state on
// the stack; they must not panic. Failures are logged and degrade to benign
// return values.

extern "C" fn print_value(value: u64) {
    let _guard = stdout_guard()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut out = io::stdout();
    let _ = writeln!(out, "{}", value as i64);
    let _ = out.flush();
}

extern "C" fn read_value() -> u64 {
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return 0;
    }
    line.trim().parse::<i64>().map(|value| value as u64).unwrap_or(0)
}

extern "C" fn terminate() {
    match Worker::current() {
        Some(worker) => worker.task().request_halt(),
        None => warn!("terminate outside a worker"),
    }
}

extern "C" fn thread_create(entry: u64) -> u64 {
    let Some(current) = Worker::current() else {
        error!("thread create outside a worker");
        return 0;
    };
    let Some(child) = current.task().fork_at(entry as usize) else {
        error!("current task cannot create threads");
        return 0;
    };
    match Worker::spawn(child) {
        Ok(worker) => {
            debug!("worker {} created child {}", current.id(), worker.id());
            worker.id()
        }
        Err(err) => {
            error!("thread create failed: {err}");
            0
        }
    }
}

extern "C" fn thread_join(tid: u64) {
    // a vanished id means the thread already exited
    if let Some(worker) = Worker::get(tid) {
        worker.join();
    }
}

extern "C" fn thread_sleep(ms: u64) {
    if let Some(worker) = Worker::current()
        && worker.should_stop()
    {
        debug!("worker {} cancelled during sleep", worker.id());
        worker.task().request_halt();
        return;
    }
    std::thread::sleep(Duration::from_millis(ms));
}

extern "C" fn thread_lock(id: u64) {
    crate::thread::lock_object(id);
}

extern "C" fn thread_unlock(id: u64) {
    crate::thread::unlock_object(id);
}

/// Resolves the destination range for a file transfer: the guest address is
/// truncated to 32 bits exactly as the emitted addressing does, and the
/// length is clamped to the accessible window.
fn guest_range(addr: u64, count: u64) -> Option<(*mut u8, usize)> {
    let (base, window) = Worker::current()?.task().memory_window()?;
    let addr = addr as u32 as usize;
    if addr >= window {
        return None;
    }
    let count = (count as usize).min(window - addr);
    Some((unsafe { base.add(addr) }, count))
}

extern "C" fn file_read(ofs: u64, count: u64, addr: u64) -> u64 {
    let Some(path) = PAYLOAD_PATH.get() else {
        error!("file read without a payload file");
        return 0;
    };
    let Some((dst, count)) = guest_range(addr, count) else {
        return 0;
    };

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("payload open failed: {err}");
            return 0;
        }
    };
    if file.seek(SeekFrom::Start(ofs)).is_err() {
        return 0;
    }

    let mut buffer = vec![0u8; count];
    let mut total = 0;
    while total < count {
        match file.read(&mut buffer[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) => {
                warn!("payload read failed: {err}");
                break;
            }
        }
    }
    unsafe {
        std::ptr::copy_nonoverlapping(buffer.as_ptr(), dst, total);
    }
    total as u64
}

extern "C" fn file_write(ofs: u64, count: u64, addr: u64) {
    let Some(path) = PAYLOAD_PATH.get() else {
        error!("file write without a payload file");
        return;
    };
    let Some((src, count)) = guest_range(addr, count) else {
        return;
    };

    let mut buffer = vec![0u8; count];
    unsafe {
        std::ptr::copy_nonoverlapping(src, buffer.as_mut_ptr(), count);
    }

    let file = OpenOptions::new().write(true).create(true).open(path);
    let mut file = match file {
        Ok(file) => file,
        Err(err) => {
            warn!("payload open failed: {err}");
            return;
        }
    };
    if file.seek(SeekFrom::Start(ofs)).is_err() {
        return;
    }
    if let Err(err) = file.write_all(&buffer) {
        warn!("payload write failed: {err}");
    }
}
