//! Unix sandbox: spawn with rlimits applied pre-exec, then a polling
//! watchdog that enforces wall-clock and memory limits and collects child
//! rusage.

use std::fs::File;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use super::{ExecutionInfo, ExecutionOptions, Sandbox, SetupError};
use crate::store;

/// Cadence of the wait4 poll enforcing the wall-clock limit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Cadence of the dedicated peak-memory sampler thread.
const SAMPLE_INTERVAL: Duration = Duration::from_micros(100);

pub struct UnixSandbox;

impl UnixSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UnixSandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Limit set applied in the child between fork and exec. Plain data so the
/// pre-exec closure stays allocation-free.
#[derive(Clone, Copy)]
struct ChildLimits {
    cpu_ms: u64,
    memory_kb: u64,
    max_files: u32,
    max_procs: u32,
    max_file_size_kb: u64,
    max_mlock_kb: u64,
    max_stack_kb: u64,
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    if value == 0 {
        return Ok(());
    }
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn apply_child_limits(limits: &ChildLimits) -> std::io::Result<()> {
    // New process group, so the child does not receive terminal Ctrl-Cs.
    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    set_rlimit(libc::RLIMIT_AS, limits.memory_kb * 1024)?;
    set_rlimit(libc::RLIMIT_CPU, limits.cpu_ms.div_ceil(1000))?;
    set_rlimit(libc::RLIMIT_FSIZE, limits.max_file_size_kb * 1024)?;
    set_rlimit(libc::RLIMIT_MEMLOCK, limits.max_mlock_kb * 1024)?;
    set_rlimit(libc::RLIMIT_NOFILE, u64::from(limits.max_files))?;
    set_rlimit(libc::RLIMIT_NPROC, u64::from(limits.max_procs))?;
    if limits.max_stack_kb > 0 {
        set_rlimit(libc::RLIMIT_STACK, limits.max_stack_kb * 1024)?;
    } else {
        let unlimited = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        unsafe { libc::setrlimit(libc::RLIMIT_STACK, &unlimited) };
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn page_kb() -> u64 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as u64 / 1024
    } else {
        4
    }
}

/// Current virtual size of the process in KiB, while it is alive.
#[cfg(target_os = "linux")]
fn proc_memory_kb(pid: i32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let pages: u64 = statm.split_whitespace().next()?.parse().ok()?;
    Some(pages * page_kb())
}

#[cfg(not(target_os = "linux"))]
fn proc_memory_kb(_pid: i32) -> Option<u64> {
    None
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

impl Sandbox for UnixSandbox {
    fn execute(&self, options: &ExecutionOptions) -> Result<ExecutionInfo, SetupError> {
        let setup = |what: &str, e: std::io::Error| SetupError(format!("{}: {}", what, e));

        let mut command = Command::new(options.root.join(&options.executable));
        command.args(&options.args).current_dir(&options.root);

        command.stdin(match &options.stdin_file {
            Some(path) => Stdio::from(File::open(path).map_err(|e| setup("open stdin", e))?),
            None => Stdio::null(),
        });
        command.stdout(match &options.stdout_file {
            Some(path) => Stdio::from(File::create(path).map_err(|e| setup("create stdout", e))?),
            None => Stdio::null(),
        });
        command.stderr(match &options.stderr_file {
            Some(path) => Stdio::from(File::create(path).map_err(|e| setup("create stderr", e))?),
            None => Stdio::null(),
        });

        let limits = ChildLimits {
            cpu_ms: options.cpu_limit_ms,
            memory_kb: options.memory_limit_kb,
            max_files: options.max_files,
            max_procs: options.max_procs,
            max_file_size_kb: options.max_file_size_kb,
            max_mlock_kb: options.max_mlock_kb,
            max_stack_kb: options.max_stack_kb,
        };
        unsafe {
            command.pre_exec(move || apply_child_limits(&limits));
        }

        let child = command.spawn().map_err(|e| setup("spawn", e))?;
        let pid = child.id() as i32;
        debug!("spawned {} as pid {}", options.executable, pid);

        let start = Instant::now();
        // Peak memory is tracked by a dedicated thread so short-lived
        // spikes stay visible between wait polls.
        let memory_usage = Arc::new(AtomicU64::new(0));
        let sampler_done = Arc::new(AtomicBool::new(false));
        let sampler = {
            let memory_usage = memory_usage.clone();
            let done = sampler_done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    if let Some(kb) = proc_memory_kb(pid) {
                        memory_usage.fetch_max(kb, Ordering::Relaxed);
                    }
                    std::thread::sleep(SAMPLE_INTERVAL);
                }
            })
        };

        let wait_result: Result<(libc::c_int, libc::rusage), SetupError> = (|| {
            let mut status: libc::c_int = 0;
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
            let mut exited = false;
            loop {
                let ret = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut rusage) };
                if ret == pid {
                    exited = true;
                    break;
                }
                if ret == -1 {
                    return Err(setup("wait4", std::io::Error::last_os_error()));
                }
                let wall_ms = start.elapsed().as_millis() as u64;
                let wall_hit = options.wall_limit_ms > 0 && wall_ms >= options.wall_limit_ms;
                let memory_hit = options.memory_limit_kb > 0
                    && memory_usage.load(Ordering::Relaxed) >= options.memory_limit_kb;
                if wall_hit || memory_hit {
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            if !exited {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                if unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) } != pid {
                    return Err(setup("wait4", std::io::Error::last_os_error()));
                }
            }
            Ok((status, rusage))
        })();
        sampler_done.store(true, Ordering::Relaxed);
        let _ = sampler.join();
        let (status, rusage) = wait_result?;
        let peak_kb = memory_usage.load(Ordering::Relaxed);

        let mut info = ExecutionInfo {
            // ru_maxrss (KiB of peak RSS) backstops the sampler for
            // processes that exit between polls.
            memory_kb: peak_kb.max(rusage.ru_maxrss as u64),
            wall_time_ms: start.elapsed().as_millis() as u64,
            cpu_time_ms: timeval_ms(rusage.ru_utime),
            sys_time_ms: timeval_ms(rusage.ru_stime),
            ..ExecutionInfo::default()
        };
        if libc::WIFEXITED(status) {
            info.status_code = libc::WEXITSTATUS(status);
        }
        if libc::WIFSIGNALED(status) {
            info.signal = libc::WTERMSIG(status);
        }
        info.message = if info.signal != 0 {
            format!("Killed by signal {}", info.signal)
        } else if info.status_code != 0 {
            format!("Exited with status {}", info.status_code)
        } else {
            String::new()
        };
        Ok(info)
    }

    fn make_immutable(&self, path: &std::path::Path) -> Result<(), SetupError> {
        store::make_immutable(path).map_err(|e| SetupError(e.to_string()))
    }

    fn prepare_for_execution(&self, path: &std::path::Path) -> Result<(), SetupError> {
        store::make_executable(path).map_err(|e| SetupError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_bytes;

    fn script(dir: &std::path::Path, body: &str) -> ExecutionOptions {
        let path = dir.join("run.sh");
        write_bytes(&path, format!("#!/bin/sh\n{}\n", body).as_bytes(), false, false).unwrap();
        store::make_executable(&path).unwrap();
        let mut options = ExecutionOptions::new(dir, "run.sh");
        options.stdout_file = Some(dir.join("stdout"));
        options.stderr_file = Some(dir.join("stderr"));
        options
    }

    #[test]
    fn test_successful_run_writes_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let options = script(dir.path(), "echo hello");
        let info = UnixSandbox::new().execute(&options).unwrap();
        assert_eq!(info.status_code, 0);
        assert_eq!(info.signal, 0);
        let stdout = std::fs::read_to_string(dir.path().join("stdout")).unwrap();
        assert_eq!(stdout, "hello\n");
    }

    #[test]
    fn test_nonzero_exit_reported() {
        let dir = tempfile::tempdir().unwrap();
        let options = script(dir.path(), "exit 3");
        let info = UnixSandbox::new().execute(&options).unwrap();
        assert_eq!(info.status_code, 3);
        assert!(info.message.contains("status 3"));
    }

    #[test]
    fn test_signal_reported() {
        let dir = tempfile::tempdir().unwrap();
        let options = script(dir.path(), "kill -s SEGV $$");
        let info = UnixSandbox::new().execute(&options).unwrap();
        assert_eq!(info.signal, libc::SIGSEGV);
        assert!(info.message.contains("signal"));
    }

    #[test]
    fn test_wall_limit_kills() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = script(dir.path(), "sleep 5");
        options.wall_limit_ms = 200;
        let start = Instant::now();
        let info = UnixSandbox::new().execute(&options).unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(info.wall_time_ms >= 200);
        assert_eq!(info.signal, libc::SIGKILL);
    }

    #[test]
    fn test_missing_executable_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExecutionOptions::new(dir.path(), "absent");
        assert!(UnixSandbox::new().execute(&options).is_err());
    }
}
