//! Named OS threads with optional CPU affinity and scheduling priority.
//!
//! Affinity and priority are applied from inside the new thread, before the
//! body runs.  When the platform refuses (no `CAP_SYS_NICE`, core out of
//! range, non-Linux host) the refusal is logged and the thread runs with the
//! inherited settings.

use std::thread::{self, JoinHandle};

use tracing::warn;
use webio_types::WebIoError;

/// Kernel scheduling policy for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Default time-sharing policy.
    #[default]
    Other,
    /// Real-time first-in first-out.
    Fifo,
    /// Real-time round robin.
    RoundRobin,
}

impl SchedPolicy {
    /// Lowest priority the kernel accepts for this policy.
    pub fn min_priority(self) -> i32 {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: pure query with a valid policy constant.
            let min = unsafe { libc::sched_get_priority_min(self.as_raw()) };
            if min >= 0 { min } else { 0 }
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    #[cfg(target_os = "linux")]
    fn as_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
        }
    }
}

/// How to start a worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    /// CPU cores the thread may run on. Empty means no restriction.
    pub affinity: Vec<usize>,
    /// Scheduling priority. `None` keeps the inherited priority.
    pub priority: Option<i32>,
    pub policy: SchedPolicy,
    /// `false` detaches the thread once started.
    pub joinable: bool,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affinity: Vec::new(),
            priority: None,
            policy: SchedPolicy::Other,
            joinable: true,
        }
    }

    pub fn with_affinity(mut self, cores: impl IntoIterator<Item = usize>) -> Self {
        self.affinity = cores.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, policy: SchedPolicy, priority: i32) -> Self {
        self.policy = policy;
        self.priority = Some(priority);
        self
    }

    /// FIFO real-time, one step above the policy minimum.
    pub fn low_realtime(self) -> Self {
        let priority = SchedPolicy::Fifo.min_priority() + 1;
        self.with_priority(SchedPolicy::Fifo, priority)
    }

    pub fn detached(mut self) -> Self {
        self.joinable = false;
        self
    }
}

/// Handle to a started worker.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` once the body returned.  Detached workers report `false`.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Wait for the body to return.  A detached worker returns immediately.
    ///
    /// # Errors
    ///
    /// [`WebIoError::Transport`] when the body panicked.
    pub fn join(mut self) -> Result<(), WebIoError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| WebIoError::Transport(format!("worker '{}' panicked", self.name))),
            None => Ok(()),
        }
    }
}

/// Start `body` on a new thread configured by `config`.
///
/// # Errors
///
/// [`WebIoError::ThreadCreation`] when the OS refuses to create the thread.
pub fn spawn<F>(config: WorkerConfig, body: F) -> Result<Worker, WebIoError>
where
    F: FnOnce() + Send + 'static,
{
    let name = config.name.clone();
    let joinable = config.joinable;
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            apply_scheduling(&config);
            body();
        })
        .map_err(|e| WebIoError::ThreadCreation(format!("{name}: {e}")))?;

    Ok(Worker {
        name,
        handle: joinable.then_some(handle),
    })
}

#[cfg(target_os = "linux")]
fn apply_scheduling(config: &WorkerConfig) {
    if !config.affinity.is_empty() {
        let setsize = libc::CPU_SETSIZE as usize;
        // SAFETY: cpu_set_t is plain data; CPU_SET indices are bounds-checked
        // against CPU_SETSIZE above the call.
        let rc = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &core in config.affinity.iter().filter(|&&c| c < setsize) {
                libc::CPU_SET(core, &mut set);
            }
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            warn!(
                thread = %config.name,
                cores = ?config.affinity,
                error = %std::io::Error::last_os_error(),
                "failed to set CPU affinity"
            );
        }
    }

    if let Some(priority) = config.priority {
        // SAFETY: sched_param is plain data; pthread_self is always valid.
        let rc = unsafe {
            let mut param: libc::sched_param = std::mem::zeroed();
            param.sched_priority = priority;
            libc::pthread_setschedparam(libc::pthread_self(), config.policy.as_raw(), &param)
        };
        if rc != 0 {
            warn!(
                thread = %config.name,
                policy = ?config.policy,
                priority,
                error = %std::io::Error::from_raw_os_error(rc),
                "failed to set scheduling priority"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_scheduling(config: &WorkerConfig) {
    if !config.affinity.is_empty() || config.priority.is_some() {
        tracing::debug!(thread = %config.name, "scheduling hints ignored on this platform");
    }
}
