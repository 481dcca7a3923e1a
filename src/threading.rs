//! Thread priority and core pinning for the scheduler's dispatch and control threads.
//!
//! Everything here is best effort: raising priority or pinning needs privileges on most systems,
//! and a refusal must never prevent the scheduler from running. Failures are logged at `debug`.

use tracing::debug;

/// Placement applied to a worker thread as it starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadPlacement {
    /// Priority level, see [`set_thread_priority`]. `None` keeps the inherited policy.
    pub priority: Option<i32>,
    /// Core to pin to. `None` lets the OS place the thread.
    pub core: Option<usize>,
}

impl ThreadPlacement {
    /// Placement for the `worker_index`-th worker given a core list (round robin over it).
    pub fn for_worker(worker_index: usize, cores: &[usize], priority: Option<i32>) -> Self {
        Self {
            priority,
            core: (!cores.is_empty()).then(|| cores[worker_index % cores.len()]),
        }
    }

    /// Apply to the calling thread.
    pub fn apply(self) {
        if let Some(priority) = self.priority {
            set_thread_priority(priority);
        }
        if let Some(core) = self.core {
            set_thread_core(core);
        }
    }
}

/// Raise (or lower) the calling thread's scheduling priority.
///
/// ## Linux
/// - `priority >= 3`: `SCHED_FIFO` 90
/// - `priority == 2`: `SCHED_FIFO` 70
/// - `priority == 1`: `SCHED_RR` 30
/// - otherwise: `SCHED_OTHER`
///
/// ## macOS
/// Mapped onto QoS classes: user-initiated, utility, background.
///
/// Other platforms: no-op.
pub fn set_thread_priority(priority: i32) {
    #[cfg(target_os = "linux")]
    {
        use libc::{
            pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR,
        };

        let (policy, sched_priority) = match priority {
            p if p >= 3 => (SCHED_FIFO, 90),
            2 => (SCHED_FIFO, 70),
            1 => (SCHED_RR, 30),
            _ => (SCHED_OTHER, 0),
        };

        // SAFETY: `param` is fully initialised and `pthread_self` is always a valid handle.
        let rc = unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = sched_priority;
            pthread_setschedparam(pthread_self(), policy, &param)
        };
        if rc != 0 {
            debug!(priority, rc, "thread priority not applied");
        }
    }
    #[cfg(target_os = "macos")]
    {
        const QOS_CLASS_USER_INITIATED: u32 = 0x19;
        const QOS_CLASS_UTILITY: u32 = 0x15;
        const QOS_CLASS_BACKGROUND: u32 = 0x09;

        extern "C" {
            fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
        }

        let qos_class = match priority {
            p if p >= 2 => QOS_CLASS_USER_INITIATED,
            1 => QOS_CLASS_UTILITY,
            _ => QOS_CLASS_BACKGROUND,
        };
        // SAFETY: plain FFI call on the current thread with a valid QoS constant.
        let rc = unsafe { pthread_set_qos_class_self_np(qos_class, 0) };
        if rc != 0 {
            debug!(priority, rc, "thread QoS class not applied");
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = priority;
    }
}

/// Pin the calling thread to `core_id` (Linux only; no-op elsewhere).
pub fn set_thread_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};

        // SAFETY: the set is zero-initialised before use and sized by `size_of::<cpu_set_t>()`.
        let rc = unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set)
        };
        if rc != 0 {
            debug!(core_id, rc, "thread core pinning not applied");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
    }
}
