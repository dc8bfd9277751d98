//! Real-time setup for the monitor thread (Linux SCHED_FIFO / affinity /
//! mlockall).
//!
//! Called from the monitor thread itself, so priority and affinity apply to
//! that thread only; memory locking is process-wide. Every step is
//! best-effort: a failure is logged and the loop runs without it.

use crate::cli::{RtArgs, RtLock};

/// What to apply on the monitor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtPlan {
    pub prio: Option<i32>,
    pub lock: RtLock,
    pub cpu: usize,
}

impl RtPlan {
    /// `None` unless `--rt` was given.
    pub fn from_args(a: &RtArgs) -> Option<Self> {
        a.rt.then(|| Self {
            prio: a.rt_prio,
            lock: a.rt_lock.unwrap_or_else(RtLock::os_default),
            cpu: a.rt_cpu.unwrap_or(0),
        })
    }
}

#[cfg(target_os = "linux")]
/// Capacity of cpu_set_t in CPU indices (bits).
const MAX_CPUSET_BITS: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;

#[cfg(target_os = "linux")]
fn lock_memory(lock: RtLock) -> eyre::Result<()> {
    use libc::{MCL_CURRENT, MCL_FUTURE, mlockall};

    let flags = match lock {
        RtLock::None => return Ok(()),
        RtLock::Current => MCL_CURRENT,
        RtLock::All => MCL_CURRENT | MCL_FUTURE,
    };
    // SAFETY: mlockall takes no pointers.
    if unsafe { mlockall(flags) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let retryable = matches!(err.raw_os_error(), Some(c) if c == libc::EPERM || c == libc::ENOMEM);
    if lock == RtLock::All && retryable {
        // SAFETY: as above.
        if unsafe { mlockall(MCL_CURRENT) } == 0 {
            tracing::warn!(error = %err, "mlockall(current|future) failed; locked current pages only");
            return Ok(());
        }
    }
    let mut msg = format!("mlockall failed: {err}");
    if retryable {
        msg.push_str("; needs CAP_IPC_LOCK (or root) and a sufficient 'ulimit -l'");
    }
    Err(eyre::eyre!(msg))
}

#[cfg(target_os = "linux")]
fn fifo_priority(prio: Option<i32>) -> eyre::Result<i32> {
    use libc::{SCHED_FIFO, sched_get_priority_max, sched_get_priority_min, sched_param};

    // SAFETY: plain queries without pointers.
    let (min, max) = unsafe {
        let min = sched_get_priority_min(SCHED_FIFO);
        let max = sched_get_priority_max(SCHED_FIFO);
        if min < 0 || max < 0 { (1, 99) } else { (min, max) }
    };
    let prio_val = prio.unwrap_or(max).clamp(min, max);
    let param = sched_param {
        sched_priority: prio_val,
    };
    // SAFETY: `param` outlives the call; pid 0 is the calling thread.
    let rc = unsafe { libc::sched_setscheduler(0, SCHED_FIFO, &param) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        eyre::bail!("sched_setscheduler(SCHED_FIFO, {prio_val}) failed: {err}; needs CAP_SYS_NICE or root");
    }
    Ok(prio_val)
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> eyre::Result<()> {
    use libc::{CPU_ISSET, CPU_SET, CPU_ZERO, cpu_set_t};

    if cpu >= MAX_CPUSET_BITS {
        eyre::bail!("requested CPU {cpu} exceeds cpu_set_t capacity {MAX_CPUSET_BITS}");
    }
    // SAFETY: sysconf has no preconditions.
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online < 1 || cpu as libc::c_long >= online {
        eyre::bail!("requested CPU {cpu} >= online {online}");
    }
    let size = std::mem::size_of::<cpu_set_t>();
    // SAFETY: cpu_set_t is plain data; all-zero is a valid empty set and the
    // kernel writes at most `size` bytes into it.
    let allowed = unsafe {
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        if libc::sched_getaffinity(0, size, &mut set) != 0 {
            return Err(eyre::eyre!(std::io::Error::last_os_error()));
        }
        set
    };
    // SAFETY: `cpu` is below MAX_CPUSET_BITS.
    if !unsafe { CPU_ISSET(cpu, &allowed) } {
        eyre::bail!("CPU {cpu} not permitted by current affinity mask");
    }
    // SAFETY: as above.
    let rc = unsafe {
        let mut desired: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut desired);
        CPU_SET(cpu, &mut desired);
        libc::sched_setaffinity(0, size, &desired)
    };
    if rc != 0 {
        return Err(eyre::eyre!(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Apply `plan` to the calling thread. Returns the number of steps that
/// took effect.
#[cfg(target_os = "linux")]
pub fn apply_to_current_thread(plan: &RtPlan) -> usize {
    let mut applied = 0;
    match lock_memory(plan.lock) {
        Ok(()) => {
            applied += 1;
            tracing::info!(lock = ?plan.lock, "rt: memory lock applied");
        }
        Err(e) => tracing::warn!(error = %e, "rt: memory lock not applied"),
    }
    match fifo_priority(plan.prio) {
        Ok(p) => {
            applied += 1;
            tracing::info!(priority = p, "rt: SCHED_FIFO applied");
        }
        Err(e) => tracing::warn!(error = %e, "rt: scheduling policy not applied"),
    }
    match pin_to_cpu(plan.cpu) {
        Ok(()) => {
            applied += 1;
            tracing::info!(cpu = plan.cpu, "rt: monitor thread pinned");
        }
        Err(e) => tracing::warn!(error = %e, "rt: affinity not applied"),
    }
    applied
}

#[cfg(not(target_os = "linux"))]
pub fn apply_to_current_thread(plan: &RtPlan) -> usize {
    tracing::warn!(?plan, "rt: real-time mode is only supported on Linux");
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_only_when_requested() {
        let off = RtArgs {
            rt: false,
            rt_prio: Some(50),
            rt_lock: None,
            rt_cpu: None,
        };
        assert_eq!(RtPlan::from_args(&off), None);

        let on = RtArgs { rt: true, ..off };
        let plan = RtPlan::from_args(&on).unwrap();
        assert_eq!(plan.prio, Some(50));
        assert_eq!(plan.cpu, 0);
        assert_eq!(plan.lock, RtLock::os_default());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn out_of_range_cpu_is_refused() {
        assert!(pin_to_cpu(MAX_CPUSET_BITS).is_err());
    }
}
