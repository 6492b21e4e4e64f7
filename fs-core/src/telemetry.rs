//! Operation counters and cumulative timings.
//!
//! A [`Telemetry`] handle is cheap to clone and is injected into the
//! allocator and every extent log, so each store (and each test) owns an
//! isolated set of counters. Recording is a handful of relaxed atomic adds:
//! it never blocks, never fails and never feeds back into allocation or
//! logging decisions.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const OP_KINDS: usize = 10;

/// Traced operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Copy-on-write file write (allocate, copy, append)
    CowWrite,
    /// Extent log append
    Logging,
    /// Extent lookup scan
    Lookup,
    /// Data block allocation
    NewDataBlocks,
    /// Log page allocation
    NewMetaBlocks,
    /// Data block release
    FreeDataBlocks,
    /// Log page release
    FreeMetaBlocks,
    /// Log compaction
    Compaction,
    /// Inode teardown
    EvictInode,
    /// Free pool rebuild at open
    Recovery,
}

impl OpKind {
    /// Every kind, in report order
    pub const ALL: [OpKind; OP_KINDS] = [
        OpKind::CowWrite,
        OpKind::Logging,
        OpKind::Lookup,
        OpKind::NewDataBlocks,
        OpKind::NewMetaBlocks,
        OpKind::FreeDataBlocks,
        OpKind::FreeMetaBlocks,
        OpKind::Compaction,
        OpKind::EvictInode,
        OpKind::Recovery,
    ];

    /// Report label
    pub fn name(self) -> &'static str {
        match self {
            OpKind::CowWrite => "cow_write",
            OpKind::Logging => "logging",
            OpKind::Lookup => "lookup",
            OpKind::NewDataBlocks => "new_data_blocks",
            OpKind::NewMetaBlocks => "new_meta_blocks",
            OpKind::FreeDataBlocks => "free_data_blocks",
            OpKind::FreeMetaBlocks => "free_meta_blocks",
            OpKind::Compaction => "compaction",
            OpKind::EvictInode => "evict_inode",
            OpKind::Recovery => "recovery",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct OpCounter {
    count: AtomicU64,
    nanos: AtomicU64,
}

struct Counters {
    measure_timing: AtomicBool,
    ops: [OpCounter; OP_KINDS],
    alloc_steps: AtomicU64,
    free_steps: AtomicU64,
    write_breaks: AtomicU64,
    log_scan_steps: AtomicU64,
}

/// Shared handle to one set of counters
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Counters>,
}

impl Telemetry {
    /// Create a zeroed counter set. With `measure_timing` off only counts
    /// are kept.
    pub fn new(measure_timing: bool) -> Self {
        Self {
            inner: Arc::new(Counters {
                measure_timing: AtomicBool::new(measure_timing),
                ops: Default::default(),
                alloc_steps: AtomicU64::new(0),
                free_steps: AtomicU64::new(0),
                write_breaks: AtomicU64::new(0),
                log_scan_steps: AtomicU64::new(0),
            }),
        }
    }

    /// Whether elapsed time is accumulated
    pub fn measure_timing(&self) -> bool {
        self.inner.measure_timing.load(Ordering::Relaxed)
    }

    /// Switch timing collection on or off
    pub fn set_measure_timing(&self, on: bool) {
        self.inner.measure_timing.store(on, Ordering::Relaxed);
    }

    /// Count one operation of `op` taking `elapsed`
    pub fn record(&self, op: OpKind, elapsed: Duration) {
        let counter = &self.inner.ops[op.index()];
        counter.count.fetch_add(1, Ordering::Relaxed);
        if self.measure_timing() {
            let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
            counter.nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    /// Start timing `op`; the sample is recorded when the guard drops.
    pub fn timer(&self, op: OpKind) -> OpTimer {
        OpTimer {
            telemetry: self.clone(),
            op,
            start: Instant::now(),
        }
    }

    /// Operations of `op` recorded so far
    pub fn count(&self, op: OpKind) -> u64 {
        self.inner.ops[op.index()].count.load(Ordering::Relaxed)
    }

    /// Cumulative nanoseconds spent in `op`
    pub fn cumulative_time(&self, op: OpKind) -> u64 {
        self.inner.ops[op.index()].nanos.load(Ordering::Relaxed)
    }

    pub(crate) fn add_alloc_steps(&self, steps: u64) {
        self.inner.alloc_steps.fetch_add(steps, Ordering::Relaxed);
    }

    pub(crate) fn add_free_steps(&self, steps: u64) {
        self.inner.free_steps.fetch_add(steps, Ordering::Relaxed);
    }

    pub(crate) fn add_write_breaks(&self, breaks: u64) {
        self.inner.write_breaks.fetch_add(breaks, Ordering::Relaxed);
    }

    pub(crate) fn add_log_scan_steps(&self, steps: u64) {
        self.inner.log_scan_steps.fetch_add(steps, Ordering::Relaxed);
    }

    /// Free ranges examined by allocations
    pub fn alloc_steps(&self) -> u64 {
        self.inner.alloc_steps.load(Ordering::Relaxed)
    }

    /// Neighbour comparisons made by releases
    pub fn free_steps(&self) -> u64 {
        self.inner.free_steps.load(Ordering::Relaxed)
    }

    /// Prior entries invalidated by appends
    pub fn write_breaks(&self) -> u64 {
        self.inner.write_breaks.load(Ordering::Relaxed)
    }

    /// Log entries visited by scans
    pub fn log_scan_steps(&self) -> u64 {
        self.inner.log_scan_steps.load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        log::info!("clearing telemetry counters");
        for counter in &self.inner.ops {
            counter.count.store(0, Ordering::Relaxed);
            counter.nanos.store(0, Ordering::Relaxed);
        }
        self.inner.alloc_steps.store(0, Ordering::Relaxed);
        self.inner.free_steps.store(0, Ordering::Relaxed);
        self.inner.write_breaks.store(0, Ordering::Relaxed);
        self.inner.log_scan_steps.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let ops = OpKind::ALL
            .iter()
            .map(|&op| OpStats {
                op,
                count: self.count(op),
                cumulative_time: self.cumulative_time(op),
            })
            .collect();
        TelemetrySnapshot {
            measure_timing: self.measure_timing(),
            ops,
            alloc_steps: self.alloc_steps(),
            free_steps: self.free_steps(),
            write_breaks: self.write_breaks(),
            log_scan_steps: self.log_scan_steps(),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("measure_timing", &self.measure_timing())
            .field("alloc_steps", &self.alloc_steps())
            .field("free_steps", &self.free_steps())
            .field("write_breaks", &self.write_breaks())
            .finish()
    }
}

/// Records one sample for its operation kind when dropped
#[must_use = "the sample is recorded when the timer is dropped"]
pub struct OpTimer {
    telemetry: Telemetry,
    op: OpKind,
    start: Instant,
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        self.telemetry.record(self.op, self.start.elapsed());
    }
}

/// Counters of one operation kind
#[derive(Debug, Clone, Serialize)]
pub struct OpStats {
    pub op: OpKind,
    pub count: u64,
    /// Nanoseconds
    pub cumulative_time: u64,
}

impl OpStats {
    /// Mean nanoseconds per operation, 0 when nothing was recorded
    pub fn average(&self) -> u64 {
        average(self.cumulative_time, self.count)
    }
}

/// Copy of a [`Telemetry`] counter set
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub measure_timing: bool,
    pub ops: Vec<OpStats>,
    pub alloc_steps: u64,
    pub free_steps: u64,
    pub write_breaks: u64,
    pub log_scan_steps: u64,
}

impl TelemetrySnapshot {
    /// Counters for `op`
    pub fn op(&self, op: OpKind) -> &OpStats {
        &self.ops[op.index()]
    }

    /// Allocations of either block kind
    pub fn allocations(&self) -> u64 {
        self.op(OpKind::NewDataBlocks).count + self.op(OpKind::NewMetaBlocks).count
    }

    /// Releases of either block kind
    pub fn releases(&self) -> u64 {
        self.op(OpKind::FreeDataBlocks).count + self.op(OpKind::FreeMetaBlocks).count
    }

    /// Amortized free ranges examined per allocation
    pub fn average_alloc_steps(&self) -> u64 {
        average(self.alloc_steps, self.allocations())
    }

    /// Amortized comparisons per release
    pub fn average_free_steps(&self) -> u64 {
        average(self.free_steps, self.releases())
    }

    /// Amortized invalidations per append
    pub fn average_write_breaks(&self) -> u64 {
        average(self.write_breaks, self.op(OpKind::Logging).count)
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "======== pmextent timing stats ========")?;
        for stats in &self.ops {
            if self.measure_timing {
                writeln!(
                    f,
                    "{}: count {}, timing {}, average {}",
                    stats.op.name(),
                    stats.count,
                    stats.cumulative_time,
                    stats.average()
                )?;
            } else {
                writeln!(f, "{}: count {}", stats.op.name(), stats.count)?;
            }
        }
        writeln!(
            f,
            "alloc {}, alloc steps {}, average {}",
            self.allocations(),
            self.alloc_steps,
            self.average_alloc_steps()
        )?;
        writeln!(
            f,
            "free {}, free steps {}, average {}",
            self.releases(),
            self.free_steps,
            self.average_free_steps()
        )?;
        writeln!(
            f,
            "write {}, write breaks {}, average {}",
            self.op(OpKind::Logging).count,
            self.write_breaks,
            self.average_write_breaks()
        )?;
        write!(f, "log scan steps {}", self.log_scan_steps)
    }
}

fn average(total: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        total / count
    }
}
