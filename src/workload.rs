//! Programs run by the simulated cores.
//!
//! A workload hands the processor one instruction at a time and is told the
//! value every memory access returned, so programs can branch on loaded
//! values (spinlocks). Each built-in workload also knows the final memory
//! contents it must leave behind.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{Addr, Cycle, WORD_BYTES};
use crate::config::{Config, WorkloadConfig};
use crate::error::ConfigError;
use crate::message::RmwOp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instr {
    Load(Addr),
    Store(Addr, u64),
    Rmw(Addr, RmwOp),
    /// wait until every outstanding access of the core has completed
    Fence,
    Compute(Cycle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    Op(Instr),
    /// nothing to issue until an outstanding access completes
    Wait,
    Done,
}

pub trait Workload: Send {
    fn next(&mut self) -> Next;

    /// An access issued by this workload completed. `value` is the loaded
    /// value, the old value for read-modify-writes.
    fn complete(&mut self, addr: Addr, value: u64);
}

/// Fixed addresses used by the built-in workloads, one line apart.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub lock: Addr,
    pub counter: Addr,
    pub shared_line: Addr,
    pub array: Addr,
}

impl Layout {
    pub fn new(line_size: u64) -> Self {
        Self {
            lock: Addr(0),
            counter: Addr(line_size),
            shared_line: Addr(2 * line_size),
            array: Addr(4 * line_size),
        }
    }
}

/// A fixed instruction list, typically read from a trace file.
pub struct Trace {
    insts: VecDeque<Instr>,
}

impl Trace {
    pub fn new(insts: impl IntoIterator<Item = Instr>) -> Self {
        Self { insts: insts.into_iter().collect() }
    }

    /// Parses one instruction per line: `<op> <hex> [hex value]` where op 0
    /// loads, 1 stores (the value defaults to the line number) and 2
    /// computes for the given number of cycles. Blank lines and lines
    /// starting with `#` are skipped.
    pub fn parse(text: &str) -> Result<Vec<Instr>, ConfigError> {
        let hex = |line: usize, s: &str| {
            u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| ConfigError::Trace {
                line,
                reason: format!("`{s}`: {e}"),
            })
        };
        let mut insts = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let mut parts = raw.split_whitespace();
            let (Some(op), Some(arg)) = (parts.next(), parts.next()) else {
                return Err(ConfigError::Trace { line, reason: "expected `<op> <hex>`".to_string() });
            };
            let arg = hex(line, arg)?;
            insts.push(match op {
                "0" => Instr::Load(Addr(arg)),
                "1" => {
                    let value = match parts.next() {
                        Some(v) => hex(line, v)?,
                        None => line as u64,
                    };
                    Instr::Store(Addr(arg), value)
                }
                "2" => Instr::Compute(arg),
                other => {
                    return Err(ConfigError::Trace { line, reason: format!("unknown instruction `{other}`") });
                }
            });
        }
        Ok(insts)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        Ok(Self::new(Self::parse(&text)?))
    }
}

impl Workload for Trace {
    fn next(&mut self) -> Next {
        self.insts.pop_front().map_or(Next::Done, Next::Op)
    }

    fn complete(&mut self, _addr: Addr, _value: u64) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockStep {
    /// spin reading the lock until it looks free
    Test,
    Acquire,
    Read,
    Increment(u64),
    Release,
}

/// Test-and-test-and-set lock around a load/store increment of a shared
/// counter. Every access waits for the previous one.
pub struct SpinlockCounter {
    layout: Layout,
    remaining: u64,
    step: LockStep,
    waiting: bool,
}

impl SpinlockCounter {
    pub fn new(layout: Layout, iterations: u64) -> Self {
        Self { layout, remaining: iterations, step: LockStep::Test, waiting: false }
    }
}

impl Workload for SpinlockCounter {
    fn next(&mut self) -> Next {
        if self.waiting {
            return Next::Wait;
        }
        if self.remaining == 0 {
            return Next::Done;
        }
        self.waiting = true;
        let Layout { lock, counter, .. } = self.layout;
        Next::Op(match self.step {
            LockStep::Test => Instr::Load(lock),
            LockStep::Acquire => Instr::Rmw(lock, RmwOp::Swap(1)),
            LockStep::Read => Instr::Load(counter),
            LockStep::Increment(v) => Instr::Store(counter, v + 1),
            LockStep::Release => Instr::Store(lock, 0),
        })
    }

    fn complete(&mut self, _addr: Addr, value: u64) {
        self.waiting = false;
        self.step = match self.step {
            LockStep::Test | LockStep::Acquire if value != 0 => LockStep::Test,
            LockStep::Test => LockStep::Acquire,
            LockStep::Acquire => LockStep::Read,
            LockStep::Read => LockStep::Increment(value),
            LockStep::Increment(_) => LockStep::Release,
            LockStep::Release => {
                self.remaining -= 1;
                LockStep::Test
            }
        };
    }
}

/// Atomic fetch-adds to one word, each behind a fence.
pub struct FetchAddLoop {
    addr: Addr,
    remaining: u64,
    fenced: bool,
}

impl FetchAddLoop {
    pub fn new(addr: Addr, iterations: u64) -> Self {
        Self { addr, remaining: iterations, fenced: false }
    }
}

impl Workload for FetchAddLoop {
    fn next(&mut self) -> Next {
        if self.remaining == 0 {
            return Next::Done;
        }
        if !self.fenced {
            self.fenced = true;
            return Next::Op(Instr::Fence);
        }
        self.fenced = false;
        self.remaining -= 1;
        Next::Op(Instr::Rmw(self.addr, RmwOp::FetchAdd(1)))
    }

    fn complete(&mut self, _addr: Addr, _value: u64) {}
}

/// Stores to random elements of the core's own chunk of a shared array,
/// interleaved with loads of every 256th element of the whole array.
pub struct RandomArray {
    rng: StdRng,
    base: Addr,
    elements: u64,
    first: u64,
    chunk: u64,
    tag: u64,
    iteration: u64,
    iterations: u64,
    store_next: bool,
}

impl RandomArray {
    pub fn new(base: Addr, elements: u64, iterations: u64, seed: u64, core: usize, num_cpus: usize) -> Self {
        let chunk = (elements / num_cpus as u64).max(1);
        Self {
            rng: StdRng::seed_from_u64(seed.wrapping_add(core as u64)),
            base,
            elements: elements.max(1),
            first: (core as u64 * chunk).min(elements.saturating_sub(chunk)),
            chunk,
            tag: (core as u64 + 1) << 32,
            iteration: 0,
            iterations,
            store_next: true,
        }
    }

    fn element(&self, i: u64) -> Addr {
        Addr(self.base.0 + i * WORD_BYTES)
    }
}

impl Workload for RandomArray {
    fn next(&mut self) -> Next {
        if self.iteration == self.iterations {
            return Next::Done;
        }
        let inst = if self.store_next {
            let i = self.first + self.rng.gen_range(0..self.chunk);
            Instr::Store(self.element(i), self.tag | self.iteration)
        } else {
            let i = (self.iteration * 256) % self.elements;
            self.iteration += 1;
            Instr::Load(self.element(i))
        };
        self.store_next = !self.store_next;
        Next::Op(inst)
    }

    fn complete(&mut self, _addr: Addr, _value: u64) {}
}

/// Instantiates the configured workload for every core.
pub fn build(config: &Config) -> Result<Vec<Box<dyn Workload>>, ConfigError> {
    let layout = Layout::new(config.cache.line_size);
    let n = config.num_cpus;
    let workloads: Vec<Box<dyn Workload>> = match &config.workload {
        WorkloadConfig::SpinlockCounter { iterations } => (0..n)
            .map(|_| Box::new(SpinlockCounter::new(layout, *iterations)) as Box<dyn Workload>)
            .collect(),
        WorkloadConfig::SharedCounter { iterations } => (0..n)
            .map(|_| Box::new(FetchAddLoop::new(layout.counter, *iterations)) as Box<dyn Workload>)
            .collect(),
        WorkloadConfig::FalseSharing { iterations } => (0..n)
            .map(|i| {
                let word = Addr(layout.shared_line.0 + (i % 2) as u64 * WORD_BYTES);
                Box::new(FetchAddLoop::new(word, *iterations)) as Box<dyn Workload>
            })
            .collect(),
        WorkloadConfig::RandomArray { elements, iterations, seed } => {
            let end = layout.array.0 + elements * WORD_BYTES;
            if end > config.memory_size {
                return Err(ConfigError::TooSmall {
                    what: "memory size",
                    value: config.memory_size as usize,
                    min: end as usize,
                });
            }
            (0..n)
                .map(|i| {
                    Box::new(RandomArray::new(layout.array, *elements, *iterations, *seed, i, n)) as Box<dyn Workload>
                })
                .collect()
        }
        WorkloadConfig::Trace { files } => {
            if files.len() != n {
                return Err(ConfigError::WorkloadCount { expected: n, got: files.len() });
            }
            files
                .iter()
                .map(|f| Trace::load(f).map(|t| Box::new(t) as Box<dyn Workload>))
                .collect::<Result<_, _>>()?
        }
    };
    Ok(workloads)
}

/// Final word values the configured workload must produce.
pub fn expectations(config: &Config) -> Vec<(Addr, u64)> {
    let layout = Layout::new(config.cache.line_size);
    let n = config.num_cpus as u64;
    match &config.workload {
        WorkloadConfig::SpinlockCounter { iterations } => vec![(layout.lock, 0), (layout.counter, n * iterations)],
        WorkloadConfig::SharedCounter { iterations } => vec![(layout.counter, n * iterations)],
        WorkloadConfig::FalseSharing { iterations } => {
            let odd = n / 2;
            let mut v = vec![(layout.shared_line, (n - odd) * iterations)];
            if odd > 0 {
                v.push((Addr(layout.shared_line.0 + WORD_BYTES), odd * iterations));
            }
            v
        }
        WorkloadConfig::RandomArray { .. } | WorkloadConfig::Trace { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trace_lines() {
        let text = "0 0x40\n# comment\n1 80 2a\n\n2 0x10\n1 c0\n";
        assert_eq!(
            Trace::parse(text).unwrap(),
            vec![
                Instr::Load(Addr(0x40)),
                Instr::Store(Addr(0x80), 0x2a),
                Instr::Compute(0x10),
                Instr::Store(Addr(0xc0), 6),
            ]
        );
    }

    #[test]
    fn rejects_bad_trace_lines() {
        assert_eq!(
            Trace::parse("0 0x40\n7 0x40\n"),
            Err(ConfigError::Trace { line: 2, reason: "unknown instruction `7`".to_string() })
        );
        assert!(matches!(Trace::parse("0 zz"), Err(ConfigError::Trace { line: 1, .. })));
        assert!(matches!(Trace::parse("1"), Err(ConfigError::Trace { line: 1, .. })));
    }

    #[test]
    fn spinlock_retries_until_lock_is_free() {
        let layout = Layout::new(64);
        let mut w = SpinlockCounter::new(layout, 1);
        assert_eq!(w.next(), Next::Op(Instr::Load(layout.lock)));
        assert_eq!(w.next(), Next::Wait);
        w.complete(layout.lock, 1);
        assert_eq!(w.next(), Next::Op(Instr::Load(layout.lock)));
        w.complete(layout.lock, 0);
        assert_eq!(w.next(), Next::Op(Instr::Rmw(layout.lock, RmwOp::Swap(1))));
        // lost the race
        w.complete(layout.lock, 1);
        assert_eq!(w.next(), Next::Op(Instr::Load(layout.lock)));
        w.complete(layout.lock, 0);
        w.next();
        w.complete(layout.lock, 0);
        assert_eq!(w.next(), Next::Op(Instr::Load(layout.counter)));
        w.complete(layout.counter, 41);
        assert_eq!(w.next(), Next::Op(Instr::Store(layout.counter, 42)));
        w.complete(layout.counter, 41);
        assert_eq!(w.next(), Next::Op(Instr::Store(layout.lock, 0)));
        w.complete(layout.lock, 1);
        assert_eq!(w.next(), Next::Done);
    }

    #[test]
    fn fetch_add_loop_fences_every_add() {
        let mut w = FetchAddLoop::new(Addr(0x40), 2);
        let ops: Vec<_> = std::iter::from_fn(|| match w.next() {
            Next::Op(i) => Some(i),
            _ => None,
        })
        .collect();
        assert_eq!(
            ops,
            vec![
                Instr::Fence,
                Instr::Rmw(Addr(0x40), RmwOp::FetchAdd(1)),
                Instr::Fence,
                Instr::Rmw(Addr(0x40), RmwOp::FetchAdd(1)),
            ]
        );
    }

    #[test]
    fn random_array_stays_in_own_chunk() {
        let base = Addr(0x1000);
        let mut w = RandomArray::new(base, 1024, 50, 7, 2, 4);
        let mut loads = 0;
        while let Next::Op(inst) = w.next() {
            match inst {
                Instr::Store(a, v) => {
                    let i = (a.0 - base.0) / WORD_BYTES;
                    assert!((512..768).contains(&i), "element {i}");
                    assert_eq!(v >> 32, 3);
                }
                Instr::Load(a) => {
                    assert_eq!((a.0 - base.0) / WORD_BYTES % 256, 0);
                    loads += 1;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(loads, 50);
    }

    #[test]
    fn false_sharing_expectations_split_by_parity() {
        let config = Config {
            num_cpus: 3,
            workload: WorkloadConfig::FalseSharing { iterations: 10 },
            ..Config::default()
        };
        assert_eq!(expectations(&config), vec![(Addr(128), 20), (Addr(136), 10)]);
        assert_eq!(build(&config).unwrap().len(), 3);
    }
}
