//! Set-associative tag/data array with LRU replacement.

use crate::common::LineAddr;
use crate::error::ConfigError;

#[derive(Clone, Debug)]
struct Way<E> {
    line: LineAddr,
    last_used: u64,
    entry: E,
}

#[derive(Clone, Debug)]
struct CacheSet<E> {
    ways: Vec<Way<E>>,
}

impl<E> CacheSet<E> {
    fn find(&self, line: LineAddr) -> Option<usize> {
        self.ways.iter().position(|w| w.line == line)
    }
    fn lru(&self) -> Option<&Way<E>> {
        self.ways.iter().min_by_key(|w| w.last_used)
    }
}

#[derive(Clone, Debug)]
pub struct CacheMemory<E> {
    sets: Vec<CacheSet<E>>,
    assoc: usize,
    block_bits: u32,
    mru_ctr: u64,
}

impl<E> CacheMemory<E> {
    pub fn new(size: u64, assoc: usize, line_size: u64) -> Result<Self, ConfigError> {
        if !line_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo { what: "line size", value: line_size });
        }
        let set_bytes = assoc as u64 * line_size;
        if assoc == 0 || size == 0 || size % set_bytes != 0 {
            return Err(ConfigError::CacheGeometry { size, assoc, line_size });
        }
        let num_sets = (size / set_bytes) as usize;
        Ok(Self {
            sets: (0..num_sets).map(|_| CacheSet { ways: Vec::with_capacity(assoc) }).collect(),
            assoc,
            block_bits: line_size.trailing_zeros(),
            mru_ctr: 0,
        })
    }

    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn assoc(&self) -> usize {
        self.assoc
    }

    fn set_index(&self, line: LineAddr) -> usize {
        ((line.0 >> self.block_bits) % self.sets.len() as u64) as usize
    }

    fn set(&self, line: LineAddr) -> &CacheSet<E> {
        &self.sets[self.set_index(line)]
    }

    fn set_mut(&mut self, line: LineAddr) -> &mut CacheSet<E> {
        let idx = self.set_index(line);
        &mut self.sets[idx]
    }

    pub fn contains(&self, line: LineAddr) -> bool {
        self.set(line).find(line).is_some()
    }

    pub fn lookup(&self, line: LineAddr) -> Option<&E> {
        let set = self.set(line);
        set.find(line).map(|i| &set.ways[i].entry)
    }

    pub fn lookup_mut(&mut self, line: LineAddr) -> Option<&mut E> {
        let set = self.set_mut(line);
        set.find(line).map(move |i| &mut set.ways[i].entry)
    }

    /// mark `line` most recently used
    pub fn touch(&mut self, line: LineAddr) {
        self.mru_ctr += 1;
        let ctr = self.mru_ctr;
        let set = self.set_mut(line);
        if let Some(i) = set.find(line) {
            set.ways[i].last_used = ctr;
        }
    }

    pub fn has_free_way(&self, line: LineAddr) -> bool {
        self.set(line).ways.len() < self.assoc
    }

    /// Least recently used line of the set `line` maps to, if that set is full.
    pub fn victim(&self, line: LineAddr) -> Option<LineAddr> {
        if self.has_free_way(line) {
            return None;
        }
        self.set(line).lru().map(|w| w.line)
    }

    /// Places `entry` in a free way. Returns the entry back when the set is full.
    pub fn allocate(&mut self, line: LineAddr, entry: E) -> Result<&mut E, E> {
        if !self.has_free_way(line) || self.contains(line) {
            return Err(entry);
        }
        self.mru_ctr += 1;
        let last_used = self.mru_ctr;
        let set = self.set_mut(line);
        set.ways.push(Way { line, last_used, entry });
        let way = set.ways.len() - 1;
        Ok(&mut set.ways[way].entry)
    }

    pub fn deallocate(&mut self, line: LineAddr) -> Option<E> {
        let set = self.set_mut(line);
        set.find(line).map(|i| set.ways.swap_remove(i).entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LineAddr, &E)> {
        self.sets.iter().flat_map(|s| s.ways.iter().map(|w| (w.line, &w.entry)))
    }
}
