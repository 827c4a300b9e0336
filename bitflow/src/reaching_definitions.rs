//! Sets of definitions reaching a program point, kept as disjoint bit-chunks.
//!
//! A [`ReachingDefinitions`] is an ordered sequence of [`Chunk`]s. Each chunk names a bit range
//! of some memory domain together with the write terms that may supply the bits inside it.
//! Chunks are sorted by domain and bit address, pairwise disjoint, and never empty; a write
//! that partially overlaps an existing chunk splits it, so that the bits outside the write keep
//! their old definitions.

use itertools::Itertools;

use crate::ir::TermId;
use crate::memory_location::{MemoryDomain, MemoryLocation};

/// One bit range and the terms defining it.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    location: MemoryLocation,
    definitions: Vec<TermId>,
}

impl Chunk {
    fn new(location: MemoryLocation, definitions: Vec<TermId>) -> Self {
        debug_assert!(location.is_set());
        debug_assert!(!definitions.is_empty());
        Self {
            location,
            definitions,
        }
    }

    pub fn location(&self) -> &MemoryLocation {
        &self.location
    }

    /// The defining terms, sorted by identity.
    pub fn definitions(&self) -> &[TermId] {
        &self.definitions
    }

    fn insert_definition(&mut self, term: TermId) {
        if let Err(position) = self.definitions.binary_search(&term) {
            self.definitions.insert(position, term);
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}: {:?}", self.location, self.definitions)
    }
}

/// The definitions reaching one program point.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ReachingDefinitions {
    chunks: Vec<Chunk>,
}

impl ReachingDefinitions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Record that `term` defines every bit of `location`, overwriting whatever defined those
    /// bits before. Chunks partially overlapping `location` are split so that their remaining
    /// bits keep their old definitions.
    pub fn add_definition(&mut self, location: &MemoryLocation, term: TermId) {
        self.kill_definitions(location);
        let position = self
            .chunks
            .iter()
            .take_while(|chunk| chunk.location < *location)
            .count();
        self.chunks
            .insert(position, Chunk::new(*location, vec![term]));
    }

    /// Forget everything known about the bits of `location`, splitting partially overlapping
    /// chunks as in [`Self::add_definition`].
    pub fn kill_definitions(&mut self, location: &MemoryLocation) {
        if !location.is_set() {
            return;
        }
        let mut rebuilt = Vec::with_capacity(self.chunks.len());
        for chunk in self.chunks.drain(..) {
            if !chunk.location.overlaps(location) {
                rebuilt.push(chunk);
                continue;
            }
            if chunk.location.addr() < location.addr() {
                rebuilt.push(Chunk::new(
                    MemoryLocation::new(
                        chunk.location.domain(),
                        chunk.location.addr(),
                        (location.addr() - chunk.location.addr()) as usize,
                    ),
                    chunk.definitions.clone(),
                ));
            }
            if chunk.location.end_addr() > location.end_addr() {
                rebuilt.push(Chunk::new(
                    MemoryLocation::new(
                        chunk.location.domain(),
                        location.end_addr(),
                        (chunk.location.end_addr() - location.end_addr()) as usize,
                    ),
                    chunk.definitions.clone(),
                ));
            }
        }
        self.chunks = rebuilt;
    }

    /// The definitions feeding a read of `location`: every chunk clipped to the bits it shares
    /// with `location`.
    pub fn project(&self, location: &MemoryLocation) -> ReachingDefinitions {
        ReachingDefinitions {
            chunks: self
                .chunks
                .iter()
                .filter_map(|chunk| {
                    chunk
                        .location
                        .intersect(location)
                        .map(|clipped| Chunk::new(clipped, chunk.definitions.clone()))
                })
                .collect(),
        }
    }

    /// Pointwise union with `other`. Where the two operands disagree on chunk boundaries, the
    /// chunks are split at every boundary of either side, so disjointness is preserved.
    pub fn merge(&mut self, other: &ReachingDefinitions) {
        if other.chunks.is_empty() {
            return;
        }
        if self.chunks.is_empty() {
            self.chunks = other.chunks.clone();
            return;
        }
        let cuts: Vec<(MemoryDomain, i64)> = self
            .chunks
            .iter()
            .chain(&other.chunks)
            .flat_map(|chunk| {
                [
                    (chunk.location.domain(), chunk.location.addr()),
                    (chunk.location.domain(), chunk.location.end_addr()),
                ]
            })
            .sorted()
            .dedup()
            .collect();

        let mut fragments = Vec::new();
        for chunk in self.chunks.iter().chain(&other.chunks) {
            let domain = chunk.location.domain();
            let end = chunk.location.end_addr();
            let mut addr = chunk.location.addr();
            for &(_, cut) in cuts
                .iter()
                .filter(|&&(d, a)| d == domain && a > chunk.location.addr() && a < end)
            {
                fragments.push(Chunk::new(
                    MemoryLocation::new(domain, addr, (cut - addr) as usize),
                    chunk.definitions.clone(),
                ));
                addr = cut;
            }
            fragments.push(Chunk::new(
                MemoryLocation::new(domain, addr, (end - addr) as usize),
                chunk.definitions.clone(),
            ));
        }

        fragments.sort_by_key(|chunk| chunk.location);
        let mut merged: Vec<Chunk> = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            match merged.last_mut() {
                Some(last) if last.location == fragment.location => {
                    for term in fragment.definitions {
                        last.insert_definition(term);
                    }
                }
                _ => merged.push(fragment),
            }
        }
        self.chunks = merged;
    }

    /// Drop every (location, term) pair satisfying the predicate; chunks left without
    /// definitions disappear.
    pub fn filter_out(&mut self, mut predicate: impl FnMut(&MemoryLocation, TermId) -> bool) {
        for chunk in &mut self.chunks {
            let location = chunk.location;
            chunk.definitions.retain(|&term| !predicate(&location, term));
        }
        self.chunks.retain(|chunk| !chunk.definitions.is_empty());
    }
}

impl std::fmt::Debug for ReachingDefinitions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(&self.chunks).finish()
    }
}
