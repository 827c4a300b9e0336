//! The store of dataflow facts accumulated for a function's terms.

use crate::containers::UnorderedMap;
use crate::ir::{Function, TermId};
use crate::memory_location::MemoryLocation;
use crate::reaching_definitions::ReachingDefinitions;
use crate::value::Value;

/// Three maps keyed by term identity: the term's [`Value`], its resolved [`MemoryLocation`],
/// and, for reads, the definitions reaching it. Entries are created lazily during the
/// transfer functions; an absent entry means top (no information), which is also how
/// downstream passes are expected to treat it.
#[derive(Debug, Default)]
pub struct Dataflow {
    term_values: UnorderedMap<TermId, Value>,
    term_locations: UnorderedMap<TermId, MemoryLocation>,
    term_definitions: UnorderedMap<TermId, ReachingDefinitions>,
}

impl Dataflow {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn value(&self, term: TermId) -> Option<&Value> {
        self.term_values.get(&term)
    }

    pub(crate) fn value_mut(&mut self, term: TermId) -> &mut Value {
        self.term_values.entry(term).or_default()
    }

    /// The location resolved for the term, or the unset sentinel.
    pub fn memory_location(&self, term: TermId) -> MemoryLocation {
        self.term_locations
            .get(&term)
            .copied()
            .unwrap_or(MemoryLocation::UNSET)
    }

    pub(crate) fn set_memory_location(&mut self, term: TermId, location: MemoryLocation) {
        self.term_locations.insert(term, location);
    }

    pub fn definitions(&self, term: TermId) -> Option<&ReachingDefinitions> {
        self.term_definitions.get(&term)
    }

    pub(crate) fn definitions_mut(&mut self, term: TermId) -> &mut ReachingDefinitions {
        self.term_definitions.entry(term).or_default()
    }

    /// Drop every (location, term) pair whose defining term no longer covers the chunk it is
    /// recorded in. Term locations are recomputed while the analysis runs and may move or
    /// shrink, leaving stale pairs behind.
    pub(crate) fn filter_uncovered_definitions(&mut self) {
        let locations = &self.term_locations;
        for definitions in self.term_definitions.values_mut() {
            definitions.filter_out(|location, term| {
                !locations
                    .get(&term)
                    .map_or(false, |defined| defined.covers(location))
            });
        }
    }

    /// Forget everything about terms whose statement no longer belongs to a basic block.
    pub(crate) fn purge_disappeared(&mut self, function: &Function) {
        for definitions in self.term_definitions.values_mut() {
            definitions.filter_out(|_, term| has_disappeared(function, term));
        }
        self.term_values
            .retain(|&term, _| !has_disappeared(function, term));
        self.term_locations
            .retain(|&term, _| !has_disappeared(function, term));
        self.term_definitions
            .retain(|&term, _| !has_disappeared(function, term));
    }
}

fn has_disappeared(function: &Function, term: TermId) -> bool {
    match function.term(term).statement() {
        Some(statement) => function.statement(statement).basic_block().is_none(),
        // Never attached to a statement at all.
        None => true,
    }
}
