//! The abstract-interpretation driver.
//!
//! [`DataflowAnalyzer::analyze`] sweeps the basic blocks of a function, executing every
//! statement against an [`ExecutionContext`] seeded with the merged out-sets of the block's
//! predecessors, until no block's out-set has changed for several consecutive sweeps. Memory
//! locations are resolved from values computed by the same analysis, so reads and writes keep
//! creating and moving their own locations; the sweeps iterate that interplay to a fixed
//! point.

use crate::abstract_value::{bit_mask, AbstractValue};
use crate::analysis_config::CONFIG;
use crate::arch::{Architecture, Endian};
use crate::cancellation::{CancellationToken, Cancelled};
use crate::cfg::Cfg;
use crate::containers::UnorderedMap;
use crate::dataflow::Dataflow;
use crate::ir::{
    BasicBlockId, BinaryOperatorKind, Function, IntrinsicKind, StatementId, StatementKind,
    TermId, TermKind, UnaryOperatorKind,
};
use crate::log::*;
use crate::memory_location::{MemoryDomain, MemoryLocation};
use crate::reaching_definitions::ReachingDefinitions;

/// The scratchpad carried along a basic block: the definitions reaching the statement being
/// executed.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    definitions: ReachingDefinitions,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn definitions(&self) -> &ReachingDefinitions {
        &self.definitions
    }

    pub fn definitions_mut(&mut self) -> &mut ReachingDefinitions {
        &mut self.definitions
    }
}

pub struct DataflowAnalyzer<'a> {
    dataflow: &'a mut Dataflow,
    function: &'a Function,
    architecture: &'a dyn Architecture,
}

impl<'a> DataflowAnalyzer<'a> {
    pub fn new(
        dataflow: &'a mut Dataflow,
        function: &'a Function,
        architecture: &'a dyn Architecture,
    ) -> Self {
        Self {
            dataflow,
            function,
            architecture,
        }
    }

    /// Run the analysis to its fixed point, or until the sweep cap or a cancellation stops it.
    /// On cancellation the facts accumulated so far stay in the dataflow store.
    pub fn analyze(&mut self, canceled: &CancellationToken) -> Result<(), Cancelled> {
        let cfg = Cfg::new(self.function);
        let mut out_definitions: UnorderedMap<BasicBlockId, ReachingDefinitions> =
            UnorderedMap::new();

        let mut nsweeps = 0usize;
        let mut nfixpoints = 0usize;

        while nfixpoints < CONFIG.stable_sweeps {
            nfixpoints += 1;

            for block in self.function.basic_block_ids() {
                let mut context = ExecutionContext::new();

                for &predecessor in cfg.predecessors(block) {
                    if let Some(definitions) = out_definitions.get(&predecessor) {
                        context.definitions_mut().merge(definitions);
                    }
                }

                // Definitions whose term moved away no longer define these bits.
                let dataflow = &*self.dataflow;
                context.definitions_mut().filter_out(|location, term| {
                    !dataflow.memory_location(term).covers(location)
                });

                let function = self.function;
                for &statement in function.basic_block(block).statements() {
                    self.execute_statement(statement, &mut context);
                }

                let stored = out_definitions.entry(block).or_default();
                if *stored != *context.definitions() {
                    *stored = std::mem::take(context.definitions_mut());
                    nfixpoints = 0;
                }
            }

            // Term addresses may have changed during the sweep; filter the stored per-term
            // definitions again.
            self.dataflow.filter_uncovered_definitions();

            nsweeps += 1;
            trace!("dataflow sweep done"; "sweep" => nsweeps, "stable" => nfixpoints);
            if nsweeps >= CONFIG.max_sweeps {
                warn!(
                    "Fixpoint was not reached after {} sweeps while analyzing dataflow. Giving up.",
                    nsweeps
                );
                break;
            }

            canceled.poll()?;
        }

        self.dataflow.purge_disappeared(self.function);
        Ok(())
    }

    /// Execute one statement against the context.
    pub fn execute_statement(&mut self, statement: StatementId, context: &mut ExecutionContext) {
        let kind = self.function.statement(statement).kind();
        match kind {
            StatementKind::InlineAssembly => {
                // Strictly, the effects are opaque and the reaching definitions should go.
                // Keeping them usually leads to better code.
                if CONFIG.clear_definitions_at_inline_assembly {
                    context.definitions_mut().clear();
                }
            }
            StatementKind::Assignment { left, right } => {
                let (left, right) = (*left, *right);
                self.execute_term(right, context);
                self.execute_term(left, context);
                // The destination takes the value of the source; readers of the destination's
                // location pick it up through the reaching-definitions merge.
                let value = self.dataflow.value(right).cloned().unwrap_or_default();
                *self.dataflow.value_mut(left) = value;
            }
            StatementKind::Jump {
                condition,
                then_address,
                else_address,
            } => {
                let terms = [*condition, *then_address, *else_address];
                for term in terms.into_iter().flatten() {
                    self.execute_term(term, context);
                }
            }
            StatementKind::Call { target } => {
                let target = *target;
                self.execute_term(target, context);
            }
            StatementKind::Return => {}
            StatementKind::Touch { term } => {
                let term = *term;
                self.execute_term(term, context);
            }
            StatementKind::Callback { callback } => {
                let callback = callback.clone();
                (*callback)();
            }
        }
    }

    /// Execute one term, updating its facts and the context.
    pub fn execute_term(&mut self, term: TermId, context: &mut ExecutionContext) {
        let size = self.function.term(term).size();
        let kind = self.function.term(term).kind();
        match kind {
            TermKind::Constant { value } => {
                let value = *value;
                let record = self.dataflow.value_mut(term);
                record.set_abstract_value(AbstractValue::concrete(size, value));
                record.make_not_stack_offset();
                record.make_not_product();
            }
            TermKind::Intrinsic { kind } => {
                let kind = *kind;
                self.execute_intrinsic(term, kind, size, context);
            }
            TermKind::MemoryLocationAccess { location } => {
                let location = *location;
                self.set_memory_location(term, location, context);
            }
            TermKind::Dereference { address, domain } => {
                let (address, domain) = (*address, *domain);
                self.execute_term(address, context);

                let address_value = self.dataflow.value(address).cloned().unwrap_or_default();
                let location = if address_value.abstract_value().is_concrete() {
                    let concrete = address_value.abstract_value().as_concrete() as i64;
                    if domain == MemoryDomain::Memory {
                        // Byte addresses; locations are in bit units.
                        MemoryLocation::new(domain, concrete * 8, size)
                    } else {
                        MemoryLocation::new(domain, concrete, size)
                    }
                } else if address_value.is_stack_offset() {
                    MemoryLocation::new(MemoryDomain::Stack, address_value.stack_offset() * 8, size)
                } else {
                    MemoryLocation::UNSET
                };
                self.set_memory_location(term, location, context);
            }
            TermKind::UnaryOperator { kind, operand } => {
                let (kind, operand) = (*kind, *operand);
                self.execute_unary_operator(term, kind, size, operand, context);
            }
            TermKind::BinaryOperator { kind, left, right } => {
                let (kind, left, right) = (*kind, *left, *right);
                self.execute_binary_operator(term, kind, left, right, context);
            }
            TermKind::Choice { preferred, default } => {
                let (preferred, default) = (*preferred, *default);
                self.execute_term(preferred, context);
                self.execute_term(default, context);

                let source = if self
                    .dataflow
                    .definitions(preferred)
                    .map_or(false, |definitions| !definitions.is_empty())
                {
                    preferred
                } else {
                    default
                };
                let value = self.dataflow.value(source).cloned().unwrap_or_default();
                *self.dataflow.value_mut(term) = value;
            }
        }
    }

    fn execute_intrinsic(
        &mut self,
        term: TermId,
        kind: IntrinsicKind,
        size: usize,
        context: &mut ExecutionContext,
    ) {
        match kind {
            IntrinsicKind::Unknown | IntrinsicKind::Undefined => {
                let record = self.dataflow.value_mut(term);
                record.set_abstract_value(AbstractValue::nondeterministic(size));
                record.make_not_stack_offset();
                record.make_not_product();
            }
            IntrinsicKind::ZeroStackOffset => {
                let record = self.dataflow.value_mut(term);
                record.set_abstract_value(AbstractValue::nondeterministic(size));
                record.make_stack_offset(0);
                record.make_not_product();
            }
            IntrinsicKind::ReachingSnapshot => {
                *self.dataflow.definitions_mut(term) = context.definitions().clone();
            }
            IntrinsicKind::InstructionAddress | IntrinsicKind::NextInstructionAddress => {
                let instruction = self
                    .function
                    .term(term)
                    .statement()
                    .and_then(|statement| self.function.statement(statement).instruction())
                    .expect("address intrinsics need instruction info on the owning statement");
                let addr = match kind {
                    IntrinsicKind::InstructionAddress => instruction.addr,
                    _ => instruction.addr + instruction.size,
                };
                let record = self.dataflow.value_mut(term);
                record.set_abstract_value(AbstractValue::concrete(size, addr));
                record.make_not_stack_offset();
                record.make_not_product();
            }
            IntrinsicKind::Custom(kind) => {
                warn!("Unknown kind of intrinsic: {}", kind);
            }
        }
    }

    fn execute_unary_operator(
        &mut self,
        term: TermId,
        kind: UnaryOperatorKind,
        size: usize,
        operand: TermId,
        context: &mut ExecutionContext,
    ) {
        self.execute_term(operand, context);

        let operand_value = self.dataflow.value(operand).cloned().unwrap_or_default();
        let applied = apply_unary(kind, size, operand_value.abstract_value());

        let record = self.dataflow.value_mut(term);
        // Always join into the existing value: a later sweep may re-evaluate the term with a
        // more general operand, and the value must not oscillate.
        record.set_abstract_value(applied.merge(record.abstract_value()));

        match kind {
            UnaryOperatorKind::SignExtend
            | UnaryOperatorKind::ZeroExtend
            | UnaryOperatorKind::Truncate => {
                if operand_value.is_not_stack_offset() {
                    record.make_not_stack_offset();
                } else if operand_value.is_stack_offset() {
                    record.make_stack_offset(operand_value.stack_offset());
                }
                if operand_value.is_not_product() {
                    record.make_not_product();
                } else if operand_value.is_product() {
                    record.make_product();
                }
            }
            _ => {
                record.make_not_stack_offset();
                record.make_not_product();
            }
        }
    }

    fn execute_binary_operator(
        &mut self,
        term: TermId,
        kind: BinaryOperatorKind,
        left: TermId,
        right: TermId,
        context: &mut ExecutionContext,
    ) {
        self.execute_term(left, context);
        self.execute_term(right, context);

        let left_value = self.dataflow.value(left).cloned().unwrap_or_default();
        let right_value = self.dataflow.value(right).cloned().unwrap_or_default();
        let applied = apply_binary(
            kind,
            left_value.abstract_value(),
            right_value.abstract_value(),
        );

        let record = self.dataflow.value_mut(term);
        record.set_abstract_value(applied.merge(record.abstract_value()));

        // Stack-offset heuristics for the narrow patterns real binaries produce.
        match kind {
            BinaryOperatorKind::Add => {
                if left_value.is_stack_offset() {
                    if right_value.abstract_value().is_concrete() {
                        record.make_stack_offset(
                            left_value
                                .stack_offset()
                                .wrapping_add(right_value.abstract_value().as_concrete_signed()),
                        );
                    } else if right_value.abstract_value().is_nondeterministic() {
                        record.make_not_stack_offset();
                    }
                }
                if right_value.is_stack_offset() {
                    if left_value.abstract_value().is_concrete() {
                        record.make_stack_offset(
                            right_value
                                .stack_offset()
                                .wrapping_add(left_value.abstract_value().as_concrete_signed()),
                        );
                    } else if left_value.abstract_value().is_nondeterministic() {
                        record.make_not_stack_offset();
                    }
                }
                if left_value.is_not_stack_offset() && right_value.is_not_stack_offset() {
                    record.make_not_stack_offset();
                }
            }
            BinaryOperatorKind::Sub => {
                if left_value.is_stack_offset() && right_value.abstract_value().is_concrete() {
                    record.make_stack_offset(
                        left_value
                            .stack_offset()
                            .wrapping_sub(right_value.abstract_value().as_concrete_signed()),
                    );
                } else if left_value.is_not_stack_offset()
                    || right_value.abstract_value().is_nondeterministic()
                {
                    record.make_not_stack_offset();
                }
            }
            BinaryOperatorKind::And => {
                // Sometimes used for getting aligned stack pointer values.
                if left_value.is_stack_offset() && right_value.abstract_value().is_concrete() {
                    record.make_stack_offset(
                        left_value.stack_offset()
                            & right_value.abstract_value().as_concrete() as i64,
                    );
                } else if right_value.is_stack_offset()
                    && left_value.abstract_value().is_concrete()
                {
                    record.make_stack_offset(
                        right_value.stack_offset()
                            & left_value.abstract_value().as_concrete() as i64,
                    );
                } else if (left_value.abstract_value().is_nondeterministic()
                    && left_value.is_not_stack_offset())
                    || (right_value.abstract_value().is_nondeterministic()
                        && right_value.is_not_stack_offset())
                {
                    record.make_not_stack_offset();
                }
            }
            _ => {
                record.make_not_stack_offset();
            }
        }

        match kind {
            BinaryOperatorKind::Mul | BinaryOperatorKind::Shl => record.make_product(),
            _ => record.make_not_product(),
        }
    }

    /// Resolve the memory location of a term, updating the reaching definitions of the context
    /// and, for reads, the term's own definitions and value.
    fn set_memory_location(
        &mut self,
        term: TermId,
        new_location: MemoryLocation,
        context: &mut ExecutionContext,
    ) {
        let old_location = self.dataflow.memory_location(term);

        if old_location != new_location {
            self.dataflow.set_memory_location(term, new_location);

            // A write that moved may still be recorded as defining its old location.
            if old_location.is_set() && self.function.term(term).is_write() {
                context
                    .definitions_mut()
                    .filter_out(|_, definition| definition == term);
            }
        }

        if new_location.is_set() && !self.architecture.is_global_memory(&new_location) {
            if self.function.term(term).is_read() {
                let definitions = context.definitions().project(&new_location);
                *self.dataflow.definitions_mut(term) = definitions.clone();
                self.merge_reaching_values(term, &new_location, &definitions);
            }
            if self.function.term(term).is_write() {
                context.definitions_mut().add_definition(&new_location, term);
            }
            if self.function.term(term).is_kill() {
                context.definitions_mut().kill_definitions(&new_location);
            }
        } else if self.function.term(term).is_read() && old_location.is_set() {
            self.dataflow.definitions_mut(term).clear();
        }
    }

    /// Reconstruct the value of a read from the definitions reaching its bits, then join the
    /// stack-offset and product flags of the definitions covering the lowest-addressed bits.
    fn merge_reaching_values(
        &mut self,
        term: TermId,
        term_location: &MemoryLocation,
        definitions: &ReachingDefinitions,
    ) {
        assert!(
            self.function.term(term).is_read(),
            "reaching values can only be merged into a read"
        );
        if definitions.is_empty() {
            return;
        }

        let byte_order = self.architecture.byte_order();
        let mut merged = self
            .dataflow
            .value(term)
            .cloned()
            .unwrap_or_default()
            .abstract_value();

        for chunk in definitions.chunks() {
            debug_assert!(term_location.covers(chunk.location()));

            // Mask of the bits of the term's value that this chunk covers.
            let mask = bit_mask(chunk.location().size());
            let mask = match byte_order {
                Endian::Little => mask << (chunk.location().addr() - term_location.addr()),
                Endian::Big => mask << (term_location.end_addr() - chunk.location().end_addr()),
            };

            for &definition in chunk.definitions() {
                let definition_location = self.dataflow.memory_location(definition);
                debug_assert!(definition_location.covers(chunk.location()));

                let definition_value = self
                    .dataflow
                    .value(definition)
                    .cloned()
                    .unwrap_or_default()
                    .abstract_value();

                // Line the definition's value up with the term's location.
                let shift = match byte_order {
                    Endian::Little => definition_location.addr() - term_location.addr(),
                    Endian::Big => term_location.end_addr() - definition_location.end_addr(),
                };
                merged = merged.merge(definition_value.shift_bits(shift).project(mask));
            }
        }

        let term_size = self.function.term(term).size();
        self.dataflow
            .value_mut(term)
            .set_abstract_value(merged.resize(term_size));

        // Only the chunk covering the term's lowest-addressed bits contributes the flags.
        let lower_bits_chunk = match byte_order {
            Endian::Little => definitions
                .chunks()
                .first()
                .filter(|chunk| chunk.location().addr() == term_location.addr()),
            Endian::Big => definitions
                .chunks()
                .last()
                .filter(|chunk| chunk.location().end_addr() == term_location.end_addr()),
        };

        if let Some(chunk) = lower_bits_chunk {
            for &definition in chunk.definitions() {
                let definition_value = self.dataflow.value(definition).cloned().unwrap_or_default();
                let record = self.dataflow.value_mut(term);

                if definition_value.is_not_stack_offset() {
                    record.make_not_stack_offset();
                } else if definition_value.is_stack_offset() {
                    record.make_stack_offset(definition_value.stack_offset());
                }

                if definition_value.is_not_product() {
                    record.make_not_product();
                } else if definition_value.is_product() {
                    record.make_product();
                }
            }
        }
    }
}

fn apply_unary(kind: UnaryOperatorKind, size: usize, a: AbstractValue) -> AbstractValue {
    match kind {
        UnaryOperatorKind::Not => !a,
        UnaryOperatorKind::Negation => -a,
        UnaryOperatorKind::SignExtend => a.sign_extend(size),
        UnaryOperatorKind::ZeroExtend => a.zero_extend(size),
        UnaryOperatorKind::Truncate => a.resize(size),
    }
}

fn apply_binary(kind: BinaryOperatorKind, a: AbstractValue, b: AbstractValue) -> AbstractValue {
    match kind {
        BinaryOperatorKind::And => a & b,
        BinaryOperatorKind::Or => a | b,
        BinaryOperatorKind::Xor => a ^ b,
        BinaryOperatorKind::Shl => a << b,
        BinaryOperatorKind::Shr => a.unsigned_shift_right(b),
        BinaryOperatorKind::Sar => a.signed_shift_right(b),
        BinaryOperatorKind::Add => a + b,
        BinaryOperatorKind::Sub => a - b,
        BinaryOperatorKind::Mul => a * b,
        BinaryOperatorKind::SignedDiv => a.signed_div(b),
        BinaryOperatorKind::SignedRem => a.signed_rem(b),
        BinaryOperatorKind::UnsignedDiv => a.unsigned_div(b),
        BinaryOperatorKind::UnsignedRem => a.unsigned_rem(b),
        BinaryOperatorKind::Equal => a.equal_to(b),
        BinaryOperatorKind::SignedLess => a.signed_less(b),
        BinaryOperatorKind::SignedLessOrEqual => a.signed_less_or_equal(b),
        BinaryOperatorKind::UnsignedLess => a.unsigned_less(b),
        BinaryOperatorKind::UnsignedLessOrEqual => a.unsigned_less_or_equal(b),
    }
}
