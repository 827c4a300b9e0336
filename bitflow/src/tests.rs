use crate::analyzer::DataflowAnalyzer;
use crate::arch::{Endian, GenericArchitecture};
use crate::cancellation::CancellationToken;
use crate::dataflow::Dataflow;
use crate::ir::Function;
use crate::memory_location::{MemoryDomain, MemoryLocation};

#[cfg(test)]
use crate::cancellation::Cancelled;
#[cfg(test)]
use crate::ir::{AccessKind, BinaryOperatorKind, Instruction, IntrinsicKind, StatementKind};
#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::rc::Rc;

/// A register-file location. Bit addresses, so consecutive 32-bit registers sit 32 apart.
pub fn reg(bit_addr: i64, size: usize) -> MemoryLocation {
    MemoryLocation::new(MemoryDomain::Registers, bit_addr, size)
}

pub fn little_endian() -> GenericArchitecture {
    GenericArchitecture {
        byte_order: Endian::Little,
    }
}

/// Run the analysis over `function` on a little-endian target and return the facts.
pub fn analyze(function: &Function) -> Dataflow {
    let mut dataflow = Dataflow::new();
    let architecture = little_endian();
    DataflowAnalyzer::new(&mut dataflow, function, &architecture)
        .analyze(&CancellationToken::new())
        .expect("analysis is not cancelled");
    dataflow
}

#[test]
fn linear_assignment_chain() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    // r1 = 0x10
    let c = f.int_const(0x10, 32);
    let r1_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, r1_w, c);
    // r2 = r1 + 4
    let r1_r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let four = f.int_const(4, 32);
    let sum = f.binary(BinaryOperatorKind::Add, r1_r, four, 32);
    let r2_w = f.memory_access(reg(32, 32), 32, AccessKind::Write);
    f.assign(bb, r2_w, sum);
    // r3 = r2
    let r2_r = f.memory_access(reg(32, 32), 32, AccessKind::Read);
    let r3_w = f.memory_access(reg(64, 32), 32, AccessKind::Write);
    f.assign(bb, r3_w, r2_r);

    let dataflow = analyze(&f);

    let r3 = dataflow.value(r3_w).unwrap();
    assert!(r3.abstract_value().is_concrete());
    assert_eq!(r3.abstract_value().as_concrete(), 0x14);
    assert!(r3.is_not_stack_offset());
    assert!(r3.is_not_product());
}

#[test]
fn stack_pointer_dereference() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    // sp = zero_stack_offset()
    let zso = f.intrinsic(IntrinsicKind::ZeroStackOffset, 32);
    let sp_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, sp_w, zso);
    // frame = sp - 16
    let sp_r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let sixteen = f.int_const(16, 32);
    let frame_value = f.binary(BinaryOperatorKind::Sub, sp_r, sixteen, 32);
    let frame_w = f.memory_access(reg(32, 32), 32, AccessKind::Write);
    f.assign(bb, frame_w, frame_value);
    // *(frame + 8) = 0xAA
    let frame_r = f.memory_access(reg(32, 32), 32, AccessKind::Read);
    let eight = f.int_const(8, 32);
    let store_addr = f.binary(BinaryOperatorKind::Add, frame_r, eight, 32);
    let store = f.dereference(store_addr, MemoryDomain::Memory, 32, AccessKind::Write);
    let aa = f.int_const(0xAA, 32);
    f.assign(bb, store, aa);
    // read the slot back
    let frame_r2 = f.memory_access(reg(32, 32), 32, AccessKind::Read);
    let eight_again = f.int_const(8, 32);
    let load_addr = f.binary(BinaryOperatorKind::Add, frame_r2, eight_again, 32);
    let load = f.dereference(load_addr, MemoryDomain::Memory, 32, AccessKind::Read);
    let sink = f.memory_access(reg(64, 32), 32, AccessKind::Write);
    f.assign(bb, sink, load);

    let dataflow = analyze(&f);

    let frame = dataflow.value(frame_w).unwrap();
    assert!(frame.is_stack_offset());
    assert_eq!(frame.stack_offset(), -16);

    let slot = MemoryLocation::new(MemoryDomain::Stack, -8 * 8, 32);
    assert_eq!(dataflow.memory_location(store), slot);

    let definitions = dataflow.definitions(load).unwrap();
    assert_eq!(definitions.chunks().len(), 1);
    assert_eq!(definitions.chunks()[0].location(), &slot);
    assert_eq!(definitions.chunks()[0].definitions(), &[store]);
    assert_eq!(dataflow.value(load).unwrap().abstract_value().as_concrete(), 0xAA);
}

#[test]
fn partial_overwrite_leaves_upper_bytes_unknown() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    // Write the low byte of a 32-bit register, then read the whole register.
    let c = f.int_const(0x12, 8);
    let low_w = f.memory_access(reg(0, 8), 8, AccessKind::Write);
    f.assign(bb, low_w, c);
    let full_r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let sink = f.memory_access(reg(32, 32), 32, AccessKind::Write);
    f.assign(bb, sink, full_r);

    let dataflow = analyze(&f);

    let value = dataflow.value(full_r).unwrap().abstract_value();
    assert_eq!(value.size(), 32);
    assert!(!value.is_concrete());
    assert!(!value.is_nondeterministic());
    assert_eq!(value.known_mask() & 0xff, 0xff);
    assert_eq!(value.known_ones(), 0x12);
    assert_eq!(value.known_mask() >> 8, 0);
}

#[test]
fn loop_reaches_fixed_point_before_the_cap() {
    let mut f = Function::new();
    let entry = f.add_basic_block();
    let body = f.add_basic_block();
    let exit = f.add_basic_block();
    f.add_edge(entry, body);
    f.add_edge(body, body);
    f.add_edge(body, exit);

    // entry: x = 0
    let zero = f.int_const(0, 32);
    let x_w0 = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(entry, x_w0, zero);
    // body: x = x + 1
    let x_r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let one = f.int_const(1, 32);
    let sum = f.binary(BinaryOperatorKind::Add, x_r, one, 32);
    let x_w1 = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(body, x_w1, sum);

    // Terminates well within the sweep cap, or `analyze` would have warned and this would
    // observe whatever accumulated; either way it must return.
    let dataflow = analyze(&f);

    let value = dataflow.value(x_r).unwrap().abstract_value();
    // The increment makes the low bits unknown, but the high bits stay known zero.
    assert!(!value.is_concrete());
    assert!(!value.is_nondeterministic());
    assert_eq!(value.known_mask() & 1, 0);
    assert_ne!(value.known_zeroes() & 0x8000_0000, 0);
}

#[test]
fn choice_falls_back_when_nothing_reaches_the_preferred_term() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let preferred = f.intrinsic(IntrinsicKind::Unknown, 32);
    let fallback = f.int_const(42, 32);
    let choice = f.choice(preferred, fallback, 32);
    f.touch(bb, choice);

    let dataflow = analyze(&f);

    let value = dataflow.value(choice).unwrap();
    assert!(value.abstract_value().is_concrete());
    assert_eq!(value.abstract_value().as_concrete(), 42);
}

#[test]
fn choice_prefers_a_term_with_reaching_definitions() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let seven = f.int_const(7, 32);
    let r_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, r_w, seven);

    let preferred = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let fallback = f.int_const(42, 32);
    let choice = f.choice(preferred, fallback, 32);
    f.touch(bb, choice);

    let dataflow = analyze(&f);
    assert_eq!(dataflow.value(choice).unwrap().abstract_value().as_concrete(), 7);
}

#[test]
fn cancellation_aborts_but_keeps_accumulated_facts() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let c = f.int_const(0x10, 32);
    let r_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, r_w, c);

    // The token is cancelled by a callback executed inside the first sweep.
    let token = CancellationToken::new();
    let seen = token.clone();
    f.add_statement(
        bb,
        StatementKind::Callback {
            callback: Rc::new(move || seen.cancel()),
        },
    );

    let mut dataflow = Dataflow::new();
    let architecture = little_endian();
    let result = DataflowAnalyzer::new(&mut dataflow, &f, &architecture).analyze(&token);
    assert_eq!(result, Err(Cancelled));

    // Facts from the completed part of the sweep are still there.
    assert_eq!(dataflow.value(c).unwrap().abstract_value().as_concrete(), 0x10);
    assert_eq!(dataflow.value(r_w).unwrap().abstract_value().as_concrete(), 0x10);
}

#[test]
fn nondeterministic_address_unsets_the_location_and_clears_definitions() {
    let mut f = Function::new();
    let entry = f.add_basic_block();
    let body = f.add_basic_block();
    f.add_edge(entry, body);
    f.add_edge(body, body);

    // entry: p = 5
    let five = f.int_const(5, 32);
    let p_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(entry, p_w, five);
    // body: *(p) = 7; x = *(p); p = unknown()
    let p_r1 = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let store = f.dereference(p_r1, MemoryDomain::Physical, 32, AccessKind::Write);
    let seven = f.int_const(7, 32);
    f.assign(body, store, seven);
    let p_r2 = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let load = f.dereference(p_r2, MemoryDomain::Physical, 32, AccessKind::Read);
    let sink = f.memory_access(reg(32, 32), 32, AccessKind::Write);
    f.assign(body, sink, load);
    let unknown = f.intrinsic(IntrinsicKind::Unknown, 32);
    let p_w2 = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(body, p_w2, unknown);

    let dataflow = analyze(&f);

    // On the second sweep the pointer register merges a concrete and an unknown definition,
    // so the dereferences lose their locations and the read its definitions.
    assert_eq!(dataflow.memory_location(load), MemoryLocation::UNSET);
    assert_eq!(dataflow.memory_location(store), MemoryLocation::UNSET);
    assert!(dataflow.definitions(load).map_or(true, |d| d.is_empty()));
}

#[test]
fn and_with_a_concrete_mask_keeps_the_stack_offset() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    // sp = zero_stack_offset(); a = sp - 24; b = a & !15 (the alignment idiom)
    let zso = f.intrinsic(IntrinsicKind::ZeroStackOffset, 64);
    let sp_w = f.memory_access(reg(0, 64), 64, AccessKind::Write);
    f.assign(bb, sp_w, zso);
    let sp_r = f.memory_access(reg(0, 64), 64, AccessKind::Read);
    let twenty_four = f.int_const(24, 64);
    let a = f.binary(BinaryOperatorKind::Sub, sp_r, twenty_four, 64);
    let a_w = f.memory_access(reg(64, 64), 64, AccessKind::Write);
    f.assign(bb, a_w, a);
    let a_r = f.memory_access(reg(64, 64), 64, AccessKind::Read);
    let mask = f.int_const(!15u64, 64);
    let b = f.binary(BinaryOperatorKind::And, a_r, mask, 64);
    let b_w = f.memory_access(reg(128, 64), 64, AccessKind::Write);
    f.assign(bb, b_w, b);

    let dataflow = analyze(&f);

    let aligned = dataflow.value(b_w).unwrap();
    assert!(aligned.is_stack_offset());
    assert_eq!(aligned.stack_offset(), -32);
}

#[test]
fn global_memory_is_not_tracked() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    // *(0x100) = 7 in the memory domain, then read it back.
    let addr1 = f.int_const(0x100, 32);
    let store = f.dereference(addr1, MemoryDomain::Memory, 32, AccessKind::Write);
    let seven = f.int_const(7, 32);
    f.assign(bb, store, seven);
    let addr2 = f.int_const(0x100, 32);
    let load = f.dereference(addr2, MemoryDomain::Memory, 32, AccessKind::Read);
    let sink = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, sink, load);

    let dataflow = analyze(&f);

    // Byte addresses are expressed in bit units in the memory domain.
    let expected = MemoryLocation::new(MemoryDomain::Memory, 0x100 * 8, 32);
    assert_eq!(dataflow.memory_location(store), expected);
    assert_eq!(dataflow.memory_location(load), expected);
    // The store never becomes a reaching definition, so the load learns nothing.
    assert!(dataflow.definitions(load).map_or(true, |d| d.is_empty()));
    assert!(dataflow
        .value(load)
        .map_or(true, |v| !v.abstract_value().is_concrete()));
}

#[test]
fn reaching_snapshot_captures_the_program_point() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let seven = f.int_const(7, 32);
    let r_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, r_w, seven);
    let snapshot = f.intrinsic(IntrinsicKind::ReachingSnapshot, 32);
    f.touch(bb, snapshot);

    let dataflow = analyze(&f);

    let definitions = dataflow.definitions(snapshot).unwrap();
    assert_eq!(definitions.chunks().len(), 1);
    assert_eq!(definitions.chunks()[0].location(), &reg(0, 32));
    assert_eq!(definitions.chunks()[0].definitions(), &[r_w]);
}

#[test]
fn kill_erases_reaching_definitions() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let seven = f.int_const(7, 32);
    let r_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, r_w, seven);
    let clobber = f.memory_access(reg(0, 32), 32, AccessKind::Kill);
    f.touch(bb, clobber);
    let r_r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let sink = f.memory_access(reg(32, 32), 32, AccessKind::Write);
    f.assign(bb, sink, r_r);

    let dataflow = analyze(&f);

    assert!(dataflow.definitions(r_r).map_or(true, |d| d.is_empty()));
    assert!(dataflow
        .value(r_r)
        .map_or(true, |v| !v.abstract_value().is_concrete()));
}

#[test]
fn inline_assembly_keeps_reaching_definitions() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let seven = f.int_const(7, 32);
    let r_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, r_w, seven);
    f.add_statement(bb, StatementKind::InlineAssembly);
    let r_r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let sink = f.memory_access(reg(32, 32), 32, AccessKind::Write);
    f.assign(bb, sink, r_r);

    let dataflow = analyze(&f);

    // The known soundness gap: effects of inline assembly are opaque, but clearing the
    // definitions usually produces worse downstream code.
    assert_eq!(dataflow.value(r_r).unwrap().abstract_value().as_concrete(), 7);
}

#[test]
fn jumps_and_calls_execute_their_address_expressions() {
    let mut f = Function::new();
    let entry = f.add_basic_block();
    let exit = f.add_basic_block();
    f.add_edge(entry, exit);

    let five = f.int_const(5, 32);
    let r_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(entry, r_w, five);

    let r_r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    let five_again = f.int_const(5, 32);
    let cond = f.binary(BinaryOperatorKind::Equal, r_r, five_again, 1);
    let then_address = f.int_const(0x40, 32);
    f.add_statement(
        entry,
        StatementKind::Jump {
            condition: Some(cond),
            then_address: Some(then_address),
            else_address: None,
        },
    );

    let call_target = f.int_const(0x80, 32);
    f.add_statement(exit, StatementKind::Call { target: call_target });
    f.add_statement(exit, StatementKind::Return);

    let dataflow = analyze(&f);

    assert_eq!(dataflow.value(cond).unwrap().abstract_value().as_concrete(), 1);
    assert_eq!(
        dataflow.value(then_address).unwrap().abstract_value().as_concrete(),
        0x40
    );
    assert_eq!(
        dataflow.value(call_target).unwrap().abstract_value().as_concrete(),
        0x80
    );
}

#[test]
fn instruction_address_intrinsics_use_the_owning_instruction() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let here = f.intrinsic(IntrinsicKind::InstructionAddress, 64);
    f.add_statement_for_instruction(
        bb,
        StatementKind::Touch { term: here },
        Some(Instruction { addr: 0x400, size: 4 }),
    );
    let next = f.intrinsic(IntrinsicKind::NextInstructionAddress, 64);
    f.add_statement_for_instruction(
        bb,
        StatementKind::Touch { term: next },
        Some(Instruction { addr: 0x400, size: 4 }),
    );

    let dataflow = analyze(&f);

    assert_eq!(dataflow.value(here).unwrap().abstract_value().as_concrete(), 0x400);
    assert_eq!(dataflow.value(next).unwrap().abstract_value().as_concrete(), 0x404);
}

#[test]
fn custom_intrinsics_warn_and_leave_no_facts() {
    let _guard = slog_scope::set_global_logger(crate::log::terminal_logger(0));

    let mut f = Function::new();
    let bb = f.add_basic_block();
    let custom = f.intrinsic(IntrinsicKind::Custom(7), 32);
    f.touch(bb, custom);

    let dataflow = analyze(&f);
    assert!(dataflow.value(custom).is_none());
}

#[test]
fn callbacks_run_once_per_sweep() {
    let mut f = Function::new();
    let bb = f.add_basic_block();
    let count = Rc::new(Cell::new(0usize));
    let seen = count.clone();
    f.add_statement(
        bb,
        StatementKind::Callback {
            callback: Rc::new(move || seen.set(seen.get() + 1)),
        },
    );

    analyze(&f);

    // One execution per sweep; the empty function needs the stability threshold's worth.
    assert!(count.get() >= 3);
}

#[test]
fn facts_of_detached_statements_are_purged() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let five = f.int_const(5, 32);
    let a_w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, a_w, five);
    let seven = f.int_const(7, 32);
    let b_w = f.memory_access(reg(32, 32), 32, AccessKind::Write);
    let doomed = f.assign(bb, b_w, seven);

    let mut dataflow = Dataflow::new();
    let architecture = little_endian();
    DataflowAnalyzer::new(&mut dataflow, &f, &architecture)
        .analyze(&CancellationToken::new())
        .unwrap();
    assert!(dataflow.value(b_w).is_some());

    f.detach_statement(doomed);
    DataflowAnalyzer::new(&mut dataflow, &f, &architecture)
        .analyze(&CancellationToken::new())
        .unwrap();

    assert!(dataflow.value(b_w).is_none());
    assert!(dataflow.value(seven).is_none());
    assert!(dataflow.definitions(b_w).is_none());
    assert!(dataflow.value(a_w).is_some());
}

#[test]
fn stale_definitions_are_filtered_when_a_write_shrinks() {
    let mut f = Function::new();
    let bb = f.add_basic_block();

    let five = f.int_const(5, 32);
    let w = f.memory_access(reg(0, 32), 32, AccessKind::Write);
    f.assign(bb, w, five);
    let r = f.memory_access(reg(0, 32), 32, AccessKind::Read);
    f.touch(bb, r);

    let mut dataflow = Dataflow::new();
    let architecture = little_endian();
    DataflowAnalyzer::new(&mut dataflow, &f, &architecture)
        .analyze(&CancellationToken::new())
        .unwrap();
    assert_eq!(dataflow.definitions(r).unwrap().chunks().len(), 1);

    // Simulate the write's location shrinking below the recorded chunk; the between-sweep
    // filter drops the pair that is no longer covered.
    dataflow.set_memory_location(w, reg(0, 16));
    dataflow.filter_uncovered_definitions();
    assert!(dataflow.definitions(r).unwrap().is_empty());
}
