//! The intermediate representation the analyzer consumes.
//!
//! Terms, statements and basic blocks live in arenas owned by a [`Function`] and are referred
//! to by index. Index-based identities stay stable while the IR is edited, which is what the
//! dataflow store keys its facts on; a term whose statement has been detached from its basic
//! block is considered to have disappeared, and the analyzer purges its facts after the fixed
//! point is reached.

use std::rc::Rc;

use crate::memory_location::{MemoryDomain, MemoryLocation};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId(pub usize);

impl std::fmt::Debug for TermId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub usize);

impl std::fmt::Debug for StatementId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BasicBlockId(pub usize);

impl std::fmt::Debug for BasicBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// The built-in intrinsic terms the analyzer understands. Architectures may install further
/// intrinsics under [`IntrinsicKind::Custom`]; the analyzer warns and leaves their facts alone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IntrinsicKind {
    /// A value the analysis cannot know anything about.
    Unknown,
    /// A value left undefined by the architecture.
    Undefined,
    /// The stack pointer as it was at function entry.
    ZeroStackOffset,
    /// Exposes the full set of definitions reaching this program point to downstream passes.
    ReachingSnapshot,
    /// The address of the instruction owning this term.
    InstructionAddress,
    /// The address of the instruction following the one owning this term.
    NextInstructionAddress,
    /// An architecture-specific intrinsic opaque to the dataflow analysis.
    Custom(u32),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnaryOperatorKind {
    Not,
    Negation,
    SignExtend,
    ZeroExtend,
    Truncate,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinaryOperatorKind {
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Add,
    Sub,
    Mul,
    SignedDiv,
    SignedRem,
    UnsignedDiv,
    UnsignedRem,
    Equal,
    SignedLess,
    SignedLessOrEqual,
    UnsignedLess,
    UnsignedLessOrEqual,
}

/// How a term touches the memory it denotes. Only meaningful on memory-location accesses and
/// dereferences; all other terms merely produce values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessKind {
    Read,
    Write,
    Kill,
}

#[derive(Clone, Debug)]
pub enum TermKind {
    /// A compile-time constant.
    Constant { value: u64 },
    Intrinsic {
        kind: IntrinsicKind,
    },
    /// An access to a statically known memory location (a register, a named stack slot).
    MemoryLocationAccess { location: MemoryLocation },
    /// An access through a computed address.
    Dereference {
        address: TermId,
        domain: MemoryDomain,
    },
    UnaryOperator {
        kind: UnaryOperatorKind,
        operand: TermId,
    },
    BinaryOperator {
        kind: BinaryOperatorKind,
        left: TermId,
        right: TermId,
    },
    /// Use `preferred` if any definition reaches it, `default` otherwise. Architectures use
    /// this for "take the register if it is live, else fall back" hints.
    Choice {
        preferred: TermId,
        default: TermId,
    },
}

pub struct Term {
    kind: TermKind,
    size: usize,
    access: AccessKind,
    statement: Option<StatementId>,
}

impl Term {
    pub fn kind(&self) -> &TermKind {
        &self.kind
    }

    /// Size of the term's value in bits.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_read(&self) -> bool {
        self.access == AccessKind::Read
    }

    pub fn is_write(&self) -> bool {
        self.access == AccessKind::Write
    }

    pub fn is_kill(&self) -> bool {
        self.access == AccessKind::Kill
    }

    /// The statement owning this term, once it has been attached to one.
    pub fn statement(&self) -> Option<StatementId> {
        self.statement
    }
}

impl std::fmt::Debug for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} (sz={}, {:?})", self.kind, self.size, self.access)
    }
}

/// The machine instruction a statement was lifted from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Instruction {
    pub addr: u64,
    /// Encoded length of the instruction in bytes.
    pub size: u64,
}

pub enum StatementKind {
    /// Assembly the lifter could not translate. Effects are opaque.
    InlineAssembly,
    /// `left := right`. The right side is evaluated first.
    Assignment { left: TermId, right: TermId },
    Jump {
        condition: Option<TermId>,
        then_address: Option<TermId>,
        else_address: Option<TermId>,
    },
    Call { target: TermId },
    Return,
    /// Evaluate a term for its dataflow effects only.
    Touch { term: TermId },
    /// A hook for external collaborators to run side effects during the analysis pass.
    Callback { callback: Rc<dyn Fn()> },
}

impl std::fmt::Debug for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StatementKind::InlineAssembly => write!(f, "InlineAssembly"),
            StatementKind::Assignment { left, right } => {
                write!(f, "Assignment {{ {:?} := {:?} }}", left, right)
            }
            StatementKind::Jump {
                condition,
                then_address,
                else_address,
            } => write!(
                f,
                "Jump {{ cond: {:?}, then: {:?}, else: {:?} }}",
                condition, then_address, else_address
            ),
            StatementKind::Call { target } => write!(f, "Call {{ {:?} }}", target),
            StatementKind::Return => write!(f, "Return"),
            StatementKind::Touch { term } => write!(f, "Touch {{ {:?} }}", term),
            StatementKind::Callback { .. } => write!(f, "Callback {{ .. }}"),
        }
    }
}

#[derive(Debug)]
pub struct Statement {
    kind: StatementKind,
    basic_block: Option<BasicBlockId>,
    instruction: Option<Instruction>,
}

impl Statement {
    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    /// The basic block the statement currently belongs to; `None` once detached.
    pub fn basic_block(&self) -> Option<BasicBlockId> {
        self.basic_block
    }

    pub fn instruction(&self) -> Option<Instruction> {
        self.instruction
    }
}

#[derive(Debug, Default)]
pub struct BasicBlock {
    statements: Vec<StatementId>,
    successors: Vec<BasicBlockId>,
}

impl BasicBlock {
    pub fn statements(&self) -> &[StatementId] {
        &self.statements
    }

    /// Terminator edges to the blocks control may continue at.
    pub fn successors(&self) -> &[BasicBlockId] {
        &self.successors
    }
}

/// A function under analysis: the arenas of terms and statements plus the basic blocks
/// stitching them together.
#[derive(Debug, Default)]
pub struct Function {
    terms: Vec<Term>,
    statements: Vec<Statement>,
    basic_blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn term(&self, id: TermId) -> &Term {
        &self.terms[id.0]
    }

    pub fn statement(&self, id: StatementId) -> &Statement {
        &self.statements[id.0]
    }

    pub fn basic_block(&self, id: BasicBlockId) -> &BasicBlock {
        &self.basic_blocks[id.0]
    }

    pub fn basic_block_count(&self) -> usize {
        self.basic_blocks.len()
    }

    /// Blocks in the stable order the analyzer sweeps them in.
    pub fn basic_block_ids(&self) -> impl Iterator<Item = BasicBlockId> {
        (0..self.basic_blocks.len()).map(BasicBlockId)
    }

    pub fn add_basic_block(&mut self) -> BasicBlockId {
        self.basic_blocks.push(BasicBlock::default());
        BasicBlockId(self.basic_blocks.len() - 1)
    }

    pub fn add_edge(&mut self, from: BasicBlockId, to: BasicBlockId) {
        self.basic_blocks[from.0].successors.push(to);
    }

    fn add_term(&mut self, kind: TermKind, size: usize, access: AccessKind) -> TermId {
        self.terms.push(Term {
            kind,
            size,
            access,
            statement: None,
        });
        TermId(self.terms.len() - 1)
    }

    pub fn int_const(&mut self, value: u64, size: usize) -> TermId {
        self.add_term(TermKind::Constant { value }, size, AccessKind::Read)
    }

    pub fn intrinsic(&mut self, kind: IntrinsicKind, size: usize) -> TermId {
        self.add_term(TermKind::Intrinsic { kind }, size, AccessKind::Read)
    }

    pub fn memory_access(
        &mut self,
        location: MemoryLocation,
        size: usize,
        access: AccessKind,
    ) -> TermId {
        assert!(location.is_set(), "a memory access needs a location");
        self.add_term(TermKind::MemoryLocationAccess { location }, size, access)
    }

    pub fn dereference(
        &mut self,
        address: TermId,
        domain: MemoryDomain,
        size: usize,
        access: AccessKind,
    ) -> TermId {
        self.add_term(TermKind::Dereference { address, domain }, size, access)
    }

    pub fn unary(&mut self, kind: UnaryOperatorKind, operand: TermId, size: usize) -> TermId {
        self.add_term(
            TermKind::UnaryOperator { kind, operand },
            size,
            AccessKind::Read,
        )
    }

    pub fn binary(
        &mut self,
        kind: BinaryOperatorKind,
        left: TermId,
        right: TermId,
        size: usize,
    ) -> TermId {
        self.add_term(
            TermKind::BinaryOperator { kind, left, right },
            size,
            AccessKind::Read,
        )
    }

    pub fn choice(&mut self, preferred: TermId, default: TermId, size: usize) -> TermId {
        self.add_term(
            TermKind::Choice { preferred, default },
            size,
            AccessKind::Read,
        )
    }

    /// Append a statement to `block`, claiming ownership of its term tree.
    pub fn add_statement(&mut self, block: BasicBlockId, kind: StatementKind) -> StatementId {
        self.add_statement_for_instruction(block, kind, None)
    }

    /// As [`Self::add_statement`], recording the machine instruction the statement was lifted
    /// from.
    pub fn add_statement_for_instruction(
        &mut self,
        block: BasicBlockId,
        kind: StatementKind,
        instruction: Option<Instruction>,
    ) -> StatementId {
        let id = StatementId(self.statements.len());
        let roots = statement_roots(&kind);
        self.statements.push(Statement {
            kind,
            basic_block: Some(block),
            instruction,
        });
        self.basic_blocks[block.0].statements.push(id);
        for root in roots {
            self.claim_term(id, root);
        }
        id
    }

    /// `block: left := right`.
    pub fn assign(&mut self, block: BasicBlockId, left: TermId, right: TermId) -> StatementId {
        self.add_statement(block, StatementKind::Assignment { left, right })
    }

    /// `block: touch term`.
    pub fn touch(&mut self, block: BasicBlockId, term: TermId) -> StatementId {
        self.add_statement(block, StatementKind::Touch { term })
    }

    /// Remove a statement from its basic block. Its terms stay in the arena but are considered
    /// disappeared; the analyzer purges their facts after the fixed point.
    pub fn detach_statement(&mut self, statement: StatementId) {
        if let Some(block) = self.statements[statement.0].basic_block.take() {
            self.basic_blocks[block.0]
                .statements
                .retain(|&s| s != statement);
        }
    }

    fn claim_term(&mut self, statement: StatementId, term: TermId) {
        let claimed = &mut self.terms[term.0].statement;
        assert!(
            claimed.is_none() || *claimed == Some(statement),
            "{:?} is already owned by {:?}",
            term,
            claimed.unwrap()
        );
        *claimed = Some(statement);
        for child in term_children(&self.terms[term.0].kind) {
            self.claim_term(statement, child);
        }
    }
}

fn statement_roots(kind: &StatementKind) -> Vec<TermId> {
    match kind {
        StatementKind::InlineAssembly
        | StatementKind::Return
        | StatementKind::Callback { .. } => vec![],
        StatementKind::Assignment { left, right } => vec![*left, *right],
        StatementKind::Jump {
            condition,
            then_address,
            else_address,
        } => [*condition, *then_address, *else_address]
            .into_iter()
            .flatten()
            .collect(),
        StatementKind::Call { target } => vec![*target],
        StatementKind::Touch { term } => vec![*term],
    }
}

fn term_children(kind: &TermKind) -> Vec<TermId> {
    match kind {
        TermKind::Constant { .. }
        | TermKind::Intrinsic { .. }
        | TermKind::MemoryLocationAccess { .. } => vec![],
        TermKind::Dereference { address, .. } => vec![*address],
        TermKind::UnaryOperator { operand, .. } => vec![*operand],
        TermKind::BinaryOperator { left, right, .. } => vec![*left, *right],
        TermKind::Choice { preferred, default } => vec![*preferred, *default],
    }
}
