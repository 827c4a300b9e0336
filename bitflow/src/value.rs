//! Per-term dataflow facts: the abstract value plus the stack-offset and product flags.

use crate::abstract_value::AbstractValue;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum StackOffsetState {
    Unknown,
    Offset(i64),
    NotOffset,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ProductState {
    Unknown,
    Product,
    NotProduct,
}

/// The facts the analyzer accumulates for one term.
///
/// Both flags are three-valued and move monotonically: once a term is marked not-a-stack-offset
/// (or not-a-product), later sweeps cannot flip it back. This keeps the fixed-point iteration
/// from oscillating when a term is re-evaluated with more general operands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    abstract_value: AbstractValue,
    stack_offset: StackOffsetState,
    product: ProductState,
}

impl Default for Value {
    fn default() -> Self {
        Self::new()
    }
}

impl Value {
    pub fn new() -> Self {
        Self {
            abstract_value: AbstractValue::empty(),
            stack_offset: StackOffsetState::Unknown,
            product: ProductState::Unknown,
        }
    }

    pub fn abstract_value(&self) -> AbstractValue {
        self.abstract_value
    }

    pub fn set_abstract_value(&mut self, value: AbstractValue) {
        self.abstract_value = value;
    }

    pub fn is_stack_offset(&self) -> bool {
        matches!(self.stack_offset, StackOffsetState::Offset(_))
    }

    pub fn is_not_stack_offset(&self) -> bool {
        matches!(self.stack_offset, StackOffsetState::NotOffset)
    }

    /// The offset from the entry stack pointer, in bytes. Must only be called when
    /// [`Self::is_stack_offset`] holds.
    pub fn stack_offset(&self) -> i64 {
        match self.stack_offset {
            StackOffsetState::Offset(offset) => offset,
            state => panic!("stack_offset() called on a {:?} value", state),
        }
    }

    pub fn make_stack_offset(&mut self, offset: i64) {
        if !self.is_not_stack_offset() {
            self.stack_offset = StackOffsetState::Offset(offset);
        }
    }

    pub fn make_not_stack_offset(&mut self) {
        self.stack_offset = StackOffsetState::NotOffset;
    }

    pub fn is_product(&self) -> bool {
        matches!(self.product, ProductState::Product)
    }

    pub fn is_not_product(&self) -> bool {
        matches!(self.product, ProductState::NotProduct)
    }

    pub fn make_product(&mut self) {
        if !self.is_not_product() {
            self.product = ProductState::Product;
        }
    }

    pub fn make_not_product(&mut self) {
        self.product = ProductState::NotProduct;
    }
}
