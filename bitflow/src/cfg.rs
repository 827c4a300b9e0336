//! Predecessor and successor queries over a function's basic blocks.

use crate::ir::{BasicBlockId, Function};

/// The control flow graph the abstract interpretation loop runs on. Built once per analysis
/// from the terminator edges stored on the basic blocks.
#[derive(Debug)]
pub struct Cfg {
    predecessors: Vec<Vec<BasicBlockId>>,
    successors: Vec<Vec<BasicBlockId>>,
}

impl Cfg {
    pub fn new(function: &Function) -> Self {
        let mut predecessors = vec![Vec::new(); function.basic_block_count()];
        let mut successors = vec![Vec::new(); function.basic_block_count()];
        for block in function.basic_block_ids() {
            for &successor in function.basic_block(block).successors() {
                successors[block.0].push(successor);
                predecessors[successor.0].push(block);
            }
        }
        Self {
            predecessors,
            successors,
        }
    }

    pub fn predecessors(&self, block: BasicBlockId) -> &[BasicBlockId] {
        &self.predecessors[block.0]
    }

    pub fn successors(&self, block: BasicBlockId) -> &[BasicBlockId] {
        &self.successors[block.0]
    }
}
