use arm_state::{Condition, LocationRef};

use crate::op::Op;
use crate::variable::Variable;

/// A stable index into a `BasicBlock`'s op list. Stands in for the raw
/// prev/next pointers of an intrusive linked list: indices into a `Vec`
/// stay valid across moves and are trivially `Copy`, at the cost of one
/// `Vec<OpNode>` lookup per traversal step instead of a pointer chase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpRef(u32);

impl OpRef {
    fn new(index: usize) -> OpRef {
        OpRef(index as u32)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One slot in a basic block's op list: the operation plus its neighbors.
/// The doubly-linked structure survives passes that delete ops in place
/// (dead-store elimination unlinks a node rather than shifting the array).
#[derive(Debug, Clone)]
struct OpNode {
    op: Op,
    prev: Option<OpRef>,
    next: Option<OpRef>,
    /// Set once a pass unlinks this node; `BasicBlock::iter` skips it.
    /// Slots are never reclaimed mid-block — only the final compaction
    /// pass rebuilds the array, dropping dead slots and renumbering
    /// variables (see `compact`).
    removed: bool,
}

/// How the block ends: linked to a known successor, linked indirectly
/// through a runtime-computed address, or simply returning control to the
/// dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    DirectLink(LocationRef),
    IndirectLink,
    ReturnToDispatcher,
}

/// A translated, optimizable unit of guest code: a sequence of IR ops
/// sharing one entry location and one execution condition.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub location: LocationRef,
    pub condition: Condition,
    pub instruction_count: u32,
    pub pass_cycles: u32,
    pub fail_cycles: u32,
    pub terminator: Terminator,
    ops: Vec<OpNode>,
    head: Option<OpRef>,
    tail: Option<OpRef>,
    next_var: u32,
}

impl BasicBlock {
    pub fn new(location: LocationRef, condition: Condition) -> BasicBlock {
        BasicBlock {
            location,
            condition,
            instruction_count: 0,
            pass_cycles: 0,
            fail_cycles: 0,
            terminator: Terminator::ReturnToDispatcher,
            ops: Vec::new(),
            head: None,
            tail: None,
            next_var: 0,
        }
    }

    /// Allocates the next SSA variable index. Never reused within a block,
    /// even across optimizer passes — `compact` renumbers at the very end.
    pub fn new_variable(&mut self) -> Variable {
        let var = Variable::new(self.next_var);
        self.next_var += 1;
        var
    }

    pub fn variable_count(&self) -> u32 {
        self.next_var
    }

    /// Appends `op` to the end of the block, returning its stable ref.
    pub fn push(&mut self, op: Op) -> OpRef {
        let node_ref = OpRef::new(self.ops.len());
        self.ops.push(OpNode { op, prev: self.tail, next: None, removed: false });
        if let Some(tail) = self.tail {
            self.ops[tail.index()].next = Some(node_ref);
        } else {
            self.head = Some(node_ref);
        }
        self.tail = Some(node_ref);
        node_ref
    }

    pub fn get(&self, op_ref: OpRef) -> &Op {
        &self.ops[op_ref.index()].op
    }

    pub fn get_mut(&mut self, op_ref: OpRef) -> &mut Op {
        &mut self.ops[op_ref.index()].op
    }

    pub fn prev(&self, op_ref: OpRef) -> Option<OpRef> {
        self.ops[op_ref.index()].prev
    }

    pub fn next(&self, op_ref: OpRef) -> Option<OpRef> {
        self.ops[op_ref.index()].next
    }

    pub fn head(&self) -> Option<OpRef> {
        self.head
    }

    /// Unlinks `op_ref` from the list without shrinking the backing
    /// storage. Used by the dead-op elimination passes.
    pub fn remove(&mut self, op_ref: OpRef) {
        let (prev, next) = {
            let node = &mut self.ops[op_ref.index()];
            node.removed = true;
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.ops[prev.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.ops[next.index()].prev = prev,
            None => self.tail = prev,
        }
    }

    /// Iterates live ops in program order.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter { block: self, cursor: self.head }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Rebuilds the op list in place, dropping removed slots and
    /// renumbering every variable to a dense 0-based range in first-use
    /// order. The optimizer runs this once, after its fixed-point loop,
    /// per §4.3's "final variable renaming call" — every other pass only
    /// unlinks nodes and rewrites variable *references*, not indices.
    pub fn compact(&mut self, renumber: impl Fn(&Op) -> Op) {
        let mut live = Vec::with_capacity(self.ops.len());
        let mut cursor = self.head;
        while let Some(op_ref) = cursor {
            let node = &self.ops[op_ref.index()];
            live.push(renumber(&node.op));
            cursor = node.next;
        }
        self.ops.clear();
        self.head = None;
        self.tail = None;
        for op in live {
            self.push(op);
        }
    }
}

pub struct BlockIter<'a> {
    block: &'a BasicBlock,
    cursor: Option<OpRef>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = (OpRef, &'a Op);

    fn next(&mut self) -> Option<Self::Item> {
        let op_ref = self.cursor?;
        self.cursor = self.block.next(op_ref);
        Some((op_ref, self.block.get(op_ref)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::VarOrImm;

    fn sample_block() -> BasicBlock {
        BasicBlock::new(LocationRef::new(0, arm_state::Mode::Supervisor, false), Condition::Al)
    }

    #[test]
    fn push_and_iterate_preserves_order() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        let v1 = block.new_variable();
        block.push(Op::Constant { dst: v0, value: 1 });
        block.push(Op::Constant { dst: v1, value: 2 });
        let values: Vec<u32> = block
            .iter()
            .map(|(_, op)| match op {
                Op::Constant { value, .. } => *value,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn remove_unlinks_middle_node() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        let v1 = block.new_variable();
        let v2 = block.new_variable();
        block.push(Op::Constant { dst: v0, value: 1 });
        let mid = block.push(Op::Constant { dst: v1, value: 2 });
        block.push(Op::Constant { dst: v2, value: 3 });
        block.remove(mid);
        let values: Vec<u32> = block
            .iter()
            .map(|(_, op)| match op {
                Op::Constant { value, .. } => *value,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![1, 3]);
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn remove_head_and_tail_update_boundaries() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        let only = block.push(Op::Constant { dst: v0, value: 42 });
        block.remove(only);
        assert!(block.is_empty());
        assert_eq!(block.head(), None);
    }

    #[test]
    fn compact_drops_removed_nodes() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        let v1 = block.new_variable();
        let first = block.push(Op::Constant { dst: v0, value: 1 });
        block.push(Op::Constant { dst: v1, value: 2 });
        block.remove(first);
        block.compact(|op| op.clone());
        assert_eq!(block.len(), 1);
        assert!(matches!(block.iter().next().unwrap().1, Op::Constant { value: 2, .. }));
    }

    #[test]
    fn var_or_imm_helper_still_usable_after_compact() {
        let mut block = sample_block();
        let v0 = block.new_variable();
        block.push(Op::Mov { dst: v0, value: VarOrImm::Imm(5), set_flags: false });
        assert_eq!(block.len(), 1);
    }
}
