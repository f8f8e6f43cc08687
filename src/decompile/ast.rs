//! Syntax-node pool: replays structurized chains into an AST without
//! executing anything.
//!
//! Replay mirrors the interpreter's stack discipline: each instruction
//! pops the node ids its opcode would pop and pushes a node for the value
//! it would push. Whatever is never consumed stays in the list and prints
//! as a statement. Branches never reach the replay as plain instructions;
//! they are consumed by the enclosing structure or rendered as markers.

use std::collections::{HashMap, HashSet};

use crate::base::{InstructionStream, Opcode, RawInstruction, RawValue, StackArity};
use crate::decompile::chain::{self, Chain, ChainForest, ChainId, Span};
use crate::decompile::emit;
use crate::decompile::graph::InstructionGraph;
use crate::decompile::{Diagnostic, FunctionSource};
use crate::runtime::{ops, Value};

pub type NameSet = HashSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(pub usize);

#[derive(Debug)]
pub enum SyntaxNode {
    Literal(RawValue),
    Ident(String),
    /// Register read with no display name bound yet.
    Register(u32),
    /// Generic opcode application; args are in source order.
    Op { opcode: Opcode, args: Vec<NodeId> },
    Array(Vec<NodeId>),
    ObjectInit(Vec<(NodeId, NodeId)>),
    Call { callee: NodeId, args: Vec<NodeId>, constructed: bool },
    MethodCall { receiver: NodeId, name: NodeId, args: Vec<NodeId>, constructed: bool },
    Enumerate(NodeId),
    Function { name: String, parameters: Vec<String>, body: Box<NodePool> },
    VarDecl { name: String, value: NodeId, register: u32 },
    If { opcode: Opcode, condition: NodeId, taken: Vec<NodeId>, fallthrough: Vec<NodeId> },
    While {
        opcode: Option<Opcode>,
        condition: Option<NodeId>,
        post_test: bool,
        /// Statements the condition computation runs each iteration.
        prelude: Vec<NodeId>,
        body: Vec<NodeId>,
    },
    Break,
    Continue,
    MarkerJump { label: String },
    MarkerCondJump { label: String, condition: NodeId, jump_if_true: bool },
}

/// Replay context carried down through the chain structure.
#[derive(Debug, Clone, Default)]
pub struct ReplayCtx {
    loop_head: Option<usize>,
    loop_exit: Option<usize>,
    /// Jump targets consumed by the enclosing structure.
    silent: Vec<usize>,
    /// The final conditional branch is the enclosing structure's test.
    consume_condition: bool,
}

#[derive(Debug)]
pub struct NodePool {
    pub nodes: Vec<SyntaxNode>,
    /// Creation-ordered node ids not yet consumed as operands; after
    /// replay these are the statements.
    pub list: Vec<NodeId>,
    stack: Vec<NodeId>,
    floors: Vec<usize>,
    global_pool: Vec<RawValue>,
    constants: Vec<RawValue>,
    reg_names: HashMap<u32, String>,
    used_names: NameSet,
    fold_failures: HashMap<Opcode, u32>,
    functions: HashMap<usize, FunctionSource>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Opcodes that keep defeating the constant folder are skipped after this
/// many misses.
const FOLD_CUTOFF: u32 = 4;

pub fn build(
    stream: &InstructionStream,
    global_pool: &[RawValue],
    inherited: &NameSet,
    diagnostics: &mut Vec<Diagnostic>,
) -> NodePool {
    build_inner(stream, global_pool, global_pool, inherited, &[], diagnostics)
}

fn build_inner(
    stream: &InstructionStream,
    global_pool: &[RawValue],
    selected: &[RawValue],
    inherited: &NameSet,
    register_params: &[(u8, String)],
    diagnostics: &mut Vec<Diagnostic>,
) -> NodePool {
    let (outer, functions) = super::extract_functions(stream, diagnostics);
    let graph = InstructionGraph::build(&outer).optimize();
    let (forest, root) = chain::structurize(&graph, diagnostics);

    let mut used_names = inherited.clone();
    let mut reg_names = HashMap::new();
    for (register, name) in register_params {
        used_names.insert(name.clone());
        reg_names.insert(*register as u32, name.clone());
    }

    let mut pool = NodePool {
        nodes: Vec::new(),
        list: Vec::new(),
        stack: Vec::new(),
        floors: Vec::new(),
        global_pool: global_pool.to_vec(),
        constants: selected.to_vec(),
        reg_names,
        used_names,
        fold_failures: HashMap::new(),
        functions,
        diagnostics: Vec::new(),
    };
    pool.push_chain(&graph, &forest, root, &ReplayCtx::default());
    diagnostics.append(&mut pool.diagnostics);
    pool
}

impl NodePool {
    pub fn node(&self, id: NodeId) -> &SyntaxNode {
        &self.nodes[id.0]
    }

    fn alloc(&mut self, node: SyntaxNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn push_value(&mut self, node: SyntaxNode) -> NodeId {
        let id = self.alloc(node);
        self.stack.push(id);
        self.list.push(id);
        id
    }

    fn append_statement(&mut self, node: SyntaxNode) {
        let id = self.alloc(node);
        self.list.push(id);
    }

    fn stack_floor(&self) -> usize {
        self.floors.last().copied().unwrap_or(0)
    }

    fn pop_expr(&mut self) -> NodeId {
        if self.stack.len() > self.stack_floor() {
            let id = self.stack.pop().unwrap_or_else(|| unreachable!());
            if let Some(at) = self.list.iter().rposition(|n| *n == id) {
                self.list.remove(at);
            }
            id
        } else {
            self.diagnostics
                .push(Diagnostic::general("operand missing during stack replay"));
            self.alloc(SyntaxNode::Ident("__missing__".into()))
        }
    }

    fn pop_count(&mut self, position: usize) -> usize {
        let count = self.pop_expr();
        match self.literal_value(count) {
            Some(v) => v.to_integer().max(0) as usize,
            None => {
                self.diagnostics
                    .push(Diagnostic::at(position, "non-constant element count"));
                0
            }
        }
    }

    fn enter_frame(&mut self) -> (usize, usize) {
        self.floors.push(self.stack.len());
        (self.list.len(), self.stack.len())
    }

    fn exit_frame(&mut self, mark: (usize, usize)) -> Vec<NodeId> {
        self.floors.pop();
        self.stack.truncate(mark.1);
        self.list.split_off(mark.0.min(self.list.len()))
    }

    // ── Chain replay ──

    fn push_chain(
        &mut self,
        graph: &InstructionGraph,
        forest: &ChainForest,
        id: ChainId,
        ctx: &ReplayCtx,
    ) {
        match forest.get(id) {
            Chain::Sequence(children) => {
                for child in children.clone() {
                    self.push_chain(graph, forest, child, ctx);
                }
            }
            Chain::Raw(span) => {
                let span = *span;
                let mut inner = ctx.clone();
                inner.consume_condition = false;
                self.replay_span(graph, span, &inner);
            }
            Chain::Case { condition, opcode, taken, fallthrough, reconvergence } => {
                let (condition, opcode, taken, fallthrough, reconvergence) =
                    (*condition, *opcode, *taken, *fallthrough, *reconvergence);
                let mut cond_ctx = ctx.clone();
                cond_ctx.consume_condition = true;
                self.replay_span(graph, condition, &cond_ctx);
                let test = self.pop_expr();

                let mut arm_ctx = ctx.clone();
                arm_ctx.consume_condition = false;
                if let Some(r) = reconvergence {
                    arm_ctx.silent.push(r);
                }
                let mark = self.enter_frame();
                self.push_chain(graph, forest, fallthrough, &arm_ctx);
                let fallthrough_nodes = self.exit_frame(mark);
                let mark = self.enter_frame();
                self.push_chain(graph, forest, taken, &arm_ctx);
                let taken_nodes = self.exit_frame(mark);

                self.append_statement(SyntaxNode::If {
                    opcode,
                    condition: test,
                    taken: taken_nodes,
                    fallthrough: fallthrough_nodes,
                });
            }
            Chain::Loop { condition, opcode, post_test, head, exit, body } => {
                let (condition, opcode, post_test, head, exit, body) =
                    (*condition, *opcode, *post_test, *head, *exit, *body);
                let loop_ctx = ReplayCtx {
                    loop_head: Some(head),
                    loop_exit: exit,
                    silent: Vec::new(),
                    consume_condition: false,
                };

                let mark = self.enter_frame();
                if !condition.is_empty() {
                    let mut cond_ctx = loop_ctx.clone();
                    cond_ctx.consume_condition = true;
                    self.replay_span(graph, condition, &cond_ctx);
                }
                let test = (!condition.is_empty()).then(|| self.pop_expr());
                let prelude = self.exit_frame(mark);

                let mark = self.enter_frame();
                self.push_chain(graph, forest, body, &loop_ctx);
                let body_nodes = self.exit_frame(mark);

                self.append_statement(SyntaxNode::While {
                    opcode,
                    condition: test,
                    post_test,
                    prelude,
                    body: body_nodes,
                });
            }
        }
    }

    fn replay_span(&mut self, graph: &InstructionGraph, span: Span, ctx: &ReplayCtx) {
        if span.is_empty() {
            return;
        }
        for index in span.first..=span.last.min(graph.blocks.len().saturating_sub(1)) {
            let block = graph.blocks[index].clone();
            for (position, instruction) in &block.items {
                self.push_instruction(*position, instruction);
            }
            let Some((branch_pos, branch)) = &block.branch else { continue };
            let is_last = index == span.last;
            if branch.opcode.is_conditional_branch() {
                if is_last && ctx.consume_condition {
                    continue;
                }
                let condition = self.pop_expr();
                let label = jump_label(branch);
                self.diagnostics.push(Diagnostic::at(
                    *branch_pos,
                    "conditional branch left unstructured",
                ));
                self.append_statement(SyntaxNode::MarkerCondJump {
                    label,
                    condition,
                    jump_if_true: branch.opcode == Opcode::BranchIfTrue,
                });
                continue;
            }
            // BranchAlways
            let Some(target) = branch.branch_target() else {
                self.diagnostics
                    .push(Diagnostic::at(*branch_pos, "branch without a target operand"));
                continue;
            };
            if ctx.silent.contains(&target) {
                continue;
            }
            if ctx.loop_head == Some(target) {
                if !is_last {
                    self.append_statement(SyntaxNode::Continue);
                }
                continue;
            }
            if ctx.loop_exit == Some(target) {
                self.append_statement(SyntaxNode::Break);
                continue;
            }
            let in_span_forward = graph
                .block_at(target)
                .is_some_and(|t| t > index && t <= span.last);
            if in_span_forward {
                self.diagnostics.push(Diagnostic::at(
                    *branch_pos,
                    "constant branch treated as fall-through",
                ));
            } else {
                self.diagnostics
                    .push(Diagnostic::at(*branch_pos, "jump left unstructured"));
                self.append_statement(SyntaxNode::MarkerJump { label: jump_label(branch) });
            }
        }
    }

    // ── Instruction replay ──

    fn push_instruction(&mut self, position: usize, instruction: &RawInstruction) {
        use Opcode::*;
        let op = instruction.opcode;
        match op {
            End => {}
            ConstantPool => self.select_constants(position, instruction),
            Push => {
                for raw in instruction.params.clone() {
                    let node = self.resolve_raw(position, &raw);
                    self.push_value(node);
                }
            }
            EaPushThis => {
                self.push_value(SyntaxNode::Ident("this".into()));
            }
            EaPushGlobal => {
                self.push_value(SyntaxNode::Ident("_global".into()));
            }
            EaPushUndefined => {
                self.push_value(SyntaxNode::Ident("undefined".into()));
            }
            EaPushNull => {
                self.push_value(SyntaxNode::Ident("null".into()));
            }
            EaPushZero => {
                self.push_value(SyntaxNode::Literal(RawValue::Integer(0)));
            }
            EaPushOne => {
                self.push_value(SyntaxNode::Literal(RawValue::Integer(1)));
            }
            EaPushTrue => {
                self.push_value(SyntaxNode::Literal(RawValue::Boolean(true)));
            }
            EaPushFalse => {
                self.push_value(SyntaxNode::Literal(RawValue::Boolean(false)));
            }
            PushDuplicate => {
                if let Some(&top) = self.stack.last() {
                    self.stack.push(top);
                    self.list.push(top);
                } else {
                    self.diagnostics
                        .push(Diagnostic::at(position, "duplicate of an empty stack"));
                    let id = self.alloc(SyntaxNode::Ident("__missing__".into()));
                    self.stack.push(id);
                    self.list.push(id);
                }
            }
            StackSwap => {
                let len = self.stack.len();
                if len >= 2 && len - 2 >= self.stack_floor() {
                    self.stack.swap(len - 1, len - 2);
                } else {
                    self.diagnostics
                        .push(Diagnostic::at(position, "swap on a short stack"));
                }
            }
            Pop => {
                let value = self.pop_expr();
                self.append_statement(SyntaxNode::Op { opcode: Pop, args: vec![value] });
            }
            SetRegister => self.replay_set_register(position, instruction),
            Enumerate | Enumerate2 => {
                let subject = self.pop_expr();
                self.push_value(SyntaxNode::Enumerate(subject));
            }
            InitArray => {
                let count = self.pop_count(position);
                let elements: Vec<NodeId> = (0..count).map(|_| self.pop_expr()).collect();
                self.push_value(SyntaxNode::Array(elements));
            }
            InitObject => {
                let count = self.pop_count(position);
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let value = self.pop_expr();
                    let name = self.pop_expr();
                    pairs.push((name, value));
                }
                pairs.reverse();
                self.push_value(SyntaxNode::ObjectInit(pairs));
            }
            CallFunction | NewObject => {
                let callee = self.pop_expr();
                let count = self.pop_count(position);
                let args = (0..count).map(|_| self.pop_expr()).collect();
                self.push_value(SyntaxNode::Call {
                    callee,
                    args,
                    constructed: op == NewObject,
                });
            }
            CallMethod | NewMethod => {
                let name = self.pop_expr();
                let receiver = self.pop_expr();
                let count = self.pop_count(position);
                let args = (0..count).map(|_| self.pop_expr()).collect();
                self.push_value(SyntaxNode::MethodCall {
                    receiver,
                    name,
                    args,
                    constructed: op == NewMethod,
                });
            }
            DefineFunction | DefineFunction2 => self.replay_define_function(position),
            BranchAlways | BranchIfTrue | EaBranchIfFalse => {
                // branches live on block edges, not in block bodies
                self.diagnostics
                    .push(Diagnostic::at(position, "stray branch in straight-line code"));
            }
            _ => self.replay_generic(position, op),
        }
    }

    /// Fixed-arity opcodes: pop, optionally fold, push or emit.
    fn replay_generic(&mut self, position: usize, op: Opcode) {
        let StackArity::Fixed(count) = op.stack_arity() else {
            self.diagnostics
                .push(Diagnostic::at(position, format!("no replay rule for {op}")));
            return;
        };
        let mut args: Vec<NodeId> = (0..count).map(|_| self.pop_expr()).collect();
        args.reverse();
        if op.pushes_result() {
            if let Some(folded) = self.try_fold(op, &args) {
                self.push_value(SyntaxNode::Literal(folded));
            } else {
                self.push_value(SyntaxNode::Op { opcode: op, args });
            }
        } else {
            self.append_statement(SyntaxNode::Op { opcode: op, args });
        }
    }

    fn try_fold(&mut self, op: Opcode, args: &[NodeId]) -> Option<RawValue> {
        if self.fold_failures.get(&op).copied().unwrap_or(0) > FOLD_CUTOFF {
            return None;
        }
        let values: Option<Vec<Value>> =
            args.iter().map(|&a| self.literal_value(a)).collect();
        let folded = values
            .and_then(|v| ops::eval_static(op, &v))
            .and_then(|v| raw_from_value(&v));
        if folded.is_none() {
            *self.fold_failures.entry(op).or_insert(0) += 1;
        }
        folded
    }

    fn literal_value(&self, id: NodeId) -> Option<Value> {
        match self.node(id) {
            SyntaxNode::Literal(raw) => Value::from_raw_literal(raw),
            _ => None,
        }
    }

    fn replay_set_register(&mut self, position: usize, instruction: &RawInstruction) {
        let register = match instruction.params.first() {
            Some(RawValue::Register(r)) => *r,
            Some(raw) if raw.as_index() >= 0 => raw.as_index() as u32,
            _ => {
                self.diagnostics
                    .push(Diagnostic::at(position, "register operand expected"));
                return;
            }
        };
        let value = self.pop_expr();
        let hint = emit::expression_text(self, value);
        let name = self.unique_name(&emit::justify_name(&hint), register);
        self.reg_names.insert(register, name.clone());
        self.append_statement(SyntaxNode::VarDecl { name: name.clone(), value, register });
        // later reads of the register go through the bound name
        self.push_value(SyntaxNode::Ident(name));
    }

    fn unique_name(&mut self, hint: &str, register: u32) -> String {
        let mut name = if hint.is_empty() { format!("reg{register}") } else { hint.to_string() };
        while !self.used_names.insert(name.clone()) {
            name = emit::incremented_name(&name);
        }
        name
    }

    fn replay_define_function(&mut self, position: usize) {
        let Some(source) = self.functions.get(&position).cloned() else {
            self.diagnostics
                .push(Diagnostic::at(position, "function body was not carved out"));
            return;
        };
        let mut inherited = self.used_names.clone();
        inherited.extend(source.parameters.iter().cloned());
        let mut diagnostics = Vec::new();
        let body = build_inner(
            &source.stream,
            &self.global_pool,
            &self.constants,
            &inherited,
            &source.register_params,
            &mut diagnostics,
        );
        self.diagnostics.append(&mut diagnostics);

        let mut parameters = source.parameters.clone();
        parameters.extend(source.register_params.iter().map(|(_, n)| n.clone()));
        let node = SyntaxNode::Function {
            name: source.name.clone(),
            parameters,
            body: Box::new(body),
        };
        if source.name.is_empty() {
            self.push_value(node);
        } else {
            self.append_statement(node);
        }
    }

    fn select_constants(&mut self, position: usize, instruction: &RawInstruction) {
        let params = &instruction.params;
        if params.is_empty() {
            self.constants.clear();
            return;
        }
        let declared = params[0].as_index();
        if declared != params.len() as i64 - 1 {
            self.diagnostics
                .push(Diagnostic::at(position, "constant selection count mismatch"));
        }
        let mut selected = Vec::with_capacity(params.len() - 1);
        for raw in &params[1..] {
            let index = raw.as_index();
            match self.global_pool.get(index.max(0) as usize) {
                Some(entry) if index >= 0 => selected.push(entry.clone()),
                _ => {
                    self.diagnostics.push(Diagnostic::at(
                        position,
                        format!("constant index {index} outside the pool"),
                    ));
                    selected.push(RawValue::Str(format!("c[{index}]")));
                }
            }
        }
        self.constants = selected;
    }

    fn resolve_raw(&mut self, position: usize, raw: &RawValue) -> SyntaxNode {
        match raw {
            RawValue::Constant(i) => match self.constants.get(*i as usize) {
                Some(entry) => SyntaxNode::Literal(entry.clone()),
                None => {
                    self.diagnostics.push(Diagnostic::at(
                        position,
                        format!("constant index {i} outside the selection"),
                    ));
                    SyntaxNode::Ident(format!("c[{i}]"))
                }
            },
            RawValue::Register(r) => match self.reg_names.get(r) {
                Some(name) => SyntaxNode::Ident(name.clone()),
                None => SyntaxNode::Register(*r),
            },
            literal => SyntaxNode::Literal(literal.clone()),
        }
    }
}

fn jump_label(branch: &RawInstruction) -> String {
    match branch.branch_target() {
        Some(target) => format!("pos_{target}"),
        None => "pos_unknown".to_string(),
    }
}

fn raw_from_value(value: &Value) -> Option<RawValue> {
    match value {
        Value::Str(s) => Some(RawValue::Str(s.clone())),
        Value::Bool(b) => Some(RawValue::Boolean(*b)),
        Value::Integer(i) => Some(RawValue::Integer(*i)),
        Value::Float(f) => Some(RawValue::Float(*f)),
        Value::Undefined | Value::Null | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(op: Opcode) -> RawInstruction {
        RawInstruction::new(op, vec![])
    }

    fn built(stream: Vec<(usize, RawInstruction)>) -> (NodePool, Vec<Diagnostic>) {
        let mut diags = Vec::new();
        let pool = build(&stream, &[], &NameSet::new(), &mut diags);
        (pool, diags)
    }

    #[test]
    fn folds_constant_arithmetic() {
        // 2 + 3 collapses to the literal 5
        let stream = vec![
            (
                0,
                RawInstruction::new(
                    Opcode::Push,
                    vec![RawValue::Integer(2), RawValue::Integer(3)],
                ),
            ),
            (1, plain(Opcode::Add)),
            (2, plain(Opcode::End)),
        ];
        let (pool, diags) = built(stream);
        assert!(diags.is_empty());
        assert_eq!(pool.list.len(), 1);
        assert!(matches!(
            pool.node(pool.list[0]),
            SyntaxNode::Literal(RawValue::Integer(5))
        ));
    }

    #[test]
    fn set_variable_consumes_name_and_value() {
        let stream = vec![
            (
                0,
                RawInstruction::new(
                    Opcode::Push,
                    vec![RawValue::Str("x".into()), RawValue::Integer(7)],
                ),
            ),
            (1, plain(Opcode::SetVariable)),
            (2, plain(Opcode::End)),
        ];
        let (pool, diags) = built(stream);
        assert!(diags.is_empty());
        assert_eq!(pool.list.len(), 1);
        let SyntaxNode::Op { opcode, args } = pool.node(pool.list[0]) else {
            panic!("expected a statement op");
        };
        assert_eq!(*opcode, Opcode::SetVariable);
        assert_eq!(args.len(), 2);
        assert!(matches!(pool.node(args[0]), SyntaxNode::Literal(RawValue::Str(s)) if s == "x"));
    }

    #[test]
    fn register_write_binds_an_identifier() {
        let stream = vec![
            (
                0,
                RawInstruction::new(Opcode::Push, vec![RawValue::Str("counter".into())]),
            ),
            (1, plain(Opcode::GetVariable)),
            (
                2,
                RawInstruction::new(Opcode::SetRegister, vec![RawValue::Register(1)]),
            ),
            (3, plain(Opcode::Pop)),
            (4, plain(Opcode::End)),
        ];
        let (pool, diags) = built(stream);
        assert!(diags.is_empty());
        // var decl plus the pop of the still-stacked named value
        let SyntaxNode::VarDecl { name, register, .. } = pool.node(pool.list[0]) else {
            panic!("expected a register binding");
        };
        assert_eq!(name, "counter");
        assert_eq!(*register, 1);
    }

    #[test]
    fn missing_operand_is_a_diagnostic_not_a_panic() {
        let stream = vec![(0, plain(Opcode::Add)), (1, plain(Opcode::End))];
        let (pool, diags) = built(stream);
        assert!(!diags.is_empty());
        assert_eq!(pool.list.len(), 1);
    }

    #[test]
    fn fold_failures_stop_after_cutoff() {
        // CastOp never folds; after the cut-off the counter stops growing
        let mut pool = build(&Vec::new(), &[], &NameSet::new(), &mut Vec::new());
        for _ in 0..10 {
            let a = pool.push_value(SyntaxNode::Literal(RawValue::Integer(1)));
            let b = pool.push_value(SyntaxNode::Literal(RawValue::Integer(2)));
            assert!(pool.try_fold(Opcode::CastOp, &[a, b]).is_none());
        }
        assert_eq!(pool.fold_failures[&Opcode::CastOp], FOLD_CUTOFF + 1);
    }
}
