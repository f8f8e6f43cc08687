use std::collections::VecDeque;
use std::rc::Rc;

use crate::base::{InstructionStream, RawInstruction, RawValue};
use super::object::{self, Lookup, ObjHandle};
use super::vm::VmError;
use super::Value;

/// One link of the lexical scope chain. The activation object holds the
/// frame's named parameters and locals; the parent link reaches the
/// defining scope, ending at the global object.
#[derive(Debug)]
pub struct Scope {
    pub locals: ObjHandle,
    pub parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn root(locals: ObjHandle) -> Rc<Scope> {
        Rc::new(Scope { locals, parent: None })
    }

    pub fn child(parent: &Rc<Scope>, locals: ObjHandle) -> Rc<Scope> {
        Rc::new(Scope { locals, parent: Some(parent.clone()) })
    }

    /// Resolve a name against the chain. Activation objects never carry
    /// accessors, so a hit is always a plain value.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Lookup::Value(v) = object::get_value(&scope.locals, name) {
                return Some(v);
            }
            match &scope.parent {
                Some(parent) => scope = parent,
                None => return None,
            }
        }
    }

    /// Assign to an existing binding somewhere on the chain. Returns false
    /// when no frame declares the name.
    pub fn assign_existing(&self, name: &str, value: Value) -> bool {
        let mut scope = self;
        loop {
            if scope.locals.borrow().has_own(name) {
                object::set_value(&scope.locals, name, value);
                return true;
            }
            match &scope.parent {
                Some(parent) => scope = parent,
                None => return false,
            }
        }
    }

    pub fn declare(&self, name: &str, value: Value) {
        object::set_value(&self.locals, name, value);
    }
}

/// A pending continuation: what to do with a finished sub-call's result.
/// Plain data, executed by the VM against the caller after the callee
/// halts — exactly once, before the caller's next instruction.
#[derive(Debug, Clone)]
pub enum Recall {
    /// Push the result onto the caller's operand stack.
    PushResult,
    /// Drop the result.
    DiscardResult,
    /// `new`: push the freshly built object unless the constructor
    /// explicitly returned another object.
    ConstructedThis { this: ObjHandle },
}

pub struct ExecutionContext {
    pub name: String,
    pub stream: Rc<InstructionStream>,
    /// Index of the next instruction to execute.
    pub cursor: usize,
    pub stack: Vec<Value>,
    pub registers: Vec<Value>,
    pub constants: Vec<Value>,
    pub scope: Rc<Scope>,
    pub this: Value,
    pub halted: bool,
    pub return_value: Option<Value>,
    pub thrown: Option<Value>,
    pub recalls: VecDeque<Recall>,
    pub is_global: bool,
}

impl ExecutionContext {
    pub fn new(
        name: impl Into<String>,
        stream: Rc<InstructionStream>,
        constants: Vec<Value>,
        num_registers: usize,
        scope: Rc<Scope>,
        this: Value,
    ) -> ExecutionContext {
        ExecutionContext {
            name: name.into(),
            stream,
            cursor: 0,
            stack: Vec::new(),
            registers: vec![Value::Undefined; num_registers],
            constants,
            scope,
            this,
            halted: false,
            return_value: None,
            thrown: None,
            recalls: VecDeque::new(),
            is_global: false,
        }
    }

    pub fn finished(&self) -> bool {
        self.halted || self.cursor >= self.stream.len()
    }

    /// Stream position of the next instruction, if any.
    pub fn next_position(&self) -> Option<usize> {
        self.stream.get(self.cursor).map(|(pos, _)| *pos)
    }

    /// Fetch the next instruction and advance past it.
    pub fn fetch_advance(&mut self) -> Option<(usize, RawInstruction)> {
        let item = self.stream.get(self.cursor).cloned();
        if item.is_some() {
            self.cursor += 1;
        }
        item
    }

    /// Redirect execution to an absolute stream position.
    pub fn jump_to(&mut self, position: usize) -> Result<(), VmError> {
        match self.stream.binary_search_by_key(&position, |(pos, _)| *pos) {
            Ok(index) => {
                self.cursor = index;
                Ok(())
            }
            Err(_) => Err(VmError::BadJumpTarget { position, context: self.name.clone() }),
        }
    }

    // Operand-stack arity is guaranteed by each opcode's declared shape;
    // an underflow here is an interpreter bug, not bad input.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => panic!("operand stack underflow in context '{}'", self.name),
        }
    }

    pub fn peek(&self) -> Value {
        match self.stack.last() {
            Some(v) => v.clone(),
            None => panic!("operand stack underflow in context '{}'", self.name),
        }
    }

    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.pop());
        }
        values
    }

    /// Resolve a raw operand to a runtime value. Constant and register
    /// references index this context's tables; a bad index is a data error.
    pub fn resolve(&self, raw: &RawValue) -> Result<Value, VmError> {
        match raw {
            RawValue::Constant(i) => {
                self.constants.get(*i as usize).cloned().ok_or(VmError::BadConstantIndex {
                    index: *i,
                    len: self.constants.len(),
                    context: self.name.clone(),
                })
            }
            RawValue::Register(i) => {
                self.registers.get(*i as usize).cloned().ok_or(VmError::BadRegisterIndex {
                    index: *i,
                    len: self.registers.len(),
                    context: self.name.clone(),
                })
            }
            literal => Ok(Value::from_raw_literal(literal)
                .unwrap_or(Value::Undefined)),
        }
    }

    pub fn set_register(&mut self, index: u32, value: Value) -> Result<(), VmError> {
        let len = self.registers.len();
        match self.registers.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::BadRegisterIndex {
                index,
                len,
                context: self.name.clone(),
            }),
        }
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn throw(&mut self, value: Value) {
        self.thrown = Some(value);
        self.halted = true;
    }

    pub fn do_return(&mut self, value: Value) {
        self.return_value = Some(value);
        self.halted = true;
    }

    pub fn push_recall(&mut self, recall: Recall) {
        self.recalls.push_back(recall);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Opcode, RawInstruction};
    use crate::runtime::object::{handle, EsObject};

    fn empty_context(stream: InstructionStream) -> ExecutionContext {
        let globals = handle(EsObject::plain());
        ExecutionContext::new(
            "test",
            Rc::new(stream),
            vec![Value::Str("pool0".into())],
            2,
            Scope::root(globals),
            Value::Undefined,
        )
    }

    #[test]
    fn scope_chain_lookup_and_assign() {
        let globals = handle(EsObject::plain());
        globals.borrow_mut().put("g", Value::Integer(1));
        let root = Scope::root(globals);
        let inner = Scope::child(&root, handle(EsObject::plain()));
        inner.declare("x", Value::Integer(2));

        assert!(matches!(inner.lookup("x"), Some(Value::Integer(2))));
        assert!(matches!(inner.lookup("g"), Some(Value::Integer(1))));
        assert!(inner.lookup("missing").is_none());

        // Assignment updates the declaring frame, not the innermost one.
        assert!(inner.assign_existing("g", Value::Integer(9)));
        assert!(matches!(root.lookup("g"), Some(Value::Integer(9))));
        assert!(!inner.assign_existing("missing", Value::Null));
    }

    #[test]
    fn resolve_literals_and_references() {
        let ctx = empty_context(vec![]);
        assert!(matches!(
            ctx.resolve(&RawValue::Integer(5)).unwrap(),
            Value::Integer(5)
        ));
        assert!(matches!(
            ctx.resolve(&RawValue::Constant(0)).unwrap(),
            Value::Str(_)
        ));
        assert!(ctx.resolve(&RawValue::Constant(1)).is_err());
        assert!(ctx.resolve(&RawValue::Register(5)).is_err());
    }

    #[test]
    fn jump_targets_must_exist() {
        let stream = vec![
            (0, RawInstruction::new(Opcode::Push, vec![RawValue::Integer(1)])),
            (5, RawInstruction::end()),
        ];
        let mut ctx = empty_context(stream);
        ctx.jump_to(5).unwrap();
        assert_eq!(ctx.next_position(), Some(5));
        assert!(ctx.jump_to(3).is_err());
    }

    #[test]
    #[should_panic(expected = "operand stack underflow")]
    fn pop_empty_stack_panics() {
        let mut ctx = empty_context(vec![]);
        ctx.pop();
    }
}
