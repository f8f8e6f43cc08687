use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::base::{InstructionStream, PoolEntry};
use super::builtin;
use super::context::{ExecutionContext, Recall, Scope};
use super::object::{
    self, handle, Callable, DefinedFunction, EsObject, ObjHandle, PRELOAD_ARGUMENTS,
    PRELOAD_GLOBAL, PRELOAD_PARENT, PRELOAD_ROOT, PRELOAD_SUPER, PRELOAD_THIS,
    SUPPRESS_ARGUMENTS, SUPPRESS_THIS,
};
use super::{ops, Value};

/// Host-level faults: malformed data reaching the interpreter. Language
/// errors travel as thrown values instead, and interpreter bugs panic.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("jump target {position} does not exist in context '{context}'")]
    BadJumpTarget { position: usize, context: String },
    #[error("constant index {index} out of range (pool has {len} entries) in context '{context}'")]
    BadConstantIndex { index: u32, len: usize, context: String },
    #[error("register index {index} out of range ({len} registers) in context '{context}'")]
    BadRegisterIndex { index: u32, len: usize, context: String },
    #[error("global constant index {index} out of range (pool has {len} entries)")]
    BadPoolIndex { index: u32, len: usize },
    #[error("malformed {opcode} operands: {message}")]
    BadOperands { opcode: String, message: String },
}

pub type VmResult<T> = Result<T, VmError>;

/// Final result of running a stream to completion.
#[derive(Debug, Clone)]
pub enum Outcome {
    Result(Value),
    Thrown(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Executed,
    Paused,
    /// The outermost context has no instructions left.
    GlobalDone,
    Idle,
}

struct Interval {
    /// Registration order, used to fire due timers oldest-first.
    seq: u64,
    last_tick_ms: u64,
    duration_ms: u64,
    function: Value,
    this: Value,
    args: Vec<Value>,
}

pub struct VirtualMachine {
    pub call_stack: Vec<ExecutionContext>,
    exec_queue: VecDeque<ExecutionContext>,
    pub globals: ObjHandle,
    pub global_scope: Rc<Scope>,
    pub object_proto: ObjHandle,
    pub function_proto: ObjHandle,
    pub array_proto: ObjHandle,
    /// Shared global constant pool, selected into contexts by ConstantPool.
    pub pool: Vec<Value>,
    pub breakpoints: HashSet<usize>,
    intervals: HashMap<String, Interval>,
    next_interval_id: u64,
    /// Milliseconds of virtual time. The host advances it; pausing freezes
    /// it, which keeps interval-elapsed math blind to the paused span.
    clock_ms: u64,
    paused: bool,
    pub trace_log: Vec<String>,
}

impl VirtualMachine {
    pub fn new() -> VirtualMachine {
        let globals = handle(EsObject::plain());
        let global_scope = Scope::root(globals.clone());
        let mut vm = VirtualMachine {
            call_stack: Vec::new(),
            exec_queue: VecDeque::new(),
            globals: globals.clone(),
            global_scope,
            object_proto: handle(EsObject::plain()),
            function_proto: handle(EsObject::plain()),
            array_proto: handle(EsObject::plain()),
            pool: Vec::new(),
            breakpoints: HashSet::new(),
            intervals: HashMap::new(),
            next_interval_id: 1,
            clock_ms: 0,
            paused: false,
            trace_log: Vec::new(),
        };
        builtin::install(&mut vm);
        vm
    }

    pub fn set_pool(&mut self, entries: &[PoolEntry]) {
        self.pool = entries
            .iter()
            .map(|e| match e.to_raw() {
                crate::base::RawValue::Str(s) => Value::Str(s),
                crate::base::RawValue::Boolean(b) => Value::Bool(b),
                crate::base::RawValue::Integer(i) => Value::Integer(i),
                crate::base::RawValue::Float(f) => Value::Float(f),
                // Register entries stay symbolic until a context resolves them.
                crate::base::RawValue::Constant(i) | crate::base::RawValue::Register(i) => {
                    Value::Integer(i as i32)
                }
            })
            .collect();
    }

    // ── Context management ──

    pub fn current_mut(&mut self) -> &mut ExecutionContext {
        self.call_stack.last_mut().expect("no active execution context")
    }

    pub fn current(&self) -> &ExecutionContext {
        self.call_stack.last().expect("no active execution context")
    }

    fn make_global_context(&self, stream: Rc<InstructionStream>) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            "global",
            stream,
            Vec::new(),
            4,
            self.global_scope.clone(),
            Value::Object(self.globals.clone()),
        );
        ctx.is_global = true;
        ctx
    }

    /// Pop the finished top context, propagate its thrown value, and run
    /// its recall records against the new top — each exactly once, before
    /// the caller's next instruction.
    fn pop_context(&mut self) -> VmResult<()> {
        let mut finished = self.call_stack.pop().expect("pop on empty call stack");
        if finished.is_global {
            panic!("attempted to pop the global execution context");
        }
        assert!(!self.call_stack.is_empty(), "call stack lost its global context");

        let result = finished.return_value.take().unwrap_or(Value::Undefined);
        if let Some(thrown) = finished.thrown.take() {
            // Recalls of a throwing callee never run.
            self.current_mut().throw(thrown);
            return Ok(());
        }
        let recalls: Vec<Recall> = finished.recalls.drain(..).collect();
        for recall in recalls {
            self.apply_recall(recall, &result)?;
        }
        Ok(())
    }

    fn apply_recall(&mut self, recall: Recall, result: &Value) -> VmResult<()> {
        match recall {
            Recall::PushResult => self.current_mut().push(result.clone()),
            Recall::DiscardResult => {}
            Recall::ConstructedThis { this } => {
                let value = match result {
                    Value::Object(_) => result.clone(),
                    _ => Value::Object(this),
                };
                self.current_mut().push(value);
            }
        }
        Ok(())
    }

    // ── Execution loops ──

    /// Run a single instruction of the current context, then pop contexts
    /// that finished as a result.
    pub fn execute_once(&mut self, ignore_breakpoint: bool) -> VmResult<StepResult> {
        if self.call_stack.is_empty() {
            return Ok(StepResult::Idle);
        }

        let top = self.current();
        if !top.finished() {
            if !ignore_breakpoint {
                if let Some(position) = top.next_position() {
                    if self.breakpoints.contains(&position) {
                        self.pause();
                        return Ok(StepResult::Paused);
                    }
                }
            }
            let (position, instruction) = self
                .current_mut()
                .fetch_advance()
                .expect("unfinished context has no instruction");
            ops::execute(self, position, &instruction)?;
        }

        // Dispatch may have pushed a callee; look at the stack afresh.
        let top = self.current();
        if top.finished() {
            if top.is_global {
                return Ok(StepResult::GlobalDone);
            }
            self.pop_context()?;
        }
        Ok(StepResult::Executed)
    }

    /// Run until the context on top at entry has been popped.
    pub fn execute_until_halt(&mut self) -> VmResult<StepResult> {
        let entry_depth = self.call_stack.len();
        loop {
            if self.paused {
                return Ok(StepResult::Paused);
            }
            if self.call_stack.len() < entry_depth {
                return Ok(StepResult::Executed);
            }
            match self.execute_once(false)? {
                StepResult::Executed => {}
                other => return Ok(other),
            }
        }
    }

    /// Run until only the global context remains.
    pub fn execute_until_global(&mut self) -> VmResult<StepResult> {
        loop {
            if self.paused {
                return Ok(StepResult::Paused);
            }
            if self.call_stack.len() <= 1 {
                return Ok(StepResult::Executed);
            }
            match self.execute_once(false)? {
                StepResult::Executed => {}
                other => return Ok(other),
            }
        }
    }

    /// Drain the call stack and the FIFO execution queue.
    pub fn execute_until_empty(&mut self) -> VmResult<StepResult> {
        loop {
            if self.paused {
                return Ok(StepResult::Paused);
            }
            if self.call_stack.len() <= 1 {
                let global_done =
                    self.call_stack.first().map(|c| c.finished()).unwrap_or(true);
                if let Some(queued) = self.exec_queue.pop_front() {
                    self.call_stack.push(queued);
                } else if global_done {
                    return Ok(StepResult::Executed);
                }
            }
            match self.execute_once(false)? {
                StepResult::Executed => {}
                StepResult::GlobalDone => {}
                other => return Ok(other),
            }
        }
    }

    pub fn enqueue_context(&mut self, ctx: ExecutionContext) {
        self.exec_queue.push_back(ctx);
    }

    /// Run a whole stream against a fresh global context. Any frames and
    /// queued work left over from an earlier run are discarded first.
    pub fn run_stream(
        &mut self,
        stream: InstructionStream,
        pool: &[PoolEntry],
    ) -> VmResult<Outcome> {
        self.call_stack.clear();
        self.exec_queue.clear();
        self.set_pool(pool);
        let ctx = self.make_global_context(Rc::new(stream));
        self.call_stack.push(ctx);
        self.execute_until_empty()?;
        let global = self.call_stack.first_mut().expect("global context vanished");
        if let Some(thrown) = global.thrown.take() {
            return Ok(Outcome::Thrown(thrown));
        }
        let result = global
            .return_value
            .take()
            .or_else(|| global.stack.last().cloned())
            .unwrap_or(Value::Undefined);
        Ok(Outcome::Result(result))
    }

    // ── Pause / resume ──

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    // ── Virtual clock and intervals ──

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    /// Advance virtual time. Frozen while paused, so interval math never
    /// sees the paused span.
    pub fn advance_clock(&mut self, delta_ms: u64) {
        if !self.paused {
            self.clock_ms += delta_ms;
        }
    }

    pub fn set_interval(
        &mut self,
        name: String,
        function: Value,
        duration_ms: u64,
        this: Value,
        args: Vec<Value>,
    ) {
        let seq = self.next_interval_id;
        self.next_interval_id += 1;
        self.intervals.insert(
            name,
            Interval { seq, last_tick_ms: self.clock_ms, duration_ms, function, this, args },
        );
    }

    /// Register an interval under a fresh numeric id, as `setInterval` does.
    pub fn add_interval(
        &mut self,
        function: Value,
        duration_ms: u64,
        this: Value,
        args: Vec<Value>,
    ) -> u64 {
        let id = self.next_interval_id;
        self.set_interval(id.to_string(), function, duration_ms, this, args);
        id
    }

    pub fn clear_interval(&mut self, name: &str) -> bool {
        self.intervals.remove(name).is_some()
    }

    /// Fire every interval whose period elapsed, oldest registration
    /// first, then drain the queue.
    pub fn update_intervals(&mut self) -> VmResult<StepResult> {
        if self.paused {
            return Ok(StepResult::Paused);
        }
        let now = self.clock_ms;
        let mut due: Vec<(u64, String)> = self
            .intervals
            .iter()
            .filter(|(_, i)| now.saturating_sub(i.last_tick_ms) >= i.duration_ms)
            .map(|(name, i)| (i.seq, name.clone()))
            .collect();
        due.sort();
        let due: Vec<String> = due.into_iter().map(|(_, name)| name).collect();
        for name in due {
            // An earlier callback may have cleared this one already.
            let Some(interval) = self.intervals.get_mut(&name) else {
                continue;
            };
            interval.last_tick_ms = now;
            let (function, this, args) =
                (interval.function.clone(), interval.this.clone(), interval.args.clone());
            self.enqueue_call(&function, &this, &args)?;
        }
        self.execute_until_empty()
    }

    /// Queue a call for execution once the stack next drains to global.
    /// Native callees run immediately; their results are discarded either
    /// way.
    pub fn enqueue_call(
        &mut self,
        function: &Value,
        this: &Value,
        args: &[Value],
    ) -> VmResult<()> {
        let callable = match function.as_object().and_then(|o| o.borrow().callable.clone()) {
            Some(c) => c,
            None => return Ok(()),
        };
        match callable {
            Callable::Native(f) => {
                let _ = f(self, this, args);
                Ok(())
            }
            Callable::Defined(df) => {
                let mut ctx = self.make_function_context(&df, this.clone(), args);
                ctx.push_recall(Recall::DiscardResult);
                self.enqueue_context(ctx);
                Ok(())
            }
        }
    }

    // ── Calls ──

    /// Invoke a callable. Defined functions are pushed as a new context
    /// carrying `recall` for their completion; natives complete in place
    /// and the recall applies immediately.
    pub fn call_value(
        &mut self,
        function: &Value,
        this: &Value,
        args: &[Value],
        recall: Recall,
    ) -> VmResult<()> {
        let callable = function.as_object().and_then(|o| o.borrow().callable.clone());
        let callable = match callable {
            Some(c) => c,
            None => {
                let error = builtin::type_error(
                    self,
                    &format!("{} is not a function", function.coerce_string()),
                );
                self.current_mut().throw(error);
                return Ok(());
            }
        };
        match callable {
            Callable::Native(f) => match f(self, this, args) {
                Ok(result) => self.apply_recall(recall, &result),
                Err(thrown) => {
                    self.current_mut().throw(thrown);
                    Ok(())
                }
            },
            Callable::Defined(df) => {
                let mut ctx = self.make_function_context(&df, this.clone(), args);
                ctx.push_recall(recall);
                self.call_stack.push(ctx);
                Ok(())
            }
        }
    }

    /// `new`: allot the instance, wire its prototype, then run the
    /// constructor with a ConstructedThis completion.
    pub fn construct(&mut self, constructor: &Value, args: &[Value]) -> VmResult<()> {
        let ctor_obj = match constructor.as_object() {
            Some(o) if o.borrow().callable.is_some() => o,
            _ => {
                let error = builtin::type_error(
                    self,
                    &format!("{} is not a constructor", constructor.coerce_string()),
                );
                self.current_mut().throw(error);
                return Ok(());
            }
        };
        let instance = handle(EsObject::plain());
        if let object::Lookup::Value(Value::Object(proto)) =
            object::get_value(&ctor_obj, "prototype")
        {
            instance.borrow_mut().prototype = Some(proto);
        }
        let this = Value::Object(instance.clone());
        self.call_value(constructor, &this, args, Recall::ConstructedThis { this: instance })
    }

    pub fn make_function_context(
        &self,
        function: &Rc<DefinedFunction>,
        this: Value,
        args: &[Value],
    ) -> ExecutionContext {
        let activation = handle(EsObject::plain());
        {
            let mut frame = activation.borrow_mut();
            for (i, param) in function.parameters.iter().enumerate() {
                frame.put(param.clone(), args.get(i).cloned().unwrap_or(Value::Undefined));
            }
            // Register 0 means "bind by name only" for DefineFunction2 params.
            for (i, (register, name)) in function.register_params.iter().enumerate() {
                if *register == 0 && !name.is_empty() {
                    frame.put(name.clone(), args.get(i).cloned().unwrap_or(Value::Undefined));
                }
            }
            if function.flags & SUPPRESS_ARGUMENTS == 0 {
                frame.put("arguments", Value::object(EsObject::array(args.to_vec())));
            }
            if function.flags & SUPPRESS_THIS == 0 {
                frame.put_hidden("this", this.clone());
            }
        }
        let scope = Scope::child(&function.scope, activation);
        let display_name =
            if function.name.is_empty() { "anonymous" } else { function.name.as_str() };
        let mut ctx = ExecutionContext::new(
            display_name.to_string(),
            function.body.clone(),
            function.constants.clone(),
            function.num_registers.max(4),
            scope,
            this.clone(),
        );
        self.preload_registers(function, &mut ctx, this, args);
        ctx
    }

    // DefineFunction2 preload slots fill r1 upward in SWF flag order.
    fn preload_registers(
        &self,
        function: &Rc<DefinedFunction>,
        ctx: &mut ExecutionContext,
        this: Value,
        args: &[Value],
    ) {
        let flags = function.flags;
        let mut next = 1usize;
        let mut preload = |ctx: &mut ExecutionContext, value: Value| {
            if next < ctx.registers.len() {
                ctx.registers[next] = value;
            }
            next += 1;
        };
        if flags & PRELOAD_THIS != 0 {
            preload(ctx, this);
        }
        if flags & PRELOAD_ARGUMENTS != 0 {
            preload(ctx, Value::object(EsObject::array(args.to_vec())));
        }
        if flags & PRELOAD_SUPER != 0 {
            preload(ctx, Value::Undefined);
        }
        if flags & PRELOAD_ROOT != 0 {
            preload(ctx, Value::Object(self.globals.clone()));
        }
        if flags & PRELOAD_PARENT != 0 {
            preload(ctx, Value::Object(self.globals.clone()));
        }
        if flags & PRELOAD_GLOBAL != 0 {
            preload(ctx, Value::Object(self.globals.clone()));
        }
        for (i, (register, _name)) in function.register_params.iter().enumerate() {
            // Register 0 parameters bind by name only; never write r0.
            if *register != 0 && (*register as usize) < ctx.registers.len() {
                ctx.registers[*register as usize] =
                    args.get(i).cloned().unwrap_or(Value::Undefined);
            }
        }
    }
}

impl Default for VirtualMachine {
    fn default() -> Self {
        VirtualMachine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Opcode, RawInstruction, RawValue};

    fn ins(opcode: Opcode, params: Vec<RawValue>) -> RawInstruction {
        RawInstruction::new(opcode, params)
    }

    fn push_int(v: i32) -> RawInstruction {
        ins(Opcode::Push, vec![RawValue::Integer(v)])
    }

    fn push_str(s: &str) -> RawInstruction {
        ins(Opcode::Push, vec![RawValue::Str(s.to_string())])
    }

    #[test]
    fn run_stream_returns_the_top_of_stack() {
        let stream = vec![
            (0, push_int(2)),
            (1, push_int(3)),
            (2, ins(Opcode::Add, vec![])),
            (3, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        let outcome = vm.run_stream(stream, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Integer(5))));
    }

    #[test]
    fn trace_collects_coerced_lines() {
        let stream = vec![
            (0, push_str("hi")),
            (1, ins(Opcode::Trace, vec![])),
            (2, push_int(42)),
            (3, ins(Opcode::Trace, vec![])),
            (4, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        vm.run_stream(stream, &[]).unwrap();
        assert_eq!(vm.trace_log, vec!["hi", "42"]);
    }

    #[test]
    fn defined_function_call_pushes_its_return_value() {
        // function double(x) { return x * 2; }  double(21);
        let stream = vec![
            (
                0,
                ins(
                    Opcode::DefineFunction,
                    vec![
                        RawValue::Str("double".into()),
                        RawValue::Str("x".into()),
                        RawValue::Integer(6),
                    ],
                ),
            ),
            (1, push_str("x")),
            (2, ins(Opcode::GetVariable, vec![])),
            (3, push_int(2)),
            (4, ins(Opcode::Multiply, vec![])),
            (5, ins(Opcode::Return, vec![])),
            (6, push_int(21)),
            (7, push_int(1)),
            (8, push_str("double")),
            (9, ins(Opcode::CallFunction, vec![])),
            (10, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        let outcome = vm.run_stream(stream, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Integer(42))));
        // The PushResult recall ran exactly once.
        assert_eq!(vm.call_stack[0].stack.len(), 1);
    }

    #[test]
    fn define_function2_preloads_parameter_registers() {
        // pick(a, b) with a in r1 and b in r2; the body reads r2 directly.
        let stream = vec![
            (
                0,
                ins(
                    Opcode::DefineFunction2,
                    vec![
                        RawValue::Str("pick".into()),
                        RawValue::Integer(3),
                        RawValue::Integer(0),
                        RawValue::Integer(3),
                        RawValue::Integer(1),
                        RawValue::Str("a".into()),
                        RawValue::Integer(2),
                        RawValue::Str("b".into()),
                    ],
                ),
            ),
            (1, ins(Opcode::Push, vec![RawValue::Register(2)])),
            (2, ins(Opcode::Return, vec![])),
            (3, push_int(9)),
            (4, push_int(7)),
            (5, push_int(2)),
            (6, push_str("pick")),
            (7, ins(Opcode::CallFunction, vec![])),
            (8, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        let outcome = vm.run_stream(stream, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Integer(9))));
    }

    #[test]
    fn branching_selects_the_taken_arm() {
        // if (cond) { x = 1 } else { x = 2 }
        let body = |cond: i32| {
            vec![
                (0, push_int(cond)),
                (1, ins(Opcode::EaBranchIfFalse, vec![RawValue::Integer(6)])),
                (2, push_str("x")),
                (3, push_int(1)),
                (4, ins(Opcode::SetVariable, vec![])),
                (5, ins(Opcode::BranchAlways, vec![RawValue::Integer(9)])),
                (6, push_str("x")),
                (7, push_int(2)),
                (8, ins(Opcode::SetVariable, vec![])),
                (9, RawInstruction::end()),
            ]
        };
        let mut vm = VirtualMachine::new();
        vm.run_stream(body(1), &[]).unwrap();
        assert!(matches!(vm.global_scope.lookup("x"), Some(Value::Integer(1))));
        let mut vm = VirtualMachine::new();
        vm.run_stream(body(0), &[]).unwrap();
        assert!(matches!(vm.global_scope.lookup("x"), Some(Value::Integer(2))));
    }

    #[test]
    fn getter_reads_complete_through_a_recall() {
        // obj.addProperty("x", get7, undefined); obj.x
        let stream = vec![
            (
                0,
                ins(
                    Opcode::DefineFunction,
                    vec![RawValue::Str("get7".into()), RawValue::Integer(3)],
                ),
            ),
            (1, push_int(7)),
            (2, ins(Opcode::Return, vec![])),
            (3, push_int(0)),
            (4, ins(Opcode::InitObject, vec![])),
            (5, ins(Opcode::SetRegister, vec![RawValue::Integer(1)])),
            (6, ins(Opcode::Pop, vec![])),
            (7, push_str("get7")),
            (8, ins(Opcode::GetVariable, vec![])),
            (9, push_str("x")),
            (10, push_int(2)),
            (11, ins(Opcode::Push, vec![RawValue::Register(1)])),
            (12, push_str("addProperty")),
            (13, ins(Opcode::CallMethod, vec![])),
            (14, ins(Opcode::Pop, vec![])),
            (
                15,
                ins(Opcode::Push, vec![RawValue::Register(1), RawValue::Str("x".into())]),
            ),
            (16, ins(Opcode::GetMember, vec![])),
            (17, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        let outcome = vm.run_stream(stream, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Integer(7))));
        // The getter's PushResult recall ran exactly once.
        assert_eq!(vm.call_stack[0].stack.len(), 1);
    }

    #[test]
    fn streams_run_back_to_back_on_one_vm() {
        // The finished global frame of the first run must not wedge the
        // second run's drain loop.
        let mut vm = VirtualMachine::new();
        let first = vec![
            (0, push_int(2)),
            (1, push_int(3)),
            (2, ins(Opcode::Add, vec![])),
            (3, RawInstruction::end()),
        ];
        let outcome = vm.run_stream(first, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Integer(5))));

        let second = vec![(0, push_int(7)), (1, RawInstruction::end())];
        let outcome = vm.run_stream(second, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Integer(7))));
        assert_eq!(vm.call_stack.len(), 1);
    }

    #[test]
    fn register_zero_parameter_binds_by_name_only() {
        // f(a) declared with register slot 0: r0 stays untouched and the
        // argument is reachable by name.
        let define = ins(
            Opcode::DefineFunction2,
            vec![
                RawValue::Str("f".into()),
                RawValue::Integer(3),
                RawValue::Integer(0),
                RawValue::Integer(3),
                RawValue::Integer(0),
                RawValue::Str("a".into()),
            ],
        );
        let by_register = vec![
            (0, define),
            (1, ins(Opcode::Push, vec![RawValue::Register(0)])),
            (2, ins(Opcode::Return, vec![])),
            (3, push_int(99)),
            (4, push_int(1)),
            (5, push_str("f")),
            (6, ins(Opcode::CallFunction, vec![])),
            (7, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        let outcome = vm.run_stream(by_register, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Undefined)));

        let by_name = vec![
            (
                0,
                ins(
                    Opcode::DefineFunction2,
                    vec![
                        RawValue::Str("f".into()),
                        RawValue::Integer(3),
                        RawValue::Integer(0),
                        RawValue::Integer(4),
                        RawValue::Integer(0),
                        RawValue::Str("a".into()),
                    ],
                ),
            ),
            (1, push_str("a")),
            (2, ins(Opcode::GetVariable, vec![])),
            (3, ins(Opcode::Return, vec![])),
            (4, push_int(99)),
            (5, push_int(1)),
            (6, push_str("f")),
            (7, ins(Opcode::CallFunction, vec![])),
            (8, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        let outcome = vm.run_stream(by_name, &[]).unwrap();
        assert!(matches!(outcome, Outcome::Result(Value::Integer(99))));
    }

    #[test]
    #[should_panic(expected = "pop the global execution context")]
    fn popping_the_global_context_panics() {
        let mut vm = VirtualMachine::new();
        let ctx = vm.make_global_context(Rc::new(vec![(0, RawInstruction::end())]));
        vm.call_stack.push(ctx);
        vm.pop_context().unwrap();
    }

    #[test]
    fn calling_a_missing_name_throws_a_type_error() {
        let stream = vec![
            (0, push_int(0)),
            (1, push_str("nope")),
            (2, ins(Opcode::CallFunction, vec![])),
            (3, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        let outcome = vm.run_stream(stream, &[]).unwrap();
        let thrown = match outcome {
            Outcome::Thrown(v) => v,
            other => panic!("expected a thrown value, got {:?}", other),
        };
        let obj = thrown.as_object().unwrap();
        match object::get_value(&obj, "name") {
            object::Lookup::Value(Value::Str(name)) => assert_eq!(name, "TypeError"),
            other => panic!("expected a name property, got {:?}", other),
        }
    }

    #[test]
    fn breakpoint_pauses_before_the_instruction() {
        let stream = vec![
            (0, push_str("hi")),
            (1, ins(Opcode::Trace, vec![])),
            (2, RawInstruction::end()),
        ];
        let mut vm = VirtualMachine::new();
        vm.breakpoints.insert(1);
        vm.run_stream(stream, &[]).unwrap();
        assert!(vm.paused());
        assert!(vm.trace_log.is_empty());

        vm.resume();
        vm.execute_once(true).unwrap();
        assert_eq!(vm.trace_log, vec!["hi"]);
    }

    #[test]
    fn clock_is_frozen_while_paused() {
        let mut vm = VirtualMachine::new();
        vm.advance_clock(100);
        vm.pause();
        vm.advance_clock(50);
        assert_eq!(vm.clock_ms(), 100);
        vm.resume();
        vm.advance_clock(25);
        assert_eq!(vm.clock_ms(), 125);
    }

    fn trace_arg(vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
        let line = args.first().cloned().unwrap_or(Value::Undefined).coerce_string();
        vm.trace_log.push(line);
        Ok(Value::Undefined)
    }

    #[test]
    fn due_intervals_fire_in_registration_order() {
        let mut vm = VirtualMachine::new();
        let f = Value::object(EsObject::native_function(trace_arg));
        // Enough registrations that lexicographic id order would misfire
        // ("10" sorts before "2").
        for i in 1..=12 {
            let id =
                vm.add_interval(f.clone(), 10, Value::Undefined, vec![Value::Integer(i)]);
            assert_eq!(id, i as u64);
        }
        vm.advance_clock(10);
        vm.update_intervals().unwrap();
        let expected: Vec<String> = (1..=12).map(|i| i.to_string()).collect();
        assert_eq!(vm.trace_log, expected);
    }

    #[test]
    fn intervals_clear_by_numeric_id() {
        let mut vm = VirtualMachine::new();
        let f = Value::object(EsObject::native_function(trace_arg));
        let id = vm.add_interval(f, 10, Value::Undefined, vec![Value::Integer(1)]);
        assert!(vm.clear_interval(&id.to_string()));
        assert!(!vm.clear_interval(&id.to_string()));
        vm.advance_clock(100);
        vm.update_intervals().unwrap();
        assert!(vm.trace_log.is_empty());
    }

    #[test]
    fn intervals_do_not_fire_while_paused() {
        let mut vm = VirtualMachine::new();
        let f = Value::object(EsObject::native_function(trace_arg));
        vm.add_interval(f, 10, Value::Undefined, vec![Value::Integer(1)]);
        vm.advance_clock(10);
        vm.pause();
        assert!(matches!(vm.update_intervals().unwrap(), StepResult::Paused));
        assert!(vm.trace_log.is_empty());
        vm.resume();
        vm.update_intervals().unwrap();
        assert_eq!(vm.trace_log, vec!["1"]);
    }
}
