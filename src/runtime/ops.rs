//! Per-opcode execution. One closed dispatch table; stack shapes come from
//! `Opcode::stack_arity` and a mismatch is an interpreter bug.

use std::rc::Rc;

use crate::base::{InstructionStream, Opcode, RawInstruction, RawValue};
use super::context::Recall;
use super::object::{self, handle, DefinedFunction, EsObject, Lookup, StoreOutcome};
use super::vm::{VirtualMachine, VmError, VmResult};
use super::{abstract_equals, abstract_less, number_equals, strict_equals, PrimitiveHint, Value};

pub fn execute(
    vm: &mut VirtualMachine,
    position: usize,
    instruction: &RawInstruction,
) -> VmResult<()> {
    use Opcode::*;
    let op = instruction.opcode;
    match op {
        End => vm.current_mut().halt(),

        ConstantPool => do_constant_pool(vm, instruction)?,

        Push => {
            for param in &instruction.params {
                let value = vm.current().resolve(param)?;
                vm.current_mut().push(value);
            }
        }
        PushDuplicate => {
            let top = vm.current().stack.last().cloned();
            match top {
                Some(v) => vm.current_mut().push(v),
                None => panic!("PushDuplicate on empty stack"),
            }
        }
        Pop => {
            vm.current_mut().pop();
        }
        StackSwap => {
            let ctx = vm.current_mut();
            let a = ctx.pop();
            let b = ctx.pop();
            ctx.push(a);
            ctx.push(b);
        }
        SetRegister => {
            let index = first_param(instruction, op)?.as_index();
            if index < 0 {
                return Err(bad_operands(op, "negative register index"));
            }
            let value = vm.current().stack.last().cloned().unwrap_or(Value::Undefined);
            vm.current_mut().set_register(index as u32, value)?;
        }

        EaPushThis => {
            let this = vm.current().this.clone();
            vm.current_mut().push(this);
        }
        EaPushGlobal => {
            let globals = Value::Object(vm.globals.clone());
            vm.current_mut().push(globals);
        }
        EaPushUndefined => vm.current_mut().push(Value::Undefined),
        EaPushNull => vm.current_mut().push(Value::Null),
        EaPushZero => vm.current_mut().push(Value::Integer(0)),
        EaPushOne => vm.current_mut().push(Value::Integer(1)),
        EaPushTrue => vm.current_mut().push(Value::Bool(true)),
        EaPushFalse => vm.current_mut().push(Value::Bool(false)),

        Add | Subtract | Multiply | Divide | Modulo | Add2 | BitwiseAnd | BitwiseOr
        | BitwiseXor | ShiftLeft | ShiftRight | ShiftRight2 | Not | And | Or | Equals
        | Equals2 | StrictEquals | Less | Less2 | Greater | StringEquals | StringConcat
        | ToInteger | ToNumber | ToString | TypeOf | Increment | Decrement => {
            do_pure(vm, op);
        }

        CastOp => {
            let ctx = vm.current_mut();
            let obj = ctx.pop();
            let ctor = ctx.pop();
            let result = match (&obj, ctor.as_object()) {
                (Value::Object(o), Some(c)) if object::is_instance_of(o, &c) => obj.clone(),
                _ => Value::Null,
            };
            vm.current_mut().push(result);
        }
        InstanceOf => {
            let ctx = vm.current_mut();
            let ctor = ctx.pop();
            let obj = ctx.pop();
            let result = match (obj.as_object(), ctor.as_object()) {
                (Some(o), Some(c)) => object::is_instance_of(&o, &c),
                _ => false,
            };
            vm.current_mut().push(Value::Bool(result));
        }

        GetVariable => {
            let name = vm.current_mut().pop().coerce_string();
            let value = vm.current().scope.lookup(&name).unwrap_or(Value::Undefined);
            vm.current_mut().push(value);
        }
        SetVariable => {
            let ctx = vm.current_mut();
            let value = ctx.pop();
            let name = ctx.pop().coerce_string();
            let scope = vm.current().scope.clone();
            if !scope.assign_existing(&name, value.clone()) {
                object::set_value(&vm.globals, &name, value);
            }
        }
        DefineLocal => {
            let ctx = vm.current_mut();
            let value = ctx.pop();
            let name = ctx.pop().coerce_string();
            let scope = ctx.scope.clone();
            scope.declare(&name, value);
        }
        Var => {
            let name = vm.current_mut().pop().coerce_string();
            let scope = vm.current().scope.clone();
            if scope.lookup(&name).is_none() {
                scope.declare(&name, Value::Undefined);
            }
        }
        Delete => {
            let ctx = vm.current_mut();
            let name = ctx.pop().coerce_string();
            let target = ctx.pop();
            let removed = match target.as_object() {
                Some(o) => object::delete_property(&o, &name),
                None => false,
            };
            vm.current_mut().push(Value::Bool(removed));
        }
        Delete2 => {
            let name = vm.current_mut().pop().coerce_string();
            let removed = delete_on_chain(vm, &name);
            vm.current_mut().push(Value::Bool(removed));
        }

        GetMember => do_get_member(vm)?,
        SetMember => do_set_member(vm)?,

        Enumerate => {
            let name = vm.current_mut().pop().coerce_string();
            let value = vm.current().scope.lookup(&name).unwrap_or(Value::Undefined);
            push_enumeration(vm, &value);
        }
        Enumerate2 => {
            let value = vm.current_mut().pop();
            push_enumeration(vm, &value);
        }

        BranchAlways => {
            let target = branch_target(instruction, op)?;
            vm.current_mut().jump_to(target)?;
        }
        BranchIfTrue => {
            let target = branch_target(instruction, op)?;
            let cond = vm.current_mut().pop();
            if cond.to_boolean() {
                vm.current_mut().jump_to(target)?;
            }
        }
        EaBranchIfFalse => {
            let target = branch_target(instruction, op)?;
            let cond = vm.current_mut().pop();
            if !cond.to_boolean() {
                vm.current_mut().jump_to(target)?;
            }
        }

        DefineFunction | DefineFunction2 => do_define_function(vm, position, instruction)?,

        Return => {
            let value = vm.current_mut().pop();
            vm.current_mut().do_return(value);
        }
        CallFunction => {
            let name = vm.current_mut().pop().coerce_string();
            let args = pop_args(vm);
            let function = vm.current().scope.lookup(&name).unwrap_or(Value::Undefined);
            let this = vm.current().this.clone();
            vm.call_value(&function, &this, &args, Recall::PushResult)?;
        }
        CallMethod => {
            let name = vm.current_mut().pop();
            let receiver = vm.current_mut().pop();
            let args = pop_args(vm);
            let method_name = name.coerce_string();
            // An undefined or empty name means the callee itself is on the
            // stack in the receiver slot.
            if matches!(name, Value::Undefined) || method_name.is_empty() {
                let this = Value::Object(vm.globals.clone());
                vm.call_value(&receiver, &this, &args, Recall::PushResult)?;
            } else {
                let method = member_value(&receiver, &method_name);
                vm.call_value(&method, &receiver, &args, Recall::PushResult)?;
            }
        }
        NewObject => {
            let name = vm.current_mut().pop().coerce_string();
            let args = pop_args(vm);
            let constructor = vm.current().scope.lookup(&name).unwrap_or(Value::Undefined);
            vm.construct(&constructor, &args)?;
        }
        NewMethod => {
            let name = vm.current_mut().pop();
            let receiver = vm.current_mut().pop();
            let args = pop_args(vm);
            let method_name = name.coerce_string();
            let constructor = if matches!(name, Value::Undefined) || method_name.is_empty() {
                receiver
            } else {
                member_value(&receiver, &method_name)
            };
            vm.construct(&constructor, &args)?;
        }
        InitArray => {
            let count = vm.current_mut().pop().to_integer().max(0) as usize;
            let elements = vm.current_mut().pop_n(count);
            let arr = handle(EsObject::array(elements));
            arr.borrow_mut().prototype = Some(vm.array_proto.clone());
            vm.current_mut().push(Value::Object(arr));
        }
        InitObject => {
            let count = vm.current_mut().pop().to_integer().max(0) as usize;
            let obj = handle(EsObject::plain());
            obj.borrow_mut().prototype = Some(vm.object_proto.clone());
            for _ in 0..count {
                let value = vm.current_mut().pop();
                let name = vm.current_mut().pop().coerce_string();
                obj.borrow_mut().put(name, value);
            }
            vm.current_mut().push(Value::Object(obj));
        }

        Trace => {
            let value = vm.current_mut().pop();
            let line = value.coerce_string();
            vm.trace_log.push(line);
        }
        GetTime => {
            let now = vm.clock_ms() as i32;
            vm.current_mut().push(Value::Integer(now));
        }
        RandomNumber => {
            let max = vm.current_mut().pop().to_integer();
            let n = if max > 0 { fastrand::i32(0..max) } else { 0 };
            vm.current_mut().push(Value::Integer(n));
        }
    }
    Ok(())
}

// ── Helpers ──

fn first_param<'a>(instruction: &'a RawInstruction, op: Opcode) -> VmResult<&'a RawValue> {
    instruction
        .params
        .first()
        .ok_or_else(|| bad_operands(op, "missing operand"))
}

fn branch_target(instruction: &RawInstruction, op: Opcode) -> VmResult<usize> {
    let target = first_param(instruction, op)?.as_index();
    if target < 0 {
        return Err(bad_operands(op, "negative jump target"));
    }
    Ok(target as usize)
}

fn bad_operands(op: Opcode, message: &str) -> VmError {
    VmError::BadOperands { opcode: op.to_string(), message: message.to_string() }
}

fn pop_args(vm: &mut VirtualMachine) -> Vec<Value> {
    let count = vm.current_mut().pop().to_integer().max(0) as usize;
    vm.current_mut().pop_n(count)
}

/// Data-property member read; accessors and misses read as undefined.
/// Full accessor handling lives in the GetMember path.
fn member_value(receiver: &Value, name: &str) -> Value {
    match receiver.as_object() {
        Some(o) => match object::get_value(&o, name) {
            Lookup::Value(v) => v,
            _ => Value::Undefined,
        },
        None => Value::Undefined,
    }
}

fn do_constant_pool(vm: &mut VirtualMachine, instruction: &RawInstruction) -> VmResult<()> {
    // First parameter is the entry count; the rest index the global pool.
    let indices = instruction.params.iter().skip(1);
    let mut constants = Vec::with_capacity(instruction.params.len().saturating_sub(1));
    for raw in indices {
        let index = raw.as_index();
        let entry = if index >= 0 { vm.pool.get(index as usize) } else { None };
        match entry {
            Some(value) => constants.push(value.clone()),
            None => {
                return Err(VmError::BadPoolIndex {
                    index: index.max(0) as u32,
                    len: vm.pool.len(),
                });
            }
        }
    }
    vm.current_mut().constants = constants;
    Ok(())
}

fn delete_on_chain(vm: &mut VirtualMachine, name: &str) -> bool {
    let mut scope = Some(vm.current().scope.clone());
    while let Some(s) = scope {
        if s.locals.borrow().has_own(name) {
            return object::delete_property(&s.locals, name);
        }
        scope = s.parent.clone();
    }
    false
}

fn do_get_member(vm: &mut VirtualMachine) -> VmResult<()> {
    let name = vm.current_mut().pop().coerce_string();
    let receiver = vm.current_mut().pop();
    // String primitives expose length without boxing.
    if let Value::Str(s) = &receiver {
        if name == "length" {
            vm.current_mut().push(Value::Integer(s.chars().count() as i32));
            return Ok(());
        }
    }
    match receiver.as_object() {
        Some(obj) => match object::get_value(&obj, &name) {
            Lookup::Value(v) => vm.current_mut().push(v),
            Lookup::Getter(getter) => {
                // Getter completion pushes for us, via the recall record.
                vm.call_value(&Value::Object(getter), &receiver, &[], Recall::PushResult)?;
            }
            Lookup::Missing => vm.current_mut().push(Value::Undefined),
        },
        None => vm.current_mut().push(Value::Undefined),
    }
    Ok(())
}

fn do_set_member(vm: &mut VirtualMachine) -> VmResult<()> {
    let value = vm.current_mut().pop();
    let name = vm.current_mut().pop().coerce_string();
    let receiver = vm.current_mut().pop();
    if let Some(obj) = receiver.as_object() {
        match object::set_value(&obj, &name, value.clone()) {
            StoreOutcome::Done => {}
            StoreOutcome::Setter(setter) => {
                vm.call_value(&Value::Object(setter), &receiver, &[value], Recall::DiscardResult)?;
            }
        }
    }
    Ok(())
}

/// Enumeration protocol: a null sentinel first, then one name per
/// enumerable property. Consumers pop names until they hit the sentinel.
fn push_enumeration(vm: &mut VirtualMachine, value: &Value) {
    vm.current_mut().push(Value::Null);
    if let Some(obj) = value.as_object() {
        let keys = obj.borrow().enumerable_keys();
        for key in keys {
            vm.current_mut().push(Value::Str(key));
        }
    }
}

fn do_define_function(
    vm: &mut VirtualMachine,
    position: usize,
    instruction: &RawInstruction,
) -> VmResult<()> {
    let op = instruction.opcode;
    let (name, parameters, register_params, num_registers, flags, body_end) =
        decode_function_params(instruction)?;

    // The body is the inline span between this instruction and body_end.
    let mut body = InstructionStream::new();
    {
        let ctx = vm.current_mut();
        while let Some((pos, _)) = ctx.stream.get(ctx.cursor) {
            if *pos >= body_end {
                break;
            }
            body.push(ctx.stream[ctx.cursor].clone());
            ctx.cursor += 1;
        }
    }
    if body.is_empty() && body_end <= position {
        return Err(bad_operands(op, "function body span is empty or inverted"));
    }

    let ctx = vm.current();
    let function = DefinedFunction {
        name: name.clone(),
        parameters,
        register_params,
        num_registers,
        flags,
        body: Rc::new(body),
        constants: ctx.constants.clone(),
        scope: ctx.scope.clone(),
    };
    let fn_obj = handle(EsObject::defined_function(function));
    fn_obj.borrow_mut().prototype = Some(vm.function_proto.clone());

    let proto = handle(EsObject::plain());
    proto.borrow_mut().prototype = Some(vm.object_proto.clone());
    proto.borrow_mut().put_hidden("constructor", Value::Object(fn_obj.clone()));
    fn_obj.borrow_mut().put_hidden("prototype", Value::Object(proto));

    let value = Value::Object(fn_obj);
    if name.is_empty() {
        // Anonymous function expressions land on the stack.
        vm.current_mut().push(value);
    } else {
        let scope = vm.current().scope.clone();
        scope.declare(&name, value);
    }
    Ok(())
}

pub(crate) type FunctionParams = (String, Vec<String>, Vec<(u8, String)>, usize, u16, usize);

/// DefineFunction: `(name, p1..pn, body_end)`.
/// DefineFunction2: `(name, num_registers, flags, body_end, (reg, name)*)`.
pub(crate) fn decode_function_params(instruction: &RawInstruction) -> VmResult<FunctionParams> {
    let op = instruction.opcode;
    let params = &instruction.params;
    let name = match params.first() {
        Some(RawValue::Str(s)) => s.clone(),
        _ => return Err(bad_operands(op, "missing function name")),
    };
    if op == Opcode::DefineFunction {
        if params.len() < 2 {
            return Err(bad_operands(op, "missing body span"));
        }
        let body_end = params[params.len() - 1].as_index();
        if body_end < 0 {
            return Err(bad_operands(op, "negative body span"));
        }
        let mut parameters = Vec::new();
        for raw in &params[1..params.len() - 1] {
            match raw {
                RawValue::Str(s) => parameters.push(s.clone()),
                other => {
                    return Err(bad_operands(
                        op,
                        &format!("parameter name expected, found {:?}", other),
                    ));
                }
            }
        }
        Ok((name, parameters, Vec::new(), 4, 0, body_end as usize))
    } else {
        if params.len() < 4 || (params.len() - 4) % 2 != 0 {
            return Err(bad_operands(op, "malformed DefineFunction2 header"));
        }
        let num_registers = params[1].as_index().max(0) as usize;
        let flags = params[2].as_index().max(0) as u16;
        let body_end = params[3].as_index();
        if body_end < 0 {
            return Err(bad_operands(op, "negative body span"));
        }
        let mut register_params = Vec::new();
        let mut pairs = params[4..].chunks_exact(2);
        for pair in &mut pairs {
            let register = pair[0].as_index();
            let pname = match &pair[1] {
                RawValue::Str(s) => s.clone(),
                other => {
                    return Err(bad_operands(
                        op,
                        &format!("parameter name expected, found {:?}", other),
                    ));
                }
            };
            if !(0..=255).contains(&register) {
                return Err(bad_operands(op, "parameter register out of range"));
            }
            register_params.push((register as u8, pname));
        }
        Ok((name, Vec::new(), register_params, num_registers, flags, body_end as usize))
    }
}

fn do_pure(vm: &mut VirtualMachine, op: Opcode) {
    let arity = match op.stack_arity() {
        crate::base::StackArity::Fixed(n) => n as usize,
        _ => unreachable!("pure opcodes have fixed arity"),
    };
    let mut args = vm.current_mut().pop_n(arity);
    args.reverse(); // operand order: first-pushed first
    let result = eval_static(op, &args)
        .unwrap_or_else(|| panic!("{} must evaluate statically", op));
    vm.current_mut().push(result);
}

/// Evaluate a side-effect-free opcode over plain values. Returns None for
/// anything that needs an execution context; the decompiler's constant
/// folder keys off that.
pub fn eval_static(op: Opcode, args: &[Value]) -> Option<Value> {
    use Opcode::*;

    let unary = |f: fn(&Value) -> Value| args.first().map(f);
    let binary = |f: &dyn Fn(&Value, &Value) -> Value| match args {
        [a, b] => Some(f(a, b)),
        _ => None,
    };
    let numeric = |f: fn(f64, f64) -> f64| {
        binary(&|a: &Value, b: &Value| Value::from(f(a.to_float(), b.to_float())))
    };
    let integer = |f: fn(i32, i32) -> i32| {
        binary(&|a: &Value, b: &Value| Value::Integer(f(a.to_integer(), b.to_integer())))
    };

    match op {
        Add | Add2 if matches!(args, [a, b]
            if matches!(a.to_primitive(PrimitiveHint::Number), Value::Str(_))
                || matches!(b.to_primitive(PrimitiveHint::Number), Value::Str(_))) =>
        {
            if op == Add {
                numeric(|a, b| a + b)
            } else {
                binary(&|a: &Value, b: &Value| {
                    Value::Str(format!("{}{}", a.coerce_string(), b.coerce_string()))
                })
            }
        }
        Add | Add2 => numeric(|a, b| a + b),
        Subtract => numeric(|a, b| a - b),
        Multiply => numeric(|a, b| a * b),
        Divide => numeric(|a, b| if b == 0.0 { f64::NAN } else { a / b }),
        Modulo => numeric(|a, b| a % b),
        Increment => unary(|v| Value::Integer(v.to_integer().wrapping_add(1))),
        Decrement => unary(|v| Value::Integer(v.to_integer().wrapping_sub(1))),

        BitwiseAnd => integer(|a, b| a & b),
        BitwiseOr => integer(|a, b| a | b),
        BitwiseXor => integer(|a, b| a ^ b),
        ShiftLeft => integer(|a, b| a << (b & 0b11111)),
        ShiftRight => integer(|a, b| a >> (b & 0b11111)),
        ShiftRight2 => integer(|a, b| ((a as u32) >> (b & 0b11111) as u32) as i32),

        Not => unary(|v| Value::Bool(!v.to_boolean())),
        And => binary(&|a: &Value, b: &Value| Value::Bool(a.to_boolean() && b.to_boolean())),
        Or => binary(&|a: &Value, b: &Value| Value::Bool(a.to_boolean() || b.to_boolean())),

        Equals => binary(&|a: &Value, b: &Value| Value::Bool(number_equals(a, b))),
        Equals2 => binary(&|a: &Value, b: &Value| Value::Bool(abstract_equals(a, b))),
        StrictEquals => binary(&|a: &Value, b: &Value| Value::Bool(strict_equals(a, b))),
        Less => numeric(|a, b| {
            if a.is_nan() || b.is_nan() {
                0.0
            } else if a < b {
                1.0
            } else {
                0.0
            }
        })
        .map(|v| Value::Bool(v.to_boolean())),
        Less2 => binary(&|a: &Value, b: &Value| abstract_less(a, b)),
        Greater => binary(&|a: &Value, b: &Value| abstract_less(b, a)),
        StringEquals => {
            binary(&|a: &Value, b: &Value| Value::Bool(a.coerce_string() == b.coerce_string()))
        }
        StringConcat => binary(&|a: &Value, b: &Value| {
            Value::Str(format!("{}{}", a.coerce_string(), b.coerce_string()))
        }),

        ToInteger => unary(|v| Value::Integer(v.to_integer())),
        ToNumber => unary(|v| Value::from(v.to_float())),
        ToString => unary(|v| Value::Str(v.coerce_string())),
        TypeOf => unary(|v| Value::Str(v.type_of().to_string())),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_arithmetic_folds() {
        let v = eval_static(Opcode::Add, &[Value::Integer(2), Value::Integer(3)]).unwrap();
        assert!(matches!(v, Value::Integer(5)));
        let v = eval_static(Opcode::Divide, &[Value::Integer(1), Value::Integer(0)]).unwrap();
        assert!(matches!(v, Value::Float(f) if f.is_nan()));
        let v = eval_static(Opcode::Subtract, &[Value::Integer(10), Value::Integer(3)]).unwrap();
        assert!(matches!(v, Value::Integer(7)));
    }

    #[test]
    fn add2_concatenates_when_either_side_is_string() {
        let v = eval_static(Opcode::Add2, &[Value::Str("a".into()), Value::Integer(1)]).unwrap();
        assert!(matches!(v, Value::Str(s) if s == "a1"));
        let v = eval_static(Opcode::Add2, &[Value::Integer(2), Value::Integer(3)]).unwrap();
        assert!(matches!(v, Value::Integer(5)));
    }

    #[test]
    fn shifts_mask_the_count() {
        let v = eval_static(Opcode::ShiftLeft, &[Value::Integer(1), Value::Integer(33)]).unwrap();
        assert!(matches!(v, Value::Integer(2)));
        let v =
            eval_static(Opcode::ShiftRight2, &[Value::Integer(-1), Value::Integer(28)]).unwrap();
        assert!(matches!(v, Value::Integer(15)));
    }

    #[test]
    fn comparison_and_logic() {
        let v = eval_static(Opcode::Less2, &[Value::Integer(1), Value::Integer(2)]).unwrap();
        assert!(matches!(v, Value::Bool(true)));
        let v = eval_static(Opcode::Greater, &[Value::Integer(1), Value::Integer(2)]).unwrap();
        assert!(matches!(v, Value::Bool(false)));
        let v = eval_static(Opcode::Less2, &[Value::Float(f64::NAN), Value::Integer(2)]).unwrap();
        assert!(matches!(v, Value::Undefined));
        let v = eval_static(Opcode::Not, &[Value::Str(String::new())]).unwrap();
        assert!(matches!(v, Value::Bool(true)));
    }

    #[test]
    fn context_dependent_ops_are_not_static() {
        assert!(eval_static(Opcode::GetVariable, &[Value::Str("x".into())]).is_none());
        assert!(eval_static(Opcode::CallFunction, &[]).is_none());
        assert!(eval_static(Opcode::RandomNumber, &[Value::Integer(10)]).is_none());
    }
}
