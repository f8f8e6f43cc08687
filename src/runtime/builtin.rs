//! Contents of the global object: prototype wiring, core constructors and
//! the host functions bytecode expects to find.

use super::object::{handle, EsObject, NativeFn, ObjHandle};
use super::vm::VirtualMachine;
use super::Value;

pub fn install(vm: &mut VirtualMachine) {
    vm.function_proto.borrow_mut().prototype = Some(vm.object_proto.clone());
    vm.array_proto.borrow_mut().prototype = Some(vm.object_proto.clone());

    // Object.prototype
    register(&vm.object_proto, "hasOwnProperty", has_own_property);
    register(&vm.object_proto, "toString", object_to_string);
    register(&vm.object_proto, "addProperty", add_property);

    // Array.prototype
    register(&vm.array_proto, "push", array_push);
    register(&vm.array_proto, "pop", array_pop);
    register(&vm.array_proto, "join", array_join);
    register(&vm.array_proto, "toString", object_to_string);

    let globals = vm.globals.clone();
    {
        let mut g = globals.borrow_mut();

        g.put_hidden("Object", constructor(object_construct, &vm.object_proto));
        g.put_hidden("Function", constructor(noop_construct, &vm.function_proto));
        g.put_hidden("Array", constructor(array_construct, &vm.array_proto));
        g.put_hidden("String", Value::object(EsObject::native_function(string_convert)));
        g.put_hidden("Number", Value::object(EsObject::native_function(number_convert)));
        g.put_hidden("Boolean", Value::object(EsObject::native_function(boolean_convert)));

        g.put_hidden("trace", Value::object(EsObject::native_function(trace)));
        g.put_hidden("parseInt", Value::object(EsObject::native_function(parse_int)));
        g.put_hidden("parseFloat", Value::object(EsObject::native_function(parse_float)));
        g.put_hidden("isNaN", Value::object(EsObject::native_function(is_nan)));
        g.put_hidden("getTimer", Value::object(EsObject::native_function(get_timer)));
        g.put_hidden("setInterval", Value::object(EsObject::native_function(set_interval)));
        g.put_hidden("clearInterval", Value::object(EsObject::native_function(clear_interval)));

        g.put_hidden("NaN", Value::Float(f64::NAN));
        g.put_hidden("Infinity", Value::Float(f64::INFINITY));
        g.put_hidden("undefined", Value::Undefined);
    }
    globals.borrow_mut().put_hidden("Math", math_object());
    globals.borrow_mut().put_hidden("_global", Value::Object(globals.clone()));
}

/// A thrown TypeError value for runtime misuse (calling a non-function,
/// constructing a non-constructor).
pub fn type_error(vm: &VirtualMachine, message: &str) -> Value {
    let error = handle(EsObject::with_class("TypeError"));
    error.borrow_mut().prototype = Some(vm.object_proto.clone());
    error.borrow_mut().put("name", Value::from("TypeError"));
    error.borrow_mut().put("message", Value::from(message));
    Value::Object(error)
}

fn register(target: &ObjHandle, name: &str, f: NativeFn) {
    target.borrow_mut().put_hidden(name, Value::object(EsObject::native_function(f)));
}

fn constructor(f: NativeFn, prototype: &ObjHandle) -> Value {
    let ctor = handle(EsObject::native_function(f));
    ctor.borrow_mut().put_hidden("prototype", Value::Object(prototype.clone()));
    prototype.borrow_mut().put_hidden("constructor", Value::Object(ctor.clone()));
    Value::Object(ctor)
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

// ── Core constructors ──

fn noop_construct(_vm: &mut VirtualMachine, _this: &Value, _args: &[Value]) -> Result<Value, Value> {
    Ok(Value::Undefined)
}

fn object_construct(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    match args.first() {
        Some(Value::Object(o)) => Ok(Value::Object(o.clone())),
        _ => Ok(Value::Undefined),
    }
}

fn array_construct(vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let elements = match args {
        [single] if single.is_numeric() => {
            vec![Value::Undefined; single.to_integer().max(0) as usize]
        }
        _ => args.to_vec(),
    };
    let arr = handle(EsObject::array(elements));
    arr.borrow_mut().prototype = Some(vm.array_proto.clone());
    Ok(Value::Object(arr))
}

fn string_convert(_vm: &mut VirtualMachine, this: &Value, args: &[Value]) -> Result<Value, Value> {
    let value = Value::Str(arg(args, 0).coerce_string());
    box_if_constructing(this, &value);
    Ok(value)
}

fn number_convert(_vm: &mut VirtualMachine, this: &Value, args: &[Value]) -> Result<Value, Value> {
    let value = Value::Float(arg(args, 0).to_float());
    box_if_constructing(this, &value);
    Ok(value)
}

fn boolean_convert(_vm: &mut VirtualMachine, this: &Value, args: &[Value]) -> Result<Value, Value> {
    let value = Value::Bool(arg(args, 0).to_boolean());
    box_if_constructing(this, &value);
    Ok(value)
}

// `new String(x)` boxes the primitive into the waiting instance.
fn box_if_constructing(this: &Value, value: &Value) {
    if let Value::Object(o) = this {
        o.borrow_mut().primitive = Some(value.clone());
    }
}

// ── Object.prototype ──

fn has_own_property(_vm: &mut VirtualMachine, this: &Value, args: &[Value]) -> Result<Value, Value> {
    let name = arg(args, 0).coerce_string();
    let owned = this
        .as_object()
        .map(|o| o.borrow().has_own(&name))
        .unwrap_or(false);
    Ok(Value::Bool(owned))
}

fn object_to_string(_vm: &mut VirtualMachine, this: &Value, _args: &[Value]) -> Result<Value, Value> {
    Ok(Value::Str(this.coerce_string()))
}

fn add_property(_vm: &mut VirtualMachine, this: &Value, args: &[Value]) -> Result<Value, Value> {
    let obj = match this.as_object() {
        Some(o) => o,
        None => return Ok(Value::Bool(false)),
    };
    let name = arg(args, 0).coerce_string();
    let getter = arg(args, 1).as_object().filter(|o| o.borrow().callable.is_some());
    let setter = arg(args, 2).as_object().filter(|o| o.borrow().callable.is_some());
    if name.is_empty() || getter.is_none() && setter.is_none() {
        return Ok(Value::Bool(false));
    }
    obj.borrow_mut().define_accessor(name, getter, setter);
    Ok(Value::Bool(true))
}

// ── Array.prototype ──

fn array_push(_vm: &mut VirtualMachine, this: &Value, args: &[Value]) -> Result<Value, Value> {
    if let Some(o) = this.as_object() {
        let mut borrowed = o.borrow_mut();
        if let Some(elements) = borrowed.elements.as_mut() {
            elements.extend(args.iter().cloned());
            return Ok(Value::Integer(elements.len() as i32));
        }
    }
    Ok(Value::Undefined)
}

fn array_pop(_vm: &mut VirtualMachine, this: &Value, _args: &[Value]) -> Result<Value, Value> {
    if let Some(o) = this.as_object() {
        let mut borrowed = o.borrow_mut();
        if let Some(elements) = borrowed.elements.as_mut() {
            return Ok(elements.pop().unwrap_or(Value::Undefined));
        }
    }
    Ok(Value::Undefined)
}

fn array_join(_vm: &mut VirtualMachine, this: &Value, args: &[Value]) -> Result<Value, Value> {
    let separator = match args.first() {
        Some(v) => v.coerce_string(),
        None => ",".to_string(),
    };
    if let Some(o) = this.as_object() {
        if let Some(elements) = &o.borrow().elements {
            let joined = elements
                .iter()
                .map(|v| v.coerce_string())
                .collect::<Vec<_>>()
                .join(&separator);
            return Ok(Value::Str(joined));
        }
    }
    Ok(Value::Undefined)
}

// ── Host functions ──

fn trace(vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let line = args
        .iter()
        .map(|v| v.coerce_string())
        .collect::<Vec<_>>()
        .join(" ");
    vm.trace_log.push(line);
    Ok(Value::Undefined)
}

fn parse_int(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let text = arg(args, 0).coerce_string();
    let mut s = text.trim();
    let mut sign = 1i64;
    if let Some(rest) = s.strip_prefix('-') {
        sign = -1;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    let mut radix = match args.get(1).map(|r| r.to_integer()) {
        Some(r) if (2..=36).contains(&r) => r as u32,
        _ => 10,
    };
    if radix == 16 || args.get(1).is_none() {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            s = rest;
            radix = 16;
        }
    }
    let digits: String = s
        .chars()
        .take_while(|c| c.to_digit(radix).is_some())
        .collect();
    if digits.is_empty() {
        return Ok(Value::Float(f64::NAN));
    }
    match i64::from_str_radix(&digits, radix) {
        Ok(n) => Ok(Value::from((sign * n) as f64)),
        Err(_) => Ok(Value::Float(f64::NAN)),
    }
}

fn parse_float(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let text = arg(args, 0).coerce_string();
    let s = text.trim();
    // Longest leading prefix that still parses as a float.
    let mut end = 0;
    for i in (1..=s.len()).rev() {
        if s.is_char_boundary(i) && s[..i].parse::<f64>().is_ok() {
            end = i;
            break;
        }
    }
    if end == 0 {
        Ok(Value::Float(f64::NAN))
    } else {
        Ok(Value::Float(s[..end].parse::<f64>().unwrap_or(f64::NAN)))
    }
}

fn is_nan(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::Bool(arg(args, 0).to_float().is_nan()))
}

fn get_timer(vm: &mut VirtualMachine, _this: &Value, _args: &[Value]) -> Result<Value, Value> {
    Ok(Value::Integer(vm.clock_ms() as i32))
}

fn set_interval(vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let function = arg(args, 0);
    if function.as_object().map(|o| o.borrow().callable.is_none()).unwrap_or(true) {
        return Err(type_error(vm, "setInterval requires a function"));
    }
    let delay = arg(args, 1).to_integer().max(0) as u64;
    let rest: Vec<Value> = args.iter().skip(2).cloned().collect();
    let id = vm.add_interval(function, delay, Value::Undefined, rest);
    Ok(Value::Integer(id as i32))
}

fn clear_interval(vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let id = arg(args, 0).to_integer();
    vm.clear_interval(&id.to_string());
    Ok(Value::Undefined)
}

// ── Math ──

fn math_object() -> Value {
    let math = handle(EsObject::with_class("Math"));
    {
        let mut m = math.borrow_mut();
        m.put_hidden("PI", Value::Float(std::f64::consts::PI));
        m.put_hidden("E", Value::Float(std::f64::consts::E));
    }
    register(&math, "abs", math_abs);
    register(&math, "floor", math_floor);
    register(&math, "ceil", math_ceil);
    register(&math, "round", math_round);
    register(&math, "sqrt", math_sqrt);
    register(&math, "pow", math_pow);
    register(&math, "max", math_max);
    register(&math, "min", math_min);
    register(&math, "random", math_random);
    Value::Object(math)
}

fn math_abs(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::from(arg(args, 0).to_float().abs()))
}

fn math_floor(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::from(arg(args, 0).to_float().floor()))
}

fn math_ceil(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::from(arg(args, 0).to_float().ceil()))
}

fn math_round(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::from(arg(args, 0).to_float().round()))
}

fn math_sqrt(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::from(arg(args, 0).to_float().sqrt()))
}

fn math_pow(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::from(arg(args, 0).to_float().powf(arg(args, 1).to_float())))
}

fn math_max(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let m = args.iter().map(|v| v.to_float()).fold(f64::NEG_INFINITY, f64::max);
    Ok(Value::from(m))
}

fn math_min(_vm: &mut VirtualMachine, _this: &Value, args: &[Value]) -> Result<Value, Value> {
    let m = args.iter().map(|v| v.to_float()).fold(f64::INFINITY, f64::min);
    Ok(Value::from(m))
}

fn math_random(_vm: &mut VirtualMachine, _this: &Value, _args: &[Value]) -> Result<Value, Value> {
    Ok(Value::Float(fastrand::f64()))
}
