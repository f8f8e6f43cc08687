use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::base::InstructionStream;
use super::context::Scope;
use super::vm::VirtualMachine;
use super::{PrimitiveHint, Value};

pub type ObjHandle = Rc<RefCell<EsObject>>;

pub fn handle(obj: EsObject) -> ObjHandle {
    Rc::new(RefCell::new(obj))
}

/// A native builtin. Returns the call result, or a thrown value.
pub type NativeFn = fn(&mut VirtualMachine, &Value, &[Value]) -> Result<Value, Value>;

#[derive(Clone)]
pub enum Callable {
    Native(NativeFn),
    Defined(Rc<DefinedFunction>),
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callable::Native(_) => write!(f, "Native"),
            Callable::Defined(d) => write!(f, "Defined({})", d.name),
        }
    }
}

// DefineFunction2 preload/suppress flag bits, SWF bit order.
pub const PRELOAD_THIS: u16 = 0x0001;
pub const SUPPRESS_THIS: u16 = 0x0002;
pub const PRELOAD_ARGUMENTS: u16 = 0x0004;
pub const SUPPRESS_ARGUMENTS: u16 = 0x0008;
pub const PRELOAD_SUPER: u16 = 0x0010;
pub const PRELOAD_ROOT: u16 = 0x0040;
pub const PRELOAD_PARENT: u16 = 0x0080;
pub const PRELOAD_GLOBAL: u16 = 0x0100;

/// A function defined in bytecode, with its captured lexical scope.
#[derive(Debug)]
pub struct DefinedFunction {
    pub name: String,
    /// Plainly named parameters, bound into the activation object.
    pub parameters: Vec<String>,
    /// `DefineFunction2` parameters bound straight into registers.
    pub register_params: Vec<(u8, String)>,
    pub num_registers: usize,
    pub flags: u16,
    pub body: Rc<InstructionStream>,
    pub constants: Vec<Value>,
    pub scope: Rc<Scope>,
}

#[derive(Debug, Clone)]
pub enum Property {
    Data { value: Value, enumerable: bool, writable: bool },
    Accessor { getter: Option<ObjHandle>, setter: Option<ObjHandle> },
}

/// Result of a property read: plain value, a getter still to be invoked,
/// or nothing.
#[derive(Debug, Clone)]
pub enum Lookup {
    Value(Value),
    Getter(ObjHandle),
    Missing,
}

/// Result of a property write that must go through a setter.
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    Done,
    Setter(ObjHandle),
}

#[derive(Debug)]
pub struct EsObject {
    pub class: &'static str,
    pub properties: BTreeMap<String, Property>,
    pub prototype: Option<ObjHandle>,
    pub callable: Option<Callable>,
    /// Dense element storage; present only for arrays.
    pub elements: Option<Vec<Value>>,
    /// Wrapped primitive for boxed Number/String/Boolean objects.
    pub primitive: Option<Value>,
}

impl EsObject {
    pub fn plain() -> EsObject {
        EsObject::with_class("Object")
    }

    pub fn with_class(class: &'static str) -> EsObject {
        EsObject {
            class,
            properties: BTreeMap::new(),
            prototype: None,
            callable: None,
            elements: None,
            primitive: None,
        }
    }

    pub fn array(elements: Vec<Value>) -> EsObject {
        let mut obj = EsObject::with_class("Array");
        obj.elements = Some(elements);
        obj
    }

    pub fn native_function(f: NativeFn) -> EsObject {
        let mut obj = EsObject::with_class("Function");
        obj.callable = Some(Callable::Native(f));
        obj
    }

    pub fn defined_function(f: DefinedFunction) -> EsObject {
        let mut obj = EsObject::with_class("Function");
        obj.callable = Some(Callable::Defined(Rc::new(f)));
        obj
    }

    pub fn boxed(class: &'static str, primitive: Value) -> EsObject {
        let mut obj = EsObject::with_class(class);
        obj.primitive = Some(primitive);
        obj
    }

    pub fn is_array(&self) -> bool {
        self.elements.is_some()
    }

    pub fn put(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(
            name.into(),
            Property::Data { value, enumerable: true, writable: true },
        );
    }

    /// Non-enumerable data property (builtins, prototype links).
    pub fn put_hidden(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(
            name.into(),
            Property::Data { value, enumerable: false, writable: true },
        );
    }

    pub fn define_accessor(
        &mut self,
        name: impl Into<String>,
        getter: Option<ObjHandle>,
        setter: Option<ObjHandle>,
    ) {
        self.properties.insert(name.into(), Property::Accessor { getter, setter });
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.properties.contains_key(name)
            || (self.is_array() && (name == "length" || array_index(self, name).is_some()))
    }

    /// Own enumerable property names, array indices first.
    pub fn enumerable_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(elements) = &self.elements {
            for i in 0..elements.len() {
                keys.push(i.to_string());
            }
        }
        for (name, prop) in &self.properties {
            match prop {
                Property::Data { enumerable: false, .. } => {}
                _ => keys.push(name.clone()),
            }
        }
        keys
    }
}

fn array_index(obj: &EsObject, name: &str) -> Option<usize> {
    if !obj.is_array() {
        return None;
    }
    name.parse::<usize>().ok()
}

/// Read a property, walking the prototype chain. Accessor hits are
/// reported, not invoked; only the VM may run a getter.
pub fn get_value(obj: &ObjHandle, name: &str) -> Lookup {
    let mut current = obj.clone();
    loop {
        {
            let borrowed = current.borrow();
            if let Some(elements) = &borrowed.elements {
                if name == "length" {
                    return Lookup::Value(Value::Integer(elements.len() as i32));
                }
                if let Some(i) = array_index(&borrowed, name) {
                    return Lookup::Value(
                        elements.get(i).cloned().unwrap_or(Value::Undefined),
                    );
                }
            }
            match borrowed.properties.get(name) {
                Some(Property::Data { value, .. }) => return Lookup::Value(value.clone()),
                Some(Property::Accessor { getter, .. }) => {
                    return match getter {
                        Some(g) => Lookup::Getter(g.clone()),
                        None => Lookup::Value(Value::Undefined),
                    };
                }
                None => {}
            }
        }
        let next = current.borrow().prototype.clone();
        match next {
            Some(proto) => current = proto,
            None => return Lookup::Missing,
        }
    }
}

/// Write an own property. Accessor writes are reported back for the VM to
/// invoke the setter; a missing setter swallows the write.
pub fn set_value(obj: &ObjHandle, name: &str, value: Value) -> StoreOutcome {
    // Accessors shadow data writes anywhere on the prototype chain.
    let mut current = obj.clone();
    loop {
        {
            let borrowed = current.borrow();
            if let Some(Property::Accessor { setter, .. }) = borrowed.properties.get(name) {
                return match setter {
                    Some(s) => StoreOutcome::Setter(s.clone()),
                    None => StoreOutcome::Done,
                };
            }
        }
        let next = current.borrow().prototype.clone();
        match next {
            Some(proto) => current = proto,
            None => break,
        }
    }

    let mut borrowed = obj.borrow_mut();
    if borrowed.is_array() {
        if name == "length" {
            let len = value.to_integer().max(0) as usize;
            if let Some(elements) = borrowed.elements.as_mut() {
                elements.resize(len, Value::Undefined);
            }
            return StoreOutcome::Done;
        }
        if let Some(i) = array_index(&borrowed, name) {
            if let Some(elements) = borrowed.elements.as_mut() {
                if i >= elements.len() {
                    elements.resize(i + 1, Value::Undefined);
                }
                elements[i] = value;
            }
            return StoreOutcome::Done;
        }
    }
    match borrowed.properties.get_mut(name) {
        Some(Property::Data { value: slot, writable, .. }) => {
            if *writable {
                *slot = value;
            }
        }
        Some(Property::Accessor { .. }) => {}
        None => {
            borrowed.put(name, value);
        }
    }
    StoreOutcome::Done
}

pub fn delete_property(obj: &ObjHandle, name: &str) -> bool {
    let mut borrowed = obj.borrow_mut();
    if let Some(i) = array_index(&borrowed, name) {
        if let Some(elements) = borrowed.elements.as_mut() {
            if i < elements.len() {
                elements[i] = Value::Undefined;
                return true;
            }
        }
        return false;
    }
    borrowed.properties.remove(name).is_some()
}

/// `instanceof`: walk the object's prototype chain looking for the
/// constructor's `prototype` object.
pub fn is_instance_of(obj: &ObjHandle, constructor: &ObjHandle) -> bool {
    let target = match get_value(constructor, "prototype") {
        Lookup::Value(Value::Object(p)) => p,
        _ => return false,
    };
    let mut current = obj.borrow().prototype.clone();
    while let Some(proto) = current {
        if Rc::ptr_eq(&proto, &target) {
            return true;
        }
        current = proto.borrow().prototype.clone();
    }
    false
}

/// DefaultValue without running user code: the boxed primitive when one
/// exists, else a string form. The hint only matters once valueOf/toString
/// overrides exist, which bytecode-defined objects here never install.
pub fn default_value(obj: &ObjHandle, _hint: PrimitiveHint) -> Value {
    if let Some(primitive) = &obj.borrow().primitive {
        return primitive.clone();
    }
    Value::Str(default_string(obj))
}

pub fn default_string(obj: &ObjHandle) -> String {
    let borrowed = obj.borrow();
    if let Some(primitive) = &borrowed.primitive {
        return primitive.coerce_string();
    }
    if let Some(elements) = &borrowed.elements {
        return elements
            .iter()
            .map(|v| v.coerce_string())
            .collect::<Vec<_>>()
            .join(",");
    }
    if borrowed.callable.is_some() {
        return "[type Function]".to_string();
    }
    "[object Object]".to_string()
}
