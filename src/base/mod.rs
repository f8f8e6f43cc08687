pub mod listing;

use serde::{Deserialize, Serialize};

/// The closed set of opcodes the engine understands.
///
/// Numeric codes follow the SWF action encoding where one exists; the
/// `Ea*` variants cover the vendor extensions found in Apt bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    End,
    ConstantPool,
    Push,
    PushDuplicate,
    Pop,
    StackSwap,
    SetRegister,

    EaPushThis,
    EaPushGlobal,
    EaPushUndefined,
    EaPushNull,
    EaPushZero,
    EaPushOne,
    EaPushTrue,
    EaPushFalse,

    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Add2,
    Increment,
    Decrement,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftLeft,
    ShiftRight,
    ShiftRight2,

    Not,
    And,
    Or,

    Equals,
    Equals2,
    StrictEquals,
    Less,
    Less2,
    Greater,
    StringEquals,
    StringConcat,

    ToInteger,
    ToNumber,
    ToString,
    TypeOf,
    CastOp,
    InstanceOf,

    GetVariable,
    SetVariable,
    DefineLocal,
    Var,
    Delete,
    Delete2,
    GetMember,
    SetMember,
    Enumerate,
    Enumerate2,

    BranchAlways,
    BranchIfTrue,
    EaBranchIfFalse,

    DefineFunction,
    DefineFunction2,
    Return,
    CallFunction,
    CallMethod,
    NewObject,
    NewMethod,
    InitArray,
    InitObject,

    Trace,
    GetTime,
    RandomNumber,
}

impl Opcode {
    pub const ALL: &[Opcode] = &[
        Opcode::End,
        Opcode::ConstantPool,
        Opcode::Push,
        Opcode::PushDuplicate,
        Opcode::Pop,
        Opcode::StackSwap,
        Opcode::SetRegister,
        Opcode::EaPushThis,
        Opcode::EaPushGlobal,
        Opcode::EaPushUndefined,
        Opcode::EaPushNull,
        Opcode::EaPushZero,
        Opcode::EaPushOne,
        Opcode::EaPushTrue,
        Opcode::EaPushFalse,
        Opcode::Add,
        Opcode::Subtract,
        Opcode::Multiply,
        Opcode::Divide,
        Opcode::Modulo,
        Opcode::Add2,
        Opcode::Increment,
        Opcode::Decrement,
        Opcode::BitwiseAnd,
        Opcode::BitwiseOr,
        Opcode::BitwiseXor,
        Opcode::ShiftLeft,
        Opcode::ShiftRight,
        Opcode::ShiftRight2,
        Opcode::Not,
        Opcode::And,
        Opcode::Or,
        Opcode::Equals,
        Opcode::Equals2,
        Opcode::StrictEquals,
        Opcode::Less,
        Opcode::Less2,
        Opcode::Greater,
        Opcode::StringEquals,
        Opcode::StringConcat,
        Opcode::ToInteger,
        Opcode::ToNumber,
        Opcode::ToString,
        Opcode::TypeOf,
        Opcode::CastOp,
        Opcode::InstanceOf,
        Opcode::GetVariable,
        Opcode::SetVariable,
        Opcode::DefineLocal,
        Opcode::Var,
        Opcode::Delete,
        Opcode::Delete2,
        Opcode::GetMember,
        Opcode::SetMember,
        Opcode::Enumerate,
        Opcode::Enumerate2,
        Opcode::BranchAlways,
        Opcode::BranchIfTrue,
        Opcode::EaBranchIfFalse,
        Opcode::DefineFunction,
        Opcode::DefineFunction2,
        Opcode::Return,
        Opcode::CallFunction,
        Opcode::CallMethod,
        Opcode::NewObject,
        Opcode::NewMethod,
        Opcode::InitArray,
        Opcode::InitObject,
        Opcode::Trace,
        Opcode::GetTime,
        Opcode::RandomNumber,
    ];

    pub fn from_name(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| format!("{:?}", op) == name)
    }

    pub fn code(self) -> u8 {
        use Opcode::*;
        match self {
            End => 0x00,
            Add => 0x0A,
            Subtract => 0x0B,
            Multiply => 0x0C,
            Divide => 0x0D,
            Equals => 0x0E,
            Less => 0x0F,
            And => 0x10,
            Or => 0x11,
            Not => 0x12,
            StringEquals => 0x13,
            Pop => 0x17,
            ToInteger => 0x18,
            GetVariable => 0x1C,
            SetVariable => 0x1D,
            StringConcat => 0x21,
            Trace => 0x26,
            CastOp => 0x2B,
            RandomNumber => 0x30,
            GetTime => 0x34,
            Delete => 0x3A,
            Delete2 => 0x3B,
            DefineLocal => 0x3C,
            CallFunction => 0x3D,
            Return => 0x3E,
            Modulo => 0x3F,
            NewObject => 0x40,
            Var => 0x41,
            InitArray => 0x42,
            InitObject => 0x43,
            TypeOf => 0x44,
            Enumerate => 0x46,
            Add2 => 0x47,
            Less2 => 0x48,
            Equals2 => 0x49,
            ToNumber => 0x4A,
            ToString => 0x4B,
            PushDuplicate => 0x4C,
            StackSwap => 0x4D,
            GetMember => 0x4E,
            SetMember => 0x4F,
            Increment => 0x50,
            Decrement => 0x51,
            CallMethod => 0x52,
            NewMethod => 0x53,
            InstanceOf => 0x54,
            Enumerate2 => 0x55,
            BitwiseAnd => 0x60,
            BitwiseOr => 0x61,
            BitwiseXor => 0x62,
            ShiftLeft => 0x63,
            ShiftRight => 0x64,
            ShiftRight2 => 0x65,
            StrictEquals => 0x66,
            Greater => 0x67,
            SetRegister => 0x87,
            ConstantPool => 0x88,
            DefineFunction2 => 0x8E,
            Push => 0x96,
            BranchAlways => 0x99,
            DefineFunction => 0x9B,
            BranchIfTrue => 0x9D,
            EaBranchIfFalse => 0xA1,
            EaPushThis => 0xA2,
            EaPushGlobal => 0xA3,
            EaPushUndefined => 0xA4,
            EaPushNull => 0xA5,
            EaPushZero => 0xA6,
            EaPushOne => 0xA7,
            EaPushTrue => 0xA8,
            EaPushFalse => 0xA9,
        }
    }

    pub fn is_end(self) -> bool {
        self == Opcode::End
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::BranchAlways | Opcode::BranchIfTrue | Opcode::EaBranchIfFalse
        )
    }

    pub fn is_branch_always(self) -> bool {
        self == Opcode::BranchAlways
    }

    pub fn is_conditional_branch(self) -> bool {
        self.is_branch() && !self.is_branch_always()
    }

    pub fn is_enumerate(self) -> bool {
        matches!(self, Opcode::Enumerate | Opcode::Enumerate2)
    }

    pub fn is_define_function(self) -> bool {
        matches!(self, Opcode::DefineFunction | Opcode::DefineFunction2)
    }

    /// How the opcode consumes the operand stack. Shared between the VM
    /// (arity checking) and the decompiler (stack replay).
    pub fn stack_arity(self) -> StackArity {
        use Opcode::*;
        match self {
            End | ConstantPool | Push | StackSwap | BranchAlways | GetTime | EaPushThis
            | EaPushGlobal | EaPushUndefined | EaPushNull | EaPushZero | EaPushOne
            | EaPushTrue | EaPushFalse | DefineFunction | DefineFunction2 => StackArity::Fixed(0),

            Pop | PushDuplicate | SetRegister | Not | Increment | Decrement | ToInteger
            | ToNumber | ToString | TypeOf | GetVariable | DefineLocal | Var | Delete2
            | Enumerate | Enumerate2 | BranchIfTrue | EaBranchIfFalse | Trace | Return
            | RandomNumber => StackArity::Fixed(1),

            Add | Subtract | Multiply | Divide | Modulo | Add2 | BitwiseAnd | BitwiseOr
            | BitwiseXor | ShiftLeft | ShiftRight | ShiftRight2 | And | Or | Equals
            | Equals2 | StrictEquals | Less | Less2 | Greater | StringEquals
            | StringConcat | CastOp | InstanceOf | SetVariable | GetMember | Delete => {
                StackArity::Fixed(2)
            }

            SetMember => StackArity::Fixed(3),

            InitArray => StackArity::CountPrefixed,
            InitObject => StackArity::CountPairs,
            CallFunction | NewObject => StackArity::NamedCall,
            CallMethod | NewMethod => StackArity::MethodCall,
        }
    }

    /// True for opcodes that read their operand without removing it.
    pub fn peeks_operand(self) -> bool {
        matches!(self, Opcode::SetRegister | Opcode::PushDuplicate)
    }

    /// True when executing the opcode leaves a result on the stack.
    pub fn pushes_result(self) -> bool {
        use Opcode::*;
        !matches!(
            self,
            End | ConstantPool | Pop | StackSwap | SetVariable | SetMember | DefineLocal
                | Var | Trace | Return | BranchAlways | BranchIfTrue | EaBranchIfFalse
                | SetRegister
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Stack consumption shape of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackArity {
    /// Pops exactly this many values.
    Fixed(u8),
    /// Pops a count, then that many values (array construction).
    CountPrefixed,
    /// Pops a count, then that many name/value pairs (object construction).
    CountPairs,
    /// Pops a name, an argument count, then the arguments.
    NamedCall,
    /// Pops a name, a receiver, an argument count, then the arguments.
    MethodCall,
}

// ── Raw values ──

/// An undecoded instruction operand. `Constant` and `Register` are deferred
/// references, resolved against a constant pool or register file only when
/// an execution context exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Str(String),
    Boolean(bool),
    Integer(i32),
    Float(f64),
    Constant(u32),
    Register(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("cannot reinterpret {found} as a register reference")]
    NotARegister { found: String },
    #[error("cannot reinterpret {found} as a constant reference")]
    NotAConstant { found: String },
}

impl RawValue {
    pub fn from_unsigned(v: u32) -> RawValue {
        // Values above the 28-bit range were stored as floats upstream.
        if v > 0x0FFF_FFFF {
            RawValue::Float(v as f64)
        } else {
            RawValue::Integer(v as i32)
        }
    }

    /// Reinterpret an index-bearing value as a register reference.
    /// Only Integer, Constant and Register share an index payload.
    pub fn to_register(&self) -> Result<RawValue, ConvertError> {
        match self {
            RawValue::Integer(i) => Ok(RawValue::Register(*i as u32)),
            RawValue::Constant(i) | RawValue::Register(i) => Ok(RawValue::Register(*i)),
            other => Err(ConvertError::NotARegister { found: format!("{:?}", other) }),
        }
    }

    /// Reinterpret an index-bearing value as a constant-pool reference.
    pub fn to_constant(&self) -> Result<RawValue, ConvertError> {
        match self {
            RawValue::Integer(i) => Ok(RawValue::Constant(*i as u32)),
            RawValue::Constant(i) | RawValue::Register(i) => Ok(RawValue::Constant(*i)),
            other => Err(ConvertError::NotAConstant { found: format!("{:?}", other) }),
        }
    }

    /// Raw integer view used where an operand is known to be an index or
    /// jump target. Floats truncate; non-numeric payloads read as 0.
    pub fn as_index(&self) -> i64 {
        match self {
            RawValue::Integer(i) => *i as i64,
            RawValue::Float(f) => *f as i64,
            RawValue::Constant(i) | RawValue::Register(i) => *i as i64,
            RawValue::Boolean(b) => *b as i64,
            RawValue::Str(_) => 0,
        }
    }
}

// ── Raw instructions ──

/// One decoded instruction: an opcode plus its immediate operands.
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInstruction {
    pub opcode: Opcode,
    pub params: Vec<RawValue>,
}

impl RawInstruction {
    pub fn new(opcode: Opcode, params: Vec<RawValue>) -> RawInstruction {
        RawInstruction { opcode, params }
    }

    pub fn end() -> RawInstruction {
        RawInstruction::new(Opcode::End, Vec::new())
    }

    /// The absolute jump target of a branch instruction.
    pub fn branch_target(&self) -> Option<usize> {
        if self.opcode.is_branch() {
            self.params.first().map(|p| p.as_index().max(0) as usize)
        } else {
            None
        }
    }
}

/// An instruction stream: `(position, instruction)` pairs, position-sorted.
/// Positions are opaque addresses; branch operands refer to them absolutely.
pub type InstructionStream = Vec<(usize, RawInstruction)>;

/// One entry of an external constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolEntry {
    Str(String),
    Number(f64),
    Boolean(bool),
    Register(u32),
}

impl PoolEntry {
    pub fn to_raw(&self) -> RawValue {
        match self {
            PoolEntry::Str(s) => RawValue::Str(s.clone()),
            PoolEntry::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= i32::MAX as f64 {
                    RawValue::Integer(*n as i32)
                } else {
                    RawValue::Float(*n)
                }
            }
            PoolEntry::Boolean(b) => RawValue::Boolean(*b),
            PoolEntry::Register(r) => RawValue::Register(*r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_predicates() {
        assert!(Opcode::BranchAlways.is_branch());
        assert!(Opcode::BranchAlways.is_branch_always());
        assert!(!Opcode::BranchAlways.is_conditional_branch());
        assert!(Opcode::BranchIfTrue.is_conditional_branch());
        assert!(Opcode::EaBranchIfFalse.is_conditional_branch());
        assert!(!Opcode::Add.is_branch());
    }

    #[test]
    fn enumerate_and_define_predicates() {
        assert!(Opcode::Enumerate.is_enumerate());
        assert!(Opcode::Enumerate2.is_enumerate());
        assert!(Opcode::DefineFunction.is_define_function());
        assert!(Opcode::DefineFunction2.is_define_function());
        assert!(!Opcode::Push.is_define_function());
    }

    #[test]
    fn to_register_valid_tags() {
        assert_eq!(
            RawValue::Integer(3).to_register().unwrap(),
            RawValue::Register(3)
        );
        assert_eq!(
            RawValue::Constant(7).to_register().unwrap(),
            RawValue::Register(7)
        );
        assert_eq!(
            RawValue::Register(1).to_register().unwrap(),
            RawValue::Register(1)
        );
    }

    #[test]
    fn to_register_invalid_tag_errors() {
        assert!(RawValue::Str("x".into()).to_register().is_err());
        assert!(RawValue::Float(1.5).to_constant().is_err());
    }

    #[test]
    fn from_unsigned_overflow_becomes_float() {
        assert_eq!(RawValue::from_unsigned(5), RawValue::Integer(5));
        assert_eq!(
            RawValue::from_unsigned(0x1000_0000),
            RawValue::Float(0x1000_0000u32 as f64)
        );
    }

    #[test]
    fn branch_target_reads_first_param() {
        let jmp = RawInstruction::new(Opcode::BranchAlways, vec![RawValue::Integer(42)]);
        assert_eq!(jmp.branch_target(), Some(42));
        assert_eq!(RawInstruction::end().branch_target(), None);
    }

    #[test]
    fn arity_table_spot_checks() {
        assert_eq!(Opcode::SetMember.stack_arity(), StackArity::Fixed(3));
        assert_eq!(Opcode::InitArray.stack_arity(), StackArity::CountPrefixed);
        assert_eq!(Opcode::CallMethod.stack_arity(), StackArity::MethodCall);
        assert!(Opcode::SetRegister.peeks_operand());
        assert!(!Opcode::Pop.pushes_result());
        assert!(Opcode::Add.pushes_result());
    }
}
