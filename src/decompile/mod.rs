//! Structural decompiler: instruction stream in, pseudo-source out.
//!
//! Pipeline: carve out inline function bodies, build a basic-block graph,
//! structurize it into sequence/case/loop chains, replay the chains into a
//! syntax-node pool, then print. Anything the structurizer cannot express
//! degrades to a visible marker plus a diagnostic instead of failing.

pub mod ast;
pub mod chain;
pub mod emit;
pub mod graph;

use std::collections::HashMap;

use crate::base::{InstructionStream, PoolEntry, RawValue};
use crate::runtime::ops;

/// A note about something the decompiler could not express faithfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub position: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn at(position: usize, message: impl Into<String>) -> Diagnostic {
        Diagnostic { position: Some(position), message: message.into() }
    }

    pub fn general(message: impl Into<String>) -> Diagnostic {
        Diagnostic { position: None, message: message.into() }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Some(pos) => write!(f, "at {}: {}", pos, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Decompilation result: pseudo-source text plus everything that went
/// sideways while producing it.
#[derive(Debug)]
pub struct Decompiled {
    pub source: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// A function body carved out of the surrounding stream before graph
/// construction, so its instructions never leak into the outer flow.
#[derive(Debug, Clone)]
pub struct FunctionSource {
    pub name: String,
    pub parameters: Vec<String>,
    pub register_params: Vec<(u8, String)>,
    pub stream: InstructionStream,
}

pub fn decompile(stream: &InstructionStream, pool: &[PoolEntry]) -> Decompiled {
    let constants: Vec<RawValue> = pool.iter().map(PoolEntry::to_raw).collect();
    let mut diagnostics = Vec::new();
    let pool = ast::build(stream, &constants, &ast::NameSet::new(), &mut diagnostics);
    let source = emit::render(&pool);
    Decompiled { source, diagnostics }
}

/// Split a stream into its top-level instructions and the bodies of the
/// functions it defines, keyed by the defining instruction's position.
/// Nested definitions stay inside their enclosing body and are carved out
/// again when that body is decompiled.
pub(crate) fn extract_functions(
    stream: &InstructionStream,
    diagnostics: &mut Vec<Diagnostic>,
) -> (InstructionStream, HashMap<usize, FunctionSource>) {
    let mut outer = Vec::new();
    let mut functions = HashMap::new();
    let mut index = 0;
    while index < stream.len() {
        let (position, instruction) = &stream[index];
        outer.push((*position, instruction.clone()));
        index += 1;
        if !instruction.opcode.is_define_function() {
            continue;
        }
        match ops::decode_function_params(instruction) {
            Ok((name, parameters, register_params, _, _, body_end)) => {
                let mut body = Vec::new();
                while index < stream.len() && stream[index].0 < body_end {
                    body.push(stream[index].clone());
                    index += 1;
                }
                functions.insert(
                    *position,
                    FunctionSource { name, parameters, register_params, stream: body },
                );
            }
            Err(e) => diagnostics
                .push(Diagnostic::at(*position, format!("unreadable function header: {e}"))),
        }
    }
    (outer, functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Opcode, RawInstruction, RawValue};

    fn def(name: &str, body_end: usize) -> RawInstruction {
        RawInstruction::new(
            Opcode::DefineFunction,
            vec![RawValue::Str(name.into()), RawValue::Integer(body_end as i32)],
        )
    }

    #[test]
    fn carves_function_body_out_of_stream() {
        let stream = vec![
            (0, def("f", 3)),
            (1, RawInstruction::new(Opcode::EaPushOne, vec![])),
            (2, RawInstruction::new(Opcode::Return, vec![])),
            (3, RawInstruction::new(Opcode::End, vec![])),
        ];
        let mut diags = Vec::new();
        let (outer, functions) = extract_functions(&stream, &mut diags);
        assert!(diags.is_empty());
        assert_eq!(outer.len(), 2);
        assert_eq!(outer[1].0, 3);
        let body = &functions[&0];
        assert_eq!(body.name, "f");
        assert_eq!(body.stream.len(), 2);
    }

    #[test]
    fn nested_definitions_stay_in_the_outer_body() {
        let stream = vec![
            (0, def("outer", 4)),
            (1, def("inner", 3)),
            (2, RawInstruction::new(Opcode::Return, vec![])),
            (3, RawInstruction::new(Opcode::End, vec![])),
            (4, RawInstruction::new(Opcode::End, vec![])),
        ];
        let mut diags = Vec::new();
        let (outer, functions) = extract_functions(&stream, &mut diags);
        assert_eq!(outer.len(), 2);
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[&0].stream.len(), 3);
    }
}
