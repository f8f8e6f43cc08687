//! Pseudo-source printing: precedence-aware expression composition,
//! statement layout, and the identifier helpers the replay uses when it
//! binds register names.

use std::sync::LazyLock;

use regex::Regex;

use crate::base::listing::serialize_value;
use crate::base::{Opcode, RawValue};
use crate::decompile::ast::{NodeId, NodePool, SyntaxNode};

const INDENT: usize = 4;

pub fn render(pool: &NodePool) -> String {
    let mut out = String::new();
    render_statements(pool, &pool.list, 0, &mut out);
    out
}

/// One-line text of an expression node, as the register namer sees it.
pub fn expression_text(pool: &NodePool, id: NodeId) -> String {
    expression(pool, id, 0, 0)
}

// ── Statements ──

fn render_statements(pool: &NodePool, ids: &[NodeId], indent: usize, out: &mut String) {
    for &id in ids {
        render_statement(pool, id, indent, out);
    }
}

fn pad(indent: usize, out: &mut String) {
    out.push_str(&" ".repeat(indent * INDENT));
}

fn line(indent: usize, text: &str, out: &mut String) {
    pad(indent, out);
    out.push_str(text);
    out.push('\n');
}

fn render_statement(pool: &NodePool, id: NodeId, indent: usize, out: &mut String) {
    match pool.node(id) {
        SyntaxNode::VarDecl { name, value, register } => {
            let value = expression(pool, *value, 0, indent);
            line(
                indent,
                &format!("var {name} = {value}; // [[register #{register}]]"),
                out,
            );
        }
        SyntaxNode::If { opcode, condition, taken, fallthrough } => {
            render_if(pool, *opcode, *condition, taken, fallthrough, indent, false, out);
        }
        SyntaxNode::While { opcode, condition, post_test, prelude, body } => {
            render_loop(pool, *opcode, *condition, *post_test, prelude, body, indent, out);
        }
        SyntaxNode::Function { name, parameters, body } => {
            line(indent, &format!("function {name}({})", parameters.join(", ")), out);
            line(indent, "{", out);
            render_statements(body, &body.list, indent + 1, out);
            line(indent, "}", out);
        }
        SyntaxNode::Break => line(indent, "break;", out),
        SyntaxNode::Continue => line(indent, "continue;", out),
        SyntaxNode::MarkerJump { label } => {
            line(indent, &format!("break; // __jmp__(\"{label}\")"), out);
        }
        SyntaxNode::MarkerCondJump { label, condition, jump_if_true } => {
            let condition = expression(pool, *condition, 0, indent);
            let marker = if *jump_if_true { "__jnz__" } else { "__jz__" };
            line(indent, &format!("{marker}(\"{label}\", {condition});"), out);
        }
        SyntaxNode::Op { opcode, args } => render_op_statement(pool, *opcode, args, indent, out),
        // an expression the replay never consumed
        SyntaxNode::Call { .. } | SyntaxNode::MethodCall { .. } => {
            let text = expression(pool, id, 0, indent);
            line(indent, &format!("{text};"), out);
        }
        _ => {
            let text = expression(pool, id, 0, indent);
            line(indent, &format!("// __push__({text})"), out);
        }
    }
}

fn render_op_statement(
    pool: &NodePool,
    opcode: Opcode,
    args: &[NodeId],
    indent: usize,
    out: &mut String,
) {
    let arg = |i: usize| args.get(i).copied();
    match opcode {
        Opcode::SetVariable | Opcode::DefineLocal => {
            let prefix = if opcode == Opcode::DefineLocal { "var " } else { "" };
            let (Some(name), Some(value)) = (arg(0), arg(1)) else {
                return line(indent, "// __push__(malformed assignment)", out);
            };
            let value = expression(pool, value, 0, indent);
            match variable_name(pool, name) {
                Some(name) => line(indent, &format!("{prefix}{name} = {value};"), out),
                None => {
                    let name = expression(pool, name, 0, indent);
                    line(indent, &format!("set({name}, {value});"), out);
                }
            }
        }
        Opcode::SetMember => {
            let (Some(receiver), Some(name), Some(value)) = (arg(0), arg(1), arg(2)) else {
                return line(indent, "// __push__(malformed member store)", out);
            };
            let receiver = expression(pool, receiver, PREC_MEMBER, indent);
            let member = member_suffix(pool, name, indent);
            let value = expression(pool, value, 0, indent);
            line(indent, &format!("{receiver}{member} = {value};"), out);
        }
        Opcode::Var => match arg(0).and_then(|n| variable_name(pool, n)) {
            Some(name) => line(indent, &format!("var {name};"), out),
            None => line(indent, "// __push__(malformed declaration)", out),
        },
        Opcode::Trace => {
            let text = arg(0).map(|a| expression(pool, a, 0, indent)).unwrap_or_default();
            line(indent, &format!("trace({text});"), out);
        }
        Opcode::Return => match arg(0) {
            Some(v) if !matches!(pool.node(v), SyntaxNode::Ident(name) if name == "undefined") => {
                let text = expression(pool, v, 0, indent);
                line(indent, &format!("return {text};"), out);
            }
            _ => line(indent, "return;", out),
        },
        Opcode::Pop => {
            let text = arg(0).map(|a| expression(pool, a, 0, indent)).unwrap_or_default();
            line(indent, &format!("{text};"), out);
        }
        _ => {
            let text = op_expression(pool, opcode, args, 0, indent);
            line(indent, &format!("{text};"), out);
        }
    }
}

fn render_if(
    pool: &NodePool,
    opcode: Opcode,
    condition: NodeId,
    taken: &[NodeId],
    fallthrough: &[NodeId],
    indent: usize,
    as_else_if: bool,
    out: &mut String,
) {
    let mut cond = expression(pool, condition, 0, indent);
    // the taken arm runs when the branch fires; EaBranchIfFalse fires on a
    // false condition, so its taken arm is the else
    let (mut then_arm, mut else_arm) = match opcode {
        Opcode::EaBranchIfFalse => (fallthrough, taken),
        _ => (taken, fallthrough),
    };
    if then_arm.is_empty() && !else_arm.is_empty() {
        cond = reverse_condition(&cond);
        std::mem::swap(&mut then_arm, &mut else_arm);
    }

    if as_else_if {
        out.push_str(&format!("if ({cond})\n"));
    } else {
        line(indent, &format!("if ({cond})"), out);
    }
    line(indent, "{", out);
    render_statements(pool, then_arm, indent + 1, out);
    line(indent, "}", out);

    match lone_case(pool, else_arm) {
        Some((op, c, t, f)) => {
            pad(indent, out);
            out.push_str("else ");
            render_if(pool, op, c, t, f, indent, true, out);
        }
        None if !else_arm.is_empty() => {
            line(indent, "else", out);
            line(indent, "{", out);
            render_statements(pool, else_arm, indent + 1, out);
            line(indent, "}", out);
        }
        None => {}
    }
}

/// An else arm holding exactly one `If` and nothing else flattens into an
/// `else if` cascade.
fn lone_case<'a>(
    pool: &'a NodePool,
    arm: &[NodeId],
) -> Option<(Opcode, NodeId, &'a [NodeId], &'a [NodeId])> {
    match arm {
        [only] => match pool.node(*only) {
            SyntaxNode::If { opcode, condition, taken, fallthrough } => {
                Some((*opcode, *condition, taken, fallthrough))
            }
            _ => None,
        },
        _ => None,
    }
}

fn render_loop(
    pool: &NodePool,
    opcode: Option<Opcode>,
    condition: Option<NodeId>,
    post_test: bool,
    prelude: &[NodeId],
    body: &[NodeId],
    indent: usize,
    out: &mut String,
) {
    let cond_text = condition.map(|c| expression(pool, c, 0, indent));
    // the branch either re-enters the loop (post-test) or exits it
    // (pre-test); BranchIfTrue fires on true, EaBranchIfFalse on false
    let continue_cond = match (cond_text, opcode) {
        (Some(c), Some(Opcode::BranchIfTrue)) if post_test => c,
        (Some(c), Some(Opcode::BranchIfTrue)) => reverse_condition(&c),
        (Some(c), _) if post_test => reverse_condition(&c),
        (Some(c), _) => c,
        (None, _) => "true".to_string(),
    };

    if post_test {
        line(indent, "do", out);
        line(indent, "{", out);
        render_statements(pool, prelude, indent + 1, out);
        render_statements(pool, body, indent + 1, out);
        line(indent, &format!("}} while ({continue_cond});"), out);
        return;
    }
    if prelude.is_empty() {
        line(indent, &format!("while ({continue_cond})"), out);
        line(indent, "{", out);
        render_statements(pool, body, indent + 1, out);
        line(indent, "}", out);
        return;
    }
    // the condition needs per-iteration statements; hoist them into an
    // unconditional loop with an explicit exit test
    line(indent, "while (true)", out);
    line(indent, "{", out);
    render_statements(pool, prelude, indent + 1, out);
    line(indent + 1, &format!("if ({})", reverse_condition(&continue_cond)), out);
    line(indent + 1, "{", out);
    line(indent + 2, "break;", out);
    line(indent + 1, "}", out);
    render_statements(pool, body, indent + 1, out);
    line(indent, "}", out);
}

// ── Expressions ──

const PREC_MEMBER: u8 = 17;
const PREC_UNARY: u8 = 14;
const PREC_ATOM: u8 = 18;

fn precedence(opcode: Opcode) -> u8 {
    use Opcode::*;
    match opcode {
        Not | TypeOf => PREC_UNARY,
        Multiply | Divide | Modulo => 13,
        Add | Add2 | Subtract | StringConcat | Increment | Decrement => 12,
        ShiftLeft | ShiftRight | ShiftRight2 => 11,
        Less | Less2 | Greater | InstanceOf => 10,
        Equals | Equals2 | StrictEquals | StringEquals => 9,
        BitwiseAnd => 8,
        BitwiseXor => 7,
        BitwiseOr => 6,
        And => 5,
        Or => 4,
        _ => PREC_ATOM,
    }
}

fn binary_symbol(opcode: Opcode) -> Option<&'static str> {
    use Opcode::*;
    Some(match opcode {
        Multiply => "*",
        Divide => "/",
        Modulo => "%",
        Add | Add2 | StringConcat => "+",
        Subtract => "-",
        ShiftLeft => "<<",
        ShiftRight => ">>",
        ShiftRight2 => ">>>",
        Less | Less2 => "<",
        Greater => ">",
        Equals | Equals2 | StringEquals => "==",
        StrictEquals => "===",
        BitwiseAnd => "&",
        BitwiseXor => "^",
        BitwiseOr => "|",
        And => "&&",
        Or => "||",
        InstanceOf => "instanceof",
        _ => return None,
    })
}

fn expression(pool: &NodePool, id: NodeId, parent_prec: u8, indent: usize) -> String {
    let (text, prec) = compose(pool, id, indent);
    if prec < parent_prec {
        format!("({text})")
    } else {
        text
    }
}

fn compose(pool: &NodePool, id: NodeId, indent: usize) -> (String, u8) {
    match pool.node(id) {
        SyntaxNode::Literal(raw) => (serialize_value(raw), PREC_ATOM),
        SyntaxNode::Ident(name) => (name.clone(), PREC_ATOM),
        SyntaxNode::Register(r) => (format!("r{r}"), PREC_ATOM),
        SyntaxNode::Array(items) => {
            let items: Vec<String> =
                items.iter().map(|&i| expression(pool, i, 0, indent)).collect();
            (format!("[{}]", items.join(", ")), PREC_ATOM)
        }
        SyntaxNode::ObjectInit(pairs) => {
            let pairs: Vec<String> = pairs
                .iter()
                .map(|&(name, value)| {
                    let key = match variable_name(pool, name) {
                        Some(key) => key,
                        None => expression(pool, name, 0, indent),
                    };
                    format!("{key}: {}", expression(pool, value, 0, indent))
                })
                .collect();
            (format!("{{{}}}", pairs.join(", ")), PREC_ATOM)
        }
        SyntaxNode::Call { callee, args, constructed } => {
            let head = match variable_name(pool, *callee) {
                Some(name) => name,
                None => expression(pool, *callee, PREC_MEMBER, indent),
            };
            let prefix = if *constructed { "new " } else { "" };
            (format!("{prefix}{head}({})", arg_list(pool, args, indent)), PREC_MEMBER)
        }
        SyntaxNode::MethodCall { receiver, name, args, constructed } => {
            let target = expression(pool, *receiver, PREC_MEMBER, indent);
            let prefix = if *constructed { "new " } else { "" };
            let call = match member_name(pool, *name) {
                Some(m) if m.is_empty() => format!("{target}({})", arg_list(pool, args, indent)),
                _ => {
                    let member = member_suffix(pool, *name, indent);
                    format!("{target}{member}({})", arg_list(pool, args, indent))
                }
            };
            (format!("{prefix}{call}"), PREC_MEMBER)
        }
        SyntaxNode::Enumerate(subject) => {
            (format!("enumerate({})", expression(pool, *subject, 0, indent)), PREC_ATOM)
        }
        SyntaxNode::Function { parameters, body, .. } => {
            let mut text = format!("function({})\n", parameters.join(", "));
            pad(indent, &mut text);
            text.push_str("{\n");
            render_statements(body, &body.list, indent + 1, &mut text);
            pad(indent, &mut text);
            text.push('}');
            (text, PREC_ATOM)
        }
        SyntaxNode::Op { opcode, args } => {
            let prec = precedence(*opcode);
            (op_expression(pool, *opcode, args, prec, indent), prec)
        }
        other => (format!("/* {} */", node_tag(other)), PREC_ATOM),
    }
}

fn op_expression(
    pool: &NodePool,
    opcode: Opcode,
    args: &[NodeId],
    prec: u8,
    indent: usize,
) -> String {
    use Opcode::*;
    let arg = |i: usize, p: u8| {
        args.get(i)
            .map(|&a| expression(pool, a, p, indent))
            .unwrap_or_else(|| "__missing__".to_string())
    };
    if let Some(symbol) = binary_symbol(opcode) {
        return format!("{} {symbol} {}", arg(0, prec), arg(1, prec + 1));
    }
    match opcode {
        GetVariable => match args.first().and_then(|&n| variable_name(pool, n)) {
            Some(name) => name,
            None => format!("eval({})", arg(0, 0)),
        },
        GetMember => {
            let target = arg(0, PREC_MEMBER);
            match args.get(1) {
                Some(&name) => format!("{target}{}", member_suffix(pool, name, indent)),
                None => target,
            }
        }
        Delete => {
            let target = arg(0, PREC_MEMBER);
            match args.get(1) {
                Some(&name) => format!("delete {target}{}", member_suffix(pool, name, indent)),
                None => format!("delete {target}"),
            }
        }
        Delete2 => match args.first().and_then(|&n| variable_name(pool, n)) {
            Some(name) => format!("delete {name}"),
            None => format!("delete {}", arg(0, PREC_UNARY)),
        },
        Not => format!("!{}", arg(0, PREC_UNARY)),
        TypeOf => format!("typeof({})", arg(0, 0)),
        ToString => format!("String({})", arg(0, 0)),
        ToNumber => format!("Number({})", arg(0, 0)),
        ToInteger => format!("int({})", arg(0, 0)),
        Increment => format!("{} + 1", arg(0, prec)),
        Decrement => format!("{} - 1", arg(0, prec)),
        CastOp => format!("cast({}, {})", arg(0, 0), arg(1, 0)),
        RandomNumber => format!("random({})", arg(0, 0)),
        GetTime => "getTimer()".to_string(),
        other => {
            let rendered: Vec<String> =
                args.iter().map(|&a| expression(pool, a, 0, indent)).collect();
            format!("{other}({})", rendered.join(", "))
        }
    }
}

fn arg_list(pool: &NodePool, args: &[NodeId], indent: usize) -> String {
    let rendered: Vec<String> = args.iter().map(|&a| expression(pool, a, 0, indent)).collect();
    rendered.join(", ")
}

/// Bare identifier behind a name operand, when it is safe to print one.
fn variable_name(pool: &NodePool, id: NodeId) -> Option<String> {
    match pool.node(id) {
        SyntaxNode::Literal(RawValue::Str(s)) if is_identifier(s) => Some(s.clone()),
        SyntaxNode::Ident(s) if is_identifier(s) => Some(s.clone()),
        _ => None,
    }
}

fn member_name(pool: &NodePool, id: NodeId) -> Option<String> {
    match pool.node(id) {
        SyntaxNode::Literal(RawValue::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

fn member_suffix(pool: &NodePool, name: NodeId, indent: usize) -> String {
    match variable_name(pool, name) {
        Some(member) => format!(".{member}"),
        None => format!("[{}]", expression(pool, name, 0, indent)),
    }
}

fn node_tag(node: &SyntaxNode) -> &'static str {
    match node {
        SyntaxNode::VarDecl { .. } => "var-decl",
        SyntaxNode::If { .. } => "if",
        SyntaxNode::While { .. } => "loop",
        SyntaxNode::Break => "break",
        SyntaxNode::Continue => "continue",
        _ => "node",
    }
}

// ── Identifier helpers ──

static ILLEGAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^A-Za-z0-9_]").unwrap_or_else(|_| unreachable!())
});
static UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__+").unwrap_or_else(|_| unreachable!())
});
static IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!())
});
static NAME_TAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*_)(\d+)$").unwrap_or_else(|_| unreachable!())
});

pub fn is_identifier(s: &str) -> bool {
    IDENT.is_match(s)
}

const NAME_CAP: usize = 20;

/// Turn arbitrary expression text into a plausible identifier for a
/// register binding. Lossy on purpose.
pub fn justify_name(text: &str) -> String {
    let head = text.split(['{', '}', ';', '\n']).next().unwrap_or("");
    let mut name = ILLEGAL.replace_all(head, "_").to_string();
    name = UNDERSCORES.replace_all(&name, "_").to_string();
    name = name.trim_matches('_').to_string();

    for (long, short) in [
        ("function", "func"),
        ("prototype", "proto"),
        ("system", "sys"),
        ("object", "obj"),
        ("variable", "var"),
        ("initialize", "init"),
        ("Function", "Func"),
        ("Prototype", "Proto"),
        ("System", "Sys"),
        ("Object", "Obj"),
        ("Variable", "Var"),
        ("Initialize", "Init"),
    ] {
        name = name.replace(long, short);
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name = format!("num_{name}");
    }
    if name.len() > NAME_CAP {
        name.truncate(NAME_CAP);
    }
    match name.as_str() {
        "true" | "false" | "True" | "False" => "boolval".to_string(),
        "null" => "nullval".to_string(),
        "undefined" => "undefval".to_string(),
        _ => name,
    }
}

/// `name` → `name_1`, `name_1` → `name_2`.
pub fn incremented_name(name: &str) -> String {
    match NAME_TAIL.captures(name) {
        Some(c) => {
            let n: u64 = c[2].parse().unwrap_or(0);
            format!("{}{}", &c[1], n + 1)
        }
        None => format!("{name}_1"),
    }
}

/// Negate condition text without stacking `!(!(…))`.
pub fn reverse_condition(condition: &str) -> String {
    match condition {
        "true" => return "false".to_string(),
        "false" => return "true".to_string(),
        _ => {}
    }
    if let Some(rest) = condition.strip_prefix('!') {
        let inner = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or(rest);
        inner.to_string()
    } else {
        format!("!({condition})")
    }
}
