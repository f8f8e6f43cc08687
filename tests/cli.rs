use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

fn aptscript() -> Command {
    Command::new(env!("CARGO_BIN_EXE_aptscript"))
}

fn listing(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp listing");
    file.write_all(content.as_bytes()).expect("failed to write temp listing");
    file
}

// --- run ---

#[test]
fn run_prints_trace_lines_and_result() {
    let file = listing(
        "0: Push(\"hello\")\n\
         1: Trace\n\
         2: Push(2)\n\
         3: Push(3)\n\
         4: Add\n\
         5: End\n",
    );
    let out = aptscript()
        .args(["run", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout, "hello\n=> 5\n");
}

#[test]
fn run_selects_constants_from_flags() {
    let file = listing(
        "0: ConstantPool(2, 0, 1)\n\
         1: Push(c[1])\n\
         2: Trace\n\
         3: End\n",
    );
    let out = aptscript()
        .args(["run", file.path().to_str().unwrap(), "-c", "hello", "-c", "world"])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("world\n"), "expected trace line, got: {}", stdout);
}

#[test]
fn run_defined_function_through_the_call_stack() {
    // function double(x) { return x * 2; }  double(21);
    let file = listing(
        "0: DefineFunction(\"double\", \"x\", 6)\n\
         1: Push(\"x\")\n\
         2: GetVariable\n\
         3: Push(2)\n\
         4: Multiply\n\
         5: Return\n\
         6: Push(21)\n\
         7: Push(1)\n\
         8: Push(\"double\")\n\
         9: CallFunction\n\
         10: End\n",
    );
    let out = aptscript()
        .args(["run", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "=> 42");
}

#[test]
fn run_uncaught_throw_exits_with_error() {
    let file = listing(
        "0: Push(0)\n\
         1: Push(\"nope\")\n\
         2: CallFunction\n\
         3: End\n",
    );
    let out = aptscript()
        .args(["run", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("uncaught"), "expected uncaught error, got: {}", stderr);
}

// --- decompile ---

#[test]
fn decompile_folds_constant_arithmetic() {
    let file = listing(
        "0: Push(\"x\")\n\
         1: Push(2)\n\
         2: Push(3)\n\
         3: Add\n\
         4: SetVariable\n\
         5: End\n",
    );
    let out = aptscript()
        .args(["decompile", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("x = 5;"), "expected folded assignment, got: {}", stdout);
}

#[test]
fn decompile_recovers_a_while_loop() {
    let file = listing(
        "0: Push(\"i\")\n\
         1: GetVariable\n\
         2: Push(10)\n\
         3: Less2\n\
         4: EaBranchIfFalse(13)\n\
         5: Push(\"i\")\n\
         6: Push(\"i\")\n\
         7: GetVariable\n\
         8: Push(1)\n\
         9: Add\n\
         10: SetVariable\n\
         11: BranchAlways(0)\n\
         13: End\n",
    );
    let out = aptscript()
        .args(["decompile", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("while (i < 10)"), "expected while loop, got: {}", stdout);
    assert!(stdout.contains("i = i + 1;"), "expected loop body, got: {}", stdout);
}

#[test]
fn decompile_recovers_if_else() {
    let file = listing(
        "0: Push(\"a\")\n\
         1: GetVariable\n\
         2: EaBranchIfFalse(9)\n\
         3: Push(\"r\")\n\
         4: Push(1)\n\
         5: SetVariable\n\
         6: BranchAlways(12)\n\
         9: Push(\"r\")\n\
         10: Push(2)\n\
         11: SetVariable\n\
         12: End\n",
    );
    let out = aptscript()
        .args(["decompile", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("if (a)"), "expected condition, got: {}", stdout);
    assert!(stdout.contains("else"), "expected else arm, got: {}", stdout);
    assert!(stdout.contains("r = 1;"), "expected then body, got: {}", stdout);
    assert!(stdout.contains("r = 2;"), "expected else body, got: {}", stdout);
}

#[test]
fn decompile_flattens_an_else_if_cascade() {
    let file = listing(
        "0: Push(\"a\")\n\
         1: GetVariable\n\
         2: EaBranchIfFalse(8)\n\
         3: Push(\"r\")\n\
         4: Push(1)\n\
         5: SetVariable\n\
         6: BranchAlways(19)\n\
         8: Push(\"b\")\n\
         9: GetVariable\n\
         10: EaBranchIfFalse(16)\n\
         11: Push(\"r\")\n\
         12: Push(2)\n\
         13: SetVariable\n\
         14: BranchAlways(19)\n\
         16: Push(\"r\")\n\
         17: Push(3)\n\
         18: SetVariable\n\
         19: End\n",
    );
    let out = aptscript()
        .args(["decompile", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("else if (b)"), "expected flat cascade, got: {}", stdout);
    // Flattening keeps every arm at one indent step, never nested deeper.
    assert!(stdout.contains("\n    r = 2;"), "expected flat arm, got: {}", stdout);
    assert!(stdout.contains("\n    r = 3;"), "expected flat arm, got: {}", stdout);
    assert!(!stdout.contains("        r ="), "arms should not nest, got: {}", stdout);
}

#[test]
fn decompile_dynamic_assignment_uses_set() {
    // The name slot holds a number, not a string: SetVariable wants the
    // name below the value, so this renders as a dynamic set().
    let file = listing(
        "0: Push(1)\n\
         1: Push(\"x\")\n\
         2: SetVariable\n\
         3: End\n",
    );
    let out = aptscript()
        .args(["decompile", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("set(1, \"x\");"), "expected dynamic set, got: {}", stdout);
}

// --- dump ---

#[test]
fn dump_emits_parseable_json() {
    let file = listing("0: Push(\"x\", 1)\n2: End\n");
    let out = aptscript()
        .args(["dump", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|_| panic!("expected JSON, got: {}", stdout));
    let entries = v.as_array().expect("expected a top-level array");
    assert_eq!(entries.len(), 2);
    assert!(stdout.contains("Push"), "expected opcode name, got: {}", stdout);
}

// --- error cases ---

#[test]
fn missing_file_errors() {
    let out = aptscript()
        .args(["run", "/no/such/listing.apt"])
        .output()
        .expect("failed to run aptscript");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("cannot read"), "expected read error, got: {}", stderr);
}

#[test]
fn malformed_listing_errors_with_line_number() {
    let file = listing("0: Push(\n");
    let out = aptscript()
        .args(["run", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("line 1"), "expected line number, got: {}", stderr);
}

#[test]
fn unknown_opcode_errors() {
    let file = listing("0: Frobnicate(1)\n");
    let out = aptscript()
        .args(["run", file.path().to_str().unwrap()])
        .output()
        .expect("failed to run aptscript");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Frobnicate"), "expected opcode name, got: {}", stderr);
}

#[test]
fn no_subcommand_shows_usage() {
    let out = aptscript().output().expect("failed to run aptscript");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Usage"), "expected usage message, got: {}", stderr);
}

#[test]
fn version_flag() {
    let out = aptscript().args(["--version"]).output().expect("failed to run aptscript");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("aptscript"), "expected version string, got: {}", stdout);
}
