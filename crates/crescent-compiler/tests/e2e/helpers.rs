use crescent_compiler::compiler::compile;
use crescent_compiler::opcode::OpCode;
use crescent_compiler::proto::Proto;
use crescent_core::string::StringInterner;

/// Compile a source chunk, returning the main prototype and the interner.
pub fn compile_str(source: &str) -> (Proto, StringInterner) {
    compile(source.as_bytes(), "test").unwrap_or_else(|e| {
        panic!("compile failed: {e}\nsource:\n{source}");
    })
}

/// Compile a source chunk and expect an error; returns its message.
pub fn compile_str_err(source: &str) -> String {
    match compile(source.as_bytes(), "test") {
        Err(e) => e.message,
        Ok(_) => panic!("expected compile error, got success\nsource:\n{source}"),
    }
}

/// Check if a prototype contains a specific opcode.
pub fn has_opcode(proto: &Proto, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

/// Count occurrences of an opcode in a prototype.
pub fn count_opcode(proto: &Proto, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

/// Find the first instruction with a given opcode.
pub fn find_opcode(proto: &Proto, op: OpCode) -> Option<usize> {
    proto.code.iter().position(|i| i.opcode() == op)
}

/// The name of local variable `i`, as source text.
pub fn local_name(proto: &Proto, i: usize, strings: &StringInterner) -> String {
    String::from_utf8(strings.get_bytes(proto.locvars[i].name).to_vec()).unwrap()
}
