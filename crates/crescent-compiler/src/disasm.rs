/// Human-readable bytecode listing.
use crate::opcode::{Instruction, OpCode, OpFormat};
use crate::proto::Proto;
use crescent_core::string::StringInterner;
use std::fmt::Write;

/// Disassemble a prototype and, recursively, its nested prototypes.
pub fn disassemble(proto: &Proto, strings: &StringInterner) -> String {
    let mut out = String::new();
    disassemble_proto(&mut out, proto, strings, 0);
    out
}

fn disassemble_proto(out: &mut String, proto: &Proto, strings: &StringInterner, level: usize) {
    let indent = "  ".repeat(level);
    let source = String::from_utf8_lossy(strings.get_bytes(proto.source));
    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "{indent}function <{source}:{}> ({} instructions, {}{vararg} params, {} stack, \
         {} upvalues, {} constants, {} functions)",
        proto.line_defined,
        proto.code_len(),
        proto.num_params,
        proto.maxstacksize,
        proto.nupvalues,
        proto.kstr.len() + proto.knum.len(),
        proto.kproto.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        write!(out, "{indent}\t{pc}\t[{line}]\t").unwrap();
        disasm_instruction(out, inst, pc, proto, strings);
        writeln!(out).unwrap();
    }

    if !proto.locvars.is_empty() {
        writeln!(out, "{indent}locals ({}):", proto.locvars.len()).unwrap();
        for (i, lv) in proto.locvars.iter().enumerate() {
            let name = String::from_utf8_lossy(strings.get_bytes(lv.name));
            writeln!(
                out,
                "{indent}\t{i}\t{name}\t{}\t{}",
                lv.startpc, lv.endpc
            )
            .unwrap();
        }
    }

    for (i, p) in proto.kproto.iter().enumerate() {
        writeln!(out, "{indent}function [{i}]:").unwrap();
        disassemble_proto(out, p, strings, level + 1);
    }
}

/// Render one instruction, with constant and jump-target annotations.
pub fn disasm_instruction(
    out: &mut String,
    inst: &Instruction,
    pc: usize,
    proto: &Proto,
    strings: &StringInterner,
) {
    use OpCode::*;
    let op = inst.opcode();
    write!(out, "{:<12}", op.name()).unwrap();
    match op.format() {
        OpFormat::Op => {}
        OpFormat::U => write!(out, "{}", inst.arg_u()).unwrap(),
        OpFormat::S => write!(out, "{}", inst.arg_s()).unwrap(),
        OpFormat::AB => write!(out, "{} {}", inst.arg_a(), inst.arg_b()).unwrap(),
    }
    match op {
        PushString | GetGlobal | SetGlobal | GetDotted | PushSelf => {
            let k = inst.arg_u() as usize;
            if let Some(id) = proto.kstr.get(k) {
                let s = String::from_utf8_lossy(strings.get_bytes(*id));
                write!(out, "\t; \"{s}\"").unwrap();
            }
        }
        PushNum | PushNegNum => {
            let k = inst.arg_u() as usize;
            if let Some(n) = proto.knum.get(k) {
                let sign = if op == PushNegNum { "-" } else { "" };
                write!(out, "\t; {sign}{n}").unwrap();
            }
        }
        Closure => {
            write!(out, "\t; function [{}]", inst.arg_a()).unwrap();
        }
        _ if op.is_jump() || matches!(op, ForPrep | ForLoop | LForPrep | LForLoop) => {
            write!(out, "\t; to {}", pc as i32 + 1 + inst.arg_s()).unwrap();
        }
        _ => {}
    }
}
