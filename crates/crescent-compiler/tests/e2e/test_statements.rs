use crate::helpers::*;
use crescent_compiler::opcode::OpCode;

#[test]
fn scenario_locals_and_return() {
    // local x = 1; local y = x + 2; return y
    let (proto, strings) = compile_str("local x = 1\nlocal y = x + 2\nreturn y");
    assert_eq!(proto.locvars.len(), 2);
    assert_eq!(local_name(&proto, 0, &strings), "x");
    assert_eq!(local_name(&proto, 1, &strings), "y");
    // Both returns (explicit and final) reference the two active locals.
    let returns: Vec<_> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::Return)
        .collect();
    assert!(!returns.is_empty());
    assert!(returns.iter().all(|i| i.arg_u() == 2));
}

#[test]
fn scenario_numeric_for() {
    // for i = 1, 3 do print(i) end
    let (proto, strings) = compile_str("for i = 1, 3 do print(i) end");
    assert_eq!(local_name(&proto, 0, &strings), "i");
    assert_eq!(local_name(&proto, 1, &strings), "(limit)");
    assert_eq!(local_name(&proto, 2, &strings), "(step)");
    // Default step is the inline integer 1.
    assert_eq!(count_opcode(&proto, OpCode::PushInt), 3);
    let prep = find_opcode(&proto, OpCode::ForPrep).unwrap();
    let looppc = find_opcode(&proto, OpCode::ForLoop).unwrap();
    assert!(prep < looppc);
    // FORPREP skips the whole loop, FORLOOP included, on an empty range.
    assert_eq!(
        prep as i32 + 1 + proto.code[prep].arg_s(),
        looppc as i32 + 1
    );
    // FORLOOP jumps back to the body start.
    assert_eq!(
        looppc as i32 + 1 + proto.code[looppc].arg_s(),
        prep as i32 + 1
    );
    // The loop variable covers exactly the body.
    let i_var = &proto.locvars[0];
    assert_eq!(i_var.startpc as usize, prep + 1);
    assert_eq!(i_var.endpc as usize, looppc + 1);
}

#[test]
fn scenario_generic_for() {
    let (proto, strings) = compile_str("local t\nfor k, v in t do print(k, v) end");
    assert_eq!(local_name(&proto, 1, &strings), "(table)");
    assert_eq!(local_name(&proto, 2, &strings), "(index)");
    assert_eq!(local_name(&proto, 3, &strings), "k");
    assert_eq!(local_name(&proto, 4, &strings), "v");
    assert!(has_opcode(&proto, OpCode::LForPrep));
    assert!(has_opcode(&proto, OpCode::LForLoop));
}

#[test]
fn scenario_swap_assignment() {
    // a, b = b, a stores in reverse order using only the two values.
    let (proto, _) = compile_str("local a, b\na, b = b, a");
    let gets = count_opcode(&proto, OpCode::GetLocal);
    let sets = count_opcode(&proto, OpCode::SetLocal);
    assert_eq!(gets, 2);
    assert_eq!(sets, 2);
    assert!(!has_opcode(&proto, OpCode::Pop));
    assert_eq!(proto.maxstacksize, 4); // two locals + two values
}

#[test]
fn scenario_break_in_while() {
    // while 1 do if x then break end end
    let (proto, _) = compile_str("while 1 do if x then break end end");
    // The break jump lands on the instruction following the back jump.
    let jumps: Vec<usize> = proto
        .code
        .iter()
        .enumerate()
        .filter(|(_, i)| i.opcode() == OpCode::Jmp)
        .map(|(pc, _)| pc)
        .collect();
    assert!(jumps.len() >= 2);
    let back = *jumps.last().unwrap();
    let break_jmp = jumps[jumps.len() - 2];
    assert_eq!(
        break_jmp as i32 + 1 + proto.code[break_jmp].arg_s(),
        back as i32 + 1
    );
}

#[test]
fn scenario_shadowing_initializer() {
    // local x; local x = x: the right-hand x is the first variable.
    let (proto, _) = compile_str("local x\nlocal x = x");
    let get = find_opcode(&proto, OpCode::GetLocal).unwrap();
    assert_eq!(proto.code[get].arg_u(), 0);
    assert_eq!(proto.locvars.len(), 2);
}

#[test]
fn shadowing_resolves_innermost() {
    let (proto, _) = compile_str("local x\ndo local x\nx = x end\nx = x");
    let sets: Vec<u32> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::SetLocal)
        .map(|i| i.arg_u())
        .collect();
    // Inner block writes slot 1, outer writes slot 0.
    assert_eq!(sets, vec![1, 0]);
}

#[test]
fn do_block_scopes_locals() {
    let (proto, _) = compile_str("do local a = 1 end\ndo local b = 2 end");
    // Both locals occupy slot 0; their lifetimes do not overlap.
    assert_eq!(proto.locvars.len(), 2);
    let a = &proto.locvars[0];
    let b = &proto.locvars[1];
    assert!(a.endpc <= b.startpc);
}

#[test]
fn block_exit_pops_locals() {
    let (proto, _) = compile_str("do local a = 1 end");
    assert!(has_opcode(&proto, OpCode::Pop));
}

#[test]
fn repeat_loops_back_on_false() {
    let (proto, _) = compile_str("local a\nrepeat a = 1 until a");
    let jf = find_opcode(&proto, OpCode::JmpF).unwrap();
    // Condition false: jump back to the loop start.
    assert!(proto.code[jf].arg_s() < 0);
}

#[test]
fn while_false_chain_exits_loop() {
    let (proto, _) = compile_str("local a\nwhile a do a = nil end");
    let jf = find_opcode(&proto, OpCode::JmpF).unwrap();
    let back = find_opcode(&proto, OpCode::Jmp).unwrap();
    // The exit jump targets the instruction after the back jump.
    assert_eq!(jf as i32 + 1 + proto.code[jf].arg_s(), back as i32 + 1);
}

#[test]
fn if_elseif_else_chain() {
    let (proto, _) = compile_str(
        "local a, b\n\
         if a then a = 1\n\
         elseif b then a = 2\n\
         else a = 3 end",
    );
    // Two conditions, two escape jumps to the end.
    assert_eq!(count_opcode(&proto, OpCode::JmpF), 2);
    assert_eq!(count_opcode(&proto, OpCode::Jmp), 2);
}

#[test]
fn return_of_open_call_spreads() {
    let (proto, _) = compile_str("return f(1)");
    // Open call at return position becomes a tail call.
    assert!(has_opcode(&proto, OpCode::TailCall));
}

#[test]
fn nested_loops_break_innermost() {
    let (proto, _) = compile_str(
        "local i\nwhile 1 do\n  while i do break end\n  i = nil\nend",
    );
    // Compiles; the inner break targets the inner loop exit, which lies
    // before the outer back jump.
    assert!(count_opcode(&proto, OpCode::Jmp) >= 3);
}

#[test]
fn upvalue_capture_shapes() {
    let (proto, _) = compile_str(
        "local state\nfunction get() return %state end\nfunction zero() return %state == 0 end",
    );
    assert_eq!(proto.kproto.len(), 2);
    assert_eq!(proto.kproto[0].nupvalues, 1);
    assert_eq!(proto.kproto[1].nupvalues, 1);
    // Each closure gets its captured local pushed before CLOSURE.
    assert_eq!(count_opcode(&proto, OpCode::GetLocal), 2);
}
