use crate::helpers::*;
use crescent_compiler::opcode::OpCode;

#[test]
fn precedence_mult_before_add() {
    // a + b * c: the multiplication runs first, then a single ADD.
    let (proto, _) = compile_str("local a, b, c\nreturn a + b * c");
    let mult = find_opcode(&proto, OpCode::Mult).unwrap();
    let add = find_opcode(&proto, OpCode::Add).unwrap();
    assert!(mult < add);
}

#[test]
fn precedence_pow_right_assoc() {
    // a ^ b ^ c parses as a ^ (b ^ c): two POWs, innermost first.
    let (proto, _) = compile_str("local a, b, c\nreturn a ^ b ^ c");
    assert_eq!(count_opcode(&proto, OpCode::Pow), 2);
}

#[test]
fn concat_chain_fuses_into_one() {
    let (proto, _) = compile_str("local a, b, c, d\nreturn a .. b .. c .. d");
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
    let pc = find_opcode(&proto, OpCode::Concat).unwrap();
    assert_eq!(proto.code[pc].arg_u(), 4);
}

#[test]
fn comparison_value_materializes_nil_or_one() {
    let (proto, _) = compile_str("local a, b\nreturn a <= b");
    let jmp = find_opcode(&proto, OpCode::JmpLe).unwrap();
    let p_nil = find_opcode(&proto, OpCode::PushNilJmp).unwrap();
    let p_one = find_opcode(&proto, OpCode::PushInt).unwrap();
    assert_eq!(p_nil, jmp + 1);
    assert_eq!(p_one, p_nil + 1);
    // The comparison jumps over the nil to the 1.
    assert_eq!(proto.code[jmp].arg_s(), 1);
}

#[test]
fn and_or_mixed_value() {
    let (proto, _) = compile_str("local a, b, c\nreturn a and b or c");
    // The `or` keeps its left value; the `and`'s false jump leads to `c`,
    // whose own value replaces the discarded one.
    assert!(has_opcode(&proto, OpCode::JmpOnT));
    assert!(has_opcode(&proto, OpCode::JmpF));
    assert!(!has_opcode(&proto, OpCode::JmpOnF));
}

#[test]
fn not_of_comparison_inverts_it() {
    let (proto, _) = compile_str("local a, b\nreturn not (a == b)");
    assert!(has_opcode(&proto, OpCode::JmpNe));
    assert!(!has_opcode(&proto, OpCode::JmpEq));
    assert!(!has_opcode(&proto, OpCode::Not));
}

#[test]
fn double_negative_folds_back() {
    let (proto, _) = compile_str("return - -7");
    let pc = find_opcode(&proto, OpCode::PushInt).unwrap();
    assert_eq!(proto.code[pc].arg_s(), 7);
    assert!(!has_opcode(&proto, OpCode::Minus));
}

#[test]
fn unary_minus_on_variable_emits_minus() {
    let (proto, _) = compile_str("local a\nreturn -a");
    assert!(has_opcode(&proto, OpCode::Minus));
}

#[test]
fn number_pool_reused_across_literals() {
    let (proto, _) = compile_str("return 0.5 + 0.5");
    assert_eq!(proto.knum, vec![0.5]);
}

#[test]
fn string_pool_reuses_repeated_names() {
    // The same identifier as a global and a field shares one constant.
    let (proto, strings) = compile_str("x = x");
    let xs = proto
        .kstr
        .iter()
        .filter(|id| strings.get_bytes(**id) == b"x")
        .count();
    assert_eq!(xs, 1);
}

#[test]
fn parenthesized_call_closed_to_one_value() {
    let (proto, _) = compile_str("local a\na = (f())");
    let call = find_opcode(&proto, OpCode::Call).unwrap();
    assert_eq!(proto.code[call].arg_b(), 1);
}

#[test]
fn call_chains() {
    let (proto, _) = compile_str("f()()");
    assert_eq!(count_opcode(&proto, OpCode::Call), 2);
}

#[test]
fn method_call_on_field() {
    let (proto, _) = compile_str("local t\nt.child:go()");
    assert!(has_opcode(&proto, OpCode::GetDotted));
    assert!(has_opcode(&proto, OpCode::PushSelf));
}

#[test]
fn index_chain() {
    let (proto, _) = compile_str("local t\nreturn t.a.b[1]");
    assert_eq!(count_opcode(&proto, OpCode::GetDotted), 2);
    assert!(has_opcode(&proto, OpCode::GetTable));
}
