#![no_main]

use crescent_compiler::lexer::Lexer;
use crescent_compiler::token::Token;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The lexer must never panic on any input — errors are fine, panics are bugs.
    let mut lexer = Lexer::new(data);
    loop {
        match lexer.next_token() {
            Ok(st) => {
                if st.token == Token::Eos {
                    break;
                }
            }
            Err(_) => break,
        }
    }
});
