use std::io::Read;
use std::process::ExitCode;

use crescent_compiler::compiler;
use crescent_compiler::disasm;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> ! {
    eprintln!(
        "usage: crescent [options] [script]\n\
         options:\n\
         \x20 -e stat  compile string 'stat'\n\
         \x20 -p       parse only (no listing)\n\
         \x20 -v       show version\n\
         \x20 --       stop handling options\n\
         \x20 -        compile stdin"
    );
    std::process::exit(1);
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let mut script_file: Option<String> = None;
    let mut exec_statements: Vec<String> = Vec::new();
    let mut parse_only = false;
    let mut show_version = false;
    let mut saw_dashdash = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--" if !saw_dashdash => {
                saw_dashdash = true;
                i += 1;
            }
            "-v" if !saw_dashdash => {
                show_version = true;
                i += 1;
            }
            "-p" if !saw_dashdash => {
                parse_only = true;
                i += 1;
            }
            "-e" if !saw_dashdash => {
                if i + 1 >= args.len() {
                    eprintln!("crescent: '-e' needs argument");
                    return ExitCode::FAILURE;
                }
                exec_statements.push(args[i + 1].clone());
                i += 2;
            }
            arg => {
                if !saw_dashdash && arg.starts_with('-') && arg != "-" {
                    // Combined form like -e"code".
                    if let Some(rest) = arg.strip_prefix("-e") {
                        if !rest.is_empty() {
                            exec_statements.push(rest.to_string());
                            i += 1;
                            continue;
                        }
                    }
                    eprintln!("crescent: unrecognized option '{arg}'");
                    usage();
                }
                script_file = Some(arg.to_string());
                break;
            }
        }
    }

    if show_version {
        println!("crescent {VERSION}");
    }

    for stat in &exec_statements {
        if !run_chunk(stat.as_bytes(), "=(command line)", parse_only) {
            return ExitCode::FAILURE;
        }
    }

    if let Some(path) = script_file {
        let source = if path == "-" {
            let mut buf = Vec::new();
            if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                eprintln!("crescent: cannot read stdin: {e}");
                return ExitCode::FAILURE;
            }
            buf
        } else {
            match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    eprintln!("crescent: cannot open {path}: {e}");
                    return ExitCode::FAILURE;
                }
            }
        };
        let name = if path == "-" { "=stdin" } else { path.as_str() };
        if !run_chunk(strip_shebang(&source), name, parse_only) {
            return ExitCode::FAILURE;
        }
    } else if exec_statements.is_empty() && !show_version {
        usage();
    }

    ExitCode::SUCCESS
}

/// Compile one chunk; list it unless `parse_only`. Returns success.
fn run_chunk(source: &[u8], name: &str, parse_only: bool) -> bool {
    match compiler::compile(source, name) {
        Ok((proto, strings)) => {
            if !parse_only {
                print!("{}", disasm::disassemble(&proto, &strings));
            }
            true
        }
        Err(e) => {
            eprintln!("crescent: {name}:{e}");
            false
        }
    }
}

/// Scripts may start with `#!interpreter`; the first line is not ours.
fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        if let Some(pos) = source.iter().position(|&b| b == b'\n') {
            &source[pos..]
        } else {
            b""
        }
    } else {
        source
    }
}
