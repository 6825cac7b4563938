//! Thin CLI host: read a script file, create a VM, optionally dump the
//! compiled bytecode, run it once.

use std::env;
use std::fs;
use std::process;

use rill::{Vm, VmConfig};

fn main() {
    let mut disasm = false;
    let mut path: Option<String> = None;

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--disasm" => disasm = true,
            "--help" | "-h" => {
                eprintln!("usage: rill [--disasm] <script>");
                return;
            }
            other => path = Some(other.to_string()),
        }
    }

    let Some(path) = path else {
        eprintln!("usage: rill [--disasm] <script>");
        process::exit(1);
    };

    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{}: {}", path, err);
            process::exit(1);
        }
    };

    let mut vm = match Vm::new(VmConfig::from_source(&source)) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    if disasm {
        eprint!("{}", vm.disassemble());
    }

    if let Err(err) = vm.run(&[0]) {
        eprintln!("{}", err);
        process::exit(1);
    }
}
