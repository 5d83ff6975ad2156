//! selenite - run a pre-compiled Lua 5.1 chunk from the command line.

use std::process;

use selenite::{LuaVM, Value};

fn main() {
    env_logger::init();
    if let Err(message) = run() {
        eprintln!("selenite: {}", message);
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(path) if path != "--help" => path,
        _ => {
            eprintln!("usage: selenite <chunk.luac> [args...]");
            process::exit(2);
        }
    };
    let script_args: Vec<Value> = args.map(Value::string).collect();

    let bytes = std::fs::read(&path).map_err(|e| format!("{}: {}", path, e))?;
    let mut vm = LuaVM::load(&bytes).map_err(|e| e.to_string())?;
    let results = vm.run_with_args(script_args).map_err(|e| e.to_string())?;

    if !results.is_empty() {
        let line = results
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        println!("{}", line);
    }
    Ok(())
}
