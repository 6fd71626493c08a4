use std::collections::HashMap;
use std::fs;
use std::process;

use clap::Parser;
use colored::Colorize;

use exprvm::prelude::*;
use exprvm::Real;

#[derive(Parser)]
#[command(name = "exprvm")]
#[command(about = "Compile expression scripts to bytecode and evaluate them")]
#[command(version)]
struct Args {
    /// Path to the script file.
    script: String,

    /// Input values as name=value pairs, e.g. -i x=1.5.
    #[arg(short, long = "input", value_name = "NAME=VALUE")]
    inputs: Vec<String>,

    /// Print the compiled program's disassembly.
    #[arg(short, long)]
    disassemble: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(error) = run(&args) {
        eprintln!("{} {error}", "error:".red().bold());
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let source = fs::read_to_string(&args.script)?;

    let mut compiler = Compiler::new();
    compiler.add_function("sin", SIN)?;
    compiler.add_function("cos", COS)?;
    compiler.add_function("sqrt", Real::sqrt)?;
    compiler.add_function("exp", Real::exp)?;
    compiler.add_function("ln", Real::ln)?;
    compiler.add_source_script(&source)?;

    let program = compiler.compile()?;

    if args.disassemble {
        println!("{}", "-- Compiled program".cyan());
        println!("{}", disassemble(&program));
    }

    let inputs = parse_inputs(&args.inputs)?;
    if !inputs.is_empty() || !program.outputs().is_empty() {
        let mut executable = program.make_scalar_executable();
        for (name, value) in &inputs {
            executable.write(program.input_address(name)?, *value);
        }
        executable.run();

        println!("{}", "-- Outputs".cyan());
        let mut names: Vec<&String> = program.outputs().keys().collect();
        names.sort();
        for name in names {
            let value = executable.read(program.output_address(name)?);
            println!("{} = {value}", name.bold());
        }
    }
    Ok(())
}

fn parse_inputs(pairs: &[String]) -> Result<HashMap<String, Real>, String> {
    let mut inputs = HashMap::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid input '{pair}', expected name=value"))?;
        let value: Real = value
            .parse()
            .map_err(|_| format!("invalid value in '{pair}'"))?;
        inputs.insert(name.to_string(), value);
    }
    Ok(inputs)
}
