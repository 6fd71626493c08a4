//! Evaluates a rotating-body metric tensor over a parameter grid.
//!
//! Demonstrates the intended evaluation pattern: compile the script once,
//! then give each rayon worker its own executable. The vector word's spare
//! lanes carry finite-difference offsets, so one run yields the value and a
//! derivative estimate per grid point.
//!
//! Run with: `cargo run --example metric`

use exprvm::prelude::*;
use exprvm::{Real, Vector};
use rayon::prelude::*;

const SOURCE: &str = "\
# Rotating-body surface metric
input  r
input  theta

param  M = 1                          # mass
param  J = 0.8                        # angular momentum
       a     = J / M                  # spin parameter
       r_s   = 2 * M
       SIGMA = r^2 + a^2*cos(theta)^2

output g_tt   = -(1 - r_s*r/SIGMA)
output g_rr   = SIGMA / [r^2 - r_s*r + a^2]
output g_phph = (r^2 + a^2 + [r_s*r*a^2]/SIGMA*sin(theta)^2) * sin(theta)^2
";

const THETA_STEPS: usize = 2001;
const DIFF_STEP: Real = 1e-3;

fn main() {
    let mut compiler = Compiler::new();
    compiler.add_function("sin", SIN).unwrap();
    compiler.add_function("cos", COS).unwrap();
    compiler.add_source_script(SOURCE).unwrap();
    let program = compiler.compile().unwrap();

    println!("{}", disassemble(&program));
    println!();

    let r_address = program.input_address("r").unwrap();
    let theta_address = program.input_address("theta").unwrap();
    let outputs = ["g_tt", "g_rr", "g_phph"]
        .map(|name| (name, program.output_address(name).unwrap()));

    let radii: Vec<Real> = (0..32).map(|i| 2.5 + 0.25 * i as Real).collect();
    let rows: Vec<(Real, [Real; 3], [Real; 3])> = radii
        .par_iter()
        .map(|&r| {
            let mut executable = program.make_vector_executable();
            // Lane 0 is the base point; lanes 1 and 2 are offset in r and
            // theta for finite differences.
            executable.write(r_address, Vector::new([r, r + DIFF_STEP, r, r]));
            let mut values = [0.0; 3];
            let mut dr = [0.0; 3];
            for step in 0..THETA_STEPS {
                let theta = std::f64::consts::PI * step as Real / (THETA_STEPS - 1) as Real;
                executable.write(
                    theta_address,
                    Vector::new([theta, theta, theta + DIFF_STEP, theta]),
                );
                executable.run();
                for (index, (_, address)) in outputs.iter().enumerate() {
                    let word = executable.read(*address);
                    values[index] = word[0];
                    dr[index] = (word[1] - word[0]) / DIFF_STEP;
                }
            }
            (r, values, dr)
        })
        .collect();

    println!("{:>6}  {:>12}  {:>12}  {:>12}  {:>12}", "r", "g_tt", "g_rr", "g_phph", "dg_tt/dr");
    for (r, values, dr) in rows {
        println!(
            "{r:>6.2}  {:>12.6}  {:>12.6}  {:>12.6}  {:>12.6}",
            values[0], values[1], values[2], dr[0]
        );
    }
}
