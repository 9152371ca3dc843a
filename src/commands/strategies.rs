//! Strategies command implementation

use anyhow::Result;
use trade_core::config::RunPolicyConfig;
use trade_core::strategies::{available_strategies, create_strategy};

pub fn run() -> Result<()> {
    let names = available_strategies();
    println!("\n{}", "=".repeat(60));
    println!("REGISTERED STRATEGIES");
    println!("{}", "=".repeat(60));
    println!("{:<24} {:>8} {:>10}", "Name", "Warmup", "Max Long");
    println!("{}", "-".repeat(60));
    for name in names.iter() {
        // default parameters only, to show the warmup the strategy needs
        match create_strategy(&RunPolicyConfig::new(name), "") {
            Ok(stg) => println!("{:<24} {:>8} {:>10}", name, stg.warmup_num(), stg.each_max_long()),
            Err(err) => println!("{:<24} {}", name, err),
        }
    }
    println!("{}", "=".repeat(60));
    Ok(())
}
