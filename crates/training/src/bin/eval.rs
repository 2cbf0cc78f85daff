use clap::Parser;
use training::util::{init_tracing, run_eval, EvalArgs};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = EvalArgs::parse();
    let report = run_eval(args)?;
    println!(
        "FROC area: small (>= {} mm) {:.4}, large (>= {} mm) {:.4}",
        report.small.min_diameter_mm, report.area_small, report.big.min_diameter_mm, report.area_big
    );
    Ok(())
}
