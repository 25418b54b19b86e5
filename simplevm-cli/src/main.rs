use anyhow::Result;
use clap::Parser;
use simplevm::exec::ExecStatus;

/// Loads, verifies and runs a compiled simplevm module.
#[derive(Debug, Parser)]
#[command(name = "simplevm", version)]
struct Args {
	/// Path to a `.sbc` module file.
	module: std::path::PathBuf,

	/// Skip the static verifier and run the module as-is.
	#[arg(long)]
	no_verify: bool,

	/// Disable tiered compilation; run purely interpreted.
	#[arg(long)]
	no_jit: bool,
}

fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let args = Args::parse();
	std::process::exit(run(&args));
}

/// Exit codes: 0 on a clean halt, 1 on load failure, verify failure or
/// runtime trap. `try_run`'s `anyhow::Error` carries the exact
/// `<prefix> failed: <msg>` line this prints to stderr verbatim.
fn run(args: &Args) -> i32 {
	match try_run(args) {
		Ok(exit_code) => exit_code,
		Err(e) => {
			eprintln!("{e}");
			1
		}
	}
}

fn try_run(args: &Args) -> Result<i32> {
	let module = simplevm::loader::load_file(&args.module).map_err(|e| anyhow::anyhow!("load failed: {e}"))?;

	let result = simplevm::execute(&module, simplevm::ReferenceHost, args.no_verify, !args.no_jit)
		.map_err(|e| anyhow::anyhow!("verify failed: {e}"))?;

	Ok(match result.status {
		ExecStatus::Halted => result.exit_code,
		ExecStatus::Trapped => {
			eprintln!("runtime trap: {}", result.error);
			1
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn load_failure_reports_exit_code_one() {
		let args = Args {
			module: std::path::PathBuf::from("/nonexistent/module.sbc"),
			no_verify: false,
			no_jit: false,
		};
		assert_eq!(run(&args), 1);
	}
}
