use anyhow::{anyhow, Context};
use clap::{value_parser, Arg, ArgAction, Command};
use sdo_artifact::TaskState;
use sdo_core::config::EngineConfig;
use sdo_core::simulator::{run_simulator, SimulatorConfig};
use sdo_kernel::{allowed_transitions, init_tracing, validate_transition};
use std::path::PathBuf;

fn config_arg(name: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file; environment overrides apply on top")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Command::new("sdo")
        .version(sdo_core::VERSION)
        .about("Software-change workflow orchestrator")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("simulate")
                .about("Run the engine end to end against scripted generation")
                .arg(
                    Arg::new("tasks")
                        .long("tasks")
                        .default_value("5")
                        .value_parser(value_parser!(usize))
                        .help("Number of work items to simulate"),
                )
                .arg(
                    Arg::new("fail-reviews")
                        .long("fail-reviews")
                        .default_value("1")
                        .value_parser(value_parser!(usize))
                        .help("Work items whose reviews always fail"),
                )
                .arg(
                    Arg::new("reject-plans")
                        .long("reject-plans")
                        .default_value("1")
                        .value_parser(value_parser!(usize))
                        .help("Work items whose first plan is rejected"),
                )
                .arg(config_arg("config"))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output report and logs as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(config_arg("file")),
        )
        .subcommand(
            Command::new("validate-transition")
                .about("Check a lifecycle transition")
                .arg(Arg::new("from").required(true).help("Current state, e.g. reviewing"))
                .arg(Arg::new("to").required(true).help("Target state")),
        );

    let matches = cli.get_matches();

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let json = args.get_flag("json");
            let engine = EngineConfig::load(args.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
            init_tracing(&engine.log_level, json).map_err(|e| anyhow!(e))?;

            let config = SimulatorConfig {
                tasks: args.get_one::<usize>("tasks").copied().unwrap_or(5),
                fail_reviews: args.get_one::<usize>("fail-reviews").copied().unwrap_or(1),
                reject_plans: args.get_one::<usize>("reject-plans").copied().unwrap_or(1),
                engine: engine.without_backoff(),
            };

            if !json {
                println!("Running SDO simulator...");
                println!("Tasks: {}", config.tasks);
                println!("Failing reviews: {}", config.fail_reviews);
                println!("Rejected plans: {}", config.reject_plans);
                println!();
            }

            let report = run_simulator(config).await.context("simulation aborted")?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report.generate_text());
            }

            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("config", args)) => {
            let engine = EngineConfig::load(args.get_one::<PathBuf>("file").map(PathBuf::as_path))?;
            print!("{}", engine.to_toml()?);
        }
        Some(("validate-transition", args)) => {
            let parse = |name: &str| -> anyhow::Result<TaskState> {
                let raw = args.get_one::<String>(name).map(String::as_str).unwrap_or_default();
                TaskState::parse(raw).ok_or_else(|| anyhow!("unknown state '{raw}'"))
            };
            let (from, to) = (parse("from")?, parse("to")?);
            match validate_transition(from, to) {
                Ok(()) => println!("{from} -> {to}: allowed"),
                Err(e) => {
                    let allowed: Vec<String> = allowed_transitions(from).iter().map(ToString::to_string).collect();
                    println!("{e}");
                    println!("allowed from {from}: {}", allowed.join(", "));
                    std::process::exit(1);
                }
            }
        }
        _ => unreachable!("clap requires a subcommand"),
    }

    Ok(())
}
