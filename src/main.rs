#![allow(non_snake_case)]
use RustedTimeStepper::Utils::logger::{init_logger, summary_table};
use RustedTimeStepper::numerical::IVP::IVP_context::IVPContext;
use RustedTimeStepper::numerical::IVP::test_problems::create_problem;
use RustedTimeStepper::numerical::Methods::method_api::Methods;
use RustedTimeStepper::numerical::Solvers::solver_api::Solver;
use RustedTimeStepper::numerical::stepper_config::RunConfig;
use RustedTimeStepper::numerical::stepper_error::{Result, StepperError};
use log::{error, info};
use std::env;
use std::process::ExitCode;

fn run(task_file: &str) -> Result<()> {
    let config = RunConfig::from_file(task_file)?;
    init_logger(&config.log)?;
    info!("task file {}", task_file);
    let problem = create_problem(&config.ivp)?;
    let ivp = IVPContext::new(problem.as_ref(), config.ivp.derivatives.clone())?;
    let method = Methods::new(&config.method)?;
    let mut solver = Solver::new(config.solver.clone(), method, ivp)?;
    let report = solver.run()?;
    let info = solver.dump_run_info(&report, &config.entries)?;
    info!("\n \n RUN STATISTICS \n \n {}", summary_table(&info));
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let result = match args.get(1) {
        Some(task_file) => run(task_file),
        None => Err(StepperError::Configuration("usage: RustedTimeStepper <task-file>".to_string())),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // the logger may not be up yet when the configuration itself is broken
            if log::log_enabled!(log::Level::Error) {
                error!("{}", e);
            } else {
                eprintln!("{}", e);
            }
            ExitCode::FAILURE
        }
    }
}
