//! Immutable typed snapshot of a run configuration, built from a task document
//! (see `Utils::task_parser`) or directly in code.
use crate::Utils::task_parser::{DocumentMap, TaskSection, parse_document, parse_document_file};
use crate::numerical::IVP::IVP_context::{DerivativeSettings, DerivativeStrategy};
use crate::numerical::Solvers::solver_api::SolverKind;
use crate::numerical::Solvers::step_control::StepControlType;
use crate::numerical::stepper_error::{Result, StepperError};
use log::LevelFilter;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

fn parse_name<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        StepperError::Configuration(format!("unknown {}.{} '{}'", section, key, value))
    })
}

#[derive(Debug, Clone)]
pub struct IVPSettings {
    pub name: String,
    pub derivatives: DerivativeSettings,
    /// numeric problem parameters (epsilon, lambda, size...)
    pub parameters: HashMap<String, f64>,
}

impl IVPSettings {
    pub fn new(name: &str) -> Self {
        IVPSettings {
            name: name.to_string(),
            derivatives: DerivativeSettings::default(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: f64) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn parameter(&self, key: &str, default: f64) -> f64 {
        self.parameters.get(key).copied().unwrap_or(default)
    }

    fn from_section(section: &TaskSection, sparse: bool) -> Result<Self> {
        let name = section.require_string("name")?;
        let jacobian = parse_name("problem", "jacobian", &section.string_or("jacobian", "Forward"))?;
        let dfdt = parse_name("problem", "dfdt", &section.string_or("dfdt", "Forward"))?;
        let derivatives = DerivativeSettings {
            jacobian,
            dfdt,
            jac_delta: section.f64_or("jac_delta", 1e-5)?,
            dt_delta: section.f64_or("dt_delta", 1e-5)?,
            jacobian_splitting: section.bool_or("jacobian_splitting", false)?,
            jacobian_scaling: section.f64_or("jacobian_scaling", 1.0)?,
            sparse,
        };
        let mut parameters = HashMap::new();
        for key in ["epsilon", "lambda", "y0", "size", "stiffness", "diffusion", "reaction"] {
            if section.contains(key) {
                parameters.insert(key.to_string(), section.require_f64(key)?);
            }
        }
        Ok(IVPSettings {
            name,
            derivatives,
            parameters,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MethodSettings {
    pub name: String,
    pub sparse: bool,
    pub newton_tol: f64,
    pub newton_fail: f64,
    /// Chebyshev damping
    pub eta: f64,
    pub max_stages: usize,
    /// swap which split is propagated exponentially
    pub flipexp: bool,
    /// RODAS coefficient set
    pub elliptic: i64,
}

impl MethodSettings {
    pub fn new(name: &str) -> Self {
        MethodSettings {
            name: name.to_string(),
            sparse: false,
            newton_tol: 1e-8,
            newton_fail: 1e20,
            eta: 2.0 / 13.0,
            max_stages: 100,
            flipexp: false,
            elliptic: 0,
        }
    }

    fn from_section(section: &TaskSection) -> Result<Self> {
        let defaults = MethodSettings::new("");
        let settings = MethodSettings {
            name: section.require_string("name")?,
            sparse: section.bool_or("sparse", defaults.sparse)?,
            newton_tol: section.f64_or("newton_tol", defaults.newton_tol)?,
            newton_fail: section.f64_or("newton_fail", defaults.newton_fail)?,
            eta: section.f64_or("eta", defaults.eta)?,
            max_stages: section.usize_or("max_stages", defaults.max_stages)?,
            flipexp: section.bool_or("flipexp", defaults.flipexp)?,
            elliptic: section.i64_or("elliptic", defaults.elliptic)?,
        };
        if settings.max_stages < 2 {
            return Err(StepperError::Configuration("method.max_stages must be at least 2".to_string()));
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub kind: SolverKind,
    pub path: PathBuf,
    pub tn: f64,
    pub tf: f64,
    pub dt: f64,
    pub last_step_stretch: f64,
    pub max_steps: usize,
    pub min_write_time: f64,
    pub write_output: bool,
    pub rtol: f64,
    pub atol: f64,
    pub safety: f64,
    pub min_change: f64,
    pub max_change: f64,
    pub max_rej_change: f64,
    pub restrict_reject: bool,
    pub step_control: StepControlType,
}

impl SolverSettings {
    pub fn new(kind: SolverKind, path: &Path, tf: f64) -> Self {
        SolverSettings {
            kind,
            path: path.to_path_buf(),
            tn: 0.0,
            tf,
            dt: 1e-3,
            last_step_stretch: 1.1,
            max_steps: 100000,
            min_write_time: 0.0,
            write_output: true,
            rtol: 1e-5,
            atol: 1e-5,
            safety: 0.9,
            min_change: 0.2,
            max_change: 5.0,
            max_rej_change: 1.0,
            restrict_reject: true,
            step_control: StepControlType::Standard,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dt <= 0.0 {
            return Err(StepperError::Configuration("timestep cannot be zero".to_string()));
        }
        if self.tf <= self.tn {
            return Err(StepperError::Configuration("final time must exceed initial time".to_string()));
        }
        if self.safety <= 0.0 || self.min_change <= 0.0 || self.max_change <= 0.0 || self.max_rej_change <= 0.0 {
            return Err(StepperError::Configuration(
                "safety, minchange, maxchange and maxrejchange must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn from_section(section: &TaskSection) -> Result<Self> {
        let kind = parse_name("solver", "name", &section.require_string("name")?)?;
        let path = PathBuf::from(section.require_string("path").map_err(|_| {
            StepperError::Configuration("solver requires output path".to_string())
        })?);
        let tf = section.require_f64("tf").map_err(|_| {
            StepperError::Configuration("solver requires final time".to_string())
        })?;
        let d = SolverSettings::new(kind, &path, tf);
        let settings = SolverSettings {
            tn: section.f64_or("tn", d.tn)?,
            dt: section.f64_or("dt", d.dt)?,
            last_step_stretch: section.f64_or("last_step_stretch", d.last_step_stretch)?,
            max_steps: section.usize_or("max_steps", d.max_steps)?,
            min_write_time: section.f64_or("min_write_time", d.min_write_time)?,
            write_output: section.bool_or("write_output", d.write_output)?,
            rtol: section.f64_or("rtol", d.rtol)?,
            atol: section.f64_or("atol", d.atol)?,
            safety: section.f64_or("safety", d.safety)?,
            min_change: section.f64_or("minchange", d.min_change)?,
            max_change: section.f64_or("maxchange", d.max_change)?,
            max_rej_change: section.f64_or("maxrejchange", d.max_rej_change)?,
            restrict_reject: section.bool_or("restrict_reject", d.restrict_reject)?,
            step_control: parse_name("solver", "step_control", &section.string_or("step_control", "Standard"))?,
            ..d
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub console: bool,
    pub file: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: LevelFilter::Info,
            console: true,
            file: None,
        }
    }
}

impl LogSettings {
    fn from_section(section: &TaskSection) -> Result<Self> {
        let level = parse_name("logging", "level", &section.string_or("level", "info"))?;
        Ok(LogSettings {
            level,
            console: section.bool_or("console", true)?,
            file: section.string("file"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub ivp: IVPSettings,
    pub method: MethodSettings,
    pub solver: SolverSettings,
    pub log: LogSettings,
    /// flattened document entries, echoed into the run summary
    pub entries: Vec<(String, String)>,
}

impl RunConfig {
    pub fn from_document(document: &DocumentMap) -> Result<Self> {
        let problem = TaskSection::new(document, "problem");
        let method_section = TaskSection::new(document, "method");
        let solver_section = TaskSection::new(document, "solver");
        let logging = TaskSection::new(document, "logging");
        let method = MethodSettings::from_section(&method_section)?;
        let ivp = IVPSettings::from_section(&problem, method.sparse)?;
        let solver = SolverSettings::from_section(&solver_section)?;
        let log = LogSettings::from_section(&logging)?;
        let mut entries = Vec::new();
        for section in [&problem, &method_section, &solver_section] {
            entries.extend(section.entries());
        }
        Ok(RunConfig {
            ivp,
            method,
            solver,
            log,
            entries,
        })
    }

    pub fn from_str(input: &str) -> Result<Self> {
        RunConfig::from_document(&parse_document(input)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        RunConfig::from_document(&parse_document_file(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const TASK: &str = "
problem
  name: VanDerPol
  epsilon: 0.001
  jacobian: Analytic
method
  name: Radau5
  sparse: true
  newton_tol: 1e-10
solver
  name: EmbeddedSolver
  path: out
  tf: 2
  rtol: 1e-6
  step_control: Mixed
logging
  level: debug
  console: false
";

    #[test]
    fn full_document_is_read_with_defaults() {
        let config = RunConfig::from_str(TASK).unwrap();
        assert_eq!(config.ivp.name, "VanDerPol");
        assert_eq!(config.ivp.derivatives.jacobian, DerivativeStrategy::Analytic);
        assert_eq!(config.ivp.derivatives.dfdt, DerivativeStrategy::Forward);
        assert!(config.ivp.derivatives.sparse);
        assert_relative_eq!(config.ivp.parameter("epsilon", 0.01), 0.001);
        assert_relative_eq!(config.method.newton_tol, 1e-10);
        assert_relative_eq!(config.method.newton_fail, 1e20);
        assert_eq!(config.method.max_stages, 100);
        assert_eq!(config.solver.kind, SolverKind::EmbeddedSolver);
        assert_eq!(config.solver.step_control, StepControlType::Mixed);
        assert_relative_eq!(config.solver.rtol, 1e-6);
        assert_relative_eq!(config.solver.atol, 1e-5);
        assert_relative_eq!(config.solver.dt, 1e-3);
        assert_eq!(config.solver.max_steps, 100000);
        assert_eq!(config.log.level, LevelFilter::Debug);
        assert!(!config.log.console);
        assert!(config.entries.iter().any(|(k, v)| k == "method name" && v == "Radau5"));
    }

    #[test]
    fn missing_required_keys_are_configuration_errors() {
        let no_path = "problem name: ExponentialDecay method name: RK4 solver name: ConstantSolver tf: 1";
        assert!(matches!(RunConfig::from_str(no_path), Err(StepperError::Configuration(_))));
        let no_method = "problem name: ExponentialDecay solver name: ConstantSolver tf: 1 path: out";
        assert!(matches!(RunConfig::from_str(no_method), Err(StepperError::Configuration(_))));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let bad_solver = "problem name: ExponentialDecay method name: RK4 solver name: Magic tf: 1 path: out";
        assert!(matches!(RunConfig::from_str(bad_solver), Err(StepperError::Configuration(_))));
        let bad_control =
            "problem name: ExponentialDecay method name: RK4 solver name: EmbeddedSolver tf: 1 path: out step_control: PID";
        assert!(matches!(RunConfig::from_str(bad_control), Err(StepperError::Configuration(_))));
        let bad_strategy =
            "problem name: ExponentialDecay jacobian: Symbolic method name: RK4 solver name: EmbeddedSolver tf: 1 path: out";
        assert!(matches!(RunConfig::from_str(bad_strategy), Err(StepperError::Configuration(_))));
    }

    #[test]
    fn non_positive_timestep_is_rejected() {
        let zero_dt = "problem name: ExponentialDecay method name: RK4 solver name: ConstantSolver tf: 1 path: out dt: 0";
        assert!(matches!(RunConfig::from_str(zero_dt), Err(StepperError::Configuration(_))));
    }
}
