//! Parse input configuration file

use std::fmt;
use std::error::Error;
use std::path::Path;
use yaml_rust::{YamlLoader, yaml::Yaml};
use meval::Context;

use crate::balance::{BalancePolicy, Trigger};
use crate::block::Stencil;
use crate::geometry::{Connectivity, MAX_DIMS};
use crate::strategy::AssignmentStrategy;
use crate::topology::Topology;

pub enum InputError {
    InvalidInputFile(&'static str),
    CouldNotParse(String, String),
    MissingField(String, String),
    InvalidValue(String, String),
}

impl fmt::Debug for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InputError::*;
        let help_msg = "Usage: [mpirun -n np] ./dlb input-file";
        match self {
            InvalidInputFile(s) => write!(f, "invalid input file: {}\n{}", s, help_msg),
            CouldNotParse(token,field) => write!(f, "unable to parse '{}' = '{}' in configuration file", token, field),
            MissingField(section,field) => write!(f, "unable to find '{}' in section '{}' with correct type in configuration file", field, section),
            InvalidValue(field,reason) => write!(f, "'{}' in configuration file {}", field, reason),
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for InputError {}

/// Represents the input configuration, can be queried
/// for desired parameters
pub struct Configuration<'a> {
    input: Yaml,
    ctx: Context<'a>,
}

impl<'a> Configuration<'a> {
    pub fn from_file(path: &Path) -> Result<Configuration<'a>,InputError> {
        let contents = std::fs::read_to_string(path).map_err(|_e| InputError::InvalidInputFile("unable to read file"))?;
        Configuration::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Configuration<'a>,InputError> {
        let input = YamlLoader::load_from_str(contents).map_err(|_e| InputError::InvalidInputFile("yaml trouble"))?;
        let input = input.first().ok_or(InputError::InvalidInputFile("yaml trouble"))?;
        Ok(Configuration {
            input: input.clone(),
            ctx: Context::new(),
        })
    }

    /// Makes the named constants of `section` available to expressions
    pub fn with_context(&mut self, section: &str) -> &mut Self {
        self.ctx
            .var("kilo", 1.0e3)
            .var("mega", 1.0e6)
            .var("milli", 1.0e-3)
            .func2("min", f64::min)
            .func2("max", f64::max);

        // Read in from 'constants' block
        let tmp = self.ctx.clone(); // a constant cannot depend on other constants yet...

        if let Some(hash) = self.input[section].as_hash() {
            for (a, b) in hash {
                match (a, b) {
                    (Yaml::String(s), Yaml::Real(v)) => {
                        if let Ok(num) = v.parse::<f64>() {self.ctx.var(s, num);}
                    },
                    (Yaml::String(s), Yaml::Integer(i)) => {
                        self.ctx.var(s, *i as f64);
                    },
                    (Yaml::String(s), Yaml::String(v)) => {
                        if let Ok(expr) = v.parse::<meval::Expr>() {
                            if let Ok(num) = expr.eval_with_context(&tmp) {self.ctx.var(s, num);}
                        }
                    },
                    _ => ()
                }
            }
        }

        self
    }

    pub fn has(&self, section: &str, field: &str) -> bool {
        !self.input[section][field].is_badvalue()
    }

    fn evaluate(&self, name: &str, y: &Yaml) -> Option<Result<f64, InputError>> {
        match y {
            Yaml::Real(s) => Some(s.parse::<f64>().map_err(|_| InputError::CouldNotParse(name.to_owned(), s.clone()))),
            Yaml::Integer(i) => Some(Ok(*i as f64)),
            Yaml::String(s) => {
                let value = s.parse::<meval::Expr>()
                    .map_err(|_| InputError::CouldNotParse(name.to_owned(), s.clone()))
                    .and_then(|expr| expr.eval_with_context(&self.ctx).map_err(|_| InputError::CouldNotParse(name.to_owned(), s.clone())));
                Some(value)
            },
            _ => None,
        }
    }

    pub fn real(&self, section: &str, field: &str) -> Result<f64, InputError> {
        self.evaluate(field, &self.input[section][field])
            .unwrap_or_else(|| Err(InputError::MissingField(section.to_owned(), field.to_owned())))
    }

    /// Integer, or an expression that evaluates to one
    pub fn integer(&self, section: &str, field: &str) -> Result<i64, InputError> {
        match &self.input[section][field] {
            Yaml::Integer(i) => Ok(*i),
            Yaml::String(s) => {
                let v = self.evaluate(field, &self.input[section][field]).unwrap_or_else(|| Err(InputError::MissingField(section.to_owned(), field.to_owned())))?;
                if v.fract() == 0.0 && v.is_finite() {
                    Ok(v as i64)
                } else {
                    Err(InputError::CouldNotParse(field.to_owned(), s.clone()))
                }
            },
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn unsigned(&self, section: &str, field: &str) -> Result<usize, InputError> {
        let i = self.integer(section, field)?;
        if i < 0 {
            Err(InputError::InvalidValue(field.to_owned(), "must not be negative".to_owned()))
        } else {
            Ok(i as usize)
        }
    }

    pub fn bool(&self, section: &str, field: &str) -> Result<bool, InputError> {
        match &self.input[section][field] {
            Yaml::Boolean(b) => Ok(*b),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn strings(&self, section: &str, field: &str) -> Result<Vec<String>, InputError> {
        let name = field.to_owned();
        match &self.input[section][field] {
            Yaml::String(s) => {
                Ok(vec![s.clone()])
            },
            Yaml::Array(array) => {
                let take_yaml_string = |y: &Yaml| -> Option<String> {
                    match y {
                        Yaml::String(s) => Some(s.clone()),
                        _ => None
                    }
                };
                let got: Vec<String> = array.iter().filter_map(take_yaml_string).collect();
                if got.is_empty() {
                    Err(InputError::CouldNotParse(section.to_owned(), name))
                } else {
                    Ok(got)
                }
            },
            _ => Err(InputError::MissingField(section.to_owned(), name))
        }
    }

    pub fn string(&self, section: &str, field: &str) -> Result<String, InputError> {
        let strs = self.strings(section, field)?;
        strs.into_iter().next().ok_or_else(|| InputError::MissingField(section.to_owned(), field.to_owned()))
    }

    /// Array of reals (or a single value)
    pub fn reals(&self, section: &str, field: &str) -> Result<Vec<f64>, InputError> {
        match &self.input[section][field] {
            Yaml::Array(array) => array.iter()
                .map(|y| self.evaluate(field, y).unwrap_or_else(|| Err(InputError::CouldNotParse(field.to_owned(), format!("{:?}", y)))))
                .collect(),
            y => self.evaluate(field, y)
                .map(|v| v.map(|x| vec![x]))
                .unwrap_or_else(|| Err(InputError::MissingField(section.to_owned(), field.to_owned()))),
        }
    }

    /// Array of non-negative integers (or a single value)
    pub fn unsigneds(&self, section: &str, field: &str) -> Result<Vec<usize>, InputError> {
        self.reals(section, field)?
            .into_iter()
            .map(|v| {
                if v >= 0.0 && v.fract() == 0.0 && v.is_finite() {
                    Ok(v as usize)
                } else {
                    Err(InputError::CouldNotParse(field.to_owned(), v.to_string()))
                }
            })
            .collect()
    }
}

/// Synthetic slowdown of selected ranks
#[derive(Clone, Debug, PartialEq)]
pub struct Imbalance {
    pub ranks: Vec<usize>,
    /// Multiplier on the measured step time
    pub factor: f64,
    /// Relative standard deviation of the slowdown
    pub jitter: f64,
    pub seed: u64,
}

/// Everything a run needs, extracted from a `Configuration` once so
/// it can be shared between ranks.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub domain: Vec<usize>,
    pub stencil: Stencil,
    pub topology_shape: Option<Vec<usize>>,
    pub strategy: AssignmentStrategy,
    pub policy: BalancePolicy,
    pub steps: usize,
    pub ranks: usize,
    pub output_every: usize,
    pub alpha: f64,
    pub imbalance: Option<Imbalance>,
    pub log_level: String,
}

impl RunConfig {
    /// Reads and validates the input file at `path`, with the `constants`
    /// section available to every expression
    pub fn load(path: &Path) -> crate::Result<RunConfig> {
        let mut config = Configuration::from_file(path)?;
        config.with_context("constants");
        Ok(RunConfig::from_configuration(&config)?)
    }

    /// As [`RunConfig::load`], from the file's contents
    pub fn parse(contents: &str) -> crate::Result<RunConfig> {
        let mut config = Configuration::from_yaml(contents)?;
        config.with_context("constants");
        Ok(RunConfig::from_configuration(&config)?)
    }

    pub fn from_configuration(config: &Configuration) -> Result<RunConfig, InputError> {
        // Domain
        let domain = config.unsigneds("domain", "shape")?;
        if domain.is_empty() || domain.len() > MAX_DIMS {
            return Err(InputError::InvalidValue("shape".to_owned(), format!("must have 1 to {} axes", MAX_DIMS)));
        }
        let halo = if config.has("domain", "halo") { config.unsigned("domain", "halo")? } else { 1 };
        let connectivity = config.string("domain", "connectivity")
            .map(|s| Connectivity::from(s.as_str()))
            .unwrap_or(Connectivity::Faces);

        // Topology
        let topology_shape = if config.has("topology", "shape") {
            Some(config.unsigneds("topology", "shape")?)
        } else {
            None
        };
        let axis = if config.has("topology", "axis") { config.unsigned("topology", "axis")? } else { 0 };
        let strategy = match config.string("topology", "strategy").as_deref().unwrap_or("uniform") {
            "uniform" => AssignmentStrategy::Uniform,
            "striped" => AssignmentStrategy::Striped { axis },
            "bisection" => AssignmentStrategy::Bisection,
            "weighted" => AssignmentStrategy::Weighted { weights: config.reals("topology", "weights")? },
            other => return Err(InputError::CouldNotParse("strategy".to_owned(), other.to_owned())),
        };

        // Balancing
        let defaults = BalancePolicy::default();
        let policy = BalancePolicy {
            enabled: config.bool("balance", "enabled").unwrap_or(defaults.enabled),
            trigger: config.string("balance", "trigger").map(|s| Trigger::from(s.as_str())).unwrap_or(defaults.trigger),
            threshold: if config.has("balance", "threshold") { config.real("balance", "threshold")? } else { defaults.threshold },
            interval: if config.has("balance", "interval") { config.unsigned("balance", "interval")? } else { defaults.interval },
            max_displacement: if config.has("balance", "max_displacement") { config.real("balance", "max_displacement")? } else { defaults.max_displacement },
            min_improvement: if config.has("balance", "min_improvement") { config.real("balance", "min_improvement")? } else { defaults.min_improvement },
            axis: if config.has("balance", "axis") { Some(config.unsigned("balance", "axis")?) } else { defaults.axis },
        };
        if policy.threshold < 1.0 {
            return Err(InputError::InvalidValue("threshold".to_owned(), "must be at least 1".to_owned()));
        }
        if policy.interval == 0 {
            return Err(InputError::InvalidValue("interval".to_owned(), "must be positive".to_owned()));
        }
        if !(policy.max_displacement > 0.0 && policy.max_displacement <= 1.0) {
            return Err(InputError::InvalidValue("max_displacement".to_owned(), "must lie in (0, 1]".to_owned()));
        }

        // Control
        let steps = config.unsigned("control", "steps")?;
        let ranks = if config.has("control", "ranks") { config.unsigned("control", "ranks")? } else { 4 };
        let output_every = if config.has("control", "output_every") {
            config.unsigned("control", "output_every")?
        } else {
            (steps / 10).max(1)
        };
        let alpha = if config.has("control", "alpha") { config.real("control", "alpha")? } else { 0.2 };

        let imbalance = if config.has("imbalance", "ranks") {
            Some(Imbalance {
                ranks: config.unsigneds("imbalance", "ranks")?,
                factor: if config.has("imbalance", "factor") { config.real("imbalance", "factor")? } else { 2.0 },
                jitter: if config.has("imbalance", "jitter") { config.real("imbalance", "jitter")? } else { 0.0 },
                seed: if config.has("imbalance", "seed") { config.unsigned("imbalance", "seed")? as u64 } else { 0 },
            })
        } else {
            None
        };

        let log_level = config.string("output", "log_level").unwrap_or_else(|_| "info".to_owned());

        Ok(RunConfig {
            domain,
            stencil: Stencil::new(halo, connectivity),
            topology_shape,
            strategy,
            policy,
            steps,
            ranks: ranks.max(1),
            output_every: output_every.max(1),
            alpha,
            imbalance,
            log_level,
        })
    }

    /// Topology shape for `participants` ranks: as configured, a line of
    /// ranks along the stripe axis, or the most nearly cubic factorisation.
    pub fn topology_shape_for(&self, participants: usize) -> Vec<usize> {
        if let Some(shape) = &self.topology_shape {
            return shape.clone();
        }
        match self.strategy {
            AssignmentStrategy::Striped { axis } if axis < self.domain.len() => {
                let mut shape = vec![1; self.domain.len()];
                shape[axis] = participants;
                shape
            },
            _ => Topology::balanced_shape(participants, self.domain.len()),
        }
    }
}

#[rustversion::since(1.38)]
pub fn ettc (start: std::time::Instant, current: usize, total: usize) -> std::time::Duration {
    let rt = start.elapsed().as_secs_f64();
    let ettc = rt * ((total - current) as f64) / (current as f64);
    std::time::Duration::from_secs_f64(ettc)
}

#[rustversion::before(1.38)]
pub fn ettc (start: std::time::Instant, current: usize, total: usize) -> std::time::Duration {
    let rt = start.elapsed();
    let rt = (rt.as_secs() as f64) + (rt.subsec_nanos() as f64) * 1.0e-9;
    let ettc = rt * ((total - current) as f64) / (current as f64);
    std::time::Duration::from_secs(ettc as u64)
}

pub struct PrettyDuration {
    pub duration: std::time::Duration,
}

impl From<std::time::Duration> for PrettyDuration {
    fn from(duration: std::time::Duration) -> PrettyDuration {
        PrettyDuration {duration}
    }
}

impl fmt::Display for PrettyDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut t = self.duration.as_secs();
        let s = t % 60;
        t /= 60;
        let min = t % 60;
        t /= 60;
        let hr = t % 24;
        let d = t / 24;
        if d > 0 {
            write!(f, "{}d {:02}:{:02}:{:02}", d, hr, min, s)
        } else {
            write!(f, "{:02}:{:02}:{:02}", hr, min, s)
        }
    }
}
