//! Built-in device tasks.
//!
//! A task is a named, parameterised template that expands into a SCPI command
//! sequence for one instrument model. The catalog validates parameters before
//! expansion and reports every problem at once:
//!
//! ```text
//! Missing required params: frequency. Out of range: amplitude=7 (expected 0..=5).
//! ```
//!
//! Each setting command is followed by an `*OPC?` query that must answer `1`,
//! so a job built from tasks fails as soon as the instrument stops accepting
//! settings.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sonaris_core::{Command, JobDefinition, ResponseValidator};
use std::fmt;
use thiserror::Error;

/// Task parameters as supplied by a caller.
pub type TaskParams = Map<String, Value>;

/// Highest frequency accepted by the DG4202 tasks, in Hz.
pub const DG4202_FREQ_LIMIT: f64 = 200e6;

/// Waveforms accepted by `Set Waveform Parameters`.
pub const DG4202_WAVEFORMS: [&str; 6] = ["SIN", "SQU", "RAMP", "PULS", "NOIS", "USER"];

static BUILTIN: Lazy<TaskCatalog> = Lazy::new(TaskCatalog::builtin);

/// Task lookup and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid parameters for '{task}': {}", .issues.join(" "))]
    InvalidParams { task: String, issues: Vec<String> },

    #[error("No task steps given")]
    Empty,
}

/// Expected JSON type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Integer
    Int,
    /// Number; integers are accepted
    Float,
    /// Boolean, strictly
    Bool,
    /// Text; numbers are accepted and stringified
    Text,
}

impl ParamType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Text => value.is_string() || value.is_number(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::Text => "str",
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Allowed values of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// Inclusive numeric range; an open end is unbounded.
    Range { min: Option<f64>, max: Option<f64> },
    /// Forced choice.
    OneOf { values: Vec<Value> },
}

impl Constraint {
    fn violation(&self, name: &str, value: &Value) -> Option<String> {
        match self {
            Constraint::Range { min, max } => {
                let number = value.as_f64()?;
                let below = min.is_some_and(|min| number < min);
                let above = max.is_some_and(|max| number > max);
                (below || above).then(|| {
                    let lo = min.map_or(String::new(), |v| v.to_string());
                    let hi = max.map_or(String::new(), |v| v.to_string());
                    format!("{name}={value} (expected {lo}..={hi})")
                })
            }
            Constraint::OneOf { values } => (!values.contains(value)).then(|| {
                let options: Vec<String> = values.iter().map(display_value).collect();
                format!("{name}={value} (expected {})", options.join(", "))
            }),
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One task parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: &'static str,
    /// Expected type.
    #[serde(rename = "type")]
    pub ty: ParamType,
    /// Value used when the caller omits it; `None` makes the parameter required.
    pub default: Option<Value>,
    /// Unit shown to operators.
    pub unit: Option<&'static str>,
    /// Allowed values.
    pub constraint: Option<Constraint>,
}

impl ParamSpec {
    fn new(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            default: None,
            unit: None,
            constraint: None,
        }
    }

    fn int(name: &'static str) -> Self {
        Self::new(name, ParamType::Int)
    }

    fn float(name: &'static str) -> Self {
        Self::new(name, ParamType::Float)
    }

    fn boolean(name: &'static str) -> Self {
        Self::new(name, ParamType::Bool)
    }

    fn text(name: &'static str) -> Self {
        Self::new(name, ParamType::Text)
    }

    fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    fn range(mut self, min: f64, max: Option<f64>) -> Self {
        self.constraint = Some(Constraint::Range {
            min: Some(min),
            max,
        });
        self
    }

    fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.constraint = Some(Constraint::OneOf {
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Whether the caller must supply this parameter.
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Resolved parameters handed to a task's command builder.
struct Resolved(TaskParams);

impl Resolved {
    fn int(&self, name: &str) -> i64 {
        self.0.get(name).and_then(Value::as_i64).unwrap_or_default()
    }

    fn float(&self, name: &str) -> f64 {
        self.0.get(name).and_then(Value::as_f64).unwrap_or_default()
    }

    fn flag(&self, name: &str) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or_default()
    }

    fn text(&self, name: &str) -> String {
        self.0.get(name).map(display_value).unwrap_or_default()
    }
}

type Builder = fn(&Resolved) -> Vec<String>;

/// A named command template for one instrument model.
#[derive(Clone, Serialize)]
pub struct TaskSpec {
    /// Stable key, e.g. `DG4202_TOGGLE`.
    pub key: &'static str,
    /// Display name, e.g. `Toggle Output`.
    pub name: &'static str,
    /// Instrument model.
    pub device: &'static str,
    /// Parameters in declaration order.
    pub params: Vec<ParamSpec>,
    #[serde(skip)]
    build: Builder,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("device", &self.device)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl TaskSpec {
    /// True when `name` is this task's key or display name, ignoring case.
    pub fn matches(&self, name: &str) -> bool {
        self.key.eq_ignore_ascii_case(name) || self.name.eq_ignore_ascii_case(name)
    }

    /// Check `params`, collecting every issue.
    pub fn validate(&self, params: &TaskParams) -> Result<(), TaskError> {
        let mut missing = Vec::new();
        let mut mismatches = Vec::new();
        let mut out_of_range = Vec::new();
        let mut not_one_of = Vec::new();

        for spec in &self.params {
            let value = match params.get(spec.name) {
                Some(Value::Null) | None => {
                    if spec.is_required() {
                        missing.push(spec.name.to_string());
                    }
                    continue;
                }
                Some(value) => value,
            };
            if !spec.ty.accepts(value) {
                mismatches.push(format!(
                    "{} (got {}, expected {})",
                    spec.name,
                    json_type_name(value),
                    spec.ty
                ));
                continue;
            }
            match &spec.constraint {
                Some(c @ Constraint::Range { .. }) => out_of_range.extend(c.violation(spec.name, value)),
                Some(c @ Constraint::OneOf { .. }) => not_one_of.extend(c.violation(spec.name, value)),
                None => {}
            }
        }
        let extra: Vec<String> = params
            .keys()
            .filter(|key| !self.params.iter().any(|spec| spec.name == key.as_str()))
            .cloned()
            .collect();

        let mut issues = Vec::new();
        for (label, items) in [
            ("Missing required params", missing),
            ("Extra params provided", extra),
            ("Type mismatches", mismatches),
            ("Out of range", out_of_range),
            ("Not one of", not_one_of),
        ] {
            if !items.is_empty() {
                issues.push(format!("{label}: {}.", items.join(", ")));
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(TaskError::InvalidParams {
                task: self.name.to_string(),
                issues,
            })
        }
    }

    /// Validate and expand into commands.
    pub fn expand(&self, params: &TaskParams) -> Result<Vec<Command>, TaskError> {
        self.validate(params)?;
        let mut resolved = params.clone();
        for spec in &self.params {
            if let (None, Some(default)) = (resolved.get(spec.name), &spec.default) {
                resolved.insert(spec.name.to_string(), default.clone());
            }
        }
        let mut commands = Vec::new();
        for text in (self.build)(&Resolved(resolved)) {
            commands.push(Command::write(text));
            commands.push(Command::query("*OPC?").with_validator(ResponseValidator::exact("1")));
        }
        Ok(commands)
    }
}

/// One step of a multi-task job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// Task key or display name.
    pub task: String,
    /// Parameters.
    #[serde(default)]
    pub params: TaskParams,
}

impl TaskStep {
    /// New step.
    pub fn new(task: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            task: task.into(),
            params,
        }
    }
}

/// The set of known tasks.
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    tasks: Vec<TaskSpec>,
}

impl TaskCatalog {
    /// Shared catalog of built-in tasks.
    pub fn global() -> &'static TaskCatalog {
        &BUILTIN
    }

    /// Every known task.
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Look a task up by key or display name, ignoring case.
    pub fn find(&self, name: &str) -> Result<&TaskSpec, TaskError> {
        self.tasks
            .iter()
            .find(|task| task.matches(name))
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))
    }

    /// Tasks for one instrument model.
    pub fn for_device<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a TaskSpec> + 'a {
        self.tasks
            .iter()
            .filter(move |task| task.device.eq_ignore_ascii_case(device))
    }

    /// Check `params` against the named task.
    pub fn validate(&self, task: &str, params: &TaskParams) -> Result<(), TaskError> {
        self.find(task)?.validate(params)
    }

    /// Expand the named task into commands.
    pub fn expand(&self, task: &str, params: &TaskParams) -> Result<Vec<Command>, TaskError> {
        self.find(task)?.expand(params)
    }

    /// Build a one-shot job definition from one or more task steps.
    pub fn build_job(
        &self,
        name: impl Into<String>,
        endpoint_id: impl Into<String>,
        steps: &[TaskStep],
    ) -> Result<JobDefinition, TaskError> {
        if steps.is_empty() {
            return Err(TaskError::Empty);
        }
        let mut commands = Vec::new();
        for step in steps {
            commands.extend(self.expand(&step.task, &step.params)?);
        }
        Ok(JobDefinition::new(name, endpoint_id).with_commands(commands))
    }

    fn builtin() -> Self {
        let channel = || ParamSpec::int("channel").one_of([1, 2]);
        let send_on = || ParamSpec::boolean("send_on");
        let hold = |name| {
            ParamSpec::float(name)
                .unit("ms")
                .range(0.0, None)
                .default_value(json!(0))
        };

        Self {
            tasks: vec![
                TaskSpec {
                    key: "DG4202_TOGGLE",
                    name: "Toggle Output",
                    device: "DG4202",
                    params: vec![channel(), ParamSpec::text("output").one_of(["ON", "OFF"])],
                    build: |p| vec![format!(":OUTP{} {}", p.int("channel"), p.text("output"))],
                },
                TaskSpec {
                    key: "DG4202_SET_WAVEFORM",
                    name: "Set Waveform Parameters",
                    device: "DG4202",
                    params: vec![
                        channel(),
                        send_on(),
                        ParamSpec::text("waveform_type").one_of(DG4202_WAVEFORMS),
                        ParamSpec::float("amplitude").unit("V").range(0.0, Some(5.0)),
                        ParamSpec::float("frequency")
                            .unit("Hz")
                            .range(0.0, Some(DG4202_FREQ_LIMIT)),
                        ParamSpec::float("offset").unit("V").range(0.0, Some(5.0)),
                    ],
                    build: |p| {
                        let channel = p.int("channel");
                        let mut commands = vec![format!(
                            ":SOUR{channel}:APPL:{} {},{},{}",
                            p.text("waveform_type"),
                            p.float("frequency"),
                            p.float("amplitude"),
                            p.float("offset")
                        )];
                        if p.flag("send_on") {
                            commands.push(format!(":OUTP{channel} ON"));
                        }
                        commands
                    },
                },
                TaskSpec {
                    key: "DG4202_SET_SWEEP",
                    name: "Set Sweep Parameters",
                    device: "DG4202",
                    params: vec![
                        channel(),
                        send_on(),
                        ParamSpec::float("fstart")
                            .unit("Hz")
                            .range(0.0, Some(DG4202_FREQ_LIMIT)),
                        ParamSpec::float("fstop")
                            .unit("Hz")
                            .range(0.0, Some(DG4202_FREQ_LIMIT)),
                        ParamSpec::float("time").unit("s").range(0.0, None),
                        hold("rtime"),
                        hold("htime_start"),
                        hold("htime_stop"),
                    ],
                    build: |p| {
                        let ch = p.int("channel");
                        let seconds = |name: &str| p.float(name) / 1000.0;
                        let mut commands = vec![
                            format!(":SOUR{ch}:SWE:STAT ON"),
                            format!(":SOUR{ch}:FREQ:STAR {}", p.float("fstart")),
                            format!(":SOUR{ch}:FREQ:STOP {}", p.float("fstop")),
                            format!(":SOUR{ch}:SWE:TIME {}", p.float("time")),
                            format!(":SOUR{ch}:SWE:RTIM {}", seconds("rtime")),
                            format!(":SOUR{ch}:SWE:HTIM:STAR {}", seconds("htime_start")),
                            format!(":SOUR{ch}:SWE:HTIM:STOP {}", seconds("htime_stop")),
                        ];
                        if p.flag("send_on") {
                            commands.push(format!(":OUTP{ch} ON"));
                        }
                        commands
                    },
                },
                TaskSpec {
                    key: "EDUX1002A_AUTO",
                    name: "Press Auto",
                    device: "EDUX1002A",
                    params: vec![ParamSpec::text("press").one_of(["OK"])],
                    build: |_| vec![":AUToscale".to_string()],
                },
            ],
        }
    }
}
