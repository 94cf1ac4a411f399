//! YAML descriptors for deployments and build graphs.
//!
//! Every parse or validation problem surfaces as
//! [`BerthError::InvalidDescriptor`] (or a structural graph error) before any
//! build or start is attempted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::artifact::Artifact;
use crate::build::{BuildPlan, BuildStage};
use crate::error::{BerthError, Result};
use crate::graph::DependencyGraph;
use crate::service::{HealthCheck, HealthProbe, ServiceSpec};
use crate::tag::ReleaseTag;

/// Default name of the variable replaced by the release tag.
pub const DEFAULT_VERSION_VARIABLE: &str = "VERSION";

/// Durations as humantime strings (`"10s"`, `"1m 30s"`) or whole seconds.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    pub(crate) fn parse<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(de::Error::custom),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        parse(deserializer)
    }

    /// Same encoding for `Option<Duration>`; pair with `#[serde(default)]`.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            super::parse(deserializer).map(Some)
        }
    }
}

/// A command given either as a list or as one whitespace-separated string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    #[default]
    Empty,
    Argv(Vec<String>),
    Line(String),
}

impl CommandLine {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandLine::Empty => Vec::new(),
            CommandLine::Argv(argv) => argv,
            CommandLine::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

fn scalar_to_string(key: &str, value: serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        _ => Err(BerthError::InvalidDescriptor(format!(
            "{key} must be a scalar"
        ))),
    }
}

fn scalar_map(
    context: &str,
    raw: BTreeMap<String, serde_yaml::Value>,
) -> Result<BTreeMap<String, String>> {
    raw.into_iter()
        .map(|(k, v)| {
            let value = scalar_to_string(&format!("{context}.{k}"), v)?;
            Ok((k, value))
        })
        .collect()
}

fn yaml_error(source: &str, err: serde_yaml::Error) -> BerthError {
    BerthError::InvalidDescriptor(format!("{source}: {err}"))
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| BerthError::InvalidDescriptor(format!("cannot read {}: {e}", path.display())))
}

/// Directory relative paths in a descriptor resolve against. A bare file name
/// yields `.` rather than an empty path.
pub fn descriptor_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Replace `${var}` and `$var` with `value`.
///
/// `$var` only matches when not followed by another identifier character, so
/// `$VERSION_SUFFIX` is left alone.
pub fn substitute(input: &str, var: &str, value: &str) -> String {
    let braced = format!("${{{var}}}");
    let replaced = input.replace(&braced, value);
    let bare = format!("${var}");

    let mut out = String::with_capacity(replaced.len());
    let mut rest = replaced.as_str();
    while let Some(pos) = rest.find(&bare) {
        let after = &rest[pos + bare.len()..];
        let continues = after
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        out.push_str(&rest[..pos]);
        if continues {
            out.push_str(&bare);
        } else {
            out.push_str(value);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHealthcheck {
    #[serde(default)]
    http: Option<String>,
    #[serde(default)]
    command: Option<CommandLine>,
    #[serde(default)]
    tcp: Option<String>,
    #[serde(default, with = "duration_serde::option")]
    interval: Option<Duration>,
    #[serde(default, with = "duration_serde::option")]
    timeout: Option<Duration>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default, with = "duration_serde::option")]
    start_period: Option<Duration>,
}

impl RawHealthcheck {
    fn into_probe(self, service: &str) -> Result<HealthProbe> {
        let check = match (self.http, self.command, self.tcp) {
            (Some(url), None, None) => HealthCheck::Http { url },
            (None, Some(command), None) => {
                let argv = command.into_argv();
                if argv.is_empty() {
                    return Err(BerthError::InvalidDescriptor(format!(
                        "{service}: healthcheck command is empty"
                    )));
                }
                HealthCheck::Command { argv }
            }
            (None, None, Some(address)) => HealthCheck::Tcp { address },
            _ => {
                return Err(BerthError::InvalidDescriptor(format!(
                    "{service}: healthcheck needs exactly one of http, command or tcp"
                )))
            }
        };

        let mut probe = HealthProbe::new(check);
        if let Some(interval) = self.interval {
            probe = probe.with_interval(interval);
        }
        if let Some(timeout) = self.timeout {
            probe = probe.with_timeout(timeout);
        }
        if let Some(retries) = self.retries {
            probe = probe.with_retries(retries);
        }
        if let Some(start_period) = self.start_period {
            probe = probe.with_start_period(start_period);
        }
        Ok(probe)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    image: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    command: CommandLine,
    #[serde(default)]
    environment: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    healthcheck: Option<RawHealthcheck>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDeployment {
    #[serde(default)]
    version_variable: Option<String>,
    services: BTreeMap<String, RawService>,
}

/// A compose-like deployment descriptor.
///
/// Services are stored as templates; [`DeploymentDescriptor::render`]
/// substitutes the release tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    pub version_variable: String,
    pub services: Vec<ServiceSpec>,
}

impl DeploymentDescriptor {
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_yaml(&read_file(path)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawDeployment =
            serde_yaml::from_str(text).map_err(|e| yaml_error("deployment descriptor", e))?;

        let version_variable = raw
            .version_variable
            .unwrap_or_else(|| DEFAULT_VERSION_VARIABLE.to_string());
        if version_variable.is_empty() {
            return Err(BerthError::InvalidDescriptor(
                "version_variable must not be empty".to_string(),
            ));
        }

        let mut services = Vec::with_capacity(raw.services.len());
        for (name, service) in raw.services {
            let mut spec = ServiceSpec::new(name.clone(), service.image);
            spec.depends_on = service.depends_on;
            spec.command = service.command.into_argv();
            spec.environment = scalar_map(&format!("{name}.environment"), service.environment)?;
            spec.healthcheck = service
                .healthcheck
                .map(|h| h.into_probe(&name))
                .transpose()?;
            services.push(spec);
        }

        let descriptor = Self {
            version_variable,
            services,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check the dependency graph: unknown names and cycles.
    pub fn validate(&self) -> Result<()> {
        DependencyGraph::from_declarations(
            self.services
                .iter()
                .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str))),
        )?
        .topological_order()
        .map(|_| ())
    }

    /// Service specs with the version variable replaced by `tag`.
    pub fn render(&self, tag: &ReleaseTag) -> Vec<ServiceSpec> {
        let label = tag.as_label();
        let sub = |s: &str| substitute(s, &self.version_variable, &label);
        self.services
            .iter()
            .map(|spec| {
                let mut rendered = spec.clone();
                rendered.image = sub(&spec.image);
                rendered.command = spec.command.iter().map(|c| sub(c)).collect();
                rendered.environment = spec
                    .environment
                    .iter()
                    .map(|(k, v)| (k.clone(), sub(v)))
                    .collect();
                rendered
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    inputs: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    files: Vec<PathBuf>,
    #[serde(default)]
    command: CommandLine,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBuildGraph {
    stages: Vec<RawStage>,
}

/// A build graph descriptor.
///
/// `files` entries are read relative to the descriptor's directory and
/// folded into the stage inputs as `file:<path>` = `sha256:<hex>`, so editing
/// a file changes the stage fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildGraphDescriptor {
    pub stages: Vec<BuildStage>,
    /// Directory the descriptor was loaded from, if any.
    pub base_dir: Option<PathBuf>,
}

impl BuildGraphDescriptor {
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_yaml(&read_file(path)?, descriptor_dir(path))
    }

    pub fn from_yaml(text: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawBuildGraph =
            serde_yaml::from_str(text).map_err(|e| yaml_error("build graph descriptor", e))?;

        let mut stages = Vec::with_capacity(raw.stages.len());
        for raw_stage in raw.stages {
            let mut inputs = scalar_map(&format!("{}.inputs", raw_stage.name), raw_stage.inputs)?;
            for file in &raw_stage.files {
                let path = base_dir.join(file);
                let bytes = fs::read(&path).map_err(|e| {
                    BerthError::InvalidDescriptor(format!(
                        "{}: cannot read input file {}: {e}",
                        raw_stage.name,
                        path.display()
                    ))
                })?;
                let digest = Artifact::from_content(raw_stage.name.as_str(), &bytes).digest;
                inputs.insert(format!("file:{}", file.display()), digest);
            }

            let mut stage = BuildStage::new(raw_stage.name);
            stage.depends_on = raw_stage.depends_on;
            stage.inputs = inputs;
            stage.command = raw_stage.command.into_argv();
            stages.push(stage);
        }

        let descriptor = Self {
            stages,
            base_dir: Some(base_dir.to_path_buf()),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Duplicate names, unknown dependencies and cycles.
    pub fn validate(&self) -> Result<()> {
        BuildPlan::new(&self.stages).map(|_| ())
    }
}

/// Either descriptor kind, told apart by its top-level key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Deployment(DeploymentDescriptor),
    BuildGraph(BuildGraphDescriptor),
}

impl Descriptor {
    /// Load `path`, choosing the kind from a `services` or `stages` key.
    pub fn load(path: &Path) -> Result<Self> {
        let text = read_file(path)?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| yaml_error("descriptor", e))?;
        let has = |key: &str| value.get(key).is_some();

        match (has("services"), has("stages")) {
            (true, false) => DeploymentDescriptor::from_yaml(&text).map(Descriptor::Deployment),
            (false, true) => {
                BuildGraphDescriptor::from_yaml(&text, descriptor_dir(path))
                    .map(Descriptor::BuildGraph)
            }
            _ => Err(BerthError::InvalidDescriptor(format!(
                "{}: expected exactly one of `services` or `stages`",
                path.display()
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Descriptor::Deployment(_) => "deployment",
            Descriptor::BuildGraph(_) => "build graph",
        }
    }

    /// Number of services or stages.
    pub fn len(&self) -> usize {
        match self {
            Descriptor::Deployment(d) => d.services.len(),
            Descriptor::BuildGraph(g) => g.stages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
