//! Deployment target resolution.
//!
//! Turns "deploy to `<env>`" into concrete shell commands. Targets come from
//! one of three sources, in priority order:
//!
//! 1. explicit target specs (filtered by their `environments` list)
//! 2. auto-detected project markers, when no explicit target applies
//! 3. a legacy deploy/validate command pair, when nothing else applies
//!
//! Every command is rendered from a per-kind template with `{env}`, `{name}`,
//! `{path}`, `{namespace}`, `{release}` and `{image}` placeholders. Substituted
//! values are shell-quoted.

mod detect;
mod template;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use detect::detect_targets;
pub use template::{render, render_command, shell_quote, TemplateVars};

/// Errors raised while resolving deployment targets.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("target '{name}' of kind {kind} requires a path")]
    MissingPath { name: String, kind: TargetKind },

    #[error("custom target '{name}' requires a command")]
    MissingCommand { name: String },

    #[error("unknown target kind: {0}")]
    UnknownKind(String),

    #[error("targets file {path}: {message}")]
    TargetsFile { path: PathBuf, message: String },
}

/// Family of deployment tooling a target uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Helm,
    Kubectl,
    Kustomize,
    Serverless,
    Ecs,
    #[serde(rename = "cloudformation")]
    CloudFormation,
    Custom,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Helm => "helm",
            TargetKind::Kubectl => "kubectl",
            TargetKind::Kustomize => "kustomize",
            TargetKind::Serverless => "serverless",
            TargetKind::Ecs => "ecs",
            TargetKind::CloudFormation => "cloudformation",
            TargetKind::Custom => "custom",
        }
    }

    /// Default `(deploy, validate)` templates. `None` for `custom`.
    fn templates(&self) -> Option<(&'static str, Option<&'static str>)> {
        match self {
            TargetKind::Helm => Some((
                "helm upgrade --install {release} {path} --namespace {namespace} --create-namespace --set image={image}",
                Some("helm status {release} --namespace {namespace}"),
            )),
            TargetKind::Kubectl => Some((
                "kubectl apply --namespace {namespace} -f {path}",
                Some("kubectl rollout status deployment/{release} --namespace {namespace} --timeout=120s"),
            )),
            TargetKind::Kustomize => Some((
                "kubectl apply --namespace {namespace} -k {path}",
                Some("kubectl rollout status deployment/{release} --namespace {namespace} --timeout=120s"),
            )),
            TargetKind::Serverless => Some((
                "serverless deploy --stage {env} --config {path}",
                Some("serverless info --stage {env} --config {path}"),
            )),
            TargetKind::Ecs => Some((
                "aws ecs register-task-definition --cli-input-json file://{path}",
                Some("aws ecs describe-task-definition --task-definition {release}"),
            )),
            TargetKind::CloudFormation => Some((
                "aws cloudformation deploy --template-file {path} --stack-name {release}-{env} --parameter-overrides Image={image}",
                Some("aws cloudformation describe-stacks --stack-name {release}-{env}"),
            )),
            TargetKind::Custom => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "helm" => Ok(TargetKind::Helm),
            "kubectl" => Ok(TargetKind::Kubectl),
            "kustomize" => Ok(TargetKind::Kustomize),
            "serverless" => Ok(TargetKind::Serverless),
            "ecs" => Ok(TargetKind::Ecs),
            "cloudformation" => Ok(TargetKind::CloudFormation),
            "custom" => Ok(TargetKind::Custom),
            other => Err(ResolveError::UnknownKind(other.to_string())),
        }
    }
}

/// One configured (or detected) deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub kind: TargetKind,
    /// Chart, manifest directory or descriptor, relative to the workspace
    /// root unless absolute.
    #[serde(default)]
    pub path: Option<String>,
    /// Environments this target applies to; empty means all.
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    /// Deploy command template overriding the kind default.
    #[serde(default)]
    pub command: Option<String>,
    /// Validate command template overriding the kind default.
    #[serde(default)]
    pub validate_command: Option<String>,
}

impl TargetSpec {
    pub fn applies_to(&self, env: &str) -> bool {
        self.environments.is_empty() || self.environments.iter().any(|e| e == env)
    }

    /// Fail fast on targets that could never produce a command.
    pub fn validate(&self) -> Result<(), ResolveError> {
        match self.kind {
            TargetKind::Custom if self.command.is_none() => Err(ResolveError::MissingCommand {
                name: self.name.clone(),
            }),
            TargetKind::Custom => Ok(()),
            kind if self.path.is_none() && self.command.is_none() => {
                Err(ResolveError::MissingPath {
                    name: self.name.clone(),
                    kind,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Deploy/validate commands used when no target applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyCommands {
    pub deploy: String,
    #[serde(default)]
    pub validate: Option<String>,
}

/// Where a resolved target came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Explicit,
    Detected,
    Legacy,
}

/// A target with its commands rendered for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub name: String,
    pub kind: Option<TargetKind>,
    pub environment: String,
    pub source: TargetSource,
    pub deploy_command: String,
    pub validate_command: Option<String>,
}

/// Inputs to the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Project name; the default namespace is `<project>-<env>`.
    pub project: String,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub legacy: Option<LegacyCommands>,
}

impl ResolverConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            targets: Vec::new(),
            legacy: None,
        }
    }

    pub fn with_targets(mut self, targets: Vec<TargetSpec>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_legacy(mut self, legacy: LegacyCommands) -> Self {
        self.legacy = Some(legacy);
        self
    }

    /// Read a JSON array of target specs. Each spec is validated.
    pub fn load_targets_file(path: &Path) -> Result<Vec<TargetSpec>, ResolveError> {
        let file_err = |message: String| ResolveError::TargetsFile {
            path: path.to_path_buf(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let targets: Vec<TargetSpec> =
            serde_json::from_str(&raw).map_err(|e| file_err(e.to_string()))?;
        for target in &targets {
            target.validate()?;
        }
        Ok(targets)
    }
}

/// Resolves deployment targets for an environment.
#[derive(Debug, Clone, Default)]
pub struct TargetResolver {
    config: ResolverConfig,
}

impl TargetResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve every target for `env`.
    ///
    /// `root` is the local workspace; without one, detection is skipped and
    /// explicit paths are used as written. An empty result means there is
    /// nothing to deploy locally.
    pub fn resolve(
        &self,
        root: Option<&Path>,
        env: &str,
        image: &str,
    ) -> Result<Vec<ResolvedTarget>, ResolveError> {
        let explicit: Vec<&TargetSpec> = self
            .config
            .targets
            .iter()
            .filter(|t| t.applies_to(env))
            .collect();
        if !explicit.is_empty() {
            return explicit
                .into_iter()
                .map(|spec| self.render_target(spec, root, env, image, TargetSource::Explicit))
                .collect();
        }

        if let Some(root) = root {
            let detected = detect_targets(root, &self.config.project, env);
            if !detected.is_empty() {
                return detected
                    .iter()
                    .map(|spec| {
                        self.render_target(spec, Some(root), env, image, TargetSource::Detected)
                    })
                    .collect();
            }
        }

        Ok(self
            .config
            .legacy
            .iter()
            .map(|legacy| {
                let vars = self.base_vars(&self.config.project, env, image, None, None);
                ResolvedTarget {
                    name: self.config.project.clone(),
                    kind: None,
                    environment: env.to_string(),
                    source: TargetSource::Legacy,
                    deploy_command: render_command(&legacy.deploy, &vars),
                    validate_command: legacy
                        .validate
                        .as_deref()
                        .map(|v| render_command(v, &vars)),
                }
            })
            .collect())
    }

    fn render_target(
        &self,
        spec: &TargetSpec,
        root: Option<&Path>,
        env: &str,
        image: &str,
        source: TargetSource,
    ) -> Result<ResolvedTarget, ResolveError> {
        spec.validate()?;

        let vars = self.base_vars(
            &spec.name,
            env,
            image,
            spec.namespace.as_deref(),
            spec.release.as_deref(),
        );
        // Paths may themselves carry placeholders, e.g. `overlays/{env}`.
        let path = spec.path.as_deref().map(|p| {
            let p = render(p, &vars);
            match root {
                Some(root) if !Path::new(&p).is_absolute() => root.join(&p).display().to_string(),
                _ => p,
            }
        });
        let vars = match path {
            Some(path) => vars.set("path", path),
            None => vars,
        };

        let defaults = spec.kind.templates();
        let deploy_template = match (&spec.command, defaults) {
            (Some(command), _) => command.as_str(),
            (None, Some((deploy, _))) => deploy,
            (None, None) => {
                return Err(ResolveError::MissingCommand {
                    name: spec.name.clone(),
                })
            }
        };
        // A custom deploy command only gets a validate step if one is given.
        let validate_template = match (&spec.validate_command, &spec.command, defaults) {
            (Some(validate), _, _) => Some(validate.as_str()),
            (None, None, Some((_, validate))) => validate,
            _ => None,
        };

        Ok(ResolvedTarget {
            name: spec.name.clone(),
            kind: Some(spec.kind),
            environment: env.to_string(),
            source,
            deploy_command: render_command(deploy_template, &vars),
            validate_command: validate_template.map(|v| render_command(v, &vars)),
        })
    }

    fn base_vars(
        &self,
        name: &str,
        env: &str,
        image: &str,
        namespace: Option<&str>,
        release: Option<&str>,
    ) -> TemplateVars {
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", self.config.project, env));
        TemplateVars::new()
            .set("env", env)
            .set("name", name)
            .set("image", image)
            .set("namespace", namespace)
            .set("release", release.unwrap_or(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, kind: TargetKind) -> TargetSpec {
        TargetSpec {
            name: name.to_string(),
            kind,
            path: None,
            environments: Vec::new(),
            namespace: None,
            release: None,
            command: None,
            validate_command: None,
        }
    }

    #[test]
    fn test_explicit_helm_defaults() {
        let mut helm = spec("api", TargetKind::Helm);
        helm.path = Some("/srv/charts/api".into());
        let resolver = TargetResolver::new(ResolverConfig::new("acme").with_targets(vec![helm]));

        let targets = resolver.resolve(None, "dev", "reg/acme:1").unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].source, TargetSource::Explicit);
        assert_eq!(
            targets[0].deploy_command,
            "helm upgrade --install api /srv/charts/api --namespace acme-dev --create-namespace --set image=reg/acme:1"
        );
        assert_eq!(
            targets[0].validate_command.as_deref(),
            Some("helm status api --namespace acme-dev")
        );
    }

    #[test]
    fn test_explicit_targets_filtered_by_environment() {
        let mut prod_only = spec("edge", TargetKind::Custom);
        prod_only.command = Some("deploy-edge {env}".into());
        prod_only.environments = vec!["prod".into()];
        let resolver = TargetResolver::new(
            ResolverConfig::new("acme")
                .with_targets(vec![prod_only])
                .with_legacy(LegacyCommands {
                    deploy: "legacy-deploy {env}".into(),
                    validate: None,
                }),
        );

        let dev = resolver.resolve(None, "dev", "img").unwrap();
        assert_eq!(dev[0].source, TargetSource::Legacy);
        assert_eq!(dev[0].deploy_command, "legacy-deploy dev");

        let prod = resolver.resolve(None, "prod", "img").unwrap();
        assert_eq!(prod[0].source, TargetSource::Explicit);
        assert_eq!(prod[0].deploy_command, "deploy-edge prod");
        assert!(prod[0].validate_command.is_none());
    }

    #[test]
    fn test_custom_without_command_is_error() {
        let resolver = TargetResolver::new(
            ResolverConfig::new("acme").with_targets(vec![spec("x", TargetKind::Custom)]),
        );
        let err = resolver.resolve(None, "dev", "img").unwrap_err();
        assert!(matches!(err, ResolveError::MissingCommand { .. }));
    }

    #[test]
    fn test_helm_without_path_is_error() {
        let err = spec("api", TargetKind::Helm).validate().unwrap_err();
        assert!(matches!(err, ResolveError::MissingPath { .. }));
    }

    #[test]
    fn test_no_config_resolves_nothing() {
        let resolver = TargetResolver::new(ResolverConfig::new("acme"));
        assert!(resolver.resolve(None, "dev", "img").unwrap().is_empty());
    }

    #[test]
    fn test_namespace_and_release_overrides() {
        let mut kube = spec("api", TargetKind::Kubectl);
        kube.path = Some("k8s".into());
        kube.namespace = Some("shared".into());
        kube.release = Some("api-v2".into());
        let resolver = TargetResolver::new(ResolverConfig::new("acme").with_targets(vec![kube]));

        let targets = resolver
            .resolve(Some(Path::new("/work")), "dev", "img")
            .unwrap();
        assert_eq!(
            targets[0].deploy_command,
            "kubectl apply --namespace shared -f /work/k8s"
        );
        assert!(targets[0]
            .validate_command
            .as_deref()
            .unwrap()
            .contains("deployment/api-v2"));
    }

    #[test]
    fn test_unknown_kind_rejected_in_targets_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, r#"[{"name":"x","kind":"nomad","path":"a"}]"#).unwrap();
        let err = ResolverConfig::load_targets_file(&path).unwrap_err();
        assert!(matches!(err, ResolveError::TargetsFile { .. }));
        assert!("nomad".parse::<TargetKind>().is_err());
    }

    #[test]
    fn test_targets_file_validates_specs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, r#"[{"name":"x","kind":"custom"}]"#).unwrap();
        let err = ResolverConfig::load_targets_file(&path).unwrap_err();
        assert!(matches!(err, ResolveError::MissingCommand { .. }));
    }
}
