//! Deployment target auto-detection from project layout markers.

use std::path::{Path, PathBuf};

use super::{TargetKind, TargetSpec};

const MANIFEST_DIRS: &[&str] = &["k8s", "manifests", "deploy/k8s"];
const SERVERLESS_FILES: &[&str] = &["serverless.yml", "serverless.yaml"];
const ECS_FILES: &[&str] = &["ecs-task-definition.json", "taskdef.json"];
const CLOUDFORMATION_FILES: &[&str] = &[
    "cloudformation.yaml",
    "cloudformation.yml",
    "template.yaml",
    "template.yml",
];

/// Scan `root` for deployable descriptors.
///
/// At most one target per kind family is produced, except for charts under
/// `charts/`, which yield one helm target each (sorted by name).
pub fn detect_targets(root: &Path, project: &str, env: &str) -> Vec<TargetSpec> {
    let mut targets = Vec::new();

    targets.extend(detect_helm(root, project));
    if let Some(target) = detect_manifests(root, project, env) {
        targets.push(target);
    }
    if let Some(path) = first_file(root, SERVERLESS_FILES) {
        targets.push(detected(project, TargetKind::Serverless, path));
    }
    if let Some(path) = first_file(root, ECS_FILES) {
        targets.push(detected(project, TargetKind::Ecs, path));
    }
    if let Some(path) = first_file(root, CLOUDFORMATION_FILES) {
        targets.push(detected(project, TargetKind::CloudFormation, path));
    }

    targets
}

fn detect_helm(root: &Path, project: &str) -> Vec<TargetSpec> {
    for dir in [root.to_path_buf(), root.join("chart")] {
        if dir.join("Chart.yaml").is_file() {
            return vec![detected(project, TargetKind::Helm, dir)];
        }
    }

    let Ok(entries) = std::fs::read_dir(root.join("charts")) else {
        return Vec::new();
    };
    let mut charts: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join("Chart.yaml").is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some((name, path))
        })
        .collect();
    charts.sort();
    charts
        .into_iter()
        .map(|(name, path)| detected(&name, TargetKind::Helm, path))
        .collect()
}

fn detect_manifests(root: &Path, project: &str, env: &str) -> Option<TargetSpec> {
    let dir = MANIFEST_DIRS
        .iter()
        .map(|rel| root.join(rel))
        .find(|dir| dir.is_dir())?;

    let overlay = dir.join("overlays").join(env);
    if overlay.join("kustomization.yaml").is_file() {
        return Some(detected(project, TargetKind::Kustomize, overlay));
    }
    if dir.join("kustomization.yaml").is_file() {
        return Some(detected(project, TargetKind::Kustomize, dir));
    }
    Some(detected(project, TargetKind::Kubectl, dir))
}

fn first_file(root: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

fn detected(name: &str, kind: TargetKind, path: PathBuf) -> TargetSpec {
    TargetSpec {
        name: name.to_string(),
        kind,
        path: Some(path.display().to_string()),
        environments: Vec::new(),
        namespace: None,
        release: None,
        command: None,
        validate_command: None,
    }
}
