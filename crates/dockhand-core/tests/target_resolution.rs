//! Deployment target resolution against real workspace layouts.

use std::fs;
use std::path::Path;

use dockhand_core::resolver::{LegacyCommands, TargetSource};
use dockhand_core::{ResolverConfig, TargetKind, TargetResolver, TargetSpec};

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "").unwrap();
}

fn resolver(targets: Vec<TargetSpec>) -> TargetResolver {
    TargetResolver::new(
        ResolverConfig::new("shop")
            .with_targets(targets)
            .with_legacy(LegacyCommands {
                deploy: "./legacy-deploy.sh {env}".into(),
                validate: Some("./legacy-check.sh {env}".into()),
            }),
    )
}

#[test]
fn test_detected_helm_chart_renders_defaults() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("chart/Chart.yaml"));

    let targets = resolver(Vec::new())
        .resolve(Some(dir.path()), "prod", "reg/shop:run-1")
        .unwrap();
    assert_eq!(targets.len(), 1);
    let target = &targets[0];
    assert_eq!(target.source, TargetSource::Detected);
    assert_eq!(target.kind, Some(TargetKind::Helm));
    let chart = dir.path().join("chart").display().to_string();
    assert_eq!(
        target.deploy_command,
        format!(
            "helm upgrade --install shop {chart} --namespace shop-prod --create-namespace --set image=reg/shop:run-1"
        )
    );
}

#[test]
fn test_explicit_targets_shadow_detection() {
    let dir = tempfile::tempdir().unwrap();
    touch(&dir.path().join("chart/Chart.yaml"));

    let explicit = TargetSpec {
        name: "edge".into(),
        kind: TargetKind::Serverless,
        path: Some("functions/serverless.yml".into()),
        environments: Vec::new(),
        namespace: None,
        release: None,
        command: None,
        validate_command: None,
    };
    let targets = resolver(vec![explicit])
        .resolve(Some(dir.path()), "dev", "img")
        .unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].source, TargetSource::Explicit);
    assert!(targets[0]
        .deploy_command
        .starts_with("serverless deploy --stage dev --config "));
    assert!(targets[0]
        .deploy_command
        .ends_with("functions/serverless.yml"));
}

#[test]
fn test_legacy_fallback_when_nothing_detected() {
    let dir = tempfile::tempdir().unwrap();
    let targets = resolver(Vec::new())
        .resolve(Some(dir.path()), "dev", "img")
        .unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].source, TargetSource::Legacy);
    assert_eq!(targets[0].deploy_command, "./legacy-deploy.sh dev");
    assert_eq!(
        targets[0].validate_command.as_deref(),
        Some("./legacy-check.sh dev")
    );
}

#[test]
fn test_targets_file_round_trip_into_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("targets.json");
    fs::write(
        &file,
        r#"[
            {"name": "api", "kind": "kustomize", "path": "deploy/overlays/{env}", "environments": ["dev", "prod"]},
            {"name": "smoke", "kind": "custom", "command": "make smoke ENV={env}", "environments": ["prod"]}
        ]"#,
    )
    .unwrap();

    let targets = ResolverConfig::load_targets_file(&file).unwrap();
    let resolver = TargetResolver::new(ResolverConfig::new("shop").with_targets(targets));

    let dev = resolver.resolve(None, "dev", "img").unwrap();
    assert_eq!(dev.len(), 1);
    assert_eq!(
        dev[0].deploy_command,
        "kubectl apply --namespace shop-dev -k deploy/overlays/dev"
    );

    let prod = resolver.resolve(None, "prod", "img").unwrap();
    assert_eq!(prod.len(), 2);
    assert_eq!(prod[1].deploy_command, "make smoke ENV=prod");
    assert!(prod[1].validate_command.is_none());
}
