//! `{placeholder}` substitution for deploy/validate command templates.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"))
}

/// Values available to a command template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Replace every known `{key}` with its value; unknown placeholders are
/// left as written.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    substitute(template, vars, str::to_string)
}

/// Like [`render`], but each substituted value is quoted for `sh -c`.
///
/// Values can come from repository contents (detected manifest paths) or
/// from the work item, so they are never spliced in as shell syntax.
pub fn render_command(template: &str, vars: &TemplateVars) -> String {
    substitute(template, vars, shell_quote)
}

fn substitute(template: &str, vars: &TemplateVars, encode: fn(&str) -> String) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => encode(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Single-quote `value` unless it is made only of characters the shell
/// reads literally.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_known_placeholders() {
        let vars = TemplateVars::new()
            .set("env", "dev")
            .set("release", "api");
        assert_eq!(
            render("helm upgrade --install {release} --set env={env}", &vars),
            "helm upgrade --install api --set env=dev"
        );
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let vars = TemplateVars::new().set("env", "prod");
        assert_eq!(
            render("deploy {env} {region} {{literal}}", &vars),
            "deploy prod {region} {{literal}}"
        );
    }

    #[test]
    fn test_render_command_quotes_hostile_values() {
        let vars = TemplateVars::new()
            .set("path", "/work/$(touch owned)")
            .set("env", "dev");
        assert_eq!(
            render_command("kubectl apply -f {path} --env {env}", &vars),
            "kubectl apply -f '/work/$(touch owned)' --env dev"
        );
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("main"), "main");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a'b; rm"), r"'a'\''b; rm'");
    }
}
