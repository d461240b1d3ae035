//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` and `${VAR}`: the variable must be set
//! - `${VAR:-default}`: `default` when VAR is unset or empty
//! - `${VAR-default}`: `default` only when VAR is unset
//! - `$$`: a literal `$`
//!
//! Values containing line breaks are rejected so a variable cannot inject
//! extra YAML keys.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        | \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        | \$ (?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder pattern is valid")
});

/// Expand environment placeholders in `input`.
///
/// Every problem is collected so a user sees all missing variables at once.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Same as [`interpolate`] with an explicit variable lookup.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut problems = Vec::new();

    let text = PLACEHOLDER.replace_all(input, |caps: &Captures| {
        let whole = &caps[0];
        if whole == "$$" {
            return "$".to_string();
        }

        let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
            return whole.to_string();
        };
        let name = name.as_str();
        let op = caps.name("op").map(|m| m.as_str());
        let default = caps.name("default").map(|m| m.as_str());

        match lookup(name) {
            Some(value) if value.contains(['\n', '\r']) => {
                problems.push(format!("environment variable '{name}' contains a line break"));
                whole.to_string()
            }
            Some(value) if value.is_empty() && op == Some(":-") => {
                default.unwrap_or_default().to_string()
            }
            Some(value) => value,
            None => match default {
                Some(default) => default.to_string(),
                None => {
                    problems.push(format!("environment variable '{name}' is not set"));
                    whole.to_string()
                }
            },
        }
    });

    if problems.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_bare_and_braced() {
        let env = lookup(&[("KEY", "sk-123"), ("MODEL", "gpt-4o-mini")]);
        let out = interpolate_with("api_key: $KEY\nmodel: ${MODEL}", env).unwrap();
        assert_eq!(out, "api_key: sk-123\nmodel: gpt-4o-mini");
    }

    #[test]
    fn test_defaults() {
        let env = lookup(&[("EMPTY", "")]);
        assert_eq!(
            interpolate_with("${UNSET:-20}", &env).unwrap(),
            "20".to_string()
        );
        assert_eq!(interpolate_with("${EMPTY:-20}", &env).unwrap(), "20");
        assert_eq!(interpolate_with("${EMPTY-20}", &env).unwrap(), "");
        assert_eq!(interpolate_with("${UNSET-20}", &env).unwrap(), "20");
    }

    #[test]
    fn test_all_missing_variables_reported() {
        let env = lookup(&[]);
        let problems = interpolate_with("a: $FIRST\nb: ${SECOND}", env).unwrap_err();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("FIRST"));
        assert!(problems[1].contains("SECOND"));
    }

    #[test]
    fn test_escape() {
        let env = lookup(&[]);
        assert_eq!(interpolate_with("cost: $$5", env).unwrap(), "cost: $5");
    }

    #[test]
    fn test_line_break_rejected() {
        let env = lookup(&[("EVIL", "x\nstage: other")]);
        let problems = interpolate_with("stage: $EVIL", env).unwrap_err();
        assert!(problems[0].contains("line break"));
    }
}
