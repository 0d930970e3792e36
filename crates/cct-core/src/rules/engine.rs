use std::path::{Path, PathBuf};

use super::pattern::{MatchMode, Rule};

/// Decide whether `tool_name`/`input` is covered by any rule in `rules`
/// (spec §4.2). Rules are scanned in order; the first match wins.
pub fn check_always_allow(
    rules: &[Rule],
    tool_name: &str,
    input: &serde_json::Value,
) -> (bool, Option<String>) {
    for rule in rules {
        if rule.tool_name != tool_name {
            continue;
        }
        let matched = match rule.match_mode {
            MatchMode::Exact => rule
                .input
                .as_ref()
                .map(|stored| canonical_eq(stored, input))
                .unwrap_or(false),
            MatchMode::Pattern => match_pattern(rule, tool_name, input),
        };
        if matched {
            return (true, Some(rule.description.clone()));
        }
    }
    (false, None)
}

/// Deep-equality over `serde_json::Value`, independent of map key order
/// (`serde_json::Value` already compares object maps unordered when using
/// the default `Map` backing, but we normalize explicitly in case of
/// feature-flagged `preserve_order`).
fn canonical_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> = map
                .iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, v);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(normalize).collect())
        }
        other => other.clone(),
    }
}

fn match_pattern(rule: &Rule, tool_name: &str, input: &serde_json::Value) -> bool {
    match tool_name {
        "Bash" => {
            let prefix = rule.command_prefix.as_deref().unwrap_or("*");
            if prefix == "*" {
                return true;
            }
            input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|cmd| cmd.starts_with(prefix))
                .unwrap_or(false)
        }
        "Read" | "Write" | "Edit" => {
            let dir = rule.directory_path.as_deref().unwrap_or("*");
            if dir == "*" || dir == "/**" {
                return true;
            }
            let Some(file_path) = input.get("file_path").and_then(|v| v.as_str()) else {
                return false;
            };
            path_within(file_path, dir)
        }
        "Grep" => {
            let pattern = rule.path_pattern.as_deref().unwrap_or("*");
            if pattern == "*" {
                return true;
            }
            input
                .get("path")
                .and_then(|v| v.as_str())
                .map(|path| glob_match(pattern, path))
                .unwrap_or(false)
        }
        "Glob" => {
            let pattern = rule.path_pattern.as_deref().unwrap_or("*");
            if pattern == "*" {
                return true;
            }
            input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|req| shared_prefix(pattern, req))
                .unwrap_or(false)
        }
        _ => false,
    }
}

/// `file_path` lies within `dir` (subdirectories included, no traversal
/// outside) once both are resolved to absolute, `.`/`..`-free paths.
fn path_within(file_path: &str, dir: &str) -> bool {
    let file_abs = absolutize(file_path);
    let dir_abs = absolutize(dir);
    file_abs.starts_with(&dir_abs)
}

fn absolutize(p: &str) -> PathBuf {
    let path = Path::new(p);
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(candidate))
        .unwrap_or(false)
}

/// Prefix shared up to the rule pattern's first wildcard character.
fn shared_prefix(pattern: &str, candidate: &str) -> bool {
    let stop = pattern.find(['*', '?', '[']).unwrap_or(pattern.len());
    let literal_prefix = &pattern[..stop];
    candidate.starts_with(literal_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bash_rule(prefix: &str) -> Rule {
        Rule {
            tool_name: "Bash".into(),
            match_mode: MatchMode::Pattern,
            input: None,
            command_prefix: Some(prefix.into()),
            directory_path: None,
            path_pattern: None,
            description: "test rule".into(),
        }
    }

    #[test]
    fn bash_prefix_matches() {
        let rules = vec![bash_rule("git")];
        let (matched, _) = check_always_allow(&rules, "Bash", &json!({"command": "git status"}));
        assert!(matched);
    }

    #[test]
    fn bash_prefix_rejects_other_command() {
        let rules = vec![bash_rule("git")];
        let (matched, _) = check_always_allow(&rules, "Bash", &json!({"command": "rm -rf /"}));
        assert!(!matched);
    }

    #[test]
    fn read_path_containment() {
        let rule = Rule {
            tool_name: "Read".into(),
            match_mode: MatchMode::Pattern,
            input: None,
            command_prefix: None,
            directory_path: Some("/home/user/project".into()),
            path_pattern: None,
            description: "project reads".into(),
        };
        let (matched, _) = check_always_allow(
            &[rule],
            "Read",
            &json!({"file_path": "/home/user/project/src/main.rs"}),
        );
        assert!(matched);
    }

    #[test]
    fn read_path_rejects_traversal_outside() {
        let rule = Rule {
            tool_name: "Read".into(),
            match_mode: MatchMode::Pattern,
            input: None,
            command_prefix: None,
            directory_path: Some("/home/user/project".into()),
            path_pattern: None,
            description: "project reads".into(),
        };
        let (matched, _) = check_always_allow(
            &[rule],
            "Read",
            &json!({"file_path": "/home/user/project/../secrets/id_rsa"}),
        );
        assert!(!matched);
    }

    #[test]
    fn exact_match_ignores_key_order() {
        let rule = Rule {
            tool_name: "Bash".into(),
            match_mode: MatchMode::Exact,
            input: Some(json!({"command": "ls", "cwd": "/tmp"})),
            command_prefix: None,
            directory_path: None,
            path_pattern: None,
            description: "exact ls".into(),
        };
        let (matched, _) =
            check_always_allow(&[rule], "Bash", &json!({"cwd": "/tmp", "command": "ls"}));
        assert!(matched);
    }

    #[test]
    fn glob_pattern_matches_prefix() {
        let rule = Rule {
            tool_name: "Glob".into(),
            match_mode: MatchMode::Pattern,
            input: None,
            command_prefix: None,
            directory_path: None,
            path_pattern: Some("src/**/*.rs".into()),
            description: "src rust files".into(),
        };
        let (matched, _) = check_always_allow(&[rule], "Glob", &json!({"pattern": "src/lib.rs"}));
        assert!(matched);
    }

    #[test]
    fn first_match_wins() {
        let rules = vec![bash_rule("*"), bash_rule("git")];
        let (matched, desc) = check_always_allow(&rules, "Bash", &json!({"command": "anything"}));
        assert!(matched);
        assert_eq!(desc.as_deref(), Some("test rule"));
    }
}
