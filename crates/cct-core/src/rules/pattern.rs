use serde::{Deserialize, Serialize};

/// A stored always-allow rule, matched against incoming tool requests by
/// [`super::engine::check_always_allow`].
///
/// `matchMode=exact` rules compare `input` by canonical deep equality;
/// `matchMode=pattern` rules dispatch on `tool_name` using the fields below
/// (spec §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub tool_name: String,
    pub match_mode: MatchMode,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub command_prefix: Option<String>,
    #[serde(default)]
    pub directory_path: Option<String>,
    #[serde(default)]
    pub path_pattern: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    Pattern,
}

impl Rule {
    /// Format the canonical string form stored in `.claude/settings.local.json`,
    /// e.g. `Bash(git:*)`, `Read(//abs/path/**)`, `Write(/**)`.
    pub fn to_canonical(&self) -> String {
        match self.tool_name.as_str() {
            "Bash" => {
                let prefix = self.command_prefix.as_deref().unwrap_or("*");
                if prefix == "*" {
                    "Bash(*)".to_string()
                } else {
                    format!("Bash({prefix}:*)")
                }
            }
            "Read" | "Write" | "Edit" => {
                let path = self.directory_path.as_deref().unwrap_or("*");
                if path == "*" {
                    format!("{}(/**)", self.tool_name)
                } else {
                    format!("{}(//{}/**)", self.tool_name, path.trim_start_matches('/'))
                }
            }
            "Grep" | "Glob" => {
                let pattern = self.path_pattern.as_deref().unwrap_or("*");
                format!("{}({})", self.tool_name, pattern)
            }
            other => format!("{other}(*)"),
        }
    }

    /// Parse a canonical string form back into a pattern-mode rule. Liberal:
    /// tolerates a missing leading `//` on absolute paths.
    pub fn parse(s: &str, description: impl Into<String>) -> Option<Rule> {
        let open = s.find('(')?;
        let close = s.rfind(')')?;
        if close < open {
            return None;
        }
        let tool_name = s[..open].to_string();
        let body = &s[open + 1..close];

        let rule = match tool_name.as_str() {
            "Bash" => {
                let prefix = body.strip_suffix(":*").unwrap_or(body);
                Rule {
                    tool_name,
                    match_mode: MatchMode::Pattern,
                    input: None,
                    command_prefix: Some(prefix.to_string()),
                    directory_path: None,
                    path_pattern: None,
                    description: description.into(),
                }
            }
            "Read" | "Write" | "Edit" => {
                let path = if body == "*" || body == "/**" {
                    "*".to_string()
                } else {
                    let trimmed = body.trim_start_matches('/').trim_end_matches("/**");
                    format!("/{trimmed}")
                };
                Rule {
                    tool_name,
                    match_mode: MatchMode::Pattern,
                    input: None,
                    command_prefix: None,
                    directory_path: Some(path),
                    path_pattern: None,
                    description: description.into(),
                }
            }
            "Grep" | "Glob" => Rule {
                tool_name,
                match_mode: MatchMode::Pattern,
                input: None,
                command_prefix: None,
                directory_path: None,
                path_pattern: Some(body.to_string()),
                description: description.into(),
            },
            _ => return None,
        };
        Some(rule)
    }
}
