//! Kubernetes configuration parsing
//!
//! Parses kubeconfig files (typically ~/.kube/config) down to what exec
//! interception needs: contexts, the users they bind and those users'
//! exec-credential plugins. Parsing is best-effort: entries missing a name or
//! body are skipped.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeConfigError {
    #[error("Failed to read kubeconfig: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse kubeconfig: {0}")]
    ParseError(String),
    #[error("No kubeconfig found")]
    NotFound,
}

/// A Kubernetes context from kubeconfig
#[derive(Debug, Clone)]
pub struct KubeContext {
    pub name: String,
    pub user: Option<String>,
}

/// An exec-credential plugin declaration from a user entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecCredentialSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Environment overrides in declaration order
    pub env: Vec<(String, String)>,
}

impl ExecCredentialSpec {
    /// Look up an environment override by name
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Value of a `--flag value` or `--flag=value` argument
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if arg == flag {
                return args.next().map(String::as_str);
            }
            if let Some(value) = arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
                return Some(value);
            }
        }
        None
    }
}

/// A user (identity) entry from kubeconfig
#[derive(Debug, Clone, Default)]
pub struct KubeUser {
    pub name: String,
    pub exec: Option<ExecCredentialSpec>,
}

/// Parsed kubeconfig, possibly merged from several files
#[derive(Debug, Clone, Default)]
pub struct KubeConfig {
    pub current_context: Option<String>,
    pub contexts: Vec<KubeContext>,
    pub users: HashMap<String, KubeUser>,
}

impl KubeConfig {
    /// Resolve kubeconfig files: explicit override, then every `KUBECONFIG` entry, then ~/.kube/config
    pub fn locate(explicit: Option<&Path>) -> Result<Vec<PathBuf>, KubeConfigError> {
        match explicit {
            Some(path) if path.exists() => Ok(vec![path.to_path_buf()]),
            Some(path) => {
                tracing::debug!("Configured kubeconfig {:?} does not exist", path);
                Err(KubeConfigError::NotFound)
            }
            None => Self::default_paths(),
        }
    }

    /// Get the default kubeconfig paths
    pub fn default_paths() -> Result<Vec<PathBuf>, KubeConfigError> {
        let paths = search_paths(std::env::var_os("KUBECONFIG"), dirs::home_dir());
        if paths.is_empty() {
            Err(KubeConfigError::NotFound)
        } else {
            Ok(paths)
        }
    }

    /// Load kubeconfig from a specific path
    pub fn load_from(path: &Path) -> Result<Self, KubeConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load and merge several kubeconfig files.
    ///
    /// Same rules as kubectl: the first file to set current-context wins, and
    /// the first definition of a named context or user wins.
    pub fn load_merged(paths: &[PathBuf]) -> Result<Self, KubeConfigError> {
        let mut merged = Self::default();
        for path in paths {
            merged.merge(Self::load_from(path)?);
        }
        Ok(merged)
    }

    fn merge(&mut self, other: Self) {
        if self.current_context.is_none() {
            self.current_context = other.current_context;
        }
        for context in other.contexts {
            if self.get_context(&context.name).is_none() {
                self.contexts.push(context);
            }
        }
        for (name, user) in other.users {
            self.users.entry(name).or_insert(user);
        }
    }

    /// Parse kubeconfig YAML content
    pub fn parse(content: &str) -> Result<Self, KubeConfigError> {
        let yaml: serde_json::Value = serde_yaml_ng::from_str(content)
            .map_err(|e| KubeConfigError::ParseError(e.to_string()))?;

        if !yaml.is_object() {
            return Err(KubeConfigError::ParseError(
                "kubeconfig root is not a mapping".to_string(),
            ));
        }

        let current_context = yaml
            .get("current-context")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from);

        let contexts = named_entries(&yaml, "contexts", "context")
            .map(|(name, data)| KubeContext {
                name: name.to_string(),
                user: str_field(data, "user").filter(|u| !u.is_empty()),
            })
            .collect();

        let mut users = HashMap::new();
        for (name, data) in named_entries(&yaml, "users", "user") {
            users.entry(name.to_string()).or_insert_with(|| KubeUser {
                name: name.to_string(),
                exec: data.get("exec").and_then(parse_exec),
            });
        }

        Ok(Self {
            current_context,
            contexts,
            users,
        })
    }

    /// Get a context by name
    pub fn get_context(&self, name: &str) -> Option<&KubeContext> {
        self.contexts.iter().find(|c| c.name == name)
    }

    /// Get a user by name
    pub fn get_user(&self, name: &str) -> Option<&KubeUser> {
        self.users.get(name)
    }
}

/// Existing kubeconfig files for a `KUBECONFIG` value, else ~/.kube/config
fn search_paths(kubeconfig: Option<OsString>, home: Option<PathBuf>) -> Vec<PathBuf> {
    if let Some(kubeconfig) = kubeconfig.filter(|v| !v.is_empty()) {
        let mut paths: Vec<PathBuf> = Vec::new();
        for path in std::env::split_paths(&kubeconfig) {
            if path.exists() && !paths.contains(&path) {
                paths.push(path);
            }
        }
        return paths;
    }

    home.map(|home| home.join(".kube").join("config"))
        .filter(|path| path.exists())
        .into_iter()
        .collect()
}

/// Iterate `[{name, <body_key>: {...}}]` entries of a top-level list
fn named_entries<'a>(
    yaml: &'a serde_json::Value,
    list_key: &str,
    body_key: &'a str,
) -> impl Iterator<Item = (&'a str, &'a serde_json::Value)> + 'a {
    yaml.get(list_key)
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(move |entry| {
            let name = entry.get("name").and_then(|v| v.as_str())?;
            let body = entry.get(body_key)?;
            Some((name, body))
        })
}

fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn parse_exec(exec: &serde_json::Value) -> Option<ExecCredentialSpec> {
    let command = exec
        .get("command")
        .and_then(|v| v.as_str())
        .filter(|c| !c.is_empty())?
        .to_string();

    let args = exec
        .get("args")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|a| a.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let env = exec
        .get("env")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|e| {
                    let name = e.get("name").and_then(|v| v.as_str())?;
                    let value = e.get("value").and_then(|v| v.as_str()).unwrap_or("");
                    Some((name.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ExecCredentialSpec { command, args, env })
}
