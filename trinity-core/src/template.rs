//! Agent template parsing and credential-file rendering
//!
//! A template is either a local directory (`local:<name>`) or a GitHub
//! repository (`github:owner/repo`). It carries at minimum a
//! `template.yaml`, plus optional `.mcp.json(.template)`, `.env.example`
//! and prompt files. The credential schema is the union of every
//! `${VAR}` reference found across those files.

use std::collections::BTreeMap;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CredentialFiles, Resources};

/// Upper bound on credentials accepted in one request
pub const MAX_CREDENTIALS: usize = 100;

lazy_static! {
    static ref VAR_RE: Regex = Regex::new(r"\$\{([A-Z][A-Z0-9_]*)\}").expect("static regex");
    static ref ENV_NAME_RE: Regex = Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("static regex");
    static ref GITHUB_REPO_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").expect("static regex");
}

/// Parsed template reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateId {
    /// Directory under the local templates root
    Local(String),
    /// `owner/repo` on GitHub, cloned shallow with a PAT
    Github(String),
}

impl TemplateId {
    /// Parse `local:<name>` or `github:<owner>/<repo>`
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(name) = raw.strip_prefix("local:") {
            if name.is_empty() || name.contains('/') || name.contains("..") {
                return Err(Error::Validation(format!("invalid local template '{raw}'")));
            }
            return Ok(Self::Local(name.to_string()));
        }
        if let Some(repo) = raw.strip_prefix("github:") {
            if !GITHUB_REPO_RE.is_match(repo) {
                return Err(Error::Validation(format!(
                    "invalid github template '{raw}': expected owner/repo"
                )));
            }
            return Ok(Self::Github(repo.to_string()));
        }
        Err(Error::Validation(format!(
            "invalid template id '{raw}': expected 'local:<name>' or 'github:<owner>/<repo>'"
        )))
    }

    /// The canonical `local:…` / `github:…` form
    pub fn as_str(&self) -> String {
        match self {
            Self::Local(name) => format!("local:{name}"),
            Self::Github(repo) => format!("github:{repo}"),
        }
    }
}

/// One rendered config file described by the template's credential schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFileSpec {
    pub path: String,
    pub template: String,
}

/// Per-MCP-server credential requirements in `template.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerCredentials {
    #[serde(default)]
    pub env_vars: Vec<String>,
}

/// The `credentials:` section of `template.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialSection {
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerCredentials>,
    #[serde(default)]
    pub env_file: Vec<String>,
    #[serde(default)]
    pub config_files: Vec<ConfigFileSpec>,
}

/// Parsed `template.yaml`
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub credentials: CredentialSection,
}

impl TemplateSpec {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Validation(format!("invalid template.yaml: {e}")))
    }
}

/// A credential the template requires, with where it was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredCredential {
    pub name: String,
    pub source: String,
}

/// Consolidated credential requirements of a template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialSchema {
    pub required_credentials: Vec<RequiredCredential>,
    /// MCP server name → env vars it references
    pub mcp_servers: BTreeMap<String, Vec<String>>,
    pub env_file_vars: Vec<String>,
}

/// Collect `${VAR}` references from `.mcp.json` content, grouped by server
///
/// Both `env` values and `args` entries are scanned.
pub fn extract_mcp_env_vars(mcp_json: &str) -> BTreeMap<String, Vec<String>> {
    let mut result = BTreeMap::new();
    let Ok(data) = serde_json::from_str::<serde_json::Value>(mcp_json) else {
        return result;
    };
    let Some(servers) = data.get("mcpServers").and_then(|v| v.as_object()) else {
        return result;
    };

    for (server_name, config) in servers {
        let mut vars: Vec<String> = Vec::new();
        if let Some(env) = config.get("env").and_then(|v| v.as_object()) {
            for value in env.values() {
                if let Some(s) = value.as_str() {
                    collect_vars(s, &mut vars);
                }
            }
        }
        if let Some(args) = config.get("args").and_then(|v| v.as_array()) {
            for arg in args {
                if let Some(s) = arg.as_str() {
                    collect_vars(s, &mut vars);
                }
            }
        }
        if !vars.is_empty() {
            vars.sort();
            vars.dedup();
            result.insert(server_name.clone(), vars);
        }
    }
    result
}

fn collect_vars(text: &str, out: &mut Vec<String>) {
    for cap in VAR_RE.captures_iter(text) {
        out.push(cap[1].to_string());
    }
}

/// Extract variable names from `.env.example` content
pub fn extract_env_example_vars(content: &str) -> Vec<String> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((name, _)) = line.split_once('=') {
            let name = name.trim();
            if ENV_NAME_RE.is_match(name) {
                vars.push(name.to_string());
            }
        }
    }
    vars
}

/// Build the consolidated credential schema of a staged template directory
pub fn extract_credential_schema(dir: &Path) -> Result<CredentialSchema> {
    let mut schema = CredentialSchema::default();
    // var name → sources, first source wins as primary
    let mut all_vars: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let mcp_json_path = dir.join(".mcp.json");
    let mcp_template_path = dir.join(".mcp.json.template");
    let mcp_content = if mcp_json_path.exists() {
        Some(read(&mcp_json_path)?)
    } else if mcp_template_path.exists() {
        Some(read(&mcp_template_path)?)
    } else {
        None
    };
    if let Some(content) = mcp_content {
        schema.mcp_servers = extract_mcp_env_vars(&content);
        for (server, vars) in &schema.mcp_servers {
            for var in vars {
                all_vars
                    .entry(var.clone())
                    .or_default()
                    .push(format!("mcp:{server}"));
            }
        }
    }

    let template_yaml_path = dir.join("template.yaml");
    if template_yaml_path.exists() {
        let spec = TemplateSpec::from_yaml(&read(&template_yaml_path)?)?;
        for (server, creds) in &spec.credentials.mcp_servers {
            for var in &creds.env_vars {
                let sources = all_vars.entry(var.clone()).or_default();
                if !sources.contains(&format!("mcp:{server}")) {
                    sources.push(format!("template:mcp:{server}"));
                }
            }
        }
        schema.env_file_vars = spec.credentials.env_file.clone();
        for var in &schema.env_file_vars {
            all_vars
                .entry(var.clone())
                .or_default()
                .push("template:env_file".to_string());
        }
    }

    let env_example_path = dir.join(".env.example");
    if env_example_path.exists() {
        for var in extract_env_example_vars(&read(&env_example_path)?) {
            all_vars.entry(var).or_default().push(".env.example".to_string());
        }
    }

    for (name, sources) in all_vars {
        let source = sources.first().cloned().unwrap_or_else(|| "unknown".to_string());
        schema.required_credentials.push(RequiredCredential { name, source });
    }
    Ok(schema)
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("failed to read {}: {e}", path.display())))
}

/// Render credential files from supplied values
///
/// Produces `.mcp.json` with `${VAR}` substitutions, a generated `.env`
/// for the schema's `env_file` list, and any `config_files` with `{VAR}`
/// placeholders replaced. Returns path → content, ready for injection.
pub fn render_credential_files(
    spec: &TemplateSpec,
    mcp_json_template: Option<&str>,
    credentials: &BTreeMap<String, String>,
) -> Result<CredentialFiles> {
    if credentials.len() > MAX_CREDENTIALS {
        return Err(Error::Validation(format!(
            "too many credentials: {} (max {MAX_CREDENTIALS})",
            credentials.len()
        )));
    }

    let mut files = CredentialFiles::new();

    if !spec.credentials.mcp_servers.is_empty() {
        if let Some(template) = mcp_json_template {
            let mut config: serde_json::Value = serde_json::from_str(template)
                .map_err(|e| Error::Validation(format!("invalid .mcp.json template: {e}")))?;
            if let Some(servers) = config.get_mut("mcpServers").and_then(|v| v.as_object_mut()) {
                for server_config in servers.values_mut() {
                    substitute_mcp_server(server_config, credentials);
                }
            }
            files.insert(
                ".mcp.json".to_string(),
                serde_json::to_string_pretty(&config).map_err(Error::internal)?,
            );
        }
    }

    if !spec.credentials.env_file.is_empty() {
        let mut lines = vec!["# Generated by Trinity - Agent credentials".to_string(), String::new()];
        for var in &spec.credentials.env_file {
            let value = credentials.get(var).map(String::as_str).unwrap_or("");
            lines.push(format!("{var}={value}"));
        }
        files.insert(".env".to_string(), lines.join("\n"));
    }

    for config_file in &spec.credentials.config_files {
        if config_file.path.is_empty() || config_file.template.is_empty() {
            continue;
        }
        let mut content = config_file.template.clone();
        for (var, value) in credentials {
            content = content.replace(&format!("{{{var}}}"), value);
        }
        files.insert(config_file.path.clone(), content);
    }

    Ok(files)
}

fn substitute_mcp_server(server: &mut serde_json::Value, credentials: &BTreeMap<String, String>) {
    if let Some(env) = server.get_mut("env").and_then(|v| v.as_object_mut()) {
        for value in env.values_mut() {
            if let Some(var) = placeholder_name(value) {
                let real = credentials.get(&var).cloned().unwrap_or_default();
                *value = serde_json::Value::String(real);
            }
        }
    }
    if let Some(args) = server.get_mut("args").and_then(|v| v.as_array_mut()) {
        for arg in args.iter_mut() {
            if let Some(var) = placeholder_name(arg) {
                let real = credentials.get(&var).cloned().unwrap_or_default();
                *arg = serde_json::Value::String(real);
            }
        }
    }
}

// A value that is exactly `${VAR}` and nothing else
fn placeholder_name(value: &serde_json::Value) -> Option<String> {
    let s = value.as_str()?;
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    ENV_NAME_RE.is_match(inner).then(|| inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MCP_JSON: &str = r#"{
        "mcpServers": {
            "heygen": {
                "command": "npx",
                "args": ["-y", "heygen-mcp", "${HEYGEN_API_KEY}"],
                "env": {"HEYGEN_API_KEY": "${HEYGEN_API_KEY}"}
            },
            "plain": {
                "command": "node",
                "args": ["server.js"]
            }
        }
    }"#;

    #[test]
    fn test_template_id_parsing() {
        assert_eq!(
            TemplateId::parse("local:default").unwrap(),
            TemplateId::Local("default".into())
        );
        assert_eq!(
            TemplateId::parse("github:Abilityai/agent-ruby").unwrap(),
            TemplateId::Github("Abilityai/agent-ruby".into())
        );
        assert!(TemplateId::parse("ftp:whatever").is_err());
        assert!(TemplateId::parse("local:../escape").is_err());
        assert!(TemplateId::parse("github:not-a-repo").is_err());
    }

    #[test]
    fn test_template_id_round_trip() {
        for raw in ["local:default", "github:owner/repo"] {
            assert_eq!(TemplateId::parse(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn test_extract_mcp_env_vars_scans_env_and_args() {
        let vars = extract_mcp_env_vars(MCP_JSON);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["heygen"], vec!["HEYGEN_API_KEY".to_string()]);
    }

    #[test]
    fn test_extract_env_example_vars() {
        let content = "# comment\n\nBLOTATO_API_KEY=\nlowercase=skip\nOTHER_KEY=x\n";
        assert_eq!(
            extract_env_example_vars(content),
            vec!["BLOTATO_API_KEY".to_string(), "OTHER_KEY".to_string()]
        );
    }

    #[test]
    fn test_extract_credential_schema_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".mcp.json"), MCP_JSON).unwrap();
        std::fs::write(
            dir.path().join("template.yaml"),
            "name: demo\ncredentials:\n  env_file:\n    - BLOTATO_API_KEY\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(".env.example"), "EXTRA_KEY=\n").unwrap();

        let schema = extract_credential_schema(dir.path()).unwrap();
        let names: Vec<&str> = schema
            .required_credentials
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["BLOTATO_API_KEY", "EXTRA_KEY", "HEYGEN_API_KEY"]);
        assert_eq!(schema.env_file_vars, vec!["BLOTATO_API_KEY".to_string()]);
        let heygen = schema
            .required_credentials
            .iter()
            .find(|c| c.name == "HEYGEN_API_KEY")
            .unwrap();
        assert_eq!(heygen.source, "mcp:heygen");
    }

    #[test]
    fn test_render_substitutes_mcp_and_env() {
        let spec = TemplateSpec::from_yaml(
            "name: demo\ncredentials:\n  mcp_servers:\n    heygen:\n      env_vars: [HEYGEN_API_KEY]\n  env_file:\n    - BLOTATO_API_KEY\n",
        )
        .unwrap();
        let mut creds = BTreeMap::new();
        creds.insert("HEYGEN_API_KEY".to_string(), "hg-123".to_string());
        creds.insert("BLOTATO_API_KEY".to_string(), "bl-456".to_string());

        let files = render_credential_files(&spec, Some(MCP_JSON), &creds).unwrap();

        let mcp = &files[".mcp.json"];
        assert!(mcp.contains("hg-123"));
        assert!(!mcp.contains("${HEYGEN_API_KEY}"));

        let env = &files[".env"];
        assert!(env.contains("BLOTATO_API_KEY=bl-456"));
        assert!(env.starts_with("# Generated by Trinity"));
    }

    #[test]
    fn test_render_missing_credentials_become_empty() {
        let spec = TemplateSpec::from_yaml(
            "name: demo\ncredentials:\n  env_file:\n    - MISSING_KEY\n",
        )
        .unwrap();
        let files = render_credential_files(&spec, None, &BTreeMap::new()).unwrap();
        assert!(files[".env"].contains("MISSING_KEY="));
    }

    #[test]
    fn test_render_config_files() {
        let spec = TemplateSpec::from_yaml(
            "name: demo\ncredentials:\n  config_files:\n    - path: .config/tool.ini\n      template: \"key={TOOL_KEY}\"\n",
        )
        .unwrap();
        let mut creds = BTreeMap::new();
        creds.insert("TOOL_KEY".to_string(), "t-789".to_string());
        let files = render_credential_files(&spec, None, &creds).unwrap();
        assert_eq!(files[".config/tool.ini"], "key=t-789");
    }

    #[test]
    fn test_render_rejects_credential_flood() {
        let spec = TemplateSpec::from_yaml("name: demo\n").unwrap();
        let creds: BTreeMap<String, String> = (0..=MAX_CREDENTIALS)
            .map(|i| (format!("VAR_{i}"), "v".to_string()))
            .collect();
        assert!(render_credential_files(&spec, None, &creds).is_err());
    }
}
