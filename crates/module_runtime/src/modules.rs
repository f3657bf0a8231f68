//! Built-in modules. Investigation modules only ever return metadata
//! about what they found, never raw content.

use std::time::Instant;

use core_models::ResultEnvelope;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::{Module, ModuleCapabilities, ModuleContext, ModuleError, Result, AGENT_DESTROY_MODULE};

#[derive(Debug, Deserialize)]
struct FileParams {
    path: String,
    name: String,
    #[serde(default = "default_maxdepth")]
    maxdepth: usize,
}

fn default_maxdepth() -> usize {
    8
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMatch {
    file: String,
    size: u64,
    last_modified: Option<String>,
}

/// Search filesystem roots for file names matching a regex and report
/// metadata about the hits.
pub struct FileModule;

impl Module for FileModule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities { cli_params: true, default_params: true }
    }

    fn params_from_args(&self, args: &[String]) -> Result<Value> {
        let mut map = serde_json::Map::new();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                ModuleError::BadParameters(format!("expected key=value, got '{arg}'"))
            })?;
            match key {
                "path" | "name" => {
                    map.insert(key.to_string(), Value::String(value.to_string()));
                }
                "maxdepth" => {
                    let depth: usize = value.parse().map_err(|_| {
                        ModuleError::BadParameters(format!("maxdepth '{value}' is not a number"))
                    })?;
                    map.insert(key.to_string(), json!(depth));
                }
                other => {
                    return Err(ModuleError::BadParameters(format!(
                        "unknown file parameter '{other}'"
                    )))
                }
            }
        }
        if !map.contains_key("path") || !map.contains_key("name") {
            return Err(ModuleError::BadParameters(
                "file module needs path= and name=".into(),
            ));
        }
        Ok(Value::Object(map))
    }

    fn default_params(&self) -> Result<Value> {
        Ok(json!({"path": "/etc", "name": "^passwd$", "maxdepth": 1}))
    }

    fn run(&self, params: &Value, ctx: &ModuleContext) -> ResultEnvelope {
        let started = Instant::now();
        let params: FileParams = match serde_json::from_value(params.clone()) {
            Ok(p) => p,
            Err(e) => return ResultEnvelope::from_error(format!("bad file parameters: {e}")),
        };
        let pattern = match Regex::new(&params.name) {
            Ok(re) => re,
            Err(e) => return ResultEnvelope::from_error(format!("bad name regex: {e}")),
        };

        let mut matches: Vec<FileMatch> = Vec::new();
        let mut scanned: u64 = 0;
        let mut errors: Vec<String> = Vec::new();

        for entry in WalkDir::new(&params.path).max_depth(params.maxdepth) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            scanned += 1;
            let file_name = entry.file_name().to_string_lossy();
            if !pattern.is_match(&file_name) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };
            let last_modified = meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
            let reported = if ctx.epm {
                // extra-privacy mode strips every identifying path component
                "masked".to_string()
            } else {
                entry.path().display().to_string()
            };
            matches.push(FileMatch { file: reported, size: meta.len(), last_modified });
        }

        ResultEnvelope {
            found_anything: !matches.is_empty(),
            elements: json!({ "matches": matches }),
            statistics: json!({
                "filesScanned": scanned,
                "totalHits": matches.len(),
                "execDurationSecs": started.elapsed().as_secs_f64(),
            }),
            errors,
        }
    }
}

/// Liveness no-op: proves command dispatch works end to end.
pub struct PingModule;

impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities { cli_params: true, default_params: true }
    }

    fn params_from_args(&self, _args: &[String]) -> Result<Value> {
        Ok(Value::Null)
    }

    fn default_params(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn run(&self, _params: &Value, _ctx: &ModuleContext) -> ResultEnvelope {
        ResultEnvelope {
            found_anything: true,
            elements: json!({"pong": true}),
            statistics: json!({"time": chrono::Utc::now().to_rfc3339()}),
            errors: vec![],
        }
    }
}

/// Marker module for agent self-destruction. Registered so that ACL rules
/// and advertised module lists can name it; the agent core intercepts the
/// operation before dispatch.
pub struct AgentDestroyModule;

impl Module for AgentDestroyModule {
    fn name(&self) -> &'static str {
        AGENT_DESTROY_MODULE
    }

    fn run(&self, _params: &Value, _ctx: &ModuleContext) -> ResultEnvelope {
        ResultEnvelope::from_error("agentdestroy is handled by the agent core")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_module_finds_by_regex() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("passwd"), "x").unwrap();
        std::fs::write(dir.path().join("shadow"), "y").unwrap();

        let params = json!({"path": dir.path(), "name": "^passwd$"});
        let env = FileModule.run(&params, &ModuleContext::default());
        assert!(env.found_anything);
        let hits = env.elements["matches"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0]["file"].as_str().unwrap().ends_with("passwd"));
        assert_eq!(env.statistics["totalHits"], 1);
    }

    #[test]
    fn file_module_masks_paths_under_epm() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("passwd"), "x").unwrap();

        let params = json!({"path": dir.path(), "name": "passwd"});
        let env = FileModule.run(&params, &ModuleContext { epm: true });
        let hits = env.elements["matches"].as_array().unwrap();
        assert_eq!(hits[0]["file"], "masked");
    }

    #[test]
    fn file_module_reports_bad_regex_in_envelope() {
        let params = json!({"path": "/tmp", "name": "["});
        let env = FileModule.run(&params, &ModuleContext::default());
        assert!(!env.found_anything);
        assert!(!env.errors.is_empty());
    }

    #[test]
    fn file_cli_params_require_path_and_name() {
        let ok = FileModule
            .params_from_args(&["path=/etc".into(), "name=^hosts$".into()])
            .unwrap();
        assert_eq!(ok["path"], "/etc");
        assert!(FileModule.params_from_args(&["path=/etc".into()]).is_err());
        assert!(FileModule
            .params_from_args(&["path=/etc".into(), "name=a".into(), "depth=2".into()])
            .is_err());
    }

    #[test]
    fn ping_always_answers() {
        let env = PingModule.run(&Value::Null, &ModuleContext::default());
        assert!(env.found_anything);
        assert_eq!(env.elements["pong"], true);
    }
}
