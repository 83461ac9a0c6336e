// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Template discovery and the renderer seam.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::utils::walk_directory;

/// Context variables handed to a renderer.
pub type Variables = BTreeMap<String, Value>;

pub const TEMPLATE_EXTENSION: &str = "tmpl";

/// Turns template text plus variables into file contents.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, variables: &Variables) -> Result<Vec<u8>>;
}

/// A template found under a source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    pub source: PathBuf,
    /// Path relative to the source directory, extension removed, `/`-separated.
    pub relative_target: String,
}

/// Every `*.tmpl` file under `dir`, hidden files included, in sorted order.
pub fn find_templates(dir: &Path) -> Result<Vec<TemplateFile>> {
    let mut templates = Vec::new();
    for path in walk_directory(dir)? {
        if path.extension().and_then(|ext| ext.to_str()) != Some(TEMPLATE_EXTENSION) {
            continue;
        }
        let Ok(relative) = path.with_extension("").strip_prefix(dir).map(Path::to_path_buf)
        else {
            continue;
        };
        let relative_target = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        templates.push(TemplateFile {
            source: path,
            relative_target,
        });
    }
    Ok(templates)
}

/// Join a remote directory and a relative path with exactly one separator.
pub fn remote_join(dir: &str, relative: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), relative)
}

/// Substitutes `${name}` with the variable's value.
///
/// Strings are inserted verbatim, other values as JSON. Unknown names are
/// left in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableRenderer;

impl TemplateRenderer for VariableRenderer {
    fn render(&self, template: &str, variables: &Variables) -> Result<Vec<u8>> {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                result.push_str(&rest[start..]);
                rest = "";
                break;
            };

            let name = &after[..end];
            match variables.get(name) {
                Some(Value::String(value)) => result.push_str(value),
                Some(value) => result.push_str(&value.to_string()),
                None => {
                    tracing::debug!("Template variable {name} not set");
                    result.push_str(&rest[start..start + 2 + end + 1]);
                }
            }
            rest = &after[end + 1..];
        }
        result.push_str(rest);

        Ok(result.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_variable_renderer() {
        let variables = Variables::from([
            ("server".to_string(), json!("web1")),
            ("workers".to_string(), json!(4)),
        ]);
        let out = VariableRenderer
            .render("server_name ${server}; workers ${workers}; ${missing} ${", &variables)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "server_name web1; workers 4; ${missing} ${"
        );
    }

    #[test]
    fn test_find_templates_strips_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nginx")).unwrap();
        std::fs::write(dir.path().join("nginx/site.conf.tmpl"), "").unwrap();
        std::fs::write(dir.path().join(".env.tmpl"), "").unwrap();
        std::fs::write(dir.path().join("README"), "").unwrap();

        let targets: Vec<String> = find_templates(dir.path())
            .unwrap()
            .into_iter()
            .map(|t| t.relative_target)
            .collect();
        assert_eq!(targets, vec![".env", "nginx/site.conf"]);
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/etc/", "nginx/site.conf"), "/etc/nginx/site.conf");
        assert_eq!(remote_join("/etc", "motd"), "/etc/motd");
    }
}
