//! Application reference resolution and shared-preference files.
//!
//! Session creation calls into an [`AppHelper`] to turn an `app` capability
//! into a local package file and to build shared-preference XML files. The
//! default [`LocalAppHelper`] accepts local paths and downloads `http(s)` URLs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capabilities::{SharedPreference, SharedPreferences};
use crate::error::DriverError;

/// Resolves application references and builds preference files.
#[async_trait]
pub trait AppHelper: Send + Sync {
    /// Returns a local file for `app`, which must carry `extension`.
    async fn configure_app(&self, app: &str, extension: &str) -> Result<PathBuf, DriverError>;

    /// Writes the preferences to a local XML file and returns its path.
    async fn build_shared_prefs(&self, prefs: &SharedPreferences) -> Result<PathBuf, DriverError>;
}

/// Local-filesystem and HTTP implementation of [`AppHelper`].
pub struct LocalAppHelper {
    work_dir: PathBuf,
    client: reqwest::Client,
}

impl LocalAppHelper {
    /// Creates a helper that stores downloads and generated files in `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            client: reqwest::Client::new(),
        }
    }

    fn scratch_dir(&self) -> Result<PathBuf, DriverError> {
        let dir = self.work_dir.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).map_err(|e| {
            DriverError::Configuration(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(dir)
    }

    async fn download(&self, url: &str, extension: &str) -> Result<PathBuf, DriverError> {
        info!(url = %url, "downloading application");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DriverError::Configuration(format!("cannot download '{}': {}", url, e)))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DriverError::Configuration(format!("cannot download '{}': {}", url, e)))?;
        let path = self.scratch_dir()?.join(format!("app{}", extension));
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            DriverError::Configuration(format!("cannot write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), size = bytes.len(), "application downloaded");
        Ok(path)
    }
}

#[async_trait]
impl AppHelper for LocalAppHelper {
    async fn configure_app(&self, app: &str, extension: &str) -> Result<PathBuf, DriverError> {
        if app.starts_with("http://") || app.starts_with("https://") {
            return self.download(app, extension).await;
        }

        let path = expand_home(app);
        if !has_extension(&path, extension) {
            return Err(DriverError::Configuration(format!(
                "app '{}' must be a {} file",
                app, extension
            )));
        }
        if !path.exists() {
            return Err(DriverError::Configuration(format!(
                "app '{}' does not exist or is not accessible",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn build_shared_prefs(&self, prefs: &SharedPreferences) -> Result<PathBuf, DriverError> {
        let name = prefs.name.as_deref().ok_or_else(|| {
            DriverError::Configuration("shared preferences need a file name".into())
        })?;
        let path = self.scratch_dir()?.join(format!("{}.xml", name));
        tokio::fs::write(&path, render_shared_prefs(&prefs.prefs)).await.map_err(|e| {
            DriverError::Configuration(format!("cannot write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }
}

fn expand_home(app: &str) -> PathBuf {
    match app.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(app)),
        None => PathBuf::from(app),
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    let wanted = extension.trim_start_matches('.');
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case(wanted))
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders Android shared-preference XML.
pub fn render_shared_prefs(prefs: &[SharedPreference]) -> String {
    let mut xml = String::from("<?xml version='1.0' encoding='utf-8' standalone='yes' ?>\n<map>\n");
    for pref in prefs {
        let name = escape_xml(&pref.name);
        match pref.kind.as_str() {
            "string" => xml.push_str(&format!(
                "    <string name=\"{}\">{}</string>\n",
                name,
                escape_xml(&value_text(&pref.value))
            )),
            "set" => {
                xml.push_str(&format!("    <set name=\"{}\">\n", name));
                let items = pref.value.as_array().cloned().unwrap_or_default();
                for item in items {
                    xml.push_str(&format!(
                        "        <string>{}</string>\n",
                        escape_xml(&value_text(&item))
                    ));
                }
                xml.push_str("    </set>\n");
            }
            kind => xml.push_str(&format!(
                "    <{} name=\"{}\" value=\"{}\" />\n",
                kind,
                name,
                escape_xml(&value_text(&pref.value))
            )),
        }
    }
    xml.push_str("</map>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_helper() -> (LocalAppHelper, PathBuf) {
        let dir = std::env::temp_dir().join(format!("droidpilot_helper_{}", Uuid::new_v4()));
        (LocalAppHelper::new(&dir), dir)
    }

    #[test]
    fn test_render_shared_prefs() {
        let prefs = vec![
            SharedPreference {
                kind: "boolean".into(),
                name: "onboarded".into(),
                value: json!(true),
            },
            SharedPreference {
                kind: "string".into(),
                name: "user".into(),
                value: json!("a<b"),
            },
            SharedPreference {
                kind: "set".into(),
                name: "tags".into(),
                value: json!(["x", "y"]),
            },
        ];
        let xml = render_shared_prefs(&prefs);
        assert!(xml.contains(r#"<boolean name="onboarded" value="true" />"#));
        assert!(xml.contains(r#"<string name="user">a&lt;b</string>"#));
        assert!(xml.contains("<string>y</string>"));
        assert!(xml.trim_end().ends_with("</map>"));
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension(Path::new("/tmp/app.apk"), ".apk"));
        assert!(has_extension(Path::new("/tmp/APP.APK"), ".apk"));
        assert!(!has_extension(Path::new("/tmp/app.zip"), ".apk"));
        assert!(!has_extension(Path::new("/tmp/app"), ".apk"));
    }

    #[tokio::test]
    async fn test_configure_local_app() {
        let (helper, dir) = temp_helper();
        std::fs::create_dir_all(&dir).unwrap();
        let apk = dir.join("ApiDemos.apk");
        std::fs::write(&apk, b"PK").unwrap();

        let resolved = helper
            .configure_app(apk.to_str().unwrap(), ".apk")
            .await
            .unwrap();
        assert_eq!(resolved, apk);

        let missing = dir.join("missing.apk");
        let err = helper
            .configure_app(missing.to_str().unwrap(), ".apk")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));

        let err = helper.configure_app("/tmp/notes.txt", ".apk").await.unwrap_err();
        assert!(err.to_string().contains(".apk"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_build_shared_prefs_file() {
        let (helper, dir) = temp_helper();
        let prefs = SharedPreferences {
            name: Some("com.example.prefs".into()),
            prefs: vec![SharedPreference {
                kind: "int".into(),
                name: "launches".into(),
                value: json!(3),
            }],
        };
        let path = helper.build_shared_prefs(&prefs).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "com.example.prefs.xml");
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains(r#"<int name="launches" value="3" />"#));

        let unnamed = SharedPreferences {
            name: None,
            prefs: Vec::new(),
        };
        assert!(helper.build_shared_prefs(&unnamed).await.is_err());
        std::fs::remove_dir_all(dir).ok();
    }
}
