//! Change detection for resolved configurations.
//!
//! A configuration is rendered to bytes and compared byte-for-byte with the
//! rendering stored by the previous run under the same name. No hashing is
//! involved: the stored file is plain text and doubles as a record of what
//! was last executed.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config_tree::ResolvedConfig;
use crate::error::CoreError;
use crate::hashing::sha256_hex;

/// File name of the stored fingerprint inside a slot directory.
const FINGERPRINT_FILE: &str = "config.ini";

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Renders a resolved configuration to the bytes used for comparison.
///
/// Implementations must be deterministic: equal configs render to identical
/// bytes.
pub trait ConfigRenderer: Send + Sync {
    fn render(&self, name: &str, config: &ResolvedConfig) -> Vec<u8>;
}

/// Renders `key = value` lines under a `# section:` header, in key order.
///
/// Values are written as compact JSON, so `"1"` and `1` differ and embedded
/// newlines stay escaped. Backslashes, line breaks and `=` in keys and the
/// name are escaped with a backslash. Distinct configs never render alike.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextRenderer;

impl ConfigRenderer for TextRenderer {
    fn render(&self, name: &str, config: &ResolvedConfig) -> Vec<u8> {
        let mut out = String::from("# section: config_");
        push_escaped(&mut out, name);
        out.push('\n');
        for (key, value) in config.iter() {
            push_escaped(&mut out, key);
            out.push_str(" = ");
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out.into_bytes()
    }
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' => out.push_str("\\="),
            c => out.push(c),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Persistent slot per configuration name holding the last fingerprint.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Stored fingerprint for `name`, or `None` if nothing was stored yet.
    async fn load(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replace the fingerprint for `name`.
    async fn save(&self, name: &str, fingerprint: &[u8]) -> io::Result<()>;

    /// Forget the fingerprint for `name`. Missing slots are not an error.
    async fn remove(&self, name: &str) -> io::Result<()>;
}

/// Stores each fingerprint as `<root>/config_<slot>/config.ini`.
///
/// `<slot>` is the name itself when it only contains ASCII alphanumerics,
/// `.`, `_` and `-`; otherwise `@<hex digest of the name>`. `@` never
/// appears in a verbatim slot, so the two forms cannot collide. Writes go
/// to a temporary file that is then renamed over the previous one, so a
/// reader never sees a partially written fingerprint.
#[derive(Debug, Clone)]
pub struct FsFingerprintStore {
    root: PathBuf,
}

impl FsFingerprintStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the fingerprint file for `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("config_{}", slot_name(name)))
            .join(FINGERPRINT_FILE)
    }
}

fn slot_name(name: &str) -> String {
    let safe = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if safe {
        name.to_string()
    } else {
        format!("@{}", sha256_hex(name.as_bytes()))
    }
}

#[async_trait]
impl FingerprintStore for FsFingerprintStore {
    async fn load(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, name: &str, fingerprint: &[u8]) -> io::Result<()> {
        let path = self.path_for(name);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("ini.tmp");
        tokio::fs::write(&tmp, fingerprint).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn remove(&self, name: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-process fingerprint store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    slots: tokio::sync::RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn load(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.slots.read().await.get(name).cloned())
    }

    async fn save(&self, name: &str, fingerprint: &[u8]) -> io::Result<()> {
        self.slots
            .write()
            .await
            .insert(name.to_string(), fingerprint.to_vec());
        Ok(())
    }

    async fn remove(&self, name: &str) -> io::Result<()> {
        self.slots.write().await.remove(name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Decides whether a configuration must be executed again.
///
/// Check-and-store for a given name is serialized, so two concurrent callers
/// cannot both observe "changed" for the same rendering.
pub struct ChangeDetector {
    renderer: Arc<dyn ConfigRenderer>,
    store: Arc<dyn FingerprintStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChangeDetector {
    pub fn new(renderer: Arc<dyn ConfigRenderer>, store: Arc<dyn FingerprintStore>) -> Self {
        Self {
            renderer,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Detector using [`TextRenderer`] and a [`FsFingerprintStore`] at `root`.
    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(TextRenderer),
            Arc::new(FsFingerprintStore::new(root)),
        )
    }

    /// Return `true` if `config` renders differently from the fingerprint
    /// stored for `name` (or nothing is stored), saving the new rendering.
    /// Return `false` and leave storage untouched otherwise.
    pub async fn has_changed(&self, name: &str, config: &ResolvedConfig) -> Result<bool, CoreError> {
        let fingerprint = self.renderer.render(name, config);

        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let previous = self.store.load(name).await.map_err(|e| {
            CoreError::Internal(format!("Failed to read fingerprint for '{name}': {e}"))
        })?;

        if previous.as_deref() == Some(fingerprint.as_slice()) {
            tracing::debug!(config_name = name, "Configuration unchanged");
            return Ok(false);
        }

        self.store.save(name, &fingerprint).await.map_err(|e| {
            CoreError::Internal(format!("Failed to store fingerprint for '{name}': {e}"))
        })?;
        tracing::debug!(
            config_name = name,
            first_run = previous.is_none(),
            "Configuration changed"
        );
        Ok(true)
    }

    /// Drop the stored fingerprint for `name` so the next check reports a
    /// change.
    pub async fn invalidate(&self, name: &str) -> Result<(), CoreError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.store.remove(name).await.map_err(|e| {
            CoreError::Internal(format!("Failed to remove fingerprint for '{name}': {e}"))
        })
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn config(pairs: &[(&str, Value)]) -> ResolvedConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn memory_detector() -> ChangeDetector {
        ChangeDetector::new(Arc::new(TextRenderer), Arc::new(MemoryFingerprintStore::new()))
    }

    #[test]
    fn text_renderer_output() {
        let cfg = config(&[("noise", json!("0.1")), ("grid", json!([4, 4]))]);
        let bytes = TextRenderer.render("hbs.fast", &cfg);
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            "# section: config_hbs.fast\ngrid = [4,4]\nnoise = \"0.1\"\n"
        );
    }

    #[test]
    fn values_cannot_forge_extra_lines() {
        let two_keys = config(&[("k", json!("v")), ("x", json!("y"))]);
        let one_key = config(&[("k", json!("v\nx = \"y\""))]);
        assert_ne!(TextRenderer.render("n", &two_keys), TextRenderer.render("n", &one_key));

        let split_key = config(&[("a = b", json!("c"))]);
        let split_value = config(&[("a", json!("b = c"))]);
        assert_ne!(
            TextRenderer.render("n", &split_key),
            TextRenderer.render("n", &split_value)
        );

        let text = config(&[("k", json!("1"))]);
        let number = config(&[("k", json!(1))]);
        assert_ne!(TextRenderer.render("n", &text), TextRenderer.render("n", &number));
    }

    #[tokio::test]
    async fn embedded_newline_change_is_detected() {
        let detector = memory_detector();
        let two_keys = config(&[("k", json!("v")), ("x", json!("y"))]);
        let one_key = config(&[("k", json!("v\nx = y"))]);

        assert!(detector.has_changed("n", &two_keys).await.expect("seed"));
        assert!(detector.has_changed("n", &one_key).await.expect("check"));
    }

    #[test]
    fn equal_configs_render_identically() {
        let a = config(&[("a", json!("1")), ("b", json!("2"))]);
        let b = config(&[("b", json!("2")), ("a", json!("1"))]);
        assert_eq!(TextRenderer.render("x", &a), TextRenderer.render("x", &b));
    }

    #[tokio::test]
    async fn has_changed_true_then_false() {
        let detector = memory_detector();
        let cfg = config(&[("noise", json!("0.1"))]);

        assert!(detector.has_changed("exp1", &cfg).await.expect("first"));
        assert!(!detector.has_changed("exp1", &cfg).await.expect("second"));
    }

    #[tokio::test]
    async fn any_value_change_is_detected() {
        let detector = memory_detector();
        detector
            .has_changed("exp1", &config(&[("noise", json!("0.1"))]))
            .await
            .expect("seed");

        let changed = detector
            .has_changed("exp1", &config(&[("noise", json!("0.2"))]))
            .await
            .expect("check");
        assert!(changed);
    }

    #[tokio::test]
    async fn names_are_tracked_independently() {
        let detector = memory_detector();
        let cfg = config(&[("noise", json!("0.1"))]);
        assert!(detector.has_changed("a", &cfg).await.expect("a"));
        assert!(detector.has_changed("b", &cfg).await.expect("b"));
        assert!(!detector.has_changed("a", &cfg).await.expect("a again"));
    }

    #[tokio::test]
    async fn unchanged_check_leaves_store_untouched() {
        let store = Arc::new(MemoryFingerprintStore::new());
        let detector = ChangeDetector::new(Arc::new(TextRenderer), store.clone());
        let cfg = config(&[("k", json!("v"))]);
        detector.has_changed("n", &cfg).await.expect("seed");

        store.save("n", b"marker").await.expect("overwrite");
        // A differing stored value is a change; the store is rewritten.
        assert!(detector.has_changed("n", &cfg).await.expect("check"));
        let stored = store.load("n").await.expect("load").expect("present");
        assert_eq!(stored, TextRenderer.render("n", &cfg));

        assert!(!detector.has_changed("n", &cfg).await.expect("check"));
        assert_eq!(store.load("n").await.expect("load").expect("present"), stored);
    }

    #[tokio::test]
    async fn invalidate_forces_next_change() {
        let detector = memory_detector();
        let cfg = config(&[("k", json!("v"))]);
        detector.has_changed("n", &cfg).await.expect("seed");

        detector.invalidate("n").await.expect("invalidate");
        assert!(detector.has_changed("n", &cfg).await.expect("after invalidate"));
    }

    #[tokio::test]
    async fn concurrent_checks_report_one_change() {
        let detector = Arc::new(memory_detector());
        let cfg = config(&[("k", json!("v"))]);

        let (a, b) = tokio::join!(
            {
                let d = Arc::clone(&detector);
                let c = cfg.clone();
                async move { d.has_changed("same", &c).await }
            },
            {
                let d = Arc::clone(&detector);
                let c = cfg.clone();
                async move { d.has_changed("same", &c).await }
            }
        );

        let changed = [a.expect("a"), b.expect("b")];
        assert_eq!(changed.iter().filter(|c| **c).count(), 1);
    }

    #[tokio::test]
    async fn fs_store_survives_a_new_instance() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = config(&[("noise", json!("0.1"))]);

        let first = ChangeDetector::on_disk(dir.path());
        assert!(first.has_changed("hbs.fast", &cfg).await.expect("first"));

        let restarted = ChangeDetector::on_disk(dir.path());
        assert!(!restarted.has_changed("hbs.fast", &cfg).await.expect("restart"));

        let written = std::fs::read_to_string(
            dir.path().join("config_hbs.fast").join(FINGERPRINT_FILE),
        )
        .expect("read fingerprint");
        assert!(written.contains("noise = \"0.1\""));
    }

    #[tokio::test]
    async fn fs_store_hashes_unsafe_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FsFingerprintStore::new(dir.path());

        let path = store.path_for("../escape");
        assert!(path.starts_with(dir.path()));
        assert!(path.to_string_lossy().contains("config_@"));

        store.save("../escape", b"x").await.expect("save");
        assert_eq!(store.load("../escape").await.expect("load"), Some(b"x".to_vec()));
    }

    #[test]
    fn hashed_slots_cannot_be_claimed_by_literal_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FsFingerprintStore::new(dir.path());

        let hashed = store.path_for("../escape");
        let digest = sha256_hex(b"../escape");
        for literal in [digest.clone(), format!("sha256-{digest}")] {
            assert_ne!(store.path_for(&literal), hashed);
        }
    }

    #[tokio::test]
    async fn fs_store_remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FsFingerprintStore::new(dir.path());
        store.remove("never-saved").await.expect("remove missing");

        store.save("a", b"1").await.expect("save");
        store.remove("a").await.expect("remove");
        assert_eq!(store.load("a").await.expect("load"), None);
    }
}
