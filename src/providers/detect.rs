use crate::errors::{AppError, AppResult};
use crate::models::DetectionHint;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageManifest {
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

impl PackageManifest {
    fn depends_on(&self, name: &str) -> bool {
        self.dependencies.contains_key(name) || self.dev_dependencies.contains_key(name)
    }

    fn depends_on_prefix(&self, prefix: &str) -> bool {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .any(|name| name.starts_with(prefix))
    }
}

// Ordered: meta-frameworks before the bundlers they are built on.
const FRAMEWORKS: &[(&str, &str, &str)] = &[
    ("next", "next", ".next"),
    ("astro", "astro", "dist"),
    ("@sveltejs/kit", "sveltekit", "build"),
    ("nuxt", "nuxt", ".output/public"),
    ("@remix-run/", "remix", "build/client"),
    ("vite", "vite", "dist"),
];

fn package_manager(dir: &Path) -> &'static str {
    if dir.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if dir.join("yarn.lock").exists() {
        "yarn"
    } else if dir.join("bun.lockb").exists() || dir.join("bun.lock").exists() {
        "bun"
    } else {
        "npm"
    }
}

fn read_manifest(dir: &Path) -> AppResult<Option<PackageManifest>> {
    let path = dir.join("package.json");
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let manifest = serde_json::from_str(&raw)
        .map_err(|error| AppError::Config(format!("{} is not valid JSON: {}", path.display(), error)))?;
    Ok(Some(manifest))
}

/// Plain static site: an `index.html` at the root or in a conventional output folder.
pub fn detect_static(dir: &Path) -> Option<DetectionHint> {
    ["", "public", "dist", "out", "build"]
        .iter()
        .map(|sub| if sub.is_empty() { dir.to_path_buf() } else { dir.join(sub) })
        .find(|candidate| candidate.join("index.html").is_file())
        .map(|publish| DetectionHint {
            framework: Some("static".to_string()),
            publish_dir: Some(publish),
            build_command: None,
        })
}

/// Framework and publish directory guessed from local files only.
pub fn detect_project(dir: &Path) -> AppResult<DetectionHint> {
    if !dir.is_dir() {
        return Err(AppError::NotFound(format!("project directory not found: {}", dir.display())));
    }

    if let Some(manifest) = read_manifest(dir)? {
        let build_command = manifest
            .scripts
            .contains_key("build")
            .then(|| format!("{} run build", package_manager(dir)));
        for (dependency, framework, publish) in FRAMEWORKS {
            let matched = if dependency.ends_with('/') {
                manifest.depends_on_prefix(dependency)
            } else {
                manifest.depends_on(dependency)
            };
            if matched {
                let mut publish_dir: PathBuf = dir.join(publish);
                if *framework == "next" && next_uses_static_export(dir) {
                    publish_dir = dir.join("out");
                }
                return Ok(DetectionHint {
                    framework: Some((*framework).to_string()),
                    publish_dir: Some(publish_dir),
                    build_command,
                });
            }
        }
        if let Some(mut hint) = detect_static(dir) {
            hint.build_command = build_command;
            return Ok(hint);
        }
    }

    detect_static(dir).ok_or_else(|| {
        AppError::NotFound(format!("no supported framework detected in {}", dir.display()))
    })
}

fn next_uses_static_export(dir: &Path) -> bool {
    ["next.config.js", "next.config.mjs", "next.config.ts"]
        .iter()
        .filter_map(|name| std::fs::read_to_string(dir.join(name)).ok())
        .any(|body| body.contains("output") && body.contains("export"))
}
