//! 流配置加载器
//!
//! 每个流一个 TOML 文件 (`<slug>.toml`)，启动时加载并编译，之后只读。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use pk_core::{PeekError, RenderedView, Result};

use crate::error::RenderResult;
use crate::expr::{Context, Expr};
use crate::template::Template;

/// 与路由冲突的保留 slug
const RESERVED_SLUGS: [&str; 3] = ["items", "stream", "streams"];

/// 高亮规则
#[derive(Debug, Clone)]
pub struct HighlightRule {
    /// 命中时追加的 CSS 类
    pub class_name: String,
    /// 判定表达式
    pub when: Expr,
}

/// 渲染结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub view: RenderedView,
    pub highlights: Vec<String>,
}

/// 配置文件的原始结构
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStreamConfig {
    display_name: String,
    fields: RawFields,
    #[serde(default)]
    highlight_rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFields {
    badge: String,
    title: String,
    link: String,
    description: String,
    #[serde(default)]
    coalesce: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    when: String,
    #[serde(rename = "class", alias = "class_")]
    class_name: String,
}

/// 单个流的编译后配置
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub slug: String,
    pub display_name: String,
    badge: Template,
    title: Template,
    link: Template,
    description: Template,
    coalesce: Option<Template>,
    highlight_rules: Vec<HighlightRule>,
}

impl StreamConfig {
    /// 从 TOML 文本构建 (`origin` 用于错误信息)
    pub fn from_toml_str(slug: &str, text: &str, origin: &str) -> Result<Self> {
        validate_slug(slug, origin)?;

        let raw: RawStreamConfig = toml::from_str(text)
            .map_err(|e| PeekError::Config(format!("Failed parsing config {}: {}", origin, e)))?;

        let compile = |key: &str, source: &str| {
            Template::compile(source).map_err(|e| {
                PeekError::Config(format!(
                    "Config {} invalid template for '{}': {}",
                    origin, key, e
                ))
            })
        };
        let fields = &raw.fields;

        Ok(Self {
            slug: slug.to_string(),
            badge: compile("badge", &fields.badge)?,
            title: compile("title", &fields.title)?,
            link: compile("link", &fields.link)?,
            description: compile("description", &fields.description)?,
            coalesce: fields
                .coalesce
                .as_deref()
                .map(|source| compile("coalesce", source))
                .transpose()?,
            highlight_rules: compile_highlight_rules(&raw.highlight_rules, origin)?,
            display_name: raw.display_name,
        })
    }

    /// 从文件加载，slug 取文件名主干
    pub fn from_file(path: &Path) -> Result<Self> {
        let slug = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PeekError::Config(format!("Config {} has no usable name", path.display())))?;
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(slug, &text, &path.display().to_string())
    }

    /// 是否配置了合并键模板
    pub fn has_coalesce(&self) -> bool {
        self.coalesce.is_some()
    }

    /// 求值合并键模板；未配置时返回 `None`
    pub fn coalesce_key(&self, payload: &Value) -> RenderResult<Option<String>> {
        match &self.coalesce {
            Some(template) => template.render(payload).map(Some),
            None => Ok(None),
        }
    }

    /// 渲染视图并计算高亮类
    pub fn render(&self, payload: &Value) -> RenderResult<Rendered> {
        let view = RenderedView {
            badge: self.badge.render(payload)?,
            title: self.title.render(payload)?,
            link: self.link.render(payload)?,
            description: self.description.render(payload)?,
        };

        let ctx = Context::new(payload);
        let mut highlights = Vec::new();
        for rule in &self.highlight_rules {
            if rule.when.eval_truthy(&ctx)? {
                highlights.push(rule.class_name.clone());
            }
        }

        Ok(Rendered { view, highlights })
    }

    /// 高亮规则列表
    pub fn highlight_rules(&self) -> &[HighlightRule] {
        &self.highlight_rules
    }
}

fn validate_slug(slug: &str, origin: &str) -> Result<()> {
    let valid = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(PeekError::Config(format!(
            "Config {} has invalid slug '{}' (allowed: A-Z a-z 0-9 - _)",
            origin, slug
        )));
    }
    if RESERVED_SLUGS.contains(&slug) {
        return Err(PeekError::Config(format!(
            "Config {} uses reserved slug '{}'",
            origin, slug
        )));
    }
    Ok(())
}

fn compile_highlight_rules(rules: &[RawRule], origin: &str) -> Result<Vec<HighlightRule>> {
    rules
        .iter()
        .enumerate()
        .map(|(idx, rule)| {
            let when = Expr::compile(&rule.when).map_err(|e| {
                PeekError::Config(format!(
                    "Config {} highlight rule #{} invalid 'when' expression: {}",
                    origin, idx, e
                ))
            })?;
            Ok(HighlightRule {
                class_name: rule.class_name.clone(),
                when,
            })
        })
        .collect()
}

/// 全部流配置的只读快照
#[derive(Debug, Clone, Default)]
pub struct ConfigSet {
    streams: BTreeMap<String, Arc<StreamConfig>>,
}

impl ConfigSet {
    /// 由已编译的配置构建；slug 重复视为错误
    pub fn from_configs(configs: impl IntoIterator<Item = StreamConfig>) -> Result<Self> {
        let mut streams = BTreeMap::new();
        for config in configs {
            let slug = config.slug.clone();
            if streams.insert(slug.clone(), Arc::new(config)).is_some() {
                return Err(PeekError::Config(format!("Duplicate config slug '{}'", slug)));
            }
        }
        Ok(Self { streams })
    }

    /// 从多个目录加载
    pub fn load(dirs: &[PathBuf]) -> Result<Self> {
        let mut directories: Vec<&PathBuf> = Vec::new();
        let mut seen: HashSet<&PathBuf> = HashSet::new();
        for dir in dirs {
            if seen.insert(dir) {
                directories.push(dir);
            }
        }
        if directories.is_empty() {
            return Err(PeekError::Config("No config directories provided".to_string()));
        }

        let mut streams: BTreeMap<String, Arc<StreamConfig>> = BTreeMap::new();
        let mut sources: HashMap<String, PathBuf> = HashMap::new();
        let mut processed = 0usize;

        for directory in &directories {
            if !directory.exists() {
                tracing::warn!("Config directory {} does not exist; skipping", directory.display());
                continue;
            }
            if !directory.is_dir() {
                tracing::warn!("Config path {} is not a directory; skipping", directory.display());
                continue;
            }
            processed += 1;

            let mut files: Vec<PathBuf> = std::fs::read_dir(directory)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("toml")
                })
                .collect();
            files.sort();

            for path in files {
                let config = StreamConfig::from_file(&path)?;
                if let Some(original) = sources.get(&config.slug) {
                    return Err(PeekError::Config(format!(
                        "Duplicate config slug '{}' found in {} and {}",
                        config.slug,
                        path.display(),
                        original.display()
                    )));
                }
                tracing::debug!(slug = %config.slug, path = %path.display(), "Loaded stream config");
                sources.insert(config.slug.clone(), path);
                streams.insert(config.slug.clone(), Arc::new(config));
            }
        }

        if streams.is_empty() {
            let joined = directories
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(PeekError::Config(format!(
                "No config files found in directories: {}",
                joined
            )));
        }

        let effective = if processed > 0 { processed } else { directories.len() };
        tracing::info!(
            "Loaded {} config(s) from {} director{}",
            streams.len(),
            effective,
            if effective == 1 { "y" } else { "ies" }
        );

        Ok(Self { streams })
    }

    /// 按 slug 查找
    pub fn get(&self, slug: &str) -> Option<&Arc<StreamConfig>> {
        self.streams.get(slug)
    }

    /// 是否包含 slug
    pub fn contains(&self, slug: &str) -> bool {
        self.streams.contains_key(slug)
    }

    /// 迭代所有流
    pub fn iter(&self) -> impl Iterator<Item = &Arc<StreamConfig>> {
        self.streams.values()
    }

    /// 所有 slug
    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
