use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use codeloom_types::{ToolResult, ToolSchema};

pub const DOCS_LOOKUP_TOOL: &str = "docs_lookup";

const DOCS_OUTPUT_MAX_CHARS: usize = 8_000;
const DEFAULT_PACKAGE_INDEX: &str = "https://pypi.org/pypi";

static PACKAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,99}$").expect("valid package regex"));

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Registry with the documentation lookup tool against the public package index.
    pub fn new() -> Self {
        Self::with_tools(vec![Arc::new(DocsLookupTool::new())])
    }

    pub fn with_tools(tools: Vec<Arc<dyn Tool>>) -> Self {
        let map = tools
            .into_iter()
            .map(|tool| (tool.schema().name, tool))
            .collect::<HashMap<_, _>>();
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub fn empty() -> Self {
        Self::with_tools(Vec::new())
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<ToolResult> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return Ok(ToolResult {
                output: format!("Unknown tool: {name}"),
                metadata: json!({}),
            });
        };
        tool.execute(args).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        if schema.input_schema.get("type").and_then(|t| t.as_str()) != Some("object") {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path: "$".to_string(),
                reason: "tool input must be an object schema".to_string(),
            });
        }
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
        let props = obj.get("properties").and_then(|v| v.as_object());
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !props.is_some_and(|p| p.contains_key(name)) {
                return Err(ToolSchemaValidationError {
                    tool_name: tool_name.to_string(),
                    path: path.to_string(),
                    reason: format!("required property `{name}` is not declared"),
                });
            }
        }
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(options) = obj.get(combinator).and_then(|v| v.as_array()) {
            for (idx, child) in options.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{combinator}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

/// Looks up third-party library documentation for the code generator.
///
/// With only `library`, the package index metadata (summary, version and
/// project description) is returned. With `url`, that page is fetched and
/// converted to markdown instead. `query` narrows the description to the
/// paragraphs mentioning its words.
pub struct DocsLookupTool {
    client: reqwest::Client,
    index_url: String,
}

impl Default for DocsLookupTool {
    fn default() -> Self {
        Self::new()
    }
}

impl DocsLookupTool {
    pub fn new() -> Self {
        Self::with_index_url(DEFAULT_PACKAGE_INDEX)
    }

    pub fn with_index_url(index_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("codeloom-docs-lookup")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            index_url: index_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn lookup_package(&self, library: &str, query: &str) -> anyhow::Result<ToolResult> {
        let url = format!("{}/{}/json", self.index_url, library);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ToolResult {
                output: format!("No package named `{library}` was found in the package index."),
                metadata: json!({"library": library, "found": false}),
            });
        }
        if !response.status().is_success() {
            anyhow::bail!(
                "package index returned status {} for `{}`",
                response.status(),
                library
            );
        }
        let value: Value = response.json().await?;
        let info = value.get("info").cloned().unwrap_or_default();
        let field = |key: &str| {
            info.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };
        let name = Some(field("name"))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| library.to_string());
        let docs_url = info
            .get("project_urls")
            .and_then(|urls| {
                urls.get("Documentation")
                    .or_else(|| urls.get("documentation"))
                    .or_else(|| urls.get("Homepage"))
            })
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| field("home_page"));

        let mut output = format!("# {} {}\n", name, field("version"));
        let summary = field("summary");
        if !summary.is_empty() {
            output.push_str(&summary);
            output.push('\n');
        }
        if !docs_url.is_empty() {
            output.push_str(&format!("Documentation: {docs_url}\n"));
        }
        let description = select_paragraphs(&field("description"), query);
        if !description.is_empty() {
            output.push('\n');
            output.push_str(&description);
        }
        let (output, truncated) = truncate_chars(&output, DOCS_OUTPUT_MAX_CHARS);
        Ok(ToolResult {
            output,
            metadata: json!({"library": name, "found": true, "truncated": truncated}),
        })
    }

    async fn fetch_page(&self, url: &str, query: &str) -> anyhow::Result<ToolResult> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("documentation page returned status {status}");
        }
        let body = response.text().await?;
        let markdown = html2md::parse_html(&body);
        let selected = select_paragraphs(&markdown, query);
        let (output, truncated) = truncate_chars(&selected, DOCS_OUTPUT_MAX_CHARS);
        Ok(ToolResult {
            output,
            metadata: json!({"url": url, "truncated": truncated}),
        })
    }
}

#[async_trait]
impl Tool for DocsLookupTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: DOCS_LOOKUP_TOOL.to_string(),
            description: "Look up documentation for a Python library before using it. \
                Returns the package summary and description, or the text of a specific \
                documentation page when `url` is given."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "library": {"type": "string", "description": "Package name as published on PyPI"},
                    "query": {"type": "string", "description": "Optional topic to focus on"},
                    "url": {"type": "string", "description": "Optional documentation page URL"}
                },
                "required": ["library"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let library = args["library"].as_str().unwrap_or("").trim();
        let query = args["query"].as_str().unwrap_or("").trim();
        let url = args["url"].as_str().unwrap_or("").trim();

        if !url.is_empty() {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Ok(ToolResult {
                    output: format!("Refusing to fetch non-http url `{url}`."),
                    metadata: json!({"url": url}),
                });
            }
            tracing::debug!(url, "docs lookup page fetch");
            return self.fetch_page(url, query).await;
        }
        if !PACKAGE_NAME.is_match(library) {
            tracing::warn!("docs_lookup called with invalid library. Args: {}", args);
            return Ok(ToolResult {
                output: format!("Invalid library name. Received args: {args}"),
                metadata: json!({"found": false}),
            });
        }
        tracing::debug!(library, "docs lookup package");
        self.lookup_package(library, query).await
    }
}

/// Orders paragraphs mentioning `query` words first, keeping document order within each group.
fn select_paragraphs(text: &str, query: &str) -> String {
    let paragraphs = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    let terms = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .collect::<Vec<_>>();
    if terms.is_empty() {
        return paragraphs.join("\n\n");
    }
    let (mut hits, misses): (Vec<&str>, Vec<&str>) = paragraphs.into_iter().partition(|p| {
        let lower = p.to_lowercase();
        terms.iter().any(|t| lower.contains(t.as_str()))
    });
    hits.extend(misses);
    hits.join("\n\n")
}

fn truncate_chars(input: &str, max_chars: usize) -> (String, bool) {
    if input.chars().count() <= max_chars {
        return (input.to_string(), false);
    }
    let mut out = input.chars().take(max_chars).collect::<String>();
    out.push_str("\n[truncated]");
    (out, true)
}
