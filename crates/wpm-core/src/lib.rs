//! Core domain model for the Webflow -> Payload migration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "wpm-core";

/// Immutable snapshot of one item fetched from the source collection API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(rename = "isDraft", default)]
    pub is_draft: bool,
    #[serde(rename = "isArchived", default)]
    pub is_archived: bool,
    #[serde(rename = "fieldData", default)]
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    /// Drafts and archived items are excluded from migration.
    pub fn is_active(&self) -> bool {
        !self.is_draft && !self.is_archived
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn field_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Reference fields arrive as arrays of source item ids.
    pub fn field_id_list(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Display name used for matching and log messages.
    pub fn display_name(&self) -> Option<&str> {
        self.field_str("name").filter(|n| !n.trim().is_empty())
    }
}

/// A persisted item in the destination collection. `slug` is the unique
/// natural key within its collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: i64,
    pub slug: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TargetRecord {
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// The entity types the migration knows about, in their fixed processing
/// order: contributors before projects (projects reference contributors),
/// projects before everything that references projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Contributors,
    Projects,
    Faqs,
    Posts,
    Updates,
    MatchingDonors,
}

impl EntityKind {
    pub const fn collection_slug(self) -> &'static str {
        match self {
            EntityKind::Contributors => "contributors",
            EntityKind::Projects => "projects",
            EntityKind::Faqs => "faqs",
            EntityKind::Posts => "posts",
            EntityKind::Updates => "updates",
            EntityKind::MatchingDonors => "matching-donors",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            EntityKind::Contributors => "Contributors",
            EntityKind::Projects => "Projects",
            EntityKind::Faqs => "FAQs",
            EntityKind::Posts => "Posts",
            EntityKind::Updates => "Updates",
            EntityKind::MatchingDonors => "Matching donors",
        }
    }

    /// Dependency tier. Lower tiers must be fully processed first.
    pub const fn tier(self) -> u8 {
        match self {
            EntityKind::Contributors => 0,
            EntityKind::Projects => 1,
            EntityKind::Faqs
            | EntityKind::Posts
            | EntityKind::Updates
            | EntityKind::MatchingDonors => 2,
        }
    }

    /// All kinds in processing order.
    pub const fn ordered() -> [EntityKind; 6] {
        [
            EntityKind::Contributors,
            EntityKind::Projects,
            EntityKind::Faqs,
            EntityKind::Posts,
            EntityKind::Updates,
            EntityKind::MatchingDonors,
        ]
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contributors" => Ok(EntityKind::Contributors),
            "projects" => Ok(EntityKind::Projects),
            "faqs" => Ok(EntityKind::Faqs),
            "posts" => Ok(EntityKind::Posts),
            "updates" => Ok(EntityKind::Updates),
            "matching-donors" | "matching_donors" => Ok(EntityKind::MatchingDonors),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Normalize free text into a URL-safe slug: lower-case, every character
/// outside `[a-z0-9-]` becomes `-`, runs of `-` collapse, edges trimmed.
/// Returns an empty string when nothing survives; callers skip such records.
pub fn sanitize_slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.trim().to_lowercase().chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            Some(c)
        } else {
            None
        };
        match mapped {
            Some(c) => {
                out.push(c);
                last_dash = false;
            }
            None => {
                if !last_dash && !out.is_empty() {
                    out.push('-');
                    last_dash = true;
                }
            }
        }
    }
    if out.ends_with('-') {
        out.pop();
    }
    out
}

/// Closed status vocabulary of the target schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Completed,
    Paused,
    Archived,
}

impl ProjectStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Archived => "archived",
        }
    }
}

/// Total parse result: unknown inputs are surfaced, not silently bucketed.
/// The mapper decides what to do with `Unknown` (current product call:
/// treat as active so content is not hidden, with a warn log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusParse {
    Known(ProjectStatus),
    Unknown(String),
}

impl StatusParse {
    pub fn or_active(&self) -> ProjectStatus {
        match self {
            StatusParse::Known(status) => *status,
            StatusParse::Unknown(_) => ProjectStatus::Active,
        }
    }
}

/// Map a raw status string onto the closed enum. Exact matches win; then
/// the historical substring heuristics; anything else is `Unknown`.
pub fn parse_status(raw: &str) -> StatusParse {
    let norm = raw.trim().to_lowercase();
    match norm.as_str() {
        "active" => return StatusParse::Known(ProjectStatus::Active),
        "completed" => return StatusParse::Known(ProjectStatus::Completed),
        "paused" => return StatusParse::Known(ProjectStatus::Paused),
        "archived" => return StatusParse::Known(ProjectStatus::Archived),
        _ => {}
    }
    if norm.contains("active") || norm.contains("live") {
        StatusParse::Known(ProjectStatus::Active)
    } else if norm.contains("complete") || norm.contains("done") {
        StatusParse::Known(ProjectStatus::Completed)
    } else if norm.contains("pause") || norm.contains("hold") {
        StatusParse::Known(ProjectStatus::Paused)
    } else if norm.contains("archive") {
        StatusParse::Known(ProjectStatus::Archived)
    } else {
        StatusParse::Unknown(raw.to_string())
    }
}

/// Minimal Lexical-style rich-text tree: a root holding paragraph nodes,
/// each paragraph holding text leaves. The target schema requires a
/// well-formed tree, never null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichTextDoc {
    pub root: RichTextNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichTextNode {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RichTextNode>,
}

impl RichTextNode {
    pub fn root(children: Vec<RichTextNode>) -> Self {
        Self {
            node_type: "root".to_string(),
            text: None,
            children,
        }
    }

    pub fn paragraph(children: Vec<RichTextNode>) -> Self {
        Self {
            node_type: "paragraph".to_string(),
            text: None,
            children,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            node_type: "text".to_string(),
            text: Some(value.into()),
            children: Vec::new(),
        }
    }
}

/// Convert flat text into the rich-text tree: one paragraph per non-blank
/// line, blank lines dropped. Empty input yields a single empty paragraph.
pub fn plain_text_to_rich_text(text: &str) -> RichTextDoc {
    let paragraphs: Vec<RichTextNode> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| RichTextNode::paragraph(vec![RichTextNode::text(line)]))
        .collect();

    let paragraphs = if paragraphs.is_empty() {
        vec![RichTextNode::paragraph(Vec::new())]
    } else {
        paragraphs
    };

    RichTextDoc {
        root: RichTextNode::root(paragraphs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_slug("Hello, World!"), "hello-world");
        assert_eq!(sanitize_slug("  Alice & Bob  "), "alice-bob");
        assert_eq!(sanitize_slug("--already--slugged--"), "already-slugged");
        assert_eq!(sanitize_slug("çafé"), "af");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in ["Hello, World!", "a--b", "  MIXED case 42 ", "", "!!!"] {
            let once = sanitize_slug(raw);
            assert_eq!(sanitize_slug(&once), once);
        }
    }

    #[test]
    fn sanitize_output_shape() {
        for raw in ["Hello, World!", "-a-", "x__y", "...", "A B  C"] {
            let slug = sanitize_slug(raw);
            assert!(slug.chars().all(|c| c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || c == '-'));
            assert!(!slug.starts_with('-'));
            assert!(!slug.ends_with('-'));
            assert!(!slug.contains("--"));
        }
    }

    #[test]
    fn sanitize_empty_inputs() {
        assert_eq!(sanitize_slug(""), "");
        assert_eq!(sanitize_slug("   "), "");
        assert_eq!(sanitize_slug("!!!???"), "");
    }

    #[test]
    fn status_exact_values_pass_through() {
        assert_eq!(
            parse_status("completed"),
            StatusParse::Known(ProjectStatus::Completed)
        );
        assert_eq!(
            parse_status("archived"),
            StatusParse::Known(ProjectStatus::Archived)
        );
    }

    #[test]
    fn status_heuristics() {
        assert_eq!(
            parse_status("Active "),
            StatusParse::Known(ProjectStatus::Active)
        );
        assert_eq!(
            parse_status("on hold"),
            StatusParse::Known(ProjectStatus::Paused)
        );
        assert_eq!(
            parse_status("Now Live!"),
            StatusParse::Known(ProjectStatus::Active)
        );
        assert_eq!(
            parse_status("all done"),
            StatusParse::Known(ProjectStatus::Completed)
        );
    }

    #[test]
    fn status_unknown_is_surfaced_then_defaults_active() {
        let parsed = parse_status("xyz-unknown");
        assert_eq!(parsed, StatusParse::Unknown("xyz-unknown".to_string()));
        assert_eq!(parsed.or_active(), ProjectStatus::Active);
    }

    #[test]
    fn empty_text_yields_single_empty_paragraph() {
        for input in ["", "   ", "\n\n\n"] {
            let doc = plain_text_to_rich_text(input);
            assert_eq!(doc.root.node_type, "root");
            assert_eq!(doc.root.children.len(), 1);
            assert_eq!(doc.root.children[0].node_type, "paragraph");
            assert!(doc.root.children[0].children.is_empty());
        }
    }

    #[test]
    fn multiline_text_drops_blanks_and_keeps_order() {
        let doc = plain_text_to_rich_text("first\n\n  second  \n\nthird\n");
        let texts: Vec<&str> = doc
            .root
            .children
            .iter()
            .map(|p| p.children[0].text.as_deref().unwrap())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn source_record_parses_api_shape() {
        let record: SourceRecord = serde_json::from_value(json!({
            "id": "abc123",
            "isDraft": false,
            "isArchived": true,
            "fieldData": {
                "name": "Alice",
                "contributors": ["x", "y"],
                "featured": true
            }
        }))
        .unwrap();
        assert!(!record.is_active());
        assert_eq!(record.display_name(), Some("Alice"));
        assert_eq!(record.field_id_list("contributors"), vec!["x", "y"]);
        assert_eq!(record.field_bool("featured"), Some(true));
        assert!(record.field_id_list("missing").is_empty());
    }

    #[test]
    fn entity_order_respects_tiers() {
        let order = EntityKind::ordered();
        assert_eq!(order[0], EntityKind::Contributors);
        assert_eq!(order[1], EntityKind::Projects);
        for pair in order.windows(2) {
            assert!(pair[0].tier() <= pair[1].tier());
        }
    }
}
