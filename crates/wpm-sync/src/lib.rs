//! Migration pipeline: reconcile source records against the target store,
//! map fields, and upsert in fixed entity order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;
use wpm_core::{
    parse_status, plain_text_to_rich_text, sanitize_slug, EntityKind, SourceRecord, StatusParse,
    TargetRecord,
};
use wpm_source::{SourceClient, SourceClientConfig};
use wpm_target::{MatchMode, RestTargetStore, StoreError, TargetStore};

pub const CRATE_NAME: &str = "wpm-sync";

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source_base_url: String,
    pub source_api_token: String,
    pub target_base_url: String,
    pub target_api_key: String,
    pub collections: HashMap<EntityKind, String>,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl MigrationConfig {
    /// Read configuration from the environment. A missing source token is
    /// fatal before any work starts; a missing collection id only skips
    /// that entity step later.
    pub fn from_env() -> Result<Self> {
        let source_api_token = match std::env::var("WEBFLOW_API_TOKEN") {
            Ok(token) if !token.trim().is_empty() => token,
            _ => bail!("WEBFLOW_API_TOKEN is required"),
        };

        let mut collections = HashMap::new();
        for (kind, var) in [
            (EntityKind::Contributors, "WEBFLOW_CONTRIBUTORS_COLLECTION_ID"),
            (EntityKind::Projects, "WEBFLOW_PROJECTS_COLLECTION_ID"),
            (EntityKind::Faqs, "WEBFLOW_FAQS_COLLECTION_ID"),
            (EntityKind::Posts, "WEBFLOW_POSTS_COLLECTION_ID"),
            (EntityKind::Updates, "WEBFLOW_UPDATES_COLLECTION_ID"),
            (
                EntityKind::MatchingDonors,
                "WEBFLOW_MATCHING_DONORS_COLLECTION_ID",
            ),
        ] {
            if let Ok(id) = std::env::var(var) {
                if !id.trim().is_empty() {
                    collections.insert(kind, id);
                }
            }
        }

        Ok(Self {
            source_base_url: std::env::var("WEBFLOW_API_BASE")
                .unwrap_or_else(|_| "https://api.webflow.com/v2".to_string()),
            source_api_token,
            target_base_url: std::env::var("PAYLOAD_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            target_api_key: std::env::var("PAYLOAD_API_KEY").unwrap_or_default(),
            collections,
            http_timeout_secs: std::env::var("WPM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root: PathBuf::from("."),
        })
    }
}

/// Run-scoped state threaded through the pipeline stages. Replaces the
/// old process-wide mutable maps: one context per invocation, rebuilt
/// from scratch each run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    id_maps: HashMap<EntityKind, HashMap<String, i64>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            id_maps: HashMap::new(),
        }
    }

    /// Record a source id -> target id pair immediately after a write so
    /// later records in the same run can resolve references to it.
    pub fn record(&mut self, kind: EntityKind, source_id: &str, target_id: i64) {
        self.id_maps
            .entry(kind)
            .or_default()
            .insert(source_id.to_string(), target_id);
    }

    pub fn resolve(&self, kind: EntityKind, source_id: &str) -> Option<i64> {
        self.id_maps.get(&kind).and_then(|m| m.get(source_id)).copied()
    }

    /// Resolve a reference array. Unresolvable ids are dropped with a
    /// warning rather than written as dangling references.
    pub fn resolve_refs(&self, kind: EntityKind, source_ids: &[String], owner: &str) -> Vec<i64> {
        let mut resolved = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            match self.resolve(kind, source_id) {
                Some(target_id) => resolved.push(target_id),
                None => warn!(
                    entity = kind.collection_slug(),
                    %source_id,
                    owner,
                    "dropping unresolvable reference"
                ),
            }
        }
        resolved
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Slug the record is keyed by: the source's own slug if present, else
/// its display name, else its id, sanitized. Empty means unusable.
pub fn derived_slug(source: &SourceRecord) -> String {
    let raw = source
        .field_str("slug")
        .filter(|s| !s.trim().is_empty())
        .or_else(|| source.display_name())
        .unwrap_or(source.id.as_str());
    sanitize_slug(raw)
}

fn is_placeholder_name(name: &str) -> bool {
    let trimmed = name.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("untitled")
}

/// Reconciliation cascade, first hit wins:
/// 1. sanitized slug, 2. case-insensitive display name (non-placeholder
/// only), 3. raw unsanitized slug (legacy pre-sanitization records).
/// No hit means create.
pub async fn match_existing(
    store: &dyn TargetStore,
    collection: &str,
    source: &SourceRecord,
) -> Result<Option<TargetRecord>, StoreError> {
    let slug = derived_slug(source);
    if !slug.is_empty() {
        if let Some(hit) = store
            .find_first(collection, "slug", &slug, MatchMode::Exact)
            .await?
        {
            return Ok(Some(hit));
        }
    }

    if let Some(name) = source.display_name().filter(|n| !is_placeholder_name(n)) {
        if let Some(hit) = store
            .find_first(collection, "name", name, MatchMode::CaseInsensitive)
            .await?
        {
            return Ok(Some(hit));
        }
    }

    if let Some(raw_slug) = source.field_str("slug").filter(|s| !s.trim().is_empty()) {
        if raw_slug != slug {
            if let Some(hit) = store
                .find_first(collection, "slug", raw_slug, MatchMode::Exact)
                .await?
            {
                warn!(
                    collection,
                    raw_slug, "matched via legacy unsanitized slug"
                );
                return Ok(Some(hit));
            }
        }
    }

    Ok(None)
}

fn put_str(out: &mut Map<String, Value>, key: &str, source: &SourceRecord, source_key: &str) {
    if let Some(value) = source.field_str(source_key) {
        if !value.trim().is_empty() {
            out.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

fn put_f64(out: &mut Map<String, Value>, key: &str, source: &SourceRecord, source_key: &str) {
    if let Some(value) = source.field_f64(source_key) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            out.insert(key.to_string(), Value::Number(number));
        }
    }
}

fn put_bool(out: &mut Map<String, Value>, key: &str, source: &SourceRecord, source_key: &str) {
    if let Some(value) = source.field_bool(source_key) {
        out.insert(key.to_string(), Value::Bool(value));
    }
}

fn put_rich_text(out: &mut Map<String, Value>, key: &str, source: &SourceRecord, source_key: &str) {
    let text = source.field_str(source_key).unwrap_or_default();
    let doc = plain_text_to_rich_text(text);
    out.insert(
        key.to_string(),
        serde_json::to_value(&doc).expect("rich text tree serializes"),
    );
}

/// Resolved references are written as an id array; a fully-unresolvable
/// list means the field is omitted, never an empty array.
fn put_refs(
    out: &mut Map<String, Value>,
    key: &str,
    ref_kind: EntityKind,
    source: &SourceRecord,
    source_key: &str,
    ctx: &RunContext,
) {
    let source_ids = source.field_id_list(source_key);
    if source_ids.is_empty() {
        return;
    }
    let owner = source.display_name().unwrap_or(source.id.as_str());
    let resolved = ctx.resolve_refs(ref_kind, &source_ids, owner);
    if resolved.is_empty() {
        return;
    }
    out.insert(
        key.to_string(),
        Value::Array(resolved.into_iter().map(Value::from).collect()),
    );
}

fn put_status(out: &mut Map<String, Value>, source: &SourceRecord) {
    let status = match source.field_str("status").filter(|raw| !raw.trim().is_empty()) {
        // Absent status is ordinary source data, defaulted quietly.
        None => wpm_core::ProjectStatus::Active,
        Some(raw) => {
            let parsed = parse_status(raw);
            if let StatusParse::Unknown(ref unknown) = parsed {
                // Fail open: unknown statuses stay visible rather than hidden.
                warn!(raw = unknown.as_str(), "unknown status, defaulting to active");
            }
            parsed.or_active()
        }
    };
    out.insert(
        "status".to_string(),
        Value::String(status.as_str().to_string()),
    );
}

/// Map a source record's fields onto the target collection's shape.
/// Returns `None` when the record has no usable slug; the caller skips it.
pub fn map_fields(
    kind: EntityKind,
    source: &SourceRecord,
    ctx: &RunContext,
) -> Option<Map<String, Value>> {
    let slug = derived_slug(source);
    if slug.is_empty() {
        return None;
    }

    let mut out = Map::new();
    out.insert("slug".to_string(), Value::String(slug));
    put_str(&mut out, "name", source, "name");

    match kind {
        EntityKind::Contributors => {
            put_str(&mut out, "role", source, "role");
            put_str(&mut out, "photoUrl", source, "photo-url");
            put_str(&mut out, "website", source, "website");
            put_rich_text(&mut out, "bio", source, "bio");
        }
        EntityKind::Projects => {
            put_status(&mut out, source);
            put_str(&mut out, "summary", source, "summary");
            put_str(&mut out, "coverImageUrl", source, "cover-image-url");
            put_f64(&mut out, "goalAmount", source, "goal-amount");
            put_f64(&mut out, "raisedAmount", source, "raised-amount");
            put_bool(&mut out, "featured", source, "featured");
            put_rich_text(&mut out, "description", source, "description");
            put_refs(
                &mut out,
                "contributors",
                EntityKind::Contributors,
                source,
                "contributors",
                ctx,
            );
        }
        EntityKind::Faqs => {
            put_str(&mut out, "question", source, "question");
            put_f64(&mut out, "order", source, "order");
            put_rich_text(&mut out, "answer", source, "answer");
            put_refs(
                &mut out,
                "projects",
                EntityKind::Projects,
                source,
                "projects",
                ctx,
            );
        }
        EntityKind::Posts => {
            put_str(&mut out, "excerpt", source, "excerpt");
            put_str(&mut out, "heroImageUrl", source, "hero-image-url");
            put_str(&mut out, "publishedOn", source, "published-on");
            put_rich_text(&mut out, "body", source, "body");
            put_refs(
                &mut out,
                "projects",
                EntityKind::Projects,
                source,
                "projects",
                ctx,
            );
        }
        EntityKind::Updates => {
            put_str(&mut out, "publishedOn", source, "published-on");
            put_rich_text(&mut out, "body", source, "body");
            put_refs(
                &mut out,
                "projects",
                EntityKind::Projects,
                source,
                "projects",
                ctx,
            );
        }
        EntityKind::MatchingDonors => {
            put_str(&mut out, "logoUrl", source, "logo-url");
            put_str(&mut out, "website", source, "website");
            put_f64(&mut out, "matchRatio", source, "match-ratio");
            put_f64(&mut out, "maxAmount", source, "max-amount");
            put_refs(
                &mut out,
                "projects",
                EntityKind::Projects,
                source,
                "projects",
                ctx,
            );
        }
    }

    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(i64),
    Updated(i64),
}

impl UpsertOutcome {
    pub fn target_id(self) -> i64 {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Updated(id) => id,
        }
    }
}

/// Write the mapped fields and record the id pair in the run context.
/// Updates replace the full mapped field set.
pub async fn upsert(
    store: &dyn TargetStore,
    kind: EntityKind,
    source: &SourceRecord,
    fields: Map<String, Value>,
    matched: Option<&TargetRecord>,
    ctx: &mut RunContext,
) -> Result<UpsertOutcome, StoreError> {
    let collection = kind.collection_slug();
    let outcome = match matched {
        Some(existing) => {
            let updated = store.update(collection, existing.id, fields).await?;
            UpsertOutcome::Updated(updated.id)
        }
        None => {
            let created = store.create(collection, fields).await?;
            UpsertOutcome::Created(created.id)
        }
    };
    ctx.record(kind, &source.id, outcome.target_id());
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EntityOutcome {
    pub entity: String,
    pub fetched: usize,
    pub inactive: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub skipped_entities: Vec<String>,
    pub entities: Vec<EntityOutcome>,
}

impl RunSummary {
    pub fn total_failed(&self) -> usize {
        self.entities.iter().map(|e| e.failed).sum()
    }
}

/// Sequential migration run: contributors, then projects, then the
/// project-dependent entities. One record at a time, no cross-record
/// atomicity; a per-record failure is logged and the run continues.
pub struct MigrationPipeline {
    config: MigrationConfig,
    source: SourceClient,
    store: Arc<dyn TargetStore>,
}

impl MigrationPipeline {
    pub fn new(config: MigrationConfig) -> Result<Self> {
        let source = SourceClient::new(SourceClientConfig {
            base_url: config.source_base_url.clone(),
            api_token: config.source_api_token.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            backoff: Default::default(),
        })?;
        let store = RestTargetStore::new(&config.target_base_url, &config.target_api_key)?;
        Ok(Self {
            config,
            source,
            store: Arc::new(store),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn TargetStore>) -> Self {
        self.store = store;
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_entities(&EntityKind::ordered()).await
    }

    /// Run a subset of entity steps, still in fixed order. A single-entity
    /// run cannot resolve references into earlier tiers that were not
    /// processed; those references are dropped with warnings.
    pub async fn run_entities(&self, kinds: &[EntityKind]) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut ctx = RunContext::new();
        let mut outcomes = Vec::new();
        let mut skipped_entities = Vec::new();

        info!(run_id = %ctx.run_id, "starting migration run");

        for &kind in kinds {
            let Some(collection_id) = self.config.collections.get(&kind) else {
                warn!(
                    entity = kind.collection_slug(),
                    "no collection id configured, skipping entity step"
                );
                skipped_entities.push(kind.collection_slug().to_string());
                continue;
            };

            let records = self
                .source
                .fetch_all(collection_id)
                .await
                .with_context(|| format!("fetching {} from source", kind.label()))?;

            let outcome =
                process_records(self.store.as_ref(), kind, &records, &mut ctx).await;
            info!(
                entity = kind.collection_slug(),
                fetched = outcome.fetched,
                created = outcome.created,
                updated = outcome.updated,
                skipped = outcome.skipped,
                failed = outcome.failed,
                "entity step complete"
            );
            outcomes.push(outcome);
        }

        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at,
            status: summarize_status(&outcomes, &skipped_entities).to_string(),
            skipped_entities,
            entities: outcomes,
        };

        self.write_report(&summary).await?;
        Ok(summary)
    }

    async fn write_report(&self, summary: &RunSummary) -> Result<()> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        write_run_report(&reports_dir, summary).await
    }
}

/// Overall run verdict: `succeeded` when nothing failed or was skipped,
/// `failed` only when records failed and nothing was written, `partial`
/// otherwise (including skip-only runs, which did no harm but also did
/// not cover every entity).
fn summarize_status(outcomes: &[EntityOutcome], skipped_entities: &[String]) -> &'static str {
    let failed: usize = outcomes.iter().map(|o| o.failed).sum();
    let wrote = outcomes.iter().any(|o| o.created + o.updated > 0);
    if failed == 0 && skipped_entities.is_empty() {
        "succeeded"
    } else if wrote || failed == 0 {
        "partial"
    } else {
        "failed"
    }
}

/// Match, map, and upsert one entity's records against the target store.
pub async fn process_records(
    store: &dyn TargetStore,
    kind: EntityKind,
    records: &[SourceRecord],
    ctx: &mut RunContext,
) -> EntityOutcome {
    let collection = kind.collection_slug();
    let mut outcome = EntityOutcome {
        entity: collection.to_string(),
        fetched: records.len(),
        ..Default::default()
    };

    for record in records {
        if !record.is_active() {
            outcome.inactive += 1;
            continue;
        }

        let label = record.display_name().unwrap_or(record.id.as_str()).to_string();

        let Some(fields) = map_fields(kind, record, ctx) else {
            warn!(
                collection,
                source_id = %record.id,
                %label,
                "record has no usable slug, skipping"
            );
            outcome.skipped += 1;
            continue;
        };

        let matched = match match_existing(store, collection, record).await {
            Ok(matched) => matched,
            Err(err) => {
                warn!(
                    collection,
                    source_id = %record.id,
                    %label,
                    error = %err,
                    "reconciliation lookup failed, skipping record"
                );
                outcome.failed += 1;
                continue;
            }
        };

        match upsert(store, kind, record, fields, matched.as_ref(), ctx).await {
            Ok(UpsertOutcome::Created(_)) => outcome.created += 1,
            Ok(UpsertOutcome::Updated(_)) => outcome.updated += 1,
            Err(err) => {
                warn!(
                    collection,
                    source_id = %record.id,
                    %label,
                    error = %err,
                    "write failed, continuing with next record"
                );
                outcome.failed += 1;
            }
        }
    }

    outcome
}

/// Write `run_summary.json` and a human-readable brief for the run.
pub async fn write_run_report(reports_dir: &PathBuf, summary: &RunSummary) -> Result<()> {
    tokio::fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    tokio::fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let mut lines = vec![
        "# Migration Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {}", summary.status),
        String::new(),
        "## Entities".to_string(),
    ];
    for outcome in &summary.entities {
        lines.push(format!(
            "- {}: fetched {} (inactive {}), created {}, updated {}, skipped {}, failed {}",
            outcome.entity,
            outcome.fetched,
            outcome.inactive,
            outcome.created,
            outcome.updated,
            outcome.skipped,
            outcome.failed
        ));
    }
    for entity in &summary.skipped_entities {
        lines.push(format!("- {entity}: step skipped (not configured)"));
    }
    lines.push(String::new());

    tokio::fs::write(reports_dir.join("migration_brief.md"), lines.join("\n"))
        .await
        .context("writing migration_brief.md")?;
    Ok(())
}

/// Print briefs for the most recent runs under `reports/`.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Migration Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let brief_path = dir.path().join("migration_brief.md");
        match std::fs::read_to_string(&brief_path) {
            Ok(brief) => {
                lines.push(brief);
                lines.push(String::new());
            }
            Err(_) => {
                lines.push(format!(
                    "## Run `{}` (no brief found)",
                    dir.file_name().to_string_lossy()
                ));
                lines.push(String::new());
            }
        }
    }
    Ok(lines.join("\n"))
}

pub async fn run_migration_from_env() -> Result<RunSummary> {
    let config = MigrationConfig::from_env()?;
    let pipeline = MigrationPipeline::new(config)?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wpm_target::MemoryTargetStore;

    fn source(id: &str, fields: Value) -> SourceRecord {
        serde_json::from_value(json!({
            "id": id,
            "isDraft": false,
            "isArchived": false,
            "fieldData": fields,
        }))
        .expect("source record")
    }

    fn target(id: i64, slug: &str, name: &str) -> TargetRecord {
        TargetRecord {
            id,
            slug: slug.to_string(),
            fields: [("name".to_string(), json!(name))].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn cascade_slug_match_wins_over_differing_name() {
        let store = MemoryTargetStore::new();
        store.seed("contributors", target(5, "alice", "Completely Different")).await;

        let record = source("src1", json!({"slug": "Alice!", "name": "Alice Smith"}));
        let matched = match_existing(&store, "contributors", &record)
            .await
            .expect("match")
            .expect("hit");
        assert_eq!(matched.id, 5);
    }

    #[tokio::test]
    async fn cascade_falls_back_to_case_insensitive_name() {
        let store = MemoryTargetStore::new();
        store.seed("contributors", target(9, "old-slug", "Alice Smith")).await;

        let record = source("src1", json!({"slug": "renamed-alice", "name": "ALICE SMITH"}));
        let matched = match_existing(&store, "contributors", &record)
            .await
            .expect("match")
            .expect("hit");
        assert_eq!(matched.id, 9);
    }

    #[tokio::test]
    async fn cascade_matches_legacy_raw_slug() {
        let store = MemoryTargetStore::new();
        store.seed("contributors", target(3, "Alice Raw!", "Someone Else")).await;

        let record = source("src1", json!({"slug": "Alice Raw!", "name": "Alice"}));
        let matched = match_existing(&store, "contributors", &record)
            .await
            .expect("match")
            .expect("hit");
        assert_eq!(matched.id, 3);
    }

    #[tokio::test]
    async fn cascade_no_match_means_create() {
        let store = MemoryTargetStore::new();
        store.seed("contributors", target(1, "bob", "Bob")).await;

        let record = source("src1", json!({"slug": "alice", "name": "Alice"}));
        let matched = match_existing(&store, "contributors", &record)
            .await
            .expect("match");
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn substring_name_does_not_match_existing_record() {
        let store = MemoryTargetStore::new();
        store.seed("contributors", target(6, "alice-smith", "Alice Smith")).await;

        let record = source("src1", json!({"slug": "alice", "name": "Alice"}));
        let matched = match_existing(&store, "contributors", &record)
            .await
            .expect("match");
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn placeholder_name_does_not_trigger_name_fallback() {
        let store = MemoryTargetStore::new();
        store.seed("contributors", target(2, "untitled", "Untitled")).await;

        let record = source("src1", json!({"slug": "fresh-slug", "name": "untitled"}));
        let matched = match_existing(&store, "contributors", &record)
            .await
            .expect("match");
        assert!(matched.is_none());
    }

    #[test]
    fn reference_resolution_drops_unresolvable_ids() {
        let mut ctx = RunContext::new();
        ctx.record(EntityKind::Contributors, "wf-a", 11);

        let record = source(
            "proj1",
            json!({"slug": "well", "name": "Well", "contributors": ["wf-a", "wf-missing"]}),
        );
        let fields = map_fields(EntityKind::Projects, &record, &ctx).expect("fields");
        assert_eq!(fields.get("contributors"), Some(&json!([11])));
    }

    #[test]
    fn fully_unresolvable_reference_list_is_omitted() {
        let ctx = RunContext::new();
        let record = source(
            "proj1",
            json!({"slug": "well", "name": "Well", "contributors": ["wf-missing"]}),
        );
        let fields = map_fields(EntityKind::Projects, &record, &ctx).expect("fields");
        assert!(!fields.contains_key("contributors"));

        // Absent source field is also omitted, not written as [].
        let record = source("proj2", json!({"slug": "dry", "name": "Dry"}));
        let fields = map_fields(EntityKind::Projects, &record, &ctx).expect("fields");
        assert!(!fields.contains_key("contributors"));
    }

    #[test]
    fn project_mapping_normalizes_status_and_body() {
        let ctx = RunContext::new();
        let record = source(
            "proj1",
            json!({
                "slug": "clean-water",
                "name": "Clean Water",
                "status": "on hold",
                "description": "line one\n\nline two",
                "goal-amount": 5000.0,
                "featured": true
            }),
        );
        let fields = map_fields(EntityKind::Projects, &record, &ctx).expect("fields");
        assert_eq!(fields.get("status"), Some(&json!("paused")));
        assert_eq!(fields.get("goalAmount"), Some(&json!(5000.0)));
        assert_eq!(fields.get("featured"), Some(&json!(true)));

        let description = fields.get("description").expect("description");
        let paragraphs = description["root"]["children"].as_array().expect("children");
        assert_eq!(paragraphs.len(), 2);
    }

    #[test]
    fn absent_status_defaults_to_active() {
        let ctx = RunContext::new();
        let record = source("proj1", json!({"slug": "well", "name": "Well"}));
        let fields = map_fields(EntityKind::Projects, &record, &ctx).expect("fields");
        assert_eq!(fields.get("status"), Some(&json!("active")));
    }

    #[test]
    fn run_status_distinguishes_skip_only_and_failure_only() {
        let clean = EntityOutcome {
            entity: "contributors".to_string(),
            fetched: 1,
            created: 1,
            ..Default::default()
        };
        let failing = EntityOutcome {
            entity: "projects".to_string(),
            fetched: 1,
            failed: 1,
            ..Default::default()
        };

        assert_eq!(summarize_status(&[clean.clone()], &[]), "succeeded");
        assert_eq!(summarize_status(&[], &["faqs".to_string()]), "partial");
        assert_eq!(summarize_status(&[clean.clone()], &["faqs".to_string()]), "partial");
        assert_eq!(summarize_status(&[failing.clone()], &[]), "failed");
        assert_eq!(summarize_status(&[clean, failing], &[]), "partial");
    }

    #[test]
    fn record_without_usable_slug_is_skipped() {
        let ctx = RunContext::new();
        let record = source("???", json!({"slug": "!!!", "name": "   "}));
        assert!(map_fields(EntityKind::Contributors, &record, &ctx).is_none());
    }

    #[tokio::test]
    async fn upsert_records_mapping_for_created_and_updated() {
        let store = MemoryTargetStore::new();
        store.seed("contributors", target(4, "bob", "Bob")).await;
        let mut ctx = RunContext::new();

        let fresh = source("wf-alice", json!({"slug": "alice", "name": "Alice"}));
        let fields = map_fields(EntityKind::Contributors, &fresh, &ctx).expect("fields");
        let outcome = upsert(&store, EntityKind::Contributors, &fresh, fields, None, &mut ctx)
            .await
            .expect("upsert");
        assert!(matches!(outcome, UpsertOutcome::Created(_)));
        assert_eq!(ctx.resolve(EntityKind::Contributors, "wf-alice"), Some(outcome.target_id()));

        let existing = source("wf-bob", json!({"slug": "bob", "name": "Bob Updated"}));
        let fields = map_fields(EntityKind::Contributors, &existing, &ctx).expect("fields");
        let matched = target(4, "bob", "Bob");
        let outcome = upsert(
            &store,
            EntityKind::Contributors,
            &existing,
            fields,
            Some(&matched),
            &mut ctx,
        )
        .await
        .expect("upsert");
        assert_eq!(outcome, UpsertOutcome::Updated(4));
        assert_eq!(ctx.resolve(EntityKind::Contributors, "wf-bob"), Some(4));
    }

    #[tokio::test]
    async fn end_to_end_contributor_then_project_reference() {
        let store = MemoryTargetStore::new();
        let mut ctx = RunContext::new();

        let contributors = vec![source("wf-alice", json!({"slug": "alice", "name": "Alice"}))];
        let outcome =
            process_records(&store, EntityKind::Contributors, &contributors, &mut ctx).await;
        assert_eq!(outcome.created, 1);
        let alice_id = ctx
            .resolve(EntityKind::Contributors, "wf-alice")
            .expect("alice mapped");

        let projects = vec![source(
            "wf-well",
            json!({
                "slug": "village-well",
                "name": "Village Well",
                "status": "Live now",
                "contributors": ["wf-alice"]
            }),
        )];
        let outcome = process_records(&store, EntityKind::Projects, &projects, &mut ctx).await;
        assert_eq!(outcome.created, 1);

        let stored = store.records("projects").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].fields.get("contributors"), Some(&json!([alice_id])));
        assert_eq!(stored[0].field_str("status"), Some("active"));
    }

    #[tokio::test]
    async fn rerun_updates_instead_of_duplicating() {
        let store = MemoryTargetStore::new();

        let records = vec![source("wf-alice", json!({"slug": "alice", "name": "Alice"}))];
        let mut ctx = RunContext::new();
        let first = process_records(&store, EntityKind::Contributors, &records, &mut ctx).await;
        assert_eq!((first.created, first.updated), (1, 0));

        // Fresh context, as a new invocation would have.
        let mut ctx = RunContext::new();
        let second = process_records(&store, EntityKind::Contributors, &records, &mut ctx).await;
        assert_eq!((second.created, second.updated), (0, 1));
        assert_eq!(store.records("contributors").await.len(), 1);
    }

    #[tokio::test]
    async fn inactive_records_are_not_migrated() {
        let store = MemoryTargetStore::new();
        let mut ctx = RunContext::new();

        let records: Vec<SourceRecord> = vec![
            serde_json::from_value(json!({
                "id": "wf-draft",
                "isDraft": true,
                "isArchived": false,
                "fieldData": {"slug": "draft", "name": "Draft"}
            }))
            .expect("record"),
            source("wf-live", json!({"slug": "live", "name": "Live"})),
        ];
        let outcome = process_records(&store, EntityKind::Contributors, &records, &mut ctx).await;
        assert_eq!(outcome.inactive, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(store.records("contributors").await.len(), 1);
    }

    #[tokio::test]
    async fn run_report_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: "succeeded".to_string(),
            skipped_entities: vec!["faqs".to_string()],
            entities: vec![EntityOutcome {
                entity: "contributors".to_string(),
                fetched: 2,
                created: 1,
                updated: 1,
                ..Default::default()
            }],
        };

        let reports_dir = dir.path().join(summary.run_id.to_string());
        write_run_report(&reports_dir, &summary).await.expect("report");

        let brief = std::fs::read_to_string(reports_dir.join("migration_brief.md")).expect("brief");
        assert!(brief.contains("contributors: fetched 2"));
        assert!(brief.contains("faqs: step skipped"));
        let json = std::fs::read_to_string(reports_dir.join("run_summary.json")).expect("json");
        assert!(json.contains("succeeded"));
    }
}
