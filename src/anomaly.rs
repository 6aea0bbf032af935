//! Rule-based anomaly detection over memory populations.
//!
//! Each [`AnomalyRule`] inspects one item plus its context and may emit an
//! [`AnomalyReport`]. The detector itself never fails: a rule error is
//! logged, counted in the [`ScanReport`], and the scan moves on.

use crate::error::{MemoryError, Result};
use crate::types::{MemoryContent, MemoryId, MemoryItem, OwnerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Size,
    Importance,
    AccessRate,
    DuplicatePattern,
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnomalyType::Size => "size",
            AnomalyType::Importance => "importance",
            AnomalyType::AccessRate => "access_rate",
            AnomalyType::DuplicatePattern => "duplicate_pattern",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Inspect manually
    Review,
    /// Split or summarise the payload
    Compact,
    /// Re-clamp importance into [0, 1]
    Reclamp,
    /// Check the caller for a hot loop
    Throttle,
    /// Merge near-duplicates
    Deduplicate,
}

/// One finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub item_id: MemoryId,
    pub owner: OwnerId,
    pub anomaly_type: AnomalyType,
    /// Severity in [0, 1]
    pub score: f32,
    pub reason: String,
    pub recommended_action: RecommendedAction,
}

/// Runtime-adjustable limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    pub min_size_bytes: usize,
    pub max_size_bytes: usize,
    pub max_accesses_per_hour: f64,
    /// More similar items than this flags a duplicate pattern
    pub max_similar_items: usize,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            min_size_bytes: 4,
            max_size_bytes: 1024 * 1024,
            max_accesses_per_hour: 100.0,
            max_similar_items: 5,
        }
    }
}

impl AnomalyThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.min_size_bytes > self.max_size_bytes {
            return Err(MemoryError::Configuration(format!(
                "anomaly min_size_bytes {} exceeds max_size_bytes {}",
                self.min_size_bytes, self.max_size_bytes
            )));
        }
        if self.max_accesses_per_hour.is_nan() || self.max_accesses_per_hour <= 0.0 {
            return Err(MemoryError::Configuration(
                "anomaly max_accesses_per_hour must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Per-item context supplied by the caller
#[derive(Debug, Clone)]
pub struct AnomalyContext {
    pub now: DateTime<Utc>,
    /// Items the similarity oracle considers close to this one
    pub similar_count: usize,
}

impl AnomalyContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            similar_count: 0,
        }
    }

    pub fn with_similar_count(mut self, count: usize) -> Self {
        self.similar_count = count;
        self
    }
}

pub trait AnomalyRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(
        &self,
        item: &MemoryItem,
        ctx: &AnomalyContext,
        thresholds: &AnomalyThresholds,
    ) -> Result<Option<AnomalyReport>>;
}

fn report(
    item: &MemoryItem,
    anomaly_type: AnomalyType,
    score: f32,
    reason: String,
    recommended_action: RecommendedAction,
) -> Option<AnomalyReport> {
    Some(AnomalyReport {
        item_id: item.id.clone(),
        owner: item.owner.clone(),
        anomaly_type,
        score: if score.is_finite() { score.clamp(0.0, 1.0) } else { 1.0 },
        reason,
        recommended_action,
    })
}

/// Serialized payload size, without the content-kind envelope
fn payload_size(content: &MemoryContent) -> Result<usize> {
    let bytes = match content {
        MemoryContent::Text(text) => serde_json::to_vec(text)?,
        MemoryContent::List(entries) => serde_json::to_vec(entries)?,
        MemoryContent::Structured(map) => serde_json::to_vec(map)?,
    };
    Ok(bytes.len())
}

/// Payload size outside [min, max]
#[derive(Debug, Default)]
pub struct SizeRule;

impl AnomalyRule for SizeRule {
    fn name(&self) -> &'static str {
        "size"
    }

    fn evaluate(
        &self,
        item: &MemoryItem,
        _ctx: &AnomalyContext,
        t: &AnomalyThresholds,
    ) -> Result<Option<AnomalyReport>> {
        let size = payload_size(&item.content)?;
        if size > t.max_size_bytes {
            return Ok(report(
                item,
                AnomalyType::Size,
                1.0 - t.max_size_bytes as f32 / size as f32,
                format!("{size} bytes exceeds maximum of {} bytes", t.max_size_bytes),
                RecommendedAction::Compact,
            ));
        }
        if size < t.min_size_bytes {
            return Ok(report(
                item,
                AnomalyType::Size,
                1.0 - size as f32 / t.min_size_bytes as f32,
                format!("{size} bytes is below minimum of {} bytes", t.min_size_bytes),
                RecommendedAction::Review,
            ));
        }
        Ok(None)
    }
}

/// Importance outside [0, 1] or not a number
#[derive(Debug, Default)]
pub struct ImportanceRule;

impl AnomalyRule for ImportanceRule {
    fn name(&self) -> &'static str {
        "importance"
    }

    fn evaluate(
        &self,
        item: &MemoryItem,
        _ctx: &AnomalyContext,
        _t: &AnomalyThresholds,
    ) -> Result<Option<AnomalyReport>> {
        let value = item.importance;
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            return Ok(None);
        }
        Ok(report(
            item,
            AnomalyType::Importance,
            1.0,
            format!("importance {value} is outside [0, 1]"),
            RecommendedAction::Reclamp,
        ))
    }
}

/// Accesses per hour of lifetime above the ceiling. Lifetimes under an hour
/// count as one hour.
#[derive(Debug, Default)]
pub struct AccessRateRule;

impl AnomalyRule for AccessRateRule {
    fn name(&self) -> &'static str {
        "access_rate"
    }

    fn evaluate(
        &self,
        item: &MemoryItem,
        ctx: &AnomalyContext,
        t: &AnomalyThresholds,
    ) -> Result<Option<AnomalyReport>> {
        let hours = (item.age(ctx.now).num_seconds() as f64 / 3600.0).max(1.0);
        let rate = item.access_count as f64 / hours;
        if rate <= t.max_accesses_per_hour {
            return Ok(None);
        }
        Ok(report(
            item,
            AnomalyType::AccessRate,
            (1.0 - t.max_accesses_per_hour / rate) as f32,
            format!(
                "{rate:.1} accesses/hour exceeds ceiling of {:.1}",
                t.max_accesses_per_hour
            ),
            RecommendedAction::Throttle,
        ))
    }
}

/// Too many near-duplicates of one item
#[derive(Debug, Default)]
pub struct DuplicatePatternRule;

impl AnomalyRule for DuplicatePatternRule {
    fn name(&self) -> &'static str {
        "duplicate_pattern"
    }

    fn evaluate(
        &self,
        item: &MemoryItem,
        ctx: &AnomalyContext,
        t: &AnomalyThresholds,
    ) -> Result<Option<AnomalyReport>> {
        if ctx.similar_count <= t.max_similar_items {
            return Ok(None);
        }
        Ok(report(
            item,
            AnomalyType::DuplicatePattern,
            1.0 - t.max_similar_items as f32 / ctx.similar_count as f32,
            format!(
                "{} similar items found, more than {}",
                ctx.similar_count, t.max_similar_items
            ),
            RecommendedAction::Deduplicate,
        ))
    }
}

/// Outcome of a batch scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub reports: Vec<AnomalyReport>,
    /// Rule evaluations that returned an error
    pub rule_failures: usize,
}

impl ScanReport {
    pub fn count_of(&self, anomaly_type: AnomalyType) -> usize {
        self.reports
            .iter()
            .filter(|r| r.anomaly_type == anomaly_type)
            .count()
    }

    pub fn merge(&mut self, other: ScanReport) {
        self.scanned += other.scanned;
        self.rule_failures += other.rule_failures;
        self.reports.extend(other.reports);
    }
}

pub struct AnomalyDetector {
    rules: Vec<Box<dyn AnomalyRule>>,
    thresholds: RwLock<AnomalyThresholds>,
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("rules", &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyThresholds::default())
    }
}

impl AnomalyDetector {
    /// Detector with the four built-in rules
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self {
            rules: vec![
                Box::new(SizeRule),
                Box::new(ImportanceRule),
                Box::new(AccessRateRule),
                Box::new(DuplicatePatternRule),
            ],
            thresholds: RwLock::new(thresholds),
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn AnomalyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub async fn thresholds(&self) -> AnomalyThresholds {
        self.thresholds.read().await.clone()
    }

    pub async fn set_thresholds(&self, thresholds: AnomalyThresholds) -> Result<()> {
        thresholds.validate()?;
        *self.thresholds.write().await = thresholds;
        Ok(())
    }

    /// Run every rule against a single item
    pub async fn evaluate(&self, item: &MemoryItem, ctx: &AnomalyContext) -> ScanReport {
        let thresholds = self.thresholds().await;
        self.evaluate_with(item, ctx, &thresholds)
    }

    fn evaluate_with(
        &self,
        item: &MemoryItem,
        ctx: &AnomalyContext,
        thresholds: &AnomalyThresholds,
    ) -> ScanReport {
        let mut out = ScanReport {
            scanned: 1,
            ..ScanReport::default()
        };
        for rule in &self.rules {
            match rule.evaluate(item, ctx, thresholds) {
                Ok(Some(report)) => out.reports.push(report),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(rule = rule.name(), item = %item.id, error = %e, "Anomaly rule failed");
                    out.rule_failures += 1;
                }
            }
        }
        out
    }

    /// Scan a batch; thresholds are read once for the whole batch
    pub async fn scan(&self, batch: &[(MemoryItem, AnomalyContext)]) -> ScanReport {
        let thresholds = self.thresholds().await;
        let mut out = ScanReport::default();
        for (item, ctx) in batch {
            out.merge(self.evaluate_with(item, ctx, &thresholds));
        }
        if !out.reports.is_empty() {
            tracing::debug!(
                scanned = out.scanned,
                anomalies = out.reports.len(),
                failures = out.rule_failures,
                "Anomaly scan finished"
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;
    use chrono::Duration;

    fn item(content: &str, importance: f32) -> MemoryItem {
        MemoryItem::new("p1", content.into(), Tier::Short, importance, Utc::now())
    }

    struct BrokenRule;

    impl AnomalyRule for BrokenRule {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn evaluate(
            &self,
            _item: &MemoryItem,
            _ctx: &AnomalyContext,
            _t: &AnomalyThresholds,
        ) -> Result<Option<AnomalyReport>> {
            Err(MemoryError::Other(anyhow::anyhow!("rule exploded")))
        }
    }

    #[tokio::test]
    async fn size_rule_flags_both_ends() {
        let detector = AnomalyDetector::new(AnomalyThresholds {
            min_size_bytes: 8,
            max_size_bytes: 64,
            ..AnomalyThresholds::default()
        });
        let ctx = AnomalyContext::new(Utc::now());

        let tiny = detector.evaluate(&item("x", 0.5), &ctx).await;
        assert_eq!(tiny.count_of(AnomalyType::Size), 1);

        let huge = detector.evaluate(&item(&"y".repeat(500), 0.5), &ctx).await;
        let report = &huge.reports[0];
        assert_eq!(report.anomaly_type, AnomalyType::Size);
        assert_eq!(report.recommended_action, RecommendedAction::Compact);
        assert!(report.score > 0.0 && report.score <= 1.0);

        let fine = detector.evaluate(&item("a normal note", 0.5), &ctx).await;
        assert!(fine.reports.is_empty());
    }

    #[tokio::test]
    async fn size_rule_counts_structured_payload() {
        let detector = AnomalyDetector::new(AnomalyThresholds {
            min_size_bytes: 1,
            max_size_bytes: 300,
            ..AnomalyThresholds::default()
        });
        // 40 keys with empty values: 229 bytes as plain text, 351 serialized
        let doc: std::collections::BTreeMap<String, serde_json::Value> = (0..40)
            .map(|i| (format!("k{i}"), serde_json::json!("")))
            .collect();
        let structured = MemoryItem::new(
            "p1",
            MemoryContent::Structured(doc),
            Tier::Short,
            0.5,
            Utc::now(),
        );

        let out = detector
            .evaluate(&structured, &AnomalyContext::new(Utc::now()))
            .await;
        assert_eq!(out.count_of(AnomalyType::Size), 1);
        assert_eq!(out.reports[0].recommended_action, RecommendedAction::Compact);
    }

    #[tokio::test]
    async fn importance_rule_catches_unclamped_values() {
        let detector = AnomalyDetector::default();
        let mut bad = item("importance gone wrong", 0.5);
        bad.importance = 1.7;
        let out = detector
            .evaluate(&bad, &AnomalyContext::new(Utc::now()))
            .await;
        assert_eq!(out.count_of(AnomalyType::Importance), 1);

        bad.importance = f32::NAN;
        let out = detector
            .evaluate(&bad, &AnomalyContext::new(Utc::now()))
            .await;
        assert_eq!(out.count_of(AnomalyType::Importance), 1);
    }

    #[tokio::test]
    async fn access_rate_and_duplicates() {
        let detector = AnomalyDetector::default();
        let now = Utc::now();
        let mut hot = item("hot item", 0.5);
        hot.created_at = now - Duration::hours(2);
        hot.access_count = 500;

        let ctx = AnomalyContext::new(now).with_similar_count(9);
        let out = detector.evaluate(&hot, &ctx).await;
        assert_eq!(out.count_of(AnomalyType::AccessRate), 1);
        assert_eq!(out.count_of(AnomalyType::DuplicatePattern), 1);
    }

    #[tokio::test]
    async fn thresholds_are_mutable_at_runtime() {
        let detector = AnomalyDetector::default();
        let mut it = item("busy", 0.5);
        it.access_count = 50;
        let ctx = AnomalyContext::new(Utc::now());
        assert_eq!(detector.evaluate(&it, &ctx).await.count_of(AnomalyType::AccessRate), 0);

        let mut thresholds = detector.thresholds().await;
        thresholds.max_accesses_per_hour = 10.0;
        detector.set_thresholds(thresholds).await.unwrap();
        assert_eq!(detector.evaluate(&it, &ctx).await.count_of(AnomalyType::AccessRate), 1);

        let invalid = AnomalyThresholds {
            min_size_bytes: 10,
            max_size_bytes: 1,
            ..AnomalyThresholds::default()
        };
        assert!(detector.set_thresholds(invalid).await.is_err());
    }

    #[tokio::test]
    async fn failing_rule_does_not_abort_batch() {
        let detector = AnomalyDetector::default().with_rule(Box::new(BrokenRule));
        let now = Utc::now();
        let mut bad = item("z", 0.5);
        bad.importance = -1.0;
        let batch = vec![
            (item("first ordinary note", 0.4), AnomalyContext::new(now)),
            (bad, AnomalyContext::new(now)),
        ];

        let out = detector.scan(&batch).await;
        assert_eq!(out.scanned, 2);
        assert_eq!(out.rule_failures, 2);
        assert_eq!(out.count_of(AnomalyType::Importance), 1);
    }
}
