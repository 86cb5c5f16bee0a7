use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MonitoringConfig;
use crate::error::{CoreError, Result};
use crate::types::SchoolId;

use super::stats::{self, IqrFences};

/// A single observation of a service metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub service: String,
    pub metric: String,
    pub value: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub school_id: Option<SchoolId>,
}

impl MetricSample {
    pub fn new(service: impl Into<String>, metric: impl Into<String>, value: f64) -> Self {
        Self {
            service: service.into(),
            metric: metric.into(),
            value,
            timestamp: Utc::now(),
            school_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn for_school(mut self, school_id: SchoolId) -> Self {
        self.school_id = Some(school_id);
        self
    }
}

/// Learned expectation for a metric; `hourly_adjustments` is keyed by hour of day (UTC).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBaseline {
    pub mean: f64,
    pub std: f64,
    #[serde(default)]
    pub hourly_adjustments: HashMap<u32, f64>,
}

impl MetricBaseline {
    pub fn new(mean: f64, std: f64) -> Self {
        Self {
            mean,
            std,
            hourly_adjustments: HashMap::new(),
        }
    }

    pub fn with_hourly_adjustment(mut self, hour: u32, adjustment: f64) -> Self {
        self.hourly_adjustments.insert(hour % 24, adjustment);
        self
    }

    pub fn expected_at(&self, timestamp: DateTime<Utc>) -> f64 {
        self.mean
            + self
                .hourly_adjustments
                .get(&timestamp.hour())
                .copied()
                .unwrap_or(0.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Statistical,
    Baseline,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn rank(self) -> f64 {
        match self {
            Self::Info => 1.0,
            Self::Warning => 2.0,
            Self::Critical => 3.0,
        }
    }

    fn from_score(score: f64) -> Self {
        if score > 0.8 {
            Self::Critical
        } else if score > 0.5 {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub metric: String,
    pub value: f64,
    /// Statistical mean or baseline expectation the value was compared to.
    pub expected: f64,
    pub confidence: f64,
    pub severity: Severity,
    pub school_id: Option<SchoolId>,
    pub methods: Vec<DetectionMethod>,
    pub z_score: Option<f64>,
    pub deviation: Option<f64>,
    pub business_impact: String,
    pub recommended_actions: Vec<String>,
    /// Ids of alerts folded into this one during correlation.
    pub correlated_alerts: Vec<Uuid>,
    pub correlated_services: Vec<String>,
    pub false_positive_score: f64,
}

impl AnomalyAlert {
    fn correlation_count(&self) -> usize {
        self.correlated_alerts.len()
    }
}

/// Importance of a service when turning confidence into severity.
pub fn service_criticality(service: &str) -> f64 {
    match service {
        "authentication" | "database" => 0.95,
        "kitchen-management" => 0.90,
        "vendor-marketplace" | "message-queue" => 0.85,
        "predictive-analytics" => 0.80,
        "business-intelligence" => 0.75,
        _ => 0.5,
    }
}

fn business_impact(service: &str, value: f64, severity: Severity) -> String {
    match (severity, service) {
        (Severity::Critical, "authentication") => {
            "User login failures affecting all schools. Potential revenue loss.".into()
        }
        (Severity::Critical, "kitchen-management") => {
            let students = (value * 100.0).clamp(0.0, 10_000.0) as u64;
            format!("Kitchen operations disrupted. Meal service delays affecting {students} students.")
        }
        (Severity::Critical, "vendor-marketplace") => {
            "Vendor procurement issues. Supply chain disruption affecting multiple schools.".into()
        }
        (Severity::Critical, "database") => {
            "Database performance degraded. All platform services affected.".into()
        }
        (Severity::Critical, _) => {
            "Critical system anomaly detected. Immediate investigation required.".into()
        }
        (Severity::Warning, "authentication") => {
            "Authentication system showing degraded performance.".into()
        }
        (Severity::Warning, "kitchen-management") => {
            "Kitchen efficiency reduced. Monitor for further degradation.".into()
        }
        (Severity::Warning, "vendor-marketplace") => {
            "Vendor response times elevated. Procurement delays possible.".into()
        }
        (Severity::Warning, _) => "System performance anomaly detected. Monitor closely.".into(),
        (Severity::Info, _) => "Minor anomaly detected. Normal monitoring continues.".into(),
    }
}

/// Metric-specific actions first, then service-specific, capped at five.
pub fn recommended_actions(service: &str, metric: &str, methods: &[DetectionMethod]) -> Vec<String> {
    let mut actions: Vec<&str> = Vec::new();
    if metric.contains("response_time") || metric.contains("latency") {
        actions.extend([
            "Investigate response time degradation",
            "Check infrastructure resource utilization",
        ]);
    }
    if metric.contains("error_rate") {
        actions.extend([
            "Review error logs for patterns",
            "Check recent deployments for issues",
        ]);
    }
    if metric.contains("memory") || metric.contains("cpu") {
        actions.extend([
            "Monitor resource usage trends",
            "Consider scaling recommendations",
        ]);
    }
    actions.extend(match service {
        "authentication" => &[
            "Check authentication service logs for errors",
            "Verify database connectivity",
            "Monitor failed login patterns for security threats",
            "Scale authentication pods if needed",
        ][..],
        "kitchen-management" => &[
            "Check kitchen service health and logs",
            "Verify inventory management system connectivity",
            "Contact kitchen staff for manual verification",
            "Review meal preparation schedules",
        ][..],
        "vendor-marketplace" => &[
            "Check vendor API connectivity",
            "Review vendor optimization recommendations",
            "Monitor supply chain status",
            "Verify vendor SLA compliance",
        ][..],
        "database" => &[
            "Check database connection pool utilization",
            "Review slow query logs",
            "Monitor disk space and memory usage",
            "Consider read replica scaling",
        ][..],
        _ => &["Monitor service health", "Review service logs"][..],
    });
    if methods.contains(&DetectionMethod::Baseline) {
        actions.push("Compare with historical patterns");
    }
    if methods.contains(&DetectionMethod::Statistical) {
        actions.push("Verify statistical significance");
    }
    actions.into_iter().take(5).map(String::from).collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
struct FeedbackCounts {
    false_positives: u64,
    total: u64,
}

#[derive(Clone, Debug)]
struct IssuedAlert {
    id: Uuid,
    service: String,
    metric: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    pub total_detections: u64,
    pub filtered_false_positives: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    /// Share of feedback confirming the alert; 0 without feedback.
    pub accuracy: f64,
    pub false_positive_rate: f64,
    pub baselines: usize,
}

/// Raw detector hit for one sample.
#[derive(Clone, Copy, Debug)]
struct Detection {
    method: DetectionMethod,
    confidence: f64,
    expected: f64,
    z_score: Option<f64>,
    deviation: Option<f64>,
}

type MetricKey = (String, String);

/// Ensemble anomaly detector over batches of metric samples.
///
/// Two detectors vote: a statistical one (z-score and IQR fences over the
/// batch) and a baseline one (distance from a registered expectation).
/// Accepted hits are scored by service criticality, grouped by time and
/// screened against operator feedback.
pub struct AnomalyDetector {
    config: MonitoringConfig,
    baselines: DashMap<MetricKey, MetricBaseline>,
    feedback: DashMap<MetricKey, FeedbackCounts>,
    issued: Mutex<VecDeque<IssuedAlert>>,
    stats: Mutex<DetectionStats>,
}

impl fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("config", &self.config)
            .field("baselines", &self.baselines.len())
            .field("feedback_keys", &self.feedback.len())
            .finish_non_exhaustive()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}

impl AnomalyDetector {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            baselines: DashMap::new(),
            feedback: DashMap::new(),
            issued: Mutex::new(VecDeque::new()),
            stats: Mutex::new(DetectionStats::default()),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn register_baseline(
        &self,
        service: impl Into<String>,
        metric: impl Into<String>,
        baseline: MetricBaseline,
    ) {
        self.baselines
            .insert((service.into(), metric.into()), baseline);
    }

    pub fn baseline(&self, service: &str, metric: &str) -> Option<MetricBaseline> {
        self.baselines
            .get(&(service.to_string(), metric.to_string()))
            .map(|entry| entry.clone())
    }

    pub fn detect(&self, samples: &[MetricSample]) -> Vec<AnomalyAlert> {
        let mut detections: HashMap<usize, Vec<Detection>> = HashMap::new();
        for (index, detection) in self
            .statistical(samples)
            .into_iter()
            .chain(self.against_baselines(samples))
        {
            detections.entry(index).or_default().push(detection);
        }

        let mut indices: Vec<usize> = detections.keys().copied().collect();
        indices.sort_unstable();
        let candidates: Vec<AnomalyAlert> = indices
            .into_iter()
            .filter_map(|index| {
                let hits = detections.remove(&index)?;
                self.ensemble(&samples[index], hits)
            })
            .collect();
        let raw = candidates.len();

        let correlated = self.correlate(candidates);
        let grouped = correlated.len();
        let alerts: Vec<AnomalyAlert> = correlated
            .into_iter()
            .filter_map(|mut alert| {
                alert.false_positive_score = self.false_positive_score(&alert);
                if alert.false_positive_score >= self.config.false_positive_threshold {
                    debug!(
                        target: "hasivu::monitoring",
                        alert = %alert.id,
                        score = alert.false_positive_score,
                        "dropping likely false positive"
                    );
                    None
                } else {
                    Some(alert)
                }
            })
            .collect();

        {
            let mut stats = self.stats.lock();
            stats.total_detections += alerts.len() as u64;
            stats.filtered_false_positives += (grouped - alerts.len()) as u64;
        }
        {
            let mut issued = self.issued.lock();
            for alert in &alerts {
                issued.push_back(IssuedAlert {
                    id: alert.id,
                    service: alert.service.clone(),
                    metric: alert.metric.clone(),
                });
            }
            while issued.len() > self.config.alert_history.max(1) {
                issued.pop_front();
            }
        }

        if !alerts.is_empty() {
            info!(
                target: "hasivu::monitoring",
                samples = samples.len(),
                candidates = raw,
                alerts = alerts.len(),
                "anomalies detected"
            );
        }
        alerts
    }

    /// Records operator feedback for an issued alert. Feeds the historical
    /// false-positive rate of its (service, metric).
    pub fn record_feedback(&self, alert_id: Uuid, is_false_positive: bool) -> Result<()> {
        let (service, metric) = self
            .issued
            .lock()
            .iter()
            .find(|alert| alert.id == alert_id)
            .map(|alert| (alert.service.clone(), alert.metric.clone()))
            .ok_or_else(|| CoreError::NotFound(format!("alert {alert_id}")))?;

        {
            let mut counts = self.feedback.entry((service.clone(), metric.clone())).or_default();
            counts.total += 1;
            if is_false_positive {
                counts.false_positives += 1;
            }
        }
        {
            let mut stats = self.stats.lock();
            if is_false_positive {
                stats.false_positives += 1;
            } else {
                stats.true_positives += 1;
            }
        }
        info!(
            target: "hasivu::monitoring",
            alert = %alert_id,
            %service,
            %metric,
            is_false_positive,
            "anomaly feedback recorded"
        );
        Ok(())
    }

    pub fn statistics(&self) -> DetectionStats {
        let mut stats = self.stats.lock().clone();
        let feedback = stats.true_positives + stats.false_positives;
        if feedback > 0 {
            stats.accuracy = stats.true_positives as f64 / feedback as f64;
            stats.false_positive_rate = stats.false_positives as f64 / feedback as f64;
        }
        stats.baselines = self.baselines.len();
        stats
    }

    fn statistical(&self, samples: &[MetricSample]) -> Vec<(usize, Detection)> {
        let mut groups: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
        for (index, sample) in samples.iter().enumerate() {
            groups
                .entry((sample.service.as_str(), sample.metric.as_str()))
                .or_default()
                .push(index);
        }

        let threshold = self.config.z_score_threshold;
        let mut hits = Vec::new();
        for indices in groups.values() {
            if indices.len() < self.config.min_samples {
                continue;
            }
            let values: Vec<f64> = indices.iter().map(|index| samples[*index].value).collect();
            let (Some(mean), Some(std), Some(fences)) = (
                stats::mean(&values),
                stats::std_dev(&values),
                IqrFences::new(&values, self.config.iqr_multiplier),
            ) else {
                continue;
            };
            for (index, value) in indices.iter().zip(values) {
                let z = if std > 0.0 { ((value - mean) / std).abs() } else { 0.0 };
                if z > threshold || !fences.contains(value) {
                    hits.push((
                        *index,
                        Detection {
                            method: DetectionMethod::Statistical,
                            confidence: (z / threshold).min(1.0),
                            expected: mean,
                            z_score: Some(z),
                            deviation: None,
                        },
                    ));
                }
            }
        }
        hits
    }

    fn against_baselines(&self, samples: &[MetricSample]) -> Vec<(usize, Detection)> {
        samples
            .iter()
            .enumerate()
            .filter_map(|(index, sample)| {
                let baseline = self.baseline(&sample.service, &sample.metric)?;
                let threshold = baseline.std * self.config.baseline_sigma;
                let expected = baseline.expected_at(sample.timestamp);
                let deviation = (sample.value - expected).abs();
                if threshold <= 0.0 || deviation <= threshold {
                    return None;
                }
                Some((
                    index,
                    Detection {
                        method: DetectionMethod::Baseline,
                        confidence: (deviation / threshold).min(1.0),
                        expected,
                        z_score: None,
                        deviation: Some(deviation),
                    },
                ))
            })
            .collect()
    }

    fn ensemble(&self, sample: &MetricSample, hits: Vec<Detection>) -> Option<AnomalyAlert> {
        let agreement = hits.len();
        let confidence = hits.iter().map(|hit| hit.confidence).sum::<f64>() / agreement as f64;
        if agreement < 2 && confidence <= self.config.single_method_confidence {
            return None;
        }

        let methods: Vec<DetectionMethod> = hits.iter().map(|hit| hit.method).collect();
        let expected = hits
            .iter()
            .find(|hit| hit.method == DetectionMethod::Statistical)
            .or_else(|| hits.first())
            .map_or(sample.value, |hit| hit.expected);
        let severity = Severity::from_score(confidence * service_criticality(&sample.service));

        Some(AnomalyAlert {
            id: Uuid::now_v7(),
            timestamp: sample.timestamp,
            service: sample.service.clone(),
            metric: sample.metric.clone(),
            value: sample.value,
            expected,
            confidence,
            severity,
            school_id: sample.school_id,
            z_score: hits.iter().find_map(|hit| hit.z_score),
            deviation: hits.iter().find_map(|hit| hit.deviation),
            business_impact: business_impact(&sample.service, sample.value, severity),
            recommended_actions: recommended_actions(&sample.service, &sample.metric, &methods),
            methods,
            correlated_alerts: Vec::new(),
            correlated_services: Vec::new(),
            false_positive_score: 0.0,
        })
    }

    /// Folds alerts that fire close together into their most severe member.
    fn correlate(&self, mut alerts: Vec<AnomalyAlert>) -> Vec<AnomalyAlert> {
        if alerts.len() <= 1 {
            return alerts;
        }
        alerts.sort_by_key(|alert| alert.timestamp);
        let window = chrono::Duration::seconds(self.config.correlation_window_secs as i64);

        let mut groups: Vec<Vec<AnomalyAlert>> = Vec::new();
        for alert in alerts {
            let slot = groups.iter().position(|group| {
                group
                    .iter()
                    .any(|member| (alert.timestamp - member.timestamp).abs() <= window)
            });
            match slot {
                Some(index) => groups[index].push(alert),
                None => groups.push(vec![alert]),
            }
        }

        groups
            .into_iter()
            .filter_map(|mut group| {
                let primary_index = group
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| {
                        (a.severity.rank() + a.confidence)
                            .total_cmp(&(b.severity.rank() + b.confidence))
                    })
                    .map(|(index, _)| index)?;
                let mut primary = group.swap_remove(primary_index);
                if !group.is_empty() {
                    let services: BTreeSet<String> = group
                        .iter()
                        .map(|alert| alert.service.clone())
                        .chain(std::iter::once(primary.service.clone()))
                        .collect();
                    primary.correlated_alerts = group.iter().map(|alert| alert.id).collect();
                    primary.correlated_services = services.into_iter().collect();
                }
                Some(primary)
            })
            .collect()
    }

    fn false_positive_score(&self, alert: &AnomalyAlert) -> f64 {
        let historical = self
            .feedback
            .get(&(alert.service.clone(), alert.metric.clone()))
            .filter(|counts| counts.total > 5)
            .map_or(0.1, |counts| {
                counts.false_positives as f64 / counts.total as f64
            });
        let score = historical * 0.4
            + (1.0 - alert.confidence) * 0.3
            + 0.2 / alert.methods.len().max(1) as f64
            + 0.1 / (1 + alert.correlation_count()) as f64;
        score.min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn steady(service: &str, metric: &str, count: usize, start: DateTime<Utc>) -> Vec<MetricSample> {
        (0..count)
            .map(|i| {
                MetricSample::new(service, metric, 100.0 + (i % 3) as f64)
                    .at(start + chrono::Duration::seconds(i as i64))
            })
            .collect()
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn flags_statistical_outlier_with_service_severity() {
        let detector = AnomalyDetector::default();
        let mut samples = steady("kitchen-management", "order_processing_time", 19, noon());
        samples.push(MetricSample::new("kitchen-management", "order_processing_time", 500.0).at(noon()));

        let alerts = detector.detect(&samples);
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.value, 500.0);
        assert_eq!(alert.methods, vec![DetectionMethod::Statistical]);
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.z_score.unwrap() > 3.0);
        assert!(alert.business_impact.contains("students"));
        assert!(alert.recommended_actions.len() <= 5);
        assert!(alert.false_positive_score < 0.7);
    }

    #[test]
    fn small_batches_need_a_baseline() {
        let detector = AnomalyDetector::default();
        let samples = vec![
            MetricSample::new("database", "query_latency", 100.0).at(noon()),
            MetricSample::new("database", "query_latency", 180.0).at(noon()),
        ];
        assert!(detector.detect(&samples).is_empty());

        detector.register_baseline("database", "query_latency", MetricBaseline::new(100.0, 10.0));
        let alerts = detector.detect(&samples);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].methods, vec![DetectionMethod::Baseline]);
        assert_eq!(alerts[0].expected, 100.0);
        assert_eq!(alerts[0].deviation, Some(80.0));
        assert_eq!(
            alerts[0].recommended_actions[0],
            "Investigate response time degradation"
        );
    }

    #[test]
    fn hourly_adjustment_shifts_the_expectation() {
        let detector = AnomalyDetector::default();
        detector.register_baseline(
            "kitchen-management",
            "orders_per_minute",
            MetricBaseline::new(100.0, 10.0).with_hourly_adjustment(12, 50.0),
        );
        let lunch = [MetricSample::new("kitchen-management", "orders_per_minute", 140.0).at(noon())];
        assert!(detector.detect(&lunch).is_empty());

        let night = noon() + chrono::Duration::hours(10);
        let quiet = [MetricSample::new("kitchen-management", "orders_per_minute", 140.0).at(night)];
        assert_eq!(detector.detect(&quiet).len(), 1);
    }

    #[test]
    fn agreeing_detectors_and_correlation() {
        let detector = AnomalyDetector::default();
        detector.register_baseline("authentication", "error_rate", MetricBaseline::new(100.0, 5.0));

        let mut samples = steady("authentication", "error_rate", 19, noon());
        samples.push(MetricSample::new("authentication", "error_rate", 400.0).at(noon()));
        let mut other = steady("reporting", "cpu_usage", 19, noon());
        other.push(
            MetricSample::new("reporting", "cpu_usage", 400.0)
                .at(noon() + chrono::Duration::minutes(5)),
        );
        samples.extend(other);

        let alerts = detector.detect(&samples);
        assert_eq!(alerts.len(), 1);
        let primary = &alerts[0];
        assert_eq!(primary.service, "authentication");
        assert_eq!(primary.methods.len(), 2);
        assert_eq!(primary.correlated_alerts.len(), 1);
        assert_eq!(
            primary.correlated_services,
            vec!["authentication".to_string(), "reporting".to_string()]
        );
    }

    #[test]
    fn feedback_suppresses_noisy_metrics() {
        let detector = AnomalyDetector::default();
        detector.register_baseline("vendor-marketplace", "queue_depth", MetricBaseline::new(10.0, 1.0));
        let spike = [MetricSample::new("vendor-marketplace", "queue_depth", 50.0).at(noon())];

        for _ in 0..6 {
            let alerts = detector.detect(&spike);
            assert_eq!(alerts.len(), 1);
            detector.record_feedback(alerts[0].id, true).unwrap();
        }
        assert!(detector.detect(&spike).is_empty());

        let stats = detector.statistics();
        assert_eq!(stats.false_positives, 6);
        assert_eq!(stats.false_positive_rate, 1.0);
        assert_eq!(stats.filtered_false_positives, 1);
        assert!(matches!(
            detector.record_feedback(Uuid::now_v7(), false),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn criticality_table() {
        assert_eq!(service_criticality("authentication"), 0.95);
        assert_eq!(service_criticality("message-queue"), 0.85);
        assert_eq!(service_criticality("unknown"), 0.5);
        assert_eq!(Severity::from_score(0.9), Severity::Critical);
        assert_eq!(Severity::from_score(0.6), Severity::Warning);
        assert_eq!(Severity::from_score(0.5), Severity::Info);
    }
}
