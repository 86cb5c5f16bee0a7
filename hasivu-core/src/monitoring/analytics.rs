use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::SchoolId;

use super::anomaly::Severity;
use super::stats::{self, IqrFences, LinearFit};

/// A service-level objective for one metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlaTarget {
    pub name: String,
    pub metric: String,
    pub service: String,
    pub target: f64,
    pub warning: f64,
    pub critical: f64,
    /// Availability-style metrics, where falling below a threshold violates.
    #[serde(default)]
    pub higher_is_better: bool,
}

impl SlaTarget {
    fn lower(name: &str, metric: &str, service: &str, target: f64, warning: f64, critical: f64) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            service: service.into(),
            target,
            warning,
            critical,
            higher_is_better: false,
        }
    }

    fn higher(name: &str, metric: &str, service: &str, target: f64, warning: f64, critical: f64) -> Self {
        Self {
            higher_is_better: true,
            ..Self::lower(name, metric, service, target, warning, critical)
        }
    }

    /// Catalogue of platform SLAs.
    pub fn platform_defaults() -> Vec<Self> {
        vec![
            Self::lower("Authentication Response Time", "hasivu_auth_response_time_seconds", "authentication", 0.2, 0.5, 1.0),
            Self::higher("Authentication Availability", "hasivu_auth_availability", "authentication", 0.999, 0.995, 0.99),
            Self::lower("Authentication Error Rate", "hasivu_auth_error_rate", "authentication", 0.001, 0.01, 0.05),
            Self::lower("Kitchen Order Processing Time", "kitchen_order_processing_time_seconds", "kitchen-management", 30.0, 60.0, 120.0),
            Self::higher("Kitchen System Availability", "kitchen_system_availability", "kitchen-management", 0.995, 0.99, 0.95),
            Self::lower("Vendor API Response Time", "vendor_api_response_time_seconds", "vendor-marketplace", 1.0, 3.0, 5.0),
            Self::higher("Vendor Procurement Success Rate", "vendor_procurement_success_rate", "vendor-marketplace", 0.98, 0.95, 0.90),
            Self::lower("ML Model Inference Time", "ml_inference_time_milliseconds", "predictive-analytics", 100.0, 250.0, 500.0),
            Self::higher("ML Model Accuracy", "ml_model_accuracy_score", "predictive-analytics", 0.85, 0.80, 0.70),
            Self::lower("Database Query Response Time", "pg_query_duration_seconds", "database", 0.1, 0.5, 2.0),
            Self::lower("Database Connection Pool Utilization", "pg_connection_pool_utilization", "database", 0.7, 0.85, 0.95),
        ]
    }

    /// How far the value is from target, in multiples (1.0 = on target).
    fn impact_multiplier(&self, value: f64) -> f64 {
        let (numerator, denominator) = if self.higher_is_better {
            (self.target, value)
        } else {
            (value, self.target)
        };
        if denominator > 0.0 {
            numerator / denominator
        } else {
            f64::INFINITY
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlaViolation {
    pub id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub target: SlaTarget,
    pub value: f64,
    pub severity: Severity,
    pub business_impact: String,
    pub remediation_actions: Vec<String>,
}

fn sla_impact(target: &SlaTarget, value: f64) -> String {
    let multiplier = target.impact_multiplier(value);
    match target.service.as_str() {
        "authentication" if multiplier > 5.0 => {
            "Critical impact: login failures across schools. Potential revenue loss.".into()
        }
        "authentication" if multiplier > 2.0 => "Moderate impact: degraded login experience.".into(),
        "authentication" => "Minor impact: slight authentication delays.".into(),
        "kitchen-management" if multiplier > 4.0 => {
            "Critical impact: kitchen operations severely delayed for staff and students.".into()
        }
        "kitchen-management" if multiplier > 2.0 => {
            "Moderate impact: kitchen efficiency reduced, meal service affected.".into()
        }
        "kitchen-management" => "Minor impact: slight delays in kitchen operations.".into(),
        "vendor-marketplace" if multiplier > 3.0 => {
            "Critical impact: vendor procurement failures affecting supply for multiple schools.".into()
        }
        "vendor-marketplace" => {
            "Moderate impact: vendor response delays affecting procurement efficiency.".into()
        }
        "predictive-analytics" => {
            "Analytics impact: model performance degraded, affecting decision-making.".into()
        }
        "database" if multiplier > 5.0 => {
            "Critical impact: database performance issues affecting all platform operations.".into()
        }
        "database" => "Moderate impact: database queries slower than expected.".into(),
        service => format!("Service impact: {service} performance below SLA thresholds."),
    }
}

fn remediation_actions(target: &SlaTarget) -> Vec<String> {
    let mut actions: Vec<&str> = match target.service.as_str() {
        "authentication" => vec![
            "Scale authentication service pods",
            "Check database connection pool",
            "Verify session cache performance",
            "Review authentication logs for errors",
        ],
        "kitchen-management" => vec![
            "Check kitchen service resource utilization",
            "Verify inventory system connectivity",
            "Scale kitchen management pods",
            "Review order processing queues",
        ],
        "vendor-marketplace" => vec![
            "Check vendor API connectivity",
            "Scale vendor service instances",
            "Review vendor optimization recommendations",
            "Verify third-party service status",
        ],
        "predictive-analytics" => vec![
            "Check model server resources",
            "Verify training data pipeline",
            "Scale inference pods",
            "Review model performance metrics",
        ],
        "database" => vec![
            "Check database connection pool",
            "Review slow query logs",
            "Verify read replica status",
            "Monitor disk I/O and memory usage",
        ],
        _ => Vec::new(),
    };
    if target.metric.contains("response_time") {
        actions.push("Investigate response time bottlenecks");
    }
    if target.metric.contains("error_rate") {
        actions.push("Review error logs and patterns");
    }
    if target.metric.contains("availability") {
        actions.push("Check service health and uptime");
    }
    actions.into_iter().take(5).map(String::from).collect()
}

/// Compares an observed value against a target. Warning and critical
/// thresholds are exclusive bounds.
pub fn check_sla(target: &SlaTarget, value: f64) -> Option<SlaViolation> {
    let severity = if target.higher_is_better {
        if value < target.critical {
            Severity::Critical
        } else if value < target.warning {
            Severity::Warning
        } else {
            return None;
        }
    } else if value > target.critical {
        Severity::Critical
    } else if value > target.warning {
        Severity::Warning
    } else {
        return None;
    };

    Some(SlaViolation {
        id: Uuid::now_v7(),
        detected_at: Utc::now(),
        target: target.clone(),
        value,
        severity,
        business_impact: sla_impact(target, value),
        remediation_actions: remediation_actions(target),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl TrendPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Degrading,
    Stable,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Improving => "improving",
            Self::Degrading => "degrading",
            Self::Stable => "stable",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SeasonalPattern {
    pub peak_hour: u32,
    pub low_hour: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceTrend {
    pub service: String,
    pub metric: String,
    pub direction: TrendDirection,
    /// R² of the fit.
    pub strength: f64,
    /// Change per hourly step.
    pub slope: f64,
    pub prediction_7d: f64,
    pub prediction_30d: f64,
    pub confidence_interval: (f64, f64),
    pub seasonal: Option<SeasonalPattern>,
    /// Mean distance of the last five points from the mean, in sample
    /// standard deviations.
    pub anomaly_score: f64,
    pub points_used: usize,
}

/// Whether a rising value is bad news for this metric.
fn rising_is_worse(metric: &str) -> bool {
    const MARKERS: [&str; 7] = [
        "error",
        "latency",
        "response_time",
        "duration",
        "processing_time",
        "inference_time",
        "utilization",
    ];
    let metric = metric.to_ascii_lowercase();
    MARKERS.iter().any(|marker| metric.contains(marker))
}

fn sorted(series: &[TrendPoint]) -> Vec<TrendPoint> {
    let mut points = series.to_vec();
    points.sort_by_key(|point| point.timestamp);
    points
}

fn seasonal(points: &[(usize, TrendPoint)]) -> Option<SeasonalPattern> {
    let mut hourly: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
    for (_, point) in points {
        let slot = hourly.entry(point.timestamp.hour()).or_default();
        slot.0 += point.value;
        slot.1 += 1;
    }
    if hourly.len() < 2 {
        return None;
    }
    let averages: Vec<(u32, f64)> = hourly
        .into_iter()
        .map(|(hour, (sum, count))| (hour, sum / count as f64))
        .collect();
    let peak = averages.iter().max_by(|a, b| a.1.total_cmp(&b.1))?;
    let low = averages.iter().min_by(|a, b| a.1.total_cmp(&b.1))?;
    Some(SeasonalPattern {
        peak_hour: peak.0,
        low_hour: low.0,
    })
}

/// Linear trend over an hourly series. Needs at least ten points, and five
/// left after IQR outlier removal.
pub fn analyze_trend(
    service: &str,
    metric: &str,
    series: &[TrendPoint],
) -> Option<PerformanceTrend> {
    if series.len() < 10 {
        return None;
    }
    let points = sorted(series);
    let values: Vec<f64> = points.iter().map(|point| point.value).collect();
    let fences = IqrFences::new(&values, 1.5)?;
    let clean: Vec<(usize, TrendPoint)> = points
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, point)| fences.contains(point.value))
        .collect();
    if clean.len() < 5 {
        return None;
    }

    let xy: Vec<(f64, f64)> = clean
        .iter()
        .map(|(index, point)| (*index as f64, point.value))
        .collect();
    let fit = LinearFit::fit(&xy)?;

    let direction = if fit.slope.abs() <= 0.01 {
        TrendDirection::Stable
    } else if (fit.slope > 0.0) != rising_is_worse(metric) {
        TrendDirection::Improving
    } else {
        TrendDirection::Degrading
    };

    let horizon = points.len() as f64;
    let prediction_7d = fit.predict(horizon + 24.0 * 7.0);
    let prediction_30d = fit.predict(horizon + 24.0 * 30.0);
    let spread = 2.0 * fit.residual_std;

    let clean_values: Vec<f64> = clean.iter().map(|(_, point)| point.value).collect();
    let anomaly_score = match (stats::mean(&clean_values), stats::sample_std_dev(&clean_values)) {
        (Some(mean), Some(std)) if std > 0.0 => {
            let recent = &clean_values[clean_values.len().saturating_sub(5)..];
            recent.iter().map(|value| (value - mean).abs() / std).sum::<f64>() / recent.len() as f64
        }
        _ => 0.0,
    };

    debug!(
        target: "hasivu::monitoring",
        %service,
        %metric,
        %direction,
        slope = fit.slope,
        r_squared = fit.r_squared,
        "trend analysed"
    );
    Some(PerformanceTrend {
        service: service.to_string(),
        metric: metric.to_string(),
        direction,
        strength: fit.r_squared,
        slope: fit.slope,
        prediction_7d,
        prediction_30d,
        confidence_interval: (prediction_7d - spread, prediction_7d + spread),
        seasonal: seasonal(&clean),
        anomaly_score,
        points_used: clean.len(),
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    /// Utilisation considered full.
    pub fn threshold(self) -> f64 {
        match self {
            Self::Cpu => 0.8,
            Self::Memory => 0.85,
            Self::Disk => 0.9,
            Self::Network => 0.75,
        }
    }

    fn cost_multiplier(self) -> f64 {
        match self {
            Self::Cpu => 1.0,
            Self::Memory => 0.8,
            Self::Disk => 0.3,
            Self::Network => 0.2,
        }
    }

    fn implementation(self) -> &'static str {
        match self {
            Self::Cpu => "Adjust CPU requests/limits of the deployment",
            Self::Memory => "Adjust memory requests/limits of the deployment",
            Self::Disk => "Increase persistent volume size or add volumes",
            Self::Network => "Review network bandwidth allocation",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
        })
    }
}

/// Monthly base cost of a service, in USD.
fn base_cost(service: &str) -> f64 {
    match service {
        "kitchen-management" => 300.0,
        "vendor-marketplace" => 250.0,
        "predictive-analytics" => 500.0,
        "database" => 800.0,
        _ => 200.0,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    None,
    ScaleUp,
    ScaleDown,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScalingRecommendation {
    pub action: ScalingAction,
    pub scale_factor: f64,
    pub timeline: Option<String>,
    pub justification: Option<String>,
    pub implementation: Option<String>,
}

impl ScalingRecommendation {
    fn none() -> Self {
        Self {
            action: ScalingAction::None,
            scale_factor: 1.0,
            timeline: None,
            justification: None,
            implementation: None,
        }
    }

    pub fn action_required(&self) -> bool {
        self.action != ScalingAction::None
    }

    fn for_resource(resource: ResourceKind, current: f64, predicted: f64) -> Self {
        let threshold = resource.threshold();
        let (action, scale_factor, timeline, justification) = if predicted > threshold {
            (
                ScalingAction::ScaleUp,
                predicted / threshold * 1.2,
                "within_7_days",
                format!(
                    "{resource} utilisation predicted to exceed {:.0}% threshold",
                    threshold * 100.0
                ),
            )
        } else if current < threshold * 0.3 && predicted < threshold * 0.5 {
            (
                ScalingAction::ScaleDown,
                (predicted / threshold).max(0.5),
                "within_30_days",
                format!("{resource} utilisation consistently low, cost optimisation opportunity"),
            )
        } else {
            return Self::none();
        };
        Self {
            action,
            scale_factor,
            timeline: Some(timeline.to_string()),
            justification: Some(justification),
            implementation: Some(resource.implementation().to_string()),
        }
    }

    fn monthly_cost(&self, service: &str, resource: ResourceKind) -> f64 {
        let base = base_cost(service) * resource.cost_multiplier();
        let impact = match self.action {
            ScalingAction::None => 0.0,
            ScalingAction::ScaleUp => base * (self.scale_factor - 1.0),
            ScalingAction::ScaleDown => -base * (1.0 - self.scale_factor),
        };
        (impact * 100.0).round() / 100.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CapacityPrediction {
    pub service: String,
    pub resource: ResourceKind,
    pub current_utilization: f64,
    pub predicted_7d: f64,
    pub predicted_30d: f64,
    pub predicted_90d: f64,
    pub exhaustion_at: Option<DateTime<Utc>>,
    pub scaling: ScalingRecommendation,
    pub cost_impact: f64,
    pub confidence: f64,
}

/// Projects hourly utilisation samples (0..=1). Needs a day of data.
pub fn predict_capacity(
    service: &str,
    resource: ResourceKind,
    series: &[TrendPoint],
    now: DateTime<Utc>,
) -> Option<CapacityPrediction> {
    if series.len() < 24 {
        return None;
    }
    let points = sorted(series);
    let values: Vec<f64> = points.iter().map(|point| point.value).collect();
    let current = stats::mean(&values[values.len() - 5..])?;

    let xy: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .map(|(index, value)| (index as f64, *value))
        .collect();
    let fit = LinearFit::fit(&xy)?;
    let horizon = values.len() as f64;
    let project = |hours: f64| fit.predict(horizon + hours).clamp(0.0, 1.0);
    let predicted_30d = project(24.0 * 30.0);

    let threshold = resource.threshold();
    let exhaustion_at = (fit.slope > 0.0)
        .then(|| (threshold - current) / (fit.slope * 24.0))
        .filter(|days| *days > 0.0 && *days < 365.0)
        .map(|days| now + Duration::seconds((days * 86_400.0) as i64));

    let scaling = ScalingRecommendation::for_resource(resource, current, predicted_30d);
    let cost_impact = scaling.monthly_cost(service, resource);
    if scaling.action_required() {
        info!(
            target: "hasivu::monitoring",
            %service,
            %resource,
            action = ?scaling.action,
            scale_factor = scaling.scale_factor,
            "scaling recommended"
        );
    }

    Some(CapacityPrediction {
        service: service.to_string(),
        resource,
        current_utilization: current,
        predicted_7d: project(24.0 * 7.0),
        predicted_30d,
        predicted_90d: project(24.0 * 90.0),
        exhaustion_at,
        scaling,
        cost_impact,
        confidence: fit.r_squared.min(0.95),
    })
}

/// 0..=100 platform score from SLA violations and trends.
pub fn health_score(violations: &[SlaViolation], trends: &[PerformanceTrend]) -> f64 {
    let mut score = 100.0;
    for violation in violations {
        score -= match violation.severity {
            Severity::Critical => 15.0,
            Severity::Warning => 5.0,
            Severity::Info => 0.0,
        };
    }
    for trend in trends {
        if trend.direction == TrendDirection::Degrading {
            score -= 3.0;
        }
        if trend.anomaly_score > 2.0 {
            score -= 2.0;
        }
    }
    f64::max(score, 0.0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub service: String,
    pub metric: String,
    pub points: Vec<TrendPoint>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSeries {
    pub service: String,
    pub resource: ResourceKind,
    pub points: Vec<TrendPoint>,
}

/// Inputs for a performance report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportRequest {
    pub school_id: Option<SchoolId>,
    /// Latest value per SLA metric name.
    pub observations: BTreeMap<String, f64>,
    pub series: Vec<MetricSeries>,
    pub resources: Vec<ResourceSeries>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_sla_violations: usize,
    pub critical_violations: usize,
    pub degrading_trends: usize,
    pub scaling_needed: usize,
    pub estimated_cost_impact: f64,
    pub health_score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub school_id: Option<SchoolId>,
    pub sla_violations: Vec<SlaViolation>,
    pub trends: Vec<PerformanceTrend>,
    pub capacity: Vec<CapacityPrediction>,
    pub summary: ReportSummary,
}

/// SLA catalogue plus the report builder.
#[derive(Clone, Debug)]
pub struct PerformanceAnalytics {
    targets: Vec<SlaTarget>,
}

impl Default for PerformanceAnalytics {
    fn default() -> Self {
        Self::new(SlaTarget::platform_defaults())
    }
}

impl PerformanceAnalytics {
    pub fn new(targets: Vec<SlaTarget>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[SlaTarget] {
        &self.targets
    }

    pub fn check_all(&self, observations: &BTreeMap<String, f64>) -> Vec<SlaViolation> {
        self.targets
            .iter()
            .filter_map(|target| {
                let value = observations.get(&target.metric)?;
                check_sla(target, *value)
            })
            .collect()
    }

    pub fn report(&self, request: &ReportRequest, now: DateTime<Utc>) -> PerformanceReport {
        let sla_violations = self.check_all(&request.observations);
        let trends: Vec<PerformanceTrend> = request
            .series
            .iter()
            .filter_map(|series| analyze_trend(&series.service, &series.metric, &series.points))
            .collect();
        let capacity: Vec<CapacityPrediction> = request
            .resources
            .iter()
            .filter_map(|series| {
                predict_capacity(&series.service, series.resource, &series.points, now)
            })
            .collect();

        let summary = ReportSummary {
            total_sla_violations: sla_violations.len(),
            critical_violations: sla_violations
                .iter()
                .filter(|violation| violation.severity == Severity::Critical)
                .count(),
            degrading_trends: trends
                .iter()
                .filter(|trend| trend.direction == TrendDirection::Degrading)
                .count(),
            scaling_needed: capacity
                .iter()
                .filter(|prediction| prediction.scaling.action_required())
                .count(),
            estimated_cost_impact: capacity.iter().map(|prediction| prediction.cost_impact).sum(),
            health_score: health_score(&sla_violations, &trends),
        };
        info!(
            target: "hasivu::monitoring",
            violations = summary.total_sla_violations,
            degrading = summary.degrading_trends,
            health_score = summary.health_score,
            "performance report generated"
        );

        PerformanceReport {
            generated_at: now,
            school_id: request.school_id,
            sla_violations,
            trends,
            capacity,
            summary,
        }
    }
}
