//! In-process monitoring: ensemble anomaly detection over metric samples and
//! SLA, trend and capacity analytics.

pub mod analytics;
pub mod anomaly;
pub mod stats;

pub use analytics::{
    CapacityPrediction, MetricSeries, PerformanceAnalytics, PerformanceReport, PerformanceTrend,
    ReportRequest, ReportSummary, ResourceKind, ResourceSeries, ScalingAction,
    ScalingRecommendation, SeasonalPattern, SlaTarget, SlaViolation, TrendDirection, TrendPoint,
    analyze_trend, check_sla, health_score, predict_capacity,
};
pub use anomaly::{
    AnomalyAlert, AnomalyDetector, DetectionMethod, DetectionStats, MetricBaseline, MetricSample,
    Severity, recommended_actions, service_criticality,
};
