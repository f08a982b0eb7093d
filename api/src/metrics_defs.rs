use shared::metrics_defs::{MetricDef, MetricType};

pub const UPLOAD_DURATION: MetricDef = MetricDef {
    name: "api.upload.duration",
    metric_type: MetricType::Histogram,
    description: "End-to-end duration of one upload request in seconds",
};

pub const UPLOAD_FILES: MetricDef = MetricDef {
    name: "api.upload.files",
    metric_type: MetricType::Counter,
    description: "Artifact files accepted for publishing. Tagged with repository.",
};

pub const ALL_METRICS: &[MetricDef] = &[UPLOAD_DURATION, UPLOAD_FILES];
