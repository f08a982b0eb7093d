use shared::metrics_defs::{MetricDef, MetricType};

pub const PATH_LOOKUP_DURATION: MetricDef = MetricDef {
    name: "proxy.path_lookup.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of one path-probe race in seconds. Tagged with outcome.",
};

pub const REQUESTS_REJECTED: MetricDef = MetricDef {
    name: "proxy.requests.rejected",
    metric_type: MetricType::Counter,
    description: "Requests rejected before reaching an origin. Tagged with reason.",
};

pub const UPSTREAM_RESPONSES: MetricDef = MetricDef {
    name: "proxy.upstream.responses",
    metric_type: MetricType::Counter,
    description: "Responses received from origins. Tagged with status class.",
};

pub const ALL_METRICS: &[MetricDef] = &[PATH_LOOKUP_DURATION, REQUESTS_REJECTED, UPSTREAM_RESPONSES];
