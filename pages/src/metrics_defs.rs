use shared::metrics_defs::{MetricDef, MetricType};

pub const INDEX_CACHE_HIT: MetricDef = MetricDef {
    name: "index_cache.hit",
    metric_type: MetricType::Counter,
    description: "Page index served from the in-process cache",
};

pub const INDEX_CACHE_MISS: MetricDef = MetricDef {
    name: "index_cache.miss",
    metric_type: MetricType::Counter,
    description: "Page index fetched from object storage after a cache miss",
};

pub const STORAGE_UPLOAD_BYTES: MetricDef = MetricDef {
    name: "storage.upload.bytes",
    metric_type: MetricType::Counter,
    description: "Bytes uploaded to object storage. Tagged with repository.",
};

pub const ALL_METRICS: &[MetricDef] = &[INDEX_CACHE_HIT, INDEX_CACHE_MISS, STORAGE_UPLOAD_BYTES];
