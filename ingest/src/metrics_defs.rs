use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with status, handler.",
};

pub const EVENTS_PROCESSED: MetricDef = MetricDef {
    name: "events.processed",
    metric_type: MetricType::Counter,
    description: "Events admitted and handed to the delivery queue",
};

pub const EVENTS_IGNORED: MetricDef = MetricDef {
    name: "events.ignored",
    metric_type: MetricType::Counter,
    description: "Events suppressed as duplicates within their window",
};

pub const EVENTS_REJECTED: MetricDef = MetricDef {
    name: "events.rejected",
    metric_type: MetricType::Counter,
    description: "Store requests rejected before admission. Tagged with reason.",
};

pub const GROUPING_FAILURES: MetricDef = MetricDef {
    name: "grouping.failures",
    metric_type: MetricType::Counter,
    description: "Events that could not be grouped and were admitted without counting",
};

pub const CACHE_UNAVAILABLE: MetricDef = MetricDef {
    name: "cache.unavailable",
    metric_type: MetricType::Counter,
    description: "Cache operations that failed. Events are admitted when this happens.",
};

pub const DELIVERY_ENQUEUED: MetricDef = MetricDef {
    name: "delivery.enqueued",
    metric_type: MetricType::Counter,
    description: "Events accepted by the delivery queue",
};

pub const DELIVERY_DROPPED: MetricDef = MetricDef {
    name: "delivery.dropped",
    metric_type: MetricType::Counter,
    description: "Events dropped because the delivery queue was full or closed",
};

pub const DELIVERY_DELIVERED: MetricDef = MetricDef {
    name: "delivery.delivered",
    metric_type: MetricType::Counter,
    description: "Events accepted by the upstream",
};

pub const DELIVERY_FAILED: MetricDef = MetricDef {
    name: "delivery.failed",
    metric_type: MetricType::Counter,
    description: "Events that could not be delivered after all retries",
};

pub const DELIVERY_DURATION: MetricDef = MetricDef {
    name: "delivery.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent relaying one event upstream, retries included, in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    EVENTS_PROCESSED,
    EVENTS_IGNORED,
    EVENTS_REJECTED,
    GROUPING_FAILURES,
    CACHE_UNAVAILABLE,
    DELIVERY_ENQUEUED,
    DELIVERY_DROPPED,
    DELIVERY_DELIVERED,
    DELIVERY_FAILED,
    DELIVERY_DURATION,
];
