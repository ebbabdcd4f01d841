use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Per-type counters for collection mutations.
#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    index_size: Family<IndexLabels, Gauge>,
    index_applies: Family<IndexLabels, Counter>,
    index_deletes: Family<IndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    type_url: String,
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes from the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub(crate) fn applied(&self, type_url: &str, size: usize) {
        let labels = labels(type_url);
        self.index_applies.get_or_create(&labels).inc();
        self.index_size.get_or_create(&labels).set(size as i64);
    }

    pub(crate) fn deleted(&self, type_url: &str, size: usize) {
        let labels = labels(type_url);
        self.index_deletes.get_or_create(&labels).inc();
        self.index_size.get_or_create(&labels).set(size as i64);
    }

    pub(crate) fn reset(&self, type_url: &str, size: usize) {
        let labels = labels(type_url);
        self.index_resets.get_or_create(&labels).inc();
        self.index_size.get_or_create(&labels).set(size as i64);
    }
}

fn labels(type_url: &str) -> IndexLabels {
    IndexLabels {
        type_url: type_url.to_string(),
    }
}
