//! Classification of the Teleinfo fields into metric samples and labels
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::{
    registry::{FieldKind, FieldRegistry},
    teleinfo::{TeleinfoError, TeleinfoFrame},
};

/// Label that identify the exporter service
pub const SERVICE_LABEL: &str = "job";

/// Kind of an exported metric
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// Numerical value of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Metric name `<prefix>_<tag>`
    pub name: String,
    pub description: &'static str,
    pub kind: MetricKind,
    pub value: u64,
}

/// Labels attached to every sample of a collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Label set with only the service identity
    pub fn new(service_name: &str) -> LabelSet {
        let mut labels = BTreeMap::new();
        labels.insert(SERVICE_LABEL.to_string(), service_name.to_string());
        LabelSet(labels)
    }

    pub fn insert(&mut self, name: String, value: String) -> Option<String> {
        self.0.insert(name, value)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Owned copy of the labels, as wanted by the metric options
    pub fn to_map(&self) -> HashMap<String, String> {
        self.0.clone().into_iter().collect()
    }
}

/// Result of one collection cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    pub labels: LabelSet,
    pub samples: Vec<Sample>,
}

impl Collection {
    /// Metrics as `(name, help, kind, value, labels)`
    pub fn metrics(&self) -> impl Iterator<Item = (&str, &str, MetricKind, u64, &LabelSet)> {
        self.samples.iter().map(|sample| {
            (
                sample.name.as_str(),
                sample.description,
                sample.kind,
                sample.value,
                &self.labels,
            )
        })
    }
}

/// Split a frame into numerical samples and descriptive labels
#[derive(Debug, Clone)]
pub struct MetricClassifier<'a> {
    registry: &'a FieldRegistry,
    prefix: String,
    service_name: String,
}

impl<'a> MetricClassifier<'a> {
    pub fn new(registry: &'a FieldRegistry, prefix: &str, service_name: &str) -> Self {
        MetricClassifier {
            registry,
            prefix: prefix.to_string(),
            service_name: service_name.to_string(),
        }
    }

    /// Classify every field of the frame
    ///
    /// Counter and gauge values must be plain unsigned integers, gauges must also fit in an `i64`.
    pub fn classify(&self, frame: &TeleinfoFrame) -> Result<Collection, TeleinfoError> {
        let mut collection = Collection {
            labels: LabelSet::new(&self.service_name),
            samples: Vec::with_capacity(frame.len()),
        };

        for (tag, value) in frame.iter() {
            let field = self.registry.get(tag);
            let kind = match field.kind {
                FieldKind::Counter => MetricKind::Counter,
                FieldKind::Gauge => MetricKind::Gauge,
                _ => {
                    collection
                        .labels
                        .insert(field.label.to_lowercase(), value.to_string());
                    continue;
                }
            };

            let value = value
                .parse::<u64>()
                .ok()
                .filter(|v| kind == MetricKind::Counter || i64::try_from(*v).is_ok())
                .ok_or_else(|| {
                    TeleinfoError::MetricValue(field.label.to_string(), value.to_string())
                })?;
            debug!("{} {} = {}", field.kind, field.label, value);
            collection.samples.push(Sample {
                name: format!("{}_{}", self.prefix, field.label.to_lowercase()),
                description: field.description,
                kind,
                value,
            });
        }

        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        registry::{FieldRegistry, Tag},
        teleinfo::{TeleinfoError, TeleinfoFrame},
    };

    use super::{MetricClassifier, MetricKind, Sample};

    #[test]
    fn classify_frame() {
        let registry = FieldRegistry::linky();
        let classifier = MetricClassifier::new(&registry, "linky", "linky-exporter");
        let frame: TeleinfoFrame = [
            (Tag::ADCO, "041876097467".to_string()),
            (Tag::OPTARIF, "BASE".to_string()),
            (Tag::BASE, "002809718".to_string()),
            (Tag::PAPP, "00420".to_string()),
            (Tag::MOTDETAT, "000000".to_string()),
        ]
        .into_iter()
        .collect();

        let collection = classifier.classify(&frame).unwrap();
        assert_eq!(
            vec![
                Sample {
                    name: "linky_base".to_string(),
                    description: "Index Option Base en Wh",
                    kind: MetricKind::Counter,
                    value: 2809718,
                },
                Sample {
                    name: "linky_papp".to_string(),
                    description: "Puissance Apparente en VA",
                    kind: MetricKind::Gauge,
                    value: 420,
                },
            ],
            collection.samples
        );

        assert_eq!(
            vec![
                ("adco", "041876097467"),
                ("job", "linky-exporter"),
                ("motdetat", "000000"),
                ("optarif", "BASE"),
            ],
            collection.labels.iter().collect::<Vec<_>>()
        );
        assert!(!collection.samples.iter().any(|s| s.name == "linky_optarif"));

        let metrics: Vec<_> = collection.metrics().collect();
        assert_eq!(2, metrics.len());
        assert_eq!("linky_base", metrics[0].0);
        assert_eq!(2809718, metrics[0].3);
        assert_eq!(Some("BASE"), metrics[0].4.get("optarif"));
    }

    #[test]
    fn classify_only_service_label() {
        let registry = FieldRegistry::linky();
        let classifier = MetricClassifier::new(&registry, "home", "garage");
        let frame: TeleinfoFrame = [(Tag::IINST, "002".to_string())].into_iter().collect();

        let collection = classifier.classify(&frame).unwrap();
        assert_eq!(1, collection.labels.len());
        assert_eq!(Some("garage"), collection.labels.get("job"));
        assert_eq!("home_iinst", collection.samples[0].name);
        assert_eq!(2, collection.samples[0].value);
    }

    #[test]
    fn classify_wrong_value() {
        let registry = FieldRegistry::linky();
        let classifier = MetricClassifier::new(&registry, "linky", "linky-exporter");

        for wrong in ["00A420", "-1", "", "4.2"] {
            let frame: TeleinfoFrame = [
                (Tag::OPTARIF, "BASE".to_string()),
                (Tag::PAPP, wrong.to_string()),
            ]
            .into_iter()
            .collect();

            match classifier.classify(&frame) {
                Err(TeleinfoError::MetricValue(tag, value)) => {
                    assert_eq!("PAPP", tag);
                    assert_eq!(wrong, value);
                }
                other => panic!("Unexpected classification {other:?}"),
            }
        }
    }

    #[test]
    fn classify_gauge_out_of_range() {
        let registry = FieldRegistry::linky();
        let classifier = MetricClassifier::new(&registry, "linky", "linky-exporter");

        let frame: TeleinfoFrame = [(Tag::PAPP, "10000000000000000000".to_string())]
            .into_iter()
            .collect();
        assert!(matches!(
            classifier.classify(&frame),
            Err(TeleinfoError::MetricValue(tag, value)) if tag == "PAPP" && value == "10000000000000000000"
        ));

        let frame: TeleinfoFrame = [(Tag::PAPP, "9223372036854775807".to_string())]
            .into_iter()
            .collect();
        assert_eq!(
            i64::MAX as u64,
            classifier.classify(&frame).unwrap().samples[0].value
        );

        // Counters use the whole unsigned range
        let frame: TeleinfoFrame = [(Tag::BASE, "10000000000000000000".to_string())]
            .into_iter()
            .collect();
        assert_eq!(
            10000000000000000000,
            classifier.classify(&frame).unwrap().samples[0].value
        );
    }
}
